//! Administrative operations: dataset registration, budget management,
//! the guardrail policy and alert configuration.

use std::collections::HashSet;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::domain::{Alert, Budget, BudgetOverview, BudgetStatus, DatasetDescriptor, Policy};
use crate::ports::Storage;
use crate::{EngineError, Result};

use super::alerts::new_alert;
use super::guardrail::PolicyGuardrail;
use super::ledger::BudgetLedger;

/// Budget ID assigned to a dataset at registration.
#[must_use]
pub fn budget_id_for(dataset_id: &str) -> String {
    format!("{dataset_id}-budget")
}

pub struct AdminService<S: Storage> {
    storage: Arc<S>,
    ledger: Arc<BudgetLedger<S>>,
    guardrail: PolicyGuardrail<S>,
    default_epsilon: f64,
    default_delta: f64,
}

impl<S: Storage> AdminService<S> {
    pub fn new(config: &EngineConfig, storage: Arc<S>, ledger: Arc<BudgetLedger<S>>) -> Self {
        Self {
            guardrail: PolicyGuardrail::new(
                Arc::clone(&storage),
                config.default_max_epsilon_per_job,
            ),
            default_epsilon: config.default_epsilon_allocation,
            default_delta: config.default_delta_allocation,
            storage,
            ledger,
        }
    }

    /// Register a dataset and create its budget with the default allocation.
    ///
    /// # Errors
    /// - `Validation` for malformed descriptors
    /// - `Conflict` if the dataset is already registered
    pub fn register_dataset(&self, dataset: &DatasetDescriptor) -> Result<BudgetStatus> {
        self.register_dataset_with_budget(dataset, self.default_epsilon, self.default_delta)
    }

    /// Register a dataset with an explicit initial allocation.
    ///
    /// # Errors
    /// See [`AdminService::register_dataset`].
    pub fn register_dataset_with_budget(
        &self,
        dataset: &DatasetDescriptor,
        epsilon: f64,
        delta: f64,
    ) -> Result<BudgetStatus> {
        validate_dataset(dataset)?;
        validate_allocation(epsilon, delta)?;

        let budget = Budget::new(budget_id_for(&dataset.id), &dataset.id, epsilon, delta);
        self.storage
            .insert_dataset(dataset, &budget)
            .map_err(|e| EngineError::Storage(e.into()))?;
        Ok(budget.status())
    }

    /// Create a fresh budget for a registered dataset that has none,
    /// typically after [`AdminService::delete_budget`].
    ///
    /// # Errors
    /// - `Validation` for negative or non-finite allocations
    /// - `NotFound` for unknown datasets
    /// - `Conflict` if the dataset already owns a budget
    pub fn create_budget(
        &self,
        dataset_id: &str,
        epsilon: f64,
        delta: f64,
    ) -> Result<BudgetStatus> {
        validate_allocation(epsilon, delta)?;
        let budget = Budget::new(budget_id_for(dataset_id), dataset_id, epsilon, delta);
        self.storage
            .insert_budget(&budget)
            .map_err(|e| EngineError::Storage(e.into()))?;
        Ok(budget.status())
    }

    /// # Errors
    /// Returns error if storage fails.
    pub fn list_budgets(&self) -> Result<Vec<BudgetStatus>> {
        let budgets = self
            .storage
            .list_budgets()
            .map_err(|e| EngineError::Storage(e.into()))?;
        Ok(budgets.iter().map(Budget::status).collect())
    }

    /// # Errors
    /// Returns `NotFound` for unknown budgets.
    pub fn get_budget_status(&self, budget_id: &str) -> Result<BudgetStatus> {
        self.ledger.status(budget_id)
    }

    /// Budget of a registered dataset.
    ///
    /// # Errors
    /// Returns `NotFound` if the dataset has no budget.
    pub fn dataset_budget(&self, dataset_id: &str) -> Result<BudgetStatus> {
        self.storage
            .budget_for_dataset(dataset_id)
            .map_err(|e| EngineError::Storage(e.into()))?
            .map(|b| b.status())
            .ok_or_else(|| EngineError::NotFound(format!("budget for dataset {dataset_id}")))
    }

    /// Aggregate allocated and consumed totals across all budgets.
    ///
    /// # Errors
    /// Returns error if storage fails.
    pub fn budget_overview(&self) -> Result<BudgetOverview> {
        let budgets = self
            .storage
            .list_budgets()
            .map_err(|e| EngineError::Storage(e.into()))?;
        Ok(BudgetOverview::from_budgets(&budgets))
    }

    /// # Errors
    /// Returns `NotFound` for unknown budgets.
    pub fn reset_budget(&self, budget_id: &str) -> Result<BudgetStatus> {
        self.ledger.reset(budget_id)
    }

    /// # Errors
    /// Returns `Validation` for invalid increments, `NotFound` for unknown budgets.
    pub fn allocate_budget(
        &self,
        budget_id: &str,
        epsilon: f64,
        delta: f64,
    ) -> Result<BudgetStatus> {
        self.ledger.allocate(budget_id, epsilon, delta)
    }

    /// # Errors
    /// Returns `Conflict` if any job references the budget.
    pub fn delete_budget(&self, budget_id: &str) -> Result<()> {
        self.storage
            .delete_budget(budget_id)
            .map_err(|e| EngineError::Storage(e.into()))?;
        self.ledger.forget(budget_id);
        tracing::info!(budget_id, "Budget deleted");
        Ok(())
    }

    /// Delete a dataset together with its budget and alerts.
    ///
    /// # Errors
    /// Returns `Conflict` if any job references the dataset.
    pub fn delete_dataset(&self, dataset_id: &str) -> Result<()> {
        self.storage
            .delete_dataset(dataset_id)
            .map_err(|e| EngineError::Storage(e.into()))?;
        self.ledger.forget(&budget_id_for(dataset_id));
        Ok(())
    }

    /// # Errors
    /// Returns error if storage fails.
    pub fn get_policy(&self) -> Result<Policy> {
        self.guardrail.policy()
    }

    /// # Errors
    /// Returns `Validation` for non-positive ceilings.
    pub fn update_policy(&self, max_epsilon_per_job: f64) -> Result<Policy> {
        self.guardrail.update(max_epsilon_per_job)
    }

    /// Add a threshold alert to a budget.
    ///
    /// # Errors
    /// Returns `Validation` for bad parameters, `NotFound` for unknown budgets.
    pub fn create_alert(&self, budget_id: &str, threshold: f64, recipient: &str) -> Result<Alert> {
        let alert = new_alert(budget_id, threshold, recipient)?;
        self.storage
            .insert_alert(&alert)
            .map_err(|e| EngineError::Storage(e.into()))?;
        tracing::info!(alert_id = %alert.id, budget_id, threshold, "Alert created");
        Ok(alert)
    }

    /// # Errors
    /// Returns error if storage fails.
    pub fn list_alerts(&self, budget_id: &str) -> Result<Vec<Alert>> {
        self.storage
            .list_alerts(budget_id)
            .map_err(|e| EngineError::Storage(e.into()))
    }

    /// # Errors
    /// Returns `NotFound` for unknown alerts.
    pub fn delete_alert(&self, alert_id: &str) -> Result<()> {
        self.storage
            .delete_alert(alert_id)
            .map_err(|e| EngineError::Storage(e.into()))
    }
}

fn validate_dataset(dataset: &DatasetDescriptor) -> Result<()> {
    if dataset.id.trim().is_empty() {
        return Err(EngineError::Validation("dataset id must not be empty".into()));
    }
    if dataset.columns.is_empty() {
        return Err(EngineError::Validation(format!("dataset {} has no columns", dataset.id)));
    }
    let mut seen = HashSet::new();
    for column in &dataset.columns {
        if column.name.trim().is_empty() {
            return Err(EngineError::Validation(format!(
                "dataset {} has a column without a name",
                dataset.id
            )));
        }
        if !seen.insert(column.name.as_str()) {
            return Err(EngineError::Validation(format!(
                "dataset {} declares column '{}' twice",
                dataset.id, column.name
            )));
        }
    }
    Ok(())
}

fn validate_allocation(epsilon: f64, delta: f64) -> Result<()> {
    for (name, value) in [("epsilon", epsilon), ("delta", delta)] {
        if !value.is_finite() || value < 0.0 {
            return Err(EngineError::Validation(format!(
                "{name} allocation must be a non-negative number, got {value}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::SqliteStorage;
    use crate::domain::{ColumnMeta, SourceDescriptor};
    use crate::ErrorKind;

    fn admin() -> AdminService<SqliteStorage> {
        let storage = Arc::new(SqliteStorage::in_memory().expect("Should create db"));
        let ledger = Arc::new(BudgetLedger::new(Arc::clone(&storage)));
        AdminService::new(&EngineConfig::default(), storage, ledger)
    }

    fn dataset(id: &str) -> DatasetDescriptor {
        DatasetDescriptor {
            id: id.into(),
            name: id.into(),
            source: SourceDescriptor::Inline { key: id.into() },
            columns: vec![ColumnMeta::numeric("age", 0.0, 100.0)],
        }
    }

    #[test]
    fn test_register_uses_default_allocation() {
        let admin = admin();
        let status = admin.register_dataset(&dataset("d1")).expect("Should register");
        assert_eq!(status.budget_id, "d1-budget");
        assert!((status.allocated_epsilon - 10.0).abs() < 1e-12);
        assert!((status.allocated_delta - 5e-5).abs() < 1e-15);

        let err = admin.register_dataset(&dataset("d1")).expect_err("Duplicate");
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(admin.dataset_budget("d1").expect("Should load").budget_id, "d1-budget");
    }

    #[test]
    fn test_register_rejects_duplicate_columns() {
        let admin = admin();
        let mut d = dataset("d1");
        d.columns.push(ColumnMeta::numeric("age", 0.0, 1.0));
        let err = admin.register_dataset(&d).expect_err("Should reject");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_overview_aggregates() {
        let admin = admin();
        admin.register_dataset_with_budget(&dataset("d1"), 1.0, 0.0).expect("Should register");
        admin.register_dataset_with_budget(&dataset("d2"), 2.5, 0.0).expect("Should register");

        let overview = admin.budget_overview().expect("Should aggregate");
        assert_eq!(overview.budgets.len(), 2);
        assert!((overview.allocated_epsilon - 3.5).abs() < 1e-12);
        assert_eq!(overview.consumed_epsilon, 0.0);
    }

    #[test]
    fn test_policy_roundtrip() {
        let admin = admin();
        assert!((admin.get_policy().expect("Should read").max_epsilon_per_job - 2.0).abs() < 1e-12);
        admin.update_policy(0.5).expect("Should update");
        assert!((admin.get_policy().expect("Should read").max_epsilon_per_job - 0.5).abs() < 1e-12);
        let err = admin.update_policy(0.0).expect_err("Should reject");
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_alert_management() {
        let admin = admin();
        admin.register_dataset(&dataset("d1")).expect("Should register");

        let alert = admin
            .create_alert("d1-budget", 80.0, "ops@example.com")
            .expect("Should create");
        assert_eq!(admin.list_alerts("d1-budget").expect("Should list").len(), 1);
        assert_eq!(
            admin.create_alert("missing", 80.0, "a@b.c").expect_err("Unknown budget").kind(),
            ErrorKind::NotFound
        );

        admin.delete_alert(&alert.id).expect("Should delete");
        assert!(admin.list_alerts("d1-budget").expect("Should list").is_empty());
        assert_eq!(admin.delete_alert(&alert.id).expect_err("Gone").kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_delete_dataset_cascades() {
        let admin = admin();
        admin.register_dataset(&dataset("d1")).expect("Should register");
        admin.create_alert("d1-budget", 50.0, "ops").expect("Should create");

        admin.delete_dataset("d1").expect("Should delete");
        let err = admin.get_budget_status("d1-budget").expect_err("Gone");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(admin.list_alerts("d1-budget").expect("Should list").is_empty());
    }

    #[test]
    fn test_create_budget_after_delete() {
        let admin = admin();
        admin.register_dataset_with_budget(&dataset("d1"), 1.0, 0.0).expect("Should register");

        let err = admin.create_budget("d1", 2.0, 0.0).expect_err("Already owns one");
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let err = admin.create_budget("missing", 2.0, 0.0).expect_err("Unknown dataset");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = admin.create_budget("d1", f64::NAN, 0.0).expect_err("Bad allocation");
        assert_eq!(err.kind(), ErrorKind::Validation);

        admin.delete_budget("d1-budget").expect("Should delete");
        assert_eq!(admin.dataset_budget("d1").expect_err("Gone").kind(), ErrorKind::NotFound);

        let status = admin.create_budget("d1", 2.0, 1e-6).expect("Should create");
        assert_eq!(status.budget_id, "d1-budget");
        assert!((status.allocated_epsilon - 2.0).abs() < 1e-12);
        assert_eq!(status.consumed_epsilon, 0.0);
        assert_eq!(admin.get_budget_status("d1-budget").expect("Should read"), status);
    }

    #[test]
    fn test_list_budgets() {
        let admin = admin();
        assert!(admin.list_budgets().expect("Should list").is_empty());
        admin.register_dataset(&dataset("d1")).expect("Should register");
        admin.register_dataset(&dataset("d2")).expect("Should register");

        let mut ids: Vec<_> = admin
            .list_budgets()
            .expect("Should list")
            .into_iter()
            .map(|s| s.budget_id)
            .collect();
        ids.sort();
        assert_eq!(ids, ["d1-budget", "d2-budget"]);
    }
}
