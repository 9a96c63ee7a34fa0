//! Budget ledger: reserve, commit and release of (ε, δ) against budgets.
//!
//! # Concurrency
//!
//! Check-and-increment for one budget is serialized by a per-budget mutex
//! held in a lock registry; different budgets never share a lock. Storage
//! additionally applies the debit as a guarded conditional update, so the
//! `consumed <= allocated` invariant also holds across processes sharing a
//! database file.

use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;

use crate::domain::{new_id, to_units, BudgetStatus, Job, JobResult, Reservation};
use crate::ports::Storage;
use crate::{EngineError, Result};

pub struct BudgetLedger<S: Storage> {
    storage: Arc<S>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl<S: Storage> BudgetLedger<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self {
            storage,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, budget_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(budget_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Atomically debit `epsilon` and `delta` from the budget.
    ///
    /// # Errors
    /// Returns `EngineError::InsufficientBudget` if either total would exceed
    /// its allocation (nothing is debited), or `NotFound` for unknown budgets.
    pub fn reserve(&self, budget_id: &str, epsilon: f64, delta: f64) -> Result<Reservation> {
        let reservation = Reservation {
            id: new_id(),
            budget_id: budget_id.to_string(),
            epsilon_units: to_units(epsilon),
            delta_units: to_units(delta),
        };

        let lock = self.lock_for(budget_id);
        // The guarded value is `()`, so a poisoned lock carries no broken state.
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let reserved = self
            .storage
            .try_reserve(&reservation)
            .map_err(|e| EngineError::Storage(e.into()))?;
        if !reserved {
            tracing::warn!(budget_id, epsilon, delta, "Insufficient privacy budget");
            return Err(EngineError::InsufficientBudget {
                budget_id: budget_id.to_string(),
                epsilon,
                delta,
            });
        }

        tracing::debug!(
            budget_id,
            reservation_id = %reservation.id,
            epsilon,
            delta,
            "Reserved budget"
        );
        Ok(reservation)
    }

    /// Finalize a job: persist it as completed with its results and make the
    /// reservation permanent, in one storage transaction.
    ///
    /// # Errors
    /// Returns error if storage fails; the reservation is then still pending.
    pub fn commit(
        &self,
        job: &Job,
        results: &[JobResult],
        reservation: Option<&Reservation>,
    ) -> Result<()> {
        self.storage
            .complete_job(job, results, reservation)
            .map_err(|e| EngineError::Storage(e.into()))
    }

    /// Undo a pending reservation. Releasing a committed or already
    /// released reservation is a no-op that returns `false`.
    ///
    /// # Errors
    /// Returns error if storage fails.
    pub fn release(&self, reservation: &Reservation) -> Result<bool> {
        let lock = self.lock_for(&reservation.budget_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let released = self
            .storage
            .release_reservation(&reservation.id)
            .map_err(|e| EngineError::Storage(e.into()))?;
        if released {
            tracing::info!(
                budget_id = %reservation.budget_id,
                reservation_id = %reservation.id,
                epsilon = reservation.epsilon(),
                "Released budget reservation"
            );
        }
        Ok(released)
    }

    /// Zero consumed totals and clear alert latches.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown budgets.
    pub fn reset(&self, budget_id: &str) -> Result<BudgetStatus> {
        let lock = self.lock_for(budget_id);
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        self.storage
            .reset_budget(budget_id)
            .map_err(|e| EngineError::Storage(e.into()))?;
        drop(guard);
        self.status(budget_id)
    }

    /// Increase a budget's allocation.
    ///
    /// # Errors
    /// Returns `Validation` for negative or non-finite increments, `NotFound`
    /// for unknown budgets.
    pub fn allocate(&self, budget_id: &str, epsilon: f64, delta: f64) -> Result<BudgetStatus> {
        for (name, value) in [("epsilon", epsilon), ("delta", delta)] {
            if !value.is_finite() || value < 0.0 {
                return Err(EngineError::Validation(format!(
                    "{name} increment must be a non-negative number, got {value}"
                )));
            }
        }
        if epsilon == 0.0 && delta == 0.0 {
            return Err(EngineError::Validation("allocation increment is zero".into()));
        }

        let lock = self.lock_for(budget_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let budget = self
            .storage
            .allocate_budget(budget_id, to_units(epsilon), to_units(delta))
            .map_err(|e| EngineError::Storage(e.into()))?;
        tracing::info!(budget_id, epsilon, delta, "Budget allocation increased");
        Ok(budget.status())
    }

    /// Current totals of a budget.
    ///
    /// # Errors
    /// Returns `NotFound` for unknown budgets.
    pub fn status(&self, budget_id: &str) -> Result<BudgetStatus> {
        self.storage
            .load_budget(budget_id)
            .map_err(|e| EngineError::Storage(e.into()))?
            .map(|b| b.status())
            .ok_or_else(|| EngineError::NotFound(format!("budget {budget_id}")))
    }

    /// Drop the lock entry of a deleted budget.
    pub fn forget(&self, budget_id: &str) {
        self.locks.remove(budget_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::SqliteStorage;
    use crate::domain::{Budget, ColumnMeta, DatasetDescriptor, SourceDescriptor};
    use crate::ErrorKind;

    fn ledger(epsilon: f64, delta: f64) -> BudgetLedger<SqliteStorage> {
        let storage = Arc::new(SqliteStorage::in_memory().expect("Should create db"));
        let dataset = DatasetDescriptor {
            id: "d1".into(),
            name: "d1".into(),
            source: SourceDescriptor::Inline { key: "d1".into() },
            columns: vec![ColumnMeta::numeric("x", 0.0, 1.0)],
        };
        storage
            .insert_dataset(&dataset, &Budget::new("b1", "d1", epsilon, delta))
            .expect("Should register");
        BudgetLedger::new(storage)
    }

    #[test]
    fn test_reserve_until_exhausted() {
        let ledger = ledger(1.0, 0.0);
        ledger.reserve("b1", 0.6, 0.0).expect("Should reserve");
        let err = ledger.reserve("b1", 0.6, 0.0).expect_err("Should refuse");
        assert_eq!(err.kind(), ErrorKind::InsufficientBudget);
        ledger.reserve("b1", 0.4, 0.0).expect("Exact remainder fits");

        let status = ledger.status("b1").expect("Should read");
        assert!((status.consumed_epsilon - 1.0).abs() < 1e-12);
        assert!(status.remaining_epsilon().abs() < 1e-12);
    }

    #[test]
    fn test_delta_is_checked_independently() {
        let ledger = ledger(10.0, 1e-5);
        let err = ledger.reserve("b1", 0.1, 2e-5).expect_err("Should refuse");
        assert_eq!(err.kind(), ErrorKind::InsufficientBudget);
        assert_eq!(ledger.status("b1").expect("Should read").consumed_epsilon, 0.0);
    }

    #[test]
    fn test_release_restores_exactly_once() {
        let ledger = ledger(1.0, 0.0);
        let r = ledger.reserve("b1", 0.3, 0.0).expect("Should reserve");
        assert!(ledger.release(&r).expect("Should release"));
        assert!(!ledger.release(&r).expect("No-op"));
        assert_eq!(ledger.status("b1").expect("Should read").consumed_epsilon, 0.0);
    }

    #[test]
    fn test_unknown_budget() {
        let ledger = ledger(1.0, 0.0);
        assert_eq!(
            ledger.reserve("missing", 0.1, 0.0).expect_err("Should fail").kind(),
            ErrorKind::NotFound
        );
        assert_eq!(ledger.status("missing").expect_err("Should fail").kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_allocate_and_reset() {
        let ledger = ledger(1.0, 0.0);
        ledger.reserve("b1", 1.0, 0.0).expect("Should reserve");

        let status = ledger.allocate("b1", 0.5, 0.0).expect("Should allocate");
        assert!((status.remaining_epsilon() - 0.5).abs() < 1e-12);
        assert!(ledger.allocate("b1", -1.0, 0.0).is_err());
        assert!(ledger.allocate("b1", 0.0, 0.0).is_err());

        let status = ledger.reset("b1").expect("Should reset");
        assert_eq!(status.consumed_epsilon, 0.0);
    }
}
