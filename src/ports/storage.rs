//! Storage port: Trait for persistent engine state.
//!
//! This trait abstracts the storage backend (SQLite) from the application
//! logic. Budgets, reservations, jobs, results, the policy row and alerts must
//! survive restarts.

use crate::adapters::StorageError;
use crate::domain::{Alert, Budget, DatasetDescriptor, Job, JobResult, Policy, Reservation};
use crate::ErrorKind;

/// Trait for engine persistence.
///
/// Methods that mutate budget totals must be atomic with respect to other
/// callers of the same backend.
pub trait Storage: Send + Sync {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + Into<StorageError> + 'static;

    /// Read the guardrail policy, inserting `default` first if no row exists.
    ///
    /// Idempotent under concurrent callers: exactly one row is ever created.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn load_or_init_policy(&self, default: Policy) -> Result<Policy, Self::Error>;

    /// Overwrite the guardrail policy.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn save_policy(&self, policy: &Policy) -> Result<(), Self::Error>;

    /// Persist a dataset descriptor together with its budget.
    ///
    /// # Errors
    /// Returns error if storage operation fails or the dataset exists.
    fn insert_dataset(
        &self,
        dataset: &DatasetDescriptor,
        budget: &Budget,
    ) -> Result<(), Self::Error>;

    /// Delete a dataset, its budget and alerts.
    ///
    /// # Errors
    /// Returns a conflict error if any job references the dataset.
    fn delete_dataset(&self, dataset_id: &str) -> Result<(), Self::Error>;

    /// Persist a budget for a registered dataset that has none.
    ///
    /// # Errors
    /// Returns a not-found error for unknown datasets and a conflict error if
    /// the dataset already owns a budget or the ID is taken.
    fn insert_budget(&self, budget: &Budget) -> Result<(), Self::Error>;

    /// Load a budget by ID.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn load_budget(&self, budget_id: &str) -> Result<Option<Budget>, Self::Error>;

    /// Load the budget owned by a dataset.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn budget_for_dataset(&self, dataset_id: &str) -> Result<Option<Budget>, Self::Error>;

    /// Load all budgets.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn list_budgets(&self) -> Result<Vec<Budget>, Self::Error>;

    /// Atomically debit the budget and record a pending reservation.
    ///
    /// # Returns
    /// `false` (and no change) if the debit would exceed the allocation.
    ///
    /// # Errors
    /// Returns error if the budget does not exist or storage fails.
    fn try_reserve(&self, reservation: &Reservation) -> Result<bool, Self::Error>;

    /// Undo a pending reservation, restoring consumed totals exactly.
    ///
    /// # Returns
    /// `false` if the reservation was not pending (already committed or released).
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn release_reservation(&self, reservation_id: &str) -> Result<bool, Self::Error>;

    /// Zero consumed totals, abandon pending reservations and clear alert latches.
    ///
    /// # Errors
    /// Returns error if the budget does not exist or storage fails.
    fn reset_budget(&self, budget_id: &str) -> Result<(), Self::Error>;

    /// Increase a budget's allocation by the given scaled units.
    ///
    /// # Errors
    /// Returns error if the budget does not exist or storage fails.
    fn allocate_budget(
        &self,
        budget_id: &str,
        epsilon_units: i64,
        delta_units: i64,
    ) -> Result<Budget, Self::Error>;

    /// Delete a budget and its alerts.
    ///
    /// # Errors
    /// Returns a conflict error if any job references the budget.
    fn delete_budget(&self, budget_id: &str) -> Result<(), Self::Error>;

    /// Persist a newly started job.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn insert_job(&self, job: &Job) -> Result<(), Self::Error>;

    /// Mark the job completed, insert all results and commit the reservation,
    /// in one transaction.
    ///
    /// # Errors
    /// Returns error if storage fails; nothing is persisted in that case.
    fn complete_job(
        &self,
        job: &Job,
        results: &[JobResult],
        reservation: Option<&Reservation>,
    ) -> Result<(), Self::Error>;

    /// Mark a running job failed.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn fail_job(&self, job: &Job, error: &str, kind: ErrorKind) -> Result<(), Self::Error>;

    /// Load a job with its results.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn load_job(&self, job_id: &str) -> Result<Option<Job>, Self::Error>;

    /// Load all jobs, newest first, without result rows.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn list_jobs(&self) -> Result<Vec<Job>, Self::Error>;

    /// Persist a new alert.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn insert_alert(&self, alert: &Alert) -> Result<(), Self::Error>;

    /// Load all alerts of a budget.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn list_alerts(&self, budget_id: &str) -> Result<Vec<Alert>, Self::Error>;

    /// Latch an alert. Returns `false` if it was already triggered.
    ///
    /// # Errors
    /// Returns error if storage operation fails.
    fn claim_alert(&self, alert_id: &str) -> Result<bool, Self::Error>;

    /// Delete an alert.
    ///
    /// # Errors
    /// Returns error if the alert does not exist or storage fails.
    fn delete_alert(&self, alert_id: &str) -> Result<(), Self::Error>;
}
