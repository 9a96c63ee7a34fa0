//! Policy guardrail: organization-wide ceiling on per-job epsilon.
//!
//! Checked before any budget is touched, so a rejected job never reserves.

use std::sync::Arc;

use crate::domain::Policy;
use crate::ports::Storage;
use crate::{EngineError, Result};

pub struct PolicyGuardrail<S: Storage> {
    storage: Arc<S>,
    default_policy: Policy,
}

impl<S: Storage> PolicyGuardrail<S> {
    /// `default_ceiling` is written to storage the first time the policy is read.
    pub fn new(storage: Arc<S>, default_ceiling: f64) -> Self {
        Self {
            storage,
            default_policy: Policy {
                max_epsilon_per_job: default_ceiling,
            },
        }
    }

    /// Current policy, creating the singleton row on first access.
    ///
    /// # Errors
    /// Returns error if storage fails.
    pub fn policy(&self) -> Result<Policy> {
        self.storage
            .load_or_init_policy(self.default_policy)
            .map_err(|e| EngineError::Storage(e.into()))
    }

    /// Reject `epsilon` if it exceeds the policy ceiling.
    ///
    /// # Errors
    /// Returns `EngineError::PolicyViolation` when `epsilon > max_epsilon_per_job`.
    pub fn check_job_epsilon(&self, epsilon: f64) -> Result<()> {
        let policy = self.policy()?;
        if epsilon > policy.max_epsilon_per_job {
            tracing::warn!(
                requested = epsilon,
                ceiling = policy.max_epsilon_per_job,
                "Job rejected by epsilon guardrail"
            );
            return Err(EngineError::PolicyViolation {
                requested: epsilon,
                ceiling: policy.max_epsilon_per_job,
            });
        }
        Ok(())
    }

    /// Replace the ceiling.
    ///
    /// # Errors
    /// Returns `EngineError::Validation` for non-positive or non-finite ceilings.
    pub fn update(&self, max_epsilon_per_job: f64) -> Result<Policy> {
        if !max_epsilon_per_job.is_finite() || max_epsilon_per_job <= 0.0 {
            return Err(EngineError::Validation(format!(
                "max_epsilon_per_job must be a positive number, got {max_epsilon_per_job}"
            )));
        }
        let policy = Policy { max_epsilon_per_job };
        self.storage
            .save_policy(&policy)
            .map_err(|e| EngineError::Storage(e.into()))?;
        tracing::info!(max_epsilon_per_job, "Guardrail policy updated");
        Ok(policy)
    }
}
