//! Alert evaluator: threshold notifications on cumulative epsilon spend.
//!
//! Each alert fires at most once between budget resets. The `triggered`
//! latch is claimed before dispatch and stays set even if delivery fails;
//! only a budget reset re-arms it. Alert failures never affect the job that
//! triggered the evaluation.

use std::sync::Arc;

use crate::domain::{new_id, Alert, Budget};
use crate::ports::{AlertNotice, AlertNotifier, Storage};
use crate::{EngineError, Result};

/// Check alert parameters.
///
/// # Errors
/// Returns `EngineError::Validation` if `threshold` is outside (0, 100] or
/// the recipient is blank.
pub fn validate_alert(threshold: f64, recipient: &str) -> Result<()> {
    if !threshold.is_finite() || threshold <= 0.0 || threshold > 100.0 {
        return Err(EngineError::Validation(format!(
            "alert threshold must be in (0, 100], got {threshold}"
        )));
    }
    if recipient.trim().is_empty() {
        return Err(EngineError::Validation("alert recipient must not be empty".into()));
    }
    Ok(())
}

/// Build a new, untriggered alert.
///
/// # Errors
/// See [`validate_alert`].
pub fn new_alert(budget_id: &str, threshold: f64, recipient: &str) -> Result<Alert> {
    validate_alert(threshold, recipient)?;
    Ok(Alert {
        id: new_id(),
        budget_id: budget_id.to_string(),
        threshold,
        recipient: recipient.trim().to_string(),
        triggered: false,
    })
}

pub struct AlertEvaluator<S: Storage, N: AlertNotifier> {
    storage: Arc<S>,
    notifier: Arc<N>,
}

impl<S: Storage, N: AlertNotifier> AlertEvaluator<S, N> {
    pub fn new(storage: Arc<S>, notifier: Arc<N>) -> Self {
        Self { storage, notifier }
    }

    /// Fire every untriggered alert whose threshold the budget has reached.
    ///
    /// Returns the number of alerts delivered. Errors are logged, not returned.
    pub fn evaluate(&self, budget_id: &str) -> usize {
        match self.try_evaluate(budget_id) {
            Ok(fired) => fired,
            Err(e) => {
                tracing::error!(budget_id, "Alert evaluation failed: {e}");
                0
            }
        }
    }

    fn try_evaluate(&self, budget_id: &str) -> Result<usize> {
        let Some(budget) = self
            .storage
            .load_budget(budget_id)
            .map_err(|e| EngineError::Storage(e.into()))?
        else {
            return Ok(0);
        };
        let used = budget.epsilon_used_percent();

        let alerts = self
            .storage
            .list_alerts(budget_id)
            .map_err(|e| EngineError::Storage(e.into()))?;

        let mut fired = 0;
        for alert in alerts.iter().filter(|a| !a.triggered && used >= a.threshold) {
            if self.fire(alert, &budget)? {
                fired += 1;
            }
        }
        Ok(fired)
    }

    fn fire(&self, alert: &Alert, budget: &Budget) -> Result<bool> {
        let claimed = self
            .storage
            .claim_alert(&alert.id)
            .map_err(|e| EngineError::Storage(e.into()))?;
        if !claimed {
            // Another evaluation got there first.
            return Ok(false);
        }

        let status = budget.status();
        let notice = AlertNotice {
            alert_id: alert.id.clone(),
            budget_id: budget.id.clone(),
            dataset_id: budget.dataset_id.clone(),
            recipient: alert.recipient.clone(),
            threshold: alert.threshold,
            consumed_epsilon: status.consumed_epsilon,
            allocated_epsilon: status.allocated_epsilon,
        };

        match self.notifier.notify(&notice) {
            Ok(()) => {
                tracing::info!(alert_id = %alert.id, budget_id = %budget.id, "Alert dispatched");
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(alert_id = %alert.id, budget_id = %budget.id, "{e}");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::SqliteStorage;
    use crate::domain::{to_units, ColumnMeta, DatasetDescriptor, Reservation, SourceDescriptor};
    use crate::ports::NotifyError;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        sent: AtomicUsize,
        down: AtomicBool,
    }

    impl AlertNotifier for Counting {
        fn notify(&self, _notice: &AlertNotice) -> std::result::Result<(), NotifyError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(NotifyError("smtp unreachable".into()));
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn setup() -> (Arc<SqliteStorage>, Arc<Counting>, AlertEvaluator<SqliteStorage, Counting>) {
        let storage = Arc::new(SqliteStorage::in_memory().expect("Should create db"));
        let dataset = DatasetDescriptor {
            id: "d1".into(),
            name: "d1".into(),
            source: SourceDescriptor::Inline { key: "d1".into() },
            columns: vec![ColumnMeta::numeric("x", 0.0, 1.0)],
        };
        storage
            .insert_dataset(&dataset, &Budget::new("b1", "d1", 1.0, 0.0))
            .expect("Should register");
        storage
            .insert_alert(&new_alert("b1", 50.0, "ops@example.com").expect("valid"))
            .expect("Should insert");
        let notifier = Arc::new(Counting::default());
        let evaluator = AlertEvaluator::new(Arc::clone(&storage), Arc::clone(&notifier));
        (storage, notifier, evaluator)
    }

    fn spend(storage: &SqliteStorage, epsilon: f64) {
        let r = Reservation {
            id: new_id(),
            budget_id: "b1".into(),
            epsilon_units: to_units(epsilon),
            delta_units: 0,
        };
        assert!(storage.try_reserve(&r).expect("Should reserve"));
    }

    #[test]
    fn test_validate_alert() {
        assert!(validate_alert(100.0, "a").is_ok());
        assert!(validate_alert(0.0, "a").is_err());
        assert!(validate_alert(100.5, "a").is_err());
        assert!(validate_alert(50.0, "  ").is_err());
    }

    #[test]
    fn test_fires_once_at_threshold() {
        let (storage, notifier, evaluator) = setup();

        spend(&storage, 0.4);
        assert_eq!(evaluator.evaluate("b1"), 0);

        spend(&storage, 0.1);
        assert_eq!(evaluator.evaluate("b1"), 1);

        spend(&storage, 0.2);
        assert_eq!(evaluator.evaluate("b1"), 0);
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_dispatch_keeps_latch() {
        let (storage, notifier, evaluator) = setup();
        spend(&storage, 0.6);

        notifier.down.store(true, Ordering::SeqCst);
        assert_eq!(evaluator.evaluate("b1"), 0);
        assert!(storage.list_alerts("b1").expect("Should list")[0].triggered);

        notifier.down.store(false, Ordering::SeqCst);
        spend(&storage, 0.1);
        assert_eq!(evaluator.evaluate("b1"), 0);
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reset_rearms_alert() {
        let (storage, notifier, evaluator) = setup();
        spend(&storage, 0.6);
        assert_eq!(evaluator.evaluate("b1"), 1);

        storage.reset_budget("b1").expect("Should reset");
        spend(&storage, 0.6);
        assert_eq!(evaluator.evaluate("b1"), 1);
        assert_eq!(notifier.sent.load(Ordering::SeqCst), 2);
    }
}
