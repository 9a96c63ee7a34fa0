//! Log-based alert notifier.
//!
//! Emits one structured `WARN` event per threshold crossing. Recipients are
//! redacted by the sanitizing log writer, not here.

use crate::ports::{AlertNotice, AlertNotifier, NotifyError};

/// Delivers alerts as tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl AlertNotifier for LogNotifier {
    fn notify(&self, notice: &AlertNotice) -> Result<(), NotifyError> {
        if notice.recipient.trim().is_empty() {
            return Err(NotifyError(format!("alert {} has no recipient", notice.alert_id)));
        }
        tracing::warn!(
            alert_id = %notice.alert_id,
            budget_id = %notice.budget_id,
            dataset_id = %notice.dataset_id,
            recipient = %notice.recipient,
            threshold = notice.threshold,
            used_percent = notice.used_percent(),
            "Privacy budget threshold reached"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice(recipient: &str) -> AlertNotice {
        AlertNotice {
            alert_id: "a1".into(),
            budget_id: "b1".into(),
            dataset_id: "d1".into(),
            recipient: recipient.into(),
            threshold: 50.0,
            consumed_epsilon: 0.6,
            allocated_epsilon: 1.0,
        }
    }

    #[test]
    fn test_log_notifier_delivers() {
        assert!(LogNotifier.notify(&notice("ops@example.com")).is_ok());
    }

    #[test]
    fn test_log_notifier_rejects_blank_recipient() {
        assert!(LogNotifier.notify(&notice("  ")).is_err());
    }

    #[test]
    fn test_used_percent() {
        assert!((notice("x").used_percent() - 60.0).abs() < 1e-9);
    }
}
