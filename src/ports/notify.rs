//! Notification port: delivery of budget threshold alerts.

use serde::{Deserialize, Serialize};

/// Content of one threshold alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertNotice {
    pub alert_id: String,
    pub budget_id: String,
    pub dataset_id: String,
    pub recipient: String,
    pub threshold: f64,
    pub consumed_epsilon: f64,
    pub allocated_epsilon: f64,
}

impl AlertNotice {
    #[must_use]
    pub fn used_percent(&self) -> f64 {
        if self.allocated_epsilon > 0.0 {
            self.consumed_epsilon / self.allocated_epsilon * 100.0
        } else {
            100.0
        }
    }
}

/// Delivery failure. Never rolls back accounting.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Alert delivery failed: {0}")]
pub struct NotifyError(pub String);

/// Channel that delivers alerts (mail, chat, log).
pub trait AlertNotifier: Send + Sync {
    /// Deliver one alert.
    ///
    /// # Errors
    /// Returns `NotifyError` if the channel is unavailable.
    fn notify(&self, notice: &AlertNotice) -> Result<(), NotifyError>;
}
