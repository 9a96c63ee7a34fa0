//! Privacy budget, guardrail policy and alert records.
//!
//! # Fixed-point accounting
//!
//! Epsilon and delta amounts are persisted as integers scaled by
//! [`PRIVACY_SCALE`]. Additive composition over integers is exact, so the
//! consumed total of a budget is always the exact sum of its committed debits
//! and a release restores the previous total bit-for-bit.

use serde::{Deserialize, Serialize};

/// Scale factor for fixed-point epsilon/delta arithmetic.
/// Amounts are stored as `round(value * PRIVACY_SCALE)`.
pub const PRIVACY_SCALE: f64 = 1_000_000_000_000.0;

/// Convert an epsilon/delta amount to scaled units.
///
/// Negative or non-finite inputs map to 0; callers validate before converting.
#[must_use]
pub fn to_units(value: f64) -> i64 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    let scaled = (value * PRIVACY_SCALE).round();
    if scaled >= i64::MAX as f64 {
        i64::MAX
    } else {
        scaled as i64
    }
}

/// Convert scaled units back to a floating-point amount.
#[must_use]
pub fn from_units(units: i64) -> f64 {
    units as f64 / PRIVACY_SCALE
}

/// Per-dataset privacy budget.
///
/// Invariant: `0 <= consumed <= allocated` for both epsilon and delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    pub id: String,
    pub dataset_id: String,
    pub allocated_epsilon_units: i64,
    pub allocated_delta_units: i64,
    pub consumed_epsilon_units: i64,
    pub consumed_delta_units: i64,
}

impl Budget {
    /// Create an unspent budget with the given allocation.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        dataset_id: impl Into<String>,
        epsilon: f64,
        delta: f64,
    ) -> Self {
        Self {
            id: id.into(),
            dataset_id: dataset_id.into(),
            allocated_epsilon_units: to_units(epsilon),
            allocated_delta_units: to_units(delta),
            consumed_epsilon_units: 0,
            consumed_delta_units: 0,
        }
    }

    /// Whether a debit of the given units fits in the remaining allocation.
    #[must_use]
    pub fn can_afford(&self, epsilon_units: i64, delta_units: i64) -> bool {
        let eps_ok = self
            .consumed_epsilon_units
            .checked_add(epsilon_units)
            .is_some_and(|total| total <= self.allocated_epsilon_units);
        let delta_ok = self
            .consumed_delta_units
            .checked_add(delta_units)
            .is_some_and(|total| total <= self.allocated_delta_units);
        eps_ok && delta_ok
    }

    #[must_use]
    pub fn status(&self) -> BudgetStatus {
        BudgetStatus {
            budget_id: self.id.clone(),
            dataset_id: self.dataset_id.clone(),
            allocated_epsilon: from_units(self.allocated_epsilon_units),
            consumed_epsilon: from_units(self.consumed_epsilon_units),
            allocated_delta: from_units(self.allocated_delta_units),
            consumed_delta: from_units(self.consumed_delta_units),
        }
    }

    /// Share of the epsilon allocation consumed so far, in percent.
    #[must_use]
    pub fn epsilon_used_percent(&self) -> f64 {
        if self.allocated_epsilon_units <= 0 {
            return 100.0;
        }
        self.consumed_epsilon_units as f64 / self.allocated_epsilon_units as f64 * 100.0
    }
}

/// Read-only view of a budget for collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub budget_id: String,
    pub dataset_id: String,
    pub allocated_epsilon: f64,
    pub consumed_epsilon: f64,
    pub allocated_delta: f64,
    pub consumed_delta: f64,
}

impl BudgetStatus {
    #[must_use]
    pub fn remaining_epsilon(&self) -> f64 {
        (self.allocated_epsilon - self.consumed_epsilon).max(0.0)
    }

    #[must_use]
    pub fn remaining_delta(&self) -> f64 {
        (self.allocated_delta - self.consumed_delta).max(0.0)
    }
}

/// Totals across every budget.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetOverview {
    pub budgets: Vec<BudgetStatus>,
    pub allocated_epsilon: f64,
    pub consumed_epsilon: f64,
    pub allocated_delta: f64,
    pub consumed_delta: f64,
}

impl BudgetOverview {
    #[must_use]
    pub fn from_budgets(budgets: &[Budget]) -> Self {
        let sum = |f: fn(&Budget) -> i64| from_units(budgets.iter().map(f).sum());
        Self {
            allocated_epsilon: sum(|b| b.allocated_epsilon_units),
            consumed_epsilon: sum(|b| b.consumed_epsilon_units),
            allocated_delta: sum(|b| b.allocated_delta_units),
            consumed_delta: sum(|b| b.consumed_delta_units),
            budgets: budgets.iter().map(Budget::status).collect(),
        }
    }

    #[must_use]
    pub fn epsilon_used_percent(&self) -> f64 {
        if self.allocated_epsilon > 0.0 {
            self.consumed_epsilon / self.allocated_epsilon * 100.0
        } else {
            0.0
        }
    }
}

/// Lifecycle of a provisional debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationState {
    Pending,
    Committed,
    Released,
}

impl ReservationState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
            Self::Released => "released",
        }
    }
}

/// A provisional debit against a budget, later committed or released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub budget_id: String,
    pub epsilon_units: i64,
    pub delta_units: i64,
}

impl Reservation {
    #[must_use]
    pub fn epsilon(&self) -> f64 {
        from_units(self.epsilon_units)
    }

    #[must_use]
    pub fn delta(&self) -> f64 {
        from_units(self.delta_units)
    }
}

/// Organization-wide guardrail.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub max_epsilon_per_job: f64,
}

/// Threshold alert on a budget's epsilon consumption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub budget_id: String,
    /// Percentage of the allocated epsilon, in (0, 100].
    pub threshold: f64,
    pub recipient: String,
    /// Latched once fired; cleared only by a budget reset.
    pub triggered: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_units_roundtrip_is_exact_for_sums() {
        let parts = [0.1, 0.2, 0.3];
        let total: i64 = parts.iter().map(|p| to_units(*p)).sum();
        assert_eq!(total, to_units(0.6));
        assert_eq!(to_units(-1.0), 0);
        assert_eq!(to_units(f64::NAN), 0);
    }

    #[test]
    fn test_can_afford() {
        let mut b = Budget::new("b1", "d1", 1.0, 1e-5);
        assert!(b.can_afford(to_units(1.0), to_units(1e-5)));
        assert!(!b.can_afford(to_units(1.0000001), 0));

        b.consumed_epsilon_units = to_units(0.6);
        assert!(!b.can_afford(to_units(0.6), 0));
        assert!(b.can_afford(to_units(0.4), 0));
        assert!(!b.can_afford(0, to_units(2e-5)));
    }

    #[test]
    fn test_used_percent() {
        let mut b = Budget::new("b1", "d1", 2.0, 0.0);
        b.consumed_epsilon_units = to_units(1.5);
        assert!((b.epsilon_used_percent() - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_overview_sums() {
        let mut a = Budget::new("a", "d1", 1.0, 1e-5);
        a.consumed_epsilon_units = to_units(0.25);
        let b = Budget::new("b", "d2", 3.0, 1e-5);
        let overview = BudgetOverview::from_budgets(&[a, b]);
        assert!((overview.allocated_epsilon - 4.0).abs() < 1e-12);
        assert!((overview.consumed_epsilon - 0.25).abs() < 1e-12);
        assert_eq!(overview.budgets.len(), 2);
    }
}
