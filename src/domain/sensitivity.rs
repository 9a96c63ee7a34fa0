//! Sensitivity resolution: which noise plan and sensitivity a
//! (metric, mechanism) pair needs on a given column.
//!
//! The compatibility table is policy. Combinations the requested mechanism
//! cannot serve either fall back to Laplace (where the table says so) or are
//! rejected with [`Unsupported`]; nothing falls through silently.
//!
//! | Metric | Laplace | Gaussian | Exponential |
//! |---|---|---|---|
//! | count | 1 | 1 | Laplace |
//! | sum | `u - l` | `max(abs(l), abs(u))` | Laplace |
//! | mean | bounded mean, `u - l` | `(u - l) / n` | Laplace |
//! | median | `u - l` | bounded median | utility `-abs(x - median)` |
//! | min | `u - l` | Laplace | utility `-x` |
//! | max | `u - l` | Laplace | utility `x` |
//! | variance, std | `(u - l)^2 / n` | `(u - l)^2 / n` | Laplace |
//! | histogram | 1 per bucket | 1 per bucket | unsupported |

use serde::{Deserialize, Serialize};

use super::{ColumnBounds, ColumnMeta, Mechanism, Metric};

/// Column facts the resolver needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnProfile {
    pub name: String,
    pub is_numeric: bool,
    pub is_categorical: bool,
    pub bounds: Option<ColumnBounds>,
    /// Number of non-null values in the fetched column.
    pub non_null: usize,
}

impl ColumnProfile {
    #[must_use]
    pub fn from_meta(meta: &ColumnMeta, non_null: usize) -> Self {
        Self {
            name: meta.name.clone(),
            is_numeric: meta.dtype.is_numeric(),
            is_categorical: meta.is_categorical,
            bounds: meta.bounds,
            non_null,
        }
    }
}

/// Utility function scored by the exponential mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Utility {
    /// `-|x - median|`: prefers values near the sample median.
    NegDistanceToMedian,
    /// `-x`: prefers small values.
    NegValue,
    /// `x`: prefers large values.
    Value,
}

impl Utility {
    #[must_use]
    pub fn score(&self, x: f64, median: f64) -> f64 {
        match self {
            Self::NegDistanceToMedian => -(x - median).abs(),
            Self::NegValue => -x,
            Self::Value => x,
        }
    }
}

/// How the dispatcher turns column values into a private release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoisePlan {
    /// Compute the true statistic, add Laplace or Gaussian noise.
    Additive,
    /// Laplace bounded-mean primitive.
    BoundedMean,
    /// Bounded-median primitive.
    BoundedMedian,
    /// Exponential mechanism over the observed values.
    Selection(Utility),
    /// One noisy count per observed category, epsilon split across buckets.
    PerBucketCount,
}

/// Resolved noise parameters for one (column, metric) query.
#[derive(Debug, Clone, PartialEq)]
pub struct SensitivitySpec {
    pub metric: Metric,
    pub requested: Mechanism,
    /// Mechanism actually used after fallback.
    pub mechanism: Mechanism,
    pub sensitivity: f64,
    pub plan: NoisePlan,
    pub bounds: Option<ColumnBounds>,
}

impl SensitivitySpec {
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.requested != self.mechanism
    }
}

/// The (metric, mechanism, column) combination cannot be served.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{metric} on column '{column}' with {mechanism}: {reason}")]
pub struct Unsupported {
    pub metric: Metric,
    pub mechanism: Mechanism,
    pub column: String,
    pub reason: String,
}

/// Resolve the sensitivity and noise plan for one query.
///
/// # Errors
/// Returns [`Unsupported`] when the column type does not fit the metric,
/// numeric bounds are missing, or the table marks the pair unsupported.
pub fn resolve(
    metric: Metric,
    mechanism: Mechanism,
    column: &ColumnProfile,
) -> Result<SensitivitySpec, Unsupported> {
    let unsupported = |reason: &str| Unsupported {
        metric,
        mechanism,
        column: column.name.clone(),
        reason: reason.to_string(),
    };
    let spec = |effective: Mechanism, sensitivity: f64, plan: NoisePlan| SensitivitySpec {
        metric,
        requested: mechanism,
        mechanism: effective,
        sensitivity,
        plan,
        bounds: column.bounds,
    };

    if metric == Metric::Histogram {
        if !column.is_categorical {
            return Err(unsupported("histogram requires a categorical column"));
        }
        return match mechanism {
            Mechanism::Exponential => Err(unsupported("histograms have no exponential variant")),
            m => Ok(spec(m, 1.0, NoisePlan::PerBucketCount)),
        };
    }

    if !column.is_numeric {
        return Err(unsupported("column is not numeric"));
    }

    if metric == Metric::Count {
        let effective = match mechanism {
            Mechanism::Exponential => Mechanism::Laplace,
            m => m,
        };
        return Ok(spec(effective, 1.0, NoisePlan::Additive));
    }

    let Some(bounds) = column.bounds else {
        return Err(unsupported("column has no declared [min, max] bounds"));
    };
    let width = bounds.width();
    let n = column.non_null.max(1) as f64;

    use Mechanism::{Exponential, Gaussian, Laplace};
    let resolved = match (metric, mechanism) {
        (Metric::Sum, Gaussian) => {
            let magnitude = bounds.lower.abs().max(bounds.upper.abs());
            spec(Gaussian, magnitude, NoisePlan::Additive)
        }
        (Metric::Sum, _) => spec(Laplace, width, NoisePlan::Additive),

        (Metric::Mean, Gaussian) => spec(Gaussian, width / n, NoisePlan::Additive),
        (Metric::Mean, _) => spec(Laplace, width, NoisePlan::BoundedMean),

        (Metric::Median, Laplace) => spec(Laplace, width, NoisePlan::Additive),
        (Metric::Median, Gaussian) => spec(Gaussian, 1.0, NoisePlan::BoundedMedian),
        (Metric::Median, Exponential) => {
            spec(Exponential, 1.0, NoisePlan::Selection(Utility::NegDistanceToMedian))
        }

        (Metric::Min, Exponential) => {
            spec(Exponential, 1.0, NoisePlan::Selection(Utility::NegValue))
        }
        (Metric::Min, _) => spec(Laplace, width, NoisePlan::Additive),

        (Metric::Max, Exponential) => spec(Exponential, 1.0, NoisePlan::Selection(Utility::Value)),
        (Metric::Max, _) => spec(Laplace, width, NoisePlan::Additive),

        (Metric::Variance | Metric::Std, Gaussian) => {
            spec(Gaussian, width * width / n, NoisePlan::Additive)
        }
        (Metric::Variance | Metric::Std, _) => {
            spec(Laplace, width * width / n, NoisePlan::Additive)
        }

        (Metric::Count | Metric::Histogram, _) => {
            return Err(unsupported("resolved before bounds check"))
        }
    };
    Ok(resolved)
}
