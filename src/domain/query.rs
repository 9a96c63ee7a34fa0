//! Query vocabulary: the statistics a job can request and the noise
//! mechanisms that can protect them.

use serde::{Deserialize, Serialize};

/// Statistic computed over one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    Count,
    Sum,
    Mean,
    Median,
    Min,
    Max,
    Variance,
    Std,
    Histogram,
}

impl Metric {
    /// All metrics, in display order.
    pub const ALL: [Metric; 9] = [
        Self::Count,
        Self::Sum,
        Self::Mean,
        Self::Median,
        Self::Min,
        Self::Max,
        Self::Variance,
        Self::Std,
        Self::Histogram,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Mean => "mean",
            Self::Median => "median",
            Self::Min => "min",
            Self::Max => "max",
            Self::Variance => "variance",
            Self::Std => "std",
            Self::Histogram => "histogram",
        }
    }

    /// Whether the result is a per-category mapping rather than a scalar.
    #[must_use]
    pub fn is_histogram(&self) -> bool {
        matches!(self, Self::Histogram)
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "count" => Ok(Self::Count),
            "sum" => Ok(Self::Sum),
            "mean" | "avg" => Ok(Self::Mean),
            "median" => Ok(Self::Median),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "variance" | "var" => Ok(Self::Variance),
            "std" | "stddev" => Ok(Self::Std),
            "histogram" => Ok(Self::Histogram),
            other => Err(format!("unknown metric '{other}'")),
        }
    }
}

/// Randomized algorithm used to release a statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mechanism {
    Laplace,
    Gaussian,
    Exponential,
}

impl Mechanism {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Laplace => "laplace",
            Self::Gaussian => "gaussian",
            Self::Exponential => "exponential",
        }
    }

    /// Gaussian noise gives (ε, δ)-DP and needs a delta in (0, 1).
    #[must_use]
    pub fn requires_delta(&self) -> bool {
        matches!(self, Self::Gaussian)
    }
}

impl std::fmt::Display for Mechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mechanism {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "laplace" => Ok(Self::Laplace),
            "gaussian" => Ok(Self::Gaussian),
            "exponential" => Ok(Self::Exponential),
            other => Err(format!("unknown mechanism '{other}'")),
        }
    }
}
