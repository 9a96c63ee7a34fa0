//! Job and result records.
//!
//! A job is created in `Running` state once its budget reservation succeeds
//! and transitions exactly once to `Completed` or `Failed`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Mechanism, Metric};
use crate::ErrorKind;

/// A request to run DP statistics over a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub dataset_id: String,
    pub budget_id: Option<String>,
    pub metrics: Vec<Metric>,
    /// Target columns; `None` selects every non-PII column.
    pub columns: Option<Vec<String>>,
    pub mechanism: Mechanism,
    pub epsilon: f64,
    pub delta: Option<f64>,
}

impl JobRequest {
    /// Laplace request without a budget; refine with the builder methods.
    #[must_use]
    pub fn new(dataset_id: impl Into<String>, metrics: Vec<Metric>, epsilon: f64) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            budget_id: None,
            metrics,
            columns: None,
            mechanism: Mechanism::Laplace,
            epsilon,
            delta: None,
        }
    }

    #[must_use]
    pub fn with_budget(mut self, budget_id: impl Into<String>) -> Self {
        self.budget_id = Some(budget_id.into());
        self
    }

    #[must_use]
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_mechanism(mut self, mechanism: Mechanism) -> Self {
        self.mechanism = mechanism;
        self
    }

    #[must_use]
    pub fn with_delta(mut self, delta: f64) -> Self {
        self.delta = Some(delta);
        self
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Released value of one (column, metric) query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResultValue {
    Scalar(f64),
    Histogram(BTreeMap<String, u64>),
}

impl ResultValue {
    #[must_use]
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            Self::Histogram(_) => None,
        }
    }

    #[must_use]
    pub fn as_histogram(&self) -> Option<&BTreeMap<String, u64>> {
        match self {
            Self::Scalar(_) => None,
            Self::Histogram(h) => Some(h),
        }
    }
}

/// Result row owned by exactly one job. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub id: String,
    pub job_id: String,
    pub analysis_type: Metric,
    pub column_name: String,
    pub result: ResultValue,
}

impl JobResult {
    #[must_use]
    pub fn new(
        job_id: &str,
        analysis_type: Metric,
        column_name: &str,
        result: ResultValue,
    ) -> Self {
        Self {
            id: new_id(),
            job_id: job_id.to_string(),
            analysis_type,
            column_name: column_name.to_string(),
            result,
        }
    }
}

/// A DP job and, once completed, its full result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub dataset_id: String,
    pub budget_id: Option<String>,
    pub epsilon: f64,
    pub delta: Option<f64>,
    pub mechanism: Mechanism,
    pub columns: Vec<String>,
    pub metrics: Vec<Metric>,
    pub status: JobStatus,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub results: Vec<JobResult>,
}

impl Job {
    /// A freshly submitted job in `Running` state.
    #[must_use]
    pub fn start(request: &JobRequest, columns: Vec<String>) -> Self {
        Self {
            id: new_id(),
            dataset_id: request.dataset_id.clone(),
            budget_id: request.budget_id.clone(),
            epsilon: request.epsilon,
            delta: request.delta,
            mechanism: request.mechanism,
            columns,
            metrics: request.metrics.clone(),
            status: JobStatus::Running,
            error: None,
            error_kind: None,
            created_at: chrono::Utc::now(),
            finished_at: None,
            results: Vec::new(),
        }
    }

    /// Find the result for a (column, metric) pair.
    #[must_use]
    pub fn result(&self, column: &str, metric: Metric) -> Option<&ResultValue> {
        self.results
            .iter()
            .find(|r| r.column_name == column && r.analysis_type == metric)
            .map(|r| &r.result)
    }
}

/// Generate a random UUID v4 string using a CSPRNG.
#[must_use]
pub fn new_id() -> String {
    use rand::Rng;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    let mut rng = ChaCha20Rng::from_entropy();
    let bytes: [u8; 16] = rng.gen();

    format!(
        concat!(
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-",
            "{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        ),
        bytes[0], bytes[1], bytes[2], bytes[3],
        bytes[4], bytes[5],
        (bytes[6] & 0x0f) | 0x40, bytes[7],
        (bytes[8] & 0x3f) | 0x80, bytes[9],
        bytes[10], bytes[11], bytes[12], bytes[13], bytes[14], bytes[15]
    )
}
