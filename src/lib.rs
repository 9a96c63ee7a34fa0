//! # dpledger
//!
//! Differential-privacy query engine with per-dataset privacy budget accounting.
//!
//! This crate provides:
//! - An organization-wide epsilon guardrail checked before any budget is touched
//! - A budget ledger with atomic, per-budget reserve/commit/release of (ε, δ)
//! - Sensitivity resolution and mechanism dispatch (Laplace, Gaussian, Exponential)
//! - An all-or-nothing job orchestrator and threshold alerts on cumulative spend
//!
//! ## Architecture
//!
//! The crate follows Hexagonal Architecture:
//! - `domain`: Core types (queries, columns, budgets, jobs) and the sensitivity table
//! - `ports`: Trait definitions for storage, data access, noise and notifications
//! - `adapters`: Concrete implementations (SQLite, ChaCha20 noise, CSV/SQLite sources)
//! - `application`: Services orchestrating domain logic through the ports
//! - `config`: Engine settings loaded from defaults, TOML and environment

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;

pub use domain::{Job, JobRequest, JobStatus, Mechanism, Metric, ResultValue};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Machine-distinguishable error category, stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    PolicyViolation,
    InsufficientBudget,
    DataUnavailable,
    UnsupportedQuery,
    Conflict,
    NotFound,
    Internal,
}

impl ErrorKind {
    /// Stable identifier used when persisting failed jobs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::PolicyViolation => "policy_violation",
            Self::InsufficientBudget => "insufficient_budget",
            Self::DataUnavailable => "data_unavailable",
            Self::UnsupportedQuery => "unsupported_query",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::Internal => "internal",
        }
    }

    /// Parse a stored identifier. Unknown values map to `Internal`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "validation" => Self::Validation,
            "policy_violation" => Self::PolicyViolation,
            "insufficient_budget" => Self::InsufficientBudget,
            "data_unavailable" => Self::DataUnavailable,
            "unsupported_query" => Self::UnsupportedQuery,
            "conflict" => Self::Conflict,
            "not_found" => Self::NotFound,
            _ => Self::Internal,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for the engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Job epsilon {requested} exceeds the organization limit of {ceiling}")]
    PolicyViolation { requested: f64, ceiling: f64 },

    #[error("Insufficient privacy budget on {budget_id}: requested ε={epsilon}, δ={delta}")]
    InsufficientBudget {
        budget_id: String,
        epsilon: f64,
        delta: f64,
    },

    #[error("Data unavailable: {0}")]
    DataUnavailable(String),

    #[error("Unsupported query: {0}")]
    UnsupportedQuery(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage operation failed: {0}")]
    Storage(#[from] adapters::StorageError),

    #[error("Privacy primitive failed: {0}")]
    Privacy(#[from] ports::DpError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Category of this error for callers that branch on failure type.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::PolicyViolation { .. } => ErrorKind::PolicyViolation,
            Self::InsufficientBudget { .. } => ErrorKind::InsufficientBudget,
            Self::DataUnavailable(_) => ErrorKind::DataUnavailable,
            Self::UnsupportedQuery(_) => ErrorKind::UnsupportedQuery,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Storage(adapters::StorageError::NotFound(_)) => ErrorKind::NotFound,
            Self::Storage(adapters::StorageError::Conflict(_)) => ErrorKind::Conflict,
            Self::Privacy(_) | Self::Storage(_) | Self::Io(_) | Self::Serialization(_) => {
                ErrorKind::Internal
            }
        }
    }
}
