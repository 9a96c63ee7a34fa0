//! Domain layer: Core types and the sensitivity table.
//!
//! This module contains pure Rust types with no I/O.
//! All types are serializable and validate their own invariants.

mod budget;
mod dataset;
mod job;
mod query;
pub mod sensitivity;

pub use budget::{
    from_units, to_units, Alert, Budget, BudgetOverview, BudgetStatus, Policy, Reservation,
    ReservationState, PRIVACY_SCALE,
};
pub use dataset::{
    ColumnBounds, ColumnMeta, ColumnType, DatasetDescriptor, Datum, SourceDescriptor, Table,
};
pub use job::{new_id, Job, JobRequest, JobResult, JobStatus, ResultValue};
pub use query::{Mechanism, Metric};
pub use sensitivity::{ColumnProfile, NoisePlan, SensitivitySpec, Unsupported, Utility};
