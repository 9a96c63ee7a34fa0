//! Ports layer: Trait definitions for external operations.
//!
//! Following Hexagonal Architecture, these traits define the boundaries
//! between the engine and external systems (storage, dataset registry,
//! noise sampling, alert delivery).

mod data;
mod notify;
mod privacy;
mod storage;

pub use data::{DatasetCatalog, SourceError, TabularSource};
pub use notify::{AlertNotice, AlertNotifier, NotifyError};
pub use privacy::{DpError, DpPrimitives};
pub use storage::Storage;
