//! Adapters layer: Concrete implementations of ports.
//!
//! These modules contain the actual integration with external libraries:
//! - `sqlite`: SQLite for engine state and the dataset registry
//! - `noise`: ChaCha20 CSPRNG noise for the DP primitives
//! - `tabular`: CSV, SQLite-table and in-memory row sources
//! - `notify`: alert delivery through tracing
//! - `sanitize`: redaction for logs

pub mod noise;
pub mod notify;
pub mod sanitize;
pub mod sqlite;
pub mod tabular;

pub use sqlite::StorageError;
