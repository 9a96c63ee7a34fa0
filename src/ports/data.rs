//! Data ports: dataset metadata lookup and row fetching.
//!
//! Both are owned by the dataset registry; the engine only reads through them.

use crate::domain::{DatasetDescriptor, SourceDescriptor, Table};

/// Errors raised by catalog lookups and tabular sources.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Data source unavailable: {0}")]
    Unavailable(String),

    #[error("Source type '{0}' is not supported by this reader")]
    UnsupportedSource(&'static str),

    #[error("Malformed data: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Column metadata lookup.
pub trait DatasetCatalog: Send + Sync {
    /// Look up a dataset by ID.
    ///
    /// # Returns
    /// `None` if no dataset is registered under that ID.
    ///
    /// # Errors
    /// Returns error if the registry cannot be read.
    fn get_dataset(&self, dataset_id: &str) -> Result<Option<DatasetDescriptor>, SourceError>;
}

/// Tabular data accessor.
pub trait TabularSource: Send + Sync {
    /// Fetch all columns of the dataset behind `source`.
    ///
    /// # Errors
    /// Returns `SourceError::Unavailable` if the underlying storage is gone.
    fn fetch(&self, source: &SourceDescriptor) -> Result<Table, SourceError>;
}
