use thiserror::Error;

use unibox_shared::CoreError;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A query expected exactly one row but found none.
    #[error("Record not found")]
    NotFound,

    /// A row with the same unique key already exists.
    ///
    /// Raised by raw inserts and absorbed by [`DeliveryLedger`](crate::DeliveryLedger).
    #[error("Duplicate key")]
    Conflict,

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Stored JSON could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The connection mutex was poisoned by a panicking writer.
    #[error("Database lock poisoned")]
    LockPoisoned,

    /// The blocking worker running a query was cancelled or panicked.
    #[error("Database task failed: {0}")]
    Task(String),
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        CoreError::Ledger(e.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
