//! Common error types for Bookmill

use thiserror::Error;

/// Common result type for Bookmill operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the Bookmill crates
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested book, item or version not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Book was deleted and has not been re-enabled
    #[error("Book deleted: {0}")]
    BookDeleted(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Book database was written by a different schema version.
    ///
    /// Never migrated automatically; the book must be discarded and reimported.
    #[error("Schema mismatch for book '{label}': expected version {expected}, found {found}")]
    SchemaMismatch {
        label: String,
        expected: i64,
        found: i64,
    },

    /// Lost a version-allocation race; recompute the next version and retry
    #[error("Concurrent write conflict: {0}")]
    Concurrency(String),

    /// Raised to an executor after its job was cancelled
    #[error("Job cancelled: {0}")]
    Cancelled(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors the caller caused (bad ids, out-of-range coordinates)
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::InvalidInput(_))
    }

    /// True for any of the "absent" errors, including deleted books
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::BookDeleted(_))
    }
}
