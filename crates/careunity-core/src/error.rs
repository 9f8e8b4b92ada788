//! Error types for careunity-core

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using careunity-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in careunity-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Store file exists but is not a readable database; left untouched
    #[error("Local store at {path} is unreadable: {1}", path = .0.display())]
    CorruptStore(PathBuf, String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Insert collided with an existing record
    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}
