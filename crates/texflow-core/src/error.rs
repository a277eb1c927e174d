//! Error types for texflow.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type alias using texflow's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for texflow operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Document store operation failed
    #[error("Store error: {0}")]
    Store(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Missing or invalid setting detected at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Structure template could not be resolved or rendered
    #[error("Template error: {0}")]
    Template(String),

    /// The external compiler exceeded its deadline
    #[error("Compile timed out after {0:?}")]
    CompileTimeout(Duration),

    /// The compiler finished but produced no artifact
    #[error("No pdf generated at {}", .0.display())]
    MissingArtifact(PathBuf),

    /// The compiler could not be started
    #[error("Compile error: {0}")]
    Compile(String),

    /// Sandbox runtime operation failed
    #[error("Sandbox error: {0}")]
    Sandbox(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error means the requested record does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
