#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use thiserror::Error;

/// Error code constants for type-safe error handling
pub mod code {
    pub const EXISTS: &str = "EXISTS";
    pub const NOTFOUND: &str = "NOTFOUND";
    pub const INVALID: &str = "INVALID";
    pub const CONFLICT: &str = "CONFLICT";
    pub const BUSY: &str = "BUSY";
    pub const DEPENDENCY: &str = "DEPENDENCY";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const INTERNAL: &str = "INTERNAL";
}

#[derive(Error, Debug)]
pub enum SwarmError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("SQLx error: {0}")]
    SqlxError(#[from] sqlx::Error),

    /// Commit failed. The store cannot know whether the transaction took
    /// effect, so this is always surfaced and never retried internally.
    #[error("Transaction error: {0}")]
    TransactionError(String),

    /// The work inside a transaction failed and the subsequent ROLLBACK
    /// failed too. Both causes are carried so neither is silently dropped.
    #[error("Rollback failed: {rollback} (while handling: {source})")]
    RollbackFailed {
        source: Box<SwarmError>,
        rollback: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SwarmError {
    /// Returns the protocol error code for this error
    pub fn code(&self) -> &'static str {
        match self {
            SwarmError::NotFound(_) => code::NOTFOUND,
            SwarmError::Validation(_) | SwarmError::ConfigError(_) => code::INVALID,
            SwarmError::DatabaseError(_) | SwarmError::SqlxError(_) => code::INTERNAL,
            SwarmError::TransactionError(_) | SwarmError::RollbackFailed { .. } => code::BUSY,
            SwarmError::IoError(_) => code::DEPENDENCY,
            SwarmError::SerializationError(_) => code::INVALID,
            SwarmError::Internal(_) => code::INTERNAL,
        }
    }
}

/// Protocol error codes surfaced to orchestration layers
pub const ERROR_CODES: &[(&str, &str, &str)] = &[
    (
        code::EXISTS,
        "Resource already exists",
        "Use different identifier or delete existing resource",
    ),
    (
        code::NOTFOUND,
        "Resource was not found",
        "List resources and verify identifier",
    ),
    (
        code::INVALID,
        "Invalid request payload",
        "Validate JSON syntax and ensure all required fields are present",
    ),
    (
        code::CONFLICT,
        "Conflicting reservation or state transition",
        "Inspect active reservations and retry with different paths",
    ),
    (
        code::BUSY,
        "Transaction could not be completed",
        "Inspect database health and retry at the caller layer",
    ),
    (
        code::DEPENDENCY,
        "Missing system dependency",
        "Install required binary and retry",
    ),
    (
        code::TIMEOUT,
        "Operation timed out",
        "Increase timeout and retry",
    ),
    (
        code::INTERNAL,
        "Unexpected internal failure",
        "Inspect logs and retry command",
    ),
];

/// Get error code details (description and fix) for a given error code
pub fn get_error_info(error_code: &str) -> Option<(&'static str, &'static str)> {
    ERROR_CODES
        .iter()
        .find(|(code, _, _)| *code == error_code)
        .map(|(_, desc, fix)| (*desc, *fix))
}

pub type Result<T> = std::result::Result<T, SwarmError>;
