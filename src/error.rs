//! Error types for the Turnstile engine.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Malformed policy or request. Nothing is mutated when this is returned.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A policy id that does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A request id reused with a different payload
    #[error("Idempotency conflict: {0}")]
    IdempotencyConflict(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot or payload (de)serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification used by callers that map errors onto response codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Internal,
}

impl TurnstileError {
    pub fn validation(message: impl Into<String>) -> Self {
        TurnstileError::Validation(message.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TurnstileError::Validation(_) => ErrorKind::Validation,
            TurnstileError::NotFound(_) => ErrorKind::NotFound,
            TurnstileError::IdempotencyConflict(_) => ErrorKind::Conflict,
            TurnstileError::Config(_)
            | TurnstileError::Io(_)
            | TurnstileError::Serialization(_) => ErrorKind::Internal,
        }
    }
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
