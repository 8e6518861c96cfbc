//! Error types for Tally.

use thiserror::Error;

/// Main error type for Tally operations.
///
/// Admission checks never produce an error; these cover construction,
/// configuration and the policy layer.
#[derive(Error, Debug)]
pub enum TallyError {
    /// The cleanup interval passed to a limiter was zero.
    #[error("cleanup interval must be greater than zero")]
    InvalidCleanupInterval,

    /// A limiter was constructed outside of a tokio runtime.
    #[error("limiter must be created from within a tokio runtime")]
    NoRuntime,

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy name that is not part of the policy set.
    #[error("Unknown policy: {0}")]
    UnknownPolicy(String),

    /// An empty key was passed to a policy check.
    #[error("rate limit key must not be empty")]
    EmptyKey,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TallyError {
    fn from(err: config::ConfigError) -> Self {
        TallyError::Config(err.to_string())
    }
}

/// Result type alias for Tally operations.
pub type Result<T> = std::result::Result<T, TallyError>;
