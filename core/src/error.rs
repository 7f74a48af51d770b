//! Error types

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Alert channel error: {0}")]
    Channel(String),

    #[error("Email error: {0}")]
    Email(String),

    /// The named lock was abandoned by a dead holder and recovery failed.
    #[error("Abandoned lock '{lock}' could not be recovered: {reason}")]
    LockAbandoned { lock: String, reason: String },

    #[error("Retry exhausted after {attempts} attempt(s): {last}")]
    RetryExhausted { attempts: u32, last: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(String),
}

// Convert anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}
