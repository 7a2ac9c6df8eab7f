//! Error types for the authority.

use thiserror::Error;

/// Result type for authority operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can escape the authority.
///
/// Bad input never shows up here: reports are merged leniently and broken
/// documents load as empty. Only writes and the service channel can fail.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The service task has stopped
    #[error("Authority service is not running")]
    ServiceClosed,
}
