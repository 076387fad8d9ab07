//! Error types for `tunnelward` core library.

use thiserror::Error;

/// Result type alias using `tunnelward` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `tunnelward` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Settings error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A textual value could not be parsed into a typed setting
    #[error("Invalid value for {field}: {value:?}")]
    InvalidValue { field: &'static str, value: String },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
