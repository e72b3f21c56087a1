//! Error types for Trustwire Core.

use thiserror::Error;

/// Core errors that can occur while building or decoding permission data.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("unknown permission category: {0}")]
    UnknownCategory(String),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::DecodingError(e.to_string())
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
