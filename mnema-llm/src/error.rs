//! Provider client error types.

use thiserror::Error;

/// Errors from the HTTP provider clients.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Input rejected before any network call. Never retried.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP request failed with a non-retryable status.
    #[error("Provider request failed: {0}")]
    RequestFailed(String),

    /// Response body did not have the expected shape.
    #[error("Failed to parse provider response: {0}")]
    ParseError(String),

    /// Request timed out.
    #[error("Provider request timed out after {0}ms")]
    Timeout(u64),

    /// Provider is unreachable.
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    /// All retry attempts exhausted.
    #[error("All retry attempts exhausted after {attempts} tries: {last_error}")]
    RetriesExhausted {
        /// How many attempts were made.
        attempts: u32,
        /// The last failure observed.
        last_error: String,
    },

    /// Configuration error.
    #[error("Provider configuration error: {0}")]
    ConfigError(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout(0)
        } else if err.is_connect() {
            LlmError::Unavailable(err.to_string())
        } else {
            LlmError::RequestFailed(err.to_string())
        }
    }
}
