//! Error types for the mnema core library.

use thiserror::Error;

use crate::provider::{ProviderError, Stage};

/// Top-level error type for all mnema operations.
#[derive(Error, Debug)]
pub enum MnemaError {
    /// Input rejected before any network or database call.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A remote provider call failed (after retries, where applicable).
    #[error("Provider '{provider}' failed during {stage}: {message}")]
    Provider {
        /// Which provider failed.
        provider: String,
        /// Which pipeline stage was running.
        stage: Stage,
        /// The underlying failure, flattened for logging.
        message: String,
    },

    /// Model output failed to parse or validate against its schema.
    #[error("Malformed model output during {stage}: {message}")]
    MalformedOutput {
        /// Which pipeline stage produced the output.
        stage: Stage,
        /// Parse/validation failure detail.
        message: String,
    },

    /// A memory with the given ID was not found.
    #[error("Memory not found: {0}")]
    MemoryNotFound(crate::MemoryId),

    /// SQLite persistence error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization or deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A spawned task panicked or was cancelled.
    #[error("Task failed: {0}")]
    Task(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MnemaError {
    /// Wrap a [`ProviderError`] with the pipeline stage that issued the call.
    #[must_use]
    pub fn provider(stage: Stage, err: ProviderError) -> Self {
        Self::Provider {
            provider: err.provider,
            stage,
            message: err.message,
        }
    }
}

/// Convenience Result type alias.
pub type Result<T> = std::result::Result<T, MnemaError>;
