//! Collaborator seams for the consolidation engine.
//!
//! The orchestrator talks to two remote collaborators: a structured
//! completion model and a text embedding model. Both sit behind narrow
//! traits so the engine can be driven by real HTTP clients (`mnema-llm`)
//! or by scripted fakes in tests. Retry, batching, and input validation
//! live behind these traits; by the time an error crosses this boundary
//! the retry budget is spent.

use std::future::Future;

use thiserror::Error;

/// Pipeline stage identifier, attached to provider failures for diagnosis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Fact extraction from the transcript.
    Extraction,
    /// Text embedding of fact candidates.
    Embedding,
    /// ADD/UPDATE adjudication over the unified namespace.
    Adjudication,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Extraction => write!(f, "extraction"),
            Stage::Embedding => write!(f, "embedding"),
            Stage::Adjudication => write!(f, "adjudication"),
        }
    }
}

/// A failed provider call, carrying the provider name for logging.
#[derive(Debug, Error)]
#[error("{provider}: {message}")]
pub struct ProviderError {
    /// Provider name (e.g. "ollama", "openai").
    pub provider: String,
    /// Flattened failure detail.
    pub message: String,
}

impl ProviderError {
    /// Create a new provider error.
    pub fn new(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

/// A structured completion model: prompt in, schema-conforming JSON out.
///
/// Implementations return the raw JSON text; the caller parses and
/// validates it against the expected shape.
pub trait CompletionProvider: Send + Sync {
    /// Provider name for logs and error context.
    fn name(&self) -> &str;

    /// Send `prompt` with an expected JSON output `schema` and return the
    /// model's raw JSON text.
    fn complete(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
    ) -> impl Future<Output = std::result::Result<String, ProviderError>> + Send;
}

/// A text embedding model: texts in, one fixed-dimension vector per text,
/// order-preserving.
pub trait EmbeddingProvider: Send + Sync {
    /// Provider name for logs and error context.
    fn name(&self) -> &str;

    /// Embed each text into a `dims`-dimension vector.
    fn embed(
        &self,
        texts: &[String],
        dims: usize,
    ) -> impl Future<Output = std::result::Result<Vec<Vec<f32>>, ProviderError>> + Send;
}
