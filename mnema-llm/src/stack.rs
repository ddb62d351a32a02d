//! Combined provider stack.
//!
//! Bundles a chat client and an embedding client built from one
//! [`ProviderConfig`], so a consolidator can be wired with a single value
//! that serves both provider seams.

use serde_json::Value;

use mnema_core::config::ProviderConfig;
use mnema_core::provider::{CompletionProvider, EmbeddingProvider, ProviderError};

use crate::client::ChatClient;
use crate::embedding::EmbeddingClient;
use crate::error::LlmError;

/// Chat + embedding clients sharing one backend configuration.
#[derive(Debug, Clone)]
pub struct ProviderStack {
    chat: ChatClient,
    embedding: EmbeddingClient,
}

impl ProviderStack {
    /// Build both clients from the provider section of the mnema config.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::ConfigError`] on invalid backend settings.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, LlmError> {
        Ok(Self {
            chat: ChatClient::from_config(config)?,
            embedding: EmbeddingClient::from_config(config)?,
        })
    }

    /// The structured-completion half of the stack.
    #[must_use]
    pub fn chat(&self) -> &ChatClient {
        &self.chat
    }

    /// The embedding half of the stack.
    #[must_use]
    pub fn embedding(&self) -> &EmbeddingClient {
        &self.embedding
    }
}

impl CompletionProvider for ProviderStack {
    fn name(&self) -> &str {
        CompletionProvider::name(&self.chat)
    }

    async fn complete(&self, prompt: &str, schema: &Value) -> Result<String, ProviderError> {
        CompletionProvider::complete(&self.chat, prompt, schema).await
    }
}

impl EmbeddingProvider for ProviderStack {
    fn name(&self) -> &str {
        EmbeddingProvider::name(&self.embedding)
    }

    async fn embed(&self, texts: &[String], dims: usize) -> Result<Vec<Vec<f32>>, ProviderError> {
        EmbeddingProvider::embed(&self.embedding, texts, dims).await
    }
}
