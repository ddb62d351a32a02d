//! Structured completion client — Ollama and OpenAI-compatible backends.
//!
//! `complete(prompt, schema)` sends one chat request constrained to a JSON
//! schema and returns the raw JSON text; the caller parses and validates
//! it. Transient failures (network, timeout, 429/5xx) retry under the
//! crate's backoff policy; other HTTP errors fail immediately.

use std::time::Duration;

use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, warn};

use mnema_core::config::ProviderConfig;
use mnema_core::provider::{CompletionProvider, ProviderError};

use crate::error::LlmError;
use crate::retry::{RetryPolicy, is_retryable_status};

/// Provider backend for chat and embedding requests.
#[derive(Debug, Clone)]
pub enum Backend {
    /// Ollama running locally (recommended).
    Ollama {
        /// Base URL, e.g. `http://localhost:11434`.
        base_url: String,
    },
    /// OpenAI-compatible API (also works with Together, Groq, etc.).
    OpenAiCompatible {
        /// Base URL, e.g. `https://api.openai.com`.
        base_url: String,
        /// Bearer token.
        api_key: String,
    },
}

impl Backend {
    /// Build from the provider section of the mnema config.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::ConfigError`] for unknown backend kinds or an
    /// OpenAI-compatible backend without an API key.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, LlmError> {
        match config.backend.as_str() {
            "ollama" => Ok(Backend::Ollama {
                base_url: config.base_url.clone(),
            }),
            "openai" => {
                let api_key = config.api_key.clone().ok_or_else(|| {
                    LlmError::ConfigError("openai backend requires an api_key".to_string())
                })?;
                Ok(Backend::OpenAiCompatible {
                    base_url: config.base_url.clone(),
                    api_key,
                })
            }
            other => Err(LlmError::ConfigError(format!(
                "unknown backend '{other}' (expected 'ollama' or 'openai')"
            ))),
        }
    }

    /// Short backend name for logs and error context.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Ollama { .. } => "ollama",
            Backend::OpenAiCompatible { .. } => "openai",
        }
    }
}

/// Structured completion client.
#[derive(Debug, Clone)]
pub struct ChatClient {
    backend: Backend,
    http: Client,
    model: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl ChatClient {
    /// Create a new chat client.
    #[must_use]
    pub fn new(
        backend: Backend,
        model: impl Into<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            backend,
            http: Client::new(),
            model: model.into(),
            timeout,
            retry,
        }
    }

    /// Build from the provider section of the mnema config.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::ConfigError`] on invalid backend settings.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, LlmError> {
        Ok(Self::new(
            Backend::from_config(config)?,
            config.chat_model.clone(),
            Duration::from_millis(config.timeout_ms),
            RetryPolicy::from_config(config),
        ))
    }

    /// Send `prompt` constrained to `schema` and return the raw JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::RetriesExhausted`] after the retry budget, or
    /// an immediate error for non-retryable failures.
    pub async fn complete(&self, prompt: &str, schema: &Value) -> Result<String, LlmError> {
        let (url, body) = match &self.backend {
            Backend::Ollama { base_url } => (
                format!("{base_url}/api/chat"),
                json!({
                    "model": self.model,
                    "messages": [{ "role": "user", "content": prompt }],
                    "stream": false,
                    "format": schema,
                    "options": { "temperature": 0.0 }
                }),
            ),
            Backend::OpenAiCompatible { base_url, .. } => (
                format!("{base_url}/v1/chat/completions"),
                json!({
                    "model": self.model,
                    "messages": [{ "role": "user", "content": prompt }],
                    "temperature": 0.0,
                    "response_format": {
                        "type": "json_schema",
                        "json_schema": { "name": "response", "schema": schema }
                    }
                }),
            ),
        };

        let mut last_error = String::new();
        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                debug!(
                    attempt = attempt + 1,
                    max = self.retry.max_attempts,
                    "Retrying completion call"
                );
                self.retry.backoff(attempt - 1).await;
            }

            let mut request = self.http.post(&url).json(&body).timeout(self.timeout);
            if let Backend::OpenAiCompatible { api_key, .. } = &self.backend {
                request = request.bearer_auth(api_key);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let payload: Value = resp
                            .json()
                            .await
                            .map_err(|e| LlmError::ParseError(e.to_string()))?;
                        return extract_content(&self.backend, &payload);
                    }
                    if is_retryable_status(status.as_u16()) {
                        last_error = format!("HTTP {status}");
                        warn!(%status, backend = self.backend.name(), "Retryable completion error");
                    } else {
                        return Err(LlmError::RequestFailed(format!(
                            "HTTP {status}: {}",
                            resp.text().await.unwrap_or_default()
                        )));
                    }
                }
                Err(e) => {
                    last_error = e.to_string();
                    if e.is_timeout() {
                        warn!(
                            timeout_ms = self.timeout.as_millis() as u64,
                            "Completion request timed out"
                        );
                    } else {
                        warn!(error = %last_error, "Completion request failed");
                    }
                }
            }
        }

        Err(LlmError::RetriesExhausted {
            attempts: self.retry.max_attempts,
            last_error,
        })
    }
}

/// Pull the generated text out of a backend-specific response body.
fn extract_content(backend: &Backend, payload: &Value) -> Result<String, LlmError> {
    let content = match backend {
        Backend::Ollama { .. } => payload["message"]["content"].as_str(),
        Backend::OpenAiCompatible { .. } => payload["choices"][0]["message"]["content"].as_str(),
    };
    content
        .map(str::to_string)
        .ok_or_else(|| LlmError::ParseError(format!("missing completion text in: {payload}")))
}

impl CompletionProvider for ChatClient {
    fn name(&self) -> &str {
        self.backend.name()
    }

    async fn complete(&self, prompt: &str, schema: &Value) -> Result<String, ProviderError> {
        ChatClient::complete(self, prompt, schema)
            .await
            .map_err(|e| ProviderError::new(self.backend.name(), e.to_string()))
    }
}
