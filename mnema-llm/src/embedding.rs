//! Batched embedding client.
//!
//! Validates input before any network call, splits oversized batches into
//! provider-sized chunks, embeds chunks concurrently, and reassembles the
//! results in input order. Each chunk retries independently; one chunk
//! exhausting its budget fails the whole call, since a partial embedding
//! batch is useless to the consolidation pipeline.

use std::time::Duration;

use reqwest::Client;
use serde_json::{Value, json};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use mnema_core::config::ProviderConfig;
use mnema_core::provider::{EmbeddingProvider, ProviderError};

use crate::client::Backend;
use crate::error::LlmError;
use crate::retry::{RetryPolicy, is_retryable_status};

/// Batched embedding client.
#[derive(Debug, Clone)]
pub struct EmbeddingClient {
    backend: Backend,
    http: Client,
    model: String,
    timeout: Duration,
    retry: RetryPolicy,
    max_batch_size: usize,
    max_text_len: usize,
}

impl EmbeddingClient {
    /// Build from the provider section of the mnema config.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::ConfigError`] on invalid backend settings.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, LlmError> {
        Ok(Self {
            backend: Backend::from_config(config)?,
            http: Client::new(),
            model: config.embed_model.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            retry: RetryPolicy::from_config(config),
            max_batch_size: config.max_batch_size.max(1),
            max_text_len: config.max_text_len,
        })
    }

    /// Embed `texts`, returning one vector per input in the same order.
    /// Every vector is resized to exactly `dims` entries.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::InvalidInput`] for an empty batch, a blank
    /// entry, or an entry past the length limit — all checked before any
    /// network traffic. Transport failures surface as
    /// [`LlmError::RetriesExhausted`] once a chunk runs out of attempts.
    pub async fn embed(&self, texts: &[String], dims: usize) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Err(LlmError::InvalidInput("empty embedding batch".to_string()));
        }
        for (i, text) in texts.iter().enumerate() {
            if text.trim().is_empty() {
                return Err(LlmError::InvalidInput(format!("text {i} is blank")));
            }
            if text.chars().count() > self.max_text_len {
                return Err(LlmError::InvalidInput(format!(
                    "text {i} exceeds {} characters",
                    self.max_text_len
                )));
            }
        }

        let chunks = chunk_indices(texts.len(), self.max_batch_size);
        debug!(
            texts = texts.len(),
            chunks = chunks.len(),
            dims,
            "Embedding batch"
        );

        let mut tasks: JoinSet<(usize, Result<Vec<Vec<f32>>, LlmError>)> = JoinSet::new();
        for (chunk_index, range) in chunks.into_iter().enumerate() {
            let client = self.clone();
            let chunk: Vec<String> = texts[range].to_vec();
            tasks.spawn(async move {
                let result = client.embed_chunk(&chunk, dims).await;
                (chunk_index, result)
            });
        }

        let mut per_chunk: Vec<Option<Vec<Vec<f32>>>> = Vec::new();
        per_chunk.resize_with(tasks.len(), || None);
        while let Some(joined) = tasks.join_next().await {
            let (chunk_index, result) =
                joined.map_err(|e| LlmError::RequestFailed(e.to_string()))?;
            per_chunk[chunk_index] = Some(result?);
        }

        let mut vectors = Vec::with_capacity(texts.len());
        for chunk in per_chunk.into_iter().flatten() {
            vectors.extend(chunk);
        }
        Ok(vectors)
    }

    /// Embed one provider-sized chunk with retries.
    async fn embed_chunk(&self, chunk: &[String], dims: usize) -> Result<Vec<Vec<f32>>, LlmError> {
        let (url, body) = match &self.backend {
            Backend::Ollama { base_url } => (
                format!("{base_url}/api/embed"),
                json!({ "model": self.model, "input": chunk }),
            ),
            Backend::OpenAiCompatible { base_url, .. } => (
                format!("{base_url}/v1/embeddings"),
                json!({ "model": self.model, "input": chunk }),
            ),
        };

        let mut last_error = String::new();
        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                debug!(
                    attempt = attempt + 1,
                    max = self.retry.max_attempts,
                    "Retrying embedding call"
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
                        match parse_vectors(&self.backend, &payload, chunk.len(), dims) {
                            Ok(vectors) => return Ok(vectors),
                            // A short or garbled batch sometimes clears up on
                            // retry (model still warming up); treat as transient.
                            Err(LlmError::ParseError(msg)) => {
                                last_error = msg;
                                warn!(error = %last_error, "Malformed embedding response");
                            }
                            Err(other) => return Err(other),
                        }
                    } else if is_retryable_status(status.as_u16()) {
                        last_error = format!("HTTP {status}");
                        warn!(%status, backend = self.backend.name(), "Retryable embedding error");
                    } else {
                        return Err(LlmError::RequestFailed(format!(
                            "HTTP {status}: {}",
                            resp.text().await.unwrap_or_default()
                        )));
                    }
                }
                Err(e) => {
                    last_error = e.to_string();
                    warn!(error = %last_error, "Embedding request failed");
                }
            }
        }

        Err(LlmError::RetriesExhausted {
            attempts: self.retry.max_attempts,
            last_error,
        })
    }
}

/// Split `0..len` into consecutive ranges of at most `max` items.
fn chunk_indices(len: usize, max: usize) -> Vec<std::ops::Range<usize>> {
    let max = max.max(1);
    let mut ranges = Vec::with_capacity(len.div_ceil(max));
    let mut start = 0;
    while start < len {
        let end = (start + max).min(len);
        ranges.push(start..end);
        start = end;
    }
    ranges
}

/// Parse a backend embedding response into `expected` vectors of `dims`
/// entries each, preserving input order.
fn parse_vectors(
    backend: &Backend,
    payload: &Value,
    expected: usize,
    dims: usize,
) -> Result<Vec<Vec<f32>>, LlmError> {
    let mut vectors: Vec<Vec<f32>> = match backend {
        Backend::Ollama { .. } => {
            let rows = payload["embeddings"]
                .as_array()
                .ok_or_else(|| LlmError::ParseError("missing 'embeddings' array".to_string()))?;
            rows.iter().map(parse_row).collect::<Result<_, _>>()?
        }
        Backend::OpenAiCompatible { .. } => {
            let rows = payload["data"]
                .as_array()
                .ok_or_else(|| LlmError::ParseError("missing 'data' array".to_string()))?;
            // The API documents index-ordered data; honor the index anyway.
            let mut indexed: Vec<Option<Vec<f32>>> = vec![None; rows.len()];
            for (fallback, row) in rows.iter().enumerate() {
                let index = row["index"].as_u64().map_or(fallback, |i| i as usize);
                if index >= indexed.len() {
                    return Err(LlmError::ParseError(format!(
                        "embedding index {index} out of range"
                    )));
                }
                indexed[index] = Some(parse_row(&row["embedding"])?);
            }
            indexed
                .into_iter()
                .map(|v| v.ok_or_else(|| LlmError::ParseError("missing embedding row".to_string())))
                .collect::<Result<_, _>>()?
        }
    };

    if vectors.len() != expected {
        return Err(LlmError::ParseError(format!(
            "expected {expected} embeddings, got {}",
            vectors.len()
        )));
    }
    for vector in &mut vectors {
        vector.resize(dims, 0.0);
    }
    Ok(vectors)
}

fn parse_row(row: &Value) -> Result<Vec<f32>, LlmError> {
    row.as_array()
        .ok_or_else(|| LlmError::ParseError("embedding row is not an array".to_string()))?
        .iter()
        .map(|x| {
            x.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| LlmError::ParseError("non-numeric embedding entry".to_string()))
        })
        .collect()
}

impl EmbeddingProvider for EmbeddingClient {
    fn name(&self) -> &str {
        self.backend.name()
    }

    async fn embed(&self, texts: &[String], dims: usize) -> Result<Vec<Vec<f32>>, ProviderError> {
        EmbeddingClient::embed(self, texts, dims)
            .await
            .map_err(|e| ProviderError::new(self.backend.name(), e.to_string()))
    }
}
