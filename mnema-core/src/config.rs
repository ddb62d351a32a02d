//! Configuration for the mnema consolidation engine.
//!
//! Maps directly to `mnema.toml`. Every field has a serde default so a
//! partial (or empty) TOML file yields a working configuration.

use serde::{Deserialize, Serialize};

/// Top-level mnema configuration, loadable from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MnemaConfig {
    /// Consolidation pipeline tuning.
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
    /// Provider endpoints, models and retry policy.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// SQLite store settings.
    #[serde(default)]
    pub store: StoreConfig,
}

impl MnemaConfig {
    /// Load configuration from a TOML string.
    ///
    /// # Errors
    /// Returns `MnemaError::Config` if the TOML is invalid.
    pub fn from_toml(toml_str: &str) -> crate::error::Result<Self> {
        toml::from_str(toml_str).map_err(|e| crate::MnemaError::Config(e.to_string()))
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Tuning for one consolidation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    /// Embedding dimensionality. Constant per user; vectors are resized to
    /// this at the provider boundary.
    #[serde(default = "default_dims")]
    pub embedding_dims: usize,
    /// Neighbors fetched per fact during dedup.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Similarity floor for "this is probably the same underlying fact".
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            embedding_dims: default_dims(),
            top_k: default_top_k(),
            min_similarity: default_min_similarity(),
        }
    }
}

/// Remote model provider settings, consumed by `mnema-llm` clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Backend kind: "ollama" or "openai" (OpenAI-compatible).
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Base URL of the provider.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// API key for OpenAI-compatible backends.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Chat/completion model used for extraction and adjudication.
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    /// Embedding model.
    #[serde(default = "default_embed_model")]
    pub embed_model: String,
    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Provider's maximum embedding batch size; larger inputs are chunked.
    #[serde(default = "default_max_batch")]
    pub max_batch_size: usize,
    /// Maximum accepted length of a single text to embed, in characters.
    #[serde(default = "default_max_text_len")]
    pub max_text_len: usize,
    /// Maximum attempts per provider call (first try included).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base retry delay in milliseconds (doubles per attempt).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Retry delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            base_url: default_base_url(),
            api_key: None,
            chat_model: default_chat_model(),
            embed_model: default_embed_model(),
            timeout_ms: default_timeout_ms(),
            max_batch_size: default_max_batch(),
            max_text_len: default_max_text_len(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// SQLite store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Enable WAL mode for concurrent reads.
    #[serde(default = "default_true")]
    pub wal_mode: bool,
    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            wal_mode: true,
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

fn default_dims() -> usize {
    768
}
fn default_top_k() -> usize {
    5
}
fn default_min_similarity() -> f32 {
    0.7
}
fn default_backend() -> String {
    "ollama".to_string()
}
fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_chat_model() -> String {
    "llama3.1:8b".to_string()
}
fn default_embed_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_max_batch() -> usize {
    64
}
fn default_max_text_len() -> usize {
    8_192
}
fn default_max_attempts() -> u32 {
    4
}
fn default_base_delay_ms() -> u64 {
    500
}
fn default_max_delay_ms() -> u64 {
    8_000
}
fn default_busy_timeout() -> u64 {
    5_000
}
fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
