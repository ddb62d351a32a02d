//! # mnema-llm — HTTP provider clients for mnema
//!
//! Implements the `mnema-core` provider traits over real model APIs:
//!   - **Ollama** (local, recommended default)
//!   - **OpenAI-compatible API** (also works with Together, Groq, etc.)
//!
//! All remote calls in mnema go through this crate, ensuring:
//!   - Structured output enforcement (JSON schema constrained decoding)
//!   - Timeout management
//!   - Retry with exponential backoff and jitter
//!   - Input validation before any network traffic
//!
//! [`ProviderStack`] bundles one chat client and one embedding client built
//! from a single config section, ready to hand to a consolidator.

pub mod client;
pub mod embedding;
pub mod error;
pub mod retry;
pub mod stack;

pub use client::{Backend, ChatClient};
pub use embedding::EmbeddingClient;
pub use error::LlmError;
pub use retry::RetryPolicy;
pub use stack::ProviderStack;
