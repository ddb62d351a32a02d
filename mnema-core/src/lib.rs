//! # mnema Core Library
//!
//! Memory consolidation engine for conversational agents: continuously
//! distill long-running chat transcripts into a compact, deduplicated
//! store of long-term facts ("memories") about a user.
//!
//! One consolidation run:
//!
//! 1. Pulls a user's unextracted messages from the [`store::Store`]
//! 2. Extracts atomic facts via a structured completion model
//! 3. Embeds the facts and searches for semantically similar memories
//! 4. Asks the model to adjudicate ADD vs UPDATE per candidate
//! 5. Applies decisions and marks the source messages extracted, once
//!
//! The remote collaborators (embedding, structured completion) live
//! behind the traits in [`provider`]; `mnema-llm` supplies HTTP-backed
//! implementations.

#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod consolidation;
pub mod error;
pub mod prompt;
pub mod provider;
pub mod search;
pub mod store;
pub mod types;

pub use config::MnemaConfig;
pub use consolidation::Consolidator;
pub use error::MnemaError;
pub use store::Store;
pub use types::*;
