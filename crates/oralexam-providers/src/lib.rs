//! oralexam-providers — LLM provider integrations.
//!
//! Implements the `LlmProvider` trait for Anthropic, OpenAI and Ollama
//! (all with image input), plus an offline mock, and loads the
//! `oralexam.toml` configuration.

pub mod anthropic;
pub mod config;
pub mod error;
pub mod mock;
pub mod ollama;
pub mod openai;

pub use config::{create_provider, load_config, load_config_from, OralExamConfig, ProviderConfig};
pub use error::ProviderError;
