//! Core trait definitions for LLM providers and textbook corpora.
//!
//! `LlmProvider` is implemented by the `oralexam-providers` crate;
//! `Corpus` is implemented here by `ManifestCorpus` and may be implemented
//! by any other store of textbook content.

use async_trait::async_trait;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::ExamError;
use crate::model::{Difficulty, MediaType, SourceMaterial, Topic};

// ---------------------------------------------------------------------------
// LLM Provider trait
// ---------------------------------------------------------------------------

/// Trait for LLM backends that answer a multimodal prompt with text.
///
/// Implementations should return `ProviderError` (wrapped in `anyhow`) for
/// transport and HTTP failures so the gateway can classify them.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Human-readable provider name (e.g. "anthropic").
    fn name(&self) -> &str;

    /// Generate a completion for the request.
    async fn generate(&self, request: &GenerateRequest) -> anyhow::Result<GenerateResponse>;

    /// List available models for this provider.
    fn available_models(&self) -> Vec<ModelInfo>;
}

/// An image sent alongside the prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInput {
    pub media_type: MediaType,
    /// Standard base64 of the image bytes.
    pub data_base64: String,
}

/// Provider-neutral completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Model identifier (e.g. "claude-sonnet-4-20250514").
    pub model: String,
    /// The main prompt.
    pub prompt: String,
    /// Optional system prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Images that accompany the prompt, in order.
    #[serde(default)]
    pub images: Vec<ImageInput>,
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f64,
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Response from an LLM completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    /// The raw response content.
    pub content: String,
    /// Model that actually generated the response.
    pub model: String,
    /// Token usage.
    pub token_usage: TokenUsage,
    /// Latency in milliseconds.
    pub latency_ms: u64,
}

/// Information about an available model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier.
    pub id: String,
    /// Human-readable model name.
    pub name: String,
    /// Provider name.
    pub provider: String,
    /// Maximum context window size in tokens.
    pub max_context: u32,
    /// Whether the model accepts image input.
    pub vision: bool,
}

// ---------------------------------------------------------------------------
// Corpus trait
// ---------------------------------------------------------------------------

/// Restricts which topics a corpus may sample from. Empty lists match all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicFilter {
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub difficulty: Option<Difficulty>,
}

impl TopicFilter {
    pub fn matches(&self, topic: &Topic) -> bool {
        let id_ok = self.topics.is_empty() || self.topics.iter().any(|t| t == &topic.id);
        let category_ok = self.categories.is_empty()
            || topic
                .category
                .as_ref()
                .is_some_and(|c| self.categories.iter().any(|want| want == c));
        let difficulty_ok = self.difficulty.is_none() || topic.difficulty == self.difficulty;
        id_ok && category_ok && difficulty_ok
    }
}

/// Addressable textbook content.
pub trait Corpus: Send + Sync {
    /// All topics, in corpus order.
    fn topics(&self) -> &[Topic];

    /// Pick material at random from topics matching `filter`.
    fn sample(
        &self,
        filter: &TopicFilter,
        rng: &mut dyn RngCore,
    ) -> Result<SourceMaterial, ExamError>;

    /// The primary material of a topic.
    fn get(&self, topic_id: &str) -> Result<SourceMaterial, ExamError>;
}
