//! Scripted provider and fixtures shared by the core unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::model::{Attachment, MediaType, SourceMaterial, Topic};
use crate::rubric::{RubricSpec, SubPoint};
use crate::traits::{GenerateRequest, GenerateResponse, LlmProvider, ModelInfo, TokenUsage};

/// One scripted reply.
pub enum Step {
    Reply(String),
    Fail(ProviderError),
    /// Sleep, then reply (for cancellation tests).
    Slow(Duration, String),
}

/// Replays a fixed script, then repeats the fallback forever.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Step>>,
    fallback: Box<dyn Fn() -> Step + Send + Sync>,
    calls: AtomicU32,
    requests: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Step>) -> Self {
        Self::with_fallback(script, || {
            Step::Fail(ProviderError::NetworkError("script exhausted".into()))
        })
    }

    pub fn with_fallback(
        script: Vec<Step>,
        fallback: impl Fn() -> Step + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: Box::new(fallback),
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, request: &GenerateRequest) -> anyhow::Result<GenerateResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| (self.fallback)());

        let content = match step {
            Step::Reply(text) => text,
            Step::Fail(err) => return Err(err.into()),
            Step::Slow(delay, text) => {
                tokio::time::sleep(delay).await;
                text
            }
        };

        Ok(GenerateResponse {
            content,
            model: request.model.clone(),
            token_usage: TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
            latency_ms: 1,
        })
    }

    fn available_models(&self) -> Vec<ModelInfo> {
        Vec::new()
    }
}

pub fn unavailable() -> ProviderError {
    ProviderError::ApiError {
        status: 503,
        message: "overloaded".into(),
    }
}

pub fn verdict_7_of_10() -> String {
    "Point 2 is wrong.\n```json\n{\"score\": \"7/10\", \"flags\": [true, false], \"corrections\": \"point 2 is wrong because the second stage starts at full dilation\"}\n```"
        .to_string()
}

pub fn topic(id: &str) -> Topic {
    Topic {
        id: id.into(),
        title: format!("Topic {id}"),
        category: Some("obstetrics".into()),
        difficulty: None,
    }
}

pub fn material_with_image(id: &str, bytes: usize) -> SourceMaterial {
    SourceMaterial {
        id: format!("{id}#p1"),
        topic: topic(id),
        excerpt: Some(format!("Excerpt about {id}.")),
        page: Some(1),
        attachments: vec![Attachment::new(
            format!("{id}.png"),
            MediaType::Png,
            vec![7; bytes],
        )],
    }
}

/// Rubric with two sub-points on a 0..=10 scale, matching `verdict_7_of_10`.
pub fn two_point_rubric() -> RubricSpec {
    RubricSpec {
        version: "test-v1".into(),
        name: String::new(),
        scale_max: 10.0,
        sub_points: vec![
            SubPoint {
                id: "point1".into(),
                description: String::new(),
            },
            SubPoint {
                id: "point2".into(),
                description: String::new(),
            },
        ],
        instructions: "Grade.\n{question}\n{answer}".into(),
    }
}
