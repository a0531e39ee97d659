//! Model gateway: the only component that talks to the model service.
//!
//! Owns retries with exponential backoff, response-shape validation and
//! caller cancellation. Composition stays in `composer`, rubric checks in
//! `evaluator`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::cancel::CancelToken;
use crate::composer::ModelRequest;
use crate::error::{ExamError, ProviderError, Stage};
use crate::evaluator::parse_verdict;
use crate::traits::{GenerateRequest, GenerateResponse, ImageInput, LlmProvider, TokenUsage};

/// Retry, backoff and sampling parameters for model calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Total attempts per call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound for any single delay, including retry-after hints.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Per-attempt timeout; `None` leaves it to the provider's HTTP client.
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: Option<u64>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Sampling temperature (0.0 keeps grading as repeatable as the model allows).
    #[serde(default)]
    pub temperature: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_attempt_timeout_secs() -> Option<u64> {
    Some(120)
}
fn default_max_tokens() -> u32 {
    2048
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            max_tokens: default_max_tokens(),
            temperature: 0.0,
        }
    }
}

/// A model reply that passed shape validation for its stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub stage: Stage,
    pub text: String,
    pub model: String,
    pub usage: TokenUsage,
    /// Attempts used, 1-based.
    pub attempts: u32,
    /// Wall-clock time across all attempts.
    pub latency_ms: u64,
}

/// How a failed attempt should be handled.
enum Failure {
    Permanent(String),
    Transient {
        message: String,
        rate_limited: bool,
        retry_after: Option<Duration>,
    },
    BadBody(String),
}

fn classify(err: anyhow::Error) -> Failure {
    match err.downcast_ref::<ProviderError>() {
        Some(p) if p.is_permanent() => Failure::Permanent(p.to_string()),
        Some(p) if matches!(p, ProviderError::MalformedBody(_)) => Failure::BadBody(p.to_string()),
        Some(p) => Failure::Transient {
            message: p.to_string(),
            rate_limited: matches!(p, ProviderError::RateLimited { .. }),
            retry_after: p.retry_after_ms().map(Duration::from_millis),
        },
        // Untyped failures are treated like network trouble.
        None => Failure::Transient {
            message: format!("{err:#}"),
            rate_limited: false,
            retry_after: None,
        },
    }
}

/// Sends composed requests to one provider/model pair.
pub struct ModelGateway {
    provider: Arc<dyn LlmProvider>,
    model: String,
    settings: GatewaySettings,
}

impl ModelGateway {
    pub fn new(provider: Arc<dyn LlmProvider>, model: impl Into<String>, settings: GatewaySettings) -> Self {
        Self {
            provider,
            model: model.into(),
            settings,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    /// Send `request`, retrying transient failures, and validate the reply.
    #[instrument(skip(self, request, cancel), fields(provider = self.provider.name(), model = %self.model))]
    pub async fn invoke(
        &self,
        request: &ModelRequest,
        stage: Stage,
        cancel: &CancelToken,
    ) -> Result<ModelResponse, ExamError> {
        if request.stage != stage {
            return Err(ExamError::InvalidRequest {
                stage,
                message: format!("request was composed for the {} stage", request.stage),
            });
        }

        let generate = self.to_generate_request(request);
        let started = Instant::now();
        let max_attempts = self.settings.max_attempts.max(1);
        let max_backoff = Duration::from_millis(self.settings.max_backoff_ms);
        let mut backoff = Duration::from_millis(self.settings.initial_backoff_ms).min(max_backoff);
        let mut last_message = String::new();
        let mut last_rate_limited = false;

        for attempt in 1..=max_attempts {
            if let Some(reason) = cancel.check() {
                return Err(ExamError::Cancelled { stage, reason });
            }

            tracing::debug!(%stage, attempt, max_attempts, "invoking model");
            let outcome = tokio::select! {
                biased;
                reason = cancel.cancelled() => return Err(ExamError::Cancelled { stage, reason }),
                outcome = self.attempt(&generate) => outcome,
            };

            let err = match outcome {
                Ok(response) => return self.validate(response, stage, attempt, started),
                Err(err) => err,
            };

            let (message, rate_limited, retry_after) = match classify(err) {
                Failure::Permanent(message) => {
                    tracing::warn!(%stage, attempt, error = %message, "model service rejected request");
                    return Err(ExamError::InvalidRequest { stage, message });
                }
                Failure::BadBody(reason) => {
                    return Err(ExamError::InvalidResponse { stage, reason });
                }
                Failure::Transient {
                    message,
                    rate_limited,
                    retry_after,
                } => (message, rate_limited, retry_after),
            };
            last_message = message;
            last_rate_limited = rate_limited;

            if attempt == max_attempts {
                break;
            }

            let wait = retry_after.unwrap_or(backoff).min(max_backoff);
            tracing::warn!(
                %stage,
                attempt,
                delay_ms = wait.as_millis() as u64,
                error = %last_message,
                "transient model failure, retrying"
            );
            tokio::select! {
                biased;
                reason = cancel.cancelled() => return Err(ExamError::Cancelled { stage, reason }),
                () = tokio::time::sleep(wait) => {}
            }
            backoff = next_backoff(backoff, self.settings.backoff_multiplier, max_backoff);
        }

        tracing::error!(%stage, attempts = max_attempts, error = %last_message, "model retries exhausted");
        if last_rate_limited {
            Err(ExamError::RateLimited {
                stage,
                attempts: max_attempts,
            })
        } else {
            Err(ExamError::ServiceUnavailable {
                stage,
                attempts: max_attempts,
                last_error: last_message,
            })
        }
    }

    async fn attempt(&self, request: &GenerateRequest) -> anyhow::Result<GenerateResponse> {
        match self.settings.attempt_timeout_secs {
            Some(secs) => tokio::time::timeout(
                Duration::from_secs(secs),
                self.provider.generate(request),
            )
            .await
            .map_err(|_| ProviderError::Timeout(secs))?,
            None => self.provider.generate(request).await,
        }
    }

    fn validate(
        &self,
        response: GenerateResponse,
        stage: Stage,
        attempts: u32,
        started: Instant,
    ) -> Result<ModelResponse, ExamError> {
        match stage {
            Stage::Question if response.content.trim().is_empty() => {
                return Err(ExamError::InvalidResponse {
                    stage,
                    reason: "question text is empty".into(),
                });
            }
            Stage::Grading => {
                parse_verdict(&response.content)
                    .map_err(|reason| ExamError::InvalidResponse { stage, reason })?;
            }
            Stage::Question => {}
        }

        Ok(ModelResponse {
            stage,
            text: response.content,
            model: response.model,
            usage: response.token_usage,
            attempts,
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn to_generate_request(&self, request: &ModelRequest) -> GenerateRequest {
        GenerateRequest {
            model: self.model.clone(),
            prompt: request.prompt.clone(),
            system_prompt: Some(request.system.clone()),
            images: request
                .attachments
                .iter()
                .map(|a| ImageInput {
                    media_type: a.media_type,
                    data_base64: a.to_base64(),
                })
                .collect(),
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        }
    }
}

fn next_backoff(current: Duration, multiplier: f64, max: Duration) -> Duration {
    let factor = if multiplier.is_finite() && multiplier >= 1.0 {
        multiplier
    } else {
        1.0
    };
    Duration::try_from_secs_f64(current.as_secs_f64() * factor).map_or(max, |next| next.min(max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_pair;
    use crate::error::CancelReason;
    use crate::model::{Attachment, MediaType};
    use crate::test_support::{unavailable, verdict_7_of_10, ScriptedProvider, Step};

    fn settings() -> GatewaySettings {
        GatewaySettings {
            max_attempts: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 10_000,
            backoff_multiplier: 2.0,
            attempt_timeout_secs: None,
            max_tokens: 256,
            temperature: 0.0,
        }
    }

    fn question_request() -> ModelRequest {
        ModelRequest {
            stage: Stage::Question,
            system: "sys".into(),
            prompt: "Ask something".into(),
            attachments: vec![Attachment::new("fig.png", MediaType::Png, vec![1, 2, 3])],
            rubric_version: None,
        }
    }

    fn grading_request() -> ModelRequest {
        ModelRequest {
            stage: Stage::Grading,
            system: "sys".into(),
            prompt: "Grade this".into(),
            attachments: vec![],
            rubric_version: Some("v1".into()),
        }
    }

    fn gateway(provider: &Arc<ScriptedProvider>) -> ModelGateway {
        ModelGateway::new(provider.clone(), "test-model", settings())
    }

    #[tokio::test(start_paused = true)]
    async fn first_attempt_success() {
        let provider = Arc::new(ScriptedProvider::new(vec![Step::Reply("What is X?".into())]));
        let response = gateway(&provider)
            .invoke(&question_request(), Stage::Question, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(response.text, "What is X?");
        assert_eq!(response.attempts, 1);
        assert_eq!(response.usage.total_tokens, 15);

        let sent = provider.requests();
        assert_eq!(sent[0].model, "test-model");
        assert_eq!(sent[0].images.len(), 1);
        assert_eq!(sent[0].images[0].data_base64, "AQID");
        assert_eq!(sent[0].system_prompt.as_deref(), Some("sys"));
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_last_allowed_attempt() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Step::Fail(unavailable()),
            Step::Fail(ProviderError::Timeout(30)),
            Step::Reply("What is Y?".into()),
        ]));
        let response = gateway(&provider)
            .invoke(&question_request(), Stage::Question, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(response.attempts, 3);
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_exactly_max_attempts() {
        let provider = Arc::new(ScriptedProvider::with_fallback(vec![], || {
            Step::Fail(unavailable())
        }));
        let start = tokio::time::Instant::now();
        let err = gateway(&provider)
            .invoke(&question_request(), Stage::Question, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExamError::ServiceUnavailable { attempts: 3, stage: Stage::Question, .. }
        ));
        assert_eq!(provider.call_count(), 3);
        // 1s + 2s of backoff between three attempts.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_surfaces_after_exhaustion() {
        let provider = Arc::new(ScriptedProvider::with_fallback(vec![], || {
            Step::Fail(ProviderError::RateLimited {
                retry_after_ms: 4000,
            })
        }));
        let start = tokio::time::Instant::now();
        let err = gateway(&provider)
            .invoke(&question_request(), Stage::Question, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, ExamError::RateLimited { attempts: 3, .. }));
        assert_eq!(provider.call_count(), 3);
        // retry-after hint replaces the computed backoff.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(8) && elapsed < Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_is_capped() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Step::Fail(ProviderError::RateLimited {
                retry_after_ms: 600_000,
            }),
            Step::Reply("Q".into()),
        ]));
        let start = tokio::time::Instant::now();
        gateway(&provider)
            .invoke(&question_request(), Stage::Question, &CancelToken::never())
            .await
            .unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_request_not_retried() {
        let provider = Arc::new(ScriptedProvider::with_fallback(vec![], || {
            Step::Fail(ProviderError::ApiError {
                status: 400,
                message: "image too large".into(),
            })
        }));
        let err = gateway(&provider)
            .invoke(&question_request(), Stage::Question, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, ExamError::InvalidRequest { .. }));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_question_is_invalid_response() {
        let provider = Arc::new(ScriptedProvider::new(vec![Step::Reply("   \n".into())]));
        let err = gateway(&provider)
            .invoke(&question_request(), Stage::Question, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, ExamError::InvalidResponse { stage: Stage::Question, .. }));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn grading_requires_verdict_block() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Step::Reply("Looks right to me!".into()),
            Step::Reply(verdict_7_of_10()),
        ]));
        let gw = gateway(&provider);
        let err = gw
            .invoke(&grading_request(), Stage::Grading, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, ExamError::InvalidResponse { stage: Stage::Grading, .. }));

        let ok = gw
            .invoke(&grading_request(), Stage::Grading, &CancelToken::never())
            .await
            .unwrap();
        assert!(ok.text.contains("7/10"));
    }

    #[tokio::test(start_paused = true)]
    async fn stage_mismatch_rejected_before_network() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let err = gateway(&provider)
            .invoke(&grading_request(), Stage::Question, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, ExamError::InvalidRequest { .. }));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_honored_mid_backoff() {
        let provider = Arc::new(ScriptedProvider::with_fallback(vec![], || {
            Step::Fail(unavailable())
        }));
        // Attempt 1 at t=0, attempt 2 at t=1s, then a 2s backoff that the deadline cuts short.
        let token = CancelToken::never().with_timeout(Duration::from_millis(1500));
        let err = gateway(&provider)
            .invoke(&question_request(), Stage::Question, &token)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExamError::Cancelled {
                reason: CancelReason::DeadlineExceeded,
                ..
            }
        ));
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_attempt() {
        let provider = Arc::new(ScriptedProvider::new(vec![Step::Slow(
            Duration::from_secs(60),
            "late".into(),
        )]));
        let gw = gateway(&provider);
        let (handle, token) = cancel_pair();
        let canceller = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            handle.cancel();
        };
        let request = question_request();
        let (result, ()) = tokio::join!(
            gw.invoke(&request, Stage::Question, &token),
            canceller
        );
        assert!(matches!(
            result,
            Err(ExamError::Cancelled {
                reason: CancelReason::Requested,
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn already_cancelled_makes_no_call() {
        let provider = Arc::new(ScriptedProvider::new(vec![Step::Reply("Q".into())]));
        let (handle, token) = cancel_pair();
        handle.cancel();
        let err = gateway(&provider)
            .invoke(&question_request(), Stage::Question, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, ExamError::Cancelled { .. }));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_is_transient() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Step::Slow(Duration::from_secs(600), "too late".into()),
            Step::Reply("Q".into()),
        ]));
        let mut s = settings();
        s.attempt_timeout_secs = Some(5);
        let gw = ModelGateway::new(provider.clone(), "m", s);
        let response = gw
            .invoke(&question_request(), Stage::Question, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(response.attempts, 2);
    }

    #[test]
    fn backoff_growth_is_capped() {
        let max = Duration::from_secs(5);
        assert_eq!(
            next_backoff(Duration::from_secs(2), 2.0, max),
            Duration::from_secs(4)
        );
        assert_eq!(next_backoff(Duration::from_secs(4), 2.0, max), max);
        assert_eq!(
            next_backoff(Duration::from_secs(1), 0.5, max),
            Duration::from_secs(1)
        );
        assert_eq!(next_backoff(Duration::from_secs(1), 1e300, max), max);
        assert_eq!(next_backoff(Duration::MAX, 2.0, max), max);
    }
}
