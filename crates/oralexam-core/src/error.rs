//! Error types for the exam pipeline.
//!
//! `ProviderError` is the typed transport failure that provider adapters
//! return. It lives here so the gateway can downcast and classify errors
//! for retry decisions without string matching. `ExamError` is the
//! pipeline-level taxonomy surfaced to callers, and `SessionError` adds the
//! stage and turn it happened on.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur when interacting with an LLM provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The API returned a 429 rate limit response.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Authentication failed (invalid API key).
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The requested model was not found.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// The API returned an error response.
    #[error("API error (HTTP {status}): {message}")]
    ApiError { status: u16, message: String },

    /// The request timed out.
    #[error("request timed out after {0}s")]
    Timeout(u64),

    /// A network error occurred.
    #[error("network error: {0}")]
    NetworkError(String),

    /// The response body did not match the provider's schema.
    #[error("unexpected response body: {0}")]
    MalformedBody(String),
}

impl ProviderError {
    /// Returns `true` if this error is permanent and should not be retried.
    pub fn is_permanent(&self) -> bool {
        match self {
            ProviderError::AuthenticationFailed(_) | ProviderError::ModelNotFound(_) => true,
            ProviderError::ApiError { status, .. } => {
                (400..500).contains(status) && *status != 408 && *status != 429
            }
            _ => false,
        }
    }

    /// Returns `true` for failures worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. }
            | ProviderError::Timeout(_)
            | ProviderError::NetworkError(_) => true,
            ProviderError::ApiError { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            _ => false,
        }
    }

    /// Returns the retry-after delay in milliseconds, if applicable.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            ProviderError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

/// Pipeline stage a model call or failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Question,
    Grading,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Question => write!(f, "question"),
            Stage::Grading => write!(f, "grading"),
        }
    }
}

/// Why an in-flight call was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller fired its cancel handle.
    Requested,
    /// The caller-supplied deadline elapsed.
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Requested => write!(f, "cancelled by caller"),
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// Failures of the question/answer/grading pipeline.
#[derive(Debug, Error)]
pub enum ExamError {
    /// The corpus has nothing matching the request.
    #[error("no corpus material found: {0}")]
    NotFound(String),

    /// An attachment violates the configured limits.
    #[error("unsupported attachment '{name}': {reason}")]
    UnsupportedAttachment { name: String, reason: String },

    /// The model service rejected the request; retrying will not help.
    #[error("{stage} request rejected by model service: {message}")]
    InvalidRequest { stage: Stage, message: String },

    /// Still rate limited after the local retry budget was spent.
    #[error("{stage} request rate limited after {attempts} attempt(s)")]
    RateLimited { stage: Stage, attempts: u32 },

    /// Transient failures exhausted the local retry budget.
    #[error("model service unavailable for {stage} after {attempts} attempt(s): {last_error}")]
    ServiceUnavailable {
        stage: Stage,
        attempts: u32,
        last_error: String,
    },

    /// The model replied with something that lacks the expected shape.
    #[error("invalid {stage} response: {reason}")]
    InvalidResponse { stage: Stage, reason: String },

    /// The verdict parsed but breaks a rubric invariant.
    #[error("malformed grade: {reason}")]
    MalformedGrade { reason: String },

    /// An answer does not belong to the current turn, or the turn is already answered.
    #[error("turn mismatch on turn {turn}: {reason}")]
    TurnMismatch { turn: u32, reason: String },

    /// A command arrived in a state that does not accept it.
    #[error("cannot {command} while session is {state}")]
    InvalidTransition {
        command: &'static str,
        state: String,
    },

    /// The caller cancelled the call or its deadline passed.
    #[error("{stage} call {reason}")]
    Cancelled { stage: Stage, reason: CancelReason },
}

impl ExamError {
    /// Whether the caller may reasonably retry the same operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExamError::RateLimited { .. }
                | ExamError::ServiceUnavailable { .. }
                | ExamError::InvalidResponse { .. }
                | ExamError::MalformedGrade { .. }
                | ExamError::Cancelled { .. }
        )
    }

    /// Errors that a fresh ask of the grading model may cure.
    pub fn warrants_reask(&self) -> bool {
        matches!(
            self,
            ExamError::MalformedGrade { .. } | ExamError::InvalidResponse { .. }
        )
    }
}

/// An `ExamError` tagged with where in the session it happened.
#[derive(Debug, Error)]
#[error("{stage} stage failed on turn {turn}: {source}")]
pub struct SessionError {
    pub stage: Stage,
    pub turn: u32,
    #[source]
    pub source: ExamError,
}

impl SessionError {
    pub fn new(stage: Stage, turn: u32, source: ExamError) -> Self {
        Self {
            stage,
            turn,
            source,
        }
    }

    /// The underlying pipeline error.
    pub fn kind(&self) -> &ExamError {
        &self.source
    }
}
