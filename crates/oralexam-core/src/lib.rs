//! oralexam-core — question, answer and grading pipeline.
//!
//! This crate holds the data model, the corpus and provider traits, prompt
//! composition, the retrying model gateway, the grading evaluator and the
//! session state machine that ties them together.

pub mod cancel;
pub mod composer;
pub mod corpus;
pub mod error;
pub mod evaluator;
pub mod gateway;
pub mod model;
pub mod rubric;
pub mod session;
pub mod traits;

#[cfg(test)]
mod test_support;

pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use error::{CancelReason, ExamError, ProviderError, SessionError, Stage};
pub use session::{ExamRunner, ExamSettings, Session, SessionState, SessionSummary, TurnView};
