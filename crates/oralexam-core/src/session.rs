//! Session state machine.
//!
//! A [`Session`] is plain data: its state, its turns and its own RNG. The
//! [`ExamRunner`] drives sessions through the question/answer/grading cycle
//! and holds no per-session state, so one runner serves any number of
//! concurrent sessions.
//!
//! ```text
//! Idle -> AwaitingQuestion -> AwaitingAnswer -> AwaitingGrade -> Graded
//!                ^                                                 |
//!                +----------------------- next --------------------+
//! Graded | Idle --finish--> Completed
//! ```

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::composer::{PromptComposer, PromptStyle};
use crate::error::{ExamError, SessionError, Stage};
use crate::evaluator::evaluate;
use crate::gateway::ModelGateway;
use crate::model::{Answer, Difficulty, GradeResult, Question, QuestionKind, SourceMaterial};
use crate::traits::{Corpus, TokenUsage, TopicFilter};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Relative weights for drawing a question difficulty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DifficultyWeights {
    #[serde(default)]
    pub low: u32,
    #[serde(default)]
    pub moderate: u32,
    #[serde(default)]
    pub high: u32,
}

impl Default for DifficultyWeights {
    fn default() -> Self {
        Self {
            low: 1,
            moderate: 2,
            high: 1,
        }
    }
}

/// Relative weights for drawing a question kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KindWeights {
    #[serde(default)]
    pub multiple_choice: u32,
    #[serde(default)]
    pub fill_in_the_blank: u32,
    #[serde(default)]
    pub open_ended: u32,
}

impl Default for KindWeights {
    fn default() -> Self {
        Self {
            multiple_choice: 1,
            fill_in_the_blank: 1,
            open_ended: 1,
        }
    }
}

/// The `[exam]` configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamSettings {
    #[serde(default)]
    pub difficulty_weights: DifficultyWeights,
    #[serde(default)]
    pub kind_weights: KindWeights,
    /// How many times a malformed verdict is re-asked before failing the turn.
    #[serde(default = "default_regrade_budget")]
    pub regrade_budget: u32,
    /// Fixed RNG seed for reproducible sessions.
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub filter: TopicFilter,
    #[serde(flatten)]
    pub style: PromptStyle,
}

fn default_regrade_budget() -> u32 {
    2
}

impl Default for ExamSettings {
    fn default() -> Self {
        Self {
            difficulty_weights: DifficultyWeights::default(),
            kind_weights: KindWeights::default(),
            regrade_budget: default_regrade_budget(),
            seed: None,
            filter: TopicFilter::default(),
            style: PromptStyle::default(),
        }
    }
}

impl ExamSettings {
    fn draw_difficulty(&self, rng: &mut StdRng) -> Result<Difficulty, ExamError> {
        let w = &self.difficulty_weights;
        draw(&Difficulty::ALL, &[w.low, w.moderate, w.high], rng, "difficulty")
    }

    fn draw_kind(&self, rng: &mut StdRng) -> Result<QuestionKind, ExamError> {
        let w = &self.kind_weights;
        draw(
            &QuestionKind::ALL,
            &[w.multiple_choice, w.fill_in_the_blank, w.open_ended],
            rng,
            "kind",
        )
    }
}

fn draw<T: Copy>(items: &[T], weights: &[u32], rng: &mut StdRng, what: &str) -> Result<T, ExamError> {
    let index = WeightedIndex::new(weights).map_err(|e| ExamError::InvalidRequest {
        stage: Stage::Question,
        message: format!("invalid {what} weights: {e}"),
    })?;
    Ok(items[index.sample(rng)])
}

// ---------------------------------------------------------------------------
// Session data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    AwaitingQuestion,
    AwaitingAnswer,
    AwaitingGrade,
    Graded,
    Completed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::AwaitingQuestion => "awaiting question",
            SessionState::AwaitingAnswer => "awaiting answer",
            SessionState::AwaitingGrade => "awaiting grade",
            SessionState::Graded => "graded",
            SessionState::Completed => "completed",
        };
        write!(f, "{s}")
    }
}

/// One question and everything that hangs off it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub index: u32,
    pub material: SourceMaterial,
    pub question: Question,
    pub answer: Option<Answer>,
    pub grade: Option<GradeResult>,
    /// Tokens reported by the replies the gateway accepted for this turn.
    /// A reply rejected for its shape carries no usage and is not counted.
    pub usage: TokenUsage,
}

/// A study session.
#[derive(Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    state: SessionState,
    turns: Vec<Turn>,
    #[serde(skip, default = "fresh_rng")]
    rng: StdRng,
}

fn fresh_rng() -> StdRng {
    StdRng::from_entropy()
}

/// Aggregate numbers for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub turns_answered: usize,
    pub turns_graded: usize,
    /// Mean grade percentage over graded turns.
    pub mean_percentage: Option<f64>,
    pub usage: TokenUsage,
}

impl Session {
    /// A new idle session; `seed` makes topic and question draws reproducible.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => fresh_rng(),
        };
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            state: SessionState::Idle,
            turns: Vec::new(),
            rng,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn current_turn(&self) -> Option<&Turn> {
        self.turns.last()
    }

    /// Index of the current turn; 0 before the first question.
    fn turn_index(&self) -> u32 {
        match self.turns.last() {
            Some(turn) => turn.index,
            None => 0,
        }
    }

    /// Attach `answer` to the current turn.
    ///
    /// Fails with `TurnMismatch` if the answer is for another turn or the
    /// current turn is already answered. The session is unchanged on failure.
    pub fn record_answer(&mut self, answer: Answer) -> Result<(), ExamError> {
        let Some(turn) = self.turns.last_mut() else {
            return Err(ExamError::TurnMismatch {
                turn: answer.turn,
                reason: "session has no question yet".into(),
            });
        };
        if turn.answer.is_some() {
            return Err(ExamError::TurnMismatch {
                turn: turn.index,
                reason: "turn already has an answer".into(),
            });
        }
        if answer.turn != turn.index {
            return Err(ExamError::TurnMismatch {
                turn: turn.index,
                reason: format!("answer is for turn {}", answer.turn),
            });
        }
        turn.answer = Some(answer);
        Ok(())
    }

    /// Presentation payload for the current turn.
    pub fn view(&self) -> Option<TurnView> {
        self.current_turn().map(|turn| TurnView::new(turn, self.state))
    }

    pub fn summary(&self) -> SessionSummary {
        let mut usage = TokenUsage::default();
        for turn in &self.turns {
            usage.add(turn.usage);
        }
        let grades: Vec<f64> = self
            .turns
            .iter()
            .filter_map(|t| t.grade.as_ref().map(GradeResult::percentage))
            .collect();
        let mean_percentage = if grades.is_empty() {
            None
        } else {
            Some(grades.iter().sum::<f64>() / grades.len() as f64)
        };
        SessionSummary {
            turns_answered: self.turns.iter().filter(|t| t.answer.is_some()).count(),
            turns_graded: grades.len(),
            mean_percentage,
            usage,
        }
    }
}

/// What a front end needs to render one turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnView {
    pub turn: u32,
    pub state: SessionState,
    pub topic: String,
    pub kind: QuestionKind,
    pub difficulty: Difficulty,
    pub question: String,
    pub page: Option<u32>,
    pub attachments: Vec<String>,
    pub answer: Option<String>,
    /// `None` while grading is pending.
    pub grade: Option<GradeResult>,
}

impl TurnView {
    fn new(turn: &Turn, state: SessionState) -> Self {
        Self {
            turn: turn.index,
            state,
            topic: turn.question.topic.title.clone(),
            kind: turn.question.kind,
            difficulty: turn.question.difficulty,
            question: turn.question.text.clone(),
            page: turn.material.page,
            attachments: turn
                .material
                .attachments
                .iter()
                .map(|a| a.name.clone())
                .collect(),
            answer: turn.answer.as_ref().map(|a| a.text.clone()),
            grade: turn.grade.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Transition guard
// ---------------------------------------------------------------------------

/// Holds a session in a transient state; restores the prior state unless
/// committed. Dropping the future that owns it rolls the session back too.
struct Transition<'a> {
    session: &'a mut Session,
    rollback: SessionState,
    committed: bool,
}

impl<'a> Transition<'a> {
    fn begin(session: &'a mut Session, transient: SessionState) -> Self {
        let rollback = session.state;
        session.state = transient;
        tracing::info!(session = %session.id, from = %rollback, to = %transient, "session transition");
        Self {
            session,
            rollback,
            committed: false,
        }
    }

    fn commit(mut self, next: SessionState) {
        tracing::info!(session = %self.session.id, from = %self.session.state, to = %next, "session transition");
        self.session.state = next;
        self.committed = true;
    }
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        if !self.committed {
            tracing::info!(
                session = %self.session.id,
                from = %self.session.state,
                to = %self.rollback,
                "session rolled back"
            );
            self.session.state = self.rollback;
        }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Drives sessions through corpus, composer, gateway and evaluator.
pub struct ExamRunner {
    corpus: Arc<dyn Corpus>,
    composer: PromptComposer,
    gateway: ModelGateway,
    settings: ExamSettings,
}

impl ExamRunner {
    pub fn new(
        corpus: Arc<dyn Corpus>,
        composer: PromptComposer,
        gateway: ModelGateway,
        settings: ExamSettings,
    ) -> Self {
        Self {
            corpus,
            composer,
            gateway,
            settings,
        }
    }

    pub fn settings(&self) -> &ExamSettings {
        &self.settings
    }

    pub fn gateway(&self) -> &ModelGateway {
        &self.gateway
    }

    /// A fresh session seeded from the configured seed, if any.
    pub fn new_session(&self) -> Session {
        Session::new(self.settings.seed)
    }

    /// Ask the first question.
    pub async fn start(
        &self,
        session: &mut Session,
        cancel: &CancelToken,
    ) -> Result<TurnView, SessionError> {
        if session.state != SessionState::Idle {
            return Err(invalid("start", session, Stage::Question));
        }
        self.ask(session, cancel).await
    }

    /// Ask the next question after a graded turn.
    pub async fn next(
        &self,
        session: &mut Session,
        cancel: &CancelToken,
    ) -> Result<TurnView, SessionError> {
        if session.state != SessionState::Graded {
            return Err(invalid("ask the next question", session, Stage::Question));
        }
        self.ask(session, cancel).await
    }

    /// Record the answer to the current question, then grade it.
    ///
    /// The answer is kept even if grading fails or is cancelled; use
    /// [`ExamRunner::retry_grading`] to grade it again.
    pub async fn submit(
        &self,
        session: &mut Session,
        text: &str,
        cancel: &CancelToken,
    ) -> Result<TurnView, SessionError> {
        let turn = session.turn_index();
        if session.current_turn().is_some_and(|t| t.answer.is_some()) {
            return Err(SessionError::new(
                Stage::Grading,
                turn,
                ExamError::TurnMismatch {
                    turn,
                    reason: "turn already has an answer".into(),
                },
            ));
        }
        if session.state != SessionState::AwaitingAnswer {
            return Err(invalid("submit", session, Stage::Grading));
        }

        session
            .record_answer(Answer::new(turn, text))
            .map_err(|e| SessionError::new(Stage::Grading, turn, e))?;
        tracing::info!(session = %session.id, turn, "answer recorded");

        self.grade(session, cancel).await
    }

    /// Grade an answer that is recorded but has no grade yet.
    pub async fn retry_grading(
        &self,
        session: &mut Session,
        cancel: &CancelToken,
    ) -> Result<TurnView, SessionError> {
        if session.state != SessionState::AwaitingAnswer {
            return Err(invalid("retry grading", session, Stage::Grading));
        }
        let turn = session.turn_index();
        if session.current_turn().is_some_and(|t| t.answer.is_none()) {
            return Err(SessionError::new(
                Stage::Grading,
                turn,
                ExamError::TurnMismatch {
                    turn,
                    reason: "turn has no answer to grade".into(),
                },
            ));
        }
        self.grade(session, cancel).await
    }

    /// End the session.
    pub fn finish(&self, session: &mut Session) -> Result<SessionSummary, ExamError> {
        match session.state {
            SessionState::Idle | SessionState::Graded => {
                tracing::info!(session = %session.id, from = %session.state, to = %SessionState::Completed, "session transition");
                session.state = SessionState::Completed;
                Ok(session.summary())
            }
            state => Err(ExamError::InvalidTransition {
                command: "finish",
                state: state.to_string(),
            }),
        }
    }

    async fn ask(&self, session: &mut Session, cancel: &CancelToken) -> Result<TurnView, SessionError> {
        let index = session.turns.len() as u32;
        let fail = |source| SessionError::new(Stage::Question, index, source);

        let mut guard = Transition::begin(session, SessionState::AwaitingQuestion);

        let material = self
            .corpus
            .sample(&self.settings.filter, &mut guard.session.rng)
            .map_err(fail)?;
        let difficulty = match material.topic.difficulty {
            Some(difficulty) => difficulty,
            None => self.settings.draw_difficulty(&mut guard.session.rng).map_err(fail)?,
        };
        let kind = self.settings.draw_kind(&mut guard.session.rng).map_err(fail)?;

        let request = self
            .composer
            .compose_question_request(&material, difficulty, kind)
            .map_err(fail)?;
        let response = self
            .gateway
            .invoke(&request, Stage::Question, cancel)
            .await
            .map_err(fail)?;

        let question = Question {
            turn: index,
            text: response.text.trim().to_string(),
            topic: material.topic.clone(),
            kind,
            difficulty,
            material_id: material.id.clone(),
        };
        guard.session.turns.push(Turn {
            index,
            material,
            question,
            answer: None,
            grade: None,
            usage: response.usage,
        });

        let view = TurnView::new(&guard.session.turns[index as usize], SessionState::AwaitingAnswer);
        guard.commit(SessionState::AwaitingAnswer);
        Ok(view)
    }

    async fn grade(&self, session: &mut Session, cancel: &CancelToken) -> Result<TurnView, SessionError> {
        let index = session.turn_index();
        let fail = |source| SessionError::new(Stage::Grading, index, source);

        let mut guard = Transition::begin(session, SessionState::AwaitingGrade);

        let request = {
            let turn = current(&*guard.session, index).map_err(fail)?;
            let answer = turn.answer.as_ref().ok_or_else(|| {
                fail(ExamError::TurnMismatch {
                    turn: index,
                    reason: "turn has no answer to grade".into(),
                })
            })?;
            self.composer
                .compose_grading_request(&turn.question, answer, &turn.material)
                .map_err(fail)?
        };

        let mut reasks = 0;
        let grade = loop {
            let response = self
                .gateway
                .invoke(&request, Stage::Grading, cancel)
                .await;
            let outcome = match response {
                Ok(response) => {
                    if let Some(turn) = guard.session.turns.last_mut() {
                        turn.usage.add(response.usage);
                    }
                    evaluate(&response, self.composer.rubric())
                }
                Err(err) => Err(err),
            };

            match outcome {
                Ok(grade) => break grade,
                Err(err) if err.warrants_reask() && reasks < self.settings.regrade_budget => {
                    reasks += 1;
                    tracing::warn!(
                        session = %guard.session.id,
                        turn = index,
                        reask = reasks,
                        budget = self.settings.regrade_budget,
                        error = %err,
                        "grading reply unusable, asking again"
                    );
                }
                Err(err) => return Err(fail(err)),
            }
        };

        let turn = guard
            .session
            .turns
            .last_mut()
            .ok_or_else(|| fail(ExamError::NotFound("current turn".into())))?;
        turn.grade = Some(grade);
        let view = TurnView::new(turn, SessionState::Graded);
        guard.commit(SessionState::Graded);
        Ok(view)
    }
}

fn current(session: &Session, index: u32) -> Result<&Turn, ExamError> {
    session
        .turns
        .last()
        .filter(|t| t.index == index)
        .ok_or_else(|| ExamError::TurnMismatch {
            turn: index,
            reason: "no such turn".into(),
        })
}

fn invalid(command: &'static str, session: &Session, stage: Stage) -> SessionError {
    SessionError::new(
        stage,
        session.turn_index(),
        ExamError::InvalidTransition {
            command,
            state: session.state.to_string(),
        },
    )
}
