//! The `oralexam session` command.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use comfy_table::{Cell, Table};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::task::JoinHandle;

use oralexam_core::cancel::{cancel_pair, CancelToken};
use oralexam_core::composer::PromptComposer;
use oralexam_core::corpus::load_corpus;
use oralexam_core::gateway::ModelGateway;
use oralexam_core::model::GradeResult;
use oralexam_core::rubric::{load_rubric, RubricSpec};
use oralexam_core::session::{ExamRunner, Session, SessionState, SessionSummary, TurnView};
use oralexam_core::traits::Corpus;
use oralexam_core::SessionError;
use oralexam_providers::config::load_config_from;
use oralexam_providers::create_provider;

pub struct SessionArgs {
    pub corpus: PathBuf,
    pub config: Option<PathBuf>,
    pub rubric: Option<PathBuf>,
    pub seed: Option<u64>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub transcript: Option<PathBuf>,
    pub max_turns: Option<u32>,
}

/// Fires cancellation on Ctrl-C while a model call is in flight.
struct Interrupt {
    token: CancelToken,
    watcher: JoinHandle<()>,
}

impl Interrupt {
    fn arm() -> Self {
        let (handle, token) = cancel_pair();
        let watcher = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                handle.cancel();
            }
        });
        Self { token, watcher }
    }
}

impl Drop for Interrupt {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

#[derive(Serialize)]
struct Transcript<'a> {
    provider: &'a str,
    model: &'a str,
    rubric_version: &'a str,
    summary: &'a SessionSummary,
    session: &'a Session,
}

pub async fn execute(args: SessionArgs) -> Result<()> {
    let config = load_config_from(args.config.as_deref())?;

    let corpus = load_corpus(&args.corpus)?;
    let corpus_title = corpus.title.clone();
    let corpus: Arc<dyn Corpus> = Arc::new(corpus);

    let rubric = match args.rubric.as_ref().or(config.rubric.as_ref()) {
        Some(path) => load_rubric(path)?,
        None => RubricSpec::strict_default(),
    };

    let provider_name = args
        .provider
        .unwrap_or_else(|| config.default_provider.clone());
    let provider = create_provider(&provider_name, config.provider(&provider_name)?)?;
    let model = args.model.unwrap_or_else(|| config.default_model.clone());
    tracing::debug!(provider = %provider_name, %model, rubric = %rubric.version, "session configured");

    let mut exam = config.exam.clone();
    if args.seed.is_some() {
        exam.seed = args.seed;
    }

    let composer = PromptComposer::new(config.attachments.clone(), exam.style.clone(), rubric.clone());
    let gateway = ModelGateway::new(provider, model.clone(), config.gateway.clone());
    let runner = ExamRunner::new(corpus, composer, gateway, exam);
    let mut session = runner.new_session();

    eprintln!(
        "oralexam v{} — {corpus_title} with {provider_name}/{model}",
        env!("CARGO_PKG_VERSION")
    );
    eprintln!("Type your answer and press Enter. `:quit` or Ctrl-D ends the session.\n");

    let outcome = run_loop(&runner, &mut session, &rubric, args.max_turns).await;

    let summary = match runner.finish(&mut session) {
        Ok(summary) => summary,
        // An unanswered or ungraded last turn cannot complete; report it as is.
        Err(_) => session.summary(),
    };
    print_summary(&summary);

    if let Some(dir) = &args.transcript {
        let transcript = Transcript {
            provider: &provider_name,
            model: &model,
            rubric_version: &rubric.version,
            summary: &summary,
            session: &session,
        };
        let path = write_transcript(dir, &session, &transcript)?;
        eprintln!("Transcript saved to: {}", path.display());
    }

    outcome
}

async fn run_loop(
    runner: &ExamRunner,
    session: &mut Session,
    rubric: &RubricSpec,
    max_turns: Option<u32>,
) -> Result<()> {
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut first_ask = true;

    loop {
        let result = match session.state() {
            SessionState::Idle => {
                if !std::mem::take(&mut first_ask) {
                    let prompt = "No question yet. Press Enter to ask again, `:quit` to stop> ";
                    let Some(line) = read_line(&mut input, prompt).await? else {
                        break;
                    };
                    if line.trim() == ":quit" {
                        break;
                    }
                }
                runner
                    .start(session, &Interrupt::arm().token)
                    .await
                    .map(|view| show_question(&view))
            }
            SessionState::AwaitingAnswer => {
                let answered = session
                    .current_turn()
                    .is_some_and(|turn| turn.answer.is_some());
                let prompt = if answered {
                    "Grading did not finish. Press Enter to retry grading, `:quit` to stop> "
                } else {
                    "Your answer> "
                };
                let Some(line) = read_line(&mut input, prompt).await? else {
                    break;
                };
                let line = line.trim();
                if line == ":quit" {
                    break;
                }
                let graded = if answered {
                    runner.retry_grading(session, &Interrupt::arm().token).await
                } else if line.is_empty() {
                    continue;
                } else {
                    runner.submit(session, line, &Interrupt::arm().token).await
                };
                graded.map(|view| show_grade(&view, rubric))
            }
            SessionState::Graded => {
                let graded = session.summary().turns_graded;
                if max_turns.is_some_and(|max| graded as u32 >= max) {
                    break;
                }
                let prompt = "Press Enter for the next question, `:quit` to stop> ";
                let Some(line) = read_line(&mut input, prompt).await? else {
                    break;
                };
                if line.trim() == ":quit" {
                    break;
                }
                runner
                    .next(session, &Interrupt::arm().token)
                    .await
                    .map(|view| show_question(&view))
            }
            _ => break,
        };

        if let Err(e) = result {
            recover(e)?;
        }
    }

    Ok(())
}

/// Report a failed command; only errors worth retrying keep the loop going.
fn recover(err: SessionError) -> Result<()> {
    if err.kind().is_retryable() {
        eprintln!("Error: {err}");
        Ok(())
    } else {
        Err(err.into())
    }
}

async fn read_line(input: &mut Lines<BufReader<Stdin>>, prompt: &str) -> Result<Option<String>> {
    print!("{prompt}");
    std::io::stdout().flush()?;
    tokio::select! {
        line = input.next_line() => Ok(line.context("failed to read stdin")?),
        _ = tokio::signal::ctrl_c() => Ok(None),
    }
}

fn show_question(view: &TurnView) {
    println!(
        "\n--- Question {} ({}, {}, {}) ---",
        view.turn + 1,
        view.topic,
        view.difficulty,
        view.kind
    );
    let mut source = Vec::new();
    if let Some(page) = view.page {
        source.push(format!("page {page}"));
    }
    if !view.attachments.is_empty() {
        source.push(format!("images: {}", view.attachments.join(", ")));
    }
    if !source.is_empty() {
        println!("Source: {}", source.join("; "));
    }
    println!("{}\n", view.question);
}

fn show_grade(view: &TurnView, rubric: &RubricSpec) {
    let Some(grade) = &view.grade else {
        return;
    };
    println!("\n{}", grade_table(grade, rubric));
    println!(
        "Score: {}/{} ({:.1}%)",
        grade.score,
        grade.scale_max,
        grade.percentage()
    );
    if !grade.corrections.trim().is_empty() {
        println!("Corrections: {}", grade.corrections.trim());
    }
    println!();
}

fn grade_table(grade: &GradeResult, rubric: &RubricSpec) -> Table {
    let mut table = Table::new();
    table.set_header(vec!["Sub-point", "Description", "Verdict"]);

    for point in &grade.sub_points {
        let description = rubric
            .sub_points
            .iter()
            .find(|p| p.id == point.id)
            .map(|p| p.description.as_str())
            .unwrap_or("");
        table.add_row(vec![
            Cell::new(&point.id),
            Cell::new(description),
            Cell::new(if point.correct { "correct" } else { "wrong" }),
        ]);
    }
    table
}

fn print_summary(summary: &SessionSummary) {
    let mut table = Table::new();
    table.set_header(vec!["Answered", "Graded", "Mean score", "Tokens"]);
    table.add_row(vec![
        Cell::new(summary.turns_answered),
        Cell::new(summary.turns_graded),
        Cell::new(
            summary
                .mean_percentage
                .map(|p| format!("{p:.1}%"))
                .unwrap_or_else(|| "-".to_string()),
        ),
        Cell::new(summary.usage.total_tokens),
    ]);
    eprintln!("\n{table}");
}

fn write_transcript(dir: &Path, session: &Session, transcript: &Transcript<'_>) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create transcript directory: {}", dir.display()))?;
    let timestamp = chrono::Utc::now().format("%Y-%m-%dT%H%M%S");
    let short_id = session.id.simple().to_string();
    let path = dir.join(format!("session-{timestamp}-{}.json", &short_id[..8]));

    let json = serde_json::to_string_pretty(transcript)?;
    std::fs::write(&path, json)
        .with_context(|| format!("failed to write transcript: {}", path.display()))?;
    Ok(path)
}
