//! oralexam CLI — textbook oral-exam simulator.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "oralexam", version, about = "Oral-exam simulator over a textbook corpus")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an interactive study session
    Session {
        /// Path to the corpus manifest
        #[arg(long)]
        corpus: PathBuf,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,

        /// Rubric file (overrides the config)
        #[arg(long)]
        rubric: Option<PathBuf>,

        /// RNG seed for reproducible topic and question draws
        #[arg(long)]
        seed: Option<u64>,

        /// Provider name from the config
        #[arg(long)]
        provider: Option<String>,

        /// Model ID
        #[arg(long)]
        model: Option<String>,

        /// Directory to write the JSON transcript to on exit
        #[arg(long)]
        transcript: Option<PathBuf>,

        /// Stop after this many graded questions
        #[arg(long)]
        max_turns: Option<u32>,
    },

    /// Validate a corpus manifest and rubric
    Validate {
        /// Path to the corpus manifest
        #[arg(long)]
        corpus: PathBuf,

        /// Rubric file to check as well
        #[arg(long)]
        rubric: Option<PathBuf>,
    },

    /// List available models
    ListModels {
        /// Filter to specific provider
        #[arg(long)]
        provider: Option<String>,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Create starter config, corpus and rubric
    Init,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("oralexam=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Session {
            corpus,
            config,
            rubric,
            seed,
            provider,
            model,
            transcript,
            max_turns,
        } => {
            commands::session::execute(commands::session::SessionArgs {
                corpus,
                config,
                rubric,
                seed,
                provider,
                model,
                transcript,
                max_turns,
            })
            .await
        }
        Commands::Validate { corpus, rubric } => commands::validate::execute(corpus, rubric),
        Commands::ListModels { provider, config } => {
            commands::list_models::execute(provider, config).await
        }
        Commands::Init => commands::init::execute(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}
