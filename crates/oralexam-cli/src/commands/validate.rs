//! The `oralexam validate` command.

use std::path::PathBuf;

use anyhow::Result;

use oralexam_core::corpus::{load_corpus, validate_corpus};
use oralexam_core::rubric::load_rubric;

pub fn execute(corpus_path: PathBuf, rubric_path: Option<PathBuf>) -> Result<()> {
    let corpus = load_corpus(&corpus_path)?;
    println!(
        "Corpus: {} ({} topics, {} materials)",
        corpus.title,
        corpus.entries().len(),
        corpus.material_count()
    );

    let warnings = validate_corpus(&corpus);
    for w in &warnings {
        let prefix = w
            .topic_id
            .as_ref()
            .map(|id| format!("  [{id}]"))
            .unwrap_or_else(|| "  ".to_string());
        println!("{prefix} WARNING: {}", w.message);
    }
    let total_warnings = warnings.len();

    if let Some(path) = rubric_path {
        // `load_rubric` rejects rubrics that fail validation outright.
        let rubric = load_rubric(&path)?;
        println!(
            "Rubric: {} ({} sub-points, scale 0-{})",
            rubric.version,
            rubric.sub_points.len(),
            rubric.scale_max
        );
    }

    if total_warnings == 0 {
        println!("Corpus valid.");
    } else {
        println!("\n{total_warnings} warning(s) found.");
    }

    Ok(())
}
