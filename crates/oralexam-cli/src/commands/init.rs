//! The `oralexam init` command.

use std::path::Path;

use anyhow::{Context, Result};

use oralexam_core::rubric::RubricSpec;

pub fn execute() -> Result<()> {
    let rubric = toml::to_string_pretty(&RubricSpec::strict_default())
        .context("failed to render the built-in rubric")?;

    write_once(Path::new("oralexam.toml"), SAMPLE_CONFIG)?;
    write_once(Path::new("corpus/manifest.toml"), EXAMPLE_MANIFEST)?;
    write_once(Path::new("rubrics/strict-v1.toml"), &rubric)?;

    println!("\nNext steps:");
    println!("  1. Edit oralexam.toml with your API keys");
    println!("  2. Add your textbook pages to corpus/manifest.toml");
    println!("  3. Run: oralexam validate --corpus corpus/manifest.toml");
    println!("  4. Run: oralexam session --corpus corpus/manifest.toml");
    println!("     (or try it offline with --provider offline)");

    Ok(())
}

fn write_once(path: &Path, content: &str) -> Result<()> {
    if path.exists() {
        println!("{} already exists, skipping.", path.display());
        return Ok(());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, content).with_context(|| format!("failed to write {}", path.display()))?;
    println!("Created {}", path.display());
    Ok(())
}

const SAMPLE_CONFIG: &str = r#"# oralexam configuration

default_provider = "anthropic"
default_model = "claude-sonnet-4-20250514"
rubric = "rubrics/strict-v1.toml"

[providers.anthropic]
type = "anthropic"
api_key = "${ANTHROPIC_API_KEY}"

[providers.openai]
type = "openai"
api_key = "${OPENAI_API_KEY}"

[providers.ollama]
type = "ollama"
base_url = "http://localhost:11434"

# Canned replies, for trying the session loop without an API key.
[providers.offline]
type = "mock"
default_response = "Which event marks the end of the first stage of labor?"

[[providers.offline.responses]]
contains = "Student answer"
reply = """
```json
{"score": "6/10", "flags": {"accuracy": true, "completeness": false, "reasoning": true}, "corrections": "The answer omits the latent and active phases of the first stage."}
```
"""

[gateway]
max_attempts = 3
initial_backoff_ms = 500
max_backoff_ms = 30000
temperature = 0.0

[attachments]
max_bytes = 5242880
max_count = 4

[exam]
persona = "university professor of obstetrics and gynecology"
language = "English"
regrade_budget = 2

[exam.difficulty_weights]
low = 1
moderate = 2
high = 1

[exam.kind_weights]
multiple_choice = 1
fill_in_the_blank = 1
open_ended = 1
"#;

const EXAMPLE_MANIFEST: &str = r#"[corpus]
id = "example"
title = "Example Obstetrics Notes"

# Each material is one textbook page: an excerpt, page images, or both.
# Image paths are relative to this file (png, jpg, gif or webp).

[[topics]]
id = "labor"
title = "Normal Labor"
category = "obstetrics"

[[topics.materials]]
page = 1
excerpt = """
Labor is divided into three stages. The first stage begins with regular \
uterine contractions and ends with full cervical dilation (10 cm); it has a \
latent and an active phase. The second stage ends with delivery of the fetus, \
and the third stage ends with delivery of the placenta.
"""

[[topics]]
id = "menopause"
title = "Menopause"
category = "gynecology"

[[topics.materials]]
page = 2
excerpt = """
Menopause is diagnosed retrospectively after 12 consecutive months of \
amenorrhea. Falling estradiol and rising FSH levels accompany the transition, \
and vasomotor symptoms are the most common complaint.
"""
"#;
