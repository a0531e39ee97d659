//! CLI integration tests using assert_cmd.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn oralexam() -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("oralexam").unwrap();
    cmd.env_remove("ORALEXAM_ANTHROPIC_KEY")
        .env_remove("ORALEXAM_OPENAI_KEY")
        .env_remove("RUST_LOG");
    cmd
}

/// A temp dir with the files `oralexam init` writes.
fn initialized() -> TempDir {
    let dir = TempDir::new().unwrap();
    oralexam()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success();
    dir
}

#[test]
fn init_creates_files() {
    let dir = TempDir::new().unwrap();

    oralexam()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created oralexam.toml"))
        .stdout(predicate::str::contains("manifest.toml"))
        .stdout(predicate::str::contains("strict-v1.toml"));

    assert!(dir.path().join("oralexam.toml").exists());
    assert!(dir.path().join("corpus/manifest.toml").exists());
    assert!(dir.path().join("rubrics/strict-v1.toml").exists());
}

#[test]
fn init_skips_existing() {
    let dir = initialized();

    oralexam()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("already exists"));
}

#[test]
fn validate_generated_corpus_and_rubric() {
    let dir = initialized();

    oralexam()
        .current_dir(dir.path())
        .args(["validate", "--corpus", "corpus/manifest.toml"])
        .args(["--rubric", "rubrics/strict-v1.toml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 topics, 2 materials"))
        .stdout(predicate::str::contains("Rubric: strict-v1 (3 sub-points"))
        .stdout(predicate::str::contains("Corpus valid."));
}

#[test]
fn validate_reports_warnings() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("manifest.toml"),
        r#"
[corpus]
id = "c"
title = "Sparse"

[[topics]]
id = "empty"
title = "Nothing here"
"#,
    )
    .unwrap();

    oralexam()
        .current_dir(dir.path())
        .args(["validate", "--corpus", "manifest.toml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[empty] WARNING"))
        .stdout(predicate::str::contains("1 warning(s) found."));
}

#[test]
fn validate_rejects_broken_rubric() {
    let dir = initialized();
    std::fs::write(
        dir.path().join("bad.toml"),
        "version = \"x\"\nscale_max = 0.0\nsub_points = []\ninstructions = \"no placeholders\"\n",
    )
    .unwrap();

    oralexam()
        .current_dir(dir.path())
        .args(["validate", "--corpus", "corpus/manifest.toml", "--rubric", "bad.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid rubric"));
}

#[test]
fn validate_nonexistent_file() {
    oralexam()
        .args(["validate", "--corpus", "nonexistent.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn offline_session_grades_one_answer() {
    let dir = initialized();

    oralexam()
        .current_dir(dir.path())
        .args(["session", "--corpus", "corpus/manifest.toml"])
        .args(["--provider", "offline", "--seed", "7", "--transcript", "transcripts"])
        .write_stdin("Full cervical dilation\n:quit\n")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Which event marks the end of the first stage of labor?",
        ))
        .stdout(predicate::str::contains("completeness"))
        .stdout(predicate::str::contains("Score: 6/10 (60.0%)"))
        .stdout(predicate::str::contains("latent and active phases"))
        .stderr(predicate::str::contains("Transcript saved to"));

    let transcripts: Vec<_> = std::fs::read_dir(dir.path().join("transcripts"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(transcripts.len(), 1);

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&transcripts[0]).unwrap()).unwrap();
    assert_eq!(json["provider"], "offline");
    assert_eq!(json["rubric_version"], "strict-v1");
    assert_eq!(json["session"]["state"], "completed");
    assert_eq!(json["summary"]["turns_graded"], 1);
    let turn = &json["session"]["turns"][0];
    assert_eq!(turn["index"], 0);
    assert_eq!(turn["answer"]["text"], "Full cervical dilation");
    assert_eq!(turn["grade"]["score"], 6.0);
    assert_eq!(turn["grade"]["sub_points"][1]["correct"], false);
}

#[test]
fn offline_session_stops_after_max_turns() {
    let dir = initialized();

    oralexam()
        .current_dir(dir.path())
        .args(["session", "--corpus", "corpus/manifest.toml", "--provider", "offline"])
        .args(["--max-turns", "2"])
        .write_stdin("first\n\nsecond\n\nthird\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("--- Question 2"))
        .stdout(predicate::str::contains("--- Question 3").not());
}

#[test]
fn failed_first_question_can_be_asked_again() {
    let dir = initialized();
    std::fs::write(
        dir.path().join("blank.toml"),
        "[providers.blank]\ntype = \"mock\"\ndefault_response = \"\"\n",
    )
    .unwrap();

    oralexam()
        .current_dir(dir.path())
        .args(["session", "--corpus", "corpus/manifest.toml"])
        .args(["--config", "blank.toml", "--provider", "blank"])
        .write_stdin("\n:quit\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("Press Enter to ask again").count(2))
        .stderr(predicate::str::contains("question text is empty"));
}

#[test]
fn session_with_unknown_provider_fails() {
    let dir = initialized();

    oralexam()
        .current_dir(dir.path())
        .args(["session", "--corpus", "corpus/manifest.toml", "--provider", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("provider 'nope' is not configured"));
}

#[test]
fn list_models_for_one_provider() {
    let dir = initialized();

    oralexam()
        .current_dir(dir.path())
        .args(["list-models", "--provider", "offline"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Provider: offline"))
        .stdout(predicate::str::contains("mock-model"));
}

#[test]
fn help_output() {
    oralexam()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Oral-exam simulator"));
}

#[test]
fn version_output() {
    oralexam()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("oralexam"));
}
