//! Versioned grading rubrics.
//!
//! A rubric is configuration: its instruction template, scale and sub-points
//! are loaded from TOML so that rewording the grading policy never touches
//! the composer or evaluator.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One independently judged aspect of an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubPoint {
    pub id: String,
    pub description: String,
}

/// Grading policy: scale, sub-points and the instruction template.
///
/// `instructions` may use the placeholders `{question}`, `{answer}`,
/// `{kind}`, `{topic}`, `{scale_max}`, `{sub_points}` and `{language}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RubricSpec {
    pub version: String,
    #[serde(default)]
    pub name: String,
    pub scale_max: f64,
    pub sub_points: Vec<SubPoint>,
    pub instructions: String,
}

const STRICT_V1_INSTRUCTIONS: &str = "\
You are a strict examiner grading a student's oral-exam answer.

Topic: {topic}
Question type: {kind}
Question:
{question}

Student answer:
{answer}

Grading rules:
1. Verify the answer ONLY against the provided source material (text and images).
2. Judge each sub-point independently:
{sub_points}
3. If anything is wrong or missing, cite the specific error and state the correct answer.
4. For multiple choice, the answer is correct only if the right option is selected.
5. For fill-in-the-blank, the answer is correct only if the exact missing term is given.
6. Do not be lenient. Partial understanding earns partial credit only.
7. Give a score between 0 and {scale_max}.

Write the corrections in {language}.";

impl RubricSpec {
    /// The built-in `strict-v1` rubric.
    pub fn strict_default() -> Self {
        Self {
            version: "strict-v1".into(),
            name: "Strict examiner".into(),
            scale_max: 10.0,
            sub_points: vec![
                SubPoint {
                    id: "accuracy".into(),
                    description: "Every stated fact agrees with the source material".into(),
                },
                SubPoint {
                    id: "completeness".into(),
                    description: "All parts of the question are addressed".into(),
                },
                SubPoint {
                    id: "reasoning".into(),
                    description: "The explanation or interpretation is sound".into(),
                },
            ],
            instructions: STRICT_V1_INSTRUCTIONS.into(),
        }
    }

    /// Sub-point ids in rubric order.
    pub fn sub_point_ids(&self) -> impl Iterator<Item = &str> {
        self.sub_points.iter().map(|p| p.id.as_str())
    }

    /// Check the rubric can drive grading. Returns every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.version.trim().is_empty() {
            problems.push("version is empty".to_string());
        }
        if !(self.scale_max.is_finite() && self.scale_max > 0.0) {
            problems.push(format!("scale_max must be positive, got {}", self.scale_max));
        }
        if self.sub_points.is_empty() {
            problems.push("at least one sub-point is required".to_string());
        }

        let mut seen = HashSet::new();
        for point in &self.sub_points {
            if !seen.insert(point.id.as_str()) {
                problems.push(format!("duplicate sub-point id: {}", point.id));
            }
        }

        for placeholder in ["{question}", "{answer}"] {
            if !self.instructions.contains(placeholder) {
                problems.push(format!("instructions lack the {placeholder} placeholder"));
            }
        }

        problems
    }
}

impl Default for RubricSpec {
    fn default() -> Self {
        Self::strict_default()
    }
}

/// Load and validate a rubric TOML file.
pub fn load_rubric(path: &Path) -> Result<RubricSpec> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read rubric: {}", path.display()))?;
    parse_rubric_str(&content, path)
}

/// Parse a rubric from TOML text (useful for testing).
pub fn parse_rubric_str(content: &str, source_path: &Path) -> Result<RubricSpec> {
    let rubric: RubricSpec = toml::from_str(content)
        .with_context(|| format!("failed to parse rubric: {}", source_path.display()))?;

    let problems = rubric.validate();
    if !problems.is_empty() {
        anyhow::bail!(
            "invalid rubric {}: {}",
            source_path.display(),
            problems.join("; ")
        );
    }

    Ok(rubric)
}
