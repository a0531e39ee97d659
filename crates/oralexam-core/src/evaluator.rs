//! Grading evaluator: turns a grading-stage model response into a
//! validated `GradeResult`.
//!
//! The model's reply is untrusted input. The verdict block is extracted and
//! parsed into a loosely typed `RawVerdict`, then checked against the rubric.
//! Nothing missing is ever filled in with a default; any gap is a
//! `MalformedGrade` and the caller decides whether to ask again.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ExamError, Stage};
use crate::gateway::ModelResponse;
use crate::model::{GradeResult, SubPointVerdict};
use crate::rubric::RubricSpec;

/// Verdict as the model wrote it, before rubric validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawVerdict {
    #[serde(default)]
    pub score: Option<RawScore>,
    #[serde(default)]
    pub scale: Option<f64>,
    #[serde(default)]
    pub flags: Option<RawFlags>,
    #[serde(default)]
    pub corrections: Option<String>,
}

/// `7`, `7.5` or `"7/10"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawScore {
    Number(f64),
    Text(String),
}

/// Flags in rubric order, or keyed by sub-point id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawFlags {
    List(Vec<Option<bool>>),
    Keyed(BTreeMap<String, Option<bool>>),
}

/// Extract the JSON verdict block from a model response.
///
/// Prefers the last ```json fence, then the last bare fence, then the
/// outermost `{...}` span of the whole text.
pub fn extract_verdict_block(response: &str) -> Option<&str> {
    let mut json_block: Option<(usize, usize)> = None;
    let mut generic_block: Option<(usize, usize)> = None;
    let mut open: Option<(usize, Fence)> = None;
    let mut offset = 0;

    for line in response.split_inclusive('\n') {
        let trimmed = line.trim();
        let line_start = offset;
        offset += line.len();

        match open {
            None if trimmed.starts_with("```") => {
                let lang = trimmed.trim_start_matches('`').trim().to_lowercase();
                let fence = match lang.as_str() {
                    "json" => Fence::Json,
                    "" => Fence::Bare,
                    _ => Fence::Other,
                };
                open = Some((offset, fence));
            }
            Some((start, fence)) if trimmed == "```" => {
                match fence {
                    Fence::Json => json_block = Some((start, line_start)),
                    Fence::Bare if looks_like_object(&response[start..line_start]) => {
                        generic_block = Some((start, line_start));
                    }
                    _ => {}
                }
                open = None;
            }
            _ => {}
        }
    }

    // Unclosed fence: take what was written.
    match open {
        Some((start, Fence::Json)) => json_block = Some((start, response.len())),
        Some((start, Fence::Bare)) if looks_like_object(&response[start..]) => {
            generic_block = Some((start, response.len()));
        }
        _ => {}
    }

    if let Some((start, end)) = json_block.or(generic_block) {
        return Some(response[start..end].trim());
    }

    let first = response.find('{')?;
    let last = response.rfind('}')?;
    (last > first).then(|| &response[first..=last])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fence {
    Json,
    Bare,
    Other,
}

fn looks_like_object(block: &str) -> bool {
    block.trim_start().starts_with('{')
}

/// Extract and parse the verdict block without applying the rubric.
pub fn parse_verdict(response: &str) -> Result<RawVerdict, String> {
    let block = extract_verdict_block(response).ok_or("no JSON verdict block found")?;
    serde_json::from_str::<RawVerdict>(block).map_err(|e| format!("verdict block is not valid: {e}"))
}

/// Validate a grading response against `rubric`.
pub fn evaluate(response: &ModelResponse, rubric: &RubricSpec) -> Result<GradeResult, ExamError> {
    let raw = parse_verdict(&response.text).map_err(|reason| ExamError::InvalidResponse {
        stage: Stage::Grading,
        reason,
    })?;
    grade_from_verdict(raw, rubric)
}

/// Apply rubric invariants to an already parsed verdict.
pub fn grade_from_verdict(raw: RawVerdict, rubric: &RubricSpec) -> Result<GradeResult, ExamError> {
    let (score, text_scale) = match raw.score {
        None => return Err(malformed("score is missing")),
        Some(RawScore::Number(n)) => (n, None),
        Some(RawScore::Text(text)) => parse_score_text(&text)?,
    };

    if !score.is_finite() || score < 0.0 || score > rubric.scale_max {
        return Err(malformed(format!(
            "score {score} is outside 0..={}",
            rubric.scale_max
        )));
    }
    for scale in [text_scale, raw.scale].into_iter().flatten() {
        if (scale - rubric.scale_max).abs() > f64::EPSILON {
            return Err(malformed(format!(
                "verdict uses scale {scale}, rubric scale is {}",
                rubric.scale_max
            )));
        }
    }

    let sub_points = match raw.flags {
        None => return Err(malformed("flags are missing")),
        Some(RawFlags::List(list)) => flags_from_list(list, rubric)?,
        Some(RawFlags::Keyed(map)) => flags_from_map(map, rubric)?,
    };

    let corrections = raw.corrections.unwrap_or_default().trim().to_string();
    if corrections.is_empty() {
        if let Some(wrong) = sub_points.iter().find(|p| !p.correct) {
            return Err(malformed(format!(
                "sub-point '{}' is marked incorrect but corrections are empty",
                wrong.id
            )));
        }
    }

    Ok(GradeResult {
        score,
        scale_max: rubric.scale_max,
        sub_points,
        corrections,
        rubric_version: rubric.version.clone(),
    })
}

fn parse_score_text(text: &str) -> Result<(f64, Option<f64>), ExamError> {
    let parse = |s: &str| {
        s.trim()
            .parse::<f64>()
            .map_err(|_| malformed(format!("score '{text}' is not a number")))
    };
    match text.split_once('/') {
        Some((score, scale)) => Ok((parse(score)?, Some(parse(scale)?))),
        None => Ok((parse(text)?, None)),
    }
}

fn flags_from_list(
    list: Vec<Option<bool>>,
    rubric: &RubricSpec,
) -> Result<Vec<SubPointVerdict>, ExamError> {
    if list.len() != rubric.sub_points.len() {
        return Err(malformed(format!(
            "expected {} flags, got {}",
            rubric.sub_points.len(),
            list.len()
        )));
    }
    rubric
        .sub_points
        .iter()
        .zip(list)
        .map(|(point, flag)| {
            flag.map(|correct| SubPointVerdict {
                id: point.id.clone(),
                correct,
            })
            .ok_or_else(|| malformed(format!("flag for sub-point '{}' is missing", point.id)))
        })
        .collect()
}

fn flags_from_map(
    mut map: BTreeMap<String, Option<bool>>,
    rubric: &RubricSpec,
) -> Result<Vec<SubPointVerdict>, ExamError> {
    let verdicts = rubric
        .sub_points
        .iter()
        .map(|point| match map.remove(&point.id) {
            Some(Some(correct)) => Ok(SubPointVerdict {
                id: point.id.clone(),
                correct,
            }),
            _ => Err(malformed(format!(
                "flag for sub-point '{}' is missing",
                point.id
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(extra) = map.keys().next() {
        return Err(malformed(format!("unknown sub-point '{extra}' in flags")));
    }
    Ok(verdicts)
}

fn malformed(reason: impl Into<String>) -> ExamError {
    ExamError::MalformedGrade {
        reason: reason.into(),
    }
}
