//! Prompt composition for the question and grading stages.
//!
//! Everything here is pure string assembly plus attachment validation; no
//! network access happens until the gateway is invoked with the result.

use serde::{Deserialize, Serialize};

use crate::error::{ExamError, Stage};
use crate::model::{Answer, Attachment, Difficulty, MediaType, Question, QuestionKind, SourceMaterial};
use crate::rubric::RubricSpec;

/// Limits applied to every attachment before it is sent to a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentLimits {
    /// Largest accepted attachment, in raw bytes.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    /// Most attachments per request.
    #[serde(default = "default_max_count")]
    pub max_count: usize,
    #[serde(default = "default_media_types")]
    pub allowed_media_types: Vec<MediaType>,
}

fn default_max_bytes() -> usize {
    5 * 1024 * 1024
}
fn default_max_count() -> usize {
    4
}
fn default_media_types() -> Vec<MediaType> {
    MediaType::ALL.to_vec()
}

impl Default for AttachmentLimits {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
            max_count: default_max_count(),
            allowed_media_types: default_media_types(),
        }
    }
}

/// Voice of the generated questions and feedback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptStyle {
    /// Who the model plays, e.g. "Gynecology professor".
    #[serde(default = "default_persona")]
    pub persona: String,
    /// Language for questions and corrections.
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_persona() -> String {
    "university professor".to_string()
}
fn default_language() -> String {
    "English".to_string()
}

impl Default for PromptStyle {
    fn default() -> Self {
        Self {
            persona: default_persona(),
            language: default_language(),
        }
    }
}

/// A fully composed, provider-neutral model request.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub stage: Stage,
    pub system: String,
    pub prompt: String,
    pub attachments: Vec<Attachment>,
    /// Set for grading requests.
    pub rubric_version: Option<String>,
}

const QUESTION_SYSTEM_PROMPT: &str = "You write oral-exam questions for students studying a reference textbook. Reply with the question only.";
const GRADING_SYSTEM_PROMPT: &str = "You are a strict examiner. Follow the rubric exactly and always finish with the requested JSON verdict block.";

/// Builds model requests from typed inputs.
#[derive(Debug, Clone)]
pub struct PromptComposer {
    limits: AttachmentLimits,
    style: PromptStyle,
    rubric: RubricSpec,
}

impl PromptComposer {
    pub fn new(limits: AttachmentLimits, style: PromptStyle, rubric: RubricSpec) -> Self {
        Self {
            limits,
            style,
            rubric,
        }
    }

    pub fn rubric(&self) -> &RubricSpec {
        &self.rubric
    }

    pub fn limits(&self) -> &AttachmentLimits {
        &self.limits
    }

    /// Compose the request that asks for one exam question about `material`.
    pub fn compose_question_request(
        &self,
        material: &SourceMaterial,
        difficulty: Difficulty,
        kind: QuestionKind,
    ) -> Result<ModelRequest, ExamError> {
        self.check_attachments(&material.attachments)?;

        let mut prompt = format!(
            "You are a {persona}.\nTopic: {topic}.\nLanguage: {language}. Translate technical terms correctly, using the terms practitioners actually use.\n",
            persona = self.style.persona,
            topic = material.topic.title,
            language = self.style.language,
        );
        prompt.push_str("Base the question EXCLUSIVELY on the provided source material.\n\n");
        prompt.push_str(kind_instructions(kind));
        prompt.push('\n');
        prompt.push_str(&format!(
            "Difficulty: {difficulty}. {}\n",
            difficulty_guidance(difficulty)
        ));
        prompt.push_str(
            "Ask exactly one high-level, exam-style question. Do NOT reveal or hint at the answer.\n",
        );

        push_material(&mut prompt, material);

        Ok(ModelRequest {
            stage: Stage::Question,
            system: QUESTION_SYSTEM_PROMPT.to_string(),
            prompt,
            attachments: material.attachments.clone(),
            rubric_version: None,
        })
    }

    /// Compose the request that grades `answer` against the rubric.
    pub fn compose_grading_request(
        &self,
        question: &Question,
        answer: &Answer,
        material: &SourceMaterial,
    ) -> Result<ModelRequest, ExamError> {
        self.check_attachments(&material.attachments)?;

        let sub_points = self
            .rubric
            .sub_points
            .iter()
            .map(|p| format!("   - {}: {}", p.id, p.description))
            .collect::<Vec<_>>()
            .join("\n");
        let scale_max = format_scale(self.rubric.scale_max);
        let kind = question.kind.to_string();

        let mut prompt = render_template(
            &self.rubric.instructions,
            &[
                ("question", question.text.as_str()),
                ("answer", answer.text.as_str()),
                ("kind", kind.as_str()),
                ("topic", question.topic.title.as_str()),
                ("scale_max", scale_max.as_str()),
                ("sub_points", sub_points.as_str()),
                ("language", self.style.language.as_str()),
            ],
        );
        prompt.push_str("\n\n");
        prompt.push_str(&self.verdict_contract());
        push_material(&mut prompt, material);

        Ok(ModelRequest {
            stage: Stage::Grading,
            system: GRADING_SYSTEM_PROMPT.to_string(),
            prompt,
            attachments: material.attachments.clone(),
            rubric_version: Some(self.rubric.version.clone()),
        })
    }

    /// The documented verdict format the evaluator parses.
    fn verdict_contract(&self) -> String {
        let scale = format_scale(self.rubric.scale_max);
        let flags = self
            .rubric
            .sub_points
            .iter()
            .map(|p| format!("\"{}\": true", p.id))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "After your explanation, end with exactly one fenced JSON verdict block:\n\
```json\n\
{{\"score\": <number from 0 to {scale}>, \"scale\": {scale}, \"flags\": {{{flags}}}, \"corrections\": \"<what was wrong and the correct answer>\"}}\n\
```\n\
\"flags\" must contain every sub-point id exactly once with true (correct) or false (incorrect). \
\"corrections\" must not be empty when any flag is false.\n"
        )
    }

    fn check_attachments(&self, attachments: &[Attachment]) -> Result<(), ExamError> {
        if attachments.len() > self.limits.max_count {
            return Err(ExamError::UnsupportedAttachment {
                name: attachments
                    .get(self.limits.max_count)
                    .map(|a| a.name.clone())
                    .unwrap_or_default(),
                reason: format!(
                    "{} attachments exceed the limit of {}",
                    attachments.len(),
                    self.limits.max_count
                ),
            });
        }

        for attachment in attachments {
            if !self.limits.allowed_media_types.contains(&attachment.media_type) {
                return Err(ExamError::UnsupportedAttachment {
                    name: attachment.name.clone(),
                    reason: format!("media type {} is not allowed", attachment.media_type),
                });
            }
            if attachment.size() > self.limits.max_bytes {
                return Err(ExamError::UnsupportedAttachment {
                    name: attachment.name.clone(),
                    reason: format!(
                        "{} bytes exceeds the limit of {} bytes",
                        attachment.size(),
                        self.limits.max_bytes
                    ),
                });
            }
        }

        Ok(())
    }
}

fn kind_instructions(kind: QuestionKind) -> &'static str {
    match kind {
        QuestionKind::MultipleChoice => "Create a challenging multiple choice question.\n\
1. Provide the question stem with enough context.\n\
2. Provide 4 distinct, plausible options labeled A, B, C, D.\n\
3. Do NOT reveal the correct option.\n",
        QuestionKind::FillInTheBlank => "Create a fill-in-the-blank sentence.\n\
1. Take a key sentence from the material.\n\
2. Replace the most critical term (e.g. a drug name, diagnosis or statistic) with '_______'.\n\
3. Do NOT reveal the missing term.\n",
        QuestionKind::OpenEnded => "Create a short, open-ended question.\n\
1. Ask for a diagnosis, a list of findings, or an explanation of a mechanism shown in the material.\n\
2. If there is a table, ask about one of its items and name the relevant row and column headers.\n\
3. If there is a graph, ask the student to interpret its data.\n\
4. If there are both, pick one of them.\n",
    }
}

fn difficulty_guidance(difficulty: Difficulty) -> &'static str {
    match difficulty {
        Difficulty::Low => "Test recall of a central fact stated directly in the material.",
        Difficulty::Moderate => "Require applying or connecting two facts from the material.",
        Difficulty::High => {
            "Require multi-step reasoning or interpretation of data from a figure or table."
        }
    }
}

fn push_material(prompt: &mut String, material: &SourceMaterial) {
    if let Some(excerpt) = material.excerpt.as_deref().filter(|e| !e.trim().is_empty()) {
        prompt.push_str("\nSource material:\n\"\"\"\n");
        prompt.push_str(excerpt.trim());
        prompt.push_str("\n\"\"\"\n");
    }
    if !material.attachments.is_empty() {
        let names = material
            .attachments
            .iter()
            .map(|a| a.name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let page = material
            .page
            .map(|p| format!(" from page {p}"))
            .unwrap_or_default();
        prompt.push_str(&format!(
            "\nThe attached image(s){page} are part of the source material: {names}\n"
        ));
    }
}

fn format_scale(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        value.to_string()
    }
}

/// Substitute `{name}` placeholders in a single pass.
///
/// Substituted values are never rescanned, so an answer containing
/// `{question}` stays literal. Unknown placeholders are left as-is.
pub fn render_template(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let replaced = after.find('}').and_then(|close| {
            let key = &after[..close];
            values
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| (*value, close))
        });
        match replaced {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Topic;

    fn material(attachments: Vec<Attachment>) -> SourceMaterial {
        SourceMaterial {
            id: "labor#p12".into(),
            topic: Topic {
                id: "labor".into(),
                title: "Normal labor".into(),
                category: Some("obstetrics".into()),
                difficulty: None,
            },
            excerpt: Some("The first stage of labor ends at full cervical dilation.".into()),
            page: Some(12),
            attachments,
        }
    }

    fn composer() -> PromptComposer {
        PromptComposer::new(
            AttachmentLimits {
                max_bytes: 16,
                max_count: 2,
                allowed_media_types: vec![MediaType::Png, MediaType::Jpeg],
            },
            PromptStyle::default(),
            RubricSpec::strict_default(),
        )
    }

    fn question() -> Question {
        Question {
            turn: 0,
            text: "When does the first stage of labor end?".into(),
            topic: material(vec![]).topic,
            kind: QuestionKind::OpenEnded,
            difficulty: Difficulty::Low,
            material_id: "labor#p12".into(),
        }
    }

    #[test]
    fn question_request_contains_material_and_instructions() {
        let png = Attachment::new("partogram.png", MediaType::Png, vec![0; 8]);
        let req = composer()
            .compose_question_request(
                &material(vec![png]),
                Difficulty::High,
                QuestionKind::MultipleChoice,
            )
            .unwrap();
        assert_eq!(req.stage, Stage::Question);
        assert!(req.prompt.contains("Topic: Normal labor."));
        assert!(req.prompt.contains("labeled A, B, C, D"));
        assert!(req.prompt.contains("Difficulty: high."));
        assert!(req.prompt.contains("full cervical dilation"));
        assert!(req.prompt.contains("from page 12"));
        assert!(req.prompt.contains("Do NOT reveal"));
        assert_eq!(req.attachments.len(), 1);
        assert!(req.rubric_version.is_none());
    }

    #[test]
    fn oversized_attachment_rejected() {
        let big = Attachment::new("scan.png", MediaType::Png, vec![0; 17]);
        let err = composer()
            .compose_question_request(&material(vec![big]), Difficulty::Low, QuestionKind::OpenEnded)
            .unwrap_err();
        assert!(matches!(err, ExamError::UnsupportedAttachment { ref name, .. } if name == "scan.png"));
    }

    #[test]
    fn disallowed_media_type_rejected() {
        let gif = Attachment::new("anim.gif", MediaType::Gif, vec![0; 4]);
        let err = composer()
            .compose_question_request(&material(vec![gif]), Difficulty::Low, QuestionKind::OpenEnded)
            .unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[test]
    fn too_many_attachments_rejected() {
        let atts = (0..3)
            .map(|i| Attachment::new(format!("p{i}.png"), MediaType::Png, vec![0; 2]))
            .collect();
        let err = composer()
            .compose_question_request(&material(atts), Difficulty::Low, QuestionKind::OpenEnded)
            .unwrap_err();
        assert!(err.to_string().contains("exceed the limit of 2"));
    }

    #[test]
    fn grading_request_renders_rubric() {
        let answer = Answer::new(0, "At full dilation of the cervix {question}");
        let req = composer()
            .compose_grading_request(&question(), &answer, &material(vec![]))
            .unwrap();
        assert_eq!(req.stage, Stage::Grading);
        assert_eq!(req.rubric_version.as_deref(), Some("strict-v1"));
        assert!(req.prompt.contains("When does the first stage of labor end?"));
        assert!(req.prompt.contains("At full dilation of the cervix {question}"));
        assert!(req.prompt.contains("- accuracy:"));
        assert!(req.prompt.contains("between 0 and 10"));
        assert!(req.prompt.contains("```json"));
        assert!(req.prompt.contains("\"completeness\": true"));
    }

    #[test]
    fn grading_request_checks_attachments_too() {
        let big = Attachment::new("scan.jpg", MediaType::Jpeg, vec![0; 32]);
        let answer = Answer::new(0, "x");
        assert!(composer()
            .compose_grading_request(&question(), &answer, &material(vec![big]))
            .is_err());
    }

    #[test]
    fn render_template_single_pass() {
        let out = render_template(
            "{a} and {b} and {unknown} and {",
            &[("a", "{b}"), ("b", "two")],
        );
        assert_eq!(out, "{b} and two and {unknown} and {");
    }

    #[test]
    fn composition_is_deterministic() {
        let c = composer();
        let m = material(vec![]);
        let first = c
            .compose_question_request(&m, Difficulty::Moderate, QuestionKind::FillInTheBlank)
            .unwrap();
        let second = c
            .compose_question_request(&m, Difficulty::Moderate, QuestionKind::FillInTheBlank)
            .unwrap();
        assert_eq!(first, second);
    }
}
