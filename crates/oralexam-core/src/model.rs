//! Core data model types for oralexam.
//!
//! Topics and source material come from the corpus; questions, answers and
//! grades are produced turn by turn and owned by a `Session`.

use std::fmt;
use std::str::FromStr;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How hard a generated question should be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Low,
    Moderate,
    High,
}

impl Difficulty {
    pub const ALL: [Difficulty; 3] = [Difficulty::Low, Difficulty::Moderate, Difficulty::High];
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Difficulty::Low => write!(f, "low"),
            Difficulty::Moderate => write!(f, "moderate"),
            Difficulty::High => write!(f, "high"),
        }
    }
}

impl FromStr for Difficulty {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" | "easy" => Ok(Difficulty::Low),
            "moderate" | "medium" => Ok(Difficulty::Moderate),
            "high" | "hard" => Ok(Difficulty::High),
            other => Err(format!("unknown difficulty: {other}")),
        }
    }
}

/// Format of a generated question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    MultipleChoice,
    FillInTheBlank,
    OpenEnded,
}

impl QuestionKind {
    pub const ALL: [QuestionKind; 3] = [
        QuestionKind::MultipleChoice,
        QuestionKind::FillInTheBlank,
        QuestionKind::OpenEnded,
    ];
}

impl fmt::Display for QuestionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuestionKind::MultipleChoice => write!(f, "multiple choice"),
            QuestionKind::FillInTheBlank => write!(f, "fill-in-the-blank"),
            QuestionKind::OpenEnded => write!(f, "open-ended"),
        }
    }
}

/// A topic (chapter or section) of the reference textbook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    /// Stable identifier used for lookups and filters.
    pub id: String,
    /// Human-readable title, shown to the model as the exam topic.
    pub title: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub difficulty: Option<Difficulty>,
}

/// Image formats accepted as attachments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Png,
    Jpeg,
    Gif,
    Webp,
}

impl MediaType {
    pub const ALL: [MediaType; 4] = [
        MediaType::Png,
        MediaType::Jpeg,
        MediaType::Gif,
        MediaType::Webp,
    ];

    /// The IANA media type string.
    pub fn mime(&self) -> &'static str {
        match self {
            MediaType::Png => "image/png",
            MediaType::Jpeg => "image/jpeg",
            MediaType::Gif => "image/gif",
            MediaType::Webp => "image/webp",
        }
    }

    /// Guess the media type from a file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "png" => Some(MediaType::Png),
            "jpg" | "jpeg" => Some(MediaType::Jpeg),
            "gif" => Some(MediaType::Gif),
            "webp" => Some(MediaType::Webp),
            _ => None,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime())
    }
}

/// A figure, table or page rendered as an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub media_type: MediaType,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn new(name: impl Into<String>, media_type: MediaType, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            media_type,
            data,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Standard base64 encoding of the image bytes, as most APIs expect.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.data)
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// The textbook content backing one question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMaterial {
    /// Unique within the corpus (e.g. `"labor-stages#p112"`).
    pub id: String,
    pub topic: Topic,
    #[serde(default)]
    pub excerpt: Option<String>,
    /// Page number in the source book, if known.
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl SourceMaterial {
    pub fn has_content(&self) -> bool {
        self.excerpt
            .as_deref()
            .is_some_and(|text| !text.trim().is_empty())
            || !self.attachments.is_empty()
    }
}

/// A generated exam question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    /// Index of the turn this question opened.
    pub turn: u32,
    pub text: String,
    pub topic: Topic,
    pub kind: QuestionKind,
    pub difficulty: Difficulty,
    /// Id of the `SourceMaterial` stored on the same turn.
    pub material_id: String,
}

/// The user's free-text reply to a question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    /// Must equal the index of the question's turn.
    pub turn: u32,
    pub text: String,
    pub submitted_at: DateTime<Utc>,
}

impl Answer {
    pub fn new(turn: u32, text: impl Into<String>) -> Self {
        Self {
            turn,
            text: text.into(),
            submitted_at: Utc::now(),
        }
    }
}

/// Correctness flag for one rubric sub-point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubPointVerdict {
    pub id: String,
    pub correct: bool,
}

/// A validated verdict for a (question, answer) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeResult {
    pub score: f64,
    pub scale_max: f64,
    /// One entry per rubric sub-point, in rubric order.
    pub sub_points: Vec<SubPointVerdict>,
    pub corrections: String,
    pub rubric_version: String,
}

impl GradeResult {
    pub fn is_fully_correct(&self) -> bool {
        self.sub_points.iter().all(|p| p.correct)
    }

    /// Score as a percentage of the scale, in `0.0..=100.0`.
    pub fn percentage(&self) -> f64 {
        if self.scale_max <= 0.0 {
            return 0.0;
        }
        self.score / self.scale_max * 100.0
    }
}
