//! TOML manifest corpus.
//!
//! A manifest lists the textbook's topics (chapters), each with one or more
//! materials: a text excerpt and/or page images stored next to the
//! manifest. Sampling picks a topic, then one of its materials, the way a
//! tutor flips to a random chapter and then a random page.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::RngCore;
use serde::Deserialize;

use crate::error::ExamError;
use crate::model::{Attachment, Difficulty, MediaType, SourceMaterial, Topic};
use crate::traits::{Corpus, TopicFilter};

#[derive(Debug, Deserialize)]
struct TomlManifest {
    corpus: TomlCorpusHeader,
    #[serde(default)]
    topics: Vec<TomlTopic>,
}

#[derive(Debug, Deserialize)]
struct TomlCorpusHeader {
    id: String,
    title: String,
}

#[derive(Debug, Deserialize)]
struct TomlTopic {
    id: String,
    title: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    difficulty: Option<String>,
    #[serde(default)]
    materials: Vec<TomlMaterial>,
}

#[derive(Debug, Deserialize)]
struct TomlMaterial {
    #[serde(default)]
    excerpt: Option<String>,
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    images: Vec<PathBuf>,
}

/// A topic together with its materials.
#[derive(Debug, Clone)]
pub struct TopicEntry {
    pub topic: Topic,
    pub materials: Vec<SourceMaterial>,
}

/// In-memory corpus, usually loaded from a TOML manifest.
#[derive(Debug, Clone)]
pub struct ManifestCorpus {
    pub id: String,
    pub title: String,
    entries: Vec<TopicEntry>,
    topics: Vec<Topic>,
}

impl ManifestCorpus {
    pub fn new(id: impl Into<String>, title: impl Into<String>, entries: Vec<TopicEntry>) -> Self {
        let topics = entries.iter().map(|e| e.topic.clone()).collect();
        Self {
            id: id.into(),
            title: title.into(),
            entries,
            topics,
        }
    }

    pub fn entries(&self) -> &[TopicEntry] {
        &self.entries
    }

    /// Total number of materials across all topics.
    pub fn material_count(&self) -> usize {
        self.entries.iter().map(|e| e.materials.len()).sum()
    }
}

impl Corpus for ManifestCorpus {
    fn topics(&self) -> &[Topic] {
        &self.topics
    }

    fn sample(
        &self,
        filter: &TopicFilter,
        rng: &mut dyn RngCore,
    ) -> Result<SourceMaterial, ExamError> {
        let candidates: Vec<&TopicEntry> = self
            .entries
            .iter()
            .filter(|e| filter.matches(&e.topic) && !e.materials.is_empty())
            .collect();

        let entry = candidates
            .choose(rng)
            .ok_or_else(|| ExamError::NotFound(format!("no topic with material matches {filter:?}")))?;
        let material = entry.materials.choose(rng).ok_or_else(|| {
            ExamError::NotFound(format!("topic '{}' has no material", entry.topic.id))
        })?;

        Ok(material.clone())
    }

    fn get(&self, topic_id: &str) -> Result<SourceMaterial, ExamError> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.topic.id == topic_id)
            .ok_or_else(|| ExamError::NotFound(format!("unknown topic '{topic_id}'")))?;
        entry
            .materials
            .first()
            .cloned()
            .ok_or_else(|| ExamError::NotFound(format!("topic '{topic_id}' has no material")))
    }
}

/// Load a corpus manifest; image paths resolve against the manifest's directory.
pub fn load_corpus(path: &Path) -> Result<ManifestCorpus> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read corpus manifest: {}", path.display()))?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    parse_corpus_str(&content, path, base_dir)
}

/// Parse a manifest from TOML text (useful for testing).
pub fn parse_corpus_str(content: &str, source_path: &Path, base_dir: &Path) -> Result<ManifestCorpus> {
    let parsed: TomlManifest = toml::from_str(content)
        .with_context(|| format!("failed to parse corpus manifest: {}", source_path.display()))?;

    let entries = parsed
        .topics
        .into_iter()
        .map(|t| {
            let difficulty = t
                .difficulty
                .map(|d| d.parse::<Difficulty>().map_err(|e| anyhow::anyhow!("{}", e)))
                .transpose()?;
            let topic = Topic {
                id: t.id,
                title: t.title,
                category: t.category,
                difficulty,
            };

            let materials = t
                .materials
                .into_iter()
                .enumerate()
                .map(|(index, m)| load_material(&topic, index, m, base_dir))
                .collect::<Result<Vec<_>>>()?;

            Ok(TopicEntry { topic, materials })
        })
        .collect::<Result<Vec<_>>>()?;

    let corpus = ManifestCorpus::new(parsed.corpus.id, parsed.corpus.title, entries);
    tracing::debug!(
        corpus = %corpus.id,
        topics = corpus.topics.len(),
        materials = corpus.material_count(),
        "loaded corpus manifest"
    );
    Ok(corpus)
}

fn load_material(
    topic: &Topic,
    index: usize,
    material: TomlMaterial,
    base_dir: &Path,
) -> Result<SourceMaterial> {
    let attachments = material
        .images
        .iter()
        .map(|relative| {
            let path = base_dir.join(relative);
            let media_type = path
                .extension()
                .and_then(|e| e.to_str())
                .and_then(MediaType::from_extension)
                .with_context(|| format!("unsupported image type: {}", path.display()))?;
            let data = std::fs::read(&path)
                .with_context(|| format!("failed to read image: {}", path.display()))?;
            let name = relative.display().to_string();
            Ok(Attachment::new(name, media_type, data))
        })
        .collect::<Result<Vec<_>>>()?;

    let id = match material.page {
        Some(page) => format!("{}#p{page}", topic.id),
        None => format!("{}#{index}", topic.id),
    };

    Ok(SourceMaterial {
        id,
        topic: topic.clone(),
        excerpt: material.excerpt,
        page: material.page,
        attachments,
    })
}

/// A warning from corpus validation.
#[derive(Debug, Clone)]
pub struct CorpusWarning {
    /// The topic ID (if applicable).
    pub topic_id: Option<String>,
    /// Warning message.
    pub message: String,
}

/// Validate a corpus for common issues.
pub fn validate_corpus(corpus: &ManifestCorpus) -> Vec<CorpusWarning> {
    let mut warnings = Vec::new();

    if corpus.entries.is_empty() {
        warnings.push(CorpusWarning {
            topic_id: None,
            message: "corpus has no topics".into(),
        });
    }

    let mut seen_ids = HashSet::new();
    for entry in &corpus.entries {
        if !seen_ids.insert(&entry.topic.id) {
            warnings.push(CorpusWarning {
                topic_id: Some(entry.topic.id.clone()),
                message: format!("duplicate topic ID: {}", entry.topic.id),
            });
        }
    }

    for entry in &corpus.entries {
        if entry.materials.is_empty() {
            warnings.push(CorpusWarning {
                topic_id: Some(entry.topic.id.clone()),
                message: "topic has no materials and will never be sampled".into(),
            });
        }
        for material in &entry.materials {
            if !material.has_content() {
                warnings.push(CorpusWarning {
                    topic_id: Some(entry.topic.id.clone()),
                    message: format!("material {} has neither excerpt nor images", material.id),
                });
            }
        }
    }

    warnings
}
