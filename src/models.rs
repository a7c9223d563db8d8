use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

pub const FULL_TEXT_TITLE: &str = "Full Text";
pub const PREAMBLE_TITLE: &str = "Preamble";
pub const UNKNOWN_PATH: &str = "unknown_path";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub path: String,
    pub source_file: String,
    pub ordinal: i64,
    pub chapter_title: String,
    pub progress_pct: f32,
    pub start: usize,
    pub end: usize,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct EmbeddingRecord {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookManifest {
    pub path: String,
    pub source_hash: String,
    pub embedding_model: String,
    pub chunk_count: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSummary {
    pub path: String,
    pub source_file: String,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub query_text: String,
    pub character: String,
    pub claim_text: String,
    pub target_book: String,
    pub k: usize,
}

#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub chunk: Chunk,
    pub score: f32,
}

/// Evidence surviving book filtering and reranking, capped at the query's k.
#[derive(Debug, Clone, Default)]
pub struct RetrievedEvidence {
    pub results: Vec<RetrievalResult>,
}

impl RetrievedEvidence {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.results.iter().map(|result| &result.chunk)
    }
}

pub const MIN_YEAR: i32 = 1700;
pub const MAX_YEAR: i32 = 1999;
pub const SNIPPET_CHARS: usize = 500;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EntityState {
    pub persons: BTreeSet<String>,
    pub locations: BTreeSet<String>,
    pub years: BTreeSet<i32>,
    pub progress_pct: Option<f32>,
    pub chapter: Option<String>,
    pub content_snippet: String,
}

impl EntityState {
    /// Builds a state, dropping out-of-range years and clamping progress.
    pub fn new(
        persons: impl IntoIterator<Item = String>,
        locations: impl IntoIterator<Item = String>,
        years: impl IntoIterator<Item = i32>,
        progress_pct: Option<f32>,
        chapter: Option<String>,
        content: &str,
    ) -> Self {
        Self {
            persons: persons
                .into_iter()
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            locations: locations
                .into_iter()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect(),
            years: years
                .into_iter()
                .filter(|y| (MIN_YEAR..=MAX_YEAR).contains(y))
                .collect(),
            progress_pct: progress_pct
                .filter(|p| p.is_finite())
                .map(|p| p.clamp(0.0, 100.0)),
            chapter,
            content_snippet: content.chars().take(SNIPPET_CHARS).collect(),
        }
    }

    pub fn chapter_label(&self) -> &str {
        self.chapter.as_deref().unwrap_or("Unknown")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConflictKind {
    #[serde(rename = "Location Conflict")]
    LocationConflict,
    #[serde(rename = "Imprisonment Violation")]
    ImprisonmentViolation,
    #[serde(rename = "Post-Mortem Activity")]
    PostMortemActivity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conflict {
    #[serde(rename = "type")]
    pub kind: ConflictKind,
    pub years: Vec<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub death_year: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backstory_location: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub narrative_locations: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub persons: Vec<String>,
    pub chapter: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub narrative_context: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Label {
    Consistent,
    Contradictory,
}

impl Label {
    /// Wire value used in the model's JSON contract: 1 = consistent.
    pub fn from_flag(flag: i64) -> Option<Self> {
        match flag {
            1 => Some(Label::Consistent),
            0 => Some(Label::Contradictory),
            _ => None,
        }
    }

    pub fn as_flag(self) -> i64 {
        match self {
            Label::Consistent => 1,
            Label::Contradictory => 0,
        }
    }

    pub fn parse_loose(value: &str) -> Option<Self> {
        let lower = value.trim().to_ascii_lowercase();
        if lower.starts_with("contradict") {
            Some(Label::Contradictory)
        } else if lower.starts_with("consistent") {
            Some(Label::Consistent)
        } else {
            lower.parse::<i64>().ok().and_then(Label::from_flag)
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Consistent => write!(f, "Consistent"),
            Label::Contradictory => write!(f, "Contradictory"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Confidence {
    High,
    #[default]
    Medium,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Verdict {
    pub label: Label,
    pub confidence: Confidence,
    pub rationale: String,
}

impl Verdict {
    /// The fail-safe verdict: a false contradiction costs more than a miss.
    pub fn safe_default(reason: impl Into<String>) -> Self {
        Self {
            label: Label::Consistent,
            confidence: Confidence::Medium,
            rationale: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimRow {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub book_name: String,
    #[serde(alias = "char")]
    pub character: String,
    #[serde(alias = "content", alias = "backstory")]
    pub claim_text: String,
    #[serde(default)]
    pub label: Option<String>,
}

/// Dataset ids arrive as integers or strings; both become a string.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(id) => Ok(id),
        Value::Number(id) => Ok(id.to_string()),
        other => Err(D::Error::custom(format!(
            "expected a string or number id, got {other}"
        ))),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerdictRow {
    pub id: String,
    pub label: Label,
    pub confidence: Confidence,
    pub rationale: String,
    #[serde(default)]
    pub conflicts: Vec<Conflict>,
    #[serde(default)]
    pub evidence_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyBatchRequest {
    pub rows: Vec<ClaimRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyBatchResponse {
    pub run_id: String,
    pub results: Vec<VerdictRow>,
}
