use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::RetrievalConfig;
use crate::index::EvidenceIndex;
use crate::models::{Chunk, ClaimRow, Query, RetrievalResult, RetrievedEvidence};

const MAX_ADAPTIVE_K: usize = 30;
const BASE_ADAPTIVE_K: usize = 10;
const WORDS_PER_EXTRA_CHUNK: usize = 20;
const MAX_EXPANSION_KEYWORDS: usize = 15;
const RERANK_CLAIM_WORDS: usize = 10;

const CONFINEMENT_TRIGGERS: [&str; 4] = ["imprison", "jail", "cell", "prison"];
const CONFINEMENT_SEED: &str = "confinement dungeon captive";
const DEATH_TRIGGERS: [&str; 4] = ["died", "death", "killed", "passed"];
const DEATH_SEED: &str = "deceased burial tomb";

const CONFLICT_WORDS: [&str; 6] = ["not", "never", "only", "instead", "imprisoned", "died"];

/// Points added per matching signal when ordering evidence by contradiction potential.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RerankWeights {
    pub character_match: i32,
    pub keyword_match: i32,
    pub year_present: i32,
    pub conflict_word: i32,
}

impl Default for RerankWeights {
    fn default() -> Self {
        Self {
            character_match: 5,
            keyword_match: 1,
            year_present: 2,
            conflict_word: 1,
        }
    }
}

#[derive(Clone)]
pub struct Retriever {
    index: Arc<EvidenceIndex>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(index: Arc<EvidenceIndex>, config: RetrievalConfig) -> Self {
        Self { index, config }
    }

    pub fn index(&self) -> &EvidenceIndex {
        &self.index
    }

    pub fn build_query(&self, row: &ClaimRow) -> Query {
        let k = if self.config.adaptive_k {
            adaptive_k(&row.claim_text)
        } else {
            self.config.default_k
        };

        Query {
            query_text: build_query_text(&row.character, &row.claim_text, self.config.expansion),
            character: row.character.clone(),
            claim_text: row.claim_text.clone(),
            target_book: row.book_name.clone(),
            k,
        }
    }

    pub async fn retrieve(&self, query: &Query) -> Result<RetrievedEvidence> {
        if query.k == 0 {
            return Ok(RetrievedEvidence::default());
        }

        let recall_k = query.k.saturating_mul(self.config.recall_multiplier.max(1));
        let candidates = self
            .index
            .query(&query.query_text, recall_k)
            .await
            .with_context(|| format!("evidence lookup failed for '{}'", query.target_book))?;
        let recalled = candidates.len();

        let mut results: Vec<RetrievalResult> = candidates
            .into_iter()
            .filter(|result| matches_book(&result.chunk, &query.target_book))
            .collect();

        if self.config.rerank {
            results = rerank_by_contradiction(
                results,
                &query.character,
                &query.claim_text,
                &self.config.rerank_weights,
            );
        }
        results.truncate(query.k);

        tracing::debug!(
            book = %query.target_book,
            recalled,
            kept = results.len(),
            k = query.k,
            "retrieved evidence"
        );

        Ok(RetrievedEvidence { results })
    }
}

/// Longer claims carry more facts to check, so they get more evidence.
pub fn adaptive_k(claim: &str) -> usize {
    let words = claim.split_whitespace().count();
    (BASE_ADAPTIVE_K + words / WORDS_PER_EXTRA_CHUNK).min(MAX_ADAPTIVE_K)
}

pub fn build_query_text(character: &str, claim: &str, expansion: bool) -> String {
    let base = format!("{character} {claim}");
    if !expansion {
        return base;
    }

    let keywords: Vec<&str> = long_word_re()
        .find_iter(claim)
        .map(|m| m.as_str())
        .take(MAX_EXPANSION_KEYWORDS)
        .collect();
    let keywords = if keywords.is_empty() {
        claim.to_string()
    } else {
        keywords.join(" ")
    };

    let mut parts = vec![base, keywords];
    if let Some(seed) = conflict_seed(claim) {
        parts.push(seed.to_string());
    }
    parts.join(" ")
}

fn conflict_seed(claim: &str) -> Option<&'static str> {
    let lower = claim.to_lowercase();
    if CONFINEMENT_TRIGGERS.iter().any(|w| lower.contains(w)) {
        Some(CONFINEMENT_SEED)
    } else if DEATH_TRIGGERS.iter().any(|w| lower.contains(w)) {
        Some(DEATH_SEED)
    } else {
        None
    }
}

/// Case-insensitive substring match of the target book against the chunk's path or file name.
pub fn matches_book(chunk: &Chunk, target_book: &str) -> bool {
    let target = target_book.trim().to_lowercase();
    chunk.path.to_lowercase().contains(&target) || chunk.source_file.to_lowercase().contains(&target)
}

pub fn contradiction_score(text: &str, character: &str, claim: &str, weights: &RerankWeights) -> i32 {
    let text = text.to_lowercase();
    let character = character.trim().to_lowercase();
    let mut score = 0;

    if !character.is_empty() && text.contains(&character) {
        score += weights.character_match;
    }

    let claim = claim.to_lowercase();
    for word in claim.split_whitespace().take(RERANK_CLAIM_WORDS) {
        if word.chars().count() > 4 && text.contains(word) {
            score += weights.keyword_match;
        }
    }

    if year_re().is_match(&text) {
        score += weights.year_present;
    }

    for word in CONFLICT_WORDS {
        if text.contains(word) {
            score += weights.conflict_word;
        }
    }

    score
}

/// Stable descending sort by contradiction score; ties keep similarity order.
pub fn rerank_by_contradiction(
    results: Vec<RetrievalResult>,
    character: &str,
    claim: &str,
    weights: &RerankWeights,
) -> Vec<RetrievalResult> {
    let mut scored: Vec<(i32, RetrievalResult)> = results
        .into_iter()
        .map(|result| {
            let score = contradiction_score(&result.chunk.text, character, claim, weights);
            (score, result)
        })
        .collect();

    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.into_iter().map(|(_, result)| result).collect()
}

fn long_word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[A-Za-z]{5,}\b").expect("valid keyword regex"))
}

fn year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(?:17|18|19)\d{2}\b").expect("valid year regex"))
}
