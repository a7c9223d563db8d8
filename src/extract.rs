use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::models::{Chunk, EntityState};

pub const DEFAULT_GAZETTEER: [&str; 7] = [
    "Chateau",
    "Paris",
    "London",
    "Marseilles",
    "Rome",
    "Island",
    "Dungeon",
];

/// Capitalized words that open sentences far more often than they name anyone.
const NAME_STOPLIST: [&str; 9] = ["The", "He", "She", "It", "They", "But", "In", "On", "At"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecognizedEntities {
    pub persons: Vec<String>,
    pub locations: Vec<String>,
}

pub trait EntityRecognizer: Send + Sync {
    fn recognize(&self, text: &str) -> RecognizedEntities;
}

/// Pattern-based recognizer: titled names become persons, capitalized
/// phrases after a locative preposition become places.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedRecognizer;

impl EntityRecognizer for RuleBasedRecognizer {
    fn recognize(&self, text: &str) -> RecognizedEntities {
        let mut entities = RecognizedEntities::default();

        for caps in honorific_re().captures_iter(text) {
            if let Some(name) = caps.get(1) {
                push_unique(&mut entities.persons, name.as_str());
            }
        }

        for caps in locative_re().captures_iter(text) {
            let (Some(preposition), Some(place)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            let place = place.as_str();
            // "wrote to Mercedes": a lone name after "to" is usually a recipient.
            if preposition.as_str() == "to" && !place.contains(' ') {
                continue;
            }
            if NAME_STOPLIST.contains(&place) || entities.persons.iter().any(|p| p == place) {
                continue;
            }
            push_unique(&mut entities.locations, place);
        }

        entities
    }
}

#[derive(Clone)]
pub struct FactExtractor {
    recognizer: Arc<dyn EntityRecognizer>,
    gazetteer: Vec<String>,
}

impl Default for FactExtractor {
    fn default() -> Self {
        Self::new(
            Arc::new(RuleBasedRecognizer),
            DEFAULT_GAZETTEER.iter().map(|s| s.to_string()).collect(),
        )
    }
}

impl FactExtractor {
    pub fn new(recognizer: Arc<dyn EntityRecognizer>, gazetteer: Vec<String>) -> Self {
        Self {
            recognizer,
            gazetteer,
        }
    }

    pub fn extract_entities(&self, text: &str) -> RecognizedEntities {
        let mut entities = self.recognizer.recognize(text);

        let lower = text.to_lowercase();
        for place in &self.gazetteer {
            if lower.contains(&place.to_lowercase()) {
                push_unique(&mut entities.locations, place);
            }
        }

        for m in capitalized_re().find_iter(text) {
            let word = m.as_str();
            if NAME_STOPLIST.contains(&word) || self.gazetteer.iter().any(|g| g == word) {
                continue;
            }
            push_unique(&mut entities.persons, word);
        }

        entities
    }

    /// One state per chunk, ordered by narrative progress.
    pub fn states_from_chunks<'a>(
        &self,
        chunks: impl IntoIterator<Item = &'a Chunk>,
    ) -> Vec<EntityState> {
        let mut states: Vec<EntityState> = chunks
            .into_iter()
            .map(|chunk| {
                let entities = self.extract_entities(&chunk.text);
                EntityState::new(
                    entities.persons,
                    entities.locations,
                    extract_years(&chunk.text),
                    Some(chunk.progress_pct),
                    Some(chunk.chapter_title.clone()),
                    &chunk.text,
                )
            })
            .collect();

        states.sort_by(|a, b| {
            let a = a.progress_pct.unwrap_or(0.0);
            let b = b.progress_pct.unwrap_or(0.0);
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        });
        states
    }

    /// State for a backstory claim about `character`; the character's own name is never a place.
    pub fn claim_state(&self, character: &str, claim: &str) -> EntityState {
        let mut entities = self.extract_entities(claim);
        let name_parts: Vec<String> = character
            .split_whitespace()
            .map(str::to_lowercase)
            .collect();
        entities.locations.retain(|place| {
            !place
                .split_whitespace()
                .any(|word| name_parts.contains(&word.to_lowercase()))
        });
        EntityState::new(
            entities.persons,
            entities.locations,
            extract_years(claim),
            None,
            None,
            claim,
        )
    }
}

/// Four-digit years from 1700 to 1999, deduplicated and ascending.
pub fn extract_years(text: &str) -> Vec<i32> {
    year_re()
        .find_iter(text)
        .filter_map(|m| m.as_str().parse::<i32>().ok())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn push_unique(items: &mut Vec<String>, value: &str) {
    if !items.iter().any(|existing| existing == value) {
        items.push(value.to_string());
    }
}

fn year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(?:17|18|19)\d{2}\b").expect("valid year regex"))
}

fn capitalized_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[A-Z][a-z]+\b").expect("valid name regex"))
}

fn honorific_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\b(?:Mr|Mrs|Miss|Monsieur|Madame|Mademoiselle|Sir|Lord|Lady|Captain|Abbe|Abbé|Count|Countess|Baron|Baroness|Major|Doctor|Dr)\.?\s+([A-Z][\w'\-]+(?:\s+[A-Z][\w'\-]+)?)",
        )
        .expect("valid honorific regex")
    })
}

fn locative_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(in|at|to|from|near|toward|towards)\s+([A-Z][a-z]+(?:\s+[A-Z][a-z]+)?)")
            .expect("valid locative regex")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str, chapter: &str, progress: f32) -> Chunk {
        Chunk {
            id: chapter.to_string(),
            path: "monte.txt".to_string(),
            source_file: "monte.txt".to_string(),
            ordinal: 0,
            chapter_title: chapter.to_string(),
            progress_pct: progress,
            start: 0,
            end: text.len(),
            text: text.to_string(),
        }
    }

    #[test]
    fn years_are_sorted_and_deduplicated() {
        assert_eq!(
            extract_years("In 1815, he was in Paris and in 1820 in London."),
            vec![1815, 1820]
        );
        assert_eq!(extract_years("1820, 1815, 1820 and 2020 or 1699"), vec![1815, 1820]);
        assert!(extract_years("no dates here, only 18150 and 815").is_empty());
    }

    #[test]
    fn rule_based_recognizer_finds_titles_and_places() {
        let entities =
            RuleBasedRecognizer.recognize("Monsieur Morrel sailed from Genoa to New Orleans in The spring.");
        assert_eq!(entities.persons, vec!["Morrel"]);
        assert_eq!(entities.locations, vec!["Genoa", "New Orleans"]);
    }

    #[test]
    fn people_after_prepositions_are_not_places() {
        let entities = RuleBasedRecognizer
            .recognize("Dantes wrote to Mercedes and dined with Monsieur Morrel at Morrel before leaving from Paris.");
        assert_eq!(entities.persons, vec!["Morrel"]);
        assert_eq!(entities.locations, vec!["Paris"]);
    }

    #[test]
    fn claim_character_is_never_a_place() {
        let state = FactExtractor::default()
            .claim_state("Edmond Dantes", "In 1815 the letters came from Dantes near Marseilles.");
        assert_eq!(state.locations.iter().collect::<Vec<_>>(), vec!["Marseilles"]);
    }

    #[test]
    fn gazetteer_and_capitalized_fallback_are_merged() {
        let extractor = FactExtractor::default();
        let entities = extractor.extract_entities("The Abbe Faria dug toward the dungeon of the Chateau.");
        assert!(entities.locations.contains(&"Dungeon".to_string()));
        assert!(entities.locations.contains(&"Chateau".to_string()));
        assert!(entities.persons.contains(&"Faria".to_string()));
        assert!(!entities.persons.contains(&"The".to_string()));
        assert!(!entities.persons.contains(&"Chateau".to_string()));
    }

    #[test]
    fn claim_state_has_no_progress() {
        let state = FactExtractor::default().claim_state("Dantes", "In 1815, Dantes was in Paris.");
        assert_eq!(state.progress_pct, None);
        assert!(state.persons.contains("Dantes"));
        assert_eq!(state.locations.iter().collect::<Vec<_>>(), vec!["Paris"]);
        assert_eq!(state.years.iter().copied().collect::<Vec<_>>(), vec![1815]);
    }

    #[test]
    fn narrative_states_follow_progress() {
        let chunks = [
            chunk("Later, in 1829, Dantes returned.", "CHAPTER XX", 60.0),
            chunk("In 1815 Dantes sailed home.", "CHAPTER I", 1.5),
        ];
        let states = FactExtractor::default().states_from_chunks(&chunks);
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].chapter_label(), "CHAPTER I");
        assert_eq!(states[1].years.iter().copied().collect::<Vec<_>>(), vec![1829]);
    }
}
