use serde::{Deserialize, Serialize};

use crate::models::{Conflict, ConflictKind, EntityState};

const IMPRISONMENT_WORDS: [&str; 7] = [
    "imprisoned",
    "prison",
    "dungeon",
    "jail",
    "captive",
    "cell",
    "d'if",
];
const PRISON_PLACES: [&str; 4] = ["prison", "jail", "cell", "dungeon"];
const DEATH_WORDS: [&str; 7] = [
    "died",
    "deceased",
    "grave",
    "buried",
    "death",
    "killed",
    "guillotine",
];

pub const IMPRISONED_CONTEXT: &str = "Character was imprisoned at this time.";
pub const DIED_CONTEXT: &str = "Character died in or before this year.";

pub const NO_EVIDENCE_SUMMARY: &str = "No specific evidence for cross-referencing.";
pub const NO_CONFLICTS_SUMMARY: &str = "No programmatic conflicts detected.";

/// A deterministic check of a claim against what the narrative states say.
pub trait ConstraintRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, claim: &EntityState, narrative: &[EntityState]) -> Vec<Conflict>;
}

/// The character cannot be somewhere the narrative does not mention in a year it covers.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocationConflictRule;

impl ConstraintRule for LocationConflictRule {
    fn name(&self) -> &'static str {
        "location"
    }

    fn check(&self, claim: &EntityState, narrative: &[EntityState]) -> Vec<Conflict> {
        if claim.years.is_empty() || claim.locations.is_empty() {
            return vec![];
        }

        let mut conflicts = Vec::new();
        for state in narrative {
            let Some(year) = earliest_shared_year(claim, state) else {
                continue;
            };

            let persons = shared_persons(claim, state);
            if persons.is_empty() {
                continue;
            }

            let snippet = state.content_snippet.to_lowercase();
            for location in &claim.locations {
                if snippet.contains(&location.to_lowercase()) {
                    continue;
                }
                conflicts.push(Conflict {
                    kind: ConflictKind::LocationConflict,
                    years: vec![year],
                    death_year: None,
                    backstory_location: Some(location.clone()),
                    narrative_locations: state.locations.iter().cloned().collect(),
                    persons: persons.clone(),
                    chapter: state.chapter_label().to_string(),
                    narrative_context: String::new(),
                });
            }
        }
        conflicts
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImprisonmentRule;

impl ConstraintRule for ImprisonmentRule {
    fn name(&self) -> &'static str {
        "imprisonment"
    }

    fn check(&self, claim: &EntityState, narrative: &[EntityState]) -> Vec<Conflict> {
        if claim.locations.is_empty() {
            return vec![];
        }

        let mut conflicts = Vec::new();
        for state in narrative {
            let snippet = state.content_snippet.to_lowercase();
            if !IMPRISONMENT_WORDS.iter().any(|w| snippet.contains(w)) {
                continue;
            }
            let Some(year) = earliest_shared_year(claim, state) else {
                continue;
            };

            for location in &claim.locations {
                if PRISON_PLACES.contains(&location.to_lowercase().as_str()) {
                    continue;
                }
                conflicts.push(Conflict {
                    kind: ConflictKind::ImprisonmentViolation,
                    years: vec![year],
                    death_year: None,
                    backstory_location: Some(location.clone()),
                    narrative_locations: vec![],
                    persons: vec![],
                    chapter: state.chapter_label().to_string(),
                    narrative_context: IMPRISONED_CONTEXT.to_string(),
                });
            }
        }
        conflicts
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PostMortemRule;

impl ConstraintRule for PostMortemRule {
    fn name(&self) -> &'static str {
        "post_mortem"
    }

    fn check(&self, claim: &EntityState, narrative: &[EntityState]) -> Vec<Conflict> {
        let mut conflicts = Vec::new();
        for state in narrative {
            let snippet = state.content_snippet.to_lowercase();
            if !DEATH_WORDS.iter().any(|w| snippet.contains(w)) {
                continue;
            }
            let Some(&death_year) = state.years.iter().next_back() else {
                continue;
            };

            let after: Vec<i32> = claim
                .years
                .iter()
                .copied()
                .filter(|year| *year > death_year)
                .collect();
            if after.is_empty() {
                continue;
            }

            conflicts.push(Conflict {
                kind: ConflictKind::PostMortemActivity,
                years: after,
                death_year: Some(death_year),
                backstory_location: None,
                narrative_locations: vec![],
                persons: vec![],
                chapter: state.chapter_label().to_string(),
                narrative_context: DIED_CONTEXT.to_string(),
            });
        }
        conflicts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConstraintReport {
    pub conflicts: Vec<Conflict>,
    pub summary: String,
}

impl ConstraintReport {
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }

    pub fn to_prompt_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| self.summary.clone())
    }
}

pub struct ConstraintEngine {
    rules: Vec<Box<dyn ConstraintRule>>,
}

impl Default for ConstraintEngine {
    fn default() -> Self {
        Self::new(vec![
            Box::new(LocationConflictRule),
            Box::new(ImprisonmentRule),
            Box::new(PostMortemRule),
        ])
    }
}

impl ConstraintEngine {
    pub fn new(rules: Vec<Box<dyn ConstraintRule>>) -> Self {
        Self { rules }
    }

    /// Runs every rule; findings are advisory context for the judge.
    pub fn evaluate(&self, claim: &EntityState, narrative: &[EntityState]) -> ConstraintReport {
        if narrative.is_empty() {
            return ConstraintReport {
                conflicts: vec![],
                summary: NO_EVIDENCE_SUMMARY.to_string(),
            };
        }

        let mut conflicts = Vec::new();
        for rule in &self.rules {
            let found = rule.check(claim, narrative);
            if !found.is_empty() {
                tracing::debug!(rule = rule.name(), count = found.len(), "constraint rule fired");
            }
            conflicts.extend(found);
        }

        let summary = if conflicts.is_empty() {
            NO_CONFLICTS_SUMMARY.to_string()
        } else {
            format!("Detected {} potential factual conflicts.", conflicts.len())
        };

        ConstraintReport { conflicts, summary }
    }
}

fn earliest_shared_year(claim: &EntityState, state: &EntityState) -> Option<i32> {
    claim.years.intersection(&state.years).next().copied()
}

/// Claim persons matching a narrative person by case-insensitive containment either way.
fn shared_persons(claim: &EntityState, state: &EntityState) -> Vec<String> {
    claim
        .persons
        .iter()
        .filter(|person| {
            let person = person.to_lowercase();
            state.persons.iter().any(|other| {
                let other = other.to_lowercase();
                other.contains(&person) || person.contains(&other)
            })
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(
        persons: &[&str],
        locations: &[&str],
        years: &[i32],
        chapter: Option<&str>,
        snippet: &str,
    ) -> EntityState {
        EntityState::new(
            persons.iter().map(|s| s.to_string()),
            locations.iter().map(|s| s.to_string()),
            years.iter().copied(),
            chapter.map(|_| 10.0),
            chapter.map(str::to_string),
            snippet,
        )
    }

    #[test]
    fn letter_recipient_does_not_become_a_conflicting_place() {
        let extractor = crate::extract::FactExtractor::default();
        let claim = extractor.claim_state("Dantes", "In 1815, Dantes wrote to Mercedes from Paris.");
        let narrative = vec![extractor.claim_state("Dantes", "In 1815 Dantes lived quietly in Paris.")];

        assert_eq!(claim.locations.iter().collect::<Vec<_>>(), vec!["Paris"]);
        assert!(LocationConflictRule.check(&claim, &narrative).is_empty());
    }

    #[test]
    fn location_conflict_for_shared_person_and_year() {
        let claim = state(&["Dantes"], &["Paris"], &[1815], None, "");
        let narrative = vec![state(
            &["Dantes"],
            &["Chateau d'If"],
            &[1815],
            Some("CHAPTER VIII"),
            "In 1815 Dantes was thrown into the dungeon of the Chateau d'If.",
        )];

        let report = ConstraintEngine::default().evaluate(&claim, &narrative);
        let locations: Vec<&Conflict> = report
            .conflicts
            .iter()
            .filter(|c| c.kind == ConflictKind::LocationConflict)
            .collect();
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].years, vec![1815]);
        assert_eq!(locations[0].backstory_location.as_deref(), Some("Paris"));
        assert_eq!(locations[0].narrative_locations, vec!["Chateau d'If"]);
        assert_eq!(locations[0].chapter, "CHAPTER VIII");
    }

    #[test]
    fn location_mentioned_in_snippet_is_not_a_conflict() {
        let claim = state(&["Dantes"], &["Marseilles"], &[1815], None, "");
        let narrative = vec![state(
            &["Edmond Dantes"],
            &["Marseilles"],
            &[1815],
            Some("CHAPTER I"),
            "In 1815 Edmond Dantes came home to Marseilles.",
        )];
        assert!(LocationConflictRule.check(&claim, &narrative).is_empty());
    }

    #[test]
    fn location_rule_needs_a_shared_person() {
        let claim = state(&["Villefort"], &["Paris"], &[1815], None, "");
        let narrative = vec![state(&["Dantes"], &[], &[1815], Some("I"), "Dantes at sea.")];
        assert!(LocationConflictRule.check(&claim, &narrative).is_empty());
    }

    #[test]
    fn imprisonment_skips_prison_locations() {
        let claim = state(&[], &["Dungeon", "Rome"], &[1816], None, "");
        let narrative = vec![state(&[], &[], &[1816], Some("XIV"), "He remained a captive.")];
        let conflicts = ImprisonmentRule.check(&claim, &narrative);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].backstory_location.as_deref(), Some("Rome"));
        assert_eq!(conflicts[0].narrative_context, IMPRISONED_CONTEXT);
    }

    #[test]
    fn post_mortem_lists_every_later_claim_year() {
        let claim = state(&[], &[], &[1810, 1830, 1845], None, "");
        let narrative = vec![state(
            &[],
            &[],
            &[1815, 1820],
            Some("CHAPTER C"),
            "He died in 1820 and was buried at Pere-Lachaise.",
        )];

        let conflicts = PostMortemRule.check(&claim, &narrative);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].kind, ConflictKind::PostMortemActivity);
        assert_eq!(conflicts[0].death_year, Some(1820));
        assert_eq!(conflicts[0].years, vec![1830, 1845]);
    }

    #[test]
    fn post_mortem_needs_narrative_years() {
        let claim = state(&[], &[], &[1830], None, "");
        let narrative = vec![state(&[], &[], &[], Some("X"), "He died.")];
        assert!(PostMortemRule.check(&claim, &narrative).is_empty());
    }

    #[test]
    fn summaries_reflect_findings() {
        let engine = ConstraintEngine::default();
        let claim = state(&["Dantes"], &[], &[], None, "");

        let empty = engine.evaluate(&claim, &[]);
        assert_eq!(empty.summary, NO_EVIDENCE_SUMMARY);

        let quiet = engine.evaluate(&claim, &[state(&[], &[], &[], Some("I"), "calm seas")]);
        assert!(quiet.is_clean());
        assert_eq!(quiet.summary, NO_CONFLICTS_SUMMARY);

        let json: serde_json::Value = serde_json::from_str(&quiet.to_prompt_json()).unwrap();
        assert_eq!(json["conflicts"], serde_json::json!([]));
    }
}
