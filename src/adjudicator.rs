use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::constraints::ConstraintReport;
use crate::llm::{CompletionOptions, LanguageModel};
use crate::models::{Confidence, Label, RetrievedEvidence, Verdict};

const EVIDENCE_SEPARATOR: &str = "\n---\n";

/// Everything the judge sees for one claim.
pub struct AdjudicationInput<'a> {
    pub character: &'a str,
    pub claim: &'a str,
    pub target_book: &'a str,
    pub evidence: &'a RetrievedEvidence,
    pub report: &'a ConstraintReport,
}

#[derive(Clone)]
pub struct Adjudicator {
    llm: Arc<dyn LanguageModel>,
    generation_limit: Arc<Semaphore>,
    dual_pass: bool,
    max_output_tokens: usize,
}

impl Adjudicator {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        generation_limit: Arc<Semaphore>,
        dual_pass: bool,
        max_output_tokens: usize,
    ) -> Self {
        Self {
            llm,
            generation_limit,
            dual_pass,
            max_output_tokens,
        }
    }

    /// Always yields a verdict; model and parse failures become the consistent default.
    pub async fn adjudicate(&self, input: &AdjudicationInput<'_>) -> Verdict {
        let evidence = format_evidence(input.evidence, input.target_book);
        let analysis = input.report.to_prompt_json();
        let prompt = build_judge_prompt(input.character, input.claim, &evidence, &analysis);

        let first = match self.complete(&prompt).await {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(model = self.llm.model_name(), error = %err, "judge pass failed");
                return Verdict::safe_default(format!("Language model call failed: {err:#}"));
            }
        };

        let raw = if self.dual_pass {
            let review = build_review_prompt(
                input.character,
                input.claim,
                &evidence,
                &analysis,
                &sanitize_model_output(first),
            );
            match self.complete(&review).await {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(model = self.llm.model_name(), error = %err, "review pass failed");
                    return Verdict::safe_default(format!("Review call failed: {err:#}"));
                }
            }
        } else {
            first
        };

        match parse_verdict(&raw) {
            Ok((label, rationale)) => Verdict {
                label,
                confidence: derive_confidence(&raw),
                rationale,
            },
            Err(err) => {
                tracing::warn!(error = %err, "judge output was not a usable verdict");
                Verdict::safe_default(format!("Unparseable verdict: {err:#}"))
            }
        }
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let _permit = self.generation_limit.acquire().await?;
        self.llm
            .complete(
                prompt,
                CompletionOptions {
                    temperature: 0.0,
                    max_tokens: self.max_output_tokens,
                },
            )
            .await
    }
}

pub fn format_evidence(evidence: &RetrievedEvidence, target_book: &str) -> String {
    if evidence.is_empty() {
        return format!("No evidence found from '{target_book}'.");
    }

    evidence
        .chunks()
        .map(|chunk| {
            format!(
                "[{} | {:.1}%]\n{}",
                chunk.chapter_title, chunk.progress_pct, chunk.text
            )
        })
        .collect::<Vec<_>>()
        .join(EVIDENCE_SEPARATOR)
}

pub fn build_judge_prompt(character: &str, claim: &str, evidence: &str, analysis: &str) -> String {
    format!(
        "You are a literary consistency judge. Decide whether a hypothesized backstory for a character \
         is consistent with the events of a novel.\n\n\
         CHARACTER: {character}\n\
         BACKSTORY CLAIM: {claim}\n\n\
         --- NOVEL EVIDENCE ---\n{evidence}\n\n\
         --- PROGRAMMATIC ANALYSIS (timeline and entities) ---\n{analysis}\n\n\
         --- INSTRUCTIONS ---\n\
         1. Compare the claim with the evidence and the programmatic analysis.\n\
         2. Look for temporal violations (two places at once, acting after death), location mismatches \
         for a given year, and status changes (imprisoned in the novel but free in the claim).\n\
         3. Programmatic conflicts are hints produced by simple rules. Confirm them against the evidence \
         before relying on them.\n\
         4. NEGATIVE EVIDENCE: silence is not contradiction. Only a mutually exclusive fact stated by the \
         novel contradicts the claim.\n\
         5. DEFAULT TO CONSISTENT: unless the contradiction is irrefutable, answer 1.\n\n\
         --- OUTPUT ---\n\
         Respond with JSON only, no code fences:\n\
         {{\"label\": 1 or 0, \"rationale\": \"EVIDENCE: <quote or chapter> -> CLAIM: <claim fragment> -> ANALYSIS: <why>\", \
         \"confidence\": \"high\" | \"medium\" | \"low\"}}\n\
         label 1 means Consistent, 0 means Contradictory."
    )
}

pub fn build_review_prompt(
    character: &str,
    claim: &str,
    evidence: &str,
    analysis: &str,
    first_verdict: &str,
) -> String {
    format!(
        "You are the defense attorney for a character backstory. A judge has ruled on whether the \
         backstory contradicts the novel. Review that ruling.\n\n\
         CHARACTER: {character}\n\
         BACKSTORY CLAIM: {claim}\n\n\
         --- NOVEL EVIDENCE ---\n{evidence}\n\n\
         --- PROGRAMMATIC ANALYSIS (timeline and entities) ---\n{analysis}\n\n\
         --- JUDGE'S RULING ---\n{first_verdict}\n\n\
         --- INSTRUCTIONS ---\n\
         1. If the ruling is Contradictory (0), overturn it to Consistent (1) unless the evidence states a \
         fact that is irrefutably incompatible with the claim.\n\
         2. Missing information, vague passages and rule-based hints alone are not irrefutable.\n\
         3. If the ruling is Consistent (1), keep it unless the evidence explicitly refutes the claim.\n\n\
         --- OUTPUT ---\n\
         Respond with JSON only, no code fences:\n\
         {{\"label\": 1 or 0, \"rationale\": \"EVIDENCE: <quote or chapter> -> CLAIM: <claim fragment> -> ANALYSIS: <why>\", \
         \"confidence\": \"high\" | \"medium\" | \"low\"}}\n\
         label 1 means Consistent, 0 means Contradictory."
    )
}

/// Extracts the label and rationale from model output, tolerating fences and prose around the JSON.
pub fn parse_verdict(raw: &str) -> Result<(Label, String)> {
    let text = sanitize_model_output(raw.to_string());
    let value = decode_json_object(&text)?;

    let label = match value.get("label") {
        Some(Value::Number(n)) => n.as_i64().and_then(Label::from_flag),
        Some(Value::String(s)) => Label::parse_loose(s),
        Some(Value::Bool(flag)) => Some(if *flag {
            Label::Consistent
        } else {
            Label::Contradictory
        }),
        _ => None,
    }
    .with_context(|| format!("missing or invalid label in {}", value))?;

    let rationale = value
        .get("rationale")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Ok((label, rationale))
}

fn decode_json_object(text: &str) -> Result<Value> {
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(text) {
        return Ok(value);
    }

    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => serde_json::from_str::<Value>(&text[start..=end])
            .context("model output contains no decodable JSON object"),
        _ => anyhow::bail!("model output contains no JSON object"),
    }
}

pub fn derive_confidence(raw: &str) -> Confidence {
    let lower = raw.to_lowercase();
    if let Some(level) = confidence_re()
        .captures(&lower)
        .and_then(|caps| caps.get(1))
    {
        return match level.as_str() {
            "high" => Confidence::High,
            "low" => Confidence::Low,
            _ => Confidence::Medium,
        };
    }

    if lower.contains("high confidence") {
        Confidence::High
    } else if lower.contains("low confidence") {
        Confidence::Low
    } else {
        Confidence::Medium
    }
}

pub fn sanitize_model_output(answer: String) -> String {
    let mut text = answer.trim().to_string();
    if text.starts_with("```") {
        if let Some(body) = fence_re().captures(&text).and_then(|caps| caps.get(1)) {
            text = body.as_str().trim().to_string();
        } else {
            text = text.replace("```", "").trim().to_string();
        }
    }
    text
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)^```[a-zA-Z]*\n(.*)\n```$").expect("valid fence regex"))
}

fn confidence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"confidence"?\s*[:=]\s*"?(high|medium|low)"#).expect("valid confidence regex")
    })
}
