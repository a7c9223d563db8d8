use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{stream, StreamExt};
use tokio::sync::Semaphore;

use crate::adjudicator::{AdjudicationInput, Adjudicator};
use crate::config::{AppConfig, EmbeddingProvider, LlmProvider};
use crate::constraints::ConstraintEngine;
use crate::embedding::{Embedder, HashedEmbedder};
use crate::extract::FactExtractor;
use crate::index::EvidenceIndex;
use crate::llm::LanguageModel;
use crate::models::{ClaimRow, RetrievedEvidence, VerdictRow};
use crate::ollama::{OllamaClient, OllamaEmbedder, OllamaJudge};
use crate::openai_compat::OpenAiCompatClient;
use crate::retrieval::Retriever;

pub fn embedder_from_config(config: &AppConfig) -> Result<Arc<dyn Embedder>> {
    let embedder: Arc<dyn Embedder> = match config.embedding_provider()? {
        EmbeddingProvider::Hashed => Arc::new(HashedEmbedder::new(config.models.hashed_dimensions)),
        EmbeddingProvider::Ollama => {
            let client = OllamaClient::new(
                config.ollama_base_url.clone(),
                Duration::from_secs(config.judge.timeout_secs),
            )?;
            Arc::new(OllamaEmbedder::new(client, config.models.embedding_model.clone()))
        }
    };
    Ok(embedder)
}

pub fn language_model_from_config(config: &AppConfig) -> Result<Arc<dyn LanguageModel>> {
    let timeout = Duration::from_secs(config.judge.timeout_secs);
    let llm: Arc<dyn LanguageModel> = match config.llm_provider()? {
        LlmProvider::Ollama => {
            let client = OllamaClient::new(config.ollama_base_url.clone(), timeout)?;
            Arc::new(OllamaJudge::new(client, config.models.judge_model.clone()))
        }
        LlmProvider::OpenAiCompatible => {
            let api_key = config
                .models
                .api_key
                .clone()
                .context("hosted LLM provider selected but no API key is set")?;
            Arc::new(OpenAiCompatClient::new(
                config.models.api_base_url.clone(),
                api_key,
                config.models.judge_model.clone(),
                timeout,
            )?)
        }
    };
    Ok(llm)
}

/// Runs one claim through retrieval, fact extraction, constraint checks and judgment.
pub struct Verifier {
    retriever: Retriever,
    extractor: FactExtractor,
    engine: ConstraintEngine,
    adjudicator: Adjudicator,
}

impl Verifier {
    pub fn new(
        retriever: Retriever,
        extractor: FactExtractor,
        engine: ConstraintEngine,
        adjudicator: Adjudicator,
    ) -> Self {
        Self {
            retriever,
            extractor,
            engine,
            adjudicator,
        }
    }

    pub fn from_config(config: &AppConfig, index: Arc<EvidenceIndex>) -> Result<Self> {
        let llm = language_model_from_config(config)?;
        Ok(Self::with_language_model(config, index, llm))
    }

    pub fn with_language_model(
        config: &AppConfig,
        index: Arc<EvidenceIndex>,
        llm: Arc<dyn LanguageModel>,
    ) -> Self {
        let generation_limit = Arc::new(Semaphore::new(config.judge.llm_max_concurrency.max(1)));
        Self::new(
            Retriever::new(index, config.retrieval.clone()),
            FactExtractor::default(),
            ConstraintEngine::default(),
            Adjudicator::new(
                llm,
                generation_limit,
                config.judge.dual_pass,
                config.judge.max_output_tokens,
            ),
        )
    }

    pub fn index(&self) -> &EvidenceIndex {
        self.retriever.index()
    }

    pub async fn verify(&self, row: &ClaimRow) -> VerdictRow {
        let query = self.retriever.build_query(row);
        let evidence = match self.retriever.retrieve(&query).await {
            Ok(evidence) => evidence,
            Err(err) => {
                tracing::warn!(row = %row.id, error = %err, "retrieval failed; judging without evidence");
                RetrievedEvidence::default()
            }
        };

        let narrative = self.extractor.states_from_chunks(evidence.chunks());
        let claim = self.extractor.claim_state(&row.character, &row.claim_text);
        let report = self.engine.evaluate(&claim, &narrative);

        let verdict = self
            .adjudicator
            .adjudicate(&AdjudicationInput {
                character: &row.character,
                claim: &row.claim_text,
                target_book: &row.book_name,
                evidence: &evidence,
                report: &report,
            })
            .await;

        tracing::info!(
            row = %row.id,
            book = %row.book_name,
            evidence = evidence.len(),
            conflicts = report.conflicts.len(),
            label = %verdict.label,
            "verified claim"
        );

        VerdictRow {
            id: row.id.clone(),
            label: verdict.label,
            confidence: verdict.confidence,
            rationale: verdict.rationale,
            conflicts: report.conflicts,
            evidence_count: evidence.len(),
        }
    }

    /// Verifies rows with bounded concurrency; results come back in input order.
    pub async fn verify_batch(&self, rows: &[ClaimRow], concurrency: usize) -> Vec<VerdictRow> {
        stream::iter(rows.to_vec())
            .map(|row| async move { self.verify(&row).await })
            .buffered(concurrency.max(1))
            .collect()
            .await
    }
}
