use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::{stream, StreamExt, TryStreamExt};

use crate::embedding::Embedder;
use crate::models::{BookSummary, Chunk, EmbeddingRecord, RetrievalResult};

/// Exact cosine-similarity index over every chunk of the corpus.
///
/// Built once, then only read; share it behind an `Arc` across queries.
#[derive(Clone)]
pub struct EvidenceIndex {
    records: Vec<EmbeddingRecord>,
    embedder: Arc<dyn Embedder>,
    dimensions: Option<usize>,
}

impl EvidenceIndex {
    pub fn from_records(records: Vec<EmbeddingRecord>, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let dimensions = records.first().map(|r| r.vector.len());
        if let Some(dims) = dimensions {
            if let Some(bad) = records.iter().find(|r| r.vector.len() != dims) {
                anyhow::bail!(
                    "embedding dimension mismatch: chunk {} has {} dims, expected {}",
                    bad.chunk.id,
                    bad.vector.len(),
                    dims
                );
            }
        }

        Ok(Self {
            records,
            embedder,
            dimensions,
        })
    }

    pub async fn build(
        chunks: Vec<Chunk>,
        embedder: Arc<dyn Embedder>,
        concurrency: usize,
    ) -> Result<Self> {
        let records = embed_chunks(embedder.as_ref(), chunks, concurrency).await?;
        Self::from_records(records, embedder)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }

    pub async fn query(&self, text: &str, k: usize) -> Result<Vec<RetrievalResult>> {
        if self.records.is_empty() || k == 0 {
            return Ok(vec![]);
        }
        let vector = self
            .embedder
            .embed(text)
            .await
            .context("failed to embed retrieval query")?;
        Ok(self.search_vector(&vector, k))
    }

    pub fn search_vector(&self, vector: &[f32], k: usize) -> Vec<RetrievalResult> {
        let mut scored: Vec<(f32, &EmbeddingRecord)> = self
            .records
            .iter()
            .map(|record| (cosine_similarity(vector, &record.vector), record))
            .collect();

        // Stable sort keeps index order among equal scores.
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        scored
            .into_iter()
            .take(k)
            .map(|(score, record)| RetrievalResult {
                chunk: record.chunk.clone(),
                score,
            })
            .collect()
    }

    pub fn books(&self) -> Vec<BookSummary> {
        let mut books: BTreeMap<&str, BookSummary> = BTreeMap::new();
        for record in &self.records {
            books
                .entry(record.chunk.path.as_str())
                .or_insert_with(|| BookSummary {
                    path: record.chunk.path.clone(),
                    source_file: record.chunk.source_file.clone(),
                    chunk_count: 0,
                })
                .chunk_count += 1;
        }
        books.into_values().collect()
    }
}

/// Embeds chunks in order, skipping whitespace-only ones.
pub async fn embed_chunks(
    embedder: &dyn Embedder,
    chunks: Vec<Chunk>,
    concurrency: usize,
) -> Result<Vec<EmbeddingRecord>> {
    let embeddable: Vec<Chunk> = chunks
        .into_iter()
        .filter(|chunk| {
            let keep = !chunk.text.trim().is_empty();
            if !keep {
                tracing::debug!(chunk = %chunk.id, "skipping empty chunk");
            }
            keep
        })
        .collect();

    stream::iter(embeddable.into_iter().map(|chunk| async move {
        let vector = embedder.embed(&chunk.text).await.with_context(|| {
            format!(
                "failed embedding chunk {} ({} / {})",
                chunk.ordinal, chunk.source_file, chunk.chapter_title
            )
        })?;
        Ok::<_, anyhow::Error>(EmbeddingRecord { chunk, vector })
    }))
    .buffered(concurrency.max(1))
    .try_collect()
    .await
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
