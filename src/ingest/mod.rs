pub mod chapters;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::config::AppConfig;
use crate::db::Database;
use crate::embedding::Embedder;
use crate::index::{embed_chunks, EvidenceIndex};
use crate::models::{BookManifest, EmbeddingRecord};

use self::chapters::ChapterSegmenter;

const EMBED_CONCURRENCY: usize = 4;

#[derive(Clone)]
pub struct Ingestor {
    config: AppConfig,
    db: Database,
    embedder: Arc<dyn Embedder>,
}

#[derive(Debug, Clone)]
pub struct BookIngest {
    pub path: String,
    pub chunk_count: usize,
    pub skipped: bool,
}

#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub books: Vec<BookIngest>,
}

impl IngestReport {
    pub fn chunk_count(&self) -> usize {
        self.books.iter().map(|book| book.chunk_count).sum()
    }

    pub fn reused(&self) -> usize {
        self.books.iter().filter(|book| book.skipped).count()
    }
}

impl Ingestor {
    pub fn new(config: AppConfig, db: Database, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            config,
            db,
            embedder,
        }
    }

    /// Builds the evidence index for every book under `books_dir`, reusing cached
    /// embeddings for books whose bytes and embedding model are unchanged.
    pub async fn build_index<F>(
        &self,
        rebuild: bool,
        mut progress: F,
    ) -> Result<(EvidenceIndex, IngestReport)>
    where
        F: FnMut(&BookIngest) + Send,
    {
        let books = discover_books(&self.config.books_dir)?;
        if books.is_empty() {
            anyhow::bail!(
                "no .txt books found under {}",
                self.config.books_dir.display()
            );
        }

        let mut report = IngestReport::default();
        let mut records = Vec::new();
        for book in books {
            let (book_records, outcome) = self.ingest_book(&book, rebuild).await?;
            progress(&outcome);
            report.books.push(outcome);
            records.extend(book_records);
        }

        let index = EvidenceIndex::from_records(records, self.embedder.clone())?;
        tracing::info!(
            books = report.books.len(),
            reused = report.reused(),
            chunks = index.len(),
            "evidence index ready"
        );
        Ok((index, report))
    }

    async fn ingest_book(
        &self,
        path: &Path,
        rebuild: bool,
    ) -> Result<(Vec<EmbeddingRecord>, BookIngest)> {
        let path_str = path.to_string_lossy().to_string();
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed reading book {}", path.display()))?;
        let source_hash = sha256_hex(&bytes);
        let embedding_model = self.config.embedding_key();

        if !rebuild {
            if let Some(latest) = self.db.manifest(&path_str).await? {
                if latest.source_hash == source_hash && latest.embedding_model == embedding_model {
                    let records = self.db.load_records(&path_str).await?;
                    tracing::info!(book = %path_str, chunks = records.len(), "book unchanged; reusing cached embeddings");
                    let outcome = BookIngest {
                        path: path_str,
                        chunk_count: records.len(),
                        skipped: true,
                    };
                    return Ok((records, outcome));
                }
            }
        }

        let segmenter = ChapterSegmenter::new(self.config.retrieval.max_chunk_chars);
        let segment_path = path_str.clone();
        let chunks =
            tokio::task::spawn_blocking(move || segmenter.segment(Some(&segment_path), &bytes))
                .await
                .context("chapter segmentation task panicked")?;
        tracing::info!(book = %path_str, chunks = chunks.len(), "segmented book");

        let records = embed_chunks(self.embedder.as_ref(), chunks, EMBED_CONCURRENCY).await?;

        let manifest = BookManifest {
            path: path_str.clone(),
            source_hash,
            embedding_model,
            chunk_count: records.len() as i64,
            created_at: Utc::now(),
        };
        self.db.replace_book(&manifest, &records).await?;

        let outcome = BookIngest {
            path: path_str,
            chunk_count: records.len(),
            skipped: false,
        };
        Ok((records, outcome))
    }
}

/// Every `.txt` file under `dir`, sorted so index order is stable across runs.
pub fn discover_books(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        anyhow::bail!("books directory {} does not exist", dir.display());
    }

    let mut books = Vec::new();
    for entry in WalkDir::new(dir).follow_links(true) {
        let entry = entry.with_context(|| format!("failed walking {}", dir.display()))?;
        let is_txt = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("txt"));
        if entry.file_type().is_file() && is_txt {
            books.push(entry.into_path());
        }
    }
    books.sort();
    Ok(books)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::embedding::HashedEmbedder;

    struct CountingEmbedder {
        inner: HashedEmbedder,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.inner.embed_sync(text))
        }
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("narrative-check-{name}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn config_for(books_dir: PathBuf) -> AppConfig {
        let mut config = crate::pipeline::tests::test_config();
        config.books_dir = books_dir;
        config
    }

    #[test]
    fn discovers_only_txt_files_sorted() {
        let dir = scratch_dir("discover");
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(dir.join("b.txt"), "b").unwrap();
        std::fs::write(dir.join("nested").join("a.TXT"), "a").unwrap();
        std::fs::write(dir.join("notes.md"), "skip").unwrap();

        let books = discover_books(&dir).unwrap();
        let names: Vec<String> = books
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["b.txt", "a.TXT"]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_books_dir_is_an_error() {
        assert!(discover_books(Path::new("/definitely/not/here")).is_err());
    }

    #[test]
    fn sha256_is_hex_encoded() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn unchanged_books_reuse_cached_embeddings() {
        let dir = scratch_dir("cache");
        std::fs::write(
            dir.join("monte.txt"),
            "CHAPTER I\nDantes returns to Marseilles.\n\nCHAPTER II\nThe dungeon of the Chateau d'If.\n",
        )
        .unwrap();

        let db = Database::in_memory().await.unwrap();
        let embedder = Arc::new(CountingEmbedder {
            inner: HashedEmbedder::new(32),
            calls: AtomicUsize::new(0),
        });
        let ingestor = Ingestor::new(config_for(dir.clone()), db, embedder.clone());

        let (index, report) = ingestor.build_index(false, |_| {}).await.unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(report.reused(), 0);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);

        let (index, report) = ingestor.build_index(false, |_| {}).await.unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(report.reused(), 1);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);

        let (_, report) = ingestor.build_index(true, |_| {}).await.unwrap();
        assert_eq!(report.reused(), 0);
        assert_eq!(report.chunk_count(), 2);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 4);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn empty_corpus_fails_fast() {
        let dir = scratch_dir("empty");
        let db = Database::in_memory().await.unwrap();
        let ingestor = Ingestor::new(config_for(dir.clone()), db, Arc::new(HashedEmbedder::new(8)));
        assert!(ingestor.build_index(false, |_| {}).await.is_err());
        std::fs::remove_dir_all(&dir).ok();
    }
}
