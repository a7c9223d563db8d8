use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::config::AppConfig;
use crate::models::{BookManifest, Chunk, EmbeddingRecord, VerdictRow};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        Self::connect(&config.sqlite_dsn(), 10).await
    }

    /// Private in-memory database; one connection so every query sees the same data.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn connect(dsn: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(dsn)
            .with_context(|| format!("invalid sqlite dsn: {dsn}"))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open sqlite database {dsn}"))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS book_manifests (
                path TEXT PRIMARY KEY,
                source_hash TEXT NOT NULL,
                embedding_model TEXT NOT NULL,
                chunk_count INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                source_file TEXT NOT NULL,
                ordinal INTEGER NOT NULL,
                chapter_title TEXT NOT NULL,
                progress_pct REAL NOT NULL,
                start_offset INTEGER NOT NULL,
                end_offset INTEGER NOT NULL,
                content TEXT NOT NULL,
                embedding BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS chunks_by_path ON chunks (path, ordinal);

            CREATE TABLE IF NOT EXISTS verdicts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                row_id TEXT NOT NULL,
                label TEXT NOT NULL,
                confidence TEXT NOT NULL,
                rationale TEXT NOT NULL,
                conflicts TEXT NOT NULL,
                evidence_count INTEGER NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn manifest(&self, path: &str) -> Result<Option<BookManifest>> {
        let row = sqlx::query(
            r#"
            SELECT path, source_hash, embedding_model, chunk_count, created_at
            FROM book_manifests
            WHERE path = ?
            "#,
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_manifest).transpose()
    }

    /// Swaps a book's cached chunks and manifest in one transaction.
    pub async fn replace_book(
        &self,
        manifest: &BookManifest,
        records: &[EmbeddingRecord],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunks WHERE path = ?")
            .bind(&manifest.path)
            .execute(&mut *tx)
            .await?;

        for record in records {
            insert_record_tx(&mut tx, record).await?;
        }

        sqlx::query(
            r#"
            INSERT INTO book_manifests (path, source_hash, embedding_model, chunk_count, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                source_hash = excluded.source_hash,
                embedding_model = excluded.embedding_model,
                chunk_count = excluded.chunk_count,
                created_at = excluded.created_at
            "#,
        )
        .bind(&manifest.path)
        .bind(&manifest.source_hash)
        .bind(&manifest.embedding_model)
        .bind(manifest.chunk_count)
        .bind(manifest.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn load_records(&self, path: &str) -> Result<Vec<EmbeddingRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, path, source_file, ordinal, chapter_title, progress_pct,
                   start_offset, end_offset, content, embedding
            FROM chunks
            WHERE path = ?
            ORDER BY ordinal ASC
            "#,
        )
        .bind(path)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_record).collect()
    }

    pub async fn record_verdict(&self, run_id: &str, verdict: &VerdictRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO verdicts
                (run_id, row_id, label, confidence, rationale, conflicts, evidence_count, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run_id)
        .bind(&verdict.id)
        .bind(serde_json::to_string(&verdict.label)?)
        .bind(serde_json::to_string(&verdict.confidence)?)
        .bind(&verdict.rationale)
        .bind(serde_json::to_string(&verdict.conflicts)?)
        .bind(verdict.evidence_count as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn verdicts_for_run(&self, run_id: &str) -> Result<Vec<VerdictRow>> {
        let rows = sqlx::query(
            r#"
            SELECT row_id, label, confidence, rationale, conflicts, evidence_count
            FROM verdicts
            WHERE run_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<VerdictRow> {
                Ok(VerdictRow {
                    id: row.get("row_id"),
                    label: serde_json::from_str(&row.get::<String, _>("label"))?,
                    confidence: serde_json::from_str(&row.get::<String, _>("confidence"))?,
                    rationale: row.get("rationale"),
                    conflicts: serde_json::from_str(&row.get::<String, _>("conflicts"))?,
                    evidence_count: row.get::<i64, _>("evidence_count").max(0) as usize,
                })
            })
            .collect()
    }
}

async fn insert_record_tx(tx: &mut Transaction<'_, Sqlite>, record: &EmbeddingRecord) -> Result<()> {
    let chunk = &record.chunk;
    sqlx::query(
        r#"
        INSERT INTO chunks (id, path, source_file, ordinal, chapter_title, progress_pct,
                            start_offset, end_offset, content, embedding)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&chunk.id)
    .bind(&chunk.path)
    .bind(&chunk.source_file)
    .bind(chunk.ordinal)
    .bind(&chunk.chapter_title)
    .bind(f64::from(chunk.progress_pct))
    .bind(chunk.start as i64)
    .bind(chunk.end as i64)
    .bind(&chunk.text)
    .bind(encode_vector(&record.vector))
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn row_to_manifest(row: SqliteRow) -> Result<BookManifest> {
    let created_at: String = row.get("created_at");
    Ok(BookManifest {
        path: row.get("path"),
        source_hash: row.get("source_hash"),
        embedding_model: row.get("embedding_model"),
        chunk_count: row.get("chunk_count"),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .with_context(|| format!("bad manifest timestamp: {created_at}"))?
            .with_timezone(&Utc),
    })
}

fn row_to_record(row: SqliteRow) -> Result<EmbeddingRecord> {
    let blob: Vec<u8> = row.get("embedding");
    let chunk = Chunk {
        id: row.get("id"),
        path: row.get("path"),
        source_file: row.get("source_file"),
        ordinal: row.get("ordinal"),
        chapter_title: row.get("chapter_title"),
        progress_pct: row.get::<f64, _>("progress_pct") as f32,
        start: row.get::<i64, _>("start_offset").max(0) as usize,
        end: row.get::<i64, _>("end_offset").max(0) as usize,
        text: row.get("content"),
    };
    let vector = decode_vector(&blob)
        .with_context(|| format!("corrupt embedding for chunk {}", chunk.id))?;
    Ok(EmbeddingRecord { chunk, vector })
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        anyhow::bail!("embedding blob length {} is not a multiple of 4", bytes.len());
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Confidence, Label};

    fn record(id: &str, ordinal: i64, vector: Vec<f32>) -> EmbeddingRecord {
        EmbeddingRecord {
            chunk: Chunk {
                id: id.to_string(),
                path: "books/monte.txt".to_string(),
                source_file: "monte.txt".to_string(),
                ordinal,
                chapter_title: format!("CHAPTER {}", ordinal + 1),
                progress_pct: 12.5 * ordinal as f32,
                start: (ordinal * 10) as usize,
                end: (ordinal * 10 + 10) as usize,
                text: format!("chunk text {id}"),
            },
            vector,
        }
    }

    fn manifest(hash: &str, count: i64) -> BookManifest {
        BookManifest {
            path: "books/monte.txt".to_string(),
            source_hash: hash.to_string(),
            embedding_model: "hashed-4".to_string(),
            chunk_count: count,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn cached_book_round_trips() {
        let db = Database::in_memory().await.unwrap();
        assert!(db.manifest("books/monte.txt").await.unwrap().is_none());

        let records = vec![
            record("b", 1, vec![0.0, 1.0, -0.5, 2.25]),
            record("a", 0, vec![1.0, 0.0, 0.5, -2.25]),
        ];
        db.replace_book(&manifest("h1", 2), &records).await.unwrap();

        let stored = db.manifest("books/monte.txt").await.unwrap().unwrap();
        assert_eq!(stored.source_hash, "h1");
        assert_eq!(stored.chunk_count, 2);

        let loaded = db.load_records("books/monte.txt").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].chunk.id, "a");
        assert_eq!(loaded[0].vector, vec![1.0, 0.0, 0.5, -2.25]);
        assert_eq!(loaded[1].chunk.chapter_title, "CHAPTER 2");
        assert_eq!(loaded[1].chunk.progress_pct, 12.5);
    }

    #[tokio::test]
    async fn replacing_a_book_drops_stale_chunks() {
        let db = Database::in_memory().await.unwrap();
        db.replace_book(&manifest("h1", 2), &[record("a", 0, vec![1.0]), record("b", 1, vec![1.0])])
            .await
            .unwrap();
        db.replace_book(&manifest("h2", 1), &[record("c", 0, vec![0.5])])
            .await
            .unwrap();

        let loaded = db.load_records("books/monte.txt").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].chunk.id, "c");
        let stored = db.manifest("books/monte.txt").await.unwrap().unwrap();
        assert_eq!(stored.source_hash, "h2");
    }

    #[tokio::test]
    async fn verdicts_are_recorded_per_run() {
        let db = Database::in_memory().await.unwrap();
        let verdict = VerdictRow {
            id: "42".to_string(),
            label: Label::Contradictory,
            confidence: Confidence::High,
            rationale: "EVIDENCE: ... -> CLAIM: ... -> ANALYSIS: ...".to_string(),
            conflicts: vec![],
            evidence_count: 3,
        };
        db.record_verdict("run-1", &verdict).await.unwrap();
        db.record_verdict("run-2", &verdict).await.unwrap();

        let run = db.verdicts_for_run("run-1").await.unwrap();
        assert_eq!(run.len(), 1);
        assert_eq!(run[0].label, Label::Contradictory);
        assert_eq!(run[0].confidence, Confidence::High);
        assert_eq!(run[0].evidence_count, 3);
    }

    #[test]
    fn corrupt_blob_is_rejected() {
        assert!(decode_vector(&[0, 1, 2]).is_err());
        assert_eq!(decode_vector(&encode_vector(&[1.5, -3.0])).unwrap(), vec![1.5, -3.0]);
    }
}
