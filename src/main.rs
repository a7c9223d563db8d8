use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::EnvFilter;

use narrative_check::db::Database;
use narrative_check::ingest::Ingestor;
use narrative_check::pipeline::embedder_from_config;
use narrative_check::{run_server, AppConfig, Verifier};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::from_env();
    config.validate()?;

    let db = Database::new(&config).await?;
    let embedder = embedder_from_config(&config)?;
    let ingestor = Ingestor::new(config.clone(), db.clone(), embedder);

    let (index, report) = ingestor
        .build_index(false, |book| {
            tracing::info!(book = %book.path, chunks = book.chunk_count, cached = book.skipped, "indexed book");
        })
        .await?;
    tracing::info!(
        books = report.books.len(),
        chunks = report.chunk_count(),
        "corpus loaded"
    );

    let verifier = Verifier::from_config(&config, Arc::new(index))?;
    run_server(config, db, Arc::new(verifier)).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
