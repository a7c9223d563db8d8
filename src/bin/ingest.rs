use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use narrative_check::config::AppConfig;
use narrative_check::db::Database;
use narrative_check::ingest::Ingestor;
use narrative_check::pipeline::embedder_from_config;

#[derive(Parser, Debug)]
#[command(name = "ingest")]
#[command(about = "Segment and embed a directory of plain-text novels into the evidence cache")]
struct Cli {
    /// Overrides BOOKS_DIR.
    #[arg(long)]
    books_dir: Option<PathBuf>,
    /// Re-embed every book even when its cached embeddings are current.
    #[arg(long, default_value_t = false)]
    rebuild: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = AppConfig::from_env();
    if let Some(dir) = cli.books_dir {
        config.books_dir = dir;
    }
    config.validate()?;

    let db = Database::new(&config).await?;
    let embedder = embedder_from_config(&config)?;
    let ingestor = Ingestor::new(config, db, embedder);

    let (index, report) = ingestor
        .build_index(cli.rebuild, |book| {
            println!(
                "[{}] {} chunks={}",
                if book.skipped { "cached" } else { "embedded" },
                book.path,
                book.chunk_count
            );
        })
        .await?;

    println!(
        "Ingest complete. books={} reused={} chunks={} dims={}",
        report.books.len(),
        report.reused(),
        index.len(),
        index
            .dimensions()
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string())
    );

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
