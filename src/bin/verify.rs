use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use narrative_check::config::AppConfig;
use narrative_check::db::Database;
use narrative_check::ingest::Ingestor;
use narrative_check::models::{ClaimRow, Confidence, Label};
use narrative_check::pipeline::embedder_from_config;
use narrative_check::Verifier;

#[derive(Parser, Debug)]
#[command(name = "verify")]
#[command(about = "Judge backstory claims in a JSONL file against the novel corpus")]
struct Cli {
    #[arg(long, default_value = "Dataset/test.jsonl")]
    input: PathBuf,
    #[arg(long, default_value = "results.jsonl")]
    output: PathBuf,
    /// Overrides BOOKS_DIR.
    #[arg(long)]
    books_dir: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    use_expansion: bool,
    #[arg(long, default_value_t = false)]
    use_rerank: bool,
    #[arg(long, default_value_t = false)]
    use_dual_pass: bool,
    /// Fixed retrieval depth; disables adaptive k.
    #[arg(long)]
    k: Option<usize>,
    #[arg(long)]
    concurrency: Option<usize>,
    #[arg(long, default_value_t = false)]
    rebuild: bool,
}

#[derive(Debug, Serialize)]
struct OutputRow<'a> {
    id: &'a str,
    label: Label,
    confidence: Confidence,
    rationale: &'a str,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = AppConfig::from_env();
    if let Some(dir) = cli.books_dir {
        config.books_dir = dir;
    }
    config.retrieval.expansion |= cli.use_expansion;
    config.retrieval.rerank |= cli.use_rerank;
    config.judge.dual_pass |= cli.use_dual_pass;
    if let Some(k) = cli.k {
        config.retrieval.adaptive_k = false;
        config.retrieval.default_k = k;
    }
    if let Some(concurrency) = cli.concurrency {
        config.judge.batch_concurrency = concurrency;
    }
    config.validate()?;

    let rows = load_rows(&cli.input)?;
    if rows.is_empty() {
        anyhow::bail!("no claim rows found in {}", cli.input.display());
    }

    let db = Database::new(&config).await?;
    let embedder = embedder_from_config(&config)?;
    let ingestor = Ingestor::new(config.clone(), db.clone(), embedder);
    let (index, _) = ingestor.build_index(cli.rebuild, |_| {}).await?;

    let verifier = Verifier::from_config(&config, Arc::new(index))?;
    tracing::info!(
        rows = rows.len(),
        expansion = config.retrieval.expansion,
        rerank = config.retrieval.rerank,
        dual_pass = config.judge.dual_pass,
        adaptive_k = config.retrieval.adaptive_k,
        "verifying claims"
    );
    let verdicts = verifier
        .verify_batch(&rows, config.judge.batch_concurrency)
        .await;

    let run_id = format!("cli-{}", uuid::Uuid::new_v4());
    let file = File::create(&cli.output)
        .with_context(|| format!("failed creating {}", cli.output.display()))?;
    let mut writer = BufWriter::new(file);
    for verdict in &verdicts {
        let line = serde_json::to_string(&OutputRow {
            id: &verdict.id,
            label: verdict.label,
            confidence: verdict.confidence,
            rationale: &verdict.rationale,
        })?;
        writeln!(writer, "{line}")?;
        if let Err(err) = db.record_verdict(&run_id, verdict).await {
            tracing::warn!(row = %verdict.id, error = %err, "failed to store verdict");
        }
    }
    writer.flush()?;

    let contradictory = verdicts
        .iter()
        .filter(|v| v.label == Label::Contradictory)
        .count();
    println!("Run: {}", run_id);
    println!("Rows: {}", verdicts.len());
    println!("Contradictory: {}", contradictory);
    println!("Consistent: {}", verdicts.len() - contradictory);

    let labelled: Vec<(Label, Label)> = rows
        .iter()
        .zip(&verdicts)
        .filter_map(|(row, verdict)| {
            row.label
                .as_deref()
                .and_then(Label::parse_loose)
                .map(|truth| (truth, verdict.label))
        })
        .collect();
    if !labelled.is_empty() {
        let correct = labelled.iter().filter(|(truth, pred)| truth == pred).count();
        println!(
            "Accuracy: {:.1}% ({}/{})",
            ratio(correct, labelled.len()) * 100.0,
            correct,
            labelled.len()
        );
    }
    println!("Wrote {}", cli.output.display());

    Ok(())
}

fn load_rows(path: &Path) -> Result<Vec<ClaimRow>> {
    let file = File::open(path).with_context(|| format!("failed opening {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut rows = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let parsed: ClaimRow = serde_json::from_str(trimmed)
            .with_context(|| format!("invalid JSON at {} line {}", path.display(), idx + 1))?;
        rows.push(parsed);
    }

    Ok(rows)
}

fn ratio(n: usize, d: usize) -> f32 {
    if d == 0 {
        return 0.0;
    }
    n as f32 / d as f32
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
