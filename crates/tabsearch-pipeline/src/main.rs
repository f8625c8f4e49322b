//! Tabsearch - ingest data files into searchable tables

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tabsearch_common::logging::{init_logging, LogConfig, LogFormat, LogLevel};
use tabsearch_pipeline::orchestrator::IngestSummary;
use tabsearch_pipeline::search::publish_table;
use tabsearch_pipeline::vector::VectorRunSummary;
use tabsearch_pipeline::{embed_all_tables, run_ingest, PipelineConfig, PipelineContext};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tabsearch")]
#[command(author, version, about = "Load data files into the warehouse and publish them for search")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Log format (text, json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    /// Environment file to load instead of ./.env
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the bookkeeping tables and the summary view
    Init {
        /// Drop every bookkeeping table first
        #[arg(long)]
        reset: bool,
    },

    /// Load, profile, normalize and publish every new input file
    Ingest {
        /// Directory scanned for input files
        #[arg(short, long, env = "TABSEARCH_INPUT_DIR")]
        input_dir: Option<PathBuf>,
    },

    /// Regenerate the search configuration and publish one normalized table
    Publish {
        /// Normalized table name
        table: String,
    },

    /// Compute vectors for every normalized table that has none yet
    Embed,

    /// Ingest, then embed
    Run {
        /// Directory scanned for input files
        #[arg(short, long, env = "TABSEARCH_INPUT_DIR")]
        input_dir: Option<PathBuf>,
    },

    /// Print the per-file run summary
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("Failed to load env file {}", path.display()))?;
        },
        None => {
            dotenvy::dotenv().ok();
        },
    }

    // Environment first, command line flags take precedence
    let mut log_config = LogConfig::from_env()
        .unwrap_or_else(|_| LogConfig::builder().log_file_prefix("tabsearch").build());
    if let Some(level) = cli.log_level {
        log_config.level = level;
    }
    if let Some(format) = cli.log_format {
        log_config.format = format;
    }
    let _guard = init_logging(&log_config)?;

    let mut config = PipelineConfig::from_env().context("Invalid configuration")?;
    if let Command::Ingest { input_dir: Some(dir) } | Command::Run { input_dir: Some(dir) } =
        &cli.command
    {
        config.ingest.input_dir = dir.clone();
    }

    let mut ctx = PipelineContext::connect(config).context("Failed to set up pipeline backends")?;
    if matches!(cli.command, Command::Embed | Command::Run { .. }) {
        ctx = ctx.load_embedder().context("Failed to load the embedding model")?;
    }

    match cli.command {
        Command::Init { reset } => {
            if reset {
                warn!("Dropping bookkeeping tables");
                ctx.warehouse
                    .reset_schema()
                    .await
                    .context("Failed to drop bookkeeping tables")?;
            }
            ctx.warehouse
                .ensure_schema()
                .await
                .context("Failed to create bookkeeping tables")?;
            info!("Bookkeeping schema ready");
        },
        Command::Ingest { .. } => {
            let summary = run_ingest(&ctx).await.context("Ingestion failed")?;
            print_ingest(&summary);
        },
        Command::Publish { table } => {
            let outcome = publish_table(
                ctx.warehouse.as_ref(),
                ctx.search.as_ref(),
                &ctx.config,
                &table,
            )
            .await
            .with_context(|| format!("Failed to publish {}", table))?;
            println!(
                "{}: {} documents, ready after {} attempt(s)",
                outcome.table, outcome.documents, outcome.attempts
            );
        },
        Command::Embed => {
            let summary = embed_all_tables(&ctx).await.context("Vector run failed")?;
            print_vectors(&summary);
        },
        Command::Run { .. } => {
            let ingest = run_ingest(&ctx).await.context("Ingestion failed")?;
            print_ingest(&ingest);
            let vectors = embed_all_tables(&ctx).await.context("Vector run failed")?;
            print_vectors(&vectors);
        },
        Command::Status => print_status(&ctx).await?,
    }

    Ok(())
}

fn print_ingest(summary: &IngestSummary) {
    println!(
        "files: {} new, {} already ingested, {} unreadable",
        summary.discovered, summary.skipped, summary.unreadable
    );
    println!(
        "tables: {} loaded, {} normalized, {} published",
        summary.loaded.len(),
        summary.normalized.len(),
        summary.published.len()
    );
    for failure in &summary.failures {
        println!("  failed [{}] {}: {}", failure.stage, failure.unit, failure.error);
    }
}

fn print_vectors(summary: &VectorRunSummary) {
    println!(
        "vectors: {} tables embedded, {} already done, {} failed",
        summary.completed.len(),
        summary.skipped,
        summary.failed.len()
    );
    for report in &summary.completed {
        println!(
            "  {}: {} rows, {} chunks, {} batches",
            report.table, report.rows, report.chunks, report.batches
        );
    }
    for (table, error) in &summary.failed {
        println!("  failed {}: {}", table, error);
    }
}

async fn print_status(ctx: &PipelineContext) -> Result<()> {
    let rows = ctx
        .warehouse
        .summary()
        .await
        .context("Failed to read the run summary")?;

    if rows.is_empty() {
        println!("No files ingested yet");
        return Ok(());
    }

    println!(
        "{:<32} {:<44} {:<40} {:>12} {:>7} {:>7} {:>10} {:>12}",
        "FILE", "RAW TABLE", "TABLE", "BYTES", "INDEXED", "VECTORS", "SECONDS", "BYTES/S"
    );
    for row in rows {
        println!(
            "{:<32} {:<44} {:<40} {:>12} {:>7} {:>7} {:>10} {:>12}",
            row.file_name,
            row.raw_table,
            row.normalized_table.as_deref().unwrap_or("-"),
            row.file_size,
            if row.indexed { "yes" } else { "no" },
            if row.vectorized { "yes" } else { "no" },
            row.duration_secs
                .map(|d| format!("{:.1}", d))
                .unwrap_or_else(|| "-".to_string()),
            row.bytes_per_second
                .map(|b| format!("{:.0}", b))
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    Ok(())
}
