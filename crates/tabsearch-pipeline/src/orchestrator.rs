//! Ingestion driver
//!
//! Runs every new input file through load, profile, normalize and publish,
//! one file at a time. A failure ends the work on that file only: it is
//! logged with the stage that failed and the loop moves on. Tables that were
//! normalized by an earlier run but never confirmed by the search engine are
//! published again at the end.

use crate::context::PipelineContext;
use crate::discovery::{discover, SourceFile};
use crate::error::Result;
use crate::loader::{load_file, LoadReport};
use crate::naming::TableNames;
use crate::normalizer::normalize_table;
use crate::profiler::profile_table;
use crate::search::publish_table;
use chrono::Utc;
use std::collections::HashSet;
use std::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Load,
    Profile,
    Normalize,
    Publish,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Load => "load",
            Stage::Profile => "profile",
            Stage::Normalize => "normalize",
            Stage::Publish => "publish",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFailure {
    /// File or table name
    pub unit: String,
    pub stage: Stage,
    pub error: String,
}

#[derive(Debug, Default)]
pub struct IngestSummary {
    pub discovered: usize,
    pub skipped: usize,
    pub unreadable: usize,
    pub loaded: Vec<LoadReport>,
    pub normalized: Vec<String>,
    pub published: Vec<String>,
    pub failures: Vec<UnitFailure>,
}

impl IngestSummary {
    fn fail(&mut self, unit: &str, stage: Stage, error: impl std::fmt::Display) {
        error!(unit = %unit, stage = %stage, error = %error, "Unit of work failed");
        self.failures.push(UnitFailure {
            unit: unit.to_string(),
            stage,
            error: error.to_string(),
        });
    }
}

/// Ingest every file under the configured input directory that has not been
/// ingested before.
pub async fn run_ingest(ctx: &PipelineContext) -> Result<IngestSummary> {
    let started = Instant::now();
    let input_dir = ctx.config.ingest.input_dir.clone();

    let ingested = ctx.warehouse.ingested_file_names().await?;
    let discovery = discover(&input_dir, &ingested)?;

    let mut summary = IngestSummary {
        discovered: discovery.pending.len(),
        skipped: discovery.skipped.len(),
        unreadable: discovery.unreadable.len(),
        ..Default::default()
    };
    for (path, reason) in &discovery.unreadable {
        warn!(path = %path.display(), reason = %reason, "Input file skipped");
    }

    info!(
        input_dir = %input_dir.display(),
        pending = summary.discovered,
        skipped = summary.skipped,
        unreadable = summary.unreadable,
        "Starting ingestion"
    );

    let mut attempted = HashSet::new();
    for (n, file) in discovery.pending.iter().enumerate() {
        info!(
            file = %file.file_name,
            progress = %format!("{}/{}", n + 1, summary.discovered),
            "Processing file"
        );
        if let Some(table) = ingest_file(ctx, file, &mut summary).await {
            attempted.insert(table);
        }
    }

    publish_unconfirmed(ctx, &attempted, &mut summary).await?;

    info!(
        loaded = summary.loaded.len(),
        normalized = summary.normalized.len(),
        published = summary.published.len(),
        failed = summary.failures.len(),
        duration_secs = started.elapsed().as_secs_f64(),
        "Ingestion finished"
    );
    Ok(summary)
}

/// Take one file as far as it goes. Returns the normalized table name if
/// publication was attempted.
async fn ingest_file(
    ctx: &PipelineContext,
    file: &SourceFile,
    summary: &mut IngestSummary,
) -> Option<String> {
    let at = Utc::now().naive_utc();
    let names = TableNames::new(file.index, file.stem(), at);

    match load_file(ctx, file, &names, at).await {
        Ok(report) => summary.loaded.push(report),
        Err(e) => {
            summary.fail(&file.file_name, Stage::Load, e);
            return None;
        },
    }

    if let Err(e) = profile_table(
        ctx.warehouse.as_ref(),
        &names.raw_table,
        ctx.config.ingest.profile_workers,
    )
    .await
    {
        summary.fail(&names.raw_table, Stage::Profile, e);
        return None;
    }

    let table = match normalize_table(ctx.warehouse.as_ref(), &names.raw_table).await {
        Ok(table) => table,
        Err(e) => {
            summary.fail(&names.raw_table, Stage::Normalize, e);
            return None;
        },
    };
    summary.normalized.push(table.clone());

    match publish_table(ctx.warehouse.as_ref(), ctx.search.as_ref(), &ctx.config, &table).await {
        Ok(outcome) => summary.published.push(outcome.table),
        Err(e) => summary.fail(&table, Stage::Publish, e),
    }
    Some(table)
}

/// Publish normalized tables that have no index record, except those
/// already attempted in this run
async fn publish_unconfirmed(
    ctx: &PipelineContext,
    attempted: &HashSet<String>,
    summary: &mut IngestSummary,
) -> Result<()> {
    let indexed = ctx.warehouse.indexed_tables().await?;
    let mut seen = HashSet::new();
    let retry: Vec<String> = ctx
        .warehouse
        .lineage()
        .await?
        .into_iter()
        .map(|l| l.table_name)
        .filter(|t| !indexed.contains(t) && !attempted.contains(t))
        .filter(|t| seen.insert(t.clone()))
        .collect();

    if retry.is_empty() {
        return Ok(());
    }
    info!(tables = retry.len(), "Publishing tables left unindexed by earlier runs");

    for table in retry {
        match publish_table(ctx.warehouse.as_ref(), ctx.search.as_ref(), &ctx.config, &table).await {
            Ok(outcome) => summary.published.push(outcome.table),
            Err(e) => summary.fail(&table, Stage::Publish, e),
        }
    }
    Ok(())
}
