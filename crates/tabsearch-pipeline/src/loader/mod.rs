//! Raw loading
//!
//! Loads one input file into a freshly named raw staging table:
//!
//! - **Delimited text**: a single server-side bulk load; on any failure the
//!   partial table is dropped and the file is re-read line by line locally
//!   (see [`delimited`]).
//! - **Wiki XML**: streamed page by page into a fixed wide schema (see
//!   [`wiki_xml`]).
//!
//! Local parsing runs on a blocking thread and hands row batches to the async
//! side over a bounded channel, so peak memory is one batch per file no matter
//! how large the input is. On success exactly one ingestion record is written;
//! on failure the raw table is dropped and the error is returned to the
//! caller, which logs it and moves on to the next file.

pub mod delimited;
pub mod wiki_xml;

use crate::context::PipelineContext;
use crate::discovery::{SourceFile, SourceFormat};
use crate::error::{PipelineError, Result};
use crate::naming::TableNames;
use crate::warehouse::{IngestionRecord, RawBatch, RawColumn, RawRow, Warehouse};
use chrono::NaiveDateTime;
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Batches buffered between the parser thread and the inserter
const CHANNEL_DEPTH: usize = 2;

/// Output of a local parser, in order: one `Columns`, then any number of `Rows`
#[derive(Debug)]
pub enum ParsedChunk {
    Columns(Vec<RawColumn>),
    Rows(Vec<RawRow>),
}

/// Row counts from a local parse
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub rows: u64,
    pub malformed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStrategy {
    BulkNative,
    LineFallback,
    WikiStream,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub raw_table: String,
    pub strategy: LoadStrategy,
    /// Rows in the raw table after the load
    pub rows: u64,
    /// Known for local parses only
    pub stats: Option<ParseStats>,
}

/// Load `file` into `names.raw_table` and record the ingestion.
pub async fn load_file(
    ctx: &PipelineContext,
    file: &SourceFile,
    names: &TableNames,
    at: NaiveDateTime,
) -> Result<LoadReport> {
    info!(
        file = %file.file_name,
        format = %file.format,
        size = file.size,
        table = %names.raw_table,
        "Loading file"
    );

    let loaded = match file.format {
        SourceFormat::Delimited => load_delimited(ctx, file, &names.raw_table).await,
        SourceFormat::WikiXml => load_wiki(ctx, file, &names.raw_table).await,
    };

    let report = match loaded {
        Ok(report) => report,
        Err(e) => {
            drop_quietly(ctx.warehouse.as_ref(), &names.raw_table).await;
            return Err(e);
        },
    };

    let record = IngestionRecord {
        table_name: names.raw_table.clone(),
        file_name: file.file_name.clone(),
        item_name: names.item_name.clone(),
        event_time: at,
        file_size: file.size,
    };
    if let Err(e) = ctx.warehouse.record_ingestion(&record).await {
        // An unrecorded table would be orphaned by the next run
        drop_quietly(ctx.warehouse.as_ref(), &names.raw_table).await;
        return Err(e);
    }

    info!(
        file = %file.file_name,
        table = %names.raw_table,
        strategy = ?report.strategy,
        rows = report.rows,
        malformed = report.stats.map(|s| s.malformed),
        "File loaded"
    );
    Ok(report)
}

async fn load_delimited(ctx: &PipelineContext, file: &SourceFile, table: &str) -> Result<LoadReport> {
    let server_path = server_path(
        &ctx.config.warehouse.server_input_dir,
        &ctx.config.ingest.input_dir,
        file,
    );

    match ctx.warehouse.bulk_load_delimited(table, &server_path).await {
        Ok(()) => {
            // Rows the server skipped as malformed are not reported back
            let rows = ctx.warehouse.row_count(table).await?;
            return Ok(LoadReport {
                raw_table: table.to_string(),
                strategy: LoadStrategy::BulkNative,
                rows,
                stats: None,
            });
        },
        Err(e) => {
            warn!(
                file = %file.file_name,
                error = %e,
                "Bulk load failed, falling back to line parser"
            );
            ctx.warehouse.drop_table(table).await?;
        },
    }

    let ingest = ctx.config.ingest.clone();
    let path = file.path.clone();
    let stats = stream_into_table(ctx.warehouse.as_ref(), table, move |tx| {
        delimited::parse_file(&path, &ingest, tx)
    })
    .await?;

    Ok(LoadReport {
        raw_table: table.to_string(),
        strategy: LoadStrategy::LineFallback,
        rows: stats.rows,
        stats: Some(stats),
    })
}

async fn load_wiki(ctx: &PipelineContext, file: &SourceFile, table: &str) -> Result<LoadReport> {
    let batch_size = ctx.config.ingest.batch_size;
    let path = file.path.clone();
    let stats = stream_into_table(ctx.warehouse.as_ref(), table, move |tx| {
        wiki_xml::parse_file(&path, batch_size, tx)
    })
    .await?;

    Ok(LoadReport {
        raw_table: table.to_string(),
        strategy: LoadStrategy::WikiStream,
        rows: stats.rows,
        stats: Some(stats),
    })
}

/// Run `parse` on a blocking thread and insert what it produces into `table`.
///
/// If an insert fails the receiver is dropped, which stops the parser at its
/// next send.
pub async fn stream_into_table<F>(
    warehouse: &dyn Warehouse,
    table: &str,
    parse: F,
) -> Result<ParseStats>
where
    F: FnOnce(mpsc::Sender<ParsedChunk>) -> Result<ParseStats> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel(CHANNEL_DEPTH);
    let parser = tokio::task::spawn_blocking(move || parse(tx));

    let mut columns: Option<Vec<String>> = None;
    while let Some(chunk) = rx.recv().await {
        match chunk {
            ParsedChunk::Columns(defs) => {
                warehouse.create_raw_table(table, &defs).await?;
                columns = Some(defs.into_iter().map(|c| c.name).collect());
            },
            ParsedChunk::Rows(rows) => {
                let names = columns.clone().ok_or_else(|| {
                    PipelineError::Invalid("rows received before columns".to_string())
                })?;
                let batch = RawBatch::new(names, rows)?;
                warehouse.insert_rows(table, &batch).await?;
            },
        }
    }

    let stats = parser.await??;
    if columns.is_none() {
        return Err(PipelineError::Invalid(format!(
            "no header found, nothing loaded into {}",
            table
        )));
    }
    Ok(stats)
}

/// Send a chunk from the parser thread; fails once the inserter has gone away
pub(crate) fn send_chunk(tx: &mpsc::Sender<ParsedChunk>, chunk: ParsedChunk) -> Result<()> {
    tx.blocking_send(chunk)
        .map_err(|_| PipelineError::Invalid("raw table inserter stopped".to_string()))
}

async fn drop_quietly(warehouse: &dyn Warehouse, table: &str) {
    if let Err(e) = warehouse.drop_table(table).await {
        warn!(table = %table, error = %e, "Failed to drop partial raw table");
    }
}

/// Path of `file` as the warehouse's file reader sees it
pub fn server_path(server_input_dir: &str, input_dir: &Path, file: &SourceFile) -> String {
    let relative = file
        .path
        .strip_prefix(input_dir)
        .unwrap_or_else(|_| Path::new(&file.file_name));
    let relative: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    let relative = relative.join("/");

    if server_input_dir.is_empty() {
        relative
    } else {
        format!("{}/{}", server_input_dir.trim_end_matches('/'), relative)
    }
}
