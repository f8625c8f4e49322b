//! Per-table embedding and upload
//!
//! Two levels of concurrency:
//!
//! - Up to `table_workers` tables are processed at once.
//! - Within a table, pages are read and embedded one after another while
//!   up to `upload_workers` uploads of earlier pages run in the background.
//!
//! All embedding calls in the process go through one [`ModelGate`], so the
//! model only ever sees one page at a time. A table's completion record is
//! written only after every upload it spawned has finished successfully, and
//! vectors from an earlier unfinished attempt are removed before it starts.

use super::chunker::chunk_rows;
use super::embedder::{check_embeddings, Embedder};
use super::store::{VectorRecord, VectorStore};
use crate::config::VectorConfig;
use crate::context::PipelineContext;
use crate::error::{PipelineError, Result};
use crate::warehouse::TableColumn;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Column types whose values are embedded
pub const TEXT_COLUMN_TYPES: &[&str] = &["String", "LowCardinality(String)", "Nullable(String)"];

/// Names of the embeddable columns, in table order
pub fn text_columns(columns: &[TableColumn]) -> Vec<String> {
    columns
        .iter()
        .filter(|c| c.name != "id" && TEXT_COLUMN_TYPES.contains(&c.sql_type.as_str()))
        .map(|c| c.name.clone())
        .collect()
}

/// Serializes access to the shared embedding model
pub struct ModelGate {
    embedder: Arc<dyn Embedder>,
    lock: Mutex<()>,
}

impl ModelGate {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            lock: Mutex::new(()),
        }
    }

    /// Embed one page and verify the answer
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let _turn = self.lock.lock().await;
        let vectors = self.embedder.embed(texts).await?;
        check_embeddings(texts.len(), self.embedder.dims(), &vectors)?;
        Ok(vectors)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableVectorReport {
    pub table: String,
    pub rows: u64,
    pub chunks: u64,
    pub batches: u64,
}

#[derive(Debug, Default)]
pub struct VectorRunSummary {
    /// Tables already marked done before this run
    pub skipped: usize,
    pub completed: Vec<TableVectorReport>,
    pub failed: Vec<(String, String)>,
}

/// Embed every normalized table that has no completion record yet.
pub async fn embed_all_tables(ctx: &PipelineContext) -> Result<VectorRunSummary> {
    let config = &ctx.config.vector;
    let done = ctx.warehouse.vectorized_tables().await?;

    let mut seen = HashSet::new();
    let mut pending = Vec::new();
    let mut skipped = 0;
    for record in ctx.warehouse.lineage().await? {
        if !seen.insert(record.table_name.clone()) {
            continue;
        }
        if done.contains(&record.table_name) {
            skipped += 1;
        } else {
            pending.push(record.table_name);
        }
    }

    let mut summary = VectorRunSummary {
        skipped,
        ..Default::default()
    };
    if pending.is_empty() {
        info!(skipped, "All tables already have vectors");
        return Ok(summary);
    }

    let vector_table = config.table_name();
    ctx.vectors
        .ensure_table(&vector_table, config.embedding.dims)
        .await?;

    info!(
        tables = pending.len(),
        skipped,
        workers = config.table_workers,
        vector_table = %vector_table,
        "Computing vectors"
    );

    let gate = ModelGate::new(Arc::clone(&ctx.embedder));
    let gate = &gate;
    let vector_table = vector_table.as_str();
    let results: Vec<(String, Result<TableVectorReport>)> = stream::iter(pending)
        .map(|table| async move {
            let result = embed_table(ctx, gate, vector_table, &table).await;
            (table, result)
        })
        .buffer_unordered(config.table_workers.max(1))
        .collect()
        .await;

    for (table, result) in results {
        match result {
            Ok(report) => summary.completed.push(report),
            Err(e) => {
                error!(table = %table, error = %e, "Vector computation failed");
                summary.failed.push((table, e.to_string()));
            },
        }
    }

    info!(
        completed = summary.completed.len(),
        failed = summary.failed.len(),
        "Vector run finished"
    );
    Ok(summary)
}

/// Embed one normalized table into `vector_table` and mark it done.
pub async fn embed_table(
    ctx: &PipelineContext,
    gate: &ModelGate,
    vector_table: &str,
    table: &str,
) -> Result<TableVectorReport> {
    let started = Instant::now();
    let config = &ctx.config.vector;
    let columns = text_columns(&ctx.warehouse.table_columns(table).await?);

    let mut report = TableVectorReport {
        table: table.to_string(),
        ..Default::default()
    };

    if columns.is_empty() {
        info!(table = %table, "No text columns, nothing to embed");
    } else {
        info!(table = %table, columns = columns.len(), "Embedding table");
        // A table is pending until every upload succeeded, so an earlier
        // attempt may have committed some of its batches
        ctx.vectors.delete_source(vector_table, table).await?;
        let mut uploads = UploadPool::new(Arc::clone(&ctx.vectors), vector_table, config.upload_workers);
        let produced = embed_pages(ctx, gate, &mut uploads, table, &columns, &mut report).await;
        // Every spawned upload is awaited, even when embedding failed
        let uploaded = uploads.join().await;
        produced?;
        uploaded?;
    }

    ctx.warehouse.record_vectors_computed(table).await?;
    info!(
        table = %table,
        rows = report.rows,
        chunks = report.chunks,
        batches = report.batches,
        duration_secs = started.elapsed().as_secs_f64(),
        "Table vectors computed"
    );
    Ok(report)
}

async fn embed_pages(
    ctx: &PipelineContext,
    gate: &ModelGate,
    uploads: &mut UploadPool,
    table: &str,
    columns: &[String],
    report: &mut TableVectorReport,
) -> Result<()> {
    let config: &VectorConfig = &ctx.config.vector;
    let mut after_id = 0i64;

    loop {
        let page = ctx
            .warehouse
            .text_page(table, columns, after_id, config.page_size, config.min_text_length)
            .await?;
        let Some(last) = page.last() else {
            break;
        };
        after_id = last.id;
        report.rows += page.len() as u64;

        let chunks = chunk_rows(
            page.iter().map(|r| (r.id, r.text.as_str())),
            config.chunk_size,
            config.min_text_length,
        );
        if !chunks.is_empty() {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            let vectors = gate.embed(&texts).await?;
            report.chunks += chunks.len() as u64;

            let mut records: Vec<VectorRecord> = chunks
                .into_iter()
                .zip(vectors)
                .map(|(chunk, vector)| VectorRecord {
                    table_name: table.to_string(),
                    row_id: chunk.row_id,
                    text: chunk.text,
                    vector,
                })
                .collect();

            while !records.is_empty() {
                let rest = records.split_off(records.len().min(config.upload_batch_size.max(1)));
                let batch = std::mem::replace(&mut records, rest);
                uploads.spawn(batch).await?;
                report.batches += 1;
            }
        }

        debug!(table = %table, after_id, rows = report.rows, "Page embedded");
        if page.len() < config.page_size {
            break;
        }
    }
    Ok(())
}

/// Bounded set of background uploads for one table
struct UploadPool {
    store: Arc<dyn VectorStore>,
    vector_table: String,
    permits: Arc<Semaphore>,
    handles: Vec<JoinHandle<Result<()>>>,
}

impl UploadPool {
    fn new(store: Arc<dyn VectorStore>, vector_table: &str, workers: usize) -> Self {
        Self {
            store,
            vector_table: vector_table.to_string(),
            permits: Arc::new(Semaphore::new(workers.max(1))),
            handles: Vec::new(),
        }
    }

    /// Start uploading `batch`, waiting first if all workers are busy
    async fn spawn(&mut self, batch: Vec<VectorRecord>) -> Result<()> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Vector("upload pool closed".to_string()))?;
        let store = Arc::clone(&self.store);
        let vector_table = self.vector_table.clone();

        self.handles.push(tokio::spawn(async move {
            let _permit = permit;
            store.insert_batch(&vector_table, &batch).await
        }));
        Ok(())
    }

    /// Wait for every upload; the first failure is returned
    async fn join(self) -> Result<()> {
        let mut first_error = None;
        for handle in self.handles {
            let outcome = match handle.await {
                Ok(result) => result,
                Err(e) => Err(PipelineError::from(e)),
            };
            if let Err(e) = outcome {
                warn!(error = %e, "Vector upload failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
