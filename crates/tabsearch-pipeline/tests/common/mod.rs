//! In-memory backends for pipeline integration tests
//!
//! Each fake implements one of the pipeline's backend traits closely enough
//! for the stages to run end to end without a warehouse or search engine:
//!
//! - [`FakeWarehouse`] keeps tables as rows of [`RawValue`]s, numbers
//!   normalized rows from 1 in raw order and answers text pages the way the
//!   keyset query does. Its bulk load fails unless a table was registered for
//!   the server path with [`FakeWarehouse::serve_bulk_file`], so delimited
//!   files normally take the local fallback parser. Profiling and
//!   normalization can be made to fail for one column or table.
//! - [`FakeSearch`] records applied configurations and can be told to never
//!   become ready.
//! - [`FakeVectorStore`] and [`FakeEmbedder`] count calls and keep what they
//!   were given.
//!
//! # Example
//!
//! ```ignore
//! mod common;
//!
//! let env = common::TestEnv::new(input_dir.path());
//! let summary = run_ingest(&env.ctx).await?;
//! assert_eq!(env.warehouse.lineage_records().len(), 1);
//! ```

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tabsearch_pipeline::config::PipelineConfig;
use tabsearch_pipeline::error::{PipelineError, Result};
use tabsearch_pipeline::search::{SearchConfigDocument, SearchEngine};
use tabsearch_pipeline::vector::{Embedder, VectorRecord, VectorStore};
use tabsearch_pipeline::warehouse::{
    ColumnCounts, ColumnStat, IngestionRecord, LineageRecord, NormalizationPlan, RawBatch,
    RawColumn, RawValue, SummaryRow, TableColumn, TextRow, Warehouse,
};
use tabsearch_pipeline::PipelineContext;

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tabsearch_pipeline=debug")),
        )
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, Default)]
pub struct FakeTable {
    pub columns: Vec<TableColumn>,
    pub rows: Vec<Vec<RawValue>>,
}

impl FakeTable {
    fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| PipelineError::Warehouse(format!("Missing column {}", name)))
    }
}

#[derive(Debug, Default)]
struct WarehouseState {
    tables: BTreeMap<String, FakeTable>,
    ingestions: Vec<IngestionRecord>,
    stats: Vec<ColumnStat>,
    lineage: Vec<LineageRecord>,
    indexed: Vec<String>,
    vectorized: Vec<String>,
}

#[derive(Default)]
pub struct FakeWarehouse {
    state: Mutex<WarehouseState>,
    /// What a successful bulk load produces, by server path
    bulk_files: Mutex<BTreeMap<String, FakeTable>>,
    /// Column whose statistics query fails
    failing_column: Mutex<Option<String>>,
    /// Raw tables containing this text fail to normalize
    failing_normalization: Mutex<Option<String>>,
    pub bulk_loads: AtomicUsize,
    pub raw_creates: AtomicUsize,
    pub text_pages: AtomicUsize,
    pub schema_resets: AtomicUsize,
}

fn cell_text(value: &RawValue) -> Option<String> {
    match value {
        RawValue::Null => None,
        RawValue::Text(s) => Some(s.clone()),
        RawValue::UInt(n) => Some(n.to_string()),
        RawValue::Timestamp(t) => Some(t.to_string()),
    }
}

impl FakeWarehouse {
    pub fn table(&self, name: &str) -> Option<FakeTable> {
        self.state.lock().unwrap().tables.get(name).cloned()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.state.lock().unwrap().tables.keys().cloned().collect()
    }

    pub fn ingestions(&self) -> Vec<IngestionRecord> {
        self.state.lock().unwrap().ingestions.clone()
    }

    pub fn lineage_records(&self) -> Vec<LineageRecord> {
        self.state.lock().unwrap().lineage.clone()
    }

    pub fn indexed(&self) -> Vec<String> {
        self.state.lock().unwrap().indexed.clone()
    }

    pub fn vectorized(&self) -> Vec<String> {
        self.state.lock().unwrap().vectorized.clone()
    }

    /// Make the bulk load of `server_path` succeed with a table of text
    /// columns holding `rows`
    pub fn serve_bulk_file(&self, server_path: &str, columns: &[&str], rows: Vec<Vec<RawValue>>) {
        let table = FakeTable {
            columns: columns
                .iter()
                .map(|c| TableColumn::new(*c, "Nullable(String)"))
                .collect(),
            rows,
        };
        self.bulk_files
            .lock()
            .unwrap()
            .insert(server_path.to_string(), table);
    }

    pub fn fail_column_counts(&self, column: &str) {
        *self.failing_column.lock().unwrap() = Some(column.to_string());
    }

    pub fn fail_normalization(&self, raw_table_part: &str) {
        *self.failing_normalization.lock().unwrap() = Some(raw_table_part.to_string());
    }

    pub fn column_stats_for(&self, table: &str) -> Vec<ColumnStat> {
        let state = self.state.lock().unwrap();
        state
            .stats
            .iter()
            .filter(|s| s.table_name == table)
            .cloned()
            .collect()
    }

    /// Add a normalized table with lineage, as if ingested by an earlier run.
    /// Rows get ids from 1.
    pub fn add_normalized_table(&self, name: &str, columns: &[(&str, &str)], rows: Vec<Vec<RawValue>>) {
        let mut table = FakeTable {
            columns: vec![TableColumn::new("id", "Int64")],
            rows: Vec::new(),
        };
        table
            .columns
            .extend(columns.iter().map(|(n, t)| TableColumn::new(*n, *t)));
        for (i, row) in rows.into_iter().enumerate() {
            let mut values = vec![RawValue::UInt(i as u64 + 1)];
            values.extend(row);
            table.rows.push(values);
        }

        let mut state = self.state.lock().unwrap();
        state.tables.insert(name.to_string(), table);
        state.lineage.push(LineageRecord {
            table_name: name.to_string(),
            original_table_name: name.replacen("table_", "_input_log_", 1),
        });
    }
}

#[async_trait]
impl Warehouse for FakeWarehouse {
    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn reset_schema(&self) -> Result<()> {
        self.schema_resets.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        state.ingestions.clear();
        state.stats.clear();
        state.lineage.clear();
        state.indexed.clear();
        state.vectorized.clear();
        Ok(())
    }

    async fn ingested_file_names(&self) -> Result<HashSet<String>> {
        let state = self.state.lock().unwrap();
        Ok(state.ingestions.iter().map(|r| r.file_name.clone()).collect())
    }

    async fn record_ingestion(&self, record: &IngestionRecord) -> Result<()> {
        self.state.lock().unwrap().ingestions.push(record.clone());
        Ok(())
    }

    async fn bulk_load_delimited(&self, table: &str, server_path: &str) -> Result<()> {
        self.bulk_loads.fetch_add(1, Ordering::SeqCst);
        if let Some(loaded) = self.bulk_files.lock().unwrap().get(server_path).cloned() {
            self.state
                .lock()
                .unwrap()
                .tables
                .insert(table.to_string(), loaded);
            return Ok(());
        }
        // Leave a partial table behind like a failed CREATE ... AS SELECT can
        self.state
            .lock()
            .unwrap()
            .tables
            .insert(table.to_string(), FakeTable::default());
        Err(PipelineError::Warehouse(
            "Code: 27. DB::Exception: Cannot parse input".to_string(),
        ))
    }

    async fn create_raw_table(&self, table: &str, columns: &[RawColumn]) -> Result<()> {
        self.raw_creates.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        if state.tables.contains_key(table) {
            return Err(PipelineError::Warehouse(format!("Table {} already exists", table)));
        }
        state.tables.insert(
            table.to_string(),
            FakeTable {
                columns: columns.to_vec(),
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn insert_rows(&self, table: &str, batch: &RawBatch) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let target = state
            .tables
            .get_mut(table)
            .ok_or_else(|| PipelineError::Warehouse(format!("Unknown table {}", table)))?;
        let positions = batch
            .columns()
            .iter()
            .map(|c| target.column_index(c))
            .collect::<Result<Vec<_>>>()?;
        for row in batch.rows() {
            let mut values = vec![RawValue::Null; target.columns.len()];
            for (pos, value) in positions.iter().zip(row) {
                values[*pos] = value.clone();
            }
            target.rows.push(values);
        }
        Ok(())
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        self.state.lock().unwrap().tables.remove(table);
        Ok(())
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        let state = self.state.lock().unwrap();
        let t = state
            .tables
            .get(table)
            .ok_or_else(|| PipelineError::Warehouse(format!("Unknown table {}", table)))?;
        Ok(t.rows.len() as u64)
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<TableColumn>> {
        let state = self.state.lock().unwrap();
        state
            .tables
            .get(table)
            .map(|t| t.columns.clone())
            .ok_or_else(|| PipelineError::NotFound(format!("table {}", table)))
    }

    async fn column_counts(&self, table: &str, column: &str) -> Result<ColumnCounts> {
        if self.failing_column.lock().unwrap().as_deref() == Some(column) {
            return Err(PipelineError::Warehouse(format!(
                "Code: 241. DB::Exception: Memory limit exceeded while counting {}",
                column
            )));
        }
        let state = self.state.lock().unwrap();
        let t = state
            .tables
            .get(table)
            .ok_or_else(|| PipelineError::Warehouse(format!("Unknown table {}", table)))?;
        let i = t.column_index(column)?;

        let mut null_count = 0;
        let mut distinct = HashSet::new();
        for row in &t.rows {
            match cell_text(&row[i]) {
                Some(text) => {
                    distinct.insert(text);
                },
                None => null_count += 1,
            }
        }
        Ok(ColumnCounts {
            null_count,
            distinct_count: distinct.len() as u64,
        })
    }

    async fn insert_column_stat(&self, stat: &ColumnStat) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        // Replacing engine: the latest row per (table, index) wins
        state
            .stats
            .retain(|s| !(s.table_name == stat.table_name && s.column_index == stat.column_index));
        state.stats.push(stat.clone());
        Ok(())
    }

    async fn column_stats(&self, table: &str) -> Result<Vec<ColumnStat>> {
        let state = self.state.lock().unwrap();
        let mut stats: Vec<ColumnStat> = state
            .stats
            .iter()
            .filter(|s| s.table_name == table)
            .cloned()
            .collect();
        stats.sort_by_key(|s| s.column_index);
        Ok(stats)
    }

    async fn create_normalized_table(&self, plan: &NormalizationPlan) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.tables.contains_key(&plan.normalized_table) {
            return Err(PipelineError::Warehouse(format!(
                "Table {} already exists",
                plan.normalized_table
            )));
        }
        let raw = state
            .tables
            .get(&plan.raw_table)
            .ok_or_else(|| PipelineError::Warehouse(format!("Unknown table {}", plan.raw_table)))?;
        let positions = plan
            .columns
            .iter()
            .map(|c| raw.column_index(&c.source_name))
            .collect::<Result<Vec<_>>>()?;

        let mut table = FakeTable {
            columns: vec![TableColumn::new("id", "Int64")],
            rows: Vec::new(),
        };
        table.columns.extend(
            plan.columns
                .iter()
                .map(|c| TableColumn::new(c.target_name.clone(), c.target_type.clone())),
        );
        for (n, row) in raw.rows.iter().enumerate() {
            let mut values = vec![RawValue::UInt(n as u64 + 1)];
            values.extend(positions.iter().map(|&i| row[i].clone()));
            table.rows.push(values);
        }

        let failing = self.failing_normalization.lock().unwrap().clone();
        if failing.is_some_and(|part| plan.raw_table.contains(&part)) {
            // The table exists but was never filled
            table.rows.clear();
            state.tables.insert(plan.normalized_table.clone(), table);
            return Err(PipelineError::Warehouse(
                "Code: 241. DB::Exception: Memory limit exceeded".to_string(),
            ));
        }

        state.tables.insert(plan.normalized_table.clone(), table);
        Ok(())
    }

    async fn optimize_table(&self, _table: &str) -> Result<()> {
        Ok(())
    }

    async fn record_lineage(&self, record: &LineageRecord) -> Result<()> {
        self.state.lock().unwrap().lineage.push(record.clone());
        Ok(())
    }

    async fn lineage(&self) -> Result<Vec<LineageRecord>> {
        Ok(self.state.lock().unwrap().lineage.clone())
    }

    async fn record_index_done(&self, table: &str) -> Result<()> {
        self.state.lock().unwrap().indexed.push(table.to_string());
        Ok(())
    }

    async fn indexed_tables(&self) -> Result<HashSet<String>> {
        Ok(self.state.lock().unwrap().indexed.iter().cloned().collect())
    }

    async fn text_page(
        &self,
        table: &str,
        text_columns: &[String],
        after_id: i64,
        limit: usize,
        min_length: usize,
    ) -> Result<Vec<TextRow>> {
        self.text_pages.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        let t = state
            .tables
            .get(table)
            .ok_or_else(|| PipelineError::Warehouse(format!("Unknown table {}", table)))?;
        let id_index = t.column_index("id")?;
        let positions = text_columns
            .iter()
            .map(|c| t.column_index(c))
            .collect::<Result<Vec<_>>>()?;

        let mut page = Vec::new();
        for row in &t.rows {
            let id = match &row[id_index] {
                RawValue::UInt(n) => *n as i64,
                other => panic!("unexpected id value {:?}", other),
            };
            if id <= after_id {
                continue;
            }
            let parts: Vec<String> = positions
                .iter()
                .map(|&i| cell_text(&row[i]).unwrap_or_default())
                .collect();
            let length: usize = parts.iter().map(|p| p.trim().chars().count()).sum();
            if length < min_length {
                continue;
            }
            page.push(TextRow {
                id,
                text: parts.join(" "),
            });
            if page.len() == limit {
                break;
            }
        }
        Ok(page)
    }

    async fn vectorized_tables(&self) -> Result<HashSet<String>> {
        Ok(self.state.lock().unwrap().vectorized.iter().cloned().collect())
    }

    async fn record_vectors_computed(&self, table: &str) -> Result<()> {
        self.state.lock().unwrap().vectorized.push(table.to_string());
        Ok(())
    }

    async fn summary(&self) -> Result<Vec<SummaryRow>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .ingestions
            .iter()
            .map(|r| {
                let normalized = state
                    .lineage
                    .iter()
                    .find(|l| l.original_table_name == r.table_name)
                    .map(|l| l.table_name.clone());
                SummaryRow {
                    file_name: r.file_name.clone(),
                    item_name: r.item_name.clone(),
                    raw_table: r.table_name.clone(),
                    indexed: normalized
                        .as_ref()
                        .is_some_and(|n| state.indexed.contains(n)),
                    vectorized: normalized
                        .as_ref()
                        .is_some_and(|n| state.vectorized.contains(n)),
                    normalized_table: normalized,
                    file_size: r.file_size,
                    duration_secs: None,
                    bytes_per_second: None,
                }
            })
            .collect())
    }
}

/// Search engine that accepts every configuration and answers probes unless
/// told to stay unavailable
#[derive(Default)]
pub struct FakeSearch {
    applied: Mutex<Vec<(String, String)>>,
    pub unavailable: AtomicBool,
    pub probes: AtomicUsize,
}

impl FakeSearch {
    /// Tables passed to `apply_config`, in call order
    pub fn applied_tables(&self) -> Vec<String> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .map(|(t, _)| t.clone())
            .collect()
    }

    pub fn last_config(&self) -> Option<String> {
        self.applied.lock().unwrap().last().map(|(_, c)| c.clone())
    }
}

#[async_trait]
impl SearchEngine for FakeSearch {
    async fn apply_config(&self, document: &SearchConfigDocument, table: &str) -> Result<()> {
        self.applied
            .lock()
            .unwrap()
            .push((table.to_string(), document.text.clone()));
        Ok(())
    }

    async fn probe_count(&self, table: &str) -> Result<u64> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PipelineError::Search(format!("unknown table '{}'", table)));
        }
        Ok(1)
    }

    async fn probe_sample(&self, _table: &str) -> Result<()> {
        Ok(())
    }

    async fn probe_autocomplete(&self, _table: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeVectorStore {
    tables: Mutex<BTreeMap<String, usize>>,
    records: Mutex<Vec<VectorRecord>>,
    /// 1-based insert call that fails, counted over the store's lifetime
    failing_insert: Mutex<Option<usize>>,
    pub inserts: AtomicUsize,
    pub deletes: AtomicUsize,
    pub fail_inserts: AtomicBool,
}

impl FakeVectorStore {
    pub fn records(&self) -> Vec<VectorRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn table_dims(&self, table: &str) -> Option<usize> {
        self.tables.lock().unwrap().get(table).copied()
    }

    pub fn fail_insert_number(&self, n: usize) {
        *self.failing_insert.lock().unwrap() = Some(n);
    }
}

#[async_trait]
impl VectorStore for FakeVectorStore {
    async fn ensure_table(&self, table: &str, dims: usize) -> Result<()> {
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_insert(dims);
        Ok(())
    }

    async fn insert_batch(&self, table: &str, records: &[VectorRecord]) -> Result<()> {
        let n = self.inserts.fetch_add(1, Ordering::SeqCst) + 1;
        let failing = *self.failing_insert.lock().unwrap() == Some(n);
        if failing || self.fail_inserts.load(Ordering::SeqCst) {
            return Err(PipelineError::Vector(format!("insert into {} failed", table)));
        }
        self.records.lock().unwrap().extend_from_slice(records);
        Ok(())
    }

    async fn delete_source(&self, _table: &str, source_table: &str) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.records
            .lock()
            .unwrap()
            .retain(|r| r.table_name != source_table);
        Ok(())
    }
}

/// Returns `[len, 0, 0, ...]` for every text
pub struct FakeEmbedder {
    pub dims: usize,
    pub calls: AtomicUsize,
    pub texts: AtomicUsize,
}

impl FakeEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            calls: AtomicUsize::new(0),
            texts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    fn model_name(&self) -> &str {
        "fake"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts
            .iter()
            .map(|t| {
                let mut v = vec![0.0; self.dims];
                v[0] = t.chars().count() as f32;
                v
            })
            .collect())
    }
}

pub const TEST_DIMS: usize = 4;

/// Configuration tuned for fast tests: tiny backoff, small batches
pub fn test_config(input_dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.ingest.input_dir = input_dir.to_path_buf();
    config.ingest.batch_size = 100;
    config.search.ready_attempts = 3;
    config.search.ready_backoff_ms = 1;
    config.vector.embedding.dims = TEST_DIMS;
    config.vector.embedding.provider = "disabled".to_string();
    config
}

pub struct TestEnv {
    pub ctx: PipelineContext,
    pub warehouse: Arc<FakeWarehouse>,
    pub search: Arc<FakeSearch>,
    pub vectors: Arc<FakeVectorStore>,
    pub embedder: Arc<FakeEmbedder>,
}

impl TestEnv {
    pub fn new(input_dir: &Path) -> Self {
        Self::with_config(test_config(input_dir))
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        let warehouse = Arc::new(FakeWarehouse::default());
        let search = Arc::new(FakeSearch::default());
        let vectors = Arc::new(FakeVectorStore::default());
        let embedder = Arc::new(FakeEmbedder::new(config.vector.embedding.dims));

        let ctx = PipelineContext::new(
            config,
            warehouse.clone(),
            search.clone(),
            vectors.clone(),
            embedder.clone(),
        );
        Self {
            ctx,
            warehouse,
            search,
            vectors,
            embedder,
        }
    }
}
