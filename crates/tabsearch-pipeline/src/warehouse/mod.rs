//! Analytical store access
//!
//! Every stage talks to the column store through the [`Warehouse`] trait. The
//! production implementation is [`ClickHouseClient`]; tests swap in an
//! in-memory fake. The trait speaks in pipeline terms (raw tables, column
//! statistics, lineage) rather than raw SQL so each stage stays testable.
//!
//! Bookkeeping tables:
//!
//! | Table | Written by |
//! |-------|-----------|
//! | `input_tables_list` | raw loader, one row per ingested file |
//! | `input_tables_raw_columns` | column profiler |
//! | `input_tables_recreated` | schema normalizer (lineage) |
//! | `index_status_event` | the search engine's own indexing hooks |
//! | `input_indexing_done` | index publisher |
//! | `input_table_vectors_computed` | vector pipeline |

pub mod clickhouse;
pub mod schema;
pub mod sql;

pub use clickhouse::ClickHouseClient;

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Format of DateTime values in raw rows
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Column type of every column created by the delimited fallback loader
pub const RAW_TEXT_TYPE: &str = "Nullable(String)";

/// UTC times as Unix seconds, so the store never applies its own time zone
/// to a client-side timestamp
pub(crate) mod epoch_seconds {
    use chrono::{DateTime, NaiveDateTime};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(value.and_utc().timestamp())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let secs = i64::deserialize(d)?;
        DateTime::from_timestamp(secs, 0)
            .map(|t| t.naive_utc())
            .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {}", secs)))
    }
}

/// One ingested file. Written once per successfully loaded file and used as
/// the dedup key for discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionRecord {
    /// Raw staging table the file was loaded into
    pub table_name: String,
    pub file_name: String,
    pub item_name: String,
    #[serde(with = "epoch_seconds")]
    pub event_time: NaiveDateTime,
    pub file_size: u64,
}

/// Maps a normalized table back to the raw table it was built from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageRecord {
    pub table_name: String,
    pub original_table_name: String,
}

/// A column as declared in the store, in table order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub sql_type: String,
}

impl TableColumn {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
        }
    }
}

/// Column definition for a raw staging table
pub type RawColumn = TableColumn;

/// A single cell of a raw row
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Text(String),
    UInt(u64),
    Timestamp(NaiveDateTime),
}

impl RawValue {
    /// Text cell, or null for `None`
    pub fn text(value: Option<String>) -> Self {
        value.map(RawValue::Text).unwrap_or(RawValue::Null)
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            RawValue::Null => serde_json::Value::Null,
            RawValue::Text(s) => serde_json::Value::String(s.clone()),
            RawValue::UInt(n) => serde_json::Value::from(*n),
            RawValue::Timestamp(t) => {
                serde_json::Value::String(t.format(DATETIME_FORMAT).to_string())
            },
        }
    }
}

pub type RawRow = Vec<RawValue>;

/// Rows bound for one raw table; every row has exactly one value per column
#[derive(Debug, Clone, PartialEq)]
pub struct RawBatch {
    columns: Vec<String>,
    rows: Vec<RawRow>,
}

impl RawBatch {
    pub fn new(columns: Vec<String>, rows: Vec<RawRow>) -> Result<Self> {
        if let Some((i, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != columns.len())
        {
            return Err(PipelineError::Invalid(format!(
                "row {} has {} values for {} columns",
                i,
                row.len(),
                columns.len()
            )));
        }
        Ok(Self { columns, rows })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[RawRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// One JSON object per row, keyed by column name
    pub fn to_json_lines(&self) -> Result<String> {
        let mut out = String::new();
        for row in &self.rows {
            let object: serde_json::Map<String, serde_json::Value> = self
                .columns
                .iter()
                .zip(row)
                .map(|(name, value)| (name.clone(), value.to_json()))
                .collect();
            out.push_str(&serde_json::to_string(&object)?);
            out.push('\n');
        }
        Ok(out)
    }
}

/// Null and distinct counts for one column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ColumnCounts {
    pub null_count: u64,
    pub distinct_count: u64,
}

/// Profile of one raw column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnStat {
    pub table_name: String,
    pub column_index: u32,
    pub column_name: String,
    pub column_type: String,
    pub column_base_type: String,
    pub null_count: u64,
    pub non_null_count: u64,
    pub unique_count: u64,
    pub null_pct: f64,
    pub unique_pct: f64,
    pub column_name_fixed: String,
}

/// One output column of a normalized table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedColumn {
    pub source_name: String,
    pub target_name: String,
    pub target_type: String,
}

/// Everything needed to build a normalized table from a raw table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizationPlan {
    pub raw_table: String,
    pub normalized_table: String,
    pub columns: Vec<NormalizedColumn>,
}

/// A row's concatenated text, keyed by surrogate id
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TextRow {
    pub id: i64,
    pub text: String,
}

/// One line of the run summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub file_name: String,
    pub item_name: String,
    pub raw_table: String,
    pub normalized_table: Option<String>,
    pub file_size: u64,
    pub indexed: bool,
    pub vectorized: bool,
    pub duration_secs: Option<f64>,
    pub bytes_per_second: Option<f64>,
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Create the bookkeeping tables and summary view if missing
    async fn ensure_schema(&self) -> Result<()>;

    /// Drop every bookkeeping table and the summary view
    async fn reset_schema(&self) -> Result<()>;

    // Raw loading

    async fn ingested_file_names(&self) -> Result<HashSet<String>>;

    async fn record_ingestion(&self, record: &IngestionRecord) -> Result<()>;

    /// Server-side load of a delimited file with a header row. `server_path`
    /// is the path as the store's file reader sees it.
    async fn bulk_load_delimited(&self, table: &str, server_path: &str) -> Result<()>;

    async fn create_raw_table(&self, table: &str, columns: &[RawColumn]) -> Result<()>;

    async fn insert_rows(&self, table: &str, batch: &RawBatch) -> Result<()>;

    /// Drop a table, no error if it does not exist
    async fn drop_table(&self, table: &str) -> Result<()>;

    // Profiling

    async fn row_count(&self, table: &str) -> Result<u64>;

    async fn table_columns(&self, table: &str) -> Result<Vec<TableColumn>>;

    async fn column_counts(&self, table: &str, column: &str) -> Result<ColumnCounts>;

    async fn insert_column_stat(&self, stat: &ColumnStat) -> Result<()>;

    /// Latest statistics for a table, ordered by column index
    async fn column_stats(&self, table: &str) -> Result<Vec<ColumnStat>>;

    // Normalization

    async fn create_normalized_table(&self, plan: &NormalizationPlan) -> Result<()>;

    async fn optimize_table(&self, table: &str) -> Result<()>;

    async fn record_lineage(&self, record: &LineageRecord) -> Result<()>;

    async fn lineage(&self) -> Result<Vec<LineageRecord>>;

    // Index publication

    async fn record_index_done(&self, table: &str) -> Result<()>;

    async fn indexed_tables(&self) -> Result<HashSet<String>>;

    // Vectors

    /// Rows with `id > after_id` ordered by id, at most `limit`, whose text
    /// columns hold at least `min_length` non-blank characters in total
    async fn text_page(
        &self,
        table: &str,
        text_columns: &[String],
        after_id: i64,
        limit: usize,
        min_length: usize,
    ) -> Result<Vec<TextRow>>;

    async fn vectorized_tables(&self) -> Result<HashSet<String>>;

    async fn record_vectors_computed(&self, table: &str) -> Result<()>;

    // Reporting

    async fn summary(&self) -> Result<Vec<SummaryRow>>;
}
