//! Statement builders for the analytical store
//!
//! Pure functions from pipeline types to SQL text. Identifiers go through
//! [`quote_identifier`] and values through [`quote_literal`] so nothing read
//! from input files reaches a statement unquoted.

use super::{NormalizationPlan, TableColumn};
use tabsearch_common::ident::{quote_identifier as ident, quote_literal as lit};

/// Inner alias for the surrogate key while the normalized select is built,
/// so a raw column literally named `id` cannot shadow it
const ROW_ID_ALIAS: &str = "_tabsearch_row_id";

pub fn bulk_load_delimited(table: &str, server_path: &str) -> String {
    format!(
        "CREATE TABLE {} ENGINE = Log AS SELECT * FROM file({}, 'CSVWithNames')",
        ident(table),
        lit(server_path)
    )
}

pub fn create_raw_table(table: &str, columns: &[TableColumn]) -> String {
    let defs: Vec<String> = columns
        .iter()
        .map(|c| format!("{} {}", ident(&c.name), c.sql_type))
        .collect();
    format!(
        "CREATE TABLE {} ({}) ENGINE = Log",
        ident(table),
        defs.join(", ")
    )
}

pub fn insert_json_rows(table: &str, columns: &[String]) -> String {
    let cols: Vec<String> = columns.iter().map(|c| ident(c)).collect();
    format!(
        "INSERT INTO {} ({}) FORMAT JSONEachRow",
        ident(table),
        cols.join(", ")
    )
}

pub fn drop_table(table: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", ident(table))
}

pub fn row_count(table: &str) -> String {
    format!("SELECT count() AS n FROM {}", ident(table))
}

pub fn table_columns(database: &str, table: &str) -> String {
    format!(
        "SELECT name, type FROM system.columns WHERE database = {} AND table = {} ORDER BY position",
        lit(database),
        lit(table)
    )
}

pub fn column_counts(table: &str, column: &str) -> String {
    let c = ident(column);
    format!(
        "SELECT countIf(isNull({c})) AS null_count, uniqExact({c}) AS distinct_count FROM {}",
        ident(table)
    )
}

pub fn column_stats(table: &str) -> String {
    format!(
        "SELECT table_name, column_index, column_name, column_type, column_base_type, \
         null_count, non_null_count, unique_count, null_pct, unique_pct, column_name_fixed \
         FROM input_tables_raw_columns FINAL WHERE table_name = {} ORDER BY column_index",
        lit(table)
    )
}

/// Typed copy of the raw table with a dense 1-based `id` in raw row order.
///
/// The raw tables use the Log engine, so a single-threaded read returns rows
/// in insertion order and `rowNumberInAllBlocks` numbers them without gaps.
pub fn create_normalized_table(plan: &NormalizationPlan) -> String {
    let mut inner = vec![format!(
        "toInt64(rowNumberInAllBlocks() + 1) AS {}",
        ident(ROW_ID_ALIAS)
    )];
    let mut outer = vec![format!("{} AS `id`", ident(ROW_ID_ALIAS))];

    for column in &plan.columns {
        inner.push(format!(
            "CAST({} AS {}) AS {}",
            ident(&column.source_name),
            column.target_type,
            ident(&column.target_name)
        ));
        outer.push(ident(&column.target_name));
    }

    format!(
        "CREATE TABLE {} ENGINE = MergeTree() ORDER BY (id, intHash32(id)) SAMPLE BY intHash32(id) \
         AS SELECT {} FROM (SELECT {} FROM {}) SETTINGS max_threads = 1",
        ident(&plan.normalized_table),
        outer.join(", "),
        inner.join(", "),
        ident(&plan.raw_table)
    )
}

pub fn optimize_table(table: &str) -> String {
    format!("OPTIMIZE TABLE {} FINAL", ident(table))
}

pub fn ingested_file_names() -> &'static str {
    "SELECT DISTINCT file_name FROM input_tables_list"
}

pub fn lineage() -> &'static str {
    "SELECT table_name, original_table_name FROM input_tables_recreated ORDER BY event_time, table_name"
}

pub fn record_table_event(bookkeeping_table: &str, table: &str) -> String {
    format!(
        "INSERT INTO {} (table_name) VALUES ({})",
        ident(bookkeeping_table),
        lit(table)
    )
}

pub fn distinct_table_names(bookkeeping_table: &str) -> String {
    format!("SELECT DISTINCT table_name FROM {}", ident(bookkeeping_table))
}

/// Null-safe text of one column
fn text_expr(column: &str) -> String {
    format!("ifNull(toString({}), '')", ident(column))
}

/// One page of concatenated row text, keyset-paginated on `id`
pub fn text_page(
    table: &str,
    text_columns: &[String],
    after_id: i64,
    limit: usize,
    min_length: usize,
) -> String {
    let parts: Vec<String> = text_columns.iter().map(|c| text_expr(c)).collect();
    let lengths: Vec<String> = text_columns
        .iter()
        .map(|c| format!("length(trim({}))", text_expr(c)))
        .collect();

    format!(
        "SELECT id, concatWithSeparator(' ', {}) AS text FROM {} \
         WHERE id > {} AND ({}) >= {} ORDER BY id LIMIT {}",
        parts.join(", "),
        ident(table),
        after_id,
        lengths.join(" + "),
        min_length,
        limit
    )
}

pub fn summary() -> &'static str {
    "SELECT s.file_name AS file_name, s.item_name AS item_name, s.raw_table AS raw_table, \
     s.normalized_table AS normalized_table, s.file_size AS file_size, \
     toBool(s.indexed_at IS NOT NULL) AS indexed, \
     toBool(ifNull(s.normalized_table, '') IN (SELECT table_name FROM input_table_vectors_computed)) AS vectorized, \
     toFloat64(s.duration_secs) AS duration_secs, toFloat64(s.bytes_per_second) AS bytes_per_second \
     FROM input_tables_summary AS s ORDER BY s.ingested_at"
}
