//! Bookkeeping schema
//!
//! These tables hold all resumable state. Creation is idempotent; `reset`
//! drops them in reverse dependency order.

pub const INPUT_TABLES_LIST: &str = "input_tables_list";
pub const INPUT_TABLES_RAW_COLUMNS: &str = "input_tables_raw_columns";
pub const INPUT_TABLES_RECREATED: &str = "input_tables_recreated";
pub const INDEX_STATUS_EVENT: &str = "index_status_event";
pub const INPUT_INDEXING_DONE: &str = "input_indexing_done";
pub const INPUT_TABLE_VECTORS_COMPUTED: &str = "input_table_vectors_computed";
pub const INPUT_TABLES_SUMMARY: &str = "input_tables_summary";

const CREATE_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS input_tables_list (
        table_name String,
        file_name String,
        item_name String,
        event_time DateTime,
        file_size UInt64
    ) ENGINE = MergeTree() ORDER BY event_time",
    // ReplacingMergeTree so re-profiling a table replaces its rows
    "CREATE TABLE IF NOT EXISTS input_tables_raw_columns (
        table_name String,
        column_index UInt32,
        column_name String,
        column_type String,
        column_base_type String,
        null_count UInt64,
        non_null_count UInt64,
        unique_count UInt64,
        null_pct Float64,
        unique_pct Float64,
        column_name_fixed String,
        event_time DateTime DEFAULT now()
    ) ENGINE = ReplacingMergeTree(event_time) ORDER BY (table_name, column_index)",
    "CREATE TABLE IF NOT EXISTS input_tables_recreated (
        table_name String,
        original_table_name String,
        event_time DateTime DEFAULT now()
    ) ENGINE = MergeTree() ORDER BY event_time",
    "CREATE TABLE IF NOT EXISTS index_status_event (
        table_name String,
        event_time DateTime DEFAULT now(),
        status String
    ) ENGINE = MergeTree() ORDER BY event_time",
    "CREATE TABLE IF NOT EXISTS input_indexing_done (
        table_name String,
        event_time DateTime DEFAULT now()
    ) ENGINE = MergeTree() ORDER BY event_time",
    "CREATE TABLE IF NOT EXISTS input_table_vectors_computed (
        table_name String,
        event_time DateTime DEFAULT now()
    ) ENGINE = MergeTree() ORDER BY event_time",
    "CREATE VIEW IF NOT EXISTS input_tables_summary AS
    SELECT
        l.file_name AS file_name,
        l.item_name AS item_name,
        l.table_name AS raw_table,
        r.table_name AS normalized_table,
        l.file_size AS file_size,
        l.event_time AS ingested_at,
        d.event_time AS indexed_at,
        dateDiff('second', l.event_time, d.event_time) AS duration_secs,
        l.file_size / nullIf(dateDiff('second', l.event_time, d.event_time), 0) AS bytes_per_second
    FROM input_tables_list AS l
    LEFT JOIN input_tables_recreated AS r ON r.original_table_name = l.table_name
    LEFT JOIN input_indexing_done AS d ON d.table_name = r.table_name
    SETTINGS join_use_nulls = 1",
];

/// Statements that create the bookkeeping schema, in dependency order
pub fn create_statements() -> &'static [&'static str] {
    CREATE_STATEMENTS
}

/// Statements that drop the bookkeeping schema, view first
pub fn drop_statements() -> Vec<String> {
    let mut statements = vec![format!("DROP VIEW IF EXISTS {}", INPUT_TABLES_SUMMARY)];
    statements.extend(
        [
            INPUT_TABLE_VECTORS_COMPUTED,
            INPUT_INDEXING_DONE,
            INDEX_STATUS_EVENT,
            INPUT_TABLES_RECREATED,
            INPUT_TABLES_RAW_COLUMNS,
            INPUT_TABLES_LIST,
        ]
        .iter()
        .map(|t| format!("DROP TABLE IF EXISTS {}", t)),
    );
    statements
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_bookkeeping_table_is_created_and_dropped() {
        let drops = drop_statements();
        for table in [
            INPUT_TABLES_LIST,
            INPUT_TABLES_RAW_COLUMNS,
            INPUT_TABLES_RECREATED,
            INDEX_STATUS_EVENT,
            INPUT_INDEXING_DONE,
            INPUT_TABLE_VECTORS_COMPUTED,
            INPUT_TABLES_SUMMARY,
        ] {
            let needle = format!("IF NOT EXISTS {} ", table);
            assert!(
                create_statements().iter().any(|s| s.contains(&needle)),
                "{} not created",
                table
            );
            assert!(drops.iter().any(|s| s.ends_with(table)), "{} not dropped", table);
        }
    }

    #[test]
    fn test_view_dropped_before_tables() {
        assert!(drop_statements()[0].starts_with("DROP VIEW"));
    }
}
