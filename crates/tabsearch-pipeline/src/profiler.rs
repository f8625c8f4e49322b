//! Column profiler
//!
//! Computes null and distinct counts for every column of a raw table, a few
//! columns at a time, and stores one [`ColumnStat`] per column. A column whose
//! statistics cannot be computed is logged and left out; the remaining
//! columns are still profiled.

use crate::error::Result;
use crate::warehouse::{ColumnStat, TableColumn, Warehouse};
use futures::stream::{self, StreamExt};
use regex::Regex;
use std::sync::OnceLock;
use std::time::Instant;
use tabsearch_common::ident::positional_identifier;
use tracing::{info, warn};

fn nullable_wrapper() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^Nullable\((.+)\)$").ok())
        .as_ref()
}

/// Declared type without its `Nullable(...)` wrapper.
///
/// Parameterized types keep their parameters: `Nullable(DateTime64(3))`
/// becomes `DateTime64(3)`.
pub fn base_type(declared: &str) -> String {
    let declared = declared.trim();
    nullable_wrapper()
        .and_then(|re| re.captures(declared))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| declared.to_string())
}

/// Percentages against `row_count`, where an empty table counts as one row
pub fn percentages(row_count: u64, null_count: u64, distinct_count: u64) -> (f64, f64) {
    let rows = row_count.max(1) as f64;
    let non_null = row_count.saturating_sub(null_count);
    let null_pct = 100.0 * null_count as f64 / rows;
    let unique_pct = if non_null == 0 || distinct_count == 0 {
        0.0
    } else {
        100.0 * distinct_count as f64 / non_null as f64
    };
    (null_pct, unique_pct)
}

/// Outcome of profiling one table
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileReport {
    pub row_count: u64,
    pub profiled: usize,
    pub failed: Vec<String>,
}

/// Profile every column of `table` with up to `workers` concurrent queries.
///
/// Fails only if the table itself cannot be inspected.
pub async fn profile_table(
    warehouse: &dyn Warehouse,
    table: &str,
    workers: usize,
) -> Result<ProfileReport> {
    let started = Instant::now();
    let row_count = warehouse.row_count(table).await?;
    let columns = warehouse.table_columns(table).await?;

    info!(
        table = %table,
        rows = row_count,
        columns = columns.len(),
        workers,
        "Profiling columns"
    );

    let outcomes: Vec<(String, Result<()>)> = stream::iter(columns.into_iter().enumerate())
        .map(|(index, column)| async move {
            let outcome = profile_column(warehouse, table, row_count, index, &column).await;
            (column.name, outcome)
        })
        .buffer_unordered(workers.max(1))
        .collect()
        .await;

    let mut report = ProfileReport {
        row_count,
        ..Default::default()
    };
    for (column, outcome) in outcomes {
        match outcome {
            Ok(()) => report.profiled += 1,
            Err(e) => {
                warn!(table = %table, column = %column, error = %e, "Column profiling failed");
                report.failed.push(column);
            },
        }
    }

    info!(
        table = %table,
        profiled = report.profiled,
        failed = report.failed.len(),
        duration_secs = started.elapsed().as_secs_f64(),
        "Profiling complete"
    );
    Ok(report)
}

async fn profile_column(
    warehouse: &dyn Warehouse,
    table: &str,
    row_count: u64,
    index: usize,
    column: &TableColumn,
) -> Result<()> {
    let counts = warehouse.column_counts(table, &column.name).await?;
    let (null_pct, unique_pct) = percentages(row_count, counts.null_count, counts.distinct_count);

    let stat = ColumnStat {
        table_name: table.to_string(),
        column_index: index as u32,
        column_name: column.name.clone(),
        column_type: column.sql_type.clone(),
        column_base_type: base_type(&column.sql_type),
        null_count: counts.null_count,
        non_null_count: row_count.saturating_sub(counts.null_count),
        unique_count: counts.distinct_count,
        null_pct,
        unique_pct,
        column_name_fixed: positional_identifier(index, &column.name),
    };
    warehouse.insert_column_stat(&stat).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_base_type_strips_nullable() {
        assert_eq!(base_type("Nullable(String)"), "String");
        assert_eq!(base_type("String"), "String");
        assert_eq!(base_type("Nullable(Int64)"), "Int64");
        assert_eq!(base_type("Nullable(DateTime64(3))"), "DateTime64(3)");
        assert_eq!(base_type("LowCardinality(String)"), "LowCardinality(String)");
    }

    #[test]
    fn test_percentages() {
        let (null_pct, unique_pct) = percentages(200, 50, 15);
        assert_eq!(null_pct, 25.0);
        assert_eq!(unique_pct, 10.0);
    }

    #[test]
    fn test_percentages_empty_table() {
        assert_eq!(percentages(0, 0, 0), (0.0, 0.0));
    }

    #[test]
    fn test_percentages_all_null() {
        let (null_pct, unique_pct) = percentages(10, 10, 0);
        assert_eq!(null_pct, 100.0);
        assert_eq!(unique_pct, 0.0);
    }
}
