//! Schema normalizer
//!
//! Turns a profiled raw table into its typed replacement:
//!
//! 1. Plan column types from the latest statistics
//! 2. Create `table_<item>` with a dense 1-based `id`
//! 3. Merge its parts
//! 4. Drop the raw table
//! 5. Record lineage
//!
//! If step 2 fails the half-built table is dropped and the raw table is kept
//! so the file can be normalized again later.

use crate::error::{PipelineError, Result};
use crate::naming::normalized_name_for;
use crate::warehouse::{
    ColumnStat, LineageRecord, NormalizationPlan, NormalizedColumn, TableColumn, Warehouse,
};
use std::collections::HashMap;
use tabsearch_common::ident::positional_identifier;
use tracing::{info, warn};

/// Generic text type eligible for categorical promotion
pub const TEXT_TYPE: &str = "String";
pub const CATEGORICAL_TEXT_TYPE: &str = "LowCardinality(String)";

/// Promotion needs fewer distinct values than this
pub const CATEGORICAL_MAX_DISTINCT: u64 = 1000;
/// Promotion needs a distinct share strictly below this percentage
pub const CATEGORICAL_MAX_UNIQUE_PCT: f64 = 10.0;
/// Promotion needs more non-null values than this
pub const CATEGORICAL_MIN_NON_NULL: u64 = 1000;

/// Target type for a profiled column.
///
/// Columns without nulls lose their nullable wrapper; plain text columns with
/// few distinct values become categorical.
pub fn target_type(stat: &ColumnStat) -> String {
    let chosen = if stat.null_pct == 0.0 {
        &stat.column_base_type
    } else {
        &stat.column_type
    };

    if chosen == TEXT_TYPE
        && stat.unique_count < CATEGORICAL_MAX_DISTINCT
        && stat.unique_pct < CATEGORICAL_MAX_UNIQUE_PCT
        && stat.non_null_count > CATEGORICAL_MIN_NON_NULL
    {
        return CATEGORICAL_TEXT_TYPE.to_string();
    }
    chosen.clone()
}

/// Build the normalization plan for `raw_table` from its columns, in table
/// order, and their statistics.
///
/// A column without statistics keeps its declared type.
pub fn plan(
    raw_table: &str,
    columns: &[TableColumn],
    stats: &[ColumnStat],
) -> Result<NormalizationPlan> {
    let normalized_table = normalized_name_for(raw_table).ok_or_else(|| {
        PipelineError::Invalid(format!("{} is not a raw staging table", raw_table))
    })?;
    if stats.is_empty() {
        return Err(PipelineError::NotFound(format!(
            "column statistics for {}",
            raw_table
        )));
    }

    let by_name: HashMap<&str, &ColumnStat> =
        stats.iter().map(|s| (s.column_name.as_str(), s)).collect();

    Ok(NormalizationPlan {
        raw_table: raw_table.to_string(),
        normalized_table,
        columns: columns
            .iter()
            .enumerate()
            .map(|(index, column)| match by_name.get(column.name.as_str()) {
                Some(stat) => NormalizedColumn {
                    source_name: column.name.clone(),
                    target_name: stat.column_name_fixed.clone(),
                    target_type: target_type(stat),
                },
                None => NormalizedColumn {
                    source_name: column.name.clone(),
                    target_name: positional_identifier(index, &column.name),
                    target_type: column.sql_type.clone(),
                },
            })
            .collect(),
    })
}

/// Replace `raw_table` by its normalized table and return the new name.
pub async fn normalize_table(warehouse: &dyn Warehouse, raw_table: &str) -> Result<String> {
    let stats = warehouse.column_stats(raw_table).await?;
    let columns = warehouse.table_columns(raw_table).await?;

    for column in &columns {
        if !stats.iter().any(|s| s.column_name == column.name) {
            warn!(
                table = %raw_table,
                column = %column.name,
                declared_type = %column.sql_type,
                "Column has no statistics, keeping its declared type"
            );
        }
    }

    let plan = plan(raw_table, &columns, &stats)?;
    let normalized = plan.normalized_table.clone();
    info!(
        raw_table = %raw_table,
        table = %normalized,
        columns = plan.columns.len(),
        "Normalizing table"
    );

    // A leftover from an earlier failed attempt would block the create
    warehouse.drop_table(&normalized).await?;
    if let Err(e) = warehouse.create_normalized_table(&plan).await {
        if let Err(drop_err) = warehouse.drop_table(&normalized).await {
            warn!(table = %normalized, error = %drop_err, "Failed to drop half-built table");
        }
        return Err(e);
    }

    warehouse.optimize_table(&normalized).await?;
    warehouse.drop_table(raw_table).await?;
    warehouse
        .record_lineage(&LineageRecord {
            table_name: normalized.clone(),
            original_table_name: raw_table.to_string(),
        })
        .await?;

    info!(raw_table = %raw_table, table = %normalized, "Table normalized");
    Ok(normalized)
}
