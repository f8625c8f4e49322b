//! Index publisher
//!
//! Regenerates the search configuration from the full lineage, applies it,
//! and waits for the new table to answer queries before marking it indexed.
//! A table that never becomes ready is left unmarked so a later run can
//! publish it again.

use super::config_gen::{render, SourceConnection, TableSchema};
use super::SearchEngine;
use crate::config::{PipelineConfig, SearchConfig};
use crate::error::{PipelineError, Result};
use crate::warehouse::Warehouse;
use std::collections::HashSet;
use tabsearch_common::ident::validate_table_name;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub table: String,
    /// Documents reported by the first successful count probe
    pub documents: u64,
    /// Readiness attempts used, starting at 1
    pub attempts: u32,
}

/// Publish the normalized `table` to the search engine.
pub async fn publish_table(
    warehouse: &dyn Warehouse,
    search: &dyn SearchEngine,
    config: &PipelineConfig,
    table: &str,
) -> Result<PublishOutcome> {
    validate_table_name(table)?;
    let tables = normalized_schemas(warehouse, table).await?;

    let source = SourceConnection::from_config(&config.search, &config.warehouse);
    let document = render(&tables, &source, &config.search.data_root, &config.search.log_dir);
    info!(
        table = %table,
        tables = tables.len(),
        "Publishing table to search engine"
    );

    search.apply_config(&document, table).await?;
    let (documents, attempts) = wait_until_ready(search, table, &config.search).await?;

    if warehouse.indexed_tables().await?.contains(table) {
        info!(table = %table, "Table was already marked indexed");
    } else {
        warehouse.record_index_done(table).await?;
    }

    info!(table = %table, documents, attempts, "Table published");
    Ok(PublishOutcome {
        table: table.to_string(),
        documents,
        attempts,
    })
}

/// Schemas of every normalized table in lineage order; `required` must be one
async fn normalized_schemas(warehouse: &dyn Warehouse, required: &str) -> Result<Vec<TableSchema>> {
    let lineage = warehouse.lineage().await?;
    if !lineage.iter().any(|l| l.table_name == required) {
        return Err(PipelineError::NotFound(format!(
            "lineage record for {}",
            required
        )));
    }

    let mut seen = HashSet::new();
    let mut schemas = Vec::new();
    for record in lineage {
        if !seen.insert(record.table_name.clone()) {
            continue;
        }
        match warehouse.table_columns(&record.table_name).await {
            Ok(columns) => schemas.push(TableSchema {
                name: record.table_name,
                columns,
            }),
            Err(e) if record.table_name != required => {
                warn!(
                    table = %record.table_name,
                    error = %e,
                    "Normalized table unavailable, leaving it out of the search configuration"
                );
            },
            Err(e) => return Err(e),
        }
    }
    Ok(schemas)
}

/// Probe `table` until count, sample and autocomplete all succeed.
///
/// Sleeps `ready_backoff(attempt)` between attempts, so the wait grows
/// linearly. Returns the document count and the attempts used.
pub async fn wait_until_ready(
    search: &dyn SearchEngine,
    table: &str,
    config: &SearchConfig,
) -> Result<(u64, u32)> {
    let mut last_error = None;

    for attempt in 0..config.ready_attempts {
        match probe(search, table).await {
            Ok(documents) => return Ok((documents, attempt + 1)),
            Err(e) => {
                warn!(
                    table = %table,
                    attempt = attempt + 1,
                    max_attempts = config.ready_attempts,
                    error = %e,
                    "Search table not ready"
                );
                last_error = Some(e);
            },
        }
        if attempt + 1 < config.ready_attempts {
            tokio::time::sleep(config.ready_backoff(attempt)).await;
        }
    }

    Err(PipelineError::Search(format!(
        "table {} not ready after {} attempts: {}",
        table,
        config.ready_attempts,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

async fn probe(search: &dyn SearchEngine, table: &str) -> Result<u64> {
    let documents = search.probe_count(table).await?;
    search.probe_sample(table).await?;
    search.probe_autocomplete(table).await?;
    Ok(documents)
}
