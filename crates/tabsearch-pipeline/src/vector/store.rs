//! Vector store on a dedicated Manticore listener
//!
//! Vectors live in one HNSW table per dimensionality. Each upload batch is a
//! single multi-row INSERT followed by COMMIT on the same connection.

use crate::config::VectorConfig;
use crate::error::{PipelineError, Result};
use crate::search::manticore::lazy_pool;
use async_trait::async_trait;
use sqlx::mysql::MySqlPool;
use sqlx::Row;
use tabsearch_common::ident::{quote_literal, validate_table_name};
use tracing::{debug, info};

/// One embedded chunk bound for the vector table
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    /// Normalized table the text came from
    pub table_name: String,
    pub row_id: i64,
    pub text: String,
    pub vector: Vec<f32>,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create `table` for `dims`-sized vectors unless it exists
    async fn ensure_table(&self, table: &str, dims: usize) -> Result<()>;

    /// Insert and commit one batch
    async fn insert_batch(&self, table: &str, records: &[VectorRecord]) -> Result<()>;

    /// Remove every vector computed from `source_table`
    async fn delete_source(&self, table: &str, source_table: &str) -> Result<()>;
}

pub fn create_table(table: &str, dims: usize) -> String {
    format!(
        "CREATE TABLE {} (table_name string attribute, table_rowid bigint, text_str text, \
         text_vector float_vector knn_type='hnsw' knn_dims='{}' hnsw_similarity='l2')",
        table, dims
    )
}

fn vector_literal(vector: &[f32]) -> String {
    let values: Vec<String> = vector.iter().map(|v| format!("{:?}", v)).collect();
    format!("({})", values.join(","))
}

pub fn delete_source_statement(table: &str, source_table: &str) -> String {
    format!(
        "DELETE FROM {} WHERE table_name = {}",
        table,
        quote_literal(source_table)
    )
}

/// Multi-row insert for `records`
pub fn insert_statement(table: &str, records: &[VectorRecord]) -> String {
    let values: Vec<String> = records
        .iter()
        .map(|r| {
            format!(
                "({}, {}, {}, {})",
                quote_literal(&r.table_name),
                r.row_id,
                quote_literal(&r.text),
                vector_literal(&r.vector)
            )
        })
        .collect();
    format!(
        "INSERT INTO {} (table_name, table_rowid, text_str, text_vector) VALUES {}",
        table,
        values.join(", ")
    )
}

pub struct ManticoreVectorStore {
    pool: MySqlPool,
}

impl ManticoreVectorStore {
    pub fn connect_lazy(config: &VectorConfig) -> Self {
        Self {
            pool: lazy_pool(&config.host, config.port, "", ""),
        }
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let rows = sqlx::raw_sql("SHOW TABLES").fetch_all(&self.pool).await?;
        for row in rows {
            let name: String = row.try_get_unchecked(0)?;
            if name == table {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[async_trait]
impl VectorStore for ManticoreVectorStore {
    async fn ensure_table(&self, table: &str, dims: usize) -> Result<()> {
        validate_table_name(table)?;
        if self.table_exists(table).await? {
            debug!(table = %table, "Vector table exists");
            return Ok(());
        }
        sqlx::raw_sql(&create_table(table, dims))
            .execute(&self.pool)
            .await?;
        info!(table = %table, dims, "Vector table created");
        Ok(())
    }

    async fn insert_batch(&self, table: &str, records: &[VectorRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        validate_table_name(table)?;

        // COMMIT must run on the connection that did the insert
        let mut conn = self.pool.acquire().await?;
        let conn: &mut sqlx::MySqlConnection = &mut conn;
        let sql = insert_statement(table, records);
        sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(&sql))
            .await
            .map_err(|e| PipelineError::Vector(format!("insert into {} failed: {}", table, e)))?;
        sqlx::Executor::execute(&mut *conn, sqlx::raw_sql("COMMIT")).await?;
        Ok(())
    }

    async fn delete_source(&self, table: &str, source_table: &str) -> Result<()> {
        validate_table_name(table)?;
        let result = sqlx::raw_sql(&delete_source_statement(table, source_table))
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            info!(
                table = %table,
                source = %source_table,
                removed = result.rows_affected(),
                "Removed vectors left by an earlier attempt"
            );
        }
        Ok(())
    }
}
