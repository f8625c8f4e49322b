//! ClickHouse over its HTTP interface
//!
//! Statements are POSTed as the request body; inserts put the statement in
//! the `query` parameter and stream rows as `JSONEachRow` in the body.

use super::schema::{
    self, INPUT_INDEXING_DONE, INPUT_TABLES_LIST, INPUT_TABLES_RAW_COLUMNS,
    INPUT_TABLES_RECREATED, INPUT_TABLE_VECTORS_COMPUTED,
};
use super::{
    sql, ColumnCounts, ColumnStat, IngestionRecord, LineageRecord, NormalizationPlan, RawBatch,
    RawColumn, SummaryRow, TableColumn, TextRow, Warehouse,
};
use crate::config::WarehouseConfig;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Settings sent with every request. The error allowances let the native
/// bulk loader skip sparse bad rows instead of failing the whole file.
///
/// The server rejects a load only when both allowances are exceeded, so a
/// bulk load with at most 1024 bad rows succeeds at any ratio. The 5% limit
/// of the line parser therefore applies only to files the bulk load gave up
/// on.
const SESSION_SETTINGS: &[(&str, &str)] = &[
    ("async_insert", "1"),
    ("wait_for_async_insert", "1"),
    ("input_format_allow_errors_num", "1024"),
    ("input_format_allow_errors_ratio", "0.05"),
    ("output_format_json_quote_64bit_integers", "0"),
];

const COLUMN_STAT_FIELDS: &[&str] = &[
    "table_name",
    "column_index",
    "column_name",
    "column_type",
    "column_base_type",
    "null_count",
    "non_null_count",
    "unique_count",
    "null_pct",
    "unique_pct",
    "column_name_fixed",
];

#[derive(Deserialize)]
struct CountRow {
    n: u64,
}

#[derive(Deserialize)]
struct FileNameRow {
    file_name: String,
}

#[derive(Deserialize)]
struct TableNameRow {
    table_name: String,
}

pub struct ClickHouseClient {
    client: Client,
    config: WarehouseConfig,
}

impl ClickHouseClient {
    pub fn new(config: WarehouseConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self { client, config })
    }

    async fn send(&self, query: Option<&str>, body: String) -> Result<String> {
        let mut request = self
            .client
            .post(&self.config.url)
            .header("X-ClickHouse-User", &self.config.user)
            .header("X-ClickHouse-Key", &self.config.password)
            .query(&[("database", self.config.database.as_str())])
            .query(SESSION_SETTINGS);
        if let Some(query) = query {
            request = request.query(&[("query", query)]);
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            return Err(PipelineError::Warehouse(format!("{}: {}", status, text.trim())));
        }
        Ok(text)
    }

    /// Run a statement that returns nothing
    pub async fn execute(&self, statement: &str) -> Result<()> {
        debug!(statement = %statement, "Executing warehouse statement");
        self.send(None, statement.to_string()).await?;
        Ok(())
    }

    /// Run a select and decode each `JSONEachRow` line
    pub async fn query_rows<T: DeserializeOwned>(&self, select: &str) -> Result<Vec<T>> {
        debug!(statement = %select, "Querying warehouse");
        let text = self
            .send(None, format!("{} FORMAT JSONEachRow", select))
            .await?;

        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(PipelineError::from))
            .collect()
    }

    async fn insert_json(&self, table: &str, columns: &[String], lines: String) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let insert = sql::insert_json_rows(table, columns);
        self.send(Some(&insert), lines).await?;
        Ok(())
    }

    async fn insert_serialized<T: Serialize>(
        &self,
        table: &str,
        columns: &[&str],
        rows: &[T],
    ) -> Result<()> {
        let mut lines = String::new();
        for row in rows {
            lines.push_str(&serde_json::to_string(row)?);
            lines.push('\n');
        }
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        self.insert_json(table, &columns, lines).await
    }

    async fn table_names(&self, bookkeeping_table: &str) -> Result<HashSet<String>> {
        let rows: Vec<TableNameRow> = self
            .query_rows(&sql::distinct_table_names(bookkeeping_table))
            .await?;
        Ok(rows.into_iter().map(|r| r.table_name).collect())
    }

    async fn record_table_event(&self, bookkeeping_table: &str, table: &str) -> Result<()> {
        self.execute(&sql::record_table_event(bookkeeping_table, table))
            .await
    }
}

#[async_trait]
impl Warehouse for ClickHouseClient {
    async fn ensure_schema(&self) -> Result<()> {
        for statement in schema::create_statements() {
            self.execute(statement).await?;
        }
        Ok(())
    }

    async fn reset_schema(&self) -> Result<()> {
        for statement in schema::drop_statements() {
            self.execute(&statement).await?;
        }
        Ok(())
    }

    async fn ingested_file_names(&self) -> Result<HashSet<String>> {
        let rows: Vec<FileNameRow> = self.query_rows(sql::ingested_file_names()).await?;
        Ok(rows.into_iter().map(|r| r.file_name).collect())
    }

    async fn record_ingestion(&self, record: &IngestionRecord) -> Result<()> {
        self.insert_serialized(
            INPUT_TABLES_LIST,
            &["table_name", "file_name", "item_name", "event_time", "file_size"],
            std::slice::from_ref(record),
        )
        .await
    }

    async fn bulk_load_delimited(&self, table: &str, server_path: &str) -> Result<()> {
        self.execute(&sql::bulk_load_delimited(table, server_path))
            .await
    }

    async fn create_raw_table(&self, table: &str, columns: &[RawColumn]) -> Result<()> {
        self.execute(&sql::create_raw_table(table, columns)).await
    }

    async fn insert_rows(&self, table: &str, batch: &RawBatch) -> Result<()> {
        let lines = batch.to_json_lines()?;
        self.insert_json(table, batch.columns(), lines).await
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        self.execute(&sql::drop_table(table)).await
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        let rows: Vec<CountRow> = self.query_rows(&sql::row_count(table)).await?;
        rows.first()
            .map(|r| r.n)
            .ok_or_else(|| PipelineError::Warehouse(format!("no row count for {}", table)))
    }

    async fn table_columns(&self, table: &str) -> Result<Vec<TableColumn>> {
        let columns: Vec<TableColumn> = self
            .query_rows(&sql::table_columns(&self.config.database, table))
            .await?;
        if columns.is_empty() {
            return Err(PipelineError::NotFound(format!("table {}", table)));
        }
        Ok(columns)
    }

    async fn column_counts(&self, table: &str, column: &str) -> Result<ColumnCounts> {
        let rows: Vec<ColumnCounts> = self.query_rows(&sql::column_counts(table, column)).await?;
        rows.into_iter().next().ok_or_else(|| {
            PipelineError::Warehouse(format!("no counts for {}.{}", table, column))
        })
    }

    async fn insert_column_stat(&self, stat: &ColumnStat) -> Result<()> {
        self.insert_serialized(
            INPUT_TABLES_RAW_COLUMNS,
            COLUMN_STAT_FIELDS,
            std::slice::from_ref(stat),
        )
        .await
    }

    async fn column_stats(&self, table: &str) -> Result<Vec<ColumnStat>> {
        self.query_rows(&sql::column_stats(table)).await
    }

    async fn create_normalized_table(&self, plan: &NormalizationPlan) -> Result<()> {
        self.execute(&sql::create_normalized_table(plan)).await
    }

    async fn optimize_table(&self, table: &str) -> Result<()> {
        self.execute(&sql::optimize_table(table)).await
    }

    async fn record_lineage(&self, record: &LineageRecord) -> Result<()> {
        self.insert_serialized(
            INPUT_TABLES_RECREATED,
            &["table_name", "original_table_name"],
            std::slice::from_ref(record),
        )
        .await
    }

    async fn lineage(&self) -> Result<Vec<LineageRecord>> {
        self.query_rows(sql::lineage()).await
    }

    async fn record_index_done(&self, table: &str) -> Result<()> {
        self.record_table_event(INPUT_INDEXING_DONE, table).await
    }

    async fn indexed_tables(&self) -> Result<HashSet<String>> {
        self.table_names(INPUT_INDEXING_DONE).await
    }

    async fn text_page(
        &self,
        table: &str,
        text_columns: &[String],
        after_id: i64,
        limit: usize,
        min_length: usize,
    ) -> Result<Vec<TextRow>> {
        if text_columns.is_empty() {
            return Ok(Vec::new());
        }
        self.query_rows(&sql::text_page(table, text_columns, after_id, limit, min_length))
            .await
    }

    async fn vectorized_tables(&self) -> Result<HashSet<String>> {
        self.table_names(INPUT_TABLE_VECTORS_COMPUTED).await
    }

    async fn record_vectors_computed(&self, table: &str) -> Result<()> {
        self.record_table_event(INPUT_TABLE_VECTORS_COMPUTED, table).await
    }

    async fn summary(&self) -> Result<Vec<SummaryRow>> {
        self.query_rows(sql::summary()).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::warehouse::RawValue;
    use wiremock::matchers::{body_string_contains, header, method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> ClickHouseClient {
        ClickHouseClient::new(WarehouseConfig {
            url: server.uri(),
            user: "ingest".to_string(),
            password: "secret".to_string(),
            database: "analytics".to_string(),
            ..WarehouseConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_execute_sends_credentials_and_settings() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("X-ClickHouse-User", "ingest"))
            .and(header("X-ClickHouse-Key", "secret"))
            .and(query_param("database", "analytics"))
            .and(query_param("async_insert", "1"))
            .and(query_param("input_format_allow_errors_ratio", "0.05"))
            .and(body_string_contains("DROP TABLE IF EXISTS `raw_x`"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server).drop_table("raw_x").await.unwrap();
    }

    #[tokio::test]
    async fn test_server_error_becomes_warehouse_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(500).set_body_string("Code: 27. Cannot parse input\n"),
            )
            .mount(&server)
            .await;

        let err = client_for(&server)
            .bulk_load_delimited("raw_x", "a.csv")
            .await
            .unwrap_err();
        match err {
            PipelineError::Warehouse(msg) => assert!(msg.contains("Cannot parse input")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ingested_file_names_parses_json_each_row() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("FROM input_tables_list FORMAT JSONEachRow"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("{\"file_name\":\"a.csv\"}\n{\"file_name\":\"b.xml\"}\n"),
            )
            .mount(&server)
            .await;

        let names = client_for(&server).ingested_file_names().await.unwrap();
        assert_eq!(names.len(), 2);
        assert!(names.contains("a.csv"));
        assert!(names.contains("b.xml"));
    }

    #[tokio::test]
    async fn test_insert_rows_streams_json_lines() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(query_param(
                "query",
                "INSERT INTO `raw_x` (`name`, `size`) FORMAT JSONEachRow",
            ))
            .and(body_string_contains("{\"name\":\"widget\",\"size\":null}"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let batch = RawBatch::new(
            vec!["name".into(), "size".into()],
            vec![vec![RawValue::Text("widget".into()), RawValue::Null]],
        )
        .unwrap();
        client_for(&server).insert_rows("raw_x", &batch).await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_batch_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let batch = RawBatch::new(vec!["a".into()], Vec::new()).unwrap();
        client_for(&server).insert_rows("raw_x", &batch).await.unwrap();
    }

    #[tokio::test]
    async fn test_table_columns_missing_table_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("FROM system.columns"))
            .respond_with(ResponseTemplate::new(200).set_body_string(""))
            .mount(&server)
            .await;

        let err = client_for(&server).table_columns("ghost").await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_text_page_decodes_rows() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("ORDER BY id LIMIT 2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "{\"id\":1,\"text\":\"first row text\"}\n{\"id\":2,\"text\":\"second row text\"}\n",
            ))
            .mount(&server)
            .await;

        let rows = client_for(&server)
            .text_page("table_x", &["c001_body".into()], 0, 2, 16)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].id, 2);
        assert_eq!(rows[1].text, "second row text");
    }
}
