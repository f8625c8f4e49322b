//! Search engine configuration rendering
//!
//! Produces the complete configuration document: one `searchd` section and,
//! per normalized table, a plain `table` section plus a `source` section
//! that pulls rows from the warehouse over its MySQL-compatible port.
//!
//! Column types map to attributes as follows; everything else is indexed as
//! full text only:
//!
//! | Warehouse type | Attribute |
//! |----------------|-----------|
//! | `LowCardinality(String)` | `sql_field_string` (faceted string) |
//! | `Int*` / `UInt*` up to 64 bits | `sql_attr_bigint` |
//! | `Float32` / `Float64` | `sql_attr_float` |
//! | `Date` / `DateTime` / `DateTime64` | `sql_attr_timestamp` via `toUnixTimestamp` |

use crate::config::{SearchConfig, WarehouseConfig};
use crate::profiler::base_type;
use crate::warehouse::schema::INDEX_STATUS_EVENT;
use crate::warehouse::TableColumn;
use tabsearch_common::ident::quote_literal;

/// Binary listen ports of searchd
const LISTEN: &[&str] = &[
    "0.0.0.0:9312",
    "0.0.0.0:9306:mysql",
    "0.0.0.0:9308:http",
];

/// Index status values written by the engine's own hooks
pub const STATUS_STARTED: &str = "started";
pub const STATUS_QUERY_ENDED: &str = "query_ended";
pub const STATUS_DONE: &str = "done";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    FacetString,
    BigInt,
    Float,
    Timestamp,
}

impl AttributeKind {
    fn directive(self) -> &'static str {
        match self {
            AttributeKind::FacetString => "sql_field_string",
            AttributeKind::BigInt => "sql_attr_bigint",
            AttributeKind::Float => "sql_attr_float",
            AttributeKind::Timestamp => "sql_attr_timestamp",
        }
    }
}

/// Attribute type for a warehouse column type, if it gets one
pub fn attribute_kind(sql_type: &str) -> Option<AttributeKind> {
    let base = base_type(sql_type);
    match base.as_str() {
        "LowCardinality(String)" => Some(AttributeKind::FacetString),
        "Int8" | "Int16" | "Int32" | "Int64" | "UInt8" | "UInt16" | "UInt32" | "UInt64" => {
            Some(AttributeKind::BigInt)
        },
        "Float32" | "Float64" => Some(AttributeKind::Float),
        "Date" | "Date32" => Some(AttributeKind::Timestamp),
        t if t == "DateTime" || t.starts_with("DateTime(") || t.starts_with("DateTime64") => {
            Some(AttributeKind::Timestamp)
        },
        _ => None,
    }
}

/// Where the search engine pulls rows from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConnection {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl SourceConnection {
    pub fn from_config(search: &SearchConfig, warehouse: &WarehouseConfig) -> Self {
        Self {
            host: search.source_host.clone(),
            port: search.source_port,
            user: warehouse.user.clone(),
            password: warehouse.password.clone(),
            database: warehouse.database.clone(),
        }
    }
}

/// A normalized table and its columns in declared order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<TableColumn>,
}

/// A rendered configuration and the storage directories it needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchConfigDocument {
    pub text: String,
    /// One storage directory per table, created before the engine reloads
    pub directories: Vec<String>,
}

/// Render the configuration for all `tables`.
pub fn render(
    tables: &[TableSchema],
    source: &SourceConnection,
    data_root: &str,
    log_dir: &str,
) -> SearchConfigDocument {
    let log_dir = log_dir.trim_end_matches('/');
    let data_root = data_root.trim_end_matches('/');

    let mut text = String::from("searchd {\n");
    for listen in LISTEN {
        text.push_str(&format!("    listen = {}\n", listen));
    }
    text.push_str(&format!("    log = {}/searchd.log\n", log_dir));
    text.push_str(&format!("    query_log = {}/query.log\n", log_dir));
    text.push_str("    pid_file = /var/run/manticore/searchd.pid\n}\n");

    let mut directories = Vec::with_capacity(tables.len());
    for table in tables {
        let directory = format!("{}/{}", data_root, table.name);
        text.push('\n');
        text.push_str(&table_section(&table.name, &directory));
        text.push('\n');
        text.push_str(&source_section(table, source));
        directories.push(directory);
    }

    SearchConfigDocument { text, directories }
}

fn table_section(name: &str, directory: &str) -> String {
    format!(
        "table {name} {{\n    type = plain\n    path = {directory}/data\n    source = {name}\n    \
         columnar_attrs = *\n    min_infix_len = 3\n}}\n"
    )
}

fn status_event(table: &str, status: &str) -> String {
    format!(
        "INSERT INTO {} (table_name, event_time, status) VALUES ({}, NOW(), {})",
        INDEX_STATUS_EVENT,
        quote_literal(table),
        quote_literal(status)
    )
}

/// The `sql_query` pulling every column of `table`
pub fn source_query(table: &TableSchema) -> String {
    let select: Vec<String> = table
        .columns
        .iter()
        .map(|c| match attribute_kind(&c.sql_type) {
            Some(AttributeKind::Timestamp) if c.name != "id" => {
                format!("toUnixTimestamp({0}) AS {0}", c.name)
            },
            _ => c.name.clone(),
        })
        .collect();
    format!("SELECT {} FROM {}", select.join(", "), table.name)
}

fn source_section(table: &TableSchema, source: &SourceConnection) -> String {
    let mut section = format!("source {} {{\n    type = mysql\n\n", table.name);
    section.push_str(&format!("    sql_host = {}\n", source.host));
    section.push_str(&format!("    sql_port = {}\n", source.port));
    section.push_str(&format!("    sql_user = {}\n", source.user));
    section.push_str(&format!("    sql_pass = {}\n", source.password));
    section.push_str(&format!("    sql_db = {}\n\n", source.database));

    section.push_str("    sql_query_pre = SET CHARACTER_SET_RESULTS=utf8\n");
    section.push_str("    sql_query_pre = SET NAMES utf8\n");
    section.push_str(&format!(
        "    sql_query_pre = {}\n",
        status_event(&table.name, STATUS_STARTED)
    ));
    section.push_str(&format!(
        "    sql_query_post = {}\n",
        status_event(&table.name, STATUS_QUERY_ENDED)
    ));
    section.push_str(&format!(
        "    sql_query_post_index = {}\n\n",
        status_event(&table.name, STATUS_DONE)
    ));
    section.push_str(&format!("    sql_query = {}\n", source_query(table)));

    let attributes: Vec<String> = table
        .columns
        .iter()
        .filter(|c| c.name != "id")
        .filter_map(|c| {
            attribute_kind(&c.sql_type).map(|kind| format!("    {} = {}\n", kind.directive(), c.name))
        })
        .collect();
    if !attributes.is_empty() {
        section.push('\n');
        section.push_str(&attributes.concat());
    }
    section.push_str("}\n");
    section
}
