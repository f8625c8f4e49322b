//! Error types for the ingestion pipeline

use tabsearch_common::CommonError;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// A statement was rejected by the analytical store
    #[error("Warehouse error: {0}")]
    Warehouse(String),

    #[error("Search engine error: {0}")]
    Search(String),

    #[error("Vector store error: {0}")]
    Vector(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Too many malformed rows: {errors} of {total}")]
    MalformedThreshold { errors: usize, total: usize },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid data: {0}")]
    Invalid(String),

    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
