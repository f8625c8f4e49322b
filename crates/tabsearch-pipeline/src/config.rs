//! Pipeline configuration
//!
//! Everything is read from environment variables (a `.env` file is loaded by
//! the binary first) with defaults matching a local docker-compose stack.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_INPUT_DIR: &str = "./data";
pub const DEFAULT_INSERT_BATCH_SIZE: usize = 8192;
pub const DEFAULT_SNIFF_BYTES: usize = 8192;
pub const DEFAULT_MALFORMED_MIN_ROWS: usize = 200;
pub const DEFAULT_MALFORMED_MAX_RATIO: f64 = 0.05;
pub const DEFAULT_PROFILE_WORKERS: usize = 8;

pub const DEFAULT_WAREHOUSE_URL: &str = "http://localhost:8123";
pub const DEFAULT_WAREHOUSE_USER: &str = "default";
pub const DEFAULT_WAREHOUSE_DATABASE: &str = "default";
pub const DEFAULT_WAREHOUSE_TIMEOUT_SECS: u64 = 3600;

pub const DEFAULT_SEARCH_HOST: &str = "localhost";
pub const DEFAULT_SEARCH_PORT: u16 = 9306;
pub const DEFAULT_SEARCH_CONFIG_PATH: &str = "./manticore/manticore.conf";
pub const DEFAULT_SEARCH_DATA_ROOT: &str = "/var/lib/manticore/v1";
pub const DEFAULT_SEARCH_LOG_DIR: &str = "/var/log/manticore";
pub const DEFAULT_SEARCH_CONTAINER: &str = "manticore";
pub const DEFAULT_SEARCH_RELOAD_SCRIPT: &str = "/manticore-update-config.sh";
pub const DEFAULT_SOURCE_HOST: &str = "clickhouse";
pub const DEFAULT_SOURCE_PORT: u16 = 9004;
pub const DEFAULT_READY_ATTEMPTS: u32 = 10;
pub const DEFAULT_READY_BACKOFF_MS: u64 = 1000;

pub const DEFAULT_VECTOR_HOST: &str = "localhost";
pub const DEFAULT_VECTOR_PORT: u16 = 19306;
pub const DEFAULT_CHUNK_SIZE: usize = 2048;
pub const DEFAULT_MIN_TEXT_LENGTH: usize = 16;
pub const DEFAULT_PAGE_SIZE: usize = 10_000;
pub const DEFAULT_UPLOAD_BATCH_SIZE: usize = 10_000;
pub const DEFAULT_UPLOAD_WORKERS: usize = 4;
pub const DEFAULT_TABLE_WORKERS: usize = 10;
pub const DEFAULT_EMBEDDING_PROVIDER: &str = "ollama";
pub const DEFAULT_EMBEDDING_MODEL: &str = "all-minilm";
pub const DEFAULT_EMBEDDING_URL: &str = "http://localhost:11434";
pub const DEFAULT_EMBEDDING_DIMS: usize = 384;
pub const DEFAULT_EMBEDDING_TIMEOUT_SECS: u64 = 120;

/// Read `key` and parse it, falling back to `default` when unset.
///
/// A value that is set but does not parse is an error.
fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid value for {}: {:?} ({})", key, raw, e)),
        Err(_) => Ok(default),
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Full pipeline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub ingest: IngestConfig,
    pub warehouse: WarehouseConfig,
    pub search: SearchConfig,
    pub vector: VectorConfig,
}

/// File discovery and raw loading
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Directory scanned recursively for input files
    pub input_dir: PathBuf,
    /// Rows per insert statement while streaming a file
    pub batch_size: usize,
    /// Bytes read from the head of a delimited file to guess its delimiter
    pub sniff_bytes: usize,
    /// The malformed ratio is only enforced once more rows than this were seen
    pub malformed_min_rows: usize,
    /// Fallback parsing aborts when malformed rows exceed this share
    pub malformed_max_ratio: f64,
    /// Concurrent column statistics queries per table
    pub profile_workers: usize,
}

/// Analytical store (ClickHouse HTTP interface)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    pub url: String,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub database: String,
    /// Path prefix the server's `file()` function uses for the input
    /// directory. Empty means input paths are used relative to the server's
    /// user files directory as-is.
    pub server_input_dir: String,
    pub timeout_secs: u64,
}

/// Full-text search engine (Manticore)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing)]
    pub password: String,
    /// Where the generated configuration document is written
    pub config_path: PathBuf,
    /// Per-table storage root inside the search container
    pub data_root: String,
    pub log_dir: String,
    /// Container that runs searchd
    pub container: String,
    /// Script inside the container that rotates one table into service
    pub reload_script: String,
    /// Warehouse address as seen from the search container
    pub source_host: String,
    pub source_port: u16,
    pub ready_attempts: u32,
    pub ready_backoff_ms: u64,
}

/// Chunking, embedding and vector upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    pub host: String,
    pub port: u16,
    pub chunk_size: usize,
    pub min_text_length: usize,
    /// Rows fetched per page when streaming a table's text
    pub page_size: usize,
    /// Vectors per insert statement
    pub upload_batch_size: usize,
    pub upload_workers: usize,
    pub table_workers: usize,
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// "ollama", "local" or "disabled"
    pub provider: String,
    pub model: String,
    pub url: String,
    pub dims: usize,
    pub timeout_secs: u64,
}

impl PipelineConfig {
    /// Load the whole configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Self {
            ingest: IngestConfig::from_env()?,
            warehouse: WarehouseConfig::from_env()?,
            search: SearchConfig::from_env()?,
            vector: VectorConfig::from_env()?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.ingest.validate()?;
        self.warehouse.validate()?;
        self.search.validate()?;
        self.vector.validate()?;
        Ok(())
    }
}

impl IngestConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            input_dir: PathBuf::from(env_string("TABSEARCH_INPUT_DIR", DEFAULT_INPUT_DIR)),
            batch_size: env_or("INGEST_BATCH_SIZE", DEFAULT_INSERT_BATCH_SIZE)?,
            sniff_bytes: env_or("INGEST_SNIFF_BYTES", DEFAULT_SNIFF_BYTES)?,
            malformed_min_rows: env_or("INGEST_MALFORMED_MIN_ROWS", DEFAULT_MALFORMED_MIN_ROWS)?,
            malformed_max_ratio: env_or("INGEST_MALFORMED_MAX_RATIO", DEFAULT_MALFORMED_MAX_RATIO)?,
            profile_workers: env_or("INGEST_PROFILE_WORKERS", DEFAULT_PROFILE_WORKERS)?,
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("INGEST_BATCH_SIZE must be greater than 0");
        }
        if self.sniff_bytes == 0 {
            anyhow::bail!("INGEST_SNIFF_BYTES must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.malformed_max_ratio) {
            anyhow::bail!("INGEST_MALFORMED_MAX_RATIO must be between 0 and 1");
        }
        if self.profile_workers == 0 {
            anyhow::bail!("INGEST_PROFILE_WORKERS must be greater than 0");
        }
        Ok(())
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from(DEFAULT_INPUT_DIR),
            batch_size: DEFAULT_INSERT_BATCH_SIZE,
            sniff_bytes: DEFAULT_SNIFF_BYTES,
            malformed_min_rows: DEFAULT_MALFORMED_MIN_ROWS,
            malformed_max_ratio: DEFAULT_MALFORMED_MAX_RATIO,
            profile_workers: DEFAULT_PROFILE_WORKERS,
        }
    }
}

impl WarehouseConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            url: env_string("CLICKHOUSE_URL", DEFAULT_WAREHOUSE_URL),
            user: env_string("CLICKHOUSE_USER", DEFAULT_WAREHOUSE_USER),
            password: env_string("CLICKHOUSE_PASSWORD", ""),
            database: env_string("CLICKHOUSE_DATABASE", DEFAULT_WAREHOUSE_DATABASE),
            server_input_dir: env_string("CLICKHOUSE_INPUT_DIR", ""),
            timeout_secs: env_or("CLICKHOUSE_TIMEOUT_SECS", DEFAULT_WAREHOUSE_TIMEOUT_SECS)?,
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.url.trim().is_empty() {
            anyhow::bail!("CLICKHOUSE_URL must not be empty");
        }
        if self.database.trim().is_empty() {
            anyhow::bail!("CLICKHOUSE_DATABASE must not be empty");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_WAREHOUSE_URL.to_string(),
            user: DEFAULT_WAREHOUSE_USER.to_string(),
            password: String::new(),
            database: DEFAULT_WAREHOUSE_DATABASE.to_string(),
            server_input_dir: String::new(),
            timeout_secs: DEFAULT_WAREHOUSE_TIMEOUT_SECS,
        }
    }
}

impl SearchConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            host: env_string("MANTICORE_HOST", DEFAULT_SEARCH_HOST),
            port: env_or("MANTICORE_PORT", DEFAULT_SEARCH_PORT)?,
            user: env_string("MANTICORE_USER", ""),
            password: env_string("MANTICORE_PASSWORD", ""),
            config_path: PathBuf::from(env_string(
                "MANTICORE_CONFIG_PATH",
                DEFAULT_SEARCH_CONFIG_PATH,
            )),
            data_root: env_string("MANTICORE_DATA_ROOT", DEFAULT_SEARCH_DATA_ROOT),
            log_dir: env_string("MANTICORE_LOG_DIR", DEFAULT_SEARCH_LOG_DIR),
            container: env_string("MANTICORE_CONTAINER", DEFAULT_SEARCH_CONTAINER),
            reload_script: env_string("MANTICORE_RELOAD_SCRIPT", DEFAULT_SEARCH_RELOAD_SCRIPT),
            source_host: env_string("MANTICORE_SOURCE_HOST", DEFAULT_SOURCE_HOST),
            source_port: env_or("MANTICORE_SOURCE_PORT", DEFAULT_SOURCE_PORT)?,
            ready_attempts: env_or("INDEX_READY_ATTEMPTS", DEFAULT_READY_ATTEMPTS)?,
            ready_backoff_ms: env_or("INDEX_READY_BACKOFF_MS", DEFAULT_READY_BACKOFF_MS)?,
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.trim().is_empty() {
            anyhow::bail!("MANTICORE_HOST must not be empty");
        }
        if self.ready_attempts == 0 {
            anyhow::bail!("INDEX_READY_ATTEMPTS must be greater than 0");
        }
        Ok(())
    }

    /// Backoff before retry `attempt` (0-based): grows linearly with the attempt
    pub fn ready_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.ready_backoff_ms.saturating_mul(u64::from(attempt) + 1))
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_SEARCH_HOST.to_string(),
            port: DEFAULT_SEARCH_PORT,
            user: String::new(),
            password: String::new(),
            config_path: PathBuf::from(DEFAULT_SEARCH_CONFIG_PATH),
            data_root: DEFAULT_SEARCH_DATA_ROOT.to_string(),
            log_dir: DEFAULT_SEARCH_LOG_DIR.to_string(),
            container: DEFAULT_SEARCH_CONTAINER.to_string(),
            reload_script: DEFAULT_SEARCH_RELOAD_SCRIPT.to_string(),
            source_host: DEFAULT_SOURCE_HOST.to_string(),
            source_port: DEFAULT_SOURCE_PORT,
            ready_attempts: DEFAULT_READY_ATTEMPTS,
            ready_backoff_ms: DEFAULT_READY_BACKOFF_MS,
        }
    }
}

impl VectorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            host: env_string("VECTOR_HOST", DEFAULT_VECTOR_HOST),
            port: env_or("VECTOR_PORT", DEFAULT_VECTOR_PORT)?,
            chunk_size: env_or("VECTOR_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?,
            min_text_length: env_or("VECTOR_MIN_TEXT_LENGTH", DEFAULT_MIN_TEXT_LENGTH)?,
            page_size: env_or("VECTOR_PAGE_SIZE", DEFAULT_PAGE_SIZE)?,
            upload_batch_size: env_or("VECTOR_UPLOAD_BATCH_SIZE", DEFAULT_UPLOAD_BATCH_SIZE)?,
            upload_workers: env_or("VECTOR_UPLOAD_WORKERS", DEFAULT_UPLOAD_WORKERS)?,
            table_workers: env_or("VECTOR_TABLE_WORKERS", DEFAULT_TABLE_WORKERS)?,
            embedding: EmbeddingConfig::from_env()?,
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_size == 0 {
            anyhow::bail!("VECTOR_CHUNK_SIZE must be greater than 0");
        }
        if self.min_text_length > self.chunk_size {
            anyhow::bail!(
                "VECTOR_MIN_TEXT_LENGTH ({}) must not exceed VECTOR_CHUNK_SIZE ({})",
                self.min_text_length,
                self.chunk_size
            );
        }
        if self.page_size == 0 || self.upload_batch_size == 0 {
            anyhow::bail!("VECTOR_PAGE_SIZE and VECTOR_UPLOAD_BATCH_SIZE must be greater than 0");
        }
        if self.upload_workers == 0 || self.table_workers == 0 {
            anyhow::bail!("VECTOR_UPLOAD_WORKERS and VECTOR_TABLE_WORKERS must be greater than 0");
        }
        self.embedding.validate()
    }

    /// Name of the vector table, keyed by dimensionality so a model change
    /// never mixes vector sizes in one table
    pub fn table_name(&self) -> String {
        format!("text_vector_{}_floats", self.embedding.dims)
    }
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_VECTOR_HOST.to_string(),
            port: DEFAULT_VECTOR_PORT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            min_text_length: DEFAULT_MIN_TEXT_LENGTH,
            page_size: DEFAULT_PAGE_SIZE,
            upload_batch_size: DEFAULT_UPLOAD_BATCH_SIZE,
            upload_workers: DEFAULT_UPLOAD_WORKERS,
            table_workers: DEFAULT_TABLE_WORKERS,
            embedding: EmbeddingConfig::default(),
        }
    }
}

impl EmbeddingConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            provider: env_string("EMBEDDING_PROVIDER", DEFAULT_EMBEDDING_PROVIDER),
            model: env_string("EMBEDDING_MODEL", DEFAULT_EMBEDDING_MODEL),
            url: env_string("EMBEDDING_URL", DEFAULT_EMBEDDING_URL),
            dims: env_or("EMBEDDING_DIMS", DEFAULT_EMBEDDING_DIMS)?,
            timeout_secs: env_or("EMBEDDING_TIMEOUT_SECS", DEFAULT_EMBEDDING_TIMEOUT_SECS)?,
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        match self.provider.as_str() {
            "ollama" | "local" | "disabled" => {},
            other => anyhow::bail!("Unknown EMBEDDING_PROVIDER: {}", other),
        }
        if self.dims == 0 {
            anyhow::bail!("EMBEDDING_DIMS must be greater than 0");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: DEFAULT_EMBEDDING_PROVIDER.to_string(),
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            url: DEFAULT_EMBEDDING_URL.to_string(),
            dims: DEFAULT_EMBEDDING_DIMS,
            timeout_secs: DEFAULT_EMBEDDING_TIMEOUT_SECS,
        }
    }
}
