//! Full-text index publication
//!
//! The search engine pulls each normalized table straight from the warehouse
//! through a generated `source` section. Publishing a table means:
//!
//! 1. Render the configuration for every normalized table ([`config_gen`])
//! 2. Hand it to the engine and rotate the new table in ([`SearchEngine::apply_config`])
//! 3. Poll until the table answers queries ([`publisher`])
//! 4. Record completion in the warehouse

pub mod config_gen;
pub mod manticore;
pub mod publisher;

pub use config_gen::{SearchConfigDocument, SourceConnection, TableSchema};
pub use manticore::ManticoreClient;
pub use publisher::{publish_table, PublishOutcome};

use crate::error::Result;
use async_trait::async_trait;

/// Remote search engine operations used by the publisher
#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// Deploy `document` and start indexing `table`
    async fn apply_config(&self, document: &SearchConfigDocument, table: &str) -> Result<()>;

    /// Number of indexed documents in `table`
    async fn probe_count(&self, table: &str) -> Result<u64>;

    /// Fetch one document from `table`
    async fn probe_sample(&self, table: &str) -> Result<()>;

    /// Run an autocomplete query against `table`
    async fn probe_autocomplete(&self, table: &str) -> Result<()>;
}
