//! Shared handles for every pipeline stage
//!
//! Built once per process and passed by reference into each stage. The
//! embedding model is only loaded by [`PipelineContext::load_embedder`], and
//! then exactly once, so commands that never embed do not pay for it.

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::search::{ManticoreClient, SearchEngine};
use crate::vector::embedder::{create_embedder, DisabledEmbedder, Embedder};
use crate::vector::store::{ManticoreVectorStore, VectorStore};
use crate::warehouse::{ClickHouseClient, Warehouse};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<PipelineConfig>,
    pub warehouse: Arc<dyn Warehouse>,
    pub search: Arc<dyn SearchEngine>,
    pub vectors: Arc<dyn VectorStore>,
    pub embedder: Arc<dyn Embedder>,
}

impl PipelineContext {
    pub fn new(
        config: PipelineConfig,
        warehouse: Arc<dyn Warehouse>,
        search: Arc<dyn SearchEngine>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            warehouse,
            search,
            vectors,
            embedder,
        }
    }

    /// Connect to the production backends described by `config`.
    ///
    /// Search and vector connections are pooled and lazy, so this succeeds
    /// even while the search engine is still starting. The embedder stays
    /// disabled until [`load_embedder`](Self::load_embedder) is called.
    pub fn connect(config: PipelineConfig) -> Result<Self> {
        let warehouse = Arc::new(ClickHouseClient::new(config.warehouse.clone())?);
        let search = Arc::new(ManticoreClient::connect_lazy(&config.search));
        let vectors = Arc::new(ManticoreVectorStore::connect_lazy(&config.vector));

        info!(
            warehouse = %config.warehouse.url,
            search = %format!("{}:{}", config.search.host, config.search.port),
            vectors = %format!("{}:{}", config.vector.host, config.vector.port),
            "Pipeline context ready"
        );

        Ok(Self::new(
            config,
            warehouse,
            search,
            vectors,
            Arc::new(DisabledEmbedder),
        ))
    }

    /// Build the configured embedder, loading a local model if there is one
    pub fn load_embedder(mut self) -> Result<Self> {
        let embedder = create_embedder(&self.config.vector.embedding)?;
        info!(
            embedder = %embedder.model_name(),
            dims = embedder.dims(),
            "Embedder ready"
        );
        self.embedder = embedder;
        Ok(self)
    }
}
