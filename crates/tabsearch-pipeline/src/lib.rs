//! Tabsearch Pipeline
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Turns a directory of heterogeneous data files into searchable tables.
//!
//! # Stages
//!
//! - **Discovery**: find new input files, skip ones already ingested
//! - **Raw load**: delimited text via server-side bulk load with a local
//!   line-by-line fallback, Wiki XML dumps via a streaming parser
//! - **Profiling**: null and distinct counts per raw column
//! - **Normalization**: typed, renamed copy of each raw table with a
//!   surrogate `id` column
//! - **Index publication**: regenerate the search engine configuration and
//!   wait until the new table answers queries
//! - **Vectors**: chunk text columns, embed the chunks and upload them to a
//!   vector table, resumable per table
//!
//! # Example
//!
//! ```no_run
//! use tabsearch_pipeline::{run_ingest, PipelineConfig, PipelineContext};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ctx = PipelineContext::connect(PipelineConfig::from_env()?)?;
//!     ctx.warehouse.ensure_schema().await?;
//!     let summary = run_ingest(&ctx).await?;
//!     println!("{} tables published", summary.published.len());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod discovery;
pub mod error;
pub mod loader;
pub mod naming;
pub mod normalizer;
pub mod orchestrator;
pub mod profiler;
pub mod search;
pub mod vector;
pub mod warehouse;

pub use config::PipelineConfig;
pub use context::PipelineContext;
pub use error::{PipelineError, Result};
pub use orchestrator::{run_ingest, IngestSummary};
pub use vector::embed_all_tables;
