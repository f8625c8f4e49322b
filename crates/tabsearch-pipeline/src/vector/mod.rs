//! Vector pipeline
//!
//! Embeds the text of every normalized table and uploads the vectors to a
//! KNN-indexed table in the vector store. A table is marked done only after
//! every one of its uploads finished, so an interrupted run resumes with the
//! tables that were not marked.

pub mod chunker;
pub mod embedder;
pub mod pipeline;
pub mod store;

pub use chunker::{chunk_text, TextChunk};
pub use embedder::Embedder;
pub use pipeline::{embed_all_tables, embed_table, VectorRunSummary};
pub use store::{VectorRecord, VectorStore};
