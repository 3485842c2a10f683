//! Retrieval-grounded question answering over user documents and the web.
//!
//! ```text
//! Document text ──► chunking::TextChunker ──► Vec<Chunk>
//!                                 │
//! Chunks ──► embedding::EmbeddingBatcher ──► vectors ──► index::VectorIndex
//!                                 │
//! pipeline::DocumentProcessor drives stored → extracting → … → embedded
//!
//! Question ──► retrieval::RetrievalEngine ─┬─► owner-scoped vector search
//!                                          └─► topic-biased web search
//!                       │
//! MergedResults ──► answer::AnswerController ──► AnswerEvent stream
//!                       (delta / citations / completed / cancelled / errored)
//! ```
//!
//! [`service::AnswerService`] wires the two halves over a shared embedder
//! and index; thin route or CLI layers sit on top of it.

pub mod answer;
pub mod chunking;
pub mod config;
pub mod embedding;
pub mod index;
pub mod pipeline;
pub mod retrieval;
pub mod service;
pub mod telemetry;
pub mod types;

pub use answer::{AnswerController, AnswerEvent, AnswerRequest, AnswerStream, SessionStatus};
pub use chunking::TextChunker;
pub use config::PipelineConfig;
pub use embedding::EmbeddingBatcher;
pub use pipeline::DocumentProcessor;
pub use retrieval::RetrievalEngine;
pub use service::AnswerService;
pub use types::{Chunk, PipelineError, RetrievalResult, SourceType, VectorRecord};
