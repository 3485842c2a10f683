//! Top-level service facade wiring the pipeline together.
//!
//! Route and CLI layers talk to [`AnswerService`] rather than to the
//! individual components. It owns the document processor (ingest side) and
//! the answer controller (query side), built over the same embedder and
//! vector index so documents indexed through one are retrievable through
//! the other.

use std::sync::Arc;

use crate::answer::{
    AnswerController, AnswerRequest, AnswerStream, CompletionProvider, SessionStatus,
};
use crate::chunking::TextChunker;
use crate::config::PipelineConfig;
use crate::embedding::{BatchProgress, Embedder, EmbeddingBatcher};
use crate::index::VectorIndex;
use crate::pipeline::{DocumentProcessor, DocumentStore, ProcessOutcome};
use crate::retrieval::{RetrievalEngine, WebSearch};
use crate::types::PipelineError;

pub struct AnswerService {
    processor: DocumentProcessor,
    controller: AnswerController,
}

impl AnswerService {
    pub fn new(
        config: &PipelineConfig,
        store: Arc<dyn DocumentStore>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        web: Arc<dyn WebSearch>,
        completions: Arc<dyn CompletionProvider>,
    ) -> Result<Self, PipelineError> {
        let chunker = TextChunker::new(config.chunker_config())?;
        let batcher = EmbeddingBatcher::new(embedder, config.batcher_config());
        let processor = DocumentProcessor::new(
            Arc::clone(&store),
            Arc::clone(&index),
            batcher.clone(),
            chunker,
        );
        let retrieval = Arc::new(RetrievalEngine::new(Arc::new(batcher), index, web));
        let controller = AnswerController::new(retrieval, completions, config.controller_config());
        Ok(Self {
            processor,
            controller,
        })
    }

    /// Run the extract → chunk → embed → index pipeline for one document.
    /// Pass a channel to observe per-batch embedding progress.
    pub async fn process_document(
        &self,
        document_id: &str,
        progress: Option<flume::Sender<BatchProgress>>,
    ) -> Result<ProcessOutcome, PipelineError> {
        self.processor.process(document_id, progress).await
    }

    /// Wipe an embedded document's vectors and reprocess it from scratch.
    pub async fn rechunk_document(
        &self,
        document_id: &str,
        progress: Option<flume::Sender<BatchProgress>>,
    ) -> Result<ProcessOutcome, PipelineError> {
        self.processor.rechunk(document_id, progress).await
    }

    /// Start an answer session; events arrive on the returned stream.
    pub fn answer_question(&self, request: AnswerRequest) -> Result<AnswerStream, PipelineError> {
        self.controller.ask(request)
    }

    pub fn pause_session(&self, session_id: &str) -> Result<(), PipelineError> {
        self.controller.pause(session_id)
    }

    pub fn resume_session(&self, session_id: &str) -> Result<(), PipelineError> {
        self.controller.resume(session_id)
    }

    pub fn cancel_session(&self, session_id: &str) -> Result<(), PipelineError> {
        self.controller.cancel(session_id)
    }

    pub fn session_status(&self, session_id: &str) -> Option<SessionStatus> {
        self.controller.status(session_id)
    }

    /// Drop sessions idle beyond the configured timeout; returns how many.
    pub fn reap_idle_sessions(&self) -> usize {
        self.controller.reap_idle()
    }
}
