//! Document processing lifecycle: raw text to searchable chunks.
//!
//! A document moves `stored → extracting → extracted → chunking → embedding →
//! embedded`, with `extraction_failed` / `embedding_failed` as terminal
//! states pending an explicit user-triggered retry. Each transition is
//! persisted through the [`DocumentStore`] *before* the next stage starts, so
//! a crash mid-pipeline resumes from the last persisted stage.
//!
//! The store enforces single-writer semantics with a compare-and-swap
//! transition: a second process request while one is in flight observes a
//! stage it did not expect and is rejected with a conflict, not queued.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::chunking::TextChunker;
use crate::embedding::{BatchProgress, EmbeddingBatcher};
use crate::index::VectorIndex;
use crate::types::{Chunk, DocumentRef, PipelineError, VectorRecord};

pub use memory::MemoryDocumentStore;

/// Authoritative processing state of a document. Exactly one per document.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStage {
    Stored,
    Extracting,
    Extracted,
    ExtractionFailed,
    Chunking,
    Embedding,
    Embedded,
    EmbeddingFailed,
}

impl DocumentStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStage::Stored => "stored",
            DocumentStage::Extracting => "extracting",
            DocumentStage::Extracted => "extracted",
            DocumentStage::ExtractionFailed => "extraction_failed",
            DocumentStage::Chunking => "chunking",
            DocumentStage::Embedding => "embedding",
            DocumentStage::Embedded => "embedded",
            DocumentStage::EmbeddingFailed => "embedding_failed",
        }
    }

    /// Terminal failure states that an explicit retry may leave.
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            DocumentStage::ExtractionFailed | DocumentStage::EmbeddingFailed
        )
    }

    /// Whether a processing run is currently in flight.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DocumentStage::Extracting
                | DocumentStage::Extracted
                | DocumentStage::Chunking
                | DocumentStage::Embedding
        )
    }
}

impl std::fmt::Display for DocumentStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A document as the external store presents it to the pipeline: identity,
/// already-extracted plain text, and the processing-state field the pipeline
/// writes back.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: String,
    pub owner_id: String,
    pub topic_id: Option<String>,
    /// Extracted plain text, when extraction has produced any.
    pub text: Option<String>,
    pub stage: DocumentStage,
    /// Reason recorded with the most recent failure, if any.
    pub failure: Option<String>,
}

impl StoredDocument {
    pub fn new(id: impl Into<String>, owner_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            topic_id: None,
            text: Some(text.into()),
            stage: DocumentStage::Stored,
            failure: None,
        }
    }

    #[must_use]
    pub fn with_topic(mut self, topic_id: impl Into<String>) -> Self {
        self.topic_id = Some(topic_id.into());
        self
    }

    fn document_ref(&self) -> DocumentRef {
        DocumentRef {
            document_id: self.id.clone(),
            owner_id: self.owner_id.clone(),
            topic_id: self.topic_id.clone(),
        }
    }
}

/// Persistence seam for document processing state.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn fetch(&self, document_id: &str) -> Result<Option<StoredDocument>, PipelineError>;

    /// Compare-and-swap stage transition. Fails with
    /// [`PipelineError::Conflict`] when the current stage differs from
    /// `expected`; this is the single-writer guard for concurrent runs.
    async fn transition(
        &self,
        document_id: &str,
        expected: DocumentStage,
        next: DocumentStage,
    ) -> Result<(), PipelineError>;

    /// Persist a terminal failure stage together with its reason.
    async fn record_failure(
        &self,
        document_id: &str,
        stage: DocumentStage,
        reason: &str,
    ) -> Result<(), PipelineError>;
}

/// Summary of a completed processing run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub document_id: String,
    pub chunk_count: usize,
    pub embedded_count: usize,
}

/// Drives a document through the processing state machine.
pub struct DocumentProcessor {
    store: Arc<dyn DocumentStore>,
    index: Arc<dyn VectorIndex>,
    batcher: EmbeddingBatcher,
    chunker: TextChunker,
}

impl DocumentProcessor {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        index: Arc<dyn VectorIndex>,
        batcher: EmbeddingBatcher,
        chunker: TextChunker,
    ) -> Self {
        Self {
            store,
            index,
            batcher,
            chunker,
        }
    }

    /// Process a document from `stored`, or retry one from a failed stage.
    ///
    /// Valid entry stages are `stored`, `extraction_failed` (full rerun), and
    /// `embedding_failed` (re-enter at `embedding`; chunking is deterministic
    /// so the chunk set is identical and upserts are idempotent). Any other
    /// stage is rejected: an active run conflicts, and an `embedded` document
    /// requires an explicit [`rechunk`](Self::rechunk).
    pub async fn process(
        &self,
        document_id: &str,
        progress: Option<flume::Sender<BatchProgress>>,
    ) -> Result<ProcessOutcome, PipelineError> {
        let doc = self.fetch_required(document_id).await?;

        match doc.stage {
            DocumentStage::Stored => {
                self.store
                    .transition(document_id, DocumentStage::Stored, DocumentStage::Extracting)
                    .await?;
                self.run_from_extracting(doc, progress).await
            }
            DocumentStage::ExtractionFailed => {
                self.store
                    .transition(
                        document_id,
                        DocumentStage::ExtractionFailed,
                        DocumentStage::Extracting,
                    )
                    .await?;
                self.run_from_extracting(doc, progress).await
            }
            DocumentStage::EmbeddingFailed => {
                self.store
                    .transition(
                        document_id,
                        DocumentStage::EmbeddingFailed,
                        DocumentStage::Embedding,
                    )
                    .await?;
                let chunks = self
                    .chunk_or_fail(&doc, DocumentStage::EmbeddingFailed)
                    .await?;
                self.run_embedding(&doc, chunks, progress).await
            }
            DocumentStage::Embedded => Err(PipelineError::Conflict(format!(
                "document {document_id} is already embedded; request a re-chunk instead"
            ))),
            stage if stage.is_active() => Err(PipelineError::Conflict(format!(
                "document {document_id} is already being processed (stage {stage})"
            ))),
            stage => Err(PipelineError::Conflict(format!(
                "document {document_id} cannot be processed from stage {stage}"
            ))),
        }
    }

    /// Full replace of an embedded document's chunks.
    ///
    /// Only valid from `embedded`. Existing vectors are deleted before the
    /// rerun so no stale chunks with drifted offsets survive.
    pub async fn rechunk(
        &self,
        document_id: &str,
        progress: Option<flume::Sender<BatchProgress>>,
    ) -> Result<ProcessOutcome, PipelineError> {
        let doc = self.fetch_required(document_id).await?;
        if doc.stage != DocumentStage::Embedded {
            return Err(PipelineError::Conflict(format!(
                "re-chunk requires stage embedded, document {document_id} is {}",
                doc.stage
            )));
        }
        self.store
            .transition(document_id, DocumentStage::Embedded, DocumentStage::Extracting)
            .await?;

        let deleted = self.index.delete_document(&doc.owner_id, &doc.id).await?;
        tracing::info!(
            document_id = %doc.id,
            deleted,
            "removed existing vectors before re-chunk"
        );
        self.run_from_extracting(doc, progress).await
    }

    async fn fetch_required(&self, document_id: &str) -> Result<StoredDocument, PipelineError> {
        self.store
            .fetch(document_id)
            .await?
            .ok_or_else(|| PipelineError::Storage(format!("unknown document: {document_id}")))
    }

    /// Stage is `extracting` on entry.
    async fn run_from_extracting(
        &self,
        doc: StoredDocument,
        progress: Option<flume::Sender<BatchProgress>>,
    ) -> Result<ProcessOutcome, PipelineError> {
        let has_text = doc
            .text
            .as_deref()
            .is_some_and(|text| !text.trim().is_empty());
        if !has_text {
            let reason = "no extracted text available";
            self.store
                .record_failure(&doc.id, DocumentStage::ExtractionFailed, reason)
                .await?;
            return Err(PipelineError::Storage(format!(
                "document {}: {reason}",
                doc.id
            )));
        }

        self.store
            .transition(&doc.id, DocumentStage::Extracting, DocumentStage::Extracted)
            .await?;
        self.store
            .transition(&doc.id, DocumentStage::Extracted, DocumentStage::Chunking)
            .await?;

        let chunks = self
            .chunk_or_fail(&doc, DocumentStage::ExtractionFailed)
            .await?;

        self.store
            .transition(&doc.id, DocumentStage::Chunking, DocumentStage::Embedding)
            .await?;
        self.run_embedding(&doc, chunks, progress).await
    }

    /// `failed_stage` labels the failure with the phase the run is in:
    /// chunking on the extraction path records `extraction_failed`, chunking
    /// during an embedding retry records `embedding_failed`.
    async fn chunk_or_fail(
        &self,
        doc: &StoredDocument,
        failed_stage: DocumentStage,
    ) -> Result<Vec<Chunk>, PipelineError> {
        let text = doc.text.as_deref().unwrap_or_default();
        match self.chunker.chunk(&doc.document_ref(), text) {
            Ok(chunks) => Ok(chunks),
            Err(err) => {
                self.store
                    .record_failure(&doc.id, failed_stage, &err.to_string())
                    .await?;
                Err(err)
            }
        }
    }

    /// Stage is `embedding` on entry.
    async fn run_embedding(
        &self,
        doc: &StoredDocument,
        chunks: Vec<Chunk>,
        progress: Option<flume::Sender<BatchProgress>>,
    ) -> Result<ProcessOutcome, PipelineError> {
        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let outcomes = self.batcher.embed_texts(&texts, progress).await;

        let mut records = Vec::new();
        let mut first_error: Option<PipelineError> = None;
        let mut failed = 0usize;
        for (chunk, outcome) in chunks.iter().zip(outcomes) {
            match outcome {
                Ok(values) => records.push(VectorRecord::from_chunk(chunk, values)),
                Err(err) => {
                    failed += 1;
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        let embedded_count = records.len();
        if !records.is_empty() {
            if let Err(err) = self.index.upsert(records).await {
                self.store
                    .record_failure(&doc.id, DocumentStage::EmbeddingFailed, &err.to_string())
                    .await?;
                return Err(err);
            }
        }

        if let Some(err) = first_error {
            let reason = format!("{failed} of {} chunks failed to embed: {err}", chunks.len());
            self.store
                .record_failure(&doc.id, DocumentStage::EmbeddingFailed, &reason)
                .await?;
            return Err(err);
        }

        self.store
            .transition(&doc.id, DocumentStage::Embedding, DocumentStage::Embedded)
            .await?;
        tracing::info!(
            document_id = %doc.id,
            chunks = chunks.len(),
            "document embedded and indexed"
        );
        Ok(ProcessOutcome {
            document_id: doc.id.clone(),
            chunk_count: chunks.len(),
            embedded_count,
        })
    }
}
