//! In-memory [`DocumentStore`] for tests and single-process deployments.

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::{DocumentStage, DocumentStore, StoredDocument};
use crate::types::PipelineError;

#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: Mutex<FxHashMap<String, StoredDocument>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, doc: StoredDocument) {
        self.documents.lock().insert(doc.id.clone(), doc);
    }

    pub fn stage_of(&self, document_id: &str) -> Option<DocumentStage> {
        self.documents
            .lock()
            .get(document_id)
            .map(|doc| doc.stage)
    }

    pub fn failure_of(&self, document_id: &str) -> Option<String> {
        self.documents
            .lock()
            .get(document_id)
            .and_then(|doc| doc.failure.clone())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn fetch(&self, document_id: &str) -> Result<Option<StoredDocument>, PipelineError> {
        Ok(self.documents.lock().get(document_id).cloned())
    }

    async fn transition(
        &self,
        document_id: &str,
        expected: DocumentStage,
        next: DocumentStage,
    ) -> Result<(), PipelineError> {
        let mut documents = self.documents.lock();
        let doc = documents
            .get_mut(document_id)
            .ok_or_else(|| PipelineError::Storage(format!("unknown document: {document_id}")))?;
        if doc.stage != expected {
            return Err(PipelineError::Conflict(format!(
                "document {document_id}: expected stage {expected}, found {}",
                doc.stage
            )));
        }
        doc.stage = next;
        if expected.is_failed() {
            doc.failure = None;
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        document_id: &str,
        stage: DocumentStage,
        reason: &str,
    ) -> Result<(), PipelineError> {
        let mut documents = self.documents.lock();
        let doc = documents
            .get_mut(document_id)
            .ok_or_else(|| PipelineError::Storage(format!("unknown document: {document_id}")))?;
        doc.stage = stage;
        doc.failure = Some(reason.to_string());
        Ok(())
    }
}
