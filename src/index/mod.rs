//! Vector index client: idempotent upserts and owner-scoped similarity search.
//!
//! The index itself is an external collaborator; [`VectorIndex`] is the seam
//! the rest of the pipeline talks through. Every search carries a mandatory
//! owner filter; `topic_id` and `document_ids` narrow results further when
//! present. A missing document id simply yields no matches for that id, never
//! an error that leaks existence.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{PipelineError, VectorRecord};

pub use memory::MemoryVectorIndex;

/// Mandatory owner scope plus optional narrowing filters.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScopeFilter {
    pub owner_id: String,
    pub topic_id: Option<String>,
    pub document_ids: Option<Vec<String>>,
}

impl ScopeFilter {
    pub fn owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            topic_id: None,
            document_ids: None,
        }
    }

    #[must_use]
    pub fn with_topic(mut self, topic_id: impl Into<String>) -> Self {
        self.topic_id = Some(topic_id.into());
        self
    }

    #[must_use]
    pub fn with_documents(mut self, document_ids: Vec<String>) -> Self {
        self.document_ids = Some(document_ids);
        self
    }

    /// Whether a record's metadata falls inside this scope.
    pub fn matches(&self, record: &VectorRecord) -> bool {
        if record.owner_id != self.owner_id {
            return false;
        }
        if let Some(topic) = &self.topic_id {
            if record.topic_id.as_deref() != Some(topic.as_str()) {
                return false;
            }
        }
        if let Some(ids) = &self.document_ids {
            if !ids.iter().any(|id| id == &record.document_id) {
                return false;
            }
        }
        true
    }
}

/// A scope-filtered similarity match.
#[derive(Clone, Debug)]
pub struct ScoredChunk {
    pub record: VectorRecord,
    pub score: f32,
}

/// Client contract over the external vector index service.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Upsert records, idempotent by `chunk_id`: re-embedding a chunk
    /// overwrites the prior vector under the same identity.
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<(), PipelineError>;

    /// Similarity search within `filter`, sorted descending by score with
    /// ties broken by insertion recency (newer first). An empty result set is
    /// not an error.
    async fn search(
        &self,
        query: &[f32],
        filter: &ScopeFilter,
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<ScoredChunk>, PipelineError>;

    /// Remove every vector belonging to one of an owner's documents,
    /// returning how many were deleted.
    async fn delete_document(
        &self,
        owner_id: &str,
        document_id: &str,
    ) -> Result<usize, PipelineError>;
}

/// Scope filters make an out-of-owner result impossible by construction; one
/// surfacing anyway is an internal invariant failure. The offending result is
/// logged and dropped rather than returned.
pub fn enforce_owner_scope(results: Vec<ScoredChunk>, owner_id: &str) -> Vec<ScoredChunk> {
    results
        .into_iter()
        .filter(|hit| {
            let ok = hit.record.owner_id == owner_id;
            if !ok {
                tracing::error!(
                    chunk_id = %hit.record.chunk_id,
                    expected_owner = %owner_id,
                    actual_owner = %hit.record.owner_id,
                    "scope violation: dropping result outside requesting owner"
                );
            }
            ok
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(owner: &str, doc: &str, topic: Option<&str>) -> VectorRecord {
        VectorRecord {
            chunk_id: format!("{doc}:0"),
            document_id: doc.into(),
            owner_id: owner.into(),
            topic_id: topic.map(Into::into),
            excerpt: String::new(),
            values: vec![1.0],
        }
    }

    #[test]
    fn filter_requires_owner_match() {
        let filter = ScopeFilter::owner("alice");
        assert!(filter.matches(&record("alice", "d1", None)));
        assert!(!filter.matches(&record("bob", "d1", None)));
    }

    #[test]
    fn topic_and_documents_narrow_the_scope() {
        let filter = ScopeFilter::owner("alice")
            .with_topic("rust")
            .with_documents(vec!["d1".into()]);
        assert!(filter.matches(&record("alice", "d1", Some("rust"))));
        assert!(!filter.matches(&record("alice", "d1", None)));
        assert!(!filter.matches(&record("alice", "d2", Some("rust"))));
    }

    #[test]
    fn scope_enforcement_drops_foreign_results() {
        let results = vec![
            ScoredChunk {
                record: record("alice", "d1", None),
                score: 0.9,
            },
            ScoredChunk {
                record: record("mallory", "d9", None),
                score: 0.95,
            },
        ];
        let kept = enforce_owner_scope(results, "alice");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].record.owner_id, "alice");
    }
}
