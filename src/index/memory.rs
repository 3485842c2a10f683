//! In-process vector index backend.
//!
//! Cosine similarity over an `FxHashMap`, with a monotonically increasing
//! upsert sequence so the recency tie-break is deterministic. Used by tests
//! and by single-node deployments that have no external index.

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::{ScopeFilter, ScoredChunk, VectorIndex};
use crate::types::{PipelineError, VectorRecord};

#[derive(Default)]
struct IndexState {
    records: FxHashMap<String, Entry>,
    next_seq: u64,
}

struct Entry {
    record: VectorRecord,
    seq: u64,
}

/// Thread-safe in-memory implementation of [`VectorIndex`].
#[derive(Default)]
pub struct MemoryVectorIndex {
    state: RwLock<IndexState>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored vectors, across all owners.
    pub fn len(&self) -> usize {
        self.state.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert(&self, records: Vec<VectorRecord>) -> Result<(), PipelineError> {
        let mut state = self.state.write();
        for record in records {
            let seq = state.next_seq;
            state.next_seq += 1;
            state
                .records
                .insert(record.chunk_id.clone(), Entry { record, seq });
        }
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        filter: &ScopeFilter,
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<ScoredChunk>, PipelineError> {
        if query.is_empty() {
            return Err(PipelineError::invalid_input("empty query vector"));
        }
        let state = self.state.read();
        let mut hits: Vec<(f32, u64, VectorRecord)> = state
            .records
            .values()
            .filter(|entry| filter.matches(&entry.record))
            .filter_map(|entry| {
                let score = cosine_similarity(query, &entry.record.values)?;
                (score >= min_score).then(|| (score, entry.seq, entry.record.clone()))
            })
            .collect();

        hits.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.1.cmp(&a.1))
        });
        hits.truncate(top_k);

        Ok(hits
            .into_iter()
            .map(|(score, _, record)| ScoredChunk { record, score })
            .collect())
    }

    async fn delete_document(
        &self,
        owner_id: &str,
        document_id: &str,
    ) -> Result<usize, PipelineError> {
        let mut state = self.state.write();
        let before = state.records.len();
        state
            .records
            .retain(|_, entry| {
                !(entry.record.owner_id == owner_id && entry.record.document_id == document_id)
            });
        Ok(before - state.records.len())
    }
}

/// Cosine similarity; `None` for mismatched dimensions or zero-norm vectors.
fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(chunk_id: &str, owner: &str, values: Vec<f32>) -> VectorRecord {
        VectorRecord {
            chunk_id: chunk_id.into(),
            document_id: chunk_id.split(':').next().unwrap_or(chunk_id).into(),
            owner_id: owner.into(),
            topic_id: None,
            excerpt: format!("excerpt for {chunk_id}"),
            values,
        }
    }

    #[tokio::test]
    async fn search_orders_by_score_then_recency() {
        let index = MemoryVectorIndex::new();
        index
            .upsert(vec![
                record("d1:0", "alice", vec![1.0, 0.0]),
                record("d1:1", "alice", vec![0.0, 1.0]),
                // Same direction as d1:0 but inserted later: tie broken newer-first.
                record("d2:0", "alice", vec![2.0, 0.0]),
            ])
            .await
            .unwrap();

        let hits = index
            .search(&[1.0, 0.0], &ScopeFilter::owner("alice"), 10, 0.5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].record.chunk_id, "d2:0");
        assert_eq!(hits[1].record.chunk_id, "d1:0");
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_chunk_id() {
        let index = MemoryVectorIndex::new();
        index
            .upsert(vec![record("d1:0", "alice", vec![1.0, 0.0])])
            .await
            .unwrap();
        index
            .upsert(vec![record("d1:0", "alice", vec![0.0, 1.0])])
            .await
            .unwrap();
        assert_eq!(index.len(), 1);

        let hits = index
            .search(&[0.0, 1.0], &ScopeFilter::owner("alice"), 10, 0.9)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn search_never_crosses_owner_scope() {
        let index = MemoryVectorIndex::new();
        index
            .upsert(vec![
                record("d1:0", "alice", vec![1.0, 0.0]),
                record("d2:0", "bob", vec![1.0, 0.0]),
            ])
            .await
            .unwrap();

        let hits = index
            .search(&[1.0, 0.0], &ScopeFilter::owner("alice"), 10, 0.0)
            .await
            .unwrap();
        assert!(hits.iter().all(|h| h.record.owner_id == "alice"));
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn delete_document_removes_only_that_document() {
        let index = MemoryVectorIndex::new();
        index
            .upsert(vec![
                record("d1:0", "alice", vec![1.0]),
                record("d1:1", "alice", vec![1.0]),
                record("d2:0", "alice", vec![1.0]),
            ])
            .await
            .unwrap();
        let deleted = index.delete_document("alice", "d1").await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn zero_norm_vectors_produce_no_score() {
        assert!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]).is_none());
        assert!(cosine_similarity(&[1.0], &[1.0, 0.0]).is_none());
    }
}
