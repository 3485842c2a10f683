//! Hybrid retrieval: document-vector search plus scoped web search.
//!
//! The engine embeds the query once, fans out to the vector index and the
//! web-search provider, then normalizes both result sets into
//! [`RetrievalResult`]s. Document and web scores live on different scales, so
//! the two groups are never re-ranked against each other; callers receive
//! them as two labeled groups, each in relevance order.
//!
//! An empty outcome is the explicit [`RetrievalOutcome::NoContext`] signal,
//! not an error: the answer controller uses it to instruct the completion
//! model to answer without fabricated citations.

pub mod web;

use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::embedding::EmbeddingBatcher;
use crate::index::{ScopeFilter, VectorIndex, enforce_owner_scope};
use crate::types::{PipelineError, RetrievalResult, SourceType, Topic};

pub use web::HttpWebSearch;

/// A ranked web search hit as the provider returns it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// Capability trait over the external web-search provider.
#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str, max_results: usize)
    -> Result<Vec<WebHit>, PipelineError>;
}

/// Scope applied to both retrieval paths.
#[derive(Clone, Debug, Default)]
pub struct RetrievalScope {
    /// Narrows vector search to the topic id and biases/filters web search
    /// with the topic label.
    pub topic: Option<Topic>,
    /// Narrows vector search to specific documents. Ids outside the owner's
    /// corpus silently match nothing.
    pub document_ids: Option<Vec<String>>,
}

impl RetrievalScope {
    #[must_use]
    pub fn with_topic(mut self, topic: Topic) -> Self {
        self.topic = Some(topic);
        self
    }

    #[must_use]
    pub fn with_documents(mut self, document_ids: Vec<String>) -> Self {
        self.document_ids = Some(document_ids);
        self
    }
}

/// Per-request retrieval tuning.
#[derive(Clone, Copy, Debug)]
pub struct RetrievalOptions {
    pub enable_docs: bool,
    pub enable_web: bool,
    pub max_doc_chunks: usize,
    pub min_score: f32,
    /// Threshold reduction for the single relaxed retry when the strict
    /// search returns nothing. Zero disables the retry.
    pub relax_delta: f32,
    /// Lower bound the relaxed threshold never goes below.
    pub relax_floor: f32,
    pub max_web_results: usize,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            enable_docs: true,
            enable_web: true,
            max_doc_chunks: 6,
            min_score: 0.7,
            relax_delta: 0.2,
            relax_floor: 0.0,
            max_web_results: 5,
        }
    }
}

impl RetrievalOptions {
    #[must_use]
    pub fn docs_only(mut self) -> Self {
        self.enable_docs = true;
        self.enable_web = false;
        self
    }

    #[must_use]
    pub fn web_only(mut self) -> Self {
        self.enable_docs = false;
        self.enable_web = true;
        self
    }

    #[must_use]
    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    #[must_use]
    pub fn with_relaxation(mut self, delta: f32, floor: f32) -> Self {
        self.relax_delta = delta;
        self.relax_floor = floor;
        self
    }
}

/// Both labeled result groups, deduplicated and capped.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct MergedResults {
    pub document_results: Vec<RetrievalResult>,
    pub web_results: Vec<RetrievalResult>,
}

impl MergedResults {
    pub fn is_empty(&self) -> bool {
        self.document_results.is_empty() && self.web_results.is_empty()
    }

    pub fn total(&self) -> usize {
        self.document_results.len() + self.web_results.len()
    }
}

/// Outcome of a retrieval request. `NoContext` is a valid result, distinct
/// from an error: it means neither source yielded grounding.
#[derive(Clone, Debug, PartialEq)]
pub enum RetrievalOutcome {
    Grounded(MergedResults),
    NoContext,
}

/// Orchestrates document-vector search and web search under a scope.
pub struct RetrievalEngine {
    batcher: Arc<EmbeddingBatcher>,
    index: Arc<dyn VectorIndex>,
    web: Arc<dyn WebSearch>,
}

impl RetrievalEngine {
    pub fn new(
        batcher: Arc<EmbeddingBatcher>,
        index: Arc<dyn VectorIndex>,
        web: Arc<dyn WebSearch>,
    ) -> Self {
        Self {
            batcher,
            index,
            web,
        }
    }

    pub async fn retrieve(
        &self,
        query: &str,
        owner_id: &str,
        scope: &RetrievalScope,
        options: &RetrievalOptions,
    ) -> Result<RetrievalOutcome, PipelineError> {
        if !options.enable_docs && !options.enable_web {
            return Err(PipelineError::invalid_input(
                "at least one retrieval source must be enabled",
            ));
        }
        if query.trim().is_empty() {
            return Err(PipelineError::invalid_input("empty query"));
        }

        let mut document_results = Vec::new();
        if options.enable_docs {
            match self.search_documents(query, owner_id, scope, options).await {
                Ok(results) => document_results = results,
                Err(err) if options.enable_web => {
                    // Document path degraded; retrieval continues web-only.
                    tracing::warn!(error = %err, "document retrieval failed, falling back to web-only");
                }
                Err(err) => return Err(err),
            }
        }

        let mut web_results = Vec::new();
        if options.enable_web {
            web_results = self.search_web(query, scope, options).await?;
        }

        let merged = merge(document_results, web_results, options);
        if merged.is_empty() {
            tracing::debug!(owner_id, "retrieval produced no grounding context");
            return Ok(RetrievalOutcome::NoContext);
        }
        Ok(RetrievalOutcome::Grounded(merged))
    }

    async fn search_documents(
        &self,
        query: &str,
        owner_id: &str,
        scope: &RetrievalScope,
        options: &RetrievalOptions,
    ) -> Result<Vec<RetrievalResult>, PipelineError> {
        let query_vector = self.batcher.embed_one(query).await?;

        let mut filter = ScopeFilter::owner(owner_id);
        if let Some(topic) = &scope.topic {
            filter = filter.with_topic(topic.id.clone());
        }
        if let Some(ids) = &scope.document_ids {
            filter = filter.with_documents(ids.clone());
        }

        let mut hits = self
            .index
            .search(&query_vector, &filter, options.max_doc_chunks, options.min_score)
            .await?;

        // A strict default threshold can exclude genuinely relevant content;
        // retry once with a relaxed threshold before giving up on this path.
        if hits.is_empty() && options.relax_delta > 0.0 {
            let relaxed = (options.min_score - options.relax_delta).max(options.relax_floor);
            tracing::debug!(
                min_score = options.min_score,
                relaxed,
                "no document matches at strict threshold, retrying relaxed"
            );
            hits = self
                .index
                .search(&query_vector, &filter, options.max_doc_chunks, relaxed)
                .await?;
        }

        let hits = enforce_owner_scope(hits, owner_id);
        Ok(hits
            .into_iter()
            .map(|hit| RetrievalResult {
                source: SourceType::Document,
                score: hit.score,
                title: hit.record.document_id.clone(),
                excerpt: hit.record.excerpt.clone(),
                citation_ref: format!("doc://{}", hit.record.chunk_id),
            })
            .collect())
    }

    async fn search_web(
        &self,
        query: &str,
        scope: &RetrievalScope,
        options: &RetrievalOptions,
    ) -> Result<Vec<RetrievalResult>, PipelineError> {
        let topic_label = scope.topic.as_ref().map(|topic| topic.label.as_str());
        let biased = build_web_query(query, topic_label);

        // Over-fetch so the topic post-filter still has enough to choose from.
        let fetch = options.max_web_results.saturating_mul(2).max(1);
        let hits = self.web.search(&biased, fetch).await?;

        let filtered: Vec<WebHit> = match topic_label {
            // Providers do not reliably honor phrase bias; require the topic
            // string client-side.
            Some(label) => {
                let needle = label.to_lowercase();
                hits.into_iter()
                    .filter(|hit| {
                        let haystack = format!("{} {}", hit.title, hit.snippet).to_lowercase();
                        haystack.contains(&needle)
                    })
                    .collect()
            }
            None => hits,
        };

        Ok(filtered
            .into_iter()
            .enumerate()
            .map(|(rank, hit)| RetrievalResult {
                source: SourceType::Web,
                // Reciprocal rank as a relevance proxy; providers expose
                // ordering, not scores.
                score: 1.0 / (rank as f32 + 1.0),
                citation_ref: normalize_url(&hit.url),
                title: hit.title,
                excerpt: hit.snippet,
            })
            .collect())
    }
}

/// Prepend the topic phrase, quoted when multi-word, to bias the provider.
fn build_web_query(query: &str, topic_label: Option<&str>) -> String {
    match topic_label {
        Some(label) if label.split_whitespace().nth(1).is_some() => {
            format!("\"{label}\" {query}")
        }
        Some(label) => format!("{label} {query}"),
        None => query.to_string(),
    }
}

/// Normalize a URL for deduplication: lowercase host, drop fragments, trim a
/// trailing slash. Unparseable URLs fall back to the raw string.
fn normalize_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            let mut normalized = parsed.to_string();
            if normalized.ends_with('/') {
                normalized.pop();
            }
            normalized
        }
        Err(_) => raw.trim().to_string(),
    }
}

/// Concatenate, deduplicate by citation ref, and cap each group.
fn merge(
    document_results: Vec<RetrievalResult>,
    web_results: Vec<RetrievalResult>,
    options: &RetrievalOptions,
) -> MergedResults {
    let mut seen: FxHashSet<String> = FxHashSet::default();
    let mut merged = MergedResults::default();

    for result in document_results {
        if merged.document_results.len() >= options.max_doc_chunks {
            break;
        }
        if seen.insert(result.citation_ref.clone()) {
            merged.document_results.push(result);
        }
    }
    for result in web_results {
        if merged.web_results.len() >= options.max_web_results {
            break;
        }
        if seen.insert(result.citation_ref.clone()) {
            merged.web_results.push(result);
        }
    }
    merged
}
