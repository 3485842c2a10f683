//! Shared records and the crate-wide error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by the retrieval-and-answer pipeline.
///
/// The taxonomy separates caller mistakes ([`InvalidInput`](Self::InvalidInput)),
/// transient upstream trouble that components retry locally
/// ([`UpstreamTransient`](Self::UpstreamTransient)), exhausted retries
/// ([`UpstreamUnavailable`](Self::UpstreamUnavailable)), and permanent upstream
/// rejections that are never retried
/// ([`UpstreamPermanent`](Self::UpstreamPermanent)).
///
/// An empty retrieval outcome is *not* an error; see
/// [`RetrievalOutcome::NoContext`](crate::retrieval::RetrievalOutcome).
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Caller-supplied input was rejected before any upstream call.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A retryable upstream failure (rate limit, timeout, connection reset).
    #[error("transient upstream failure ({service}): {message}")]
    UpstreamTransient {
        service: &'static str,
        message: String,
    },

    /// A non-retryable upstream failure (auth, malformed request).
    #[error("permanent upstream failure ({service}): {message}")]
    UpstreamPermanent {
        service: &'static str,
        message: String,
    },

    /// Retries against an upstream service were exhausted.
    #[error("upstream unavailable after {attempts} attempts ({service}): {message}")]
    UpstreamUnavailable {
        service: &'static str,
        attempts: u32,
        message: String,
    },

    /// The vector index could not serve the request.
    #[error("vector index unavailable: {0}")]
    IndexUnavailable(String),

    /// Persistence layer failure (document store).
    #[error("storage error: {0}")]
    Storage(String),

    /// A state transition or concurrent-run conflict was rejected.
    #[error("processing conflict: {0}")]
    Conflict(String),

    /// The referenced answer session does not exist (or was reaped).
    #[error("unknown session: {0}")]
    UnknownSession(String),
}

impl PipelineError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn transient(service: &'static str, message: impl Into<String>) -> Self {
        Self::UpstreamTransient {
            service,
            message: message.into(),
        }
    }

    pub fn permanent(service: &'static str, message: impl Into<String>) -> Self {
        Self::UpstreamPermanent {
            service,
            message: message.into(),
        }
    }

    /// Whether a bounded retry at the issuing component is warranted.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamTransient { .. })
    }

    /// Collapse an exhausted retry loop into an `UpstreamUnavailable`.
    pub fn into_unavailable(self, attempts: u32) -> Self {
        match self {
            Self::UpstreamTransient { service, message } => Self::UpstreamUnavailable {
                service,
                attempts,
                message,
            },
            other => other,
        }
    }
}

/// A bounded, offset-tracked slice of a document's text.
///
/// Chunks are immutable once created. `index` is contiguous and zero-based
/// per document; `[start_offset, end_offset)` bounds overlap a sibling's
/// bounds only by the configured overlap window.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    /// Stable identity, derived from the document id and chunk index so that
    /// re-chunking the same text yields the same ids.
    pub id: String,
    pub document_id: String,
    pub owner_id: String,
    pub topic_id: Option<String>,
    /// Zero-based position within the document.
    pub index: usize,
    pub text: String,
    /// Byte offset of the chunk's start in the original text.
    pub start_offset: usize,
    /// Byte offset one past the chunk's end in the original text.
    pub end_offset: usize,
    /// Deterministic character-heuristic token estimate.
    pub approx_tokens: usize,
}

/// Identity of a document being chunked, stamped onto every produced chunk.
#[derive(Clone, Debug)]
pub struct DocumentRef {
    pub document_id: String,
    pub owner_id: String,
    pub topic_id: Option<String>,
}

impl DocumentRef {
    pub fn new(document_id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            owner_id: owner_id.into(),
            topic_id: None,
        }
    }

    #[must_use]
    pub fn with_topic(mut self, topic_id: impl Into<String>) -> Self {
        self.topic_id = Some(topic_id.into());
        self
    }
}

/// A chunk embedding with the metadata the vector index filters on.
///
/// Owner and topic metadata always mirror the source chunk exactly. One
/// vector exists per chunk; upserting under the same `chunk_id` replaces the
/// prior vector.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VectorRecord {
    pub chunk_id: String,
    pub document_id: String,
    pub owner_id: String,
    pub topic_id: Option<String>,
    /// Content excerpt used for relevance previews and prompt grounding.
    pub excerpt: String,
    pub values: Vec<f32>,
}

impl VectorRecord {
    /// Build a record from a chunk and its embedding, copying scope metadata
    /// verbatim so it can never be forged or widened.
    pub fn from_chunk(chunk: &Chunk, values: Vec<f32>) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            document_id: chunk.document_id.clone(),
            owner_id: chunk.owner_id.clone(),
            topic_id: chunk.topic_id.clone(),
            excerpt: chunk.text.clone(),
            values,
        }
    }

    pub fn dims(&self) -> usize {
        self.values.len()
    }
}

/// Which retrieval path produced a result.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Document,
    Web,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Document => "document",
            SourceType::Web => "web",
        }
    }
}

/// A normalized unit returned by either retrieval path.
///
/// Document and web results carry scores on different scales and are never
/// re-ranked against each other; callers receive them as two labeled groups.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RetrievalResult {
    pub source: SourceType,
    pub score: f32,
    /// Display title for web hits; document hits reuse their citation ref.
    pub title: String,
    pub excerpt: String,
    /// Normalized reference used for deduplication and citation markers:
    /// `doc://{chunk_id}` for chunks, the normalized URL for web hits.
    pub citation_ref: String,
}

/// An optional narrower partition within an owner's corpus.
///
/// The `id` scopes vector-index filters; the `label` is the human phrase used
/// to bias and post-filter web search.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topic {
    pub id: String,
    pub label: String,
}

impl Topic {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}
