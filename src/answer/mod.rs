//! Streaming answer delivery.
//!
//! The [`AnswerController`] drives an upstream LLM completion stream for each
//! question, forwarding incremental text to the client as [`AnswerEvent`]s
//! over a `flume` channel while supporting pause, resume, cancel, and
//! bounded retry. Citation markers embedded in the grounded prompt are
//! extracted from the finished answer and attached as structured metadata,
//! decoupled from the raw text.

pub mod citations;
mod controller;
pub mod prompt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::types::{PipelineError, SourceType};

pub use controller::{AnswerController, AnswerRequest, AnswerStream, ControllerConfig};
pub use prompt::GroundedPrompt;

/// Incremental token stream from the completion service. Dropping the stream
/// cancels the upstream call.
pub type CompletionStream = BoxStream<'static, Result<String, PipelineError>>;

/// Capability trait over the external LLM completion service.
///
/// Concrete backends are selected at construction time; the controller never
/// chooses a provider per call.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Open a streamed completion for `prompt`.
    async fn stream(&self, prompt: &str) -> Result<CompletionStream, PipelineError>;

    /// Single-shot completion, used for the non-streaming fallback and for
    /// follow-up suggestions.
    async fn complete(&self, prompt: &str) -> Result<String, PipelineError>;
}

/// A structured reference from the generated answer back to a grounding
/// excerpt.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    /// Marker as it appears in the text, e.g. `[D1]` or `[W2]`.
    pub marker: String,
    pub source: SourceType,
    /// The underlying citation ref: `doc://{chunk_id}` or a normalized URL.
    pub reference: String,
    pub title: String,
    pub excerpt: String,
}

/// Lifecycle state of an answer session.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Streaming,
    Paused,
    Cancelled,
    Errored,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Streaming => "streaming",
            SessionStatus::Paused => "paused",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Errored => "errored",
            SessionStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Cancelled | SessionStatus::Errored | SessionStatus::Completed
        )
    }
}

/// Client-facing event emitted by an answer session.
///
/// Serializes with a stable `type` tag so a thin SSE/route layer can forward
/// events unchanged.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnswerEvent {
    /// An incremental slice of answer text, in upstream arrival order.
    Delta {
        session_id: String,
        text: String,
        timestamp: DateTime<Utc>,
    },
    /// Citations actually referenced by the finished answer.
    Citations {
        session_id: String,
        citations: Vec<Citation>,
    },
    /// Terminal success, carrying the full answer and best-effort follow-up
    /// suggestions.
    Completed {
        session_id: String,
        answer: String,
        follow_ups: Vec<String>,
    },
    /// Terminal cancellation; not an error.
    Cancelled { session_id: String },
    /// Terminal failure after classification and (where eligible) retries.
    Errored { session_id: String, message: String },
}

impl AnswerEvent {
    pub fn delta(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        AnswerEvent::Delta {
            session_id: session_id.into(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            AnswerEvent::Delta { session_id, .. }
            | AnswerEvent::Citations { session_id, .. }
            | AnswerEvent::Completed { session_id, .. }
            | AnswerEvent::Cancelled { session_id }
            | AnswerEvent::Errored { session_id, .. } => session_id,
        }
    }

    /// Whether this event ends the session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AnswerEvent::Completed { .. }
                | AnswerEvent::Cancelled { .. }
                | AnswerEvent::Errored { .. }
        )
    }

    pub fn to_json_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_carry_a_stable_type_tag() {
        let event = AnswerEvent::delta("s1", "hello");
        let json = event.to_json_value();
        assert_eq!(json["type"], "delta");
        assert_eq!(json["session_id"], "s1");
        assert_eq!(json["text"], "hello");

        let done = AnswerEvent::Completed {
            session_id: "s1".into(),
            answer: "a".into(),
            follow_ups: vec![],
        };
        assert_eq!(done.to_json_value()["type"], "completed");
        assert!(done.is_terminal());
        assert!(!event.is_terminal());
    }

    #[test]
    fn terminal_statuses() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
        assert_eq!(SessionStatus::Paused.as_str(), "paused");
    }
}
