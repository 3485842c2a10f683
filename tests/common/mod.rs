//! Shared fixtures and mock collaborators for the integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use answersmith::answer::{AnswerEvent, CompletionProvider, CompletionStream};
use answersmith::embedding::Embedder;
use answersmith::retrieval::{WebHit, WebSearch};
use answersmith::types::PipelineError;
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Deterministic embedder with per-text vector overrides and a scriptable
/// queue of failures consumed before any call succeeds.
pub struct ScriptedEmbedder {
    dims: usize,
    overrides: Mutex<FxHashMap<String, Vec<f32>>>,
    failures: Mutex<VecDeque<PipelineError>>,
    calls: AtomicUsize,
}

impl ScriptedEmbedder {
    pub fn new() -> Self {
        Self::with_dims(4)
    }

    pub fn with_dims(dims: usize) -> Self {
        Self {
            dims,
            overrides: Mutex::new(FxHashMap::default()),
            failures: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Pin the vector returned for an exact input text.
    pub fn set_vector(&self, text: impl Into<String>, vector: Vec<f32>) {
        self.overrides.lock().insert(text.into(), vector);
    }

    /// Queue an error; each embed call consumes one queued error before the
    /// deterministic path resumes.
    pub fn push_failure(&self, err: PipelineError) {
        self.failures.lock().push_back(err);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        if let Some(pinned) = self.overrides.lock().get(text) {
            return pinned.clone();
        }
        let mut v = vec![0.0f32; self.dims];
        for (i, b) in text.bytes().enumerate() {
            v[i % self.dims] += f32::from(b) / 255.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl Embedder for ScriptedEmbedder {
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }
}

/// Web search stub returning a fixed hit list, with an optional one-shot
/// error.
pub struct StaticWebSearch {
    hits: Mutex<Vec<WebHit>>,
    error: Mutex<Option<PipelineError>>,
    calls: AtomicUsize,
    last_query: Mutex<Option<String>>,
}

impl StaticWebSearch {
    pub fn new(hits: Vec<WebHit>) -> Self {
        Self {
            hits: Mutex::new(hits),
            error: Mutex::new(None),
            calls: AtomicUsize::new(0),
            last_query: Mutex::new(None),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn set_error(&self, err: PipelineError) {
        *self.error.lock() = Some(err);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_query(&self) -> Option<String> {
        self.last_query.lock().clone()
    }
}

#[async_trait]
impl WebSearch for StaticWebSearch {
    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<WebHit>, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_query.lock() = Some(query.to_string());
        if let Some(err) = self.error.lock().take() {
            return Err(err);
        }
        Ok(self.hits.lock().iter().take(max_results).cloned().collect())
    }
}

pub fn hit(title: &str, url: &str, snippet: &str) -> WebHit {
    WebHit {
        title: title.into(),
        url: url.into(),
        snippet: snippet.into(),
    }
}

type ScriptedStream = Result<flume::Receiver<Result<String, PipelineError>>, PipelineError>;

/// Completion provider whose streams are backed by channels the test feeds,
/// so pause/resume/cancel timing is under test control. Each `stream()` call
/// consumes the next scripted entry in order.
pub struct MockCompletion {
    streams: Mutex<VecDeque<ScriptedStream>>,
    completions: Mutex<VecDeque<Result<String, PipelineError>>>,
    complete_delay: Mutex<Option<Duration>>,
    stream_calls: AtomicUsize,
    complete_calls: AtomicUsize,
}

impl MockCompletion {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(VecDeque::new()),
            completions: Mutex::new(VecDeque::new()),
            complete_delay: Mutex::new(None),
            stream_calls: AtomicUsize::new(0),
            complete_calls: AtomicUsize::new(0),
        }
    }

    /// Make every `complete()` call sleep before resolving, leaving a window
    /// for commands to land while the call is in flight.
    pub fn set_complete_delay(&self, delay: Duration) {
        *self.complete_delay.lock() = Some(delay);
    }

    /// Script the next `stream()` call; the returned sender feeds it.
    /// Dropping the sender ends the stream.
    pub fn push_stream(&self) -> flume::Sender<Result<String, PipelineError>> {
        let (tx, rx) = flume::unbounded();
        self.streams.lock().push_back(Ok(rx));
        tx
    }

    /// Script a stream whose chunks are sent up front and which then ends.
    pub fn push_finished_stream(&self, chunks: &[&str]) {
        let tx = self.push_stream();
        for chunk in chunks {
            tx.send(Ok((*chunk).to_string())).unwrap();
        }
    }

    /// Script the next `stream()` call to fail at open.
    pub fn push_stream_error(&self, err: PipelineError) {
        self.streams.lock().push_back(Err(err));
    }

    /// Script the next `complete()` result (fallback or follow-ups).
    pub fn push_completion(&self, result: Result<String, PipelineError>) {
        self.completions.lock().push_back(result);
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionProvider for MockCompletion {
    async fn stream(&self, _prompt: &str) -> Result<CompletionStream, PipelineError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        match self.streams.lock().pop_front() {
            Some(Ok(rx)) => Ok(rx.into_stream().boxed()),
            Some(Err(err)) => Err(err),
            None => Err(PipelineError::permanent(
                "completions",
                "no scripted stream remaining",
            )),
        }
    }

    async fn complete(&self, _prompt: &str) -> Result<String, PipelineError> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.complete_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.completions
            .lock()
            .pop_front()
            .unwrap_or(Ok(String::new()))
    }
}

/// Collect events until a terminal one arrives (inclusive), bounded by a
/// wall-clock timeout so a hung session fails the test instead of the run.
pub async fn drain_events(rx: &flume::Receiver<AnswerEvent>) -> Vec<AnswerEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv_async())
            .await
            .expect("session stalled without a terminal event")
            .expect("session dropped its event channel without a terminal event");
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            return events;
        }
    }
}

/// The concatenated text of every delta event, in order.
pub fn delta_text(events: &[AnswerEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            AnswerEvent::Delta { text, .. } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

pub fn embedder() -> Arc<ScriptedEmbedder> {
    Arc::new(ScriptedEmbedder::new())
}
