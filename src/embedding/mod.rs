//! Batched embedding orchestration with classified retry.
//!
//! [`Embedder`] is the capability seam over the external embedding service;
//! concrete providers are selected at construction time. The
//! [`EmbeddingBatcher`] wraps a provider with bounded-size batches, bounded
//! concurrency, exponential backoff for retryable failures, and per-item
//! outcomes so a failed batch never blocks unrelated chunks.
//!
//! Progress is reported through a `flume` channel carrying
//! [`BatchProgress`] after each completed batch, which the document pipeline
//! consumes during its long-running embedding phase.

pub mod http;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use rand::Rng;

use crate::types::PipelineError;

pub use http::HttpEmbedder;

/// Capability trait over the external embedding service.
///
/// Implementations classify failures into
/// [`UpstreamTransient`](PipelineError::UpstreamTransient) (retried by the
/// batcher) and [`UpstreamPermanent`](PipelineError::UpstreamPermanent)
/// (surfaced immediately).
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Fixed output dimensionality of this model.
    fn dims(&self) -> usize;

    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError>;
}

/// Progress snapshot emitted after each completed embedding batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
}

/// Retry and batching parameters for the batcher.
#[derive(Clone, Copy, Debug)]
pub struct BatcherConfig {
    /// Maximum texts per upstream call.
    pub batch_size: usize,
    /// Concurrent batches in flight.
    pub workers: usize,
    /// Retries after the initial attempt, for retryable failures only.
    pub max_retries: u32,
    /// Base backoff delay, doubled per attempt with jitter.
    pub base_delay: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            workers: 4,
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// Outcome for a single input text: its vector, or the error that applied to
/// the batch it rode in.
pub type EmbeddingOutcome = Result<Vec<f32>, PipelineError>;

/// Issues bounded, retried, concurrency-limited embedding calls.
#[derive(Clone)]
pub struct EmbeddingBatcher {
    embedder: Arc<dyn Embedder>,
    config: BatcherConfig,
}

impl EmbeddingBatcher {
    pub fn new(embedder: Arc<dyn Embedder>, config: BatcherConfig) -> Self {
        Self {
            embedder,
            config: BatcherConfig {
                batch_size: config.batch_size.max(1),
                workers: config.workers.max(1),
                ..config
            },
        }
    }

    pub fn dims(&self) -> usize {
        self.embedder.dims()
    }

    /// Embed a single query text, retrying transient failures.
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, PipelineError> {
        let texts = [text.to_string()];
        let mut vectors = self.embed_batch_with_retry(&texts).await?;
        vectors
            .pop()
            .ok_or_else(|| PipelineError::transient("embeddings", "provider returned no vector"))
    }

    /// Embed `texts`, returning one outcome per input in input order.
    ///
    /// Batches run concurrently up to the configured worker count; input
    /// order is restored on reassembly regardless of completion order. When
    /// `progress` is set, a [`BatchProgress`] is sent after each completed
    /// batch (send failures are ignored so a dropped receiver never stalls
    /// embedding).
    pub async fn embed_texts(
        &self,
        texts: &[String],
        progress: Option<flume::Sender<BatchProgress>>,
    ) -> Vec<EmbeddingOutcome> {
        if texts.is_empty() {
            return Vec::new();
        }

        let total = texts.len();
        let completed = Arc::new(AtomicUsize::new(0));
        let batches: Vec<(usize, Vec<String>)> = texts
            .chunks(self.config.batch_size)
            .enumerate()
            .map(|(idx, batch)| (idx, batch.to_vec()))
            .collect();

        let mut results: Vec<(usize, Vec<EmbeddingOutcome>)> =
            futures_util::stream::iter(batches.into_iter().map(|(idx, batch)| {
                let completed = Arc::clone(&completed);
                let progress = progress.clone();
                async move {
                    let outcome = self.embed_batch_with_retry(&batch).await;
                    let outcomes: Vec<EmbeddingOutcome> = match outcome {
                        Ok(vectors) => vectors.into_iter().map(Ok).collect(),
                        Err(err) => {
                            tracing::warn!(batch = idx, error = %err, "embedding batch failed");
                            (0..batch.len()).map(|_| Err(clone_error(&err))).collect()
                        }
                    };
                    let done = completed.fetch_add(batch.len(), Ordering::SeqCst) + batch.len();
                    if let Some(tx) = &progress {
                        let _ = tx.send(BatchProgress {
                            completed: done,
                            total,
                        });
                    }
                    (idx, outcomes)
                }
            }))
            .buffer_unordered(self.config.workers)
            .collect()
            .await;

        results.sort_by_key(|(idx, _)| *idx);
        results
            .into_iter()
            .flat_map(|(_, outcomes)| outcomes)
            .collect()
    }

    async fn embed_batch_with_retry(
        &self,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, PipelineError> {
        let mut attempt = 0u32;
        loop {
            match self.embedder.embed(texts).await {
                Ok(vectors) if vectors.len() == texts.len() => return Ok(vectors),
                Ok(vectors) => {
                    return Err(PipelineError::permanent(
                        "embeddings",
                        format!(
                            "provider returned {} vectors for {} inputs",
                            vectors.len(),
                            texts.len()
                        ),
                    ));
                }
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    let delay = backoff_delay(self.config.base_delay, attempt);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying embedding batch"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) if err.is_retryable() => {
                    return Err(err.into_unavailable(attempt + 1));
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Exponential backoff with up to 25% additive jitter.
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let scaled = base.saturating_mul(1u32 << attempt.min(16));
    let jitter_budget = (scaled.as_millis() as u64) / 4;
    let jitter = if jitter_budget > 0 {
        rand::rng().random_range(0..=jitter_budget)
    } else {
        0
    };
    scaled + Duration::from_millis(jitter)
}

/// `PipelineError` is not `Clone` (it can wrap non-clonable sources), so
/// fan-out to per-item outcomes rebuilds the variant fields it carries.
fn clone_error(err: &PipelineError) -> PipelineError {
    match err {
        PipelineError::InvalidInput(msg) => PipelineError::InvalidInput(msg.clone()),
        PipelineError::UpstreamTransient { service, message } => PipelineError::UpstreamTransient {
            service,
            message: message.clone(),
        },
        PipelineError::UpstreamPermanent { service, message } => PipelineError::UpstreamPermanent {
            service,
            message: message.clone(),
        },
        PipelineError::UpstreamUnavailable {
            service,
            attempts,
            message,
        } => PipelineError::UpstreamUnavailable {
            service,
            attempts: *attempts,
            message: message.clone(),
        },
        PipelineError::IndexUnavailable(msg) => PipelineError::IndexUnavailable(msg.clone()),
        PipelineError::Storage(msg) => PipelineError::Storage(msg.clone()),
        PipelineError::Conflict(msg) => PipelineError::Conflict(msg.clone()),
        PipelineError::UnknownSession(msg) => PipelineError::UnknownSession(msg.clone()),
    }
}
