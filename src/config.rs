//! Pipeline-wide configuration.

use std::time::Duration;

/// Tunable parameters shared by the chunker, batcher, and answer controller.
///
/// `Default` resolves a handful of values from the environment (after loading
/// a `.env` file when present) so deployments can tune the pipeline without
/// code changes.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Maximum chunk size in heuristic tokens.
    pub max_chunk_tokens: usize,
    /// Overlap window in heuristic tokens; strictly smaller than
    /// `max_chunk_tokens`.
    pub overlap_tokens: usize,
    /// Upper bound on texts per upstream embedding call.
    pub embed_batch_size: usize,
    /// Concurrent embedding batches in flight during document indexing.
    pub embed_workers: usize,
    /// Retry budget for transient upstream failures.
    pub max_retries: u32,
    /// Base delay for exponential backoff, doubled each attempt.
    pub retry_base_delay: Duration,
    /// Sessions idle longer than this are reaped from the registry.
    pub session_idle_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        dotenvy::dotenv().ok();
        Self {
            max_chunk_tokens: env_usize("ANSWERSMITH_MAX_CHUNK_TOKENS", 200),
            overlap_tokens: env_usize("ANSWERSMITH_OVERLAP_TOKENS", 25),
            embed_batch_size: env_usize("ANSWERSMITH_EMBED_BATCH_SIZE", 100),
            embed_workers: env_usize("ANSWERSMITH_EMBED_WORKERS", 4),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            session_idle_timeout: Duration::from_secs(300),
        }
    }
}

impl PipelineConfig {
    #[must_use]
    pub fn with_chunking(mut self, max_chunk_tokens: usize, overlap_tokens: usize) -> Self {
        self.max_chunk_tokens = max_chunk_tokens;
        self.overlap_tokens = overlap_tokens;
        self
    }

    #[must_use]
    pub fn with_embed_batch_size(mut self, size: usize) -> Self {
        self.embed_batch_size = size.max(1);
        self
    }

    #[must_use]
    pub fn with_embed_workers(mut self, workers: usize) -> Self {
        self.embed_workers = workers.max(1);
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_base_delay = base_delay;
        self
    }

    #[must_use]
    pub fn with_session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.session_idle_timeout = timeout;
        self
    }

    pub fn chunker_config(&self) -> crate::chunking::ChunkerConfig {
        crate::chunking::ChunkerConfig {
            max_tokens: self.max_chunk_tokens,
            overlap_tokens: self.overlap_tokens,
        }
    }

    pub fn batcher_config(&self) -> crate::embedding::BatcherConfig {
        crate::embedding::BatcherConfig {
            batch_size: self.embed_batch_size,
            workers: self.embed_workers,
            max_retries: self.max_retries,
            base_delay: self.retry_base_delay,
        }
    }

    pub fn controller_config(&self) -> crate::answer::ControllerConfig {
        crate::answer::ControllerConfig {
            max_stream_retries: self.max_retries,
            retry_base_delay: self.retry_base_delay,
            idle_timeout: self.session_idle_timeout,
            suggest_follow_ups: true,
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_overlap_below_chunk_size() {
        let cfg = PipelineConfig::default();
        assert!(cfg.overlap_tokens < cfg.max_chunk_tokens);
        assert!(cfg.embed_batch_size >= 1);
    }

    #[test]
    fn builders_clamp_degenerate_values() {
        let cfg = PipelineConfig::default()
            .with_embed_batch_size(0)
            .with_embed_workers(0);
        assert_eq!(cfg.embed_batch_size, 1);
        assert_eq!(cfg.embed_workers, 1);
    }
}
