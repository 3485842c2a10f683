use std::sync::Arc;
use std::time::Duration;

use answersmith::embedding::{BatcherConfig, BatchProgress, EmbeddingBatcher};
use answersmith::types::PipelineError;

mod common;
use common::ScriptedEmbedder;

fn fast_config() -> BatcherConfig {
    BatcherConfig {
        batch_size: 10,
        workers: 2,
        max_retries: 3,
        base_delay: Duration::from_millis(1),
    }
}

fn texts(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("text number {i}")).collect()
}

/// Three 429s followed by a success resolve to a single success outcome,
/// with exactly four upstream calls issued (3 retries + 1 success).
#[tokio::test]
async fn rate_limits_are_retried_until_success() {
    let embedder = Arc::new(ScriptedEmbedder::new());
    for _ in 0..3 {
        embedder.push_failure(PipelineError::transient("embeddings", "429 too many requests"));
    }
    let batcher = EmbeddingBatcher::new(Arc::clone(&embedder) as _, fast_config());

    let outcomes = batcher.embed_texts(&texts(3), None).await;

    assert_eq!(embedder.calls(), 4);
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(Result::is_ok));
}

#[tokio::test]
async fn exhausted_retries_surface_as_unavailable() {
    let embedder = Arc::new(ScriptedEmbedder::new());
    for _ in 0..4 {
        embedder.push_failure(PipelineError::transient("embeddings", "connection reset"));
    }
    let batcher = EmbeddingBatcher::new(Arc::clone(&embedder) as _, fast_config());

    let outcomes = batcher.embed_texts(&texts(2), None).await;

    // Initial attempt plus the full retry budget, then give up.
    assert_eq!(embedder.calls(), 4);
    for outcome in &outcomes {
        match outcome {
            Err(PipelineError::UpstreamUnavailable { attempts, .. }) => assert_eq!(*attempts, 4),
            other => panic!("expected UpstreamUnavailable, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn permanent_errors_are_not_retried() {
    let embedder = Arc::new(ScriptedEmbedder::new());
    embedder.push_failure(PipelineError::permanent("embeddings", "401 unauthorized"));
    let batcher = EmbeddingBatcher::new(Arc::clone(&embedder) as _, fast_config());

    let outcomes = batcher.embed_texts(&texts(1), None).await;

    assert_eq!(embedder.calls(), 1);
    assert!(matches!(
        outcomes[0],
        Err(PipelineError::UpstreamPermanent { .. })
    ));
}

#[tokio::test]
async fn outcomes_preserve_input_order_across_concurrent_batches() {
    let embedder = Arc::new(ScriptedEmbedder::new());
    let inputs = texts(25);
    for text in &inputs {
        // A distinctive vector per input so reassembly order is observable.
        let rank = text
            .rsplit(' ')
            .next()
            .unwrap()
            .parse::<usize>()
            .unwrap() as f32;
        embedder.set_vector(text.clone(), vec![rank, 0.0, 0.0, 0.0]);
    }
    let batcher = EmbeddingBatcher::new(
        Arc::clone(&embedder) as _,
        BatcherConfig {
            batch_size: 4,
            workers: 4,
            ..fast_config()
        },
    );

    let outcomes = batcher.embed_texts(&inputs, None).await;

    assert_eq!(outcomes.len(), 25);
    for (i, outcome) in outcomes.iter().enumerate() {
        assert_eq!(outcome.as_ref().unwrap()[0], i as f32);
    }
}

#[tokio::test]
async fn one_failed_batch_does_not_poison_the_rest() {
    let embedder = Arc::new(ScriptedEmbedder::new());
    embedder.push_failure(PipelineError::permanent("embeddings", "400 bad request"));
    let batcher = EmbeddingBatcher::new(
        Arc::clone(&embedder) as _,
        BatcherConfig {
            batch_size: 5,
            workers: 1,
            ..fast_config()
        },
    );

    let outcomes = batcher.embed_texts(&texts(10), None).await;

    let (failed, succeeded): (Vec<_>, Vec<_>) = outcomes.iter().partition(|o| o.is_err());
    assert_eq!(failed.len(), 5);
    assert_eq!(succeeded.len(), 5);
}

#[tokio::test]
async fn progress_is_reported_per_batch() {
    let embedder = Arc::new(ScriptedEmbedder::new());
    let batcher = EmbeddingBatcher::new(
        Arc::clone(&embedder) as _,
        BatcherConfig {
            batch_size: 4,
            workers: 1,
            ..fast_config()
        },
    );
    let (tx, rx) = flume::unbounded();

    let outcomes = batcher.embed_texts(&texts(10), Some(tx)).await;
    assert!(outcomes.iter().all(Result::is_ok));

    let updates: Vec<BatchProgress> = rx.drain().collect();
    assert_eq!(updates.len(), 3);
    // Single worker, so completion counts are strictly increasing.
    assert_eq!(
        updates,
        vec![
            BatchProgress { completed: 4, total: 10 },
            BatchProgress { completed: 8, total: 10 },
            BatchProgress { completed: 10, total: 10 },
        ]
    );
}

#[tokio::test]
async fn empty_input_issues_no_calls() {
    let embedder = Arc::new(ScriptedEmbedder::new());
    let batcher = EmbeddingBatcher::new(Arc::clone(&embedder) as _, fast_config());
    let outcomes = batcher.embed_texts(&[], None).await;
    assert!(outcomes.is_empty());
    assert_eq!(embedder.calls(), 0);
}
