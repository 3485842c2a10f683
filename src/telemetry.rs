//! Tracing bootstrap for binaries and examples embedding the pipeline.

use tracing_subscriber::EnvFilter;

/// Install a global `fmt` subscriber honoring `RUST_LOG`.
///
/// Falls back to `info` for this crate when no filter is configured.
/// Idempotent in the sense that a second call is a no-op rather than a panic.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("answersmith=info,warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
