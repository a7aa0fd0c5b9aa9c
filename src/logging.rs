//! Tracing initialization for the CLI and tests.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. Respects `RUST_LOG`; defaults to `info`.
/// A second call is a no-op.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
