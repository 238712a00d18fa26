//! Observability plumbing shared by every binary: tracing initialization,
//! the global metrics registries with their scrape endpoint, and secret
//! scrubbing for anything that ends up in logs.

pub mod metrics;
pub mod scrub;

use std::sync::Once;

static INIT: Once = Once::new();

/// Initializes tracing with the given env-filter directive. Idempotent so
/// tests can call it freely.
pub fn tracing_init(env_filter: &str) {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(env_filter)),
            )
            .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
            .with_writer(std::io::stderr)
            .init();
    });
}
