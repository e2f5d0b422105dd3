use tracing_subscriber::{fmt, EnvFilter};

use crate::config::Config;

/// Install the process-wide `tracing` subscriber.
///
/// `ENV=development` gets human-readable output; otherwise one JSON object
/// per line on stdout, matching spec.md §6's logging contract. All library
/// loggers (broker client, HTTP client, browser automation) emit through
/// `tracing` as well since they are routed through the same `EnvFilter`.
pub fn init(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if config.is_development() {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_level(true)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .init();
    }
}
