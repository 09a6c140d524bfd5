//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the global tracing subscriber once at startup
//! - Honor `RUST_LOG`, falling back to the configured level
//!
//! # Design Decisions
//! - Compact single-line output by default, pretty output for development

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// Filter used when `RUST_LOG` is unset.
pub fn default_filter(level: &str) -> String {
    format!("protocol_proxy={level},tower_http={level},warn")
}

/// Install the global subscriber.
///
/// Returns an error if a subscriber is already installed.
pub fn init_logging(
    config: &ObservabilityConfig,
) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(&config.log_level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.pretty_logs {
        registry.with(fmt::layer().pretty()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_scopes_crate() {
        let filter = default_filter("debug");
        assert!(filter.starts_with("protocol_proxy=debug"));
        assert!(EnvFilter::try_new(filter).is_ok());
    }
}
