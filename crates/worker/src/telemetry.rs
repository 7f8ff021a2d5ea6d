// Telemetry Module
//
// Console logging for the crawler through tracing-subscriber:
// - Log filter from RUST_LOG or LOG_LEVEL
// - Optional target and thread annotations

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Default filter when neither RUST_LOG nor LOG_LEVEL is set
pub const DEFAULT_LOG_FILTER: &str = "repocrawl_worker=info,repocrawl_durable=info";

// ============================================================================
// Telemetry Configuration
// ============================================================================

/// Configuration for logging
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Log filter (e.g., "info", "debug", "repocrawl_worker=debug")
    pub log_filter: Option<String>,
    /// Whether to print the event target
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "repocrawl-worker".to_string(),
            log_filter: None,
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `SERVICE_NAME`: Service name (default: "repocrawl-worker")
    /// - `RUST_LOG`: Full filter directive
    /// - `LOG_LEVEL`: Level for the crawler crates, used when RUST_LOG is unset
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let log_filter = lookup("RUST_LOG").or_else(|| {
            lookup("LOG_LEVEL")
                .map(|level| format!("repocrawl_worker={level},repocrawl_durable={level}"))
        });

        Self {
            service_name: lookup("SERVICE_NAME").unwrap_or_else(|| "repocrawl-worker".to_string()),
            log_filter,
            with_target: true,
        }
    }

    /// Filter directive that will be installed
    pub fn filter_directive(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }
}

// ============================================================================
// Initialization
// ============================================================================

/// Install the global subscriber
///
/// An invalid filter falls back to [`DEFAULT_LOG_FILTER`]. Calling this twice
/// is harmless; the second call leaves the first subscriber in place.
pub fn init_telemetry(config: TelemetryConfig) {
    let filter = EnvFilter::try_new(config.filter_directive())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(config.with_target)
        .with_filter(filter);

    if tracing_subscriber::registry()
        .with(console_layer)
        .try_init()
        .is_ok()
    {
        tracing::debug!(service = %config.service_name, "telemetry initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_rust_log_wins_over_log_level() {
        let config = TelemetryConfig::from_lookup(lookup(&[
            ("RUST_LOG", "warn"),
            ("LOG_LEVEL", "debug"),
        ]));
        assert_eq!(config.filter_directive(), "warn");
    }

    #[test]
    fn test_log_level_scopes_to_crawler_crates() {
        let config = TelemetryConfig::from_lookup(lookup(&[("LOG_LEVEL", "debug")]));
        assert_eq!(
            config.filter_directive(),
            "repocrawl_worker=debug,repocrawl_durable=debug"
        );
    }

    #[test]
    fn test_default_filter() {
        let config = TelemetryConfig::from_lookup(lookup(&[]));
        assert_eq!(config.filter_directive(), DEFAULT_LOG_FILTER);
        assert_eq!(config.service_name, "repocrawl-worker");
    }
}
