//! Configuration management.

use serde::Deserialize;
use std::time::Duration;

use crate::telemetry::LoggingConfig;

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Aggregate store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration for a single [`AggregateStore`](crate::store::AggregateStore).
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// How long orphan updates are buffered while waiting for their parent
    /// aggregate to be created
    #[serde(with = "humantime_serde", default = "default_pending_ttl")]
    pub pending_ttl: Duration,

    /// Event broadcast channel buffer size
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,

    /// Maximum number of concurrently active aggregates; `None` is unbounded
    #[serde(default)]
    pub max_active_aggregates: Option<usize>,

    /// Maximum buffered orphan updates per parent id; `None` is unbounded
    #[serde(default)]
    pub max_pending_per_id: Option<usize>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            pending_ttl: default_pending_ttl(),
            event_buffer_size: default_event_buffer_size(),
            max_active_aggregates: None,
            max_pending_per_id: None,
        }
    }
}

impl StoreConfig {
    /// Override the pending-buffer TTL.
    pub fn with_pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = ttl;
        self
    }

    /// Cap the number of concurrently active aggregates.
    pub fn with_max_active_aggregates(mut self, cap: usize) -> Self {
        self.max_active_aggregates = Some(cap);
        self
    }

    /// Cap the number of buffered orphan updates per parent id.
    pub fn with_max_pending_per_id(mut self, cap: usize) -> Self {
        self.max_pending_per_id = Some(cap);
        self
    }
}

// Default value functions
fn default_pending_ttl() -> Duration { Duration::from_secs(30) }
fn default_event_buffer_size() -> usize { 256 }

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("CONFLUX").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("CONFLUX").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_config_defaults() {
        let cfg = StoreConfig::default();
        assert_eq!(cfg.pending_ttl, Duration::from_secs(30));
        assert_eq!(cfg.event_buffer_size, 256);
        assert!(cfg.max_active_aggregates.is_none());
        assert!(cfg.max_pending_per_id.is_none());
    }

    #[test]
    fn test_store_config_builders() {
        let cfg = StoreConfig::default()
            .with_pending_ttl(Duration::from_secs(5))
            .with_max_active_aggregates(64)
            .with_max_pending_per_id(8);
        assert_eq!(cfg.pending_ttl, Duration::from_secs(5));
        assert_eq!(cfg.max_active_aggregates, Some(64));
        assert_eq!(cfg.max_pending_per_id, Some(8));
    }

    #[test]
    fn test_pending_ttl_parses_humantime() {
        let cfg: StoreConfig = serde_json::from_value(serde_json::json!({
            "pending_ttl": "45s",
        }))
        .unwrap();
        assert_eq!(cfg.pending_ttl, Duration::from_secs(45));
    }
}
