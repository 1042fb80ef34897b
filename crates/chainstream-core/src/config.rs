//! Stream poller configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff applied to failed poll cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay after the first failure, in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Cap on the delay, in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Growth factor per consecutive failure
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_initial_backoff_ms() -> u64 { 100 }
fn default_max_backoff_ms() -> u64 { 30_000 }
fn default_multiplier() -> f64 { 2.0 }

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

/// Per-stream poller settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Delay between poll cycles while live
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Blocks per `eth_getLogs` page during catch-up
    #[serde(default = "default_catchup_page_size")]
    pub catchup_page_size: i64,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Whether to emit block-hash notices when the head advances
    #[serde(default = "bool_true")]
    pub block_notices: bool,
}

fn default_poll_interval_ms() -> u64 { 1_000 }
fn default_catchup_page_size() -> i64 { 500 }
fn bool_true() -> bool { true }

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            catchup_page_size: default_catchup_page_size(),
            retry: RetryConfig::default(),
            block_notices: true,
        }
    }
}

impl StreamConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Page size clamped to at least one block.
    pub fn page_size(&self) -> i64 {
        self.catchup_page_size.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_from_empty_json() {
        let cfg: StreamConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, StreamConfig::default());
        assert_eq!(cfg.poll_interval(), Duration::from_secs(1));
        assert_eq!(cfg.catchup_page_size, 500);
        assert!(cfg.block_notices);
        assert_eq!(cfg.retry.max_backoff_ms, 30_000);
    }

    #[test]
    fn partial_override() {
        let cfg: StreamConfig =
            serde_json::from_str(r#"{"poll_interval_ms": 50, "retry": {"initial_backoff_ms": 5}}"#)
                .unwrap();
        assert_eq!(cfg.poll_interval_ms, 50);
        assert_eq!(cfg.retry.initial_backoff_ms, 5);
        assert_eq!(cfg.retry.multiplier, 2.0);
    }

    #[test]
    fn page_size_never_zero() {
        let cfg = StreamConfig {
            catchup_page_size: 0,
            ..Default::default()
        };
        assert_eq!(cfg.page_size(), 1);
    }
}
