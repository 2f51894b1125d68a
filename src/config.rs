//! Daemon configuration loaded from TOML.
//!
//! Every section has defaults, so a partial file (or no file at all) is valid.

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "pumpwatch.toml";
pub const CONFIG_PATH_ENV: &str = "PUMPWATCH_CONFIG";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub feed: FeedSettings,
    pub scheduler: SchedulerSettings,
    pub oracle: OracleSettings,
    pub gateway: GatewaySettings,
    pub database: DatabaseSettings,
    pub price: PriceSettings,
    pub logging: LoggingSettings,
}

/// Market feed connection settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FeedSettings {
    /// WebSocket endpoint of the feed
    pub url: String,
    /// How often coalesced trades are published
    pub flush_interval_ms: u64,
    /// Fixed delay between reconnection attempts
    pub reconnect_delay_ms: u64,
    /// Size of the recent-creation dedup window
    pub recent_capacity: usize,
}

/// Admission and dispatch settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Admission threshold in USD with a short queue
    pub min_usd_market_cap: f64,
    /// Admission threshold in USD with a saturated queue
    pub max_usd_market_cap: f64,
    /// Queue length at which the threshold starts rising
    pub queue_threshold: usize,
    /// Sleep when there is nothing to dispatch
    pub idle_backoff_ms: u64,
    /// Pause after every completed analysis
    pub cooldown_ms: u64,
}

/// Oracle session settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OracleSettings {
    /// WebSocket endpoint of the oracle bridge
    pub bridge_url: String,
    /// How long a submission waits for the dispatch lock
    pub lock_timeout_ms: u64,
    /// Age after which a pending request is discarded
    pub stale_after_secs: u64,
    /// Delay before resubmitting a rate-limited request
    pub retry_delay_ms: u64,
    /// Minimum spacing between two outbound sends
    pub min_send_interval_ms: u64,
    /// Fixed delay between bridge reconnection attempts
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Unix socket path of the urgent-submission endpoint
    pub socket_path: String,
    pub read_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// sqlx connection string
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PriceSettings {
    pub endpoint: String,
    pub cache_ttl_secs: u64,
    /// Used when no price was ever fetched
    pub fallback_usd: f64,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter when RUST_LOG is unset
    pub level: String,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            url: "wss://pumpportal.fun/api/data".to_string(),
            flush_interval_ms: 3_000,
            reconnect_delay_ms: 2_000,
            recent_capacity: 100,
        }
    }
}

impl FeedSettings {
    /// Never zero: tokio intervals panic on a zero period.
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            min_usd_market_cap: 10_000.0,
            max_usd_market_cap: 20_000.0,
            queue_threshold: 10,
            idle_backoff_ms: 500,
            cooldown_ms: 8_000,
        }
    }
}

impl SchedulerSettings {
    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            bridge_url: "ws://127.0.0.1:8765/oracle".to_string(),
            lock_timeout_ms: 1_000,
            stale_after_secs: 120,
            retry_delay_ms: 2_000,
            min_send_interval_ms: 2_000,
            reconnect_delay_ms: 2_000,
        }
    }
}

impl OracleSettings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn min_send_interval(&self) -> Duration {
        Duration::from_millis(self.min_send_interval_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            socket_path: "/tmp/pumpwatch-urgent.sock".to_string(),
            read_timeout_ms: 5_000,
        }
    }
}

impl GatewaySettings {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            url: "sqlite:./pumpwatch.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

impl Default for PriceSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://api.coingecko.com/api/v3/simple/price?ids=solana&vs_currencies=usd"
                .to_string(),
            cache_ttl_secs: 300,
            fallback_usd: 200.0,
            request_timeout_secs: 10,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.feed.flush_interval_ms > 0,
            "feed.flush_interval_ms must be greater than zero"
        );
        ensure!(
            self.feed.recent_capacity > 0,
            "feed.recent_capacity must be greater than zero"
        );
        ensure!(
            self.scheduler.queue_threshold > 0,
            "scheduler.queue_threshold must be greater than zero"
        );
        ensure!(
            self.scheduler.max_usd_market_cap >= self.scheduler.min_usd_market_cap,
            "scheduler.max_usd_market_cap must not be below min_usd_market_cap"
        );
        Ok(())
    }

    /// Load from `path` if it exists, otherwise use the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            info!("No config file at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();

        assert_eq!(config.feed.flush_interval(), Duration::from_secs(3));
        assert_eq!(config.feed.reconnect_delay(), Duration::from_secs(2));
        assert_eq!(config.feed.recent_capacity, 100);
        assert_eq!(config.scheduler.min_usd_market_cap, 10_000.0);
        assert_eq!(config.scheduler.max_usd_market_cap, 20_000.0);
        assert_eq!(config.scheduler.queue_threshold, 10);
        assert_eq!(config.scheduler.cooldown(), Duration::from_secs(8));
        assert_eq!(config.oracle.stale_after(), Duration::from_secs(120));
        assert_eq!(config.oracle.retry_delay(), Duration::from_secs(2));
        assert_eq!(config.oracle.lock_timeout(), Duration::from_secs(1));
        assert_eq!(config.oracle.reconnect_delay(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [feed]
            flush_interval_ms = 1500

            [oracle]
            bridge_url = "ws://oracle.local/ws"

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.feed.flush_interval_ms, 1_500);
        assert_eq!(config.feed.reconnect_delay_ms, 2_000);
        assert_eq!(config.oracle.bridge_url, "ws://oracle.local/ws");
        assert_eq!(config.oracle.stale_after_secs, 120);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.gateway.read_timeout_ms, 5_000);
    }

    #[test]
    fn test_invalid_toml_is_error() {
        assert!(AppConfig::from_toml("[feed]\nflush_interval_ms = \"soon\"").is_err());
    }

    #[test]
    fn test_zero_flush_interval_rejected() {
        let err = AppConfig::from_toml("[feed]\nflush_interval_ms = 0").unwrap_err();
        assert!(err.to_string().contains("flush_interval_ms"));

        // Settings built in code still get a usable period
        let settings = FeedSettings {
            flush_interval_ms: 0,
            ..FeedSettings::default()
        };
        assert_eq!(settings.flush_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_inverted_market_cap_range_rejected() {
        let toml = "[scheduler]\nmin_usd_market_cap = 30000.0\nmax_usd_market_cap = 20000.0";
        assert!(AppConfig::from_toml(toml).is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = AppConfig::load_or_default("/nonexistent/pumpwatch.toml").unwrap();
        assert_eq!(config.database.max_connections, 5);
    }
}
