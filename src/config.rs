use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use url::Url;

/// Default config file path.
pub const CONFIG_PATH: &str = "config.toml";

/// Top-level application config deserialized from `config.toml`. Every
/// section and field has a default, so a missing or partial file works.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub endpoints: EndpointsConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Backend endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointsConfig {
    /// Gateway REST base URL (catalog and snapshot backends).
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    /// Trade stream WebSocket URL.
    #[serde(default = "default_stream_url")]
    pub stream_url: String,
}

impl EndpointsConfig {
    pub fn markets_endpoint(&self) -> Result<Url> {
        self.gateway_base()?
            .join("/v1/markets")
            .context("failed to build markets endpoint")
    }

    pub fn snapshot_endpoint(&self) -> Result<Url> {
        self.gateway_base()?
            .join("/v1/snapshot")
            .context("failed to build snapshot endpoint")
    }

    pub fn stream_endpoint(&self) -> Result<Url> {
        let url = Url::parse(&self.stream_url)
            .with_context(|| format!("invalid stream url {}", self.stream_url))?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => bail!("stream url must use ws:// or wss:// (got {other}://)"),
        }
    }

    fn gateway_base(&self) -> Result<Url> {
        Url::parse(&self.gateway_url)
            .with_context(|| format!("invalid gateway url {}", self.gateway_url))
    }
}

/// Feed behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Events per catalog page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Snapshot polling interval in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Max trades kept in the ledger.
    #[serde(default = "default_ledger_capacity")]
    pub ledger_capacity: usize,
    /// Max trades kept in whale-only mode.
    #[serde(default = "default_whale_ledger_capacity")]
    pub whale_ledger_capacity: usize,
    /// Notional threshold (USD) above which a trade counts as a whale.
    #[serde(default = "default_whale_min_usd")]
    pub whale_min_usd: f64,
    /// Seconds without an inbound message before the feed reads as stale.
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_secs: u64,
}

impl FeedConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_threshold_secs)
    }
}

/// Reconnection policy for the trade stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Consecutive failed attempts before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay in milliseconds; doubles per attempt.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Retry delay ceiling in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Keepalive ping interval in seconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

fn default_gateway_url() -> String {
    crate::GATEWAY_BASE.to_string()
}

fn default_stream_url() -> String {
    crate::STREAM_WS_URL.to_string()
}

fn default_page_size() -> usize {
    50
}

fn default_poll_interval() -> u64 {
    2
}

fn default_ledger_capacity() -> usize {
    100
}

fn default_whale_ledger_capacity() -> usize {
    250
}

fn default_whale_min_usd() -> f64 {
    1000.0
}

fn default_stale_threshold() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    16_000
}

fn default_ping_interval() -> u64 {
    30
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            gateway_url: default_gateway_url(),
            stream_url: default_stream_url(),
        }
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            poll_interval_secs: default_poll_interval(),
            ledger_capacity: default_ledger_capacity(),
            whale_ledger_capacity: default_whale_ledger_capacity(),
            whale_min_usd: default_whale_min_usd(),
            stale_threshold_secs: default_stale_threshold(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            ping_interval_secs: default_ping_interval(),
        }
    }
}

impl AppConfig {
    /// Load config from the given TOML file path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Load config, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write config to the given TOML file path.
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.feed.page_size, 50);
        assert_eq!(config.feed.poll_interval_secs, 2);
        assert_eq!(config.feed.ledger_capacity, 100);
        assert_eq!(config.feed.whale_ledger_capacity, 250);
        assert_eq!(config.feed.stale_threshold_secs, 60);
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.reconnect.base_delay_ms, 1000);
        assert_eq!(config.reconnect.max_delay_ms, 16_000);
        assert_eq!(config.reconnect.ping_interval_secs, 30);
        assert_eq!(config.endpoints.gateway_url, crate::GATEWAY_BASE);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [feed]
            poll_interval_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.feed.poll_interval_secs, 5);
        assert_eq!(config.feed.page_size, 50);
        assert_eq!(config.reconnect.max_attempts, 5);
    }

    #[test]
    fn endpoints_join_gateway_paths() {
        let endpoints = EndpointsConfig::default();
        assert_eq!(
            endpoints.markets_endpoint().unwrap().as_str(),
            "https://gateway.polyterminal.app/v1/markets"
        );
        assert_eq!(
            endpoints.snapshot_endpoint().unwrap().as_str(),
            "https://gateway.polyterminal.app/v1/snapshot"
        );
    }

    #[test]
    fn stream_endpoint_rejects_http() {
        let endpoints = EndpointsConfig {
            stream_url: "https://stream.polyterminal.app/v1".to_string(),
            ..EndpointsConfig::default()
        };
        assert!(endpoints.stream_endpoint().is_err());
        assert!(EndpointsConfig::default().stream_endpoint().is_ok());
    }
}
