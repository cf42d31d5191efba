//! Probe configuration
//!
//! Host applications construct a [`ProbeConfig`] directly or parse one from
//! a `debughub://host:port?token=...` settings URL. Defaults match what the
//! hub expects from an out-of-the-box probe.

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const SETTINGS_SCHEME: &str = "debughub";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Instrumentation hooks capture traffic without host involvement
    Automatic,
    /// The host feeds requests into the pipeline explicitly
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureScope {
    Http,
    Websocket,
    All,
}

impl CaptureScope {
    pub fn includes_http(&self) -> bool {
        matches!(self, CaptureScope::Http | CaptureScope::All)
    }

    pub fn includes_websocket(&self) -> bool {
        matches!(self, CaptureScope::Websocket | CaptureScope::All)
    }
}

/// Bridge-channel tuning
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub reconnect_interval: Duration,
    pub max_reconnect_interval: Duration,
    /// 0 means retry forever
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub recovery_batch_size: usize,
    pub recovery_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(3),
            max_reconnect_interval: Duration::from_secs(30),
            max_reconnect_attempts: 0,
            heartbeat_interval: Duration::from_secs(15),
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
            recovery_batch_size: 50,
            recovery_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeConfig {
    /// WebSocket endpoint of the debug hub, e.g. `ws://hub.local:9400`
    pub hub_url: String,
    pub token: String,
    pub enable_network_capture: bool,
    pub enable_log_capture: bool,
    pub max_buffer_size: usize,
    pub network_capture_mode: CaptureMode,
    pub network_capture_scope: CaptureScope,
    pub enable_persistence: bool,
    pub max_persistence_queue_size: usize,
    pub persistence_retention_days: u32,
    /// Directory the spill queue owns
    pub storage_path: PathBuf,
    pub bridge: BridgeConfig,
}

impl ProbeConfig {
    pub fn new(hub_url: &str, token: &str, storage_path: impl Into<PathBuf>) -> Self {
        Self {
            hub_url: hub_url.to_string(),
            token: token.to_string(),
            enable_network_capture: true,
            enable_log_capture: true,
            max_buffer_size: 10_000,
            network_capture_mode: CaptureMode::Automatic,
            network_capture_scope: CaptureScope::All,
            enable_persistence: true,
            max_persistence_queue_size: 100_000,
            persistence_retention_days: 3,
            storage_path: storage_path.into(),
            bridge: BridgeConfig::default(),
        }
    }

    pub fn persistence_retention(&self) -> Duration {
        Duration::from_secs(self.persistence_retention_days as u64 * 24 * 60 * 60)
    }

    /// Parse a `debughub://host:port?token=...` settings URL.
    pub fn from_settings_url(settings: &str, storage_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let url = Url::parse(settings).context("parsing settings url")?;
        if url.scheme() != SETTINGS_SCHEME {
            return Err(anyhow!(
                "settings url must use the {SETTINGS_SCHEME}:// scheme, got {}",
                url.scheme()
            ));
        }
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("settings url has no host"))?;
        let port = url
            .port()
            .ok_or_else(|| anyhow!("settings url has no port"))?;
        let token = url
            .query_pairs()
            .find(|(k, _)| k == "token")
            .map(|(_, v)| v.into_owned())
            .ok_or_else(|| anyhow!("settings url has no token parameter"))?;

        Ok(Self::new(&format!("ws://{host}:{port}"), &token, storage_path))
    }

    /// Format back into the settings URL. `from_settings_url` of the result
    /// reproduces the same hub endpoint and token.
    pub fn to_settings_url(&self) -> anyhow::Result<String> {
        let url = Url::parse(&self.hub_url).context("parsing hub url")?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("hub url has no host"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| anyhow!("hub url has no port"))?;
        Ok(format!(
            "{SETTINGS_SCHEME}://{host}:{port}?token={}",
            self.token
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = ProbeConfig::new("ws://hub.local:9400", "secret", "/tmp/probe");
        assert!(config.enable_network_capture);
        assert!(config.enable_log_capture);
        assert_eq!(config.max_buffer_size, 10_000);
        assert_eq!(config.network_capture_mode, CaptureMode::Automatic);
        assert_eq!(config.network_capture_scope, CaptureScope::All);
        assert!(config.enable_persistence);
        assert_eq!(config.max_persistence_queue_size, 100_000);
        assert_eq!(config.persistence_retention_days, 3);

        let bridge = config.bridge;
        assert_eq!(bridge.reconnect_interval, Duration::from_secs(3));
        assert_eq!(bridge.max_reconnect_interval, Duration::from_secs(30));
        assert_eq!(bridge.max_reconnect_attempts, 0);
        assert_eq!(bridge.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(bridge.batch_size, 100);
        assert_eq!(bridge.flush_interval, Duration::from_secs(1));
        assert_eq!(bridge.recovery_batch_size, 50);
        assert_eq!(bridge.recovery_interval, Duration::from_millis(500));
    }

    #[test]
    fn settings_url_round_trips() {
        let url = "debughub://hub.example.com:9400?token=s3cret";
        let config = ProbeConfig::from_settings_url(url, "/tmp/probe").expect("parses");
        assert_eq!(config.hub_url, "ws://hub.example.com:9400");
        assert_eq!(config.token, "s3cret");
        assert_eq!(config.to_settings_url().expect("formats"), url);
    }

    #[test]
    fn settings_url_rejects_other_schemes_and_missing_parts() {
        assert!(ProbeConfig::from_settings_url("https://hub:1?token=t", "/tmp").is_err());
        assert!(ProbeConfig::from_settings_url("debughub://hub:9400", "/tmp").is_err());
        assert!(ProbeConfig::from_settings_url("not a url", "/tmp").is_err());
    }

    #[test]
    fn capture_scope_gates() {
        assert!(CaptureScope::All.includes_http());
        assert!(CaptureScope::All.includes_websocket());
        assert!(CaptureScope::Http.includes_http());
        assert!(!CaptureScope::Http.includes_websocket());
        assert!(!CaptureScope::Websocket.includes_http());
    }
}
