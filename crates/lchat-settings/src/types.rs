use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Default hub endpoint of the development chat server.
pub const DEFAULT_HUB_URL: &str = "https://localhost:32768/Chat";

/// Connection and client settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatSettings {
    /// Hub endpoint (`http(s)://host:port/path`).
    pub hub_url: String,
    /// Delay before each automatic reconnect attempt, in milliseconds.
    /// Recovery stops once the list is exhausted.
    pub reconnect_delays_ms: Vec<u64>,
    /// Connect the WebSocket directly instead of negotiating first.
    pub skip_negotiation: bool,
    /// How long to wait for the hub's handshake response.
    pub handshake_timeout_ms: u64,
    /// Interval between client pings.
    pub keep_alive_interval_ms: u64,
    /// Silence from the server longer than this counts as a lost connection.
    pub server_timeout_ms: u64,
    /// Per-subscriber buffer of the message event stream.
    pub event_capacity: usize,
    /// Default log level (`RUST_LOG` still wins).
    pub log_level: String,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            hub_url: DEFAULT_HUB_URL.to_string(),
            reconnect_delays_ms: vec![0, 2_000, 10_000, 30_000],
            skip_negotiation: false,
            handshake_timeout_ms: 15_000,
            keep_alive_interval_ms: 15_000,
            server_timeout_ms: 30_000,
            event_capacity: 256,
            log_level: "info".to_string(),
        }
    }
}

impl ChatSettings {
    pub fn reconnect_delays(&self) -> Vec<Duration> {
        self.reconnect_delays_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_millis(self.server_timeout_ms)
    }

    /// Reject values no connection could work with.
    pub fn validate(&self) -> Result<()> {
        let url = self.hub_url.trim();
        if url.is_empty() {
            return Err(SettingsError::InvalidValue("hubUrl must not be empty".into()));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(SettingsError::InvalidValue(format!(
                "hubUrl must be http(s): {url}"
            )));
        }
        if self.keep_alive_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "keepAliveIntervalMs must be positive".into(),
            ));
        }
        if self.server_timeout_ms <= self.keep_alive_interval_ms {
            return Err(SettingsError::InvalidValue(
                "serverTimeoutMs must exceed keepAliveIntervalMs".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(SettingsError::InvalidValue("eventCapacity must be positive".into()));
        }
        Ok(())
    }
}
