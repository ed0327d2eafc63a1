use anyhow::{Context, Result};
use serde::Deserialize;
use std::{env, fs, path::Path, time::Duration};

pub const DEFAULT_REST_URL: &str = "https://fapi.apollox.finance";
pub const DEFAULT_STREAM_URL: &str = "wss://fstream.apollox.finance/ws/";

/// Tuning for the local user data mirror.
#[derive(Debug, Clone, Deserialize)]
pub struct UserDataConfig {
    #[serde(default = "default_rest_url")]
    pub rest_url: String,
    #[serde(default = "default_stream_url")]
    pub stream_url: String,
    #[serde(default = "default_snapshot_refresh_secs")]
    pub snapshot_refresh_secs: u64,
    #[serde(default = "default_listen_key_renew_secs")]
    pub listen_key_renew_secs: u64,
    #[serde(default = "default_read_deadline_secs")]
    pub read_deadline_secs: u64,
    #[serde(default = "default_renew_failure_deadline_secs")]
    pub renew_failure_deadline_secs: u64,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_token_retry_delay_ms")]
    pub token_retry_delay_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
    #[serde(default = "default_trade_capacity")]
    pub trade_capacity: usize,
    #[serde(default = "default_error_capacity")]
    pub error_capacity: usize,
    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

fn default_rest_url() -> String {
    DEFAULT_REST_URL.to_string()
}

fn default_stream_url() -> String {
    DEFAULT_STREAM_URL.to_string()
}

fn default_snapshot_refresh_secs() -> u64 {
    60
}

fn default_listen_key_renew_secs() -> u64 {
    30 * 60
}

// renewal cadence plus a 10s grace window
fn default_read_deadline_secs() -> u64 {
    30 * 60 + 10
}

fn default_renew_failure_deadline_secs() -> u64 {
    1
}

fn default_stale_after_secs() -> u64 {
    60 * 60
}

fn default_token_retry_delay_ms() -> u64 {
    5_000
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}

fn default_startup_grace_ms() -> u64 {
    5_000
}

fn default_trade_capacity() -> usize {
    100
}

fn default_error_capacity() -> usize {
    5
}

fn default_recv_window_ms() -> u64 {
    5_000
}

fn default_http_timeout_secs() -> u64 {
    10
}

impl Default for UserDataConfig {
    fn default() -> Self {
        Self {
            rest_url: default_rest_url(),
            stream_url: default_stream_url(),
            snapshot_refresh_secs: default_snapshot_refresh_secs(),
            listen_key_renew_secs: default_listen_key_renew_secs(),
            read_deadline_secs: default_read_deadline_secs(),
            renew_failure_deadline_secs: default_renew_failure_deadline_secs(),
            stale_after_secs: default_stale_after_secs(),
            token_retry_delay_ms: default_token_retry_delay_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            startup_grace_ms: default_startup_grace_ms(),
            trade_capacity: default_trade_capacity(),
            error_capacity: default_error_capacity(),
            recv_window_ms: default_recv_window_ms(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl UserDataConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
        Self::from_toml_str(&data)
    }

    /// Accepts either a nested `[user_data]` table or top-level entries.
    pub fn from_toml_str(data: &str) -> Result<Self> {
        let raw: toml::Value = toml::from_str(data).with_context(|| "Failed to parse TOML config")?;
        let table = match raw.get("user_data").and_then(|v| v.as_table()) {
            Some(table) => toml::Value::Table(table.clone()),
            None => raw,
        };
        let mut cfg: UserDataConfig = table
            .try_into()
            .map_err(|err| anyhow::anyhow!("Invalid user_data config structure: {err}"))?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        // Each field can be overridden by `APX_*` env vars.
        override_string("APX_REST_URL", &mut self.rest_url);
        override_string("APX_STREAM_URL", &mut self.stream_url);
        override_u64("APX_SNAPSHOT_REFRESH_SECS", &mut self.snapshot_refresh_secs);
        override_u64("APX_LISTEN_KEY_RENEW_SECS", &mut self.listen_key_renew_secs);
        override_u64("APX_READ_DEADLINE_SECS", &mut self.read_deadline_secs);
        override_u64(
            "APX_RENEW_FAILURE_DEADLINE_SECS",
            &mut self.renew_failure_deadline_secs,
        );
        override_u64("APX_STALE_AFTER_SECS", &mut self.stale_after_secs);
        override_u64("APX_TOKEN_RETRY_DELAY_MS", &mut self.token_retry_delay_ms);
        override_u64("APX_RECONNECT_DELAY_MS", &mut self.reconnect_delay_ms);
        override_u64("APX_STARTUP_GRACE_MS", &mut self.startup_grace_ms);
        override_usize("APX_TRADE_CAPACITY", &mut self.trade_capacity);
        override_usize("APX_ERROR_CAPACITY", &mut self.error_capacity);
        override_u64("APX_RECV_WINDOW_MS", &mut self.recv_window_ms);
        override_u64("APX_HTTP_TIMEOUT_SECS", &mut self.http_timeout_secs);
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.rest_url.is_empty(), "rest_url must be set");
        anyhow::ensure!(!self.stream_url.is_empty(), "stream_url must be set");
        anyhow::ensure!(
            self.snapshot_refresh_secs > 0,
            "snapshot_refresh_secs must be positive"
        );
        anyhow::ensure!(
            self.listen_key_renew_secs > 0,
            "listen_key_renew_secs must be positive"
        );
        anyhow::ensure!(
            self.listen_key_renew_secs < self.read_deadline_secs,
            "listen_key_renew_secs must be shorter than read_deadline_secs"
        );
        anyhow::ensure!(
            self.renew_failure_deadline_secs < self.read_deadline_secs,
            "renew_failure_deadline_secs must be shorter than read_deadline_secs"
        );
        anyhow::ensure!(self.stale_after_secs > 0, "stale_after_secs must be positive");
        anyhow::ensure!(self.http_timeout_secs > 0, "http_timeout_secs must be positive");
        anyhow::ensure!(self.trade_capacity > 0, "trade_capacity must be positive");
        anyhow::ensure!(self.error_capacity > 0, "error_capacity must be positive");
        anyhow::ensure!(
            (1..=60_000).contains(&self.recv_window_ms),
            "recv_window_ms must be within [1, 60000]"
        );
        Ok(())
    }

    pub fn snapshot_refresh(&self) -> Duration {
        Duration::from_secs(self.snapshot_refresh_secs)
    }

    pub fn listen_key_renew(&self) -> Duration {
        Duration::from_secs(self.listen_key_renew_secs)
    }

    pub fn read_deadline(&self) -> Duration {
        Duration::from_secs(self.read_deadline_secs)
    }

    pub fn renew_failure_deadline(&self) -> Duration {
        Duration::from_secs(self.renew_failure_deadline_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn token_retry_delay(&self) -> Duration {
        Duration::from_millis(self.token_retry_delay_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

fn override_string(key: &str, target: &mut String) {
    if let Ok(value) = env::var(key) {
        let value = value.trim();
        if !value.is_empty() {
            *target = value.to_string();
        }
    }
}

fn override_u64(key: &str, target: &mut u64) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.trim().parse::<u64>() {
            *target = parsed;
        }
    }
}

fn override_usize(key: &str, target: &mut usize) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.trim().parse::<usize>() {
            *target = parsed;
        }
    }
}
