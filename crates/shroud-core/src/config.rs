//! Configuration resolution for Shroud.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config dir>/shroud/settings.json`)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables (`SHROUD_*`)
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! Files may be partial; they are merged key by key over the layers below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Path of the relay key document when `key_url` is not configured.
pub const DEFAULT_KEY_DOCUMENT_PATH: &str = "/public_key.pem";

/// Complete Shroud configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub tunnel: TunnelSettings,
    pub correlator: CorrelatorSettings,
    pub adapter: AdapterSettings,
    pub bridge: BridgeSettings,
    pub logging: LoggingSettings,
}

/// What happens to requests still pending when their session is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingPolicy {
    /// Fail them immediately with a transport-loss error.
    #[default]
    Fail,
    /// Leave them to their deadline.
    AwaitTimeout,
    /// Send them again, under fresh ids, once the next session is ready.
    Resubmit,
}

/// How the interception adapter answers when the tunnel cannot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// Synthesize an error response.
    #[default]
    Synthetic,
    /// Fetch the request directly, bypassing the tunnel.
    Passthrough,
}

/// Relay connection and session lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TunnelSettings {
    /// WebSocket URL of the relay (`ws://` or `wss://`).
    pub relay_url: String,
    /// URL of the relay's public key document; derived from `relay_url` when unset.
    pub key_url: Option<String>,
    /// Pinned key document on disk; takes precedence over `key_url`.
    pub key_path: Option<PathBuf>,
    pub handshake_timeout_ms: u64,
    /// Bounded wait for a ready session before a submission fails.
    pub ready_wait_ms: u64,
    pub reconnect: ReconnectSettings,
    pub pending_on_reconnect: PendingPolicy,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8080/tunnel".to_string(),
            key_url: None,
            key_path: None,
            handshake_timeout_ms: 10_000,
            ready_wait_ms: 10_000,
            reconnect: ReconnectSettings::default(),
            pending_on_reconnect: PendingPolicy::Fail,
        }
    }
}

impl TunnelSettings {
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub const fn ready_wait(&self) -> Duration {
        Duration::from_millis(self.ready_wait_ms)
    }

    /// The key document URL: explicit `key_url`, or the relay's origin over
    /// HTTP(S) with [`DEFAULT_KEY_DOCUMENT_PATH`].
    pub fn resolved_key_url(&self) -> Result<String> {
        if let Some(url) = &self.key_url {
            return Ok(url.clone());
        }
        let (scheme, rest) = self
            .relay_url
            .split_once("://")
            .ok_or_else(|| Error::Config(format!("relay_url has no scheme: {}", self.relay_url)))?;
        let http_scheme = match scheme {
            "ws" | "http" => "http",
            "wss" | "https" => "https",
            other => {
                return Err(Error::Config(format!(
                    "unsupported relay_url scheme: {other}"
                )));
            }
        };
        let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
        if authority.is_empty() {
            return Err(Error::Config(format!(
                "relay_url has no host: {}",
                self.relay_url
            )));
        }
        Ok(format!("{http_scheme}://{authority}{DEFAULT_KEY_DOCUMENT_PATH}"))
    }
}

/// Backoff between reconnect attempts. A multiplier of 1.0 gives a fixed delay.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

/// Pending-request bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CorrelatorSettings {
    /// Age after which a pending request fails with a timeout.
    pub deadline_ms: u64,
    /// How often overdue requests are swept.
    pub sweep_interval_ms: u64,
}

impl Default for CorrelatorSettings {
    fn default() -> Self {
        Self {
            deadline_ms: 15_000,
            sweep_interval_ms: 500,
        }
    }
}

impl CorrelatorSettings {
    pub const fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Interception scope and fallback behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AdapterSettings {
    /// Only paths starting with this prefix are tunneled.
    pub intercept_prefix: String,
    /// Path suffixes that are never tunneled.
    pub exclude_suffixes: Vec<String>,
    /// Upper bound on one intercepted request, fallback included.
    pub timeout_ms: u64,
    pub fallback: FallbackMode,
    /// Tail of `timeout_ms` held back for the direct fetch in passthrough
    /// mode; the tunnel gets the rest.
    pub passthrough_budget_ms: u64,
    /// Status of synthesized error responses.
    pub fallback_status: u16,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            intercept_prefix: "/apx/".to_string(),
            exclude_suffixes: vec!["/sw.js".to_string()],
            timeout_ms: 15_000,
            fallback: FallbackMode::Synthetic,
            passthrough_budget_ms: 5_000,
            fallback_status: 502,
        }
    }
}

impl AdapterSettings {
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub const fn passthrough_budget(&self) -> Duration {
        Duration::from_millis(self.passthrough_budget_ms)
    }
}

/// Local listener for interception contexts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BridgeSettings {
    pub listen_addr: String,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8787".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Reject settings that would make the tunnel misbehave.
    pub fn validate(&self) -> Result<()> {
        let url = &self.tunnel.relay_url;
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(Error::Config(format!(
                "relay_url must start with ws:// or wss://, got {url:?}"
            )));
        }
        self.tunnel.resolved_key_url()?;
        if self.correlator.deadline_ms == 0 {
            return Err(Error::Config("correlator.deadline_ms must be positive".into()));
        }
        if self.correlator.sweep_interval_ms == 0 {
            return Err(Error::Config(
                "correlator.sweep_interval_ms must be positive".into(),
            ));
        }
        if self.tunnel.reconnect.multiplier < 1.0 {
            return Err(Error::Config(
                "tunnel.reconnect.multiplier must be at least 1.0".into(),
            ));
        }
        if !self.adapter.intercept_prefix.starts_with('/') {
            return Err(Error::Config(format!(
                "adapter.intercept_prefix must start with '/', got {:?}",
                self.adapter.intercept_prefix
            )));
        }
        if self.adapter.timeout_ms == 0 {
            return Err(Error::Config("adapter.timeout_ms must be positive".into()));
        }
        if self.adapter.fallback == FallbackMode::Passthrough
            && self.adapter.passthrough_budget_ms >= self.adapter.timeout_ms
        {
            return Err(Error::Config(
                "adapter.passthrough_budget_ms must be below adapter.timeout_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        merge_json(&mut merged, read_config_value(&global_path)?);
    }

    if let Some(path) = explicit {
        merge_json(&mut merged, read_config_value(path)?);
    }

    let mut config: Config = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("shroud").join("settings.json"))
}

fn read_config_value(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Recursively overlay `overlay` onto `base`; objects merge, everything else replaces.
fn merge_json(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Apply `SHROUD_*` overrides; `lookup` abstracts the environment for tests.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("SHROUD_RELAY_URL") {
        config.tunnel.relay_url = val;
    }
    if let Some(val) = lookup("SHROUD_KEY_URL") {
        config.tunnel.key_url = Some(val);
    }
    if let Some(val) = lookup("SHROUD_KEY_PATH") {
        config.tunnel.key_path = Some(PathBuf::from(val));
    }
    if let Some(n) = lookup("SHROUD_REQUEST_DEADLINE_MS").and_then(|v| v.parse().ok()) {
        config.correlator.deadline_ms = n;
    }
    if let Some(n) = lookup("SHROUD_ADAPTER_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        config.adapter.timeout_ms = n;
    }
    if let Some(n) = lookup("SHROUD_PASSTHROUGH_BUDGET_MS").and_then(|v| v.parse().ok()) {
        config.adapter.passthrough_budget_ms = n;
    }
    match lookup("SHROUD_FALLBACK").as_deref() {
        Some("synthetic") => config.adapter.fallback = FallbackMode::Synthetic,
        Some("passthrough") => config.adapter.fallback = FallbackMode::Passthrough,
        Some(other) => tracing::warn!(value = other, "Ignoring unknown SHROUD_FALLBACK"),
        None => {}
    }
    match lookup("SHROUD_PENDING_ON_RECONNECT").as_deref() {
        Some("fail") => config.tunnel.pending_on_reconnect = PendingPolicy::Fail,
        Some("await_timeout") => config.tunnel.pending_on_reconnect = PendingPolicy::AwaitTimeout,
        Some("resubmit") => config.tunnel.pending_on_reconnect = PendingPolicy::Resubmit,
        Some(other) => tracing::warn!(value = other, "Ignoring unknown SHROUD_PENDING_ON_RECONNECT"),
        None => {}
    }
    if let Some(val) = lookup("SHROUD_LISTEN_ADDR") {
        config.bridge.listen_addr = val;
    }
    if let Some(val) = lookup("SHROUD_LOG_LEVEL") {
        config.logging.level = val;
    }
}
