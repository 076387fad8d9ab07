//! Configuration resolution for tunnelward.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/tunnelward/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the daemon)
//!
//! Files are merged key by key, so a layer only overrides what it mentions.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::relay::RelayServerInfo;
use crate::tunnel::TunnelConfig;

/// Complete tunnelward configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub binary: BinarySettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
    #[serde(default)]
    pub failover: FailoverSettings,
    #[serde(default)]
    pub daemon: DaemonSettings,
}

/// Where the bundled client binaries live.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BinarySettings {
    /// Directory holding `client_<os>_<arch>` executables. Defaults to the
    /// per-user data directory.
    pub dir: Option<PathBuf>,
    /// Verify binaries against the checksums in `manifest.json`.
    pub verify_checksum: bool,
}

/// Health probing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub interval_secs: u64,
    pub timeout_ms: u64,
    /// Successful probes slower than this are reported as degraded.
    pub degraded_latency_ms: u64,
    /// How long a running client may go without reporting a URL.
    pub url_timeout_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            timeout_ms: 5_000,
            degraded_latency_ms: 1_000,
            url_timeout_secs: 30,
        }
    }
}

/// Backoff strategy family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Exponential,
    Linear,
}

/// Reconnection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub strategy: BackoffKind,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Linear strategy increment.
    pub step_ms: u64,
    pub jitter_ms: u64,
    /// Failures tolerated against one relay before failing over.
    pub max_attempts: u32,
    /// How much a "server unreachable" failure counts toward `max_attempts`.
    pub unreachable_weight: u32,
    pub history_retention: usize,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            strategy: BackoffKind::Exponential,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            step_ms: 1_000,
            jitter_ms: 500,
            max_attempts: 5,
            unreachable_weight: 2,
            history_retention: 50,
        }
    }
}

/// Relay selection strategy family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionKind {
    #[default]
    BestScore,
    RoundRobin,
}

/// Relay failover settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FailoverSettings {
    pub strategy: SelectionKind,
    /// Candidate relays, in priority order.
    pub relays: Vec<RelayServerInfo>,
}

/// Daemon process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    pub log_level: String,
    pub log_json: bool,
    /// Seconds to wait for the client to exit after SIGTERM before killing it.
    pub terminate_timeout_secs: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
            terminate_timeout_secs: 5,
        }
    }
}

/// Load configuration with hierarchical resolution.
///
/// An explicitly requested file must exist; the global file is optional.
pub fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            merge_values(&mut merged, read_config_value(&global_path)?);
        }
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        merge_values(&mut merged, read_config_value(path)?);
    }

    let mut config: Config = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Load a single config file on top of the built-in defaults.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;
    merge_values(&mut merged, read_config_value(path)?);
    Ok(serde_json::from_value(merged)?)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".tunnelward").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/tunnelward/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("tunnelward").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn read_config_value(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Recursively overlay `overlay` onto `base`. Objects merge per key; any
/// other value (including arrays) replaces the base value.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply `TUNNELWARD_*` overrides using the given variable lookup.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("TUNNELWARD_BIN_DIR") {
        config.binary.dir = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("TUNNELWARD_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
    if let Some(val) = lookup("TUNNELWARD_SERVER_ADDR") {
        config.tunnel.server_addr = val;
    }
    if let Some(n) = lookup("TUNNELWARD_SERVER_PORT").and_then(|v| v.parse().ok()) {
        config.tunnel.server_port = n;
    }
    if let Some(val) = lookup("TUNNELWARD_PROXY_NAME") {
        config.tunnel.proxy_name = val;
    }
    if let Some(val) = lookup("TUNNELWARD_TOKEN") {
        config.tunnel.token = Some(val);
    }
    if let Some(n) = lookup("TUNNELWARD_MAX_ATTEMPTS").and_then(|v| v.parse().ok()) {
        config.reconnect.max_attempts = n;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::tunnel::Protocol;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.reconnect.base_delay_ms, 1_000);
        assert_eq!(config.reconnect.max_delay_ms, 30_000);
        assert_eq!(config.health.url_timeout_secs, 30);
        assert_eq!(config.daemon.terminate_timeout_secs, 5);
        assert!(config.failover.relays.is_empty());
    }

    #[test]
    fn file_overrides_only_mentioned_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{
                "tunnel": {"server_addr": "relay.example", "proxy_name": "p1", "protocol": "kcp"},
                "reconnect": {"max_attempts": 3},
                "failover": {"strategy": "round-robin", "relays": [
                    {"address": "a.example", "port": 7000, "region": "eu", "score": 2.5}
                ]}
            }"#,
        )
        .unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.tunnel.server_addr, "relay.example");
        assert_eq!(config.tunnel.protocol, Protocol::Kcp);
        assert_eq!(config.tunnel.server_port, 7000);
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.base_delay_ms, 1_000);
        assert_eq!(config.failover.strategy, SelectionKind::RoundRobin);
        assert_eq!(config.failover.relays.len(), 1);
        assert_eq!(config.failover.relays[0].region.as_deref(), Some("eu"));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("nope.json"))).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = load_config_file(&path).unwrap_err();
        assert!(err.to_string().contains("bad.json"));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("TUNNELWARD_SERVER_ADDR", "env.example"),
            ("TUNNELWARD_SERVER_PORT", "7443"),
            ("TUNNELWARD_MAX_ATTEMPTS", "not-a-number"),
            ("TUNNELWARD_TOKEN", "secret"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| vars.get(k).map(|v| (*v).to_string()));

        assert_eq!(config.tunnel.server_addr, "env.example");
        assert_eq!(config.tunnel.server_port, 7443);
        assert_eq!(config.tunnel.token.as_deref(), Some("secret"));
        assert_eq!(config.reconnect.max_attempts, 5);
    }

    #[test]
    fn merge_replaces_arrays() {
        let mut base = serde_json::json!({"a": {"b": 1, "c": [1, 2]}});
        merge_values(&mut base, serde_json::json!({"a": {"c": [3]}}));
        assert_eq!(base, serde_json::json!({"a": {"b": 1, "c": [3]}}));
    }
}
