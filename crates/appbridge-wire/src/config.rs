//! Configuration loading from `~/.appbridge/config.toml` with defaults.
//!
//! Connection settings resolve in a fixed order: explicit call parameter,
//! then environment variable, then the config file, then the built-in default.

use crate::message::{DEFAULT_PORT, DEFAULT_SCAN_WIDTH};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Connection host override.
pub const ENV_HOST: &str = "MCP_BRIDGE_HOST";
/// Connection port override.
pub const ENV_PORT: &str = "MCP_BRIDGE_PORT";
/// Remote-device host override (phones, emulators, other machines).
pub const ENV_REMOTE_HOST: &str = "TAURI_DEV_HOST";

/// Host used when nothing else is configured.
pub const DEFAULT_HOST: &str = "localhost";

/// Retry settings for the registration-race policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 2000,
        }
    }
}

/// Bridge configuration. File values sit below explicit parameters and
/// environment variables in resolution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub remote_host: Option<String>,
    pub scan_start_port: u16,
    pub scan_width: u16,
    pub connect_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub scan_concurrency: usize,
    pub query_timeout_ms: u64,
    pub interactive_timeout_ms: u64,
    pub retry: RetrySettings,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            remote_host: None,
            scan_start_port: DEFAULT_PORT,
            scan_width: DEFAULT_SCAN_WIDTH,
            connect_timeout_ms: 5000,
            probe_timeout_ms: 500,
            scan_concurrency: 16,
            query_timeout_ms: 10_000,
            interactive_timeout_ms: 30_000,
            retry: RetrySettings::default(),
        }
    }
}

/// Return the first candidate that is defined.
pub fn first_defined<T>(candidates: impl IntoIterator<Item = Option<T>>) -> Option<T> {
    candidates.into_iter().flatten().next()
}

fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl BridgeConfig {
    /// Connection host: explicit → `MCP_BRIDGE_HOST` → file → `localhost`.
    pub fn resolve_host(&self, explicit: Option<&str>) -> String {
        self.resolve_host_with(explicit, process_env)
    }

    /// Connection port: explicit → `MCP_BRIDGE_PORT` → file → 9223.
    pub fn resolve_port(&self, explicit: Option<u16>) -> u16 {
        self.resolve_port_with(explicit, process_env)
    }

    /// Remote-device host: explicit → `TAURI_DEV_HOST` → file → none.
    pub fn resolve_remote_host(&self, explicit: Option<&str>) -> Option<String> {
        self.resolve_remote_host_with(explicit, process_env)
    }

    pub fn resolve_host_with(
        &self,
        explicit: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> String {
        first_defined([
            explicit.map(str::to_string),
            env(ENV_HOST),
            self.host.clone(),
        ])
        .unwrap_or_else(|| DEFAULT_HOST.to_string())
    }

    pub fn resolve_port_with(
        &self,
        explicit: Option<u16>,
        env: impl Fn(&str) -> Option<String>,
    ) -> u16 {
        let from_env = env(ENV_PORT).and_then(|raw| match raw.trim().parse::<u16>() {
            Ok(port) => Some(port),
            Err(e) => {
                warn!(value = %raw, error = %e, "Ignoring unparsable {ENV_PORT}");
                None
            }
        });
        first_defined([explicit, from_env, self.port]).unwrap_or(DEFAULT_PORT)
    }

    pub fn resolve_remote_host_with(
        &self,
        explicit: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Option<String> {
        first_defined([
            explicit.map(str::to_string),
            env(ENV_REMOTE_HOST),
            self.remote_host.clone(),
        ])
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn interactive_timeout(&self) -> Duration {
        Duration::from_millis(self.interactive_timeout_ms)
    }
}

/// Default config file location: `~/.appbridge/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".appbridge")
        .join("config.toml")
}

/// Load configuration from a TOML file, with defaults.
///
/// A missing or malformed file is never fatal: it is logged and defaults are used.
pub fn load_config(path: Option<&Path>) -> BridgeConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return BridgeConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<BridgeConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                BridgeConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            BridgeConfig::default()
        }
    }
}
