//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration. File: ~/.config/nearby/config.toml or /etc/nearby/config.toml.
/// Env overrides: NEARBY_IDENTIFIER, NEARBY_RELAY_PORT, NEARBY_DISCOVERY_PORT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Application-level peer identifier (default: random UUID per run).
    #[serde(default = "default_identifier")]
    pub identifier: String,
    /// TCP port the relay hub listens on (default 45680).
    #[serde(default = "default_relay_port")]
    pub relay_port: u16,
    /// Discovery UDP port (default 45681).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How long an accepted socket may take to send its `connect` frame.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Relay-side dispatch worker tasks.
    #[serde(default = "default_dispatch_workers")]
    pub dispatch_workers: usize,
    /// Consecutive failed relay connections before the application is told.
    #[serde(default = "default_max_connect_failures")]
    pub max_connect_failures: u32,
}

fn default_identifier() -> String {
    uuid::Uuid::new_v4().to_string()
}
fn default_relay_port() -> u16 {
    45680
}
fn default_discovery_port() -> u16 {
    45681
}
fn default_connect_timeout_ms() -> u64 {
    1000
}
fn default_handshake_timeout_ms() -> u64 {
    5000
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_dispatch_workers() -> usize {
    4
}
fn default_max_connect_failures() -> u32 {
    nearby_core::group::DEFAULT_MAX_CONNECT_FAILURES
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identifier: default_identifier(),
            relay_port: default_relay_port(),
            discovery_port: default_discovery_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            dispatch_workers: default_dispatch_workers(),
            max_connect_failures: default_max_connect_failures(),
        }
    }
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("NEARBY_IDENTIFIER") {
        if !s.is_empty() {
            c.identifier = s;
        }
    }
    if let Some(s) = var("NEARBY_RELAY_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.relay_port = p;
        }
    }
    if let Some(s) = var("NEARBY_DISCOVERY_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.discovery_port = p;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/nearby/config.toml"));
    }
    out.push(PathBuf::from("/etc/nearby/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "ignoring invalid config file"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config file"),
            }
            break;
        }
    }
    None
}
