//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration. File: ~/.config/huddle/config.toml or /etc/huddle/config.toml.
/// Env overrides: HUDDLE_SERVICE, HUDDLE_DEVICE_NAME, HUDDLE_DISCOVERY_PORT,
/// HUDDLE_TRANSPORT_PORT.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Service identifier advertised and browsed for (default "huddle").
    #[serde(default = "default_service")]
    pub service: String,
    /// Name other devices see; doubles as the peer identity.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Discovery UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Session TCP port (default 45681).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Seconds without a beacon before a peer is reported lost (default 12).
    #[serde(default = "default_peer_timeout_secs")]
    pub peer_timeout_secs: u64,
}

fn default_service() -> String {
    "huddle".to_owned()
}
fn default_device_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_owned())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "huddle-device".to_owned())
}
fn default_discovery_port() -> u16 {
    45680
}
fn default_transport_port() -> u16 {
    45681
}
fn default_peer_timeout_secs() -> u64 {
    12
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: default_service(),
            device_name: default_device_name(),
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            peer_timeout_secs: default_peer_timeout_secs(),
        }
    }
}

impl Config {
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs.max(1))
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("HUDDLE_SERVICE").filter(|s| !s.is_empty()) {
        c.service = s;
    }
    if let Some(s) = var("HUDDLE_DEVICE_NAME").filter(|s| !s.is_empty()) {
        c.device_name = s;
    }
    if let Some(s) = var("HUDDLE_DISCOVERY_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.discovery_port = p;
        }
    }
    if let Some(s) = var("HUDDLE_TRANSPORT_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.transport_port = p;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/huddle/config.toml"));
    }
    out.push(PathBuf::from("/etc/huddle/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "ignoring invalid config"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config"),
            }
            break;
        }
    }
    None
}
