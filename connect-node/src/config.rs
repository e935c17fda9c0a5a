//! Load config from file and environment.

use std::path::PathBuf;
use std::time::Duration;

use connect_core::chunk::{effective_chunk_size, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use connect_core::config::{
    DEFAULT_MAX_RETRIES, DEFAULT_RECONNECT_GRACE_TICKS, DEFAULT_REQUEST_TIMEOUT_TICKS,
};
use connect_core::ConnectConfig;
use serde::Deserialize;
use tracing::warn;

/// Daemon configuration. File: ~/.config/connect/config.toml or /etc/connect/config.toml.
/// Env overrides: CONNECT_LISTEN_PORT, CONNECT_CHUNK_SIZE, CONNECT_TICK_MILLIS,
/// CONNECT_REQUEST_TIMEOUT_TICKS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Responder listen port (default 47600).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Bytes per transfer chunk; capped at `MAX_CHUNK_SIZE` so a chunk fits one frame.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Wall-clock length of one protocol tick.
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
    #[serde(default = "default_request_timeout_ticks")]
    pub request_timeout_ticks: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_reconnect_grace_ticks")]
    pub reconnect_grace_ticks: u64,
    /// Name announced in `hello` when pushing.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Where the listener keeps its pairing key. Unset: a fresh key per run.
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

fn default_listen_port() -> u16 {
    47600
}
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_tick_millis() -> u64 {
    1000
}
fn default_request_timeout_ticks() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_TICKS
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_reconnect_grace_ticks() -> u64 {
    DEFAULT_RECONNECT_GRACE_TICKS
}
fn default_device_name() -> String {
    "connect-node".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            chunk_size: default_chunk_size(),
            tick_millis: default_tick_millis(),
            request_timeout_ticks: default_request_timeout_ticks(),
            max_retries: default_max_retries(),
            reconnect_grace_ticks: default_reconnect_grace_ticks(),
            device_name: default_device_name(),
            key_file: None,
        }
    }
}

impl Config {
    /// Session tunables handed to the core.
    pub fn connect_config(&self) -> ConnectConfig {
        ConnectConfig {
            chunk_size: effective_chunk_size(self.chunk_size),
            request_timeout_ticks: self.request_timeout_ticks,
            max_retries: self.max_retries,
            reconnect_grace_ticks: self.reconnect_grace_ticks,
            ..ConnectConfig::default()
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis.max(1))
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    cap_chunk_size(&mut c);
    c
}

fn cap_chunk_size(c: &mut Config) {
    let capped = effective_chunk_size(c.chunk_size);
    if capped != c.chunk_size {
        warn!(
            chunk_size = c.chunk_size,
            max = MAX_CHUNK_SIZE,
            using = capped,
            "chunk_size out of range"
        );
        c.chunk_size = capped;
    }
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(p) = parse_var(&var, "CONNECT_LISTEN_PORT") {
        c.listen_port = p;
    }
    if let Some(n) = parse_var::<usize>(&var, "CONNECT_CHUNK_SIZE") {
        if n == 0 {
            warn!("ignoring CONNECT_CHUNK_SIZE=0");
        } else {
            c.chunk_size = n;
        }
    }
    if let Some(ms) = parse_var(&var, "CONNECT_TICK_MILLIS") {
        c.tick_millis = ms;
    }
    if let Some(t) = parse_var(&var, "CONNECT_REQUEST_TIMEOUT_TICKS") {
        c.request_timeout_ticks = t;
    }
}

fn parse_var<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let s = var(key)?;
    match s.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %s, "ignoring unparsable override");
            None
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/connect/config.toml"));
    }
    out.push(PathBuf::from("/etc/connect/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => warn!(path = %p.display(), error = %e, "invalid config file"),
                },
                Err(e) => warn!(path = %p.display(), error = %e, "unreadable config file"),
            }
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn file_fields_override_defaults() {
        let c: Config = toml::from_str("listen_port = 9000\nchunk_size = 1024\n").unwrap();
        assert_eq!(c.listen_port, 9000);
        assert_eq!(c.chunk_size, 1024);
        assert_eq!(c.tick_millis, 1000);
        assert_eq!(c.request_timeout_ticks, DEFAULT_REQUEST_TIMEOUT_TICKS);
        assert!(c.key_file.is_none());
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128\n").is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("CONNECT_LISTEN_PORT", "47999"),
            ("CONNECT_TICK_MILLIS", "250"),
            ("CONNECT_REQUEST_TIMEOUT_TICKS", "12"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(c.listen_port, 47999);
        assert_eq!(c.tick(), Duration::from_millis(250));
        assert_eq!(c.connect_config().request_timeout_ticks, 12);
    }

    #[test]
    fn bad_env_values_ignored() {
        let mut c = Config::default();
        apply_env(&mut c, |k| match k {
            "CONNECT_LISTEN_PORT" => Some("not-a-port".into()),
            "CONNECT_CHUNK_SIZE" => Some("0".into()),
            _ => None,
        });
        assert_eq!(c.listen_port, 47600);
        assert_eq!(c.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn oversized_chunk_size_is_capped() {
        let mut c = Config::default();
        apply_env(&mut c, |k| match k {
            "CONNECT_CHUNK_SIZE" => Some((64 * 1024 * 1024).to_string()),
            _ => None,
        });
        assert_eq!(c.connect_config().chunk_size, MAX_CHUNK_SIZE);
        cap_chunk_size(&mut c);
        assert_eq!(c.chunk_size, MAX_CHUNK_SIZE);

        let mut c: Config = toml::from_str("chunk_size = 0\n").unwrap();
        cap_chunk_size(&mut c);
        assert_eq!(c.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn connect_config_carries_tunables() {
        let c = Config {
            chunk_size: 64,
            max_retries: 3,
            reconnect_grace_ticks: 5,
            ..Config::default()
        };
        let cc = c.connect_config();
        assert_eq!(cc.chunk_size, 64);
        assert_eq!(cc.max_retries, 3);
        assert_eq!(cc.reconnect_grace_ticks, 5);
        assert_eq!(cc.idle_timeout_ticks, ConnectConfig::default().idle_timeout_ticks);
    }
}
