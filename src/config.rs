//! Configuration loading.
//!
//! Reads an optional JSON config file, then applies `SOCKMUX_*`
//! environment variable overrides. Every field has a default, so a
//! missing file or a partial file is fine.

use std::path::Path;
use std::time::Duration;
use std::{env, fs};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants;

/// Configuration for a [`crate::SocketManager`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// First id handed out to server-accepted connections.
    pub accept_id_seed: u32,
    /// Read buffer size per connected socket, in bytes.
    pub read_buffer_size: usize,
    /// Timeout in milliseconds for a single outbound connect.
    pub connect_timeout_ms: u64,
    /// Milliseconds a graceful close may spend flushing before the socket
    /// is destroyed. `0` destroys right away.
    pub close_timeout_ms: u64,
    /// Default `TCP_NODELAY` for new connections.
    pub no_delay: bool,
    /// Default `SO_KEEPALIVE` for outbound connections.
    pub keep_alive: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            accept_id_seed: constants::ACCEPT_ID_SEED,
            read_buffer_size: constants::READ_BUFFER_SIZE,
            connect_timeout_ms: constants::CONNECT_TIMEOUT_MS,
            close_timeout_ms: constants::CLOSE_TIMEOUT_MS,
            no_delay: false,
            keep_alive: false,
        }
    }
}

impl Config {
    /// Loads configuration from `path` (if given), with environment
    /// variable overrides applied on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Applies overrides looked up by full variable name (`SOCKMUX_*`).
    ///
    /// Values that don't parse are ignored and the current value is kept.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{name}", constants::ENV_PREFIX));

        if let Some(seed) = var("ACCEPT_ID_SEED").and_then(|v| v.parse().ok()) {
            self.accept_id_seed = seed;
        }
        if let Some(size) = var("READ_BUFFER_SIZE").and_then(|v| v.parse().ok()) {
            self.read_buffer_size = size;
        }
        if let Some(ms) = var("CONNECT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.connect_timeout_ms = ms;
        }
        if let Some(ms) = var("CLOSE_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.close_timeout_ms = ms;
        }
        if let Some(flag) = var("NO_DELAY").and_then(|v| parse_flag(&v)) {
            self.no_delay = flag;
        }
        if let Some(flag) = var("KEEP_ALIVE").and_then(|v| parse_flag(&v)) {
            self.keep_alive = flag;
        }
    }

    /// Rejects values the manager cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.read_buffer_size == 0 {
            anyhow::bail!("read_buffer_size must be greater than zero");
        }
        if self.connect_timeout_ms == 0 {
            anyhow::bail!("connect_timeout_ms must be greater than zero");
        }
        Ok(())
    }

    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Close timeout (linger) as a [`Duration`].
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.accept_id_seed, 5000);
        assert_eq!(config.read_buffer_size, 64 * 1024);
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.close_timeout(), Duration::from_secs(5));
        assert!(!config.no_delay);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides_applied() {
        let mut config = Config::default();
        config.apply_overrides(lookup_from(&[
            ("SOCKMUX_ACCEPT_ID_SEED", "10000"),
            ("SOCKMUX_READ_BUFFER_SIZE", "4096"),
            ("SOCKMUX_CONNECT_TIMEOUT_MS", "250"),
            ("SOCKMUX_CLOSE_TIMEOUT_MS", "0"),
            ("SOCKMUX_NO_DELAY", "yes"),
            ("SOCKMUX_KEEP_ALIVE", "1"),
        ]));

        assert_eq!(config.accept_id_seed, 10000);
        assert_eq!(config.read_buffer_size, 4096);
        assert_eq!(config.connect_timeout(), Duration::from_millis(250));
        assert_eq!(config.close_timeout(), Duration::ZERO);
        assert!(config.no_delay);
        assert!(config.keep_alive);
    }

    #[test]
    fn test_unparseable_override_ignored() {
        let mut config = Config::default();
        config.apply_overrides(lookup_from(&[
            ("SOCKMUX_ACCEPT_ID_SEED", "lots"),
            ("SOCKMUX_NO_DELAY", "maybe"),
        ]));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("sockmux.json");
        fs::write(&path, r#"{ "accept_id_seed": 7000 }"#).unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.accept_id_seed, 7000);
        assert_eq!(config.read_buffer_size, constants::READ_BUFFER_SIZE);
    }

    #[test]
    fn test_missing_file_is_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = Config::load_from_file(&tmp.path().join("nope.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let config = Config {
            read_buffer_size: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
