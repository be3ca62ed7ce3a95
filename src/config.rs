//! Broker configuration.
//!
//! Settings are read from a per-user config file. Environment variables
//! override any stored values to allow managed deployments to pin behaviour.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const TEMP_DIR_NAME: &str = "qoredb-broker-sqlite";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Directory holding staged SQLite copies. Defaults to the system temp dir.
    pub temp_dir: Option<PathBuf>,
    /// Remove the local copy even when the upload back to the remote host failed.
    pub delete_local_on_failed_upload: bool,
    pub connect_timeout_ms: u64,
    pub transfer_timeout_ms: u64,
    pub command_timeout_ms: u64,
}

fn env_bool_opt(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64_opt(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
}

/// Per-user broker directory (`~/.qoredb-broker`, or `%APPDATA%\QoreDB Broker`).
pub fn broker_home() -> Option<PathBuf> {
    if cfg!(windows) {
        let appdata = std::env::var_os("APPDATA").or_else(|| std::env::var_os("USERPROFILE"))?;
        let mut path = PathBuf::from(appdata);
        path.push("QoreDB Broker");
        Some(path)
    } else {
        let home = std::env::var_os("HOME")?;
        let mut path = PathBuf::from(home);
        path.push(".qoredb-broker");
        Some(path)
    }
}

fn config_path() -> PathBuf {
    broker_home()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("config.json")
}

fn load_from_file(path: &Path) -> Option<BrokerConfig> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

impl BrokerConfig {
    fn defaults() -> Self {
        Self {
            temp_dir: None,
            delete_local_on_failed_upload: true,
            connect_timeout_ms: 15_000,
            transfer_timeout_ms: 120_000,
            command_timeout_ms: 60_000,
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Some(value) = std::env::var_os("QOREDB_BROKER_TEMP_DIR") {
            self.temp_dir = Some(PathBuf::from(value));
        }
        if let Some(value) = env_bool_opt("QOREDB_BROKER_DELETE_ON_FAILED_UPLOAD") {
            self.delete_local_on_failed_upload = value;
        }
        if let Some(value) = env_u64_opt("QOREDB_BROKER_CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = value;
        }
        if let Some(value) = env_u64_opt("QOREDB_BROKER_TRANSFER_TIMEOUT_MS") {
            self.transfer_timeout_ms = value;
        }
        if let Some(value) = env_u64_opt("QOREDB_BROKER_COMMAND_TIMEOUT_MS") {
            self.command_timeout_ms = value;
        }
    }

    pub fn load() -> Self {
        Self::load_from(&config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        let mut config = load_from_file(path).unwrap_or_else(Self::defaults);
        config.apply_env_overrides();
        config
    }

    /// Staging directory, resolved against the system temp dir when unset.
    pub fn staging_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(TEMP_DIR_NAME))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_from_file(&dir.path().join("absent.json"));
        assert!(config.is_none());

        let defaults = BrokerConfig::default();
        assert!(defaults.delete_local_on_failed_upload);
        assert_eq!(defaults.connect_timeout(), Duration::from_secs(15));
        assert_eq!(defaults.transfer_timeout(), Duration::from_secs(120));
        assert!(defaults.staging_dir().ends_with(TEMP_DIR_NAME));
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"delete_local_on_failed_upload": false, "command_timeout_ms": 500}"#,
        )
        .unwrap();

        let config = load_from_file(&path).unwrap();
        assert!(!config.delete_local_on_failed_upload);
        assert_eq!(config.command_timeout_ms, 500);
        assert_eq!(config.connect_timeout_ms, 15_000);
    }

    #[test]
    fn full_file_is_loaded_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = BrokerConfig {
            temp_dir: Some(dir.path().join("staging")),
            transfer_timeout_ms: 5_000,
            ..BrokerConfig::default()
        };

        fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();
        assert_eq!(load_from_file(&path), Some(config));
    }

    #[test]
    fn env_parsers_accept_common_spellings() {
        std::env::set_var("QOREDB_BROKER_TEST_BOOL", " Yes ");
        std::env::set_var("QOREDB_BROKER_TEST_NUM", "250");
        std::env::set_var("QOREDB_BROKER_TEST_BAD", "soon");

        assert_eq!(env_bool_opt("QOREDB_BROKER_TEST_BOOL"), Some(true));
        assert_eq!(env_u64_opt("QOREDB_BROKER_TEST_NUM"), Some(250));
        assert_eq!(env_u64_opt("QOREDB_BROKER_TEST_BAD"), None);
        assert_eq!(env_bool_opt("QOREDB_BROKER_TEST_UNSET"), None);
    }
}
