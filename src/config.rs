use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::DEFAULT_MAX_RETRIES;
use crate::sync::DEFAULT_BATCH_SIZE;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: String,
    /// Address of the local admin API; disabled when absent.
    pub admin_addr: Option<SocketAddr>,
    pub remote: RemoteConfig,
    pub sync: SyncSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
    /// Path probed by the connectivity monitor.
    pub health_path: String,
    pub health_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub batch_size: usize,
    pub max_retries: u32,
    pub reconnect_debounce_ms: u64,
    /// Periodic auto-sync; off when absent or zero.
    pub interval_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            admin_addr: None,
            remote: RemoteConfig::default(),
            sync: SyncSettings::default(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            request_timeout_ms: 10_000,
            health_path: "/health".to_string(),
            health_interval_ms: 5_000,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            reconnect_debounce_ms: 2_000,
            interval_secs: None,
        }
    }
}

impl Config {
    /// Loads a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.batch_size == 0 {
            return Err(ConfigError::Invalid("sync.batch_size must be at least 1".into()));
        }
        if self.sync.max_retries == 0 {
            return Err(ConfigError::Invalid("sync.max_retries must be at least 1".into()));
        }
        if !(self.remote.base_url.starts_with("http://")
            || self.remote.base_url.starts_with("https://"))
        {
            return Err(ConfigError::Invalid(format!(
                "remote.base_url must be an http(s) URL, got '{}'",
                self.remote.base_url
            )));
        }
        if self.remote.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "remote.request_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl RemoteConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms.max(1))
    }

    pub fn health_url(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.health_path.trim_start_matches('/')
        )
    }
}

impl SyncSettings {
    pub fn reconnect_debounce(&self) -> Duration {
        Duration::from_millis(self.reconnect_debounce_ms)
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval_secs
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn config_default_values_are_sensible() {
        let cfg = Config::default();
        assert_eq!(cfg.data_dir, "./data");
        assert!(cfg.admin_addr.is_none());
        assert_eq!(cfg.sync.batch_size, 5);
        assert_eq!(cfg.sync.max_retries, 3);
        assert_eq!(cfg.sync.reconnect_debounce(), Duration::from_secs(2));
        assert_eq!(cfg.sync.interval(), None);
        assert_eq!(cfg.remote.request_timeout(), Duration::from_secs(10));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"data_dir":"/var/lib/tally","remote":{{"base_url":"http://stock.local/"}},"sync":{{"interval_secs":60}}}}"#
        )
        .unwrap();

        let cfg = Config::from_file(file.path()).unwrap();
        assert_eq!(cfg.data_dir, "/var/lib/tally");
        assert_eq!(cfg.remote.health_url(), "http://stock.local/health");
        assert_eq!(cfg.remote.request_timeout_ms, 10_000);
        assert_eq!(cfg.sync.batch_size, 5);
        assert_eq!(cfg.sync.interval(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn validate_rejects_zero_batch_and_bad_url() {
        let mut cfg = Config::default();
        cfg.sync.batch_size = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));

        let mut cfg = Config::default();
        cfg.remote.base_url = "stock.local".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }
}
