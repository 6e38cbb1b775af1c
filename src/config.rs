//! Runtime settings.
//!
//! Loaded from YAML, every key optional, then overridden from `BOL_*`
//! environment variables:
//!
//! - `BOL_CACHE_TTL_SECS` (default 300)
//! - `BOL_LEDGER_TIMEOUT_MS` (default 5000)
//! - `BOL_BATCH_MAX_ITEMS` (default 50)
//! - `BOL_BATCH_ITEM_TIMEOUT_MS` (default 10000)
//! - `BOL_OUTBOX_BATCH_SIZE` (default 100)
//! - `BOL_OUTBOX_MAX_ATTEMPTS` (default 10)
//! - `BOL_OUTBOX_POLL_INTERVAL_MS` (default 500)
//! - `BOL_RECONCILE_INTERVAL_SECS` (default 60)
//! - `BOL_LOG_LEVEL` or `RUST_LOG` (default info)
//! - `BOL_JSON_LOGS` (default false)
//! - `BOL_DATA_DIR` (default none, in-memory stores)
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::outbox::OutboxSettings;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("environment variable {name}={value:?} is not valid")]
    Env { name: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub cache_ttl_secs: u64,
    pub ledger_timeout_ms: u64,
    pub batch_max_items: usize,
    pub batch_item_timeout_ms: u64,
    pub outbox_batch_size: usize,
    pub outbox_max_attempts: u32,
    pub outbox_poll_interval_ms: u64,
    pub reconcile_interval_secs: u64,
    pub log_level: String,
    pub json_logs: bool,
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            ledger_timeout_ms: 5_000,
            batch_max_items: 50,
            batch_item_timeout_ms: 10_000,
            outbox_batch_size: 100,
            outbox_max_attempts: 10,
            outbox_poll_interval_ms: 500,
            reconcile_interval_secs: 60,
            log_level: "info".to_string(),
            json_logs: false,
            data_dir: None,
        }
    }
}

fn parsed<T: std::str::FromStr>(name: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { name, value })
}

fn flag(name: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::Env { name, value }),
    }
}

impl Config {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Defaults, or the file named by `BOL_CONFIG`, then environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base = match std::env::var("BOL_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        base.with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply `BOL_*` overrides read through `lookup`.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(v) = lookup("BOL_CACHE_TTL_SECS") {
            self.cache_ttl_secs = parsed("BOL_CACHE_TTL_SECS", v)?;
        }
        if let Some(v) = lookup("BOL_LEDGER_TIMEOUT_MS") {
            self.ledger_timeout_ms = parsed("BOL_LEDGER_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("BOL_BATCH_MAX_ITEMS") {
            self.batch_max_items = parsed("BOL_BATCH_MAX_ITEMS", v)?;
        }
        if let Some(v) = lookup("BOL_BATCH_ITEM_TIMEOUT_MS") {
            self.batch_item_timeout_ms = parsed("BOL_BATCH_ITEM_TIMEOUT_MS", v)?;
        }
        if let Some(v) = lookup("BOL_OUTBOX_BATCH_SIZE") {
            self.outbox_batch_size = parsed("BOL_OUTBOX_BATCH_SIZE", v)?;
        }
        if let Some(v) = lookup("BOL_OUTBOX_MAX_ATTEMPTS") {
            self.outbox_max_attempts = parsed("BOL_OUTBOX_MAX_ATTEMPTS", v)?;
        }
        if let Some(v) = lookup("BOL_OUTBOX_POLL_INTERVAL_MS") {
            self.outbox_poll_interval_ms = parsed("BOL_OUTBOX_POLL_INTERVAL_MS", v)?;
        }
        if let Some(v) = lookup("BOL_RECONCILE_INTERVAL_SECS") {
            self.reconcile_interval_secs = parsed("BOL_RECONCILE_INTERVAL_SECS", v)?;
        }
        if let Some(v) = lookup("BOL_LOG_LEVEL").or_else(|| lookup("RUST_LOG")) {
            self.log_level = v;
        }
        if let Some(v) = lookup("BOL_JSON_LOGS") {
            self.json_logs = flag("BOL_JSON_LOGS", v)?;
        }
        if let Some(v) = lookup("BOL_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(v));
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("ledger_timeout_ms", self.ledger_timeout_ms),
            ("batch_max_items", self.batch_max_items as u64),
            ("batch_item_timeout_ms", self.batch_item_timeout_ms),
            ("outbox_batch_size", self.outbox_batch_size as u64),
            ("outbox_max_attempts", u64::from(self.outbox_max_attempts)),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn ledger_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger_timeout_ms)
    }

    pub fn batch_item_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_item_timeout_ms)
    }

    pub fn outbox(&self) -> OutboxSettings {
        OutboxSettings {
            batch_size: self.outbox_batch_size,
            max_attempts: self.outbox_max_attempts,
            poll_interval: Duration::from_millis(self.outbox_poll_interval_ms),
            reconcile_interval: Duration::from_secs(self.reconcile_interval_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_yaml_is_all_defaults() {
        assert_eq!(Config::from_yaml_str("{}").unwrap(), Config::default());
        assert_eq!(Config::default().cache_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn yaml_overrides_some_keys() {
        let config = Config::from_yaml_str("batch_max_items: 5\njson_logs: true\n").unwrap();
        assert_eq!(config.batch_max_items, 5);
        assert!(config.json_logs);
        assert_eq!(config.ledger_timeout_ms, 5_000);
    }

    #[test]
    fn unknown_keys_are_refused() {
        assert!(matches!(
            Config::from_yaml_str("cache_tll_secs: 10\n"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn environment_wins_over_file() {
        let env = HashMap::from([
            ("BOL_CACHE_TTL_SECS", "30"),
            ("BOL_JSON_LOGS", "yes"),
            ("RUST_LOG", "debug"),
        ]);
        let config = Config::from_yaml_str("cache_ttl_secs: 600\n")
            .unwrap()
            .with_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.cache_ttl_secs, 30);
        assert!(config.json_logs);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn bad_environment_values_are_reported() {
        let err = Config::default()
            .with_overrides(|name| (name == "BOL_BATCH_MAX_ITEMS").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { name: "BOL_BATCH_MAX_ITEMS", .. }));

        let err = Config::default()
            .with_overrides(|name| (name == "BOL_BATCH_MAX_ITEMS").then(|| "0".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Zero("batch_max_items")));
    }
}
