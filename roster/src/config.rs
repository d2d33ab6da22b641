use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use shared::protocol::{
    DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_PREFIX, DEFAULT_SEPARATOR, PREFIX_DELIMITER,
    REGISTRY_NAMESPACE, STORAGE_NAMESPACE,
};
use crate::error::{Error, Result};

/// In-process backend; the only `type` currently supported
pub const BACKEND_MEMORY: &str = "memory";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend selector
    #[serde(rename = "type")]
    pub backend: String,
    /// Root namespace, starts and ends with "/"
    pub prefix: String,
    /// Lease duration and renewal period in seconds
    pub heartbeat_interval: u64,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub separator: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BACKEND_MEMORY.to_string(),
            prefix: String::new(),
            heartbeat_interval: 0,
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;

        toml::from_str(&contents).map_err(|source| Error::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse configuration from TOML text
    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|source| Error::ConfigParse {
            path: PathBuf::from("<inline>"),
            source,
        })
    }

    /// Fill defaults for empty fields and make the prefix delimited on both ends
    pub fn normalize(mut self) -> Self {
        if self.prefix.is_empty() {
            self.prefix = DEFAULT_PREFIX.to_string();
        }
        if !self.prefix.starts_with(PREFIX_DELIMITER) {
            self.prefix.insert_str(0, PREFIX_DELIMITER);
        }
        if !self.prefix.ends_with(PREFIX_DELIMITER) {
            self.prefix.push_str(PREFIX_DELIMITER);
        }
        if self.heartbeat_interval == 0 {
            self.heartbeat_interval = DEFAULT_HEARTBEAT_INTERVAL_SECS;
        }
        if self.storage.separator.is_empty() {
            self.storage.separator = DEFAULT_SEPARATOR.to_string();
        }
        self
    }

    pub fn registry_prefix(&self) -> String {
        format!("{}{}", self.prefix, REGISTRY_NAMESPACE)
    }

    pub fn storage_prefix(&self) -> String {
        format!("{}{}", self.prefix, STORAGE_NAMESPACE)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    pub fn separator(&self) -> &str {
        &self.storage.separator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_fills_defaults() {
        let config = Config::default().normalize();

        assert_eq!(config.backend, BACKEND_MEMORY);
        assert_eq!(config.prefix, DEFAULT_PREFIX);
        assert_eq!(config.heartbeat(), Duration::from_secs(3));
        assert_eq!(config.separator(), "/");
        assert_eq!(config.registry_prefix(), "/default-registry-service/registry/");
        assert_eq!(config.storage_prefix(), "/default-registry-service/storage/");
    }

    #[test]
    fn test_normalize_delimits_prefix() {
        let config = Config {
            prefix: "apps".to_string(),
            ..Config::default()
        }
        .normalize();

        assert_eq!(config.prefix, "/apps/");
    }

    #[test]
    fn test_parse_toml() {
        let config = Config::parse(
            r#"
            type = "memory"
            prefix = "/test-registry/"
            heartbeat_interval = 10

            [storage]
            separator = "."
            "#,
        )
        .unwrap()
        .normalize();

        assert_eq!(config.prefix, "/test-registry/");
        assert_eq!(config.heartbeat_interval, 10);
        assert_eq!(config.separator(), ".");
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.backend, BACKEND_MEMORY);
        assert!(config.prefix.is_empty());
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/roster.toml").unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }));
    }
}
