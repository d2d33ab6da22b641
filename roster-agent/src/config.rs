use std::path::Path;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::types::Instance;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub registry: roster::Config,
    pub instance: Instance,
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// How often the membership summary is logged
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
    /// Storage the agent publishes its status entry to
    #[serde(default = "default_status_storage")]
    pub status_storage: String,
}

fn default_report_interval() -> u64 {
    30
}

fn default_status_storage() -> String {
    "agents".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: default_report_interval(),
            status_storage: default_status_storage(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse(
            r#"
            [registry]
            type = "memory"
            prefix = "/demo/"
            heartbeat_interval = 5

            [registry.storage]
            separator = "."

            [instance]
            service_name = "billing"
            host = "10.0.0.7"
            port = 9090

            [instance.meta]
            zone = "eu-1"
            weight = 10

            [agent]
            report_interval_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.registry.prefix, "/demo/");
        assert_eq!(config.registry.heartbeat_interval, 5);
        assert_eq!(config.registry.separator(), ".");
        assert_eq!(config.instance.service_name, "billing");
        assert_eq!(config.instance.port, 9090);
        assert_eq!(config.instance.meta["zone"], "eu-1");
        assert_eq!(config.instance.meta["weight"], 10);
        assert_eq!(config.agent.report_interval_secs, 5);
        assert_eq!(config.agent.status_storage, "agents");
    }

    #[test]
    fn test_instance_section_required() {
        assert!(Config::parse("[registry]\nprefix = \"/x/\"\n").is_err());
    }

    #[test]
    fn test_registry_section_defaults() {
        let config = Config::parse("[instance]\nservice_name = \"web\"\n").unwrap();
        let registry = config.registry.normalize();

        assert_eq!(registry.backend, roster::config::BACKEND_MEMORY);
        assert_eq!(registry.prefix, "/default-registry-service/");
        assert_eq!(config.agent.report_interval_secs, 30);
    }
}
