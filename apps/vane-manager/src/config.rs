//! Manager configuration: a YAML file with typed sections, overridable from
//! the environment (`VANE_SERVER__PORT=9000` style).

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub docker: DockerConfig,
    #[serde(alias = "database")]
    pub registry: RegistryConfig,
    #[serde(alias = "controller_discovery")]
    pub discovery: DiscoveryConfig,
    pub metrics: MetricsConfig,
    pub health: HealthConfig,
    pub auth: AuthConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Config> {
        let raw = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("VANE").separator("__"))
            .build()
            .with_context(|| format!("error reading config file {}", path.display()))?;
        raw.try_deserialize()
            .with_context(|| format!("error parsing config file {}", path.display()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub debug_level: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            debug_level: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    pub network_name: String,
    pub container_prefix: String,
    pub memory_limit: String,
    pub cpu_limit: f64,
    /// Seconds; both the cleanup tick period and the idle-eviction threshold.
    pub cleanup_timeout: u64,
    pub environment: HashMap<String, String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            network_name: "vane-net".to_string(),
            container_prefix: "vane-".to_string(),
            memory_limit: "512m".to_string(),
            cpu_limit: 1.0,
            cleanup_timeout: 300,
            environment: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub path: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: "config/controllers.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMode {
    #[default]
    Manual,
    Startup,
    Periodic,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub mode: DiscoveryMode,
    pub interval_minutes: u64,
    pub auto_register: bool,
    pub remove_missing: bool,
    pub validation: ValidationConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            mode: DiscoveryMode::Manual,
            interval_minutes: 60,
            auto_register: true,
            remove_missing: false,
            validation: ValidationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub enabled: bool,
    pub verify_symbols: bool,
    pub test_call: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub path: String,
    pub collection_interval: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/metrics".to_string(),
            collection_interval: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval: u64,
    pub timeout: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: 30,
            timeout: 5,
        }
    }
}

/// Credentials for the admin surface; parsed and carried, consumed outside
/// the core.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Config {
        config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .expect("build")
            .try_deserialize()
            .expect("deserialize")
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let cfg = parse("server:\n  port: 9000\n");
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.host, "0.0.0.0");
        assert_eq!(cfg.docker.memory_limit, "512m");
        assert_eq!(cfg.docker.cleanup_timeout, 300);
        assert_eq!(cfg.discovery.mode, DiscoveryMode::Manual);
        assert!(!cfg.auth.enabled);
    }

    #[test]
    fn accepts_legacy_section_names() {
        let cfg = parse(
            "database:\n  path: /data/controllers.json\ncontroller_discovery:\n  mode: periodic\n  interval_minutes: 5\n",
        );
        assert_eq!(cfg.registry.path, "/data/controllers.json");
        assert_eq!(cfg.discovery.mode, DiscoveryMode::Periodic);
        assert_eq!(cfg.discovery.interval_minutes, 5);
    }

    #[test]
    fn parses_full_docker_section() {
        let cfg = parse(
            "docker:\n  network_name: ctrl-net\n  container_prefix: ctrl-\n  memory_limit: 1g\n  cpu_limit: 0.5\n  cleanup_timeout: 60\n  environment:\n    TZ: UTC\n",
        );
        assert_eq!(cfg.docker.network_name, "ctrl-net");
        assert_eq!(cfg.docker.cpu_limit, 0.5);
        assert_eq!(cfg.docker.environment.get("TZ").map(String::as_str), Some("UTC"));
    }
}
