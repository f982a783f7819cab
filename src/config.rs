//! Configuration loading: TOML file, environment overrides, CLI overlay.
//!
//! Layering mirrors the teacher's `Config::load` → `apply_env_overrides`
//! pattern: CLI flags win over environment variables, which win over the
//! config file, which wins over built-in defaults.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default bind address, per spec.
pub const DEFAULT_ADDRESS: &str = "0.0.0.0";
/// Default bind port, per spec.
pub const DEFAULT_PORT: u16 = 6747;

#[derive(Debug, Clone, Deserialize)]
struct RawFile {
    #[serde(rename = "CoreMQ", default)]
    coremq: RawSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawSection {
    address: Option<String>,
    port: Option<u16>,
    cluster_nodes: Option<String>,
    allowed_replicants: Option<String>,
}

/// Fully-resolved configuration, after file + env + CLI layering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub address: String,
    pub port: u16,
    pub cluster_nodes: Vec<String>,
    pub allowed_replicants: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            cluster_nodes: Vec::new(),
            allowed_replicants: Vec::new(),
        }
    }
}

/// Split a comma-separated list into trimmed, non-empty entries.
fn comma_string_to_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl Config {
    /// Load configuration from `path` (if it exists), then apply
    /// `COREMQ_ADDRESS`/`COREMQ_PORT` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if `path` exists but cannot be read or parsed as
    /// TOML, or if `COREMQ_PORT` is set to a non-numeric value.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = Self::default();

        if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            let raw: RawFile = toml::from_str(&text)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?;

            if let Some(address) = raw.coremq.address {
                config.address = address;
            }
            if let Some(port) = raw.coremq.port {
                config.port = port;
            }
            if let Some(nodes) = raw.coremq.cluster_nodes {
                config.cluster_nodes = comma_string_to_list(&nodes);
            }
            if let Some(allowed) = raw.coremq.allowed_replicants {
                config.allowed_replicants = comma_string_to_list(&allowed);
            }
        }

        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(address) = std::env::var("COREMQ_ADDRESS") {
            self.address = address;
        }
        if let Ok(port) = std::env::var("COREMQ_PORT") {
            self.port = port
                .parse()
                .with_context(|| format!("COREMQ_PORT is not a valid port number: {port}"))?;
        }
        Ok(())
    }

    /// Apply CLI-flag overrides (highest priority).
    pub fn apply_cli_overrides(&mut self, address: Option<String>, port: Option<u16>) {
        if let Some(address) = address {
            self.address = address;
        }
        if let Some(port) = port {
            self.port = port;
        }
    }

    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let config = Config::default();
        assert_eq!(config.address, "0.0.0.0");
        assert_eq!(config.port, 6747);
        assert!(config.cluster_nodes.is_empty());
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coremq.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[CoreMQ]\naddress = \"10.0.0.1\"\nport = 7000\ncluster_nodes = \"node-a:6747, node-b\"\nallowed_replicants = \"trusted-host\""
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.address, "10.0.0.1");
        assert_eq!(config.port, 7000);
        assert_eq!(config.cluster_nodes, vec!["node-a:6747", "node-b"]);
        assert_eq!(config.allowed_replicants, vec!["trusted-host"]);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.toml");
        let config = Config::load(&path).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_cli_overrides_beat_everything() {
        let mut config = Config::default();
        config.address = "1.2.3.4".to_string();
        config.port = 9999;
        config.apply_cli_overrides(Some("5.6.7.8".to_string()), Some(1111));
        assert_eq!(config.address, "5.6.7.8");
        assert_eq!(config.port, 1111);
    }

    #[test]
    fn test_cli_overrides_are_optional() {
        let mut config = Config::default();
        config.port = 42;
        config.apply_cli_overrides(None, None);
        assert_eq!(config.port, 42);
    }
}
