//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.
//! The YAML shape is `broadcast_core::GlobalConfig` plus a couple of
//! transport-level settings (`worker_count`) that the core itself has no
//! opinion about.

use std::path::Path;

use anyhow::{Context, Result};
use broadcast_core::GlobalConfig;
use serde::Deserialize;

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Streaming core configuration: mounts, queue limits, bandwidth caps.
    #[serde(flatten)]
    pub core: GlobalConfig,

    /// Number of cooperative scheduling threads to spawn.
    /// Override: `BROADCAST_WORKER_COUNT`
    pub worker_count: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            core: GlobalConfig::default(),
            worker_count: default_worker_count(),
        }
    }
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config
            .core
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("BROADCAST_BIND_PORT") {
            if let Ok(port) = val.parse() {
                self.core.port = port;
            }
        }

        if let Ok(val) = std::env::var("BROADCAST_HOSTNAME") {
            self.core.hostname = val;
        }

        if let Ok(val) = std::env::var("BROADCAST_WORKER_COUNT") {
            if let Ok(count) = val.parse() {
                self.worker_count = count;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ServerConfig::default();
        assert!(config.core.validate().is_ok());
        assert!(config.worker_count >= 1);
    }
}
