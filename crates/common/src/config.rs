//! Shared configuration for the daemon and the CLI

use crate::platform::WgQuick;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// Seconds between reconcile passes in the daemon
    pub reconcile_interval_secs: u64,

    /// Interface management
    pub wireguard: WireguardConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            store_path: crate::default_store_path(),
            reconcile_interval_secs: 30,
            wireguard: WireguardConfig::default(),
        }
    }
}

/// How the live interface is driven
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WireguardConfig {
    /// When false the registry only records state and never touches the host
    pub manage_interface: bool,

    /// Path to the `wg` binary
    pub wg_path: PathBuf,

    /// Path to the `wg-quick` binary
    pub wg_quick_path: PathBuf,

    /// Directory holding `<interface>.conf`
    pub config_dir: PathBuf,
}

impl Default for WireguardConfig {
    fn default() -> Self {
        Self {
            manage_interface: true,
            wg_path: PathBuf::from("wg"),
            wg_quick_path: PathBuf::from("wg-quick"),
            config_dir: PathBuf::from("/etc/wireguard"),
        }
    }
}

impl WireguardConfig {
    /// Driver for the configured tools
    pub fn driver(&self) -> WgQuick {
        WgQuick::new(&self.wg_path, &self.wg_quick_path, &self.config_dir)
    }
}

impl RegistryConfig {
    /// Load configuration from file, falling back to defaults when it is missing
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)
                .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
            config.check()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    fn check(&self) -> Result<()> {
        if self.reconcile_interval_secs == 0 {
            return Err(Error::InvalidConfig(
                "reconcile_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("state.db")
    }

    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        crate::default_store_path().join("config.toml")
    }
}
