//! Registry access for commands
//!
//! The CLI works on the store directly; the daemon picks up whatever the CLI
//! changed on its next reconcile pass.

use anyhow::{bail, Context as _, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;
use wgreg_common::{
    Controller, Database, Device, Registry, RegistryConfig, Store, User, WgQuick,
};

/// Configuration plus an open registry
pub struct Context {
    pub config: RegistryConfig,
    pub registry: Registry,
    store: Arc<dyn Store>,
}

impl Context {
    /// Load configuration and open the store
    pub fn open(config_path: Option<PathBuf>, store_path: Option<PathBuf>) -> Result<Self> {
        let config_path = config_path.unwrap_or_else(RegistryConfig::default_path);
        let mut config = RegistryConfig::load(&config_path)
            .with_context(|| format!("loading {}", config_path.display()))?;
        if let Some(store_path) = store_path {
            config.store_path = store_path;
        }

        debug!("Using config {} and store {}", config_path.display(), config.store_path.display());

        let db = Database::open(config.db_path())
            .with_context(|| format!("opening {}", config.db_path().display()))?;
        let store: Arc<dyn Store> = Arc::new(db);

        Ok(Self {
            registry: Registry::new(store.clone()),
            config,
            store,
        })
    }

    pub fn driver(&self) -> WgQuick {
        self.config.wireguard.driver()
    }

    /// Controller for a one-shot apply. Refuses when interface management is off.
    pub fn controller(&self) -> Result<Controller> {
        if !self.config.wireguard.manage_interface {
            bail!("interface management is disabled (wireguard.manage_interface = false)");
        }
        Ok(Controller::new(self.store.clone(), Arc::new(self.driver())))
    }

    /// Find a user by id or email
    pub fn resolve_user(&self, reference: &str) -> Result<User> {
        let user = match Uuid::parse_str(reference) {
            Ok(id) => self.registry.user(id)?,
            Err(_) => self.registry.user_by_email(reference)?,
        };
        Ok(user)
    }

    /// Find a device by id, or by name when the name is unambiguous
    pub fn resolve_device(&self, reference: &str) -> Result<Device> {
        if let Ok(id) = Uuid::parse_str(reference) {
            return Ok(self.registry.device(id)?);
        }

        let mut matches: Vec<Device> = self
            .registry
            .devices()?
            .into_iter()
            .filter(|d| d.name == reference)
            .collect();

        match matches.len() {
            0 => bail!("no device named '{}'", reference),
            1 => Ok(matches.remove(0)),
            n => bail!("{} devices are named '{}', use the device id", n, reference),
        }
    }
}
