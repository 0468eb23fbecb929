//! wgreg Common Library
//!
//! The registry core: key generation, address allocation, desired-state
//! records, configuration rendering, the SQLite store and the controller that
//! applies stored state to a live WireGuard interface.

pub mod allocator;
pub mod config;
pub mod controller;
pub mod db;
pub mod error;
pub mod keys;
pub mod model;
pub mod platform;
pub mod registry;
pub mod render;
pub mod store;

// Re-export commonly used types
pub use config::{RegistryConfig, WireguardConfig};
pub use controller::{ApplyReport, Controller, ControllerStatus, ReconcileState};
pub use db::Database;
pub use error::{ApplyError, ApplyStage, Error, ErrorKind, Result, ValidationError};
pub use keys::WgKeyPair;
pub use model::{Device, Server, User};
pub use platform::{InterfaceDriver, WgQuick};
pub use registry::{Registry, ServerChange, ServerParams, ServerUpdate};
pub use store::Store;

/// wgreg version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".wgreg")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
