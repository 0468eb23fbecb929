//! Storage contract consumed by the registry and the controller

use crate::model::{Device, Server, User};
use crate::Result;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Durable record of the server, users and devices.
///
/// Implementations enforce the single-server rule (insert-or-update on one
/// row) and address uniqueness across devices. Validation is the caller's
/// job; a store persists what it is given.
pub trait Store: Send + Sync {
    // =========================================================================
    // Server
    // =========================================================================

    /// The server record, or `None` before bootstrap
    fn find_server(&self) -> Result<Option<Server>>;

    /// Insert the server if none exists, update it otherwise
    fn save_server(&self, server: &Server) -> Result<()>;

    // =========================================================================
    // Devices
    // =========================================================================

    /// Addresses held by current devices
    fn allocated_addresses(&self) -> Result<HashSet<Ipv4Addr>>;

    /// Persist a new device.
    ///
    /// Returns `Error::AlreadyExists` if its address or id is taken.
    fn create_device(&self, device: &Device) -> Result<()>;

    /// Remove a device. Returns `Error::NotFound` if it does not exist.
    fn delete_device(&self, device: &Device) -> Result<()>;

    /// All devices ordered by address
    fn all_devices(&self) -> Result<Vec<Device>>;

    fn find_device(&self, id: Uuid) -> Result<Option<Device>>;

    fn devices_for_user(&self, user_id: Uuid) -> Result<Vec<Device>>;

    // =========================================================================
    // Users
    // =========================================================================

    fn create_user(&self, user: &User) -> Result<()>;

    fn find_user(&self, id: Uuid) -> Result<Option<User>>;

    /// Case-insensitive lookup
    fn find_user_by_email(&self, email: &str) -> Result<Option<User>>;

    fn all_users(&self) -> Result<Vec<User>>;
}
