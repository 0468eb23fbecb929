//! Server, user and device lifecycle
//!
//! Every mutation of desired state goes through here. Validation runs before
//! the store is touched, so a rejected request leaves nothing behind.

use crate::allocator;
use crate::keys::WgKeyPair;
use crate::model::{self, Device, Server, User, DEFAULT_CLIENT_ALLOWED_IPS};
use crate::store::Store;
use crate::{Error, Result, ValidationError};
use ipnetwork::Ipv4Network;
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Parameters for first-run server creation
#[derive(Debug, Clone)]
pub struct ServerParams {
    pub interface: String,
    pub listen_port: u16,
    /// Host bits are cleared, so `10.8.0.1/24` becomes `10.8.0.0/24`
    pub subnet: Ipv4Network,
    /// Defaults to the first host address of the subnet
    pub address: Option<Ipv4Addr>,
    pub dns: Option<String>,
    pub mtu: Option<u16>,
    pub endpoint: Option<String>,
    pub client_allowed_ips: Option<String>,
    pub persistent_keepalive: Option<u16>,
    pub post_up: Option<String>,
    pub post_down: Option<String>,
}

/// Changes to an existing server. `None` leaves a field alone; for the
/// optional fields `Some(None)` clears the value.
#[derive(Debug, Clone, Default)]
pub struct ServerUpdate {
    pub listen_port: Option<u16>,
    pub subnet: Option<Ipv4Network>,
    pub address: Option<Ipv4Addr>,
    pub dns: Option<Option<String>>,
    pub mtu: Option<Option<u16>>,
    pub endpoint: Option<Option<String>>,
    pub client_allowed_ips: Option<String>,
    pub persistent_keepalive: Option<Option<u16>>,
    pub post_up: Option<Option<String>>,
    pub post_down: Option<Option<String>>,
}

/// Result of [`Registry::update_server`]
#[derive(Debug, Clone)]
pub struct ServerChange {
    pub server: Server,
    /// The interface must be restarted for the change to take effect
    pub restart_required: bool,
}

pub struct Registry {
    store: Arc<dyn Store>,
    /// Serializes read-allocated-then-insert and subnet changes
    allocation: Mutex<()>,
}

impl Registry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            allocation: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    // ========================================================================
    // Server
    // ========================================================================

    /// The server record, or `Error::NotProvisioned`
    pub fn server(&self) -> Result<Server> {
        self.store.find_server()?.ok_or(Error::NotProvisioned)
    }

    /// Create the server and its key pair. Fails if one already exists.
    pub fn bootstrap_server(&self, params: ServerParams) -> Result<Server> {
        let _guard = self.allocation.lock();

        if let Some(existing) = self.store.find_server()? {
            return Err(Error::already_exists("server", existing.interface));
        }

        let subnet = normalize(params.subnet)?;
        let address = params
            .address
            .unwrap_or_else(|| Ipv4Addr::from(u32::from(subnet.network()).saturating_add(1)));
        let keys = WgKeyPair::generate()?;
        let now = model::now_epoch_secs();

        let server = Server {
            interface: params.interface,
            private_key: keys.private_key,
            public_key: keys.public_key,
            listen_port: params.listen_port,
            subnet,
            address,
            dns: params.dns,
            mtu: params.mtu,
            endpoint: params.endpoint,
            client_allowed_ips: params
                .client_allowed_ips
                .unwrap_or_else(|| DEFAULT_CLIENT_ALLOWED_IPS.to_string()),
            persistent_keepalive: params.persistent_keepalive,
            post_up: params.post_up,
            post_down: params.post_down,
            created_at: now,
            updated_at: now,
        };
        server.validate()?;

        self.store.save_server(&server)?;
        info!(
            "Provisioned server {} on {} (gateway {}, {} device addresses)",
            server.interface,
            server.subnet,
            server.address,
            allocator::usable_hosts(server.subnet, server.address)
        );
        Ok(server)
    }

    /// Apply `update` to the stored server.
    ///
    /// A subnet or gateway address change is refused when an existing device
    /// would no longer fit.
    pub fn update_server(&self, update: ServerUpdate) -> Result<ServerChange> {
        let _guard = self.allocation.lock();

        let current = self.server()?;
        let mut server = current.clone();

        if let Some(port) = update.listen_port {
            server.listen_port = port;
        }
        if let Some(subnet) = update.subnet {
            server.subnet = normalize(subnet)?;
            if update.address.is_none() && !allocator::is_host_address(server.subnet, server.address) {
                server.address = Ipv4Addr::from(u32::from(server.subnet.network()).saturating_add(1));
            }
        }
        if let Some(address) = update.address {
            server.address = address;
        }
        if let Some(dns) = update.dns {
            server.dns = dns;
        }
        if let Some(mtu) = update.mtu {
            server.mtu = mtu;
        }
        if let Some(endpoint) = update.endpoint {
            server.endpoint = endpoint;
        }
        if let Some(allowed) = update.client_allowed_ips {
            server.client_allowed_ips = allowed;
        }
        if let Some(keepalive) = update.persistent_keepalive {
            server.persistent_keepalive = keepalive;
        }
        if let Some(post_up) = update.post_up {
            server.post_up = post_up;
        }
        if let Some(post_down) = update.post_down {
            server.post_down = post_down;
        }

        server.validate()?;

        if server.subnet != current.subnet || server.address != current.address {
            let devices = self.store.all_devices()?;
            let outside = devices
                .iter()
                .filter(|d| !allocator::is_host_address(server.subnet, d.address))
                .count();
            if outside > 0 {
                return Err(ValidationError::new(
                    "subnet",
                    format!("{} device(s) would fall outside {}", outside, server.subnet),
                )
                .into());
            }
            if let Some(device) = devices.iter().find(|d| d.address == server.address) {
                return Err(ValidationError::new(
                    "address",
                    format!("{} is held by device {}", server.address, device.id),
                )
                .into());
            }
        }

        let restart_required = server.listen_port != current.listen_port
            || server.subnet != current.subnet
            || server.address != current.address
            || server.mtu != current.mtu
            || server.post_up != current.post_up
            || server.post_down != current.post_down;

        if server == current {
            return Ok(ServerChange {
                server,
                restart_required: false,
            });
        }

        server.updated_at = model::now_epoch_secs();
        self.store.save_server(&server)?;
        info!(
            "Updated server {}{}",
            server.interface,
            if restart_required { " (restart required)" } else { "" }
        );

        Ok(ServerChange {
            server,
            restart_required,
        })
    }

    // ========================================================================
    // Users
    // ========================================================================

    /// Register a device owner. Emails are stored lower-cased.
    pub fn create_user(&self, email: &str, name: Option<String>) -> Result<User> {
        let user = User {
            id: Uuid::new_v4(),
            email: email.trim().to_lowercase(),
            name: name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
            created_at: model::now_epoch_secs(),
        };
        user.validate()?;

        if self.store.find_user_by_email(&user.email)?.is_some() {
            return Err(Error::already_exists("user", &user.email));
        }
        self.store.create_user(&user)?;

        info!("Created user {} ({})", user.email, user.id);
        Ok(user)
    }

    pub fn user(&self, id: Uuid) -> Result<User> {
        self.store
            .find_user(id)?
            .ok_or_else(|| Error::not_found("user", id))
    }

    pub fn user_by_email(&self, email: &str) -> Result<User> {
        self.store
            .find_user_by_email(email.trim())?
            .ok_or_else(|| Error::not_found("user", email.trim()))
    }

    pub fn users(&self) -> Result<Vec<User>> {
        self.store.all_users()
    }

    // ========================================================================
    // Devices
    // ========================================================================

    /// Allocate an address and a key pair for a new device owned by `user`.
    ///
    /// Allocation and insert happen under one lock; the store's unique
    /// address column catches writers in other processes. Subnet and gateway
    /// address are re-read under the lock, `server` only names the interface.
    pub fn create_device(&self, requested: &Server, user: &User, name: &str) -> Result<Device> {
        if self.store.find_user(user.id)?.is_none() {
            return Err(Error::not_found("user", user.id));
        }

        let _guard = self.allocation.lock();

        let server = &self.server()?;
        if server.interface != requested.interface {
            return Err(Error::not_found("server", &requested.interface));
        }

        let allocated = self.store.allocated_addresses()?;
        let address = allocator::next_address(server.subnet, server.address, &allocated)?;
        let keys = WgKeyPair::generate()?;
        let now = model::now_epoch_secs();

        let device = Device {
            id: Uuid::new_v4(),
            user_id: user.id,
            name: name.trim().to_string(),
            private_key: keys.private_key,
            public_key: keys.public_key,
            address,
            created_at: now,
            updated_at: now,
        };
        device.validate(server)?;

        self.store.create_device(&device)?;
        info!(
            "Created device {} '{}' for {} at {}",
            device.id, device.name, user.email, device.address
        );
        Ok(device)
    }

    /// Remove a device; its address becomes allocatable again
    pub fn delete_device(&self, id: Uuid) -> Result<Device> {
        let _guard = self.allocation.lock();

        let device = self.device(id)?;
        self.store.delete_device(&device)?;
        info!("Deleted device {} '{}' ({} released)", device.id, device.name, device.address);
        Ok(device)
    }

    pub fn device(&self, id: Uuid) -> Result<Device> {
        self.store
            .find_device(id)?
            .ok_or_else(|| Error::not_found("device", id))
    }

    pub fn devices(&self) -> Result<Vec<Device>> {
        self.store.all_devices()
    }

    pub fn devices_for_user(&self, user_id: Uuid) -> Result<Vec<Device>> {
        self.user(user_id)?;
        self.store.devices_for_user(user_id)
    }
}

fn normalize(subnet: Ipv4Network) -> Result<Ipv4Network> {
    let normalized = Ipv4Network::new(subnet.network(), subnet.prefix())
        .map_err(|e| ValidationError::new("subnet", e.to_string()))?;
    if normalized != subnet {
        debug!("Normalized subnet {} to {}", subnet, normalized);
    }
    Ok(normalized)
}
