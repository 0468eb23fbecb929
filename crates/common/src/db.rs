//! SQLite store for wgreg state
//!
//! Tables:
//! - users: device owners
//! - server: the single gateway row (`id = 1`)
//! - devices: peers, with UNIQUE address and public key columns

use crate::model::{self, Device, Server, User};
use crate::store::Store;
use crate::{Error, Result};
use ipnetwork::Ipv4Network;
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{ffi, params, Connection, ErrorCode, OptionalExtension, Row};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path.as_ref())?;

        // WAL lets the CLI and the daemon share the file
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            -- Device owners
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                name TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_users_email ON users(lower(email));

            -- Gateway identity, at most one row
            CREATE TABLE IF NOT EXISTS server (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                interface TEXT NOT NULL,
                private_key TEXT NOT NULL,
                public_key TEXT NOT NULL,
                listen_port INTEGER NOT NULL,
                subnet TEXT NOT NULL,
                address TEXT NOT NULL,
                dns TEXT,
                mtu INTEGER,
                endpoint TEXT,
                client_allowed_ips TEXT NOT NULL,
                persistent_keepalive INTEGER,
                post_up TEXT,
                post_down TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Peers
            CREATE TABLE IF NOT EXISTS devices (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                name TEXT NOT NULL,
                private_key TEXT NOT NULL,
                public_key TEXT NOT NULL UNIQUE,
                address TEXT NOT NULL UNIQUE,
                address_num INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                FOREIGN KEY(user_id) REFERENCES users(id)
            );
            CREATE INDEX IF NOT EXISTS idx_devices_user ON devices(user_id);
            CREATE INDEX IF NOT EXISTS idx_devices_address_num ON devices(address_num);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }
}

const SERVER_COLUMNS: &str = "interface, private_key, public_key, listen_port, subnet, address, \
     dns, mtu, endpoint, client_allowed_ips, persistent_keepalive, post_up, post_down, \
     created_at, updated_at";

const DEVICE_COLUMNS: &str =
    "id, user_id, name, private_key, public_key, address, created_at, updated_at";

const USER_COLUMNS: &str = "id, email, name, created_at";

impl Store for Database {
    // ========================================================================
    // Server
    // ========================================================================

    fn find_server(&self) -> Result<Option<Server>> {
        let conn = self.conn.lock();
        let server = conn
            .query_row(
                &format!("SELECT {} FROM server WHERE id = 1", SERVER_COLUMNS),
                [],
                server_from_row,
            )
            .optional()?;
        Ok(server)
    }

    fn save_server(&self, server: &Server) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO server (id, {}) \
                 VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15) \
                 ON CONFLICT(id) DO UPDATE SET \
                    interface = excluded.interface, \
                    private_key = excluded.private_key, \
                    public_key = excluded.public_key, \
                    listen_port = excluded.listen_port, \
                    subnet = excluded.subnet, \
                    address = excluded.address, \
                    dns = excluded.dns, \
                    mtu = excluded.mtu, \
                    endpoint = excluded.endpoint, \
                    client_allowed_ips = excluded.client_allowed_ips, \
                    persistent_keepalive = excluded.persistent_keepalive, \
                    post_up = excluded.post_up, \
                    post_down = excluded.post_down, \
                    updated_at = excluded.updated_at",
                SERVER_COLUMNS
            ),
            params![
                server.interface,
                server.private_key,
                server.public_key,
                server.listen_port,
                server.subnet.to_string(),
                server.address.to_string(),
                server.dns,
                server.mtu,
                server.endpoint,
                server.client_allowed_ips,
                server.persistent_keepalive,
                server.post_up,
                server.post_down,
                server.created_at,
                server.updated_at,
            ],
        )?;

        debug!("Saved server {}", server.interface);
        Ok(())
    }

    // ========================================================================
    // Devices
    // ========================================================================

    fn allocated_addresses(&self) -> Result<HashSet<Ipv4Addr>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT address FROM devices")?;
        let rows = stmt.query_map([], |row| address_column(row, 0))?;

        let mut addrs = HashSet::new();
        for row in rows {
            addrs.insert(row?);
        }
        Ok(addrs)
    }

    fn create_device(&self, device: &Device) -> Result<()> {
        let conn = self.conn.lock();
        let result = conn.execute(
            &format!(
                "INSERT INTO devices ({}, address_num) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                DEVICE_COLUMNS
            ),
            params![
                device.id.to_string(),
                device.user_id.to_string(),
                device.name,
                device.private_key,
                device.public_key,
                device.address.to_string(),
                u32::from(device.address),
                device.created_at,
                device.updated_at,
            ],
        );

        match result {
            Ok(_) => {
                debug!("Inserted device {} at {}", device.id, device.address);
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == ffi::SQLITE_CONSTRAINT_FOREIGNKEY =>
            {
                Err(Error::not_found("user", device.user_id))
            }
            Err(rusqlite::Error::SqliteFailure(e, msg)) if e.code == ErrorCode::ConstraintViolation => {
                let msg = msg.unwrap_or_default();
                if msg.contains("devices.address") {
                    Err(Error::already_exists("device address", device.address))
                } else if msg.contains("devices.public_key") {
                    Err(Error::already_exists("device public key", &device.public_key))
                } else {
                    Err(Error::already_exists("device", device.id))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn delete_device(&self, device: &Device) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "DELETE FROM devices WHERE id = ?1",
            params![device.id.to_string()],
        )?;

        if rows == 0 {
            return Err(Error::not_found("device", device.id));
        }
        debug!("Deleted device {} at {}", device.id, device.address);
        Ok(())
    }

    fn all_devices(&self) -> Result<Vec<Device>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM devices ORDER BY address_num, id",
            DEVICE_COLUMNS
        ))?;
        let rows = stmt.query_map([], device_from_row)?;

        let mut devices = Vec::new();
        for row in rows {
            devices.push(row?);
        }
        Ok(devices)
    }

    fn find_device(&self, id: Uuid) -> Result<Option<Device>> {
        let conn = self.conn.lock();
        let device = conn
            .query_row(
                &format!("SELECT {} FROM devices WHERE id = ?1", DEVICE_COLUMNS),
                params![id.to_string()],
                device_from_row,
            )
            .optional()?;
        Ok(device)
    }

    fn devices_for_user(&self, user_id: Uuid) -> Result<Vec<Device>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM devices WHERE user_id = ?1 ORDER BY address_num, id",
            DEVICE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![user_id.to_string()], device_from_row)?;

        let mut devices = Vec::new();
        for row in rows {
            devices.push(row?);
        }
        Ok(devices)
    }

    // ========================================================================
    // Users
    // ========================================================================

    fn create_user(&self, user: &User) -> Result<()> {
        let conn = self.conn.lock();
        let result = conn.execute(
            &format!("INSERT INTO users ({}) VALUES (?1, ?2, ?3, ?4)", USER_COLUMNS),
            params![user.id.to_string(), user.email, user.name, user.created_at],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(Error::already_exists("user", &user.email))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn find_user(&self, id: Uuid) -> Result<Option<User>> {
        let conn = self.conn.lock();
        let user = conn
            .query_row(
                &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
                params![id.to_string()],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let conn = self.conn.lock();
        let user = conn
            .query_row(
                &format!(
                    "SELECT {} FROM users WHERE lower(email) = lower(?1)",
                    USER_COLUMNS
                ),
                params![email.trim()],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    fn all_users(&self) -> Result<Vec<User>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM users ORDER BY created_at, email",
            USER_COLUMNS
        ))?;
        let rows = stmt.query_map([], user_from_row)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }
}

// ============================================================================
// Row decoding
// ============================================================================

fn server_from_row(row: &Row<'_>) -> rusqlite::Result<Server> {
    Ok(Server {
        interface: row.get(0)?,
        private_key: row.get(1)?,
        public_key: row.get(2)?,
        listen_port: row.get(3)?,
        subnet: subnet_column(row, 4)?,
        address: address_column(row, 5)?,
        dns: row.get(6)?,
        mtu: row.get(7)?,
        endpoint: row.get(8)?,
        client_allowed_ips: row.get(9)?,
        persistent_keepalive: row.get(10)?,
        post_up: row.get(11)?,
        post_down: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        id: uuid_column(row, 0)?,
        user_id: uuid_column(row, 1)?,
        name: row.get(2)?,
        private_key: row.get(3)?,
        public_key: row.get(4)?,
        address: address_column(row, 5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: uuid_column(row, 0)?,
        email: row.get(1)?,
        name: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn uuid_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let value: String = row.get(idx)?;
    Uuid::parse_str(&value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn address_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Ipv4Addr> {
    let value: String = row.get(idx)?;
    model::parse_address(&value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn subnet_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Ipv4Network> {
    let value: String = row.get(idx)?;
    value
        .parse::<Ipv4Network>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
