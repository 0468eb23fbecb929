//! Desired-state records and their validation rules

use crate::allocator;
use crate::keys;
use crate::ValidationError;
use ipnetwork::{IpNetwork, Ipv4Network};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Longest interface name the kernel accepts (IFNAMSIZ - 1)
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Default port WireGuard listens on
pub const DEFAULT_LISTEN_PORT: u16 = 51820;

/// Routes clients send through the tunnel unless configured otherwise
pub const DEFAULT_CLIENT_ALLOWED_IPS: &str = "0.0.0.0/0";

pub const MIN_MTU: u16 = 576;
pub const MAX_MTU: u16 = 9000;

const MAX_DEVICE_NAME_LEN: usize = 64;

// ============================================================================
// Server
// ============================================================================

/// The gateway's own overlay identity. One per deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub interface: String,
    pub private_key: String,
    pub public_key: String,
    pub listen_port: u16,
    /// Pool the device addresses are drawn from, normalized to its network address
    pub subnet: Ipv4Network,
    /// Host address held by the gateway itself
    pub address: Ipv4Addr,
    /// DNS servers handed to clients
    pub dns: Option<String>,
    pub mtu: Option<u16>,
    /// Public host (optionally `host:port`) clients dial
    pub endpoint: Option<String>,
    pub client_allowed_ips: String,
    pub persistent_keepalive: Option<u16>,
    pub post_up: Option<String>,
    pub post_down: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Server {
    /// Gateway address with the subnet prefix, as written to `Address =`
    pub fn interface_address(&self) -> String {
        format!("{}/{}", self.address, self.subnet.prefix())
    }

    /// Endpoint clients should dial, with the listen port filled in
    pub fn client_endpoint(&self) -> Option<String> {
        self.endpoint.as_ref().map(|host| {
            if host.contains(':') {
                host.clone()
            } else {
                format!("{}:{}", host, self.listen_port)
            }
        })
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_interface_name(&self.interface)?;

        if self.listen_port == 0 {
            return Err(ValidationError::new(
                "listen_port",
                "must be between 1 and 65535",
            ));
        }

        if self.subnet.prefix() > 30 {
            return Err(ValidationError::new(
                "subnet",
                format!(
                    "/{} is too small, at least 4 addresses (/30) are required",
                    self.subnet.prefix()
                ),
            ));
        }
        if self.subnet.ip() != self.subnet.network() {
            return Err(ValidationError::new(
                "subnet",
                format!("{} is not a network address", self.subnet),
            ));
        }

        if !allocator::is_host_address(self.subnet, self.address) {
            return Err(ValidationError::new(
                "address",
                format!("{} is not a host address of {}", self.address, self.subnet),
            ));
        }

        keys::decode_key("private_key", &self.private_key)?;
        keys::check_pair(&self.private_key, &self.public_key)?;

        if let Some(mtu) = self.mtu {
            if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
                return Err(ValidationError::new(
                    "mtu",
                    format!("must be between {} and {}", MIN_MTU, MAX_MTU),
                ));
            }
        }

        if let Some(endpoint) = &self.endpoint {
            if endpoint.is_empty() || endpoint.chars().any(char::is_whitespace) {
                return Err(ValidationError::new(
                    "endpoint",
                    "must be a host name or address without whitespace",
                ));
            }
        }

        validate_list("client_allowed_ips", &self.client_allowed_ips, |item| {
            item.parse::<IpNetwork>().is_ok()
        })?;

        if let Some(dns) = &self.dns {
            validate_list("dns", dns, |item| !item.chars().any(char::is_whitespace))?;
        }

        // Rendered verbatim into [Interface]; a line break would add directives
        for (field, hook) in [("post_up", &self.post_up), ("post_down", &self.post_down)] {
            if hook.as_deref().is_some_and(|h| h.contains(['\r', '\n'])) {
                return Err(ValidationError::new(field, "must be a single line"));
            }
        }

        Ok(())
    }
}

/// Interface names follow the kernel limit and the character set `wg-quick` accepts
pub fn validate_interface_name(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::new("interface", "must not be empty"));
    }
    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(ValidationError::new(
            "interface",
            format!(
                "must be at most {} characters (got {})",
                MAX_INTERFACE_NAME_LEN,
                name.len()
            ),
        ));
    }
    if let Some((position, c)) = name
        .chars()
        .enumerate()
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || "_=+.-".contains(*c)))
    {
        return Err(ValidationError::new(
            "interface",
            format!("invalid character '{}' at position {}", c, position),
        ));
    }
    Ok(())
}

fn validate_list(
    field: &'static str,
    value: &str,
    valid: impl Fn(&str) -> bool,
) -> Result<(), ValidationError> {
    for item in value.split(',').map(str::trim) {
        if item.is_empty() || !valid(item) {
            return Err(ValidationError::new(
                field,
                format!("invalid entry '{}' in '{}'", item, value),
            ));
        }
    }
    Ok(())
}

// ============================================================================
// Device
// ============================================================================

/// A peer owned by a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub private_key: String,
    pub public_key: String,
    pub address: Ipv4Addr,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Device {
    /// Check the device against the server it will be attached to.
    ///
    /// Owner existence needs the store and is checked by the registry.
    pub fn validate(&self, server: &Server) -> Result<(), ValidationError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(ValidationError::new("name", "must not be empty"));
        }
        if name.len() > MAX_DEVICE_NAME_LEN {
            return Err(ValidationError::new(
                "name",
                format!("must be at most {} characters", MAX_DEVICE_NAME_LEN),
            ));
        }

        if !allocator::is_host_address(server.subnet, self.address) {
            return Err(ValidationError::new(
                "address",
                format!("{} is not a host address of {}", self.address, server.subnet),
            ));
        }
        if self.address == server.address {
            return Err(ValidationError::new(
                "address",
                format!("{} is reserved for the server", self.address),
            ));
        }

        keys::decode_key("private_key", &self.private_key)?;
        keys::check_pair(&self.private_key, &self.public_key)?;

        Ok(())
    }
}

/// Parse a stored or user-supplied device address
pub fn parse_address(value: &str) -> Result<Ipv4Addr, ValidationError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::new("address", "must not be empty"));
    }
    value
        .parse()
        .map_err(|_| ValidationError::new("address", format!("'{}' is not an IPv4 address", value)))
}

// ============================================================================
// User
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub created_at: i64,
}

impl User {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let email = self.email.trim();
        if email.is_empty() {
            return Err(ValidationError::new("email", "must not be empty"));
        }
        match email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
            _ => Err(ValidationError::new(
                "email",
                format!("'{}' is not an email address", email),
            )),
        }
    }
}

pub(crate) fn now_epoch_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::keys::WgKeyPair;

    pub(crate) fn test_server(subnet: &str) -> Server {
        let subnet: Ipv4Network = subnet.parse().unwrap();
        let kp = WgKeyPair::generate().unwrap();
        Server {
            interface: "wg0".to_string(),
            private_key: kp.private_key,
            public_key: kp.public_key,
            listen_port: DEFAULT_LISTEN_PORT,
            subnet,
            address: Ipv4Addr::from(u32::from(subnet.network()) + 1),
            dns: None,
            mtu: None,
            endpoint: None,
            client_allowed_ips: DEFAULT_CLIENT_ALLOWED_IPS.to_string(),
            persistent_keepalive: None,
            post_up: None,
            post_down: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    pub(crate) fn test_device(name: &str, address: &str) -> Device {
        let kp = WgKeyPair::generate().unwrap();
        Device {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: name.to_string(),
            private_key: kp.private_key,
            public_key: kp.public_key,
            address: address.parse().unwrap(),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_valid_server() {
        assert!(test_server("10.0.0.0/24").validate().is_ok());
        assert!(test_server("10.0.0.0/30").validate().is_ok());
    }

    #[test]
    fn test_interface_names() {
        assert!(validate_interface_name("wg0").is_ok());
        assert!(validate_interface_name("wg-office.1").is_ok());
        assert!(validate_interface_name("").is_err());
        assert!(validate_interface_name("wireguard-gateway0").is_err());
        assert!(validate_interface_name("wg 0").is_err());
        assert!(validate_interface_name("wg/0").is_err());
    }

    #[test]
    fn test_server_field_errors() {
        let mut server = test_server("10.0.0.0/24");
        server.listen_port = 0;
        assert_eq!(server.validate().unwrap_err().field, "listen_port");

        let mut server = test_server("10.0.0.0/24");
        server.subnet = "10.0.0.0/31".parse().unwrap();
        server.address = "10.0.0.0".parse().unwrap();
        assert_eq!(server.validate().unwrap_err().field, "subnet");

        let mut server = test_server("10.0.0.0/24");
        server.subnet = "10.0.0.9/24".parse().unwrap();
        assert_eq!(server.validate().unwrap_err().field, "subnet");

        let mut server = test_server("10.0.0.0/24");
        server.address = "10.0.0.255".parse().unwrap();
        assert_eq!(server.validate().unwrap_err().field, "address");

        let mut server = test_server("10.0.0.0/24");
        server.address = "10.0.1.1".parse().unwrap();
        assert_eq!(server.validate().unwrap_err().field, "address");

        let mut server = test_server("10.0.0.0/24");
        server.public_key = WgKeyPair::generate().unwrap().public_key;
        assert_eq!(server.validate().unwrap_err().field, "public_key");

        let mut server = test_server("10.0.0.0/24");
        server.mtu = Some(100);
        assert_eq!(server.validate().unwrap_err().field, "mtu");

        let mut server = test_server("10.0.0.0/24");
        server.client_allowed_ips = "0.0.0.0/0, bogus".to_string();
        assert_eq!(server.validate().unwrap_err().field, "client_allowed_ips");

        let mut server = test_server("10.0.0.0/24");
        server.endpoint = Some("vpn example.com".to_string());
        assert_eq!(server.validate().unwrap_err().field, "endpoint");

        let mut server = test_server("10.0.0.0/24");
        server.post_up = Some("true\n[Peer]\nPublicKey = x".to_string());
        assert_eq!(server.validate().unwrap_err().field, "post_up");

        let mut server = test_server("10.0.0.0/24");
        server.post_down = Some("iptables -F\r".to_string());
        assert_eq!(server.validate().unwrap_err().field, "post_down");

        let mut server = test_server("10.0.0.0/24");
        server.post_up = Some("iptables -A FORWARD -i %i -j ACCEPT; echo up".to_string());
        assert!(server.validate().is_ok());
    }

    #[test]
    fn test_client_endpoint() {
        let mut server = test_server("10.0.0.0/24");
        assert_eq!(server.client_endpoint(), None);
        server.endpoint = Some("vpn.example.com".to_string());
        assert_eq!(server.client_endpoint().unwrap(), "vpn.example.com:51820");
        server.endpoint = Some("vpn.example.com:443".to_string());
        assert_eq!(server.client_endpoint().unwrap(), "vpn.example.com:443");
        assert_eq!(server.interface_address(), "10.0.0.1/24");
    }

    #[test]
    fn test_device_validation() {
        let server = test_server("10.0.0.0/24");
        assert!(test_device("laptop", "10.0.0.2").validate(&server).is_ok());

        let err = test_device("laptop", "10.0.0.1").validate(&server).unwrap_err();
        assert_eq!(err.field, "address");
        let err = test_device("laptop", "10.0.0.0").validate(&server).unwrap_err();
        assert_eq!(err.field, "address");
        let err = test_device("laptop", "10.0.0.255").validate(&server).unwrap_err();
        assert_eq!(err.field, "address");
        let err = test_device("laptop", "10.0.1.2").validate(&server).unwrap_err();
        assert_eq!(err.field, "address");

        let err = test_device("  ", "10.0.0.2").validate(&server).unwrap_err();
        assert_eq!(err.field, "name");

        let mut device = test_device("laptop", "10.0.0.2");
        device.public_key = "AAAA".to_string();
        assert_eq!(device.validate(&server).unwrap_err().field, "public_key");
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address(" 10.0.0.2 ").unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(parse_address("").unwrap_err().field, "address");
        assert_eq!(parse_address("10.0.0").unwrap_err().field, "address");
    }

    #[test]
    fn test_user_email() {
        let mut user = User {
            id: Uuid::new_v4(),
            email: "alice@example.com".to_string(),
            name: None,
            created_at: 0,
        };
        assert!(user.validate().is_ok());
        user.email = "alice".to_string();
        assert!(user.validate().is_err());
        user.email = "@example.com".to_string();
        assert!(user.validate().is_err());
    }
}
