//! Configuration rendering
//!
//! Produces `wg-quick` INI text. Rendering is pure: the same server and device
//! set always yields the same bytes, so a digest of the output identifies the
//! desired state for drift detection.

use crate::model::{Device, Server};
use sha2::{Digest, Sha256};
use std::fmt::Write;

/// Render the gateway interface configuration with one peer per device.
///
/// Peers are ordered by address so the input order does not matter.
pub fn interface_config(server: &Server, devices: &[Device]) -> String {
    let mut out = String::new();

    out.push_str("# Managed by wgreg. Local edits are overwritten on the next apply.\n");
    out.push_str("[Interface]\n");
    line(&mut out, "Address", &server.interface_address());
    line(&mut out, "ListenPort", &server.listen_port.to_string());
    line(&mut out, "PrivateKey", &server.private_key);
    if let Some(mtu) = server.mtu {
        line(&mut out, "MTU", &mtu.to_string());
    }
    if let Some(post_up) = &server.post_up {
        line(&mut out, "PostUp", post_up);
    }
    if let Some(post_down) = &server.post_down {
        line(&mut out, "PostDown", post_down);
    }

    let mut peers: Vec<&Device> = devices.iter().collect();
    peers.sort_by_key(|d| (d.address, d.id));

    for device in peers {
        out.push('\n');
        out.push_str("[Peer]\n");
        let _ = writeln!(out, "# {} ({})", single_line(&device.name), device.id);
        line(&mut out, "PublicKey", &device.public_key);
        line(&mut out, "AllowedIPs", &format!("{}/32", device.address));
    }

    out
}

/// Render the ready-to-use client configuration for a device
pub fn device_config(server: &Server, device: &Device) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "# {} ({})", single_line(&device.name), device.id);
    out.push_str("[Interface]\n");
    line(&mut out, "PrivateKey", &device.private_key);
    line(&mut out, "Address", &format!("{}/32", device.address));
    if let Some(dns) = &server.dns {
        line(&mut out, "DNS", dns);
    }
    if let Some(mtu) = server.mtu {
        line(&mut out, "MTU", &mtu.to_string());
    }

    out.push('\n');
    out.push_str("[Peer]\n");
    line(&mut out, "PublicKey", &server.public_key);
    line(&mut out, "AllowedIPs", &server.client_allowed_ips);
    match server.client_endpoint() {
        Some(endpoint) => line(&mut out, "Endpoint", &endpoint),
        None => {
            let _ = writeln!(out, "# Endpoint = <gateway-host>:{}", server.listen_port);
        }
    }
    if let Some(keepalive) = server.persistent_keepalive.filter(|k| *k > 0) {
        line(&mut out, "PersistentKeepalive", &keepalive.to_string());
    }

    out
}

/// Hex SHA-256 of rendered configuration text
pub fn digest(config: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(config.as_bytes());
    hex::encode(hasher.finalize())
}

fn line(out: &mut String, key: &str, value: &str) {
    let _ = writeln!(out, "{} = {}", key, value);
}

// Device names end up in comments; a newline would start a new directive.
fn single_line(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::{test_device, test_server};

    fn peer_count(config: &str) -> usize {
        config.lines().filter(|l| *l == "[Peer]").count()
    }

    #[test]
    fn test_no_devices_renders_interface_only() {
        let server = test_server("10.0.0.0/24");
        let config = interface_config(&server, &[]);

        assert!(config.contains("[Interface]\n"));
        assert!(config.contains("Address = 10.0.0.1/24\n"));
        assert!(config.contains("ListenPort = 51820\n"));
        assert!(config.contains(&format!("PrivateKey = {}\n", server.private_key)));
        assert_eq!(peer_count(&config), 0);
        assert!(!config.contains("MTU"));
    }

    #[test]
    fn test_render_is_pure() {
        let server = test_server("10.0.0.0/24");
        let devices = vec![test_device("laptop", "10.0.0.2"), test_device("phone", "10.0.0.3")];

        let first = interface_config(&server, &devices);
        let second = interface_config(&server, &devices);
        assert_eq!(first, second);
        assert_eq!(digest(&first), digest(&second));
    }

    #[test]
    fn test_order_independent() {
        let server = test_server("10.0.0.0/24");
        let a = test_device("a", "10.0.0.10");
        let b = test_device("b", "10.0.0.2");
        let c = test_device("c", "10.0.0.3");

        let forward = interface_config(&server, &[a.clone(), b.clone(), c.clone()]);
        let backward = interface_config(&server, &[c, b.clone(), a.clone()]);
        assert_eq!(forward, backward);

        // Numeric, not lexical, address order
        let pos_b = forward.find(&b.public_key).unwrap();
        let pos_a = forward.find(&a.public_key).unwrap();
        assert!(pos_b < pos_a);
    }

    #[test]
    fn test_one_peer_per_device() {
        let server = test_server("10.0.0.0/24");
        let devices = vec![
            test_device("laptop", "10.0.0.2"),
            test_device("phone", "10.0.0.3"),
            test_device("tablet", "10.0.0.4"),
        ];
        let outsider = test_device("outsider", "10.0.0.5");

        let config = interface_config(&server, &devices);
        assert_eq!(peer_count(&config), 3);
        for device in &devices {
            assert_eq!(config.matches(&device.public_key).count(), 1);
            assert!(config.contains(&format!("AllowedIPs = {}/32\n", device.address)));
            assert!(!config.contains(&device.private_key));
        }
        assert!(!config.contains(&outsider.public_key));
        assert!(!config.contains("10.0.0.5/32"));
    }

    #[test]
    fn test_interface_options() {
        let mut server = test_server("10.0.0.0/24");
        server.mtu = Some(1420);
        server.post_up = Some("iptables -A FORWARD -i %i -j ACCEPT".to_string());
        server.post_down = Some("iptables -D FORWARD -i %i -j ACCEPT".to_string());

        let config = interface_config(&server, &[]);
        assert!(config.contains("MTU = 1420\n"));
        assert!(config.contains("PostUp = iptables -A FORWARD -i %i -j ACCEPT\n"));
        assert!(config.contains("PostDown = iptables -D FORWARD -i %i -j ACCEPT\n"));
    }

    #[test]
    fn test_device_name_cannot_inject_lines() {
        let server = test_server("10.0.0.0/24");
        let device = test_device("evil\n[Peer]\nPublicKey = x", "10.0.0.2");
        let config = interface_config(&server, &[device]);
        assert_eq!(peer_count(&config), 1);
    }

    #[test]
    fn test_device_config() {
        let mut server = test_server("10.0.0.0/24");
        server.dns = Some("1.1.1.1, 8.8.8.8".to_string());
        server.endpoint = Some("vpn.example.com".to_string());
        server.persistent_keepalive = Some(25);
        let device = test_device("laptop", "10.0.0.7");

        let config = device_config(&server, &device);
        assert!(config.contains(&format!("PrivateKey = {}\n", device.private_key)));
        assert!(config.contains("Address = 10.0.0.7/32\n"));
        assert!(config.contains("DNS = 1.1.1.1, 8.8.8.8\n"));
        assert!(config.contains(&format!("PublicKey = {}\n", server.public_key)));
        assert!(config.contains("AllowedIPs = 0.0.0.0/0\n"));
        assert!(config.contains("Endpoint = vpn.example.com:51820\n"));
        assert!(config.contains("PersistentKeepalive = 25\n"));
        assert!(!config.contains(&server.private_key));
    }

    #[test]
    fn test_device_config_without_endpoint() {
        let server = test_server("10.0.0.0/24");
        let device = test_device("laptop", "10.0.0.7");
        let config = device_config(&server, &device);
        assert!(config.contains("# Endpoint = <gateway-host>:51820\n"));
        assert!(!config.contains("DNS"));
        assert!(!config.contains("PersistentKeepalive"));
    }

    #[test]
    fn test_digest_changes_with_state() {
        let server = test_server("10.0.0.0/24");
        let empty = digest(&interface_config(&server, &[]));
        let one = digest(&interface_config(&server, &[test_device("laptop", "10.0.0.2")]));
        assert_ne!(empty, one);
        assert_eq!(empty.len(), 64);
    }
}
