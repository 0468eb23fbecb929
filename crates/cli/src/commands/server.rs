//! Server Commands

use anyhow::Result;
use clap::Subcommand;
use ipnetwork::Ipv4Network;
use serde::Serialize;
use std::net::Ipv4Addr;

use crate::context::Context;
use crate::output::{
    format_time, or_dash, print_info, print_item, print_success, print_warning, OutputFormat,
    TableDisplay,
};
use wgreg_common::allocator;
use wgreg_common::model::DEFAULT_LISTEN_PORT;
use wgreg_common::{Server, ServerParams, ServerUpdate};

#[derive(Subcommand)]
pub enum ServerCommands {
    /// Create the gateway server and its key pair
    Init {
        /// Interface name
        #[arg(short, long, default_value = "wg0")]
        interface: String,

        /// UDP listen port
        #[arg(short, long, default_value_t = DEFAULT_LISTEN_PORT)]
        port: u16,

        /// Device address pool (e.g., 10.8.0.0/24)
        #[arg(long)]
        subnet: Ipv4Network,

        /// Gateway address inside the subnet (defaults to the first host)
        #[arg(long)]
        address: Option<Ipv4Addr>,

        /// DNS servers handed to clients
        #[arg(long)]
        dns: Option<String>,

        /// Interface MTU
        #[arg(long)]
        mtu: Option<u16>,

        /// Public host clients dial
        #[arg(long)]
        endpoint: Option<String>,

        /// Routes clients send through the tunnel
        #[arg(long)]
        allowed_ips: Option<String>,

        /// Client keepalive in seconds
        #[arg(long)]
        keepalive: Option<u16>,

        /// Command run after the interface comes up
        #[arg(long)]
        post_up: Option<String>,

        /// Command run after the interface goes down
        #[arg(long)]
        post_down: Option<String>,
    },

    /// Show the server
    Show,

    /// Change server settings. Pass an empty string (or 0) to clear an optional value.
    Set {
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(long)]
        subnet: Option<Ipv4Network>,

        #[arg(long)]
        address: Option<Ipv4Addr>,

        #[arg(long)]
        dns: Option<String>,

        #[arg(long)]
        mtu: Option<u16>,

        #[arg(long)]
        endpoint: Option<String>,

        #[arg(long)]
        allowed_ips: Option<String>,

        #[arg(long)]
        keepalive: Option<u16>,

        #[arg(long)]
        post_up: Option<String>,

        #[arg(long)]
        post_down: Option<String>,
    },
}

/// Server display wrapper for serialization. Never carries the private key.
#[derive(Serialize)]
pub struct ServerDisplay {
    pub interface: String,
    pub public_key: String,
    pub listen_port: u16,
    pub subnet: String,
    pub address: String,
    pub device_capacity: u32,
    pub dns: Option<String>,
    pub mtu: Option<u16>,
    pub endpoint: Option<String>,
    pub client_allowed_ips: String,
    pub persistent_keepalive: Option<u16>,
    pub updated_at: i64,
}

impl From<Server> for ServerDisplay {
    fn from(server: Server) -> Self {
        Self {
            device_capacity: allocator::usable_hosts(server.subnet, server.address),
            interface: server.interface,
            public_key: server.public_key,
            listen_port: server.listen_port,
            subnet: server.subnet.to_string(),
            address: server.address.to_string(),
            dns: server.dns,
            mtu: server.mtu,
            endpoint: server.endpoint,
            client_allowed_ips: server.client_allowed_ips,
            persistent_keepalive: server.persistent_keepalive,
            updated_at: server.updated_at,
        }
    }
}

impl TableDisplay for ServerDisplay {
    fn headers() -> Vec<&'static str> {
        vec![
            "Interface",
            "Public Key",
            "Port",
            "Subnet",
            "Address",
            "Capacity",
            "DNS",
            "MTU",
            "Endpoint",
            "Client Routes",
            "Keepalive",
            "Updated",
        ]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.interface.clone(),
            self.public_key.clone(),
            self.listen_port.to_string(),
            self.subnet.clone(),
            self.address.clone(),
            self.device_capacity.to_string(),
            or_dash(self.dns.as_ref()),
            or_dash(self.mtu),
            or_dash(self.endpoint.as_ref()),
            self.client_allowed_ips.clone(),
            or_dash(self.persistent_keepalive),
            format_time(self.updated_at),
        ]
    }
}

pub fn execute(cmd: ServerCommands, ctx: &Context, format: OutputFormat) -> Result<()> {
    match cmd {
        ServerCommands::Init {
            interface,
            port,
            subnet,
            address,
            dns,
            mtu,
            endpoint,
            allowed_ips,
            keepalive,
            post_up,
            post_down,
        } => {
            let server = ctx.registry.bootstrap_server(ServerParams {
                interface,
                listen_port: port,
                subnet,
                address,
                dns,
                mtu,
                endpoint,
                client_allowed_ips: allowed_ips,
                persistent_keepalive: keepalive,
                post_up,
                post_down,
            })?;
            print_success(&format!("Server '{}' created on {}", server.interface, server.subnet));
            print_item(&ServerDisplay::from(server), format)?;
            print_info("Run `wgreg apply --restart` (or start wgregd) to bring the interface up");
        }

        ServerCommands::Show => {
            let server = ctx.registry.server()?;
            print_item(&ServerDisplay::from(server), format)?;
        }

        ServerCommands::Set {
            port,
            subnet,
            address,
            dns,
            mtu,
            endpoint,
            allowed_ips,
            keepalive,
            post_up,
            post_down,
        } => {
            let change = ctx.registry.update_server(ServerUpdate {
                listen_port: port,
                subnet,
                address,
                dns: clearable(dns),
                mtu: mtu.map(|v| (v != 0).then_some(v)),
                endpoint: clearable(endpoint),
                client_allowed_ips: allowed_ips,
                persistent_keepalive: keepalive.map(|v| (v != 0).then_some(v)),
                post_up: clearable(post_up),
                post_down: clearable(post_down),
            })?;
            print_success(&format!("Server '{}' updated", change.server.interface));
            print_item(&ServerDisplay::from(change.server), format)?;
            if change.restart_required {
                print_warning("This change needs an interface restart: `wgreg apply --restart`");
            }
        }
    }

    Ok(())
}

/// `None` leaves the field alone, an empty string clears it
fn clearable(value: Option<String>) -> Option<Option<String>> {
    value.map(|v| {
        let v = v.trim().to_string();
        (!v.is_empty()).then_some(v)
    })
}
