//! Render, apply and status

use anyhow::Result;
use colored::Colorize;
use serde::Serialize;

use crate::context::Context;
use crate::output::{or_dash, print_item, print_success, OutputFormat, TableDisplay};
use wgreg_common::{allocator, render, ApplyReport, Error, InterfaceDriver};

/// Print the interface configuration that would be written
pub fn print_rendered(ctx: &Context) -> Result<()> {
    let server = ctx.registry.server()?;
    let devices = ctx.registry.devices()?;
    print!("{}", render::interface_config(&server, &devices));
    Ok(())
}

/// Apply stored state to the live interface
pub fn apply(ctx: &Context, restart: bool, format: OutputFormat) -> Result<()> {
    let report = ctx.controller()?.apply(restart)?;
    print_success(&format!(
        "Applied {} with {} peer(s) ({})",
        report.interface,
        report.peers,
        if report.restarted { "restart" } else { "hot sync" }
    ));
    print_item(&ApplyDisplay::from(report), format)
}

/// Hot sync after a device change, when the interface is managed
pub(crate) fn sync_now(ctx: &Context) -> Result<()> {
    match ctx.controller()?.apply(false) {
        Ok(report) => {
            print_success(&format!("Synced {} ({} peers)", report.interface, report.peers));
            Ok(())
        }
        Err(Error::NotProvisioned) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[derive(Serialize)]
pub struct ApplyDisplay {
    pub interface: String,
    pub restarted: bool,
    pub peers: usize,
    pub digest: String,
}

impl From<ApplyReport> for ApplyDisplay {
    fn from(report: ApplyReport) -> Self {
        Self {
            interface: report.interface,
            restarted: report.restarted,
            peers: report.peers,
            digest: report.digest,
        }
    }
}

impl TableDisplay for ApplyDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["Interface", "Restarted", "Peers", "Digest"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.interface.clone(),
            self.restarted.to_string(),
            self.peers.to_string(),
            self.digest.clone(),
        ]
    }
}

/// Whether the configuration file on disk matches stored state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigFileState {
    InSync,
    OutOfDate,
    Missing,
}

impl ConfigFileState {
    pub fn compare(on_disk: Option<&str>, desired: &str) -> Self {
        match on_disk {
            None => Self::Missing,
            Some(text) if render::digest(text) == render::digest(desired) => Self::InSync,
            Some(_) => Self::OutOfDate,
        }
    }

    fn colored(&self) -> String {
        match self {
            Self::InSync => "in sync".green().to_string(),
            Self::OutOfDate => "out of date".yellow().to_string(),
            Self::Missing => "missing".red().to_string(),
        }
    }
}

#[derive(Serialize)]
pub struct StatusDisplay {
    pub interface: String,
    pub subnet: String,
    pub listen_port: u16,
    pub devices: usize,
    pub free_addresses: u32,
    pub managed: bool,
    pub interface_up: Option<bool>,
    pub config_file: ConfigFileState,
    pub config_path: String,
}

impl TableDisplay for StatusDisplay {
    fn headers() -> Vec<&'static str> {
        vec![
            "Interface",
            "Subnet",
            "Port",
            "Devices",
            "Free Addresses",
            "Managed",
            "Interface Up",
            "Config File",
            "Config Path",
        ]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.interface.clone(),
            self.subnet.clone(),
            self.listen_port.to_string(),
            self.devices.to_string(),
            self.free_addresses.to_string(),
            self.managed.to_string(),
            or_dash(self.interface_up),
            self.config_file.colored(),
            self.config_path.clone(),
        ]
    }
}

/// Compare stored state with the host
pub fn status(ctx: &Context, format: OutputFormat) -> Result<()> {
    let server = ctx.registry.server()?;
    let devices = ctx.registry.devices()?;
    let driver = ctx.driver();

    let desired = render::interface_config(&server, &devices);
    let path = driver.config_path(&server.interface);
    // Unreadable (typically not root) counts as missing
    let on_disk = std::fs::read_to_string(&path).ok();

    let managed = ctx.config.wireguard.manage_interface;
    let interface_up = if managed {
        driver.is_interface_up(&server.interface).ok()
    } else {
        None
    };

    let capacity = allocator::usable_hosts(server.subnet, server.address);
    let display = StatusDisplay {
        interface: server.interface.clone(),
        subnet: server.subnet.to_string(),
        listen_port: server.listen_port,
        devices: devices.len(),
        free_addresses: capacity.saturating_sub(devices.len() as u32),
        managed,
        interface_up,
        config_file: ConfigFileState::compare(on_disk.as_deref(), &desired),
        config_path: path.display().to_string(),
    };
    print_item(&display, format)
}
