//! Device Commands

use anyhow::{Context as _, Result};
use clap::Subcommand;
use serde::Serialize;
use std::path::PathBuf;

use crate::commands::apply::sync_now;
use crate::context::Context;
use crate::output::{format_time, print_info, print_item, print_list, print_success, OutputFormat, TableDisplay};
use wgreg_common::{render, Device};

#[derive(Subcommand)]
pub enum DeviceCommands {
    /// Create a device and allocate its address and keys
    Add {
        /// Owner (id or email)
        user: String,

        /// Device name
        name: String,

        /// Sync the live interface right away instead of waiting for the daemon
        #[arg(long)]
        apply: bool,
    },

    /// List devices
    List {
        /// Only devices owned by this user (id or email)
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Show device details
    Show {
        /// Device id or name
        device: String,
    },

    /// Delete a device and release its address
    Rm {
        /// Device id or name
        device: String,

        /// Sync the live interface right away instead of waiting for the daemon
        #[arg(long)]
        apply: bool,
    },

    /// Print the client configuration for a device
    Config {
        /// Device id or name
        device: String,

        /// Write to a file (mode 0600) instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Device display wrapper for serialization. Never carries the private key.
#[derive(Serialize)]
pub struct DeviceDisplay {
    pub id: String,
    pub name: String,
    pub user_id: String,
    pub address: String,
    pub public_key: String,
    pub created_at: i64,
}

impl From<Device> for DeviceDisplay {
    fn from(device: Device) -> Self {
        Self {
            id: device.id.to_string(),
            name: device.name,
            user_id: device.user_id.to_string(),
            address: device.address.to_string(),
            public_key: device.public_key,
            created_at: device.created_at,
        }
    }
}

impl TableDisplay for DeviceDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Name", "Owner", "Address", "Public Key", "Created"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.name.clone(),
            self.user_id.clone(),
            self.address.clone(),
            self.public_key.clone(),
            format_time(self.created_at),
        ]
    }
}

pub fn execute(cmd: DeviceCommands, ctx: &Context, format: OutputFormat) -> Result<()> {
    match cmd {
        DeviceCommands::Add { user, name, apply } => {
            let server = ctx.registry.server()?;
            let owner = ctx.resolve_user(&user)?;
            let device = ctx.registry.create_device(&server, &owner, &name)?;
            print_success(&format!("Device '{}' created at {}", device.name, device.address));
            print_item(&DeviceDisplay::from(device.clone()), format)?;
            print_info(&format!(
                "Client configuration: `wgreg device config {}`",
                device.id
            ));
            if apply {
                sync_now(ctx)?;
            }
        }

        DeviceCommands::List { user } => {
            let devices = match user {
                Some(reference) => {
                    let owner = ctx.resolve_user(&reference)?;
                    ctx.registry.devices_for_user(owner.id)?
                }
                None => ctx.registry.devices()?,
            };
            let displays: Vec<DeviceDisplay> = devices.into_iter().map(DeviceDisplay::from).collect();
            print_list(&displays, format)?;
        }

        DeviceCommands::Show { device } => {
            let device = ctx.resolve_device(&device)?;
            print_item(&DeviceDisplay::from(device), format)?;
        }

        DeviceCommands::Rm { device, apply } => {
            let device = ctx.resolve_device(&device)?;
            let device = ctx.registry.delete_device(device.id)?;
            print_success(&format!(
                "Device '{}' deleted, {} released",
                device.name, device.address
            ));
            if apply {
                sync_now(ctx)?;
            }
        }

        DeviceCommands::Config { device, output } => {
            let server = ctx.registry.server()?;
            let device = ctx.resolve_device(&device)?;
            let config = render::device_config(&server, &device);

            match output {
                Some(path) => {
                    write_private(&path, &config)
                        .with_context(|| format!("writing {}", path.display()))?;
                    print_success(&format!("Wrote {}", path.display()));
                }
                None => print!("{}", config),
            }
        }
    }

    Ok(())
}

// The file carries the device private key
fn write_private(path: &std::path::Path, content: &str) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(content.as_bytes())
}
