//! User Commands

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;

use crate::context::Context;
use crate::output::{format_time, or_dash, print_item, print_list, print_success, OutputFormat, TableDisplay};
use wgreg_common::User;

#[derive(Subcommand)]
pub enum UserCommands {
    /// Register a device owner
    Add {
        /// Email address
        email: String,

        /// Display name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// List users
    List,
}

/// User display wrapper for serialization
#[derive(Serialize)]
pub struct UserDisplay {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub devices: usize,
    pub created_at: i64,
}

impl UserDisplay {
    fn new(user: User, devices: usize) -> Self {
        Self {
            id: user.id.to_string(),
            email: user.email,
            name: user.name,
            devices,
            created_at: user.created_at,
        }
    }
}

impl TableDisplay for UserDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Email", "Name", "Devices", "Created"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.email.clone(),
            or_dash(self.name.as_ref()),
            self.devices.to_string(),
            format_time(self.created_at),
        ]
    }
}

pub fn execute(cmd: UserCommands, ctx: &Context, format: OutputFormat) -> Result<()> {
    match cmd {
        UserCommands::Add { email, name } => {
            let user = ctx.registry.create_user(&email, name)?;
            print_success(&format!("User '{}' created", user.email));
            print_item(&UserDisplay::new(user, 0), format)?;
        }

        UserCommands::List => {
            let devices = ctx.registry.devices()?;
            let displays: Vec<UserDisplay> = ctx
                .registry
                .users()?
                .into_iter()
                .map(|user| {
                    let count = devices.iter().filter(|d| d.user_id == user.id).count();
                    UserDisplay::new(user, count)
                })
                .collect();
            print_list(&displays, format)?;
        }
    }

    Ok(())
}
