//! Interface driver: the only OS-facing boundary
//!
//! `WgQuick` drives a kernel WireGuard interface through the `wg` and
//! `wg-quick` tools. Every call blocks until the tool exits.

use crate::{Error, Result};
use std::ffi::OsStr;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use tracing::{debug, info};

/// Operations the controller needs from the platform
pub trait InterfaceDriver: Send + Sync {
    /// Replace the on-disk configuration for `interface`
    fn write_interface_config(&self, interface: &str, config: &str) -> Result<()>;

    fn bring_interface_up(&self, interface: &str) -> Result<()>;

    fn bring_interface_down(&self, interface: &str) -> Result<()>;

    /// Push the on-disk configuration into the running interface without
    /// tearing it down. Peers missing from the file are removed.
    fn sync_interface_config(&self, interface: &str) -> Result<()>;

    fn is_interface_up(&self, interface: &str) -> Result<bool>;
}

/// Driver backed by `wg` / `wg-quick`
#[derive(Debug, Clone)]
pub struct WgQuick {
    wg_path: PathBuf,
    wg_quick_path: PathBuf,
    config_dir: PathBuf,
}

impl WgQuick {
    pub fn new(
        wg_path: impl Into<PathBuf>,
        wg_quick_path: impl Into<PathBuf>,
        config_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            wg_path: wg_path.into(),
            wg_quick_path: wg_quick_path.into(),
            config_dir: config_dir.into(),
        }
    }

    /// Where the configuration for `interface` lives
    pub fn config_path(&self, interface: &str) -> PathBuf {
        self.config_dir.join(format!("{}.conf", interface))
    }

    /// Run a tool to completion, failing on a non-zero exit
    fn run<I, S>(&self, program: &Path, args: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("Running {:?}", command);

        let output = command.output().map_err(|e| Error::Command {
            program: program.display().to_string(),
            message: e.to_string(),
        })?;

        if !output.status.success() {
            return Err(Error::Command {
                program: program.display().to_string(),
                message: format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(output)
    }
}

impl InterfaceDriver for WgQuick {
    fn write_interface_config(&self, interface: &str, config: &str) -> Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;

        // Temp file in the same directory so the rename is atomic
        let mut file = tempfile::Builder::new()
            .prefix(&format!(".{}.", interface))
            .suffix(".tmp")
            .tempfile_in(&self.config_dir)?;
        file.write_all(config.as_bytes())?;
        file.as_file().sync_all()?;
        set_private_permissions(file.path())?;

        let path = self.config_path(interface);
        file.persist(&path).map_err(|e| Error::Io(e.error))?;

        info!("Wrote {} ({} bytes)", path.display(), config.len());
        Ok(())
    }

    fn bring_interface_up(&self, interface: &str) -> Result<()> {
        self.run(&self.wg_quick_path, [OsStr::new("up"), self.config_path(interface).as_os_str()])?;
        info!("Interface {} is up", interface);
        Ok(())
    }

    fn bring_interface_down(&self, interface: &str) -> Result<()> {
        self.run(&self.wg_quick_path, [OsStr::new("down"), self.config_path(interface).as_os_str()])?;
        info!("Interface {} is down", interface);
        Ok(())
    }

    fn sync_interface_config(&self, interface: &str) -> Result<()> {
        // `wg syncconf` only understands the wg(8) subset, so strip the
        // wg-quick keys (Address, MTU, PostUp, ...) first.
        let stripped = self.run(
            &self.wg_quick_path,
            [OsStr::new("strip"), self.config_path(interface).as_os_str()],
        )?;

        let mut file = tempfile::Builder::new()
            .prefix(&format!(".{}.", interface))
            .suffix(".strip")
            .tempfile_in(&self.config_dir)?;
        file.write_all(&stripped.stdout)?;
        file.as_file().sync_all()?;
        set_private_permissions(file.path())?;

        self.run(
            &self.wg_path,
            [OsStr::new("syncconf"), OsStr::new(interface), file.path().as_os_str()],
        )?;

        info!("Synced running configuration of {}", interface);
        Ok(())
    }

    fn is_interface_up(&self, interface: &str) -> Result<bool> {
        let output = self.run(&self.wg_path, ["show", "interfaces"])?;
        let listing = String::from_utf8_lossy(&output.stdout);
        Ok(listing.split_whitespace().any(|name| name == interface))
    }
}

#[cfg(unix)]
fn set_private_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_private_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
