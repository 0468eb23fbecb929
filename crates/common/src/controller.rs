//! Reconciliation controller
//!
//! Brings the live interface into agreement with the stored server and
//! device records. Two modes:
//!
//! - restart: take the interface down (if up) and bring it back from the
//!   freshly written file. Disruptive, but leaves the interface exactly as
//!   rendered.
//! - hot sync: push the new peer set into the running interface. Sessions of
//!   unchanged peers survive; removed peers are pruned.
//!
//! Process start runs a restart pass followed by a hot-sync pass so that
//! records changed while the interface was coming up are folded in.

use crate::model::Server;
use crate::platform::InterfaceDriver;
use crate::render;
use crate::store::Store;
use crate::{ApplyError, ApplyStage, Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Where the live interface stands relative to stored state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileState {
    /// No server record yet
    Uninitialized,
    /// Server exists but this controller has not applied it
    Provisioning,
    /// Live interface matches the last rendered configuration
    Synced,
    /// Stored state changed since the last successful apply
    Stale,
}

impl std::fmt::Display for ReconcileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Provisioning => write!(f, "provisioning"),
            Self::Synced => write!(f, "synced"),
            Self::Stale => write!(f, "stale"),
        }
    }
}

/// Outcome of a successful apply
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    pub interface: String,
    pub restarted: bool,
    pub peers: usize,
    pub digest: String,
    pub applied_at: i64,
}

/// Snapshot returned by [`Controller::status`]
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub state: ReconcileState,
    pub interface: Option<String>,
    /// `None` when the driver could not tell
    pub interface_up: Option<bool>,
    pub peers: usize,
    pub desired_digest: Option<String>,
    pub last_apply: Option<ApplyReport>,
    pub last_error: Option<String>,
    /// Interface-level settings changed since the last apply; a hot sync
    /// cannot carry them
    pub restart_required: bool,
}

/// The part of a server that `wg syncconf` cannot change on a running
/// interface (`wg-quick strip` drops Address, MTU and the hooks)
#[derive(Debug, Clone, PartialEq, Eq)]
struct InterfaceSettings {
    interface: String,
    listen_port: u16,
    subnet: ipnetwork::Ipv4Network,
    address: std::net::Ipv4Addr,
    mtu: Option<u16>,
    post_up: Option<String>,
    post_down: Option<String>,
}

impl From<&Server> for InterfaceSettings {
    fn from(server: &Server) -> Self {
        Self {
            interface: server.interface.clone(),
            listen_port: server.listen_port,
            subnet: server.subnet,
            address: server.address,
            mtu: server.mtu,
            post_up: server.post_up.clone(),
            post_down: server.post_down.clone(),
        }
    }
}

#[derive(Default)]
struct AppliedState {
    last_apply: Option<ApplyReport>,
    last_error: Option<String>,
    settings: Option<InterfaceSettings>,
}

/// Renders stored state and applies it through an [`InterfaceDriver`]
pub struct Controller {
    store: Arc<dyn Store>,
    driver: Arc<dyn InterfaceDriver>,
    /// Held for the whole of an apply so applies never interleave
    applied: Mutex<AppliedState>,
}

impl Controller {
    pub fn new(store: Arc<dyn Store>, driver: Arc<dyn InterfaceDriver>) -> Self {
        Self {
            store,
            driver,
            applied: Mutex::new(AppliedState::default()),
        }
    }

    /// Render the stored state and apply it to the live interface.
    ///
    /// Returns `Error::NotProvisioned` when no server exists. Write and
    /// activation failures come back as `Error::Apply` naming the stage; no
    /// retries are attempted.
    ///
    /// A hot sync becomes a restart when interface-level settings changed
    /// since the last apply.
    pub fn apply(&self, restart: bool) -> Result<ApplyReport> {
        let mut applied = self.applied.lock();

        let result = self.apply_locked(restart, applied.settings.as_ref());
        match result {
            Ok((report, settings)) => {
                applied.last_apply = Some(report.clone());
                applied.last_error = None;
                applied.settings = Some(settings);
                Ok(report)
            }
            Err(Error::NotProvisioned) => Err(Error::NotProvisioned),
            Err(e) => {
                warn!("Apply failed: {}", e);
                applied.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn apply_locked(
        &self,
        restart: bool,
        previous: Option<&InterfaceSettings>,
    ) -> Result<(ApplyReport, InterfaceSettings)> {
        let server = self.store.find_server()?.ok_or(Error::NotProvisioned)?;
        server.validate()?;
        let devices = self.store.all_devices()?;

        // Fully rendered before anything touches the interface
        let config = render::interface_config(&server, &devices);
        let digest = render::digest(&config);
        let interface = server.interface.as_str();
        let settings = InterfaceSettings::from(&server);

        let restart = if !restart && previous.is_some_and(|p| *p != settings) {
            info!("Interface settings of {} changed, restarting instead of syncing", interface);
            true
        } else {
            restart
        };

        self.driver
            .write_interface_config(interface, &config)
            .map_err(|e| ApplyError::new(ApplyStage::WriteConfig, interface, e))?;

        let restarted = if restart {
            self.restart(&server)?;
            true
        } else {
            self.hot_sync(&server)?
        };

        info!(
            "Applied {} ({} peers, {})",
            interface,
            devices.len(),
            if restarted { "restart" } else { "hot sync" }
        );

        let report = ApplyReport {
            interface: interface.to_string(),
            restarted,
            peers: devices.len(),
            digest,
            applied_at: chrono::Utc::now().timestamp(),
        };
        Ok((report, settings))
    }

    fn restart(&self, server: &Server) -> Result<()> {
        let interface = server.interface.as_str();
        let up = self
            .driver
            .is_interface_up(interface)
            .map_err(|e| ApplyError::new(ApplyStage::BringDown, interface, e))?;

        if up {
            self.driver
                .bring_interface_down(interface)
                .map_err(|e| ApplyError::new(ApplyStage::BringDown, interface, e))?;
        }
        self.driver
            .bring_interface_up(interface)
            .map_err(|e| ApplyError::new(ApplyStage::BringUp, interface, e))?;
        Ok(())
    }

    /// Returns true when the interface had to be brought up instead
    fn hot_sync(&self, server: &Server) -> Result<bool> {
        let interface = server.interface.as_str();
        let up = self
            .driver
            .is_interface_up(interface)
            .map_err(|e| ApplyError::new(ApplyStage::Sync, interface, e))?;

        if !up {
            warn!("Interface {} is not up, bringing it up instead of syncing", interface);
            self.driver
                .bring_interface_up(interface)
                .map_err(|e| ApplyError::new(ApplyStage::BringUp, interface, e))?;
            return Ok(true);
        }

        self.driver
            .sync_interface_config(interface)
            .map_err(|e| ApplyError::new(ApplyStage::Sync, interface, e))?;
        Ok(false)
    }

    /// Compare stored state with what was last applied
    pub fn status(&self) -> Result<ControllerStatus> {
        let applied = self.applied.lock();

        let Some(server) = self.store.find_server()? else {
            return Ok(ControllerStatus {
                state: ReconcileState::Uninitialized,
                interface: None,
                interface_up: None,
                peers: 0,
                desired_digest: None,
                last_apply: applied.last_apply.clone(),
                last_error: applied.last_error.clone(),
                restart_required: false,
            });
        };

        let devices = self.store.all_devices()?;
        let desired = render::digest(&render::interface_config(&server, &devices));
        let interface_up = self.driver.is_interface_up(&server.interface).ok();
        let restart_required = applied
            .settings
            .as_ref()
            .is_some_and(|last| *last != InterfaceSettings::from(&server));

        let state = match &applied.last_apply {
            None => ReconcileState::Provisioning,
            Some(last) if last.interface == server.interface && last.digest == desired => {
                ReconcileState::Synced
            }
            Some(_) => ReconcileState::Stale,
        };

        Ok(ControllerStatus {
            state,
            interface: Some(server.interface),
            interface_up,
            peers: devices.len(),
            desired_digest: Some(desired),
            last_apply: applied.last_apply.clone(),
            last_error: applied.last_error.clone(),
            restart_required,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::model::tests::{test_device, test_server};
    use crate::model::User;
    use crate::ErrorKind;
    use std::collections::HashMap;
    use uuid::Uuid;

    /// Driver that records calls and keeps interface state in memory
    #[derive(Default)]
    struct RecordingDriver {
        calls: Mutex<Vec<String>>,
        configs: Mutex<HashMap<String, String>>,
        up: Mutex<bool>,
        fail: Mutex<Option<&'static str>>,
    }

    impl RecordingDriver {
        fn record(&self, call: &'static str, interface: &str) -> Result<()> {
            self.calls.lock().push(format!("{} {}", call, interface));
            if *self.fail.lock() == Some(call) {
                return Err(Error::Command {
                    program: call.to_string(),
                    message: "boom".to_string(),
                });
            }
            Ok(())
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn config(&self, interface: &str) -> Option<String> {
            self.configs.lock().get(interface).cloned()
        }
    }

    impl InterfaceDriver for RecordingDriver {
        fn write_interface_config(&self, interface: &str, config: &str) -> Result<()> {
            self.record("write", interface)?;
            self.configs.lock().insert(interface.to_string(), config.to_string());
            Ok(())
        }

        fn bring_interface_up(&self, interface: &str) -> Result<()> {
            self.record("up", interface)?;
            *self.up.lock() = true;
            Ok(())
        }

        fn bring_interface_down(&self, interface: &str) -> Result<()> {
            self.record("down", interface)?;
            *self.up.lock() = false;
            Ok(())
        }

        fn sync_interface_config(&self, interface: &str) -> Result<()> {
            self.record("sync", interface)
        }

        fn is_interface_up(&self, _interface: &str) -> Result<bool> {
            Ok(*self.up.lock())
        }
    }

    struct Fixture {
        db: Database,
        driver: Arc<RecordingDriver>,
        controller: Controller,
    }

    fn fixture() -> Fixture {
        let db = Database::open_memory().unwrap();
        let driver = Arc::new(RecordingDriver::default());
        let controller = Controller::new(Arc::new(db.clone()), driver.clone());
        Fixture { db, driver, controller }
    }

    fn add_device(db: &Database, address: &str) -> crate::model::Device {
        let user = User {
            id: Uuid::new_v4(),
            email: format!("{}@example.com", Uuid::new_v4()),
            name: None,
            created_at: 0,
        };
        db.create_user(&user).unwrap();
        let mut device = test_device("laptop", address);
        device.user_id = user.id;
        db.create_device(&device).unwrap();
        device
    }

    #[test]
    fn test_not_provisioned() {
        let f = fixture();
        let err = f.controller.apply(true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotProvisioned);
        assert!(f.driver.calls().is_empty());
        assert_eq!(f.controller.status().unwrap().state, ReconcileState::Uninitialized);
    }

    #[test]
    fn test_restart_with_no_devices() {
        let f = fixture();
        let server = test_server("10.0.0.0/24");
        f.db.save_server(&server).unwrap();

        let report = f.controller.apply(true).unwrap();
        assert!(report.restarted);
        assert_eq!(report.peers, 0);

        // Interface was down, so no teardown
        assert_eq!(f.driver.calls(), vec!["write wg0", "up wg0"]);
        let config = f.driver.config("wg0").unwrap();
        assert!(config.contains("[Interface]"));
        assert!(config.contains(&server.private_key));
        assert!(!config.contains("[Peer]"));
    }

    #[test]
    fn test_restart_takes_running_interface_down_first() {
        let f = fixture();
        f.db.save_server(&test_server("10.0.0.0/24")).unwrap();
        *f.driver.up.lock() = true;

        f.controller.apply(true).unwrap();
        assert_eq!(f.driver.calls(), vec!["write wg0", "down wg0", "up wg0"]);
    }

    #[test]
    fn test_hot_sync_leaves_interface_running() {
        let f = fixture();
        f.db.save_server(&test_server("10.0.0.0/24")).unwrap();
        f.controller.apply(true).unwrap();

        let device = add_device(&f.db, "10.0.0.2");
        let report = f.controller.apply(false).unwrap();
        assert!(!report.restarted);
        assert_eq!(report.peers, 1);

        assert_eq!(
            f.driver.calls(),
            vec!["write wg0", "up wg0", "write wg0", "sync wg0"]
        );
        assert!(f.driver.config("wg0").unwrap().contains(&device.public_key));
    }

    #[test]
    fn test_hot_sync_prunes_deleted_peer() {
        let f = fixture();
        f.db.save_server(&test_server("10.0.0.0/24")).unwrap();
        let keep = add_device(&f.db, "10.0.0.2");
        let gone = add_device(&f.db, "10.0.0.3");
        f.controller.apply(true).unwrap();

        f.db.delete_device(&gone).unwrap();
        f.controller.apply(false).unwrap();

        let config = f.driver.config("wg0").unwrap();
        assert!(config.contains(&keep.public_key));
        assert!(!config.contains(&gone.public_key));
    }

    #[test]
    fn test_hot_sync_brings_down_interface_up() {
        let f = fixture();
        f.db.save_server(&test_server("10.0.0.0/24")).unwrap();

        let report = f.controller.apply(false).unwrap();
        assert!(report.restarted);
        assert_eq!(f.driver.calls(), vec!["write wg0", "up wg0"]);
    }

    #[test]
    fn test_write_failure_stops_before_interface() {
        let f = fixture();
        f.db.save_server(&test_server("10.0.0.0/24")).unwrap();
        *f.driver.fail.lock() = Some("write");

        let err = f.controller.apply(true).unwrap_err();
        match err {
            Error::Apply(ref apply) => {
                assert_eq!(apply.stage, ApplyStage::WriteConfig);
                assert_eq!(apply.interface, "wg0");
            }
            ref other => panic!("unexpected error: {other}"),
        }
        assert_eq!(f.driver.calls(), vec!["write wg0"]);

        let status = f.controller.status().unwrap();
        assert_eq!(status.state, ReconcileState::Provisioning);
        assert!(status.last_error.unwrap().contains("writing configuration"));
    }

    #[test]
    fn test_activation_failure_is_distinguished() {
        let f = fixture();
        f.db.save_server(&test_server("10.0.0.0/24")).unwrap();
        f.controller.apply(true).unwrap();
        *f.driver.fail.lock() = Some("sync");

        add_device(&f.db, "10.0.0.2");
        let err = f.controller.apply(false).unwrap_err();
        assert!(matches!(err, Error::Apply(ref e) if e.stage == ApplyStage::Sync));

        *f.driver.fail.lock() = Some("up");
        let err = f.controller.apply(true).unwrap_err();
        assert!(matches!(err, Error::Apply(ref e) if e.stage == ApplyStage::BringUp));
    }

    #[test]
    fn test_invalid_server_is_not_applied() {
        let f = fixture();
        let mut server = test_server("10.0.0.0/24");
        server.interface = "not a valid name".to_string();
        f.db.save_server(&server).unwrap();

        let err = f.controller.apply(true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(f.driver.calls().is_empty());
    }

    #[test]
    fn test_state_transitions() {
        let f = fixture();
        assert_eq!(f.controller.status().unwrap().state, ReconcileState::Uninitialized);

        f.db.save_server(&test_server("10.0.0.0/24")).unwrap();
        assert_eq!(f.controller.status().unwrap().state, ReconcileState::Provisioning);

        f.controller.apply(true).unwrap();
        let status = f.controller.status().unwrap();
        assert_eq!(status.state, ReconcileState::Synced);
        assert_eq!(status.interface_up, Some(true));

        let device = add_device(&f.db, "10.0.0.2");
        let status = f.controller.status().unwrap();
        assert_eq!(status.state, ReconcileState::Stale);
        assert_eq!(status.peers, 1);

        f.controller.apply(false).unwrap();
        assert_eq!(f.controller.status().unwrap().state, ReconcileState::Synced);

        f.db.delete_device(&device).unwrap();
        assert_eq!(f.controller.status().unwrap().state, ReconcileState::Stale);
    }

    #[test]
    fn test_repeated_apply_is_idempotent() {
        let f = fixture();
        f.db.save_server(&test_server("10.0.0.0/24")).unwrap();
        add_device(&f.db, "10.0.0.2");

        let first = f.controller.apply(true).unwrap();
        let first_config = f.driver.config("wg0").unwrap();
        let second = f.controller.apply(false).unwrap();

        assert_eq!(first.digest, second.digest);
        assert_eq!(first_config, f.driver.config("wg0").unwrap());
    }

    #[test]
    fn test_interface_settings_change_forces_restart() {
        let f = fixture();
        let mut server = test_server("10.0.0.0/24");
        f.db.save_server(&server).unwrap();
        f.controller.apply(true).unwrap();
        assert!(!f.controller.status().unwrap().restart_required);

        // Peers only: a hot sync is enough
        add_device(&f.db, "10.0.0.2");
        assert!(!f.controller.status().unwrap().restart_required);
        assert!(!f.controller.apply(false).unwrap().restarted);

        server.mtu = Some(1380);
        f.db.save_server(&server).unwrap();
        let status = f.controller.status().unwrap();
        assert_eq!(status.state, ReconcileState::Stale);
        assert!(status.restart_required);

        f.driver.calls.lock().clear();
        let report = f.controller.apply(false).unwrap();
        assert!(report.restarted);
        assert_eq!(f.driver.calls(), vec!["write wg0", "down wg0", "up wg0"]);
        assert!(f.driver.config("wg0").unwrap().contains("MTU = 1380"));

        let status = f.controller.status().unwrap();
        assert_eq!(status.state, ReconcileState::Synced);
        assert!(!status.restart_required);

        server.post_up = Some("iptables -A FORWARD -i wg0 -j ACCEPT".to_string());
        f.db.save_server(&server).unwrap();
        assert!(f.controller.status().unwrap().restart_required);
    }

    #[test]
    fn test_failed_restart_keeps_restart_required() {
        let f = fixture();
        let mut server = test_server("10.0.0.0/24");
        f.db.save_server(&server).unwrap();
        f.controller.apply(true).unwrap();

        server.listen_port = 51821;
        f.db.save_server(&server).unwrap();
        *f.driver.fail.lock() = Some("up");
        assert!(f.controller.apply(false).is_err());
        assert!(f.controller.status().unwrap().restart_required);
    }
}
