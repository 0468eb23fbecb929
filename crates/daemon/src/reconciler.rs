//! Reconciliation loop
//!
//! Keeps the live interface in line with the store. The controller is
//! synchronous and shells out to `wg`/`wg-quick`, so every pass runs on the
//! blocking pool.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use wgreg_common::{ApplyReport, Controller, ControllerStatus, Error, ReconcileState};

/// What a reconcile pass should do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing to apply yet
    Skip,
    /// Bring the interface (back) up from the rendered file
    Restart,
    /// Push changed peers into the running interface
    Sync,
    /// Already in sync
    Nothing,
}

/// Decide the action for a status snapshot
pub fn plan(status: &ControllerStatus) -> Action {
    match status.state {
        ReconcileState::Uninitialized => Action::Skip,
        ReconcileState::Provisioning => Action::Restart,
        // Someone took the interface down behind our back
        _ if status.interface_up == Some(false) => Action::Restart,
        // Address, MTU, port and hooks only take effect on a fresh `wg-quick up`
        _ if status.restart_required => Action::Restart,
        ReconcileState::Stale => Action::Sync,
        ReconcileState::Synced => Action::Nothing,
    }
}

/// Reconciler that ensures the live interface matches stored state
pub struct Reconciler {
    controller: Arc<Controller>,
    interval: Duration,
}

impl Reconciler {
    /// Create a new reconciler
    pub fn new(controller: Arc<Controller>, interval: Duration) -> Self {
        Self {
            controller,
            interval,
        }
    }

    /// Startup sequence: a full restart so the interface comes up from a
    /// freshly rendered file, then a hot sync to pick up anything that changed
    /// while it was coming up.
    ///
    /// A missing server is not an error; any apply failure is.
    pub async fn startup(&self) -> anyhow::Result<()> {
        for restart in [true, false] {
            match self.apply(restart).await? {
                Ok(report) => info!(
                    "Startup {} applied to {} ({} peers)",
                    if restart { "restart" } else { "sync" },
                    report.interface,
                    report.peers
                ),
                Err(Error::NotProvisioned) => {
                    info!("No server provisioned yet, waiting for `wgreg server init`");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Run the reconciliation loop
    pub async fn run(&self) {
        info!("Reconciler started (every {:?})", self.interval);

        loop {
            tokio::time::sleep(self.interval).await;

            match self.reconcile_once().await {
                Ok(Action::Nothing) | Ok(Action::Skip) => {}
                Ok(action) => debug!("Reconcile pass finished: {:?}", action),
                Err(e) => error!("Reconciliation error: {:#}", e),
            }
        }
    }

    /// One pass: read status, act on it. Failures are left for the next tick.
    pub async fn reconcile_once(&self) -> anyhow::Result<Action> {
        let controller = self.controller.clone();
        let status = tokio::task::spawn_blocking(move || controller.status()).await??;

        let action = plan(&status);
        let restart = match action {
            Action::Skip | Action::Nothing => return Ok(action),
            Action::Restart => true,
            Action::Sync => false,
        };

        let interface = status.interface.as_deref().unwrap_or("?");
        match (action, status.state) {
            (Action::Restart, ReconcileState::Provisioning) => {
                info!("Bringing up {} from stored state", interface)
            }
            (Action::Restart, _) if status.interface_up == Some(false) => {
                warn!("Interface {} is not up, restarting", interface)
            }
            (Action::Restart, _) => info!("Interface settings of {} changed, restarting", interface),
            _ => info!("Stored state changed, syncing {}", interface),
        }

        self.apply(restart).await??;
        Ok(action)
    }

    async fn apply(&self, restart: bool) -> anyhow::Result<wgreg_common::Result<ApplyReport>> {
        let controller = self.controller.clone();
        Ok(tokio::task::spawn_blocking(move || controller.apply(restart)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use wgreg_common::{Database, InterfaceDriver, Registry, ServerParams, ServerUpdate, Store};

    #[derive(Default)]
    struct FakeDriver {
        calls: Mutex<Vec<&'static str>>,
        up: Mutex<bool>,
    }

    impl InterfaceDriver for FakeDriver {
        fn write_interface_config(&self, _: &str, _: &str) -> wgreg_common::Result<()> {
            self.calls.lock().push("write");
            Ok(())
        }

        fn bring_interface_up(&self, _: &str) -> wgreg_common::Result<()> {
            self.calls.lock().push("up");
            *self.up.lock() = true;
            Ok(())
        }

        fn bring_interface_down(&self, _: &str) -> wgreg_common::Result<()> {
            self.calls.lock().push("down");
            *self.up.lock() = false;
            Ok(())
        }

        fn sync_interface_config(&self, _: &str) -> wgreg_common::Result<()> {
            self.calls.lock().push("sync");
            Ok(())
        }

        fn is_interface_up(&self, _: &str) -> wgreg_common::Result<bool> {
            Ok(*self.up.lock())
        }
    }

    struct Fixture {
        registry: Registry,
        driver: Arc<FakeDriver>,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn Store> = Arc::new(Database::open_memory().unwrap());
        let driver = Arc::new(FakeDriver::default());
        let controller = Arc::new(Controller::new(store.clone(), driver.clone()));
        Fixture {
            registry: Registry::new(store),
            driver,
            reconciler: Reconciler::new(controller, Duration::from_secs(1)),
        }
    }

    fn provision(registry: &Registry) {
        registry
            .bootstrap_server(ServerParams {
                interface: "wg0".to_string(),
                listen_port: 51820,
                subnet: "10.0.0.0/24".parse().unwrap(),
                address: None,
                dns: None,
                mtu: None,
                endpoint: None,
                client_allowed_ips: None,
                persistent_keepalive: None,
                post_up: None,
                post_down: None,
            })
            .unwrap();
    }

    fn status(state: ReconcileState, interface_up: Option<bool>) -> ControllerStatus {
        ControllerStatus {
            state,
            interface: Some("wg0".to_string()),
            interface_up,
            peers: 0,
            desired_digest: None,
            last_apply: None,
            last_error: None,
            restart_required: false,
        }
    }

    #[test]
    fn test_plan() {
        assert_eq!(plan(&status(ReconcileState::Uninitialized, None)), Action::Skip);
        assert_eq!(plan(&status(ReconcileState::Provisioning, Some(false))), Action::Restart);
        assert_eq!(plan(&status(ReconcileState::Synced, Some(true))), Action::Nothing);
        assert_eq!(plan(&status(ReconcileState::Synced, Some(false))), Action::Restart);
        assert_eq!(plan(&status(ReconcileState::Stale, Some(true))), Action::Sync);
        assert_eq!(plan(&status(ReconcileState::Stale, None)), Action::Sync);

        let mut changed = status(ReconcileState::Stale, Some(true));
        changed.restart_required = true;
        assert_eq!(plan(&changed), Action::Restart);
    }

    #[tokio::test]
    async fn test_startup_without_server() {
        let f = fixture();
        f.reconciler.startup().await.unwrap();
        assert!(f.driver.calls.lock().is_empty());
        assert_eq!(f.reconciler.reconcile_once().await.unwrap(), Action::Skip);
    }

    #[tokio::test]
    async fn test_startup_restarts_then_syncs() {
        let f = fixture();
        provision(&f.registry);

        f.reconciler.startup().await.unwrap();
        assert_eq!(*f.driver.calls.lock(), vec!["write", "up", "write", "sync"]);
        assert_eq!(f.reconciler.reconcile_once().await.unwrap(), Action::Nothing);
    }

    #[tokio::test]
    async fn test_new_device_is_synced() {
        let f = fixture();
        provision(&f.registry);
        f.reconciler.startup().await.unwrap();

        let server = f.registry.server().unwrap();
        let user = f.registry.create_user("alice@example.com", None).unwrap();
        f.registry.create_device(&server, &user, "laptop").unwrap();

        assert_eq!(f.reconciler.reconcile_once().await.unwrap(), Action::Sync);
        assert_eq!(f.driver.calls.lock().last(), Some(&"sync"));
        assert_eq!(f.reconciler.reconcile_once().await.unwrap(), Action::Nothing);
    }

    #[tokio::test]
    async fn test_downed_interface_is_restarted() {
        let f = fixture();
        provision(&f.registry);
        f.reconciler.startup().await.unwrap();

        *f.driver.up.lock() = false;
        assert_eq!(f.reconciler.reconcile_once().await.unwrap(), Action::Restart);
        assert!(*f.driver.up.lock());
    }

    #[tokio::test]
    async fn test_interface_settings_change_is_restarted() {
        let f = fixture();
        provision(&f.registry);
        f.reconciler.startup().await.unwrap();

        let change = f
            .registry
            .update_server(ServerUpdate {
                mtu: Some(Some(1380)),
                address: Some("10.0.0.9".parse().unwrap()),
                ..Default::default()
            })
            .unwrap();
        assert!(change.restart_required);

        f.driver.calls.lock().clear();
        assert_eq!(f.reconciler.reconcile_once().await.unwrap(), Action::Restart);
        assert_eq!(*f.driver.calls.lock(), vec!["write", "down", "up"]);
        assert!(*f.driver.up.lock());
        assert_eq!(f.reconciler.reconcile_once().await.unwrap(), Action::Nothing);
    }

    #[tokio::test]
    async fn test_peer_change_after_restart_is_synced() {
        let f = fixture();
        provision(&f.registry);
        f.reconciler.startup().await.unwrap();

        f.registry
            .update_server(ServerUpdate {
                listen_port: Some(51821),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(f.reconciler.reconcile_once().await.unwrap(), Action::Restart);

        let server = f.registry.server().unwrap();
        let user = f.registry.create_user("bob@example.com", None).unwrap();
        f.registry.create_device(&server, &user, "phone").unwrap();

        f.driver.calls.lock().clear();
        assert_eq!(f.reconciler.reconcile_once().await.unwrap(), Action::Sync);
        assert_eq!(*f.driver.calls.lock(), vec!["write", "sync"]);
    }
}
