// src/state/handler.rs

//! The state reconciler: keeps this peer's target engine consistent with
//! the persistent group state by diffing snapshots and replaying entries
//! through the resource service in dependency order.

use crate::core::errors::GwError;
use crate::core::model::{HostEntry, ListenerEntry, NamespaceEntry, QosEntry, SubsystemEntry};
use crate::service::{CallMode, GatewayService};
use crate::store::keys::{self, PREFIX_DISPATCH_ORDER};
use crate::store::{LocalState, OmapState};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Notify};
use tracing::{debug, error, info, warn};

const UPDATE_BUS_CAPACITY: usize = 64;

/// Summary of one reconciled round, broadcast to interested components
/// (the discovery responder fires async events off it).
#[derive(Debug, Clone, Default)]
pub struct StateDelta {
    /// Keys added or changed in this round.
    pub added: Vec<String>,
    /// Keys removed in this round.
    pub removed: Vec<String>,
}

impl StateDelta {
    /// True when the delta touches the discovery-relevant topology.
    pub fn touches_topology(&self) -> bool {
        self.added
            .iter()
            .chain(self.removed.iter())
            .any(|key| {
                key.starts_with(keys::SUBSYSTEM_PREFIX) || key.starts_with(keys::LISTENER_PREFIX)
            })
    }
}

pub struct StateHandler {
    service: Arc<GatewayService>,
    omap: Arc<OmapState>,
    local: Arc<LocalState>,
    update_interval: Duration,
    use_notify: bool,
    notify: Arc<Notify>,
    /// Collapses re-entrant triggers: while a round runs, new triggers are
    /// dropped and picked up by the next tick.
    update_busy: Mutex<()>,
    bus: broadcast::Sender<StateDelta>,
}

impl StateHandler {
    pub fn new(
        service: Arc<GatewayService>,
        omap: Arc<OmapState>,
        local: Arc<LocalState>,
        update_interval_sec: u64,
        use_notify: bool,
    ) -> Arc<Self> {
        let update_interval_sec = if update_interval_sec < 1 {
            info!("Invalid state update interval. Setting to 1.");
            1
        } else {
            update_interval_sec
        };
        let (bus, _) = broadcast::channel(UPDATE_BUS_CAPACITY);
        Arc::new(Self {
            service,
            omap,
            local,
            update_interval: Duration::from_secs(update_interval_sec),
            use_notify,
            notify: Arc::new(Notify::new()),
            update_busy: Mutex::new(()),
            bus,
        })
    }

    /// Receiver of per-round change summaries.
    pub fn subscribe(&self) -> broadcast::Receiver<StateDelta> {
        self.bus.subscribe()
    }

    /// Wakes the reconciliation loop out of turn.
    pub fn trigger(&self) {
        self.notify.notify_one();
    }

    /// Installs the store watcher and spawns the periodic update loop.
    pub async fn start(self: &Arc<Self>) -> Result<tokio::task::JoinHandle<()>, GwError> {
        if self.use_notify {
            self.omap.register_watch(Arc::clone(&self.notify)).await?;
        }
        let handler = Arc::clone(self);
        Ok(tokio::spawn(async move {
            handler.run().await;
        }))
    }

    async fn run(self: Arc<Self>) {
        loop {
            let next_tick = tokio::time::Instant::now() + self.update_interval;
            self.update().await;
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(next_tick) => {}
            }
        }
    }

    /// Checks for an updated group state and converges the local engine on
    /// it. Returns false when another round was already in flight or the
    /// remote state could not be read.
    pub async fn update(&self) -> bool {
        let Ok(_busy) = self.update_busy.try_lock() else {
            warn!("An update is already running, ignore");
            return false;
        };

        let omap_state = match self.omap.get_state().await {
            Ok(state) => state,
            Err(e) => {
                error!("Failed to read the group state: {e}");
                return false;
            }
        };
        let omap_version = match OmapState::version_of(&omap_state) {
            Ok(v) => v,
            Err(e) => {
                error!("Failed to read the group state version: {e}");
                return false;
            }
        };

        if self.omap.local_version() >= omap_version {
            return true;
        }

        let local_state = self.local.get_state();

        // Diff the two snapshots.
        let mut added: BTreeMap<&str, &str> = BTreeMap::new();
        let mut changed: BTreeMap<&str, &str> = BTreeMap::new();
        let mut removed: BTreeMap<&str, &str> = BTreeMap::new();
        for (key, val) in omap_state.iter() {
            match local_state.get(key) {
                None => {
                    added.insert(key, val);
                }
                Some(local_val) if local_val != val => {
                    changed.insert(key, val);
                }
                Some(_) => {}
            }
        }
        for (key, val) in local_state.iter() {
            if !omap_state.contains_key(key) {
                removed.insert(key, val);
            }
        }

        // Removals first (and the remove half of changes), children before
        // parents; then additions, parents before children.
        for prefix in PREFIX_DISPATCH_ORDER.iter().rev() {
            for (key, val) in removed.iter().chain(changed.iter()) {
                if key.starts_with(prefix) {
                    self.dispatch(key, val, false).await;
                }
            }
        }
        for prefix in PREFIX_DISPATCH_ORDER.iter() {
            for (key, val) in added.iter().chain(changed.iter()) {
                if key.starts_with(prefix) {
                    self.dispatch(key, val, true).await;
                }
            }
        }

        let delta = StateDelta {
            added: added
                .keys()
                .chain(changed.keys())
                .map(|k| k.to_string())
                .collect(),
            removed: removed.keys().map(|k| k.to_string()).collect(),
        };
        drop(added);
        drop(changed);
        drop(removed);

        // Commit: the local mirror becomes the remote snapshot.
        self.local.replace(omap_state);
        self.omap.set_local_version(omap_version);
        let _ = self.bus.send(delta);
        debug!("Update complete.");
        true
    }

    /// Reconstructs the typed request from the stored JSON value and
    /// replays it against the local engine. Replay failures are logged and
    /// skipped; the next round retries from authoritative state.
    async fn dispatch(&self, key: &str, val: &str, is_add: bool) {
        let result = self.dispatch_inner(key, val, is_add).await;
        if let Err(e) = result {
            error!("Replay of {key} (add: {is_add}) failed: {e}");
        }
    }

    async fn dispatch_inner(&self, key: &str, val: &str, is_add: bool) -> Result<(), GwError> {
        let svc = &self.service;
        if key.starts_with(keys::SUBSYSTEM_PREFIX) {
            let entry: SubsystemEntry = serde_json::from_str(val)?;
            if is_add {
                svc.create_subsystem(entry, CallMode::Replay).await?;
            } else {
                svc.delete_subsystem(&entry.subsystem_nqn, false, CallMode::Replay)
                    .await?;
            }
        } else if key.starts_with(keys::NAMESPACE_PREFIX) {
            let entry: NamespaceEntry = serde_json::from_str(val)?;
            if is_add {
                svc.namespace_add(entry, CallMode::Replay).await?;
            } else {
                svc.namespace_delete(
                    &entry.subsystem_nqn,
                    entry.nsid,
                    (!entry.uuid.is_empty()).then_some(entry.uuid.as_str()),
                    CallMode::Replay,
                )
                .await?;
            }
        } else if key.starts_with(keys::NAMESPACE_QOS_PREFIX) {
            if is_add {
                let entry: QosEntry = serde_json::from_str(val)?;
                let limits = crate::service::namespace::QosLimits {
                    rw_ios_per_second: entry.rw_ios_per_second,
                    rw_mbytes_per_second: entry.rw_mbytes_per_second,
                    r_mbytes_per_second: entry.r_mbytes_per_second,
                    w_mbytes_per_second: entry.w_mbytes_per_second,
                };
                svc.namespace_set_qos_limits(
                    &entry.subsystem_nqn,
                    Some(entry.nsid),
                    None,
                    limits,
                    CallMode::Replay,
                )
                .await?;
            }
            // QoS removal is covered by the namespace deletion.
        } else if key.starts_with(keys::HOST_PREFIX) {
            let entry: HostEntry = serde_json::from_str(val)?;
            if is_add {
                svc.add_host(entry, CallMode::Replay).await?;
            } else {
                svc.remove_host(&entry.subsystem_nqn, &entry.host_nqn, CallMode::Replay)
                    .await?;
            }
        } else if key.starts_with(keys::LISTENER_PREFIX) {
            let entry: ListenerEntry = serde_json::from_str(val)?;
            if is_add {
                svc.create_listener(entry, CallMode::Replay).await?;
            } else {
                svc.delete_listener(entry, true, CallMode::Replay).await?;
            }
        }
        Ok(())
    }
}
