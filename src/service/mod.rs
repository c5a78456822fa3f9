// src/service/mod.rs

//! The resource service: validates requests, mutates the local target
//! engine, and publishes every change to the persistent group state within
//! the change lease.

pub mod admin;
pub mod cluster;
pub mod grpc;
pub mod host;
pub mod listener;
pub mod namespace;
pub mod subsystem;

use crate::config::Config;
use crate::core::errors::GwError;
use crate::core::model::AnaState;
use crate::engine::EngineClient;
use crate::state::handler::StateHandler;
use crate::store::keys;
use crate::store::{LocalState, OmapLock, OmapState};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::reload;

/// Assuming max of 32 gateways and protocol min 1 max 65519.
pub const CNTLID_RANGE_SIZE: u32 = 2040;

/// Distinguishes caller-initiated mutations from reconciler replays.
/// Replays mutate the local engine only: no change lease, no publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    Authoritative,
    Replay,
}

impl CallMode {
    pub fn is_authoritative(&self) -> bool {
        matches!(self, CallMode::Authoritative)
    }
}

/// Per-peer runtime registries. These are derived state: they are rebuilt
/// by replaying the persistent record and are never persisted themselves.
#[derive(Default)]
pub struct Registries {
    /// (nqn, ana group) -> state pushed by the monitor client.
    pub ana_map: HashMap<String, HashMap<u32, AnaState>>,
    /// ana group -> cluster context name -> live bdev count.
    pub clusters: HashMap<u32, HashMap<String, u32>>,
    pub cluster_nonce: HashMap<String, String>,
    pub bdev_cluster: HashMap<String, String>,
    /// nqn -> nsid -> backing device name.
    pub nsid_bdev: HashMap<String, HashMap<u32, String>>,
    /// nqn -> nsid -> ana group.
    pub nsid_anagrp: HashMap<String, HashMap<u32, u32>>,
    pub subsys_ha: HashMap<String, bool>,
    pub subsys_max_ns: HashMap<String, u32>,
}

pub type LogReloadHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

pub struct GatewayService {
    pub(crate) config: Arc<Config>,
    pub(crate) gateway_name: String,
    pub(crate) gateway_group: String,
    pub(crate) group_id: u32,
    /// Serializes all engine control-socket traffic on this peer. Held for
    /// the whole duration of every mutating operation.
    pub(crate) rpc_lock: AsyncMutex<()>,
    pub(crate) client: Arc<EngineClient>,
    /// Dedicated read-only listing socket, so enumeration never queues
    /// behind mutations.
    pub(crate) subsystems_client: Arc<EngineClient>,
    pub(crate) omap: Arc<OmapState>,
    pub(crate) local: Arc<LocalState>,
    pub(crate) omap_lock: OmapLock,
    pub(crate) regs: parking_lot::Mutex<Registries>,
    pub(crate) spdk_version: parking_lot::Mutex<String>,
    pub(crate) log_level: parking_lot::Mutex<String>,
    pub(crate) log_reload: Option<Arc<LogReloadHandle>>,
    handler: OnceCell<Weak<StateHandler>>,
}

impl GatewayService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        group_id: u32,
        client: Arc<EngineClient>,
        subsystems_client: Arc<EngineClient>,
        omap: Arc<OmapState>,
        local: Arc<LocalState>,
        log_reload: Option<Arc<LogReloadHandle>>,
    ) -> Self {
        let omap_lock = OmapLock::new(Arc::clone(&omap), &config);
        let gateway_name = config.gateway.name.clone();
        let gateway_group = config.gateway.group.clone();
        let log_level = config.logs.log_level.clone();
        info!(
            "Engine bdevs per cluster context: {}",
            config.spdk.bdevs_per_cluster
        );
        Self {
            config,
            gateway_name,
            gateway_group,
            group_id,
            rpc_lock: AsyncMutex::new(()),
            client,
            subsystems_client,
            omap,
            local,
            omap_lock,
            regs: parking_lot::Mutex::new(Registries::default()),
            spdk_version: parking_lot::Mutex::new(String::new()),
            log_level: parking_lot::Mutex::new(log_level),
            log_reload,
            handler: OnceCell::new(),
        }
    }

    pub fn gateway_name(&self) -> &str {
        &self.gateway_name
    }

    pub fn group_id(&self) -> u32 {
        self.group_id
    }

    pub fn local_state(&self) -> &Arc<LocalState> {
        &self.local
    }

    pub fn set_spdk_version(&self, version: String) {
        *self.spdk_version.lock() = version;
    }

    /// Wires the reconciler back-reference used for stale-state recovery.
    pub fn attach_state_handler(&self, handler: &Arc<StateHandler>) {
        let _ = self.handler.set(Arc::downgrade(handler));
    }

    /// Runs `op` with the engine RPC lock held and, in authoritative mode,
    /// inside the change lease. A stale lease acquisition reloads the group
    /// state and retries, up to `omap_file_update_reloads` times.
    pub(crate) async fn guarded<T, Fut>(
        &self,
        mode: CallMode,
        op: impl Fn() -> Fut,
    ) -> Result<T, GwError>
    where
        Fut: Future<Output = Result<T, GwError>>,
    {
        let reloads = self.config.gateway.omap_file_update_reloads.max(1);
        let take_lease = mode.is_authoritative() && self.omap_lock.enabled();
        for _ in 0..reloads {
            let rpc_guard = self.rpc_lock.lock().await;
            if take_lease {
                match self.omap_lock.lock().await {
                    Ok(()) => {}
                    Err(GwError::StaleVersion) => {
                        drop(rpc_guard);
                        Box::pin(self.reload_from_store()).await;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            let result = op().await;
            if take_lease {
                self.omap_lock.unlock().await;
            }
            return result;
        }
        error!(
            "Unable to lock the group state after reloading {} times",
            reloads
        );
        Err(GwError::StaleVersion)
    }

    async fn reload_from_store(&self) {
        let Some(handler) = self.handler.get().and_then(Weak::upgrade) else {
            warn!("No reconciler attached, cannot reload the group state");
            return;
        };
        for _ in 0..10 {
            if handler.update().await {
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    // --- Dual writes against the persistent record and the local mirror ---

    pub(crate) async fn persist_add(&self, key: &str, val: &str) -> Result<(), GwError> {
        self.omap.add_key(key, val).await?;
        self.local.add_key(key, val);
        Ok(())
    }

    pub(crate) async fn persist_remove(&self, key: &str) -> Result<(), GwError> {
        self.omap.remove_key(key).await?;
        self.local.remove_key(key);
        Ok(())
    }

    /// Removes a subsystem and every key referencing it.
    pub(crate) async fn persist_remove_subsystem(&self, nqn: &str) -> Result<(), GwError> {
        self.persist_remove(&keys::subsystem_key(nqn)).await?;

        let state = self.local.get_state();
        let child_prefixes = [
            keys::namespace_key_prefix(nqn),
            keys::namespace_qos_key_prefix(nqn),
            keys::host_key_prefix(nqn),
            keys::partial_listener_key(nqn),
        ];
        for key in state.keys() {
            if child_prefixes.iter().any(|p| key.starts_with(p.as_str())) {
                self.persist_remove(key).await?;
            }
        }
        Ok(())
    }

    // --- Shared registry accessors ---

    pub(crate) fn max_namespaces_of(&self, nqn: &str) -> Option<u32> {
        self.regs.lock().subsys_max_ns.get(nqn).copied()
    }

    pub(crate) fn ha_enabled_for(&self, nqn: &str) -> bool {
        match self.regs.lock().subsys_ha.get(nqn) {
            Some(enable_ha) => *enable_ha,
            None => {
                warn!("Subsystem {nqn} not found");
                false
            }
        }
    }
}
