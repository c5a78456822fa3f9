// src/store/omap.rs

//! The persistent group state record: one versioned key/value object per
//! gateway group, mutated exclusively through single-key compare-and-set
//! bundles on the version key.

use crate::core::errors::GwError;
use crate::store::keys::{LEGACY_BDEV_PREFIX, OMAP_VERSION_KEY};
use crate::store::object::ObjectStore;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// The store pages reads; this mirrors the real store's per-call item cap.
const READ_BATCH: usize = 512;

pub struct OmapState {
    store: Arc<dyn ObjectStore>,
    object_name: String,
    /// Last group state version this peer has fully applied.
    version: AtomicU64,
}

impl OmapState {
    /// Opens the group state object, creating it with version 1 if this is
    /// the first gateway of the group.
    pub async fn open(store: Arc<dyn ObjectStore>, object_name: String) -> Result<Self, GwError> {
        let created = store
            .create_exclusive(
                &object_name,
                vec![(OMAP_VERSION_KEY.to_string(), "1".to_string())],
            )
            .await?;
        if created {
            info!("First gateway: created object {object_name}");
        } else {
            info!("{object_name} state object already exists");
        }
        Ok(Self {
            store,
            object_name,
            version: AtomicU64::new(1),
        })
    }

    pub fn object_name(&self) -> &str {
        &self.object_name
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn local_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn set_local_version(&self, version: u64) {
        self.version.store(version, Ordering::SeqCst);
    }

    /// Reads the stored version key alone.
    pub async fn stored_version(&self) -> Result<u64, GwError> {
        let state = self.get_state().await?;
        Self::version_of(&state)
    }

    /// Extracts the version from a full state snapshot.
    pub fn version_of(state: &BTreeMap<String, String>) -> Result<u64, GwError> {
        let raw = state.get(OMAP_VERSION_KEY).ok_or_else(|| {
            GwError::Internal(format!("state object has no {OMAP_VERSION_KEY} key"))
        })?;
        raw.parse::<u64>()
            .map_err(|_| GwError::Internal(format!("invalid {OMAP_VERSION_KEY} value \"{raw}\"")))
    }

    /// Returns all keys and values, reading in batches until exhaustion.
    pub async fn get_state(&self) -> Result<BTreeMap<String, String>, GwError> {
        let mut state = BTreeMap::new();
        let mut last_key = String::new();
        loop {
            let batch = self
                .store
                .get_range(&self.object_name, &last_key, READ_BATCH)
                .await?;
            let Some((key, _)) = batch.last() else {
                break;
            };
            last_key = key.clone();
            state.extend(batch);
        }
        Ok(state)
    }

    /// Adds one key under the CAS protocol: assert the stored version equals
    /// the local one, write the key, bump the version, then notify peers.
    pub async fn add_key(&self, key: &str, val: &str) -> Result<(), GwError> {
        let version = self.local_version();
        let version_update = version + 1;
        self.store
            .write_cas(
                &self.object_name,
                OMAP_VERSION_KEY,
                &version.to_string(),
                &[
                    (key.to_string(), val.to_string()),
                    (OMAP_VERSION_KEY.to_string(), version_update.to_string()),
                ],
                &[],
            )
            .await?;
        self.set_local_version(version_update);
        debug!("omap key generated: {key}");
        self.notify_peers().await;
        Ok(())
    }

    /// Removes one key under the same CAS protocol.
    pub async fn remove_key(&self, key: &str) -> Result<(), GwError> {
        let version = self.local_version();
        let version_update = version + 1;
        self.store
            .write_cas(
                &self.object_name,
                OMAP_VERSION_KEY,
                &version.to_string(),
                &[(OMAP_VERSION_KEY.to_string(), version_update.to_string())],
                &[key.to_string()],
            )
            .await?;
        self.set_local_version(version_update);
        debug!("omap key removed: {key}");
        self.notify_peers().await;
        Ok(())
    }

    /// Clears the record back to an empty version-1 state.
    pub async fn delete_state(&self) -> Result<(), GwError> {
        self.store
            .replace_all(
                &self.object_name,
                vec![(OMAP_VERSION_KEY.to_string(), "1".to_string())],
            )
            .await?;
        self.set_local_version(1);
        info!("Deleted state object contents");
        Ok(())
    }

    /// Installs a watcher signalled on peer notifications.
    pub async fn register_watch(&self, notify: Arc<Notify>) -> Result<(), GwError> {
        self.store.watch(&self.object_name, notify).await
    }

    async fn notify_peers(&self) {
        if let Err(e) = self.store.notify(&self.object_name).await {
            // A missed notification is recovered by the periodic poll.
            warn!("Failed to notify peers of the state change: {e}");
        }
    }

    /// A record still containing `bdev_` keys predates the current layout;
    /// refusing to start is the only safe answer.
    pub fn check_for_legacy_format(state: &BTreeMap<String, String>) -> Result<(), GwError> {
        for key in state.keys() {
            if key.starts_with(LEGACY_BDEV_PREFIX) {
                return Err(GwError::Internal(
                    "Old state object format, still contains bdevs, please remove the object and try again"
                        .to_string(),
                ));
            }
        }
        Ok(())
    }
}
