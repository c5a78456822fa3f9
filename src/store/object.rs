// src/store/object.rs

//! Typed access to the distributed object store: compare-and-set key-value
//! writes, exclusive time-bounded leases, change watchers, backing-image
//! management and the group service map.
//!
//! The trait is the seam towards the real store; `MemoryObjectStore` is the
//! in-process implementation shared by tests and single-host deployments.

use crate::core::errors::GwError;
use crate::core::model::ServiceMeta;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;

/// One key compare plus a batch of writes/removals applied atomically.
/// The compare failing surfaces as `GwError::StaleVersion`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Creates the object with the given initial keys; returns false if it
    /// already existed.
    async fn create_exclusive(
        &self,
        object: &str,
        initial: Vec<(String, String)>,
    ) -> Result<bool, GwError>;

    /// Returns up to `max` entries with keys strictly greater than `after`.
    /// Callers page until an empty batch comes back.
    async fn get_range(
        &self,
        object: &str,
        after: &str,
        max: usize,
    ) -> Result<Vec<(String, String)>, GwError>;

    /// Atomic compare-and-set: asserts `expect_key == expect_val`, then
    /// applies all writes and removals in one step.
    async fn write_cas(
        &self,
        object: &str,
        expect_key: &str,
        expect_val: &str,
        writes: &[(String, String)],
        removes: &[String],
    ) -> Result<(), GwError>;

    /// Replaces the whole object content unconditionally.
    async fn replace_all(&self, object: &str, entries: Vec<(String, String)>)
        -> Result<(), GwError>;

    /// Acquires an exclusive advisory lock on the object. Re-acquiring with
    /// the same cookie renews it; a lock expired for `duration` is reclaimed.
    async fn lease_acquire(
        &self,
        object: &str,
        name: &str,
        cookie: &str,
        description: &str,
        duration: Duration,
    ) -> Result<(), GwError>;

    /// Releases the lock. `NotFound` when the lease already expired.
    async fn lease_release(&self, object: &str, name: &str, cookie: &str) -> Result<(), GwError>;

    /// Registers a watcher signalled on every `notify` for the object.
    async fn watch(&self, object: &str, watcher: Arc<Notify>) -> Result<(), GwError>;

    /// Wakes all watchers of the object.
    async fn notify(&self, object: &str) -> Result<(), GwError>;

    /// Idempotently creates a backing image: an existing image of the same
    /// size is fine, a different size is a conflict. Returns true when the
    /// image was created by this call.
    async fn image_create(
        &self,
        pool: &str,
        image: &str,
        size_mib: u64,
    ) -> Result<bool, GwError>;

    async fn pool_exists(&self, pool: &str) -> Result<bool, GwError>;

    /// Publishes this peer in the group service map.
    async fn service_register(&self, daemon: &str, meta: ServiceMeta) -> Result<(), GwError>;

    async fn service_map(&self) -> Result<HashMap<String, ServiceMeta>, GwError>;
}

#[derive(Default)]
struct ObjectRecord {
    kv: BTreeMap<String, String>,
    watchers: Vec<Weak<Notify>>,
    locks: HashMap<String, LockRecord>,
}

struct LockRecord {
    cookie: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct MemoryInner {
    objects: HashMap<String, ObjectRecord>,
    pools: HashMap<String, HashMap<String, u64>>,
    services: HashMap<String, ServiceMeta>,
}

/// In-process object store with the same observable semantics as the real
/// one: atomic CAS bundles, exclusive leases with expiry, watch/notify.
pub struct MemoryObjectStore {
    inner: Mutex<MemoryInner>,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        let mut inner = MemoryInner::default();
        // The default pool always exists so small setups need no seeding.
        inner.pools.insert("rbd".to_string(), HashMap::new());
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Seeds a pool, for configurations that use a non-default one.
    pub fn add_pool(&self, pool: &str) {
        self.inner
            .lock()
            .pools
            .entry(pool.to_string())
            .or_default();
    }

    fn notify_watchers(record: &mut ObjectRecord) {
        record.watchers.retain(|w| {
            if let Some(n) = w.upgrade() {
                // notify_one banks a permit, so a watcher that is busy right
                // now still observes the notification on its next wait.
                n.notify_one();
                true
            } else {
                false
            }
        });
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn create_exclusive(
        &self,
        object: &str,
        initial: Vec<(String, String)>,
    ) -> Result<bool, GwError> {
        let mut inner = self.inner.lock();
        if inner.objects.contains_key(object) {
            return Ok(false);
        }
        let mut record = ObjectRecord::default();
        record.kv.extend(initial);
        inner.objects.insert(object.to_string(), record);
        Ok(true)
    }

    async fn get_range(
        &self,
        object: &str,
        after: &str,
        max: usize,
    ) -> Result<Vec<(String, String)>, GwError> {
        let inner = self.inner.lock();
        let record = inner
            .objects
            .get(object)
            .ok_or_else(|| GwError::NotFound(format!("object {object} does not exist")))?;
        Ok(record
            .kv
            .range::<str, _>((
                std::ops::Bound::Excluded(after),
                std::ops::Bound::Unbounded,
            ))
            .take(max)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn write_cas(
        &self,
        object: &str,
        expect_key: &str,
        expect_val: &str,
        writes: &[(String, String)],
        removes: &[String],
    ) -> Result<(), GwError> {
        let mut inner = self.inner.lock();
        let record = inner
            .objects
            .get_mut(object)
            .ok_or_else(|| GwError::NotFound(format!("object {object} does not exist")))?;
        if record.kv.get(expect_key).map(String::as_str) != Some(expect_val) {
            return Err(GwError::StaleVersion);
        }
        for key in removes {
            record.kv.remove(key);
        }
        for (key, val) in writes {
            record.kv.insert(key.clone(), val.clone());
        }
        Ok(())
    }

    async fn replace_all(
        &self,
        object: &str,
        entries: Vec<(String, String)>,
    ) -> Result<(), GwError> {
        let mut inner = self.inner.lock();
        let record = inner
            .objects
            .get_mut(object)
            .ok_or_else(|| GwError::NotFound(format!("object {object} does not exist")))?;
        record.kv = entries.into_iter().collect();
        Ok(())
    }

    async fn lease_acquire(
        &self,
        object: &str,
        name: &str,
        cookie: &str,
        _description: &str,
        duration: Duration,
    ) -> Result<(), GwError> {
        let mut inner = self.inner.lock();
        let record = inner.objects.entry(object.to_string()).or_default();
        let expires_at = if duration.is_zero() {
            None
        } else {
            Some(Instant::now() + duration)
        };
        match record.locks.get(name) {
            Some(existing) if existing.cookie != cookie => {
                let expired = existing
                    .expires_at
                    .is_some_and(|deadline| Instant::now() >= deadline);
                if !expired {
                    return Err(GwError::Busy(format!(
                        "lock {name} on {object} is held by another client"
                    )));
                }
                debug!("Reclaiming expired lock {name} on {object}");
            }
            _ => {}
        }
        record.locks.insert(
            name.to_string(),
            LockRecord {
                cookie: cookie.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn lease_release(&self, object: &str, name: &str, cookie: &str) -> Result<(), GwError> {
        let mut inner = self.inner.lock();
        let record = inner
            .objects
            .get_mut(object)
            .ok_or_else(|| GwError::NotFound(format!("object {object} does not exist")))?;
        match record.locks.get(name) {
            Some(existing) if existing.cookie == cookie => {
                record.locks.remove(name);
                Ok(())
            }
            _ => Err(GwError::NotFound(format!(
                "no lock {name} on {object} for this client"
            ))),
        }
    }

    async fn watch(&self, object: &str, watcher: Arc<Notify>) -> Result<(), GwError> {
        let mut inner = self.inner.lock();
        let record = inner.objects.entry(object.to_string()).or_default();
        record.watchers.push(Arc::downgrade(&watcher));
        Ok(())
    }

    async fn notify(&self, object: &str) -> Result<(), GwError> {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.objects.get_mut(object) {
            Self::notify_watchers(record);
        }
        Ok(())
    }

    async fn image_create(&self, pool: &str, image: &str, size_mib: u64) -> Result<bool, GwError> {
        let mut inner = self.inner.lock();
        let pool_images = inner
            .pools
            .get_mut(pool)
            .ok_or_else(|| GwError::NoDevice(format!("pool {pool} doesn't exist")))?;
        match pool_images.get(image) {
            Some(existing) if *existing == size_mib => Ok(false),
            Some(existing) => Err(GwError::AlreadyExists(format!(
                "image {pool}/{image} already exists with size {existing} MiB"
            ))),
            None => {
                pool_images.insert(image.to_string(), size_mib);
                Ok(true)
            }
        }
    }

    async fn pool_exists(&self, pool: &str) -> Result<bool, GwError> {
        Ok(self.inner.lock().pools.contains_key(pool))
    }

    async fn service_register(&self, daemon: &str, meta: ServiceMeta) -> Result<(), GwError> {
        self.inner.lock().services.insert(daemon.to_string(), meta);
        Ok(())
    }

    async fn service_map(&self) -> Result<HashMap<String, ServiceMeta>, GwError> {
        Ok(self.inner.lock().services.clone())
    }
}
