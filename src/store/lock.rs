// src/store/lock.rs

//! The coarse-grained change lease taken around every caller-initiated write
//! sequence against the group state object.

use crate::config::Config;
use crate::core::errors::GwError;
use crate::store::omap::OmapState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const OMAP_FILE_LOCK_NAME: &str = "omap_file_lock";
const OMAP_FILE_LOCK_COOKIE: &str = "omap_file_cookie";
const OMAP_FILE_LOCK_DESC: &str = "OMAP file changes lock";

pub struct OmapLock {
    omap: Arc<OmapState>,
    /// Lock identity of this peer; leases are per holder.
    cookie: String,
    duration: Duration,
    retries: u32,
    retry_sleep: Duration,
    /// Testing only: skip the release so another peer observes contention.
    disable_unlock: bool,
    locked: AtomicBool,
}

impl OmapLock {
    pub fn new(omap: Arc<OmapState>, config: &Config) -> Self {
        if config.gateway.omap_file_disable_unlock {
            warn!("Will not unlock the state object, for testing purposes");
        }
        Self {
            omap,
            cookie: format!("{OMAP_FILE_LOCK_COOKIE}.{}", config.gateway.name),
            duration: Duration::from_secs(config.gateway.omap_file_lock_duration),
            retries: config.gateway.omap_file_lock_retries,
            retry_sleep: Duration::from_secs(config.gateway.omap_file_lock_retry_sleep_interval),
            disable_unlock: config.gateway.omap_file_disable_unlock,
            locked: AtomicBool::new(false),
        }
    }

    /// A zero duration disables locking altogether.
    pub fn enabled(&self) -> bool {
        !self.duration.is_zero()
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Acquires the lease with bounded retries, then verifies the stored
    /// version matches the local one. A newer stored version releases the
    /// lease and surfaces `StaleVersion` so the caller reconciles first.
    pub async fn lock(&self) -> Result<(), GwError> {
        let mut got_lock = false;
        for attempt in 1..self.retries.max(2) {
            match self
                .omap
                .store()
                .lease_acquire(
                    self.omap.object_name(),
                    OMAP_FILE_LOCK_NAME,
                    &self.cookie,
                    OMAP_FILE_LOCK_DESC,
                    self.duration,
                )
                .await
            {
                Ok(()) => {
                    got_lock = true;
                    if attempt > 1 {
                        info!("Succeeded to lock the state object after {attempt} tries");
                    }
                    break;
                }
                Err(GwError::Busy(_)) => {
                    warn!(
                        "The state object is locked, will try again in {} seconds",
                        self.retry_sleep.as_secs()
                    );
                    tokio::time::sleep(self.retry_sleep).await;
                }
                Err(e) => {
                    error!("Unable to lock the state object: {e}");
                    return Err(e);
                }
            }
        }

        if !got_lock {
            error!(
                "Unable to lock the state object after {} tries",
                self.retries
            );
            return Err(GwError::Busy(
                "Unable to lock the state object".to_string(),
            ));
        }

        self.locked.store(true, Ordering::SeqCst);

        let stored = self.omap.stored_version().await?;
        let local = self.omap.local_version();
        if stored > local {
            warn!(
                "Local version {local} differs from stored version {stored}. \
                 The record is not current, will reload it and try again"
            );
            self.unlock().await;
            return Err(GwError::StaleVersion);
        }
        Ok(())
    }

    pub async fn unlock(&self) {
        if self.disable_unlock {
            warn!("State object unlock was disabled, will not unlock");
            return;
        }
        match self
            .omap
            .store()
            .lease_release(
                self.omap.object_name(),
                OMAP_FILE_LOCK_NAME,
                &self.cookie,
            )
            .await
        {
            Ok(()) => {
                self.locked.store(false, Ordering::SeqCst);
            }
            Err(GwError::NotFound(_)) => {
                warn!("No such lock, the lock duration might have passed");
                self.locked.store(false, Ordering::SeqCst);
            }
            Err(e) => {
                error!("Unable to unlock the state object: {e}");
            }
        }
    }
}
