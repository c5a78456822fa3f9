// src/service/cluster.rs

//! Cluster-context allocation: the engine binds each backing device to a
//! store connection context, bounded by `bdevs_per_cluster` devices per
//! context. Contexts are per-peer and never persisted.

use crate::core::errors::GwError;
use crate::service::GatewayService;
use tracing::info;

impl GatewayService {
    /// Picks a context with remaining capacity for the ANA group, creating
    /// the next `cluster_context_<anagrp>_<n>` when all are full. Existing
    /// contexts are scanned in index order, so devices pack into the
    /// earliest context with room. The chosen context's device count is
    /// incremented.
    pub(crate) async fn get_cluster(&self, anagrp: u32) -> Result<String, GwError> {
        let existing = {
            let mut regs = self.regs.lock();
            let contexts = regs.clusters.entry(anagrp).or_default();
            let mut candidates: Vec<(u32, String)> = contexts
                .keys()
                .filter_map(|name| {
                    name.rsplit('_')
                        .next()
                        .and_then(|idx| idx.parse::<u32>().ok())
                        .map(|idx| (idx, name.clone()))
                })
                .collect();
            candidates.sort_unstable();
            let mut found = None;
            for (_, name) in candidates {
                if let Some(count) = contexts.get_mut(&name) {
                    if *count < self.config.spdk.bdevs_per_cluster {
                        *count += 1;
                        found = Some(name);
                        break;
                    }
                }
            }
            found
        };
        if let Some(name) = existing {
            return Ok(name);
        }
        self.alloc_cluster(anagrp).await
    }

    /// Registers a fresh context with the engine at the first free index of
    /// the group and records its nonce.
    async fn alloc_cluster(&self, anagrp: u32) -> Result<String, GwError> {
        let name = {
            let regs = self.regs.lock();
            let contexts = regs.clusters.get(&anagrp);
            let mut x = 0u32;
            loop {
                let candidate = format!("cluster_context_{anagrp}_{x}");
                if !contexts.is_some_and(|c| c.contains_key(&candidate)) {
                    break candidate;
                }
                x += 1;
            }
        };

        let user = if self.config.store.id.is_empty() {
            None
        } else {
            Some(self.config.store.id.as_str())
        };
        let core_mask = if self.config.spdk.librbd_core_mask.is_empty() {
            None
        } else {
            Some(self.config.spdk.librbd_core_mask.as_str())
        };
        let nonce = self
            .client
            .bdev_rbd_register_cluster(&name, user, core_mask)
            .await?;
        info!("Allocated cluster {name}, nonce {nonce}");

        let mut regs = self.regs.lock();
        regs.clusters
            .entry(anagrp)
            .or_default()
            .insert(name.clone(), 1);
        regs.cluster_nonce.insert(name.clone(), nonce);
        Ok(name)
    }

    /// Drops one device reference; the context is unregistered from the
    /// engine once the last device using it goes away.
    pub(crate) async fn put_cluster(&self, name: &str) -> Result<(), GwError> {
        let remove = {
            let mut regs = self.regs.lock();
            let mut remove = false;
            let mut found = false;
            for contexts in regs.clusters.values_mut() {
                if let Some(count) = contexts.get_mut(name) {
                    found = true;
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        contexts.remove(name);
                        remove = true;
                    }
                    break;
                }
            }
            if !found {
                return Err(GwError::Internal(format!(
                    "cluster context {name} is not tracked by this peer"
                )));
            }
            remove
        };

        if remove {
            let ret = self.client.bdev_rbd_unregister_cluster(name).await?;
            info!("Free cluster name={name} ret={ret}");
            self.regs.lock().cluster_nonce.remove(name);
        }
        Ok(())
    }

    /// Number of live devices currently bound to the context, if any.
    pub fn cluster_refcount(&self, name: &str) -> Option<u32> {
        let regs = self.regs.lock();
        regs.clusters
            .values()
            .find_map(|contexts| contexts.get(name).copied())
    }
}
