// src/service/namespace.rs

//! Namespace lifecycle: add, delete, resize, QoS limits, load-balancing
//! group moves and I/O statistics.

use crate::core::errors::GwError;
use crate::core::model::{NamespaceEntry, QosEntry};
use crate::core::nqn;
use crate::engine::api::EngineNamespace;
use crate::service::{CallMode, GatewayService};
use crate::store::keys;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

/// One namespace as reported by `list_namespaces`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct NamespaceDetails {
    pub nsid: u32,
    pub bdev_name: String,
    pub uuid: String,
    pub load_balancing_group: u32,
    pub rbd_pool_name: String,
    pub rbd_image_name: String,
    pub block_size: u32,
    pub rbd_image_size: u64,
    pub rw_ios_per_second: u64,
    pub rw_mbytes_per_second: u64,
    pub r_mbytes_per_second: u64,
    pub w_mbytes_per_second: u64,
}

/// Engine I/O counters of one namespace's backing device.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct NamespaceIoStats {
    pub subsystem_nqn: String,
    pub nsid: u32,
    pub uuid: String,
    pub bdev_name: String,
    pub tick_rate: u64,
    pub ticks: u64,
    pub bytes_read: u64,
    pub num_read_ops: u64,
    pub bytes_written: u64,
    pub num_write_ops: u64,
    pub bytes_unmapped: u64,
    pub num_unmap_ops: u64,
    pub read_latency_ticks: u64,
    pub max_read_latency_ticks: u64,
    pub min_read_latency_ticks: u64,
    pub write_latency_ticks: u64,
    pub max_write_latency_ticks: u64,
    pub min_write_latency_ticks: u64,
    pub unmap_latency_ticks: u64,
    pub max_unmap_latency_ticks: u64,
    pub min_unmap_latency_ticks: u64,
    pub copy_latency_ticks: u64,
    pub max_copy_latency_ticks: u64,
    pub min_copy_latency_ticks: u64,
    pub io_error: i64,
}

/// Requested QoS limits; absent fields keep their previously stored value.
#[derive(Debug, Clone, Default)]
pub struct QosLimits {
    pub rw_ios_per_second: Option<u64>,
    pub rw_mbytes_per_second: Option<u64>,
    pub r_mbytes_per_second: Option<u64>,
    pub w_mbytes_per_second: Option<u64>,
}

fn ns_id_message(nsid: Option<u32>, uuid: Option<&str>) -> String {
    match (nsid, uuid) {
        (Some(nsid), Some(uuid)) => format!("using NSID {nsid} and UUID {uuid} "),
        (Some(nsid), None) => format!("using NSID {nsid} "),
        (None, Some(uuid)) => format!("using UUID {uuid} "),
        (None, None) => String::new(),
    }
}

impl GatewayService {
    /// Adds a namespace, allocating the backing device through a cluster
    /// context and optionally pre-creating the backing image.
    pub async fn namespace_add(
        &self,
        req: NamespaceEntry,
        mode: CallMode,
    ) -> Result<u32, GwError> {
        let nsid_msg = ns_id_message(req.nsid, (!req.uuid.is_empty()).then_some(req.uuid.as_str()));
        let err_prefix = format!(
            "Failure adding namespace {nsid_msg}to {}",
            req.subsystem_nqn
        );
        info!(
            "Received request to add a namespace {nsid_msg}to {}, mode: {mode:?}",
            req.subsystem_nqn
        );

        if nqn::is_discovery_nqn(&req.subsystem_nqn) {
            let errmsg = format!("{err_prefix}: Can't add namespaces to a discovery subsystem");
            error!("{errmsg}");
            return Err(GwError::InvalidArgument(errmsg));
        }
        if req.block_size == 0 {
            let errmsg = format!("{err_prefix}: block size can't be zero");
            error!("{errmsg}");
            return Err(GwError::InvalidArgument(errmsg));
        }
        let max_ns = self
            .max_namespaces_of(&req.subsystem_nqn)
            .ok_or_else(|| {
                GwError::NoDevice(format!("{err_prefix}: no such subsystem on this peer"))
            })?;
        if let Some(nsid) = req.nsid {
            if nsid == 0 || nsid > max_ns {
                let errmsg =
                    format!("{err_prefix}: NSID {nsid} is out of range 1..{max_ns}");
                error!("{errmsg}");
                return Err(GwError::InvalidArgument(errmsg));
            }
        }
        if req.anagrpid > max_ns {
            let errmsg = format!(
                "{err_prefix}: Group ID {} is bigger than configured maximum {max_ns}",
                req.anagrpid
            );
            error!("{errmsg}");
            return Err(GwError::InvalidArgument(errmsg));
        }

        let mut req = req;
        if req.uuid.is_empty() {
            req.uuid = Uuid::new_v4().to_string();
        }

        self.guarded(mode, || async {
            if mode.is_authoritative() {
                if let Some(user_nqn) =
                    self.image_used_by(&req.rbd_pool_name, &req.rbd_image_name)
                {
                    let errmsg = format!(
                        "Image {}/{} is already used by a namespace in subsystem {user_nqn}",
                        req.rbd_pool_name, req.rbd_image_name
                    );
                    if req.force {
                        warn!("{errmsg}, will continue as the force argument was used");
                    } else {
                        error!("{errmsg}");
                        return Err(GwError::AlreadyExists(format!(
                            "{errmsg}, either delete the namespace or use the force argument"
                        )));
                    }
                }
            }

            let bdev_name = format!("bdev_{}", req.uuid);
            let create_image = req.create_image && mode.is_authoritative();
            self.create_bdev(
                req.anagrpid,
                &bdev_name,
                &req.uuid,
                &req.rbd_pool_name,
                &req.rbd_image_name,
                req.block_size,
                create_image,
                req.size,
            )
            .await
            .map_err(|e| e.with_prefix(&err_prefix))?;

            let nsid = match self
                .create_namespace_in_engine(
                    &req.subsystem_nqn,
                    &bdev_name,
                    req.nsid,
                    req.anagrpid,
                    &req.uuid,
                )
                .await
            {
                Ok(nsid) => nsid,
                Err(e) => {
                    self.rollback_bdev(&bdev_name).await;
                    return Err(e.with_prefix(&err_prefix));
                }
            };

            if let Some(want) = req.nsid {
                if want != nsid {
                    let errmsg = format!(
                        "{err_prefix}: Returned NSID {nsid} differs from requested one {want}"
                    );
                    error!("{errmsg}");
                    let _ = self
                        .remove_namespace_from_engine(&req.subsystem_nqn, nsid)
                        .await;
                    self.rollback_bdev(&bdev_name).await;
                    return Err(GwError::NoDevice(errmsg));
                }
            }

            if mode.is_authoritative() {
                let mut persisted = req.clone();
                persisted.nsid = Some(nsid);
                let json_req = serde_json::to_string(&persisted)?;
                if let Err(e) = self
                    .persist_add(&keys::namespace_key(&req.subsystem_nqn, nsid), &json_req)
                    .await
                {
                    // Publication failed; roll the engine change back so
                    // peers and this engine agree with the record.
                    let _ = self
                        .remove_namespace_from_engine(&req.subsystem_nqn, nsid)
                        .await;
                    self.rollback_bdev(&bdev_name).await;
                    return Err(e.with_prefix(&format!(
                        "Error persisting namespace {nsid_msg}on {}",
                        req.subsystem_nqn
                    )));
                }
            }
            Ok(nsid)
        })
        .await
    }

    /// Deletes a namespace, its QoS record and its backing device.
    pub async fn namespace_delete(
        &self,
        subsystem_nqn: &str,
        nsid: Option<u32>,
        uuid: Option<&str>,
        mode: CallMode,
    ) -> Result<(), GwError> {
        let nsid_msg = ns_id_message(nsid, uuid);
        let err_prefix = format!("Failure deleting namespace {nsid_msg}from {subsystem_nqn}");
        info!("Received request to delete namespace {nsid_msg}from {subsystem_nqn}, mode: {mode:?}");

        self.guarded(mode, || async {
            let Some((ns, bdev_name)) = self
                .find_namespace_and_bdev(subsystem_nqn, nsid, uuid)
                .await?
            else {
                let errmsg = format!("{err_prefix}: Can't find namespace");
                error!("{errmsg}");
                return Err(GwError::NoDevice(errmsg));
            };
            if bdev_name.is_empty() {
                warn!("Can't find namespace's bdev name, will try to delete namespace anyway");
            }

            self.remove_namespace_from_engine(subsystem_nqn, ns.nsid)
                .await
                .map_err(|e| e.with_prefix(&err_prefix))?;

            if mode.is_authoritative() {
                self.persist_remove_namespace(subsystem_nqn, ns.nsid).await?;
            }

            if !bdev_name.is_empty() {
                self.delete_bdev(&bdev_name)
                    .await
                    .map_err(|e| e.with_prefix(&err_prefix))?;
            }
            Ok(())
        })
        .await
    }

    /// Engine-side resize; the stored record keeps the creation-time size.
    pub async fn namespace_resize(
        &self,
        subsystem_nqn: &str,
        nsid: Option<u32>,
        uuid: Option<&str>,
        new_size_mib: u64,
    ) -> Result<(), GwError> {
        let nsid_msg = ns_id_message(nsid, uuid);
        let err_prefix = format!("Failure resizing namespace {nsid_msg}on {subsystem_nqn}");
        info!(
            "Received request to resize namespace {nsid_msg}on {subsystem_nqn} to {new_size_mib} MiB"
        );

        if new_size_mib == 0 {
            let errmsg = format!("{err_prefix}: new size can't be zero");
            error!("{errmsg}");
            return Err(GwError::InvalidArgument(errmsg));
        }

        let Some((_, bdev_name)) = self
            .find_namespace_and_bdev(subsystem_nqn, nsid, uuid)
            .await?
        else {
            let errmsg = format!("{err_prefix}: Can't find namespace");
            error!("{errmsg}");
            return Err(GwError::NoDevice(errmsg));
        };
        if bdev_name.is_empty() {
            let errmsg = format!("{err_prefix}: Can't find associated block device");
            error!("{errmsg}");
            return Err(GwError::NoDevice(errmsg));
        }

        let _rpc = self.rpc_lock.lock().await;
        let ret = self
            .client
            .bdev_rbd_resize(&bdev_name, new_size_mib)
            .await
            .map_err(|e| e.with_prefix(&err_prefix))?;
        info!("resize_bdev {bdev_name}: {ret}");
        if !ret {
            error!("{err_prefix}");
            return Err(GwError::InvalidArgument(err_prefix));
        }
        Ok(())
    }

    /// Moves a namespace to another load-balancing group by removing and
    /// re-adding it with the same NSID, UUID and backing device. Briefly
    /// leaves the namespace absent; readers during the window observe an
    /// empty slot.
    pub async fn namespace_change_load_balancing_group(
        &self,
        subsystem_nqn: &str,
        nsid: Option<u32>,
        uuid: Option<&str>,
        new_anagrp: u32,
        mode: CallMode,
    ) -> Result<(), GwError> {
        let nsid_msg = ns_id_message(nsid, uuid);
        let err_prefix = format!(
            "Failure changing load balancing group for namespace {nsid_msg}in {subsystem_nqn}"
        );
        info!(
            "Received request to change load balancing group for namespace {nsid_msg}in \
             {subsystem_nqn} to {new_anagrp}, mode: {mode:?}"
        );

        self.guarded(mode, || async {
            let Some((ns, bdev_name)) = self
                .find_namespace_and_bdev(subsystem_nqn, nsid, uuid)
                .await?
            else {
                let errmsg = format!("{err_prefix}: Can't find namespace");
                error!("{errmsg}");
                return Err(GwError::NoDevice(errmsg));
            };
            if let Some(want) = nsid {
                if want != ns.nsid {
                    let errmsg = format!(
                        "{err_prefix}: Returned NSID {} differs from requested one {want}",
                        ns.nsid
                    );
                    error!("{errmsg}");
                    return Err(GwError::NoDevice(errmsg));
                }
            }
            if let Some(want) = uuid {
                if want != ns.uuid {
                    let errmsg = format!(
                        "{err_prefix}: Returned UUID {} differs from requested one {want}",
                        ns.uuid
                    );
                    error!("{errmsg}");
                    return Err(GwError::NoDevice(errmsg));
                }
            }

            // The move must run on the peer owning the current group; other
            // peers answer with a redirect naming the owner.
            if mode.is_authoritative() && ns.anagrpid != 0 {
                let owner_group_id = ns.anagrpid - 1;
                if owner_group_id != self.group_id {
                    let peer = self.peer_name_of_group(owner_group_id).await;
                    error!(
                        "{err_prefix}: namespace is owned by gateway {peer} \
                         (load balancing group {})",
                        ns.anagrpid
                    );
                    return Err(GwError::RemoteOwner { peer });
                }
            }

            let bdev_name = if bdev_name.is_empty() {
                let fallback = format!("bdev_{}", ns.uuid);
                warn!(
                    "Failure finding namespace's associated block device name, \
                     will use {fallback} instead"
                );
                fallback
            } else {
                bdev_name
            };

            let ns_key = keys::namespace_key(subsystem_nqn, ns.nsid);
            let ns_entry: NamespaceEntry = match self.local.get(&ns_key) {
                Some(raw) => serde_json::from_str(&raw).map_err(|_| {
                    GwError::NotFound(format!(
                        "{err_prefix}: Can't get namespace entry from local state"
                    ))
                })?,
                None => {
                    let errmsg =
                        format!("{err_prefix}: Can't get namespace entry from local state");
                    error!("{errmsg}");
                    return Err(GwError::NotFound(errmsg));
                }
            };

            self.remove_namespace_from_engine(subsystem_nqn, ns.nsid)
                .await
                .map_err(|e| e.with_prefix(&err_prefix))?;
            if mode.is_authoritative() {
                self.persist_remove_namespace(subsystem_nqn, ns.nsid).await?;
            }

            self.create_namespace_in_engine(
                subsystem_nqn,
                &bdev_name,
                Some(ns.nsid),
                new_anagrp,
                &ns.uuid,
            )
            .await
            .map_err(|e| e.with_prefix(&err_prefix))?;

            if mode.is_authoritative() {
                let mut persisted = ns_entry;
                persisted.anagrpid = new_anagrp;
                persisted.nsid = Some(ns.nsid);
                let json_req = serde_json::to_string(&persisted)?;
                self.persist_add(&ns_key, &json_req).await.map_err(|e| {
                    e.with_prefix(&format!(
                        "Error persisting change load balancing group for namespace \
                         {nsid_msg}in {subsystem_nqn}"
                    ))
                })?;
            }
            Ok(())
        })
        .await
    }

    /// Applies QoS limits, merging with any previously stored record so
    /// omitted fields keep their values. Zero means unlimited.
    pub async fn namespace_set_qos_limits(
        &self,
        subsystem_nqn: &str,
        nsid: Option<u32>,
        uuid: Option<&str>,
        limits: QosLimits,
        mode: CallMode,
    ) -> Result<(), GwError> {
        let nsid_msg = ns_id_message(nsid, uuid);
        let err_prefix =
            format!("Failure setting QOS limits for namespace {nsid_msg}on {subsystem_nqn}");
        info!(
            "Received request to set QOS limits for namespace {nsid_msg}on {subsystem_nqn}, \
             mode: {mode:?}"
        );

        let Some((ns, bdev_name)) = self
            .find_namespace_and_bdev(subsystem_nqn, nsid, uuid)
            .await?
        else {
            let errmsg = format!("{err_prefix}: Can't find namespace");
            error!("{errmsg}");
            return Err(GwError::NoDevice(errmsg));
        };
        if bdev_name.is_empty() {
            let errmsg = format!("{err_prefix}: Can't find associated block device");
            error!("{errmsg}");
            return Err(GwError::NoDevice(errmsg));
        }

        let mut limits = limits;
        if let Some(rw_ios) = limits.rw_ios_per_second {
            if rw_ios % 1000 != 0 {
                let rounded = rw_ios.div_ceil(1000) * 1000;
                warn!(
                    "R/W IOs per second value {rw_ios} will be rounded up to {rounded}"
                );
                limits.rw_ios_per_second = Some(rounded);
            }
        }

        // Merge with the previous record, omitted fields keep their values.
        if mode.is_authoritative() {
            let qos_key = keys::namespace_qos_key(subsystem_nqn, ns.nsid);
            match self
                .local
                .get(&qos_key)
                .and_then(|raw| serde_json::from_str::<QosEntry>(&raw).ok())
            {
                Some(prev) => {
                    limits.rw_ios_per_second =
                        limits.rw_ios_per_second.or(prev.rw_ios_per_second);
                    limits.rw_mbytes_per_second =
                        limits.rw_mbytes_per_second.or(prev.rw_mbytes_per_second);
                    limits.r_mbytes_per_second =
                        limits.r_mbytes_per_second.or(prev.r_mbytes_per_second);
                    limits.w_mbytes_per_second =
                        limits.w_mbytes_per_second.or(prev.w_mbytes_per_second);
                }
                None => {
                    info!(
                        "No previous QOS limits found, this is the first time the limits \
                         are set for namespace {nsid_msg}on {subsystem_nqn}"
                    );
                }
            }
        }

        self.guarded(mode, || async {
            let mut args = Map::new();
            if let Some(v) = limits.rw_ios_per_second {
                args.insert("rw_ios_per_sec".to_string(), Value::from(v));
            }
            if let Some(v) = limits.rw_mbytes_per_second {
                args.insert("rw_mbytes_per_sec".to_string(), Value::from(v));
            }
            if let Some(v) = limits.r_mbytes_per_second {
                args.insert("r_mbytes_per_sec".to_string(), Value::from(v));
            }
            if let Some(v) = limits.w_mbytes_per_second {
                args.insert("w_mbytes_per_sec".to_string(), Value::from(v));
            }

            let ret = self
                .client
                .bdev_set_qos_limit(&bdev_name, args)
                .await
                .map_err(|e| e.with_prefix(&err_prefix))?;
            info!("bdev_set_qos_limit {bdev_name}: {ret}");
            if !ret {
                error!("{err_prefix}");
                return Err(GwError::InvalidArgument(err_prefix.clone()));
            }

            if mode.is_authoritative() {
                let entry = QosEntry {
                    subsystem_nqn: subsystem_nqn.to_string(),
                    nsid: ns.nsid,
                    rw_ios_per_second: limits.rw_ios_per_second,
                    rw_mbytes_per_second: limits.rw_mbytes_per_second,
                    r_mbytes_per_second: limits.r_mbytes_per_second,
                    w_mbytes_per_second: limits.w_mbytes_per_second,
                };
                let json_req = serde_json::to_string(&entry)?;
                self.persist_add(
                    &keys::namespace_qos_key(subsystem_nqn, ns.nsid),
                    &json_req,
                )
                .await
                .map_err(|e| {
                    e.with_prefix(&format!(
                        "Error persisting namespace QOS settings {nsid_msg}on {subsystem_nqn}"
                    ))
                })?;
            }
            Ok(())
        })
        .await
    }

    /// Reads the engine's per-device I/O counters for one namespace.
    pub async fn namespace_get_io_stats(
        &self,
        subsystem_nqn: &str,
        nsid: Option<u32>,
        uuid: Option<&str>,
    ) -> Result<NamespaceIoStats, GwError> {
        let nsid_msg = ns_id_message(nsid, uuid);
        let err_prefix =
            format!("Failure getting IO stats for namespace {nsid_msg}on {subsystem_nqn}");
        info!("Received request to get IO stats for namespace {nsid_msg}on {subsystem_nqn}");

        let Some((ns, bdev_name)) = self
            .find_namespace_and_bdev(subsystem_nqn, nsid, uuid)
            .await?
        else {
            let errmsg = format!("{err_prefix}: Can't find namespace");
            error!("{errmsg}");
            return Err(GwError::NoDevice(errmsg));
        };
        if bdev_name.is_empty() {
            let errmsg = format!("{err_prefix}: Can't find associated block device");
            error!("{errmsg}");
            return Err(GwError::NoDevice(errmsg));
        }

        let ret = {
            let _rpc = self.rpc_lock.lock().await;
            self.client
                .bdev_get_iostat(&bdev_name)
                .await
                .map_err(|e| e.with_prefix(&err_prefix))?
        };
        if ret.bdevs.is_empty() {
            return Err(GwError::NoDevice(format!(
                "{err_prefix}: No associated block device found"
            )));
        }
        if ret.bdevs.len() > 1 {
            warn!("More than one associated block device found for namespace, will use the first one");
        }
        let bdev = &ret.bdevs[0];
        Ok(NamespaceIoStats {
            subsystem_nqn: subsystem_nqn.to_string(),
            nsid: ns.nsid,
            uuid: ns.uuid,
            bdev_name,
            tick_rate: ret.tick_rate,
            ticks: ret.ticks,
            bytes_read: bdev.bytes_read,
            num_read_ops: bdev.num_read_ops,
            bytes_written: bdev.bytes_written,
            num_write_ops: bdev.num_write_ops,
            bytes_unmapped: bdev.bytes_unmapped,
            num_unmap_ops: bdev.num_unmap_ops,
            read_latency_ticks: bdev.read_latency_ticks,
            max_read_latency_ticks: bdev.max_read_latency_ticks,
            min_read_latency_ticks: bdev.min_read_latency_ticks,
            write_latency_ticks: bdev.write_latency_ticks,
            max_write_latency_ticks: bdev.max_write_latency_ticks,
            min_write_latency_ticks: bdev.min_write_latency_ticks,
            unmap_latency_ticks: bdev.unmap_latency_ticks,
            max_unmap_latency_ticks: bdev.max_unmap_latency_ticks,
            min_unmap_latency_ticks: bdev.min_unmap_latency_ticks,
            copy_latency_ticks: bdev.copy_latency_ticks,
            max_copy_latency_ticks: bdev.max_copy_latency_ticks,
            min_copy_latency_ticks: bdev.min_copy_latency_ticks,
            io_error: bdev.io_error,
        })
    }

    /// Lists namespaces of one subsystem, optionally filtered by NSID or
    /// UUID, enriched with backing-device details.
    pub async fn list_namespaces(
        &self,
        subsystem_nqn: &str,
        nsid_filter: Option<u32>,
        uuid_filter: Option<&str>,
    ) -> Result<Vec<NamespaceDetails>, GwError> {
        let subsystems = self
            .subsystems_client
            .nvmf_get_subsystems(Some(subsystem_nqn))
            .await
            .map_err(|e| e.with_prefix("Failure listing namespaces"))?;

        let mut namespaces = Vec::new();
        for s in subsystems {
            if s.nqn != subsystem_nqn {
                warn!("Got subsystem {} instead of {subsystem_nqn}, ignore", s.nqn);
                continue;
            }
            for n in &s.namespaces {
                if nsid_filter.is_some_and(|want| want != n.nsid) {
                    continue;
                }
                if uuid_filter.is_some_and(|want| want != n.uuid) {
                    continue;
                }
                let mut one_ns = NamespaceDetails {
                    nsid: n.nsid,
                    bdev_name: n.bdev_name.clone(),
                    uuid: n.uuid.clone(),
                    load_balancing_group: n.anagrpid,
                    ..Default::default()
                };
                match self.get_bdev_info(&n.bdev_name).await {
                    Some(bdev) => {
                        one_ns.block_size = bdev.block_size;
                        one_ns.rbd_image_size = bdev.block_size as u64 * bdev.num_blocks;
                        if let Some(ds) = &bdev.driver_specific {
                            if let Some(rbd) = ds.get("rbd") {
                                one_ns.rbd_image_name = rbd
                                    .get("rbd_name")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default()
                                    .to_string();
                                one_ns.rbd_pool_name = rbd
                                    .get("pool_name")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default()
                                    .to_string();
                            }
                        }
                        if let Some(limits) = &bdev.assigned_rate_limits {
                            one_ns.rw_ios_per_second = limits.rw_ios_per_sec;
                            one_ns.rw_mbytes_per_second = limits.rw_mbytes_per_sec;
                            one_ns.r_mbytes_per_second = limits.r_mbytes_per_sec;
                            one_ns.w_mbytes_per_second = limits.w_mbytes_per_sec;
                        }
                    }
                    None => {
                        warn!(
                            "Can't find namespace's bdev {}, will not list bdev's information",
                            n.bdev_name
                        );
                    }
                }
                namespaces.push(one_ns);
            }
            break;
        }
        Ok(namespaces)
    }

    // --- Engine-level helpers ---

    /// Creates the backing device, binding it to a cluster context of the
    /// ANA group and optionally pre-creating the image.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn create_bdev(
        &self,
        anagrp: u32,
        name: &str,
        uuid: &str,
        pool: &str,
        image: &str,
        block_size: u32,
        create_image: bool,
        size_mib: u64,
    ) -> Result<String, GwError> {
        let cr_img_msg = if create_image {
            "will create image if doesn't exist"
        } else {
            "will not create image if doesn't exist"
        };
        info!(
            "Received request to create bdev {name} from {pool}/{image} (size {size_mib} MiB) \
             with block size {block_size}, {cr_img_msg}"
        );

        if create_image {
            if !self.omap.store().pool_exists(pool).await? {
                return Err(GwError::NoDevice(format!(
                    "Failure creating bdev {name}: pool {pool} doesn't exist"
                )));
            }
            match self.omap.store().image_create(pool, image, size_mib).await {
                Ok(true) => info!("Image {image} created"),
                Ok(false) => info!("Image {image} already exists"),
                Err(e) => {
                    error!("Can't create image {image}: {e}");
                    return Err(e.with_prefix(&format!("Failure creating bdev {name}")));
                }
            }
        }

        let cluster_name = self.get_cluster(anagrp).await?;
        let bdev_name = match self
            .client
            .bdev_rbd_create(name, &cluster_name, pool, image, block_size, uuid)
            .await
        {
            Ok(bdev_name) => bdev_name,
            Err(e) => {
                let _ = self.put_cluster(&cluster_name).await;
                error!("bdev_rbd_create {name} failed: {e}");
                return Err(e.with_prefix(&format!("Failure creating bdev {name}")));
            }
        };
        self.regs
            .lock()
            .bdev_cluster
            .insert(name.to_string(), cluster_name);
        info!("bdev_rbd_create: {bdev_name}");
        if bdev_name != name {
            warn!("Created bdev name {bdev_name} differs from requested name {name}");
        }
        Ok(name.to_string())
    }

    /// Deletes the backing device and releases its cluster context.
    pub(crate) async fn delete_bdev(&self, bdev_name: &str) -> Result<bool, GwError> {
        info!("Received request to delete bdev {bdev_name}");
        let ret = self.client.bdev_rbd_delete(bdev_name).await?;
        let cluster = self.regs.lock().bdev_cluster.remove(bdev_name);
        if let Some(cluster) = cluster {
            self.put_cluster(&cluster).await?;
        }
        info!("delete_bdev {bdev_name}: {ret}");
        if !ret {
            return Err(GwError::InvalidArgument(format!(
                "Failure deleting bdev {bdev_name}"
            )));
        }
        Ok(ret)
    }

    async fn rollback_bdev(&self, bdev_name: &str) {
        if let Err(e) = self.delete_bdev(bdev_name).await {
            error!("Got error while trying to delete bdev {bdev_name}: {e}");
        }
    }

    pub(crate) async fn create_namespace_in_engine(
        &self,
        subsystem_nqn: &str,
        bdev_name: &str,
        nsid: Option<u32>,
        anagrpid: u32,
        uuid: &str,
    ) -> Result<u32, GwError> {
        if nqn::is_discovery_nqn(subsystem_nqn) {
            return Err(GwError::InvalidArgument(
                "Can't add namespaces to a discovery subsystem".to_string(),
            ));
        }
        let nsid = self
            .client
            .nvmf_subsystem_add_ns(subsystem_nqn, bdev_name, nsid, anagrpid, uuid)
            .await?;
        info!("subsystem_add_ns: {nsid}");
        let mut regs = self.regs.lock();
        regs.nsid_bdev
            .entry(subsystem_nqn.to_string())
            .or_default()
            .insert(nsid, bdev_name.to_string());
        regs.nsid_anagrp
            .entry(subsystem_nqn.to_string())
            .or_default()
            .insert(nsid, anagrpid);
        Ok(nsid)
    }

    pub(crate) async fn remove_namespace_from_engine(
        &self,
        subsystem_nqn: &str,
        nsid: u32,
    ) -> Result<bool, GwError> {
        if nqn::is_discovery_nqn(subsystem_nqn) {
            return Err(GwError::InvalidArgument(
                "Can't remove a namespace from a discovery subsystem".to_string(),
            ));
        }
        let ret = self
            .client
            .nvmf_subsystem_remove_ns(subsystem_nqn, nsid)
            .await?;
        info!("remove_namespace {nsid}: {ret}");
        let mut regs = self.regs.lock();
        if let Some(m) = regs.nsid_bdev.get_mut(subsystem_nqn) {
            m.remove(&nsid);
        }
        if let Some(m) = regs.nsid_anagrp.get_mut(subsystem_nqn) {
            m.remove(&nsid);
        }
        Ok(ret)
    }

    /// Drops the namespace key and its QoS record, which might not exist.
    pub(crate) async fn persist_remove_namespace(
        &self,
        subsystem_nqn: &str,
        nsid: u32,
    ) -> Result<(), GwError> {
        let qos_key = keys::namespace_qos_key(subsystem_nqn, nsid);
        if self.local.get(&qos_key).is_some() {
            if let Err(e) = self.persist_remove(&qos_key).await {
                error!("Error removing namespace's QOS limits: {e}");
            }
        }
        self.persist_remove(&keys::namespace_key(subsystem_nqn, nsid))
            .await
            .map_err(|e| {
                e.with_prefix(&format!(
                    "Error persisting removal of namespace {nsid} from {subsystem_nqn}"
                ))
            })
    }

    /// Looks up a namespace (and its backing device name) in the engine by
    /// NSID, UUID or both, over the read-only listing socket.
    pub(crate) async fn find_namespace_and_bdev(
        &self,
        subsystem_nqn: &str,
        nsid: Option<u32>,
        uuid: Option<&str>,
    ) -> Result<Option<(EngineNamespace, String)>, GwError> {
        if nsid.is_none() && uuid.is_none() {
            error!("At least one of NSID or UUID should be specified for finding a namespace");
            return Ok(None);
        }
        let subsystems = self
            .subsystems_client
            .nvmf_get_subsystems(Some(subsystem_nqn))
            .await?;
        for s in subsystems {
            if s.nqn != subsystem_nqn {
                warn!("Got subsystem {} instead of {subsystem_nqn}, ignore", s.nqn);
                continue;
            }
            for n in s.namespaces {
                if nsid.is_some_and(|want| want != n.nsid) {
                    continue;
                }
                if uuid.is_some_and(|want| want != n.uuid) {
                    continue;
                }
                let bdev_name = n.bdev_name.clone();
                return Ok(Some((n, bdev_name)));
            }
            break;
        }
        Ok(None)
    }

    pub(crate) async fn get_bdev_info(&self, bdev_name: &str) -> Option<crate::engine::api::BdevInfo> {
        match self.subsystems_client.bdev_get_bdevs(Some(bdev_name)).await {
            Ok(mut bdevs) => {
                if bdevs.len() > 1 {
                    warn!(
                        "Got {} bdevs for bdev name {bdev_name}, will use the first one",
                        bdevs.len()
                    );
                }
                if bdevs.is_empty() {
                    None
                } else {
                    Some(bdevs.remove(0))
                }
            }
            Err(e) => {
                warn!("Got error while getting bdev {bdev_name} info: {e}");
                None
            }
        }
    }

    /// Another namespace already using the same backing image, if any.
    pub(crate) fn image_used_by(&self, pool: &str, image: &str) -> Option<String> {
        if pool.is_empty() || image.is_empty() {
            return None;
        }
        for (_, val) in self.local.prefixed(keys::NAMESPACE_PREFIX) {
            match serde_json::from_str::<NamespaceEntry>(&val) {
                Ok(entry)
                    if entry.rbd_pool_name == pool && entry.rbd_image_name == image =>
                {
                    return Some(entry.subsystem_nqn);
                }
                Ok(_) => {}
                Err(e) => warn!("Got error parsing {val}, will continue: {e}"),
            }
        }
        None
    }

    /// Resolves the peer name owning a group id through the service map.
    pub(crate) async fn peer_name_of_group(&self, group_id: u32) -> String {
        match self.omap.store().service_map().await {
            Ok(map) => map
                .values()
                .find(|meta| meta.group_id == group_id && meta.group == self.gateway_group)
                .map(|meta| meta.id.clone())
                .unwrap_or_else(|| format!("<group {group_id}>")),
            Err(_) => format!("<group {group_id}>"),
        }
    }
}
