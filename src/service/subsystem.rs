// src/service/subsystem.rs

//! Subsystem create/delete/list operations.

use crate::core::errors::GwError;
use crate::core::model::SubsystemEntry;
use crate::core::nqn;
use crate::service::{CallMode, GatewayService, CNTLID_RANGE_SIZE};
use crate::store::keys;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// One subsystem as reported by `list_subsystems`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SubsystemDetails {
    pub nqn: String,
    pub enable_ha: bool,
    pub serial_number: String,
    pub model_number: String,
    pub min_cntlid: u32,
    pub max_cntlid: u32,
    pub namespace_count: u32,
    pub subtype: String,
    pub max_namespaces: u32,
}

/// The raw engine view served to the monitor client: namespaces carry the
/// nonce of the cluster context their backing device is bound to.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RawNamespace {
    pub nsid: u32,
    pub bdev_name: String,
    pub uuid: String,
    pub anagrpid: u32,
    pub nonce: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RawSubsystem {
    pub nqn: String,
    pub subtype: String,
    pub serial_number: String,
    pub max_namespaces: u32,
    pub min_cntlid: u32,
    pub max_cntlid: u32,
    pub allow_any_host: bool,
    pub namespaces: Vec<RawNamespace>,
}

impl GatewayService {
    /// Creates a subsystem, allocating this peer's controller-id block.
    pub async fn create_subsystem(
        &self,
        req: SubsystemEntry,
        mode: CallMode,
    ) -> Result<(), GwError> {
        let err_prefix = format!("Failure creating subsystem {}", req.subsystem_nqn);
        info!(
            "Received request to create subsystem {}, enable_ha: {}, mode: {:?}",
            req.subsystem_nqn, req.enable_ha, mode
        );

        if self.config.gateway.verify_nqns {
            nqn::is_valid_nqn(&req.subsystem_nqn).map_err(|e| e.with_prefix(&err_prefix))?;
        }
        if nqn::is_discovery_nqn(&req.subsystem_nqn) {
            let errmsg = format!("{err_prefix}: Can't create a discovery subsystem");
            error!("{errmsg}");
            return Err(GwError::InvalidArgument(errmsg));
        }

        // Controller id range of this peer, per the monitor-assigned group id.
        let offset = self.group_id * CNTLID_RANGE_SIZE;
        let min_cntlid = offset + 1;
        let max_cntlid = offset + CNTLID_RANGE_SIZE;

        let mut req = req;
        if req.serial_number.is_empty() {
            let randser: u64 = rand::thread_rng().gen_range(2..=99999999999999);
            req.serial_number = format!("SPDK{randser}");
            info!(
                "No serial number specified for {}, will use {}",
                req.subsystem_nqn, req.serial_number
            );
        }
        let max_namespaces = if req.max_namespaces == 0 {
            32
        } else {
            req.max_namespaces
        };

        self.guarded(mode, || async {
            if mode.is_authoritative() {
                if self.subsystem_already_exists(&req.subsystem_nqn) {
                    let errmsg = format!("{err_prefix}: Subsystem already exists");
                    error!("{errmsg}");
                    return Err(GwError::AlreadyExists(errmsg));
                }
                if let Some(user) = self.serial_number_already_used(&req.serial_number) {
                    let errmsg = format!(
                        "{err_prefix}: Serial number {} already used by subsystem {user}",
                        req.serial_number
                    );
                    error!("{errmsg}");
                    return Err(GwError::AlreadyExists(errmsg));
                }
            }

            let ret = self
                .client
                .nvmf_create_subsystem(
                    &req.subsystem_nqn,
                    &req.serial_number,
                    max_namespaces,
                    min_cntlid,
                    max_cntlid,
                    req.enable_ha,
                )
                .await
                .map_err(|e| e.with_prefix(&err_prefix))?;
            info!("create_subsystem {}: {ret}", req.subsystem_nqn);
            if !ret {
                error!("{err_prefix}");
                return Err(GwError::InvalidArgument(err_prefix.clone()));
            }

            {
                let mut regs = self.regs.lock();
                regs.subsys_ha
                    .insert(req.subsystem_nqn.clone(), req.enable_ha);
                regs.subsys_max_ns
                    .insert(req.subsystem_nqn.clone(), max_namespaces);
            }

            if mode.is_authoritative() {
                let json_req = serde_json::to_string(&req)?;
                self.persist_add(&keys::subsystem_key(&req.subsystem_nqn), &json_req)
                    .await
                    .map_err(|e| {
                        e.with_prefix(&format!(
                            "Error persisting subsystem {}",
                            req.subsystem_nqn
                        ))
                    })?;
            }
            Ok(())
        })
        .await
    }

    /// Deletes a subsystem. Without `force` any remaining namespace fails
    /// the call with a busy error; with it children are cascaded first.
    pub async fn delete_subsystem(
        &self,
        subsystem_nqn: &str,
        force: bool,
        mode: CallMode,
    ) -> Result<(), GwError> {
        let err_prefix = format!("Failure deleting subsystem {subsystem_nqn}");
        info!("Received request to delete subsystem {subsystem_nqn}, mode: {mode:?}");

        if nqn::is_discovery_nqn(subsystem_nqn) {
            let errmsg = format!("{err_prefix}: Can't delete a discovery subsystem");
            error!("{errmsg}");
            return Err(GwError::InvalidArgument(errmsg));
        }

        if mode.is_authoritative() {
            if self.subsystem_has_listeners(subsystem_nqn) {
                warn!("About to delete subsystem {subsystem_nqn} which has a listener defined");
            }
            let ns_list = self.get_subsystem_namespaces(subsystem_nqn);
            if !force && !ns_list.is_empty() {
                let errmsg = format!(
                    "{err_prefix}: Namespace {} is still using the subsystem. \
                     Either remove it or use the force option",
                    ns_list[0]
                );
                error!("{errmsg}");
                return Err(GwError::Busy(errmsg));
            }
            for nsid in ns_list {
                warn!("Will remove namespace {nsid} from {subsystem_nqn}");
                match self
                    .namespace_delete(subsystem_nqn, Some(nsid), None, mode)
                    .await
                {
                    Ok(()) => {
                        info!("Automatically removed namespace {nsid} from {subsystem_nqn}")
                    }
                    Err(e) => {
                        error!(
                            "Failure removing namespace {nsid} from {subsystem_nqn}: {e}. \
                             Will continue deleting {subsystem_nqn} anyway"
                        );
                    }
                }
            }
        }

        self.guarded(mode, || async {
            let engine_result = self.client.nvmf_delete_subsystem(subsystem_nqn).await;
            {
                let mut regs = self.regs.lock();
                regs.subsys_ha.remove(subsystem_nqn);
                regs.subsys_max_ns.remove(subsystem_nqn);
            }
            match engine_result {
                Ok(true) => {}
                Ok(false) => {
                    error!("{err_prefix}");
                    if mode.is_authoritative() {
                        let _ = self.persist_remove_subsystem(subsystem_nqn).await;
                    }
                    return Err(GwError::InvalidArgument(err_prefix.clone()));
                }
                Err(e) => {
                    error!("{err_prefix}: {e}");
                    // The record is authoritative, keep it consistent even
                    // when the engine refused the deletion.
                    if mode.is_authoritative() {
                        let _ = self.persist_remove_subsystem(subsystem_nqn).await;
                    }
                    return Err(e.with_prefix(&err_prefix));
                }
            }
            info!("delete_subsystem {subsystem_nqn}: ok");
            if mode.is_authoritative() {
                self.persist_remove_subsystem(subsystem_nqn)
                    .await
                    .map_err(|e| {
                        e.with_prefix(&format!(
                            "Error persisting deletion of subsystem {subsystem_nqn}"
                        ))
                    })?;
            }
            Ok(())
        })
        .await
    }

    /// Lists subsystems, optionally filtered by NQN or serial number.
    pub async fn list_subsystems(
        &self,
        nqn_filter: Option<&str>,
        serial_filter: Option<&str>,
    ) -> Result<Vec<SubsystemDetails>, GwError> {
        let ret = self
            .subsystems_client
            .nvmf_get_subsystems(nqn_filter)
            .await
            .map_err(|e| e.with_prefix("Failure listing subsystems"))?;

        let mut subsystems = Vec::new();
        for s in ret {
            if let Some(serial) = serial_filter {
                if s.serial_number != serial {
                    continue;
                }
            }
            let is_nvme = s.subtype.eq_ignore_ascii_case("nvme");
            subsystems.push(SubsystemDetails {
                nqn: s.nqn.clone(),
                enable_ha: if is_nvme {
                    self.ha_enabled_for(&s.nqn)
                } else {
                    false
                },
                serial_number: s.serial_number,
                model_number: s.model_number,
                min_cntlid: s.min_cntlid,
                max_cntlid: s.max_cntlid,
                namespace_count: if is_nvme { s.namespaces.len() as u32 } else { 0 },
                subtype: s.subtype,
                max_namespaces: s.max_namespaces,
            });
        }
        Ok(subsystems)
    }

    /// The raw engine view of all subsystems, with per-namespace group and
    /// cluster-context nonce. Served to the monitor client.
    pub async fn get_subsystems(&self) -> Result<Vec<RawSubsystem>, GwError> {
        info!("Received request to get subsystems");
        let _rpc = self.rpc_lock.lock().await;
        let ret = self
            .client
            .nvmf_get_subsystems(None)
            .await
            .map_err(|e| e.with_prefix("Failure getting subsystems"))?;

        let regs = self.regs.lock();
        let mut subsystems = Vec::new();
        for s in ret {
            let namespaces = s
                .namespaces
                .iter()
                .map(|n| {
                    let anagrpid = regs
                        .nsid_anagrp
                        .get(&s.nqn)
                        .and_then(|m| m.get(&n.nsid))
                        .copied()
                        .unwrap_or(n.anagrpid);
                    let nonce = regs
                        .bdev_cluster
                        .get(&n.bdev_name)
                        .and_then(|cluster| regs.cluster_nonce.get(cluster))
                        .cloned()
                        .unwrap_or_default();
                    RawNamespace {
                        nsid: n.nsid,
                        bdev_name: n.bdev_name.clone(),
                        uuid: n.uuid.clone(),
                        anagrpid,
                        nonce,
                    }
                })
                .collect();
            subsystems.push(RawSubsystem {
                nqn: s.nqn,
                subtype: s.subtype,
                serial_number: s.serial_number,
                max_namespaces: s.max_namespaces,
                min_cntlid: s.min_cntlid,
                max_cntlid: s.max_cntlid,
                allow_any_host: s.allow_any_host,
                namespaces,
            });
        }
        Ok(subsystems)
    }

    // --- Local-state scans backing the uniqueness checks ---

    pub(crate) fn subsystem_already_exists(&self, nqn: &str) -> bool {
        for (_, val) in self.local.prefixed(keys::SUBSYSTEM_PREFIX) {
            match serde_json::from_str::<SubsystemEntry>(&val) {
                Ok(entry) if entry.subsystem_nqn == nqn => return true,
                Ok(_) => {}
                Err(e) => warn!("Got error parsing {val}, will continue: {e}"),
            }
        }
        false
    }

    pub(crate) fn serial_number_already_used(&self, serial: &str) -> Option<String> {
        for (_, val) in self.local.prefixed(keys::SUBSYSTEM_PREFIX) {
            match serde_json::from_str::<SubsystemEntry>(&val) {
                Ok(entry) if entry.serial_number == serial => {
                    return Some(entry.subsystem_nqn)
                }
                Ok(_) => {}
                Err(e) => warn!("Got error parsing {val}: {e}"),
            }
        }
        None
    }

    pub(crate) fn get_subsystem_namespaces(&self, nqn: &str) -> Vec<u32> {
        let mut ns_list = Vec::new();
        for (_, val) in self
            .local
            .prefixed(&keys::namespace_key_prefix(nqn))
        {
            match serde_json::from_str::<crate::core::model::NamespaceEntry>(&val) {
                Ok(entry) => {
                    if let Some(nsid) = entry.nsid {
                        ns_list.push(nsid);
                    }
                }
                Err(e) => warn!("Got error parsing namespace entry of {nqn}: {e}"),
            }
        }
        ns_list
    }

    pub(crate) fn subsystem_has_listeners(&self, nqn: &str) -> bool {
        !self
            .local
            .prefixed(&keys::partial_listener_key(nqn))
            .is_empty()
    }
}
