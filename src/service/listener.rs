// src/service/listener.rs

//! Listener lifecycle and the per-listener ANA state fan-out, plus the
//! connection listing joined from engine controllers and qpairs.

use crate::core::errors::GwError;
use crate::core::model::{AnaState, ListenerEntry};
use crate::core::nqn;
use crate::service::{CallMode, GatewayService};
use crate::store::keys;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// One connection as reported by `list_connections`; configured hosts that
/// are not connected appear with `connected == false`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ConnectionDetails {
    pub nqn: String,
    pub traddr: String,
    pub trsvcid: u16,
    pub trtype: String,
    pub adrfam: String,
    pub connected: bool,
    pub qpairs_count: i32,
    pub controller_id: i32,
}

impl GatewayService {
    /// Creates a listener on this peer. Requests naming another peer are an
    /// error from callers but skipped silently during replay, since every
    /// peer replays the whole record.
    pub async fn create_listener(
        &self,
        req: ListenerEntry,
        mode: CallMode,
    ) -> Result<(), GwError> {
        let traddr = nqn::escape_address_if_ipv6(&req.traddr);
        let err_prefix = format!(
            "Failure adding {} listener at {traddr}:{}",
            req.nqn, req.trsvcid
        );
        info!(
            "Received request to create {} TCP {} listener for {} at {traddr}:{}, mode: {mode:?}",
            req.gateway_name, req.adrfam, req.nqn, req.trsvcid
        );

        if nqn::is_discovery_nqn(&req.nqn) {
            let errmsg = format!("{err_prefix}: Can't create a listener for a discovery subsystem");
            error!("{errmsg}");
            return Err(GwError::InvalidArgument(errmsg));
        }
        if req.trsvcid == 0 {
            let errmsg = format!("{err_prefix}: port can't be zero");
            error!("{errmsg}");
            return Err(GwError::InvalidArgument(errmsg));
        }

        self.guarded(mode, || async {
            if req.gateway_name != self.gateway_name {
                if mode.is_authoritative() {
                    let errmsg = format!(
                        "{err_prefix}: Gateway name must match current gateway ({})",
                        self.gateway_name
                    );
                    error!("{errmsg}");
                    return Err(GwError::NoDevice(errmsg));
                }
                info!(
                    "Listener not created as gateway {} differs from requested gateway {}",
                    self.gateway_name, req.gateway_name
                );
                return Ok(());
            }

            // A secure channel and open host access are mutually exclusive.
            if req.secure && self.any_host_allowed(&req.nqn) {
                let errmsg = format!(
                    "{err_prefix}: Secure channel is not allowed with open host access"
                );
                error!("{errmsg}");
                return Err(GwError::InvalidArgument(errmsg));
            }

            if mode.is_authoritative()
                && self.matching_listener_exists(&req.nqn, &req.traddr, req.trsvcid)
            {
                error!(
                    "{} already listens on address {traddr}:{}",
                    req.nqn, req.trsvcid
                );
                return Err(GwError::AlreadyExists(format!(
                    "{err_prefix}: Subsystem already listens on this address"
                )));
            }

            let ret = self
                .client
                .nvmf_subsystem_add_listener(
                    &req.nqn,
                    &req.trtype,
                    &req.traddr,
                    &req.trsvcid.to_string(),
                    req.adrfam.as_engine_str(),
                    req.secure,
                )
                .await
                .map_err(|e| e.with_prefix(&err_prefix))?;
            info!("create_listener: {ret}");
            if !ret {
                error!("{err_prefix}");
                return Err(GwError::InvalidArgument(err_prefix.clone()));
            }

            if self.ha_enabled_for(&req.nqn) {
                if let Err(e) = self.apply_listener_ana_states(&req).await {
                    return Err(e.with_prefix(&format!("{err_prefix}: Error setting ANA state")));
                }
            }

            if mode.is_authoritative() {
                let json_req = serde_json::to_string(&req)?;
                let key = keys::listener_key(
                    &req.nqn,
                    &req.gateway_name,
                    &req.trtype,
                    &req.traddr,
                    req.trsvcid,
                );
                if let Err(e) = self.persist_add(&key, &json_req).await {
                    // Publication failed; take the listener down again so
                    // the record stays authoritative.
                    let _ = self
                        .client
                        .nvmf_subsystem_remove_listener(
                            &req.nqn,
                            &req.trtype,
                            &req.traddr,
                            &req.trsvcid.to_string(),
                            req.adrfam.as_engine_str(),
                        )
                        .await;
                    return Err(e.with_prefix(&format!(
                        "Error persisting listener {traddr}:{}",
                        req.trsvcid
                    )));
                }
            }
            Ok(())
        })
        .await
    }

    /// Pushes this peer's ANA state for every configured group onto a newly
    /// created listener: optimized where the monitor marked this peer
    /// primary, inaccessible otherwise.
    async fn apply_listener_ana_states(&self, req: &ListenerEntry) -> Result<(), GwError> {
        let max_groups = self.max_namespaces_of(&req.nqn).unwrap_or(0);
        for ana_grp in 1..=max_groups {
            let state = {
                let regs = self.regs.lock();
                match regs.ana_map.get(&req.nqn).and_then(|m| m.get(&ana_grp)) {
                    Some(AnaState::Optimized) => AnaState::Optimized,
                    _ => AnaState::Inaccessible,
                }
            };
            info!(
                "create_listener set_ana_state nqn={} group={ana_grp} state={}",
                req.nqn,
                state.as_engine_str()
            );
            let ret = self
                .client
                .nvmf_subsystem_listener_set_ana_state(
                    &req.nqn,
                    &req.trtype,
                    &req.traddr,
                    &req.trsvcid.to_string(),
                    req.adrfam.as_engine_str(),
                    state.as_engine_str(),
                    ana_grp,
                )
                .await?;
            if !ret {
                return Err(GwError::InvalidArgument(format!(
                    "set_ana_state failed for group {ana_grp}"
                )));
            }
        }
        Ok(())
    }

    /// Deletes a listener. `force` is required while open host access is
    /// active or connections are still established through it.
    pub async fn delete_listener(
        &self,
        req: ListenerEntry,
        force: bool,
        mode: CallMode,
    ) -> Result<(), GwError> {
        let traddr = nqn::escape_address_if_ipv6(&req.traddr);
        let err_prefix = format!(
            "Failure deleting listener {traddr}:{} from {}",
            req.trsvcid, req.nqn
        );
        info!(
            "Received request to delete {} TCP listener for {} at {traddr}:{}, mode: {mode:?}",
            req.gateway_name, req.nqn, req.trsvcid
        );

        if nqn::is_discovery_nqn(&req.nqn) {
            let errmsg =
                format!("{err_prefix}: Can't delete a listener from a discovery subsystem");
            error!("{errmsg}");
            return Err(GwError::InvalidArgument(errmsg));
        }

        if mode.is_authoritative() && !force {
            if self.any_host_allowed(&req.nqn) {
                let errmsg = format!(
                    "{err_prefix}: Open host access is enabled, use the force option to \
                     delete the listener anyway"
                );
                error!("{errmsg}");
                return Err(GwError::Busy(errmsg));
            }
            if self.listener_has_active_connections(&req).await {
                let errmsg = format!(
                    "{err_prefix}: There are active connections, use the force option to \
                     delete the listener anyway"
                );
                error!("{errmsg}");
                return Err(GwError::Busy(errmsg));
            }
        }

        self.guarded(mode, || async {
            if req.gateway_name != self.gateway_name {
                let errmsg = format!(
                    "{err_prefix}: Gateway name must match current gateway ({})",
                    self.gateway_name
                );
                error!("{errmsg}");
                return Err(GwError::NotFound(errmsg));
            }

            let key = keys::listener_key(
                &req.nqn,
                &req.gateway_name,
                &req.trtype,
                &req.traddr,
                req.trsvcid,
            );
            match self
                .client
                .nvmf_subsystem_remove_listener(
                    &req.nqn,
                    &req.trtype,
                    &req.traddr,
                    &req.trsvcid.to_string(),
                    req.adrfam.as_engine_str(),
                )
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    error!("{err_prefix}");
                    if mode.is_authoritative() {
                        let _ = self.persist_remove(&key).await;
                    }
                    return Err(GwError::InvalidArgument(err_prefix.clone()));
                }
                Err(e) => {
                    error!("{err_prefix}: {e}");
                    if mode.is_authoritative() {
                        let _ = self.persist_remove(&key).await;
                    }
                    return Err(e.with_prefix(&err_prefix));
                }
            }
            info!("delete_listener: ok");
            if mode.is_authoritative() {
                self.persist_remove(&key).await.map_err(|e| {
                    e.with_prefix(&format!(
                        "Error persisting deletion of listener {traddr}:{} from {}",
                        req.trsvcid, req.nqn
                    ))
                })?;
            }
            Ok(())
        })
        .await
    }

    /// Lists listeners of one subsystem from the stored record.
    pub async fn list_listeners(&self, subsystem_nqn: &str) -> Result<Vec<ListenerEntry>, GwError> {
        let mut listeners = Vec::new();
        for (_, val) in self
            .local
            .prefixed(&keys::partial_listener_key(subsystem_nqn))
        {
            match serde_json::from_str::<ListenerEntry>(&val) {
                Ok(listener) => {
                    if listener.nqn != subsystem_nqn {
                        warn!(
                            "Got subsystem {} instead of {subsystem_nqn}, ignore",
                            listener.nqn
                        );
                        continue;
                    }
                    listeners.push(listener);
                }
                Err(e) => warn!("Got error parsing {val}: {e}"),
            }
        }
        Ok(listeners)
    }

    /// Joins controllers, qpairs and the host list into a connection report.
    pub async fn list_connections(
        &self,
        subsystem_nqn: &str,
    ) -> Result<Vec<ConnectionDetails>, GwError> {
        let qpairs = self
            .subsystems_client
            .nvmf_subsystem_get_qpairs(subsystem_nqn)
            .await
            .map_err(|e| e.with_prefix("Failure listing connections, can't get qpairs"))?;
        let controllers = self
            .subsystems_client
            .nvmf_subsystem_get_controllers(subsystem_nqn)
            .await
            .map_err(|e| e.with_prefix("Failure listing connections, can't get controllers"))?;
        let subsystems = self
            .subsystems_client
            .nvmf_get_subsystems(Some(subsystem_nqn))
            .await
            .map_err(|e| e.with_prefix("Failure listing connections, can't get subsystems"))?;

        let mut host_nqns: Vec<String> = Vec::new();
        for s in &subsystems {
            if s.nqn != subsystem_nqn {
                warn!("Got subsystem {} instead of {subsystem_nqn}, ignore", s.nqn);
                continue;
            }
            host_nqns = s.hosts.iter().map(|h| h.nqn.clone()).collect();
            break;
        }

        let mut connections = Vec::new();
        for conn in &controllers {
            let mut traddr = String::new();
            let mut trsvcid = 0u16;
            let mut trtype = String::new();
            let mut adrfam = String::new();
            for qp in &qpairs {
                if qp.cntlid != conn.cntlid || qp.state != "active" {
                    continue;
                }
                traddr = qp.listen_address.traddr.clone();
                trsvcid = qp.listen_address.trsvcid.parse().unwrap_or(0);
                trtype = qp.listen_address.trtype.to_uppercase();
                adrfam = qp.listen_address.adrfam.to_lowercase();
                break;
            }
            connections.push(ConnectionDetails {
                nqn: conn.hostnqn.clone(),
                traddr,
                trsvcid,
                trtype,
                adrfam,
                connected: true,
                qpairs_count: conn.num_io_qpairs,
                controller_id: conn.cntlid as i32,
            });
            host_nqns.retain(|nqn| nqn != &conn.hostnqn);
        }

        for nqn in host_nqns {
            connections.push(ConnectionDetails {
                nqn,
                traddr: "<n/a>".to_string(),
                connected: false,
                qpairs_count: -1,
                controller_id: -1,
                ..Default::default()
            });
        }
        Ok(connections)
    }

    /// Any listener of the subsystem already bound to the address and port,
    /// regardless of the owning gateway.
    pub(crate) fn matching_listener_exists(
        &self,
        subsystem_nqn: &str,
        traddr: &str,
        trsvcid: u16,
    ) -> bool {
        let key_prefix = keys::partial_listener_key(subsystem_nqn);
        let key_suffix = keys::listener_key_suffix("TCP", traddr, trsvcid);
        self.local
            .prefixed(&key_prefix)
            .iter()
            .any(|(key, _)| key.ends_with(&key_suffix))
    }

    async fn listener_has_active_connections(&self, req: &ListenerEntry) -> bool {
        match self
            .subsystems_client
            .nvmf_subsystem_get_qpairs(&req.nqn)
            .await
        {
            Ok(qpairs) => qpairs.iter().any(|qp| {
                qp.state == "active"
                    && qp.listen_address.traddr == req.traddr
                    && qp.listen_address.trsvcid.parse::<u16>().ok() == Some(req.trsvcid)
            }),
            Err(e) => {
                warn!("Got error while getting qpairs of {}: {e}", req.nqn);
                false
            }
        }
    }
}
