// src/service/host.rs

//! Host access grants, including the `*` open-access wildcard and the
//! secure-channel credential rules.

use crate::core::errors::GwError;
use crate::core::model::{HostEntry, ListenerEntry};
use crate::core::nqn;
use crate::service::{CallMode, GatewayService};
use crate::store::keys;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// One host as reported by `list_hosts`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct HostDetails {
    pub nqn: String,
    pub use_psk: bool,
    pub use_dhchap: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct HostsList {
    pub allow_any_host: bool,
    pub hosts: Vec<HostDetails>,
}

impl GatewayService {
    /// Allows one host (or any host with `*`) access to a subsystem.
    pub async fn add_host(&self, req: HostEntry, mode: CallMode) -> Result<(), GwError> {
        let any_host = req.host_nqn == "*";
        let err_prefix = if any_host {
            format!("Failure allowing open host access to {}", req.subsystem_nqn)
        } else {
            format!(
                "Failure adding host {} to {}",
                req.host_nqn, req.subsystem_nqn
            )
        };

        if self.config.gateway.verify_nqns {
            nqn::is_valid_host_nqn(&req.host_nqn).map_err(|e| e.with_prefix(&err_prefix))?;
        }
        if nqn::is_discovery_nqn(&req.subsystem_nqn) {
            let errmsg = if any_host {
                format!("{err_prefix}: Can't allow host access to a discovery subsystem")
            } else {
                format!("{err_prefix}: Can't add host to a discovery subsystem")
            };
            error!("{errmsg}");
            return Err(GwError::InvalidArgument(errmsg));
        }
        if nqn::is_discovery_nqn(&req.host_nqn) {
            let errmsg = format!("{err_prefix}: Can't use a discovery NQN as host's");
            error!("{errmsg}");
            return Err(GwError::InvalidArgument(errmsg));
        }

        // Credentials make no sense for open access.
        if any_host
            && (req.psk.is_some() || req.dhchap_key.is_some() || req.dhchap_ctrlr_key.is_some())
        {
            let errmsg = format!("{err_prefix}: Can't use keys with open host access");
            error!("{errmsg}");
            return Err(GwError::InvalidArgument(errmsg));
        }
        if req.dhchap_ctrlr_key.is_some() && req.dhchap_key.is_none() {
            let errmsg = format!(
                "{err_prefix}: DH-HMAC-CHAP controller key requires a DH-HMAC-CHAP key"
            );
            error!("{errmsg}");
            return Err(GwError::InvalidArgument(errmsg));
        }

        self.guarded(mode, || async {
            if any_host && self.subsystem_has_secure_listener(&req.subsystem_nqn) {
                let errmsg = format!(
                    "{err_prefix}: Can't allow open host access on a subsystem with \
                     secure-channel listeners"
                );
                error!("{errmsg}");
                return Err(GwError::InvalidArgument(errmsg));
            }

            if mode.is_authoritative()
                && self.matching_host_exists(&req.subsystem_nqn, &req.host_nqn)
            {
                let errmsg = if any_host {
                    format!("{err_prefix}: Open host access is already allowed")
                } else {
                    format!("{err_prefix}: Host is already added")
                };
                error!("{errmsg}");
                return Err(GwError::AlreadyExists(errmsg));
            }

            let ret = if any_host {
                info!(
                    "Received request to allow any host access for {}, mode: {mode:?}",
                    req.subsystem_nqn
                );
                self.client
                    .nvmf_subsystem_allow_any_host(&req.subsystem_nqn, false)
                    .await
            } else {
                info!(
                    "Received request to add host {} to {}, mode: {mode:?}",
                    req.host_nqn, req.subsystem_nqn
                );
                self.client
                    .nvmf_subsystem_add_host(
                        &req.subsystem_nqn,
                        &req.host_nqn,
                        req.psk.as_deref(),
                        req.dhchap_key.as_deref(),
                        req.dhchap_ctrlr_key.as_deref(),
                    )
                    .await
            };
            let ret = ret.map_err(|e| e.with_prefix(&err_prefix))?;
            info!("add_host {}: {ret}", req.host_nqn);
            if !ret {
                error!("{err_prefix}");
                return Err(GwError::InvalidArgument(err_prefix.clone()));
            }

            if mode.is_authoritative() {
                let json_req = serde_json::to_string(&req)?;
                self.persist_add(
                    &keys::host_key(&req.subsystem_nqn, &req.host_nqn),
                    &json_req,
                )
                .await
                .map_err(|e| {
                    e.with_prefix(&format!(
                        "Error persisting host {} access addition",
                        req.host_nqn
                    ))
                })?;
            }
            Ok(())
        })
        .await
    }

    /// Revokes one host's access, or disables open access for `*`.
    pub async fn remove_host(
        &self,
        subsystem_nqn: &str,
        host_nqn: &str,
        mode: CallMode,
    ) -> Result<(), GwError> {
        let any_host = host_nqn == "*";
        let err_prefix = if any_host {
            format!("Failure disabling open host access to {subsystem_nqn}")
        } else {
            format!("Failure removing host {host_nqn} access from {subsystem_nqn}")
        };

        if nqn::is_discovery_nqn(subsystem_nqn) {
            let errmsg = if any_host {
                format!("{err_prefix}: Can't disable open host access to a discovery subsystem")
            } else {
                format!("{err_prefix}: Can't remove host access from a discovery subsystem")
            };
            error!("{errmsg}");
            return Err(GwError::InvalidArgument(errmsg));
        }
        if nqn::is_discovery_nqn(host_nqn) {
            let errmsg = format!("{err_prefix}: Can't use a discovery NQN as host's");
            error!("{errmsg}");
            return Err(GwError::InvalidArgument(errmsg));
        }

        self.guarded(mode, || async {
            let ret = if any_host {
                info!("Received request to disable open host access to {subsystem_nqn}, mode: {mode:?}");
                self.client
                    .nvmf_subsystem_allow_any_host(subsystem_nqn, true)
                    .await
            } else {
                info!(
                    "Received request to remove host {host_nqn} access from {subsystem_nqn}, \
                     mode: {mode:?}"
                );
                self.client
                    .nvmf_subsystem_remove_host(subsystem_nqn, host_nqn)
                    .await
            };
            match ret {
                Ok(true) => {}
                Ok(false) => {
                    error!("{err_prefix}");
                    if mode.is_authoritative() {
                        let _ = self
                            .persist_remove(&keys::host_key(subsystem_nqn, host_nqn))
                            .await;
                    }
                    return Err(GwError::InvalidArgument(err_prefix.clone()));
                }
                Err(e) => {
                    error!("{err_prefix}: {e}");
                    if mode.is_authoritative() {
                        let _ = self
                            .persist_remove(&keys::host_key(subsystem_nqn, host_nqn))
                            .await;
                    }
                    return Err(e.with_prefix(&err_prefix));
                }
            }
            info!("remove_host {host_nqn}: ok");
            if mode.is_authoritative() {
                self.persist_remove(&keys::host_key(subsystem_nqn, host_nqn))
                    .await
                    .map_err(|e| {
                        e.with_prefix(&format!(
                            "Error persisting host {host_nqn} access removal"
                        ))
                    })?;
            }
            Ok(())
        })
        .await
    }

    /// Lists host grants of one subsystem from the engine, with the key
    /// usage flags taken from the stored record.
    pub async fn list_hosts(&self, subsystem_nqn: &str) -> Result<HostsList, GwError> {
        let subsystems = self
            .subsystems_client
            .nvmf_get_subsystems(Some(subsystem_nqn))
            .await
            .map_err(|e| e.with_prefix("Failure listing hosts, can't get subsystems"))?;

        let mut list = HostsList::default();
        for s in subsystems {
            if s.nqn != subsystem_nqn {
                warn!("Got subsystem {} instead of {subsystem_nqn}, ignore", s.nqn);
                continue;
            }
            list.allow_any_host = s.allow_any_host;
            for h in s.hosts {
                let stored = self
                    .local
                    .get(&keys::host_key(subsystem_nqn, &h.nqn))
                    .and_then(|raw| serde_json::from_str::<HostEntry>(&raw).ok());
                list.hosts.push(HostDetails {
                    use_psk: stored.as_ref().is_some_and(|e| e.psk.is_some()),
                    use_dhchap: stored.as_ref().is_some_and(|e| e.dhchap_key.is_some()),
                    nqn: h.nqn,
                });
            }
            break;
        }
        Ok(list)
    }

    pub(crate) fn matching_host_exists(&self, subsystem_nqn: &str, host_nqn: &str) -> bool {
        self.local
            .get(&keys::host_key(subsystem_nqn, host_nqn))
            .is_some()
    }

    pub(crate) fn any_host_allowed(&self, subsystem_nqn: &str) -> bool {
        self.matching_host_exists(subsystem_nqn, "*")
    }

    pub(crate) fn subsystem_has_secure_listener(&self, subsystem_nqn: &str) -> bool {
        for (_, val) in self
            .local
            .prefixed(&keys::partial_listener_key(subsystem_nqn))
        {
            match serde_json::from_str::<ListenerEntry>(&val) {
                Ok(listener) if listener.secure => return true,
                Ok(_) => {}
                Err(e) => warn!("Got error parsing {val}: {e}"),
            }
        }
        false
    }
}
