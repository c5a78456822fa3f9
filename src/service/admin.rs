// src/service/admin.rs

//! Diagnostic and administrative operations: ANA state updates from the
//! monitor, engine log controls, the gateway log filter and peer info.

use crate::core::errors::GwError;
use crate::core::model::{AnaState, ListenerEntry};
use crate::service::{CallMode, GatewayService};
use crate::store::keys;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{error, info, warn};
use tracing_subscriber::filter::EnvFilter;

/// ANA states of one subsystem's groups, as pushed by the monitor client.
#[derive(Debug, Clone)]
pub struct NqnAnaStates {
    pub nqn: String,
    pub states: Vec<(u32, AnaState)>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SpdkLogInfo {
    pub nvmf_log_flags: Vec<(String, bool)>,
    pub log_level: String,
    pub log_print_level: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct GatewayInfo {
    pub cli_version: String,
    pub version: String,
    pub spdk_version: String,
    pub name: String,
    pub group: String,
    pub addr: String,
    pub port: String,
    pub bool_status: bool,
    pub status: i32,
    pub error_message: String,
}

impl GatewayService {
    /// Records the monitor-provided ANA map and pushes the states onto
    /// every listener this peer owns for the named subsystems.
    pub async fn set_ana_state(
        &self,
        ana_states: Vec<NqnAnaStates>,
        mode: CallMode,
    ) -> Result<(), GwError> {
        info!("Received request to set ana states, mode: {mode:?}");

        self.guarded(mode, || async {
            for nas in &ana_states {
                {
                    let mut regs = self.regs.lock();
                    let map = regs.ana_map.entry(nas.nqn.clone()).or_default();
                    for (grp_id, state) in &nas.states {
                        map.insert(*grp_id, *state);
                    }
                }

                let prefix = format!(
                    "{}{}{}{}",
                    keys::partial_listener_key(&nas.nqn),
                    keys::OMAP_KEY_DELIMITER,
                    self.gateway_name,
                    keys::OMAP_KEY_DELIMITER
                );
                let listeners = self.local.prefixed(&prefix);
                info!(
                    "Iterate over nqn={} listeners={}",
                    nas.nqn,
                    listeners.len()
                );
                for (listener_key, raw) in listeners {
                    let listener: ListenerEntry = match serde_json::from_str(&raw) {
                        Ok(l) => l,
                        Err(e) => {
                            warn!("Got error parsing {listener_key}: {e}");
                            continue;
                        }
                    };
                    for (grp_id, state) in &nas.states {
                        info!(
                            "set_ana_state nqn={} listener={}:{} state={} group={grp_id}",
                            nas.nqn,
                            listener.traddr,
                            listener.trsvcid,
                            state.as_engine_str()
                        );
                        let ret = self
                            .client
                            .nvmf_subsystem_listener_set_ana_state(
                                &nas.nqn,
                                &listener.trtype,
                                &listener.traddr,
                                &listener.trsvcid.to_string(),
                                listener.adrfam.as_engine_str(),
                                state.as_engine_str(),
                                *grp_id,
                            )
                            .await?;
                        if !ret {
                            let errmsg = format!(
                                "set_ana_state failed for {} group {grp_id}",
                                nas.nqn
                            );
                            error!("{errmsg}");
                            return Err(GwError::Internal(errmsg));
                        }
                    }
                }
            }
            Ok(())
        })
        .await
    }

    /// Enables the engine's nvmf log flags and optionally sets the log and
    /// print levels.
    pub async fn set_spdk_nvmf_logs(
        &self,
        log_level: Option<&str>,
        print_level: Option<&str>,
        mode: CallMode,
    ) -> Result<(), GwError> {
        for level in [log_level, print_level].into_iter().flatten() {
            validate_spdk_log_level(level)?;
        }
        info!(
            "Received request to set SPDK nvmf logs: log_level: {log_level:?}, \
             print_level: {print_level:?}"
        );

        self.guarded(mode, || async {
            let nvmf_flags: Vec<String> = self
                .client
                .log_get_flags()
                .await
                .map_err(|e| e.with_prefix("Failure setting SPDK log levels"))?
                .into_keys()
                .filter(|flag| flag.starts_with("nvmf"))
                .collect();

            let mut all_set = true;
            for flag in &nvmf_flags {
                match self.client.log_set_flag(flag).await {
                    Ok(ret) => all_set &= ret,
                    Err(e) => {
                        error!("Failure setting SPDK log levels: {e}");
                        for flag in &nvmf_flags {
                            let _ = self.client.log_clear_flag(flag).await;
                        }
                        return Err(e.with_prefix("Failure setting SPDK log levels"));
                    }
                }
            }
            info!("Set SPDK nvmf log flags {nvmf_flags:?} to TRUE");

            if let Some(level) = log_level {
                let ret = self
                    .client
                    .log_set_level(&level.to_uppercase())
                    .await
                    .map_err(|e| e.with_prefix("Failure setting SPDK log level"))?;
                info!("Set log level to {level}: {ret}");
                if !ret {
                    return Err(GwError::InvalidArgument(
                        "Failure setting SPDK log level".to_string(),
                    ));
                }
            }
            if let Some(level) = print_level {
                let ret = self
                    .client
                    .log_set_print_level(&level.to_uppercase())
                    .await
                    .map_err(|e| e.with_prefix("Failure setting SPDK print log level"))?;
                info!("Set log print level to {level}: {ret}");
                if !ret {
                    return Err(GwError::InvalidArgument(
                        "Failure setting SPDK print log level".to_string(),
                    ));
                }
            }
            if !all_set {
                return Err(GwError::InvalidArgument(
                    "Failure setting some SPDK nvmf log flags".to_string(),
                ));
            }
            Ok(())
        })
        .await
    }

    /// Clears the engine's nvmf log flags and restores the default levels.
    pub async fn disable_spdk_nvmf_logs(&self, mode: CallMode) -> Result<(), GwError> {
        info!("Received request to disable SPDK nvmf logs");

        self.guarded(mode, || async {
            let err_prefix = "Failure in disable SPDK nvmf log flags";
            let nvmf_flags: Vec<String> = self
                .client
                .log_get_flags()
                .await
                .map_err(|e| e.with_prefix(err_prefix))?
                .into_keys()
                .filter(|flag| flag.starts_with("nvmf"))
                .collect();

            let mut all_ok = true;
            for flag in &nvmf_flags {
                all_ok &= self
                    .client
                    .log_clear_flag(flag)
                    .await
                    .map_err(|e| e.with_prefix(err_prefix))?;
            }
            all_ok &= self
                .client
                .log_set_level("NOTICE")
                .await
                .map_err(|e| e.with_prefix(err_prefix))?;
            all_ok &= self
                .client
                .log_set_print_level("INFO")
                .await
                .map_err(|e| e.with_prefix(err_prefix))?;
            if !all_ok {
                return Err(GwError::InvalidArgument(err_prefix.to_string()));
            }
            Ok(())
        })
        .await
    }

    /// Reads the engine's nvmf log flags plus the log and print levels.
    pub async fn get_spdk_nvmf_log_flags_and_level(&self) -> Result<SpdkLogInfo, GwError> {
        info!("Received request to get SPDK nvmf log flags and level");
        let err_prefix = "Failure getting SPDK log levels and nvmf log flags";

        let _rpc = self.rpc_lock.lock().await;
        let flags: HashMap<String, bool> = self
            .client
            .log_get_flags()
            .await
            .map_err(|e| e.with_prefix(err_prefix))?;
        let nvmf_log_flags: Vec<(String, bool)> = flags
            .into_iter()
            .filter(|(flag, _)| flag.starts_with("nvmf"))
            .collect();
        let log_level = self
            .client
            .log_get_level()
            .await
            .map_err(|e| e.with_prefix(err_prefix))?;
        let log_print_level = self
            .client
            .log_get_print_level()
            .await
            .map_err(|e| e.with_prefix(err_prefix))?;
        info!(
            "spdk log flags: {nvmf_log_flags:?}, spdk log level: {log_level}, \
             spdk log print level: {log_print_level}"
        );
        Ok(SpdkLogInfo {
            nvmf_log_flags,
            log_level,
            log_print_level,
        })
    }

    /// Changes the gateway's own tracing filter at runtime.
    pub fn set_gateway_log_level(&self, level: &str) -> Result<(), GwError> {
        let level = level.to_lowercase();
        match level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(GwError::UnknownKey(format!(
                    "Unknown log level {level}"
                )))
            }
        }
        if let Some(handle) = &self.log_reload {
            handle
                .reload(EnvFilter::new(&level))
                .map_err(|e| GwError::Internal(format!("Failed to set log level: {e}")))?;
        }
        *self.log_level.lock() = level.clone();
        info!("Gateway log level set to {level}");
        Ok(())
    }

    pub fn get_gateway_log_level(&self) -> String {
        self.log_level.lock().clone()
    }

    /// Peer identity and version report, with a CLI compatibility check.
    pub fn get_gateway_info(&self, cli_version: &str) -> GatewayInfo {
        info!("Received request to get gateway's info");
        let gw_version = env!("CARGO_PKG_VERSION");
        let mut ret = GatewayInfo {
            cli_version: cli_version.to_string(),
            version: gw_version.to_string(),
            spdk_version: self.spdk_version.lock().clone(),
            name: self.gateway_name.clone(),
            group: self.gateway_group.clone(),
            addr: self.config.gateway.addr.clone(),
            port: self.config.gateway.port.to_string(),
            bool_status: true,
            status: 0,
            error_message: crate::core::SUCCESS_MESSAGE.to_string(),
        };
        let cli_ver = parse_version(cli_version);
        let gw_ver = parse_version(gw_version);
        match (cli_ver, gw_ver) {
            (Some(cli), Some(gw)) if cli < gw => {
                ret.bool_status = false;
                ret.status = libc::EINVAL;
                ret.error_message = format!(
                    "CLI version {cli_version} is older than gateway's version {gw_version}"
                );
            }
            (_, None) => {
                ret.bool_status = false;
                ret.status = libc::EINVAL;
                ret.error_message = format!("Invalid gateway's version {gw_version}");
            }
            _ => {}
        }
        if cli_version.is_empty() {
            warn!("No CLI version specified, can't check version compatibility");
        } else if cli_ver.is_none() {
            warn!("Invalid CLI version {cli_version}, can't check version compatibility");
        }
        ret
    }
}

fn validate_spdk_log_level(level: &str) -> Result<(), GwError> {
    match level.to_uppercase().as_str() {
        "ERROR" | "WARNING" | "NOTICE" | "INFO" | "DEBUG" => Ok(()),
        other => Err(GwError::UnknownKey(format!("Unknown log level {other}"))),
    }
}

fn parse_version(version: &str) -> Option<(u32, u32, u32)> {
    let mut parts = version.split('.');
    let v1 = parts.next()?.parse().ok()?;
    let v2 = parts.next()?.parse().ok()?;
    let v3 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((v1, v2, v3))
}
