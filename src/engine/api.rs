// src/engine/api.rs

//! Typed wrappers for the engine control-socket methods the gateway uses.

use crate::core::errors::GwError;
use crate::engine::client::EngineClient;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

#[derive(Deserialize, Debug, Clone)]
pub struct EngineVersion {
    pub version: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct EngineNamespace {
    pub nsid: u32,
    #[serde(default)]
    pub bdev_name: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub anagrpid: u32,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct EngineHost {
    pub nqn: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct EngineSubsystem {
    pub nqn: String,
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub model_number: String,
    #[serde(default)]
    pub min_cntlid: u32,
    #[serde(default)]
    pub max_cntlid: u32,
    #[serde(default)]
    pub max_namespaces: u32,
    #[serde(default)]
    pub allow_any_host: bool,
    #[serde(default)]
    pub hosts: Vec<EngineHost>,
    #[serde(default)]
    pub namespaces: Vec<EngineNamespace>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct RateLimits {
    #[serde(default)]
    pub rw_ios_per_sec: u64,
    #[serde(default)]
    pub rw_mbytes_per_sec: u64,
    #[serde(default)]
    pub r_mbytes_per_sec: u64,
    #[serde(default)]
    pub w_mbytes_per_sec: u64,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct BdevInfo {
    pub name: String,
    #[serde(default)]
    pub block_size: u32,
    #[serde(default)]
    pub num_blocks: u64,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub assigned_rate_limits: Option<RateLimits>,
    #[serde(default)]
    pub driver_specific: Option<Value>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct BdevIostat {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub bytes_read: u64,
    #[serde(default)]
    pub num_read_ops: u64,
    #[serde(default)]
    pub bytes_written: u64,
    #[serde(default)]
    pub num_write_ops: u64,
    #[serde(default)]
    pub bytes_unmapped: u64,
    #[serde(default)]
    pub num_unmap_ops: u64,
    #[serde(default)]
    pub read_latency_ticks: u64,
    #[serde(default)]
    pub max_read_latency_ticks: u64,
    #[serde(default)]
    pub min_read_latency_ticks: u64,
    #[serde(default)]
    pub write_latency_ticks: u64,
    #[serde(default)]
    pub max_write_latency_ticks: u64,
    #[serde(default)]
    pub min_write_latency_ticks: u64,
    #[serde(default)]
    pub unmap_latency_ticks: u64,
    #[serde(default)]
    pub max_unmap_latency_ticks: u64,
    #[serde(default)]
    pub min_unmap_latency_ticks: u64,
    #[serde(default)]
    pub copy_latency_ticks: u64,
    #[serde(default)]
    pub max_copy_latency_ticks: u64,
    #[serde(default)]
    pub min_copy_latency_ticks: u64,
    #[serde(default)]
    pub io_error: i64,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct IostatInfo {
    #[serde(default)]
    pub tick_rate: u64,
    #[serde(default)]
    pub ticks: u64,
    #[serde(default)]
    pub bdevs: Vec<BdevIostat>,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ListenAddress {
    #[serde(default)]
    pub trtype: String,
    #[serde(default)]
    pub adrfam: String,
    #[serde(default)]
    pub traddr: String,
    #[serde(default)]
    pub trsvcid: String,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct QpairInfo {
    #[serde(default)]
    pub cntlid: u32,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub listen_address: ListenAddress,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ControllerInfo {
    #[serde(default)]
    pub cntlid: u32,
    #[serde(default)]
    pub hostnqn: String,
    #[serde(default)]
    pub num_io_qpairs: i32,
}

impl EngineClient {
    pub async fn spdk_get_version(&self) -> Result<EngineVersion, GwError> {
        self.call("spdk_get_version", None).await
    }

    pub async fn nvmf_create_transport(
        &self,
        trtype: &str,
        options: Option<Map<String, Value>>,
    ) -> Result<bool, GwError> {
        let mut params = Map::new();
        params.insert("trtype".to_string(), Value::from(trtype));
        if let Some(options) = options {
            params.extend(options);
        }
        self.call("nvmf_create_transport", Some(Value::Object(params)))
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn nvmf_create_subsystem(
        &self,
        nqn: &str,
        serial_number: &str,
        max_namespaces: u32,
        min_cntlid: u32,
        max_cntlid: u32,
        ana_reporting: bool,
    ) -> Result<bool, GwError> {
        self.call(
            "nvmf_create_subsystem",
            Some(json!({
                "nqn": nqn,
                "serial_number": serial_number,
                "max_namespaces": max_namespaces,
                "min_cntlid": min_cntlid,
                "max_cntlid": max_cntlid,
                "ana_reporting": ana_reporting,
            })),
        )
        .await
    }

    pub async fn nvmf_delete_subsystem(&self, nqn: &str) -> Result<bool, GwError> {
        self.call("nvmf_delete_subsystem", Some(json!({ "nqn": nqn })))
            .await
    }

    pub async fn nvmf_get_subsystems(
        &self,
        nqn: Option<&str>,
    ) -> Result<Vec<EngineSubsystem>, GwError> {
        let params = nqn.map(|nqn| json!({ "nqn": nqn }));
        self.call("nvmf_get_subsystems", params).await
    }

    pub async fn nvmf_subsystem_add_ns(
        &self,
        nqn: &str,
        bdev_name: &str,
        nsid: Option<u32>,
        anagrpid: u32,
        uuid: &str,
    ) -> Result<u32, GwError> {
        let mut namespace = json!({
            "bdev_name": bdev_name,
            "anagrpid": anagrpid,
            "uuid": uuid,
        });
        if let Some(nsid) = nsid {
            namespace["nsid"] = Value::from(nsid);
        }
        self.call(
            "nvmf_subsystem_add_ns",
            Some(json!({ "nqn": nqn, "namespace": namespace })),
        )
        .await
    }

    pub async fn nvmf_subsystem_remove_ns(&self, nqn: &str, nsid: u32) -> Result<bool, GwError> {
        self.call(
            "nvmf_subsystem_remove_ns",
            Some(json!({ "nqn": nqn, "nsid": nsid })),
        )
        .await
    }

    pub async fn nvmf_subsystem_add_host(
        &self,
        nqn: &str,
        host: &str,
        psk: Option<&str>,
        dhchap_key: Option<&str>,
        dhchap_ctrlr_key: Option<&str>,
    ) -> Result<bool, GwError> {
        let mut params = json!({ "nqn": nqn, "host": host });
        if let Some(psk) = psk {
            params["psk"] = Value::from(psk);
        }
        if let Some(key) = dhchap_key {
            params["dhchap_key"] = Value::from(key);
        }
        if let Some(key) = dhchap_ctrlr_key {
            params["dhchap_ctrlr_key"] = Value::from(key);
        }
        self.call("nvmf_subsystem_add_host", Some(params)).await
    }

    pub async fn nvmf_subsystem_remove_host(&self, nqn: &str, host: &str) -> Result<bool, GwError> {
        self.call(
            "nvmf_subsystem_remove_host",
            Some(json!({ "nqn": nqn, "host": host })),
        )
        .await
    }

    pub async fn nvmf_subsystem_allow_any_host(
        &self,
        nqn: &str,
        disable: bool,
    ) -> Result<bool, GwError> {
        self.call(
            "nvmf_subsystem_allow_any_host",
            Some(json!({ "nqn": nqn, "disable": disable })),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn nvmf_subsystem_add_listener(
        &self,
        nqn: &str,
        trtype: &str,
        traddr: &str,
        trsvcid: &str,
        adrfam: &str,
        secure: bool,
    ) -> Result<bool, GwError> {
        let mut listen_address = json!({
            "trtype": trtype,
            "traddr": traddr,
            "trsvcid": trsvcid,
            "adrfam": adrfam,
        });
        if secure {
            listen_address["secure_channel"] = Value::from(true);
        }
        self.call(
            "nvmf_subsystem_add_listener",
            Some(json!({ "nqn": nqn, "listen_address": listen_address })),
        )
        .await
    }

    pub async fn nvmf_subsystem_remove_listener(
        &self,
        nqn: &str,
        trtype: &str,
        traddr: &str,
        trsvcid: &str,
        adrfam: &str,
    ) -> Result<bool, GwError> {
        self.call(
            "nvmf_subsystem_remove_listener",
            Some(json!({
                "nqn": nqn,
                "listen_address": {
                    "trtype": trtype,
                    "traddr": traddr,
                    "trsvcid": trsvcid,
                    "adrfam": adrfam,
                },
            })),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn nvmf_subsystem_listener_set_ana_state(
        &self,
        nqn: &str,
        trtype: &str,
        traddr: &str,
        trsvcid: &str,
        adrfam: &str,
        ana_state: &str,
        anagrpid: u32,
    ) -> Result<bool, GwError> {
        self.call(
            "nvmf_subsystem_listener_set_ana_state",
            Some(json!({
                "nqn": nqn,
                "ana_state": ana_state,
                "anagrpid": anagrpid,
                "listen_address": {
                    "trtype": trtype,
                    "traddr": traddr,
                    "trsvcid": trsvcid,
                    "adrfam": adrfam,
                },
            })),
        )
        .await
    }

    pub async fn nvmf_subsystem_get_qpairs(&self, nqn: &str) -> Result<Vec<QpairInfo>, GwError> {
        self.call("nvmf_subsystem_get_qpairs", Some(json!({ "nqn": nqn })))
            .await
    }

    pub async fn nvmf_subsystem_get_controllers(
        &self,
        nqn: &str,
    ) -> Result<Vec<ControllerInfo>, GwError> {
        self.call(
            "nvmf_subsystem_get_controllers",
            Some(json!({ "nqn": nqn })),
        )
        .await
    }

    pub async fn bdev_rbd_register_cluster(
        &self,
        name: &str,
        user: Option<&str>,
        core_mask: Option<&str>,
    ) -> Result<String, GwError> {
        let mut params = json!({ "name": name });
        if let Some(user) = user {
            params["user_id"] = Value::from(user);
        }
        if let Some(mask) = core_mask {
            params["core_mask"] = Value::from(mask);
        }
        self.call("bdev_rbd_register_cluster", Some(params)).await
    }

    pub async fn bdev_rbd_unregister_cluster(&self, name: &str) -> Result<bool, GwError> {
        self.call("bdev_rbd_unregister_cluster", Some(json!({ "name": name })))
            .await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn bdev_rbd_create(
        &self,
        name: &str,
        cluster_name: &str,
        pool_name: &str,
        rbd_name: &str,
        block_size: u32,
        uuid: &str,
    ) -> Result<String, GwError> {
        self.call(
            "bdev_rbd_create",
            Some(json!({
                "name": name,
                "cluster_name": cluster_name,
                "pool_name": pool_name,
                "rbd_name": rbd_name,
                "block_size": block_size,
                "uuid": uuid,
            })),
        )
        .await
    }

    pub async fn bdev_rbd_delete(&self, name: &str) -> Result<bool, GwError> {
        self.call("bdev_rbd_delete", Some(json!({ "name": name })))
            .await
    }

    /// `new_size` is in MiB, matching the engine's contract.
    pub async fn bdev_rbd_resize(&self, name: &str, new_size: u64) -> Result<bool, GwError> {
        self.call(
            "bdev_rbd_resize",
            Some(json!({ "name": name, "new_size": new_size })),
        )
        .await
    }

    pub async fn bdev_get_bdevs(&self, name: Option<&str>) -> Result<Vec<BdevInfo>, GwError> {
        let params = name.map(|name| json!({ "name": name }));
        self.call("bdev_get_bdevs", params).await
    }

    pub async fn bdev_get_iostat(&self, name: &str) -> Result<IostatInfo, GwError> {
        self.call("bdev_get_iostat", Some(json!({ "name": name })))
            .await
    }

    pub async fn bdev_set_qos_limit(
        &self,
        name: &str,
        limits: Map<String, Value>,
    ) -> Result<bool, GwError> {
        let mut params = Map::new();
        params.insert("name".to_string(), Value::from(name));
        params.extend(limits);
        self.call("bdev_set_qos_limit", Some(Value::Object(params)))
            .await
    }

    pub async fn log_get_flags(&self) -> Result<HashMap<String, bool>, GwError> {
        self.call("log_get_flags", None).await
    }

    pub async fn log_set_flag(&self, flag: &str) -> Result<bool, GwError> {
        self.call("log_set_flag", Some(json!({ "flag": flag }))).await
    }

    pub async fn log_clear_flag(&self, flag: &str) -> Result<bool, GwError> {
        self.call("log_clear_flag", Some(json!({ "flag": flag })))
            .await
    }

    pub async fn log_set_level(&self, level: &str) -> Result<bool, GwError> {
        self.call("log_set_level", Some(json!({ "level": level })))
            .await
    }

    pub async fn log_get_level(&self) -> Result<String, GwError> {
        self.call("log_get_level", None).await
    }

    pub async fn log_set_print_level(&self, level: &str) -> Result<bool, GwError> {
        self.call("log_set_print_level", Some(json!({ "level": level })))
            .await
    }

    pub async fn log_get_print_level(&self) -> Result<String, GwError> {
        self.call("log_get_print_level", None).await
    }
}
