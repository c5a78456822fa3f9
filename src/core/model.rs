// src/core/model.rs

//! Typed request/record models shared by the resource service, the
//! reconciler and the discovery responder.
//!
//! These structs define the JSON schema of the values stored in the
//! persistent group state: each entry is the creating request serialized
//! with its wire field names, so any peer can reconstruct and replay the
//! operation from the stored value alone.

use serde::{Deserialize, Serialize};

/// A subsystem creation request; persisted under `subsystem_<nqn>`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SubsystemEntry {
    pub subsystem_nqn: String,
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub max_namespaces: u32,
    #[serde(default)]
    pub enable_ha: bool,
}

/// A namespace creation request; persisted under `namespace_<nqn>_<nsid>`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NamespaceEntry {
    pub rbd_pool_name: String,
    pub rbd_image_name: String,
    pub subsystem_nqn: String,
    #[serde(default)]
    pub nsid: Option<u32>,
    #[serde(default)]
    pub block_size: u32,
    #[serde(default)]
    pub uuid: String,
    /// Image size in MiB.
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub create_image: bool,
    #[serde(default)]
    pub anagrpid: u32,
    #[serde(default)]
    pub force: bool,
}

/// QoS limits for one namespace; persisted under `qos_<nqn>_<nsid>`.
/// Absent fields were never set; zero means unlimited.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct QosEntry {
    pub subsystem_nqn: String,
    #[serde(default)]
    pub nsid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rw_ios_per_second: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rw_mbytes_per_second: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r_mbytes_per_second: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w_mbytes_per_second: Option<u64>,
}

/// A host access grant; persisted under `host_<nqn>_<host-nqn>`. The host
/// NQN `*` grants open access. Credentials never coexist with `*`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub subsystem_nqn: String,
    pub host_nqn: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhchap_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dhchap_ctrlr_key: Option<String>,
}

/// A listener; persisted under `listener_<nqn>_<gateway>_TCP_<addr>_<port>`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ListenerEntry {
    pub nqn: String,
    pub gateway_name: String,
    #[serde(default = "default_trtype")]
    pub trtype: String,
    pub adrfam: AddressFamily,
    pub traddr: String,
    pub trsvcid: u16,
    #[serde(default)]
    pub secure: bool,
}

fn default_trtype() -> String {
    "TCP".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// The spelling the engine control socket expects.
    pub fn as_engine_str(&self) -> &'static str {
        match self {
            AddressFamily::Ipv4 => "ipv4",
            AddressFamily::Ipv6 => "ipv6",
        }
    }
}

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_engine_str())
    }
}

/// Per-path optimality of one ANA group as seen by this peer.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnaState {
    Optimized,
    Inaccessible,
}

impl AnaState {
    pub fn as_engine_str(&self) -> &'static str {
        match self {
            AnaState::Optimized => "optimized",
            AnaState::Inaccessible => "inaccessible",
        }
    }
}

/// Metadata a peer publishes into the object store service map at startup.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ServiceMeta {
    pub id: String,
    pub pool_name: String,
    pub daemon_type: String,
    pub group: String,
    pub group_id: u32,
    pub addr: String,
    pub port: u16,
}
