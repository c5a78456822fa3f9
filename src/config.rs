// src/config.rs

//! Manages gateway configuration: loading, defaulting, and validation.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::warn;

/// Settings of the gateway peer itself.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GatewayConfig {
    /// Peer name; defaults to the local hostname.
    #[serde(default)]
    pub name: String,
    /// Gateway group; the persistent state object is per group.
    #[serde(default)]
    pub group: String,
    #[serde(default = "default_gateway_addr")]
    pub addr: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Use mTLS for client-server authentication.
    #[serde(default)]
    pub enable_auth: bool,
    #[serde(default = "default_true")]
    pub state_update_notify: bool,
    #[serde(default = "default_update_interval")]
    pub state_update_interval_sec: u64,
    #[serde(default = "default_lock_duration")]
    pub omap_file_lock_duration: u64,
    #[serde(default = "default_update_reloads")]
    pub omap_file_update_reloads: u32,
    #[serde(default = "default_lock_retries")]
    pub omap_file_lock_retries: u32,
    #[serde(default = "default_lock_retry_sleep")]
    pub omap_file_lock_retry_sleep_interval: u64,
    /// Testing only: keep the change lease held after a write sequence.
    #[serde(default)]
    pub omap_file_disable_unlock: bool,
    #[serde(default = "default_true")]
    pub verify_nqns: bool,
    #[serde(default = "default_true")]
    pub enable_monitor_client: bool,
    /// Use the engine's built-in discovery controller instead of ours.
    #[serde(default)]
    pub enable_spdk_discovery_controller: bool,
    #[serde(default = "default_ping_interval")]
    pub spdk_ping_interval_in_seconds: f64,
    #[serde(default = "default_ping_failures")]
    pub allowed_consecutive_spdk_ping_failures: u32,
}

fn default_gateway_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_gateway_port() -> u16 {
    5500
}
fn default_true() -> bool {
    true
}
fn default_update_interval() -> u64 {
    5
}
fn default_lock_duration() -> u64 {
    60
}
fn default_update_reloads() -> u32 {
    10
}
fn default_lock_retries() -> u32 {
    15
}
fn default_lock_retry_sleep() -> u64 {
    5
}
fn default_ping_interval() -> f64 {
    2.0
}
fn default_ping_failures() -> u32 {
    1
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            group: String::new(),
            addr: default_gateway_addr(),
            port: default_gateway_port(),
            enable_auth: false,
            state_update_notify: true,
            state_update_interval_sec: default_update_interval(),
            omap_file_lock_duration: default_lock_duration(),
            omap_file_update_reloads: default_update_reloads(),
            omap_file_lock_retries: default_lock_retries(),
            omap_file_lock_retry_sleep_interval: default_lock_retry_sleep(),
            omap_file_disable_unlock: false,
            verify_nqns: true,
            enable_monitor_client: true,
            enable_spdk_discovery_controller: false,
            spdk_ping_interval_in_seconds: default_ping_interval(),
            allowed_consecutive_spdk_ping_failures: default_ping_failures(),
        }
    }
}

/// Object store access settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StoreConfig {
    /// Pool holding the group state object and the backing images.
    #[serde(default = "default_pool")]
    pub pool: String,
    /// Client id for the store connection; empty uses the default identity.
    #[serde(default)]
    pub id: String,
}

fn default_pool() -> String {
    "rbd".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            pool: default_pool(),
            id: String::new(),
        }
    }
}

/// Target engine (SPDK) settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SpdkConfig {
    #[serde(default = "default_tgt_path")]
    pub tgt_path: String,
    #[serde(default = "default_rpc_socket_dir")]
    pub rpc_socket_dir: String,
    #[serde(default = "default_rpc_socket_name")]
    pub rpc_socket_name: String,
    /// Per-call timeout in seconds; connect retries are derived from it.
    #[serde(default = "default_spdk_timeout")]
    pub timeout: f64,
    #[serde(default)]
    pub log_level: String,
    #[serde(default)]
    pub tgt_cmd_extra_args: String,
    /// Whitespace separated transport types created at startup.
    #[serde(default = "default_transports")]
    pub transports: String,
    /// JSON options merged into the tcp transport creation request.
    #[serde(default)]
    pub transport_tcp_options: String,
    #[serde(default = "default_bdevs_per_cluster")]
    pub bdevs_per_cluster: u32,
    #[serde(default)]
    pub librbd_core_mask: String,
}

fn default_tgt_path() -> String {
    "/usr/local/bin/nvmf_tgt".to_string()
}
fn default_rpc_socket_dir() -> String {
    "/var/tmp/".to_string()
}
fn default_rpc_socket_name() -> String {
    "spdk.sock".to_string()
}
fn default_spdk_timeout() -> f64 {
    60.0
}
fn default_transports() -> String {
    "tcp".to_string()
}
fn default_bdevs_per_cluster() -> u32 {
    32
}

impl Default for SpdkConfig {
    fn default() -> Self {
        Self {
            tgt_path: default_tgt_path(),
            rpc_socket_dir: default_rpc_socket_dir(),
            rpc_socket_name: default_rpc_socket_name(),
            timeout: default_spdk_timeout(),
            log_level: String::new(),
            tgt_cmd_extra_args: String::new(),
            transports: default_transports(),
            transport_tcp_options: String::new(),
            bdevs_per_cluster: default_bdevs_per_cluster(),
            librbd_core_mask: String::new(),
        }
    }
}

/// Discovery responder listening endpoint.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_addr")]
    pub addr: String,
    #[serde(default = "default_discovery_port")]
    pub port: u16,
}

fn default_discovery_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_discovery_port() -> u16 {
    8009
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            addr: default_discovery_addr(),
            port: default_discovery_port(),
        }
    }
}

/// mTLS key material, used when `gateway.enable_auth` is set.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MtlsConfig {
    #[serde(default)]
    pub server_key: String,
    #[serde(default)]
    pub client_key: String,
    #[serde(default)]
    pub server_cert: String,
    #[serde(default)]
    pub client_cert: String,
}

/// Monitor client subprocess settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_client_path")]
    pub client_path: String,
    /// Seconds to wait for the monitor client to terminate at shutdown.
    #[serde(default = "default_monitor_timeout")]
    pub timeout: f64,
}

fn default_monitor_client_path() -> String {
    "/usr/bin/ceph-nvmeof-monitor-client".to_string()
}
fn default_monitor_timeout() -> f64 {
    1.0
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            client_path: default_monitor_client_path(),
            timeout: default_monitor_timeout(),
        }
    }
}

/// Log file settings. Rotated backups are gzip-compressed.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LogsConfig {
    #[serde(default = "default_log_directory")]
    pub log_directory: String,
    #[serde(default = "default_true")]
    pub log_files_enabled: bool,
    #[serde(default = "default_true")]
    pub log_files_rotation_enabled: bool,
    #[serde(default = "default_max_log_file_size")]
    pub max_log_file_size_in_mb: u64,
    #[serde(default = "default_max_log_files_count")]
    pub max_log_files_count: u32,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_directory() -> String {
    "/var/log/ceph/".to_string()
}
fn default_max_log_file_size() -> u64 {
    10
}
fn default_max_log_files_count() -> u32 {
    20
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            log_directory: default_log_directory(),
            log_files_enabled: true,
            log_files_rotation_enabled: true,
            max_log_file_size_in_mb: default_max_log_file_size(),
            max_log_files_count: default_max_log_files_count(),
            log_level: default_log_level(),
        }
    }
}

/// A raw representation of the config file before validation and resolution.
#[derive(Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    gateway: GatewayConfig,
    #[serde(default)]
    store: StoreConfig,
    #[serde(default)]
    spdk: SpdkConfig,
    #[serde(default)]
    discovery: DiscoveryConfig,
    #[serde(default)]
    mtls: MtlsConfig,
    #[serde(default)]
    monitor: MonitorConfig,
    #[serde(default)]
    logs: LogsConfig,
}

/// Represents the final, validated gateway configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub store: StoreConfig,
    pub spdk: SpdkConfig,
    pub discovery: DiscoveryConfig,
    pub mtls: MtlsConfig,
    pub monitor: MonitorConfig,
    pub logs: LogsConfig,
}

impl Default for Config {
    fn default() -> Self {
        let mut config = Config {
            gateway: GatewayConfig::default(),
            store: StoreConfig::default(),
            spdk: SpdkConfig::default(),
            discovery: DiscoveryConfig::default(),
            mtls: MtlsConfig::default(),
            monitor: MonitorConfig::default(),
            logs: LogsConfig::default(),
        };
        config.resolve();
        config
    }
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;

        let mut config = Config {
            gateway: raw.gateway,
            store: raw.store,
            spdk: raw.spdk,
            discovery: raw.discovery,
            mtls: raw.mtls,
            monitor: raw.monitor,
            logs: raw.logs,
        };
        config.resolve();
        config.validate()?;
        Ok(config)
    }

    /// Fills in the values that depend on the environment.
    fn resolve(&mut self) {
        if self.gateway.name.is_empty() {
            self.gateway.name = sysinfo::System::host_name().unwrap_or_else(|| {
                warn!("Could not detect the local hostname, using \"gateway\"");
                "gateway".to_string()
            });
        }
    }

    /// Validates the resolved configuration to ensure logical consistency.
    fn validate(&self) -> Result<()> {
        if self.gateway.port == 0 {
            return Err(anyhow!("gateway.port cannot be 0"));
        }
        if self.gateway.port == 1 {
            // The monitor rendezvous server listens on port - 1.
            return Err(anyhow!("gateway.port cannot be 1"));
        }
        if self.gateway.addr.trim().is_empty() {
            return Err(anyhow!("gateway.addr cannot be empty"));
        }
        if self.gateway.state_update_interval_sec == 0 {
            return Err(anyhow!("gateway.state_update_interval_sec cannot be 0"));
        }
        if self.store.pool.trim().is_empty() {
            return Err(anyhow!("store.pool cannot be empty"));
        }
        if self.spdk.rpc_socket_name.contains('/') {
            return Err(anyhow!(
                "invalid engine socket name \"{}\": must not contain \"/\"",
                self.spdk.rpc_socket_name
            ));
        }
        if self.spdk.bdevs_per_cluster < 1 {
            return Err(anyhow!(
                "invalid configuration: spdk.bdevs_per_cluster {} < 1",
                self.spdk.bdevs_per_cluster
            ));
        }
        if self.discovery.port == 0 {
            return Err(anyhow!("discovery.port cannot be 0"));
        }
        if self.gateway.enable_auth {
            for (field, val) in [
                ("mtls.server_key", &self.mtls.server_key),
                ("mtls.server_cert", &self.mtls.server_cert),
                ("mtls.client_cert", &self.mtls.client_cert),
            ] {
                if val.trim().is_empty() {
                    return Err(anyhow!("{field} cannot be empty when enable_auth is set"));
                }
            }
        }
        if self.gateway.omap_file_disable_unlock {
            warn!("Will not unlock the group state object, for testing purposes only");
        }
        Ok(())
    }

    /// Path of the engine control socket.
    pub fn rpc_socket_path(&self) -> String {
        let mut dir = self.spdk.rpc_socket_dir.clone();
        if !dir.ends_with('/') {
            dir.push('/');
        }
        format!("{dir}{}", self.spdk.rpc_socket_name)
    }

    /// Name of the persistent group state object.
    pub fn state_object_name(&self) -> String {
        if self.gateway.group.is_empty() {
            "nvmeof.state".to_string()
        } else {
            format!("nvmeof.{}.state", self.gateway.group)
        }
    }
}
