#![allow(dead_code)]

//! Shared test support: an in-process mock of the target engine speaking
//! the real JSON-RPC control-socket protocol, and a gateway peer builder
//! wiring the service, store and reconciler together.

use bytes::{Buf, BytesMut};
use nvmeof_gw::config::Config;
use nvmeof_gw::engine::EngineClient;
use nvmeof_gw::service::GatewayService;
use nvmeof_gw::state::StateHandler;
use nvmeof_gw::store::{LocalState, MemoryObjectStore, ObjectStore, OmapState};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

#[derive(Debug, Clone, Default)]
pub struct MockNamespace {
    pub bdev_name: String,
    pub uuid: String,
    pub anagrpid: u32,
}

#[derive(Debug, Clone, Default)]
pub struct MockListener {
    pub traddr: String,
    pub trsvcid: String,
    pub adrfam: String,
    pub secure: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MockSubsystem {
    pub serial_number: String,
    pub max_namespaces: u32,
    pub min_cntlid: u32,
    pub max_cntlid: u32,
    pub ana_reporting: bool,
    pub allow_any_host: bool,
    pub hosts: Vec<String>,
    pub namespaces: BTreeMap<u32, MockNamespace>,
    pub listeners: Vec<MockListener>,
}

#[derive(Debug, Clone, Default)]
pub struct MockBdev {
    pub cluster: String,
    pub pool: String,
    pub image: String,
    pub block_size: u32,
    pub uuid: String,
    pub size_mib: u64,
    pub qos: Map<String, Value>,
}

#[derive(Debug, Default)]
pub struct MockEngineState {
    pub subsystems: BTreeMap<String, MockSubsystem>,
    pub bdevs: BTreeMap<String, MockBdev>,
    pub clusters: BTreeSet<String>,
    /// (nqn, traddr, trsvcid, group) -> ana state.
    pub ana_states: BTreeMap<(String, String, String, u32), String>,
    pub log_flags: BTreeMap<String, bool>,
    pub log_level: String,
    pub log_print_level: String,
}

impl MockEngineState {
    fn new() -> Self {
        let mut log_flags = BTreeMap::new();
        log_flags.insert("nvmf".to_string(), false);
        log_flags.insert("nvmf_tcp".to_string(), false);
        log_flags.insert("bdev".to_string(), false);
        Self {
            log_level: "NOTICE".to_string(),
            log_print_level: "INFO".to_string(),
            log_flags,
            ..Default::default()
        }
    }
}

/// A mock engine bound to a UNIX socket, exercising the production
/// `EngineClient` code path end to end.
pub struct MockEngine {
    pub state: Arc<Mutex<MockEngineState>>,
    pub socket_path: PathBuf,
}

impl MockEngine {
    pub async fn spawn(socket_path: PathBuf) -> MockEngine {
        let listener = UnixListener::bind(&socket_path).expect("bind mock engine socket");
        let state = Arc::new(Mutex::new(MockEngineState::new()));
        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(handle_connection(stream, Arc::clone(&accept_state)));
            }
        });
        MockEngine { state, socket_path }
    }
}

async fn handle_connection(mut stream: UnixStream, state: Arc<Mutex<MockEngineState>>) {
    let mut buf = BytesMut::with_capacity(16 * 1024);
    loop {
        let request = loop {
            if !buf.is_empty() {
                let mut iter = serde_json::Deserializer::from_slice(&buf).into_iter::<Value>();
                match iter.next() {
                    Some(Ok(value)) => {
                        let consumed = iter.byte_offset();
                        buf.advance(consumed);
                        break value;
                    }
                    Some(Err(e)) if e.is_eof() => {}
                    _ => return,
                }
            }
            match stream.read_buf(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            }
        };

        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let method = request
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let params = request.get("params").cloned().unwrap_or(Value::Null);

        let response = match dispatch(&state, &method, &params) {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err((code, message)) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": code, "message": message },
            }),
        };
        let payload = serde_json::to_vec(&response).expect("serialize mock response");
        if stream.write_all(&payload).await.is_err() {
            return;
        }
    }
}

type RpcResult = Result<Value, (i64, String)>;

fn p_str<'a>(params: &'a Value, key: &str) -> &'a str {
    params.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn p_u32(params: &Value, key: &str) -> u32 {
    params.get(key).and_then(Value::as_u64).unwrap_or(0) as u32
}

fn dispatch(state: &Arc<Mutex<MockEngineState>>, method: &str, params: &Value) -> RpcResult {
    let mut st = state.lock();
    match method {
        "spdk_get_version" => Ok(json!({ "version": "24.01.1" })),
        "nvmf_create_transport" => Ok(Value::Bool(true)),
        "nvmf_create_subsystem" => {
            let nqn = p_str(params, "nqn").to_string();
            if st.subsystems.contains_key(&nqn) {
                return Err((-17, format!("Subsystem {nqn} already exists")));
            }
            st.subsystems.insert(
                nqn,
                MockSubsystem {
                    serial_number: p_str(params, "serial_number").to_string(),
                    max_namespaces: p_u32(params, "max_namespaces"),
                    min_cntlid: p_u32(params, "min_cntlid"),
                    max_cntlid: p_u32(params, "max_cntlid"),
                    ana_reporting: params
                        .get("ana_reporting")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                    ..Default::default()
                },
            );
            Ok(Value::Bool(true))
        }
        "nvmf_delete_subsystem" => {
            let nqn = p_str(params, "nqn");
            if st.subsystems.remove(nqn).is_none() {
                return Err((-19, format!("Subsystem {nqn} does not exist")));
            }
            Ok(Value::Bool(true))
        }
        "nvmf_get_subsystems" => {
            let filter = params.get("nqn").and_then(Value::as_str);
            let mut out = Vec::new();
            for (nqn, sub) in st.subsystems.iter() {
                if filter.is_some_and(|want| want != nqn) {
                    continue;
                }
                out.push(json!({
                    "nqn": nqn,
                    "subtype": "NVMe",
                    "serial_number": sub.serial_number,
                    "model_number": "Ceph bdev Controller",
                    "min_cntlid": sub.min_cntlid,
                    "max_cntlid": sub.max_cntlid,
                    "max_namespaces": sub.max_namespaces,
                    "allow_any_host": sub.allow_any_host,
                    "hosts": sub.hosts.iter().map(|h| json!({ "nqn": h })).collect::<Vec<_>>(),
                    "namespaces": sub
                        .namespaces
                        .iter()
                        .map(|(nsid, ns)| json!({
                            "nsid": nsid,
                            "bdev_name": ns.bdev_name,
                            "uuid": ns.uuid,
                            "anagrpid": ns.anagrpid,
                        }))
                        .collect::<Vec<_>>(),
                }));
            }
            Ok(Value::Array(out))
        }
        "nvmf_subsystem_add_ns" => {
            let nqn = p_str(params, "nqn").to_string();
            let ns = params.get("namespace").cloned().unwrap_or(Value::Null);
            let bdev_name = p_str(&ns, "bdev_name").to_string();
            if !st.bdevs.contains_key(&bdev_name) {
                return Err((-19, format!("Bdev {bdev_name} does not exist")));
            }
            let sub = st
                .subsystems
                .get_mut(&nqn)
                .ok_or((-19i64, format!("Subsystem {nqn} does not exist")))?;
            let nsid = match ns.get("nsid").and_then(Value::as_u64) {
                Some(nsid) => {
                    let nsid = nsid as u32;
                    if sub.namespaces.contains_key(&nsid) {
                        return Err((-17, format!("NSID {nsid} already in use")));
                    }
                    if sub.max_namespaces != 0 && nsid > sub.max_namespaces {
                        return Err((-22, format!("NSID {nsid} out of range")));
                    }
                    nsid
                }
                None => {
                    let mut nsid = 1u32;
                    while sub.namespaces.contains_key(&nsid) {
                        nsid += 1;
                    }
                    nsid
                }
            };
            sub.namespaces.insert(
                nsid,
                MockNamespace {
                    bdev_name,
                    uuid: p_str(&ns, "uuid").to_string(),
                    anagrpid: p_u32(&ns, "anagrpid"),
                },
            );
            Ok(json!(nsid))
        }
        "nvmf_subsystem_remove_ns" => {
            let nqn = p_str(params, "nqn").to_string();
            let nsid = p_u32(params, "nsid");
            let sub = st
                .subsystems
                .get_mut(&nqn)
                .ok_or((-19i64, format!("Subsystem {nqn} does not exist")))?;
            if sub.namespaces.remove(&nsid).is_none() {
                return Err((-2, format!("Namespace {nsid} does not exist")));
            }
            Ok(Value::Bool(true))
        }
        "nvmf_subsystem_add_host" => {
            let nqn = p_str(params, "nqn").to_string();
            let host = p_str(params, "host").to_string();
            let sub = st
                .subsystems
                .get_mut(&nqn)
                .ok_or((-19i64, format!("Subsystem {nqn} does not exist")))?;
            if sub.hosts.contains(&host) {
                return Err((-17, format!("Host {host} already allowed")));
            }
            sub.hosts.push(host);
            Ok(Value::Bool(true))
        }
        "nvmf_subsystem_remove_host" => {
            let nqn = p_str(params, "nqn").to_string();
            let host = p_str(params, "host");
            let sub = st
                .subsystems
                .get_mut(&nqn)
                .ok_or((-19i64, format!("Subsystem {nqn} does not exist")))?;
            let before = sub.hosts.len();
            sub.hosts.retain(|h| h != host);
            if sub.hosts.len() == before {
                return Err((-2, format!("Host {host} is not allowed")));
            }
            Ok(Value::Bool(true))
        }
        "nvmf_subsystem_allow_any_host" => {
            let nqn = p_str(params, "nqn").to_string();
            let disable = params
                .get("disable")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let sub = st
                .subsystems
                .get_mut(&nqn)
                .ok_or((-19i64, format!("Subsystem {nqn} does not exist")))?;
            sub.allow_any_host = !disable;
            Ok(Value::Bool(true))
        }
        "nvmf_subsystem_add_listener" => {
            let nqn = p_str(params, "nqn").to_string();
            let la = params.get("listen_address").cloned().unwrap_or(Value::Null);
            let traddr = p_str(&la, "traddr").to_string();
            let trsvcid = p_str(&la, "trsvcid").to_string();
            let sub = st
                .subsystems
                .get_mut(&nqn)
                .ok_or((-19i64, format!("Subsystem {nqn} does not exist")))?;
            if sub
                .listeners
                .iter()
                .any(|l| l.traddr == traddr && l.trsvcid == trsvcid)
            {
                return Err((-17, format!("Listener {traddr}:{trsvcid} already exists")));
            }
            sub.listeners.push(MockListener {
                traddr,
                trsvcid,
                adrfam: p_str(&la, "adrfam").to_string(),
                secure: la
                    .get("secure_channel")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            });
            Ok(Value::Bool(true))
        }
        "nvmf_subsystem_remove_listener" => {
            let nqn = p_str(params, "nqn").to_string();
            let la = params.get("listen_address").cloned().unwrap_or(Value::Null);
            let traddr = p_str(&la, "traddr").to_string();
            let trsvcid = p_str(&la, "trsvcid").to_string();
            let sub = st
                .subsystems
                .get_mut(&nqn)
                .ok_or((-19i64, format!("Subsystem {nqn} does not exist")))?;
            sub.listeners
                .retain(|l| !(l.traddr == traddr && l.trsvcid == trsvcid));
            Ok(Value::Bool(true))
        }
        "nvmf_subsystem_listener_set_ana_state" => {
            let nqn = p_str(params, "nqn").to_string();
            let la = params.get("listen_address").cloned().unwrap_or(Value::Null);
            let key = (
                nqn,
                p_str(&la, "traddr").to_string(),
                p_str(&la, "trsvcid").to_string(),
                p_u32(params, "anagrpid"),
            );
            let ana_state = p_str(params, "ana_state").to_string();
            st.ana_states.insert(key, ana_state);
            Ok(Value::Bool(true))
        }
        "nvmf_subsystem_get_qpairs" | "nvmf_subsystem_get_controllers" => {
            Ok(Value::Array(vec![]))
        }
        "bdev_rbd_register_cluster" => {
            let name = p_str(params, "name").to_string();
            st.clusters.insert(name.clone());
            Ok(json!(format!("nonce-{name}")))
        }
        "bdev_rbd_unregister_cluster" => {
            let name = p_str(params, "name");
            if !st.clusters.remove(name) {
                return Err((-2, format!("Cluster {name} does not exist")));
            }
            Ok(Value::Bool(true))
        }
        "bdev_rbd_create" => {
            let name = p_str(params, "name").to_string();
            let cluster = p_str(params, "cluster_name").to_string();
            if !st.clusters.contains(&cluster) {
                return Err((-19, format!("Cluster {cluster} does not exist")));
            }
            if st.bdevs.contains_key(&name) {
                return Err((-17, format!("Bdev {name} already exists")));
            }
            st.bdevs.insert(
                name.clone(),
                MockBdev {
                    cluster,
                    pool: p_str(params, "pool_name").to_string(),
                    image: p_str(params, "rbd_name").to_string(),
                    block_size: p_u32(params, "block_size"),
                    uuid: p_str(params, "uuid").to_string(),
                    size_mib: 16,
                    qos: Map::new(),
                },
            );
            Ok(json!(name))
        }
        "bdev_rbd_delete" => {
            let name = p_str(params, "name");
            if st.bdevs.remove(name).is_none() {
                return Err((-19, format!("Bdev {name} does not exist")));
            }
            Ok(Value::Bool(true))
        }
        "bdev_rbd_resize" => {
            let name = p_str(params, "name").to_string();
            let new_size = params.get("new_size").and_then(Value::as_u64).unwrap_or(0);
            let bdev = st
                .bdevs
                .get_mut(&name)
                .ok_or((-19i64, format!("Bdev {name} does not exist")))?;
            bdev.size_mib = new_size;
            Ok(Value::Bool(true))
        }
        "bdev_get_bdevs" => {
            let filter = params.get("name").and_then(Value::as_str);
            let mut out = Vec::new();
            for (name, bdev) in st.bdevs.iter() {
                if filter.is_some_and(|want| want != name) {
                    continue;
                }
                let limits = |key: &str| -> u64 {
                    bdev.qos.get(key).and_then(Value::as_u64).unwrap_or(0)
                };
                out.push(json!({
                    "name": name,
                    "block_size": bdev.block_size,
                    "num_blocks": bdev.size_mib * 1024 * 1024 / bdev.block_size.max(1) as u64,
                    "uuid": bdev.uuid,
                    "assigned_rate_limits": {
                        "rw_ios_per_sec": limits("rw_ios_per_sec"),
                        "rw_mbytes_per_sec": limits("rw_mbytes_per_sec"),
                        "r_mbytes_per_sec": limits("r_mbytes_per_sec"),
                        "w_mbytes_per_sec": limits("w_mbytes_per_sec"),
                    },
                    "driver_specific": {
                        "rbd": { "pool_name": bdev.pool, "rbd_name": bdev.image }
                    },
                }));
            }
            if filter.is_some() && out.is_empty() {
                return Err((-19, "No such device".to_string()));
            }
            Ok(Value::Array(out))
        }
        "bdev_get_iostat" => {
            let name = p_str(params, "name");
            if !st.bdevs.contains_key(name) {
                return Err((-19, format!("Bdev {name} does not exist")));
            }
            Ok(json!({
                "tick_rate": 1_000_000u64,
                "ticks": 98765u64,
                "bdevs": [{
                    "name": name,
                    "bytes_read": 4096u64,
                    "num_read_ops": 2u64,
                    "bytes_written": 8192u64,
                    "num_write_ops": 4u64,
                    "bytes_unmapped": 0u64,
                    "num_unmap_ops": 0u64,
                    "read_latency_ticks": 10u64,
                    "max_read_latency_ticks": 20u64,
                    "min_read_latency_ticks": 5u64,
                    "write_latency_ticks": 30u64,
                    "max_write_latency_ticks": 40u64,
                    "min_write_latency_ticks": 15u64,
                    "unmap_latency_ticks": 0u64,
                    "max_unmap_latency_ticks": 0u64,
                    "min_unmap_latency_ticks": 0u64,
                    "copy_latency_ticks": 0u64,
                    "max_copy_latency_ticks": 0u64,
                    "min_copy_latency_ticks": 0u64,
                    "io_error": 0,
                }],
            }))
        }
        "bdev_set_qos_limit" => {
            let name = p_str(params, "name").to_string();
            let bdev = st
                .bdevs
                .get_mut(&name)
                .ok_or((-19i64, format!("Bdev {name} does not exist")))?;
            if let Value::Object(map) = params {
                for (key, val) in map {
                    if key != "name" {
                        bdev.qos.insert(key.clone(), val.clone());
                    }
                }
            }
            Ok(Value::Bool(true))
        }
        "log_get_flags" => Ok(json!(st.log_flags)),
        "log_set_flag" => {
            let flag = p_str(params, "flag").to_string();
            st.log_flags.insert(flag, true);
            Ok(Value::Bool(true))
        }
        "log_clear_flag" => {
            let flag = p_str(params, "flag").to_string();
            st.log_flags.insert(flag, false);
            Ok(Value::Bool(true))
        }
        "log_set_level" => {
            st.log_level = p_str(params, "level").to_string();
            Ok(Value::Bool(true))
        }
        "log_get_level" => Ok(json!(st.log_level)),
        "log_set_print_level" => {
            st.log_print_level = p_str(params, "level").to_string();
            Ok(Value::Bool(true))
        }
        "log_get_print_level" => Ok(json!(st.log_print_level)),
        other => Err((-32601, format!("Method not found: {other}"))),
    }
}

/// One gateway peer wired against a shared store and its own mock engine.
pub struct TestPeer {
    pub service: Arc<GatewayService>,
    pub handler: Arc<StateHandler>,
    pub local: Arc<LocalState>,
    pub omap: Arc<OmapState>,
    pub engine: MockEngine,
}

pub fn test_config(name: &str) -> Config {
    let mut config = Config::default();
    config.gateway.name = name.to_string();
    config.gateway.group = "grouptest".to_string();
    config.gateway.state_update_interval_sec = 1;
    config.gateway.omap_file_lock_retry_sleep_interval = 0;
    config
}

pub async fn build_peer(
    store: Arc<dyn ObjectStore>,
    dir: &Path,
    name: &str,
    group_id: u32,
) -> TestPeer {
    build_peer_with_config(store, dir, test_config(name), group_id).await
}

pub async fn build_peer_with_config(
    store: Arc<dyn ObjectStore>,
    dir: &Path,
    config: Config,
    group_id: u32,
) -> TestPeer {
    let name = config.gateway.name.clone();
    let config = Arc::new(config);
    let socket_path = dir.join(format!("{name}.sock"));
    let engine = MockEngine::spawn(socket_path.clone()).await;
    let timeout = Duration::from_secs(5);
    let client = Arc::new(
        EngineClient::connect(&socket_path, timeout)
            .await
            .expect("connect mock engine"),
    );
    let subsystems_client = Arc::new(
        EngineClient::connect(&socket_path, timeout)
            .await
            .expect("connect mock engine"),
    );
    let omap = Arc::new(
        OmapState::open(Arc::clone(&store), config.state_object_name())
            .await
            .expect("open state object"),
    );
    let local = Arc::new(LocalState::new());
    let service = Arc::new(GatewayService::new(
        Arc::clone(&config),
        group_id,
        client,
        subsystems_client,
        Arc::clone(&omap),
        Arc::clone(&local),
        None,
    ));
    let handler = StateHandler::new(
        Arc::clone(&service),
        Arc::clone(&omap),
        Arc::clone(&local),
        config.gateway.state_update_interval_sec,
        config.gateway.state_update_notify,
    );
    service.attach_state_handler(&handler);
    TestPeer {
        service,
        handler,
        local,
        omap,
        engine,
    }
}

/// A fresh in-process store with the default pool plus the test pool.
pub fn shared_store() -> Arc<dyn ObjectStore> {
    let store = MemoryObjectStore::new();
    store.add_pool("rbd");
    Arc::new(store)
}
