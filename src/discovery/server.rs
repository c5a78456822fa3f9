// src/discovery/server.rs

//! The discovery controller: answers NVMe/TCP discovery requests from the
//! current group state, with per-connection sessions, keep-alive eviction
//! and asynchronous event notification on topology changes.

use crate::config::Config;
use crate::core::errors::GwError;
use crate::core::model::{AddressFamily, HostEntry, ListenerEntry};
use crate::discovery::pdu::{self, PduCodec};
use crate::discovery::session::{Session, SessionShared, DEFAULT_KATO_MS};
use crate::state::StateDelta;
use crate::store::keys;
use crate::store::{LocalState, ObjectStore, OmapState};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Maximum number of concurrent discovery connections.
const MAX_CONNECTIONS: usize = 10240;

/// Cadence of the idle-connection scanner.
const SCAN_INTERVAL: Duration = Duration::from_secs(1);

pub struct DiscoveryService {
    local: Arc<LocalState>,
    sessions: Mutex<HashMap<u64, SessionShared>>,
    connection_counter: AtomicU64,
    addr: String,
    port: u16,
}

enum PduOutcome {
    Continue,
    Close,
}

impl DiscoveryService {
    pub fn new(config: &Config, local: Arc<LocalState>) -> Arc<Self> {
        Arc::new(Self {
            local,
            sessions: Mutex::new(HashMap::new()),
            connection_counter: AtomicU64::new(1),
            addr: config.discovery.addr.clone(),
            port: config.discovery.port,
        })
    }

    /// Binds the listener and serves until cancelled. `updates` feeds the
    /// asynchronous-event notification path.
    pub async fn run(
        self: Arc<Self>,
        updates: broadcast::Receiver<StateDelta>,
    ) -> Result<(), GwError> {
        let listener = TcpListener::bind((self.addr.as_str(), self.port)).await?;
        self.run_on(listener, updates).await
    }

    /// Serves discovery on an already-bound listener.
    pub async fn run_on(
        self: Arc<Self>,
        listener: TcpListener,
        updates: broadcast::Receiver<StateDelta>,
    ) -> Result<(), GwError> {
        if let Ok(addr) = listener.local_addr() {
            info!("Discovery controller listening on {addr}");
        }

        let scanner = Arc::clone(&self);
        tokio::spawn(async move { scanner.scan_idle_connections().await });
        let notifier = Arc::clone(&self);
        tokio::spawn(async move { notifier.aen_loop(updates).await });

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            if self.sessions.lock().len() >= MAX_CONNECTIONS {
                warn!("Discovery connection limit reached, rejecting {peer_addr}");
                continue;
            }
            debug!("Accept discovery connection from {peer_addr}");
            let service = Arc::clone(&self);
            tokio::spawn(async move { service.handle_connection(stream).await });
        }
    }

    /// Scans for sessions whose keep-alive deadline has passed and evicts
    /// them; each connection task owns its own teardown.
    async fn scan_idle_connections(self: Arc<Self>) {
        loop {
            tokio::time::sleep(SCAN_INTERVAL).await;
            let now = Instant::now();
            let sessions = self.sessions.lock();
            for (id, shared) in sessions.iter() {
                if shared.keep_alive_timeout_ms != 0
                    && now.duration_since(shared.last_activity)
                        >= Duration::from_millis(shared.keep_alive_timeout_ms as u64)
                {
                    debug!("Discovery connection {id} timed out");
                    shared.shutdown.notify_one();
                }
            }
        }
    }

    /// Emits the discovery-log-changed event to every session parked on an
    /// async event request whenever the topology changed.
    async fn aen_loop(self: Arc<Self>, mut updates: broadcast::Receiver<StateDelta>) {
        loop {
            match updates.recv().await {
                Ok(delta) => {
                    if delta.touches_topology() {
                        self.fire_async_events();
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Discovery missed {n} state updates, firing async events");
                    self.fire_async_events();
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    fn fire_async_events(&self) {
        let mut sessions = self.sessions.lock();
        for shared in sessions.values_mut() {
            if let Some(cmd_id) = shared.pending_async.take() {
                let cqe =
                    pdu::cqe_nvme_reply(pdu::aen_dword0(), 0, shared.sq_head_ptr, cmd_id);
                if shared.tx.send(cqe).is_err() {
                    debug!("Async event receiver went away");
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) {
        let id = self.connection_counter.fetch_add(1, Ordering::SeqCst);
        let (read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
        let shutdown = Arc::new(Notify::new());

        self.sessions.lock().insert(
            id,
            SessionShared {
                last_activity: Instant::now(),
                keep_alive_timeout_ms: 0,
                sq_head_ptr: 0,
                pending_async: None,
                tx,
                shutdown: Arc::clone(&shutdown),
            },
        );

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if write_half.write_all(&frame).await.is_err() {
                    error!("client disconnected unexpectedly");
                    break;
                }
            }
        });

        let mut session = Session::new(Uuid::new_v4().as_u128() as u16, id);
        let mut framed = FramedRead::new(read_half, PduCodec);
        loop {
            tokio::select! {
                frame = framed.next() => {
                    match frame {
                        Some(Ok(data)) => {
                            match self.process_pdu(id, &mut session, &data) {
                                PduOutcome::Continue => {}
                                PduOutcome::Close => break,
                            }
                            if session.shutdown_now {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            error!("Malformed discovery PDU: {e}");
                            break;
                        }
                        None => break,
                    }
                }
                _ = shutdown.notified() => break,
            }
        }

        self.sessions.lock().remove(&id);
        writer.abort();
        debug!("Discovery connection {id} finished");
    }

    /// Dispatches one inbound PDU and queues the reply.
    fn process_pdu(&self, id: u64, session: &mut Session, data: &Bytes) -> PduOutcome {
        let Some(header) = pdu::PduHeader::parse(data) else {
            return PduOutcome::Close;
        };
        let sq_head = session.bump_sq_head();

        let reply = match header.pdu_type {
            pdu::PDU_ICREQ => Some(pdu::icresp_reply()),
            pdu::PDU_CMD => {
                if data.len() < 12 {
                    return PduOutcome::Close;
                }
                let opcode = data[8];
                let cmd_id = pdu::get_u16_le(data, 10);
                match self.handle_command(id, session, data, opcode, cmd_id, sq_head) {
                    Ok(reply) => reply,
                    Err(()) => return PduOutcome::Close,
                }
            }
            other => {
                error!("unsupported PDU type: {other}");
                return PduOutcome::Close;
            }
        };

        // Refresh the shared view used by the scanner and the AEN path.
        {
            let mut sessions = self.sessions.lock();
            if let Some(shared) = sessions.get_mut(&id) {
                shared.last_activity = Instant::now();
                shared.keep_alive_timeout_ms = session.keep_alive_timeout_ms;
                shared.sq_head_ptr = session.sq_head_ptr;
                if let Some(reply) = reply {
                    if shared.tx.send(reply).is_err() {
                        return PduOutcome::Close;
                    }
                }
            } else {
                return PduOutcome::Close;
            }
        }
        PduOutcome::Continue
    }

    fn handle_command(
        &self,
        id: u64,
        session: &mut Session,
        data: &Bytes,
        opcode: u8,
        cmd_id: u16,
        sq_head: u16,
    ) -> Result<Option<Bytes>, ()> {
        match opcode {
            pdu::OPC_FABRIC => {
                if data.len() < 13 {
                    return Err(());
                }
                let fctype = data[12];
                match fctype {
                    pdu::FCTYPE_CONNECT => self.handle_connect(session, data, cmd_id, sq_head),
                    pdu::FCTYPE_PROP_GET => self.handle_prop_get(session, data, cmd_id, sq_head),
                    pdu::FCTYPE_PROP_SET => self.handle_prop_set(session, data, cmd_id, sq_head),
                    other => {
                        error!("unsupported fabric command type: {other}");
                        Err(())
                    }
                }
            }
            pdu::OPC_GET_LOG_PAGE => self.handle_get_log_page(session, data, cmd_id),
            pdu::OPC_IDENTIFY => {
                debug!("handle identify request");
                let payload = pdu::identify_payload(session.controller_id, &session.subnqn);
                Ok(Some(pdu::c2h_data_reply(cmd_id, &payload)))
            }
            pdu::OPC_SET_FEATURES => {
                debug!("handle set feature request");
                Ok(Some(pdu::cqe_nvme_reply(0, 0, sq_head, cmd_id)))
            }
            pdu::OPC_GET_FEATURES => {
                debug!("handle get feature request");
                Ok(Some(pdu::cqe_nvme_reply(
                    session.keep_alive_timeout_ms,
                    0,
                    sq_head,
                    cmd_id,
                )))
            }
            pdu::OPC_KEEP_ALIVE => {
                debug!("handle keep alive request");
                Ok(Some(pdu::cqe_nvme_reply(0, 0, sq_head, cmd_id)))
            }
            pdu::OPC_ASYNC_EVENT_REQ => {
                debug!("parse and store async event");
                let mut sessions = self.sessions.lock();
                if let Some(shared) = sessions.get_mut(&id) {
                    shared.pending_async = Some(cmd_id);
                }
                Ok(None)
            }
            other => {
                error!("unsupported opcode: {other}");
                Err(())
            }
        }
    }

    fn handle_connect(
        &self,
        session: &mut Session,
        data: &Bytes,
        cmd_id: u16,
        sq_head: u16,
    ) -> Result<Option<Bytes>, ()> {
        debug!("handle connect request");
        if data.len() < 840 {
            error!("connect command too short: {} bytes", data.len());
            return Err(());
        }
        let mut kato = pdu::get_u32_le(data, 56);
        if kato == 0 {
            kato = DEFAULT_KATO_MS;
        }
        debug!("connection keep alive {kato}ms");
        session.keep_alive_timeout_ms = kato;
        session.host_id.copy_from_slice(&data[72..88]);
        session.host_cntlid = pdu::get_u16_le(data, 88);
        session.subnqn.copy_from_slice(&data[328..584]);
        session.host_nqn = pdu::get_padded_str(data, 584, 256);

        Ok(Some(pdu::cqe_connect_reply(
            session.controller_id,
            sq_head,
            cmd_id,
        )))
    }

    fn handle_prop_get(
        &self,
        session: &mut Session,
        data: &Bytes,
        cmd_id: u16,
        sq_head: u16,
    ) -> Result<Option<Bytes>, ()> {
        debug!("handle property get request");
        if data.len() < 56 {
            return Err(());
        }
        let offset = pdu::get_u32_le(data, 52);
        let property_data: [u8; 8] = match offset {
            pdu::REG_CAP => {
                // Max queue entries 128, contiguous queues required,
                // ready timeout 15000ms, NVM command set.
                [0x7f, 0x00, 0x01, 0x1e, 0x20, 0x00, 0x00, 0x00]
            }
            pdu::REG_VS => [0x00, 0x03, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00],
            pdu::REG_CC => session.cc,
            pdu::REG_CSTS => {
                let shutdown_notification = (session.cc[1] >> 6) & 0x3;
                if shutdown_notification == 0 {
                    let enabled = session.cc[0] & 0x1;
                    if enabled != 0 {
                        [0x01, 0, 0, 0, 0, 0, 0, 0]
                    } else {
                        [0x00, 0, 0, 0, 0, 0, 0, 0]
                    }
                } else {
                    session.shutdown_now = true;
                    [0x09, 0, 0, 0, 0, 0, 0, 0]
                }
            }
            other => {
                error!("unsupported offset {other:#x} for property getting");
                [0; 8]
            }
        };
        Ok(Some(pdu::cqe_property_reply(property_data, sq_head, cmd_id)))
    }

    fn handle_prop_set(
        &self,
        session: &mut Session,
        data: &Bytes,
        cmd_id: u16,
        sq_head: u16,
    ) -> Result<Option<Bytes>, ()> {
        debug!("handle property set request");
        if data.len() < 64 {
            return Err(());
        }
        let offset = pdu::get_u32_le(data, 52);
        match offset {
            pdu::REG_CC => {
                session.cc.copy_from_slice(&data[56..64]);
            }
            other => {
                error!("unsupported offset {other:#x} for property setting");
            }
        }
        Ok(Some(pdu::cqe_property_reply([0; 8], sq_head, cmd_id)))
    }

    fn handle_get_log_page(
        &self,
        session: &mut Session,
        data: &Bytes,
        cmd_id: u16,
    ) -> Result<Option<Bytes>, ()> {
        debug!("handle get log page request");
        if data.len() < 72 {
            return Err(());
        }
        let sgl_len = pdu::get_u32_le(data, 40) as usize;
        let dword10 = pdu::get_u32_le(data, 48);
        let numdl = pdu::get_u16_le(data, 50) as u32;
        let numdh = pdu::get_u16_le(data, 52) as u32;
        let numd = (numdh << 16) + numdl;
        let nvme_data_len = ((numd + 1) * 4) as usize;
        let logpage_offset = pdu::get_u64_le(data, 56) as usize;
        let lid = (dword10 & 0xff) as u8;

        if lid != pdu::LID_DISCOVERY {
            error!("request type error, not discovery request");
            return Err(());
        }
        if nvme_data_len != sgl_len {
            error!("request data len error, {nvme_data_len} != {sgl_len}");
            return Err(());
        }

        // Resolve the listener set this host may see, once per cycle.
        if session.allow_listeners.is_empty() {
            session.allow_listeners = self.allowed_listeners(&session.host_nqn);
        }

        // First real request: stage the full log page for slicing.
        if session.unsent_log_page_len == 0 && nvme_data_len > 16 {
            let entries = &session.allow_listeners;
            session.unsent_log_page_len = pdu::LOG_PAGE_UNIT * (entries.len() + 1);
            let mut log_page =
                pdu::log_page_header(session.gen_cnt, entries.len() as u64);
            log_page.reserve(pdu::LOG_PAGE_UNIT * entries.len());
            for (idx, listener) in entries.iter().enumerate() {
                let adrfam = match listener.adrfam {
                    AddressFamily::Ipv4 => pdu::ADRFAM_IPV4,
                    AddressFamily::Ipv6 => pdu::ADRFAM_IPV6,
                };
                log_page.extend_from_slice(&pdu::log_page_entry(
                    adrfam,
                    idx as u16,
                    &listener.trsvcid.to_string(),
                    &listener.nqn,
                    &listener.traddr,
                ));
            }
            session.log_page = log_page;
        } else {
            debug!("in the process of sending log pages...");
        }

        let reply = if nvme_data_len <= pdu::LOG_PAGE_UNIT && logpage_offset == 0 {
            // Header-only probe.
            let header = pdu::log_page_header(
                session.gen_cnt,
                session.allow_listeners.len() as u64,
            );
            pdu::c2h_data_reply(cmd_id, &header[..nvme_data_len])
        } else if nvme_data_len % pdu::LOG_PAGE_UNIT == 0 {
            let end = logpage_offset + nvme_data_len;
            if end > session.log_page.len() {
                error!("request log page: invalid offset/length {logpage_offset}+{nvme_data_len}");
                return Err(());
            }
            let reply =
                pdu::c2h_data_reply(cmd_id, &session.log_page[logpage_offset..end]);
            session.unsent_log_page_len =
                session.unsent_log_page_len.saturating_sub(nvme_data_len);
            if session.unsent_log_page_len == 0 {
                session.log_page.clear();
                session.allow_listeners.clear();
            }
            reply
        } else {
            error!("request log page: invalid length error {nvme_data_len}");
            return Err(());
        };
        Ok(Some(reply))
    }

    /// Filters the listener set against the host-access rules: a listener
    /// is visible when its subsystem has a host entry matching this host's
    /// NQN or the `*` wildcard.
    fn allowed_listeners(&self, host_nqn: &str) -> Vec<ListenerEntry> {
        let mut hosts: Vec<HostEntry> = Vec::new();
        for (_, val) in self.local.prefixed(keys::HOST_PREFIX) {
            match serde_json::from_str(&val) {
                Ok(entry) => hosts.push(entry),
                Err(e) => warn!("Got error parsing host entry: {e}"),
            }
        }
        let mut listeners: Vec<ListenerEntry> = Vec::new();
        for (_, val) in self.local.prefixed(keys::LISTENER_PREFIX) {
            match serde_json::from_str(&val) {
                Ok(entry) => listeners.push(entry),
                Err(e) => warn!("Got error parsing listener entry: {e}"),
            }
        }

        let mut allowed = Vec::new();
        for host in &hosts {
            if host.host_nqn == "*" || host.host_nqn == host_nqn {
                for listener in &listeners {
                    if host.subsystem_nqn == listener.nqn {
                        allowed.push(listener.clone());
                    }
                }
            }
        }
        allowed
    }
}

/// Runs the discovery responder standalone, with its own mirror of the
/// group state and a minimal poll/notify loop in place of the full
/// reconciler.
pub async fn run_standalone(
    config: &Config,
    store: Arc<dyn ObjectStore>,
) -> Result<(), GwError> {
    let omap = Arc::new(OmapState::open(store, config.state_object_name()).await?);
    let local = Arc::new(LocalState::new());
    info!("Discovery log pages served from: {}", omap.object_name());

    let service = DiscoveryService::new(config, Arc::clone(&local));
    let (bus_tx, bus_rx) = broadcast::channel(64);

    let notify = Arc::new(Notify::new());
    if config.gateway.state_update_notify {
        omap.register_watch(Arc::clone(&notify)).await?;
    }
    let interval = Duration::from_secs(config.gateway.state_update_interval_sec.max(1));
    tokio::spawn(async move {
        loop {
            let next_tick = tokio::time::Instant::now() + interval;
            match omap.get_state().await {
                Ok(remote) => {
                    let local_snapshot = local.get_state();
                    let delta = snapshot_delta(&local_snapshot, &remote);
                    if !delta.added.is_empty() || !delta.removed.is_empty() {
                        if let Ok(version) = OmapState::version_of(&remote) {
                            omap.set_local_version(version);
                        }
                        local.replace(remote);
                        let _ = bus_tx.send(delta);
                    }
                }
                Err(e) => error!("Failed to read the group state: {e}"),
            }
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep_until(next_tick) => {}
            }
        }
    });

    service.run(bus_rx).await
}

fn snapshot_delta(
    local: &BTreeMap<String, String>,
    remote: &BTreeMap<String, String>,
) -> StateDelta {
    let mut delta = StateDelta::default();
    for (key, val) in remote {
        if local.get(key) != Some(val) {
            delta.added.push(key.clone());
        }
    }
    for key in local.keys() {
        if !remote.contains_key(key) {
            delta.removed.push(key.clone());
        }
    }
    delta
}
