mod common;

use common::test_config;
use nvmeof_gw::core::model::{AddressFamily, HostEntry, ListenerEntry};
use nvmeof_gw::discovery::pdu;
use nvmeof_gw::discovery::DiscoveryService;
use nvmeof_gw::state::StateDelta;
use nvmeof_gw::store::LocalState;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

const NQN: &str = "nqn.2016-06.io.spdk:cnode1";
const HOST: &str = "nqn.2016-06.io.spdk:host1";

/// Local mirror holding one subsystem with one allowed host and one
/// listener at 10.0.0.1:4420.
fn seeded_state() -> BTreeMap<String, String> {
    let mut state = BTreeMap::new();
    state.insert("omap_version".to_string(), "4".to_string());
    state.insert(
        format!("subsystem_{NQN}"),
        serde_json::json!({
            "subsystem_nqn": NQN,
            "serial_number": "SPDK0001",
            "max_namespaces": 32,
            "enable_ha": true,
        })
        .to_string(),
    );
    state.insert(
        format!("host_{NQN}_{HOST}"),
        serde_json::to_string(&HostEntry {
            subsystem_nqn: NQN.to_string(),
            host_nqn: HOST.to_string(),
            psk: None,
            dhchap_key: None,
            dhchap_ctrlr_key: None,
        })
        .unwrap(),
    );
    state.insert(
        format!("listener_{NQN}_gw-a_TCP_10.0.0.1_4420"),
        serde_json::to_string(&ListenerEntry {
            nqn: NQN.to_string(),
            gateway_name: "gw-a".to_string(),
            trtype: "TCP".to_string(),
            adrfam: AddressFamily::Ipv4,
            traddr: "10.0.0.1".to_string(),
            trsvcid: 4420,
            secure: false,
        })
        .unwrap(),
    );
    state
}

struct DiscoveryHarness {
    stream: TcpStream,
    updates: broadcast::Sender<StateDelta>,
}

async fn start_discovery() -> DiscoveryHarness {
    let local = Arc::new(LocalState::new());
    local.replace(seeded_state());

    let config = test_config("gw-a");
    let service = DiscoveryService::new(&config, local);
    let (updates, rx) = broadcast::channel(16);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = service.run_on(listener, rx).await;
    });

    let stream = TcpStream::connect(addr).await.unwrap();
    DiscoveryHarness { stream, updates }
}

fn pdu_header(pdu_type: u8, packet_length: u32) -> Vec<u8> {
    let mut buf = vec![pdu_type, 0, 0, 0];
    buf.extend_from_slice(&packet_length.to_le_bytes());
    buf
}

fn icreq() -> Vec<u8> {
    let mut buf = pdu_header(pdu::PDU_ICREQ, 128);
    buf.resize(128, 0);
    buf
}

fn connect_cmd(host_nqn: &str, subnqn: &str, kato_ms: u32) -> Vec<u8> {
    let mut buf = pdu_header(pdu::PDU_CMD, 840);
    buf.resize(840, 0);
    buf[8] = pdu::OPC_FABRIC;
    buf[10..12].copy_from_slice(&1u16.to_le_bytes()); // cmd id
    buf[12] = pdu::FCTYPE_CONNECT;
    buf[56..60].copy_from_slice(&kato_ms.to_le_bytes());
    buf[328..328 + subnqn.len()].copy_from_slice(subnqn.as_bytes());
    buf[584..584 + host_nqn.len()].copy_from_slice(host_nqn.as_bytes());
    buf
}

fn get_log_page_cmd(cmd_id: u16, data_len: u32, offset: u64) -> Vec<u8> {
    let mut buf = pdu_header(pdu::PDU_CMD, 72);
    buf.resize(72, 0);
    buf[8] = pdu::OPC_GET_LOG_PAGE;
    buf[10..12].copy_from_slice(&cmd_id.to_le_bytes());
    buf[40..44].copy_from_slice(&data_len.to_le_bytes()); // SGL length
    let numd = data_len / 4 - 1;
    let dword10 = (pdu::LID_DISCOVERY as u32) | ((numd & 0xffff) << 16);
    buf[48..52].copy_from_slice(&dword10.to_le_bytes());
    buf[52..54].copy_from_slice(&((numd >> 16) as u16).to_le_bytes());
    buf[56..64].copy_from_slice(&offset.to_le_bytes());
    buf
}

fn async_event_cmd(cmd_id: u16) -> Vec<u8> {
    let mut buf = pdu_header(pdu::PDU_CMD, 72);
    buf.resize(72, 0);
    buf[8] = pdu::OPC_ASYNC_EVENT_REQ;
    buf[10..12].copy_from_slice(&cmd_id.to_le_bytes());
    buf
}

fn keep_alive_cmd(cmd_id: u16) -> Vec<u8> {
    let mut buf = pdu_header(pdu::PDU_CMD, 72);
    buf.resize(72, 0);
    buf[8] = pdu::OPC_KEEP_ALIVE;
    buf[10..12].copy_from_slice(&cmd_id.to_le_bytes());
    buf
}

async fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("reply timed out")
        .expect("read reply");
    buf
}

async fn handshake(harness: &mut DiscoveryHarness) {
    harness.stream.write_all(&icreq()).await.unwrap();
    let icresp = read_exact(&mut harness.stream, 128).await;
    assert_eq!(icresp[0], pdu::PDU_ICRESP);
    assert_eq!(pdu::get_u32_le(&icresp, 12), 131072);

    harness
        .stream
        .write_all(&connect_cmd(HOST, "nqn.2014-08.org.nvmexpress.discovery", 0))
        .await
        .unwrap();
    let cqe = read_exact(&mut harness.stream, 24).await;
    assert_eq!(cqe[0], pdu::PDU_RSP);
    assert_eq!(pdu::get_u16_le(&cqe, 20), 1); // cmd id echoed
}

#[tokio::test]
async fn test_discovery_log_page_for_allowed_host() {
    let mut harness = start_discovery().await;
    handshake(&mut harness).await;

    // Header-only probe: 16 bytes reporting one visible listener.
    harness
        .stream
        .write_all(&get_log_page_cmd(2, 16, 0))
        .await
        .unwrap();
    let probe = read_exact(&mut harness.stream, 24 + 16).await;
    assert_eq!(probe[0], pdu::PDU_C2H_DATA);
    assert_eq!(pdu::get_u64_le(&probe, 24 + 8), 1); // numrec

    // Full page: 1024-byte header plus one 1024-byte entry.
    harness
        .stream
        .write_all(&get_log_page_cmd(3, 2048, 0))
        .await
        .unwrap();
    let page = read_exact(&mut harness.stream, 24 + 2048).await;
    let payload = &page[24..];
    assert_eq!(pdu::get_u64_le(payload, 8), 1); // numrec
    let entry = &payload[1024..2048];
    assert_eq!(entry[0], pdu::TRTYPE_TCP);
    assert_eq!(pdu::get_padded_str(entry, 32, 32), "4420");
    assert_eq!(pdu::get_padded_str(entry, 256, 256), NQN);
    assert_eq!(pdu::get_padded_str(entry, 512, 256), "10.0.0.1");
}

#[tokio::test]
async fn test_discovery_log_page_hides_other_hosts() {
    let mut harness = start_discovery().await;
    harness.stream.write_all(&icreq()).await.unwrap();
    let _ = read_exact(&mut harness.stream, 128).await;
    harness
        .stream
        .write_all(&connect_cmd(
            "nqn.2016-06.io.spdk:uninvited",
            "nqn.2014-08.org.nvmexpress.discovery",
            0,
        ))
        .await
        .unwrap();
    let _ = read_exact(&mut harness.stream, 24).await;

    harness
        .stream
        .write_all(&get_log_page_cmd(2, 16, 0))
        .await
        .unwrap();
    let probe = read_exact(&mut harness.stream, 24 + 16).await;
    assert_eq!(pdu::get_u64_le(&probe, 24 + 8), 0); // no visible listeners
}

#[tokio::test]
async fn test_async_event_fires_on_topology_change() {
    let mut harness = start_discovery().await;
    handshake(&mut harness).await;

    // Park an async event request; no reply yet.
    harness
        .stream
        .write_all(&async_event_cmd(9))
        .await
        .unwrap();
    // Give the server a moment to register the parked command.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A namespace-only change must not wake the session.
    harness
        .updates
        .send(StateDelta {
            added: vec![format!("namespace_{NQN}_1")],
            removed: vec![],
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A listener change does.
    harness
        .updates
        .send(StateDelta {
            added: vec![format!("listener_{NQN}_gw-b_TCP_10.0.0.2_4420")],
            removed: vec![],
        })
        .unwrap();

    let cqe = read_exact(&mut harness.stream, 24).await;
    assert_eq!(cqe[0], pdu::PDU_RSP);
    assert_eq!(&cqe[8..12], &[0x02, 0xf0, 0x70, 0x00]);
    assert_eq!(pdu::get_u16_le(&cqe, 20), 9); // the parked cmd id
}

#[tokio::test]
async fn test_keep_alive_refreshes_and_replies() {
    let mut harness = start_discovery().await;
    handshake(&mut harness).await;

    harness
        .stream
        .write_all(&keep_alive_cmd(4))
        .await
        .unwrap();
    let cqe = read_exact(&mut harness.stream, 24).await;
    assert_eq!(cqe[0], pdu::PDU_RSP);
    assert_eq!(pdu::get_u16_le(&cqe, 20), 4);
}

#[tokio::test]
async fn test_malformed_pdu_closes_connection() {
    let mut harness = start_discovery().await;
    handshake(&mut harness).await;

    // Unknown PDU type tears the connection down.
    harness
        .stream
        .write_all(&{
            let mut buf = pdu_header(0x09, 16);
            buf.resize(16, 0);
            buf
        })
        .await
        .unwrap();
    let mut probe = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), harness.stream.read(&mut probe))
        .await
        .expect("close timed out")
        .unwrap_or(0);
    assert_eq!(n, 0);
}
