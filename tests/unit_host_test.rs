mod common;

use common::{build_peer, shared_store};
use nvmeof_gw::core::model::{AddressFamily, HostEntry, ListenerEntry, SubsystemEntry};
use nvmeof_gw::service::CallMode;
use tempfile::TempDir;

const NQN: &str = "nqn.2016-06.io.spdk:cnode1";
const HOST: &str = "nqn.2016-06.io.spdk:host1";

fn host_req(host_nqn: &str) -> HostEntry {
    HostEntry {
        subsystem_nqn: NQN.to_string(),
        host_nqn: host_nqn.to_string(),
        psk: None,
        dhchap_key: None,
        dhchap_ctrlr_key: None,
    }
}

async fn peer_with_subsystem(dir: &TempDir) -> common::TestPeer {
    let peer = build_peer(shared_store(), dir.path(), "gw-a", 0).await;
    peer.service
        .create_subsystem(
            SubsystemEntry {
                subsystem_nqn: NQN.to_string(),
                serial_number: "SPDK0001".to_string(),
                max_namespaces: 32,
                enable_ha: true,
            },
            CallMode::Authoritative,
        )
        .await
        .unwrap();
    peer
}

#[tokio::test]
async fn test_add_and_remove_host() {
    let dir = TempDir::new().unwrap();
    let peer = peer_with_subsystem(&dir).await;

    peer.service
        .add_host(host_req(HOST), CallMode::Authoritative)
        .await
        .unwrap();
    assert!(peer.engine.state.lock().subsystems[NQN]
        .hosts
        .contains(&HOST.to_string()));
    let state = peer.omap.get_state().await.unwrap();
    assert!(state.contains_key(&format!("host_{NQN}_{HOST}")));

    // The same grant again conflicts.
    let err = peer
        .service
        .add_host(host_req(HOST), CallMode::Authoritative)
        .await
        .unwrap_err();
    assert_eq!(err.errno(), libc::EEXIST);

    peer.service
        .remove_host(NQN, HOST, CallMode::Authoritative)
        .await
        .unwrap();
    assert!(peer.engine.state.lock().subsystems[NQN].hosts.is_empty());
    let state = peer.omap.get_state().await.unwrap();
    assert!(!state.contains_key(&format!("host_{NQN}_{HOST}")));
}

#[tokio::test]
async fn test_any_host_toggle() {
    let dir = TempDir::new().unwrap();
    let peer = peer_with_subsystem(&dir).await;

    peer.service
        .add_host(host_req("*"), CallMode::Authoritative)
        .await
        .unwrap();
    assert!(peer.engine.state.lock().subsystems[NQN].allow_any_host);

    peer.service
        .remove_host(NQN, "*", CallMode::Authoritative)
        .await
        .unwrap();
    assert!(!peer.engine.state.lock().subsystems[NQN].allow_any_host);
}

#[tokio::test]
async fn test_any_host_refuses_credentials() {
    let dir = TempDir::new().unwrap();
    let peer = peer_with_subsystem(&dir).await;

    let mut req = host_req("*");
    req.psk = Some("NVMeTLSkey-1:01:abcdef:".to_string());
    let err = peer
        .service
        .add_host(req, CallMode::Authoritative)
        .await
        .unwrap_err();
    assert_eq!(err.errno(), libc::EINVAL);

    let mut req = host_req("*");
    req.dhchap_key = Some("DHHC-1:00:key:".to_string());
    let err = peer
        .service
        .add_host(req, CallMode::Authoritative)
        .await
        .unwrap_err();
    assert_eq!(err.errno(), libc::EINVAL);
}

#[tokio::test]
async fn test_dhchap_ctrlr_key_requires_dhchap_key() {
    let dir = TempDir::new().unwrap();
    let peer = peer_with_subsystem(&dir).await;

    let mut req = host_req(HOST);
    req.dhchap_ctrlr_key = Some("DHHC-1:00:ctrl:".to_string());
    let err = peer
        .service
        .add_host(req, CallMode::Authoritative)
        .await
        .unwrap_err();
    assert_eq!(err.errno(), libc::EINVAL);

    let mut req = host_req(HOST);
    req.dhchap_key = Some("DHHC-1:00:key:".to_string());
    req.dhchap_ctrlr_key = Some("DHHC-1:00:ctrl:".to_string());
    peer.service
        .add_host(req, CallMode::Authoritative)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_discovery_nqn_rejected_for_hosts() {
    let dir = TempDir::new().unwrap();
    let peer = peer_with_subsystem(&dir).await;

    let mut req = host_req(HOST);
    req.subsystem_nqn = "nqn.2014-08.org.nvmexpress.discovery".to_string();
    assert_eq!(
        peer.service
            .add_host(req, CallMode::Authoritative)
            .await
            .unwrap_err()
            .errno(),
        libc::EINVAL
    );

    let req = host_req("nqn.2014-08.org.nvmexpress.discovery");
    assert_eq!(
        peer.service
            .add_host(req, CallMode::Authoritative)
            .await
            .unwrap_err()
            .errno(),
        libc::EINVAL
    );
}

#[tokio::test]
async fn test_any_host_conflicts_with_secure_listener() {
    let dir = TempDir::new().unwrap();
    let peer = peer_with_subsystem(&dir).await;

    peer.service
        .create_listener(
            ListenerEntry {
                nqn: NQN.to_string(),
                gateway_name: "gw-a".to_string(),
                trtype: "TCP".to_string(),
                adrfam: AddressFamily::Ipv4,
                traddr: "10.0.0.1".to_string(),
                trsvcid: 4420,
                secure: true,
            },
            CallMode::Authoritative,
        )
        .await
        .unwrap();

    let err = peer
        .service
        .add_host(host_req("*"), CallMode::Authoritative)
        .await
        .unwrap_err();
    assert_eq!(err.errno(), libc::EINVAL);

    // A specific host is still fine.
    peer.service
        .add_host(host_req(HOST), CallMode::Authoritative)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_list_hosts_reports_key_usage() {
    let dir = TempDir::new().unwrap();
    let peer = peer_with_subsystem(&dir).await;

    let mut req = host_req(HOST);
    req.psk = Some("NVMeTLSkey-1:01:abcdef:".to_string());
    peer.service
        .add_host(req, CallMode::Authoritative)
        .await
        .unwrap();

    let list = peer.service.list_hosts(NQN).await.unwrap();
    assert!(!list.allow_any_host);
    assert_eq!(list.hosts.len(), 1);
    assert_eq!(list.hosts[0].nqn, HOST);
    assert!(list.hosts[0].use_psk);
    assert!(!list.hosts[0].use_dhchap);
}
