mod common;

use common::{build_peer, shared_store};
use nvmeof_gw::core::model::{NamespaceEntry, SubsystemEntry};
use nvmeof_gw::service::CallMode;
use tempfile::TempDir;

const NQN: &str = "nqn.2016-06.io.spdk:cnode1";

fn subsystem_req(nqn: &str) -> SubsystemEntry {
    SubsystemEntry {
        subsystem_nqn: nqn.to_string(),
        serial_number: String::new(),
        max_namespaces: 32,
        enable_ha: true,
    }
}

#[tokio::test]
async fn test_create_subsystem_reaches_engine_and_store() {
    let dir = TempDir::new().unwrap();
    let peer = build_peer(shared_store(), dir.path(), "gw-a", 0).await;

    peer.service
        .create_subsystem(subsystem_req(NQN), CallMode::Authoritative)
        .await
        .unwrap();

    // Engine got the subsystem with this peer's controller-id block.
    {
        let engine = peer.engine.state.lock();
        let sub = engine.subsystems.get(NQN).expect("subsystem in engine");
        assert_eq!(sub.min_cntlid, 1);
        assert_eq!(sub.max_cntlid, 2040);
        assert!(sub.ana_reporting);
        assert!(sub.serial_number.starts_with("SPDK"));
    }

    // The record got exactly one version bump and holds the entry.
    assert_eq!(peer.omap.stored_version().await.unwrap(), 2);
    let state = peer.omap.get_state().await.unwrap();
    let raw = state.get(&format!("subsystem_{NQN}")).expect("stored entry");
    let entry: SubsystemEntry = serde_json::from_str(raw).unwrap();
    assert_eq!(entry.subsystem_nqn, NQN);
    assert!(!entry.serial_number.is_empty());
}

#[tokio::test]
async fn test_cntlid_block_follows_group_id() {
    let dir = TempDir::new().unwrap();
    let peer = build_peer(shared_store(), dir.path(), "gw-b", 2).await;

    peer.service
        .create_subsystem(subsystem_req(NQN), CallMode::Authoritative)
        .await
        .unwrap();
    let engine = peer.engine.state.lock();
    let sub = engine.subsystems.get(NQN).unwrap();
    assert_eq!(sub.min_cntlid, 2 * 2040 + 1);
    assert_eq!(sub.max_cntlid, 3 * 2040);
}

#[tokio::test]
async fn test_create_subsystem_duplicate_nqn() {
    let dir = TempDir::new().unwrap();
    let peer = build_peer(shared_store(), dir.path(), "gw-a", 0).await;

    peer.service
        .create_subsystem(subsystem_req(NQN), CallMode::Authoritative)
        .await
        .unwrap();
    let err = peer
        .service
        .create_subsystem(subsystem_req(NQN), CallMode::Authoritative)
        .await
        .unwrap_err();
    assert_eq!(err.errno(), libc::EEXIST);
}

#[tokio::test]
async fn test_create_subsystem_duplicate_serial() {
    let dir = TempDir::new().unwrap();
    let peer = build_peer(shared_store(), dir.path(), "gw-a", 0).await;

    let mut req = subsystem_req(NQN);
    req.serial_number = "SPDK12345".to_string();
    peer.service
        .create_subsystem(req, CallMode::Authoritative)
        .await
        .unwrap();

    let mut req2 = subsystem_req("nqn.2016-06.io.spdk:cnode2");
    req2.serial_number = "SPDK12345".to_string();
    let err = peer
        .service
        .create_subsystem(req2, CallMode::Authoritative)
        .await
        .unwrap_err();
    assert_eq!(err.errno(), libc::EEXIST);
}

#[tokio::test]
async fn test_create_discovery_subsystem_rejected() {
    let dir = TempDir::new().unwrap();
    let peer = build_peer(shared_store(), dir.path(), "gw-a", 0).await;

    let err = peer
        .service
        .create_subsystem(
            subsystem_req("nqn.2014-08.org.nvmexpress.discovery"),
            CallMode::Authoritative,
        )
        .await
        .unwrap_err();
    assert_eq!(err.errno(), libc::EINVAL);
}

#[tokio::test]
async fn test_create_subsystem_invalid_nqn() {
    let dir = TempDir::new().unwrap();
    let peer = build_peer(shared_store(), dir.path(), "gw-a", 0).await;

    let err = peer
        .service
        .create_subsystem(subsystem_req("not-an-nqn"), CallMode::Authoritative)
        .await
        .unwrap_err();
    assert_eq!(err.errno(), libc::EINVAL);
}

#[tokio::test]
async fn test_delete_subsystem_round_trip_restores_key_set() {
    let dir = TempDir::new().unwrap();
    let peer = build_peer(shared_store(), dir.path(), "gw-a", 0).await;

    let before: Vec<String> = peer
        .omap
        .get_state()
        .await
        .unwrap()
        .keys()
        .cloned()
        .collect();

    peer.service
        .create_subsystem(subsystem_req(NQN), CallMode::Authoritative)
        .await
        .unwrap();
    peer.service
        .delete_subsystem(NQN, false, CallMode::Authoritative)
        .await
        .unwrap();

    let after: Vec<String> = peer
        .omap
        .get_state()
        .await
        .unwrap()
        .keys()
        .cloned()
        .collect();
    assert_eq!(before, after);
    assert!(!peer.engine.state.lock().subsystems.contains_key(NQN));
}

#[tokio::test]
async fn test_delete_subsystem_with_namespace_requires_force() {
    let dir = TempDir::new().unwrap();
    let peer = build_peer(shared_store(), dir.path(), "gw-a", 0).await;

    peer.service
        .create_subsystem(subsystem_req(NQN), CallMode::Authoritative)
        .await
        .unwrap();
    peer.service
        .namespace_add(
            NamespaceEntry {
                rbd_pool_name: "rbd".to_string(),
                rbd_image_name: "img1".to_string(),
                subsystem_nqn: NQN.to_string(),
                nsid: Some(1),
                block_size: 512,
                uuid: String::new(),
                size: 16,
                create_image: true,
                anagrpid: 1,
                force: false,
            },
            CallMode::Authoritative,
        )
        .await
        .unwrap();

    let err = peer
        .service
        .delete_subsystem(NQN, false, CallMode::Authoritative)
        .await
        .unwrap_err();
    assert_eq!(err.errno(), libc::EBUSY);

    // With force the namespaces cascade and no key referencing the
    // subsystem survives.
    peer.service
        .delete_subsystem(NQN, true, CallMode::Authoritative)
        .await
        .unwrap();
    let state = peer.omap.get_state().await.unwrap();
    assert!(!state.keys().any(|k| k.contains(NQN)));
    let engine = peer.engine.state.lock();
    assert!(engine.subsystems.is_empty());
    assert!(engine.bdevs.is_empty());
}

#[tokio::test]
async fn test_replay_mode_does_not_publish() {
    let dir = TempDir::new().unwrap();
    let peer = build_peer(shared_store(), dir.path(), "gw-a", 0).await;

    peer.service
        .create_subsystem(subsystem_req(NQN), CallMode::Replay)
        .await
        .unwrap();
    // The engine changed but the record did not.
    assert!(peer.engine.state.lock().subsystems.contains_key(NQN));
    assert_eq!(peer.omap.stored_version().await.unwrap(), 1);
}

#[tokio::test]
async fn test_list_subsystems_filters_by_serial() {
    let dir = TempDir::new().unwrap();
    let peer = build_peer(shared_store(), dir.path(), "gw-a", 0).await;

    let mut req = subsystem_req(NQN);
    req.serial_number = "SPDK001".to_string();
    peer.service
        .create_subsystem(req, CallMode::Authoritative)
        .await
        .unwrap();
    let mut req2 = subsystem_req("nqn.2016-06.io.spdk:cnode2");
    req2.serial_number = "SPDK002".to_string();
    peer.service
        .create_subsystem(req2, CallMode::Authoritative)
        .await
        .unwrap();

    let all = peer.service.list_subsystems(None, None).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|s| s.enable_ha));

    let filtered = peer
        .service
        .list_subsystems(None, Some("SPDK002"))
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].nqn, "nqn.2016-06.io.spdk:cnode2");
}
