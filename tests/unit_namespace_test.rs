mod common;

use common::{build_peer, shared_store};
use nvmeof_gw::core::model::{NamespaceEntry, QosEntry, SubsystemEntry};
use nvmeof_gw::service::namespace::QosLimits;
use nvmeof_gw::service::CallMode;
use tempfile::TempDir;

const NQN: &str = "nqn.2016-06.io.spdk:cnode1";

fn ns_req(nsid: Option<u32>, image: &str) -> NamespaceEntry {
    NamespaceEntry {
        rbd_pool_name: "rbd".to_string(),
        rbd_image_name: image.to_string(),
        subsystem_nqn: NQN.to_string(),
        nsid,
        block_size: 512,
        uuid: String::new(),
        size: 16,
        create_image: true,
        anagrpid: 1,
        force: false,
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
async fn test_namespace_add_assigns_nsid_and_bdev() {
    let dir = TempDir::new().unwrap();
    let peer = peer_with_subsystem(&dir).await;

    let nsid = peer
        .service
        .namespace_add(ns_req(None, "img1"), CallMode::Authoritative)
        .await
        .unwrap();
    assert_eq!(nsid, 1);

    let engine = peer.engine.state.lock();
    let ns = engine.subsystems[NQN].namespaces.get(&1).unwrap();
    assert_eq!(ns.anagrpid, 1);
    assert_eq!(ns.bdev_name, format!("bdev_{}", ns.uuid));
    // The backing device is bound to the first cluster context of group 1.
    assert_eq!(engine.bdevs[&ns.bdev_name].cluster, "cluster_context_1_0");
}

#[tokio::test]
async fn test_namespace_nsid_bounds() {
    let dir = TempDir::new().unwrap();
    let peer = peer_with_subsystem(&dir).await;

    let err = peer
        .service
        .namespace_add(ns_req(Some(0), "img1"), CallMode::Authoritative)
        .await
        .unwrap_err();
    assert_eq!(err.errno(), libc::EINVAL);

    let err = peer
        .service
        .namespace_add(ns_req(Some(33), "img1"), CallMode::Authoritative)
        .await
        .unwrap_err();
    assert_eq!(err.errno(), libc::EINVAL);
}

#[tokio::test]
async fn test_namespace_zero_block_size_rejected() {
    let dir = TempDir::new().unwrap();
    let peer = peer_with_subsystem(&dir).await;
    let mut req = ns_req(Some(1), "img1");
    req.block_size = 0;
    let err = peer
        .service
        .namespace_add(req, CallMode::Authoritative)
        .await
        .unwrap_err();
    assert_eq!(err.errno(), libc::EINVAL);
}

#[tokio::test]
async fn test_image_reuse_needs_force() {
    let dir = TempDir::new().unwrap();
    let peer = peer_with_subsystem(&dir).await;

    peer.service
        .namespace_add(ns_req(Some(1), "img1"), CallMode::Authoritative)
        .await
        .unwrap();
    let err = peer
        .service
        .namespace_add(ns_req(Some(2), "img1"), CallMode::Authoritative)
        .await
        .unwrap_err();
    assert_eq!(err.errno(), libc::EEXIST);

    let mut forced = ns_req(Some(2), "img1");
    forced.force = true;
    peer.service
        .namespace_add(forced, CallMode::Authoritative)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_image_creation_is_idempotent_by_size() {
    let dir = TempDir::new().unwrap();
    let peer = peer_with_subsystem(&dir).await;

    peer.service
        .namespace_add(ns_req(Some(1), "img1"), CallMode::Authoritative)
        .await
        .unwrap();
    // Same image, same size, force set: the pre-existing image is fine.
    let mut again = ns_req(Some(2), "img1");
    again.force = true;
    peer.service
        .namespace_add(again, CallMode::Authoritative)
        .await
        .unwrap();
    // Same image but a different size conflicts.
    let mut differing = ns_req(Some(3), "img1");
    differing.force = true;
    differing.size = 32;
    let err = peer
        .service
        .namespace_add(differing, CallMode::Authoritative)
        .await
        .unwrap_err();
    assert_eq!(err.errno(), libc::EEXIST);
}

#[tokio::test]
async fn test_namespace_delete_cleans_up() {
    let dir = TempDir::new().unwrap();
    let peer = peer_with_subsystem(&dir).await;

    let nsid = peer
        .service
        .namespace_add(ns_req(Some(1), "img1"), CallMode::Authoritative)
        .await
        .unwrap();
    peer.service
        .namespace_set_qos_limits(
            NQN,
            Some(nsid),
            None,
            QosLimits {
                rw_ios_per_second: Some(1000),
                ..Default::default()
            },
            CallMode::Authoritative,
        )
        .await
        .unwrap();

    peer.service
        .namespace_delete(NQN, Some(nsid), None, CallMode::Authoritative)
        .await
        .unwrap();

    let state = peer.omap.get_state().await.unwrap();
    assert!(!state.contains_key(&format!("namespace_{NQN}_1")));
    assert!(!state.contains_key(&format!("qos_{NQN}_1")));
    let engine = peer.engine.state.lock();
    assert!(engine.subsystems[NQN].namespaces.is_empty());
    assert!(engine.bdevs.is_empty());
    // The last device released its cluster context.
    assert!(engine.clusters.is_empty());
}

#[tokio::test]
async fn test_namespace_resize() {
    let dir = TempDir::new().unwrap();
    let peer = peer_with_subsystem(&dir).await;

    peer.service
        .namespace_add(ns_req(Some(1), "img1"), CallMode::Authoritative)
        .await
        .unwrap();
    peer.service
        .namespace_resize(NQN, Some(1), None, 64)
        .await
        .unwrap();

    let bdev_name = {
        let engine = peer.engine.state.lock();
        let name = engine.subsystems[NQN].namespaces[&1].bdev_name.clone();
        assert_eq!(engine.bdevs[&name].size_mib, 64);
        name
    };
    assert!(bdev_name.starts_with("bdev_"));

    let err = peer
        .service
        .namespace_resize(NQN, Some(1), None, 0)
        .await
        .unwrap_err();
    assert_eq!(err.errno(), libc::EINVAL);
}

#[tokio::test]
async fn test_qos_merge_preserves_omitted_fields() {
    let dir = TempDir::new().unwrap();
    let peer = peer_with_subsystem(&dir).await;
    peer.service
        .namespace_add(ns_req(Some(1), "img1"), CallMode::Authoritative)
        .await
        .unwrap();

    peer.service
        .namespace_set_qos_limits(
            NQN,
            Some(1),
            None,
            QosLimits {
                rw_ios_per_second: Some(2000),
                ..Default::default()
            },
            CallMode::Authoritative,
        )
        .await
        .unwrap();
    peer.service
        .namespace_set_qos_limits(
            NQN,
            Some(1),
            None,
            QosLimits {
                r_mbytes_per_second: Some(5),
                ..Default::default()
            },
            CallMode::Authoritative,
        )
        .await
        .unwrap();

    let state = peer.omap.get_state().await.unwrap();
    let entry: QosEntry =
        serde_json::from_str(state.get(&format!("qos_{NQN}_1")).unwrap()).unwrap();
    assert_eq!(entry.rw_ios_per_second, Some(2000));
    assert_eq!(entry.r_mbytes_per_second, Some(5));
    assert_eq!(entry.w_mbytes_per_second, None);
}

#[tokio::test]
async fn test_qos_rw_ios_rounded_up_to_thousand() {
    let dir = TempDir::new().unwrap();
    let peer = peer_with_subsystem(&dir).await;
    peer.service
        .namespace_add(ns_req(Some(1), "img1"), CallMode::Authoritative)
        .await
        .unwrap();

    peer.service
        .namespace_set_qos_limits(
            NQN,
            Some(1),
            None,
            QosLimits {
                rw_ios_per_second: Some(1234),
                ..Default::default()
            },
            CallMode::Authoritative,
        )
        .await
        .unwrap();

    let state = peer.omap.get_state().await.unwrap();
    let entry: QosEntry =
        serde_json::from_str(state.get(&format!("qos_{NQN}_1")).unwrap()).unwrap();
    assert_eq!(entry.rw_ios_per_second, Some(2000));
    let engine = peer.engine.state.lock();
    let bdev = engine.bdevs.values().next().unwrap();
    assert_eq!(
        bdev.qos.get("rw_ios_per_sec").and_then(|v| v.as_u64()),
        Some(2000)
    );
}

#[tokio::test]
async fn test_change_load_balancing_group_keeps_identity() {
    let dir = TempDir::new().unwrap();
    let peer = peer_with_subsystem(&dir).await;
    peer.service
        .namespace_add(ns_req(Some(1), "img1"), CallMode::Authoritative)
        .await
        .unwrap();
    let (uuid_before, bdev_before) = {
        let engine = peer.engine.state.lock();
        let ns = &engine.subsystems[NQN].namespaces[&1];
        (ns.uuid.clone(), ns.bdev_name.clone())
    };

    // anagrp 1 is owned by group id 0, which is this peer.
    peer.service
        .namespace_change_load_balancing_group(NQN, Some(1), None, 2, CallMode::Authoritative)
        .await
        .unwrap();

    let engine = peer.engine.state.lock();
    let ns = &engine.subsystems[NQN].namespaces[&1];
    assert_eq!(ns.anagrpid, 2);
    assert_eq!(ns.uuid, uuid_before);
    assert_eq!(ns.bdev_name, bdev_before);
    drop(engine);

    let state = peer.omap.get_state().await.unwrap();
    let entry: NamespaceEntry =
        serde_json::from_str(state.get(&format!("namespace_{NQN}_1")).unwrap()).unwrap();
    assert_eq!(entry.anagrpid, 2);
    assert_eq!(entry.uuid, uuid_before);
}

#[tokio::test]
async fn test_change_load_balancing_group_redirects_non_owner() {
    let dir = TempDir::new().unwrap();
    let store = shared_store();
    // This peer has group id 1, so it owns anagrp 2, not anagrp 1.
    let peer = build_peer(store.clone(), dir.path(), "gw-b", 1).await;
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
    peer.service
        .namespace_add(ns_req(Some(1), "img1"), CallMode::Authoritative)
        .await
        .unwrap();

    let err = peer
        .service
        .namespace_change_load_balancing_group(NQN, Some(1), None, 2, CallMode::Authoritative)
        .await
        .unwrap_err();
    assert_eq!(err.errno(), libc::EREMOTE);
}

#[tokio::test]
async fn test_namespace_io_stats() {
    let dir = TempDir::new().unwrap();
    let peer = peer_with_subsystem(&dir).await;
    peer.service
        .namespace_add(ns_req(Some(1), "img1"), CallMode::Authoritative)
        .await
        .unwrap();

    let stats = peer
        .service
        .namespace_get_io_stats(NQN, Some(1), None)
        .await
        .unwrap();
    assert_eq!(stats.nsid, 1);
    assert_eq!(stats.tick_rate, 1_000_000);
    assert_eq!(stats.bytes_read, 4096);
    assert!(stats.bdev_name.starts_with("bdev_"));
}

#[tokio::test]
async fn test_list_namespaces_reports_details() {
    let dir = TempDir::new().unwrap();
    let peer = peer_with_subsystem(&dir).await;
    peer.service
        .namespace_add(ns_req(Some(1), "img1"), CallMode::Authoritative)
        .await
        .unwrap();

    let namespaces = peer.service.list_namespaces(NQN, None, None).await.unwrap();
    assert_eq!(namespaces.len(), 1);
    let ns = &namespaces[0];
    assert_eq!(ns.nsid, 1);
    assert_eq!(ns.load_balancing_group, 1);
    assert_eq!(ns.rbd_pool_name, "rbd");
    assert_eq!(ns.rbd_image_name, "img1");
    assert_eq!(ns.block_size, 512);

    // Filter by a nonexistent NSID.
    let none = peer
        .service
        .list_namespaces(NQN, Some(9), None)
        .await
        .unwrap();
    assert!(none.is_empty());
}
