use nvmeof_gw::core::errors::GwError;
use nvmeof_gw::store::{MemoryObjectStore, ObjectStore, OmapState};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

async fn open_state(store: &Arc<MemoryObjectStore>) -> OmapState {
    OmapState::open(
        Arc::clone(store) as Arc<dyn ObjectStore>,
        "nvmeof.grouptest.state".to_string(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_initial_version_is_one() {
    let store = Arc::new(MemoryObjectStore::new());
    let omap = open_state(&store).await;
    assert_eq!(omap.local_version(), 1);
    assert_eq!(omap.stored_version().await.unwrap(), 1);
}

#[tokio::test]
async fn test_add_key_bumps_version_by_one() {
    let store = Arc::new(MemoryObjectStore::new());
    let omap = open_state(&store).await;
    omap.add_key("subsystem_nqn.2016-06.io.spdk:cnode1", "{}")
        .await
        .unwrap();
    assert_eq!(omap.local_version(), 2);
    assert_eq!(omap.stored_version().await.unwrap(), 2);

    omap.remove_key("subsystem_nqn.2016-06.io.spdk:cnode1")
        .await
        .unwrap();
    assert_eq!(omap.local_version(), 3);
    let state = omap.get_state().await.unwrap();
    assert!(!state.contains_key("subsystem_nqn.2016-06.io.spdk:cnode1"));
}

#[tokio::test]
async fn test_stale_writer_gets_rejected() {
    let store = Arc::new(MemoryObjectStore::new());
    let peer_a = open_state(&store).await;
    let peer_b = open_state(&store).await;

    peer_a.add_key("host_nqn1_*", "{}").await.unwrap();
    // Peer B still believes version 1; its CAS must fail.
    let err = peer_b.add_key("host_nqn2_*", "{}").await.unwrap_err();
    assert!(matches!(err, GwError::StaleVersion));
    // After catching up, the write goes through.
    peer_b.set_local_version(peer_b.stored_version().await.unwrap());
    peer_b.add_key("host_nqn2_*", "{}").await.unwrap();
    assert_eq!(peer_b.stored_version().await.unwrap(), 3);
}

#[tokio::test]
async fn test_paged_read_returns_everything() {
    let store = Arc::new(MemoryObjectStore::new());
    let omap = open_state(&store).await;
    for i in 0..1500 {
        // Write the keys directly so the test doesn't pay 1500 CAS rounds.
        store
            .write_cas(
                "nvmeof.grouptest.state",
                "omap_version",
                "1",
                &[(format!("host_nqn{i:04}_*"), "{}".to_string())],
                &[],
            )
            .await
            .unwrap();
    }
    let state = omap.get_state().await.unwrap();
    // 1500 host keys plus the version key.
    assert_eq!(state.len(), 1501);
}

#[tokio::test]
async fn test_second_gateway_sees_existing_object() {
    let store = Arc::new(MemoryObjectStore::new());
    let peer_a = open_state(&store).await;
    peer_a.add_key("subsystem_x", "{}").await.unwrap();

    let peer_b = open_state(&store).await;
    // Opening must not recreate the object or lose data.
    let state = peer_b.get_state().await.unwrap();
    assert!(state.contains_key("subsystem_x"));
    assert_eq!(peer_b.stored_version().await.unwrap(), 2);
}

#[tokio::test]
async fn test_legacy_format_is_rejected() {
    let mut state = BTreeMap::new();
    state.insert("omap_version".to_string(), "4".to_string());
    state.insert("bdev_foo".to_string(), "{}".to_string());
    assert!(OmapState::check_for_legacy_format(&state).is_err());

    let mut clean = BTreeMap::new();
    clean.insert("omap_version".to_string(), "4".to_string());
    clean.insert("subsystem_foo".to_string(), "{}".to_string());
    assert!(OmapState::check_for_legacy_format(&clean).is_ok());
}

#[tokio::test]
async fn test_watch_fires_on_notify() {
    let store = Arc::new(MemoryObjectStore::new());
    let omap = open_state(&store).await;
    let notify = Arc::new(Notify::new());
    omap.register_watch(Arc::clone(&notify)).await.unwrap();

    let waiter = {
        let notify = Arc::clone(&notify);
        tokio::spawn(async move {
            tokio::time::timeout(Duration::from_secs(2), notify.notified())
                .await
                .is_ok()
        })
    };
    // Give the waiter a chance to park before the notification.
    tokio::time::sleep(Duration::from_millis(50)).await;
    omap.add_key("listener_x", "{}").await.unwrap();
    assert!(waiter.await.unwrap());
}

#[tokio::test]
async fn test_lease_is_exclusive_until_released() {
    let store = Arc::new(MemoryObjectStore::new());
    let object = "nvmeof.grouptest.state";
    let _omap = open_state(&store).await;

    store
        .lease_acquire(object, "omap_file_lock", "peer-a", "test", Duration::from_secs(60))
        .await
        .unwrap();
    let err = store
        .lease_acquire(object, "omap_file_lock", "peer-b", "test", Duration::from_secs(60))
        .await
        .unwrap_err();
    assert!(matches!(err, GwError::Busy(_)));

    // Renewal by the holder is fine.
    store
        .lease_acquire(object, "omap_file_lock", "peer-a", "test", Duration::from_secs(60))
        .await
        .unwrap();

    store
        .lease_release(object, "omap_file_lock", "peer-a")
        .await
        .unwrap();
    store
        .lease_acquire(object, "omap_file_lock", "peer-b", "test", Duration::from_secs(60))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_expired_lease_is_reclaimed() {
    let store = Arc::new(MemoryObjectStore::new());
    let object = "nvmeof.grouptest.state";
    let _omap = open_state(&store).await;

    store
        .lease_acquire(object, "omap_file_lock", "crashed-peer", "test", Duration::from_millis(20))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    // The crashed holder never released; the next acquirer reclaims.
    store
        .lease_acquire(object, "omap_file_lock", "peer-b", "test", Duration::from_secs(60))
        .await
        .unwrap();
    // A release by the old cookie no longer matches.
    let err = store
        .lease_release(object, "omap_file_lock", "crashed-peer")
        .await
        .unwrap_err();
    assert!(matches!(err, GwError::NotFound(_)));
}
