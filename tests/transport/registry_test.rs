// Device Registry Tests
// Tests for the callsign to reachability routing table

use geomesh::transport::{DeviceRegistry, Reachability};

#[tokio::test]
async fn test_record_and_get_uppercases_callsign() {
    let registry = DeviceRegistry::new();
    registry
        .record("x1abcd", Reachability::lan("http://192.168.1.5:8080/"))
        .await;

    let entry = registry.get("X1ABCD").await.expect("entry exists");
    assert_eq!(entry.callsign(), "X1ABCD");
    assert_eq!(
        entry.reachability(),
        &Reachability::Lan {
            base_url: "http://192.168.1.5:8080".to_string()
        }
    );
    assert!(registry.contains("x1AbCd").await);
}

#[tokio::test]
async fn test_record_refreshes_existing_entry() {
    let registry = DeviceRegistry::new();
    registry.record("X1", Reachability::ble("dev-a", -80)).await;
    let first_seen = registry.get("X1").await.unwrap().last_seen();

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    registry.record("X1", Reachability::ble("dev-a", -42)).await;

    let entry = registry.get("X1").await.unwrap();
    assert_eq!(
        entry.reachability(),
        &Reachability::Ble {
            device_id: "dev-a".to_string(),
            rssi: -42
        }
    );
    assert!(entry.last_seen() >= first_seen);
    assert_eq!(registry.len().await, 1);
}

#[tokio::test]
async fn test_classic_mac_is_normalized() {
    let registry = DeviceRegistry::new();
    registry
        .record("X1", Reachability::classic("aa:bb:cc:dd:ee:ff"))
        .await;

    assert_eq!(
        registry.get("X1").await.unwrap().reachability(),
        &Reachability::Classic {
            mac: "AA:BB:CC:DD:EE:FF".to_string()
        }
    );
}

#[tokio::test]
async fn test_npub_is_attached_to_known_peer() {
    let registry = DeviceRegistry::new();
    registry.set_npub("X1", "npub1abc").await;
    assert!(registry.get("X1").await.is_none());

    registry.record("X1", Reachability::Station).await;
    registry.set_npub("x1", "npub1abc").await;
    assert_eq!(registry.get("X1").await.unwrap().npub(), Some("npub1abc"));
}

#[tokio::test]
async fn test_remove_and_clear() {
    let registry = DeviceRegistry::new();
    registry.record("X1", Reachability::Station).await;
    registry.record("X2", Reachability::Station).await;

    assert!(registry.remove("x1").await.is_some());
    assert!(!registry.contains("X1").await);
    assert_eq!(registry.len().await, 1);

    registry.clear().await;
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_entries_snapshot() {
    let registry = DeviceRegistry::new();
    registry
        .record("X1", Reachability::Usb {
            remote_callsign: "X1".to_string(),
        })
        .await;
    registry
        .record("X2", Reachability::WebRtc {
            peer_id: "peer-2".to_string(),
        })
        .await;

    let mut callsigns = registry.callsigns().await;
    callsigns.sort();
    assert_eq!(callsigns, vec!["X1", "X2"]);
    assert_eq!(registry.entries().await.len(), 2);
}
