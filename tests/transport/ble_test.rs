// BLE Transport Tests
// Tests for discovery, RSSI quality and chat-channel API correlation

use geomesh::message::{SignedEvent, TransportMessage};
use geomesh::transport::{
    BleEvent, BleTransport, BleTransportConfig, MockBleLink, Transport, TransportConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn setup(callsign: &str) -> (Arc<MockBleLink>, BleTransport, mpsc::Receiver<TransportMessage>) {
    let (tx, rx) = mpsc::channel(16);
    let link = Arc::new(MockBleLink::new());
    let config = BleTransportConfig::new(callsign)
        .with_base_config(TransportConfig::new().with_send_timeout(2));
    let transport = BleTransport::new(config, link.clone(), tx);
    (link, transport, rx)
}

fn envelope(channel: &str, content: &str, sender: &str) -> Vec<u8> {
    serde_json::json!({
        "channel": channel,
        "content": content,
        "sender": sender,
        "timestamp": 1_700_000_000_000_i64,
    })
    .to_string()
    .into_bytes()
}

fn parse_written(bytes: &[u8]) -> serde_json::Value {
    serde_json::from_slice(bytes).expect("written envelope is JSON")
}

async fn discover(link: &MockBleLink, transport: &BleTransport, callsign: &str, rssi: i16) {
    link.inject(BleEvent::DeviceDiscovered {
        device_id: "dev-1".to_string(),
        callsign: Some(callsign.to_string()),
        rssi,
    })
    .await;
    for _ in 0..200 {
        if transport.can_reach(callsign).await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("device never discovered");
}

// ============================================================================
// DISCOVERY AND REACHABILITY
// ============================================================================

#[tokio::test]
async fn test_scanning_controls_link() {
    let (link, transport, _rx) = setup("W2XYZ");
    transport.initialize().await.unwrap();

    transport.start_scanning().await.unwrap();
    assert!(link.is_scanning().await);
    transport.stop_scanning().await.unwrap();
    assert!(!link.is_scanning().await);
    transport.dispose().await;
}

#[tokio::test]
async fn test_discovery_makes_peer_reachable() {
    let (link, transport, _rx) = setup("W2XYZ");
    transport.initialize().await.unwrap();

    assert!(!transport.can_reach("X1ABCD").await);
    discover(&link, &transport, "X1ABCD", -60).await;
    assert!(transport.can_reach("x1abcd").await);
    transport.dispose().await;
}

#[tokio::test]
async fn test_quality_tracks_rssi() {
    let (link, transport, _rx) = setup("W2XYZ");
    transport.initialize().await.unwrap();

    discover(&link, &transport, "X1ABCD", -50).await;
    assert_eq!(transport.quality("X1ABCD").await, 100);

    link.inject(BleEvent::DeviceDiscovered {
        device_id: "dev-1".to_string(),
        callsign: Some("X1ABCD".to_string()),
        rssi: -75,
    })
    .await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(transport.quality("X1ABCD").await, 50);

    assert_eq!(transport.quality("K9NONE").await, 0);
    transport.dispose().await;
}

// ============================================================================
// SENDING
// ============================================================================

#[tokio::test]
async fn test_send_to_undiscovered_peer_fails() {
    let (_link, transport, _rx) = setup("W2XYZ");
    transport.initialize().await.unwrap();

    let result = transport.send(TransportMessage::ping("X1ABCD"), None).await;
    assert!(!result.success());
    assert!(result.error().unwrap().contains("not discovered"));
    transport.dispose().await;
}

#[tokio::test]
async fn test_dm_rides_the_dm_channel() {
    let (link, transport, _rx) = setup("W2XYZ");
    transport.initialize().await.unwrap();
    discover(&link, &transport, "X1ABCD", -60).await;

    let event = SignedEvent {
        id: "ev1".to_string(),
        pubkey: "npub1me".to_string(),
        sig: "s".to_string(),
        kind: 4,
        created_at: 0,
        tags: vec![],
        content: "hi".to_string(),
    };
    let result = transport
        .send(TransportMessage::direct_message("X1ABCD", event), None)
        .await;
    assert!(result.success());

    let written = link.written().await;
    assert_eq!(written.len(), 1);
    let (device, bytes) = &written[0];
    assert_eq!(device, "dev-1");
    let envelope = parse_written(bytes);
    assert_eq!(envelope["channel"], "_dm");
    assert_eq!(envelope["sender"], "W2XYZ");
    transport.dispose().await;
}

#[tokio::test]
async fn test_api_request_correlates_with_response() {
    let (link, transport, _rx) = setup("W2XYZ");
    transport.initialize().await.unwrap();
    discover(&link, &transport, "X1ABCD", -60).await;

    let responder = link.clone();
    tokio::spawn(async move {
        loop {
            for (_, bytes) in responder.written().await {
                let env = parse_written(&bytes);
                if env["channel"] == "_api" {
                    let request: serde_json::Value =
                        serde_json::from_str(env["content"].as_str().unwrap()).unwrap();
                    let response = serde_json::json!({
                        "type": "api_response",
                        "id": request["id"],
                        "statusCode": 404,
                        "body": {"error": "not found"},
                    });
                    responder
                        .inject(BleEvent::ChannelMessage {
                            device_id: "dev-1".to_string(),
                            rssi: -60,
                            payload: envelope("_api_response", &response.to_string(), "X1ABCD"),
                        })
                        .await;
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    let result = transport
        .send(TransportMessage::api_request("X1ABCD", "GET", "/api/x"), None)
        .await;

    // A 4xx made it to the peer: success, no fallback.
    assert!(result.success());
    assert_eq!(result.status_code(), Some(404));
    assert!(!result.should_fallback());
    transport.dispose().await;
}

#[tokio::test]
async fn test_api_request_timeout() {
    let (link, transport, _rx) = setup("W2XYZ");
    transport.initialize().await.unwrap();
    discover(&link, &transport, "X1ABCD", -60).await;

    let result = transport
        .send(
            TransportMessage::api_request("X1ABCD", "GET", "/api/slow"),
            Some(Duration::from_millis(40)),
        )
        .await;
    assert!(!result.success());
    assert!(result.error().unwrap().to_lowercase().contains("timeout"));
    transport.dispose().await;
}

// ============================================================================
// INBOUND TRANSLATION
// ============================================================================

#[tokio::test]
async fn test_inbound_dm_is_emitted_with_npub() {
    let (link, transport, mut rx) = setup("W2XYZ");
    transport.initialize().await.unwrap();
    discover(&link, &transport, "X1ABCD", -60).await;

    let event = serde_json::json!({
        "id": "ev2", "pubkey": "npub1peer", "sig": "sg",
        "kind": 4, "created_at": 0, "tags": [], "content": "yo",
    });
    link.inject(BleEvent::ChannelMessage {
        device_id: "dev-1".to_string(),
        rssi: -58,
        payload: envelope("_dm", &event.to_string(), "X1ABCD"),
    })
    .await;

    let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("inbound arrives")
        .expect("channel open");
    assert_eq!(message.source_transport_id(), Some("ble"));
    assert!(message.signed_event().is_some());

    let entry = transport.registry().get("X1ABCD").await.unwrap();
    assert_eq!(entry.npub(), Some("npub1peer"));
    transport.dispose().await;
}

#[tokio::test]
async fn test_envelope_sender_refreshes_route() {
    let (link, transport, mut _rx) = setup("W2XYZ");
    transport.initialize().await.unwrap();

    // A message from a never-scanned peer still creates its route.
    link.inject(BleEvent::ChannelMessage {
        device_id: "dev-9".to_string(),
        rssi: -70,
        payload: envelope("_system", "ping", "K9NEW"),
    })
    .await;

    for _ in 0..200 {
        if transport.can_reach("K9NEW").await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(transport.can_reach("K9NEW").await);
    transport.dispose().await;
}

#[tokio::test]
async fn test_malformed_envelope_is_dropped() {
    let (link, transport, _rx) = setup("W2XYZ");
    transport.initialize().await.unwrap();

    link.inject(BleEvent::ChannelMessage {
        device_id: "dev-1".to_string(),
        rssi: -60,
        payload: b"garbage".to_vec(),
    })
    .await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(transport.metrics().await.frames_dropped, 1);
    transport.dispose().await;
}

#[tokio::test]
async fn test_disconnect_flushes_pending() {
    let (link, transport, _rx) = setup("W2XYZ");
    let transport = Arc::new(transport);
    transport.initialize().await.unwrap();
    discover(&link, &transport, "X1ABCD", -60).await;

    let sender = transport.clone();
    let send_task = tokio::spawn(async move {
        sender
            .send(
                TransportMessage::api_request("X1ABCD", "GET", "/api/hang"),
                Some(Duration::from_secs(30)),
            )
            .await
    });
    for _ in 0..200 {
        if !link.written().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    link.inject(BleEvent::Disconnected {
        device_id: "dev-1".to_string(),
    })
    .await;

    let result = tokio::time::timeout(Duration::from_secs(1), send_task)
        .await
        .expect("send returns promptly")
        .expect("task not panicked");
    assert!(!result.success());
    assert_eq!(result.error(), Some("Connection lost"));
    transport.dispose().await;
}
