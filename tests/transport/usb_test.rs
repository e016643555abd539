// USB Transport Tests
// Tests for length-prefixed framing, the hello handshake and API correlation

use geomesh::message::{Payload, TransportMessage};
use geomesh::transport::{
    FrameBuffer, MockUsbLink, Transport, TransportConfig, UsbTransport, UsbTransportConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn frame(channel: &str, content: &str) -> Vec<u8> {
    let envelope = serde_json::json!({
        "channel": channel,
        "content": content,
        "timestamp": 1_700_000_000_000_i64,
    });
    FrameBuffer::encode(envelope.to_string().as_bytes())
}

fn parse_envelope(bytes: &[u8]) -> serde_json::Value {
    assert!(bytes.len() >= 4, "frame has length prefix");
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    assert_eq!(len, bytes.len() - 4, "prefix matches body length");
    serde_json::from_slice(&bytes[4..]).expect("frame body is JSON")
}

async fn wait_until<F, Fut>(mut probe: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if probe().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

fn setup(callsign: &str) -> (Arc<MockUsbLink>, UsbTransport, mpsc::Receiver<TransportMessage>) {
    let (tx, rx) = mpsc::channel(16);
    let link = Arc::new(MockUsbLink::new());
    let config = UsbTransportConfig::new(callsign)
        .with_base_config(TransportConfig::new().with_send_timeout(2));
    let transport = UsbTransport::new(config, link.clone(), tx);
    (link, transport, rx)
}

// ============================================================================
// FRAME BUFFER
// ============================================================================

#[test]
fn test_frame_round_trip() {
    let mut buffer = FrameBuffer::new(1024);
    let encoded = FrameBuffer::encode(b"hello world");
    buffer.push(&encoded);

    let popped = buffer.pop_frame().unwrap().expect("one frame");
    assert_eq!(popped, b"hello world");
    assert!(buffer.pop_frame().unwrap().is_none());
    assert_eq!(buffer.pending_bytes(), 0);
}

#[test]
fn test_frames_are_chunk_boundary_independent() {
    let frame_a = FrameBuffer::encode(br#"{"channel":"_api","content":"a"}"#);
    let frame_b = FrameBuffer::encode(br#"{"channel":"_dm","content":"bb"}"#);
    let mut stream = frame_a.clone();
    stream.extend_from_slice(&frame_b);

    // Reference: everything in a single chunk.
    let mut reference = FrameBuffer::new(1024);
    reference.push(&stream);
    let mut expected = Vec::new();
    while let Some(frame) = reference.pop_frame().unwrap() {
        expected.push(frame);
    }
    assert_eq!(expected.len(), 2);

    // Every split point, including mid-prefix and mid-body, reassembles
    // to the identical frames.
    for split in 1..stream.len() {
        let mut buffer = FrameBuffer::new(1024);
        let mut frames = Vec::new();
        buffer.push(&stream[..split]);
        while let Some(frame) = buffer.pop_frame().unwrap() {
            frames.push(frame);
        }
        buffer.push(&stream[split..]);
        while let Some(frame) = buffer.pop_frame().unwrap() {
            frames.push(frame);
        }
        assert_eq!(frames, expected, "split at byte {}", split);
    }
}

#[test]
fn test_three_way_split_reassembly() {
    let payload = vec![0x41u8; 300];
    let encoded = FrameBuffer::encode(&payload);

    let mut buffer = FrameBuffer::new(1024);
    buffer.push(&encoded[..2]);
    assert!(buffer.pop_frame().unwrap().is_none());
    buffer.push(&encoded[2..150]);
    assert!(buffer.pop_frame().unwrap().is_none());
    buffer.push(&encoded[150..]);
    assert_eq!(buffer.pop_frame().unwrap().unwrap(), payload);
}

#[test]
fn test_oversized_frame_is_rejected() {
    let mut buffer = FrameBuffer::new(16);
    buffer.push(&(1024u32).to_be_bytes());
    buffer.push(&[0u8; 8]);

    assert!(buffer.pop_frame().is_err());
    // The buffer resets rather than staying desynchronized forever.
    assert_eq!(buffer.pending_bytes(), 0);
}

// ============================================================================
// HELLO HANDSHAKE
// ============================================================================

#[tokio::test]
async fn test_initialize_sends_hello() {
    let (link, transport, _rx) = setup("W2XYZ");
    transport.initialize().await.unwrap();

    wait_until(|| async { !link.written().await.is_empty() }).await;
    let envelope = parse_envelope(&link.written().await[0]);
    assert_eq!(envelope["channel"], "_hello");
    let content: serde_json::Value =
        serde_json::from_str(envelope["content"].as_str().unwrap()).unwrap();
    assert_eq!(content["callsign"], "W2XYZ");
    transport.dispose().await;
}

#[tokio::test]
async fn test_peer_hello_completes_handshake_and_is_acked_once() {
    let (link, transport, _rx) = setup("W2XYZ");
    transport.initialize().await.unwrap();
    wait_until(|| async { !link.written().await.is_empty() }).await;
    let before = link.written().await.len();

    link.inject(frame("_hello", r#"{"callsign":"X1ABCD","session":"peer-s1"}"#))
        .await;
    wait_until(|| async { transport.remote_callsign().await.is_some() }).await;
    assert_eq!(transport.remote_callsign().await.as_deref(), Some("X1ABCD"));

    // The peer's first hello gets a reply.
    wait_until(|| async { link.written().await.len() > before }).await;

    // The same session repeated does not trigger another reply.
    let acked = link.written().await.len();
    link.inject(frame("_hello", r#"{"callsign":"X1ABCD","session":"peer-s1"}"#))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(link.written().await.len(), acked);

    // A restarted peer brings a new session and is acked again.
    link.inject(frame("_hello", r#"{"callsign":"X1ABCD","session":"peer-s2"}"#))
        .await;
    wait_until(|| async { link.written().await.len() > acked }).await;
    transport.dispose().await;
}

#[tokio::test]
async fn test_can_reach_during_handshake_window() {
    let (link, transport, _rx) = setup("W2XYZ");
    transport.initialize().await.unwrap();

    // Link up, handshake still pending: reachable so requests queue here.
    assert!(transport.can_reach("X1ABCD").await);
    assert_eq!(transport.quality("X1ABCD").await, 50);

    link.inject(frame("_hello", r#"{"callsign":"X1ABCD","session":"s"}"#))
        .await;
    wait_until(|| async { transport.remote_callsign().await.is_some() }).await;
    assert!(transport.can_reach("x1abcd").await);
    assert_eq!(transport.quality("X1ABCD").await, 90);
    // A different callsign is not behind this link.
    assert!(!transport.can_reach("K9OTHER").await);

    link.set_link_up(false).await;
    assert!(!transport.can_reach("X1ABCD").await);
    assert_eq!(transport.quality("X1ABCD").await, 0);
    transport.dispose().await;
}

// ============================================================================
// API CORRELATION
// ============================================================================

#[tokio::test]
async fn test_api_request_resolves_with_peer_response() {
    let (link, transport, _rx) = setup("W2XYZ");
    transport.initialize().await.unwrap();
    link.inject(frame("_hello", r#"{"callsign":"X1ABCD","session":"s"}"#))
        .await;
    wait_until(|| async { transport.remote_callsign().await.is_some() }).await;

    // Peer side: answer the api request as soon as it appears on the wire.
    let responder_link = link.clone();
    tokio::spawn(async move {
        loop {
            for written in responder_link.written().await {
                let envelope = parse_envelope(&written);
                if envelope["channel"] == "_api" {
                    let request: serde_json::Value =
                        serde_json::from_str(envelope["content"].as_str().unwrap()).unwrap();
                    assert_eq!(request["method"], "GET");
                    assert_eq!(request["path"], "/api/status");
                    let response = serde_json::json!({
                        "type": "api_response",
                        "id": request["id"],
                        "statusCode": 200,
                        "body": {"ok": true},
                    });
                    responder_link
                        .inject(frame("_api_response", &response.to_string()))
                        .await;
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    let message = TransportMessage::api_request("X1ABCD", "GET", "/api/status");
    let result = transport.send(message, None).await;

    assert!(result.success(), "error: {:?}", result.error());
    assert_eq!(result.status_code(), Some(200));
    assert_eq!(result.response_data(), Some(&serde_json::json!({"ok": true})));
    assert_eq!(result.transport_used(), "usb");
    assert!(result.latency().is_some());
    transport.dispose().await;
}

#[tokio::test]
async fn test_api_request_times_out_without_reply() {
    let (link, transport, _rx) = setup("W2XYZ");
    transport.initialize().await.unwrap();
    link.inject(frame("_hello", r#"{"callsign":"X1ABCD","session":"s"}"#))
        .await;
    wait_until(|| async { transport.remote_callsign().await.is_some() }).await;

    let message = TransportMessage::api_request("X1ABCD", "GET", "/api/slow").with_id("slow-1");
    let result = transport
        .send(message, Some(Duration::from_millis(50)))
        .await;

    assert!(!result.success());
    assert!(result.error().unwrap().to_lowercase().contains("timeout"));
    assert_eq!(transport.metrics().await.timeouts, 1);

    // A response arriving after the timeout is orphaned and changes nothing.
    let late = serde_json::json!({
        "type": "api_response",
        "id": "slow-1",
        "statusCode": 200,
        "body": {"ok": true},
    });
    link.inject(frame("_api_response", &late.to_string())).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(transport.metrics().await.timeouts, 1);
    transport.dispose().await;
}

// ============================================================================
// INBOUND TRANSLATION
// ============================================================================

#[tokio::test]
async fn test_inbound_api_request_is_emitted() {
    let (link, transport, mut rx) = setup("W2XYZ");
    transport.initialize().await.unwrap();

    let request = serde_json::json!({
        "type": "api_request",
        "id": "peer-req-1",
        "method": "POST",
        "path": "/api/dm",
        "headers": {"content-type": "application/json"},
        "body": {"text": "hi"},
    });
    link.inject(frame("_api", &request.to_string())).await;

    let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("inbound arrives")
        .expect("channel open");
    assert_eq!(message.id(), "peer-req-1");
    assert_eq!(message.method(), Some("POST"));
    assert_eq!(message.path(), Some("/api/dm"));
    assert_eq!(message.source_transport_id(), Some("usb"));
    transport.dispose().await;
}

#[tokio::test]
async fn test_inbound_dm_is_emitted() {
    let (link, transport, mut rx) = setup("W2XYZ");
    transport.initialize().await.unwrap();

    let event = serde_json::json!({
        "id": "ev1",
        "pubkey": "npub1peer",
        "sig": "sigx",
        "kind": 4,
        "created_at": 1_700_000_000,
        "tags": [],
        "content": "psst",
    });
    link.inject(frame("_dm", &event.to_string())).await;

    let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("inbound arrives")
        .expect("channel open");
    let event = message.signed_event().expect("dm carries event");
    assert_eq!(event.pubkey, "npub1peer");
    assert_eq!(message.source_transport_id(), Some("usb"));
    transport.dispose().await;
}

#[tokio::test]
async fn test_malformed_frames_are_dropped_not_fatal() {
    let (link, transport, mut rx) = setup("W2XYZ");
    transport.initialize().await.unwrap();

    link.inject(FrameBuffer::encode(b"not json at all")).await;
    link.inject(frame("_api", "also not json")).await;
    // A valid frame after the garbage still comes through.
    let request = serde_json::json!({
        "type": "api_request", "id": "ok-1", "method": "GET", "path": "/",
    });
    link.inject(frame("_api", &request.to_string())).await;

    let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("inbound arrives")
        .expect("channel open");
    assert_eq!(message.id(), "ok-1");
    assert!(transport.metrics().await.frames_dropped >= 2);
    transport.dispose().await;
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[tokio::test]
async fn test_send_before_initialize_fails_cleanly() {
    let (_link, transport, _rx) = setup("W2XYZ");
    let result = transport
        .send(TransportMessage::ping("X1ABCD"), None)
        .await;

    assert!(!result.success());
    assert!(result.error().unwrap().contains("not initialized"));
}

#[tokio::test]
async fn test_dispose_flushes_pending_requests() {
    let (link, transport, _rx) = setup("W2XYZ");
    let transport = Arc::new(transport);
    transport.initialize().await.unwrap();
    link.inject(frame("_hello", r#"{"callsign":"X1ABCD","session":"s"}"#))
        .await;
    wait_until(|| async { transport.remote_callsign().await.is_some() }).await;

    let sender = transport.clone();
    let send_task = tokio::spawn(async move {
        sender
            .send(
                TransportMessage::api_request("X1ABCD", "GET", "/api/hang"),
                Some(Duration::from_secs(30)),
            )
            .await
    });
    // Let the request register before tearing down.
    wait_until(|| async {
        link.written()
            .await
            .iter()
            .any(|w| parse_envelope(w)["channel"] == "_api")
    })
    .await;

    transport.dispose().await;
    let result = tokio::time::timeout(Duration::from_secs(1), send_task)
        .await
        .expect("send returns promptly")
        .expect("task not panicked");
    assert!(!result.success());
    assert_eq!(result.error(), Some("Connection lost"));

    // Dispose twice is fine.
    transport.dispose().await;
}

#[tokio::test]
async fn test_initialize_is_idempotent() {
    let (_link, transport, _rx) = setup("W2XYZ");
    transport.initialize().await.unwrap();
    transport.initialize().await.unwrap();
    transport.dispose().await;
}

#[tokio::test]
async fn test_dm_send_writes_event_frame() {
    let (link, transport, _rx) = setup("W2XYZ");
    transport.initialize().await.unwrap();
    link.inject(frame("_hello", r#"{"callsign":"X1ABCD","session":"s"}"#))
        .await;
    wait_until(|| async { transport.remote_callsign().await.is_some() }).await;

    let event = geomesh::message::SignedEvent {
        id: "ev-out".to_string(),
        pubkey: "npub1me".to_string(),
        sig: "s".to_string(),
        kind: 4,
        created_at: 0,
        tags: vec![],
        content: "out".to_string(),
    };
    let result = transport
        .send(TransportMessage::direct_message("X1ABCD", event), None)
        .await;
    assert!(result.success());

    let has_dm = link.written().await.iter().any(|w| {
        let envelope = parse_envelope(w);
        envelope["channel"] == "_dm" && envelope["content"].as_str().unwrap().contains("ev-out")
    });
    assert!(has_dm);
    transport.dispose().await;
}

#[tokio::test]
async fn test_payload_text_not_double_encoded_on_wire() {
    let (link, transport, _rx) = setup("W2XYZ");
    transport.initialize().await.unwrap();
    link.inject(frame("_hello", r#"{"callsign":"X1ABCD","session":"s"}"#))
        .await;
    wait_until(|| async { transport.remote_callsign().await.is_some() }).await;

    let message = TransportMessage::api_request("X1ABCD", "POST", "/api/raw")
        .with_payload(Payload::Text(r#"{"pre":"encoded"}"#.to_string()));
    let _ = transport.send(message, Some(Duration::from_millis(30))).await;

    let api_frame = link
        .written()
        .await
        .iter()
        .map(|w| parse_envelope(w))
        .find(|e| e["channel"] == "_api")
        .expect("api frame written");
    let request: serde_json::Value =
        serde_json::from_str(api_frame["content"].as_str().unwrap()).unwrap();
    // The pre-encoded string rides as-is, not wrapped in another layer.
    assert_eq!(request["body"], serde_json::json!({"pre": "encoded"}).to_string().as_str());
    transport.dispose().await;
}
