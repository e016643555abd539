// Transport Router Tests
// Tests for priority selection, quality tie-breaks and fallback semantics

use async_trait::async_trait;
use geomesh::message::{TransportMessage, TransportResult};
use geomesh::transport::{
    Transport, TransportConfig, TransportError, TransportMetrics, TransportRouter,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// TEST TRANSPORT
// ============================================================================

/// Scripted transport: fixed priority/quality/reachability, canned outcome
struct TestTransport {
    id: &'static str,
    priority: u8,
    quality: u8,
    reachable: bool,
    available: bool,
    status: Option<u16>,
    error: Option<&'static str>,
    sends: AtomicU32,
    initialized: AtomicBool,
    disposed: AtomicBool,
}

impl TestTransport {
    fn new(id: &'static str, priority: u8) -> Self {
        Self {
            id,
            priority,
            quality: 50,
            reachable: true,
            available: true,
            status: None,
            error: None,
            sends: AtomicU32::new(0),
            initialized: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    fn with_quality(mut self, quality: u8) -> Self {
        self.quality = quality;
        self
    }

    fn with_reachable(mut self, reachable: bool) -> Self {
        self.reachable = reachable;
        self
    }

    fn with_available(mut self, available: bool) -> Self {
        self.available = available;
        self
    }

    fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    fn with_error(mut self, error: &'static str) -> Self {
        self.error = Some(error);
        self
    }

    fn send_count(&self) -> u32 {
        self.sends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for TestTransport {
    fn id(&self) -> &str {
        self.id
    }

    fn name(&self) -> &str {
        self.id
    }

    fn priority(&self) -> u8 {
        self.priority
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn initialize(&self) -> Result<(), TransportError> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    async fn can_reach(&self, _callsign: &str) -> bool {
        self.reachable
    }

    async fn quality(&self, _callsign: &str) -> u8 {
        self.quality
    }

    async fn send(
        &self,
        _message: TransportMessage,
        _timeout: Option<Duration>,
    ) -> TransportResult {
        self.sends.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.error {
            return TransportResult::failure(self.id, error);
        }
        match self.status {
            Some(status) => TransportResult::from_status(self.id, status),
            None => TransportResult::ok(self.id),
        }
    }

    async fn metrics(&self) -> TransportMetrics {
        TransportMetrics::default()
    }
}

fn router() -> TransportRouter {
    TransportRouter::new(&TransportConfig::default())
}

fn ping() -> TransportMessage {
    TransportMessage::ping("X1ABCD")
}

// ============================================================================
// SELECTION
// ============================================================================

#[tokio::test]
async fn test_lowest_priority_wins() {
    let router = router();
    let first = Arc::new(TestTransport::new("first", 1));
    let second = Arc::new(TestTransport::new("second", 2));
    router.register(second.clone()).await;
    router.register(first.clone()).await;

    let result = router.send(ping(), None).await;

    assert!(result.success());
    assert_eq!(result.transport_used(), "first");
    assert_eq!(first.send_count(), 1);
    assert_eq!(second.send_count(), 0);
}

#[tokio::test]
async fn test_quality_breaks_priority_ties() {
    let router = router();
    let weak = Arc::new(TestTransport::new("weak", 1).with_quality(20));
    let strong = Arc::new(TestTransport::new("strong", 1).with_quality(90));
    router.register(weak.clone()).await;
    router.register(strong.clone()).await;

    let result = router.send(ping(), None).await;

    assert_eq!(result.transport_used(), "strong");
    assert_eq!(weak.send_count(), 0);
}

#[tokio::test]
async fn test_unreachable_transports_are_skipped() {
    let router = router();
    let near = Arc::new(TestTransport::new("near", 1).with_reachable(false));
    let far = Arc::new(TestTransport::new("far", 2));
    router.register(near.clone()).await;
    router.register(far.clone()).await;

    let result = router.send(ping(), None).await;

    assert_eq!(result.transport_used(), "far");
    assert_eq!(near.send_count(), 0);
}

#[tokio::test]
async fn test_unavailable_transports_are_skipped() {
    let router = router();
    let off = Arc::new(TestTransport::new("off", 1).with_available(false));
    let on = Arc::new(TestTransport::new("on", 2));
    router.register(off.clone()).await;
    router.register(on.clone()).await;

    let result = router.send(ping(), None).await;
    assert_eq!(result.transport_used(), "on");
    assert_eq!(off.send_count(), 0);
}

#[tokio::test]
async fn test_no_reachable_transport_is_failure() {
    let router = router();
    router
        .register(Arc::new(TestTransport::new("t", 1).with_reachable(false)))
        .await;

    let result = router.send(ping(), None).await;
    assert!(!result.success());
    assert!(result.error().unwrap().contains("No transport can reach"));
}

// ============================================================================
// FALLBACK
// ============================================================================

#[tokio::test]
async fn test_transport_failure_falls_back() {
    let router = router();
    let flaky = Arc::new(TestTransport::new("flaky", 1).with_error("link down"));
    let backup = Arc::new(TestTransport::new("backup", 2));
    router.register(flaky.clone()).await;
    router.register(backup.clone()).await;

    let result = router.send(ping(), None).await;

    assert!(result.success());
    assert_eq!(result.transport_used(), "backup");
    assert_eq!(flaky.send_count(), 1);
}

#[tokio::test]
async fn test_relay_503_falls_back_to_next_transport() {
    let router = router();
    let station = Arc::new(TestTransport::new("station", 1).with_status(503));
    let backup = Arc::new(TestTransport::new("backup", 2));
    router.register(station.clone()).await;
    router.register(backup.clone()).await;

    let result = router.send(ping(), None).await;

    assert!(result.success());
    assert_eq!(result.transport_used(), "backup");
    assert_eq!(station.send_count(), 1);
    assert_eq!(backup.send_count(), 1);
}

#[tokio::test]
async fn test_404_does_not_fall_back() {
    let router = router();
    let station = Arc::new(TestTransport::new("station", 1).with_status(404));
    let backup = Arc::new(TestTransport::new("backup", 2));
    router.register(station.clone()).await;
    router.register(backup.clone()).await;

    let result = router.send(ping(), None).await;

    // The 404 was a delivered answer: it is returned, no second attempt.
    assert!(result.success());
    assert_eq!(result.status_code(), Some(404));
    assert_eq!(result.transport_used(), "station");
    assert_eq!(backup.send_count(), 0);
}

#[tokio::test]
async fn test_all_transports_failing_returns_last_failure() {
    let router = router();
    router
        .register(Arc::new(TestTransport::new("a", 1).with_error("a down")))
        .await;
    router
        .register(Arc::new(TestTransport::new("b", 2).with_error("b down")))
        .await;

    let result = router.send(ping(), None).await;
    assert!(!result.success());
    assert_eq!(result.transport_used(), "b");
}

// ============================================================================
// LIFECYCLE AND INBOUND
// ============================================================================

#[tokio::test]
async fn test_initialize_and_dispose_all() {
    let router = router();
    let available = Arc::new(TestTransport::new("up", 1));
    let unavailable = Arc::new(TestTransport::new("down", 2).with_available(false));
    router.register(available.clone()).await;
    router.register(unavailable.clone()).await;

    router.initialize_all().await.unwrap();
    assert!(available.initialized.load(Ordering::SeqCst));
    // Unavailable transports are never initialized.
    assert!(!unavailable.initialized.load(Ordering::SeqCst));

    router.dispose_all().await;
    assert!(available.disposed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_inbound_fan_in() {
    let router = router();
    let sender = router.inbound_sender();
    let mut inbound = router.take_inbound().await.expect("receiver available");
    assert!(router.take_inbound().await.is_none());

    sender
        .send(TransportMessage::ping("W2XYZ").with_source_transport("usb"))
        .await
        .unwrap();
    let message = inbound.recv().await.expect("message arrives");
    assert_eq!(message.source_transport_id(), Some("usb"));
}
