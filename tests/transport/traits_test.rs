// Transport Trait Tests
// Tests for shared configuration, errors and metrics

use geomesh::message::TransportResult;
use geomesh::transport::{TransportConfig, TransportError, TransportMetrics};
use std::time::Duration;

// ============================================================================
// TRANSPORT CONFIG
// ============================================================================

#[test]
fn test_transport_config_default() {
    let config = TransportConfig::default();

    assert_eq!(config.send_timeout_secs, 30);
    assert_eq!(config.probe_timeout_secs, 3);
    assert!(config.inbound_queue_depth > 0);
    assert!(config.validate().is_ok());
}

#[test]
fn test_transport_config_custom() {
    let config = TransportConfig::new()
        .with_send_timeout(10)
        .with_probe_timeout(1)
        .with_connect_timeout(5)
        .with_inbound_queue_depth(16);

    assert_eq!(config.send_timeout(), Duration::from_secs(10));
    assert_eq!(config.probe_timeout(), Duration::from_secs(1));
    assert_eq!(config.connect_timeout(), Duration::from_secs(5));
    assert_eq!(config.inbound_queue_depth, 16);
}

#[test]
fn test_transport_config_validation() {
    assert!(TransportConfig::new().with_send_timeout(0).validate().is_err());
    assert!(TransportConfig::new()
        .with_inbound_queue_depth(0)
        .validate()
        .is_err());
}

// ============================================================================
// TRANSPORT ERRORS
// ============================================================================

#[test]
fn test_error_classifiers() {
    assert!(TransportError::Timeout.is_timeout());
    assert!(!TransportError::NotInitialized.is_timeout());

    assert!(TransportError::Timeout.is_fallback_worthy());
    assert!(TransportError::ConnectionLost.is_fallback_worthy());
    assert!(!TransportError::NotPaired("X1".to_string()).is_fallback_worthy());
}

#[test]
fn test_error_into_result() {
    let result = TransportError::Unreachable("X1 not discovered".to_string()).into_result("ble");

    assert!(!result.success());
    assert_eq!(result.transport_used(), "ble");
    assert!(result.error().unwrap().contains("X1 not discovered"));
}

// ============================================================================
// TRANSPORT METRICS
// ============================================================================

#[test]
fn test_metrics_record_send_outcomes() {
    let mut metrics = TransportMetrics::default();
    metrics.record_send(&TransportResult::ok("usb").with_latency(Duration::from_millis(10)));
    metrics.record_send(
        &TransportResult::failure("usb", "Request timeout after 30s")
            .with_latency(Duration::from_millis(30)),
    );

    assert_eq!(metrics.sends_attempted, 2);
    assert_eq!(metrics.sends_succeeded, 1);
    assert_eq!(metrics.sends_failed, 1);
    assert_eq!(metrics.timeouts, 1);
    assert_eq!(metrics.average_latency_ms(), Some(20));
    assert_eq!(metrics.success_score(), 50);
}

#[test]
fn test_metrics_score_starts_optimistic() {
    let metrics = TransportMetrics::default();
    assert_eq!(metrics.success_score(), 100);
    assert_eq!(metrics.average_latency_ms(), None);
}

#[test]
fn test_metrics_received_and_dropped() {
    let mut metrics = TransportMetrics::default();
    metrics.record_received();
    metrics.record_received();
    metrics.record_dropped();

    assert_eq!(metrics.messages_received, 2);
    assert_eq!(metrics.frames_dropped, 1);
}
