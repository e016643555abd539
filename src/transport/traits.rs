// Transport Traits and Core Types
// Defines the abstract Transport trait and common types used across all implementations

use crate::message::{MessageError, TransportMessage, TransportResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// TRANSPORT CONFIG
// ============================================================================

/// Base configuration shared by all transport adapters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Default send timeout in seconds when the caller supplies none
    pub send_timeout_secs: u32,
    /// Bound on reachability probes in seconds
    pub probe_timeout_secs: u32,
    /// Bound on connection establishment in seconds
    pub connect_timeout_secs: u32,
    /// Depth of the per-adapter inbound queue
    pub inbound_queue_depth: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_timeout_secs: 30,
            probe_timeout_secs: 3,
            connect_timeout_secs: 10,
            inbound_queue_depth: 64,
        }
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_send_timeout(mut self, secs: u32) -> Self {
        self.send_timeout_secs = secs;
        self
    }

    pub fn with_probe_timeout(mut self, secs: u32) -> Self {
        self.probe_timeout_secs = secs;
        self
    }

    pub fn with_connect_timeout(mut self, secs: u32) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    pub fn with_inbound_queue_depth(mut self, depth: usize) -> Self {
        self.inbound_queue_depth = depth;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.send_timeout_secs == 0 {
            return Err(TransportError::InvalidConfig(
                "send_timeout_secs cannot be 0".to_string(),
            ));
        }
        if self.inbound_queue_depth == 0 {
            return Err(TransportError::InvalidConfig(
                "inbound_queue_depth cannot be 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs as u64)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs as u64)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs as u64)
    }
}

// ============================================================================
// TRANSPORT ERRORS
// ============================================================================

/// Errors that can occur inside a transport adapter.
///
/// These never cross the `Transport` boundary; `send` converts every failure
/// path into a `TransportResult` with a readable error string.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Transport not initialized")]
    NotInitialized,

    #[error("Transport disposed")]
    Disposed,

    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Not paired: {0}")]
    NotPaired(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Envelope error: {0}")]
    Envelope(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(String),
}

impl TransportError {
    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Check if this failure should make the caller try another transport
    pub fn is_fallback_worthy(&self) -> bool {
        matches!(
            self,
            Self::Unreachable(_)
                | Self::ConnectionFailed(_)
                | Self::SendFailed(_)
                | Self::ReceiveFailed(_)
                | Self::Timeout
                | Self::ConnectionLost
                | Self::IoError(_)
        )
    }

    /// Convert into the failure result every adapter returns
    pub fn into_result(self, transport_id: &str) -> TransportResult {
        TransportResult::failure(transport_id, self.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::IoError(e.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(e: serde_json::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<MessageError> for TransportError {
    fn from(e: MessageError) -> Self {
        Self::Envelope(e.to_string())
    }
}

// ============================================================================
// TRANSPORT METRICS
// ============================================================================

/// Send/receive counters recorded by every adapter, including failures,
/// so quality scoring reflects reality
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportMetrics {
    /// Sends attempted
    pub sends_attempted: u64,
    /// Sends that returned success
    pub sends_succeeded: u64,
    /// Sends that returned failure
    pub sends_failed: u64,
    /// Sends that timed out waiting for a reply
    pub timeouts: u64,
    /// Inbound messages emitted to the shared channel
    pub messages_received: u64,
    /// Inbound frames dropped as malformed
    pub frames_dropped: u64,
    /// Cumulative latency over completed sends, in milliseconds
    pub total_latency_ms: u64,
}

impl TransportMetrics {
    /// Record a completed send
    pub fn record_send(&mut self, result: &TransportResult) {
        self.sends_attempted += 1;
        if result.success() {
            self.sends_succeeded += 1;
        } else {
            self.sends_failed += 1;
            if result.is_timeout() {
                self.timeouts += 1;
            }
        }
        if let Some(latency) = result.latency() {
            self.total_latency_ms += latency.as_millis() as u64;
        }
    }

    /// Record an inbound message delivered to the shared channel
    pub fn record_received(&mut self) {
        self.messages_received += 1;
    }

    /// Record a malformed inbound frame that was dropped
    pub fn record_dropped(&mut self) {
        self.frames_dropped += 1;
    }

    /// Success ratio scaled to 0..=100, 100 when nothing was attempted yet
    pub fn success_score(&self) -> u8 {
        if self.sends_attempted == 0 {
            return 100;
        }
        ((self.sends_succeeded * 100) / self.sends_attempted) as u8
    }

    /// Mean latency over completed sends
    pub fn average_latency_ms(&self) -> Option<u64> {
        let completed = self.sends_succeeded + self.sends_failed;
        if completed == 0 {
            None
        } else {
            Some(self.total_latency_ms / completed)
        }
    }
}

// ============================================================================
// INBOUND CHANNEL
// ============================================================================

/// Sender half of the shared inbound channel every adapter emits into
pub type InboundSender = mpsc::Sender<TransportMessage>;

/// Receiver half consumed by the application, regardless of medium
pub type InboundReceiver = mpsc::Receiver<TransportMessage>;

// ============================================================================
// TRANSPORT TRAIT
// ============================================================================

/// Abstract transport over one physical medium.
///
/// All operations except `is_available` require `initialize` to have run;
/// calling them earlier (or after `dispose`) yields a failure result, never
/// a panic. `send` must return a result for every invocation.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable identifier, also recorded as `source_transport_id` on inbound
    fn id(&self) -> &str;

    /// Human-readable name
    fn name(&self) -> &str;

    /// Selection priority, lower is tried first
    fn priority(&self) -> u8;

    /// Static platform/mode gate, valid before initialization
    fn is_available(&self) -> bool;

    /// Idempotent setup; subscribes to medium streams before starting the medium
    async fn initialize(&self) -> Result<(), TransportError>;

    /// Cancel subscriptions, flush pending requests, release the medium.
    /// Safe to call multiple times.
    async fn dispose(&self);

    /// Best-effort reachability probe, bounded by the probe timeout
    async fn can_reach(&self, callsign: &str) -> bool;

    /// Comparable reachability score 0..=100 from cached state only
    async fn quality(&self, callsign: &str) -> u8;

    /// Send a message, returning an outcome for every invocation
    async fn send(&self, message: TransportMessage, timeout: Option<Duration>) -> TransportResult;

    /// Fire-and-forget send; the result is discarded but failures are logged
    async fn send_async(&self, message: TransportMessage) {
        let peer = message.target_callsign().to_string();
        let result = self.send(message, None).await;
        if !result.success() {
            tracing::warn!(
                transport = self.id(),
                peer = %peer,
                error = result.error().unwrap_or("unknown"),
                "fire-and-forget send failed"
            );
        }
    }

    /// Snapshot of this adapter's send/receive counters
    async fn metrics(&self) -> TransportMetrics;
}
