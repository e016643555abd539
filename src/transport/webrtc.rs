// WebRTC Transport Implementation
// Data channels negotiated through a shared relay, reused once established

use crate::message::{
    Payload, SignedEvent, TransportMessage, TransportMessageType, TransportResult,
};
use crate::transport::registry::{DeviceRegistry, Reachability};
use crate::transport::traits::{
    InboundSender, Transport, TransportConfig, TransportError, TransportMetrics,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ============================================================================
// PEER MANAGER SERVICE
// ============================================================================

/// Events surfaced by the peer connection manager
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Data channel negotiated and open
    ChannelOpen { callsign: String, peer_id: String },
    /// Data channel closed or ICE failed
    ChannelClosed { callsign: String },
    /// One inbound envelope from a peer
    Message { callsign: String, payload: Vec<u8> },
}

/// Handle to the WebRTC peer manager, injected at construction.
///
/// Connection negotiation needs both peers on a shared relay for
/// signaling; once a channel is open it is reused with no further
/// signaling cost.
#[async_trait]
pub trait PeerManager: Send + Sync {
    /// Callsigns with an open data channel
    async fn connected_peers(&self) -> Vec<String>;

    /// Negotiate a connection if none is open; requires reachable signaling
    async fn ensure_connection(&self, callsign: &str) -> Result<(), TransportError>;

    /// Write one envelope to a peer's data channel
    async fn send_to_peer(&self, callsign: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Take the event stream, once per adapter lifetime
    async fn subscribe(&self) -> Option<mpsc::Receiver<PeerEvent>>;

    /// Tear down all peer connections
    async fn close_all(&self);
}

/// In-memory PeerManager used by tests
pub struct MockPeerManager {
    connected: RwLock<Vec<String>>,
    connect_succeeds: RwLock<bool>,
    sent: Mutex<Vec<(String, Vec<u8>)>>,
    event_tx: mpsc::Sender<PeerEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<PeerEvent>>>,
}

impl MockPeerManager {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            connected: RwLock::new(Vec::new()),
            connect_succeeds: RwLock::new(true),
            sent: Mutex::new(Vec::new()),
            event_tx: tx,
            event_rx: Mutex::new(Some(rx)),
        }
    }

    pub async fn set_connect_succeeds(&self, succeeds: bool) {
        *self.connect_succeeds.write().await = succeeds;
    }

    pub async fn inject(&self, event: PeerEvent) {
        let _ = self.event_tx.send(event).await;
    }

    pub async fn sent(&self) -> Vec<(String, Vec<u8>)> {
        self.sent.lock().await.clone()
    }
}

impl Default for MockPeerManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerManager for MockPeerManager {
    async fn connected_peers(&self) -> Vec<String> {
        self.connected.read().await.clone()
    }

    async fn ensure_connection(&self, callsign: &str) -> Result<(), TransportError> {
        let key = callsign.to_uppercase();
        if self.connected.read().await.contains(&key) {
            return Ok(());
        }
        if !*self.connect_succeeds.read().await {
            return Err(TransportError::ConnectionFailed(
                "no shared relay for signaling".to_string(),
            ));
        }
        self.connected.write().await.push(key);
        Ok(())
    }

    async fn send_to_peer(&self, callsign: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let key = callsign.to_uppercase();
        if !self.connected.read().await.contains(&key) {
            return Err(TransportError::SendFailed("channel not open".to_string()));
        }
        self.sent.lock().await.push((key, payload));
        Ok(())
    }

    async fn subscribe(&self) -> Option<mpsc::Receiver<PeerEvent>> {
        self.event_rx.lock().await.take()
    }

    async fn close_all(&self) {
        self.connected.write().await.clear();
    }
}

// ============================================================================
// WIRE ENVELOPE
// ============================================================================

/// JSON envelope on the data channel, keyed by message type
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RtcEnvelope {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    callsign: String,
    timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    headers: Option<HashMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<serde_json::Value>,
    #[serde(rename = "signedEvent", skip_serializing_if = "Option::is_none")]
    signed_event: Option<SignedEvent>,
}

impl RtcEnvelope {
    fn from_message(message: &TransportMessage, local_callsign: &str) -> Self {
        Self {
            id: message.id().to_string(),
            kind: message.message_type().as_str().to_string(),
            callsign: local_callsign.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            method: message.method().map(str::to_string),
            path: message.path().map(str::to_string),
            headers: if message.headers().is_empty() {
                None
            } else {
                Some(message.headers().clone())
            },
            payload: message.payload().map(|p| p.to_wire_value()),
            signed_event: message.signed_event().cloned(),
        }
    }
}

// ============================================================================
// WEBRTC TRANSPORT CONFIG
// ============================================================================

/// Configuration for the WebRTC transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcTransportConfig {
    /// Base transport configuration
    pub base: TransportConfig,
    /// Own callsign announced in envelopes
    pub local_callsign: String,
    /// Disabled where no peer stack exists
    pub enabled: bool,
}

impl Default for WebRtcTransportConfig {
    fn default() -> Self {
        Self {
            base: TransportConfig::default(),
            local_callsign: String::new(),
            enabled: true,
        }
    }
}

impl WebRtcTransportConfig {
    pub fn new(local_callsign: &str) -> Self {
        Self {
            local_callsign: local_callsign.to_uppercase(),
            ..Self::default()
        }
    }

    pub fn with_base_config(mut self, base: TransportConfig) -> Self {
        self.base = base;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Ready,
    Disposed,
}

// ============================================================================
// WEBRTC TRANSPORT
// ============================================================================

/// Transport over WebRTC data channels.
///
/// There is no native request/response concept on a data channel: an API
/// request is reported as delivered once written, and any reply arrives
/// later as an independent inbound message correlated by the application
/// layer above this one.
pub struct WebRtcTransport {
    config: WebRtcTransportConfig,
    peers: Arc<dyn PeerManager>,
    inbound: InboundSender,
    registry: Arc<DeviceRegistry>,
    metrics: Arc<Mutex<TransportMetrics>>,
    phase: Arc<RwLock<Phase>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WebRtcTransport {
    pub const ID: &'static str = "webrtc";

    pub fn new(
        config: WebRtcTransportConfig,
        peers: Arc<dyn PeerManager>,
        inbound: InboundSender,
    ) -> Self {
        Self {
            config,
            peers,
            inbound,
            registry: Arc::new(DeviceRegistry::new()),
            metrics: Arc::new(Mutex::new(TransportMetrics::default())),
            phase: Arc::new(RwLock::new(Phase::Created)),
            reader: Mutex::new(None),
        }
    }

    /// Callsigns with an open data channel
    pub async fn connected_peers(&self) -> Vec<String> {
        self.peers.connected_peers().await
    }

    /// Registry of peers seen over data channels
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    async fn is_ready(&self) -> bool {
        *self.phase.read().await == Phase::Ready
    }

    async fn channel_open(&self, callsign: &str) -> bool {
        self.peers
            .connected_peers()
            .await
            .iter()
            .any(|c| c == &callsign.to_uppercase())
    }

    fn spawn_reader(&self, rx: mpsc::Receiver<PeerEvent>) -> JoinHandle<()> {
        let ctx = RtcReader {
            inbound: self.inbound.clone(),
            registry: self.registry.clone(),
            metrics: self.metrics.clone(),
            local_callsign: self.config.local_callsign.clone(),
        };
        tokio::spawn(async move { ctx.run(rx).await })
    }
}

// ============================================================================
// INBOUND READER
// ============================================================================

struct RtcReader {
    inbound: InboundSender,
    registry: Arc<DeviceRegistry>,
    metrics: Arc<Mutex<TransportMetrics>>,
    local_callsign: String,
}

impl RtcReader {
    async fn run(self, mut rx: mpsc::Receiver<PeerEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                PeerEvent::ChannelOpen { callsign, peer_id } => {
                    debug!(peer = %callsign, "webrtc channel open");
                    self.registry
                        .record(&callsign, Reachability::WebRtc { peer_id })
                        .await;
                }
                PeerEvent::ChannelClosed { callsign } => {
                    debug!(peer = %callsign, "webrtc channel closed");
                    self.registry.remove(&callsign).await;
                }
                PeerEvent::Message { callsign, payload } => {
                    self.handle_message(&callsign, &payload).await;
                }
            }
        }
    }

    async fn handle_message(&self, callsign: &str, payload: &[u8]) {
        let envelope: RtcEnvelope = match serde_json::from_slice(payload) {
            Ok(env) => env,
            Err(e) => {
                debug!(error = %e, "dropping malformed data channel envelope");
                self.metrics.lock().await.record_dropped();
                return;
            }
        };
        let kind = match TransportMessageType::parse(&envelope.kind) {
            Ok(kind) => kind,
            Err(e) => {
                debug!(error = %e, "dropping envelope of unknown type");
                self.metrics.lock().await.record_dropped();
                return;
            }
        };
        self.registry.touch(callsign).await;

        let message = match self.translate(kind, &envelope) {
            Some(message) => message,
            None => {
                self.metrics.lock().await.record_dropped();
                return;
            }
        };
        self.metrics.lock().await.record_received();
        if self.inbound.send(message).await.is_err() {
            warn!("inbound channel closed, message dropped");
        }
    }

    fn translate(
        &self,
        kind: TransportMessageType,
        envelope: &RtcEnvelope,
    ) -> Option<TransportMessage> {
        let message = match kind {
            TransportMessageType::ApiRequest => {
                let mut message = TransportMessage::api_request(
                    &self.local_callsign,
                    envelope.method.as_deref()?,
                    envelope.path.as_deref()?,
                )
                .with_id(&envelope.id);
                if let Some(headers) = &envelope.headers {
                    message = message.with_headers(headers.clone());
                }
                if let Some(payload) = &envelope.payload {
                    message = message.with_payload(Payload::Json(payload.clone()));
                }
                message
            }
            TransportMessageType::ApiResponse => {
                // Replies are application-level on this medium and flow
                // through the shared inbound channel like any message.
                let mut message =
                    TransportMessage::api_response(&self.local_callsign, &envelope.id, 200);
                if let Some(payload) = &envelope.payload {
                    message = message.with_payload(Payload::Json(payload.clone()));
                }
                message
            }
            TransportMessageType::DirectMessage => {
                let event = envelope.signed_event.clone()?;
                if !event.is_well_formed() {
                    return None;
                }
                TransportMessage::direct_message(&self.local_callsign, event)
                    .with_id(&envelope.id)
            }
            TransportMessageType::ChatMessage => {
                let event = envelope.signed_event.clone()?;
                if !event.is_well_formed() {
                    return None;
                }
                TransportMessage::chat_message(&self.local_callsign, event).with_id(&envelope.id)
            }
            TransportMessageType::Hello => {
                TransportMessage::hello(&self.local_callsign, &envelope.callsign)
            }
            TransportMessageType::Ping => TransportMessage::ping(&self.local_callsign),
            TransportMessageType::Sync => TransportMessage::sync_notice(&self.local_callsign),
        };
        Some(message.with_source_transport(WebRtcTransport::ID))
    }
}

// ============================================================================
// TRANSPORT IMPL
// ============================================================================

#[async_trait]
impl Transport for WebRtcTransport {
    fn id(&self) -> &str {
        Self::ID
    }

    fn name(&self) -> &str {
        "WebRTC"
    }

    fn priority(&self) -> u8 {
        5
    }

    fn is_available(&self) -> bool {
        self.config.enabled && !self.config.local_callsign.is_empty()
    }

    async fn initialize(&self) -> Result<(), TransportError> {
        {
            let mut phase = self.phase.write().await;
            match *phase {
                Phase::Ready => return Ok(()),
                Phase::Disposed => return Err(TransportError::Disposed),
                Phase::Created => *phase = Phase::Ready,
            }
        }
        let rx = self
            .peers
            .subscribe()
            .await
            .ok_or_else(|| TransportError::Unavailable("peer stream already taken".to_string()))?;
        *self.reader.lock().await = Some(self.spawn_reader(rx));
        info!(callsign = %self.config.local_callsign, "webrtc transport initialized");
        Ok(())
    }

    async fn dispose(&self) {
        {
            let mut phase = self.phase.write().await;
            if *phase == Phase::Disposed {
                return;
            }
            *phase = Phase::Disposed;
        }
        self.peers.close_all().await;
        if let Some(task) = self.reader.lock().await.take() {
            task.abort();
        }
        info!("webrtc transport disposed");
    }

    async fn can_reach(&self, callsign: &str) -> bool {
        // An open channel is reachable unconditionally; a closed one needs
        // fresh signaling, which only send pays for.
        self.is_ready().await && self.channel_open(callsign).await
    }

    async fn quality(&self, callsign: &str) -> u8 {
        if !self.is_ready().await || !self.channel_open(callsign).await {
            return 0;
        }
        75
    }

    async fn send(&self, message: TransportMessage, timeout: Option<Duration>) -> TransportResult {
        let result = self.send_inner(&message, timeout).await;
        self.metrics.lock().await.record_send(&result);
        result
    }

    async fn metrics(&self) -> TransportMetrics {
        self.metrics.lock().await.clone()
    }
}

impl WebRtcTransport {
    async fn send_inner(
        &self,
        message: &TransportMessage,
        _timeout: Option<Duration>,
    ) -> TransportResult {
        if !self.is_ready().await {
            return TransportError::NotInitialized.into_result(Self::ID);
        }
        if let Err(e) = message.validate() {
            return TransportError::from(e).into_result(Self::ID);
        }
        let callsign = message.target_callsign().to_string();

        // Connection establishment has its own bound, separate from any
        // send timeout.
        let ensure = self.peers.ensure_connection(&callsign);
        match tokio::time::timeout(self.config.base.connect_timeout(), ensure).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return e.into_result(Self::ID),
            Err(_) => {
                return TransportError::ConnectionFailed(format!(
                    "negotiation with {} timed out",
                    callsign
                ))
                .into_result(Self::ID)
            }
        }

        let envelope = RtcEnvelope::from_message(message, &self.config.local_callsign);
        let bytes = match serde_json::to_vec(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => return TransportError::from(e).into_result(Self::ID),
        };
        match self.peers.send_to_peer(&callsign, bytes).await {
            Ok(()) => {
                self.registry.touch(&callsign).await;
                TransportResult::ok(Self::ID)
            }
            Err(e) => e.into_result(Self::ID),
        }
    }
}
