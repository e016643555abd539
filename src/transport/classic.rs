// Bluetooth Classic Transport Implementation
// Framed JSON over SPP sockets, reached through a BLE+ pairing upgrade

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
// SPP SOCKET SERVICE
// ============================================================================

/// One inbound SPP message; the socket preserves write boundaries
#[derive(Debug, Clone)]
pub struct SppFrame {
    pub mac: String,
    pub bytes: Vec<u8>,
}

/// Handle to the platform SPP socket stack, injected at construction
#[async_trait]
pub trait SppSocket: Send + Sync {
    async fn connect(&self, mac: &str) -> Result<(), TransportError>;

    async fn is_connected(&self, mac: &str) -> bool;

    /// Write one whole message; boundaries are preserved by the socket
    async fn send(&self, mac: &str, bytes: Vec<u8>) -> Result<(), TransportError>;

    async fn disconnect(&self, mac: &str) -> Result<(), TransportError>;

    /// Take the inbound frame stream, once per adapter lifetime
    async fn subscribe(&self) -> Option<mpsc::Receiver<SppFrame>>;
}

/// In-memory SppSocket used by tests
pub struct MockSppSocket {
    connected: RwLock<Vec<String>>,
    sent: Mutex<Vec<(String, Vec<u8>)>>,
    connects: Mutex<u32>,
    disconnects: Mutex<u32>,
    frame_tx: mpsc::Sender<SppFrame>,
    frame_rx: Mutex<Option<mpsc::Receiver<SppFrame>>>,
}

impl MockSppSocket {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            connected: RwLock::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            connects: Mutex::new(0),
            disconnects: Mutex::new(0),
            frame_tx: tx,
            frame_rx: Mutex::new(Some(rx)),
        }
    }

    pub async fn inject(&self, frame: SppFrame) {
        let _ = self.frame_tx.send(frame).await;
    }

    pub async fn sent(&self) -> Vec<(String, Vec<u8>)> {
        self.sent.lock().await.clone()
    }

    pub async fn connect_count(&self) -> u32 {
        *self.connects.lock().await
    }

    pub async fn disconnect_count(&self) -> u32 {
        *self.disconnects.lock().await
    }
}

impl Default for MockSppSocket {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SppSocket for MockSppSocket {
    async fn connect(&self, mac: &str) -> Result<(), TransportError> {
        let mut connected = self.connected.write().await;
        let mac = mac.to_uppercase();
        if !connected.contains(&mac) {
            connected.push(mac);
        }
        *self.connects.lock().await += 1;
        Ok(())
    }

    async fn is_connected(&self, mac: &str) -> bool {
        self.connected.read().await.contains(&mac.to_uppercase())
    }

    async fn send(&self, mac: &str, bytes: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_connected(mac).await {
            return Err(TransportError::SendFailed("not connected".to_string()));
        }
        self.sent.lock().await.push((mac.to_uppercase(), bytes));
        Ok(())
    }

    async fn disconnect(&self, mac: &str) -> Result<(), TransportError> {
        self.connected
            .write()
            .await
            .retain(|m| m != &mac.to_uppercase());
        *self.disconnects.lock().await += 1;
        Ok(())
    }

    async fn subscribe(&self) -> Option<mpsc::Receiver<SppFrame>> {
        self.frame_rx.lock().await.take()
    }
}

// ============================================================================
// TRANSFER SESSIONS
// ============================================================================

/// External registry of in-progress bulk transfers, consulted for
/// connection reuse and medium preference
#[async_trait]
pub trait TransferSessions: Send + Sync {
    /// An active bulk transfer with this peer claims the connection
    async fn has_active_session(&self, callsign: &str) -> bool;

    /// A transfer session explicitly asked for the classic upgrade
    async fn prefers_classic(&self, callsign: &str) -> bool;
}

/// In-memory TransferSessions used by tests and standalone setups
#[derive(Default)]
pub struct MockTransferSessions {
    active: RwLock<Vec<String>>,
    preferring: RwLock<Vec<String>>,
}

impl MockTransferSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_active(&self, callsign: &str, active: bool) {
        let mut list = self.active.write().await;
        let key = callsign.to_uppercase();
        if active {
            if !list.contains(&key) {
                list.push(key);
            }
        } else {
            list.retain(|c| c != &key);
        }
    }

    pub async fn set_prefers_classic(&self, callsign: &str, prefers: bool) {
        let mut list = self.preferring.write().await;
        let key = callsign.to_uppercase();
        if prefers {
            if !list.contains(&key) {
                list.push(key);
            }
        } else {
            list.retain(|c| c != &key);
        }
    }
}

#[async_trait]
impl TransferSessions for MockTransferSessions {
    async fn has_active_session(&self, callsign: &str) -> bool {
        self.active.read().await.contains(&callsign.to_uppercase())
    }

    async fn prefers_classic(&self, callsign: &str) -> bool {
        self.preferring
            .read()
            .await
            .contains(&callsign.to_uppercase())
    }
}

// ============================================================================
// WIRE ENVELOPE
// ============================================================================

/// JSON envelope written as one SPP message, UTF-8, no length prefix
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClassicEnvelope {
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

impl ClassicEnvelope {
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
// CLASSIC TRANSPORT CONFIG
// ============================================================================

/// Configuration for the Bluetooth Classic transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassicTransportConfig {
    /// Base transport configuration
    pub base: TransportConfig,
    /// Own callsign announced in envelopes
    pub local_callsign: String,
    /// Payload size above which classic is preferred over BLE
    pub large_payload_threshold: usize,
    /// Disabled in BLE-only or internet-only mode
    pub enabled: bool,
}

impl Default for ClassicTransportConfig {
    fn default() -> Self {
        Self {
            base: TransportConfig::default(),
            local_callsign: String::new(),
            large_payload_threshold: 10 * 1024,
            enabled: true,
        }
    }
}

impl ClassicTransportConfig {
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

    pub fn with_large_payload_threshold(mut self, bytes: usize) -> Self {
        self.large_payload_threshold = bytes;
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
// CLASSIC TRANSPORT
// ============================================================================

/// Transport over Bluetooth Classic SPP sockets.
///
/// A peer must be BLE+ paired first: its classic MAC is bound to its
/// callsign out-of-band during a BLE handshake. Connections are opened
/// lazily per send and torn down afterwards unless a transfer session
/// claims the peer, which keeps batch transfers from reconnect churn.
pub struct ClassicTransport {
    config: ClassicTransportConfig,
    socket: Arc<dyn SppSocket>,
    sessions: Arc<dyn TransferSessions>,
    inbound: InboundSender,
    registry: Arc<DeviceRegistry>,
    metrics: Arc<Mutex<TransportMetrics>>,
    phase: Arc<RwLock<Phase>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ClassicTransport {
    pub const ID: &'static str = "bt_classic";

    pub fn new(
        config: ClassicTransportConfig,
        socket: Arc<dyn SppSocket>,
        sessions: Arc<dyn TransferSessions>,
        inbound: InboundSender,
    ) -> Self {
        Self {
            config,
            socket,
            sessions,
            inbound,
            registry: Arc::new(DeviceRegistry::new()),
            metrics: Arc::new(Mutex::new(TransportMetrics::default())),
            phase: Arc::new(RwLock::new(Phase::Created)),
            reader: Mutex::new(None),
        }
    }

    /// Registry of BLE+ paired peers
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Bind a peer's classic MAC to its callsign, completing the BLE+ upgrade
    pub async fn initiate_pairing(&self, callsign: &str, mac: &str) {
        self.registry
            .record(callsign, Reachability::classic(mac))
            .await;
        info!(peer = %callsign.to_uppercase(), "ble+ pairing recorded");
    }

    /// Whether a peer has completed the BLE+ pairing upgrade
    pub async fn is_ble_plus(&self, callsign: &str) -> bool {
        self.mac_for(callsign).await.is_some()
    }

    /// Whether a caller should upgrade from BLE to classic for this payload.
    /// True when a transfer session asks for it or the payload crosses the
    /// configured threshold.
    pub async fn should_prefer(&self, callsign: &str, data_size: Option<usize>) -> bool {
        if !self.is_ble_plus(callsign).await {
            return false;
        }
        if self.sessions.prefers_classic(callsign).await {
            return true;
        }
        data_size.is_some_and(|size| size > self.config.large_payload_threshold)
    }

    async fn is_ready(&self) -> bool {
        *self.phase.read().await == Phase::Ready
    }

    async fn mac_for(&self, callsign: &str) -> Option<String> {
        match self.registry.get(callsign).await.map(|e| e.reachability().clone()) {
            Some(Reachability::Classic { mac }) => Some(mac),
            _ => None,
        }
    }

    fn spawn_reader(&self, rx: mpsc::Receiver<SppFrame>) -> JoinHandle<()> {
        let ctx = ClassicReader {
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

struct ClassicReader {
    inbound: InboundSender,
    registry: Arc<DeviceRegistry>,
    metrics: Arc<Mutex<TransportMetrics>>,
    local_callsign: String,
}

impl ClassicReader {
    async fn run(self, mut rx: mpsc::Receiver<SppFrame>) {
        while let Some(frame) = rx.recv().await {
            self.handle_frame(&frame).await;
        }
    }

    async fn handle_frame(&self, frame: &SppFrame) {
        let envelope: ClassicEnvelope = match serde_json::from_slice(&frame.bytes) {
            Ok(env) => env,
            Err(e) => {
                debug!(error = %e, "dropping malformed spp message");
                self.metrics.lock().await.record_dropped();
                return;
            }
        };
        let kind = match TransportMessageType::parse(&envelope.kind) {
            Ok(kind) => kind,
            Err(e) => {
                debug!(error = %e, "dropping spp message of unknown type");
                self.metrics.lock().await.record_dropped();
                return;
            }
        };
        // Any valid inbound message refreshes the sender's pairing.
        self.registry
            .record(&envelope.callsign, Reachability::classic(&frame.mac))
            .await;

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
        envelope: &ClassicEnvelope,
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
                    debug!("dropping signed event without id/pubkey/sig");
                    return None;
                }
                TransportMessage::direct_message(&self.local_callsign, event)
                    .with_id(&envelope.id)
            }
            TransportMessageType::ChatMessage => {
                let event = envelope.signed_event.clone()?;
                if !event.is_well_formed() {
                    debug!("dropping signed event without id/pubkey/sig");
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
        Some(message.with_source_transport(ClassicTransport::ID))
    }
}

// ============================================================================
// TRANSPORT IMPL
// ============================================================================

#[async_trait]
impl Transport for ClassicTransport {
    fn id(&self) -> &str {
        Self::ID
    }

    fn name(&self) -> &str {
        "Bluetooth Classic"
    }

    fn priority(&self) -> u8 {
        4
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
            .socket
            .subscribe()
            .await
            .ok_or_else(|| TransportError::Unavailable("spp stream already taken".to_string()))?;
        *self.reader.lock().await = Some(self.spawn_reader(rx));
        info!(callsign = %self.config.local_callsign, "classic transport initialized");
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
        if let Some(task) = self.reader.lock().await.take() {
            task.abort();
        }
        for entry in self.registry.entries().await {
            if let Reachability::Classic { mac } = entry.reachability() {
                if self.socket.is_connected(mac).await {
                    if let Err(e) = self.socket.disconnect(mac).await {
                        debug!(error = %e, "disconnect during dispose failed");
                    }
                }
            }
        }
        info!("classic transport disposed");
    }

    async fn can_reach(&self, callsign: &str) -> bool {
        self.is_ready().await && self.is_ble_plus(callsign).await
    }

    async fn quality(&self, callsign: &str) -> u8 {
        if !self.is_ready().await {
            return 0;
        }
        match self.mac_for(callsign).await {
            Some(mac) if self.socket.is_connected(&mac).await => 85,
            Some(_) => 70,
            None => 0,
        }
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

impl ClassicTransport {
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
        let mac = match self.mac_for(&callsign).await {
            Some(mac) => mac,
            None => {
                return TransportError::NotPaired(format!("{} has no BLE+ pairing", callsign))
                    .into_result(Self::ID)
            }
        };

        // Lazy connect; an already-open socket from a transfer session is
        // reused instead of reopened.
        if !self.socket.is_connected(&mac).await {
            let connect = self.socket.connect(&mac);
            match tokio::time::timeout(self.config.base.connect_timeout(), connect).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return e.into_result(Self::ID),
                Err(_) => {
                    return TransportError::ConnectionFailed(format!(
                        "connect to {} timed out",
                        mac
                    ))
                    .into_result(Self::ID)
                }
            }
        }

        let envelope = ClassicEnvelope::from_message(message, &self.config.local_callsign);
        let bytes = match serde_json::to_vec(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => return TransportError::from(e).into_result(Self::ID),
        };
        let outcome = match self.socket.send(&mac, bytes).await {
            Ok(()) => {
                self.registry.touch(&callsign).await;
                TransportResult::ok(Self::ID)
            }
            Err(e) => e.into_result(Self::ID),
        };

        // Keep the socket open only while a transfer session claims the peer.
        if !self.sessions.has_active_session(&callsign).await {
            if let Err(e) = self.socket.disconnect(&mac).await {
                debug!(error = %e, "post-send disconnect failed");
            }
        }
        outcome
    }
}
