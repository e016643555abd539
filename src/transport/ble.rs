// BLE Transport Implementation
// Chat-channel JSON over Bluetooth Low Energy GATT notifications

use crate::message::{
    Payload, SignedEvent, TransportMessage, TransportMessageType, TransportResult,
    CHANNEL_API, CHANNEL_API_RESPONSE, CHANNEL_DM, CHANNEL_HELLO, CHANNEL_SYSTEM,
};
use crate::transport::pending::PendingRequests;
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
// BLE LINK SERVICE
// ============================================================================

/// Events surfaced by the underlying BLE stack
#[derive(Debug, Clone)]
pub enum BleEvent {
    /// Advertisement seen while scanning
    DeviceDiscovered {
        device_id: String,
        callsign: Option<String>,
        rssi: i16,
    },
    /// Notification carrying one chat-channel JSON envelope
    ChannelMessage {
        device_id: String,
        rssi: i16,
        payload: Vec<u8>,
    },
    /// GATT connection to a device dropped
    Disconnected { device_id: String },
}

/// Handle to the platform BLE stack, injected at construction
#[async_trait]
pub trait BleLink: Send + Sync {
    async fn start_scan(&self) -> Result<(), TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Write one envelope to a device's message characteristic
    async fn write_message(&self, device_id: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Take the event stream; must be consumed before scanning starts
    async fn subscribe(&self) -> Option<mpsc::Receiver<BleEvent>>;
}

/// In-memory BleLink used by tests
pub struct MockBleLink {
    scanning: RwLock<bool>,
    written: Mutex<Vec<(String, Vec<u8>)>>,
    event_tx: mpsc::Sender<BleEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<BleEvent>>>,
}

impl MockBleLink {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            scanning: RwLock::new(false),
            written: Mutex::new(Vec::new()),
            event_tx: tx,
            event_rx: Mutex::new(Some(rx)),
        }
    }

    pub async fn is_scanning(&self) -> bool {
        *self.scanning.read().await
    }

    /// Inject an event as if the BLE stack produced it
    pub async fn inject(&self, event: BleEvent) {
        let _ = self.event_tx.send(event).await;
    }

    /// Envelopes written by the adapter, as (device_id, bytes) pairs
    pub async fn written(&self) -> Vec<(String, Vec<u8>)> {
        self.written.lock().await.clone()
    }
}

impl Default for MockBleLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BleLink for MockBleLink {
    async fn start_scan(&self) -> Result<(), TransportError> {
        *self.scanning.write().await = true;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        *self.scanning.write().await = false;
        Ok(())
    }

    async fn write_message(&self, device_id: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.written
            .lock()
            .await
            .push((device_id.to_string(), payload));
        Ok(())
    }

    async fn subscribe(&self) -> Option<mpsc::Receiver<BleEvent>> {
        self.event_rx.lock().await.take()
    }
}

// ============================================================================
// WIRE ENVELOPE
// ============================================================================

/// Chat-channel JSON envelope carried in GATT notifications
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BleEnvelope {
    channel: String,
    content: String,
    sender: String,
    timestamp: i64,
}

impl BleEnvelope {
    fn new(channel: &str, content: String, sender: &str) -> Self {
        Self {
            channel: channel.to_string(),
            content,
            sender: sender.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct BleApiRequest {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    method: String,
    path: String,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    body: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BleApiResponse {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    #[serde(rename = "statusCode")]
    status_code: u16,
    #[serde(default)]
    body: Option<serde_json::Value>,
}

// ============================================================================
// BLE TRANSPORT CONFIG
// ============================================================================

/// Configuration for the BLE transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleTransportConfig {
    /// Base transport configuration
    pub base: TransportConfig,
    /// Own callsign, used as the envelope sender
    pub local_callsign: String,
    /// Disabled in internet-only mode
    pub enabled: bool,
}

impl Default for BleTransportConfig {
    fn default() -> Self {
        Self {
            base: TransportConfig::default(),
            local_callsign: String::new(),
            enabled: true,
        }
    }
}

impl BleTransportConfig {
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
// BLE TRANSPORT
// ============================================================================

/// Transport over BLE chat channels.
///
/// BLE is message-oriented; API requests are correlated through the pending
/// table on the reserved `_api` channels. Peers are discovered by scanning
/// and tracked with their device id and last RSSI.
pub struct BleTransport {
    config: BleTransportConfig,
    link: Arc<dyn BleLink>,
    inbound: InboundSender,
    pending: Arc<PendingRequests>,
    registry: Arc<DeviceRegistry>,
    metrics: Arc<Mutex<TransportMetrics>>,
    phase: Arc<RwLock<Phase>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl BleTransport {
    pub const ID: &'static str = "ble";

    pub fn new(config: BleTransportConfig, link: Arc<dyn BleLink>, inbound: InboundSender) -> Self {
        Self {
            config,
            link,
            inbound,
            pending: Arc::new(PendingRequests::new()),
            registry: Arc::new(DeviceRegistry::new()),
            metrics: Arc::new(Mutex::new(TransportMetrics::default())),
            phase: Arc::new(RwLock::new(Phase::Created)),
            reader: Mutex::new(None),
        }
    }

    /// Registry of discovered peers
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Begin scanning for peers
    pub async fn start_scanning(&self) -> Result<(), TransportError> {
        if !self.is_ready().await {
            return Err(TransportError::NotInitialized);
        }
        self.link.start_scan().await
    }

    /// Stop scanning
    pub async fn stop_scanning(&self) -> Result<(), TransportError> {
        if !self.is_ready().await {
            return Err(TransportError::NotInitialized);
        }
        self.link.stop_scan().await
    }

    async fn is_ready(&self) -> bool {
        *self.phase.read().await == Phase::Ready
    }

    async fn device_for(&self, callsign: &str) -> Option<(String, i16)> {
        match self.registry.get(callsign).await.map(|e| e.reachability().clone()) {
            Some(Reachability::Ble { device_id, rssi }) => Some((device_id, rssi)),
            _ => None,
        }
    }

    async fn write_envelope(
        &self,
        device_id: &str,
        channel: &str,
        content: String,
    ) -> Result<(), TransportError> {
        let envelope = BleEnvelope::new(channel, content, &self.config.local_callsign);
        let bytes = serde_json::to_vec(&envelope)?;
        self.link.write_message(device_id, bytes).await
    }

    fn spawn_reader(&self, rx: mpsc::Receiver<BleEvent>) -> JoinHandle<()> {
        let ctx = BleReader {
            inbound: self.inbound.clone(),
            pending: self.pending.clone(),
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

struct BleReader {
    inbound: InboundSender,
    pending: Arc<PendingRequests>,
    registry: Arc<DeviceRegistry>,
    metrics: Arc<Mutex<TransportMetrics>>,
    local_callsign: String,
}

impl BleReader {
    async fn run(self, mut rx: mpsc::Receiver<BleEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                BleEvent::DeviceDiscovered {
                    device_id,
                    callsign,
                    rssi,
                } => {
                    if let Some(callsign) = callsign {
                        self.registry
                            .record(&callsign, Reachability::ble(&device_id, rssi))
                            .await;
                        debug!(peer = %callsign, rssi, "ble peer discovered");
                    }
                }
                BleEvent::ChannelMessage {
                    device_id,
                    rssi,
                    payload,
                } => self.handle_message(&device_id, rssi, &payload).await,
                BleEvent::Disconnected { device_id } => {
                    debug!(device = %device_id, "ble device disconnected");
                    self.pending.flush_all(BleTransport::ID, "Connection lost").await;
                }
            }
        }
        self.pending.flush_all(BleTransport::ID, "Connection lost").await;
    }

    async fn handle_message(&self, device_id: &str, rssi: i16, payload: &[u8]) {
        let envelope: BleEnvelope = match serde_json::from_slice(payload) {
            Ok(env) => env,
            Err(e) => {
                debug!(error = %e, "dropping malformed ble envelope");
                self.metrics.lock().await.record_dropped();
                return;
            }
        };
        // Any valid envelope refreshes the sender's route.
        self.registry
            .record(&envelope.sender, Reachability::ble(device_id, rssi))
            .await;

        match envelope.channel.as_str() {
            CHANNEL_API => self.handle_api_request(&envelope).await,
            CHANNEL_API_RESPONSE => self.handle_api_response(&envelope).await,
            CHANNEL_DM => self.handle_dm(&envelope).await,
            CHANNEL_HELLO => {
                // Discovery hellos carry the sender callsign already handled
                // by the registry update above.
                debug!(peer = %envelope.sender, "ble hello received");
            }
            CHANNEL_SYSTEM => self.handle_system(&envelope).await,
            other => self.handle_chat(other, &envelope).await,
        }
    }

    async fn handle_api_request(&self, envelope: &BleEnvelope) {
        let frame: BleApiRequest = match serde_json::from_str(&envelope.content) {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "dropping malformed api request");
                self.metrics.lock().await.record_dropped();
                return;
            }
        };
        let mut message =
            TransportMessage::api_request(&self.local_callsign, &frame.method, &frame.path)
                .with_id(&frame.id)
                .with_headers(frame.headers)
                .with_source_transport(BleTransport::ID);
        if let Some(body) = frame.body {
            message = message.with_payload(Payload::Json(body));
        }
        self.emit(message).await;
    }

    async fn handle_api_response(&self, envelope: &BleEnvelope) {
        let frame: BleApiResponse = match serde_json::from_str(&envelope.content) {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "dropping malformed api response");
                self.metrics.lock().await.record_dropped();
                return;
            }
        };
        let mut result = TransportResult::from_status(BleTransport::ID, frame.status_code);
        if let Some(body) = frame.body {
            result = result.with_response_data(body);
        }
        if !self.pending.resolve(&frame.id, result).await {
            debug!(id = %frame.id, "orphaned api response discarded");
        }
    }

    async fn handle_dm(&self, envelope: &BleEnvelope) {
        let event: SignedEvent = match serde_json::from_str(&envelope.content) {
            Ok(ev) => ev,
            Err(e) => {
                debug!(error = %e, "dropping malformed signed event");
                self.metrics.lock().await.record_dropped();
                return;
            }
        };
        if !event.is_well_formed() {
            debug!("dropping signed event without id/pubkey/sig");
            self.metrics.lock().await.record_dropped();
            return;
        }
        self.registry.set_npub(&envelope.sender, &event.pubkey).await;
        let message = TransportMessage::direct_message(&self.local_callsign, event)
            .with_source_transport(BleTransport::ID);
        self.emit(message).await;
    }

    async fn handle_system(&self, envelope: &BleEnvelope) {
        let message = match envelope.content.as_str() {
            "ping" => TransportMessage::ping(&self.local_callsign),
            "sync" => TransportMessage::sync_notice(&self.local_callsign),
            other => {
                debug!(kind = other, "dropping unknown system message");
                self.metrics.lock().await.record_dropped();
                return;
            }
        };
        self.emit(message.with_source_transport(BleTransport::ID)).await;
    }

    async fn handle_chat(&self, channel: &str, envelope: &BleEnvelope) {
        // Application chat channels carry signed events too.
        let event: SignedEvent = match serde_json::from_str(&envelope.content) {
            Ok(ev) => ev,
            Err(e) => {
                debug!(channel, error = %e, "dropping malformed chat message");
                self.metrics.lock().await.record_dropped();
                return;
            }
        };
        let message = TransportMessage::chat_message(&self.local_callsign, event)
            .with_source_transport(BleTransport::ID);
        self.emit(message).await;
    }

    async fn emit(&self, message: TransportMessage) {
        self.metrics.lock().await.record_received();
        if self.inbound.send(message).await.is_err() {
            warn!("inbound channel closed, message dropped");
        }
    }
}

// ============================================================================
// TRANSPORT IMPL
// ============================================================================

#[async_trait]
impl Transport for BleTransport {
    fn id(&self) -> &str {
        Self::ID
    }

    fn name(&self) -> &str {
        "Bluetooth LE"
    }

    fn priority(&self) -> u8 {
        3
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
        // Subscribe before scanning starts so no discovery event is lost.
        let rx = self
            .link
            .subscribe()
            .await
            .ok_or_else(|| TransportError::Unavailable("ble stream already taken".to_string()))?;
        *self.reader.lock().await = Some(self.spawn_reader(rx));
        info!(callsign = %self.config.local_callsign, "ble transport initialized");
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
        if let Err(e) = self.link.stop_scan().await {
            debug!(error = %e, "stop_scan during dispose failed");
        }
        if let Some(task) = self.reader.lock().await.take() {
            task.abort();
        }
        self.pending.flush_all(Self::ID, "Connection lost").await;
        info!("ble transport disposed");
    }

    async fn can_reach(&self, callsign: &str) -> bool {
        self.is_ready().await && self.device_for(callsign).await.is_some()
    }

    async fn quality(&self, callsign: &str) -> u8 {
        if !self.is_ready().await {
            return 0;
        }
        match self.device_for(callsign).await {
            // Map RSSI to 0..=100: -50 dBm or better is full score,
            // -100 dBm is unusable.
            Some((_, rssi)) => ((rssi + 100).clamp(0, 50) * 2) as u8,
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

impl BleTransport {
    async fn send_inner(
        &self,
        message: &TransportMessage,
        timeout: Option<Duration>,
    ) -> TransportResult {
        if !self.is_ready().await {
            return TransportError::NotInitialized.into_result(Self::ID);
        }
        if let Err(e) = message.validate() {
            return TransportError::from(e).into_result(Self::ID);
        }
        let (device_id, _) = match self.device_for(message.target_callsign()).await {
            Some(found) => found,
            None => {
                return TransportError::Unreachable(format!(
                    "{} not discovered",
                    message.target_callsign()
                ))
                .into_result(Self::ID)
            }
        };
        let timeout = timeout.unwrap_or_else(|| self.config.base.send_timeout());

        match message.message_type() {
            TransportMessageType::ApiRequest => {
                self.send_api_request(&device_id, message, timeout).await
            }
            TransportMessageType::ApiResponse => {
                let frame = BleApiResponse {
                    kind: "api_response".to_string(),
                    id: message.id().to_string(),
                    status_code: message.status_code().unwrap_or(200),
                    body: message.payload().map(|p| p.to_wire_value()),
                };
                self.fire_and_forget(&device_id, CHANNEL_API_RESPONSE, serde_json::to_string(&frame))
                    .await
            }
            TransportMessageType::DirectMessage => {
                let content = match message.signed_event() {
                    Some(event) => serde_json::to_string(event),
                    None => return TransportError::Envelope("missing signed event".to_string())
                        .into_result(Self::ID),
                };
                self.fire_and_forget(&device_id, CHANNEL_DM, content).await
            }
            TransportMessageType::ChatMessage => {
                let content = match message.signed_event() {
                    Some(event) => serde_json::to_string(event),
                    None => return TransportError::Envelope("missing signed event".to_string())
                        .into_result(Self::ID),
                };
                self.fire_and_forget(&device_id, CHANNEL_DM, content).await
            }
            TransportMessageType::Hello => {
                self.fire_and_forget(
                    &device_id,
                    CHANNEL_HELLO,
                    Ok(self.config.local_callsign.clone()),
                )
                .await
            }
            TransportMessageType::Ping | TransportMessageType::Sync => {
                self.fire_and_forget(
                    &device_id,
                    CHANNEL_SYSTEM,
                    Ok(message.message_type().as_str().to_string()),
                )
                .await
            }
        }
    }

    async fn send_api_request(
        &self,
        device_id: &str,
        message: &TransportMessage,
        timeout: Duration,
    ) -> TransportResult {
        let frame = BleApiRequest {
            kind: "api_request".to_string(),
            id: message.id().to_string(),
            method: message.method().unwrap_or("GET").to_string(),
            path: message.path().unwrap_or("/").to_string(),
            headers: message.headers().clone(),
            body: message.payload().map(|p| p.to_wire_value()),
        };
        let content = match serde_json::to_string(&frame) {
            Ok(c) => c,
            Err(e) => return TransportError::from(e).into_result(Self::ID),
        };

        let rx = self.pending.register(message.id(), Self::ID).await;
        if let Err(e) = self.write_envelope(device_id, CHANNEL_API, content).await {
            self.pending.remove(message.id()).await;
            return e.into_result(Self::ID);
        }
        self.pending
            .await_reply(message.id(), rx, timeout, Self::ID)
            .await
    }

    async fn fire_and_forget(
        &self,
        device_id: &str,
        channel: &str,
        content: Result<String, serde_json::Error>,
    ) -> TransportResult {
        let content = match content {
            Ok(c) => c,
            Err(e) => return TransportError::from(e).into_result(Self::ID),
        };
        match self.write_envelope(device_id, channel, content).await {
            Ok(()) => TransportResult::ok(Self::ID),
            Err(e) => e.into_result(Self::ID),
        }
    }
}
