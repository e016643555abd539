// USB AOA Transport Implementation
// Length-prefixed framed JSON over an Android Open Accessory byte stream

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
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ============================================================================
// USB LINK SERVICE
// ============================================================================

/// Handle to the underlying accessory byte stream.
///
/// Injected at construction so the adapter can be driven by a real AOA
/// bridge or by a test double.
#[async_trait]
pub trait UsbLink: Send + Sync {
    /// Whether the physical accessory link is enumerated and open
    async fn is_link_up(&self) -> bool;

    /// Write raw bytes to the accessory stream
    async fn write(&self, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Take the inbound chunk stream. The stream is unbuffered at the
    /// source, so this must be called before traffic starts; it can be
    /// taken only once per link session.
    async fn subscribe(&self) -> Option<mpsc::Receiver<Vec<u8>>>;
}

/// In-memory UsbLink used by tests; chunks written by the adapter are
/// captured, inbound chunks are injected by the test
pub struct MockUsbLink {
    link_up: RwLock<bool>,
    written: Mutex<Vec<Vec<u8>>>,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl MockUsbLink {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            link_up: RwLock::new(true),
            written: Mutex::new(Vec::new()),
            inbound_tx: tx,
            inbound_rx: Mutex::new(Some(rx)),
        }
    }

    pub async fn set_link_up(&self, up: bool) {
        *self.link_up.write().await = up;
    }

    /// Inject bytes as if they arrived from the peer
    pub async fn inject(&self, chunk: Vec<u8>) {
        let _ = self.inbound_tx.send(chunk).await;
    }

    /// Frames written by the adapter so far
    pub async fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().await.clone()
    }
}

impl Default for MockUsbLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UsbLink for MockUsbLink {
    async fn is_link_up(&self) -> bool {
        *self.link_up.read().await
    }

    async fn write(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if !*self.link_up.read().await {
            return Err(TransportError::SendFailed("link down".to_string()));
        }
        self.written.lock().await.push(bytes);
        Ok(())
    }

    async fn subscribe(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.inbound_rx.lock().await.take()
    }
}

// ============================================================================
// FRAME BUFFER
// ============================================================================

/// Reassembles length-prefixed frames from an arbitrarily chunked stream.
///
/// Wire format: 4-byte big-endian payload length followed by that many
/// bytes of UTF-8 JSON. Partial delivery and multiple frames per chunk
/// both occur on real accessory links.
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_frame_bytes: usize,
}

impl FrameBuffer {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_bytes,
        }
    }

    /// Append freshly received bytes
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, or None when more bytes are needed
    pub fn pop_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > self.max_frame_bytes {
            // The stream is desynchronized, nothing downstream can recover it.
            self.buf.clear();
            return Err(TransportError::ReceiveFailed(format!(
                "Frame length {} exceeds limit {}",
                len, self.max_frame_bytes
            )));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        let frame = self.buf[4..4 + len].to_vec();
        self.buf.drain(..4 + len);
        Ok(Some(frame))
    }

    /// Bytes currently buffered
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Prepend the length prefix to an outgoing payload
    pub fn encode(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + payload.len());
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }
}

// ============================================================================
// WIRE ENVELOPE
// ============================================================================

/// JSON envelope inside every USB frame. `content` is itself JSON-encoded
/// for structured payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct UsbEnvelope {
    channel: String,
    content: String,
    timestamp: i64,
}

impl UsbEnvelope {
    fn new(channel: &str, content: String) -> Self {
        Self {
            channel: channel.to_string(),
            content,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    fn to_frame(&self) -> Result<Vec<u8>, TransportError> {
        let json = serde_json::to_vec(self)?;
        Ok(FrameBuffer::encode(&json))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiRequestFrame {
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
struct ApiResponseFrame {
    #[serde(rename = "type")]
    kind: String,
    id: String,
    #[serde(rename = "statusCode")]
    status_code: u16,
    #[serde(default)]
    body: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct HelloFrame {
    callsign: String,
    /// Random per-initialization nonce so a restarted peer is acked exactly once
    session: String,
    #[serde(default)]
    npub: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SystemFrame {
    #[serde(rename = "type")]
    kind: String,
    callsign: String,
}

// ============================================================================
// USB TRANSPORT CONFIG
// ============================================================================

/// Configuration for the USB accessory transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbTransportConfig {
    /// Base transport configuration
    pub base: TransportConfig,
    /// Own callsign announced in hello frames
    pub local_callsign: String,
    /// Seconds between hello retries while the peer negotiates accessory mode
    pub hello_interval_secs: u64,
    /// Hello attempts before giving up on the handshake
    pub hello_max_attempts: u32,
    /// Upper bound on a single frame
    pub max_frame_bytes: usize,
}

impl Default for UsbTransportConfig {
    fn default() -> Self {
        Self {
            base: TransportConfig::default(),
            local_callsign: String::new(),
            hello_interval_secs: 2,
            hello_max_attempts: 30,
            max_frame_bytes: 1024 * 1024,
        }
    }
}

impl UsbTransportConfig {
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

    pub fn with_hello_interval_secs(mut self, secs: u64) -> Self {
        self.hello_interval_secs = secs;
        self
    }

    pub fn with_hello_max_attempts(mut self, attempts: u32) -> Self {
        self.hello_max_attempts = attempts;
        self
    }

    pub fn with_max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = bytes;
        self
    }
}

// ============================================================================
// HANDSHAKE STATE
// ============================================================================

#[derive(Debug, Default)]
struct HandshakeState {
    /// Callsign of the peer once a hello has been seen
    remote_callsign: Option<String>,
    /// Our session nonce, regenerated on every initialize
    local_session: String,
    /// Peer session we last acked, so each peer restart is answered once
    acked_session: Option<String>,
    /// Retry loop still running
    loop_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Ready,
    Disposed,
}

// ============================================================================
// USB TRANSPORT
// ============================================================================

/// Transport over an Android Open Accessory byte stream.
///
/// Accessory-mode negotiation on the peer can take over ten seconds, so the
/// link is not assumed usable on "connected": a hello exchange confirms it,
/// retried on an interval until the peer answers. Reachability is reported
/// as soon as the physical link is up so requests buffer here instead of
/// failing over to a worse transport mid-handshake.
pub struct UsbTransport {
    config: UsbTransportConfig,
    link: Arc<dyn UsbLink>,
    inbound: InboundSender,
    pending: Arc<PendingRequests>,
    registry: Arc<DeviceRegistry>,
    metrics: Arc<Mutex<TransportMetrics>>,
    phase: Arc<RwLock<Phase>>,
    handshake: Arc<RwLock<HandshakeState>>,
    hello_cancel: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UsbTransport {
    pub const ID: &'static str = "usb";

    pub fn new(config: UsbTransportConfig, link: Arc<dyn UsbLink>, inbound: InboundSender) -> Self {
        Self {
            config,
            link,
            inbound,
            pending: Arc::new(PendingRequests::new()),
            registry: Arc::new(DeviceRegistry::new()),
            metrics: Arc::new(Mutex::new(TransportMetrics::default())),
            phase: Arc::new(RwLock::new(Phase::Created)),
            handshake: Arc::new(RwLock::new(HandshakeState::default())),
            hello_cancel: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Callsign of the connected peer once the hello exchange completed
    pub async fn remote_callsign(&self) -> Option<String> {
        self.handshake.read().await.remote_callsign.clone()
    }

    /// Registry of peers seen over this link
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    async fn is_ready(&self) -> bool {
        *self.phase.read().await == Phase::Ready
    }

    async fn write_envelope(&self, channel: &str, content: String) -> Result<(), TransportError> {
        let frame = UsbEnvelope::new(channel, content).to_frame()?;
        self.link.write(frame).await
    }

    async fn send_hello(
        link: &Arc<dyn UsbLink>,
        callsign: &str,
        session: &str,
    ) -> Result<(), TransportError> {
        let hello = HelloFrame {
            callsign: callsign.to_string(),
            session: session.to_string(),
            npub: None,
        };
        let content = serde_json::to_string(&hello)
            .map_err(|e| TransportError::SerializationError(e.to_string()))?;
        let frame = UsbEnvelope::new(CHANNEL_HELLO, content).to_frame()?;
        link.write(frame).await
    }

    fn spawn_hello_loop(&self) -> JoinHandle<()> {
        let link = self.link.clone();
        let handshake = self.handshake.clone();
        let cancel = self.hello_cancel.clone();
        let callsign = self.config.local_callsign.clone();
        let interval = Duration::from_secs(self.config.hello_interval_secs);
        let max_attempts = self.config.hello_max_attempts;

        tokio::spawn(async move {
            let session = handshake.read().await.local_session.clone();
            for attempt in 0..max_attempts {
                if !handshake.read().await.loop_active {
                    return;
                }
                if let Err(e) = Self::send_hello(&link, &callsign, &session).await {
                    debug!(attempt, error = %e, "hello send failed, link may still be negotiating");
                }
                tokio::select! {
                    _ = cancel.notified() => {
                        handshake.write().await.loop_active = false;
                        return;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            handshake.write().await.loop_active = false;
            warn!(max_attempts, "hello handshake gave up, peer never answered");
        })
    }

    fn spawn_reader(&self, rx: mpsc::Receiver<Vec<u8>>) -> JoinHandle<()> {
        let ctx = ReaderContext {
            link: self.link.clone(),
            inbound: self.inbound.clone(),
            pending: self.pending.clone(),
            registry: self.registry.clone(),
            metrics: self.metrics.clone(),
            handshake: self.handshake.clone(),
            hello_cancel: self.hello_cancel.clone(),
            local_callsign: self.config.local_callsign.clone(),
            max_frame_bytes: self.config.max_frame_bytes,
        };
        tokio::spawn(async move { ctx.run(rx).await })
    }
}

// ============================================================================
// INBOUND READER
// ============================================================================

struct ReaderContext {
    link: Arc<dyn UsbLink>,
    inbound: InboundSender,
    pending: Arc<PendingRequests>,
    registry: Arc<DeviceRegistry>,
    metrics: Arc<Mutex<TransportMetrics>>,
    handshake: Arc<RwLock<HandshakeState>>,
    hello_cancel: Arc<Notify>,
    local_callsign: String,
    max_frame_bytes: usize,
}

impl ReaderContext {
    async fn run(self, mut rx: mpsc::Receiver<Vec<u8>>) {
        let mut buffer = FrameBuffer::new(self.max_frame_bytes);
        while let Some(chunk) = rx.recv().await {
            buffer.push(&chunk);
            loop {
                match buffer.pop_frame() {
                    Ok(Some(frame)) => self.handle_frame(&frame).await,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "dropping desynchronized stream buffer");
                        self.metrics.lock().await.record_dropped();
                        break;
                    }
                }
            }
        }
        // The stream closed underneath us, nobody will answer anymore.
        self.pending.flush_all(UsbTransport::ID, "Connection lost").await;
    }

    async fn handle_frame(&self, frame: &[u8]) {
        let envelope: UsbEnvelope = match serde_json::from_slice(frame) {
            Ok(env) => env,
            Err(e) => {
                debug!(error = %e, "dropping malformed frame");
                self.metrics.lock().await.record_dropped();
                return;
            }
        };
        match envelope.channel.as_str() {
            CHANNEL_HELLO => self.handle_hello(&envelope.content).await,
            CHANNEL_API => self.handle_api_request(&envelope.content).await,
            CHANNEL_API_RESPONSE => self.handle_api_response(&envelope.content).await,
            CHANNEL_DM => self.handle_dm(&envelope.content).await,
            CHANNEL_SYSTEM => self.handle_system(&envelope.content).await,
            other => {
                debug!(channel = other, "dropping frame on unknown channel");
                self.metrics.lock().await.record_dropped();
            }
        }
    }

    async fn handle_hello(&self, content: &str) {
        let hello: HelloFrame = match serde_json::from_str(content) {
            Ok(h) => h,
            Err(e) => {
                debug!(error = %e, "dropping malformed hello");
                self.metrics.lock().await.record_dropped();
                return;
            }
        };
        let callsign = hello.callsign.to_uppercase();
        self.registry
            .record(&callsign, Reachability::Usb {
                remote_callsign: callsign.clone(),
            })
            .await;
        if let Some(npub) = &hello.npub {
            self.registry.set_npub(&callsign, npub).await;
        }

        let (reply, session) = {
            let mut state = self.handshake.write().await;
            state.remote_callsign = Some(callsign.clone());
            if state.loop_active {
                state.loop_active = false;
                self.hello_cancel.notify_waiters();
            }
            // Ack each peer session once; a restarted peer brings a new nonce.
            let reply = state.acked_session.as_deref() != Some(hello.session.as_str());
            if reply {
                state.acked_session = Some(hello.session.clone());
            }
            (reply, state.local_session.clone())
        };

        info!(peer = %callsign, "usb hello received");
        if reply {
            if let Err(e) = UsbTransport::send_hello(&self.link, &self.local_callsign, &session).await {
                warn!(error = %e, "hello reply failed");
            }
        }
    }

    async fn handle_api_request(&self, content: &str) {
        let frame: ApiRequestFrame = match serde_json::from_str(content) {
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
                .with_source_transport(UsbTransport::ID);
        if let Some(body) = frame.body {
            message = message.with_payload(Payload::Json(body));
        }
        self.emit(message).await;
    }

    async fn handle_api_response(&self, content: &str) {
        let frame: ApiResponseFrame = match serde_json::from_str(content) {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "dropping malformed api response");
                self.metrics.lock().await.record_dropped();
                return;
            }
        };
        let mut result = TransportResult::from_status(UsbTransport::ID, frame.status_code);
        if let Some(body) = frame.body {
            result = result.with_response_data(body);
        }
        if !self.pending.resolve(&frame.id, result).await {
            debug!(id = %frame.id, "orphaned api response discarded");
        }
    }

    async fn handle_dm(&self, content: &str) {
        let event: SignedEvent = match serde_json::from_str(content) {
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
        if let Some(remote) = self.handshake.read().await.remote_callsign.as_deref() {
            self.registry.set_npub(remote, &event.pubkey).await;
            self.registry.touch(remote).await;
        }
        let message = TransportMessage::direct_message(&self.local_callsign, event)
            .with_source_transport(UsbTransport::ID);
        self.emit(message).await;
    }

    async fn handle_system(&self, content: &str) {
        let frame: SystemFrame = match serde_json::from_str(content) {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "dropping malformed system frame");
                self.metrics.lock().await.record_dropped();
                return;
            }
        };
        self.registry.touch(&frame.callsign).await;
        let message = match frame.kind.as_str() {
            "ping" => TransportMessage::ping(&self.local_callsign),
            "sync" => TransportMessage::sync_notice(&self.local_callsign),
            other => {
                debug!(kind = other, "dropping unknown system frame");
                self.metrics.lock().await.record_dropped();
                return;
            }
        };
        self.emit(message.with_source_transport(UsbTransport::ID)).await;
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
impl Transport for UsbTransport {
    fn id(&self) -> &str {
        Self::ID
    }

    fn name(&self) -> &str {
        "USB Accessory"
    }

    fn priority(&self) -> u8 {
        2
    }

    fn is_available(&self) -> bool {
        // AOA links exist on desktop/Android builds only; web builds inject
        // no link at all, so presence of the handle is the gate.
        !self.config.local_callsign.is_empty()
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
        {
            let mut state = self.handshake.write().await;
            state.local_session = TransportMessage::generate_id();
            state.loop_active = true;
        }

        // Subscribe before any traffic can flow; the chunk stream is not
        // buffered at the source.
        let rx = self
            .link
            .subscribe()
            .await
            .ok_or_else(|| TransportError::Unavailable("link stream already taken".to_string()))?;

        let reader = self.spawn_reader(rx);
        let hello = self.spawn_hello_loop();
        let mut tasks = self.tasks.lock().await;
        tasks.push(reader);
        tasks.push(hello);
        info!(callsign = %self.config.local_callsign, "usb transport initialized");
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
        self.hello_cancel.notify_waiters();
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        let flushed = self.pending.flush_all(Self::ID, "Connection lost").await;
        if flushed > 0 {
            debug!(flushed, "pending requests flushed on dispose");
        }
        info!("usb transport disposed");
    }

    async fn can_reach(&self, callsign: &str) -> bool {
        if !self.is_ready().await || !self.link.is_link_up().await {
            return false;
        }
        // A link that is still in the hello window is reachable so traffic
        // buffers here instead of failing over mid-handshake.
        match self.handshake.read().await.remote_callsign.as_deref() {
            Some(remote) => remote == callsign.to_uppercase(),
            None => true,
        }
    }

    async fn quality(&self, callsign: &str) -> u8 {
        if !self.is_ready().await || !self.link.is_link_up().await {
            return 0;
        }
        let state = self.handshake.read().await;
        match state.remote_callsign.as_deref() {
            Some(remote) if remote == callsign.to_uppercase() => 90,
            Some(_) => 0,
            None => 50,
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

impl UsbTransport {
    async fn send_inner(
        &self,
        message: &TransportMessage,
        timeout: Option<Duration>,
    ) -> TransportResult {
        if !self.is_ready().await {
            return TransportError::NotInitialized.into_result(Self::ID);
        }
        if !self.link.is_link_up().await {
            return TransportError::Unreachable("accessory link down".to_string())
                .into_result(Self::ID);
        }
        if let Err(e) = message.validate() {
            return TransportError::from(e).into_result(Self::ID);
        }
        let timeout = timeout.unwrap_or_else(|| self.config.base.send_timeout());

        match message.message_type() {
            TransportMessageType::ApiRequest => self.send_api_request(message, timeout).await,
            TransportMessageType::ApiResponse => {
                let frame = ApiResponseFrame {
                    kind: "api_response".to_string(),
                    id: message.id().to_string(),
                    status_code: message.status_code().unwrap_or(200),
                    body: message.payload().map(|p| p.to_wire_value()),
                };
                self.fire_and_forget(CHANNEL_API_RESPONSE, serde_json::to_string(&frame))
                    .await
            }
            TransportMessageType::DirectMessage | TransportMessageType::ChatMessage => {
                let content = match message.signed_event() {
                    Some(event) => serde_json::to_string(event),
                    None => {
                        return TransportError::Envelope("missing signed event".to_string())
                            .into_result(Self::ID)
                    }
                };
                self.fire_and_forget(CHANNEL_DM, content).await
            }
            TransportMessageType::Hello => {
                let session = self.handshake.read().await.local_session.clone();
                match Self::send_hello(&self.link, &self.config.local_callsign, &session).await {
                    Ok(()) => TransportResult::ok(Self::ID),
                    Err(e) => e.into_result(Self::ID),
                }
            }
            TransportMessageType::Ping | TransportMessageType::Sync => {
                let frame = SystemFrame {
                    kind: message.message_type().as_str().to_string(),
                    callsign: self.config.local_callsign.clone(),
                };
                self.fire_and_forget(CHANNEL_SYSTEM, serde_json::to_string(&frame))
                    .await
            }
        }
    }

    async fn send_api_request(
        &self,
        message: &TransportMessage,
        timeout: Duration,
    ) -> TransportResult {
        let frame = ApiRequestFrame {
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
        if let Err(e) = self.write_envelope(CHANNEL_API, content).await {
            self.pending.remove(message.id()).await;
            return e.into_result(Self::ID);
        }
        self.pending
            .await_reply(message.id(), rx, timeout, Self::ID)
            .await
    }

    async fn fire_and_forget(
        &self,
        channel: &str,
        content: Result<String, serde_json::Error>,
    ) -> TransportResult {
        let content = match content {
            Ok(c) => c,
            Err(e) => return TransportError::from(e).into_result(Self::ID),
        };
        match self.write_envelope(channel, content).await {
            Ok(()) => TransportResult::ok(Self::ID),
            Err(e) => e.into_result(Self::ID),
        }
    }
}
