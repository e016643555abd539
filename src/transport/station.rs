// Station Transport Implementation
// HTTP proxied through an internet relay plus a WebSocket leg for signed events

use crate::message::{
    Payload, SignedEvent, TransportMessage, TransportMessageType, TransportResult,
};
use crate::transport::registry::{DeviceRegistry, Reachability};
use crate::transport::traits::{
    InboundSender, Transport, TransportConfig, TransportError, TransportMetrics,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

// ============================================================================
// RELAY SOCKET SERVICE
// ============================================================================

/// Persistent WebSocket to the relay, carrying signed events both ways.
///
/// Publishes are resolved by the relay's acknowledgment, so correlation
/// lives inside the socket service rather than an adapter-side table.
#[async_trait]
pub trait RelaySocket: Send + Sync {
    /// Open the socket if it is not already open
    async fn ensure_connected(&self) -> Result<(), TransportError>;

    /// Publish one signed event and await the relay's accept/reject ack
    async fn publish_event(
        &self,
        event: &SignedEvent,
        timeout: Duration,
    ) -> Result<bool, TransportError>;

    /// Take the stream of events the relay pushes to this device
    async fn subscribe(&self) -> Option<mpsc::Receiver<SignedEvent>>;

    /// Close the socket and fail outstanding publishes
    async fn close(&self);
}

// ============================================================================
// TUNGSTENITE RELAY SOCKET
// ============================================================================

type WsSink = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<TcpStream>>,
    WsMessage,
>;

/// Real relay socket over tokio-tungstenite.
///
/// Wire frames are JSON arrays: `["EVENT", event]` out,
/// `["OK", event_id, accepted, message]` and `["EVENT", event]` in.
pub struct TungsteniteRelaySocket {
    ws_url: String,
    sink: Mutex<Option<WsSink>>,
    acks: Arc<Mutex<HashMap<String, oneshot::Sender<bool>>>>,
    event_tx: mpsc::Sender<SignedEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<SignedEvent>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl TungsteniteRelaySocket {
    pub fn new(ws_url: &str) -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            ws_url: ws_url.to_string(),
            sink: Mutex::new(None),
            acks: Arc::new(Mutex::new(HashMap::new())),
            event_tx: tx,
            event_rx: Mutex::new(Some(rx)),
            reader: Mutex::new(None),
        }
    }

    async fn spawn_reader(
        &self,
        mut stream: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    ) {
        let acks = self.acks.clone();
        let event_tx = self.event_tx.clone();
        let task = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let text = match message {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let frame: serde_json::Value = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(error = %e, "dropping malformed relay frame");
                        continue;
                    }
                };
                let parts = match frame.as_array() {
                    Some(parts) if !parts.is_empty() => parts,
                    _ => continue,
                };
                match parts[0].as_str() {
                    Some("OK") if parts.len() >= 3 => {
                        let id = parts[1].as_str().unwrap_or("");
                        let accepted = parts[2].as_bool().unwrap_or(false);
                        if let Some(tx) = acks.lock().await.remove(id) {
                            let _ = tx.send(accepted);
                        } else {
                            debug!(id, "orphaned relay ack discarded");
                        }
                    }
                    Some("EVENT") => {
                        // Relays may interpose a subscription id before the event.
                        let event_value = parts.last().cloned().unwrap_or_default();
                        match serde_json::from_value::<SignedEvent>(event_value) {
                            Ok(event) if event.is_well_formed() => {
                                let _ = event_tx.send(event).await;
                            }
                            _ => debug!("dropping malformed relayed event"),
                        }
                    }
                    _ => {}
                }
            }
            // Socket gone; nobody will ack anymore.
            for (_, tx) in acks.lock().await.drain() {
                let _ = tx.send(false);
            }
        });
        *self.reader.lock().await = Some(task);
    }
}

#[async_trait]
impl RelaySocket for TungsteniteRelaySocket {
    async fn ensure_connected(&self) -> Result<(), TransportError> {
        let mut sink = self.sink.lock().await;
        if sink.is_some() {
            return Ok(());
        }
        let (stream, _) = connect_async(self.ws_url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let (write, read) = stream.split();
        *sink = Some(write);
        drop(sink);
        self.spawn_reader(read).await;
        info!(url = %self.ws_url, "relay websocket connected");
        Ok(())
    }

    async fn publish_event(
        &self,
        event: &SignedEvent,
        timeout: Duration,
    ) -> Result<bool, TransportError> {
        self.ensure_connected().await?;
        let (tx, rx) = oneshot::channel();
        self.acks.lock().await.insert(event.id.clone(), tx);

        let frame = serde_json::to_string(&serde_json::json!(["EVENT", event]))
            .map_err(|e| TransportError::SerializationError(e.to_string()))?;
        {
            let mut sink = self.sink.lock().await;
            let result = match sink.as_mut() {
                Some(sink) => sink.send(WsMessage::Text(frame)).await,
                None => {
                    self.acks.lock().await.remove(&event.id);
                    return Err(TransportError::ConnectionLost);
                }
            };
            if let Err(e) = result {
                *sink = None;
                self.acks.lock().await.remove(&event.id);
                return Err(TransportError::SendFailed(e.to_string()));
            }
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(accepted)) => Ok(accepted),
            Ok(Err(_)) => Err(TransportError::ConnectionLost),
            Err(_) => {
                self.acks.lock().await.remove(&event.id);
                Err(TransportError::Timeout)
            }
        }
    }

    async fn subscribe(&self) -> Option<mpsc::Receiver<SignedEvent>> {
        self.event_rx.lock().await.take()
    }

    async fn close(&self) {
        if let Some(task) = self.reader.lock().await.take() {
            task.abort();
        }
        *self.sink.lock().await = None;
        for (_, tx) in self.acks.lock().await.drain() {
            let _ = tx.send(false);
        }
    }
}

// ============================================================================
// MOCK RELAY SOCKET
// ============================================================================

/// In-memory RelaySocket used by tests
pub struct MockRelaySocket {
    accept: RwLock<bool>,
    published: Mutex<Vec<SignedEvent>>,
    event_tx: mpsc::Sender<SignedEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<SignedEvent>>>,
}

impl MockRelaySocket {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            accept: RwLock::new(true),
            published: Mutex::new(Vec::new()),
            event_tx: tx,
            event_rx: Mutex::new(Some(rx)),
        }
    }

    pub async fn set_accept(&self, accept: bool) {
        *self.accept.write().await = accept;
    }

    pub async fn inject_event(&self, event: SignedEvent) {
        let _ = self.event_tx.send(event).await;
    }

    pub async fn published(&self) -> Vec<SignedEvent> {
        self.published.lock().await.clone()
    }
}

impl Default for MockRelaySocket {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelaySocket for MockRelaySocket {
    async fn ensure_connected(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn publish_event(
        &self,
        event: &SignedEvent,
        _timeout: Duration,
    ) -> Result<bool, TransportError> {
        self.published.lock().await.push(event.clone());
        Ok(*self.accept.read().await)
    }

    async fn subscribe(&self) -> Option<mpsc::Receiver<SignedEvent>> {
        self.event_rx.lock().await.take()
    }

    async fn close(&self) {}
}

// ============================================================================
// STATION TRANSPORT CONFIG
// ============================================================================

/// Configuration for the station transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationTransportConfig {
    /// Base transport configuration
    pub base: TransportConfig,
    /// Own callsign
    pub local_callsign: String,
    /// Relay base URL, e.g. https://station.example.org
    pub station_url: String,
    /// Seconds a relay status probe stays fresh
    pub probe_cache_secs: u64,
    /// Disabled in BLE-only mode
    pub enabled: bool,
}

impl Default for StationTransportConfig {
    fn default() -> Self {
        Self {
            base: TransportConfig::default(),
            local_callsign: String::new(),
            station_url: String::new(),
            probe_cache_secs: 5,
            enabled: true,
        }
    }
}

impl StationTransportConfig {
    pub fn new(local_callsign: &str, station_url: &str) -> Self {
        Self {
            local_callsign: local_callsign.to_uppercase(),
            station_url: station_url.trim_end_matches('/').to_string(),
            ..Self::default()
        }
    }

    pub fn with_base_config(mut self, base: TransportConfig) -> Self {
        self.base = base;
        self
    }

    pub fn with_probe_cache_secs(mut self, secs: u64) -> Self {
        self.probe_cache_secs = secs;
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
// STATION TRANSPORT
// ============================================================================

/// Transport through an internet relay.
///
/// API requests are proxied under `/{TARGET_CALLSIGN}/...`; a relay 5xx is
/// a transport failure so the caller falls back, while a 4xx is a
/// delivered application answer. DM and chat traffic rides the relay
/// WebSocket as signed events resolved by relay acks.
pub struct StationTransport {
    config: StationTransportConfig,
    client: reqwest::Client,
    socket: Arc<dyn RelaySocket>,
    inbound: InboundSender,
    registry: Arc<DeviceRegistry>,
    metrics: Arc<Mutex<TransportMetrics>>,
    phase: Arc<RwLock<Phase>>,
    probe_cache: Mutex<Option<(Instant, bool)>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl StationTransport {
    pub const ID: &'static str = "station";

    pub fn new(
        config: StationTransportConfig,
        socket: Arc<dyn RelaySocket>,
        inbound: InboundSender,
    ) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            socket,
            inbound,
            registry: Arc::new(DeviceRegistry::new()),
            metrics: Arc::new(Mutex::new(TransportMetrics::default())),
            phase: Arc::new(RwLock::new(Phase::Created)),
            probe_cache: Mutex::new(None),
            reader: Mutex::new(None),
        }
    }

    /// Registry of peers contacted through the relay
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    async fn is_ready(&self) -> bool {
        *self.phase.read().await == Phase::Ready
    }

    /// Proxied URL for a path on the target device
    fn proxied_url(&self, target: &str, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.station_url,
            target.to_uppercase(),
            path.trim_start_matches('/')
        )
    }

    /// Probe the relay's own status endpoint, cached briefly
    async fn relay_reachable(&self) -> bool {
        let mut cache = self.probe_cache.lock().await;
        if let Some((when, reachable)) = *cache {
            if when.elapsed() < Duration::from_secs(self.config.probe_cache_secs) {
                return reachable;
            }
        }
        let url = format!("{}/api/status", self.config.station_url);
        let reachable = matches!(
            self.client
                .get(&url)
                .timeout(self.config.base.probe_timeout())
                .send()
                .await,
            Ok(response) if response.status().is_success()
        );
        *cache = Some((Instant::now(), reachable));
        reachable
    }

    async fn response_result(&self, response: reqwest::Response) -> TransportResult {
        use base64::Engine;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let mut result = TransportResult::from_status(Self::ID, status);

        let is_binary = content_type.starts_with("application/octet-stream")
            || content_type.starts_with("image/")
            || content_type.starts_with("audio/")
            || content_type.starts_with("video/");
        if is_binary {
            if let Ok(bytes) = response.bytes().await {
                result = result.with_response_data(serde_json::Value::String(
                    base64::engine::general_purpose::STANDARD.encode(&bytes),
                ));
            }
        } else if let Ok(text) = response.text().await {
            let data = serde_json::from_str::<serde_json::Value>(&text)
                .unwrap_or(serde_json::Value::String(text));
            result = result.with_response_data(data);
        }
        result
    }

    fn spawn_event_reader(&self, mut rx: mpsc::Receiver<SignedEvent>) -> JoinHandle<()> {
        let inbound = self.inbound.clone();
        let metrics = self.metrics.clone();
        let local_callsign = self.config.local_callsign.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let message = TransportMessage::direct_message(&local_callsign, event)
                    .with_source_transport(StationTransport::ID);
                metrics.lock().await.record_received();
                if inbound.send(message).await.is_err() {
                    warn!("inbound channel closed, relayed event dropped");
                    break;
                }
            }
        })
    }
}

// ============================================================================
// TRANSPORT IMPL
// ============================================================================

#[async_trait]
impl Transport for StationTransport {
    fn id(&self) -> &str {
        Self::ID
    }

    fn name(&self) -> &str {
        "Station Relay"
    }

    fn priority(&self) -> u8 {
        6
    }

    fn is_available(&self) -> bool {
        self.config.enabled
            && !self.config.local_callsign.is_empty()
            && !self.config.station_url.is_empty()
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
        // Take the event stream before the socket opens so nothing pushed
        // during connection setup is lost.
        let rx = self
            .socket
            .subscribe()
            .await
            .ok_or_else(|| TransportError::Unavailable("relay stream already taken".to_string()))?;
        *self.reader.lock().await = Some(self.spawn_event_reader(rx));

        if let Err(e) = self.socket.ensure_connected().await {
            // The relay may be down right now; HTTP and later sends retry.
            debug!(error = %e, "relay websocket not yet connected");
        }
        info!(station = %self.config.station_url, "station transport initialized");
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
        self.socket.close().await;
        if let Some(task) = self.reader.lock().await.take() {
            task.abort();
        }
        info!("station transport disposed");
    }

    async fn can_reach(&self, _callsign: &str) -> bool {
        // Any callsign is potentially behind the relay; reachability is
        // the relay's own health.
        self.is_ready().await && self.relay_reachable().await
    }

    async fn quality(&self, _callsign: &str) -> u8 {
        if !self.is_ready().await {
            return 0;
        }
        let cached = match *self.probe_cache.lock().await {
            Some((_, reachable)) => reachable,
            None => false,
        };
        if !cached {
            return 0;
        }
        // Internet round trips keep the relay below every local medium.
        let score = self.metrics.lock().await.success_score() as u32;
        (20 + score * 30 / 100) as u8
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

impl StationTransport {
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
        let timeout = timeout.unwrap_or_else(|| self.config.base.send_timeout());
        let started = Instant::now();
        let target = message.target_callsign().to_string();

        let result = match message.message_type() {
            TransportMessageType::DirectMessage | TransportMessageType::ChatMessage => {
                let event = match message.signed_event() {
                    Some(event) => event,
                    None => {
                        return TransportError::Envelope("missing signed event".to_string())
                            .into_result(Self::ID)
                    }
                };
                match self.socket.publish_event(event, timeout).await {
                    Ok(true) => {
                        self.registry.record(&target, Reachability::Station).await;
                        TransportResult::ok(Self::ID)
                    }
                    Ok(false) => TransportResult::failure(Self::ID, "Relay rejected event"),
                    Err(e) => e.into_result(Self::ID),
                }
            }
            TransportMessageType::ApiResponse => TransportError::SendFailed(
                "api_response has no standalone station mapping".to_string(),
            )
            .into_result(Self::ID),
            _ => self.send_http(message, timeout).await,
        };
        result.with_latency(started.elapsed())
    }

    async fn send_http(&self, message: &TransportMessage, timeout: Duration) -> TransportResult {
        let target = message.target_callsign();
        let request = match message.message_type() {
            TransportMessageType::ApiRequest => {
                let method = message.method().unwrap_or("GET");
                let method = match reqwest::Method::from_bytes(method.as_bytes()) {
                    Ok(method) => method,
                    Err(_) => {
                        return TransportError::InvalidAddress(format!("bad method {}", method))
                            .into_result(Self::ID)
                    }
                };
                let url = self.proxied_url(target, message.path().unwrap_or("/"));
                let mut request = self.client.request(method, url);
                for (name, value) in message.headers() {
                    request = request.header(name, value);
                }
                match message.payload() {
                    Some(Payload::Json(value)) => request.json(value),
                    Some(Payload::Text(text)) => request.body(text.clone()),
                    Some(Payload::Binary(bytes)) => request.body(bytes.clone()),
                    None => request,
                }
            }
            TransportMessageType::Hello => self
                .client
                .post(self.proxied_url(target, "/api/hello"))
                .json(&serde_json::json!({ "callsign": self.config.local_callsign })),
            TransportMessageType::Ping => self
                .client
                .post(self.proxied_url(target, "/api/ping"))
                .json(&serde_json::json!({ "callsign": self.config.local_callsign })),
            TransportMessageType::Sync => self
                .client
                .post(self.proxied_url(target, "/api/sync"))
                .json(&serde_json::json!({ "callsign": self.config.local_callsign })),
            _ => {
                return TransportError::SendFailed("unsupported station message".to_string())
                    .into_result(Self::ID)
            }
        };

        match request.timeout(timeout).send().await {
            Ok(response) => {
                let result = self.response_result(response).await;
                if result.success() {
                    self.registry.record(target, Reachability::Station).await;
                }
                result
            }
            Err(e) => {
                let error = if e.is_timeout() {
                    TransportError::Timeout
                } else if e.is_connect() {
                    TransportError::ConnectionFailed(e.to_string())
                } else {
                    TransportError::SendFailed(e.to_string())
                };
                error.into_result(Self::ID)
            }
        }
    }
}
