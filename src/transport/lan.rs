// LAN Transport Implementation
// Direct HTTP to a peer's local server on a private-range address

use crate::message::{Payload, TransportMessage, TransportMessageType, TransportResult};
use crate::transport::registry::{DeviceRegistry, Reachability};
use crate::transport::traits::{Transport, TransportConfig, TransportError, TransportMetrics};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

// ============================================================================
// URL CLASSIFICATION
// ============================================================================

/// Check whether a URL points into a private address range: loopback,
/// 10/8, 172.16-31/12, 192.168/16 or 169.254/16. Public addresses are
/// never treated as LAN peers.
pub fn is_local_url(url: &str) -> bool {
    let rest = match url.split_once("://") {
        Some((_, rest)) => rest,
        None => url,
    };
    let authority = rest.split(['/', '?']).next().unwrap_or("");
    let host = if let Some(bracketed) = authority.strip_prefix('[') {
        bracketed.split(']').next().unwrap_or("")
    } else {
        match authority.rsplit_once(':') {
            Some((h, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => h,
            _ => authority,
        }
    };

    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => ip.is_loopback() || ip.is_private() || ip.is_link_local(),
        Ok(IpAddr::V6(ip)) => ip.is_loopback(),
        Err(_) => false,
    }
}

// ============================================================================
// LAN TRANSPORT CONFIG
// ============================================================================

/// Configuration for the LAN transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanTransportConfig {
    /// Base transport configuration
    pub base: TransportConfig,
    /// Own callsign announced to peers
    pub local_callsign: String,
    /// Status endpoint probed by can_reach
    pub status_path: String,
}

impl Default for LanTransportConfig {
    fn default() -> Self {
        Self {
            base: TransportConfig::default(),
            local_callsign: String::new(),
            status_path: "/api/status".to_string(),
        }
    }
}

impl LanTransportConfig {
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

    pub fn with_status_path(mut self, path: &str) -> Self {
        self.status_path = path.to_string();
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
// LAN TRANSPORT
// ============================================================================

/// Transport over a peer's local HTTP server.
///
/// Peers are registered with a discovered base URL, gated to private
/// address ranges. API requests map one-to-one onto HTTP verbs; DM and
/// chat traffic posts signed events to fixed REST paths. Inbound traffic
/// arrives at this device's own HTTP server, which lives outside this
/// adapter.
pub struct LanTransport {
    config: LanTransportConfig,
    client: reqwest::Client,
    registry: Arc<DeviceRegistry>,
    metrics: Arc<Mutex<TransportMetrics>>,
    phase: Arc<RwLock<Phase>>,
}

impl LanTransport {
    pub const ID: &'static str = "lan";

    pub fn new(config: LanTransportConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            registry: Arc::new(DeviceRegistry::new()),
            metrics: Arc::new(Mutex::new(TransportMetrics::default())),
            phase: Arc::new(RwLock::new(Phase::Created)),
        }
    }

    /// Registry of peers with known local URLs
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Register a peer's local server, rejecting non-private addresses
    pub async fn register_device(&self, callsign: &str, base_url: &str) -> Result<(), TransportError> {
        if !is_local_url(base_url) {
            return Err(TransportError::InvalidAddress(format!(
                "{} is not a private-range URL",
                base_url
            )));
        }
        self.registry
            .record(callsign, Reachability::lan(base_url))
            .await;
        debug!(peer = %callsign.to_uppercase(), url = base_url, "lan peer registered");
        Ok(())
    }

    async fn is_ready(&self) -> bool {
        *self.phase.read().await == Phase::Ready
    }

    async fn base_url_for(&self, callsign: &str) -> Option<String> {
        match self.registry.get(callsign).await.map(|e| e.reachability().clone()) {
            Some(Reachability::Lan { base_url }) => Some(base_url),
            _ => None,
        }
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        timeout: Duration,
    ) -> Result<reqwest::Response, TransportError> {
        request
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else if e.is_connect() {
                    TransportError::ConnectionFailed(e.to_string())
                } else {
                    TransportError::SendFailed(e.to_string())
                }
            })
    }

    /// Translate an HTTP response into a result, honoring the 4xx/5xx split
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
}

// ============================================================================
// TRANSPORT IMPL
// ============================================================================

#[async_trait]
impl Transport for LanTransport {
    fn id(&self) -> &str {
        Self::ID
    }

    fn name(&self) -> &str {
        "Local Network"
    }

    fn priority(&self) -> u8 {
        1
    }

    fn is_available(&self) -> bool {
        !self.config.local_callsign.is_empty()
    }

    async fn initialize(&self) -> Result<(), TransportError> {
        let mut phase = self.phase.write().await;
        match *phase {
            Phase::Ready => Ok(()),
            Phase::Disposed => Err(TransportError::Disposed),
            Phase::Created => {
                *phase = Phase::Ready;
                info!(callsign = %self.config.local_callsign, "lan transport initialized");
                Ok(())
            }
        }
    }

    async fn dispose(&self) {
        let mut phase = self.phase.write().await;
        if *phase != Phase::Disposed {
            *phase = Phase::Disposed;
            info!("lan transport disposed");
        }
    }

    async fn can_reach(&self, callsign: &str) -> bool {
        if !self.is_ready().await {
            return false;
        }
        let base_url = match self.base_url_for(callsign).await {
            Some(url) => url,
            None => return false,
        };
        let probe = format!("{}{}", base_url, self.config.status_path);
        match self
            .execute(self.client.get(&probe), self.config.base.probe_timeout())
            .await
        {
            Ok(response) if response.status().is_success() => {
                self.registry.touch(callsign).await;
                true
            }
            _ => false,
        }
    }

    async fn quality(&self, callsign: &str) -> u8 {
        if !self.is_ready().await || self.base_url_for(callsign).await.is_none() {
            return 0;
        }
        // Local links are fast when they work; weight by observed outcomes.
        let score = self.metrics.lock().await.success_score() as u32;
        (50 + score * 45 / 100) as u8
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

impl LanTransport {
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
        let base_url = match self.base_url_for(message.target_callsign()).await {
            Some(url) => url,
            None => {
                return TransportError::Unreachable(format!(
                    "{} has no known local URL",
                    message.target_callsign()
                ))
                .into_result(Self::ID)
            }
        };
        let timeout = timeout.unwrap_or_else(|| self.config.base.send_timeout());
        let started = Instant::now();

        let request = match self.build_request(message, &base_url) {
            Ok(request) => request,
            Err(e) => return e.into_result(Self::ID),
        };
        let result = match self.execute(request, timeout).await {
            Ok(response) => {
                self.registry.touch(message.target_callsign()).await;
                self.response_result(response).await
            }
            Err(e) => e.into_result(Self::ID),
        };
        result.with_latency(started.elapsed())
    }

    fn build_request(
        &self,
        message: &TransportMessage,
        base_url: &str,
    ) -> Result<reqwest::RequestBuilder, TransportError> {
        let request = match message.message_type() {
            TransportMessageType::ApiRequest => {
                let method = message.method().unwrap_or("GET");
                let method = reqwest::Method::from_bytes(method.as_bytes())
                    .map_err(|_| TransportError::InvalidAddress(format!("bad method {}", method)))?;
                let path = message.path().unwrap_or("/");
                let mut request = self.client.request(method, format!("{}{}", base_url, path));
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
            TransportMessageType::DirectMessage => self
                .client
                .post(format!("{}/api/dm/send", base_url))
                .json(&message.signed_event()),
            TransportMessageType::ChatMessage => self
                .client
                .post(format!("{}/api/chat/send", base_url))
                .json(&message.signed_event()),
            TransportMessageType::Hello => self
                .client
                .post(format!("{}/api/hello", base_url))
                .json(&serde_json::json!({ "callsign": self.config.local_callsign })),
            TransportMessageType::Ping => self
                .client
                .post(format!("{}/api/ping", base_url))
                .json(&serde_json::json!({ "callsign": self.config.local_callsign })),
            TransportMessageType::Sync => self
                .client
                .post(format!("{}/api/sync", base_url))
                .json(&serde_json::json!({ "callsign": self.config.local_callsign })),
            TransportMessageType::ApiResponse => {
                // Responses travel on the HTTP response of the original
                // request; there is nothing to deliver separately.
                return Err(TransportError::SendFailed(
                    "api_response has no standalone LAN mapping".to_string(),
                ));
            }
        };
        Ok(request)
    }
}
