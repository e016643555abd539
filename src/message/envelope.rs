// Message Envelope - Canonical message model
// Defines the TransportMessage envelope carried across every transport medium

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

// ============================================================================
// RESERVED CHANNELS
// ============================================================================

/// Logical channel for API requests on message-oriented media
pub const CHANNEL_API: &str = "_api";
/// Logical channel for API responses
pub const CHANNEL_API_RESPONSE: &str = "_api_response";
/// Logical channel for direct messages
pub const CHANNEL_DM: &str = "_dm";
/// Logical channel for ping/sync system traffic
pub const CHANNEL_SYSTEM: &str = "_system";
/// Logical channel for link handshakes
pub const CHANNEL_HELLO: &str = "_hello";

/// Channels reserved by the transport layer; application channels must not collide
pub const RESERVED_CHANNELS: [&str; 5] = [
    CHANNEL_API,
    CHANNEL_API_RESPONSE,
    CHANNEL_DM,
    CHANNEL_SYSTEM,
    CHANNEL_HELLO,
];

/// Check whether a channel name is reserved by the transport layer
pub fn is_reserved_channel(name: &str) -> bool {
    RESERVED_CHANNELS.contains(&name)
}

// ============================================================================
// MESSAGE ERRORS
// ============================================================================

/// Errors raised while building or decoding message envelopes
#[derive(Debug, Clone, Error)]
pub enum MessageError {
    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),
}

// ============================================================================
// MESSAGE TYPE
// ============================================================================

/// Types of messages carried by the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMessageType {
    ApiRequest,
    ApiResponse,
    DirectMessage,
    ChatMessage,
    Hello,
    Ping,
    Sync,
}

impl TransportMessageType {
    /// Wire name used in JSON envelopes
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiRequest => "api_request",
            Self::ApiResponse => "api_response",
            Self::DirectMessage => "direct_message",
            Self::ChatMessage => "chat_message",
            Self::Hello => "hello",
            Self::Ping => "ping",
            Self::Sync => "sync",
        }
    }

    /// Parse a wire name; unknown names are an error, never a fallthrough
    pub fn parse(value: &str) -> Result<Self, MessageError> {
        match value {
            "api_request" => Ok(Self::ApiRequest),
            "api_response" => Ok(Self::ApiResponse),
            "direct_message" => Ok(Self::DirectMessage),
            "chat_message" => Ok(Self::ChatMessage),
            "hello" => Ok(Self::Hello),
            "ping" => Ok(Self::Ping),
            "sync" => Ok(Self::Sync),
            other => Err(MessageError::UnknownType(other.to_string())),
        }
    }

    /// Reserved channel that carries this message type on channel-oriented media
    pub fn wire_channel(&self) -> &'static str {
        match self {
            Self::ApiRequest => CHANNEL_API,
            Self::ApiResponse => CHANNEL_API_RESPONSE,
            Self::DirectMessage | Self::ChatMessage => CHANNEL_DM,
            Self::Hello => CHANNEL_HELLO,
            Self::Ping | Self::Sync => CHANNEL_SYSTEM,
        }
    }

    /// Check if this type expects a correlated response
    pub fn expects_response(&self) -> bool {
        matches!(self, Self::ApiRequest)
    }
}

impl fmt::Display for TransportMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// SIGNED EVENT
// ============================================================================

/// Cryptographically signed envelope produced and verified by an external
/// signing service. Carried unmodified; only `id`, `pubkey` and `sig` are
/// inspected by the transport layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedEvent {
    pub id: String,
    pub pubkey: String,
    pub sig: String,
    #[serde(default)]
    pub kind: u16,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
}

impl SignedEvent {
    /// Minimal sanity check before relaying; full verification is external
    pub fn is_well_formed(&self) -> bool {
        !self.id.is_empty() && !self.pubkey.is_empty() && !self.sig.is_empty()
    }
}

// ============================================================================
// PAYLOAD
// ============================================================================

/// Request/response body for API traffic.
///
/// A `Text` payload is assumed to be pre-encoded by the caller and is passed
/// through verbatim; adapters must never serialize it a second time.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Json(serde_json::Value),
    Binary(Vec<u8>),
}

impl Payload {
    /// Render the payload as the string carried inside a JSON envelope
    pub fn to_wire_string(&self) -> String {
        use base64::Engine;
        match self {
            Self::Text(s) => s.clone(),
            Self::Json(v) => v.to_string(),
            Self::Binary(b) => base64::engine::general_purpose::STANDARD.encode(b),
        }
    }

    /// Render the payload as a JSON value for body fields
    pub fn to_wire_value(&self) -> serde_json::Value {
        use base64::Engine;
        match self {
            Self::Text(s) => serde_json::Value::String(s.clone()),
            Self::Json(v) => v.clone(),
            Self::Binary(b) => serde_json::Value::String(
                base64::engine::general_purpose::STANDARD.encode(b),
            ),
        }
    }

    /// Approximate size in bytes, used for medium-preference decisions
    pub fn size_hint(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Json(v) => v.to_string().len(),
            Self::Binary(b) => b.len(),
        }
    }
}

// ============================================================================
// TRANSPORT MESSAGE
// ============================================================================

/// Canonical message envelope, immutable once constructed.
///
/// Exactly one of `payload` / `signed_event` is the semantic content:
/// API traffic carries a payload, DM/chat traffic carries a signed event.
#[derive(Debug, Clone)]
pub struct TransportMessage {
    id: String,
    target_callsign: String,
    message_type: TransportMessageType,
    method: Option<String>,
    path: Option<String>,
    headers: HashMap<String, String>,
    payload: Option<Payload>,
    signed_event: Option<SignedEvent>,
    status_code: Option<u16>,
    source_transport_id: Option<String>,
    timestamp_ms: i64,
}

impl TransportMessage {
    /// Generate a globally unique message id
    pub fn generate_id() -> String {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let mut bytes = [0u8; 16];
        rng.fill(&mut bytes);
        hex::encode(bytes)
    }

    fn base(target: &str, message_type: TransportMessageType) -> Self {
        Self {
            id: Self::generate_id(),
            target_callsign: target.to_uppercase(),
            message_type,
            method: None,
            path: None,
            headers: HashMap::new(),
            payload: None,
            signed_event: None,
            status_code: None,
            source_transport_id: None,
            timestamp_ms: Utc::now().timestamp_millis(),
        }
    }

    /// Build an API request
    pub fn api_request(target: &str, method: &str, path: &str) -> Self {
        let mut msg = Self::base(target, TransportMessageType::ApiRequest);
        msg.method = Some(method.to_uppercase());
        msg.path = Some(path.to_string());
        msg
    }

    /// Build an API response correlated to a request id
    pub fn api_response(target: &str, request_id: &str, status_code: u16) -> Self {
        let mut msg = Self::base(target, TransportMessageType::ApiResponse);
        msg.id = request_id.to_string();
        msg.status_code = Some(status_code);
        msg
    }

    /// Build a direct message carrying a signed event
    pub fn direct_message(target: &str, event: SignedEvent) -> Self {
        let mut msg = Self::base(target, TransportMessageType::DirectMessage);
        msg.signed_event = Some(event);
        msg
    }

    /// Build a chat message carrying a signed event
    pub fn chat_message(target: &str, event: SignedEvent) -> Self {
        let mut msg = Self::base(target, TransportMessageType::ChatMessage);
        msg.signed_event = Some(event);
        msg
    }

    /// Build a link handshake announcement
    pub fn hello(target: &str, own_callsign: &str) -> Self {
        let mut msg = Self::base(target, TransportMessageType::Hello);
        msg.payload = Some(Payload::Json(serde_json::json!({
            "callsign": own_callsign.to_uppercase(),
        })));
        msg
    }

    /// Build a liveness ping
    pub fn ping(target: &str) -> Self {
        Self::base(target, TransportMessageType::Ping)
    }

    /// Build a sync notification
    pub fn sync_notice(target: &str) -> Self {
        Self::base(target, TransportMessageType::Sync)
    }

    /// Reuse a caller-supplied id, keeping correlation stable across retries
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Stamp the adapter that produced this inbound message
    pub fn with_source_transport(mut self, transport_id: &str) -> Self {
        self.source_transport_id = Some(transport_id.to_string());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Destination callsign, always uppercased
    pub fn target_callsign(&self) -> &str {
        &self.target_callsign
    }

    pub fn message_type(&self) -> TransportMessageType {
        self.message_type
    }

    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    pub fn signed_event(&self) -> Option<&SignedEvent> {
        self.signed_event.as_ref()
    }

    /// Status carried by an API response envelope
    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    pub fn source_transport_id(&self) -> Option<&str> {
        self.source_transport_id.as_deref()
    }

    /// Envelope creation time in milliseconds since the epoch
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    /// Check whether this message addresses the given callsign
    pub fn is_for(&self, callsign: &str) -> bool {
        self.target_callsign == callsign.to_uppercase()
    }

    /// Approximate content size in bytes
    pub fn content_size(&self) -> usize {
        match (&self.payload, &self.signed_event) {
            (Some(p), _) => p.size_hint(),
            (None, Some(e)) => e.content.len(),
            (None, None) => 0,
        }
    }

    /// Validate the content invariant for this message type
    pub fn validate(&self) -> Result<(), MessageError> {
        match self.message_type {
            TransportMessageType::ApiRequest => {
                if self.method.is_none() {
                    return Err(MessageError::MissingField("method"));
                }
                if self.path.is_none() {
                    return Err(MessageError::MissingField("path"));
                }
                if self.signed_event.is_some() {
                    return Err(MessageError::InvalidEnvelope(
                        "API request cannot carry a signed event".to_string(),
                    ));
                }
                Ok(())
            }
            TransportMessageType::DirectMessage | TransportMessageType::ChatMessage => {
                match &self.signed_event {
                    Some(event) if event.is_well_formed() => Ok(()),
                    Some(_) => Err(MessageError::InvalidEnvelope(
                        "Signed event is missing id, pubkey or sig".to_string(),
                    )),
                    None => Err(MessageError::MissingField("signed_event")),
                }
            }
            _ => Ok(()),
        }
    }
}
