// Transport Result - Outcome of a send attempt
// Every send returns one of these; adapters never raise across the boundary

use serde_json::Value;
use std::time::Duration;

// ============================================================================
// TRANSPORT RESULT
// ============================================================================

/// Outcome of a `send` on any transport.
///
/// `success == true` implies `error == None`. An HTTP-style 4xx is a success
/// with the rejection status (the request reached the peer); a 5xx or any
/// medium-level failure is `success == false` so the caller can fall back.
#[derive(Debug, Clone)]
pub struct TransportResult {
    success: bool,
    error: Option<String>,
    status_code: Option<u16>,
    response_data: Option<Value>,
    transport_used: String,
    latency: Option<Duration>,
}

impl TransportResult {
    /// Successful delivery with no response body
    pub fn ok(transport_used: &str) -> Self {
        Self {
            success: true,
            error: None,
            status_code: None,
            response_data: None,
            transport_used: transport_used.to_string(),
            latency: None,
        }
    }

    /// Failed delivery with a human-readable reason
    pub fn failure(transport_used: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            status_code: None,
            response_data: None,
            transport_used: transport_used.to_string(),
            latency: None,
        }
    }

    /// Outcome derived from an HTTP-style status code
    pub fn from_status(transport_used: &str, status: u16) -> Self {
        if status >= 500 {
            Self::failure(transport_used, format!("Remote error: HTTP {}", status))
                .with_status_code(status)
        } else {
            Self::ok(transport_used).with_status_code(status)
        }
    }

    pub fn with_status_code(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_response_data(mut self, data: Value) -> Self {
        self.response_data = Some(data);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    pub fn response_data(&self) -> Option<&Value> {
        self.response_data.as_ref()
    }

    pub fn transport_used(&self) -> &str {
        &self.transport_used
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    /// Whether the selection loop should try the next transport.
    ///
    /// Only undelivered sends fall back. A 4xx rejection was delivered and
    /// answered by the peer, so retrying on another medium cannot help.
    pub fn should_fallback(&self) -> bool {
        !self.success
    }

    /// Check if this is a timeout outcome
    pub fn is_timeout(&self) -> bool {
        self.error
            .as_deref()
            .map(|e| e.to_ascii_lowercase().contains("timeout"))
            .unwrap_or(false)
    }
}
