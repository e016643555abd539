// Transport Router - Priority selection and fallback
// Walks transports in priority order, falling back on undelivered sends

use crate::message::{TransportMessage, TransportResult};
use crate::transport::traits::{
    InboundReceiver, InboundSender, Transport, TransportConfig, TransportError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

// ============================================================================
// TRANSPORT ROUTER
// ============================================================================

/// Composes transports into one send surface.
///
/// Transports are tried by ascending priority, with cached quality breaking
/// ties. A result only falls through to the next transport when the send
/// never reached the peer; an application-level rejection is final.
pub struct TransportRouter {
    transports: Mutex<Vec<Arc<dyn Transport>>>,
    inbound_tx: InboundSender,
    inbound_rx: Mutex<Option<InboundReceiver>>,
}

impl TransportRouter {
    pub fn new(config: &TransportConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.inbound_queue_depth);
        Self {
            transports: Mutex::new(Vec::new()),
            inbound_tx: tx,
            inbound_rx: Mutex::new(Some(rx)),
        }
    }

    /// Sender handed to each adapter at construction; all media fan in here
    pub fn inbound_sender(&self) -> InboundSender {
        self.inbound_tx.clone()
    }

    /// Take the fan-in receiver, once
    pub async fn take_inbound(&self) -> Option<InboundReceiver> {
        self.inbound_rx.lock().await.take()
    }

    /// Add a transport to the selection set
    pub async fn register(&self, transport: Arc<dyn Transport>) {
        let mut transports = self.transports.lock().await;
        transports.push(transport);
        transports.sort_by_key(|t| t.priority());
    }

    /// Number of registered transports
    pub async fn len(&self) -> usize {
        self.transports.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.transports.lock().await.is_empty()
    }

    /// Initialize every available transport, reporting the first error but
    /// continuing through the rest
    pub async fn initialize_all(&self) -> Result<(), TransportError> {
        let transports = self.transports.lock().await.clone();
        let mut first_error = None;
        for transport in transports {
            if !transport.is_available() {
                debug!(transport = transport.id(), "skipping unavailable transport");
                continue;
            }
            if let Err(e) = transport.initialize().await {
                warn!(transport = transport.id(), error = %e, "initialize failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Dispose every transport
    pub async fn dispose_all(&self) {
        let transports = self.transports.lock().await.clone();
        for transport in transports {
            transport.dispose().await;
        }
        info!("all transports disposed");
    }

    /// Send through the best transport that can reach the target, falling
    /// back across media until one delivers
    pub async fn send(
        &self,
        message: TransportMessage,
        timeout: Option<Duration>,
    ) -> TransportResult {
        let target = message.target_callsign().to_string();
        let candidates = self.ranked_candidates(&target).await;
        if candidates.is_empty() {
            return TransportResult::failure(
                "router",
                format!("No transport can reach {}", target),
            );
        }

        let mut last_failure = None;
        for transport in candidates {
            debug!(transport = transport.id(), peer = %target, "attempting send");
            let result = transport.send(message.clone(), timeout).await;
            if !result.should_fallback() {
                return result;
            }
            warn!(
                transport = transport.id(),
                error = result.error().unwrap_or("unknown"),
                "send failed, falling back"
            );
            last_failure = Some(result);
        }
        last_failure.unwrap_or_else(|| {
            TransportResult::failure("router", format!("No transport can reach {}", target))
        })
    }

    /// Fire-and-forget across the same selection logic
    pub async fn send_async(&self, message: TransportMessage) {
        let result = self.send(message, None).await;
        if !result.success() {
            warn!(
                transport = result.transport_used(),
                error = result.error().unwrap_or("unknown"),
                "fire-and-forget send failed"
            );
        }
    }

    /// Available transports that report the target reachable, ordered by
    /// (priority, quality descending)
    async fn ranked_candidates(&self, target: &str) -> Vec<Arc<dyn Transport>> {
        let transports = self.transports.lock().await.clone();
        let mut ranked = Vec::new();
        for transport in transports {
            if !transport.is_available() {
                continue;
            }
            if !transport.can_reach(target).await {
                continue;
            }
            let quality = transport.quality(target).await;
            ranked.push((transport.priority(), quality, transport));
        }
        ranked.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        ranked.into_iter().map(|(_, _, t)| t).collect()
    }
}
