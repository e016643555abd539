// Pending Requests - Request/response correlation table
// Maps in-flight message ids to oneshot completions with a bounded wait

use crate::message::TransportResult;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use tracing::debug;

// ============================================================================
// PENDING ENTRY
// ============================================================================

struct PendingEntry {
    completer: oneshot::Sender<TransportResult>,
    started: Instant,
}

// ============================================================================
// PENDING REQUESTS
// ============================================================================

/// Table of in-flight requests awaiting a correlated reply.
///
/// At most one record exists per message id. A record is removed exactly once,
/// by whichever comes first: a matching reply, the timeout, or a flush on
/// disconnect/dispose. Late replies find no record and are discarded.
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Register an in-flight request and get the receiver its reply resolves.
    ///
    /// Registering an id that is already in flight supersedes the older
    /// waiter, which is resolved with a failure so it never hangs.
    pub async fn register(&self, id: &str, transport_id: &str) -> oneshot::Receiver<TransportResult> {
        let (tx, rx) = oneshot::channel();
        let entry = PendingEntry {
            completer: tx,
            started: Instant::now(),
        };
        let mut table = self.inner.lock().await;
        if let Some(old) = table.insert(id.to_string(), entry) {
            debug!(id, "pending request superseded by re-registration");
            let _ = old.completer.send(TransportResult::failure(
                transport_id,
                "Request superseded by a newer send with the same id",
            ));
        }
        rx
    }

    /// Resolve a pending request with a reply. Returns false when no record
    /// exists, which marks the reply as orphaned.
    pub async fn resolve(&self, id: &str, result: TransportResult) -> bool {
        let entry = self.inner.lock().await.remove(id);
        match entry {
            Some(entry) => {
                let result = result.with_latency(entry.started.elapsed());
                // The receiver may already be gone after a timeout race.
                let _ = entry.completer.send(result);
                true
            }
            None => false,
        }
    }

    /// Remove a record without resolving it, used on timeout
    pub async fn remove(&self, id: &str) -> bool {
        self.inner.lock().await.remove(id).is_some()
    }

    /// Resolve every outstanding record with the same failure, used on
    /// disconnect and dispose so no caller awaits forever
    pub async fn flush_all(&self, transport_id: &str, reason: &str) -> usize {
        let mut table = self.inner.lock().await;
        let count = table.len();
        for (id, entry) in table.drain() {
            debug!(id, reason, "flushing pending request");
            let _ = entry
                .completer
                .send(TransportResult::failure(transport_id, reason));
        }
        count
    }

    /// Number of in-flight records
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    /// Await a registered receiver with a deadline.
    ///
    /// On timeout the record is removed first, so a reply arriving later is
    /// orphaned rather than resolving a stale waiter.
    pub async fn await_reply(
        &self,
        id: &str,
        rx: oneshot::Receiver<TransportResult>,
        timeout: Duration,
        transport_id: &str,
    ) -> TransportResult {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                // Completer dropped without sending, treat as a lost link.
                self.remove(id).await;
                TransportResult::failure(transport_id, "Connection lost while awaiting reply")
            }
            Err(_) => {
                self.remove(id).await;
                TransportResult::failure(
                    transport_id,
                    format!("Request timeout after {}s", timeout.as_secs()),
                )
            }
        }
    }
}
