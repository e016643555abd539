// Device Registry - Callsign to reachability mapping
// Per-transport routing table consulted by can_reach and quality

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

// ============================================================================
// REACHABILITY
// ============================================================================

/// Medium-specific reachability data for one peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reachability {
    /// Local HTTP server on a private-range address
    Lan { base_url: String },
    /// Reachable through the configured relay
    Station,
    /// BLE peripheral seen during scanning
    Ble { device_id: String, rssi: i16 },
    /// Classic Bluetooth MAC bound through a BLE+ pairing
    Classic { mac: String },
    /// Peer on the other end of the accessory link
    Usb { remote_callsign: String },
    /// Open WebRTC data channel
    WebRtc { peer_id: String },
}

impl Reachability {
    /// Create a classic entry with the MAC normalized to uppercase
    pub fn classic(mac: &str) -> Self {
        Self::Classic {
            mac: mac.to_uppercase(),
        }
    }

    pub fn ble(device_id: &str, rssi: i16) -> Self {
        Self::Ble {
            device_id: device_id.to_string(),
            rssi,
        }
    }

    pub fn lan(base_url: &str) -> Self {
        Self::Lan {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

// ============================================================================
// DEVICE ENTRY
// ============================================================================

/// One known peer and how this transport can reach it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    callsign: String,
    reachability: Reachability,
    /// NOSTR public key learned from hellos or signed events, stored only
    npub: Option<String>,
    last_seen: DateTime<Utc>,
}

impl DeviceEntry {
    pub fn new(callsign: &str, reachability: Reachability) -> Self {
        Self {
            callsign: callsign.to_uppercase(),
            reachability,
            npub: None,
            last_seen: Utc::now(),
        }
    }

    pub fn with_npub(mut self, npub: &str) -> Self {
        self.npub = Some(npub.to_string());
        self
    }

    pub fn callsign(&self) -> &str {
        &self.callsign
    }

    pub fn reachability(&self) -> &Reachability {
        &self.reachability
    }

    pub fn npub(&self) -> Option<&str> {
        self.npub.as_deref()
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    fn touch(&mut self) {
        self.last_seen = Utc::now();
    }
}

// ============================================================================
// DEVICE REGISTRY
// ============================================================================

/// Callsign-keyed routing table for one transport instance.
///
/// Entries are created or refreshed on discovery and successful contact.
/// Nothing here expires them; staleness is the caller's concern.
#[derive(Default)]
pub struct DeviceRegistry {
    inner: RwLock<HashMap<String, DeviceEntry>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or refresh a peer, replacing its reachability data
    pub async fn record(&self, callsign: &str, reachability: Reachability) {
        let key = callsign.to_uppercase();
        let mut map = self.inner.write().await;
        match map.get_mut(&key) {
            Some(entry) => {
                entry.reachability = reachability;
                entry.touch();
            }
            None => {
                map.insert(key.clone(), DeviceEntry::new(&key, reachability));
            }
        }
    }

    /// Refresh last-seen without changing reachability, if the peer is known
    pub async fn touch(&self, callsign: &str) {
        if let Some(entry) = self.inner.write().await.get_mut(&callsign.to_uppercase()) {
            entry.touch();
        }
    }

    /// Attach an npub to a known peer
    pub async fn set_npub(&self, callsign: &str, npub: &str) {
        if let Some(entry) = self.inner.write().await.get_mut(&callsign.to_uppercase()) {
            entry.npub = Some(npub.to_string());
        }
    }

    pub async fn get(&self, callsign: &str) -> Option<DeviceEntry> {
        self.inner.read().await.get(&callsign.to_uppercase()).cloned()
    }

    pub async fn contains(&self, callsign: &str) -> bool {
        self.inner.read().await.contains_key(&callsign.to_uppercase())
    }

    pub async fn remove(&self, callsign: &str) -> Option<DeviceEntry> {
        self.inner.write().await.remove(&callsign.to_uppercase())
    }

    pub async fn clear(&self) {
        self.inner.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Snapshot of all known peers
    pub async fn entries(&self) -> Vec<DeviceEntry> {
        self.inner.read().await.values().cloned().collect()
    }

    /// Callsigns of all known peers
    pub async fn callsigns(&self) -> Vec<String> {
        self.inner.read().await.keys().cloned().collect()
    }
}
