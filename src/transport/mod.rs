// Transport module - THE WIRE (abstract)
// Common transport contract plus one adapter per physical medium

mod traits;
mod pending;
mod registry;
mod router;
mod lan;
mod station;
mod ble;
mod classic;
mod usb;
mod webrtc;

pub use traits::{
    // Core trait
    Transport,
    // Configuration
    TransportConfig,
    // Errors and metrics
    TransportError, TransportMetrics,
    // Inbound fan-in
    InboundReceiver, InboundSender,
};

pub use pending::PendingRequests;

pub use registry::{DeviceEntry, DeviceRegistry, Reachability};

pub use router::TransportRouter;

pub use lan::{is_local_url, LanTransport, LanTransportConfig};

pub use station::{
    MockRelaySocket, RelaySocket, StationTransport, StationTransportConfig,
    TungsteniteRelaySocket,
};

pub use ble::{BleEvent, BleLink, BleTransport, BleTransportConfig, MockBleLink};

pub use classic::{
    ClassicTransport, ClassicTransportConfig, MockSppSocket, MockTransferSessions,
    SppFrame, SppSocket, TransferSessions,
};

pub use usb::{FrameBuffer, MockUsbLink, UsbLink, UsbTransport, UsbTransportConfig};

pub use webrtc::{
    MockPeerManager, PeerEvent, PeerManager, WebRtcTransport, WebRtcTransportConfig,
};
