// Message module - THE ENVELOPE (canonical)
// Canonical message and result model shared by every transport medium

mod envelope;
mod result;

pub use envelope::{
    // Envelope types
    TransportMessage, TransportMessageType,
    Payload, SignedEvent,
    // Errors
    MessageError,
    // Reserved channels
    CHANNEL_API, CHANNEL_API_RESPONSE, CHANNEL_DM, CHANNEL_HELLO, CHANNEL_SYSTEM,
    RESERVED_CHANNELS, is_reserved_channel,
};

pub use result::TransportResult;
