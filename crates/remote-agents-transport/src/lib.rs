//! Wire codec and connectors for the remote agent session client.
//!
//! Provides:
//! - Wire protocol (JSON envelopes)
//! - Claude payload shapes
//! - WebSocket connector (feature: websocket)
//! - In-process loopback connector (feature: memory)

pub mod claude;
pub mod protocol;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(feature = "memory")]
pub mod memory;

pub use protocol::{CommandOptions, DecodeError, EncodeError, OutboundEnvelope, ServerEvent, decode};

#[cfg(feature = "memory")]
pub use memory::{MemoryConnector, RemotePeer};
#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;
