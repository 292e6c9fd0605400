//! Core vocabulary for the remote agent session client.
//!
//! This crate provides the fundamental building blocks:
//! - `SessionId` - Validated remote session identity
//! - `MessageRequest` - What the caller wants delivered
//! - `SessionEvent` / `ClientStatus` - What subscribers observe
//! - `EventHub` - Broadcast + history fan-out
//! - Transport and settings traits

pub mod context;
pub mod event_hub;
pub mod events;
pub mod session_id;
pub mod traits;

pub use context::{Attachment, MessageId, MessageRequest, ModelSelection};
pub use event_hub::{EventHub, Subscription};
pub use events::{ClientStatus, ConnectionState, ErrorKind, SessionEvent};
pub use session_id::{InvalidSessionId, SessionId};
pub use traits::{
    Connector, Frame, FrameSink, FrameSource, Link, SettingsError, SettingsProvider,
    TransportError,
};
