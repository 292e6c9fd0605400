//! Seams to the transport and to the settings owner.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use url::Url;

/// One message-level unit on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping(Bytes),
    Pong(Bytes),
    Close,
}

/// Transport error.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Connect failed: {0}")]
    Connect(String),
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Receive failed: {0}")]
    Receive(String),
    #[error("Connection closed")]
    Closed,
}

/// Settings error.
#[derive(Debug, Clone, Error)]
pub enum SettingsError {
    #[error("Invalid endpoint URL: {0}")]
    InvalidEndpoint(String),
    #[error("Unsupported endpoint scheme: {0}")]
    UnsupportedScheme(String),
}

/// Write half of an established connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Hand a frame to the transport. `Ok` means the bytes were accepted.
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self);
}

/// Read half of an established connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Next inbound frame; `None` once the peer is gone.
    async fn next(&mut self) -> Option<Result<Frame, TransportError>>;
}

/// Both halves of a freshly dialed connection.
pub type Link = (Box<dyn FrameSink>, Box<dyn FrameSource>);

/// Dials the remote execution service.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a connection to `endpoint`, attaching `bearer` as the credential
    /// when present.
    async fn connect(&self, endpoint: &Url, bearer: Option<&str>) -> Result<Link, TransportError>;
}

/// Read-only view of user settings the client depends on.
///
/// Values are re-read on every connect and every watchdog arm, so the owner
/// may change them at runtime.
pub trait SettingsProvider: Send + Sync {
    /// Resolved websocket endpoint.
    ///
    /// # Errors
    /// Returns error if the configured URL cannot be resolved.
    fn endpoint(&self) -> Result<Url, SettingsError>;

    /// Silence allowed while a request is outstanding.
    fn processing_timeout(&self) -> Duration;

    /// Bearer credential, if any.
    fn auth_token(&self) -> Option<String>;
}
