//! Consumer-facing state and events.

use std::fmt;

use serde::Serialize;

use crate::{MessageId, ModelSelection, SessionId};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport and no reconnection scheduled.
    #[default]
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Transport confirmed by an inbound frame.
    Connected,
    /// Recovering from an unexpected loss.
    Reconnecting {
        /// Grows without bound; only the backoff growth is capped.
        attempt: u32,
    },
}

impl ConnectionState {
    /// Whether outbound writes may be handed to the transport.
    #[must_use]
    pub const fn accepts_writes(self) -> bool {
        matches!(self, Self::Connected | Self::Connecting)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting({attempt})"),
        }
    }
}

/// Snapshot of the controller published after every handled input.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStatus {
    pub connection: ConnectionState,
    pub session_id: Option<SessionId>,
    /// A request is outstanding.
    pub processing: bool,
    /// An abort has been sent and is awaiting acknowledgment.
    pub aborting: bool,
    /// Messages waiting in the retry queue.
    pub queued: usize,
    pub model: Option<ModelSelection>,
}

/// Category of a reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The remote service reported an error.
    Remote,
    /// The service went silent while a request was outstanding.
    Timeout,
    /// An inbound frame could not be decoded. Non-fatal.
    Protocol,
}

/// Event delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Connection state changed.
    ConnectionChanged(ConnectionState),
    /// Debounced snapshot of the text streamed so far in the current segment.
    TextDelta(String),
    /// Finalized text segment, emitted before any non-text event and at the end
    /// of a response.
    TextCommitted(String),
    /// The agent invoked a tool. `args` is the input as compact JSON.
    ToolInvoked {
        id: Option<String>,
        name: String,
        args: String,
    },
    /// A tool produced output.
    ToolResult {
        tool_use_id: Option<String>,
        text: String,
        is_error: bool,
    },
    /// Reasoning text.
    Thinking(String),
    /// Context window usage.
    TokenBudget { used: u64, total: u64 },
    /// The message was handed to the transport.
    MessageDelivered(MessageId),
    /// The message exhausted its retries and was dropped.
    SendFailed { message_id: MessageId, error: String },
    /// The outstanding request finished.
    Completed { session_id: Option<SessionId> },
    /// Terminal or non-fatal failure.
    Error { kind: ErrorKind, message: String },
    /// The remote side created a session.
    SessionCreated(SessionId),
    /// A stale session was discarded; the next message starts a fresh one.
    SessionRecovered { previous: SessionId },
    /// The client attached to an existing session.
    SessionAttached(SessionId),
    /// An outstanding request was lost with the connection.
    Interrupted,
    /// The outstanding request was aborted.
    Aborted,
    /// The active model changed.
    ModelChanged { model: String, model_id: String },
}

impl SessionEvent {
    /// Rough payload size, used to bound history.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        const OVERHEAD: usize = 16;
        let payload = match self {
            Self::TextDelta(s) | Self::TextCommitted(s) | Self::Thinking(s) => s.len(),
            Self::ToolInvoked { name, args, .. } => name.len() + args.len(),
            Self::ToolResult { text, .. } => text.len(),
            Self::Error { message, .. } => message.len(),
            Self::SendFailed { error, .. } => error.len(),
            _ => 0,
        };
        payload + OVERHEAD
    }

    /// Whether this event ends the outstanding request.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. }
                | Self::Aborted
                | Self::Interrupted
                | Self::SessionRecovered { .. }
                | Self::Error {
                    kind: ErrorKind::Remote | ErrorKind::Timeout,
                    ..
                }
        )
    }
}
