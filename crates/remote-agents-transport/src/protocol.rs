//! Wire protocol for client-server communication.
//!
//! Everything above this module deals in [`OutboundEnvelope`] and
//! [`ServerEvent`]; the JSON shape stays here.

use remote_agents_core::{Attachment, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::claude::ClaudeResponse;

/// Provider tag carried by abort requests.
pub const PROVIDER: &str = "claude";

/// Codec error when decoding an inbound frame.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("`{kind}` envelope is missing `{field}`")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
    #[error("Malformed `{kind}` payload: {source}")]
    Payload {
        kind: &'static str,
        source: serde_json::Error,
    },
}

/// Codec error when encoding an outbound envelope.
#[derive(Debug, thiserror::Error)]
#[error("Failed to encode envelope: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

/// Options attached to a command.
///
/// Absent values serialize as `null`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOptions {
    pub context: String,
    pub session_id: Option<SessionId>,
    pub model_hint: Option<String>,
    pub mode: Option<String>,
    pub attachments: Option<Vec<Attachment>>,
}

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum OutboundEnvelope {
    /// Run a prompt.
    #[serde(rename = "command")]
    Command {
        payload: String,
        options: CommandOptions,
    },
    /// Stop the running request of a session.
    #[serde(rename = "abort-session", rename_all = "camelCase")]
    AbortSession {
        session_id: SessionId,
        provider: &'static str,
    },
}

impl OutboundEnvelope {
    /// Build a command envelope.
    #[must_use]
    pub fn command(payload: impl Into<String>, options: CommandOptions) -> Self {
        Self::Command {
            payload: payload.into(),
            options,
        }
    }

    /// Build an abort envelope.
    #[must_use]
    pub const fn abort(session_id: SessionId) -> Self {
        Self::AbortSession {
            session_id,
            provider: PROVIDER,
        }
    }

    /// Serialize to the wire format.
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn encode(&self) -> Result<String, EncodeError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Generic inbound envelope as it appears on the wire.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    exit_code: Option<i64>,
    #[serde(default)]
    is_new_session: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct TokenBudget {
    used: u64,
    total: u64,
}

/// Decoded message from server to client.
///
/// Session ids are passed through raw; validation happens where they are
/// adopted.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    SessionCreated {
        session_id: Option<String>,
    },
    ClaudeResponse {
        session_id: Option<String>,
        response: ClaudeResponse,
    },
    TokenBudget {
        session_id: Option<String>,
        used: u64,
        total: u64,
    },
    ClaudeComplete {
        session_id: Option<String>,
        exit_code: Option<i64>,
        is_new_session: bool,
    },
    ClaudeError {
        session_id: Option<String>,
        error: String,
    },
    SessionAborted {
        session_id: Option<String>,
    },
    /// Project list changed. Not consumed by the session client.
    ProjectsUpdated,
    /// Envelope type this client does not know.
    Unknown(String),
}

impl ServerEvent {
    /// Session the event belongs to, if the server tagged it.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionCreated { session_id }
            | Self::ClaudeResponse { session_id, .. }
            | Self::TokenBudget { session_id, .. }
            | Self::ClaudeComplete { session_id, .. }
            | Self::ClaudeError { session_id, .. }
            | Self::SessionAborted { session_id } => session_id.as_deref(),
            Self::ProjectsUpdated | Self::Unknown(_) => None,
        }
    }
}

/// Decode one inbound text frame.
///
/// # Errors
/// Returns error if the frame is not a well-formed envelope of a known type.
pub fn decode(text: &str) -> Result<ServerEvent, DecodeError> {
    let envelope: InboundEnvelope = serde_json::from_str(text)?;
    let session_id = envelope.session_id.filter(|s| !s.is_empty());

    let event = match envelope.kind.as_str() {
        "session-created" => ServerEvent::SessionCreated { session_id },
        "claude-response" => {
            let data = envelope.data.ok_or(DecodeError::MissingField {
                kind: "claude-response",
                field: "data",
            })?;
            let response = serde_json::from_value(data).map_err(|source| DecodeError::Payload {
                kind: "claude-response",
                source,
            })?;
            ServerEvent::ClaudeResponse {
                session_id,
                response,
            }
        }
        "token-budget" => {
            let data = envelope.data.ok_or(DecodeError::MissingField {
                kind: "token-budget",
                field: "data",
            })?;
            let budget: TokenBudget =
                serde_json::from_value(data).map_err(|source| DecodeError::Payload {
                    kind: "token-budget",
                    source,
                })?;
            ServerEvent::TokenBudget {
                session_id,
                used: budget.used,
                total: budget.total,
            }
        }
        "claude-complete" => ServerEvent::ClaudeComplete {
            session_id,
            exit_code: envelope.exit_code,
            is_new_session: envelope.is_new_session.unwrap_or(false),
        },
        "claude-error" => ServerEvent::ClaudeError {
            session_id,
            error: envelope.error.map(error_text).unwrap_or_default(),
        },
        "session-aborted" => ServerEvent::SessionAborted { session_id },
        "projects_updated" => ServerEvent::ProjectsUpdated,
        other => ServerEvent::Unknown(other.to_owned()),
    };
    Ok(event)
}

fn error_text(error: Value) -> String {
    match error {
        Value::String(s) => s,
        Value::Object(ref map) => map
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| error.to_string(), str::to_owned),
        other => other.to_string(),
    }
}
