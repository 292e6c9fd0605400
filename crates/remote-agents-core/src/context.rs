//! Outbound request context.

use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one queued outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Mint a fresh id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Binary attachment carried with a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// MIME type, e.g. `image/png`.
    pub media_type: String,
    /// Base64 (standard alphabet) payload.
    pub data: String,
}

impl Attachment {
    /// Create an attachment from raw bytes.
    #[must_use]
    pub fn from_bytes(media_type: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            media_type: media_type.into(),
            data: BASE64.encode(bytes),
        }
    }

    /// Decode the payload back to bytes.
    #[must_use]
    pub fn decode(&self) -> Option<Vec<u8>> {
        BASE64.decode(&self.data).ok()
    }
}

/// Model the remote agent should run with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSelection {
    /// Display name, e.g. `sonnet`.
    pub name: String,
    /// Identifier sent to the remote service as the model hint.
    pub model_id: String,
}

impl ModelSelection {
    /// Create a new selection.
    #[must_use]
    pub fn new(name: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model_id: model_id.into(),
        }
    }
}

/// A message the caller wants delivered to the remote agent.
///
/// The `session_id` override is kept raw: it is validated when the envelope
/// is built, and dropped if it is not a canonical UUID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageRequest {
    /// Prompt text.
    pub payload: String,
    /// Target context on the remote side (usually a project path).
    pub context: String,
    /// Explicit session to resume instead of the current one.
    pub session_id: Option<String>,
    /// Permission / execution mode.
    pub mode: Option<String>,
    /// Attachments sent alongside the prompt.
    pub attachments: Vec<Attachment>,
    /// Model override for this message only.
    pub model_hint: Option<String>,
}

impl MessageRequest {
    /// Create a request for a prompt in the given context.
    #[must_use]
    pub fn new(payload: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            context: context.into(),
            ..Self::default()
        }
    }

    /// Resume a specific session.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the execution mode.
    #[must_use]
    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    /// Add an attachment.
    #[must_use]
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Override the model for this message.
    #[must_use]
    pub fn with_model_hint(mut self, model: impl Into<String>) -> Self {
        self.model_hint = Some(model.into());
        self
    }
}
