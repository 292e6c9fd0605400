//! Shapes nested inside `claude-response` payloads.
//!
//! Only the parts the session client forwards are typed; everything else is
//! carried as opaque JSON.

use serde::Deserialize;
use serde_json::Value;

/// One streamed agent message.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeResponse {
    /// Session bootstrap (`subtype: "init"`).
    System {
        subtype: Option<String>,
        session_id: Option<String>,
        model: Option<String>,
    },
    /// Assistant turn: text, thinking and tool invocations.
    Assistant { message: ChatMessage },
    /// User turn echoed back, carrying tool results.
    User { message: ChatMessage },
    /// Final summary of a run.
    Result {
        subtype: Option<String>,
        #[serde(default)]
        is_error: bool,
        result: Option<String>,
        session_id: Option<String>,
    },
    /// Incremental streaming fragment.
    ContentBlockDelta { delta: Delta },
    #[serde(other)]
    Other,
}

/// Message body.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub content: MessageContent,
}

/// Message content: either plain text or a list of blocks.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Blocks(Vec::new())
    }
}

/// Content block.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: Option<String>,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: Option<String>,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

/// Streaming delta.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    #[serde(other)]
    Other,
}

/// Flatten tool result content to display text.
///
/// Content is either a string or a list of `{type: "text", text}` blocks.
#[must_use]
pub fn tool_result_text(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.as_str()),
                Value::Object(map) => map.get("text").and_then(Value::as_str),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}
