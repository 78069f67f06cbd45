//! Canonical conversation messages
//!
//! One message shape shared by all three backend adapters. Each adapter
//! converts this into its own wire format; nothing above the adapter layer
//! branches on backend identity.

use crate::tools::ToolCall;
use serde::{Deserialize, Serialize};

/// Role of a conversation message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// User turn
    User,
    /// Assistant turn (may carry tool-call requests)
    Assistant,
    /// Tool-result turn
    Tool,
}

impl Role {
    /// String form used by wire protocols and persistence.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// Result of one tool invocation, attached to a [`Role::Tool`] message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultBlock {
    /// Id of the tool call this result answers
    pub tool_call_id: String,
    /// Tool name (some protocols require it on the result)
    pub name: String,
    /// Result content, already rendered to text/JSON
    pub content: String,
    /// Whether the tool reported a failure
    #[serde(default)]
    pub is_error: bool,
}

/// Inline image attached to a user message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageContent {
    /// MIME type, e.g. `image/png`
    pub media_type: String,
    /// Base64-encoded image data
    pub data: String,
}

/// A message in canonical conversation form.
///
/// The system prompt is not a message; it travels separately on the stream
/// request because the native protocol treats it as a top-level field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Role of the sender
    pub role: Role,
    /// Text content (empty for pure tool-result turns)
    #[serde(default)]
    pub content: String,
    /// Tool calls requested by an assistant turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Tool results carried by a tool turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResultBlock>,
    /// Inline images (user turns only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageContent>,
}

impl Message {
    /// Create a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            images: Vec::new(),
        }
    }

    /// Create a user message with inline images.
    #[must_use]
    pub fn user_with_images(content: impl Into<String>, images: Vec<ImageContent>) -> Self {
        Self {
            images,
            ..Self::user(content)
        }
    }

    /// Create an assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            images: Vec::new(),
        }
    }

    /// Create an assistant message that requested tool calls.
    #[must_use]
    pub fn assistant_with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::assistant(content)
        }
    }

    /// Create a tool-result message.
    #[must_use]
    pub fn tool_results(results: Vec<ToolResultBlock>) -> Self {
        Self {
            role: Role::Tool,
            content: String::new(),
            tool_calls: Vec::new(),
            tool_results: results,
            images: Vec::new(),
        }
    }

    /// Rough character weight of this message, used for history budgeting.
    #[must_use]
    pub fn char_weight(&self) -> usize {
        self.content.len()
            + self
                .tool_results
                .iter()
                .map(|r| r.content.len())
                .sum::<usize>()
    }
}
