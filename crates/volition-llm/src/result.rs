//! Canonical model-call result
//!
//! Every adapter reduces its wire protocol to this one shape; callers above
//! the adapter layer never see backend-specific response types.

use crate::tools::ToolCall;
use serde::{Deserialize, Serialize};

/// Why the model stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopSignal {
    /// The model requested one or more tool calls
    ToolUse,
    /// The model finished its turn
    EndTurn,
}

/// Token usage for one backend call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Input (prompt) tokens
    pub input_tokens: u32,
    /// Output (completion) tokens
    pub output_tokens: u32,
    /// Tokens served from prompt cache, when the backend reports it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u32>,
    /// Tokens written to prompt cache, when the backend reports it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_write_tokens: Option<u32>,
}

impl Usage {
    /// Sum of input and output tokens.
    #[must_use]
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Canonical result of one streamed backend call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalResult {
    /// Accumulated text
    pub text: String,
    /// Structured tool-call requests
    pub tool_calls: Vec<ToolCall>,
    /// Token usage
    pub usage: Usage,
    /// Stop signal
    pub stop: StopSignal,
    /// Model that produced the result, as echoed by the backend
    pub model: String,
}

impl CanonicalResult {
    /// A text-only end-of-turn result (used by tests and the mock backend).
    #[must_use]
    pub fn text_only(text: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
            usage: Usage::default(),
            stop: StopSignal::EndTurn,
            model: model.into(),
        }
    }

    /// Whether the model asked for tools this round.
    #[must_use]
    pub fn wants_tools(&self) -> bool {
        self.stop == StopSignal::ToolUse && !self.tool_calls.is_empty()
    }
}
