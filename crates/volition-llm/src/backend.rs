//! Backend adapter contract
//!
//! Three adapters share one trait; the runtime picks an adapter by
//! [`BackendKind`] and never branches on backend identity afterwards.

use crate::message::Message;
use crate::result::CanonicalResult;
use crate::tools::ToolDefinition;
use crate::Result;
use serde::{Deserialize, Serialize};

/// Which wire protocol a backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Native structured-block protocol
    Native,
    /// OpenAI-compatible proxy gateway
    Compat,
    /// Local open-weight server with line-delimited streaming
    Local,
}

impl BackendKind {
    /// String form used in routes and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Compat => "compat",
            Self::Local => "local",
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "native" => Ok(Self::Native),
            "compat" => Ok(Self::Compat),
            "local" => Ok(Self::Local),
            other => Err(crate::Error::NotConfigured(format!(
                "unknown backend: {other}"
            ))),
        }
    }
}

/// System prompt, plain or split for prompt caching.
///
/// The two-block form is only meaningful on the native backend; the other
/// adapters join the blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SystemPrompt {
    /// A single system prompt string
    Plain(String),
    /// Static block (cacheable) + dynamic block (changes every turn)
    Cached {
        /// Stable prefix marked for provider-side caching
        static_part: String,
        /// Per-turn suffix (memory context, date, etc.)
        dynamic_part: String,
    },
}

impl SystemPrompt {
    /// Flatten to a single string for backends without caching support.
    #[must_use]
    pub fn joined(&self) -> String {
        match self {
            Self::Plain(s) => s.clone(),
            Self::Cached {
                static_part,
                dynamic_part,
            } => {
                if dynamic_part.is_empty() {
                    static_part.clone()
                } else {
                    format!("{static_part}\n\n{dynamic_part}")
                }
            }
        }
    }
}

/// One streamed backend call.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    /// Model id, in the backend's own naming scheme
    pub model: String,
    /// System prompt
    pub system: SystemPrompt,
    /// Conversation in canonical form
    pub messages: Vec<Message>,
    /// Tools advertised to the model (empty disables tool calling)
    pub tools: Vec<ToolDefinition>,
    /// Force the model to call some tool this round
    pub force_tool_use: bool,
    /// Max tokens to generate
    pub max_tokens: u32,
}

impl StreamRequest {
    /// Create a request with defaults suitable for a chat turn.
    #[must_use]
    pub fn new(model: impl Into<String>, system: SystemPrompt, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            system,
            messages,
            tools: Vec::new(),
            force_tool_use: false,
            max_tokens: 4096,
        }
    }

    /// Advertise tools on this request.
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    /// Set the generation budget.
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Sink for incremental text deltas.
///
/// The suspension points of a turn are exactly the network reads; deltas are
/// delivered synchronously between them.
pub trait TextSink: Send {
    /// Called for each text fragment as it arrives.
    fn text_delta(&mut self, delta: &str);
}

impl<F: FnMut(&str) + Send> TextSink for F {
    fn text_delta(&mut self, delta: &str) {
        self(delta);
    }
}

/// A sink that discards deltas (batch callers).
#[derive(Debug, Default)]
pub struct NullSink;

impl TextSink for NullSink {
    fn text_delta(&mut self, _delta: &str) {}
}

/// Backend adapter contract shared by all three protocols.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Which protocol this adapter speaks.
    fn kind(&self) -> BackendKind;

    /// Whether the backend accepts inline images.
    fn supports_vision(&self) -> bool;

    /// Stream one model call, emitting text deltas into `sink` and returning
    /// the canonical result once the stream ends.
    async fn stream(
        &self,
        request: StreamRequest,
        sink: &mut dyn TextSink,
    ) -> Result<CanonicalResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_round_trip() {
        for kind in [BackendKind::Native, BackendKind::Compat, BackendKind::Local] {
            assert_eq!(kind.as_str().parse::<BackendKind>().unwrap(), kind);
        }
        assert!("vertex".parse::<BackendKind>().is_err());
    }

    #[test]
    fn cached_prompt_joins_blocks() {
        let p = SystemPrompt::Cached {
            static_part: "You are Joi.".into(),
            dynamic_part: "Today is Friday.".into(),
        };
        assert_eq!(p.joined(), "You are Joi.\n\nToday is Friday.");

        let empty_dynamic = SystemPrompt::Cached {
            static_part: "You are Joi.".into(),
            dynamic_part: String::new(),
        };
        assert_eq!(empty_dynamic.joined(), "You are Joi.");
    }
}
