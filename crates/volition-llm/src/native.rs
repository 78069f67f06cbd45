//! Native backend - structured content-block protocol
//!
//! Speaks the native streaming protocol over SSE. Content travels as typed
//! blocks (`text`, `tool_use`, `tool_result`) and the system prompt may be
//! split into a cacheable static block plus a dynamic block.

use crate::backend::{Backend, BackendKind, StreamRequest, SystemPrompt, TextSink};
use crate::error::{Error, Result};
use crate::message::{Message, Role};
use crate::result::{CanonicalResult, StopSignal, Usage};
use crate::tools::{ToolCall, ToolDefinition};
use crate::util::{condense_http_error, mask_api_key, SseFramer};
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Protocol version header value
const API_VERSION: &str = "2023-06-01";

/// Default API base URL
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct NativeRequest {
    model: String,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<serde_json::Value>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Vec<WireBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum WireBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: ImageSource },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

#[derive(Debug, Serialize)]
struct ImageSource {
    r#type: &'static str,
    media_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    r#type: String,
    #[serde(default)]
    message: Option<EventMessage>,
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    content_block: Option<EventBlock>,
    #[serde(default)]
    delta: Option<EventDelta>,
    #[serde(default)]
    usage: Option<EventUsage>,
    #[serde(default)]
    error: Option<EventError>,
}

#[derive(Debug, Deserialize)]
struct EventMessage {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<EventUsage>,
}

#[derive(Debug, Deserialize)]
struct EventBlock {
    r#type: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventDelta {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    partial_json: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EventUsage {
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
    #[serde(default)]
    cache_read_input_tokens: Option<u32>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct EventError {
    r#type: String,
    message: String,
}

// ============================================================================
// Config
// ============================================================================

/// Native backend configuration
#[derive(Clone)]
pub struct NativeConfig {
    /// API key
    pub api_key: String,
    /// Base URL
    pub base_url: String,
    /// Request timeout
    pub timeout: Duration,
}

// Custom Debug to keep the key out of logs
impl fmt::Debug for NativeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeConfig")
            .field("api_key", &mask_api_key(&self.api_key))
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl NativeConfig {
    /// Create a configuration with an API key.
    #[must_use]
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(120),
        }
    }

    /// Create configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| Error::NotConfigured("ANTHROPIC_API_KEY not set".to_string()))?;
        let base_url =
            std::env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Ok(Self {
            api_key,
            base_url,
            timeout: Duration::from_secs(120),
        })
    }

    /// Set the base URL.
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Native-protocol backend adapter
pub struct NativeBackend {
    client: Client,
    config: NativeConfig,
}

impl NativeBackend {
    /// Create a new adapter.
    pub fn new(config: NativeConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(NativeConfig::from_env()?)
    }

    /// Build the system field: plain string, or a block array with
    /// `cache_control` on the static block.
    fn convert_system(system: &SystemPrompt) -> Option<serde_json::Value> {
        match system {
            SystemPrompt::Plain(s) if s.is_empty() => None,
            SystemPrompt::Plain(s) => Some(serde_json::Value::String(s.clone())),
            SystemPrompt::Cached {
                static_part,
                dynamic_part,
            } => {
                let mut blocks = vec![serde_json::json!({
                    "type": "text",
                    "text": static_part,
                    "cache_control": {"type": "ephemeral"},
                })];
                if !dynamic_part.is_empty() {
                    blocks.push(serde_json::json!({"type": "text", "text": dynamic_part}));
                }
                Some(serde_json::Value::Array(blocks))
            }
        }
    }

    fn convert_messages(messages: &[Message]) -> Vec<WireMessage> {
        let mut wire = Vec::with_capacity(messages.len());
        for msg in messages {
            match msg.role {
                Role::User => {
                    let mut blocks = Vec::new();
                    for image in &msg.images {
                        blocks.push(WireBlock::Image {
                            source: ImageSource {
                                r#type: "base64",
                                media_type: image.media_type.clone(),
                                data: image.data.clone(),
                            },
                        });
                    }
                    if !msg.content.is_empty() || blocks.is_empty() {
                        blocks.push(WireBlock::Text {
                            text: msg.content.clone(),
                        });
                    }
                    wire.push(WireMessage {
                        role: "user",
                        content: blocks,
                    });
                }
                Role::Assistant => {
                    let mut blocks = Vec::new();
                    if !msg.content.is_empty() {
                        blocks.push(WireBlock::Text {
                            text: msg.content.clone(),
                        });
                    }
                    for call in &msg.tool_calls {
                        blocks.push(WireBlock::ToolUse {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            input: call.input.clone(),
                        });
                    }
                    wire.push(WireMessage {
                        role: "assistant",
                        content: blocks,
                    });
                }
                // Tool results ride in a user turn on this protocol
                Role::Tool => {
                    let blocks = msg
                        .tool_results
                        .iter()
                        .map(|r| WireBlock::ToolResult {
                            tool_use_id: r.tool_call_id.clone(),
                            content: r.content.clone(),
                            is_error: r.is_error.then_some(true),
                        })
                        .collect();
                    wire.push(WireMessage {
                        role: "user",
                        content: blocks,
                    });
                }
            }
        }
        wire
    }

    fn convert_tools(tools: &[ToolDefinition]) -> Vec<WireTool> {
        tools
            .iter()
            .map(|t| WireTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.parameters.clone(),
            })
            .collect()
    }
}

/// In-flight tool_use block being assembled from `input_json_delta` fragments.
struct PendingToolUse {
    id: String,
    name: String,
    json: String,
}

#[async_trait::async_trait]
impl Backend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn supports_vision(&self) -> bool {
        true
    }

    #[instrument(skip(self, request, sink), fields(model = %request.model))]
    async fn stream(
        &self,
        request: StreamRequest,
        sink: &mut dyn TextSink,
    ) -> Result<CanonicalResult> {
        let url = format!("{}/v1/messages", self.config.base_url);

        let tool_choice = if request.tools.is_empty() {
            None
        } else if request.force_tool_use {
            Some(serde_json::json!({"type": "any"}))
        } else {
            Some(serde_json::json!({"type": "auto"}))
        };

        let wire_request = NativeRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens,
            stream: true,
            system: Self::convert_system(&request.system),
            messages: Self::convert_messages(&request.messages),
            tools: (!request.tools.is_empty()).then(|| Self::convert_tools(&request.tools)),
            tool_choice,
        };

        debug!(url = %url, "Opening native stream");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&wire_request)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 {
                return Err(Error::RateLimit);
            }
            return Err(Error::Api(condense_http_error(status.as_u16(), &body)));
        }

        let mut usage = Usage::default();
        let mut model = request.model.clone();
        let mut text = String::new();
        let mut stop = StopSignal::EndTurn;
        let mut pending: BTreeMap<usize, PendingToolUse> = BTreeMap::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();

        let mut framer = SseFramer::new();
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| Error::Network(e.to_string()))?;
            for payload in framer.push(&chunk) {
                let event: StreamEvent = match serde_json::from_str(&payload) {
                    Ok(e) => e,
                    Err(e) => {
                        return Err(Error::InvalidResponse(format!("bad stream event: {e}")));
                    }
                };

                match event.r#type.as_str() {
                    "message_start" => {
                        if let Some(m) = event.message {
                            if let Some(name) = m.model {
                                model = name;
                            }
                            if let Some(u) = m.usage {
                                usage.input_tokens = u.input_tokens.unwrap_or(0);
                                usage.cache_read_tokens = u.cache_read_input_tokens;
                                usage.cache_write_tokens = u.cache_creation_input_tokens;
                            }
                        }
                    }
                    "content_block_start" => {
                        if let (Some(index), Some(block)) = (event.index, event.content_block) {
                            if block.r#type == "tool_use" {
                                pending.insert(
                                    index,
                                    PendingToolUse {
                                        id: block.id.unwrap_or_default(),
                                        name: block.name.unwrap_or_default(),
                                        json: String::new(),
                                    },
                                );
                            }
                        }
                    }
                    "content_block_delta" => {
                        if let Some(delta) = event.delta {
                            if let Some(t) = delta.text {
                                sink.text_delta(&t);
                                text.push_str(&t);
                            }
                            if let (Some(index), Some(fragment)) =
                                (event.index, delta.partial_json)
                            {
                                if let Some(p) = pending.get_mut(&index) {
                                    p.json.push_str(&fragment);
                                }
                            }
                        }
                    }
                    "content_block_stop" => {
                        if let Some(index) = event.index {
                            if let Some(p) = pending.remove(&index) {
                                let input = if p.json.trim().is_empty() {
                                    serde_json::json!({})
                                } else {
                                    serde_json::from_str(&p.json).map_err(|e| {
                                        Error::InvalidResponse(format!(
                                            "tool input for '{}' is not valid JSON: {e}",
                                            p.name
                                        ))
                                    })?
                                };
                                tool_calls.push(ToolCall {
                                    id: p.id,
                                    name: p.name,
                                    input,
                                });
                            }
                        }
                    }
                    "message_delta" => {
                        if let Some(delta) = &event.delta {
                            if delta.stop_reason.as_deref() == Some("tool_use") {
                                stop = StopSignal::ToolUse;
                            }
                        }
                        if let Some(u) = event.usage {
                            if let Some(out) = u.output_tokens {
                                usage.output_tokens = out;
                            }
                        }
                    }
                    "error" => {
                        let e = event.error.map_or_else(
                            || "unknown stream error".to_string(),
                            |e| format!("{}: {}", e.r#type, e.message),
                        );
                        return Err(Error::Api(crate::util::truncate_safe(&e, 300).to_string()));
                    }
                    "message_stop" | "ping" => {}
                    other => {
                        debug!(event = other, "Ignoring stream event");
                    }
                }
            }
        }

        // A stream that ends with unterminated tool blocks was cut short
        if !pending.is_empty() {
            warn!(
                pending = pending.len(),
                "Stream ended with unterminated tool_use blocks"
            );
        }

        Ok(CanonicalResult {
            text,
            tool_calls,
            usage,
            stop,
            model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolResultBlock;

    #[test]
    fn config_debug_masks_key() {
        let config = NativeConfig::new("sk-ant-1234567890abcdef");
        let debug_str = format!("{config:?}");
        assert!(!debug_str.contains("1234567890"));
        assert!(debug_str.contains("..."));
    }

    #[test]
    fn cached_system_gets_cache_control() {
        let system = SystemPrompt::Cached {
            static_part: "persona".into(),
            dynamic_part: "today".into(),
        };
        let value = NativeBackend::convert_system(&system).unwrap();
        let blocks = value.as_array().unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].get("cache_control").is_some());
        assert!(blocks[1].get("cache_control").is_none());
    }

    #[test]
    fn tool_results_ride_in_user_turn() {
        let messages = vec![Message::tool_results(vec![ToolResultBlock {
            tool_call_id: "t1".into(),
            name: "search".into(),
            content: "{}".into(),
            is_error: false,
        }])];
        let wire = NativeBackend::convert_messages(&messages);
        assert_eq!(wire.len(), 1);
        assert_eq!(wire[0].role, "user");
    }

    #[test]
    fn assistant_tool_calls_become_tool_use_blocks() {
        let messages = vec![Message::assistant_with_tool_calls(
            "checking",
            vec![ToolCall {
                id: "t1".into(),
                name: "web_search".into(),
                input: serde_json::json!({"query": "weather"}),
            }],
        )];
        let wire = NativeBackend::convert_messages(&messages);
        assert_eq!(wire[0].content.len(), 2);
        assert!(matches!(wire[0].content[1], WireBlock::ToolUse { .. }));
    }

    #[test]
    fn images_become_image_blocks() {
        let messages = vec![Message::user_with_images(
            "what is this",
            vec![crate::ImageContent {
                media_type: "image/png".into(),
                data: "aGk=".into(),
            }],
        )];
        let wire = NativeBackend::convert_messages(&messages);
        assert!(matches!(wire[0].content[0], WireBlock::Image { .. }));
        assert!(matches!(wire[0].content[1], WireBlock::Text { .. }));
    }
}
