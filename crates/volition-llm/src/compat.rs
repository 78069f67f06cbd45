//! Compat backend - chat-completions protocol via an aggregation proxy
//!
//! Speaks the widely-implemented chat-completions dialect. Tool calls arrive
//! as argument fragments spread across stream chunks and are reassembled
//! keyed by index before parsing.

use crate::backend::{Backend, BackendKind, StreamRequest, TextSink};
use crate::error::{Error, Result};
use crate::message::{Message, Role};
use crate::result::{CanonicalResult, StopSignal, Usage};
use crate::tools::{ToolCall, ToolDefinition};
use crate::util::{condense_http_error, mask_api_key, SseFramer};
use futures::StreamExt;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Default proxy base URL
const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api";

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct CompatRequest {
    model: String,
    max_tokens: u32,
    stream: bool,
    stream_options: StreamOptions,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireToolCall {
    id: String,
    r#type: &'static str,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    /// Arguments travel as a JSON string on this protocol
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    r#type: &'static str,
    function: WireToolDef,
}

#[derive(Debug, Serialize)]
struct WireToolDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Option<Delta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<DeltaToolCall>>,
}

#[derive(Debug, Deserialize)]
struct DeltaToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<DeltaFunction>,
}

#[derive(Debug, Deserialize)]
struct DeltaFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkUsage {
    #[serde(default)]
    prompt_tokens: Option<u32>,
    #[serde(default)]
    completion_tokens: Option<u32>,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: Option<u32>,
}

// ============================================================================
// Tool-call fragment accumulation
// ============================================================================

/// Reassembles streamed tool-call argument fragments keyed by index.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    slots: Vec<AccumulatorSlot>,
}

#[derive(Debug, Default)]
struct AccumulatorSlot {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAccumulator {
    fn absorb(&mut self, delta: &DeltaToolCall) {
        while self.slots.len() <= delta.index {
            self.slots.push(AccumulatorSlot::default());
        }
        let slot = &mut self.slots[delta.index];
        if let Some(id) = &delta.id {
            if !id.is_empty() {
                slot.id = id.clone();
            }
        }
        if let Some(function) = &delta.function {
            if let Some(name) = &function.name {
                slot.name.push_str(name);
            }
            if let Some(arguments) = &function.arguments {
                slot.arguments.push_str(arguments);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn finish(self) -> Result<Vec<ToolCall>> {
        let mut calls = Vec::with_capacity(self.slots.len());
        for (i, slot) in self.slots.into_iter().enumerate() {
            if slot.name.is_empty() {
                continue;
            }
            let input = if slot.arguments.trim().is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(&slot.arguments).map_err(|e| {
                    Error::InvalidResponse(format!(
                        "tool arguments for '{}' did not reassemble to valid JSON: {e}",
                        slot.name
                    ))
                })?
            };
            let id = if slot.id.is_empty() {
                format!("call_{i}")
            } else {
                slot.id
            };
            calls.push(ToolCall {
                id,
                name: slot.name,
                input,
            });
        }
        Ok(calls)
    }
}

/// Heuristic for models that emit function-call syntax as plain text instead
/// of structured tool calls.
fn looks_like_pseudo_tool_call(text: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        Regex::new(r#"(?:<tool_call>|"name"\s*:\s*"[a-z][a-z0-9_]*"\s*,\s*"arguments"|\b[a-z][a-z0-9_]+\(\s*\{)"#)
            .ok()
    });
    re.as_ref().is_some_and(|re| re.is_match(text))
}

// ============================================================================
// Config
// ============================================================================

/// Compat backend configuration
#[derive(Clone)]
pub struct CompatConfig {
    /// API key
    pub api_key: String,
    /// Base URL
    pub base_url: String,
    /// Request timeout
    pub timeout: Duration,
}

impl fmt::Debug for CompatConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompatConfig")
            .field("api_key", &mask_api_key(&self.api_key))
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl CompatConfig {
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
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| Error::NotConfigured("OPENROUTER_API_KEY not set".to_string()))?;
        let base_url =
            std::env::var("OPENROUTER_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
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
}

/// Chat-completions backend adapter
pub struct CompatBackend {
    client: Client,
    config: CompatConfig,
}

impl CompatBackend {
    /// Create a new adapter.
    pub fn new(config: CompatConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(CompatConfig::from_env()?)
    }

    /// Flatten the canonical thread into chat-completions messages.
    ///
    /// Proxied models reject `tool` messages whose id was never announced by
    /// a preceding assistant turn, so orphaned results are dropped with a
    /// warning rather than poisoning the whole request.
    fn convert_messages(system: &str, messages: &[Message]) -> Vec<WireMessage> {
        let mut wire = Vec::with_capacity(messages.len() + 1);
        if !system.is_empty() {
            wire.push(WireMessage {
                role: "system",
                content: Some(serde_json::Value::String(system.to_string())),
                tool_calls: None,
                tool_call_id: None,
            });
        }

        let mut known_ids: HashSet<String> = HashSet::new();
        for msg in messages {
            match msg.role {
                Role::User => {
                    let content = if msg.images.is_empty() {
                        serde_json::Value::String(msg.content.clone())
                    } else {
                        let mut parts = vec![serde_json::json!({
                            "type": "text",
                            "text": msg.content,
                        })];
                        for image in &msg.images {
                            parts.push(serde_json::json!({
                                "type": "image_url",
                                "image_url": {
                                    "url": format!(
                                        "data:{};base64,{}",
                                        image.media_type, image.data
                                    ),
                                },
                            }));
                        }
                        serde_json::Value::Array(parts)
                    };
                    wire.push(WireMessage {
                        role: "user",
                        content: Some(content),
                        tool_calls: None,
                        tool_call_id: None,
                    });
                }
                Role::Assistant => {
                    let tool_calls = if msg.tool_calls.is_empty() {
                        None
                    } else {
                        Some(
                            msg.tool_calls
                                .iter()
                                .map(|c| {
                                    known_ids.insert(c.id.clone());
                                    WireToolCall {
                                        id: c.id.clone(),
                                        r#type: "function",
                                        function: WireFunction {
                                            name: c.name.clone(),
                                            arguments: c.input.to_string(),
                                        },
                                    }
                                })
                                .collect(),
                        )
                    };
                    wire.push(WireMessage {
                        role: "assistant",
                        content: (!msg.content.is_empty())
                            .then(|| serde_json::Value::String(msg.content.clone())),
                        tool_calls,
                        tool_call_id: None,
                    });
                }
                Role::Tool => {
                    for result in &msg.tool_results {
                        if !known_ids.contains(&result.tool_call_id) {
                            warn!(
                                tool_call_id = %result.tool_call_id,
                                tool = %result.name,
                                "Skipping orphaned tool result with no matching assistant call"
                            );
                            continue;
                        }
                        wire.push(WireMessage {
                            role: "tool",
                            content: Some(serde_json::Value::String(result.content.clone())),
                            tool_calls: None,
                            tool_call_id: Some(result.tool_call_id.clone()),
                        });
                    }
                }
            }
        }
        wire
    }

    fn convert_tools(tools: &[ToolDefinition]) -> Vec<WireTool> {
        tools
            .iter()
            .map(|t| WireTool {
                r#type: "function",
                function: WireToolDef {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl Backend for CompatBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Compat
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
        let url = format!("{}/v1/chat/completions", self.config.base_url);
        let had_tools = !request.tools.is_empty();

        let wire_request = CompatRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens,
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
            messages: Self::convert_messages(&request.system.joined(), &request.messages),
            tools: had_tools.then(|| Self::convert_tools(&request.tools)),
            tool_choice: if !had_tools {
                None
            } else if request.force_tool_use {
                Some("required")
            } else {
                Some("auto")
            },
        };

        debug!(url = %url, "Opening compat stream");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
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
        let mut accumulator = ToolCallAccumulator::default();

        let mut framer = SseFramer::new();
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| Error::Network(e.to_string()))?;
            for payload in framer.push(&chunk) {
                if payload == "[DONE]" {
                    continue;
                }
                let parsed: StreamChunk = match serde_json::from_str(&payload) {
                    Ok(c) => c,
                    Err(e) => {
                        return Err(Error::InvalidResponse(format!("bad stream chunk: {e}")));
                    }
                };

                if let Some(name) = parsed.model {
                    model = name;
                }
                if let Some(u) = parsed.usage {
                    if let Some(prompt) = u.prompt_tokens {
                        usage.input_tokens = prompt;
                    }
                    if let Some(completion) = u.completion_tokens {
                        usage.output_tokens = completion;
                    }
                    if let Some(details) = u.prompt_tokens_details {
                        usage.cache_read_tokens = details.cached_tokens;
                    }
                }

                for choice in parsed.choices {
                    if let Some(delta) = choice.delta {
                        if let Some(content) = delta.content {
                            if !content.is_empty() {
                                sink.text_delta(&content);
                                text.push_str(&content);
                            }
                        }
                        if let Some(calls) = delta.tool_calls {
                            for call in &calls {
                                accumulator.absorb(call);
                            }
                        }
                    }
                    if choice.finish_reason.as_deref() == Some("tool_calls") {
                        stop = StopSignal::ToolUse;
                    }
                }
            }
        }

        let tool_calls = if accumulator.is_empty() {
            Vec::new()
        } else {
            stop = StopSignal::ToolUse;
            accumulator.finish()?
        };

        if had_tools && tool_calls.is_empty() && looks_like_pseudo_tool_call(&text) {
            warn!(
                model = %model,
                "Response text resembles a function call but no structured tool calls arrived"
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
    fn accumulator_reassembles_fragments() {
        let mut acc = ToolCallAccumulator::default();
        acc.absorb(&DeltaToolCall {
            index: 0,
            id: Some("call_abc".into()),
            function: Some(DeltaFunction {
                name: Some("web_search".into()),
                arguments: Some("{\"query\":".into()),
            }),
        });
        acc.absorb(&DeltaToolCall {
            index: 0,
            id: None,
            function: Some(DeltaFunction {
                name: None,
                arguments: Some("\"weather\"}".into()),
            }),
        });
        let calls = acc.finish().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_abc");
        assert_eq!(calls[0].name, "web_search");
        assert_eq!(calls[0].input["query"], "weather");
    }

    #[test]
    fn accumulator_handles_interleaved_indices() {
        let mut acc = ToolCallAccumulator::default();
        acc.absorb(&DeltaToolCall {
            index: 1,
            id: Some("b".into()),
            function: Some(DeltaFunction {
                name: Some("second".into()),
                arguments: Some("{}".into()),
            }),
        });
        acc.absorb(&DeltaToolCall {
            index: 0,
            id: Some("a".into()),
            function: Some(DeltaFunction {
                name: Some("first".into()),
                arguments: Some("{}".into()),
            }),
        });
        let calls = acc.finish().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "first");
        assert_eq!(calls[1].name, "second");
    }

    #[test]
    fn accumulator_rejects_garbled_arguments() {
        let mut acc = ToolCallAccumulator::default();
        acc.absorb(&DeltaToolCall {
            index: 0,
            id: Some("x".into()),
            function: Some(DeltaFunction {
                name: Some("broken".into()),
                arguments: Some("{\"a\": ".into()),
            }),
        });
        assert!(acc.finish().is_err());
    }

    #[test]
    fn empty_arguments_become_empty_object() {
        let mut acc = ToolCallAccumulator::default();
        acc.absorb(&DeltaToolCall {
            index: 0,
            id: Some("x".into()),
            function: Some(DeltaFunction {
                name: Some("ping".into()),
                arguments: None,
            }),
        });
        let calls = acc.finish().unwrap();
        assert_eq!(calls[0].input, serde_json::json!({}));
    }

    #[test]
    fn orphaned_tool_results_are_skipped() {
        let messages = vec![
            Message::assistant_with_tool_calls(
                "",
                vec![ToolCall {
                    id: "known".into(),
                    name: "search".into(),
                    input: serde_json::json!({}),
                }],
            ),
            Message::tool_results(vec![
                ToolResultBlock {
                    tool_call_id: "known".into(),
                    name: "search".into(),
                    content: "ok".into(),
                    is_error: false,
                },
                ToolResultBlock {
                    tool_call_id: "orphan".into(),
                    name: "search".into(),
                    content: "lost".into(),
                    is_error: false,
                },
            ]),
        ];
        let wire = CompatBackend::convert_messages("", &messages);
        let tool_messages: Vec<_> = wire.iter().filter(|m| m.role == "tool").collect();
        assert_eq!(tool_messages.len(), 1);
        assert_eq!(tool_messages[0].tool_call_id.as_deref(), Some("known"));
    }

    #[test]
    fn pseudo_call_detection() {
        assert!(looks_like_pseudo_tool_call("web_search({\"query\": \"x\"})"));
        assert!(looks_like_pseudo_tool_call(
            "<tool_call>{\"name\": \"x\"}</tool_call>"
        ));
        assert!(!looks_like_pseudo_tool_call(
            "The weather in Berlin is sunny."
        ));
    }

    #[test]
    fn system_message_leads_the_thread() {
        let wire = CompatBackend::convert_messages("be helpful", &[Message::user("hi")]);
        assert_eq!(wire[0].role, "system");
        assert_eq!(wire[1].role, "user");
    }
}
