//! Local backend - newline-delimited JSON over a local model runtime
//!
//! Talks to a locally hosted runtime (Ollama-style API). Responses stream as
//! NDJSON rather than SSE. A request naming a model that is not installed is
//! retried once against the closest installed variant.

use crate::backend::{Backend, BackendKind, StreamRequest, TextSink};
use crate::error::{Error, Result};
use crate::message::{Message, Role};
use crate::result::{CanonicalResult, StopSignal, Usage};
use crate::tools::{ToolCall, ToolDefinition};
use crate::util::{condense_http_error, LineFramer};
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Default local runtime URL
const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Family preference when substituting for a missing model, best first.
const FALLBACK_FAMILIES: &[&str] = &["qwen3", "qwen2.5", "llama3.2", "llama3.1", "mistral"];

/// Strip routing-only alias suffixes (`model:cloud`, `model:local`) down to
/// the bare model name the runtime knows.
#[must_use]
pub fn normalize_model_alias(model: &str) -> &str {
    model
        .strip_suffix(":cloud")
        .or_else(|| model.strip_suffix(":local"))
        .unwrap_or(model)
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct LocalRequest {
    model: String,
    stream: bool,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
    options: LocalOptions,
}

#[derive(Debug, Serialize)]
struct LocalOptions {
    num_predict: u32,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct StreamLine {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    message: Option<LineMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LineMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<LineToolCall>,
}

#[derive(Debug, Deserialize)]
struct LineToolCall {
    function: LineFunction,
}

#[derive(Debug, Deserialize)]
struct LineFunction {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<InstalledModel>,
}

#[derive(Debug, Deserialize)]
struct InstalledModel {
    name: String,
}

// ============================================================================
// Config
// ============================================================================

/// Local backend configuration
#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// Runtime base URL
    pub base_url: String,
    /// Request timeout
    pub timeout: Duration,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(300),
        }
    }
}

impl LocalConfig {
    /// Create configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let base_url = std::env::var("OLLAMA_BASE_URL")
            .or_else(|_| std::env::var("OLLAMA_HOST"))
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            ..Self::default()
        }
    }

    /// Set the base URL.
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

/// Local-runtime backend adapter
pub struct LocalBackend {
    client: Client,
    config: LocalConfig,
}

impl LocalBackend {
    /// Create a new adapter.
    pub fn new(config: LocalConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Network(e.to_string()))?;
        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(LocalConfig::from_env())
    }

    fn convert_messages(system: &str, messages: &[Message]) -> Vec<WireMessage> {
        let mut wire = Vec::with_capacity(messages.len() + 1);
        if !system.is_empty() {
            wire.push(WireMessage {
                role: "system",
                content: system.to_string(),
                images: Vec::new(),
                tool_calls: None,
            });
        }
        for msg in messages {
            match msg.role {
                Role::User => wire.push(WireMessage {
                    role: "user",
                    content: msg.content.clone(),
                    images: msg.images.iter().map(|i| i.data.clone()).collect(),
                    tool_calls: None,
                }),
                Role::Assistant => {
                    let tool_calls = if msg.tool_calls.is_empty() {
                        None
                    } else {
                        Some(
                            msg.tool_calls
                                .iter()
                                .map(|c| {
                                    serde_json::json!({
                                        "function": {"name": c.name, "arguments": c.input}
                                    })
                                })
                                .collect(),
                        )
                    };
                    wire.push(WireMessage {
                        role: "assistant",
                        content: msg.content.clone(),
                        images: Vec::new(),
                        tool_calls,
                    });
                }
                Role::Tool => {
                    for result in &msg.tool_results {
                        wire.push(WireMessage {
                            role: "tool",
                            content: result.content.clone(),
                            images: Vec::new(),
                            tool_calls: None,
                        });
                    }
                }
            }
        }
        wire
    }

    fn convert_tools(tools: &[ToolDefinition]) -> Vec<serde_json::Value> {
        tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    },
                })
            })
            .collect()
    }

    /// List models installed on the runtime.
    async fn installed_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.config.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| Error::InvalidResponse(e.to_string()))?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Pick a substitute for a missing model: a same-name variant if one is
    /// installed, otherwise the best installed fallback family.
    fn closest_installed(requested: &str, installed: &[String]) -> Option<String> {
        let base = requested.split(':').next().unwrap_or(requested);
        if let Some(variant) = installed.iter().find(|m| {
            m.as_str() == base || m.split(':').next() == Some(base)
        }) {
            return Some(variant.clone());
        }
        for family in FALLBACK_FAMILIES {
            if let Some(m) = installed.iter().find(|m| m.starts_with(family)) {
                return Some(m.clone());
            }
        }
        None
    }

    async fn stream_once(
        &self,
        model: &str,
        request: &StreamRequest,
        sink: &mut dyn TextSink,
    ) -> Result<CanonicalResult> {
        let url = format!("{}/api/chat", self.config.base_url);
        let wire_request = LocalRequest {
            model: model.to_string(),
            stream: true,
            messages: Self::convert_messages(&request.system.joined(), &request.messages),
            tools: (!request.tools.is_empty()).then(|| Self::convert_tools(&request.tools)),
            options: LocalOptions {
                num_predict: request.max_tokens,
            },
        };

        debug!(url = %url, model = model, "Opening local stream");

        let response = self
            .client
            .post(&url)
            .json(&wire_request)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api(condense_http_error(status.as_u16(), &body)));
        }

        let mut usage = Usage::default();
        let mut resolved_model = model.to_string();
        let mut text = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut stop = StopSignal::EndTurn;

        let mut framer = LineFramer::new();
        let mut body = response.bytes_stream();

        let mut handle_line = |line: &str,
                               sink: &mut dyn TextSink,
                               text: &mut String,
                               tool_calls: &mut Vec<ToolCall>,
                               usage: &mut Usage,
                               resolved_model: &mut String,
                               stop: &mut StopSignal|
         -> Result<()> {
            let parsed: StreamLine = serde_json::from_str(line)
                .map_err(|e| Error::InvalidResponse(format!("bad stream line: {e}")))?;
            if let Some(error) = parsed.error {
                return Err(Error::Api(error));
            }
            if let Some(name) = parsed.model {
                *resolved_model = name;
            }
            if let Some(message) = parsed.message {
                if !message.content.is_empty() {
                    sink.text_delta(&message.content);
                    text.push_str(&message.content);
                }
                for call in message.tool_calls {
                    // The local runtime has no call ids; synthesize stable ones
                    let id = format!("call_{}", tool_calls.len());
                    tool_calls.push(ToolCall {
                        id,
                        name: call.function.name,
                        input: call.function.arguments,
                    });
                }
            }
            if parsed.done {
                if let Some(n) = parsed.prompt_eval_count {
                    usage.input_tokens = n;
                }
                if let Some(n) = parsed.eval_count {
                    usage.output_tokens = n;
                }
                if parsed.done_reason.as_deref() == Some("tool_calls") {
                    *stop = StopSignal::ToolUse;
                }
            }
            Ok(())
        };

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| Error::Network(e.to_string()))?;
            for line in framer.push(&chunk) {
                handle_line(
                    &line,
                    sink,
                    &mut text,
                    &mut tool_calls,
                    &mut usage,
                    &mut resolved_model,
                    &mut stop,
                )?;
            }
        }
        if let Some(line) = framer.finish() {
            handle_line(
                &line,
                sink,
                &mut text,
                &mut tool_calls,
                &mut usage,
                &mut resolved_model,
                &mut stop,
            )?;
        }

        if !tool_calls.is_empty() {
            stop = StopSignal::ToolUse;
        }

        Ok(CanonicalResult {
            text,
            tool_calls,
            usage,
            stop,
            model: resolved_model,
        })
    }
}

/// Forwards deltas while remembering whether any reached the caller, so
/// a failed call is only retried before output was delivered.
struct TrackedSink<'a> {
    inner: &'a mut dyn TextSink,
    delivered: bool,
}

impl TextSink for TrackedSink<'_> {
    fn text_delta(&mut self, delta: &str) {
        self.delivered = true;
        self.inner.text_delta(delta);
    }
}

fn is_model_not_found(err: &Error) -> bool {
    match err {
        Error::Api(msg) => {
            let msg = msg.to_ascii_lowercase();
            msg.contains("not found") && msg.contains("model")
        }
        _ => false,
    }
}

#[async_trait::async_trait]
impl Backend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn supports_vision(&self) -> bool {
        // Vision depends on which model is pulled; advertise the common case
        false
    }

    #[instrument(skip(self, request, sink), fields(model = %request.model))]
    async fn stream(
        &self,
        request: StreamRequest,
        sink: &mut dyn TextSink,
    ) -> Result<CanonicalResult> {
        let model = normalize_model_alias(&request.model).to_string();

        let mut tracked = TrackedSink {
            inner: sink,
            delivered: false,
        };
        match self.stream_once(&model, &request, &mut tracked).await {
            Ok(result) => Ok(result),
            // Retry only while the caller has seen nothing; a mid-stream
            // failure after delivered text must not replay the deltas
            Err(err) if is_model_not_found(&err) && !tracked.delivered => {
                let installed = self.installed_models().await?;
                let Some(substitute) = Self::closest_installed(&model, &installed) else {
                    return Err(err);
                };
                info!(
                    requested = %model,
                    substitute = %substitute,
                    "Requested model not installed, retrying with closest installed model"
                );
                self.stream_once(&substitute, &request, tracked.inner).await
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_suffixes_are_stripped() {
        assert_eq!(normalize_model_alias("qwen3:cloud"), "qwen3");
        assert_eq!(normalize_model_alias("qwen3:local"), "qwen3");
        assert_eq!(normalize_model_alias("qwen3:8b"), "qwen3:8b");
        assert_eq!(normalize_model_alias("llama3.2"), "llama3.2");
    }

    #[test]
    fn closest_match_prefers_same_family_variant() {
        let installed = vec!["llama3.2:3b".to_string(), "qwen3:8b".to_string()];
        assert_eq!(
            LocalBackend::closest_installed("qwen3:32b", &installed),
            Some("qwen3:8b".to_string())
        );
    }

    #[test]
    fn closest_match_falls_back_by_priority() {
        let installed = vec!["mistral:7b".to_string(), "llama3.1:8b".to_string()];
        assert_eq!(
            LocalBackend::closest_installed("gemma2:9b", &installed),
            Some("llama3.1:8b".to_string())
        );
    }

    #[test]
    fn no_installed_models_yields_none() {
        assert_eq!(LocalBackend::closest_installed("qwen3", &[]), None);
    }

    #[test]
    fn model_not_found_detection() {
        assert!(is_model_not_found(&Error::Api(
            "HTTP 404: model \"qwen3\" not found, try pulling it first".into()
        )));
        assert!(!is_model_not_found(&Error::Api("HTTP 500: boom".into())));
        assert!(!is_model_not_found(&Error::RateLimit));
    }

    #[test]
    fn sink_tracking_flags_delivered_output() {
        let mut received = String::new();
        let mut inner = |delta: &str| received.push_str(delta);
        let mut tracked = TrackedSink {
            inner: &mut inner,
            delivered: false,
        };
        assert!(!tracked.delivered);
        tracked.text_delta("hel");
        tracked.text_delta("lo");
        assert!(tracked.delivered);
        drop(tracked);
        assert_eq!(received, "hello");
    }
}
