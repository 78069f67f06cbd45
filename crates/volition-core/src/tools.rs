//! Tool collaborator contract
//!
//! Tools never throw past this boundary: every failure comes back as an
//! `{"error": ...}` value so the model can react to it and the turn
//! continues.

use crate::gate::ExecutionMode;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;
use volition_llm::ToolDefinition;

/// Side-channel event emitter (websocket pushes, notifications).
pub trait EventBroadcast: Send + Sync {
    /// Emit an event with a payload. Best-effort; never fails.
    fn broadcast(&self, event: &str, payload: &serde_json::Value);
}

/// Spawns a child agent turn on behalf of a tool.
///
/// Returns a tool-shaped value: `{"text": ...}` on success, `{"error": ...}`
/// on failure. Depth limiting and delegation bookkeeping happen inside the
/// runtime's implementation.
#[async_trait::async_trait]
pub trait AgentSpawner: Send + Sync {
    /// Run a child turn for `agent_id` with the given instruction.
    async fn spawn(&self, agent_id: &str, instruction: &str) -> serde_json::Value;
}

/// Everything a tool gets to see about the call site.
#[derive(Clone)]
pub struct ToolContext {
    /// Conversation the turn belongs to
    pub conversation_id: Uuid,
    /// Agent running the turn
    pub agent_id: String,
    /// Execution mode of the turn
    pub mode: ExecutionMode,
    /// Access-scope filters granted to the agent
    pub scope: Vec<String>,
    /// Current delegation depth (0 for a top-level turn)
    pub spawn_depth: u32,
    /// Max delegation depth
    pub max_spawn_depth: u32,
    /// Child-turn spawner, when delegation is available
    pub spawner: Option<Arc<dyn AgentSpawner>>,
    /// Side-channel event emitter, when one is attached
    pub broadcast: Option<Arc<dyn EventBroadcast>>,
}

impl ToolContext {
    /// Emit a side-channel event if a broadcaster is attached.
    pub fn emit(&self, event: &str, payload: &serde_json::Value) {
        if let Some(broadcast) = &self.broadcast {
            broadcast.broadcast(event, payload);
        }
    }
}

/// Executes tools by name.
#[async_trait::async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Definitions of every tool this executor offers.
    fn definitions(&self) -> Vec<ToolDefinition>;

    /// Execute a tool. Failures come back as `{"error": ...}` values,
    /// never as panics or errors.
    async fn execute(
        &self,
        name: &str,
        input: &serde_json::Value,
        ctx: &ToolContext,
    ) -> serde_json::Value;
}

/// Shape every tool failure reduces to.
#[must_use]
pub fn error_result(message: impl Serialize) -> serde_json::Value {
    serde_json::json!({ "error": message })
}

/// An executor with no tools, for agents that only chat.
pub struct NoTools;

#[async_trait::async_trait]
impl ToolExecutor for NoTools {
    fn definitions(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }

    async fn execute(
        &self,
        name: &str,
        _input: &serde_json::Value,
        _ctx: &ToolContext,
    ) -> serde_json::Value {
        error_result(format!("unknown tool: {name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_results_are_error_shaped() {
        let value = error_result("boom");
        assert_eq!(value["error"], "boom");
    }

    #[tokio::test]
    async fn no_tools_rejects_everything() {
        let ctx = ToolContext {
            conversation_id: Uuid::new_v4(),
            agent_id: "joi".into(),
            mode: ExecutionMode::Live,
            scope: Vec::new(),
            spawn_depth: 0,
            max_spawn_depth: 2,
            spawner: None,
            broadcast: None,
        };
        let value = NoTools.execute("anything", &serde_json::json!({}), &ctx).await;
        assert!(value.get("error").is_some());
    }
}
