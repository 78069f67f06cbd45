//! Tool execution within a turn
//!
//! Calls run sequentially in the order the model requested them. Each one
//! goes through the execution-mode gate first. The full result is kept for
//! storage; a compacted variant feeds the next model call.

use super::core::Runtime;
use super::types::{DelegationRecord, ToolCallRecord, TurnRequest};
use crate::gate::{simulated_result, GateDecision, LatencyProfile};
use crate::summarize::compact_tool_result;
use crate::tools::{AgentSpawner, ToolContext};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;
use volition_llm::util::truncate_safe;
use volition_llm::{ToolCall, ToolResultBlock};

/// One tool call after gating and execution.
pub(crate) struct ExecutedTool {
    pub record: ToolCallRecord,
    pub result_block: ToolResultBlock,
    /// Size-capped variant for the next model call
    pub compact: String,
}

impl Runtime {
    /// Execute one round of requested tool calls.
    pub(crate) async fn execute_tool_calls(
        &self,
        calls: &[ToolCall],
        ctx: &ToolContext,
        latency: Option<&LatencyProfile>,
    ) -> Vec<ExecutedTool> {
        let mut executed = Vec::with_capacity(calls.len());
        for call in calls {
            if let Some(profile) = latency {
                profile.before_tool().await;
            }
            executed.push(self.execute_one(call, ctx).await);
        }
        executed
    }

    async fn execute_one(&self, call: &ToolCall, ctx: &ToolContext) -> ExecutedTool {
        let started = Instant::now();
        let (output, simulated) = match self.gate.decide(ctx.mode, &call.name) {
            GateDecision::Execute => {
                let output = self.tools.execute(&call.name, &call.input, ctx).await;
                (output, false)
            }
            GateDecision::Simulate(reason) => {
                info!(tool = %call.name, mode = ctx.mode.as_str(), reason, "Simulating tool call");
                (simulated_result(&call.name, &reason), true)
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let is_error = output.get("error").is_some();
        if is_error {
            warn!(tool = %call.name, "Tool returned an error result");
        }

        let full_rendered = output.to_string();
        let compact = if self.config.summarize_tool_results {
            compact_tool_result(&call.name, &output, self.config.tool_result_char_budget)
        } else if full_rendered.len() > self.config.tool_result_char_budget {
            format!(
                "{}...(truncated)",
                truncate_safe(&full_rendered, self.config.tool_result_char_budget)
            )
        } else {
            full_rendered.clone()
        };

        ExecutedTool {
            record: ToolCallRecord {
                name: call.name.clone(),
                input: call.input.clone(),
                output: output.clone(),
                simulated,
                duration_ms,
            },
            result_block: ToolResultBlock {
                tool_call_id: call.id.clone(),
                name: call.name.clone(),
                content: full_rendered,
                is_error,
            },
            compact,
        }
    }
}

/// Per-turn spawner handed to tools through [`ToolContext`].
///
/// Child turns run in the same mode as the parent and are recorded with
/// their duration and outcome. A failed delegation becomes an error-shaped
/// value; it never aborts the parent turn or touches its token accounting.
pub(crate) struct TurnSpawner {
    pub runtime: Arc<Runtime>,
    pub records: Arc<Mutex<Vec<DelegationRecord>>>,
    pub scope: SpawnScope,
}

/// What the spawner needs to know about the parent turn.
#[derive(Clone)]
pub(crate) struct SpawnScope {
    pub mode: crate::gate::ExecutionMode,
    pub depth: u32,
    pub max_depth: u32,
}

impl TurnSpawner {
    fn record(&self, agent_id: &str, started: Instant, success: bool, error: Option<String>) {
        if let Ok(mut records) = self.records.lock() {
            records.push(DelegationRecord {
                agent_id: agent_id.to_string(),
                duration_ms: started.elapsed().as_millis() as u64,
                success,
                error,
            });
        }
    }
}

#[async_trait::async_trait]
impl AgentSpawner for TurnSpawner {
    async fn spawn(&self, agent_id: &str, instruction: &str) -> serde_json::Value {
        let started = Instant::now();
        let depth = self.scope.depth + 1;
        if depth > self.scope.max_depth {
            let message = format!(
                "delegation depth {depth} exceeds limit {}",
                self.scope.max_depth
            );
            self.record(agent_id, started, false, Some(message.clone()));
            return crate::tools::error_result(message);
        }

        let request = TurnRequest::new(agent_id, instruction)
            .with_mode(self.scope.mode)
            .with_spawn_depth(depth)
            .in_conversation(Uuid::new_v4());

        match self.runtime.clone().run_turn(request).await {
            Ok(outcome) => {
                self.record(agent_id, started, true, None);
                serde_json::json!({ "text": outcome.text })
            }
            Err(e) => {
                let message = e.to_string();
                self.record(agent_id, started, false, Some(message.clone()));
                crate::tools::error_result(message)
            }
        }
    }
}
