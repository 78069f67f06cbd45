//! Turn request and outcome types

use crate::context::Attachment;
use crate::gate::{ExecutionMode, LatencyProfile};
use serde::Serialize;
use uuid::Uuid;
use volition_llm::UsageTotals;

/// One user turn to run.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// Conversation to continue; a fresh one is created when absent
    pub conversation_id: Option<Uuid>,
    /// Agent to run as
    pub agent_id: String,
    /// The user's message
    pub user_text: String,
    /// Attachments on the message
    pub attachments: Vec<Attachment>,
    /// Execution mode for this turn
    pub mode: ExecutionMode,
    /// Caller-supplied system prompt suffix
    pub system_suffix: Option<String>,
    /// Delegation depth (0 for a top-level turn)
    pub spawn_depth: u32,
    /// Explicit latency-simulation profile for this run
    pub latency: Option<LatencyProfile>,
    /// Override the mode's default persistence behavior
    pub persist: Option<bool>,
}

impl TurnRequest {
    /// A live turn with no attachments.
    #[must_use]
    pub fn new(agent_id: impl Into<String>, user_text: impl Into<String>) -> Self {
        Self {
            conversation_id: None,
            agent_id: agent_id.into(),
            user_text: user_text.into(),
            attachments: Vec::new(),
            mode: ExecutionMode::Live,
            system_suffix: None,
            spawn_depth: 0,
            latency: None,
            persist: None,
        }
    }

    /// Continue an existing conversation.
    #[must_use]
    pub fn in_conversation(mut self, conversation_id: Uuid) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    /// Set the execution mode.
    #[must_use]
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Attach files to the user message.
    #[must_use]
    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Append to the system prompt for this turn only.
    #[must_use]
    pub fn with_system_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.system_suffix = Some(suffix.into());
        self
    }

    /// Set the delegation depth.
    #[must_use]
    pub fn with_spawn_depth(mut self, depth: u32) -> Self {
        self.spawn_depth = depth;
        self
    }

    /// Inject simulated latency for this run.
    #[must_use]
    pub fn with_latency(mut self, profile: LatencyProfile) -> Self {
        self.latency = Some(profile);
        self
    }

    /// Whether this turn persists messages. Dry runs suppress
    /// persistence unless the caller asks for it.
    #[must_use]
    pub fn should_persist(&self) -> bool {
        self.persist
            .unwrap_or(!matches!(self.mode, ExecutionMode::DryRun))
    }
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// Finished with a final answer
    Completed,
    /// Stopped at the iteration bound before the model finished
    IterationLimit,
}

/// One executed (or simulated) tool call within a turn.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallRecord {
    /// Tool name
    pub name: String,
    /// Input the model supplied
    pub input: serde_json::Value,
    /// Full result as persisted
    pub output: serde_json::Value,
    /// Whether the gate simulated the call
    pub simulated: bool,
    /// Wall time of the execution
    pub duration_ms: u64,
}

/// One sub-agent delegation within a turn.
#[derive(Debug, Clone, Serialize)]
pub struct DelegationRecord {
    /// Child agent
    pub agent_id: String,
    /// Wall time of the child turn
    pub duration_ms: u64,
    /// Whether the child turn succeeded
    pub success: bool,
    /// Failure description, when it did not
    pub error: Option<String>,
}

/// Usage split by which route paid for it.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct UsageBreakdown {
    /// Calls on the chat route (the final answer)
    pub assistant: UsageTotals,
    /// Calls on the tool route (the orchestration loop)
    pub tool_route: UsageTotals,
}

impl UsageBreakdown {
    /// Combined totals across both routes.
    #[must_use]
    pub fn combined(&self) -> UsageTotals {
        let mut total = self.assistant;
        total.merge(&self.tool_route);
        total
    }
}

/// Result of one completed turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    /// Conversation the turn ran in
    pub conversation_id: Uuid,
    /// How the turn ended
    pub status: TurnStatus,
    /// Final answer text
    pub text: String,
    /// Tool calls made during the turn
    pub tool_calls: Vec<ToolCallRecord>,
    /// Sub-agent delegations made during the turn
    pub delegations: Vec<DelegationRecord>,
    /// Token/cost accounting
    pub usage: UsageBreakdown,
    /// Model-call rounds used
    pub iterations: u32,
    /// Wall time of the whole turn
    pub duration_ms: u64,
    /// Model that produced the final answer
    pub model: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dry_run_suppresses_persistence_by_default() {
        let request = TurnRequest::new("joi", "hi").with_mode(ExecutionMode::DryRun);
        assert!(!request.should_persist());

        let mut forced = TurnRequest::new("joi", "hi").with_mode(ExecutionMode::DryRun);
        forced.persist = Some(true);
        assert!(forced.should_persist());

        assert!(TurnRequest::new("joi", "hi").should_persist());
    }
}
