//! Volition Core - turn orchestration for the agent platform
//!
//! Drives one user turn end to end: agent lookup, soul selection via the
//! rollout engine, two-route resolution, the bounded tool-calling loop
//! behind the execution-mode gate, transcript persistence, and usage
//! accounting.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod context;
pub mod error;
pub mod gate;
pub mod runtime;
pub mod store;
pub mod summarize;
pub mod tools;

pub use config::RuntimeConfig;
pub use context::{
    Attachment, AttachmentKind, AudioTranscriber, DocumentExtractor, MemoryContext,
    MemoryProvider, ResolvedAttachments,
};
pub use error::{Error, Result};
pub use gate::{
    simulated_result, ClassificationCache, ExecutionGate, ExecutionMode, GateDecision,
    LatencyProfile, CLASSIFICATION_CACHE_TTL, MAX_SIMULATED_DELAY_MS,
};
pub use runtime::{
    AgentDirectory, AgentProfile, DelegationRecord, LearnHook, Runtime, StaticAgentDirectory,
    ToolCallRecord, TurnOutcome, TurnRequest, TurnStatus, UsageBreakdown,
};
pub use store::{Conversation, ConversationStore, MemoryConversationStore, StoredMessage};
pub use summarize::compact_tool_result;
pub use tools::{error_result, AgentSpawner, EventBroadcast, NoTools, ToolContext, ToolExecutor};
