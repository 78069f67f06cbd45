//! Turn orchestration runtime

mod core;
mod process;
mod routing;
mod tool_execution;
mod types;


pub use core::{AgentDirectory, AgentProfile, LearnHook, Runtime, StaticAgentDirectory};
pub use routing::{resolve_turn_routes, TurnRoutes};
pub use types::{
    DelegationRecord, ToolCallRecord, TurnOutcome, TurnRequest, TurnStatus, UsageBreakdown,
};
