//! Runtime construction and turn lifecycle management

use crate::config::RuntimeConfig;
use crate::context::{AudioTranscriber, DocumentExtractor, MemoryProvider};
use crate::error::{Error, Result};
use crate::gate::{ExecutionGate, CLASSIFICATION_CACHE_TTL};
use crate::store::ConversationStore;
use crate::tools::{EventBroadcast, ToolExecutor};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;
use volition_llm::{Backend, BackendKind, RouteResolver};
use volition_soul::{RolloutEngine, SoulStore};

/// An agent's static configuration.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    /// Agent id
    pub id: String,
    /// Soul content (system-prompt base)
    pub soul: String,
    /// Tools the agent may use; `None` allows everything the executor offers
    pub allowed_tools: Option<Vec<String>>,
    /// Model override applied to route resolution
    pub model_override: Option<String>,
    /// Access-scope filters passed through to tools
    pub scope: Vec<String>,
}

/// Looks up agent configuration.
#[async_trait::async_trait]
pub trait AgentDirectory: Send + Sync {
    /// Load the agent's profile.
    async fn agent(&self, agent_id: &str) -> Result<AgentProfile>;
}

/// Fixed in-memory agent directory.
#[derive(Default)]
pub struct StaticAgentDirectory {
    agents: HashMap<String, AgentProfile>,
}

impl StaticAgentDirectory {
    /// Build a directory from profiles.
    #[must_use]
    pub fn new(profiles: Vec<AgentProfile>) -> Self {
        Self {
            agents: profiles.into_iter().map(|p| (p.id.clone(), p)).collect(),
        }
    }
}

#[async_trait::async_trait]
impl AgentDirectory for StaticAgentDirectory {
    async fn agent(&self, agent_id: &str) -> Result<AgentProfile> {
        self.agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Error::Config(format!("unknown agent: {agent_id}")))
    }
}

/// Post-turn learning hook, fired best-effort after the response.
#[async_trait::async_trait]
pub trait LearnHook: Send + Sync {
    /// Observe a completed exchange.
    async fn learn(&self, agent_id: &str, conversation_id: Uuid, user_text: &str, reply: &str);
}

/// The turn orchestrator.
///
/// Owns the backends, routing, soul selection, conversation storage, and
/// the tool boundary. One `Runtime` serves many concurrent turns; per-turn
/// state lives on the stack of [`Runtime::run_turn`].
pub struct Runtime {
    pub(crate) backends: HashMap<BackendKind, Arc<dyn Backend>>,
    pub(crate) resolver: RouteResolver,
    pub(crate) rollouts: RolloutEngine,
    pub(crate) souls: Arc<dyn SoulStore>,
    pub(crate) conversations: Arc<dyn ConversationStore>,
    pub(crate) tools: Arc<dyn ToolExecutor>,
    pub(crate) agents: Arc<dyn AgentDirectory>,
    pub(crate) gate: ExecutionGate,
    pub(crate) memory: Option<Arc<dyn MemoryProvider>>,
    pub(crate) extractor: Option<Arc<dyn DocumentExtractor>>,
    pub(crate) transcriber: Option<Arc<dyn AudioTranscriber>>,
    pub(crate) learn: Option<Arc<dyn LearnHook>>,
    pub(crate) broadcast: Option<Arc<dyn EventBroadcast>>,
    pub(crate) config: RuntimeConfig,
    pub(crate) active_turns: Arc<DashMap<Uuid, CancellationToken>>,
}

impl Runtime {
    /// Create a runtime over its required collaborators.
    pub fn new(
        backends: HashMap<BackendKind, Arc<dyn Backend>>,
        resolver: RouteResolver,
        rollouts: RolloutEngine,
        souls: Arc<dyn SoulStore>,
        conversations: Arc<dyn ConversationStore>,
        tools: Arc<dyn ToolExecutor>,
        agents: Arc<dyn AgentDirectory>,
        config: RuntimeConfig,
    ) -> Self {
        let gate = if config.smart_tool_gating {
            ExecutionGate::heuristic_only().with_cache(CLASSIFICATION_CACHE_TTL)
        } else {
            ExecutionGate::heuristic_only()
        };
        Self {
            backends,
            resolver,
            rollouts,
            souls,
            conversations,
            tools,
            agents,
            gate,
            memory: None,
            extractor: None,
            transcriber: None,
            learn: None,
            broadcast: None,
            config,
            active_turns: Arc::new(DashMap::new()),
        }
    }

    /// Replace the execution gate. Smart gating stays in effect: the
    /// classification cache is re-attached when the config asks for it.
    #[must_use]
    pub fn with_gate(mut self, gate: ExecutionGate) -> Self {
        self.gate = if self.config.smart_tool_gating && !gate.caches_classifications() {
            gate.with_cache(CLASSIFICATION_CACHE_TTL)
        } else {
            gate
        };
        self
    }

    /// Attach a memory provider.
    #[must_use]
    pub fn with_memory(mut self, memory: Arc<dyn MemoryProvider>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Attach a document extractor.
    #[must_use]
    pub fn with_extractor(mut self, extractor: Arc<dyn DocumentExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Attach an audio transcriber.
    #[must_use]
    pub fn with_transcriber(mut self, transcriber: Arc<dyn AudioTranscriber>) -> Self {
        self.transcriber = Some(transcriber);
        self
    }

    /// Attach a post-turn learning hook.
    #[must_use]
    pub fn with_learn_hook(mut self, learn: Arc<dyn LearnHook>) -> Self {
        self.learn = Some(learn);
        self
    }

    /// Attach a side-channel event broadcaster.
    #[must_use]
    pub fn with_broadcast(mut self, broadcast: Arc<dyn EventBroadcast>) -> Self {
        self.broadcast = Some(broadcast);
        self
    }

    /// The adapter for a backend kind.
    pub(crate) fn backend(&self, kind: BackendKind) -> Result<&Arc<dyn Backend>> {
        self.backends
            .get(&kind)
            .ok_or_else(|| Error::Config(format!("no backend registered for {}", kind.as_str())))
    }

    /// Invalidate the route table and tool-classification caches after a
    /// credential or tool-config change.
    pub async fn invalidate_caches(&self) {
        self.resolver.invalidate().await;
        self.gate.invalidate();
    }

    /// Cancel an in-flight turn. Returns whether one was found.
    pub fn cancel_turn(&self, conversation_id: Uuid) -> bool {
        if let Some(entry) = self.active_turns.get(&conversation_id) {
            debug!(%conversation_id, "Cancelling turn");
            entry.cancel();
            true
        } else {
            false
        }
    }

    /// Number of turns currently in flight.
    #[must_use]
    pub fn active_turn_count(&self) -> usize {
        self.active_turns.len()
    }
}
