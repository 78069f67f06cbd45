//! Execution-mode gate - deciding whether a tool call really runs
//!
//! `live` executes everything. `shadow` lets only read-only tools through
//! and simulates the rest. `dry_run` simulates everything. Classification
//! goes safe-list, then block-list, then a naming heuristic; names the
//! heuristic cannot place are treated as mutating.

use dashmap::DashMap;
use std::collections::HashSet;
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::debug;

/// Name suffixes that imply a mutating tool.
const MUTATING_SUFFIXES: &[&str] = &[
    "_create", "_update", "_delete", "_remove", "_write", "_send", "_execute", "_set", "_upload",
];

/// Name prefixes that imply a read-only tool.
const READONLY_PREFIXES: &[&str] = &[
    "search_", "list_", "get_", "read_", "fetch_", "find_", "lookup_", "describe_", "count_",
];

/// Absolute ceiling for simulated latency injection.
pub const MAX_SIMULATED_DELAY_MS: u64 = 2_000;

/// TTL for cached tool classifications when smart gating is enabled.
pub const CLASSIFICATION_CACHE_TTL: Duration = Duration::from_secs(300);

/// How a turn's tool calls are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Tools execute and persist normally
    Live,
    /// Only read-only tools execute; the rest are simulated
    Shadow,
    /// Nothing executes; persistence is suppressed by default
    DryRun,
}

impl ExecutionMode {
    /// String form used in configuration and persistence.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Shadow => "shadow",
            Self::DryRun => "dry_run",
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "live" => Ok(Self::Live),
            "shadow" => Ok(Self::Shadow),
            "dry_run" => Ok(Self::DryRun),
            other => Err(crate::Error::Config(format!(
                "unknown execution mode: {other}"
            ))),
        }
    }
}

/// Verdict for one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Run the tool for real
    Execute,
    /// Return a simulated result instead, with the stated reason
    Simulate(String),
}

/// The simulated result returned in place of a real tool execution.
#[must_use]
pub fn simulated_result(tool_name: &str, reason: &str) -> serde_json::Value {
    serde_json::json!({
        "simulated": true,
        "tool": tool_name,
        "reason": reason,
    })
}

/// TTL-bounded cache of per-tool read-only classifications, shared
/// process-wide when smart gating is on.
pub struct ClassificationCache {
    entries: DashMap<String, (Instant, bool)>,
    ttl: Duration,
}

impl ClassificationCache {
    /// Create a cache with the given TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    fn get(&self, name: &str) -> Option<bool> {
        let entry = self.entries.get(name)?;
        let (at, readonly) = *entry;
        (at.elapsed() < self.ttl).then_some(readonly)
    }

    fn put(&self, name: &str, readonly: bool) {
        self.entries
            .insert(name.to_string(), (Instant::now(), readonly));
    }

    /// Drop all cached classifications.
    pub fn invalidate(&self) {
        self.entries.clear();
    }
}

/// Gate deciding tool execution per mode.
pub struct ExecutionGate {
    safe_list: HashSet<String>,
    block_list: HashSet<String>,
    cache: Option<ClassificationCache>,
}

impl ExecutionGate {
    /// Build a gate from explicit classifications.
    #[must_use]
    pub fn new(safe_list: HashSet<String>, block_list: HashSet<String>) -> Self {
        Self {
            safe_list,
            block_list,
            cache: None,
        }
    }

    /// Gate with no explicit classifications; the heuristic applies to
    /// every tool.
    #[must_use]
    pub fn heuristic_only() -> Self {
        Self::new(HashSet::new(), HashSet::new())
    }

    /// Enable the shared classification cache.
    #[must_use]
    pub fn with_cache(mut self, ttl: Duration) -> Self {
        self.cache = Some(ClassificationCache::new(ttl));
        self
    }

    /// Whether the classification cache is enabled.
    #[must_use]
    pub fn caches_classifications(&self) -> bool {
        self.cache.is_some()
    }

    /// Drop cached classifications after a tool-config change.
    pub fn invalidate(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate();
        }
    }

    /// Decide what happens to a call of `tool_name` under `mode`.
    #[must_use]
    pub fn decide(&self, mode: ExecutionMode, tool_name: &str) -> GateDecision {
        match mode {
            ExecutionMode::Live => GateDecision::Execute,
            ExecutionMode::DryRun => {
                GateDecision::Simulate("dry run: tool execution disabled".to_string())
            }
            ExecutionMode::Shadow => {
                if self.is_readonly(tool_name) {
                    GateDecision::Execute
                } else {
                    GateDecision::Simulate(format!(
                        "shadow mode: '{tool_name}' is not classified read-only"
                    ))
                }
            }
        }
    }

    /// Safe-list, block-list, then naming heuristic. Unclassifiable
    /// names count as mutating.
    fn is_readonly(&self, name: &str) -> bool {
        if self.safe_list.contains(name) {
            return true;
        }
        if self.block_list.contains(name) {
            return false;
        }
        if let Some(cache) = &self.cache {
            if let Some(readonly) = cache.get(name) {
                return readonly;
            }
        }
        let readonly = Self::heuristic_readonly(name);
        if let Some(cache) = &self.cache {
            cache.put(name, readonly);
            debug!(tool = name, readonly, "Cached gate classification");
        }
        readonly
    }

    fn heuristic_readonly(name: &str) -> bool {
        if MUTATING_SUFFIXES.iter().any(|s| name.ends_with(s)) {
            return false;
        }
        READONLY_PREFIXES.iter().any(|p| name.starts_with(p))
    }
}

/// Bounded random delay injected before tool execution and before the
/// final response, for tests that need realistic timing. Never applied
/// in `live` mode unless a caller passes it explicitly for that turn.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyProfile {
    /// Max delay before each tool execution, milliseconds
    pub tool_delay_ms: u64,
    /// Max delay before the final response, milliseconds
    pub response_delay_ms: u64,
}

impl LatencyProfile {
    /// Clamp both delays to [`MAX_SIMULATED_DELAY_MS`].
    #[must_use]
    pub fn capped(self) -> Self {
        Self {
            tool_delay_ms: self.tool_delay_ms.min(MAX_SIMULATED_DELAY_MS),
            response_delay_ms: self.response_delay_ms.min(MAX_SIMULATED_DELAY_MS),
        }
    }

    /// Sleep up to the tool delay.
    pub async fn before_tool(&self) {
        Self::jittered_sleep(self.capped().tool_delay_ms).await;
    }

    /// Sleep up to the response delay.
    pub async fn before_response(&self) {
        Self::jittered_sleep(self.capped().response_delay_ms).await;
    }

    async fn jittered_sleep(max_ms: u64) {
        use rand::Rng;
        if max_ms == 0 {
            return;
        }
        let ms = rand::thread_rng().gen_range(0..=max_ms);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}
