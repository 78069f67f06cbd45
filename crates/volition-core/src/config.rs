//! Runtime configuration
//!
//! Everything is optional in the environment and defaults to conservative
//! behavior: caching off, summarization off, smart gating off.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;
use volition_llm::TaskKind;

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, raw = %raw, "Unparseable config value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => matches!(raw.as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Runtime tuning knobs.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Max model-call rounds per turn
    pub max_iterations: u32,
    /// Max sub-agent delegation depth
    pub max_spawn_depth: u32,
    /// Character budget for history sent to the model
    pub history_char_budget: usize,
    /// Character budget for one tool result in working context
    pub tool_result_char_budget: usize,
    /// Character budget for one inlined attachment
    pub attachment_char_budget: usize,
    /// Split the system prompt into cacheable blocks on the native backend
    pub prompt_caching: bool,
    /// Structurally shrink tool results before feeding them back
    pub summarize_tool_results: bool,
    /// Cache gate classifications between turns
    pub smart_tool_gating: bool,
    /// Hard wall-clock limit for one turn
    pub turn_timeout: Duration,
    /// Per-task timeout overrides for individual backend calls
    pub task_timeouts: HashMap<TaskKind, Duration>,
    /// Conversations with at most this many messages get a title refresh
    pub title_message_threshold: usize,
    /// Generation budget per backend call
    pub max_tokens: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_spawn_depth: 2,
            history_char_budget: 24_000,
            tool_result_char_budget: 6_000,
            attachment_char_budget: 8_000,
            prompt_caching: false,
            summarize_tool_results: false,
            smart_tool_gating: false,
            turn_timeout: Duration::from_secs(300),
            task_timeouts: HashMap::new(),
            title_message_threshold: 4,
            max_tokens: 4096,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from `VOLITION_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut task_timeouts = HashMap::new();
        for task in [
            TaskKind::Chat,
            TaskKind::Tool,
            TaskKind::Utility,
            TaskKind::Classifier,
            TaskKind::Summarizer,
        ] {
            let key = format!("VOLITION_TIMEOUT_{}_SECS", task.as_str().to_uppercase());
            if let Ok(raw) = std::env::var(&key) {
                match raw.parse::<u64>() {
                    Ok(secs) => {
                        task_timeouts.insert(task, Duration::from_secs(secs));
                    }
                    Err(_) => warn!(key = %key, raw = %raw, "Unparseable timeout override, ignoring"),
                }
            }
        }

        Self {
            max_iterations: env_parse("VOLITION_MAX_ITERATIONS", defaults.max_iterations),
            max_spawn_depth: env_parse("VOLITION_MAX_SPAWN_DEPTH", defaults.max_spawn_depth),
            history_char_budget: env_parse(
                "VOLITION_HISTORY_CHAR_BUDGET",
                defaults.history_char_budget,
            ),
            tool_result_char_budget: env_parse(
                "VOLITION_TOOL_RESULT_CHAR_BUDGET",
                defaults.tool_result_char_budget,
            ),
            attachment_char_budget: env_parse(
                "VOLITION_ATTACHMENT_CHAR_BUDGET",
                defaults.attachment_char_budget,
            ),
            prompt_caching: env_flag("VOLITION_PROMPT_CACHING", defaults.prompt_caching),
            summarize_tool_results: env_flag(
                "VOLITION_SUMMARIZE_TOOL_RESULTS",
                defaults.summarize_tool_results,
            ),
            smart_tool_gating: env_flag("VOLITION_SMART_TOOL_GATING", defaults.smart_tool_gating),
            turn_timeout: Duration::from_secs(env_parse(
                "VOLITION_TURN_TIMEOUT_SECS",
                defaults.turn_timeout.as_secs(),
            )),
            task_timeouts,
            title_message_threshold: env_parse(
                "VOLITION_TITLE_MESSAGE_THRESHOLD",
                defaults.title_message_threshold,
            ),
            max_tokens: env_parse("VOLITION_MAX_TOKENS", defaults.max_tokens),
        }
    }

    /// Timeout for one backend call serving `task`, defaulting to the
    /// turn timeout when no override is configured.
    #[must_use]
    pub fn task_timeout(&self, task: TaskKind) -> Duration {
        self.task_timeouts
            .get(&task)
            .copied()
            .unwrap_or(self.turn_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let config = RuntimeConfig::default();
        assert_eq!(config.max_iterations, 10);
        assert!(!config.prompt_caching);
        assert!(!config.summarize_tool_results);
        assert!(!config.smart_tool_gating);
    }

    #[test]
    fn task_timeout_falls_back_to_turn_timeout() {
        let mut config = RuntimeConfig::default();
        assert_eq!(config.task_timeout(TaskKind::Chat), config.turn_timeout);
        config
            .task_timeouts
            .insert(TaskKind::Tool, Duration::from_secs(30));
        assert_eq!(config.task_timeout(TaskKind::Tool), Duration::from_secs(30));
    }
}
