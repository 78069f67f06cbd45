//! The per-turn state machine
//!
//! One turn: load agent and history, pick the soul, resolve routes, run
//! the bounded tool-calling loop, optionally re-run the final answer on
//! the chat route, persist the transcript, and account usage.

use super::core::Runtime;
use super::routing::resolve_turn_routes;
use super::tool_execution::{SpawnScope, TurnSpawner};
use super::types::{TurnOutcome, TurnRequest, TurnStatus, UsageBreakdown};
use crate::context::{build_system_prompt, resolve_attachments, truncate_history};
use crate::error::{Error, Result};
use crate::gate::LatencyProfile;
use crate::store::StoredMessage;
use crate::tools::{AgentSpawner, ToolContext};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;
use volition_llm::util::truncate_safe;
use volition_llm::{Message, NullSink, Role, StreamRequest, TaskKind, TextSink, Usage};
use volition_soul::ensure_version;

/// Removes the turn's cancellation token even when the turn future is
/// dropped mid-flight (cancellation, parent timeout).
struct ActiveTurnGuard {
    turns: Arc<dashmap::DashMap<Uuid, CancellationToken>>,
    id: Uuid,
}

impl Drop for ActiveTurnGuard {
    fn drop(&mut self) {
        self.turns.remove(&self.id);
    }
}

fn stored_to_message(stored: &StoredMessage) -> Message {
    match stored.role {
        Role::User => Message::user(stored.content.clone()),
        Role::Assistant => {
            Message::assistant_with_tool_calls(stored.content.clone(), stored.tool_calls.clone())
        }
        Role::Tool => Message::tool_results(stored.tool_results.clone()),
    }
}

fn title_from(text: &str) -> String {
    let flat = text.trim().replace('\n', " ");
    truncate_safe(&flat, 60).trim_end().to_string()
}

impl Runtime {
    /// Run one turn without streaming.
    pub async fn run_turn(self: Arc<Self>, request: TurnRequest) -> Result<TurnOutcome> {
        let mut sink = NullSink;
        self.run_turn_with_sink(request, &mut sink).await
    }

    /// Run one turn, streaming final-answer text deltas into `sink`.
    ///
    /// The turn is registered for cancellation under its conversation id
    /// and subject to the hard wall-clock timeout; both reject the turn
    /// promptly, dropping any in-flight backend call.
    #[instrument(skip(self, request, sink), fields(agent_id = %request.agent_id, mode = request.mode.as_str()))]
    pub async fn run_turn_with_sink(
        self: Arc<Self>,
        request: TurnRequest,
        sink: &mut dyn TextSink,
    ) -> Result<TurnOutcome> {
        let conversation_id = request.conversation_id.unwrap_or_else(Uuid::new_v4);
        let token = CancellationToken::new();
        self.active_turns.insert(conversation_id, token.clone());
        let _guard = ActiveTurnGuard {
            turns: self.active_turns.clone(),
            id: conversation_id,
        };

        let timeout = self.config.turn_timeout;
        tokio::select! {
            () = token.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, self.execute_turn(conversation_id, &request, sink)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(Error::Timeout(timeout.as_secs())),
                }
            }
        }
    }

    async fn execute_turn(
        self: &Arc<Self>,
        conversation_id: Uuid,
        request: &TurnRequest,
        sink: &mut dyn TextSink,
    ) -> Result<TurnOutcome> {
        let turn_started = Instant::now();
        let profile = self.agents.agent(&request.agent_id).await?;
        let persist = request.should_persist();
        if persist {
            self.conversations
                .ensure_conversation(conversation_id, &profile.id)
                .await?;
        }

        let mut tool_defs = self.tools.definitions();
        if let Some(allowed) = &profile.allowed_tools {
            tool_defs.retain(|d| allowed.iter().any(|a| a == &d.name));
        }
        let tools_enabled = !tool_defs.is_empty();

        let routes = resolve_turn_routes(
            &self.resolver,
            profile.model_override.as_deref(),
            tools_enabled,
        )
        .await?;
        let loop_route = routes.loop_route().clone();
        let two_phase = routes.two_phase();
        debug!(
            chat_model = %routes.chat.model,
            loop_model = %loop_route.model,
            two_phase,
            "Routes resolved"
        );

        // Soul selection: the live prompt is kept in sync by rollout
        // promotion and wins over the directory soul, so a finished
        // rollout's winner stays the active version across turns
        let fallback = self
            .souls
            .live_prompt(&profile.id)
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| profile.soul.clone());
        ensure_version(self.souls.as_ref(), &profile.id, &fallback).await?;
        let chosen = self
            .rollouts
            .choose(&profile.id, conversation_id, &fallback)
            .await;
        debug!(track = ?chosen.track, "Soul selected");

        // Memory is best-effort; a failed lookup just drops the section
        let memory = match &self.memory {
            Some(provider) => match provider.context_for(&profile.id, &request.user_text).await {
                Ok(ctx) => Some(ctx),
                Err(e) => {
                    debug!(error = %e, "Memory context unavailable");
                    None
                }
            },
            None => None,
        };

        let skills_index = tools_enabled.then(|| {
            tool_defs
                .iter()
                .map(|d| format!("- {}: {}", d.name, d.description))
                .collect::<Vec<_>>()
                .join("\n")
        });

        let system = build_system_prompt(
            &chosen.content,
            memory.as_ref(),
            skills_index.as_deref(),
            request.system_suffix.as_deref(),
            self.config.prompt_caching,
        );

        let mut messages: Vec<Message> = Vec::new();
        if persist {
            for stored in self.conversations.history(conversation_id).await? {
                messages.push(stored_to_message(&stored));
            }
        }

        let loop_backend = self.backend(loop_route.backend)?.clone();
        let resolved = resolve_attachments(
            &request.attachments,
            self.extractor.as_deref(),
            self.transcriber.as_deref(),
            loop_backend.supports_vision(),
            &self.config,
        )
        .await;
        let user_text = resolved.augment_user_text(&request.user_text);
        if resolved.images.is_empty() {
            messages.push(Message::user(user_text.clone()));
        } else {
            messages.push(Message::user_with_images(
                user_text.clone(),
                resolved.images.clone(),
            ));
        }
        let mut messages = truncate_history(messages, self.config.history_char_budget);

        if persist {
            let mut stored = StoredMessage::new(conversation_id, Role::User, user_text);
            stored.attachments = request.attachments.iter().map(|a| a.name.clone()).collect();
            self.conversations.append_message(stored).await?;
        }

        let latency = request.latency.map(LatencyProfile::capped);
        let delegations = Arc::new(Mutex::new(Vec::new()));
        let spawner = tools_enabled.then(|| {
            Arc::new(TurnSpawner {
                runtime: self.clone(),
                records: delegations.clone(),
                scope: SpawnScope {
                    mode: request.mode,
                    depth: request.spawn_depth,
                    max_depth: self.config.max_spawn_depth,
                },
            }) as Arc<dyn AgentSpawner>
        });
        let ctx = ToolContext {
            conversation_id,
            agent_id: profile.id.clone(),
            mode: request.mode,
            scope: profile.scope.clone(),
            spawn_depth: request.spawn_depth,
            max_spawn_depth: self.config.max_spawn_depth,
            spawner,
            broadcast: self.broadcast.clone(),
        };

        let mut usage = UsageBreakdown::default();
        let mut tool_records = Vec::new();
        let mut final_text = String::new();
        let mut final_usage: Option<Usage> = None;
        let mut iterations = 0u32;
        let mut status = TurnStatus::Completed;
        let loop_task = if tools_enabled {
            TaskKind::Tool
        } else {
            TaskKind::Chat
        };

        let mut null = NullSink;
        loop {
            iterations += 1;
            let stream_request =
                StreamRequest::new(loop_route.model.clone(), system.clone(), messages.clone())
                    .with_tools(tool_defs.clone())
                    .with_max_tokens(self.config.max_tokens);

            // Only the call producing the final text streams to the caller
            let loop_sink: &mut dyn TextSink = if two_phase { &mut null } else { &mut *sink };
            let call_timeout = self.config.task_timeout(loop_task);
            let result = match tokio::time::timeout(
                call_timeout,
                loop_backend.stream(stream_request, loop_sink),
            )
            .await
            {
                Ok(r) => r?,
                Err(_) => return Err(Error::Timeout(call_timeout.as_secs())),
            };

            if two_phase {
                usage.tool_route.add(&result.usage, &result.model);
            } else {
                usage.assistant.add(&result.usage, &result.model);
            }

            if !result.wants_tools() {
                final_text = result.text;
                final_usage = Some(result.usage);
                break;
            }
            if iterations >= self.config.max_iterations {
                warn!(
                    iterations,
                    "Iteration bound reached while the model still wants tools"
                );
                status = TurnStatus::IterationLimit;
                final_text = result.text;
                final_usage = Some(result.usage);
                break;
            }

            // Persist the assistant tool-call turn before executing anything
            if persist {
                let mut stored =
                    StoredMessage::new(conversation_id, Role::Assistant, result.text.clone());
                stored.tool_calls = result.tool_calls.clone();
                stored.token_usage = Some(result.usage);
                stored.model = Some(loop_route.model.clone());
                self.conversations.append_message(stored).await?;
            }
            messages.push(Message::assistant_with_tool_calls(
                result.text.clone(),
                result.tool_calls.clone(),
            ));

            let executed = self
                .execute_tool_calls(&result.tool_calls, &ctx, latency.as_ref())
                .await;

            let full_blocks: Vec<_> = executed.iter().map(|e| e.result_block.clone()).collect();
            if persist {
                let mut stored = StoredMessage::new(conversation_id, Role::Tool, "");
                stored.tool_results = full_blocks.clone();
                self.conversations.append_message(stored).await?;
            }

            // The model sees the compacted variant, storage keeps the full one
            let compact_blocks = executed
                .iter()
                .map(|e| {
                    let mut block = e.result_block.clone();
                    block.content = e.compact.clone();
                    block
                })
                .collect();
            messages.push(Message::tool_results(compact_blocks));

            tool_records.extend(executed.into_iter().map(|e| e.record));
        }

        if let Some(delay) = &latency {
            delay.before_response().await;
        }

        // Two-phase: one chat-route call with no tools produces the final
        // answer; its text replaces whatever the tool route ended with
        let final_model = if two_phase {
            let chat_backend = self.backend(routes.chat.backend)?;
            let chat_request =
                StreamRequest::new(routes.chat.model.clone(), system.clone(), messages.clone())
                    .with_max_tokens(self.config.max_tokens);
            let chat_timeout = self.config.task_timeout(TaskKind::Chat);
            let result = match tokio::time::timeout(
                chat_timeout,
                chat_backend.stream(chat_request, sink),
            )
            .await
            {
                Ok(r) => r?,
                Err(_) => return Err(Error::Timeout(chat_timeout.as_secs())),
            };
            usage.assistant.add(&result.usage, &result.model);
            final_text = result.text;
            final_usage = Some(result.usage);
            routes.chat.model.clone()
        } else {
            loop_route.model.clone()
        };

        if persist {
            let mut stored =
                StoredMessage::new(conversation_id, Role::Assistant, final_text.clone());
            stored.token_usage = final_usage;
            stored.model = Some(final_model.clone());
            self.conversations.append_message(stored).await?;

            let count = self.conversations.message_count(conversation_id).await?;
            if count <= self.config.title_message_threshold {
                let title = title_from(&request.user_text);
                if !title.is_empty() {
                    self.conversations.set_title(conversation_id, &title).await?;
                }
            }
        }

        // Auto-learn runs after the response, never blocking it
        if let Some(learn) = &self.learn {
            let learn = learn.clone();
            let agent_id = profile.id.clone();
            let user_text = request.user_text.clone();
            let reply = final_text.clone();
            tokio::spawn(async move {
                learn.learn(&agent_id, conversation_id, &user_text, &reply).await;
            });
        }

        let delegations = delegations.lock().map(|d| d.clone()).unwrap_or_default();
        Ok(TurnOutcome {
            conversation_id,
            status,
            text: final_text,
            tool_calls: tool_records,
            delegations,
            usage,
            iterations,
            duration_ms: turn_started.elapsed().as_millis() as u64,
            model: final_model,
        })
    }
}
