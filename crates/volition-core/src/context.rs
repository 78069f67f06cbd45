//! Per-turn context assembly
//!
//! Builds the system prompt (soul + memory + skills + caller suffix),
//! trims history to a character budget, and resolves attachments into
//! backend-consumable form. Attachment trouble never fails a turn; the
//! skipped items are reported inside the user turn instead.

use crate::config::RuntimeConfig;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;
use volition_llm::util::truncate_safe;
use volition_llm::{ImageContent, Message, Role, SystemPrompt};

/// Categorized memory snippets folded into the system prompt.
#[derive(Debug, Clone, Default)]
pub struct MemoryContext {
    /// Who the user is
    pub identity: Vec<String>,
    /// Stated preferences
    pub preferences: Vec<String>,
    /// Previously worked solutions
    pub solutions: Vec<String>,
    /// Recent episodes
    pub episodes: Vec<String>,
}

impl MemoryContext {
    /// Render to a prompt section, or `None` when empty.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        let mut sections = Vec::new();
        for (label, items) in [
            ("What you know about the user", &self.identity),
            ("Preferences", &self.preferences),
            ("Known solutions", &self.solutions),
            ("Recent context", &self.episodes),
        ] {
            if !items.is_empty() {
                sections.push(format!("{label}:\n- {}", items.join("\n- ")));
            }
        }
        if sections.is_empty() {
            None
        } else {
            Some(sections.join("\n\n"))
        }
    }
}

/// Read-only memory collaborator. Failures are non-fatal; the memory
/// section is simply omitted.
#[async_trait::async_trait]
pub trait MemoryProvider: Send + Sync {
    /// Load memory context relevant to the user's message.
    async fn context_for(&self, agent_id: &str, query: &str) -> Result<MemoryContext>;
}

/// Extracts inline text from document attachments.
#[async_trait::async_trait]
pub trait DocumentExtractor: Send + Sync {
    /// Extract plain text from a document.
    async fn extract_text(&self, attachment: &Attachment) -> Result<String>;
}

/// Transcribes audio attachments to text.
#[async_trait::async_trait]
pub trait AudioTranscriber: Send + Sync {
    /// Transcribe an audio attachment.
    async fn transcribe(&self, attachment: &Attachment) -> Result<String>;
}

/// What kind of payload an attachment carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    /// Inline image
    Image,
    /// Document to extract text from
    Document,
    /// Audio to transcribe
    Audio,
}

/// An attachment on a user turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    /// Payload kind
    pub kind: AttachmentKind,
    /// Display name
    pub name: String,
    /// MIME type
    pub media_type: String,
    /// Base64 payload
    pub data: String,
}

/// Outcome of attachment resolution.
#[derive(Debug, Default)]
pub struct ResolvedAttachments {
    /// Images to inline as native image blocks
    pub images: Vec<ImageContent>,
    /// Extracted/transcribed text sections
    pub inline_text: Vec<String>,
    /// Names of attachments that could not be used, with the reason
    pub skipped: Vec<String>,
}

impl ResolvedAttachments {
    /// Append the resolution outcome to the user's message text.
    #[must_use]
    pub fn augment_user_text(&self, user_text: &str) -> String {
        let mut text = user_text.to_string();
        for section in &self.inline_text {
            text.push_str("\n\n");
            text.push_str(section);
        }
        if !self.skipped.is_empty() {
            text.push_str("\n\n[Attachments skipped: ");
            text.push_str(&self.skipped.join(", "));
            text.push(']');
        }
        text
    }
}

/// Build the system prompt from its parts.
///
/// With caching on, the soul becomes the static block and everything
/// per-turn goes into the dynamic block. Only the native backend honors
/// the split; the others join the blocks.
#[must_use]
pub fn build_system_prompt(
    soul: &str,
    memory: Option<&MemoryContext>,
    skills_index: Option<&str>,
    suffix: Option<&str>,
    prompt_caching: bool,
) -> SystemPrompt {
    let mut dynamic_parts = Vec::new();
    if let Some(section) = memory.and_then(MemoryContext::render) {
        dynamic_parts.push(section);
    }
    if let Some(skills) = skills_index {
        if !skills.is_empty() {
            dynamic_parts.push(format!("Available skills:\n{skills}"));
        }
    }
    if let Some(suffix) = suffix {
        if !suffix.is_empty() {
            dynamic_parts.push(suffix.to_string());
        }
    }
    let dynamic = dynamic_parts.join("\n\n");

    if prompt_caching {
        SystemPrompt::Cached {
            static_part: soul.to_string(),
            dynamic_part: dynamic,
        }
    } else if dynamic.is_empty() {
        SystemPrompt::Plain(soul.to_string())
    } else {
        SystemPrompt::Plain(format!("{soul}\n\n{dynamic}"))
    }
}

/// Trim history to the newest messages fitting the character budget.
/// The most recent message is always kept.
#[must_use]
pub fn truncate_history(messages: Vec<Message>, char_budget: usize) -> Vec<Message> {
    let mut kept = Vec::new();
    let mut used = 0usize;
    for message in messages.into_iter().rev() {
        let weight = message.char_weight();
        if !kept.is_empty() && used + weight > char_budget {
            break;
        }
        used += weight;
        kept.push(message);
    }
    kept.reverse();
    // A cut between an assistant tool-call turn and its results would
    // open the window on orphaned tool results, which the native wire
    // format rejects
    let orphans = kept
        .iter()
        .take_while(|m| m.role == Role::Tool)
        .count();
    kept.drain(..orphans);
    kept
}

/// Resolve attachments into images, inline text, and a skipped list.
///
/// Images pass through only when the active backend supports vision.
/// Documents and audio go through collaborator services, each capped at
/// the configured budget. Missing collaborators and extraction failures
/// land in `skipped`, never in an error.
pub async fn resolve_attachments(
    attachments: &[Attachment],
    extractor: Option<&dyn DocumentExtractor>,
    transcriber: Option<&dyn AudioTranscriber>,
    supports_vision: bool,
    config: &RuntimeConfig,
) -> ResolvedAttachments {
    let mut resolved = ResolvedAttachments::default();
    for attachment in attachments {
        match attachment.kind {
            AttachmentKind::Image => {
                if supports_vision {
                    resolved.images.push(ImageContent {
                        media_type: attachment.media_type.clone(),
                        data: attachment.data.clone(),
                    });
                } else {
                    resolved
                        .skipped
                        .push(format!("{} (backend has no vision)", attachment.name));
                }
            }
            AttachmentKind::Document => match extractor {
                Some(extractor) => match extractor.extract_text(attachment).await {
                    Ok(text) => resolved.inline_text.push(format!(
                        "[Document: {}]\n{}",
                        attachment.name,
                        truncate_safe(&text, config.attachment_char_budget)
                    )),
                    Err(e) => {
                        debug!(name = %attachment.name, error = %e, "Document extraction failed");
                        resolved
                            .skipped
                            .push(format!("{} (extraction failed)", attachment.name));
                    }
                },
                None => resolved
                    .skipped
                    .push(format!("{} (no document extractor)", attachment.name)),
            },
            AttachmentKind::Audio => match transcriber {
                Some(transcriber) => match transcriber.transcribe(attachment).await {
                    Ok(text) => resolved.inline_text.push(format!(
                        "[Audio transcript: {}]\n{}",
                        attachment.name,
                        truncate_safe(&text, config.attachment_char_budget)
                    )),
                    Err(e) => {
                        debug!(name = %attachment.name, error = %e, "Transcription failed");
                        resolved
                            .skipped
                            .push(format!("{} (transcription failed)", attachment.name));
                    }
                },
                None => resolved
                    .skipped
                    .push(format!("{} (no transcriber)", attachment.name)),
            },
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caching_splits_static_and_dynamic() {
        let memory = MemoryContext {
            identity: vec!["Works nights.".into()],
            ..MemoryContext::default()
        };
        let prompt = build_system_prompt("soul text", Some(&memory), None, Some("suffix"), true);
        match prompt {
            SystemPrompt::Cached {
                static_part,
                dynamic_part,
            } => {
                assert_eq!(static_part, "soul text");
                assert!(dynamic_part.contains("Works nights."));
                assert!(dynamic_part.contains("suffix"));
            }
            SystemPrompt::Plain(_) => panic!("expected cached form"),
        }
    }

    #[test]
    fn no_caching_joins_everything() {
        let prompt = build_system_prompt("soul", None, Some("- search"), None, false);
        match prompt {
            SystemPrompt::Plain(text) => {
                assert!(text.starts_with("soul"));
                assert!(text.contains("Available skills"));
            }
            SystemPrompt::Cached { .. } => panic!("expected plain form"),
        }
    }

    #[test]
    fn empty_memory_renders_nothing() {
        assert!(MemoryContext::default().render().is_none());
    }

    #[test]
    fn truncation_keeps_newest_and_always_the_last() {
        let messages = vec![
            Message::user("a".repeat(100)),
            Message::assistant("b".repeat(100)),
            Message::user("c".repeat(100)),
        ];
        let kept = truncate_history(messages, 150);
        assert_eq!(kept.len(), 1);
        assert!(kept[0].content.starts_with('c'));

        let oversized = vec![Message::user("x".repeat(10_000))];
        assert_eq!(truncate_history(oversized, 10).len(), 1);
    }

    #[test]
    fn truncation_never_leads_with_orphaned_tool_results() {
        use volition_llm::{ToolCall, ToolResultBlock};

        let messages = vec![
            Message::user("a".repeat(100)),
            Message::assistant_with_tool_calls(
                "b".repeat(200),
                vec![ToolCall {
                    id: "c1".into(),
                    name: "get_weather".into(),
                    input: serde_json::json!({}),
                }],
            ),
            Message::tool_results(vec![ToolResultBlock {
                tool_call_id: "c1".into(),
                name: "get_weather".into(),
                content: "r".repeat(50),
                is_error: false,
            }]),
            Message::user("final"),
        ];
        // Budget cuts between the tool-call turn and its results
        let kept = truncate_history(messages, 100);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].role, Role::User);
        assert_eq!(kept[0].content, "final");
    }

    #[tokio::test]
    async fn images_skip_without_vision() {
        let attachments = vec![Attachment {
            kind: AttachmentKind::Image,
            name: "photo.png".into(),
            media_type: "image/png".into(),
            data: "aGk=".into(),
        }];
        let config = RuntimeConfig::default();
        let resolved = resolve_attachments(&attachments, None, None, false, &config).await;
        assert!(resolved.images.is_empty());
        assert_eq!(resolved.skipped.len(), 1);

        let resolved = resolve_attachments(&attachments, None, None, true, &config).await;
        assert_eq!(resolved.images.len(), 1);
        assert!(resolved.skipped.is_empty());
    }

    #[tokio::test]
    async fn missing_collaborators_skip_not_fail() {
        let attachments = vec![Attachment {
            kind: AttachmentKind::Document,
            name: "notes.pdf".into(),
            media_type: "application/pdf".into(),
            data: String::new(),
        }];
        let config = RuntimeConfig::default();
        let resolved = resolve_attachments(&attachments, None, None, true, &config).await;
        assert!(resolved.inline_text.is_empty());
        assert_eq!(resolved.skipped.len(), 1);

        let text = resolved.augment_user_text("check this");
        assert!(text.contains("Attachments skipped"));
        assert!(text.contains("notes.pdf"));
    }
}
