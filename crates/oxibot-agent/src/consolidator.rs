//! Memory Consolidator — folds aged session turns into long-term memory.
//!
//! Triggered by the agent loop (never more than once
//! concurrently per session) once a session's live message window exceeds
//! `memory_window`, and synchronously-scheduled-asynchronously on `/new`.
//!
//! Any failure (LLM error, malformed JSON, I/O) is logged and swallowed —
//! the session's consolidation cursor is left untouched, so the same
//! window of messages is retried on the next trigger.

use std::sync::Arc;

use oxibot_core::session::SessionManager;
use oxibot_core::types::{Message, MessageContent, Session};
use oxibot_providers::traits::{LlmProvider, LlmRequestConfig};
use tracing::{debug, info, warn};

use crate::memory::MemoryStore;

/// Consolidates aged session history into `MEMORY.md` + `HISTORY.md`.
pub struct MemoryConsolidator {
    provider: Arc<dyn LlmProvider>,
    model: String,
    memory: Arc<MemoryStore>,
    sessions: Arc<SessionManager>,
    memory_window: usize,
}

impl MemoryConsolidator {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        model: String,
        memory: Arc<MemoryStore>,
        sessions: Arc<SessionManager>,
        memory_window: usize,
    ) -> Self {
        Self {
            provider,
            model,
            memory,
            sessions,
            memory_window,
        }
    }

    /// Consolidate a session's aged history.
    ///
    /// `archive_all` is used by `/new`: the entire message log passed in
    /// `session` is folded and the cursor reset to 0, regardless of
    /// `memory_window`. Normal mode only folds the half of the window past
    /// the current cursor, keeping the most recent `memory_window / 2`
    /// messages live.
    ///
    /// Returns `Ok(Some(new_cursor))` if consolidation ran and produced an
    /// update, `Ok(None)` if there was nothing to do. Errors are not
    /// returned to the caller in practice — the agent loop calls this from
    /// a detached background task and only logs failures — but the
    /// `Result` return keeps the method testable.
    pub async fn consolidate(&self, session: &Session, archive_all: bool) -> anyhow::Result<Option<usize>> {
        let keep_count = if archive_all { 0 } else { self.memory_window / 2 };

        let (start, old_messages, new_cursor): (usize, &[Message], usize) = if archive_all {
            info!(
                session = %session.key,
                count = session.messages.len(),
                "memory consolidation (archive_all)"
            );
            (0, &session.messages[..], 0)
        } else {
            if session.messages.len() <= keep_count {
                debug!(
                    session = %session.key,
                    messages = session.messages.len(),
                    keep = keep_count,
                    "no consolidation needed"
                );
                return Ok(None);
            }
            let upper = session.messages.len() - keep_count;
            if upper <= session.last_consolidated_index {
                debug!(
                    session = %session.key,
                    last_consolidated = session.last_consolidated_index,
                    total = session.messages.len(),
                    "no new messages to consolidate"
                );
                return Ok(None);
            }
            let slice = &session.messages[session.last_consolidated_index..upper];
            if slice.is_empty() {
                return Ok(None);
            }
            info!(
                session = %session.key,
                total = session.messages.len(),
                new = slice.len(),
                keep = keep_count,
                "memory consolidation started"
            );
            (session.last_consolidated_index, slice, upper)
        };

        let conversation = render_for_consolidation(session, start, old_messages);
        let current_memory = self.memory.read_long_term();

        let prompt = build_prompt(&current_memory, &conversation);

        let response = self
            .provider
            .chat(
                &[
                    Message::system("You are a memory consolidation agent. Respond only with valid JSON."),
                    Message::user(prompt),
                ],
                None,
                &self.model,
                &LlmRequestConfig::default(),
            )
            .await;

        let text = response.content.unwrap_or_default();
        let text = text.trim();
        if text.is_empty() {
            warn!(session = %session.key, "memory consolidation: LLM returned empty response, skipping");
            return Ok(None);
        }

        let stripped = strip_code_fence(text);
        let parsed = match repair_parse_json(stripped) {
            Some(v) => v,
            None => {
                warn!(
                    session = %session.key,
                    preview = %stripped.chars().take(200).collect::<String>(),
                    "memory consolidation: could not parse LLM response as JSON, skipping"
                );
                return Ok(None);
            }
        };

        let obj = match parsed.as_object() {
            Some(o) => o,
            None => {
                warn!(session = %session.key, "memory consolidation: response was not a JSON object, skipping");
                return Ok(None);
            }
        };

        if let Some(entry_val) = obj.get("history_entry") {
            if !entry_val.is_null() {
                let entry = stringify_defensive(entry_val);
                if !entry.is_empty() {
                    if let Err(e) = self.memory.append_history(&entry) {
                        warn!(session = %session.key, error = %e, "failed to append history entry");
                    }
                }
            }
        }

        if let Some(update_val) = obj.get("memory_update") {
            if !update_val.is_null() {
                let update = stringify_defensive(update_val);
                if !update.is_empty() && update != current_memory {
                    if let Err(e) = self.memory.write_long_term(&update) {
                        warn!(session = %session.key, error = %e, "failed to write long-term memory");
                    }
                }
            }
        }

        self.sessions.set_consolidated_index(&session.key, new_cursor);
        info!(
            session = %session.key,
            messages = session.messages.len(),
            last_consolidated = new_cursor,
            "memory consolidation done"
        );

        Ok(Some(new_cursor))
    }
}

/// Render a slice of session messages as grep-friendly lines for the
/// consolidation prompt: `[YYYY-MM-DD HH:MM] ROLE [tools: a, b]: content`.
///
/// `start` is the index of `messages[0]` within `session.messages`, used to
/// look up each line's real timestamp via `session.timestamp_for`.
fn render_for_consolidation(session: &Session, start: usize, messages: &[Message]) -> String {
    let mut lines = Vec::new();
    for (offset, m) in messages.iter().enumerate() {
        let (role, content, tools_used) = match m {
            Message::System { content } => ("SYSTEM", Some(content.clone()), None),
            Message::User { content } => ("USER", message_content_text(content), None),
            Message::Assistant { content, tools_used, .. } => {
                ("ASSISTANT", content.clone(), tools_used.clone())
            }
            Message::Tool { content, .. } => ("TOOL", Some(content.clone()), None),
        };
        let Some(content) = content else { continue };
        if content.is_empty() {
            continue;
        }
        let tools = match &tools_used {
            Some(names) if !names.is_empty() => format!(" [tools: {}]", names.join(", ")),
            _ => String::new(),
        };
        let ts = session.timestamp_for(start + offset).format("%Y-%m-%d %H:%M");
        lines.push(format!("[{ts}] {role}{tools}: {content}"));
    }
    lines.join("\n")
}

fn message_content_text(content: &MessageContent) -> Option<String> {
    match content {
        MessageContent::Text(t) => Some(t.clone()),
        MessageContent::Parts(parts) => {
            let text: String = parts
                .iter()
                .filter_map(|p| match p {
                    oxibot_core::types::ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(" ");
            if text.is_empty() { None } else { Some(text) }
        }
    }
}

fn build_prompt(current_memory: &str, conversation: &str) -> String {
    let current_memory = if current_memory.trim().is_empty() {
        "(empty)"
    } else {
        current_memory
    };
    format!(
        "You are a memory consolidation agent. Process this conversation and return a JSON object with exactly two keys:\n\n\
         1. \"history_entry\": A paragraph (2-5 sentences) summarizing the key events/decisions/topics. Start with a timestamp like [YYYY-MM-DD HH:MM]. Include enough detail to be useful when found by grep search later.\n\n\
         2. \"memory_update\": The updated long-term memory content. Add any new facts: user location, preferences, personal info, habits, project context, technical decisions, tools/services used. If nothing new, return the existing content unchanged.\n\n\
         ## Current Long-term Memory\n{current_memory}\n\n\
         ## Conversation to Process\n{conversation}\n\n\
         **IMPORTANT**: Both values MUST be strings, not objects or arrays.\n\n\
         Example:\n\
         {{\n  \"history_entry\": \"[2026-02-14 22:50] User asked about...\",\n  \"memory_update\": \"- Host: HARRYBOOK-T14P\\n- Name: Nado\"\n}}\n\n\
         Respond with ONLY valid JSON, no markdown fences."
    )
}

fn strip_code_fence(text: &str) -> &str {
    if let Some(rest) = text.strip_prefix("```") {
        let rest = rest.trim_start_matches("json").trim_start();
        if let Some(idx) = rest.rfind("```") {
            return rest[..idx].trim();
        }
        return rest.trim();
    }
    text
}

fn stringify_defensive(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Forgiving JSON parse: tries strict parsing first, then falls back to
/// extracting the outermost `{...}` span and stripping trailing commas
/// before the closing bracket/brace — the handful of malformations LLMs
/// actually produce when asked for "JSON only".
fn repair_parse_json(text: &str) -> Option<serde_json::Value> {
    if let Ok(v) = serde_json::from_str(text) {
        return Some(v);
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    let candidate = &text[start..=end];
    if let Ok(v) = serde_json::from_str(candidate) {
        return Some(v);
    }

    let cleaned = remove_trailing_commas(candidate);
    serde_json::from_str(&cleaned).ok()
}

fn remove_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == ',' {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                i += 1;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }
    out
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use oxibot_core::types::{LlmResponse, ToolDefinition};

    struct MockProvider {
        response: std::sync::Mutex<Option<String>>,
    }

    impl MockProvider {
        fn new(text: &str) -> Self {
            Self { response: std::sync::Mutex::new(Some(text.to_string())) }
        }
    }

    #[async_trait]
    impl LlmProvider for MockProvider {
        async fn chat(
            &self,
            _messages: &[Message],
            _tools: Option<&[ToolDefinition]>,
            _model: &str,
            _config: &LlmRequestConfig,
        ) -> LlmResponse {
            let text = self.response.lock().unwrap().clone();
            LlmResponse { content: text, ..Default::default() }
        }
        fn default_model(&self) -> &str { "mock" }
        fn display_name(&self) -> &str { "mock" }
    }

    fn make_consolidator(
        provider: Arc<dyn LlmProvider>,
        workspace: &std::path::Path,
        window: usize,
    ) -> (MemoryConsolidator, Arc<SessionManager>) {
        let memory = Arc::new(MemoryStore::new(workspace).unwrap());
        let sessions = Arc::new(
            SessionManager::new(Some(workspace.join("sessions"))).unwrap(),
        );
        let consolidator = MemoryConsolidator::new(
            provider,
            "mock-model".into(),
            memory,
            sessions.clone(),
            window,
        );
        (consolidator, sessions)
    }

    #[tokio::test]
    async fn test_consolidate_normal_mode_folds_and_advances_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let response = serde_json::json!({
            "history_entry": "[2026-07-20 10:00] User discussed Rust traits.",
            "memory_update": "- Likes Rust"
        })
        .to_string();
        let provider = Arc::new(MockProvider::new(&response));
        let (consolidator, sessions) = make_consolidator(provider, dir.path(), 4);

        for i in 0..10 {
            sessions.add_message("test:1", Message::user(format!("msg {i}")));
        }
        let session = sessions.get_session("test:1");

        let result = consolidator.consolidate(&session, false).await.unwrap();
        assert!(result.is_some());

        let updated = sessions.get_session("test:1");
        assert_eq!(updated.last_consolidated_index, 8); // len(10) - keep(2)

        let history = consolidator.memory.read_history();
        assert!(history.contains("Rust traits"));
        let memory = consolidator.memory.read_long_term();
        assert_eq!(memory, "- Likes Rust");
    }

    #[tokio::test]
    async fn test_consolidate_archive_all_resets_cursor_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let response = serde_json::json!({
            "history_entry": "[2026-07-20 10:00] Entire old session archived.",
            "memory_update": "- Archived facts"
        })
        .to_string();
        let provider = Arc::new(MockProvider::new(&response));
        let (consolidator, sessions) = make_consolidator(provider, dir.path(), 50);

        let mut session = Session::new("test:archived");
        session.push_message(Message::user("hello"));
        session.push_message(Message::assistant("hi"));

        let result = consolidator.consolidate(&session, true).await.unwrap();
        assert_eq!(result, Some(0));

        let history = consolidator.memory.read_history();
        assert!(history.contains("archived"));
        let _ = sessions; // silence unused in this archive_all path
    }

    #[tokio::test]
    async fn test_consolidate_no_messages_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockProvider::new("{}"));
        let (consolidator, sessions) = make_consolidator(provider, dir.path(), 50);

        sessions.add_message("test:1", Message::user("hi"));
        let session = sessions.get_session("test:1");

        let result = consolidator.consolidate(&session, false).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_consolidate_handles_code_fenced_response() {
        let dir = tempfile::tempdir().unwrap();
        let response = format!(
            "```json\n{}\n```",
            serde_json::json!({"history_entry": "[2026-07-20 10:00] Fenced.", "memory_update": "fact"})
        );
        let provider = Arc::new(MockProvider::new(&response));
        let (consolidator, sessions) = make_consolidator(provider, dir.path(), 2);

        for i in 0..5 {
            sessions.add_message("test:1", Message::user(format!("m{i}")));
        }
        let session = sessions.get_session("test:1");

        let result = consolidator.consolidate(&session, false).await.unwrap();
        assert!(result.is_some());
        assert!(consolidator.memory.read_history().contains("Fenced."));
    }

    #[tokio::test]
    async fn test_consolidate_malformed_json_leaves_cursor_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(MockProvider::new("not json at all, sorry"));
        let (consolidator, sessions) = make_consolidator(provider, dir.path(), 2);

        for i in 0..5 {
            sessions.add_message("test:1", Message::user(format!("m{i}")));
        }
        let before = sessions.get_session("test:1");
        let result = consolidator.consolidate(&before, false).await.unwrap();
        assert!(result.is_none());

        let after = sessions.get_session("test:1");
        assert_eq!(after.last_consolidated_index, before.last_consolidated_index);
        assert_eq!(after.last_consolidated_index, 0);
    }

    #[tokio::test]
    async fn test_consolidate_defensively_stringifies_non_string_fields() {
        let dir = tempfile::tempdir().unwrap();
        let response = serde_json::json!({
            "history_entry": {"note": "llm returned an object here"},
            "memory_update": ["a", "list", "instead", "of", "a", "string"]
        })
        .to_string();
        let provider = Arc::new(MockProvider::new(&response));
        let (consolidator, sessions) = make_consolidator(provider, dir.path(), 2);

        for i in 0..5 {
            sessions.add_message("test:1", Message::user(format!("m{i}")));
        }
        let session = sessions.get_session("test:1");
        let result = consolidator.consolidate(&session, false).await.unwrap();
        assert!(result.is_some());

        // Both fields got stringified rather than rejected.
        assert!(consolidator.memory.read_history().contains("llm returned an object here"));
        assert!(consolidator.memory.read_long_term().contains("a list"));
    }

    #[test]
    fn test_render_for_consolidation_skips_empty_content_and_includes_tools() {
        let mut session = Session::new("test:render");
        session.push_message(Message::user("hello"));
        session.push_message(Message::assistant_with_tools("did a thing", vec!["web_search".into()]));
        session.push_message(Message::assistant("")); // empty content, skipped

        let rendered = render_for_consolidation(&session, 0, &session.messages.clone());
        assert!(rendered.contains("USER: hello"));
        assert!(rendered.contains("ASSISTANT [tools: web_search]: did a thing"));
        assert_eq!(rendered.lines().count(), 2);
        // Each surviving line carries a [YYYY-MM-DD HH:MM] prefix.
        assert!(rendered.lines().all(|l| l.starts_with('[')));
    }

    #[test]
    fn test_repair_parse_json_handles_trailing_comma() {
        let text = r#"{"history_entry": "a", "memory_update": "b",}"#;
        let parsed = repair_parse_json(text).unwrap();
        assert_eq!(parsed["history_entry"], "a");
    }

    #[test]
    fn test_repair_parse_json_extracts_braces_from_prose() {
        let text = "Sure, here you go:\n{\"history_entry\": \"x\", \"memory_update\": \"y\"}\nHope that helps!";
        let parsed = repair_parse_json(text).unwrap();
        assert_eq!(parsed["memory_update"], "y");
    }

    #[test]
    fn test_strip_code_fence_plain_backticks() {
        let text = "```\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fence(text), "{\"a\": 1}");
    }
}
