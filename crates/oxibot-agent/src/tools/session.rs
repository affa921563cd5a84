//! Session tool — lets the agent create, inspect, and manage conversation
//! sessions directly, separate from the one it's currently running in.
//!
//! Tool surface for session management (new/clear/list).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use oxibot_core::session::manager::SessionManager;

use super::base::{optional_string, Tool};

/// Manage conversation sessions: create, list, inspect, clear, delete.
pub struct SessionTool {
    sessions: Arc<SessionManager>,
}

impl SessionTool {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Tool for SessionTool {
    fn name(&self) -> &str {
        "session"
    }

    fn description(&self) -> &str {
        "Manage conversation sessions. Actions: create (new isolated session), \
         list (all sessions), info (details for a key), switch (acknowledge a \
         session key), clear (wipe messages), delete (remove entirely)."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["create", "list", "info", "switch", "clear", "delete"],
                    "description": "Action to perform"
                },
                "key": {
                    "type": "string",
                    "description": "Session key, e.g. 'discord:123456' or 'isolated:<uuid>'"
                }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, params: HashMap<String, Value>) -> anyhow::Result<String> {
        let action = optional_string(&params, "action").unwrap_or_else(|| "list".to_string());
        let key = optional_string(&params, "key");

        match action.to_lowercase().as_str() {
            "create" => {
                let new_key = format!("isolated:{}", Uuid::new_v4());
                let mut session = self.sessions.get_or_create(&new_key);
                session
                    .metadata
                    .insert("created_by".to_string(), "session_tool".to_string());
                session
                    .metadata
                    .insert("isolated".to_string(), "true".to_string());
                self.sessions.save_session(session);
                Ok(format!("[VERIFIED] Created new isolated session: {new_key}"))
            }
            "list" => {
                let sessions = self.sessions.list_sessions();
                if sessions.is_empty() {
                    return Ok("No sessions found.".to_string());
                }
                let mut lines = vec!["[SESSIONS]".to_string()];
                for s in sessions.iter().take(20) {
                    lines.push(format!(
                        "- {} (updated: {})",
                        s.key,
                        s.updated_at.format("%Y-%m-%dT%H:%M:%S")
                    ));
                }
                if sessions.len() > 20 {
                    lines.push(format!("... and {} more", sessions.len() - 20));
                }
                Ok(lines.join("\n"))
            }
            "info" => {
                let Some(key) = key else {
                    return Ok("Error: key required for info action".to_string());
                };
                let session = self.sessions.get_or_create(&key);
                let isolated = session.is_isolated();
                Ok(format!(
                    "[SESSION INFO]\nKey: {}\nIsolated: {}\nMessages: {}\nCreated: {}\nUpdated: {}",
                    key,
                    isolated,
                    session.messages.len(),
                    session.created_at.format("%Y-%m-%dT%H:%M:%S"),
                    session.updated_at.format("%Y-%m-%dT%H:%M:%S"),
                ))
            }
            "switch" => {
                let Some(key) = key else {
                    return Ok("Error: key required for switch action".to_string());
                };
                self.sessions.get_or_create(&key);
                Ok(format!("[VERIFIED] Switched to session: {key}"))
            }
            "clear" => {
                let Some(key) = key else {
                    return Ok("Error: key required for clear action".to_string());
                };
                self.sessions.clear(&key);
                Ok(format!("[VERIFIED] Cleared session: {key}"))
            }
            "delete" => {
                let Some(key) = key else {
                    return Ok("Error: key required for delete action".to_string());
                };
                if self.sessions.delete(&key) {
                    Ok(format!("[VERIFIED] Deleted session: {key}"))
                } else {
                    Ok(format!("Session not found: {key}"))
                }
            }
            other => Ok(format!(
                "Unknown action: {other}. Use: create, list, info, switch, clear, delete"
            )),
        }
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
