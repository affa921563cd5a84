//! Session persistence and caching.
//!
//! File format: one JSON file per session key, under `<root>/sessions/<safe_key>.json`.
//! Writes are atomic (write to a `.tmp` sibling, then rename over the target)
//! so a reader never observes a half-written file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::types::{Message, Session};
use crate::utils;

// ─────────────────────────────────────────────
// SessionManager
// ─────────────────────────────────────────────

/// Manages conversation sessions with in-memory caching and atomic JSON
/// persistence.
///
/// Thread-safe via `RwLock` — multiple readers, exclusive writer. The
/// Agent Loop is the sole foreground mutator; it serializes per-key work
/// itself, so this store only needs to guard the cache map, not individual
/// sessions.
pub struct SessionManager {
    /// Directory where `.json` session files are stored.
    sessions_dir: PathBuf,
    /// In-memory cache of active sessions.
    cache: RwLock<HashMap<String, Session>>,
}

impl SessionManager {
    /// Create a new session manager.
    ///
    /// `sessions_dir` defaults to `~/.oxibot/sessions/` if `None`.
    /// The directory is created if it doesn't exist.
    pub fn new(sessions_dir: Option<PathBuf>) -> std::io::Result<Self> {
        let dir = sessions_dir.unwrap_or_else(utils::get_sessions_path);
        std::fs::create_dir_all(&dir)?;

        Ok(SessionManager {
            sessions_dir: dir,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Get an existing session or create a new one.
    ///
    /// 1. Check in-memory cache
    /// 2. Try to load from disk
    /// 3. Create new empty session
    pub fn get_or_create(&self, key: &str) -> Session {
        {
            let cache = self.cache.read().unwrap();
            if let Some(session) = cache.get(key) {
                return session.clone();
            }
        }

        if let Some(session) = self.load_from_disk(key) {
            let mut cache = self.cache.write().unwrap();
            cache.insert(key.to_string(), session.clone());
            return session;
        }

        let session = Session::new(key);
        let mut cache = self.cache.write().unwrap();
        cache.insert(key.to_string(), session.clone());
        session
    }

    /// Append a message to a session and persist to disk.
    pub fn add_message(&self, key: &str, message: Message) {
        let mut session = self.get_or_create(key);
        session.push_message(message);
        session.updated_at = Utc::now();
        self.commit(session);
    }

    /// Get the last `max_messages` from a session's history.
    pub fn get_history(&self, key: &str, max_messages: usize) -> Vec<Message> {
        let session = self.get_or_create(key);
        let len = session.messages.len();
        if len <= max_messages {
            session.messages
        } else {
            session.messages[len - max_messages..].to_vec()
        }
    }

    /// Get the full session (for consolidation, which needs the whole log
    /// plus the current cursor).
    pub fn get_session(&self, key: &str) -> Session {
        self.get_or_create(key)
    }

    /// Replace a session wholesale (used by the consolidator to advance
    /// `last_consolidated_index` after a successful run). The caller is
    /// responsible for only mutating the cursor, per the single-writer
    /// contract — the Agent Loop owns `messages`.
    pub fn save_session(&self, session: Session) {
        self.commit(session);
    }

    /// Reset a session's `last_consolidated_index`, leaving the cursor at
    /// `index`. Used after a successful consolidation run.
    pub fn set_consolidated_index(&self, key: &str, index: usize) {
        let mut session = self.get_or_create(key);
        session.last_consolidated_index = index.min(session.messages.len());
        self.commit(session);
    }

    /// Clear all messages in a session (reset conversation) and reset the
    /// consolidation cursor to 0. Used by `/new`.
    pub fn clear(&self, key: &str) {
        let mut session = self.get_or_create(key);
        session.messages.clear();
        session.message_timestamps.clear();
        session.last_consolidated_index = 0;
        session.updated_at = Utc::now();
        self.commit(session);
    }

    /// Drop the in-memory cached copy of a session, forcing the next
    /// `get_or_create` to reload from disk.
    pub fn invalidate(&self, key: &str) {
        let mut cache = self.cache.write().unwrap();
        cache.remove(key);
    }

    /// Delete a session entirely (from cache and disk).
    pub fn delete(&self, key: &str) -> bool {
        {
            let mut cache = self.cache.write().unwrap();
            cache.remove(key);
        }

        let path = self.session_path(key);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("Failed to delete session file: {}", e);
                return false;
            }
            debug!("Deleted session file: {}", path.display());
            true
        } else {
            false
        }
    }

    /// List all sessions from disk, without loading message bodies.
    ///
    /// Returns summaries sorted by `updated_at` (newest first).
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut summaries = Vec::new();

        let entries = match std::fs::read_dir(&self.sessions_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to read sessions directory: {}", e);
                return summaries;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }

            if let Ok(content) = std::fs::read_to_string(&path) {
                if let Ok(session) = serde_json::from_str::<Session>(&content) {
                    summaries.push(SessionSummary {
                        key: session.key,
                        created_at: session.created_at,
                        updated_at: session.updated_at,
                        message_count: session.messages.len(),
                        path: path.clone(),
                    });
                }
            }
        }

        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries
    }

    /// Get the JSON file path for a session key.
    fn session_path(&self, key: &str) -> PathBuf {
        let safe_key = utils::safe_filename(&key.replace(':', "_"));
        self.sessions_dir.join(format!("{}.json", safe_key))
    }

    /// Load a session from its JSON file.
    fn load_from_disk(&self, key: &str) -> Option<Session> {
        let path = self.session_path(key);
        if !path.exists() {
            return None;
        }

        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Failed to read session file {}: {}", path.display(), e);
                return None;
            }
        };

        match serde_json::from_str::<Session>(&content) {
            Ok(session) => {
                debug!(
                    "Loaded session '{}' with {} messages from disk",
                    key,
                    session.messages.len()
                );
                Some(session)
            }
            Err(e) => {
                warn!("Failed to parse session file {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Update the cache and persist atomically: write to `<path>.tmp`,
    /// then rename over the target. The rename is atomic on POSIX
    /// filesystems, so a concurrent reader never observes a partial write.
    fn commit(&self, session: Session) {
        let key = session.key.clone();
        {
            let mut cache = self.cache.write().unwrap();
            cache.insert(key.clone(), session.clone());
        }
        if let Err(e) = self.save_to_disk(&session) {
            warn!("Failed to persist session {}: {}", key, e);
        }
    }

    fn save_to_disk(&self, session: &Session) -> std::io::Result<()> {
        let path = self.session_path(&session.key);
        let tmp_path = path.with_extension("json.tmp");

        let body = serde_json::to_string_pretty(session)?;
        std::fs::write(&tmp_path, body)?;
        std::fs::rename(&tmp_path, &path)?;

        debug!(
            "Saved session '{}' ({} messages) to {}",
            session.key,
            session.messages.len(),
            path.display()
        );
        Ok(())
    }
}

/// Summary of a session for listing purposes.
#[derive(Clone, Debug)]
pub struct SessionSummary {
    /// Session key (e.g. `"telegram:12345"`).
    pub key: String,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// When the session was last updated.
    pub updated_at: DateTime<Utc>,
    /// Number of messages currently in the session.
    pub message_count: usize,
    /// Path to the JSON file.
    pub path: PathBuf,
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_manager() -> (SessionManager, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let mgr = SessionManager::new(Some(dir.path().to_path_buf())).unwrap();
        (mgr, dir)
    }

    #[test]
    fn test_get_or_create_new_session() {
        let (mgr, _dir) = make_manager();
        let session = mgr.get_or_create("telegram:12345");
        assert_eq!(session.key, "telegram:12345");
        assert!(session.messages.is_empty());
        assert_eq!(session.last_consolidated_index, 0);
    }

    #[test]
    fn test_get_or_create_returns_cached() {
        let (mgr, _dir) = make_manager();
        mgr.add_message("test:1", Message::user("hello"));
        let session = mgr.get_or_create("test:1");
        assert_eq!(session.messages.len(), 1);
    }

    #[test]
    fn test_add_message() {
        let (mgr, _dir) = make_manager();
        mgr.add_message("test:1", Message::user("hello"));
        mgr.add_message("test:1", Message::assistant("hi there!"));

        let session = mgr.get_or_create("test:1");
        assert_eq!(session.messages.len(), 2);
    }

    #[test]
    fn test_get_history() {
        let (mgr, _dir) = make_manager();
        for i in 0..10 {
            mgr.add_message("test:1", Message::user(format!("msg {}", i)));
        }

        let history = mgr.get_history("test:1", 3);
        assert_eq!(history.len(), 3);
        match &history[0] {
            Message::User { content: crate::types::MessageContent::Text(text), .. } => {
                assert_eq!(text, "msg 7");
            }
            _ => panic!("Expected user message"),
        }
    }

    #[test]
    fn test_get_history_less_than_max() {
        let (mgr, _dir) = make_manager();
        mgr.add_message("test:1", Message::user("one"));
        mgr.add_message("test:1", Message::user("two"));

        let history = mgr.get_history("test:1", 50);
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_clear_session_resets_cursor() {
        let (mgr, _dir) = make_manager();
        mgr.add_message("test:1", Message::user("hello"));
        mgr.add_message("test:1", Message::assistant("hi"));
        mgr.set_consolidated_index("test:1", 1);

        mgr.clear("test:1");

        let session = mgr.get_or_create("test:1");
        assert!(session.messages.is_empty());
        assert_eq!(session.last_consolidated_index, 0);
    }

    #[test]
    fn test_set_consolidated_index_clamped() {
        let (mgr, _dir) = make_manager();
        mgr.add_message("test:1", Message::user("hello"));
        mgr.set_consolidated_index("test:1", 500);
        let session = mgr.get_or_create("test:1");
        assert_eq!(session.last_consolidated_index, 1);
    }

    #[test]
    fn test_delete_session() {
        let (mgr, _dir) = make_manager();
        mgr.add_message("test:1", Message::user("hello"));

        let existed = mgr.delete("test:1");
        assert!(existed);

        let session = mgr.get_or_create("test:1");
        assert!(session.messages.is_empty());
    }

    #[test]
    fn test_delete_nonexistent() {
        let (mgr, _dir) = make_manager();
        let existed = mgr.delete("nonexistent:key");
        assert!(!existed);
    }

    #[test]
    fn test_invalidate_forces_disk_reload() {
        let (mgr, _dir) = make_manager();
        mgr.add_message("test:1", Message::user("hello"));
        mgr.invalidate("test:1");
        // Cache miss forces a disk load, which should still see the message.
        let session = mgr.get_or_create("test:1");
        assert_eq!(session.messages.len(), 1);
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempdir().unwrap();

        {
            let mgr = SessionManager::new(Some(dir.path().to_path_buf())).unwrap();
            mgr.add_message("telegram:42", Message::system("You are Oxibot."));
            mgr.add_message("telegram:42", Message::user("Hello"));
            mgr.add_message("telegram:42", Message::assistant("Hi! How can I help?"));
        }

        {
            let mgr = SessionManager::new(Some(dir.path().to_path_buf())).unwrap();
            let session = mgr.get_or_create("telegram:42");
            assert_eq!(session.messages.len(), 3);
            assert_eq!(session.key, "telegram:42");
        }
    }

    #[test]
    fn test_session_file_is_atomic_write_no_leftover_tmp() {
        let dir = tempdir().unwrap();
        let mgr = SessionManager::new(Some(dir.path().to_path_buf())).unwrap();

        mgr.add_message("cli:local", Message::user("test message"));

        let path = dir.path().join("cli_local.json");
        assert!(path.exists());
        assert!(!dir.path().join("cli_local.json.tmp").exists());

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["key"], "cli:local");
        assert_eq!(parsed["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_list_sessions() {
        let dir = tempdir().unwrap();
        let mgr = SessionManager::new(Some(dir.path().to_path_buf())).unwrap();

        mgr.add_message("telegram:1", Message::user("a"));
        mgr.add_message("discord:2", Message::user("b"));
        mgr.add_message("cli:3", Message::user("c"));

        let sessions = mgr.list_sessions();
        assert_eq!(sessions.len(), 3);
        let keys: Vec<&str> = sessions.iter().map(|s| s.key.as_str()).collect();
        assert!(keys.contains(&"telegram:1"));
        assert!(keys.contains(&"discord:2"));
        assert!(keys.contains(&"cli:3"));
    }

    #[test]
    fn test_multiple_sessions_independent() {
        let (mgr, _dir) = make_manager();
        mgr.add_message("a:1", Message::user("hello a"));
        mgr.add_message("b:2", Message::user("hello b"));
        mgr.add_message("b:2", Message::user("hello b again"));

        assert_eq!(mgr.get_history("a:1", 50).len(), 1);
        assert_eq!(mgr.get_history("b:2", 50).len(), 2);
    }

    #[test]
    fn test_clear_persists_to_disk() {
        let dir = tempdir().unwrap();

        {
            let mgr = SessionManager::new(Some(dir.path().to_path_buf())).unwrap();
            mgr.add_message("test:1", Message::user("hello"));
            mgr.add_message("test:1", Message::assistant("hi"));
            mgr.clear("test:1");
        }

        {
            let mgr = SessionManager::new(Some(dir.path().to_path_buf())).unwrap();
            let session = mgr.get_or_create("test:1");
            assert!(session.messages.is_empty());
        }
    }
}
