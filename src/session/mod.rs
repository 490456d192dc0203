//! Per-session conversation history.
//!
//! Sessions are JSON files under `data/sessions/<id>.json`. Appends are
//! serialized per session; the file is written to a temp path and renamed
//! so readers always observe a committed snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

/// One query/answer pair in a session log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationExchange {
    pub query: String,
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// On-disk session document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub exchanges: Vec<ConversationExchange>,
}

impl SessionData {
    fn new(session_id: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            created_at: now,
            updated_at: now,
            exchanges: Vec::new(),
        }
    }
}

/// File-backed session store with per-session write serialization.
pub struct SessionStore {
    sessions_dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Result<Self> {
        let sessions_dir = sessions_dir.into();
        std::fs::create_dir_all(&sessions_dir)
            .map_err(|e| Error::Storage(format!("Cannot create sessions dir: {e}")))?;
        Ok(Self {
            sessions_dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Create the session file if it does not exist; returns the id
    /// (a fresh UUID when none is given).
    pub async fn get_or_create(&self, session_id: Option<&str>) -> Result<String> {
        let id = match session_id {
            Some(id) => validate_session_id(id)?.to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };
        let _guard = self.lock_for(&id).await;
        if !self.session_path(&id).exists() {
            self.write_session(&SessionData::new(&id)).await?;
            debug!(session = %id, "[session] created");
        }
        Ok(id)
    }

    /// Append an exchange. Creates the session when missing. Appends for a
    /// given session happen in call order; cross-session order is not
    /// defined.
    pub async fn append_exchange(
        &self,
        session_id: &str,
        query: &str,
        response: &str,
        classification: Option<serde_json::Value>,
    ) -> Result<()> {
        validate_session_id(session_id)?;
        let _guard = self.lock_for(session_id).await;

        let mut data = self
            .read_session(session_id)
            .await?
            .unwrap_or_else(|| SessionData::new(session_id));

        data.exchanges.push(ConversationExchange {
            query: query.to_string(),
            response: response.to_string(),
            classification,
            timestamp: Utc::now(),
        });
        data.updated_at = Utc::now();
        self.write_session(&data).await
    }

    /// Last `max_exchanges` exchanges in append order.
    pub async fn history(
        &self,
        session_id: &str,
        max_exchanges: usize,
    ) -> Result<Vec<ConversationExchange>> {
        validate_session_id(session_id)?;
        let Some(data) = self.read_session(session_id).await? else {
            return Ok(Vec::new());
        };
        let skip = data.exchanges.len().saturating_sub(max_exchanges);
        Ok(data.exchanges.into_iter().skip(skip).collect())
    }

    /// Remove all exchanges but keep the session.
    pub async fn clear(&self, session_id: &str) -> Result<bool> {
        validate_session_id(session_id)?;
        let _guard = self.lock_for(session_id).await;
        let Some(mut data) = self.read_session(session_id).await? else {
            return Ok(false);
        };
        data.exchanges.clear();
        data.updated_at = Utc::now();
        self.write_session(&data).await?;
        Ok(true)
    }

    /// Delete the session file entirely.
    pub async fn delete(&self, session_id: &str) -> Result<bool> {
        validate_session_id(session_id)?;
        let _guard = self.lock_for(session_id).await;
        let path = self.session_path(session_id);
        if !path.exists() {
            return Ok(false);
        }
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| Error::Storage(format!("Cannot delete session: {e}")))?;
        Ok(true)
    }

    /// Whether a session file exists.
    pub fn exists(&self, session_id: &str) -> bool {
        validate_session_id(session_id)
            .map(|id| self.session_path(id).exists())
            .unwrap_or(false)
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(format!("{session_id}.json"))
    }

    async fn lock_for(&self, session_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    async fn read_session(&self, session_id: &str) -> Result<Option<SessionData>> {
        let path = self.session_path(session_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("Cannot read session: {e}"))),
        }
    }

    async fn write_session(&self, data: &SessionData) -> Result<()> {
        let path = self.session_path(&data.session_id);
        let tmp = path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(data)?;
        tokio::fs::write(&tmp, payload)
            .await
            .map_err(|e| Error::Storage(format!("Cannot write session: {e}")))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::Storage(format!("Cannot commit session: {e}")))
    }
}

/// Session ids become file names; anything outside [A-Za-z0-9._-] is
/// rejected to keep them inside the sessions directory.
fn validate_session_id(session_id: &str) -> Result<&str> {
    if session_id.is_empty()
        || session_id.starts_with('.')
        || !session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(Error::InputInvalid(format!(
            "Invalid session id: {session_id}"
        )));
    }
    Ok(session_id)
}

/// Format history for prompt inclusion: `User:`/`Assistant:` lines with
/// long answers truncated.
pub fn format_history_for_prompt(history: &[ConversationExchange]) -> String {
    const MAX_RESPONSE_CHARS: usize = 500;

    let mut parts = Vec::new();
    for exchange in history {
        let response = if exchange.response.chars().count() > MAX_RESPONSE_CHARS {
            let truncated: String = exchange.response.chars().take(MAX_RESPONSE_CHARS).collect();
            format!("{truncated}...")
        } else {
            exchange.response.clone()
        };
        parts.push(format!("User: {}", exchange.query));
        parts.push(format!("Assistant: {response}"));
        parts.push(String::new());
    }
    parts.join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_append_then_history_in_order() {
        let (_dir, store) = store();
        for i in 0..4 {
            store
                .append_exchange("s1", &format!("q{i}"), &format!("a{i}"), None)
                .await
                .unwrap();
        }
        let history = store.history("s1", 10).await.unwrap();
        let queries: Vec<_> = history.iter().map(|e| e.query.as_str()).collect();
        assert_eq!(queries, vec!["q0", "q1", "q2", "q3"]);
    }

    #[tokio::test]
    async fn test_history_returns_most_recent() {
        let (_dir, store) = store();
        for i in 0..8 {
            store
                .append_exchange("s1", &format!("q{i}"), "a", None)
                .await
                .unwrap();
        }
        let history = store.history("s1", 3).await.unwrap();
        let queries: Vec<_> = history.iter().map(|e| e.query.as_str()).collect();
        assert_eq!(queries, vec!["q5", "q6", "q7"]);
    }

    #[tokio::test]
    async fn test_clear_then_history_empty() {
        let (_dir, store) = store();
        store.append_exchange("s1", "q", "a", None).await.unwrap();
        assert!(store.clear("s1").await.unwrap());
        assert!(store.history("s1", 5).await.unwrap().is_empty());
        assert!(store.exists("s1"));
    }

    #[tokio::test]
    async fn test_delete_removes_file() {
        let (_dir, store) = store();
        store.append_exchange("s1", "q", "a", None).await.unwrap();
        assert!(store.delete("s1").await.unwrap());
        assert!(!store.exists("s1"));
        assert!(!store.delete("s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_or_create_generates_uuid() {
        let (_dir, store) = store();
        let id = store.get_or_create(None).await.unwrap();
        assert!(store.exists(&id));
        let same = store.get_or_create(Some(&id)).await.unwrap();
        assert_eq!(id, same);
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let (_dir, store) = store();
        assert!(store.history("../etc/passwd", 5).await.is_err());
        assert!(store.append_exchange("a/b", "q", "a", None).await.is_err());
        assert!(store.get_or_create(Some(".hidden")).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_appends_all_recorded() {
        let (_dir, store) = store();
        let store = Arc::new(store);
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .append_exchange("shared", &format!("q{i}"), "a", None)
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.history("shared", 100).await.unwrap().len(), 16);
    }

    #[test]
    fn test_format_history_truncates() {
        let history = vec![ConversationExchange {
            query: "what is TIR?".to_string(),
            response: "x".repeat(700),
            classification: None,
            timestamp: Utc::now(),
        }];
        let formatted = format_history_for_prompt(&history);
        assert!(formatted.starts_with("User: what is TIR?"));
        assert!(formatted.contains("..."));
        // 500 chars + "Assistant: " prefix + ellipsis
        let assistant_line = formatted.lines().nth(1).unwrap();
        assert_eq!(assistant_line.len(), "Assistant: ".len() + 500 + 3);
    }
}
