//! Durable conversation history.

use crate::error::StoreError;
use crate::message::Message;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Full history for a conversation; empty when none was saved yet.
    async fn load(&self, conversation_id: &str) -> Result<Vec<Message>>;

    /// Replace the stored history. All-or-nothing.
    async fn save(&self, conversation_id: &str, messages: &[Message]) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteConversationStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteConversationStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("create {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(1000))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("sqlite connection lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS conversations (
  conversation_id TEXT PRIMARY KEY,
  messages_json   TEXT NOT NULL,
  updated_at      TEXT NOT NULL
);
"#,
    )?;
    Ok(())
}

#[async_trait]
impl ConversationStore for SqliteConversationStore {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn load(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let id = conversation_id.to_string();
        let raw: Option<String> = self
            .with_conn(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT messages_json FROM conversations WHERE conversation_id = ?1",
                        params![id],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self, messages), fields(message_count = messages.len()))]
    async fn save(&self, conversation_id: &str, messages: &[Message]) -> Result<()> {
        let id = conversation_id.to_string();
        let json = serde_json::to_string(messages)?;
        let updated_at = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                r#"
INSERT INTO conversations (conversation_id, messages_json, updated_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(conversation_id) DO UPDATE SET
  messages_json = excluded.messages_json,
  updated_at = excluded.updated_at
"#,
                params![id, json, updated_at],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

/// In-process store for tests and `store.backend = "memory"`.
#[derive(Debug, Clone, Default)]
pub struct MemoryConversationStore {
    conversations: Arc<DashMap<String, Vec<Message>>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn load(&self, conversation_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .conversations
            .get(conversation_id)
            .map(|m| m.value().clone())
            .unwrap_or_default())
    }

    async fn save(&self, conversation_id: &str, messages: &[Message]) -> Result<()> {
        self.conversations
            .insert(conversation_id.to_string(), messages.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{InvocationState, ToolInvocation};
    use serde_json::json;

    fn sample() -> Vec<Message> {
        vec![
            Message::user("email bob"),
            Message::assistant("sending").with_invocations(vec![ToolInvocation::new(
                "call_1",
                "http_post",
                json!({ "url": "https://hooks.example.com/a" }),
                InvocationState::PendingConfirmation,
            )]),
        ]
    }

    #[tokio::test]
    async fn sqlite_store_round_trips_history_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("parley.db");

        let store = SqliteConversationStore::open(&path).expect("open store");
        assert!(store.load("conv-1").await.expect("load empty").is_empty());
        store.save("conv-1", &sample()).await.expect("save");
        drop(store);

        let reopened = SqliteConversationStore::open(&path).expect("reopen store");
        let loaded = reopened.load("conv-1").await.expect("load");
        assert_eq!(loaded, sample_with_ids(&loaded));
        assert!(loaded[1].has_pending_invocations());
    }

    // Ids and timestamps are random; compare shape through the loaded copy.
    fn sample_with_ids(loaded: &[Message]) -> Vec<Message> {
        sample()
            .into_iter()
            .zip(loaded)
            .map(|(mut m, l)| {
                m.id = l.id.clone();
                m.created_at = l.created_at;
                m
            })
            .collect()
    }

    #[tokio::test]
    async fn sqlite_save_replaces_previous_history() {
        let store = SqliteConversationStore::open_in_memory().expect("open");
        store.save("c", &sample()).await.expect("first save");
        store
            .save("c", &[Message::user("only")])
            .await
            .expect("second save");
        let loaded = store.load("c").await.expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].content, "only");
        assert!(store.load("other").await.expect("load other").is_empty());
    }

    #[tokio::test]
    async fn memory_store_keeps_conversations_apart() {
        let store = MemoryConversationStore::new();
        store.save("a", &sample()).await.expect("save a");
        assert_eq!(store.load("a").await.expect("load a").len(), 2);
        assert!(store.load("b").await.expect("load b").is_empty());
    }
}
