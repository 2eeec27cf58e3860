use std::{
    collections::HashMap,
    time::{SystemTime, UNIX_EPOCH},
};

use {
    serde::{Deserialize, Serialize},
    tokio::sync::RwLock,
    tracing::debug,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One exchanged message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Milliseconds since the UNIX epoch.
    pub timestamp: u64,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: now_ms(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// The `{role, content}` shape sent to an LLM provider.
    pub fn to_llm_message(&self) -> serde_json::Value {
        serde_json::json!({
            "role": self.role,
            "content": self.content,
        })
    }
}

/// Metadata about a session's log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub id: String,
    pub key: String,
    pub created_at: u64,
    pub updated_at: u64,
    pub message_count: u32,
}

struct SessionLog {
    entry: SessionEntry,
    messages: Vec<ChatMessage>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// In-memory index mapping session key → message log.
#[derive(Default)]
pub struct SessionStore {
    logs: RwLock<HashMap<String, SessionLog>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message, creating the session on first use.
    pub async fn append(&self, key: &str, message: ChatMessage) -> SessionEntry {
        let now = now_ms();
        let mut logs = self.logs.write().await;
        let log = logs.entry(key.to_string()).or_insert_with(|| {
            debug!(session_id = key, "created session log");
            SessionLog {
                entry: SessionEntry {
                    id: uuid::Uuid::new_v4().to_string(),
                    key: key.to_string(),
                    created_at: now,
                    updated_at: now,
                    message_count: 0,
                },
                messages: Vec::new(),
            }
        });
        log.messages.push(message);
        log.entry.message_count = log.messages.len() as u32;
        log.entry.updated_at = now;
        log.entry.clone()
    }

    /// All messages for a session, oldest first. Empty for unknown keys.
    pub async fn history(&self, key: &str) -> Vec<ChatMessage> {
        self.logs
            .read()
            .await
            .get(key)
            .map(|log| log.messages.clone())
            .unwrap_or_default()
    }

    /// Messages before the most recent one, in provider shape.
    ///
    /// Used to give the provider context while the newest user message is
    /// sent separately.
    pub async fn context_messages(&self, key: &str) -> Vec<serde_json::Value> {
        let logs = self.logs.read().await;
        let Some(log) = logs.get(key) else {
            return Vec::new();
        };
        let earlier = log.messages.len().saturating_sub(1);
        log.messages[..earlier]
            .iter()
            .map(ChatMessage::to_llm_message)
            .collect()
    }

    pub async fn get(&self, key: &str) -> Option<SessionEntry> {
        self.logs.read().await.get(key).map(|log| log.entry.clone())
    }

    /// Remove a session's log. Returns true if it existed.
    pub async fn clear(&self, key: &str) -> bool {
        self.logs.write().await.remove(key).is_some()
    }

    /// List all entries sorted by creation time.
    pub async fn list(&self) -> Vec<SessionEntry> {
        let mut entries: Vec<_> = self
            .logs
            .read()
            .await
            .values()
            .map(|log| log.entry.clone())
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.key.cmp(&b.key)));
        entries
    }
}
