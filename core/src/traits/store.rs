use crate::traits::{Role, ToolCall};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The unit of conversational continuity. Sessions are never hard-deleted;
/// `is_active = false` is the tombstone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One entry of a session transcript. Append-only; ordering within a session
/// is `(created_at, id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub session_id: String,
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    pub tokens_used: Option<u32>,
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl NewMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tokens_used: None,
            tool_calls: None,
        }
    }

    pub fn with_tokens(mut self, tokens_used: Option<u32>) -> Self {
        self.tokens_used = tokens_used;
        self
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = Some(tool_calls);
        self
    }
}

/// Derived per-session state, distinct from the raw transcript. At most one
/// row per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    pub session_id: String,
    pub data: serde_json::Map<String, serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Durable record of sessions, messages and conversation context.
///
/// Writes are transactional: `append_message` bumps the session's activity
/// timestamp atomically, and `append_turn` commits a whole turn or nothing.
/// Tombstoned sessions read as `NotFound`.
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn create_session(
        &self,
        user_id: &str,
        title: Option<String>,
    ) -> Result<Session, StoreError>;

    async fn get_session(&self, session_id: &str) -> Result<Session, StoreError>;

    /// Active sessions for a user, most recently active first.
    async fn list_sessions(&self, user_id: &str) -> Result<Vec<Session>, StoreError>;

    async fn append_message(
        &self,
        session_id: &str,
        message: NewMessage,
    ) -> Result<Message, StoreError>;

    /// Atomic batch append for a whole turn.
    async fn append_turn(
        &self,
        session_id: &str,
        messages: Vec<NewMessage>,
    ) -> Result<Vec<Message>, StoreError>;

    /// Chronological transcript. `before` is an exclusive message-id cursor
    /// for paging backwards; `limit` keeps only the most recent rows.
    async fn get_messages(
        &self,
        session_id: &str,
        limit: Option<usize>,
        before: Option<i64>,
    ) -> Result<Vec<Message>, StoreError>;

    async fn upsert_context(
        &self,
        session_id: &str,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<ConversationContext, StoreError>;

    async fn get_context(
        &self,
        session_id: &str,
    ) -> Result<Option<ConversationContext>, StoreError>;

    /// Tombstone. Historical rows stay on disk but no longer read back.
    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError>;

    /// Tombstones sessions idle longer than `max_idle_secs`. Returns how many
    /// were closed.
    async fn close_idle_sessions(&self, max_idle_secs: i64) -> Result<usize, StoreError>;
}
