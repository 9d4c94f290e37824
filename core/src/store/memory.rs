use crate::store::default_title;
use crate::traits::{
    ContextStore, ConversationContext, Message, NewMessage, Session, StoreError,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    messages: HashMap<String, Vec<Message>>,
    contexts: HashMap<String, ConversationContext>,
    next_message_id: i64,
}

/// HashMap-backed `ContextStore` with the same semantics as the SQLite
/// store. Backs tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn active_session(&self, session_id: &str) -> Result<&Session, StoreError> {
        self.sessions
            .get(session_id)
            .filter(|s| s.is_active)
            .ok_or(StoreError::NotFound)
    }

    fn push_message(&mut self, session_id: &str, message: NewMessage) -> Message {
        self.next_message_id += 1;
        let stored = Message {
            id: self.next_message_id,
            session_id: session_id.to_string(),
            role: message.role,
            content: message.content,
            tokens_used: message.tokens_used,
            tool_calls: message.tool_calls,
            created_at: Utc::now(),
        };
        self.messages
            .entry(session_id.to_string())
            .or_default()
            .push(stored.clone());
        stored
    }

    fn bump_activity(&mut self, session_id: &str) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.updated_at = Utc::now();
        }
    }
}

#[async_trait]
impl ContextStore for MemoryStore {
    async fn create_session(
        &self,
        user_id: &str,
        title: Option<String>,
    ) -> Result<Session, StoreError> {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title.unwrap_or_else(|| default_title(now)),
            is_active: true,
            created_at: now,
            updated_at: now,
        };

        let mut inner = self.inner.lock().unwrap();
        inner.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get_session(&self, session_id: &str) -> Result<Session, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner.active_session(session_id).cloned()
    }

    async fn list_sessions(&self, user_id: &str) -> Result<Vec<Session>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut sessions: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| s.is_active && s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(sessions)
    }

    async fn append_message(
        &self,
        session_id: &str,
        message: NewMessage,
    ) -> Result<Message, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.active_session(session_id)?;
        let stored = inner.push_message(session_id, message);
        inner.bump_activity(session_id);
        Ok(stored)
    }

    async fn append_turn(
        &self,
        session_id: &str,
        messages: Vec<NewMessage>,
    ) -> Result<Vec<Message>, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.active_session(session_id)?;
        let stored = messages
            .into_iter()
            .map(|message| inner.push_message(session_id, message))
            .collect();
        inner.bump_activity(session_id);
        Ok(stored)
    }

    async fn get_messages(
        &self,
        session_id: &str,
        limit: Option<usize>,
        before: Option<i64>,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.lock().unwrap();
        inner.active_session(session_id)?;

        let mut messages: Vec<Message> = inner
            .messages
            .get(session_id)
            .map(|all| {
                all.iter()
                    .filter(|m| before.is_none_or(|cursor| m.id < cursor))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(limit) = limit
            && messages.len() > limit
        {
            messages.drain(..messages.len() - limit);
        }
        Ok(messages)
    }

    async fn upsert_context(
        &self,
        session_id: &str,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<ConversationContext, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.active_session(session_id)?;

        let context = ConversationContext {
            session_id: session_id.to_string(),
            data,
            updated_at: Utc::now(),
        };
        inner
            .contexts
            .insert(session_id.to_string(), context.clone());
        Ok(context)
    }

    async fn get_context(
        &self,
        session_id: &str,
    ) -> Result<Option<ConversationContext>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.contexts.get(session_id).cloned())
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get_mut(session_id)
            .filter(|s| s.is_active)
            .ok_or(StoreError::NotFound)?;
        session.is_active = false;
        Ok(())
    }

    async fn close_idle_sessions(&self, max_idle_secs: i64) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - Duration::seconds(max_idle_secs);
        let mut inner = self.inner.lock().unwrap();
        let mut closed = 0;
        for session in inner.sessions.values_mut() {
            if session.is_active && session.updated_at < cutoff {
                session.is_active = false;
                closed += 1;
            }
        }
        Ok(closed)
    }
}
