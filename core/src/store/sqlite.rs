use crate::store::default_title;
use crate::traits::{
    ContextStore, ConversationContext, Message, NewMessage, Role, Session, StoreError, ToolCall,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    title TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id, updated_at);
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id),
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    tokens_used INTEGER,
    tool_calls TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, id);
CREATE TABLE IF NOT EXISTS contexts (
    session_id TEXT PRIMARY KEY REFERENCES sessions(id),
    context_data TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// SQLite-backed `ContextStore`. A single connection behind a mutex; every
/// call is routed through `spawn_blocking` so the async runtime never blocks
/// on file I/O. Lock hold time is one query or one transaction.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub async fn open(path: PathBuf) -> Result<Self, StoreError> {
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, rusqlite::Error> {
            let conn = Connection::open(&path)?;
            conn.execute("PRAGMA foreign_keys = ON;", [])?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("blocking task failed: {e}")))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run_blocking<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, rusqlite::Error> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("blocking task failed: {e}")))?
        .map_err(StoreError::from)
    }
}

fn fmt_ts(at: DateTime<Utc>) -> String {
    // Fixed precision keeps lexicographic and chronological order identical.
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_failure(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, message.into())
}

fn parse_ts(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| conversion_failure(format!("bad timestamp '{raw}': {e}")))
}

fn parse_role(raw: &str) -> rusqlite::Result<Role> {
    match raw {
        "system" => Ok(Role::System),
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        "tool" => Ok(Role::Tool),
        other => Err(conversion_failure(format!("unknown role '{other}'"))),
    }
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        is_active: row.get::<_, i64>(3)? != 0,
        created_at: parse_ts(&row.get::<_, String>(4)?)?,
        updated_at: parse_ts(&row.get::<_, String>(5)?)?,
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let tool_calls = match row.get::<_, Option<String>>(5)? {
        Some(raw) => Some(
            serde_json::from_str::<Vec<ToolCall>>(&raw)
                .map_err(|e| conversion_failure(format!("bad tool_calls payload: {e}")))?,
        ),
        None => None,
    };
    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: parse_role(&row.get::<_, String>(2)?)?,
        content: row.get(3)?,
        tokens_used: row.get(4)?,
        tool_calls,
        created_at: parse_ts(&row.get::<_, String>(6)?)?,
    })
}

fn require_active_session(tx: &Transaction<'_>, session_id: &str) -> rusqlite::Result<()> {
    tx.query_row(
        "SELECT 1 FROM sessions WHERE id = ?1 AND is_active = 1",
        [session_id],
        |_| Ok(()),
    )
}

fn insert_message(
    tx: &Transaction<'_>,
    session_id: &str,
    message: NewMessage,
    now: DateTime<Utc>,
) -> rusqlite::Result<Message> {
    let tool_calls_json = match &message.tool_calls {
        Some(calls) => Some(
            serde_json::to_string(calls)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
        ),
        None => None,
    };
    tx.execute(
        "INSERT INTO messages (session_id, role, content, tokens_used, tool_calls, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            session_id,
            message.role.as_str(),
            message.content,
            message.tokens_used,
            tool_calls_json,
            fmt_ts(now),
        ],
    )?;
    Ok(Message {
        id: tx.last_insert_rowid(),
        session_id: session_id.to_string(),
        role: message.role,
        content: message.content,
        tokens_used: message.tokens_used,
        tool_calls: message.tool_calls,
        created_at: now,
    })
}

fn bump_activity(tx: &Transaction<'_>, session_id: &str, now: DateTime<Utc>) -> rusqlite::Result<()> {
    tx.execute(
        "UPDATE sessions SET updated_at = ?2 WHERE id = ?1",
        params![session_id, fmt_ts(now)],
    )?;
    Ok(())
}

#[async_trait]
impl ContextStore for SqliteStore {
    async fn create_session(
        &self,
        user_id: &str,
        title: Option<String>,
    ) -> Result<Session, StoreError> {
        let user_id = user_id.to_string();
        self.run_blocking(move |conn| {
            let now = Utc::now();
            let session = Session {
                id: Uuid::new_v4().to_string(),
                user_id,
                title: title.unwrap_or_else(|| default_title(now)),
                is_active: true,
                created_at: now,
                updated_at: now,
            };
            conn.execute(
                "INSERT INTO sessions (id, user_id, title, is_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5)",
                params![
                    session.id,
                    session.user_id,
                    session.title,
                    fmt_ts(now),
                    fmt_ts(now),
                ],
            )?;
            Ok(session)
        })
        .await
    }

    async fn get_session(&self, session_id: &str) -> Result<Session, StoreError> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT id, user_id, title, is_active, created_at, updated_at
                 FROM sessions WHERE id = ?1 AND is_active = 1",
                [session_id],
                session_from_row,
            )
        })
        .await
    }

    async fn list_sessions(&self, user_id: &str) -> Result<Vec<Session>, StoreError> {
        let user_id = user_id.to_string();
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, title, is_active, created_at, updated_at
                 FROM sessions WHERE user_id = ?1 AND is_active = 1
                 ORDER BY updated_at DESC",
            )?;
            let sessions = stmt
                .query_map([user_id], session_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(sessions)
        })
        .await
    }

    async fn append_message(
        &self,
        session_id: &str,
        message: NewMessage,
    ) -> Result<Message, StoreError> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            require_active_session(&tx, &session_id)?;
            let now = Utc::now();
            let stored = insert_message(&tx, &session_id, message, now)?;
            bump_activity(&tx, &session_id, now)?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    async fn append_turn(
        &self,
        session_id: &str,
        messages: Vec<NewMessage>,
    ) -> Result<Vec<Message>, StoreError> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            require_active_session(&tx, &session_id)?;
            let now = Utc::now();
            let mut stored = Vec::with_capacity(messages.len());
            for message in messages {
                stored.push(insert_message(&tx, &session_id, message, now)?);
            }
            bump_activity(&tx, &session_id, now)?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    async fn get_messages(
        &self,
        session_id: &str,
        limit: Option<usize>,
        before: Option<i64>,
    ) -> Result<Vec<Message>, StoreError> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            require_active_session(&tx, &session_id)?;
            let limit = limit.map(|n| n as i64).unwrap_or(-1);
            let mut stmt = tx.prepare(
                "SELECT id, session_id, role, content, tokens_used, tool_calls, created_at
                 FROM messages
                 WHERE session_id = ?1 AND (?2 IS NULL OR id < ?2)
                 ORDER BY created_at DESC, id DESC
                 LIMIT ?3",
            )?;
            let mut messages = stmt
                .query_map(params![session_id, before, limit], message_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            drop(stmt);
            tx.commit()?;
            messages.reverse();
            Ok(messages)
        })
        .await
    }

    async fn upsert_context(
        &self,
        session_id: &str,
        data: serde_json::Map<String, serde_json::Value>,
    ) -> Result<ConversationContext, StoreError> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| {
            let tx = conn.transaction()?;
            require_active_session(&tx, &session_id)?;
            let now = Utc::now();
            let payload = serde_json::to_string(&data)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            tx.execute(
                "INSERT INTO contexts (session_id, context_data, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT(session_id) DO UPDATE SET
                     context_data = excluded.context_data,
                     updated_at = excluded.updated_at",
                params![session_id, payload, fmt_ts(now)],
            )?;
            tx.commit()?;
            Ok(ConversationContext {
                session_id,
                data,
                updated_at: now,
            })
        })
        .await
    }

    async fn get_context(
        &self,
        session_id: &str,
    ) -> Result<Option<ConversationContext>, StoreError> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| {
            conn.query_row(
                "SELECT session_id, context_data, updated_at FROM contexts WHERE session_id = ?1",
                [session_id],
                |row| {
                    let payload: String = row.get(1)?;
                    let data = serde_json::from_str(&payload)
                        .map_err(|e| conversion_failure(format!("bad context payload: {e}")))?;
                    Ok(ConversationContext {
                        session_id: row.get(0)?,
                        data,
                        updated_at: parse_ts(&row.get::<_, String>(2)?)?,
                    })
                },
            )
            .optional()
        })
        .await
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        let session_id = session_id.to_string();
        self.run_blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE sessions SET is_active = 0 WHERE id = ?1 AND is_active = 1",
                [session_id],
            )?;
            if changed == 0 {
                return Err(rusqlite::Error::QueryReturnedNoRows);
            }
            Ok(())
        })
        .await
    }

    async fn close_idle_sessions(&self, max_idle_secs: i64) -> Result<usize, StoreError> {
        let cutoff = fmt_ts(Utc::now() - Duration::seconds(max_idle_secs));
        self.run_blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE sessions SET is_active = 0 WHERE is_active = 1 AND updated_at < ?1",
                [cutoff],
            )?;
            Ok(changed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store(tmp: &TempDir) -> SqliteStore {
        SqliteStore::open(tmp.path().join("test.db")).await.unwrap()
    }

    #[tokio::test]
    async fn sessions_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let id = {
            let store = open_store(&tmp).await;
            let session = store
                .create_session("u1", Some("persisted".to_string()))
                .await
                .unwrap();
            store
                .append_message(&session.id, NewMessage::new(Role::User, "hello"))
                .await
                .unwrap();
            session.id
        };

        let store = open_store(&tmp).await;
        let session = store.get_session(&id).await.unwrap();
        assert_eq!(session.title, "persisted");
        let messages = store.get_messages(&id, None, None).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hello");
    }

    #[tokio::test]
    async fn append_turn_preserves_order_and_payloads() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        let session = store.create_session("u1", None).await.unwrap();

        let call = ToolCall {
            id: "call_1".to_string(),
            name: "calculate".to_string(),
            arguments: serde_json::json!({"expression": "2+2"}),
        };
        let turn = vec![
            NewMessage::new(Role::User, "what is 2+2?"),
            NewMessage::new(Role::Assistant, "").with_tool_calls(vec![call]),
            NewMessage::new(Role::Tool, "Calculation: 2+2 = 4"),
            NewMessage::new(Role::Assistant, "4").with_tokens(Some(42)),
        ];
        store.append_turn(&session.id, turn).await.unwrap();

        let messages = store.get_messages(&session.id, None, None).await.unwrap();
        let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, [Role::User, Role::Assistant, Role::Tool, Role::Assistant]);
        assert_eq!(
            messages[1].tool_calls.as_ref().unwrap()[0].arguments["expression"],
            "2+2"
        );
        assert_eq!(messages[3].tokens_used, Some(42));
    }

    #[tokio::test]
    async fn append_bumps_listing_order() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        let first = store.create_session("u1", None).await.unwrap();
        let second = store.create_session("u1", None).await.unwrap();

        store
            .append_message(&first.id, NewMessage::new(Role::User, "bump"))
            .await
            .unwrap();

        let listed = store.list_sessions("u1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, first.id);
        assert_eq!(listed[1].id, second.id);
    }

    #[tokio::test]
    async fn tombstone_hides_session_and_messages() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        let session = store.create_session("u1", None).await.unwrap();
        store
            .append_message(&session.id, NewMessage::new(Role::User, "hello"))
            .await
            .unwrap();

        store.delete_session(&session.id).await.unwrap();

        assert!(matches!(
            store.get_session(&session.id).await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.get_messages(&session.id, None, None).await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store
                .append_message(&session.id, NewMessage::new(Role::User, "more"))
                .await,
            Err(StoreError::NotFound)
        ));
        assert!(store.list_sessions("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn context_upsert_is_single_row() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        let session = store.create_session("u1", None).await.unwrap();

        let mut data = serde_json::Map::new();
        data.insert("user_name".to_string(), "Ada".into());
        store.upsert_context(&session.id, data.clone()).await.unwrap();
        data.insert("user_name".to_string(), "Grace".into());
        store.upsert_context(&session.id, data).await.unwrap();

        let context = store.get_context(&session.id).await.unwrap().unwrap();
        assert_eq!(context.data["user_name"], "Grace");

        let count: i64 = {
            let conn = store.conn.lock().unwrap();
            conn.query_row("SELECT COUNT(*) FROM contexts", [], |row| row.get(0))
                .unwrap()
        };
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp).await;
        assert!(matches!(
            store.get_session("nope").await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.delete_session("nope").await,
            Err(StoreError::NotFound)
        ));
    }
}
