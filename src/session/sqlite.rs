//! SQLite 会话存储（rusqlite）
//!
//! 连接放在 Arc<Mutex<Connection>> 中，所有查询在 spawn_blocking 里执行，不阻塞 runtime。

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::core::StoreError;
use crate::memory::Role;
use crate::session::store::turn_records;
use crate::session::{MessageRecord, SessionRecord, SessionStore};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT NOT NULL,
    user_id    TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (session_id, user_id)
);
CREATE TABLE IF NOT EXISTS messages (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    message_id TEXT NOT NULL,
    role       TEXT NOT NULL,
    content    TEXT NOT NULL,
    metadata   TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (session_id, message_id)
);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages (session_id, seq);
";

#[derive(Clone)]
pub struct SqliteSessionStore {
    conn: Arc<Mutex<Connection>>,
}

fn parse_time(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

impl SqliteSessionStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Task(format!("create {}: {}", parent.display(), e)))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 在阻塞线程池中持锁执行
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get_messages(&self, session_id: &str) -> Result<Vec<MessageRecord>, StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, message_id, role, content, metadata, created_at
                 FROM messages WHERE session_id = ?1 ORDER BY seq",
            )?;
            let rows = stmt.query_map(params![session_id], |row| {
                let role: String = row.get(2)?;
                let metadata: String = row.get(4)?;
                let created_at: String = row.get(5)?;
                Ok(MessageRecord {
                    session_id: row.get(0)?,
                    message_id: row.get(1)?,
                    role: Role::parse(&role),
                    content: row.get(3)?,
                    metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
                    created_at: parse_time(5, &created_at)?,
                })
            })?;
            let messages = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(messages)
        })
        .await
    }

    async fn append_turn(
        &self,
        session_id: &str,
        user_id: &str,
        query: &str,
        answer: &str,
        metadata: Value,
    ) -> Result<(), StoreError> {
        let records = turn_records(session_id, query, answer, metadata);
        let session_id = session_id.to_string();
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let now = Utc::now().to_rfc3339();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO sessions (session_id, user_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?3)
                 ON CONFLICT (session_id, user_id) DO UPDATE SET updated_at = excluded.updated_at",
                params![session_id, user_id, now],
            )?;
            for r in &records {
                tx.execute(
                    "INSERT INTO messages (session_id, message_id, role, content, metadata, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        r.session_id,
                        r.message_id,
                        r.role.as_str(),
                        r.content,
                        serde_json::to_string(&r.metadata)?,
                        r.created_at.to_rfc3339(),
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let session_id = session_id.to_string();
        self.with_conn(move |conn| {
            let record = conn
                .query_row(
                    "SELECT session_id, user_id, created_at, updated_at
                     FROM sessions WHERE session_id = ?1 ORDER BY created_at LIMIT 1",
                    params![session_id],
                    |row| {
                        let created_at: String = row.get(2)?;
                        let updated_at: String = row.get(3)?;
                        Ok(SessionRecord {
                            session_id: row.get(0)?,
                            user_id: row.get(1)?,
                            created_at: parse_time(2, &created_at)?,
                            updated_at: parse_time(3, &updated_at)?,
                        })
                    },
                )
                .optional()?;
            Ok(record)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_turns_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        {
            let store = SqliteSessionStore::open(&path).unwrap();
            store
                .append_turn("s1", "u1", "hello", "hi there", serde_json::json!({"status": "completed"}))
                .await
                .unwrap();
            store.append_turn("s1", "u1", "bye", "see you", Value::Null).await.unwrap();
        }

        let store = SqliteSessionStore::open(&path).unwrap();
        let msgs = store.get_messages("s1").await.unwrap();
        let contents: Vec<&str> = msgs.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["hello", "hi there", "bye", "see you"]);
        assert_eq!(msgs[1].role, Role::Assistant);
        assert_eq!(msgs[1].metadata["status"], "completed");

        let session = store.get_session("s1").await.unwrap().unwrap();
        assert_eq!(session.user_id, "u1");
        assert!(session.updated_at >= session.created_at);
    }

    #[tokio::test]
    async fn test_unknown_session_is_empty() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        assert!(store.get_messages("nope").await.unwrap().is_empty());
        assert!(store.get_session("nope").await.unwrap().is_none());
    }
}
