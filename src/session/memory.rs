//! 进程内会话存储（未配置数据库时使用）

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::core::StoreError;
use crate::session::store::turn_records;
use crate::session::{MessageRecord, SessionRecord, SessionStore};

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, (SessionRecord, Vec<MessageRecord>)>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get_messages(&self, session_id: &str) -> Result<Vec<MessageRecord>, StoreError> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        Ok(sessions
            .get(session_id)
            .map(|(_, msgs)| msgs.clone())
            .unwrap_or_default())
    }

    async fn append_turn(
        &self,
        session_id: &str,
        user_id: &str,
        query: &str,
        answer: &str,
        metadata: Value,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let (session, messages) = sessions.entry(session_id.to_string()).or_insert_with(|| {
            (
                SessionRecord {
                    session_id: session_id.to_string(),
                    user_id: user_id.to_string(),
                    created_at: now,
                    updated_at: now,
                },
                Vec::new(),
            )
        });
        session.updated_at = now;
        messages.extend(turn_records(session_id, query, answer, metadata));
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        Ok(sessions.get(session_id).map(|(s, _)| s.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Role;

    #[tokio::test]
    async fn test_append_and_read_back() {
        let store = MemorySessionStore::new();
        assert!(store.get_messages("s1").await.unwrap().is_empty());
        assert!(store.get_session("s1").await.unwrap().is_none());

        store.append_turn("s1", "u1", "hi", "hello", serde_json::json!({"status": "completed"})).await.unwrap();
        store.append_turn("s1", "u1", "again", "sure", Value::Null).await.unwrap();

        let msgs = store.get_messages("s1").await.unwrap();
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0].role, Role::User);
        assert_eq!(msgs[1].metadata["status"], "completed");
        assert_eq!(msgs[3].content, "sure");
        assert_eq!(store.get_session("s1").await.unwrap().unwrap().user_id, "u1");
    }
}
