//! 会话存储抽象
//!
//! 会话按 (session_id, user_id) 建立，消息按 (session_id, message_id) 追加；
//! 每轮由一个请求写入一次，本模块不删除任何记录。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::StoreError;
use crate::memory::{Message, Role};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub session_id: String,
    pub message_id: String,
    pub role: Role,
    pub content: String,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn new(session_id: &str, role: Role, content: &str, metadata: Value) -> Self {
        Self {
            session_id: session_id.to_string(),
            message_id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.to_string(),
            metadata,
            created_at: Utc::now(),
        }
    }

    pub fn to_message(&self) -> Message {
        Message {
            role: self.role,
            content: self.content.clone(),
        }
    }
}

/// 一轮对话的两条消息：用户问题 + 助手回复（元数据挂在回复上）
pub(crate) fn turn_records(session_id: &str, query: &str, answer: &str, metadata: Value) -> [MessageRecord; 2] {
    [
        MessageRecord::new(session_id, Role::User, query, Value::Object(Default::default())),
        MessageRecord::new(session_id, Role::Assistant, answer, metadata),
    ]
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// 按写入顺序返回会话的全部消息；会话不存在时为空
    async fn get_messages(&self, session_id: &str) -> Result<Vec<MessageRecord>, StoreError>;

    /// 追加一轮；首轮时创建会话
    async fn append_turn(
        &self,
        session_id: &str,
        user_id: &str,
        query: &str,
        answer: &str,
        metadata: Value,
    ) -> Result<(), StoreError>;

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError>;
}

/// 取最近 turns 轮（每轮两条）转为 LLM 消息
pub fn history_messages(records: &[MessageRecord], turns: usize) -> Vec<Message> {
    let keep = turns.saturating_mul(2);
    let start = records.len().saturating_sub(keep);
    records[start..]
        .iter()
        .filter(|r| r.role != Role::System)
        .map(MessageRecord::to_message)
        .collect()
}
