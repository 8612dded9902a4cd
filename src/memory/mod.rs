//! 消息与分词：Agent 状态、会话存储与 BM25 检索共用

pub mod conversation;
pub mod tokenizer;

pub use conversation::{Message, Role};
