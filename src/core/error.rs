//! 错误类型
//!
//! 按层划分：
//! - RetrievalError：检索源 / 重排批次不可用，由 Federator / Reranker 就地丢弃该部分结果
//! - ToolCallError：工具调用格式错误（可恢复），由 Agent 循环注入纠正提示后重试
//! - AgentError：单次请求的致命错误，由 ChatService 转为 ERROR 帧
//! - DeliveryError / StoreError：传输连接断开、会话存储失败

use thiserror::Error;

/// 检索源或重排端点失败（与「无结果」区分：无结果返回空列表，不是错误）
#[derive(Error, Debug, Clone)]
pub enum RetrievalError {
    #[error("Upstream error from {source_name}: {message}")]
    Upstream { source_name: String, message: String },

    #[error("Timeout after {0}s")]
    Timeout(u64),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Score count mismatch: expected {expected}, got {actual}")]
    ScoreMismatch { expected: usize, actual: usize },
}

/// PARSE_VALIDATE 阶段的可恢复错误：作为值返回，不中断循环
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolCallError {
    /// 输出中找不到任何工具调用块
    #[error("ToolNotFound: no tool call could be located in the output")]
    ToolNotFound,

    /// 单个调用块里识别出多个工具名
    #[error("MultipleToolNameError: more than one tool name in a single call ({0})")]
    MultipleToolNameError(String),

    #[error("ToolNotExistError: tool '{name}' does not exist")]
    ToolNotExistError { name: String },

    #[error("ToolParameterNotExistError: tool '{tool}' is missing required parameter '{param}'")]
    ToolParameterNotExistError { tool: String, param: String },
}

/// 单次请求内的致命错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    LlmError(String),
}

/// 流式传输失败（连接已断开）
#[derive(Error, Debug, Clone)]
pub enum DeliveryError {
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Frame encode error: {0}")]
    Encode(String),
}

/// 会话存储失败
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Metadata encode error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("Store task failed: {0}")]
    Task(String),
}
