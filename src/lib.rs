//! Bee RAG - 检索增强的对话服务后端
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 分层错误类型
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）、嵌入端点
//! - **memory**: 对话消息与中英文分词
//! - **retrieval**: 检索源、联邦检索、重排、意图快速通道
//! - **tools**: 工具注册表与执行器（RAG 检索、终止工具）
//! - **react**: 工具调用解析、Agent 主循环
//! - **stream**: START/CHUNK/CONTEXT/END/ERROR/MONITOR 流式投递与取消
//! - **session**: 会话存储（内存 / SQLite）
//! - **chat**: 单轮对话编排

pub mod chat;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod retrieval;
pub mod session;
pub mod stream;
pub mod tools;

pub use chat::{build_chat_service, ChatRequest, ChatService};
pub use config::{load_config, AppConfig};
