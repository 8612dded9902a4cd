//! 工具箱：注册表、执行器（超时 + 审计）、RAG 检索与终止工具

pub mod executor;
pub mod rag;
pub mod registry;
pub mod respond;
pub mod schema;

pub use executor::ToolExecutor;
pub use rag::{RagTool, RAG_RETRIEVE};
pub use registry::{Tool, ToolDefinition, ToolOutput, ToolRegistry};
pub use respond::{
    GiveFinalResponseTool, GiveRhetoricalQuestionTool, GIVE_FINAL_RESPONSE, GIVE_RHETORICAL_QUESTION,
};
pub use schema::tool_call_schema_json;
