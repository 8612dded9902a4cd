//! Agent 层：工具调用解析（按模型家族）、提示词、请求状态、主循环与过程事件

pub mod events;
pub mod loop_;
pub mod parser;
pub mod prompt;
pub mod state;

pub use events::ReactEvent;
pub use loop_::{AgentLoop, AgentLoopConfig, AgentOutcome, TerminalReason, CALL_LIMIT_ANSWER};
pub use parser::{parse_tool_calls, ModelFamily, ToolCall};
pub use prompt::{build_system_prompt, corrective_message};
pub use state::AgentState;
