//! 终止工具：给出最终回复 / 反问用户
//!
//! 两者执行成功即结束 Agent 循环，参数原样作为回复文本。

use std::collections::HashMap;

use async_trait::async_trait;

use crate::tools::{Tool, ToolDefinition, ToolOutput};

pub const GIVE_FINAL_RESPONSE: &str = "give_final_response";
pub const GIVE_RHETORICAL_QUESTION: &str = "give_rhetorical_question";

pub struct GiveFinalResponseTool {
    def: ToolDefinition,
}

impl Default for GiveFinalResponseTool {
    fn default() -> Self {
        Self {
            def: ToolDefinition::new(
                GIVE_FINAL_RESPONSE,
                "Give the final answer to the user. Use it once you have enough information.",
            )
            .required("response"),
        }
    }
}

#[async_trait]
impl Tool for GiveFinalResponseTool {
    fn definition(&self) -> &ToolDefinition {
        &self.def
    }

    fn is_terminal(&self) -> bool {
        true
    }

    async fn execute(&self, kwargs: &HashMap<String, String>) -> ToolOutput {
        match kwargs.get("response") {
            Some(text) if !text.trim().is_empty() => ToolOutput::success(text.trim().to_string()),
            _ => ToolOutput::failure("Missing required parameter: response"),
        }
    }
}

/// 信息不足时向用户反问
pub struct GiveRhetoricalQuestionTool {
    def: ToolDefinition,
}

impl Default for GiveRhetoricalQuestionTool {
    fn default() -> Self {
        Self {
            def: ToolDefinition::new(
                GIVE_RHETORICAL_QUESTION,
                "Ask the user a clarifying question when the request is ambiguous or lacks required information.",
            )
            .required("question"),
        }
    }
}

#[async_trait]
impl Tool for GiveRhetoricalQuestionTool {
    fn definition(&self) -> &ToolDefinition {
        &self.def
    }

    fn is_terminal(&self) -> bool {
        true
    }

    async fn execute(&self, kwargs: &HashMap<String, String>) -> ToolOutput {
        match kwargs.get("question") {
            Some(text) if !text.trim().is_empty() => ToolOutput::success(text.trim().to_string()),
            _ => ToolOutput::failure("Missing required parameter: question"),
        }
    }
}
