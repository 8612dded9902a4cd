//! Agent 过程事件：转发为 MONITOR 帧，供前端展示步骤、工具调用、观察与重试

use serde::Serialize;

/// 单步过程事件（可序列化为 JSON）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReactEvent {
    /// PROPOSE 步数更新（第几次调用模型）
    StepUpdate { step: usize, max_steps: usize },
    /// 正在调用 LLM
    Thinking,
    /// 调用工具
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    Observation {
        tool: String,
        code: i32,
        preview: String,
    },
    /// 工具调用格式错误，注入纠正提示后重试
    Retry { error: String, attempt: usize },
    /// 循环结束
    Terminal { reason: String },
    /// Token 使用统计（累计）
    TokenUsage {
        prompt_tokens: u64,
        completion_tokens: u64,
        total_tokens: u64,
    },
}

impl ReactEvent {
    /// MONITOR 帧的 info 字段
    pub fn to_monitor_info(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
