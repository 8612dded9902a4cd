//! 工具执行器
//!
//! 持有 ToolRegistry 与全局超时，execute(call) 在超时内调用 registry.execute；
//! 超时转为 code 1 的软失败（作为 Observation 反馈模型）；每次调用输出结构化审计日志（JSON）。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::time::timeout;

use crate::tools::{ToolDefinition, ToolOutput, ToolRegistry};

/// 工具执行器：对每次调用施加超时
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// 执行指定工具并输出 JSON 审计日志
    pub async fn execute(&self, tool_name: &str, kwargs: &HashMap<String, String>) -> ToolOutput {
        let start = Instant::now();
        let result = timeout(self.timeout, self.registry.execute(tool_name, kwargs)).await;

        let outcome = match &result {
            Ok(out) if out.is_success() => "ok",
            Ok(_) => "error",
            Err(_) => "timeout",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": outcome == "ok",
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(kwargs),
        });
        tracing::info!(audit = %audit, "tool");

        result.unwrap_or_else(|_| {
            ToolOutput::failure(format!(
                "Tool {} timed out after {}s",
                tool_name,
                self.timeout.as_secs()
            ))
        })
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.registry.definitions()
    }

    pub fn is_terminal(&self, name: &str) -> bool {
        self.registry.is_terminal(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }
}

fn args_preview(kwargs: &HashMap<String, String>) -> String {
    let s = serde_json::to_string(kwargs).unwrap_or_default();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
