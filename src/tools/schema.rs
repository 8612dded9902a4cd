//! 工具调用 JSON Schema 生成（schemars）
//!
//! 将 JSON 风格模型的合法 tool call 结构注入 system prompt，减少格式错误。

use schemars::{schema_for, JsonSchema};
use std::collections::HashMap;

/// JSON 风格工具调用：与 react::parser 解析的 `{"name": "...", "kwargs": {...}}` 一致（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 工具名，如 rag_retrieve、give_final_response
    pub name: String,
    /// 工具参数，键值均为字符串
    pub kwargs: HashMap<String, String>,
}

/// 返回工具调用的 JSON Schema 字符串，可拼入 system prompt
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
