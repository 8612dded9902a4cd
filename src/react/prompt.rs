//! 系统提示与纠正消息
//!
//! 系统提示 = 基础提示 + 工具目录 + 调用语法（JSON 家族附带 schemars 生成的 Schema）；
//! 纠正消息点名具体错误并重述期望的调用语法。

use crate::core::ToolCallError;
use crate::react::ModelFamily;
use crate::tools::{tool_call_schema_json, ToolDefinition};

/// 工具目录：每个工具一段，列出必填与可选参数
pub fn tool_catalog(definitions: &[ToolDefinition]) -> String {
    definitions
        .iter()
        .map(|d| {
            let mut line = format!("- {}: {}", d.name, d.description);
            if !d.required_params.is_empty() {
                let req: Vec<&str> = d.required_params.iter().map(String::as_str).collect();
                line.push_str(&format!("\n  required: {}", req.join(", ")));
            }
            if !d.optional_params.is_empty() {
                let opt: Vec<&str> = d.optional_params.iter().map(String::as_str).collect();
                line.push_str(&format!("\n  optional: {}", opt.join(", ")));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// 拼接完整系统提示
pub fn build_system_prompt(base: &str, family: ModelFamily, definitions: &[ToolDefinition]) -> String {
    let mut prompt = format!(
        "{}\n\n## Tools\n{}\n\n## Tool call format\n{}",
        base.trim(),
        tool_catalog(definitions),
        family.call_grammar()
    );
    if family == ModelFamily::Json {
        prompt.push_str("\n\nJSON schema of a tool call:\n");
        prompt.push_str(&tool_call_schema_json());
    }
    prompt
}

/// 解析失败后的纠正消息（user 角色），重述期望语法
pub fn corrective_message(error: &ToolCallError, family: ModelFamily, definitions: &[ToolDefinition]) -> String {
    let hint = match error {
        ToolCallError::ToolNotFound => "No tool call was found in your reply.".to_string(),
        ToolCallError::MultipleToolNameError(names) => {
            format!("Your reply named more than one tool in a single call: {names}. Name exactly one tool per call.")
        }
        ToolCallError::ToolNotExistError { name } => {
            let available: Vec<&str> = definitions.iter().map(|d| d.name.as_str()).collect();
            format!(
                "Tool \"{name}\" does not exist. Available tools: {}.",
                available.join(", ")
            )
        }
        ToolCallError::ToolParameterNotExistError { tool, param } => {
            format!("Tool \"{tool}\" requires parameter \"{param}\", but no value was given.")
        }
    };
    format!("{error}\n{hint}\n\n{}", family.call_grammar())
}

/// 截断到指定字符数（纠正时回显的原始输出）
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push_str("...[truncated]");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defs() -> Vec<ToolDefinition> {
        vec![ToolDefinition::new("rag_retrieve", "Search the knowledge base").required("query").optional("top_k")]
    }

    #[test]
    fn test_system_prompt_lists_tools_and_grammar() {
        let prompt = build_system_prompt("You are helpful.", ModelFamily::Xml, &defs());
        assert!(prompt.contains("- rag_retrieve: Search the knowledge base"));
        assert!(prompt.contains("required: query"));
        assert!(prompt.contains("optional: top_k"));
        assert!(prompt.contains("<invoke>"));
    }

    #[test]
    fn test_corrective_message_names_unknown_tool() {
        let err = ToolCallError::ToolNotExistError { name: "foo".to_string() };
        let msg = corrective_message(&err, ModelFamily::Json, &defs());
        assert!(msg.contains("\"foo\""));
        assert!(msg.contains("rag_retrieve"));
        assert!(msg.contains(&ModelFamily::Json.call_grammar()));
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("你好世界", 2), "你好...[truncated]");
        assert_eq!(truncate_chars("abc", 5), "abc");
    }
}
