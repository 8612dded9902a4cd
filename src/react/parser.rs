//! 工具调用解析与校验（PARSE_VALIDATE）
//!
//! 按模型家族选择解析策略：JSON 风格（`<tool_call>` 标签或 ```json 代码块）
//! 与 XML 风格（`<invoke><tool_name>..</tool_name><parameters>..</parameters></invoke>`），
//! 两者都归约为同一 ToolCall。校验顺序：多工具名 → 工具不存在 → 缺必填参数 → 找不到调用。

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::core::ToolCallError;
use crate::tools::ToolDefinition;

/// 工具调用格式家族，每个请求解析一次
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    #[default]
    Json,
    Xml,
}

impl ModelFamily {
    /// 按模型 ID 推断：Claude 系列用 XML 风格，其余用 JSON 风格
    pub fn from_model_id(model_id: &str) -> Self {
        let id = model_id.to_lowercase();
        if id.contains("claude") || id.contains("anthropic") {
            ModelFamily::Xml
        } else {
            ModelFamily::Json
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "json" => Some(ModelFamily::Json),
            "xml" => Some(ModelFamily::Xml),
            _ => None,
        }
    }

    /// 配置优先，否则按模型 ID 推断
    pub fn resolve(configured: Option<&str>, model_id: &str) -> Self {
        configured
            .and_then(Self::parse)
            .unwrap_or_else(|| Self::from_model_id(model_id))
    }

    /// 期望的调用语法说明（拼入系统提示与纠正消息）
    pub fn call_grammar(&self) -> String {
        match self {
            ModelFamily::Json => "Call exactly one tool per reply using this format:\n\
                 <tool_call>\n\
                 {\"name\": \"<tool name>\", \"kwargs\": {\"<parameter>\": \"<value>\"}}\n\
                 </tool_call>\n\
                 All kwargs values are strings."
                .to_string(),
            ModelFamily::Xml => "Call exactly one tool per reply using this format:\n\
                 <invoke>\n\
                 <tool_name>tool name</tool_name>\n\
                 <parameters>\n\
                 <parameter_name>value</parameter_name>\n\
                 </parameters>\n\
                 </invoke>"
                .to_string(),
        }
    }
}

impl std::fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelFamily::Json => write!(f, "json"),
            ModelFamily::Xml => write!(f, "xml"),
        }
    }
}

/// 从模型输出中解析出的工具调用，只被执行一次
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolCall {
    pub name: String,
    pub kwargs: HashMap<String, String>,
    pub model_id: String,
}

/// 一个已定位的调用块：识别出的工具名（去重）与参数
struct RawCall {
    names: Vec<String>,
    kwargs: HashMap<String, String>,
}

static TOOL_CALL_TAG: OnceLock<Option<Regex>> = OnceLock::new();
static JSON_FENCE: OnceLock<Option<Regex>> = OnceLock::new();
static INVOKE: OnceLock<Option<Regex>> = OnceLock::new();
static TOOL_NAME: OnceLock<Option<Regex>> = OnceLock::new();
static PARAMETERS: OnceLock<Option<Regex>> = OnceLock::new();

fn cached(cell: &'static OnceLock<Option<Regex>>, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

/// 所有匹配的第一个捕获组
fn first_groups<'t>(re: Option<&Regex>, text: &'t str) -> Vec<&'t str> {
    re.map(|re| {
        re.captures_iter(text)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect()
    })
    .unwrap_or_default()
}

/// 解析并校验模型输出中的全部工具调用
pub fn parse_tool_calls(
    family: ModelFamily,
    raw: &str,
    definitions: &[ToolDefinition],
    model_id: &str,
) -> Result<Vec<ToolCall>, ToolCallError> {
    let raw_calls = match family {
        ModelFamily::Json => locate_json_calls(raw),
        ModelFamily::Xml => locate_xml_calls(raw, definitions),
    };
    if raw_calls.is_empty() {
        return Err(ToolCallError::ToolNotFound);
    }

    raw_calls
        .into_iter()
        .map(|call| validate(call, definitions, model_id))
        .collect()
}

fn validate(call: RawCall, definitions: &[ToolDefinition], model_id: &str) -> Result<ToolCall, ToolCallError> {
    let name = match call.names.as_slice() {
        [] => return Err(ToolCallError::ToolNotFound),
        [single] => single.clone(),
        many => return Err(ToolCallError::MultipleToolNameError(many.join(", "))),
    };

    let def = definitions
        .iter()
        .find(|d| d.name == name)
        .ok_or_else(|| ToolCallError::ToolNotExistError { name: name.clone() })?;

    if let Some(missing) = def
        .required_params
        .iter()
        .find(|p| call.kwargs.get(p.as_str()).map_or(true, |v| v.trim().is_empty()))
    {
        return Err(ToolCallError::ToolParameterNotExistError {
            tool: name,
            param: missing.clone(),
        });
    }

    Ok(ToolCall {
        name,
        kwargs: call.kwargs,
        model_id: model_id.to_string(),
    })
}

/// JSON 风格：优先 `<tool_call>` 标签，其次 ```json 代码块，最后整段 JSON
fn locate_json_calls(raw: &str) -> Vec<RawCall> {
    let mut bodies = first_groups(cached(&TOOL_CALL_TAG, r"(?s)<tool_call>(.*?)</tool_call>"), raw);
    if bodies.is_empty() {
        bodies = first_groups(cached(&JSON_FENCE, r"(?s)```json\s*(.*?)```"), raw);
    }
    if bodies.is_empty() {
        let trimmed = raw.trim();
        if trimmed.starts_with('{') && trimmed.ends_with('}') {
            bodies.push(trimmed);
        }
    }

    bodies
        .into_iter()
        .flat_map(|body| match serde_json::from_str::<Value>(body.trim()) {
            Ok(Value::Array(items)) => items.iter().map(json_call).collect::<Vec<_>>(),
            Ok(value) => vec![json_call(&value)],
            // 块已定位但无法解析：当作识别不到工具名
            Err(_) => vec![RawCall {
                names: Vec::new(),
                kwargs: HashMap::new(),
            }],
        })
        .collect()
}

fn json_call(value: &Value) -> RawCall {
    let mut names: Vec<String> = Vec::new();
    for key in ["name", "tool", "tool_name"] {
        match value.get(key) {
            Some(Value::String(s)) => push_unique(&mut names, s),
            Some(Value::Array(items)) => {
                for s in items.iter().filter_map(Value::as_str) {
                    push_unique(&mut names, s);
                }
            }
            _ => {}
        }
    }

    let kwargs = ["kwargs", "arguments", "args"]
        .iter()
        .find_map(|k| value.get(*k).and_then(Value::as_object))
        .map(|obj| {
            obj.iter()
                .map(|(k, v)| {
                    let v = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), v)
                })
                .collect()
        })
        .unwrap_or_default();

    RawCall { names, kwargs }
}

/// XML 风格：每个 `<invoke>` 一个调用；参数按工具定义逐个提取
fn locate_xml_calls(raw: &str, definitions: &[ToolDefinition]) -> Vec<RawCall> {
    let mut blocks = first_groups(cached(&INVOKE, r"(?s)<invoke>(.*?)</invoke>"), raw);
    if blocks.is_empty() && raw.contains("<tool_name>") {
        blocks.push(raw);
    }

    blocks
        .into_iter()
        .map(|block| {
            let mut names = Vec::new();
            for name in first_groups(cached(&TOOL_NAME, r"(?s)<tool_name>(.*?)</tool_name>"), block) {
                push_unique(&mut names, name);
            }

            let params_section = first_groups(cached(&PARAMETERS, r"(?s)<parameters>(.*?)</parameters>"), block)
                .into_iter()
                .next()
                .unwrap_or(block);

            let mut kwargs = HashMap::new();
            if let [name] = names.as_slice() {
                if let Some(def) = definitions.iter().find(|d| &d.name == name) {
                    for param in def.all_params() {
                        if let Some(v) = extract_xml_param(params_section, param) {
                            kwargs.insert(param.clone(), v);
                        }
                    }
                }
            }
            RawCall { names, kwargs }
        })
        .collect()
}

fn extract_xml_param(section: &str, param: &str) -> Option<String> {
    let p = regex::escape(param);
    let re = Regex::new(&format!(r"(?s)<{p}>(.*?)</{p}>")).ok()?;
    re.captures(section)
        .and_then(|c| c.get(1))
        .map(|m| xml_unescape(m.as_str().trim()))
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn push_unique(names: &mut Vec<String>, name: &str) {
    let name = name.trim();
    if name.is_empty() {
        return;
    }
    let seen: HashSet<&str> = names.iter().map(String::as_str).collect();
    if !seen.contains(name) {
        names.push(name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defs() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::new("rag_retrieve", "search").required("query"),
            ToolDefinition::new("give_final_response", "answer").required("response"),
        ]
    }

    #[test]
    fn test_json_tag_call() {
        let raw = "Let me search.\n<tool_call>\n{\"name\": \"rag_retrieve\", \"kwargs\": {\"query\": \"refund policy\"}}\n</tool_call>";
        let calls = parse_tool_calls(ModelFamily::Json, raw, &defs(), "gpt-4o").unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "rag_retrieve");
        assert_eq!(calls[0].kwargs["query"], "refund policy");
        assert_eq!(calls[0].model_id, "gpt-4o");
    }

    #[test]
    fn test_json_fence_call() {
        let raw = "```json\n{\"name\": \"give_final_response\", \"kwargs\": {\"response\": \"hi\"}}\n```";
        let calls = parse_tool_calls(ModelFamily::Json, raw, &defs(), "m").unwrap();
        assert_eq!(calls[0].name, "give_final_response");
    }

    #[test]
    fn test_xml_call() {
        let raw = "<invoke>\n<tool_name>rag_retrieve</tool_name>\n<parameters>\n<query>a &amp; b</query>\n</parameters>\n</invoke>";
        let calls = parse_tool_calls(ModelFamily::Xml, raw, &defs(), "claude-3").unwrap();
        assert_eq!(calls[0].kwargs["query"], "a & b");
    }

    #[test]
    fn test_unknown_tool() {
        let raw = "<tool_call>{\"name\": \"foo\", \"kwargs\": {}}</tool_call>";
        let err = parse_tool_calls(ModelFamily::Json, raw, &defs(), "m").unwrap_err();
        assert_eq!(err, ToolCallError::ToolNotExistError { name: "foo".to_string() });
    }

    #[test]
    fn test_missing_required_param() {
        let raw = "<invoke><tool_name>rag_retrieve</tool_name><parameters></parameters></invoke>";
        let err = parse_tool_calls(ModelFamily::Xml, raw, &defs(), "m").unwrap_err();
        assert_eq!(
            err,
            ToolCallError::ToolParameterNotExistError {
                tool: "rag_retrieve".to_string(),
                param: "query".to_string()
            }
        );
    }

    #[test]
    fn test_multiple_names_checked_first() {
        let raw = "<invoke><tool_name>foo</tool_name><tool_name>bar</tool_name></invoke>";
        let err = parse_tool_calls(ModelFamily::Xml, raw, &defs(), "m").unwrap_err();
        assert_eq!(err, ToolCallError::MultipleToolNameError("foo, bar".to_string()));
    }

    #[test]
    fn test_plain_text_has_no_call() {
        let err = parse_tool_calls(ModelFamily::Json, "Just chatting.", &defs(), "m").unwrap_err();
        assert_eq!(err, ToolCallError::ToolNotFound);
    }

    #[test]
    fn test_family_resolution() {
        assert_eq!(ModelFamily::resolve(None, "claude-3-5-sonnet"), ModelFamily::Xml);
        assert_eq!(ModelFamily::resolve(None, "gpt-4o-mini"), ModelFamily::Json);
        assert_eq!(ModelFamily::resolve(Some("xml"), "gpt-4o-mini"), ModelFamily::Xml);
        assert_eq!(ModelFamily::resolve(Some("bogus"), "gpt"), ModelFamily::Json);
    }
}
