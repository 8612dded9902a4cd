//! 工具注册表
//!
//! 所有工具实现 Tool trait（definition / execute），由 ToolRegistry 按名注册与查找；
//! ToolDefinition 在会话配置时加载、此后不变，用于校验解析出的 ToolCall。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::retrieval::Candidate;

/// 工具定义：名称、描述、必填与可选参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub required_params: BTreeSet<String>,
    pub optional_params: BTreeSet<String>,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            required_params: BTreeSet::new(),
            optional_params: BTreeSet::new(),
        }
    }

    pub fn required(mut self, param: impl Into<String>) -> Self {
        self.required_params.insert(param.into());
        self
    }

    pub fn optional(mut self, param: impl Into<String>) -> Self {
        self.optional_params.insert(param.into());
        self
    }

    /// 全部参数名（必填在前）
    pub fn all_params(&self) -> impl Iterator<Item = &String> {
        self.required_params.iter().chain(self.optional_params.iter())
    }
}

/// 工具执行结果：code 0 成功、1 失败（软失败，作为 Observation 反馈给模型）
#[derive(Debug, Clone, Serialize)]
pub struct ToolOutput {
    pub code: i32,
    pub result: Value,
    /// 检索类工具带回的证据，汇入 CONTEXT 帧
    #[serde(skip)]
    pub references: Vec<Candidate>,
}

impl ToolOutput {
    pub fn success(result: impl Into<Value>) -> Self {
        Self {
            code: 0,
            result: result.into(),
            references: Vec::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            code: 1,
            result: Value::String(message.into()),
            references: Vec::new(),
        }
    }

    pub fn with_references(mut self, references: Vec<Candidate>) -> Self {
        self.references = references;
        self
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    /// 结果的文本形式（字符串直接取值，其余序列化为 JSON）
    pub fn result_text(&self) -> String {
        match &self.result {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// 工具 trait：定义（供 LLM 理解与校验）、是否终止工具、异步执行
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> &ToolDefinition;

    fn name(&self) -> &str {
        &self.definition().name
    }

    /// 终止工具执行成功后 Agent 循环结束，其结果即最终回复
    fn is_terminal(&self) -> bool {
        false
    }

    async fn execute(&self, kwargs: &HashMap<String, String>) -> ToolOutput;
}

/// 工具注册表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn is_terminal(&self, name: &str) -> bool {
        self.tools.get(name).is_some_and(|t| t.is_terminal())
    }

    /// 未注册的工具返回 code 1，而不是错误
    pub async fn execute(&self, name: &str, kwargs: &HashMap<String, String>) -> ToolOutput {
        match self.tools.get(name) {
            Some(tool) => tool.execute(kwargs).await,
            None => ToolOutput::failure(format!("Unknown tool: {name}")),
        }
    }

    /// 全部工具定义，按名称排序（保证提示词稳定）
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.tools.values().map(|t| t.definition().clone()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.definitions().into_iter().map(|d| d.name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper {
        def: ToolDefinition,
    }

    #[async_trait]
    impl Tool for Upper {
        fn definition(&self) -> &ToolDefinition {
            &self.def
        }

        async fn execute(&self, kwargs: &HashMap<String, String>) -> ToolOutput {
            match kwargs.get("text") {
                Some(t) => ToolOutput::success(t.to_uppercase()),
                None => ToolOutput::failure("missing text"),
            }
        }
    }

    #[tokio::test]
    async fn test_register_and_execute() {
        let mut registry = ToolRegistry::new();
        registry.register(Upper {
            def: ToolDefinition::new("upper", "Uppercase text").required("text"),
        });

        let mut kwargs = HashMap::new();
        kwargs.insert("text".to_string(), "abc".to_string());
        let out = registry.execute("upper", &kwargs).await;
        assert!(out.is_success());
        assert_eq!(out.result_text(), "ABC");
        assert!(!registry.is_terminal("upper"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_soft_failure() {
        let registry = ToolRegistry::new();
        let out = registry.execute("nope", &HashMap::new()).await;
        assert_eq!(out.code, 1);
        assert!(out.result_text().contains("nope"));
    }
}
