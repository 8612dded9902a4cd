//! Mock LLM 客户端（用于测试与无 API Key 的本地演示）
//!
//! - MockLlmClient：取最后一条 User 消息，回显为 give_final_response 工具调用
//! - ScriptedLlmClient：按顺序返回预设输出，记录调用次数与收到的消息

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::LlmClient;
use crate::memory::{Message, Role};

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    fn model_id(&self) -> &str {
        "mock"
    }

    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        let call = serde_json::json!({
            "name": "give_final_response",
            "kwargs": { "response": format!("Echo from Mock: {}", last_user) }
        });
        Ok(format!("<tool_call>\n{}\n</tool_call>", call))
    }
}

/// 脚本化客户端：依次弹出预设输出；脚本用完后重复最后一条
#[derive(Debug)]
pub struct ScriptedLlmClient {
    model: String,
    script: Mutex<VecDeque<Result<String, String>>>,
    last: Mutex<Option<Result<String, String>>>,
    calls: AtomicUsize,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new(model: impl Into<String>, outputs: Vec<&str>) -> Self {
        Self::from_results(model, outputs.into_iter().map(|s| Ok(s.to_string())).collect())
    }

    pub fn from_results(model: impl Into<String>, outputs: Vec<Result<String, String>>) -> Self {
        Self {
            model: model.into(),
            script: Mutex::new(outputs.into()),
            last: Mutex::new(None),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// 已被调用的次数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 每次调用收到的完整消息列表
    pub fn seen_messages(&self) -> Vec<Vec<Message>> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(messages.to_vec());

        let next = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        match next {
            Some(out) => {
                *last = Some(out.clone());
                out
            }
            None => last
                .clone()
                .unwrap_or_else(|| Err("script exhausted".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_repeats_last_output() {
        let llm = ScriptedLlmClient::new("gpt-test", vec!["a", "b"]);
        let msgs = [Message::user("hi")];
        assert_eq!(llm.complete(&msgs).await.unwrap(), "a");
        assert_eq!(llm.complete(&msgs).await.unwrap(), "b");
        assert_eq!(llm.complete(&msgs).await.unwrap(), "b");
        assert_eq!(llm.calls(), 3);
        assert_eq!(llm.seen_messages().len(), 3);
    }

    #[tokio::test]
    async fn test_mock_echoes_last_user_message() {
        let out = MockLlmClient
            .complete(&[Message::system("sys"), Message::user("ping")])
            .await
            .unwrap();
        assert!(out.contains("give_final_response"));
        assert!(out.contains("Echo from Mock: ping"));
    }
}
