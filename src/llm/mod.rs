//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock），以及检索用的嵌入端点

pub mod embedding;
pub mod mock;
pub mod openai;
pub mod traits;

pub use embedding::{create_embedder_from_config, EmbeddingProvider, OpenAiEmbedder};
pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{LlmClient, TokenStream};

use std::sync::Arc;

use crate::config::LlmSection;

/// 按配置创建 LLM：有 API Key 时走 OpenAI 兼容端点，否则退回 Mock
pub fn create_llm_from_config(section: &LlmSection) -> Arc<dyn LlmClient> {
    let key = section
        .api_key
        .clone()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .filter(|k| !k.is_empty());
    match key {
        Some(key) => {
            tracing::info!(model = %section.model, "Using OpenAI-compatible LLM");
            Arc::new(OpenAiClient::from_section(section, &key))
        }
        None => {
            tracing::info!("No API key configured, using mock LLM");
            Arc::new(MockLlmClient)
        }
    }
}
