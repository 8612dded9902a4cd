//! 段落与查询的向量编码（OpenAI 兼容 /embeddings）
//!
//! 建索引时按批请求，查询时单条；向量检索源只依赖 EmbeddingProvider。

use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::embeddings::{CreateEmbeddingRequestArgs, EmbeddingInput};
use async_openai::Client;
use async_trait::async_trait;

use crate::config::LlmSection;
use crate::core::RetrievalError;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 按输入顺序返回向量，长度与 texts 相同
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError>;

    /// 单条查询编码
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetrievalError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        Ok(vectors.pop().unwrap_or_default())
    }
}

#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(client: Client<OpenAIConfig>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::StringArray(texts.to_vec()))
            .build()
            .map_err(|e| RetrievalError::Embedding(e.to_string()))?;
        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| RetrievalError::Embedding(e.to_string()))?;

        if response.data.len() != texts.len() {
            return Err(RetrievalError::ScoreMismatch {
                expected: texts.len(),
                actual: response.data.len(),
            });
        }
        // 服务端不保证顺序，按 index 放回
        let mut vectors = vec![Vec::new(); texts.len()];
        for item in response.data {
            if let Some(slot) = vectors.get_mut(item.index as usize) {
                *slot = item.embedding;
            }
        }
        Ok(vectors)
    }
}

/// 没有 API Key 时不启用向量检索源
pub fn create_embedder_from_config(section: &LlmSection) -> Option<Arc<dyn EmbeddingProvider>> {
    let api_key = section
        .api_key
        .clone()
        .filter(|k| !k.is_empty())
        .or_else(|| std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()));
    let Some(api_key) = api_key else {
        tracing::info!("no embedding api key, vector source disabled");
        return None;
    };

    let mut config = OpenAIConfig::new().with_api_key(api_key);
    if let Some(url) = &section.base_url {
        config = config.with_api_base(url);
    }
    tracing::debug!(model = %section.embedding_model, "embedding provider ready");
    Some(Arc::new(OpenAiEmbedder::new(
        Client::with_config(config),
        section.embedding_model.clone(),
    )))
}
