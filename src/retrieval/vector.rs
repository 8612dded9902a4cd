//! 向量检索源：段落预先编码，查询时按余弦相似度取 top_k

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::core::RetrievalError;
use crate::llm::EmbeddingProvider;
use crate::retrieval::candidate::sort_by_score_desc;
use crate::retrieval::{Candidate, CandidateSource, Passage, SearchBy};

const INDEX_BATCH_SIZE: usize = 64;

pub struct VectorSource {
    name: String,
    embedder: Arc<dyn EmbeddingProvider>,
    /// (段落, 向量)
    entries: RwLock<Vec<(Passage, Vec<f32>)>>,
}

impl VectorSource {
    pub fn new(name: impl Into<String>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            name: name.into(),
            embedder,
            entries: RwLock::new(Vec::new()),
        }
    }

    /// 按批编码并加入索引；返回成功加入的条数（整批失败时跳过该批并记录日志）
    pub async fn index(&self, passages: Vec<Passage>) -> usize {
        let mut added = Vec::with_capacity(passages.len());
        for batch in passages.chunks(INDEX_BATCH_SIZE) {
            let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
            match self.embedder.embed_batch(&texts).await {
                Ok(vectors) => {
                    for (passage, v) in batch.iter().zip(vectors) {
                        if v.is_empty() {
                            tracing::debug!(source = %self.name, id = %passage.id, "empty embedding, skipped");
                        } else {
                            added.push((passage.clone(), v));
                        }
                    }
                }
                Err(e) => tracing::warn!(
                    source = %self.name,
                    batch = batch.len(),
                    error = %e,
                    "embedding batch failed"
                ),
            }
        }
        let count = added.len();
        self.entries.write().await.extend(added);
        count
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CandidateSource for VectorSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, query: &str, top_k: usize) -> Result<Vec<Candidate>, RetrievalError> {
        let query_embedding = self.embedder.embed(query).await?;
        if query_embedding.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let entries = self.entries.read().await;
        let mut scored: Vec<Candidate> = entries
            .iter()
            .map(|(passage, emb)| (cosine_similarity(&query_embedding, emb), passage))
            .filter(|(score, _)| *score > 0.0)
            .map(|(score, passage)| passage.to_candidate(score, SearchBy::Vector))
            .collect();

        sort_by_score_desc(&mut scored);
        scored.truncate(top_k);
        Ok(scored)
    }
}

/// 余弦相似度
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 字母频次向量：足以区分测试语料
    struct LetterEmbedder;

    #[async_trait]
    impl EmbeddingProvider for LetterEmbedder {
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
            Ok(texts
                .iter()
                .map(|text| {
                    let mut v = vec![0.0f32; 26];
                    for c in text.to_lowercase().chars() {
                        if c.is_ascii_lowercase() {
                            v[(c as u8 - b'a') as usize] += 1.0;
                        }
                    }
                    v
                })
                .collect())
        }
    }

    struct BrokenEmbedder;

    #[async_trait]
    impl EmbeddingProvider for BrokenEmbedder {
        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, RetrievalError> {
            Err(RetrievalError::Embedding("503 Service Unavailable".to_string()))
        }
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 0.001);
        assert!(cosine_similarity(&a, &[0.0, 1.0, 0.0]).abs() < 0.001);
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
    }

    #[tokio::test]
    async fn test_fetch_orders_by_similarity() {
        let source = VectorSource::new("vec", Arc::new(LetterEmbedder));
        let added = source
            .index(vec![
                Passage::new("a", "aaaa aaaa"),
                Passage::new("b", "zzzz yyyy"),
                Passage::new("c", "aaab"),
            ])
            .await;
        assert_eq!(added, 3);

        let hits = source.fetch("aaaa", 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[1].id, "c");
        assert!(hits.iter().all(|c| c.search_by == SearchBy::Vector));
    }

    #[tokio::test]
    async fn test_no_hits_is_empty_not_error() {
        let source = VectorSource::new("vec", Arc::new(LetterEmbedder));
        assert!(source.fetch("anything", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_embedding_failure_is_error() {
        let source = VectorSource::new("vec", Arc::new(BrokenEmbedder));
        let err = source.fetch("q", 3).await.unwrap_err();
        assert!(matches!(err, RetrievalError::Embedding(_)));
        assert_eq!(source.index(vec![Passage::new("a", "aaaa")]).await, 0);
    }
}
