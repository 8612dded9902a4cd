//! 重排：对合并后的候选集二次打分、排序、截断
//!
//! 三种可互换策略（按配置选择）：
//! - CrossEncoderReranker：(query, text) 对按固定批大小切分，各批并发调用打分端点
//! - ColbertReranker：Token 级向量，MaxSim 后对查询 Token 取平均；批大小默认 1
//! - PassthroughReranker：未配置重排端点时按原始 score 排序
//!
//! 批次失败时该批候选被丢弃（不会带着空分数混入结果），其余批次照常返回。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::{RerankMode, RerankSection};
use crate::core::RetrievalError;
use crate::retrieval::candidate::sort_by_score_desc;
use crate::retrieval::Candidate;

/// 重排策略
#[async_trait]
pub trait Reranker: Send + Sync {
    /// 策略名（日志用）
    fn name(&self) -> &str;

    /// 重排并截断到 top_k；top_k 为 None 时不截断
    async fn rerank(&self, query: &str, candidates: Vec<Candidate>, top_k: Option<usize>) -> Vec<Candidate>;
}

/// 交叉编码打分端点：输入 (query, text) 对，返回等长分数列表
#[async_trait]
pub trait RerankEndpoint: Send + Sync {
    async fn score(&self, pairs: &[(String, String)]) -> Result<Vec<f32>, RetrievalError>;
}

/// Token 向量端点：每段文本返回 [token][dim] 矩阵
#[async_trait]
pub trait TokenEmbedder: Send + Sync {
    async fn embed_tokens(&self, texts: &[String]) -> Result<Vec<Vec<Vec<f32>>>, RetrievalError>;
}

/// 单个批次的打分器（每次重排构造一次，持有 query 相关状态）
#[async_trait]
trait BatchScorer: Send + Sync + 'static {
    async fn score_batch(&self, texts: Vec<String>) -> Result<Vec<f32>, RetrievalError>;
}

/// 把 texts 切成 batch_size 大小的批次并发打分；失败批次对应位置为 None
async fn score_in_batches(
    scorer: Arc<dyn BatchScorer>,
    texts: Vec<String>,
    batch_size: usize,
    max_concurrency: usize,
) -> Vec<Option<f32>> {
    let total = texts.len();
    let batch_size = batch_size.max(1);
    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for (batch_idx, batch) in texts.chunks(batch_size).enumerate() {
        let batch = batch.to_vec();
        let scorer = scorer.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let expected = batch.len();
            let result = scorer.score_batch(batch).await.and_then(|scores| {
                if scores.len() == expected {
                    Ok(scores)
                } else {
                    Err(RetrievalError::ScoreMismatch {
                        expected,
                        actual: scores.len(),
                    })
                }
            });
            (batch_idx, result)
        });
    }

    let mut scores = vec![None; total];
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((batch_idx, Ok(batch_scores))) => {
                let offset = batch_idx * batch_size;
                for (i, s) in batch_scores.into_iter().enumerate() {
                    scores[offset + i] = Some(s);
                }
            }
            Ok((batch_idx, Err(e))) => {
                tracing::warn!(batch = batch_idx, error = %e, "rerank batch failed, dropping its candidates");
            }
            Err(e) => {
                tracing::warn!(error = %e, "rerank batch task aborted");
            }
        }
    }
    scores
}

/// 写回 rerank_score，丢弃未打分的候选，按 (rerank_score 降序, 原 score 降序) 排序后截断
fn apply_scores(candidates: Vec<Candidate>, scores: Vec<Option<f32>>, top_k: Option<usize>) -> Vec<Candidate> {
    let mut scored: Vec<Candidate> = candidates
        .into_iter()
        .zip(scores)
        .filter_map(|(mut c, s)| {
            c.rerank_score = Some(s?);
            Some(c)
        })
        .collect();

    scored.sort_by(|a, b| {
        b.rerank_score
            .partial_cmp(&a.rerank_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal))
    });
    if let Some(k) = top_k {
        scored.truncate(k);
    }
    scored
}

/// 交叉编码重排
pub struct CrossEncoderReranker {
    endpoint: Arc<dyn RerankEndpoint>,
    batch_size: usize,
    max_concurrency: usize,
}

impl CrossEncoderReranker {
    pub fn new(endpoint: Arc<dyn RerankEndpoint>, batch_size: usize, max_concurrency: usize) -> Self {
        Self {
            endpoint,
            batch_size,
            max_concurrency,
        }
    }
}

struct PairScorer {
    endpoint: Arc<dyn RerankEndpoint>,
    query: String,
}

#[async_trait]
impl BatchScorer for PairScorer {
    async fn score_batch(&self, texts: Vec<String>) -> Result<Vec<f32>, RetrievalError> {
        let pairs: Vec<(String, String)> = texts
            .into_iter()
            .map(|t| (self.query.clone(), t))
            .collect();
        self.endpoint.score(&pairs).await
    }
}

#[async_trait]
impl Reranker for CrossEncoderReranker {
    fn name(&self) -> &str {
        "cross_encoder"
    }

    async fn rerank(&self, query: &str, candidates: Vec<Candidate>, top_k: Option<usize>) -> Vec<Candidate> {
        if candidates.is_empty() {
            return Vec::new();
        }
        let scorer = Arc::new(PairScorer {
            endpoint: self.endpoint.clone(),
            query: query.to_string(),
        });
        let texts = candidates.iter().map(|c| c.text.clone()).collect();
        let scores = score_in_batches(scorer, texts, self.batch_size, self.max_concurrency).await;
        apply_scores(candidates, scores, top_k)
    }
}

/// Token 级（ColBERT 风格）重排
pub struct ColbertReranker {
    embedder: Arc<dyn TokenEmbedder>,
    batch_size: usize,
    max_concurrency: usize,
}

impl ColbertReranker {
    pub fn new(embedder: Arc<dyn TokenEmbedder>, batch_size: usize, max_concurrency: usize) -> Self {
        Self {
            embedder,
            batch_size,
            max_concurrency,
        }
    }
}

struct MaxSimScorer {
    embedder: Arc<dyn TokenEmbedder>,
    query_tokens: Vec<Vec<f32>>,
}

#[async_trait]
impl BatchScorer for MaxSimScorer {
    async fn score_batch(&self, texts: Vec<String>) -> Result<Vec<f32>, RetrievalError> {
        let docs = self.embedder.embed_tokens(&texts).await?;
        Ok(docs.iter().map(|doc| max_sim(&self.query_tokens, doc)).collect())
    }
}

/// 对每个查询 Token 取与文档 Token 的最大点积，再对查询 Token 求平均
pub fn max_sim(query: &[Vec<f32>], doc: &[Vec<f32>]) -> f32 {
    if query.is_empty() || doc.is_empty() {
        return 0.0;
    }
    let total: f32 = query
        .iter()
        .map(|q| {
            doc.iter()
                .map(|d| q.iter().zip(d.iter()).map(|(a, b)| a * b).sum::<f32>())
                .fold(f32::NEG_INFINITY, f32::max)
        })
        .sum();
    total / query.len() as f32
}

#[async_trait]
impl Reranker for ColbertReranker {
    fn name(&self) -> &str {
        "colbert"
    }

    async fn rerank(&self, query: &str, candidates: Vec<Candidate>, top_k: Option<usize>) -> Vec<Candidate> {
        if candidates.is_empty() {
            return Vec::new();
        }
        let query_tokens = match self.embedder.embed_tokens(&[query.to_string()]).await {
            Ok(mut v) if !v.is_empty() => v.swap_remove(0),
            Ok(_) => {
                tracing::warn!("colbert query embedding empty, no candidates scored");
                return Vec::new();
            }
            Err(e) => {
                tracing::warn!(error = %e, "colbert query embedding failed, no candidates scored");
                return Vec::new();
            }
        };
        let scorer = Arc::new(MaxSimScorer {
            embedder: self.embedder.clone(),
            query_tokens,
        });
        let texts = candidates.iter().map(|c| c.text.clone()).collect();
        let scores = score_in_batches(scorer, texts, self.batch_size, self.max_concurrency).await;
        apply_scores(candidates, scores, top_k)
    }
}

/// 无重排端点时的回退：按原 score 排序，只在调用方给出 top_k 时截断
#[derive(Debug, Default)]
pub struct PassthroughReranker;

#[async_trait]
impl Reranker for PassthroughReranker {
    fn name(&self) -> &str {
        "passthrough"
    }

    async fn rerank(&self, _query: &str, mut candidates: Vec<Candidate>, top_k: Option<usize>) -> Vec<Candidate> {
        sort_by_score_desc(&mut candidates);
        if let Some(k) = top_k {
            candidates.truncate(k);
        }
        candidates
    }
}

#[derive(Serialize)]
struct ScoreRequest<'a> {
    pairs: Vec<[&'a str; 2]>,
}

#[derive(Deserialize)]
struct ScoreResponse {
    scores: Vec<f32>,
}

/// HTTP 打分端点：POST {"pairs": [[query, text], ...]} -> {"scores": [...]}
pub struct HttpRerankEndpoint {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpRerankEndpoint {
    pub fn new(client: reqwest::Client, url: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            client,
            url: url.into(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    fn upstream(&self, e: impl std::fmt::Display) -> RetrievalError {
        RetrievalError::Upstream {
            source_name: self.url.clone(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl RerankEndpoint for HttpRerankEndpoint {
    async fn score(&self, pairs: &[(String, String)]) -> Result<Vec<f32>, RetrievalError> {
        let body = ScoreRequest {
            pairs: pairs.iter().map(|(q, t)| [q.as_str(), t.as_str()]).collect(),
        };
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.upstream(e))?
            .error_for_status()
            .map_err(|e| self.upstream(e))?;
        let parsed: ScoreResponse = response.json().await.map_err(|e| self.upstream(e))?;
        Ok(parsed.scores)
    }
}

#[derive(Serialize)]
struct TokenRequest<'a> {
    texts: &'a [String],
}

#[derive(Deserialize)]
struct TokenResponse {
    embeddings: Vec<Vec<Vec<f32>>>,
}

/// HTTP Token 向量端点：POST {"texts": [...]} -> {"embeddings": [[[f32]]]}
pub struct HttpTokenEmbedder {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpTokenEmbedder {
    pub fn new(client: reqwest::Client, url: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            client,
            url: url.into(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl TokenEmbedder for HttpTokenEmbedder {
    async fn embed_tokens(&self, texts: &[String]) -> Result<Vec<Vec<Vec<f32>>>, RetrievalError> {
        let upstream = |e: reqwest::Error| RetrievalError::Upstream {
            source_name: self.url.clone(),
            message: e.to_string(),
        };
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&TokenRequest { texts })
            .send()
            .await
            .map_err(upstream)?
            .error_for_status()
            .map_err(upstream)?;
        let parsed: TokenResponse = response.json().await.map_err(upstream)?;
        if parsed.embeddings.len() != texts.len() {
            return Err(RetrievalError::ScoreMismatch {
                expected: texts.len(),
                actual: parsed.embeddings.len(),
            });
        }
        Ok(parsed.embeddings)
    }
}

/// 按配置构造重排器：未启用或未配置端点时使用 Passthrough
pub fn build_reranker(section: &RerankSection, client: reqwest::Client, max_concurrency: usize) -> Arc<dyn Reranker> {
    let endpoint = match (&section.endpoint, section.use_rerank) {
        (Some(url), true) => url.clone(),
        _ => {
            tracing::info!("rerank disabled or no endpoint configured, using passthrough");
            return Arc::new(PassthroughReranker);
        }
    };
    let batch_size = section.effective_batch_size();
    match section.mode {
        RerankMode::CrossEncoder => Arc::new(CrossEncoderReranker::new(
            Arc::new(HttpRerankEndpoint::new(client, endpoint, section.timeout_secs)),
            batch_size,
            max_concurrency,
        )),
        RerankMode::Colbert => Arc::new(ColbertReranker::new(
            Arc::new(HttpTokenEmbedder::new(client, endpoint, section.timeout_secs)),
            batch_size,
            max_concurrency,
        )),
    }
}
