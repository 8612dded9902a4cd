//! 检索源抽象
//!
//! 每个 CandidateSource 封装一种检索方式（向量 / BM25 / 精确问句匹配），
//! 无结果返回空列表；只有上游不可用时才返回 RetrievalError。

use async_trait::async_trait;

use crate::core::RetrievalError;
use crate::retrieval::Candidate;

#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// 检索源名称（日志与去重时区分来源）
    fn name(&self) -> &str;

    /// 取回至多 top_k 条候选，每条都带 score 与 search_by
    async fn fetch(&self, query: &str, top_k: usize) -> Result<Vec<Candidate>, RetrievalError>;
}
