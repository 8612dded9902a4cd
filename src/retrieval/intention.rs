//! 意图快速通道
//!
//! 对「意图样例」检索源跑一遍 Federator + Reranker，过滤出分数严格大于阈值的样例。
//! 非空即视为命中：调用方可直接用样例的预设回复作答，否则进入 Agent 循环。
//! 阈值来自配置（retrieval.intent_threshold），不在代码里写死。

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::retrieval::{
    Bm25Source, Candidate, CandidateSource, ExactMatchSource, Federator, FederatorConfig, Passage,
    Reranker, ScoreScale,
};

/// 意图样例（config/intentions.toml 中的 [[intention]] 条目）
#[derive(Debug, Clone, Deserialize)]
pub struct IntentExample {
    /// 样例问句
    pub question: String,
    /// 意图名
    pub intent: String,
    /// 预设回复；为空时命中后仍走 Agent 循环，仅携带意图类型
    #[serde(default)]
    pub answer: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IntentFile {
    #[serde(default)]
    intention: Vec<IntentExample>,
}

/// 读取意图样例库
pub fn load_intent_examples(path: &Path) -> anyhow::Result<Vec<IntentExample>> {
    let content = std::fs::read_to_string(path)?;
    let file: IntentFile = toml::from_str(&content)?;
    Ok(file.intention)
}

/// 把意图样例建成检索源：精确问句匹配 + BM25
///
/// 两者分数都在 [0, 1]（BM25 取覆盖率刻度），才能共用一个阈值
pub fn build_intent_sources(examples: &[IntentExample]) -> Vec<Arc<dyn CandidateSource>> {
    let passages: Vec<Passage> = examples
        .iter()
        .enumerate()
        .map(|(i, ex)| {
            let mut p = Passage::new(format!("intent-{}", i), ex.question.clone())
                .with_metadata("intent", ex.intent.clone())
                .with_metadata("source", "intentions");
            if let Some(answer) = &ex.answer {
                p = p.with_metadata("answer", answer.clone());
            }
            p
        })
        .collect();

    let mut exact = ExactMatchSource::new("intent_exact");
    for (ex, p) in examples.iter().zip(passages.iter()) {
        exact.insert(&ex.question, p.clone());
    }
    vec![
        Arc::new(exact),
        Arc::new(Bm25Source::new("intent_bm25", passages).with_scale(ScoreScale::Overlap)),
    ]
}

/// 路由结果
#[derive(Debug, Clone, Default)]
pub struct IntentionMatch {
    pub matched: bool,
    /// 分数超过阈值的样例（按排序分数降序）
    pub examples: Vec<Candidate>,
}

impl IntentionMatch {
    /// 最佳样例的意图名
    pub fn intent(&self) -> Option<&str> {
        self.examples.first().and_then(|c| c.meta_str("intent"))
    }

    /// 最佳样例的预设回复
    pub fn canned_answer(&self) -> Option<&str> {
        self.examples.first().and_then(|c| c.meta_str("answer"))
    }
}

pub struct IntentionRouter {
    federator: Federator,
    reranker: Arc<dyn Reranker>,
    threshold: f32,
    top_k: usize,
}

impl IntentionRouter {
    pub fn new(federator: Federator, reranker: Arc<dyn Reranker>, threshold: f32, top_k: usize) -> Self {
        Self {
            federator,
            reranker,
            threshold,
            top_k,
        }
    }

    /// 从样例库直接构造
    pub fn from_examples(
        examples: &[IntentExample],
        config: FederatorConfig,
        reranker: Arc<dyn Reranker>,
        threshold: f32,
        top_k: usize,
    ) -> Self {
        Self::new(
            Federator::new(build_intent_sources(examples), config),
            reranker,
            threshold,
            top_k,
        )
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub async fn route(&self, query: &str) -> IntentionMatch {
        let merged = self.federator.federate(query).await;
        let ranked = self.reranker.rerank(query, merged, Some(self.top_k)).await;
        let examples: Vec<Candidate> = ranked
            .into_iter()
            .filter(|c| c.ordering_score() > self.threshold)
            .collect();
        let matched = !examples.is_empty();
        tracing::debug!(
            matched,
            hits = examples.len(),
            threshold = self.threshold,
            "intention routing"
        );
        IntentionMatch { matched, examples }
    }
}
