//! 知识库段落加载与检索源组装
//!
//! config/corpus.toml 中每个 [[passage]] 一条：id、text，可选 source 与 question。
//! 所有段落进 BM25；带 question 的同时登记为精确问句；配置了嵌入端点时再建向量源。

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::llm::EmbeddingProvider;
use crate::retrieval::{Bm25Source, CandidateSource, ExactMatchSource, Passage, VectorSource};

#[derive(Debug, Clone, Deserialize)]
pub struct CorpusEntry {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub source: Option<String>,
    /// 对应的标准问句（FAQ 类条目）
    #[serde(default)]
    pub question: Option<String>,
}

impl CorpusEntry {
    pub fn to_passage(&self) -> Passage {
        let mut p = Passage::new(self.id.clone(), self.text.clone());
        if let Some(src) = &self.source {
            p = p.with_metadata("source", src.clone());
        }
        p
    }
}

#[derive(Debug, Deserialize)]
struct CorpusFile {
    #[serde(default)]
    passage: Vec<CorpusEntry>,
}

pub fn load_corpus(path: &Path) -> anyhow::Result<Vec<CorpusEntry>> {
    let content = std::fs::read_to_string(path)?;
    let file: CorpusFile = toml::from_str(&content)?;
    Ok(file.passage)
}

/// 组装知识库检索源：kb_exact（有问句时）、kb_bm25、kb_vector（有嵌入端点时）
pub async fn build_knowledge_sources(
    entries: &[CorpusEntry],
    embedder: Option<Arc<dyn EmbeddingProvider>>,
) -> Vec<Arc<dyn CandidateSource>> {
    let passages: Vec<Passage> = entries.iter().map(CorpusEntry::to_passage).collect();
    let mut sources: Vec<Arc<dyn CandidateSource>> = Vec::new();

    let mut exact = ExactMatchSource::new("kb_exact");
    for (entry, passage) in entries.iter().zip(passages.iter()) {
        if let Some(q) = &entry.question {
            exact.insert(q, passage.clone());
        }
    }
    if !exact.is_empty() {
        sources.push(Arc::new(exact));
    }

    sources.push(Arc::new(Bm25Source::new("kb_bm25", passages.clone())));

    if let Some(embedder) = embedder {
        let vector = VectorSource::new("kb_vector", embedder);
        let indexed = vector.index(passages).await;
        tracing::info!(indexed, total = entries.len(), "vector source indexed");
        sources.push(Arc::new(vector));
    }
    sources
}
