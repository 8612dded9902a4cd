//! BM25 关键词检索源
//!
//! Okapi BM25（k1 = 1.2，b = 0.75），分词使用中英文混合分词器。索引在构建时一次性计算。

use std::collections::HashMap;

use async_trait::async_trait;

use crate::core::RetrievalError;
use crate::memory::tokenizer::{term_counts, tokenize_to_set};
use crate::retrieval::candidate::sort_by_score_desc;
use crate::retrieval::{Candidate, CandidateSource, Passage, SearchBy};

const K1: f32 = 1.2;
const B: f32 = 0.75;

struct IndexedPassage {
    passage: Passage,
    term_freq: HashMap<String, usize>,
    len: usize,
}

/// 输出分数的刻度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScoreScale {
    /// 原始 BM25 分数，无上界
    #[default]
    Raw,
    /// 按 idf 加权的查询覆盖率与段落覆盖率的调和平均，落在 [0, 1]，可与阈值比较
    Overlap,
}

pub struct Bm25Source {
    name: String,
    docs: Vec<IndexedPassage>,
    doc_freq: HashMap<String, usize>,
    avg_len: f32,
    scale: ScoreScale,
}

impl Bm25Source {
    pub fn new(name: impl Into<String>, passages: impl IntoIterator<Item = Passage>) -> Self {
        let mut docs = Vec::new();
        let mut doc_freq: HashMap<String, usize> = HashMap::new();

        for passage in passages {
            let (term_freq, len) = term_counts(&passage.text);
            for term in term_freq.keys() {
                *doc_freq.entry(term.clone()).or_insert(0) += 1;
            }
            docs.push(IndexedPassage {
                passage,
                term_freq,
                len,
            });
        }

        let total: usize = docs.iter().map(|d| d.len).sum();
        let avg_len = if docs.is_empty() {
            0.0
        } else {
            total as f32 / docs.len() as f32
        };

        Self {
            name: name.into(),
            docs,
            doc_freq,
            avg_len,
            scale: ScoreScale::Raw,
        }
    }

    pub fn with_scale(mut self, scale: ScoreScale) -> Self {
        self.scale = scale;
        self
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    fn idf(&self, term: &str) -> f32 {
        let n = self.docs.len() as f32;
        let df = self.doc_freq.get(term).copied().unwrap_or(0) as f32;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    fn score(&self, query_terms: &[String], doc: &IndexedPassage) -> f32 {
        let len_norm = if self.avg_len > 0.0 {
            doc.len as f32 / self.avg_len
        } else {
            0.0
        };
        query_terms
            .iter()
            .filter_map(|term| {
                let tf = *doc.term_freq.get(term)? as f32;
                Some(self.idf(term) * tf * (K1 + 1.0) / (tf + K1 * (1.0 - B + B * len_norm)))
            })
            .sum()
    }

    fn overlap(&self, query_terms: &[String], doc: &IndexedPassage) -> f32 {
        let query_weight: f32 = query_terms.iter().map(|t| self.idf(t)).sum();
        let doc_weight: f32 = doc.term_freq.keys().map(|t| self.idf(t)).sum();
        let shared: f32 = query_terms
            .iter()
            .filter(|t| doc.term_freq.contains_key(*t))
            .map(|t| self.idf(t))
            .sum();
        if shared <= 0.0 || query_weight <= 0.0 || doc_weight <= 0.0 {
            return 0.0;
        }
        let q = shared / query_weight;
        let d = shared / doc_weight;
        2.0 * q * d / (q + d)
    }
}

#[async_trait]
impl CandidateSource for Bm25Source {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, query: &str, top_k: usize) -> Result<Vec<Candidate>, RetrievalError> {
        let mut query_terms: Vec<String> = tokenize_to_set(query).into_iter().collect();
        query_terms.sort();
        if query_terms.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<Candidate> = self
            .docs
            .iter()
            .map(|doc| {
                let score = match self.scale {
                    ScoreScale::Raw => self.score(&query_terms, doc),
                    ScoreScale::Overlap => self.overlap(&query_terms, doc),
                };
                (score, doc)
            })
            .filter(|(score, _)| *score > 0.0)
            .map(|(score, doc)| doc.passage.to_candidate(score, SearchBy::Bm25))
            .collect();

        sort_by_score_desc(&mut scored);
        scored.truncate(top_k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> Bm25Source {
        Bm25Source::new(
            "bm25",
            vec![
                Passage::new("refund", "A refund is issued within 7 days of a return request."),
                Passage::new("ship", "Shipping takes 3 to 5 business days."),
                Passage::new("refund2", "A refund refund policy applies to damaged goods."),
            ],
        )
    }

    #[tokio::test]
    async fn test_fetch_ranks_matching_passages() {
        let source = corpus();
        let hits = source.fetch("refund policy", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "refund2");
        assert!(hits[0].score >= hits[1].score);
        assert!(hits.iter().all(|c| c.search_by == SearchBy::Bm25));
    }

    #[tokio::test]
    async fn test_fetch_respects_top_k_and_empty_results() {
        let source = corpus();
        assert_eq!(source.fetch("refund", 1).await.unwrap().len(), 1);
        assert!(source.fetch("quantum chromodynamics", 5).await.unwrap().is_empty());
        assert!(source.fetch("   ", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overlap_scale_is_bounded_and_penalises_partial_match() {
        let source = Bm25Source::new(
            "intents",
            vec![
                Passage::new("greet", "hello"),
                Passage::new("order", "where is my order"),
            ],
        )
        .with_scale(ScoreScale::Overlap);

        let exact = source.fetch("Hello", 5).await.unwrap();
        assert!((exact[0].score - 1.0).abs() < 1e-5);

        let mixed = source
            .fetch("hello, what is your refund policy for broken devices?", 5)
            .await
            .unwrap();
        assert_eq!(mixed[0].id, "greet");
        assert!(mixed[0].score < 0.4, "partial overlap scored {}", mixed[0].score);
        assert!(mixed.iter().all(|c| (0.0..=1.0).contains(&c.score)));
    }

    #[tokio::test]
    async fn test_chinese_passages() {
        let source = Bm25Source::new(
            "zh",
            vec![
                Passage::new("1", "退货政策：收到商品七天内可以申请退货"),
                Passage::new("2", "配送时间一般为三到五个工作日"),
            ],
        );
        let hits = source.fetch("怎么申请退货", 5).await.unwrap();
        assert_eq!(hits.first().map(|c| c.id.as_str()), Some("1"));
    }
}
