//! 检索候选与待索引段落
//!
//! Candidate 在单次检索中创建、传递、丢弃；排序前 score 只在同一 search_by 内可比，
//! 重排后 rerank_score（若有）是唯一排序依据。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::tokenizer::normalize_text;

/// 候选来源的检索方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchBy {
    Vector,
    Bm25,
    Exact,
}

impl std::fmt::Display for SearchBy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchBy::Vector => write!(f, "vector"),
            SearchBy::Bm25 => write!(f, "bm25"),
            SearchBy::Exact => write!(f, "exact"),
        }
    }
}

/// 单条检索证据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub text: String,
    pub metadata: HashMap<String, Value>,
    pub score: f32,
    pub search_by: SearchBy,
    pub rerank_score: Option<f32>,
}

impl Candidate {
    pub fn new(id: impl Into<String>, text: impl Into<String>, score: f32, search_by: SearchBy) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: HashMap::new(),
            score,
            search_by,
            rerank_score: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// 字符串类型的元数据
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// 来源字段（metadata.source），用于去重键与引用展示
    pub fn source(&self) -> Option<&str> {
        self.meta_str("source")
    }

    /// 排序分数：有重排分数时用重排分数
    pub fn ordering_score(&self) -> f32 {
        self.rerank_score.unwrap_or(self.score)
    }

    /// 去重键：(归一化文本, 来源字段)
    pub fn dedup_key(&self) -> (String, String) {
        (
            normalize_text(&self.text),
            self.source().unwrap_or_default().to_string(),
        )
    }

    /// CONTEXT 帧中的引用摘要
    pub fn to_reference(&self) -> Value {
        serde_json::json!({
            "id": self.id,
            "source": self.source(),
            "search_by": self.search_by,
            "score": self.ordering_score(),
            "text": self.text,
        })
    }
}

/// 待索引的段落（进程内检索源的输入）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Passage {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn to_candidate(&self, score: f32, search_by: SearchBy) -> Candidate {
        Candidate {
            id: self.id.clone(),
            text: self.text.clone(),
            metadata: self.metadata.clone(),
            score,
            search_by,
            rerank_score: None,
        }
    }
}

/// 按分数降序排序（分数相同保持原顺序）
pub(crate) fn sort_by_score_desc(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
}
