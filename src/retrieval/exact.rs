//! 精确问句匹配源：问句归一化后完全一致即命中，分数固定为 1.0

use std::collections::HashMap;

use async_trait::async_trait;

use crate::core::RetrievalError;
use crate::memory::tokenizer::normalize_text;
use crate::retrieval::{Candidate, CandidateSource, Passage, SearchBy};

pub struct ExactMatchSource {
    name: String,
    /// 归一化问句 -> 段落（段落文本为答案或意图样例）
    entries: HashMap<String, Passage>,
}

impl ExactMatchSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: HashMap::new(),
        }
    }

    /// 登记一条问句；同一归一化问句重复登记时后者覆盖前者
    pub fn insert(&mut self, question: &str, passage: Passage) {
        let passage = passage.with_metadata("question", question.to_string());
        self.entries.insert(normalize_text(question), passage);
    }

    pub fn with_entry(mut self, question: &str, passage: Passage) -> Self {
        self.insert(question, passage);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CandidateSource for ExactMatchSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, query: &str, top_k: usize) -> Result<Vec<Candidate>, RetrievalError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        Ok(self
            .entries
            .get(&normalize_text(query))
            .map(|p| vec![p.to_candidate(1.0, SearchBy::Exact)])
            .unwrap_or_default())
    }
}
