//! RAG 检索工具：Federator + Reranker
//!
//! 返回带编号的证据文本供模型引用，并把检索到的候选挂在 ToolOutput.references 上，
//! 最终汇入 CONTEXT 帧。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::retrieval::{Candidate, Federator, Reranker};
use crate::tools::{Tool, ToolDefinition, ToolOutput};

pub const RAG_RETRIEVE: &str = "rag_retrieve";

/// 单条证据在 Observation 中的最大字符数
const MAX_EVIDENCE_CHARS: usize = 800;

pub struct RagTool {
    def: ToolDefinition,
    federator: Arc<Federator>,
    reranker: Arc<dyn Reranker>,
    top_k: usize,
}

impl RagTool {
    pub fn new(federator: Arc<Federator>, reranker: Arc<dyn Reranker>, top_k: usize) -> Self {
        Self {
            def: ToolDefinition::new(
                RAG_RETRIEVE,
                "Search the knowledge base and return the most relevant passages for a query.",
            )
            .required("query"),
            federator,
            reranker,
            top_k,
        }
    }
}

/// 把候选格式化为编号证据列表
fn format_evidence(candidates: &[Candidate]) -> String {
    candidates
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let text: String = c.text.chars().take(MAX_EVIDENCE_CHARS).collect();
            match c.source() {
                Some(src) => format!("[{}] ({}) {}", i + 1, src, text),
                None => format!("[{}] {}", i + 1, text),
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl Tool for RagTool {
    fn definition(&self) -> &ToolDefinition {
        &self.def
    }

    async fn execute(&self, kwargs: &HashMap<String, String>) -> ToolOutput {
        let query = match kwargs.get("query").map(|q| q.trim()) {
            Some(q) if !q.is_empty() => q,
            _ => return ToolOutput::failure("Missing required parameter: query"),
        };

        let merged = self.federator.federate(query).await;
        let ranked = self.reranker.rerank(query, merged, Some(self.top_k)).await;
        tracing::debug!(query, hits = ranked.len(), reranker = self.reranker.name(), "rag retrieve");

        if ranked.is_empty() {
            return ToolOutput::success("No relevant passages found in the knowledge base.");
        }
        ToolOutput::success(format_evidence(&ranked)).with_references(ranked)
    }
}
