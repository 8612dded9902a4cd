//! 检索层：候选、检索源（向量 / BM25 / 精确问句）、联邦检索、重排、意图快速通道

pub mod bm25;
pub mod candidate;
pub mod corpus;
pub mod exact;
pub mod federator;
pub mod intention;
pub mod rerank;
pub mod source;
pub mod vector;

pub use bm25::{Bm25Source, ScoreScale};
pub use candidate::{Candidate, Passage, SearchBy};
pub use corpus::{build_knowledge_sources, load_corpus, CorpusEntry};
pub use exact::ExactMatchSource;
pub use federator::{federate, Federator, FederatorConfig};
pub use intention::{
    build_intent_sources, load_intent_examples, IntentExample, IntentionMatch, IntentionRouter,
};
pub use rerank::{
    build_reranker, max_sim, ColbertReranker, CrossEncoderReranker, HttpRerankEndpoint,
    HttpTokenEmbedder, PassthroughReranker, RerankEndpoint, Reranker, TokenEmbedder,
};
pub use source::CandidateSource;
pub use vector::VectorSource;
