//! 单轮对话编排
//!
//! 读取历史 → 意图路由（命中且有预设回复时走快速通道）→ 否则 Agent 循环
//! → 流式投递 → 写入会话存储（由投递层在终止帧之后完成）。

use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::config::{AgentSection, AppConfig, StreamSection};
use crate::llm::{create_embedder_from_config, create_llm_from_config, LlmClient};
use crate::react::{AgentLoop, AgentLoopConfig, ModelFamily, ReactEvent};
use crate::retrieval::{
    build_knowledge_sources, build_reranker, load_corpus, load_intent_examples, CandidateSource, Federator,
    FederatorConfig, IntentExample, IntentionMatch, IntentionRouter,
};
use crate::session::{create_session_store, history_messages, SessionStore};
use crate::stream::{
    Answer, CancelRegistry, DeliveryExtras, DeliveryOutcome, DeliveryTarget, FrameSink, StreamDelivery,
    TurnRecord,
};
use crate::tools::{GiveFinalResponseTool, GiveRhetoricalQuestionTool, RagTool, ToolExecutor, ToolRegistry};

/// 一次对话请求（WebSocket 入站消息的字段）
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub query: String,
    pub session_id: String,
    pub user_id: String,
    #[serde(default)]
    pub custom_message_id: Option<String>,
}

pub struct ChatService {
    router: Option<IntentionRouter>,
    agent: AgentLoop,
    delivery: StreamDelivery,
    store: Arc<dyn SessionStore>,
    history_turns: usize,
    chunk_chars: usize,
    monitor: bool,
}

impl ChatService {
    pub fn new(
        router: Option<IntentionRouter>,
        agent: AgentLoop,
        store: Arc<dyn SessionStore>,
        cancel: Arc<CancelRegistry>,
    ) -> Self {
        let stream = StreamSection::default();
        Self {
            router,
            agent,
            delivery: StreamDelivery::new(cancel, Some(store.clone())),
            store,
            history_turns: AgentSection::default().history_turns,
            chunk_chars: stream.chunk_chars,
            monitor: stream.monitor,
        }
    }

    pub fn with_history_turns(mut self, turns: usize) -> Self {
        self.history_turns = turns;
        self
    }

    /// 0 表示整段回复作为单个 CHUNK
    pub fn with_chunk_chars(mut self, chars: usize) -> Self {
        self.chunk_chars = chars;
        self
    }

    /// 关闭后不再发送 MONITOR 帧
    pub fn with_monitor(mut self, enabled: bool) -> Self {
        self.monitor = enabled;
        self
    }

    /// 按配置组装：知识库检索源供 rag_retrieve 使用，意图样例供快速通道使用
    pub fn from_config(
        config: &AppConfig,
        llm: Arc<dyn LlmClient>,
        knowledge_sources: Vec<Arc<dyn CandidateSource>>,
        intents: &[IntentExample],
        store: Arc<dyn SessionStore>,
        cancel: Arc<CancelRegistry>,
    ) -> Self {
        let federator_config = FederatorConfig::from_section(&config.retrieval);
        let reranker = build_reranker(
            &config.rerank,
            reqwest::Client::new(),
            config.retrieval.max_concurrency,
        );

        let mut registry = ToolRegistry::new();
        registry.register(RagTool::new(
            Arc::new(Federator::new(knowledge_sources, federator_config.clone())),
            reranker.clone(),
            config.rerank.top_k,
        ));
        registry.register(GiveFinalResponseTool::default());
        registry.register(GiveRhetoricalQuestionTool::default());
        let executor = Arc::new(ToolExecutor::new(registry, config.agent.tool_timeout_secs));

        let family = ModelFamily::resolve(config.agent.model_family.as_deref(), llm.model_id());
        tracing::info!(model = llm.model_id(), family = %family, "agent tool-call format");
        let agent = AgentLoop::new(llm, executor, AgentLoopConfig::from_section(&config.agent), family);

        let router = (!intents.is_empty()).then(|| {
            IntentionRouter::from_examples(
                intents,
                federator_config,
                reranker,
                config.retrieval.intent_threshold,
                config.retrieval.intent_top_k,
            )
        });

        Self::new(router, agent, store, cancel)
            .with_history_turns(config.agent.history_turns)
            .with_chunk_chars(config.stream.chunk_chars)
            .with_monitor(config.stream.monitor)
    }

    pub fn cancel_registry(&self) -> &Arc<CancelRegistry> {
        self.delivery.cancel_registry()
    }

    /// 处理一轮：总是以一个终止帧（END 或 ERROR）结束，并记录一次会话
    pub async fn handle(&self, connection_id: &str, request: ChatRequest, sink: &dyn FrameSink) -> DeliveryOutcome {
        // 上一轮结束后才到达的 stop 不作用于本轮
        self.cancel_registry().clear(connection_id);

        let history = match self.store.get_messages(&request.session_id).await {
            Ok(records) => history_messages(&records, self.history_turns),
            Err(e) => {
                tracing::warn!(session_id = %request.session_id, error = %e, "failed to load history");
                Vec::new()
            }
        };

        let routed = match &self.router {
            Some(router) => router.route(&request.query).await,
            None => IntentionMatch::default(),
        };
        let intent = routed.intent().map(str::to_string);
        let target = DeliveryTarget::new(connection_id, request.custom_message_id.clone());

        let (answer, extras, path) = match routed.canned_answer() {
            Some(canned) if routed.matched => {
                tracing::info!(intent = ?intent, "intention fast path");
                let extras = DeliveryExtras {
                    intent: intent.clone(),
                    ..Default::default()
                };
                (Answer::chunked(canned, self.chunk_chars), extras, "intention")
            }
            _ => {
                let (answer, extras) = self.run_agent(history, &request.query, intent.clone()).await;
                (answer, extras, "agent")
            }
        };

        let turn = TurnRecord {
            session_id: request.session_id.clone(),
            user_id: request.user_id.clone(),
            query: request.query.clone(),
            metadata: json!({
                "path": path,
                "intent": intent,
                "custom_message_id": request.custom_message_id,
            }),
        };
        self.delivery.deliver(sink, &target, answer, extras, Some(turn)).await
    }

    /// Agent 失败转成 ERROR 帧，不向上传播
    async fn run_agent(
        &self,
        history: Vec<crate::memory::Message>,
        query: &str,
        intent: Option<String>,
    ) -> (Answer, DeliveryExtras) {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ReactEvent>();
        let result = self
            .agent
            .run(history, query, intent.clone(), self.monitor.then_some(&event_tx))
            .await;
        drop(event_tx);

        let mut monitor = Vec::new();
        while let Ok(ev) = event_rx.try_recv() {
            monitor.push(ev);
        }

        match result {
            Ok(outcome) => {
                tracing::info!(
                    reason = %outcome.reason,
                    calls = outcome.state.call_count,
                    references = outcome.references.len(),
                    "agent finished"
                );
                let extras = DeliveryExtras {
                    references: outcome.references,
                    monitor,
                    intent,
                };
                (Answer::chunked(&outcome.answer, self.chunk_chars), extras)
            }
            Err(e) => {
                tracing::warn!(error = %e, "agent failed");
                let extras = DeliveryExtras {
                    monitor,
                    intent,
                    ..Default::default()
                };
                (Answer::failed(e.to_string()), extras)
            }
        }
    }
}

/// 进程入口用：按配置创建 LLM、知识库检索源、意图样例与会话存储，再组装 ChatService
pub async fn build_chat_service(config: &AppConfig, cancel: Arc<CancelRegistry>) -> anyhow::Result<ChatService> {
    let llm = create_llm_from_config(&config.llm);

    let intents = match &config.retrieval.intentions_path {
        Some(path) => load_intent_examples(path)
            .with_context(|| format!("Failed to load intentions from {}", path.display()))?,
        None => Vec::new(),
    };
    let corpus = match &config.retrieval.corpus_path {
        Some(path) => load_corpus(path).with_context(|| format!("Failed to load corpus from {}", path.display()))?,
        None => Vec::new(),
    };
    let embedder = create_embedder_from_config(&config.llm);
    let sources = build_knowledge_sources(&corpus, embedder).await;
    let store = create_session_store(&config.session).context("Failed to open session store")?;

    tracing::info!(
        intents = intents.len(),
        passages = corpus.len(),
        sources = sources.len(),
        "chat service ready"
    );
    Ok(ChatService::from_config(config, llm, sources, &intents, store, cancel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockLlmClient, ScriptedLlmClient};
    use crate::retrieval::{Bm25Source, Passage};
    use crate::session::MemorySessionStore;
    use crate::stream::{DeliveryStatus, Frame, StreamMessage};

    fn intents() -> Vec<IntentExample> {
        vec![IntentExample {
            question: "hello".to_string(),
            intent: "greeting".to_string(),
            answer: Some("Hi! How can I help you today?".to_string()),
        }]
    }

    fn service(llm: Arc<dyn LlmClient>, store: Arc<dyn SessionStore>) -> ChatService {
        let corpus: Vec<Arc<dyn CandidateSource>> = vec![Arc::new(Bm25Source::new(
            "kb",
            vec![Passage::new("p1", "Orders ship within two business days.")],
        ))];
        ChatService::from_config(
            &AppConfig::default(),
            llm,
            corpus,
            &intents(),
            store,
            Arc::new(CancelRegistry::new()),
        )
    }

    fn request(query: &str) -> ChatRequest {
        ChatRequest {
            query: query.to_string(),
            session_id: "s1".to_string(),
            user_id: "u1".to_string(),
            custom_message_id: Some("cm-1".to_string()),
        }
    }

    fn kinds(frames: &[Frame]) -> Vec<&'static str> {
        frames.iter().map(|f| f.message.kind()).collect()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<Frame> {
        let mut out = Vec::new();
        while let Ok(f) = rx.try_recv() {
            out.push(f);
        }
        out
    }

    #[tokio::test]
    async fn test_intention_fast_path_skips_llm() {
        let llm = Arc::new(ScriptedLlmClient::new("gpt", vec!["unused"]));
        let store = Arc::new(MemorySessionStore::new());
        let svc = service(llm.clone(), store.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let out = svc.handle("conn", request("Hello!"), &tx).await;
        assert_eq!(out.text, "Hi! How can I help you today?");
        assert_eq!(llm.calls(), 0);

        let frames = drain(&mut rx);
        assert_eq!(kinds(&frames).first(), Some(&"START"));
        assert_eq!(kinds(&frames).last(), Some(&"END"));
        assert!(frames.iter().all(|f| f.custom_message_id.as_deref() == Some("cm-1")));

        let msgs = store.get_messages("s1").await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].metadata["path"], "intention");
    }

    #[tokio::test]
    async fn test_agent_path_streams_and_records() {
        let store = Arc::new(MemorySessionStore::new());
        let svc = service(Arc::new(MockLlmClient), store.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let out = svc.handle("conn", request("what is the shipping time"), &tx).await;
        assert_eq!(out.text, "Echo from Mock: what is the shipping time");

        let frames = drain(&mut rx);
        let k = kinds(&frames);
        assert_eq!(k[0], "START");
        assert!(k.contains(&"MONITOR"));
        assert_eq!(&k[k.len() - 2..], &["CONTEXT", "END"]);

        let msgs = store.get_messages("s1").await.unwrap();
        assert_eq!(msgs[1].metadata["path"], "agent");
        assert_eq!(msgs[1].metadata["status"], "completed");
    }

    #[tokio::test]
    async fn test_llm_failure_becomes_error_frame() {
        let llm = Arc::new(ScriptedLlmClient::from_results("gpt", vec![Err("upstream 500".to_string())]));
        let store = Arc::new(MemorySessionStore::new());
        let svc = service(llm, store.clone()).with_monitor(false);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let out = svc.handle("conn", request("tell me something"), &tx).await;
        assert_eq!(out.text, "");
        let frames = drain(&mut rx);
        assert_eq!(kinds(&frames), vec!["START", "ERROR"]);
        match &frames[1].message {
            StreamMessage::Error { message } => assert!(message.contains("upstream 500")),
            other => panic!("unexpected frame {other:?}"),
        }
        assert_eq!(store.get_messages("s1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_between_turns_does_not_cancel_next_turn() {
        let llm = Arc::new(ScriptedLlmClient::new(
            "gpt",
            vec![
                "<tool_call>{\"name\": \"give_final_response\", \"kwargs\": {\"response\": \"first answer\"}}</tool_call>",
                "<tool_call>{\"name\": \"give_final_response\", \"kwargs\": {\"response\": \"second answer\"}}</tool_call>",
            ],
        ));
        let store = Arc::new(MemorySessionStore::new());
        let svc = service(llm, store.clone()).with_monitor(false);
        let (tx, mut rx) = mpsc::unbounded_channel();

        svc.handle("conn", request("one"), &tx).await;
        drain(&mut rx);
        svc.cancel_registry().cancel("conn");

        let out = svc.handle("conn", request("two"), &tx).await;
        assert_eq!(out.text, "second answer");
        assert_eq!(out.status, DeliveryStatus::Completed);
        let k = kinds(&drain(&mut rx));
        assert_eq!(&k[k.len() - 2..], &["CONTEXT", "END"]);

        let contents: Vec<String> = store
            .get_messages("s1")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["one", "first answer", "two", "second answer"]);
    }

    #[tokio::test]
    async fn test_greeting_word_in_real_question_runs_agent() {
        let llm = Arc::new(ScriptedLlmClient::new(
            "gpt",
            vec!["<tool_call>{\"name\": \"give_final_response\", \"kwargs\": {\"response\": \"Broken devices can be returned.\"}}</tool_call>"],
        ));
        let store = Arc::new(MemorySessionStore::new());
        let svc = service(llm.clone(), store.clone()).with_monitor(false);
        let (tx, _rx) = mpsc::unbounded_channel();

        let out = svc
            .handle("conn", request("hello, what is your refund policy for broken devices?"), &tx)
            .await;
        assert_eq!(out.text, "Broken devices can be returned.");
        assert_eq!(llm.calls(), 1);
        let msgs = store.get_messages("s1").await.unwrap();
        assert_eq!(msgs[1].metadata["path"], "agent");
    }

    #[test]
    fn test_new_uses_section_defaults() {
        let svc = ChatService::new(
            None,
            AgentLoop::new(
                Arc::new(MockLlmClient),
                Arc::new(ToolExecutor::new(ToolRegistry::new(), 5)),
                AgentLoopConfig::default(),
                ModelFamily::Json,
            ),
            Arc::new(MemorySessionStore::new()),
            Arc::new(CancelRegistry::new()),
        );
        assert_eq!(svc.history_turns, AgentSection::default().history_turns);
        assert_eq!(svc.chunk_chars, StreamSection::default().chunk_chars);
        assert_eq!(svc.monitor, StreamSection::default().monitor);
    }
}
