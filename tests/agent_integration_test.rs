//! Agent 循环集成测试：调用次数上限、纠正消息、检索引用、XML 家族

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bee_rag::llm::{LlmClient, ScriptedLlmClient};
    use bee_rag::react::{AgentLoop, AgentLoopConfig, ModelFamily, TerminalReason, CALL_LIMIT_ANSWER};
    use bee_rag::retrieval::{Bm25Source, CandidateSource, Federator, FederatorConfig, Passage, PassthroughReranker};
    use bee_rag::tools::{GiveFinalResponseTool, GiveRhetoricalQuestionTool, RagTool, ToolExecutor, ToolRegistry};

    fn executor() -> Arc<ToolExecutor> {
        let corpus = vec![
            Passage::new("ship", "Orders ship within two business days.").with_metadata("source", "faq.md"),
            Passage::new("refund", "A refund is issued within 7 days of a return request.")
                .with_metadata("source", "policy.md"),
        ];
        let sources: Vec<Arc<dyn CandidateSource>> = vec![Arc::new(Bm25Source::new("kb_bm25", corpus))];
        let federator = Arc::new(Federator::new(sources, FederatorConfig::default()));

        let mut registry = ToolRegistry::new();
        registry.register(RagTool::new(federator, Arc::new(PassthroughReranker), 3));
        registry.register(GiveFinalResponseTool::default());
        registry.register(GiveRhetoricalQuestionTool::default());
        Arc::new(ToolExecutor::new(registry, 5))
    }

    fn agent(llm: Arc<dyn LlmClient>, call_limit: usize, family: ModelFamily) -> AgentLoop {
        let config = AgentLoopConfig {
            call_limit,
            ..Default::default()
        };
        AgentLoop::new(llm, executor(), config, family)
    }

    #[tokio::test]
    async fn test_never_exceeds_call_limit() {
        for limit in [1, 2, 5, 8] {
            let llm = Arc::new(ScriptedLlmClient::new("gpt-4o", vec!["I'd rather just chat."]));
            let outcome = agent(llm.clone(), limit, ModelFamily::Json)
                .run(Vec::new(), "hello", None, None)
                .await
                .unwrap();
            assert_eq!(llm.calls(), limit);
            assert_eq!(outcome.state.call_count, limit);
            assert_eq!(outcome.reason, TerminalReason::CallLimitReached);
            assert_eq!(outcome.answer, CALL_LIMIT_ANSWER);
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_gets_corrective_message() {
        let llm = Arc::new(ScriptedLlmClient::new(
            "gpt-4o",
            vec![
                "<tool_call>{\"name\": \"foo\", \"kwargs\": {}}</tool_call>",
                "<tool_call>{\"name\": \"give_final_response\", \"kwargs\": {\"response\": \"done\"}}</tool_call>",
            ],
        ));
        let outcome = agent(llm.clone(), 4, ModelFamily::Json)
            .run(Vec::new(), "hi", None, None)
            .await
            .unwrap();
        assert_eq!(outcome.answer, "done");

        let seen = llm.seen_messages();
        assert_eq!(seen.len(), 2);
        let corrective = seen[1]
            .iter()
            .find(|m| m.content.starts_with("ToolNotExistError"))
            .expect("corrective message present");
        assert!(corrective.content.contains("\"foo\""));
        assert!(corrective.content.contains(&ModelFamily::Json.call_grammar()));
    }

    #[tokio::test]
    async fn test_rag_then_final_collects_references() {
        let llm = Arc::new(ScriptedLlmClient::new(
            "gpt-4o",
            vec![
                "<tool_call>{\"name\": \"rag_retrieve\", \"kwargs\": {\"query\": \"refund return days\"}}</tool_call>",
                "<tool_call>{\"name\": \"give_final_response\", \"kwargs\": {\"response\": \"Within 7 days.\"}}</tool_call>",
            ],
        ));
        let outcome = agent(llm.clone(), 5, ModelFamily::Json)
            .run(Vec::new(), "how long does a refund take", None, None)
            .await
            .unwrap();

        assert_eq!(outcome.answer, "Within 7 days.");
        assert_eq!(llm.calls(), 2);
        assert!(!outcome.references.is_empty());
        assert_eq!(outcome.references[0].id, "refund");
        assert!(outcome.state.tool_history.iter().any(|m| m.content.contains("Observation from rag_retrieve")));
    }

    #[tokio::test]
    async fn test_xml_family_flow() {
        let llm = Arc::new(ScriptedLlmClient::new(
            "claude-sonnet",
            vec![
                "<invoke>\n<tool_name>give_rhetorical_question</tool_name>\n<parameters>\n<question>Which order do you mean?</question>\n</parameters>\n</invoke>",
            ],
        ));
        let family = ModelFamily::from_model_id(llm.model_id());
        assert_eq!(family, ModelFamily::Xml);

        let outcome = agent(llm, 3, family).run(Vec::new(), "where is my order", None, None).await.unwrap();
        assert_eq!(outcome.answer, "Which order do you mean?");
        assert_eq!(
            outcome.reason,
            TerminalReason::ToolFinished { tool: "give_rhetorical_question".to_string() }
        );
    }
}
