//! Agent 主循环
//!
//! PROPOSE -> PARSE_VALIDATE -> {EXECUTE -> PROPOSE | RETRY -> PROPOSE} -> TERMINAL。
//! 模型调用次数严格不超过 call_limit；格式错误注入纠正消息后重试，工具 code=1 作为观察反馈，
//! 终止工具执行成功或调用次数用尽时结束。可选 event_tx 推送过程事件（转为 MONITOR 帧）。

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

use crate::config::AgentSection;
use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::memory::Message;
use crate::react::prompt::{build_system_prompt, corrective_message, truncate_chars};
use crate::react::{parse_tool_calls, AgentState, ModelFamily, ReactEvent, ToolCall};
use crate::retrieval::Candidate;
use crate::tools::{ToolExecutor, ToolOutput};

/// 调用次数用尽时的回复
pub const CALL_LIMIT_ANSWER: &str = "抱歉，我暂时无法完成这个请求，请换个说法或稍后再试。";
/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;

/// 循环参数
#[derive(Debug, Clone)]
pub struct AgentLoopConfig {
    pub call_limit: usize,
    pub max_history_chars: usize,
    pub max_corrective_chars: usize,
    pub system_prompt: String,
}

impl AgentLoopConfig {
    pub fn from_section(section: &AgentSection) -> Self {
        Self {
            call_limit: section.repeated_call_limit,
            max_history_chars: section.max_history_chars,
            max_corrective_chars: section.max_corrective_chars,
            system_prompt: section.system_prompt.clone(),
        }
    }
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self::from_section(&AgentSection::default())
    }
}

/// 循环结束原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalReason {
    /// 终止工具执行成功
    ToolFinished { tool: String },
    CallLimitReached,
}

impl std::fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalReason::ToolFinished { tool } => write!(f, "tool_finished:{}", tool),
            TerminalReason::CallLimitReached => write!(f, "call_limit_reached"),
        }
    }
}

/// 循环结果：最终回复、结束原因、终态与检索证据
#[derive(Debug)]
pub struct AgentOutcome {
    pub answer: String,
    pub reason: TerminalReason,
    pub state: AgentState,
    pub references: Vec<Candidate>,
}

pub struct AgentLoop {
    llm: Arc<dyn LlmClient>,
    executor: Arc<ToolExecutor>,
    config: AgentLoopConfig,
    family: ModelFamily,
}

fn send_event(tx: Option<&UnboundedSender<ReactEvent>>, ev: ReactEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

fn preview(s: &str) -> String {
    if s.chars().count() > OBSERVATION_PREVIEW_CHARS {
        format!("{}...", s.chars().take(OBSERVATION_PREVIEW_CHARS).collect::<String>())
    } else {
        s.to_string()
    }
}

/// 工具结果写回 tool_history 的格式
fn format_observation(call: &ToolCall, output: &ToolOutput) -> String {
    let status = if output.is_success() { "success" } else { "failure" };
    format!(
        "Observation from {} (code={}, {}):\n{}",
        call.name,
        output.code,
        status,
        output.result_text()
    )
}

impl AgentLoop {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        executor: Arc<ToolExecutor>,
        config: AgentLoopConfig,
        family: ModelFamily,
    ) -> Self {
        Self {
            llm,
            executor,
            config,
            family,
        }
    }

    pub fn family(&self) -> ModelFamily {
        self.family
    }

    pub fn config(&self) -> &AgentLoopConfig {
        &self.config
    }

    /// 执行一次请求的循环；只有 LLM 调用失败是致命错误
    pub async fn run(
        &self,
        history: Vec<Message>,
        query: &str,
        intent_type: Option<String>,
        event_tx: Option<&UnboundedSender<ReactEvent>>,
    ) -> Result<AgentOutcome, AgentError> {
        let definitions = self.executor.definitions();
        let mut system = build_system_prompt(&self.config.system_prompt, self.family, &definitions);
        if let Some(intent) = &intent_type {
            system.push_str(&format!("\n\nDetected intent: {}", intent));
        }

        let mut state = AgentState::new(history, query, self.config.call_limit, intent_type);
        let mut references: Vec<Candidate> = Vec::new();
        let mut seen_refs = HashSet::new();

        while state.can_propose() {
            send_event(event_tx, ReactEvent::StepUpdate {
                step: state.call_count + 1,
                max_steps: state.call_limit,
            });

            // PROPOSE
            let messages = state.prompt_messages(&system, self.config.max_history_chars);
            send_event(event_tx, ReactEvent::Thinking);
            let raw = self.llm.complete(&messages).await.map_err(AgentError::LlmError)?;
            state.record_proposal(&raw);

            // PARSE_VALIDATE
            let calls = match parse_tool_calls(self.family, &raw, &definitions, self.llm.model_id()) {
                Ok(calls) => calls,
                Err(e) => {
                    tracing::warn!(error = %e, attempt = state.call_count, "malformed tool call, retrying");
                    send_event(event_tx, ReactEvent::Retry {
                        error: e.to_string(),
                        attempt: state.call_count,
                    });
                    state.push_tool_turn(Message::assistant(truncate_chars(
                        &raw,
                        self.config.max_corrective_chars,
                    )));
                    state.push_tool_turn(Message::user(corrective_message(&e, self.family, &definitions)));
                    continue;
                }
            };
            state.push_tool_turn(Message::assistant(raw));

            // EXECUTE
            for call in calls {
                send_event(event_tx, ReactEvent::ToolCall {
                    tool: call.name.clone(),
                    args: serde_json::to_value(&call.kwargs).unwrap_or_default(),
                });
                let output = self.executor.execute(&call.name, &call.kwargs).await;
                for r in &output.references {
                    if seen_refs.insert(r.dedup_key()) {
                        references.push(r.clone());
                    }
                }

                if output.is_success() && self.executor.is_terminal(&call.name) {
                    let reason = TerminalReason::ToolFinished { tool: call.name.clone() };
                    self.finish(event_tx, &reason);
                    return Ok(AgentOutcome {
                        answer: output.result_text(),
                        reason,
                        state,
                        references,
                    });
                }

                let observation = format_observation(&call, &output);
                send_event(event_tx, ReactEvent::Observation {
                    tool: call.name.clone(),
                    code: output.code,
                    preview: preview(&output.result_text()),
                });
                state.push_tool_turn(Message::user(observation));
            }
        }

        tracing::warn!(call_limit = state.call_limit, "agent call limit reached");
        let reason = TerminalReason::CallLimitReached;
        self.finish(event_tx, &reason);
        Ok(AgentOutcome {
            answer: CALL_LIMIT_ANSWER.to_string(),
            reason,
            state,
            references,
        })
    }

    fn finish(&self, event_tx: Option<&UnboundedSender<ReactEvent>>, reason: &TerminalReason) {
        let (prompt_tokens, completion_tokens, total_tokens) = self.llm.token_usage();
        if total_tokens > 0 {
            send_event(event_tx, ReactEvent::TokenUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens,
            });
        }
        send_event(event_tx, ReactEvent::Terminal { reason: reason.to_string() });
    }
}
