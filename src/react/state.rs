//! 单次请求的 Agent 状态
//!
//! 只由 AgentLoop 修改，请求结束即丢弃。送给 LLM 的上下文按字符数截断：
//! 系统提示、当前问题和最近一条工具轮次始终保留，其余从最旧的开始丢弃。

use crate::memory::Message;

#[derive(Debug, Clone)]
pub struct AgentState {
    /// 历史对话 + 当前问题（最后一条）
    pub messages: Vec<Message>,
    /// 本次请求内的模型输出、纠正消息与工具观察
    pub tool_history: Vec<Message>,
    pub call_count: usize,
    pub call_limit: usize,
    /// 最近一次模型原始输出
    pub current_output: Option<String>,
    pub intent_type: Option<String>,
}

impl AgentState {
    pub fn new(history: Vec<Message>, query: &str, call_limit: usize, intent_type: Option<String>) -> Self {
        let mut messages = history;
        messages.push(Message::user(query));
        Self {
            messages,
            tool_history: Vec::new(),
            call_count: 0,
            call_limit,
            current_output: None,
            intent_type,
        }
    }

    pub fn query(&self) -> &str {
        self.messages.last().map(|m| m.content.as_str()).unwrap_or("")
    }

    pub fn can_propose(&self) -> bool {
        self.call_count < self.call_limit
    }

    pub fn record_proposal(&mut self, raw: &str) {
        self.call_count += 1;
        self.current_output = Some(raw.to_string());
    }

    pub fn push_tool_turn(&mut self, message: Message) {
        self.tool_history.push(message);
    }

    /// 组装一次 PROPOSE 的输入：system + 历史 + 当前问题 + 工具轮次，总字符数不超过 max_chars
    pub fn prompt_messages(&self, system: &str, max_chars: usize) -> Vec<Message> {
        let (history, current) = match self.messages.split_last() {
            Some((last, rest)) => (rest, Some(last)),
            None => (&self.messages[..0], None),
        };
        let (older_tools, latest_tool) = match self.tool_history.split_last() {
            Some((last, rest)) => (rest, Some(last)),
            None => (&self.tool_history[..0], None),
        };

        let pinned = system.chars().count()
            + current.map_or(0, Message::char_len)
            + latest_tool.map_or(0, Message::char_len);
        let mut budget = max_chars.saturating_sub(pinned);

        // 从最新往最旧取，先工具轮次后历史对话
        let mut kept_tools = Vec::new();
        let mut exhausted = false;
        for m in older_tools.iter().rev() {
            if m.char_len() > budget {
                exhausted = true;
                break;
            }
            budget -= m.char_len();
            kept_tools.push(m.clone());
        }
        let mut kept_history = Vec::new();
        if !exhausted {
            for m in history.iter().rev() {
                if m.char_len() > budget {
                    break;
                }
                budget -= m.char_len();
                kept_history.push(m.clone());
            }
        }

        let dropped = history.len() - kept_history.len() + older_tools.len() - kept_tools.len();
        if dropped > 0 {
            tracing::debug!(dropped, max_chars, "trimmed agent context");
        }

        let mut out = Vec::with_capacity(2 + kept_history.len() + kept_tools.len() + 1);
        out.push(Message::system(system));
        out.extend(kept_history.into_iter().rev());
        if let Some(c) = current {
            out.push(c.clone());
        }
        out.extend(kept_tools.into_iter().rev());
        if let Some(t) = latest_tool {
            out.push(t.clone());
        }
        out
    }
}
