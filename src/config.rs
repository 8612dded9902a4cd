//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BEE_RAG__*` 覆盖（双下划线表示嵌套，如 `BEE_RAG__AGENT__REPEATED_CALL_LIMIT=3`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub retrieval: RetrievalSection,
    #[serde(default)]
    pub rerank: RerankSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub stream: StreamSection,
    #[serde(default)]
    pub server: ServerSection,
}

/// [agent] 段：工具调用循环上限、上下文长度上限、模型族
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    /// 单次请求内 PROPOSE（LLM 调用）次数上限
    #[serde(default = "default_repeated_call_limit")]
    pub repeated_call_limit: usize,
    /// 每次 PROPOSE 送入 LLM 的对话总字符上限（超出时从最旧的轮次开始裁剪）
    #[serde(default = "default_max_history_chars")]
    pub max_history_chars: usize,
    /// 纠正提示中回显原始输出的最大字符数
    #[serde(default = "default_max_corrective_chars")]
    pub max_corrective_chars: usize,
    /// 工具调用格式：json / xml；未设置时按模型 ID 推断
    pub model_family: Option<String>,
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// 从会话存储加载的历史轮数
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
    /// 系统提示词前缀
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_repeated_call_limit() -> usize {
    5
}

fn default_max_history_chars() -> usize {
    12_000
}

fn default_max_corrective_chars() -> usize {
    2_000
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_history_turns() -> usize {
    10
}

fn default_system_prompt() -> String {
    "You are a helpful assistant that answers questions using the provided tools. \
     Retrieve evidence before answering factual questions."
        .to_string()
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            repeated_call_limit: default_repeated_call_limit(),
            max_history_chars: default_max_history_chars(),
            max_corrective_chars: default_max_corrective_chars(),
            model_family: None,
            tool_timeout_secs: default_tool_timeout_secs(),
            history_turns: default_history_turns(),
            system_prompt: default_system_prompt(),
        }
    }
}

/// [retrieval] 段：每个检索源取回条数、超时、并发上限、意图阈值
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalSection {
    #[serde(default = "default_per_source_top_k")]
    pub per_source_top_k: usize,
    #[serde(default = "default_source_timeout_secs")]
    pub source_timeout_secs: u64,
    /// Federator / Reranker 同时在跑的任务数上限
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// 意图命中阈值：最高分严格大于该值才视为命中
    #[serde(default = "default_intent_threshold")]
    pub intent_threshold: f32,
    #[serde(default = "default_intent_top_k")]
    pub intent_top_k: usize,
    /// 意图样例库（TOML），未设置时不启用意图快速通道
    pub intentions_path: Option<PathBuf>,
    /// 知识库段落（TOML），供 rag_retrieve 检索
    pub corpus_path: Option<PathBuf>,
}

fn default_per_source_top_k() -> usize {
    10
}

fn default_source_timeout_secs() -> u64 {
    10
}

fn default_max_concurrency() -> usize {
    8
}

fn default_intent_threshold() -> f32 {
    0.4
}

fn default_intent_top_k() -> usize {
    3
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            per_source_top_k: default_per_source_top_k(),
            source_timeout_secs: default_source_timeout_secs(),
            max_concurrency: default_max_concurrency(),
            intent_threshold: default_intent_threshold(),
            intent_top_k: default_intent_top_k(),
            intentions_path: None,
            corpus_path: None,
        }
    }
}

/// 重排模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RerankMode {
    #[default]
    CrossEncoder,
    Colbert,
}

/// [rerank] 段：是否启用、模式、端点、批大小
#[derive(Debug, Clone, Deserialize)]
pub struct RerankSection {
    #[serde(default = "default_use_rerank")]
    pub use_rerank: bool,
    #[serde(default)]
    pub mode: RerankMode,
    /// 重排端点 URL；未设置时退化为 Passthrough
    pub endpoint: Option<String>,
    /// 未设置时 cross_encoder 取 128，colbert 取 1
    pub batch_size: Option<usize>,
    #[serde(default = "default_rerank_top_k")]
    pub top_k: usize,
    #[serde(default = "default_rerank_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_use_rerank() -> bool {
    true
}

fn default_rerank_top_k() -> usize {
    10
}

fn default_rerank_timeout_secs() -> u64 {
    30
}

impl RerankSection {
    pub fn effective_batch_size(&self) -> usize {
        let size = self.batch_size.unwrap_or(match self.mode {
            RerankMode::CrossEncoder => 128,
            RerankMode::Colbert => 1,
        });
        size.max(1)
    }
}

impl Default for RerankSection {
    fn default() -> Self {
        Self {
            use_rerank: default_use_rerank(),
            mode: RerankMode::default(),
            endpoint: None,
            batch_size: None,
            top_k: default_rerank_top_k(),
            timeout_secs: default_rerank_timeout_secs(),
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: None,
            api_key: None,
            embedding_model: default_embedding_model(),
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

/// [session] 段：会话存储位置（未设置时使用内存存储）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SessionSection {
    pub db_path: Option<PathBuf>,
}

/// [stream] 段：最终回复切块大小
#[derive(Debug, Clone, Deserialize)]
pub struct StreamSection {
    /// 每个 CHUNK 帧的字符数；0 表示整段回复作为单个 CHUNK
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
    /// 是否在回复前发送 Agent 过程的 MONITOR 帧
    #[serde(default = "default_monitor")]
    pub monitor: bool,
}

fn default_chunk_chars() -> usize {
    32
}

fn default_monitor() -> bool {
    true
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            chunk_chars: default_chunk_chars(),
            monitor: default_monitor(),
        }
    }
}

/// [server] 段：WebSocket 服务监听地址
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 BEE_RAG__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BEE_RAG__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BEE_RAG")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
