//! 流式投递
//!
//! 严格顺序：START →（MONITOR）→ CHUNK* → CONTEXT → END；元素失败时以 ERROR 结束。
//! 每个元素发送前检查连接的取消标志（等待下一段时同样监听）：已取消则立即发 END、清除标志并返回已累计文本。
//! 投递结束时无论结果如何都清除该连接的标志。
//! 终止帧确定之后，把 (query, 已累计回复) 写入会话存储，且只写一次。

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use futures_util::StreamExt;
use regex::Regex;
use serde_json::{json, Value};

use crate::core::DeliveryError;
use crate::llm::TokenStream;
use crate::react::ReactEvent;
use crate::retrieval::Candidate;
use crate::session::SessionStore;
use crate::stream::{CancelRegistry, Frame, FrameSink, StreamMessage};

/// 待投递的回复：静态文本或惰性序列
pub enum Answer {
    Static(String),
    Stream(TokenStream),
}

impl Answer {
    /// 按字符数切块（模拟逐段输出）；chunk_chars 为 0 时整段作为一块
    pub fn chunked(text: &str, chunk_chars: usize) -> Self {
        if chunk_chars == 0 {
            return Answer::Static(text.to_string());
        }
        let chars: Vec<char> = text.chars().collect();
        let pieces: Vec<Result<String, String>> = chars
            .chunks(chunk_chars)
            .map(|c| Ok(c.iter().collect()))
            .collect();
        Answer::Stream(Box::pin(futures_util::stream::iter(pieces)))
    }

    pub fn from_chunks<S: Into<String>>(chunks: Vec<S>) -> Self {
        let pieces: Vec<Result<String, String>> = chunks.into_iter().map(|c| Ok(c.into())).collect();
        Answer::Stream(Box::pin(futures_util::stream::iter(pieces)))
    }

    /// 上游失败：投递时产生 ERROR 帧
    pub fn failed(message: impl Into<String>) -> Self {
        let item: Result<String, String> = Err(message.into());
        Answer::Stream(Box::pin(futures_util::stream::iter(vec![item])))
    }

    fn into_stream(self) -> TokenStream {
        match self {
            Answer::Static(text) => Box::pin(futures_util::stream::iter(vec![Ok(text)])),
            Answer::Stream(s) => s,
        }
    }
}

/// 投递目标：连接 ID（取消标志的键）与帧关联 ID
#[derive(Debug, Clone)]
pub struct DeliveryTarget {
    pub connection_id: String,
    pub message_id: String,
    pub custom_message_id: Option<String>,
}

impl DeliveryTarget {
    pub fn new(connection_id: impl Into<String>, custom_message_id: Option<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            message_id: uuid::Uuid::new_v4().to_string(),
            custom_message_id,
        }
    }
}

/// CONTEXT 帧与 MONITOR 帧的附加内容
#[derive(Debug, Clone, Default)]
pub struct DeliveryExtras {
    pub references: Vec<Candidate>,
    pub monitor: Vec<ReactEvent>,
    pub intent: Option<String>,
}

/// 写入会话存储所需的一轮信息
#[derive(Debug, Clone)]
pub struct TurnRecord {
    pub session_id: String,
    pub user_id: String,
    pub query: String,
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Completed,
    Cancelled,
    Failed(String),
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Completed => "completed",
            DeliveryStatus::Cancelled => "cancelled",
            DeliveryStatus::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    pub text: String,
    pub status: DeliveryStatus,
}

static MEDIA: OnceLock<Option<Regex>> = OnceLock::new();

/// 回复文本中的 `![alt](path)` 引用，按 path 去重
pub fn extract_media(text: &str) -> Vec<Value> {
    let Some(re) = MEDIA
        .get_or_init(|| Regex::new(r"!\[([^\]]*)\]\(([^)\s]+)\)").ok())
        .as_ref()
    else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    re.captures_iter(text)
        .filter_map(|c| {
            let alt = c.get(1).map_or("", |m| m.as_str());
            let path = c.get(2)?.as_str();
            seen.insert(path.to_string())
                .then(|| json!({ "alt": alt, "path": path }))
        })
        .collect()
}

fn context_payload(text: &str, extras: &DeliveryExtras) -> Value {
    json!({
        "references": extras.references.iter().map(Candidate::to_reference).collect::<Vec<_>>(),
        "media": extract_media(text),
        "intent": extras.intent,
    })
}

pub struct StreamDelivery {
    cancel: Arc<CancelRegistry>,
    store: Option<Arc<dyn SessionStore>>,
}

impl StreamDelivery {
    pub fn new(cancel: Arc<CancelRegistry>, store: Option<Arc<dyn SessionStore>>) -> Self {
        Self { cancel, store }
    }

    pub fn cancel_registry(&self) -> &Arc<CancelRegistry> {
        &self.cancel
    }

    /// 投递一轮回复，返回累计文本与结束状态；传输失败不会 panic，也不重试
    pub async fn deliver(
        &self,
        sink: &dyn FrameSink,
        target: &DeliveryTarget,
        answer: Answer,
        extras: DeliveryExtras,
        turn: Option<TurnRecord>,
    ) -> DeliveryOutcome {
        let mut text = String::new();
        let status = match self.run(sink, target, answer, &extras, &mut text).await {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(
                    connection_id = %target.connection_id,
                    error = %e,
                    "stream delivery aborted, connection gone"
                );
                DeliveryStatus::Failed(e.to_string())
            }
        };
        // 终止帧之后到达的 stop 不留给下一轮
        self.cancel.clear(&target.connection_id);
        tracing::debug!(
            connection_id = %target.connection_id,
            status = status.as_str(),
            chars = text.chars().count(),
            "stream delivery finished"
        );

        if let Some(turn) = turn {
            self.persist(target, turn, &text, &status).await;
        }
        DeliveryOutcome { text, status }
    }

    async fn run(
        &self,
        sink: &dyn FrameSink,
        target: &DeliveryTarget,
        answer: Answer,
        extras: &DeliveryExtras,
        text: &mut String,
    ) -> Result<DeliveryStatus, DeliveryError> {
        self.emit(sink, target, StreamMessage::Start).await?;
        for event in &extras.monitor {
            self.emit(sink, target, StreamMessage::Monitor { info: event.to_monitor_info() })
                .await?;
        }

        let mut stream = answer.into_stream();
        let token = self.cancel.token(&target.connection_id);
        let mut chunk_id = 0;
        loop {
            // 已取消优先；等待下一段期间到达的取消也立即生效，已取到的段不会被打断
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                item = stream.next() => Some(item),
            };
            let item = match next {
                None => {
                    let sent = self.emit(sink, target, StreamMessage::End).await;
                    self.cancel.clear(&target.connection_id);
                    sent?;
                    return Ok(DeliveryStatus::Cancelled);
                }
                Some(None) => break,
                Some(Some(item)) => item,
            };
            match item {
                Ok(piece) => {
                    if piece.is_empty() {
                        continue;
                    }
                    self.emit(
                        sink,
                        target,
                        StreamMessage::Chunk {
                            content: piece.clone(),
                            chunk_id,
                        },
                    )
                    .await?;
                    chunk_id += 1;
                    text.push_str(&piece);
                }
                Err(message) => {
                    self.emit(sink, target, StreamMessage::Error { message: message.clone() })
                        .await?;
                    return Ok(DeliveryStatus::Failed(message));
                }
            }
        }

        self.emit(
            sink,
            target,
            StreamMessage::Context {
                payload: context_payload(text, extras),
            },
        )
        .await?;
        self.emit(sink, target, StreamMessage::End).await?;
        Ok(DeliveryStatus::Completed)
    }

    async fn emit(&self, sink: &dyn FrameSink, target: &DeliveryTarget, message: StreamMessage) -> Result<(), DeliveryError> {
        sink.send(Frame::new(
            &target.message_id,
            target.custom_message_id.as_deref(),
            message,
        ))
        .await
    }

    async fn persist(&self, target: &DeliveryTarget, turn: TurnRecord, text: &str, status: &DeliveryStatus) {
        let Some(store) = &self.store else {
            return;
        };
        let mut metadata = match turn.metadata {
            Value::Object(map) => map,
            _ => Default::default(),
        };
        metadata.insert("message_id".to_string(), json!(target.message_id));
        metadata.insert("status".to_string(), json!(status.as_str()));
        if let DeliveryStatus::Failed(reason) = status {
            metadata.insert("error".to_string(), json!(reason));
        }
        if let Err(e) = store
            .append_turn(&turn.session_id, &turn.user_id, &turn.query, text, Value::Object(metadata))
            .await
        {
            tracing::warn!(session_id = %turn.session_id, error = %e, "failed to record turn");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemorySessionStore;
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<StreamMessage> {
        let mut out = Vec::new();
        while let Ok(f) = rx.try_recv() {
            out.push(f.message);
        }
        out
    }

    #[test]
    fn test_extract_media_dedups_by_path() {
        let text = "See ![chart](img/a.png) and ![again](img/a.png) plus ![](img/b.jpg).";
        let media = extract_media(text);
        assert_eq!(media.len(), 2);
        assert_eq!(media[0]["alt"], "chart");
        assert_eq!(media[1]["path"], "img/b.jpg");
    }

    #[tokio::test]
    async fn test_chunked_splits_by_chars() {
        let delivery = StreamDelivery::new(Arc::new(CancelRegistry::new()), None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let out = delivery
            .deliver(&tx, &DeliveryTarget::new("c", None), Answer::chunked("你好世界", 3), DeliveryExtras::default(), None)
            .await;
        assert_eq!(out.text, "你好世界");
        let chunks: Vec<String> = drain(&mut rx)
            .into_iter()
            .filter_map(|m| match m {
                StreamMessage::Chunk { content, .. } => Some(content),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, vec!["你好世", "界"]);
    }

    #[tokio::test]
    async fn test_static_answer_is_single_chunk() {
        let delivery = StreamDelivery::new(Arc::new(CancelRegistry::new()), None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let target = DeliveryTarget::new("c", None);
        let out = delivery
            .deliver(&tx, &target, Answer::Static("hi".into()), DeliveryExtras::default(), None)
            .await;
        assert_eq!(out.text, "hi");
        let kinds: Vec<&str> = drain(&mut rx).iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, vec!["START", "CHUNK", "CONTEXT", "END"]);
    }

    #[tokio::test]
    async fn test_stream_error_ends_with_error_frame_and_records_once() {
        let store = Arc::new(MemorySessionStore::new());
        let delivery = StreamDelivery::new(Arc::new(CancelRegistry::new()), Some(store.clone()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let target = DeliveryTarget::new("c", Some("client-1".into()));
        let items: Vec<Result<String, String>> = vec![Ok("par".into()), Err("llm exploded".into())];
        let answer = Answer::Stream(Box::pin(futures_util::stream::iter(items)));
        let turn = TurnRecord {
            session_id: "s".into(),
            user_id: "u".into(),
            query: "q".into(),
            metadata: Value::Null,
        };
        let out = delivery.deliver(&tx, &target, answer, DeliveryExtras::default(), Some(turn)).await;

        assert_eq!(out.text, "par");
        assert_eq!(out.status, DeliveryStatus::Failed("llm exploded".into()));
        let frames = drain(&mut rx);
        assert_eq!(
            frames.last(),
            Some(&StreamMessage::Error { message: "llm exploded".into() })
        );

        let msgs = store.get_messages("s").await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].content, "par");
        assert_eq!(msgs[1].metadata["status"], "failed");
    }

    #[tokio::test]
    async fn test_closed_connection_still_records_partial_text() {
        let store = Arc::new(MemorySessionStore::new());
        let delivery = StreamDelivery::new(Arc::new(CancelRegistry::new()), Some(store.clone()));
        let (tx, rx) = mpsc::unbounded_channel::<Frame>();
        drop(rx);
        let target = DeliveryTarget::new("c", None);
        let turn = TurnRecord {
            session_id: "s".into(),
            user_id: "u".into(),
            query: "q".into(),
            metadata: json!({"path": "agent"}),
        };
        let out = delivery
            .deliver(&tx, &target, Answer::from_chunks(vec!["a", "b"]), DeliveryExtras::default(), Some(turn))
            .await;
        assert!(matches!(out.status, DeliveryStatus::Failed(_)));
        let msgs = store.get_messages("s").await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].metadata["path"], "agent");
    }

    #[tokio::test]
    async fn test_monitor_frames_follow_start() {
        let delivery = StreamDelivery::new(Arc::new(CancelRegistry::new()), None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let extras = DeliveryExtras {
            monitor: vec![ReactEvent::Thinking],
            ..Default::default()
        };
        delivery
            .deliver(&tx, &DeliveryTarget::new("c", None), Answer::Static("x".into()), extras, None)
            .await;
        let kinds: Vec<&str> = drain(&mut rx).iter().map(|m| m.kind()).collect();
        assert_eq!(kinds, vec!["START", "MONITOR", "CHUNK", "CONTEXT", "END"]);
    }

    #[tokio::test]
    async fn test_stop_while_waiting_for_next_token() {
        let cancel = Arc::new(CancelRegistry::new());
        let delivery = StreamDelivery::new(cancel.clone(), None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let target = DeliveryTarget::new("slow", None);
        // 第一段之后上游不再产出
        let pieces = futures_util::stream::iter(vec![Ok("Hel".to_string())]).chain(futures_util::stream::pending());
        let answer = Answer::Stream(Box::pin(pieces));

        let stopper = {
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                cancel.cancel("slow");
            }
        };
        let (outcome, _) = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            async { tokio::join!(delivery.deliver(&tx, &target, answer, DeliveryExtras::default(), None), stopper) },
        )
        .await
        .unwrap();

        assert_eq!(outcome.status, DeliveryStatus::Cancelled);
        assert_eq!(outcome.text, "Hel");
        let kinds: Vec<&str> = drain(&mut rx).iter().map(StreamMessage::kind).collect();
        assert_eq!(kinds, vec!["START", "CHUNK", "END"]);
        assert!(!cancel.is_cancelled("slow"));
    }

    #[tokio::test]
    async fn test_flag_is_cleared_after_completed_delivery() {
        let cancel = Arc::new(CancelRegistry::new());
        let delivery = StreamDelivery::new(cancel.clone(), None);
        let (tx, _rx) = mpsc::unbounded_channel();
        let target = DeliveryTarget::new("late", None);

        // 投递在取消前已经取完所有段：模拟终止帧之后才到的 stop
        let sink = LateStopSink { cancel: cancel.clone(), inner: tx };
        let outcome = delivery
            .deliver(&sink, &target, Answer::Static("done".to_string()), DeliveryExtras::default(), None)
            .await;
        assert_eq!(outcome.status, DeliveryStatus::Completed);
        assert!(!cancel.is_cancelled("late"));
    }

    /// END 帧发出时触发取消
    struct LateStopSink {
        cancel: Arc<CancelRegistry>,
        inner: mpsc::UnboundedSender<Frame>,
    }

    #[async_trait::async_trait]
    impl FrameSink for LateStopSink {
        async fn send(&self, frame: Frame) -> Result<(), DeliveryError> {
            if frame.message == StreamMessage::End {
                self.cancel.cancel("late");
            }
            FrameSink::send(&self.inner, frame).await
        }
    }

    #[test]
    fn test_zero_chunk_chars_is_single_piece() {
        assert!(matches!(Answer::chunked("whole reply", 0), Answer::Static(t) if t == "whole reply"));
    }
}
