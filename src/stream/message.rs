//! 流式帧：START / CHUNK / CONTEXT / END / ERROR / MONITOR
//!
//! 每帧是带 `message_type` 判别字段的 JSON 对象，`message_id` / `custom_message_id` 关联请求与响应。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::core::DeliveryError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamMessage {
    Start,
    Chunk { content: String, chunk_id: usize },
    Context { payload: Value },
    End,
    Error { message: String },
    Monitor { info: Value },
}

impl StreamMessage {
    /// END 与 ERROR 是终止帧
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamMessage::End | StreamMessage::Error { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamMessage::Start => "START",
            StreamMessage::Chunk { .. } => "CHUNK",
            StreamMessage::Context { .. } => "CONTEXT",
            StreamMessage::End => "END",
            StreamMessage::Error { .. } => "ERROR",
            StreamMessage::Monitor { .. } => "MONITOR",
        }
    }
}

/// 线上的一帧
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub message_id: String,
    #[serde(default)]
    pub custom_message_id: Option<String>,
    #[serde(flatten)]
    pub message: StreamMessage,
    pub timestamp: String,
}

impl Frame {
    pub fn new(message_id: &str, custom_message_id: Option<&str>, message: StreamMessage) -> Self {
        Self {
            message_id: message_id.to_string(),
            custom_message_id: custom_message_id.map(str::to_string),
            message,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn to_json(&self) -> Result<String, DeliveryError> {
        serde_json::to_string(self).map_err(|e| DeliveryError::Encode(e.to_string()))
    }
}

/// 一条连接的发送端；发送失败即连接已断开
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&self, frame: Frame) -> Result<(), DeliveryError>;
}

#[async_trait]
impl FrameSink for mpsc::UnboundedSender<Frame> {
    async fn send(&self, frame: Frame) -> Result<(), DeliveryError> {
        mpsc::UnboundedSender::send(self, frame)
            .map_err(|_| DeliveryError::ConnectionClosed("frame receiver dropped".to_string()))
    }
}

#[async_trait]
impl FrameSink for mpsc::Sender<Frame> {
    async fn send(&self, frame: Frame) -> Result<(), DeliveryError> {
        mpsc::Sender::send(self, frame)
            .await
            .map_err(|_| DeliveryError::ConnectionClosed("frame receiver dropped".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_frame_wire_format() {
        let frame = Frame::new(
            "m1",
            Some("c1"),
            StreamMessage::Chunk {
                content: "Hel".to_string(),
                chunk_id: 0,
            },
        );
        let v: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(v["message_type"], "CHUNK");
        assert_eq!(v["content"], "Hel");
        assert_eq!(v["chunk_id"], 0);
        assert_eq!(v["message_id"], "m1");
        assert_eq!(v["custom_message_id"], "c1");
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(StreamMessage::End.is_terminal());
        assert!(StreamMessage::Error { message: "x".into() }.is_terminal());
        assert!(!StreamMessage::Start.is_terminal());
        assert_eq!(StreamMessage::Monitor { info: Value::Null }.kind(), "MONITOR");
    }
}
