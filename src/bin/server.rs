//! Bee RAG WebSocket 服务（feature `server`）
//!
//! `/ws`：每条入站 `{"query","session_id","user_id","custom_message_id"}` 开始一轮，
//! 帧按顺序写回同一连接；`{"type":"stop"}` 设置该连接的取消标志。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use bee_rag::stream::{CancelRegistry, Frame, StreamMessage};
use bee_rag::{build_chat_service, load_config, observability, ChatRequest, ChatService};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct ServerState {
    service: Arc<ChatService>,
}

/// 入站消息：控制指令或一轮对话
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Inbound {
    Control {
        #[serde(rename = "type")]
        kind: String,
    },
    Chat(ChatRequest),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("BEE_RAG_CONFIG").ok())
        .map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    let service = build_chat_service(&cfg, Arc::new(CancelRegistry::new()))
        .await
        .context("Failed to build chat service")?;

    let state = Arc::new(ServerState {
        service: Arc::new(service),
    });
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&cfg.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", cfg.server.bind))?;
    tracing::info!("Bee RAG server listening on ws://{}/ws", cfg.server.bind);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<ServerState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn error_frame(message: String) -> Frame {
    Frame::new(&uuid::Uuid::new_v4().to_string(), None, StreamMessage::Error { message })
}

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    let connection_id = format!("ws_{}", uuid::Uuid::new_v4());
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Frame>();
    tracing::info!(connection_id = %connection_id, "websocket connected");

    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            let text = match frame.to_json() {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to encode frame");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut current: Option<JoinHandle<()>> = None;
    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(connection_id = %connection_id, error = %e, "websocket receive error");
                break;
            }
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        match serde_json::from_str::<Inbound>(&text) {
            Ok(Inbound::Control { kind }) if kind == "stop" => {
                // 没有进行中的一轮时忽略，避免取消下一轮
                if current.as_ref().is_some_and(|h| !h.is_finished()) {
                    state.service.cancel_registry().cancel(&connection_id);
                } else {
                    tracing::debug!(connection_id = %connection_id, "stop ignored, no turn in progress");
                }
            }
            Ok(Inbound::Control { kind }) => {
                let _ = frame_tx.send(error_frame(format!("unknown control message: {}", kind)));
            }
            Ok(Inbound::Chat(request)) => {
                if current.as_ref().is_some_and(|h| !h.is_finished()) {
                    let _ = frame_tx.send(error_frame("a turn is already in progress".to_string()));
                    continue;
                }
                let service = state.service.clone();
                let tx = frame_tx.clone();
                let cid = connection_id.clone();
                current = Some(tokio::spawn(async move {
                    service.handle(&cid, request, &tx).await;
                }));
            }
            Err(e) => {
                let _ = frame_tx.send(error_frame(format!("invalid message: {}", e)));
            }
        }
    }

    // 连接关闭后进行中的一轮照常结束并记录，发送失败由投递层处理
    if let Some(handle) = current {
        let _ = handle.await;
    }
    state.service.cancel_registry().clear(&connection_id);
    drop(frame_tx);
    let _ = writer.await;
    tracing::info!(connection_id = %connection_id, "websocket closed");
}
