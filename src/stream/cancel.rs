//! 协作式取消：按连接 ID 登记的取消信号
//!
//! 投递方只在块与块之间轮询；取消后由投递方清除，下一轮从干净状态开始。

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct CancelRegistry {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取得（必要时创建）连接的取消令牌
    pub fn token(&self, connection_id: &str) -> CancellationToken {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens.entry(connection_id.to_string()).or_default().clone()
    }

    pub fn cancel(&self, connection_id: &str) {
        self.token(connection_id).cancel();
        tracing::info!(connection_id, "stream cancellation requested");
    }

    pub fn is_cancelled(&self, connection_id: &str) -> bool {
        let tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens.get(connection_id).is_some_and(|t| t.is_cancelled())
    }

    pub fn clear(&self, connection_id: &str) {
        let mut tokens = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        tokens.remove(connection_id);
    }
}
