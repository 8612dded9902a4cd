//! 会话存储：每轮追加 (query, answer)，为下一轮提供历史

pub mod memory;
pub mod sqlite;
pub mod store;

use std::sync::Arc;

pub use memory::MemorySessionStore;
pub use sqlite::SqliteSessionStore;
pub use store::{history_messages, MessageRecord, SessionRecord, SessionStore};

use crate::config::SessionSection;
use crate::core::StoreError;

/// 配置了 db_path 时用 SQLite，否则用进程内存储
pub fn create_session_store(section: &SessionSection) -> Result<Arc<dyn SessionStore>, StoreError> {
    match &section.db_path {
        Some(path) => {
            tracing::info!(path = %path.display(), "using sqlite session store");
            Ok(Arc::new(SqliteSessionStore::open(path)?))
        }
        None => Ok(Arc::new(MemorySessionStore::new())),
    }
}
