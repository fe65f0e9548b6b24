//! Error types for hush-sync

use thiserror::Error;

use crate::kv::KvError;

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Errors that abort a sync step or an engine operation
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Core(#[from] hush_core::Error),

    #[error(transparent)]
    Ledger(#[from] hush_ledger::Error),

    #[error("storage error: {0}")]
    Storage(#[from] KvError),

    #[error("config error: {0}")]
    Config(String),

    #[error("history unavailable for {feed_id}: {reason}")]
    History { feed_id: String, reason: String },
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Core(hush_core::Error::from(e))
    }
}
