//! Engine configuration.
//!
//! Every field has a default; a JSON file only needs to name what it
//! overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Read messages kept per feed when switching away from it
    pub message_trim_limit: usize,
    /// Eviction sweeps attempted before a rejected write is dropped
    pub quota_retry_limit: u32,
    /// Per-feed cap of the scroll-back overlay
    pub overlay_cap: usize,
    /// Blocks to wait for personal feed creation before retrying
    pub personal_feed_timeout_blocks: u64,
    pub history_page_size: usize,
    /// Silent retries of a history page before the feed shows an error
    pub history_retry_limit: u32,
    /// Skip history loads this close to the feed's creation block
    pub near_genesis_blocks: u64,
    pub cleanup_debounce_ms: u64,
    /// Extra attempts for transient ledger failures within a cycle
    pub fetch_retry_limit: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            message_trim_limit: 100,
            quota_retry_limit: 3,
            overlay_cap: hush_core::DEFAULT_OVERLAY_CAP,
            personal_feed_timeout_blocks: 5,
            history_page_size: 50,
            history_retry_limit: 3,
            near_genesis_blocks: 10,
            cleanup_debounce_ms: 150,
            fetch_retry_limit: 2,
        }
    }
}

impl SyncConfig {
    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read(path)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
        serde_json::from_slice(&data)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))
    }

    pub fn cleanup_debounce(&self) -> Duration {
        Duration::from_millis(self.cleanup_debounce_ms)
    }
}
