//! Session and ledger-reset detection.
//!
//! Each process picks a random session token. If the persisted marker does
//! not match it, the cache was written by an earlier process and is
//! revalidated with a full resync. A ledger shorter than our recorded feed
//! watermark means the chain was wiped: the cache is dropped and rebuilt.

use rand::RngCore;

/// How a cycle fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Everything from block 0
    Full,
    /// Deltas since the stored watermarks
    Incremental,
}

/// The mode decision for one cycle, made once up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPlan {
    pub mode: SyncMode,
    /// Wipe local state before fetching
    pub reset: bool,
    pub new_session: bool,
}

impl SyncPlan {
    pub fn is_full(&self) -> bool {
        self.mode == SyncMode::Full
    }
}

/// Per-process session token.
#[derive(Debug, Clone)]
pub struct Session {
    token: String,
}

impl Session {
    pub fn new() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self {
            token: hex::encode(bytes),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Decide the cycle's mode.
    pub fn plan(
        &self,
        stored_marker: Option<&str>,
        ledger_height: u64,
        last_feed_block_index: u64,
    ) -> SyncPlan {
        let reset = ledger_height < last_feed_block_index;
        let new_session = stored_marker != Some(self.token.as_str());
        let mode = if reset || new_session {
            SyncMode::Full
        } else {
            SyncMode::Incremental
        };
        SyncPlan {
            mode,
            reset,
            new_session,
        }
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique_hex() {
        let a = Session::new();
        let b = Session::new();
        assert_ne!(a.token(), b.token());
        assert_eq!(a.token().len(), 32);
        assert!(hex::decode(a.token()).is_ok());
    }

    #[test]
    fn foreign_marker_forces_full_sync() {
        let session = Session::new();
        let plan = session.plan(Some("someone-else"), 100, 50);
        assert_eq!(plan.mode, SyncMode::Full);
        assert!(plan.new_session);
        assert!(!plan.reset);

        assert!(session.plan(None, 100, 50).is_full());
    }

    #[test]
    fn matching_marker_is_incremental() {
        let session = Session::new();
        let plan = session.plan(Some(session.token()), 100, 100);
        assert_eq!(
            plan,
            SyncPlan {
                mode: SyncMode::Incremental,
                reset: false,
                new_session: false
            }
        );
    }

    #[test]
    fn shorter_ledger_is_a_reset() {
        let session = Session::new();
        let plan = session.plan(Some(session.token()), 10, 500);
        assert!(plan.reset);
        assert!(plan.is_full());
    }
}
