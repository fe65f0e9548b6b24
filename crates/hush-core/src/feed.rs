//! Feeds (conversations) and the per-feed / process-wide sync bookkeeping

use serde::{Deserialize, Serialize};

/// Opaque feed identifier assigned by the ledger
pub type FeedId = String;

/// The kind of conversation a feed represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedType {
    /// The user's own notes-to-self feed, always pinned first
    Personal,
    /// One-to-one conversation keyed by a wrapped feed key
    Direct,
    /// Multi-member conversation keyed by rotating key generations
    Group,
    /// Public one-to-many feed, content is not encrypted
    Broadcast,
}

impl FeedType {
    /// Whether messages in this feed are decrypted with the feed's own AES key
    pub fn uses_feed_key(self) -> bool {
        matches!(self, FeedType::Personal | FeedType::Direct)
    }
}

/// A cached feed.
///
/// `block_index` and `last_read_block_index` only ever move forward;
/// use [`Feed::advance_block_index`] and the reconciler rather than
/// assigning them directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feed {
    pub id: FeedId,
    pub feed_type: FeedType,
    pub name: String,
    pub participants: Vec<String>,

    /// Highest ledger block reflected in this feed
    pub block_index: u64,

    /// Read watermark (max-wins)
    #[serde(default)]
    pub last_read_block_index: u64,

    /// Derived from messages and the watermark, cached for the UI
    #[serde(default)]
    pub unread_count: u32,

    /// Feed key wrapped for the current user (direct/personal only)
    #[serde(default)]
    pub encrypted_feed_key: Option<String>,

    /// Plaintext feed key, derived client-side from `encrypted_feed_key`
    #[serde(default)]
    pub aes_key: Option<Vec<u8>>,

    /// Set when the ledger reports activity beyond our message cursor
    #[serde(default)]
    pub needs_sync: bool,

    /// Block in which the feed was created, when the ledger reports it
    #[serde(default)]
    pub created_at_block: Option<u64>,
}

impl Feed {
    pub fn new(id: impl Into<String>, feed_type: FeedType, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            feed_type,
            name: name.into(),
            participants: Vec::new(),
            block_index: 0,
            last_read_block_index: 0,
            unread_count: 0,
            encrypted_feed_key: None,
            aes_key: None,
            needs_sync: false,
            created_at_block: None,
        }
    }

    /// Move `block_index` forward. Lower values are ignored.
    ///
    /// Returns true if the index changed.
    pub fn advance_block_index(&mut self, block_index: u64) -> bool {
        if block_index > self.block_index {
            self.block_index = block_index;
            true
        } else {
            false
        }
    }

    /// Merge a server-side record of this feed into the cached copy.
    ///
    /// Server fields win except `unread_count` (client-authoritative) and
    /// `aes_key`, which survives unless the wrapped key itself changed.
    /// Returns true if the wrapped key rotated.
    pub fn merge_from_server(&mut self, server: &Feed) -> bool {
        let key_rotated = self.encrypted_feed_key != server.encrypted_feed_key;

        self.feed_type = server.feed_type;
        self.name = server.name.clone();
        self.participants = server.participants.clone();
        self.advance_block_index(server.block_index);
        self.encrypted_feed_key = server.encrypted_feed_key.clone();
        if server.created_at_block.is_some() {
            self.created_at_block = server.created_at_block;
        }

        if key_rotated {
            self.aes_key = None;
        }
        key_rotated
    }
}

/// Pagination and sync cursor for a single feed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedCacheMetadata {
    /// Whether older history may exist on the ledger beyond what is cached
    pub has_older_messages: bool,
    /// Lowest block height among cached messages after the last trim/page
    pub oldest_cached_block_index: Option<u64>,
    /// Message fetch cursor for this feed
    pub last_synced_message_block_index: u64,
}

/// Process-wide sync bookkeeping, persisted across restarts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub last_feed_block_index: u64,
    pub last_reaction_tally_version: u64,
    #[serde(default)]
    pub personal_feed_pending: bool,
    /// Ledger height when personal feed creation was submitted
    #[serde(default)]
    pub personal_feed_pending_block: Option<u64>,
    #[serde(default)]
    pub pending_group_join: Option<FeedId>,
}

/// Role of a group member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupRole {
    Admin,
    Member,
}

/// A member of a group feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    pub address: String,
    pub display_name: Option<String>,
    pub role: GroupRole,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_index_never_moves_backwards() {
        let mut feed = Feed::new("f1", FeedType::Direct, "alice");
        assert!(feed.advance_block_index(50));
        assert!(!feed.advance_block_index(20));
        assert_eq!(feed.block_index, 50);
    }

    #[test]
    fn merge_preserves_client_fields() {
        let mut cached = Feed::new("f1", FeedType::Direct, "alice");
        cached.unread_count = 4;
        cached.encrypted_feed_key = Some("wrapped-a".to_string());
        cached.aes_key = Some(vec![7; 32]);
        cached.block_index = 90;

        let mut server = Feed::new("f1", FeedType::Direct, "alice (new)");
        server.encrypted_feed_key = Some("wrapped-a".to_string());
        server.block_index = 80;

        let rotated = cached.merge_from_server(&server);

        assert!(!rotated);
        assert_eq!(cached.unread_count, 4);
        assert_eq!(cached.aes_key, Some(vec![7; 32]));
        assert_eq!(cached.name, "alice (new)");
        assert_eq!(cached.block_index, 90);
    }

    #[test]
    fn merge_invalidates_key_on_rotation() {
        let mut cached = Feed::new("f1", FeedType::Direct, "alice");
        cached.encrypted_feed_key = Some("wrapped-a".to_string());
        cached.aes_key = Some(vec![7; 32]);

        let mut server = cached.clone();
        server.encrypted_feed_key = Some("wrapped-b".to_string());

        assert!(cached.merge_from_server(&server));
        assert_eq!(cached.aes_key, None);
        assert_eq!(cached.encrypted_feed_key.as_deref(), Some("wrapped-b"));
    }
}
