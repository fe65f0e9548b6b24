//! Ledger record types for Hush

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use hush_core::{Feed, FeedId, FeedType, GroupMember, GroupRole, Message};
use serde::{Deserialize, Serialize};

/// Feed as reported by the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedRecord {
    pub feed_id: FeedId,
    pub feed_type: FeedType,
    pub name: String,
    #[serde(default)]
    pub participants: Vec<String>,
    pub block_index: u64,
    /// Feed key wrapped for the requesting address (base64)
    #[serde(default)]
    pub encrypted_feed_key: Option<String>,
    #[serde(default)]
    pub created_at_block: Option<u64>,
}

impl FeedRecord {
    pub fn into_feed(self) -> Feed {
        let mut feed = Feed::new(self.feed_id, self.feed_type, self.name);
        feed.participants = self.participants;
        feed.block_index = self.block_index;
        feed.encrypted_feed_key = self.encrypted_feed_key;
        feed.created_at_block = self.created_at_block;
        feed
    }
}

/// Feed delta since a block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedsPage {
    pub feeds: Vec<FeedRecord>,
    pub max_block_index: u64,
}

/// Message as stored on the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub message_id: String,
    pub feed_id: FeedId,
    pub sender_address: String,

    /// Encrypted payload, absent for broadcast feeds
    #[serde(default, with = "base64_opt")]
    pub ciphertext: Option<Vec<u8>>,

    /// Cleartext payload of broadcast feeds
    #[serde(default)]
    pub plaintext: Option<String>,

    pub block_height: u64,
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub key_generation: Option<u32>,
    #[serde(default)]
    pub mentions: Vec<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

impl MessageRecord {
    /// Convert to a confirmed, not yet decrypted cache message.
    pub fn into_message(self) -> Message {
        let mut message = Message::confirmed(
            self.message_id,
            self.feed_id,
            self.sender_address,
            self.block_height,
            self.timestamp,
        );
        message.content_encrypted = self.ciphertext.map(|bytes| STANDARD.encode(bytes));
        message.content = self.plaintext;
        message.key_generation = self.key_generation;
        message.mentions = self.mentions;
        message.reply_to = self.reply_to;
        message
    }
}

/// Homomorphically encrypted reaction counts for one message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionTallyRecord {
    pub message_id: String,
    pub feed_id: FeedId,
    pub tally_version: u64,
    #[serde(with = "base64_bytes")]
    pub c1: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub c2: Vec<u8>,
}

/// Message delta since a block, plus reaction tallies since a version
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesPage {
    pub messages: Vec<MessageRecord>,
    pub max_block_index: u64,
    #[serde(default)]
    pub reaction_tallies: Vec<ReactionTallyRecord>,
    #[serde(default)]
    pub max_tally_version: u64,
}

/// One page of history older than a block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OlderMessagesPage {
    pub messages: Vec<MessageRecord>,
    pub has_more: bool,
}

/// A group key generation, wrapped for the requesting address
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyGenerationRecord {
    pub key_generation: u32,
    #[serde(with = "base64_bytes")]
    pub encrypted_key: Vec<u8>,
    pub valid_from_block: u64,
    #[serde(default)]
    pub valid_to_block: Option<u64>,
}

/// Key generations of a group feed visible to the requester
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyGenerationsPage {
    pub generations: Vec<KeyGenerationRecord>,
    /// Generations the requester was never given (late join, ban window)
    #[serde(default)]
    pub missing_generations: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMemberRecord {
    pub address: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
}

impl From<GroupMemberRecord> for GroupMember {
    fn from(record: GroupMemberRecord) -> Self {
        GroupMember {
            address: record.address,
            display_name: record.display_name,
            role: if record.is_admin {
                GroupRole::Admin
            } else {
                GroupRole::Member
            },
        }
    }
}

/// Which feeds a message fetch covers.
///
/// A ledger may ignore the scope and return everything; callers filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "scope", content = "feedId")]
pub enum MessageScope {
    All,
    Feed(FeedId),
}

impl MessageScope {
    pub fn includes(&self, feed_id: &str) -> bool {
        match self {
            MessageScope::All => true,
            MessageScope::Feed(id) => id == feed_id,
        }
    }
}

/// An opaque signed transaction ready for submission
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedTransaction {
    pub kind: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResult {
    pub successful: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// Helper module for base64 encoding/decoding of byte vectors
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Same as `base64_bytes`, for optional fields
mod base64_opt {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer)?
            .map(|s| STANDARD.decode(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
