//! Cached messages, their delivery state machine and reaction tallies.
//!
//! Outgoing messages move pending, confirming, confirmed. Confirmation by
//! the ledger arrives through [`Message::absorb_delivery`].

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::feed::FeedId;

/// Message identifier, globally unique by construction
pub type MessageId = String;

/// Delivery state of a message.
///
/// `Pending -> Confirming -> Confirmed`, or `Pending | Confirming -> Failed`.
/// `Confirmed` is terminal; `Failed` may be retried back to `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Confirming,
    Confirmed,
    Failed,
}

impl MessageStatus {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Pending, Confirming)
                | (Confirming, Confirmed)
                | (Pending, Failed)
                | (Confirming, Failed)
                | (Failed, Pending)
        )
    }
}

/// A cached message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub feed_id: FeedId,
    pub sender_id: String,

    /// Plaintext, once decrypted
    #[serde(default)]
    pub content: Option<String>,

    /// Base64 ciphertext, retained so the message can be re-decrypted
    #[serde(default)]
    pub content_encrypted: Option<String>,

    /// Absent while the message is optimistically pending
    #[serde(default)]
    pub block_height: Option<u64>,

    pub timestamp: DateTime<Utc>,

    status: MessageStatus,

    /// Derived from the feed's read watermark
    #[serde(default)]
    pub is_read: bool,

    /// Group feeds only: which key generation encrypted this message
    #[serde(default)]
    pub key_generation: Option<u32>,

    #[serde(default)]
    pub decryption_failed: bool,

    /// Addresses mentioned by this message
    #[serde(default)]
    pub mentions: Vec<String>,

    #[serde(default)]
    pub reply_to: Option<MessageId>,
}

impl Message {
    /// A message as delivered by the ledger, already confirmed at `block_height`.
    pub fn confirmed(
        id: impl Into<String>,
        feed_id: impl Into<String>,
        sender_id: impl Into<String>,
        block_height: u64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            feed_id: feed_id.into(),
            sender_id: sender_id.into(),
            content: None,
            content_encrypted: None,
            block_height: Some(block_height),
            timestamp,
            status: MessageStatus::Confirmed,
            is_read: false,
            key_generation: None,
            decryption_failed: false,
            mentions: Vec::new(),
            reply_to: None,
        }
    }

    /// An optimistic outgoing message with no block height yet.
    pub fn pending(
        id: impl Into<String>,
        feed_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            feed_id: feed_id.into(),
            sender_id: sender_id.into(),
            content: Some(content.into()),
            content_encrypted: None,
            block_height: None,
            timestamp,
            status: MessageStatus::Pending,
            is_read: false,
            key_generation: None,
            decryption_failed: false,
            mentions: Vec::new(),
            reply_to: None,
        }
    }

    pub fn status(&self) -> MessageStatus {
        self.status
    }

    /// True exactly when the status is `Confirmed`.
    pub fn is_confirmed(&self) -> bool {
        self.status == MessageStatus::Confirmed
    }

    /// Apply a status transition, rejecting illegal ones.
    pub fn transition_to(&mut self, next: MessageStatus) -> Result<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Whether this message is read under the given watermark.
    ///
    /// Messages without a block height are never read.
    pub fn is_read_at(&self, watermark: u64) -> bool {
        matches!(self.block_height, Some(height) if height <= watermark)
    }

    /// Decode the retained base64 ciphertext.
    pub fn ciphertext(&self) -> Result<Vec<u8>> {
        let encoded = self
            .content_encrypted
            .as_deref()
            .ok_or_else(|| Error::Decryption(format!("message {} has no ciphertext", self.id)))?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }

    /// Store decrypted bytes as content. Non-UTF-8 plaintext counts as a failure.
    pub fn set_plaintext(&mut self, plaintext: Vec<u8>) -> bool {
        match String::from_utf8(plaintext) {
            Ok(text) => {
                self.content = Some(text);
                self.decryption_failed = false;
                true
            }
            Err(_) => {
                self.decryption_failed = true;
                false
            }
        }
    }

    /// Fold a ledger-delivered copy of this message into the cached one.
    ///
    /// The ledger copy carries the confirmation (block height, status);
    /// plaintext we already have survives if the incoming copy has none.
    pub fn absorb_delivery(&mut self, delivered: Message) {
        let keep_content = delivered.content.is_none() && !self.decryption_failed;
        let content = if keep_content {
            self.content.take()
        } else {
            delivered.content
        };
        let key_generation = delivered.key_generation.or(self.key_generation);

        self.sender_id = delivered.sender_id;
        self.content = content;
        if delivered.content_encrypted.is_some() {
            self.content_encrypted = delivered.content_encrypted;
        }
        if delivered.block_height.is_some() {
            self.block_height = delivered.block_height;
        }
        self.timestamp = delivered.timestamp;
        self.key_generation = key_generation;
        self.decryption_failed = delivered.decryption_failed && self.content.is_none();
        if !delivered.mentions.is_empty() {
            self.mentions = delivered.mentions;
        }
        if delivered.reply_to.is_some() {
            self.reply_to = delivered.reply_to;
        }
        if delivered.status == MessageStatus::Confirmed {
            self.status = MessageStatus::Confirmed;
        }
    }
}

/// Decrypted reaction counts for one message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactionTally {
    pub message_id: MessageId,
    pub feed_id: FeedId,
    pub tally_version: u64,
    /// One count per emoji slot
    pub counts: Vec<u32>,
}
