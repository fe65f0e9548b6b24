//! Message cache: ingest, read-flag derivation and the two bounding paths
//! (per-feed trim and global quota sweep).
//!
//! Neither bounding path ever removes an unread message, nor one that failed
//! to decrypt: those wait for a key merge to recover them.

use std::cmp::Reverse;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::message::{Message, MessageId, MessageStatus};
use crate::store::Snapshot;

/// Fraction of read messages evicted per quota sweep
const QUOTA_SWEEP_FRACTION: f64 = 0.2;

/// Counts from one ingest
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub added: usize,
    pub updated: usize,
    pub unread_count: u32,
}

impl Snapshot {
    /// Merge messages into a feed's cache.
    ///
    /// Existing ids absorb the delivered copy (confirming pending messages in
    /// place). Read flags and the unread count are recomputed from scratch,
    /// so re-delivering the same batch is a no-op.
    pub fn ingest_messages(
        &mut self,
        feed_id: &str,
        incoming: Vec<Message>,
        me: &str,
    ) -> Result<IngestReport> {
        if !self.feeds.contains_key(feed_id) {
            return Err(Error::FeedNotFound(feed_id.to_string()));
        }

        let mut report = IngestReport::default();
        let mut newly_added = Vec::new();
        let messages = self.messages.entry(feed_id.to_string()).or_default();
        for message in incoming {
            match messages.iter_mut().find(|m| m.id == message.id) {
                Some(existing) => {
                    existing.absorb_delivery(message);
                    report.updated += 1;
                }
                None => {
                    newly_added.push(message.id.clone());
                    messages.push(message);
                    report.added += 1;
                }
            }
        }
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

        let newest_height = messages.iter().filter_map(|m| m.block_height).max();
        let meta = self.cache_metadata.entry(feed_id.to_string()).or_default();
        if let Some(height) = newest_height {
            meta.last_synced_message_block_index = meta.last_synced_message_block_index.max(height);
        }
        self.refresh_oldest_cached(feed_id);

        self.refresh_read_flags(feed_id);
        for id in &newly_added {
            self.note_mention(feed_id, id, me);
        }
        report.unread_count = self.recompute_unread(feed_id, me)?;

        debug!(
            feed_id = %feed_id,
            added = report.added,
            updated = report.updated,
            unread = report.unread_count,
            "ingested messages"
        );
        Ok(report)
    }

    /// Insert an optimistic outgoing message.
    pub fn add_pending_message(&mut self, message: Message, me: &str) -> Result<()> {
        let feed_id = message.feed_id.clone();
        if !self.feeds.contains_key(&feed_id) {
            return Err(Error::FeedNotFound(feed_id));
        }
        let messages = self.messages.entry(feed_id.clone()).or_default();
        if messages.iter().any(|m| m.id == message.id) {
            return Ok(());
        }
        messages.push(message);
        self.recompute_unread(&feed_id, me)?;
        Ok(())
    }

    /// Move a cached message through its delivery state machine.
    pub fn set_message_status(
        &mut self,
        feed_id: &str,
        message_id: &str,
        status: MessageStatus,
    ) -> Result<()> {
        let message = self
            .messages
            .get_mut(feed_id)
            .and_then(|msgs| msgs.iter_mut().find(|m| m.id == message_id))
            .ok_or_else(|| Error::MessageNotFound(message_id.to_string()))?;
        message.transition_to(status)
    }

    /// Whether any message of the feed is still awaiting confirmation.
    pub fn has_unconfirmed_outgoing(&self, feed_id: &str) -> bool {
        self.messages(feed_id).iter().any(|m| !m.is_confirmed())
    }

    /// Recompute `is_read` for every cached message of a feed.
    pub fn refresh_read_flags(&mut self, feed_id: &str) {
        let watermark = self
            .feeds
            .get(feed_id)
            .map(|f| f.last_read_block_index)
            .unwrap_or(0);
        if let Some(messages) = self.messages.get_mut(feed_id) {
            for message in messages.iter_mut() {
                message.is_read = message.is_read_at(watermark);
            }
        }
    }

    /// Keep at most `limit` evictable messages in a feed, dropping the oldest.
    ///
    /// Unread and undecryptable messages are never touched. Returns the ids
    /// removed.
    pub fn trim_messages_to_limit(&mut self, feed_id: &str, limit: usize) -> Vec<MessageId> {
        let Some(messages) = self.messages.get_mut(feed_id) else {
            return Vec::new();
        };

        let mut read: Vec<&Message> = messages.iter().filter(|m| is_evictable(m)).collect();
        if read.len() <= limit {
            return Vec::new();
        }
        read.sort_by_key(|m| Reverse((m.timestamp, m.id.clone())));
        let removed: Vec<MessageId> = read[limit..].iter().map(|m| m.id.clone()).collect();

        messages.retain(|m| !removed.contains(&m.id));
        self.cache_metadata
            .entry(feed_id.to_string())
            .or_default()
            .has_older_messages = true;
        self.refresh_oldest_cached(feed_id);

        debug!(feed_id = %feed_id, removed = removed.len(), limit, "trimmed feed cache");
        removed
    }

    /// Evict the globally oldest 20% of evictable messages (at least one).
    ///
    /// Returns the evicted ids; empty when nothing is evictable.
    pub fn handle_storage_quota_exceeded(&mut self) -> Vec<MessageId> {
        let mut read: Vec<(&Message, &String)> = self
            .messages
            .iter()
            .flat_map(|(feed_id, msgs)| msgs.iter().filter(|m| is_evictable(m)).map(move |m| (m, feed_id)))
            .collect();
        if read.is_empty() {
            return Vec::new();
        }
        read.sort_by(|(a, _), (b, _)| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

        let count = evict_count(read.len());
        let victims: Vec<(String, MessageId)> = read[..count]
            .iter()
            .map(|(m, feed_id)| ((*feed_id).clone(), m.id.clone()))
            .collect();

        let mut evicted = Vec::with_capacity(victims.len());
        for (feed_id, message_id) in victims {
            if let Some(messages) = self.messages.get_mut(&feed_id) {
                messages.retain(|m| m.id != message_id);
            }
            self.cache_metadata
                .entry(feed_id.clone())
                .or_default()
                .has_older_messages = true;
            self.refresh_oldest_cached(&feed_id);
            evicted.push(message_id);
        }
        self.remove_reaction_tallies(&evicted);

        info!(evicted = evicted.len(), evictable_left = evictable_len(self), "quota sweep evicted read messages");
        evicted
    }

    fn refresh_oldest_cached(&mut self, feed_id: &str) {
        let oldest = self.messages(feed_id).iter().filter_map(|m| m.block_height).min();
        let meta = self.cache_metadata.entry(feed_id.to_string()).or_default();
        meta.oldest_cached_block_index = oldest;
    }
}

fn evict_count(read_total: usize) -> usize {
    let share = (read_total as f64 * QUOTA_SWEEP_FRACTION).ceil() as usize;
    share.clamp(1, read_total)
}

fn is_evictable(message: &Message) -> bool {
    message.is_read && !message.decryption_failed
}

fn evictable_len(snapshot: &Snapshot) -> usize {
    snapshot
        .messages
        .values()
        .flat_map(|msgs| msgs.iter())
        .filter(|m| is_evictable(m))
        .count()
}
