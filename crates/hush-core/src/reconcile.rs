//! Read watermarks and unread counts.
//!
//! The watermark (`last_read_block_index`) is max-wins: a lower or equal
//! value from another device, or a duplicate event, never moves it back.
//! Unread counts are always recomputed from the cached messages rather than
//! incremented.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{Error, Result};
use crate::feed::FeedId;
use crate::store::Snapshot;

impl Snapshot {
    /// Mark a feed read up to `up_to`.
    ///
    /// `None` is the legacy path and zeroes the unread count outright.
    /// Returns true if anything changed.
    pub fn mark_as_read(&mut self, feed_id: &str, up_to: Option<u64>, me: &str) -> Result<bool> {
        let feed = self
            .feeds
            .get_mut(feed_id)
            .ok_or_else(|| Error::FeedNotFound(feed_id.to_string()))?;

        let Some(watermark) = up_to else {
            let changed = feed.unread_count != 0;
            feed.unread_count = 0;
            self.clear_mentions(feed_id);
            return Ok(changed);
        };

        if watermark <= feed.last_read_block_index {
            return Ok(false);
        }
        feed.last_read_block_index = watermark;

        self.refresh_read_flags(feed_id);
        let unread = self.recompute_unread(feed_id, me)?;
        debug!(feed_id = %feed_id, watermark, unread, "advanced read watermark");
        Ok(true)
    }

    /// Recount unread messages from scratch.
    ///
    /// A message is unread if it has no block height or sits above the
    /// watermark. The user's own messages never count. Reaching zero clears
    /// the feed's mention markers.
    pub fn recompute_unread(&mut self, feed_id: &str, me: &str) -> Result<u32> {
        let watermark = self
            .feeds
            .get(feed_id)
            .map(|f| f.last_read_block_index)
            .ok_or_else(|| Error::FeedNotFound(feed_id.to_string()))?;

        let unread = self
            .messages(feed_id)
            .iter()
            .filter(|m| m.sender_id != me)
            .filter(|m| m.block_height.map_or(true, |h| h > watermark))
            .count();
        let unread = u32::try_from(unread).unwrap_or(u32::MAX);

        if let Some(feed) = self.feeds.get_mut(feed_id) {
            feed.unread_count = unread;
        }
        if unread == 0 {
            self.clear_mentions(feed_id);
        }
        Ok(unread)
    }

    /// Overwrite unread counts with server-reported values.
    ///
    /// Feeds not in the cache are ignored.
    pub fn sync_unread_counts(&mut self, counts: &HashMap<FeedId, u32>) {
        for (feed_id, count) in counts {
            if let Some(feed) = self.feeds.get_mut(feed_id) {
                feed.unread_count = *count;
                if *count == 0 {
                    self.pending_mentions.remove(feed_id);
                }
            }
        }
    }

    /// Record a mention marker if the message is unread and names `me`.
    pub fn note_mention(&mut self, feed_id: &str, message_id: &str, me: &str) {
        let mentions_me = self
            .find_message(feed_id, message_id)
            .is_some_and(|m| !m.is_read && m.sender_id != me && m.mentions.iter().any(|a| a == me));
        if mentions_me {
            self.pending_mentions
                .entry(feed_id.to_string())
                .or_default()
                .insert(message_id.to_string());
        }
    }

    pub fn has_pending_mentions(&self, feed_id: &str) -> bool {
        self.pending_mentions
            .get(feed_id)
            .is_some_and(|ids| !ids.is_empty())
    }

    pub fn clear_mentions(&mut self, feed_id: &str) {
        self.pending_mentions.remove(feed_id);
    }
}
