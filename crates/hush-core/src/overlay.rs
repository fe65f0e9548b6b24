//! In-memory layer for history loaded by scrolling back.
//!
//! Overlay pages are never persisted and never merged into the message
//! cache. Each feed's layer is capped; the oldest entries go first, so a page
//! that overflows the cap can lose some of its own messages.

use std::collections::{BTreeMap, HashSet};

use crate::feed::FeedId;
use crate::message::Message;
use crate::store::Snapshot;

pub const DEFAULT_OVERLAY_CAP: usize = 500;

/// How a page fared against the overlay cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageAdmission {
    /// New messages the layer still holds
    pub added: usize,
    /// New messages evicted by the cap straight away
    pub dropped: usize,
}

#[derive(Debug, Clone)]
pub struct Overlay {
    cap: usize,
    layers: BTreeMap<FeedId, Vec<Message>>,
}

impl Default for Overlay {
    fn default() -> Self {
        Self::with_cap(DEFAULT_OVERLAY_CAP)
    }
}

impl Overlay {
    pub fn with_cap(cap: usize) -> Self {
        Self {
            cap,
            layers: BTreeMap::new(),
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn messages(&self, feed_id: &str) -> &[Message] {
        self.layers.get(feed_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self, feed_id: &str) -> usize {
        self.messages(feed_id).len()
    }

    /// Add a page of older messages.
    pub fn extend(&mut self, feed_id: &str, page: Vec<Message>) -> PageAdmission {
        let layer = self.layers.entry(feed_id.to_string()).or_default();
        let known: HashSet<String> = layer.iter().map(|m| m.id.clone()).collect();
        let incoming: HashSet<String> = page
            .iter()
            .filter(|m| !known.contains(&m.id))
            .map(|m| m.id.clone())
            .collect();
        layer.extend(page.into_iter().filter(|m| incoming.contains(&m.id)));

        layer.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        if layer.len() > self.cap {
            let excess = layer.len() - self.cap;
            layer.drain(..excess);
        }
        let added = layer.iter().filter(|m| incoming.contains(&m.id)).count();
        PageAdmission {
            added,
            dropped: incoming.len() - added,
        }
    }

    pub fn clear_feed(&mut self, feed_id: &str) {
        self.layers.remove(feed_id);
    }

    pub fn clear(&mut self) {
        self.layers.clear();
    }
}

impl Snapshot {
    /// What the UI shows for a feed: cache and overlay merged, deduplicated
    /// by id (the cached copy wins) and sorted by timestamp.
    pub fn visible_messages(&self, feed_id: &str) -> Vec<Message> {
        let cached = self.messages(feed_id);
        let cached_ids: HashSet<&str> = cached.iter().map(|m| m.id.as_str()).collect();

        let mut merged: Vec<Message> = self
            .overlay
            .messages(feed_id)
            .iter()
            .filter(|m| !cached_ids.contains(m.id.as_str()))
            .cloned()
            .chain(cached.iter().cloned())
            .collect();
        merged.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        merged
    }

    /// Lowest block height across cache and overlay for a feed.
    pub fn oldest_loaded_block(&self, feed_id: &str) -> Option<u64> {
        self.messages(feed_id)
            .iter()
            .chain(self.overlay.messages(feed_id))
            .filter_map(|m| m.block_height)
            .min()
    }
}
