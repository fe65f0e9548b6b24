//! Snapshot store shared by the sync engine and the UI.
//!
//! All tables live in one [`Snapshot`]. Every mutation goes through
//! [`Store::update`], which applies a closure to a private copy and then
//! publishes the result as a new `Arc<Snapshot>`. Readers hold whatever
//! `Arc` they last observed and never see a half-applied change.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::feed::{Feed, FeedCacheMetadata, FeedId, GroupMember, SyncMetadata};
use crate::keys::GroupKeyState;
use crate::message::{Message, MessageId, ReactionTally};
use crate::overlay::Overlay;

/// One consistent view of all cached state.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub feeds: BTreeMap<FeedId, Feed>,
    pub messages: BTreeMap<FeedId, Vec<Message>>,
    pub key_states: BTreeMap<FeedId, GroupKeyState>,
    pub cache_metadata: BTreeMap<FeedId, FeedCacheMetadata>,
    pub sync_metadata: SyncMetadata,
    pub group_members: BTreeMap<FeedId, Vec<GroupMember>>,
    pub reaction_tallies: BTreeMap<MessageId, ReactionTally>,
    /// Unread mentions of the user, per feed
    pub pending_mentions: BTreeMap<FeedId, BTreeSet<MessageId>>,

    // Memory-only; never persisted.
    pub overlay: Overlay,
    pub loading_history: BTreeSet<FeedId>,
    pub history_errors: BTreeMap<FeedId, String>,
    pub last_error: Option<String>,
    pub active_feed: Option<FeedId>,
}

impl Snapshot {
    pub fn feed(&self, feed_id: &str) -> Option<&Feed> {
        self.feeds.get(feed_id)
    }

    /// Cached (persisted) messages of a feed, empty if none.
    pub fn messages(&self, feed_id: &str) -> &[Message] {
        self.messages.get(feed_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn find_message(&self, feed_id: &str, message_id: &str) -> Option<&Message> {
        self.messages(feed_id).iter().find(|m| m.id == message_id)
    }

    pub fn personal_feed(&self) -> Option<&Feed> {
        self.feeds
            .values()
            .find(|f| f.feed_type == crate::FeedType::Personal)
    }

    /// Drop a feed and everything keyed by it.
    pub fn remove_feed(&mut self, feed_id: &str) {
        self.feeds.remove(feed_id);
        if let Some(messages) = self.messages.remove(feed_id) {
            for message in messages {
                self.reaction_tallies.remove(&message.id);
            }
        }
        self.key_states.remove(feed_id);
        self.cache_metadata.remove(feed_id);
        self.group_members.remove(feed_id);
        self.pending_mentions.remove(feed_id);
        self.overlay.clear_feed(feed_id);
        self.loading_history.remove(feed_id);
        self.history_errors.remove(feed_id);
        if self.active_feed.as_deref() == Some(feed_id) {
            self.active_feed = None;
        }
    }

    /// Remove tallies belonging to the given messages.
    pub fn remove_reaction_tallies(&mut self, message_ids: &[MessageId]) {
        for id in message_ids {
            self.reaction_tallies.remove(id);
        }
    }

    /// Wipe cached data and metadata, keeping the overlay cap.
    pub fn reset(&mut self) {
        let cap = self.overlay.cap();
        *self = Snapshot {
            overlay: Overlay::with_cap(cap),
            ..Snapshot::default()
        };
    }
}

/// Single-writer, many-reader holder of the current [`Snapshot`].
pub struct Store {
    tx: watch::Sender<Arc<Snapshot>>,
    writer: Mutex<()>,
}

impl Store {
    pub fn new(snapshot: Snapshot) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(snapshot));
        Self {
            tx,
            writer: Mutex::new(()),
        }
    }

    /// The most recently published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.tx.borrow().clone()
    }

    /// Receiver notified on every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.tx.subscribe()
    }

    /// Apply `f` to a copy of the current snapshot and publish it on success.
    ///
    /// If `f` returns an error nothing is published, so a failed step never
    /// leaves a partial write behind.
    pub fn update<T, E>(&self, f: impl FnOnce(&mut Snapshot) -> Result<T, E>) -> Result<T, E> {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = Snapshot::clone(&self.tx.borrow());
        let out = f(&mut next)?;
        self.tx.send_replace(Arc::new(next));
        Ok(out)
    }

    /// Infallible variant of [`Store::update`].
    pub fn mutate<T>(&self, f: impl FnOnce(&mut Snapshot) -> T) -> T {
        let _guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = Snapshot::clone(&self.tx.borrow());
        let out = f(&mut next);
        self.tx.send_replace(Arc::new(next));
        out
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new(Snapshot::default())
    }
}
