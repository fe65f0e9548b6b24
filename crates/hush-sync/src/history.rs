//! Scroll-back paging of older messages into the overlay.
//!
//! Older pages never touch the persisted cache. They land in the snapshot's
//! memory-only overlay and are dropped when the user leaves the feed.

use hush_core::{FeedId, Store};
use tracing::{debug, info, warn};

use crate::coordinator::SyncCoordinator;
use crate::decrypt::decrypt_batch;
use crate::error::{Result, SyncError};

/// What a call to [`SyncCoordinator::load_older_messages`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryOutcome {
    /// A page was added to the overlay
    Loaded { added: usize, has_more: bool },
    /// Another load for this feed is in flight
    AlreadyLoading,
    /// The feed is known to have nothing older
    NoMoreHistory,
    /// The oldest loaded message is next to the feed's creation block
    NearGenesis,
    /// The ledger returned nothing usable; the feed is marked exhausted
    ReachedBeginning,
    /// The overlay is full and could not hold the whole page; paging stops
    Capped { added: usize },
}

/// Clears the feed's loading flag when the load ends.
struct LoadingGuard<'a> {
    store: &'a Store,
    feed_id: FeedId,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        let feed_id = &self.feed_id;
        self.store.mutate(|snap| {
            snap.loading_history.remove(feed_id);
        });
    }
}

impl SyncCoordinator {
    /// Fetch the page of messages just below the oldest one loaded for a feed.
    pub async fn load_older_messages(&self, feed_id: &str) -> Result<HistoryOutcome> {
        let Some(_loading) = self.begin_history_load(feed_id)? else {
            return Ok(HistoryOutcome::AlreadyLoading);
        };

        let snapshot = self.store.snapshot();
        let has_older = snapshot
            .cache_metadata
            .get(feed_id)
            .is_some_and(|m| m.has_older_messages);
        if !has_older {
            return Ok(HistoryOutcome::NoMoreHistory);
        }

        let Some(oldest) = oldest_block(&snapshot, feed_id) else {
            self.mark_exhausted(feed_id);
            return Ok(HistoryOutcome::ReachedBeginning);
        };
        let created = snapshot.feed(feed_id).and_then(|f| f.created_at_block);
        if let Some(created) = created {
            if oldest <= created.saturating_add(self.config.near_genesis_blocks) {
                debug!(feed_id = %feed_id, oldest, created, "history is near genesis");
                self.mark_exhausted(feed_id);
                return Ok(HistoryOutcome::NearGenesis);
            }
        }

        let page_size = self.config.history_page_size;
        let address = self.identity.address.as_str();
        let mut attempt = 0;
        let page = loop {
            match self
                .ledger
                .fetch_older_messages(address, feed_id, oldest, page_size)
                .await
            {
                Ok(page) => break page,
                Err(e) if e.is_malformed() => {
                    info!(feed_id = %feed_id, error = %e, "unreadable history page, treating as beginning");
                    self.mark_exhausted(feed_id);
                    return Ok(HistoryOutcome::ReachedBeginning);
                }
                Err(e) if attempt < self.config.history_retry_limit => {
                    attempt += 1;
                    debug!(feed_id = %feed_id, attempt, error = %e, "retrying history page");
                }
                Err(e) => {
                    warn!(feed_id = %feed_id, attempts = attempt + 1, error = %e, "history load failed");
                    let reason = e.to_string();
                    self.store.mutate(|snap| {
                        snap.history_errors.insert(feed_id.to_string(), reason.clone());
                    });
                    return Err(SyncError::History {
                        feed_id: feed_id.to_string(),
                        reason,
                    });
                }
            }
        };

        let older: Vec<_> = page
            .messages
            .into_iter()
            .filter(|r| r.feed_id == feed_id && r.block_height < oldest)
            .map(|r| r.into_message())
            .collect();
        if older.is_empty() {
            self.mark_exhausted(feed_id);
            return Ok(HistoryOutcome::ReachedBeginning);
        }
        let has_more = page.has_more && older.len() >= page_size;

        let batch = decrypt_batch(&snapshot, &self.cipher, &self.identity.private_key, older).await;
        let admission = self.store.mutate(|snap| {
            batch.apply_keys(snap);
            let watermark = snap.feed(feed_id).map(|f| f.last_read_block_index).unwrap_or(0);
            let mut page: Vec<_> = batch.messages.into_values().flatten().collect();
            for message in &mut page {
                message.is_read = message.is_read_at(watermark);
            }
            let admission = snap.overlay.extend(feed_id, page);
            snap.cache_metadata
                .entry(feed_id.to_string())
                .or_default()
                .has_older_messages = has_more && admission.dropped == 0;
            admission
        });

        let added = admission.added;
        if admission.dropped > 0 {
            info!(feed_id = %feed_id, added, dropped = admission.dropped, "overlay full, stopping scroll-back");
            return Ok(HistoryOutcome::Capped { added });
        }
        debug!(feed_id = %feed_id, added, has_more, "loaded older messages");
        Ok(HistoryOutcome::Loaded { added, has_more })
    }

    /// Whether the last history load for a feed failed for good.
    pub fn history_error(&self, feed_id: &str) -> Option<String> {
        self.store.snapshot().history_errors.get(feed_id).cloned()
    }

    /// Claim the feed's loading flag. `None` means a load is already running.
    fn begin_history_load(&self, feed_id: &str) -> Result<Option<LoadingGuard<'_>>> {
        let claimed = self.store.update(|snap| {
            if !snap.feeds.contains_key(feed_id) {
                return Err(hush_core::Error::FeedNotFound(feed_id.to_string()));
            }
            if !snap.loading_history.insert(feed_id.to_string()) {
                return Ok(false);
            }
            snap.history_errors.remove(feed_id);
            Ok(true)
        })?;
        Ok(claimed.then(|| LoadingGuard {
            store: &self.store,
            feed_id: feed_id.to_string(),
        }))
    }

    fn mark_exhausted(&self, feed_id: &str) {
        self.store.mutate(|snap| {
            snap.cache_metadata
                .entry(feed_id.to_string())
                .or_default()
                .has_older_messages = false;
        });
    }
}

/// The block to page below: the oldest known across the cache, the overlay
/// and the trim marker.
fn oldest_block(snapshot: &hush_core::Snapshot, feed_id: &str) -> Option<u64> {
    let trimmed = snapshot
        .cache_metadata
        .get(feed_id)
        .and_then(|m| m.oldest_cached_block_index);
    match (snapshot.oldest_loaded_block(feed_id), trimmed) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
