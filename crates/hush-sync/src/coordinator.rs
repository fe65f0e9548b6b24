//! The sync coordinator.
//!
//! One cycle runs at a time. Each step below commits on its own, so a
//! failure part-way keeps what earlier steps applied:
//!
//! 1. decide the [`SyncPlan`] (new session, ledger reset)
//! 2. fetch and merge feed deltas
//! 3. refresh group members and key generations
//! 4. fetch message deltas
//! 5. decrypt and ingest messages and reaction tallies
//! 6. make sure the personal feed exists

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use futures_util::future::join_all;
use hush_core::{
    Feed, FeedCipher, FeedId, FeedType, MessageId, MessageStatus, Snapshot, Store,
    TallyDecryptor,
};
use hush_ledger::{IdentityResolver, LedgerClient, MessageScope, TransactionSigner};
use rand::RngCore;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::debounce::DeferredQueue;
use crate::decrypt::{decrypt_batch, decrypt_tallies};
use crate::error::Result;
use crate::groups::GroupRefreshSummary;
use crate::kv::KvStore;
use crate::persist::{Persistence, SaveReport};
use crate::session::{Session, SyncPlan};

/// The local user.
#[derive(Clone)]
pub struct Identity {
    pub address: String,
    /// X25519 private key that unwraps feed and group keys
    pub private_key: Vec<u8>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// External collaborators the coordinator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub ledger: Arc<dyn LedgerClient>,
    pub signer: Arc<dyn TransactionSigner>,
    pub identities: Arc<dyn IdentityResolver>,
    pub cipher: Arc<dyn FeedCipher>,
    pub tallies: Arc<dyn TallyDecryptor>,
}

/// What one call to [`SyncCoordinator::run_sync_cycle`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Another cycle was running; nothing was done
    pub skipped: bool,
    pub plan: Option<SyncPlan>,
    pub feeds_merged: usize,
    pub feeds_added: usize,
    pub feeds_pruned: usize,
    pub groups: GroupRefreshSummary,
    pub messages_ingested: usize,
    pub decryption_failures: usize,
    pub tallies_updated: usize,
    pub personal_feed_requested: bool,
    pub save: SaveReport,
}

impl SyncReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// Clears the busy flag when a cycle ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl<'a> BusyGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard(flag))
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncCoordinator {
    pub(crate) identity: Identity,
    pub(crate) config: SyncConfig,
    pub(crate) store: Arc<Store>,
    pub(crate) persistence: Persistence,
    pub(crate) ledger: Arc<dyn LedgerClient>,
    pub(crate) signer: Arc<dyn TransactionSigner>,
    pub(crate) identities: Arc<dyn IdentityResolver>,
    pub(crate) cipher: Arc<dyn FeedCipher>,
    pub(crate) tallies: Arc<dyn TallyDecryptor>,
    session: Session,
    busy: AtomicBool,
    initial_fetch_done: AtomicBool,
    cleanup: Mutex<DeferredQueue<FeedId>>,
}

impl SyncCoordinator {
    /// Build a coordinator over `kv`, restoring whatever it persisted.
    pub fn new(
        identity: Identity,
        collaborators: Collaborators,
        kv: Arc<dyn KvStore>,
        config: SyncConfig,
    ) -> Result<Self> {
        let persistence = Persistence::new(kv, config.quota_retry_limit);
        let mut snapshot = persistence.load()?;
        snapshot.overlay = hush_core::Overlay::with_cap(config.overlay_cap);

        Ok(Self {
            identity,
            store: Arc::new(Store::new(snapshot)),
            persistence,
            ledger: collaborators.ledger,
            signer: collaborators.signer,
            identities: collaborators.identities,
            cipher: collaborators.cipher,
            tallies: collaborators.tallies,
            session: Session::new(),
            busy: AtomicBool::new(false),
            initial_fetch_done: AtomicBool::new(false),
            cleanup: Mutex::new(DeferredQueue::new(config.cleanup_debounce())),
            config,
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.store.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.store.subscribe()
    }

    pub fn address(&self) -> &str {
        &self.identity.address
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_syncing(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Run one sync cycle.
    ///
    /// Returns a skipped report if a cycle is already in flight. On failure
    /// the error is also published as the snapshot's `last_error`.
    pub async fn run_sync_cycle(&self) -> Result<SyncReport> {
        let Some(_busy) = BusyGuard::acquire(&self.busy) else {
            debug!("sync cycle already running, skipping");
            return Ok(SyncReport::skipped());
        };

        let mut report = SyncReport::default();
        match self.run_steps(&mut report).await {
            Ok(()) => {
                self.store.mutate(|snap| snap.last_error = None);
                if report.plan.is_some_and(|plan| plan.new_session || plan.reset) {
                    self.persistence.set_session_marker(self.session.token())?;
                }
                report.save = self.persistence.save(&self.store)?;
                info!(
                    feeds = report.feeds_merged + report.feeds_added,
                    messages = report.messages_ingested,
                    "sync cycle complete"
                );
                Ok(report)
            }
            Err(e) => {
                warn!(error = %e, "sync cycle failed");
                self.store.mutate(|snap| snap.last_error = Some(e.to_string()));
                if let Err(save_error) = self.persistence.save(&self.store) {
                    warn!(error = %save_error, "could not persist partial sync progress");
                }
                Err(e)
            }
        }
    }

    async fn run_steps(&self, report: &mut SyncReport) -> Result<()> {
        let height = self
            .with_retry("fetch_block_height", || self.ledger.fetch_block_height())
            .await?;
        let plan = self.plan_cycle(height)?;
        report.plan = Some(plan);

        self.sync_feeds(plan, report).await?;
        report.groups = self.refresh_groups().await;
        self.sync_messages(plan, report).await?;
        report.personal_feed_requested = self.ensure_personal_feed(height).await?;
        Ok(())
    }

    /// Step 1: decide the mode, wiping local state on a ledger reset.
    fn plan_cycle(&self, height: u64) -> Result<SyncPlan> {
        let marker = self.persistence.session_marker()?;
        let last_feed_block = self.store.snapshot().sync_metadata.last_feed_block_index;
        let plan = self.session.plan(marker.as_deref(), height, last_feed_block);

        if plan.reset {
            warn!(
                ledger_height = height,
                local_watermark = last_feed_block,
                "ledger is behind local state, wiping cache"
            );
            self.store.mutate(Snapshot::reset);
            self.persistence.clear()?;
            self.initial_fetch_done.store(false, Ordering::Release);
        } else if plan.new_session {
            info!("new session, revalidating cache with a full sync");
        }
        Ok(plan)
    }

    /// Step 2: merge feed deltas.
    async fn sync_feeds(&self, plan: SyncPlan, report: &mut SyncReport) -> Result<()> {
        let before = self.store.snapshot();
        let since = if plan.is_full() {
            0
        } else {
            before.sync_metadata.last_feed_block_index
        };
        let address = self.identity.address.as_str();
        let page = self
            .with_retry("fetch_feeds", || self.ledger.fetch_feeds(address, since))
            .await?;
        let server_feeds: Vec<Feed> = page.feeds.into_iter().map(|r| r.into_feed()).collect();
        let names = self.resolve_direct_names(&before, &server_feeds).await;

        let (merged, added, pruned) = self.store.mutate(|snap| {
            let mut merged = 0;
            let mut added = 0;
            for server in &server_feeds {
                match snap.feeds.get_mut(&server.id) {
                    Some(cached) => {
                        if cached.merge_from_server(server) {
                            debug!(feed_id = %server.id, "feed key rotated, cached key dropped");
                        }
                        merged += 1;
                    }
                    None => {
                        snap.feeds.insert(server.id.clone(), server.clone());
                        added += 1;
                    }
                }
                if let (Some(name), Some(feed)) = (names.get(&server.id), snap.feeds.get_mut(&server.id)) {
                    feed.name = name.clone();
                }
            }

            let pruned = if plan.is_full() {
                prune_missing_feeds(snap, &server_feeds)
            } else {
                0
            };

            for feed in snap.feeds.values_mut() {
                let cursor = snap
                    .cache_metadata
                    .get(&feed.id)
                    .map(|m| m.last_synced_message_block_index)
                    .unwrap_or(0);
                if feed.block_index > cursor {
                    feed.needs_sync = true;
                }
            }

            if let Some(join) = snap.sync_metadata.pending_group_join.clone() {
                if let Some(feed) = snap.feeds.get_mut(&join) {
                    info!(feed_id = %join, "group join confirmed");
                    feed.needs_sync = true;
                    snap.sync_metadata.pending_group_join = None;
                }
            }

            let meta = &mut snap.sync_metadata;
            meta.last_feed_block_index = meta.last_feed_block_index.max(page.max_block_index);
            (merged, added, pruned)
        });

        report.feeds_merged = merged;
        report.feeds_added = added;
        report.feeds_pruned = pruned;
        debug!(since, merged, added, pruned, "merged feed delta");
        Ok(())
    }

    /// New display names for direct feeds whose block index advanced.
    async fn resolve_direct_names(
        &self,
        before: &Snapshot,
        server_feeds: &[Feed],
    ) -> HashMap<FeedId, String> {
        let me = self.identity.address.as_str();
        let lookups = server_feeds
            .iter()
            .filter(|f| f.feed_type == FeedType::Direct)
            .filter(|f| {
                before
                    .feed(&f.id)
                    .is_some_and(|cached| f.block_index > cached.block_index)
            })
            .filter_map(|f| {
                let peer = f.participants.iter().find(|p| p.as_str() != me)?.clone();
                Some((f.id.clone(), peer))
            })
            .map(|(feed_id, peer)| async move {
                let name = self.identities.display_name(&peer).await;
                (feed_id, peer, name)
            });

        let mut names = HashMap::new();
        for (feed_id, peer, result) in join_all(lookups).await {
            match result {
                Ok(Some(name)) => {
                    names.insert(feed_id, name);
                }
                Ok(None) => {}
                Err(e) => debug!(feed_id = %feed_id, peer = %peer, error = %e, "name lookup failed, keeping old name"),
            }
        }
        names
    }

    /// Steps 4 and 5: fetch, decrypt and ingest messages.
    async fn sync_messages(&self, plan: SyncPlan, report: &mut SyncReport) -> Result<()> {
        let snapshot = self.store.snapshot();
        let catch_up = plan.is_full() || !self.initial_fetch_done.load(Ordering::Acquire);

        let (scope, since) = if catch_up {
            let since = if plan.is_full() {
                0
            } else {
                snapshot
                    .feeds
                    .keys()
                    .map(|id| {
                        snapshot
                            .cache_metadata
                            .get(id)
                            .map(|m| m.last_synced_message_block_index)
                            .unwrap_or(0)
                    })
                    .min()
                    .unwrap_or(0)
            };
            (MessageScope::All, since)
        } else {
            let Some(active) = snapshot.active_feed.clone() else {
                debug!("no active feed, skipping message fetch");
                return Ok(());
            };
            let since = snapshot
                .cache_metadata
                .get(&active)
                .map(|m| m.last_synced_message_block_index)
                .unwrap_or(0);
            (MessageScope::Feed(active), since)
        };
        let since_tally = if plan.is_full() {
            0
        } else {
            snapshot.sync_metadata.last_reaction_tally_version
        };

        let address = self.identity.address.as_str();
        let page = self
            .with_retry("fetch_messages", || {
                self.ledger.fetch_messages(address, since, since_tally, &scope)
            })
            .await?;

        let incoming = page
            .messages
            .into_iter()
            .filter(|r| scope.includes(&r.feed_id))
            .map(|r| r.into_message())
            .collect();
        let batch = decrypt_batch(&snapshot, &self.cipher, &self.identity.private_key, incoming).await;
        let tallies = decrypt_tallies(
            &snapshot,
            &batch,
            self.tallies.as_ref(),
            page.reaction_tallies
                .into_iter()
                .filter(|t| scope.includes(&t.feed_id))
                .collect(),
        );
        report.decryption_failures = batch.failed_count();
        report.tallies_updated = tallies.len();

        let me = self.identity.address.clone();
        let ingested = self.store.update(|snap| -> Result<usize> {
            batch.apply_keys(snap);
            let mut ingested = 0;
            for (feed_id, messages) in batch.messages {
                if !snap.feeds.contains_key(&feed_id) {
                    continue;
                }
                let newest = messages.iter().filter_map(|m| m.block_height).max();
                let report = snap.ingest_messages(&feed_id, messages, &me)?;
                ingested += report.added + report.updated;
                if let (Some(feed), Some(height)) = (snap.feeds.get_mut(&feed_id), newest) {
                    feed.advance_block_index(height);
                }
            }

            let fetched: Vec<FeedId> = match &scope {
                MessageScope::All => snap.feeds.keys().cloned().collect(),
                MessageScope::Feed(id) => vec![id.clone()],
            };
            for feed_id in fetched {
                let meta = snap.cache_metadata.entry(feed_id.clone()).or_default();
                meta.last_synced_message_block_index =
                    meta.last_synced_message_block_index.max(page.max_block_index);
                if let Some(feed) = snap.feeds.get_mut(&feed_id) {
                    feed.needs_sync = false;
                }
            }

            for tally in &tallies {
                snap.reaction_tallies.insert(tally.message_id.clone(), tally.clone());
            }
            let meta = &mut snap.sync_metadata;
            meta.last_reaction_tally_version = meta.last_reaction_tally_version.max(page.max_tally_version);
            Ok(ingested)
        })?;

        if catch_up {
            self.initial_fetch_done.store(true, Ordering::Release);
        }
        report.messages_ingested = ingested;
        debug!(
            scope = ?scope,
            since,
            ingested,
            failed = report.decryption_failures,
            "ingested message delta"
        );
        Ok(())
    }

    /// Retry `op` on transient ledger errors, up to `fetch_retry_limit` extra attempts.
    pub(crate) async fn with_retry<T, F, Fut>(&self, what: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = hush_ledger::Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.config.fetch_retry_limit => {
                    attempt += 1;
                    debug!(call = what, attempt, error = %e, "retrying transient ledger failure");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // --- Outgoing messages ---

    /// Insert an optimistic outgoing message and return its id.
    pub fn add_pending_message(&self, feed_id: &str, content: &str) -> Result<MessageId> {
        let mut id_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id_bytes);
        let message_id = hex::encode(id_bytes);

        let message = hush_core::Message::pending(
            message_id.clone(),
            feed_id,
            self.identity.address.clone(),
            content,
            Utc::now(),
        );
        let me = self.identity.address.as_str();
        self.store
            .update(|snap| snap.add_pending_message(message, me))?;
        debug!(feed_id = %feed_id, message_id = %message_id, "queued outgoing message");
        Ok(message_id)
    }

    pub fn mark_message_confirming(&self, feed_id: &str, message_id: &str) -> Result<()> {
        self.set_status(feed_id, message_id, MessageStatus::Confirming)
    }

    pub fn mark_message_failed(&self, feed_id: &str, message_id: &str) -> Result<()> {
        self.set_status(feed_id, message_id, MessageStatus::Failed)
    }

    /// Put a failed message back into the pending state.
    pub fn retry_failed_message(&self, feed_id: &str, message_id: &str) -> Result<()> {
        let current = self
            .snapshot()
            .find_message(feed_id, message_id)
            .map(|m| m.status())
            .ok_or_else(|| hush_core::Error::MessageNotFound(message_id.to_string()))?;
        if current != MessageStatus::Failed {
            return Err(hush_core::Error::InvalidTransition {
                from: current,
                to: MessageStatus::Pending,
            }
            .into());
        }
        self.set_status(feed_id, message_id, MessageStatus::Pending)
    }

    fn set_status(&self, feed_id: &str, message_id: &str, status: MessageStatus) -> Result<()> {
        self.store
            .update(|snap| snap.set_message_status(feed_id, message_id, status))?;
        Ok(())
    }

    // --- Read state ---

    pub fn mark_as_read(&self, feed_id: &str, up_to: Option<u64>) -> Result<bool> {
        let me = self.identity.address.as_str();
        Ok(self.store.update(|snap| snap.mark_as_read(feed_id, up_to, me))?)
    }

    pub fn sync_unread_counts(&self, counts: &HashMap<FeedId, u32>) {
        self.store.mutate(|snap| snap.sync_unread_counts(counts));
    }

    // --- Focus and cleanup ---

    /// Switch the focused feed.
    ///
    /// The feed being left is scheduled for cleanup; switching back before
    /// the debounce expires cancels it.
    pub fn set_active_feed(&self, feed_id: Option<FeedId>, now: Instant) {
        let previous = self.store.mutate(|snap| {
            let previous = snap.active_feed.take();
            snap.active_feed = feed_id.clone();
            previous
        });

        let mut queue = self.cleanup.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = previous.filter(|p| Some(p) != feed_id.as_ref()) {
            queue.schedule(previous, now);
        }
        if let Some(current) = &feed_id {
            queue.cancel(current);
        }
    }

    /// Run cleanups whose debounce has expired: trim read history and drop
    /// the scroll-back overlay. Returns the feeds cleaned.
    pub fn run_due_cleanup(&self, now: Instant) -> Vec<FeedId> {
        let due = {
            let mut queue = self.cleanup.lock().unwrap_or_else(|e| e.into_inner());
            queue.poll_due(now)
        };
        if due.is_empty() {
            return due;
        }

        let limit = self.config.message_trim_limit;
        self.store.mutate(|snap| {
            let mut cleaned = Vec::new();
            for feed_id in due {
                if snap.active_feed.as_ref() == Some(&feed_id) {
                    continue;
                }
                let removed = snap.trim_messages_to_limit(&feed_id, limit);
                snap.remove_reaction_tallies(&removed);
                snap.overlay.clear_feed(&feed_id);
                debug!(feed_id = %feed_id, trimmed = removed.len(), "feed cleanup ran");
                cleaned.push(feed_id);
            }
            cleaned
        })
    }

    pub fn next_cleanup_deadline(&self) -> Option<Instant> {
        self.cleanup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .next_deadline()
    }

    /// Record that the user asked to join a group; cleared once the feed appears.
    pub fn set_pending_group_join(&self, feed_id: FeedId) {
        self.store
            .mutate(|snap| snap.sync_metadata.pending_group_join = Some(feed_id));
    }

    /// Persist the current snapshot.
    pub fn save(&self) -> Result<SaveReport> {
        self.persistence.save(&self.store)
    }

    /// Drop all cached and persisted state.
    pub fn logout(&self) -> Result<()> {
        self.store.mutate(Snapshot::reset);
        self.persistence.clear()?;
        self.initial_fetch_done.store(false, Ordering::Release);
        let mut queue = self.cleanup.lock().unwrap_or_else(|e| e.into_inner());
        *queue = DeferredQueue::new(self.config.cleanup_debounce());
        info!("logged out, local state cleared");
        Ok(())
    }
}

/// Remove local feeds absent from a full server listing, keeping group
/// feeds that still hold messages.
fn prune_missing_feeds(snap: &mut Snapshot, server_feeds: &[Feed]) -> usize {
    let present: BTreeSet<&str> = server_feeds.iter().map(|f| f.id.as_str()).collect();
    let doomed: Vec<FeedId> = snap
        .feeds
        .values()
        .filter(|f| !present.contains(f.id.as_str()))
        .filter(|f| !(f.feed_type == FeedType::Group && !snap.messages(&f.id).is_empty()))
        .map(|f| f.id.clone())
        .collect();
    for feed_id in &doomed {
        info!(feed_id = %feed_id, "pruning feed missing from ledger");
        snap.remove_feed(feed_id);
    }
    doomed.len()
}
