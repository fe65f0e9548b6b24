//! Snapshot persistence over a [`KvStore`].
//!
//! Each table is stored as its own JSON blob. A write rejected for quota
//! triggers an eviction sweep of read messages, then the write is retried;
//! after `quota_retry_limit` sweeps the write is dropped with a warning.

use std::sync::Arc;

use hush_core::{Snapshot, Store};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::kv::{KvError, KvStore};

pub const FEEDS: &str = "feeds";
pub const MESSAGES: &str = "messages";
pub const SYNC_METADATA: &str = "sync_metadata";
pub const GROUP_MEMBERS: &str = "group_members";
pub const KEY_STATES: &str = "key_states";
pub const CACHE_METADATA: &str = "cache_metadata";
pub const REACTION_TALLIES: &str = "reaction_tallies";
pub const MENTIONS: &str = "mentions";
pub const SESSION_MARKER: &str = "session_marker";

const TABLES: [&str; 8] = [
    MESSAGES,
    FEEDS,
    SYNC_METADATA,
    GROUP_MEMBERS,
    KEY_STATES,
    CACHE_METADATA,
    REACTION_TALLIES,
    MENTIONS,
];

/// Outcome of a save
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
    pub evicted: usize,
    /// Tables whose write was given up after exhausting retries
    pub dropped: Vec<&'static str>,
}

pub struct Persistence {
    kv: Arc<dyn KvStore>,
    quota_retry_limit: u32,
}

impl Persistence {
    pub fn new(kv: Arc<dyn KvStore>, quota_retry_limit: u32) -> Self {
        Self {
            kv,
            quota_retry_limit,
        }
    }

    /// Rebuild the persisted part of a snapshot.
    ///
    /// Missing tables start empty. A table that fails to parse is discarded
    /// with a warning; the next full sync repopulates it.
    pub fn load(&self) -> Result<Snapshot> {
        let mut snapshot = Snapshot::default();
        snapshot.feeds = self.load_table(FEEDS)?;
        snapshot.messages = self.load_table(MESSAGES)?;
        snapshot.sync_metadata = self.load_table(SYNC_METADATA)?;
        snapshot.group_members = self.load_table(GROUP_MEMBERS)?;
        snapshot.key_states = self.load_table(KEY_STATES)?;
        snapshot.cache_metadata = self.load_table(CACHE_METADATA)?;
        snapshot.reaction_tallies = self.load_table(REACTION_TALLIES)?;
        snapshot.pending_mentions = self.load_table(MENTIONS)?;
        debug!(
            feeds = snapshot.feeds.len(),
            messages = snapshot.messages.values().map(Vec::len).sum::<usize>(),
            "loaded persisted snapshot"
        );
        Ok(snapshot)
    }

    /// Persist every table of the current snapshot.
    pub fn save(&self, store: &Store) -> Result<SaveReport> {
        let mut report = SaveReport::default();
        for table in TABLES {
            self.save_table(store, table, &mut report)?;
        }
        Ok(report)
    }

    /// Remove every persisted table, including the session marker.
    pub fn clear(&self) -> Result<()> {
        for table in TABLES.iter().chain([&SESSION_MARKER]) {
            self.kv.remove(table)?;
        }
        info!("cleared persisted tables");
        Ok(())
    }

    pub fn session_marker(&self) -> Result<Option<String>> {
        Ok(self
            .kv
            .get(SESSION_MARKER)?
            .and_then(|bytes| String::from_utf8(bytes).ok()))
    }

    pub fn set_session_marker(&self, token: &str) -> Result<()> {
        self.kv.set(SESSION_MARKER, token.as_bytes())?;
        Ok(())
    }

    fn load_table<T: DeserializeOwned + Default>(&self, table: &str) -> Result<T> {
        let Some(bytes) = self.kv.get(table)? else {
            return Ok(T::default());
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(table, error = %e, "discarding unreadable table");
                Ok(T::default())
            }
        }
    }

    fn save_table(&self, store: &Store, table: &'static str, report: &mut SaveReport) -> Result<()> {
        let mut sweeps = 0;
        loop {
            let bytes = encode_table(&store.snapshot(), table)?;
            match self.kv.set(table, &bytes) {
                Ok(()) => return Ok(()),
                Err(KvError::QuotaExceeded) if sweeps < self.quota_retry_limit => {
                    sweeps += 1;
                    let evicted = store.mutate(|snap| snap.handle_storage_quota_exceeded());
                    if evicted.is_empty() {
                        warn!(table, "storage quota exceeded with nothing left to evict");
                        report.dropped.push(table);
                        return Ok(());
                    }
                    report.evicted += evicted.len();
                    debug!(table, sweep = sweeps, evicted = evicted.len(), "retrying write after eviction");
                    if table != MESSAGES {
                        // Shrink the stored message table so the retry has room
                        self.rewrite_messages(store);
                    }
                }
                Err(KvError::QuotaExceeded) => {
                    warn!(table, sweeps, "storage quota still exceeded, dropping write");
                    report.dropped.push(table);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn rewrite_messages(&self, store: &Store) {
        let snapshot = store.snapshot();
        let result = encode_table(&snapshot, MESSAGES)
            .map_err(|e| e.to_string())
            .and_then(|bytes| self.kv.set(MESSAGES, &bytes).map_err(|e| e.to_string()));
        if let Err(error) = result {
            debug!(%error, "message table rewrite during eviction failed");
        }
    }
}

fn encode_table(snapshot: &Snapshot, table: &str) -> Result<Vec<u8>> {
    let bytes = match table {
        FEEDS => encode(&snapshot.feeds)?,
        MESSAGES => encode(&snapshot.messages)?,
        SYNC_METADATA => encode(&snapshot.sync_metadata)?,
        GROUP_MEMBERS => encode(&snapshot.group_members)?,
        KEY_STATES => encode(&snapshot.key_states)?,
        CACHE_METADATA => encode(&snapshot.cache_metadata)?,
        REACTION_TALLIES => encode(&snapshot.reaction_tallies)?,
        MENTIONS => encode(&snapshot.pending_mentions)?,
        other => {
            return Err(hush_core::Error::Serialization(format!("unknown table {other}")).into())
        }
    };
    Ok(bytes)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{FileKvStore, MemoryKvStore};
    use chrono::{TimeZone, Utc};
    use hush_core::{Feed, FeedType, GroupKeyGeneration, Message};

    fn populated_store(read_messages: u64) -> Store {
        let mut snap = Snapshot::default();
        snap.feeds
            .insert("f1".into(), Feed::new("f1", FeedType::Direct, "bob"));
        let batch = (1..=read_messages)
            .map(|i| {
                let mut m = Message::confirmed(format!("m{i}"), "f1", "bob", i, Utc.timestamp_opt(i as i64, 0).unwrap());
                m.content = Some("x".repeat(200));
                m
            })
            .collect();
        snap.ingest_messages("f1", batch, "me").unwrap();
        snap.mark_as_read("f1", Some(read_messages), "me").unwrap();
        snap.merge_key_generations("f1", vec![GroupKeyGeneration::new(0, vec![1; 32], 0)], &[]);
        snap.sync_metadata.last_feed_block_index = 77;
        snap.overlay.extend("f1", vec![Message::confirmed("old", "f1", "bob", 0, Utc.timestamp_opt(0, 0).unwrap())]);
        Store::new(snap)
    }

    #[test]
    fn save_then_load_restores_tables_but_not_overlay() {
        let dir = tempfile::tempdir().unwrap();
        let kv = Arc::new(FileKvStore::open(dir.path()).unwrap());
        let persistence = Persistence::new(kv, 3);
        let store = populated_store(3);

        let report = persistence.save(&store).unwrap();
        assert_eq!(report, SaveReport::default());

        let loaded = persistence.load().unwrap();
        let original = store.snapshot();
        assert_eq!(loaded.feeds, original.feeds);
        assert_eq!(loaded.messages, original.messages);
        assert_eq!(loaded.key_states, original.key_states);
        assert_eq!(loaded.sync_metadata.last_feed_block_index, 77);
        assert_eq!(loaded.overlay.len("f1"), 0);
    }

    #[test]
    fn quota_pressure_evicts_and_retries() {
        let store = populated_store(20);
        let full_size = encode_table(&store.snapshot(), MESSAGES).unwrap().len();
        let kv = Arc::new(MemoryKvStore::with_quota(full_size / 2 + 2048));
        let persistence = Persistence::new(kv.clone(), 3);

        let report = persistence.save(&store).unwrap();

        assert!(report.evicted > 0);
        assert!(report.dropped.is_empty());
        assert!(kv.contains(MESSAGES));
        assert!(store.snapshot().messages("f1").len() < 20);
    }

    #[test]
    fn hopeless_quota_drops_writes_without_failing() {
        let store = populated_store(5);
        let kv = Arc::new(MemoryKvStore::with_quota(16));
        let persistence = Persistence::new(kv, 2);

        let report = persistence.save(&store).unwrap();
        assert!(report.dropped.contains(&MESSAGES));
    }

    #[test]
    fn corrupt_table_loads_empty() {
        let kv = Arc::new(MemoryKvStore::new());
        kv.set(FEEDS, b"{broken").unwrap();
        let persistence = Persistence::new(kv, 3);
        assert!(persistence.load().unwrap().feeds.is_empty());
    }

    #[test]
    fn clear_removes_marker() {
        let kv = Arc::new(MemoryKvStore::new());
        let persistence = Persistence::new(kv.clone(), 3);
        persistence.set_session_marker("abc").unwrap();
        persistence.save(&populated_store(1)).unwrap();

        persistence.clear().unwrap();
        assert_eq!(persistence.session_marker().unwrap(), None);
        assert!(!kv.contains(FEEDS));
    }
}
