use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{TimeZone, Utc};
use hush_core::{Feed, FeedType, Message, Snapshot, Store};
use hush_sync::{DeferredQueue, MemoryKvStore, Persistence};
use proptest::prelude::*;

const ME: &str = "addr-me";

fn populated(heights: &[(u64, bool)], watermark: u64) -> Snapshot {
    let mut snap = Snapshot::default();
    for feed in ["f1", "f2"] {
        snap.feeds.insert(feed.into(), Feed::new(feed, FeedType::Direct, feed));
    }
    for (i, (height, second_feed)) in heights.iter().enumerate() {
        let feed = if *second_feed { "f2" } else { "f1" };
        let mut message = Message::confirmed(
            format!("m{i}"),
            feed,
            "addr-peer",
            *height,
            Utc.timestamp_opt(*height as i64, 0).unwrap(),
        );
        message.content = Some("y".repeat(64));
        snap.ingest_messages(feed, vec![message], ME).unwrap();
    }
    snap.mark_as_read("f1", Some(watermark), ME).unwrap();
    snap.mark_as_read("f2", Some(watermark), ME).unwrap();
    snap
}

fn unread_ids(snap: &Snapshot) -> Vec<String> {
    let mut ids: Vec<String> = snap
        .messages
        .values()
        .flatten()
        .filter(|m| !m.is_read)
        .map(|m| m.id.clone())
        .collect();
    ids.sort();
    ids
}

proptest! {
    #[test]
    fn reload_preserves_read_state(
        heights in proptest::collection::vec((1u64..500, any::<bool>()), 0..40),
        watermark in 0u64..500,
    ) {
        let kv = Arc::new(MemoryKvStore::new());
        let persistence = Persistence::new(kv, 3);
        let store = Store::new(populated(&heights, watermark));
        persistence.save(&store).unwrap();

        let loaded = persistence.load().unwrap();
        let original = store.snapshot();
        prop_assert_eq!(unread_ids(&loaded), unread_ids(&original));
        for id in ["f1", "f2"] {
            prop_assert_eq!(loaded.feed(id).unwrap().unread_count, original.feed(id).unwrap().unread_count);
            prop_assert_eq!(loaded.feed(id).unwrap().last_read_block_index, original.feed(id).unwrap().last_read_block_index);
        }
    }

    #[test]
    fn any_quota_keeps_unread_messages(
        heights in proptest::collection::vec((1u64..500, any::<bool>()), 1..40),
        watermark in 0u64..500,
        quota in 0usize..20_000,
    ) {
        let store = Store::new(populated(&heights, watermark));
        let unread_before = unread_ids(&store.snapshot());

        let persistence = Persistence::new(Arc::new(MemoryKvStore::with_quota(quota)), 3);
        let report = persistence.save(&store).unwrap();

        let after = store.snapshot();
        prop_assert_eq!(unread_ids(&after), unread_before);
        let remaining: usize = after.messages.values().map(Vec::len).sum();
        prop_assert_eq!(remaining + report.evicted, heights.len());
    }

    #[test]
    fn deferred_keys_fire_once_after_last_trigger(
        triggers in proptest::collection::vec((0u8..4, 0u64..1_000), 1..30),
    ) {
        let delay = Duration::from_millis(150);
        let start = Instant::now();
        let mut queue = DeferredQueue::new(delay);

        let mut sorted = triggers.clone();
        sorted.sort_by_key(|(_, at)| *at);
        let mut last: HashMap<u8, u64> = HashMap::new();
        for (key, at) in &sorted {
            queue.schedule(*key, start + Duration::from_millis(*at));
            last.insert(*key, *at);
        }

        // Poll just before and exactly at every deadline, in time order
        let mut checkpoints: Vec<u64> = last.values().flat_map(|at| [at + 149, at + 150]).collect();
        checkpoints.sort_unstable();
        checkpoints.dedup();

        let mut fired_at: HashMap<u8, u64> = HashMap::new();
        for t in checkpoints {
            for key in queue.poll_due(start + Duration::from_millis(t)) {
                prop_assert!(fired_at.insert(key, t).is_none());
            }
        }
        for (key, at) in &last {
            prop_assert_eq!(fired_at.get(key), Some(&(at + 150)));
        }
        prop_assert!(queue.is_empty());
    }
}
