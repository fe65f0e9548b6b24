use chrono::{TimeZone, Utc};
use hush_core::{Feed, FeedType, Message, Snapshot};
use proptest::prelude::*;

const ME: &str = "addr-me";

fn message(id: usize, height: Option<u64>, sender_is_me: bool, secs: i64) -> Message {
    let sender = if sender_is_me { ME } else { "addr-peer" };
    let ts = Utc.timestamp_opt(secs, 0).unwrap();
    match height {
        Some(h) => Message::confirmed(format!("m{id}"), "f1", sender, h, ts),
        None => Message::pending(format!("m{id}"), "f1", sender, "pending", ts),
    }
}

fn arb_messages() -> impl Strategy<Value = Vec<Message>> {
    proptest::collection::vec(
        (proptest::option::weighted(0.9, 0u64..1_000), any::<bool>(), 0i64..10_000),
        0..60,
    )
    .prop_map(|specs| {
        specs
            .into_iter()
            .enumerate()
            .map(|(i, (height, mine, secs))| message(i, height, mine, secs))
            .collect()
    })
}

/// Flag the messages picked by `sealed` as undecryptable.
fn seal_some(batch: Vec<Message>, sealed: &[bool]) -> Vec<Message> {
    batch
        .into_iter()
        .enumerate()
        .map(|(i, mut m)| {
            if sealed.get(i).copied().unwrap_or(false) {
                m.content = None;
                m.decryption_failed = true;
            }
            m
        })
        .collect()
}

fn snapshot_with_feeds(ids: &[&str]) -> Snapshot {
    let mut snap = Snapshot::default();
    for id in ids {
        snap.feeds
            .insert(id.to_string(), Feed::new(*id, FeedType::Direct, *id));
    }
    snap
}

proptest! {
    // --- Watermark properties ---

    #[test]
    fn watermark_is_max_of_all_marks(marks in proptest::collection::vec(0u64..10_000, 1..20)) {
        let mut snap = snapshot_with_feeds(&["f1"]);
        for w in &marks {
            snap.mark_as_read("f1", Some(*w), ME).unwrap();
        }
        let expected = marks.iter().copied().max().unwrap();
        prop_assert_eq!(snap.feed("f1").unwrap().last_read_block_index, expected);
    }

    #[test]
    fn watermark_is_order_independent(mut marks in proptest::collection::vec(0u64..10_000, 1..20)) {
        let mut forward = snapshot_with_feeds(&["f1"]);
        for w in &marks {
            forward.mark_as_read("f1", Some(*w), ME).unwrap();
        }
        marks.reverse();
        let mut backward = snapshot_with_feeds(&["f1"]);
        for w in &marks {
            backward.mark_as_read("f1", Some(*w), ME).unwrap();
        }
        prop_assert_eq!(
            forward.feed("f1").unwrap().last_read_block_index,
            backward.feed("f1").unwrap().last_read_block_index
        );
    }

    // --- Unread derivation ---

    #[test]
    fn redelivery_keeps_unread_count(batch in arb_messages(), repeats in 1usize..5, watermark in 0u64..1_000) {
        let mut once = snapshot_with_feeds(&["f1"]);
        once.mark_as_read("f1", Some(watermark), ME).unwrap();
        once.ingest_messages("f1", batch.clone(), ME).unwrap();

        let mut many = snapshot_with_feeds(&["f1"]);
        many.mark_as_read("f1", Some(watermark), ME).unwrap();
        for _ in 0..repeats {
            many.ingest_messages("f1", batch.clone(), ME).unwrap();
        }

        prop_assert_eq!(once.feed("f1").unwrap().unread_count, many.feed("f1").unwrap().unread_count);
    }

    #[test]
    fn unread_matches_definition(batch in arb_messages(), watermark in 0u64..1_000) {
        let mut snap = snapshot_with_feeds(&["f1"]);
        snap.ingest_messages("f1", batch.clone(), ME).unwrap();
        snap.mark_as_read("f1", Some(watermark), ME).unwrap();

        let expected = snap
            .messages("f1")
            .iter()
            .filter(|m| m.sender_id != ME)
            .filter(|m| m.block_height.map_or(true, |h| h > watermark))
            .count() as u32;
        prop_assert_eq!(snap.feed("f1").unwrap().unread_count, expected);
    }

    // --- Eviction never drops unread ---

    #[test]
    fn trim_preserves_unread(
        batch in arb_messages(),
        sealed in proptest::collection::vec(any::<bool>(), 40),
        watermark in 0u64..1_000,
        limit in 0usize..20,
    ) {
        let mut snap = snapshot_with_feeds(&["f1"]);
        snap.ingest_messages("f1", seal_some(batch, &sealed), ME).unwrap();
        snap.mark_as_read("f1", Some(watermark), ME).unwrap();
        let kept_before: Vec<String> = snap
            .messages("f1").iter().filter(|m| !m.is_read || m.decryption_failed).map(|m| m.id.clone()).collect();
        let evictable_before = snap.messages("f1").iter().filter(|m| m.is_read && !m.decryption_failed).count();

        let removed = snap.trim_messages_to_limit("f1", limit);

        for id in &kept_before {
            prop_assert!(!removed.contains(id));
            prop_assert!(snap.find_message("f1", id).is_some());
        }
        let evictable_left = snap.messages("f1").iter().filter(|m| m.is_read && !m.decryption_failed).count();
        prop_assert_eq!(evictable_left, evictable_before.min(limit));
    }

    #[test]
    fn quota_sweep_preserves_unread(
        a in arb_messages(),
        b in arb_messages(),
        sealed in proptest::collection::vec(any::<bool>(), 40),
        watermark in 0u64..1_000,
    ) {
        let mut snap = snapshot_with_feeds(&["f1", "f2"]);
        let b: Vec<Message> = b
            .into_iter()
            .map(|mut m| {
                m.id = format!("f2-{}", m.id);
                m.feed_id = "f2".to_string();
                m
            })
            .collect();
        snap.ingest_messages("f1", seal_some(a, &sealed), ME).unwrap();
        snap.ingest_messages("f2", b, ME).unwrap();
        snap.mark_as_read("f1", Some(watermark), ME).unwrap();
        snap.mark_as_read("f2", Some(watermark), ME).unwrap();

        let kept_before: Vec<(String, String)> = ["f1", "f2"]
            .iter()
            .flat_map(|f| {
                snap.messages(f)
                    .iter()
                    .filter(|m| !m.is_read || m.decryption_failed)
                    .map(|m| (m.feed_id.clone(), m.id.clone()))
            })
            .collect();
        let read_before = ["f1", "f2"]
            .iter()
            .map(|f| snap.messages(f).iter().filter(|m| m.is_read && !m.decryption_failed).count())
            .sum::<usize>();

        let evicted = snap.handle_storage_quota_exceeded();

        if read_before > 0 {
            prop_assert!(!evicted.is_empty());
        }
        for (feed, id) in &kept_before {
            prop_assert!(snap.find_message(feed, id).is_some());
        }
    }

    // --- Ordering ignores read state ---

    #[test]
    fn ordering_ignores_read_state(
        heights in proptest::collection::vec(0u64..100, 1..8),
        unread in proptest::collection::vec(0u32..50, 8),
    ) {
        let mut snap = Snapshot::default();
        for (i, h) in heights.iter().enumerate() {
            let mut feed = Feed::new(format!("f{i}"), FeedType::Group, "group");
            feed.block_index = *h;
            feed.unread_count = unread[i];
            snap.feeds.insert(feed.id.clone(), feed);
        }
        let before = snap.sorted_feed_ids();

        for id in before.clone() {
            snap.mark_as_read(&id, None, ME).unwrap();
        }
        prop_assert_eq!(snap.sorted_feed_ids(), before);
    }
}
