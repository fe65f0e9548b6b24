//! Feed list ordering.
//!
//! The personal feed is pinned first, then feeds with unconfirmed outgoing
//! messages, then everything else. Within a tier feeds sort by
//! `block_index` descending, ties by id. Read state plays no part.

use std::cmp::Reverse;

use crate::feed::{FeedId, FeedType};
use crate::store::Snapshot;

impl Snapshot {
    /// Feed ids in display order.
    pub fn sorted_feed_ids(&self) -> Vec<FeedId> {
        let mut feeds: Vec<_> = self.feeds.values().collect();
        feeds.sort_by_key(|f| {
            let tier = if f.feed_type == FeedType::Personal {
                0u8
            } else if self.has_unconfirmed_outgoing(&f.id) {
                1
            } else {
                2
            };
            (tier, Reverse(f.block_index), f.id.clone())
        });
        feeds.into_iter().map(|f| f.id.clone()).collect()
    }
}
