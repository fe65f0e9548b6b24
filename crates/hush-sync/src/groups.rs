//! Per-cycle refresh of group membership and key generations.
//!
//! Runs before any message of the cycle is decrypted. Feeds refresh
//! concurrently; one feed failing is logged and the others still commit.

use futures_util::future::join_all;
use hush_core::{FeedId, FeedType, GroupKeyGeneration, GroupMember};
use tracing::{debug, warn};

use crate::coordinator::SyncCoordinator;
use crate::error::Result;

/// Fetched, unwrapped group data for one feed
#[derive(Debug)]
pub(crate) struct GroupRefresh {
    pub feed_id: FeedId,
    pub members: Vec<GroupMember>,
    pub generations: Vec<GroupKeyGeneration>,
    pub missing: Vec<u32>,
}

/// Totals across all refreshed groups
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupRefreshSummary {
    pub refreshed: usize,
    pub failed: usize,
    pub generations_added: usize,
    pub redecrypted: usize,
}

impl SyncCoordinator {
    pub(crate) async fn refresh_groups(&self) -> GroupRefreshSummary {
        let group_ids: Vec<FeedId> = self
            .store
            .snapshot()
            .feeds
            .values()
            .filter(|f| f.feed_type == FeedType::Group)
            .map(|f| f.id.clone())
            .collect();

        let results = join_all(group_ids.into_iter().map(|feed_id| async move {
            let result = self.fetch_group(&feed_id).await;
            (feed_id, result)
        }))
        .await;

        let mut summary = GroupRefreshSummary::default();
        for (feed_id, result) in results {
            match result {
                Ok(refresh) => {
                    let (added, redecrypted) = self.commit_group(refresh);
                    summary.refreshed += 1;
                    summary.generations_added += added;
                    summary.redecrypted += redecrypted;
                }
                Err(e) => {
                    warn!(feed_id = %feed_id, error = %e, "group refresh failed");
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    async fn fetch_group(&self, feed_id: &str) -> Result<GroupRefresh> {
        let address = self.identity.address.as_str();
        let members = self
            .with_retry("fetch_group_members", || self.ledger.fetch_group_members(feed_id))
            .await?;
        let page = self
            .with_retry("fetch_key_generations", || {
                self.ledger.fetch_key_generations(address, feed_id)
            })
            .await?;

        let mut missing = page.missing_generations;
        let mut generations = Vec::with_capacity(page.generations.len());
        for record in page.generations {
            match self
                .cipher
                .unwrap_key(&record.encrypted_key, &self.identity.private_key)
            {
                Ok(key) => generations.push(GroupKeyGeneration {
                    key_generation: record.key_generation,
                    key,
                    valid_from_block: record.valid_from_block,
                    valid_to_block: record.valid_to_block,
                }),
                Err(e) => {
                    warn!(
                        feed_id = %feed_id,
                        key_generation = record.key_generation,
                        error = %e,
                        "could not unwrap group key"
                    );
                    missing.push(record.key_generation);
                }
            }
        }

        Ok(GroupRefresh {
            feed_id: feed_id.to_string(),
            members: members.into_iter().map(GroupMember::from).collect(),
            generations,
            missing,
        })
    }

    /// Returns (generations added, messages re-decrypted).
    fn commit_group(&self, refresh: GroupRefresh) -> (usize, usize) {
        let cipher = self.cipher.clone();
        self.store.mutate(|snap| {
            if !snap.feeds.contains_key(&refresh.feed_id) {
                return (0, 0);
            }
            snap.group_members
                .insert(refresh.feed_id.clone(), refresh.members);
            let report = snap.merge_key_generations(&refresh.feed_id, refresh.generations, &refresh.missing);
            let redecrypted =
                snap.redecrypt_failed_messages(&refresh.feed_id, &report.added, cipher.as_ref());
            if redecrypted > 0 {
                debug!(feed_id = %refresh.feed_id, redecrypted, "recovered messages after key refresh");
            }
            (report.added.len(), redecrypted)
        })
    }
}
