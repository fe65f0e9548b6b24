//! Personal feed bootstrap.
//!
//! Every account owns one personal feed. If the ledger has not reported it
//! and no creation is in flight, the coordinator submits one. A submission
//! that has not shown up after `personal_feed_timeout_blocks` is forgotten
//! so the next cycle submits again.

use tracing::{debug, info, warn};

use crate::coordinator::SyncCoordinator;
use crate::error::Result;

impl SyncCoordinator {
    /// Returns true if a creation transaction was submitted this cycle.
    pub(crate) async fn ensure_personal_feed(&self, height: u64) -> Result<bool> {
        let snapshot = self.store.snapshot();
        let meta = &snapshot.sync_metadata;

        if snapshot.personal_feed().is_some() {
            if meta.personal_feed_pending {
                info!("personal feed confirmed");
                self.store.mutate(|snap| {
                    snap.sync_metadata.personal_feed_pending = false;
                    snap.sync_metadata.personal_feed_pending_block = None;
                });
            }
            return Ok(false);
        }

        if meta.personal_feed_pending {
            let submitted = meta.personal_feed_pending_block.unwrap_or(0);
            let deadline = submitted.saturating_add(self.config.personal_feed_timeout_blocks);
            if height < deadline {
                debug!(submitted, height, "personal feed creation still pending");
                return Ok(false);
            }
            warn!(submitted, height, "personal feed creation timed out, will resubmit");
            self.store.mutate(|snap| {
                snap.sync_metadata.personal_feed_pending = false;
                snap.sync_metadata.personal_feed_pending_block = None;
            });
            return Ok(false);
        }

        let address = self.identity.address.as_str();
        let signed = self.signer.sign_create_personal_feed(address).await?;
        let result = self
            .with_retry("submit_transaction", || {
                self.ledger.submit_transaction(signed.clone())
            })
            .await?;

        if !result.successful {
            warn!(
                reason = result.message.as_deref().unwrap_or("unspecified"),
                "personal feed creation rejected, retrying next cycle"
            );
            return Ok(false);
        }

        info!(height, "submitted personal feed creation");
        self.store.mutate(|snap| {
            snap.sync_metadata.personal_feed_pending = true;
            snap.sync_metadata.personal_feed_pending_block = Some(height);
        });
        Ok(true)
    }
}
