//! Collaborator contracts: ledger access, transaction signing, identity lookup.
//!
//! All ledger fetches are safe to retry with the same watermark.

use async_trait::async_trait;

use crate::error::Result;
use crate::records::{
    FeedsPage, GroupMemberRecord, KeyGenerationsPage, MessageScope, MessagesPage,
    OlderMessagesPage, SignedTransaction, SubmitResult,
};

/// Read and submit access to the ledger.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Current ledger height.
    async fn fetch_block_height(&self) -> Result<u64>;

    /// Feeds of `address` changed after `since_block`.
    async fn fetch_feeds(&self, address: &str, since_block: u64) -> Result<FeedsPage>;

    /// Messages after `since_block` and reaction tallies after
    /// `since_tally_version`.
    async fn fetch_messages(
        &self,
        address: &str,
        since_block: u64,
        since_tally_version: u64,
        scope: &MessageScope,
    ) -> Result<MessagesPage>;

    /// Up to `page_size` messages of one feed strictly below `before_block`.
    async fn fetch_older_messages(
        &self,
        address: &str,
        feed_id: &str,
        before_block: u64,
        page_size: usize,
    ) -> Result<OlderMessagesPage>;

    /// Key generations of a group feed, wrapped for `address`.
    async fn fetch_key_generations(&self, address: &str, feed_id: &str)
        -> Result<KeyGenerationsPage>;

    async fn fetch_group_members(&self, feed_id: &str) -> Result<Vec<GroupMemberRecord>>;

    async fn submit_transaction(&self, signed: SignedTransaction) -> Result<SubmitResult>;
}

/// Builds and signs transactions on behalf of the user.
#[async_trait]
pub trait TransactionSigner: Send + Sync {
    async fn sign_create_personal_feed(&self, address: &str) -> Result<SignedTransaction>;
}

/// Resolves addresses to their current display names.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn display_name(&self, address: &str) -> Result<Option<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::collections::HashMap;

    struct Directory(HashMap<String, String>);

    #[async_trait]
    impl IdentityResolver for Directory {
        async fn display_name(&self, address: &str) -> Result<Option<String>> {
            if address.is_empty() {
                return Err(Error::Identity("empty address".into()));
            }
            Ok(self.0.get(address).cloned())
        }
    }

    #[tokio::test]
    async fn test_resolver_as_trait_object() {
        let resolver: Box<dyn IdentityResolver> = Box::new(Directory(HashMap::from([(
            "addr-bob".to_string(),
            "Bob".to_string(),
        )])));

        assert_eq!(
            resolver.display_name("addr-bob").await.unwrap().as_deref(),
            Some("Bob")
        );
        assert_eq!(resolver.display_name("addr-eve").await.unwrap(), None);
        assert!(resolver.display_name("").await.is_err());
    }
}
