//! hush-ledger: contracts for the remote ledger and its collaborators
//!
//! The sync engine only sees the ledger through [`LedgerClient`]; transaction
//! signing and identity lookup are likewise behind traits. Record types mirror
//! the ledger's JSON (camelCase, byte fields base64).

mod client;
mod error;
mod records;

pub use client::{IdentityResolver, LedgerClient, TransactionSigner};
pub use error::{Error, Result};
pub use records::{
    FeedRecord, FeedsPage, GroupMemberRecord, KeyGenerationRecord, KeyGenerationsPage,
    MessageRecord, MessageScope, MessagesPage, OlderMessagesPage, ReactionTallyRecord,
    SignedTransaction, SubmitResult,
};
