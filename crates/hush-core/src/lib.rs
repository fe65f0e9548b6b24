//! hush-core: cache, key-ledger and read-state logic for the Hush feed client
//!
//! Everything here is synchronous and IO-free. State lives in a single
//! [`Snapshot`] published through a [`Store`]; the sync engine and the UI
//! both observe it, only the engine writes it.

mod cache;
mod error;
mod feed;
mod message;
mod ordering;
mod overlay;
mod reconcile;
mod store;

pub mod crypto;
pub mod keys;

pub use cache::IngestReport;
pub use crypto::{FeedCipher, TallyDecryptor, XChaChaCipher};
pub use error::{Error, Result};
pub use feed::{
    Feed, FeedCacheMetadata, FeedId, FeedType, GroupMember, GroupRole, SyncMetadata,
};
pub use keys::{
    decrypt_with_fallback, DecryptOutcome, GroupKeyGeneration, GroupKeyState, KeyMergeReport,
};
pub use message::{Message, MessageId, MessageStatus, ReactionTally};
pub use overlay::{Overlay, PageAdmission, DEFAULT_OVERLAY_CAP};
pub use store::{Snapshot, Store};
