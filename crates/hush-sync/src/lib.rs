//! hush-sync: the sync engine of the Hush feed client
//!
//! [`SyncCoordinator`] drives one sync cycle at a time against a
//! [`hush_ledger::LedgerClient`], decrypts what it fetches, and commits the
//! result to a [`hush_core::Store`]. The store is persisted table by table
//! through a [`KvStore`]; running out of space evicts read messages rather
//! than failing.

mod config;
mod coordinator;
mod debounce;
mod decrypt;
mod error;
mod groups;
mod history;
mod personal_feed;
mod session;

pub mod kv;
pub mod persist;

pub use config::SyncConfig;
pub use coordinator::{Collaborators, Identity, SyncCoordinator, SyncReport};
pub use debounce::DeferredQueue;
pub use error::{Result, SyncError};
pub use groups::GroupRefreshSummary;
pub use history::HistoryOutcome;
pub use kv::{FileKvStore, KvError, KvStore, MemoryKvStore};
pub use persist::{Persistence, SaveReport};
pub use session::{Session, SyncMode, SyncPlan};
