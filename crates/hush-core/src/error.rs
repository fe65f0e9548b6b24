//! Error types for hush-core

use thiserror::Error;

use crate::message::MessageStatus;

/// Result type for hush-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while mutating cached feed state
#[derive(Debug, Error)]
pub enum Error {
    #[error("feed not found: {0}")]
    FeedNotFound(String),

    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error("invalid message transition: {from:?} -> {to:?}")]
    InvalidTransition { from: MessageStatus, to: MessageStatus },

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("key unwrap failed: {0}")]
    KeyUnwrap(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
