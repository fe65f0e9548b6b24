//! Error types for hush-ledger

use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to the ledger or its collaborators
#[derive(Debug, Error)]
pub enum Error {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("transaction rejected: {0}")]
    Rejected(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("identity lookup failed: {0}")]
    Identity(String),
}

impl Error {
    /// Worth retrying with the same watermark.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_))
    }

    /// The response arrived but could not be understood.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Error::InvalidRecord(_) | Error::Serialization(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(Error::Network("reset".into()).is_transient());
        assert!(Error::Timeout("30s".into()).is_transient());
        assert!(!Error::Ledger("boom".into()).is_transient());

        let bad_json = serde_json::from_str::<u64>("{").unwrap_err();
        assert!(Error::from(bad_json).is_malformed());
        assert!(!Error::Rejected("nonce".into()).is_malformed());
    }
}
