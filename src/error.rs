//! Error handling - Hierarchical, zero-cost errors
//!
//! Business-rule rejections (risk validation, venue order rejections) are
//! outcomes returned as values, not errors. The variants here cover faults:
//! bad configuration, broken I/O, and illegal state transitions.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Engine error hierarchy
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration errors - fatal at startup
    #[error("config: {0}")]
    Config(String),

    /// Venue errors, classified by the adapter (see [`BrokerError`])
    #[error("broker: {0}")]
    Broker(#[from] BrokerError),

    /// Persistence collaborator errors
    #[error("store: {0}")]
    Store(String),

    /// Programming-logic faults (illegal transition, unknown order, ...)
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Serialization errors
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Shared venue error taxonomy.
///
/// Adapters translate venue-native failures into exactly one of these; the
/// engine's retry/reconcile behavior keys off the variant, never off venue
/// detail strings.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// The venue refused the order. Terminal for this attempt.
    #[error("venue rejected: {0}")]
    Rejected(String),

    /// The request definitely did not reach the venue (connect failure,
    /// rate limit, 5xx before send). Safe to retry with the same token.
    #[error("transient venue error: {0}")]
    Transient(String),

    /// The request may have reached the venue but the response was lost.
    /// Must be reconciled via a status poll before any retry.
    #[error("ambiguous venue outcome: {0}")]
    Ambiguous(String),

    /// Credential or signature failure
    #[error("venue auth: {0}")]
    Auth(String),

    /// The venue does not support this operation
    #[error("unsupported venue operation: {0}")]
    Unsupported(&'static str),
}

impl BrokerError {
    pub fn transient(err: impl std::fmt::Display) -> Self {
        BrokerError::Transient(err.to_string())
    }

    pub fn ambiguous(err: impl std::fmt::Display) -> Self {
        BrokerError::Ambiguous(err.to_string())
    }

    /// Whether the caller may retry with the same idempotency token
    /// without reconciling first.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Transient(_))
    }

    /// Whether a status poll is required before this order can leave
    /// `pending_confirmation`.
    pub fn needs_reconciliation(&self) -> bool {
        matches!(self, BrokerError::Ambiguous(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(BrokerError::Transient("timeout".into()).is_retryable());
        assert!(!BrokerError::Ambiguous("response lost".into()).is_retryable());
        assert!(!BrokerError::Rejected("insufficient margin".into()).is_retryable());
    }

    #[test]
    fn test_ambiguous_needs_reconciliation() {
        assert!(BrokerError::Ambiguous("response lost".into()).needs_reconciliation());
        assert!(!BrokerError::Transient("connect refused".into()).needs_reconciliation());
    }
}
