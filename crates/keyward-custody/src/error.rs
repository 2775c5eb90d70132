//! Custody error types.
//!
//! All custody subsystems surface errors through [`CustodyError`], the single
//! error type returned by every public API in this crate. Each variant maps
//! to one failure class so callers can decide how to handle it without
//! inspecting opaque strings.
//!
//! Propagation policy: [`CustodyError::Crypto`] and [`CustodyError::Storage`]
//! propagate to the caller as failed operations. [`CustodyError::SecurityViolation`]
//! is recorded in the audit log and re-raised — it must never be caught and
//! retried by calling code. Vault retrieval deliberately does *not* surface
//! its deny causes as errors at all; see `vault::DenyReason`.

use thiserror::Error;

/// Unified error type for the keyward custody subsystem.
#[derive(Debug, Error)]
pub enum CustodyError {
    /// Malformed input: empty passphrase, undersized salt, bad id, or an
    /// out-of-range configuration value.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Key derivation or cipher failure, including authentication-tag
    /// mismatch on decryption (tampering and wrong passphrase look the same).
    #[error("crypto failure: {reason}")]
    Crypto { reason: String },

    /// The leak guard matched secret-shaped data on a storage or outbound
    /// path, or a session/wallet identity check failed hard.
    #[error("security violation: {context}")]
    SecurityViolation { context: String },

    /// No matching session, a session in the wrong lifecycle state, or an
    /// invalid state transition.
    #[error("session error: {reason}")]
    Session { reason: String },

    /// Underlying storage engine failure.
    #[error("storage error: {0}")]
    Storage(#[from] keyward_store::StoreError),

    /// JSON serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A blocking task (key derivation, cipher call) was cancelled or
    /// panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),

    /// Catch-all for unexpected internal errors that don't fit a specific
    /// variant. Prefer a typed variant whenever possible.
    #[error("internal custody error: {0}")]
    Internal(String),
}

impl From<tokio::task::JoinError> for CustodyError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

/// Convenience alias used throughout the custody crate.
pub type Result<T> = std::result::Result<T, CustodyError>;
