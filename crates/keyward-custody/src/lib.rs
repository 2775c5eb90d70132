//! Key custody for keyward.
//!
//! This crate holds wallet secrets without ever writing plaintext to
//! durable storage or the network:
//!
//! - [`crypto`] — PBKDF2-HMAC-SHA256 key derivation and AES-GCM
//!   authenticated sealing, fresh salt and nonce per seal.
//! - [`session`] — memory-only cache of derived session keys with TTL and
//!   access-count limits, zeroized on eviction.
//! - [`vault`] — durable, session-bound, per-wallet encrypted storage over
//!   a `keyward-store` record store.
//! - [`guard`] — leak detection in front of every storage write and
//!   outbound payload.
//! - [`audit`] — bounded, redacting event log.
//! - [`context`] — the [`CustodyContext`] owning all of the above, plus the
//!   session lifecycle state machine and the background expiry sweeper.
//! - [`config`] / [`error`] — construction-time knobs and the unified
//!   [`CustodyError`].
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use keyward_custody::{CustodyConfig, CustodyContext};
//! use keyward_store::SqliteRecordStore;
//!
//! # async fn example() -> keyward_custody::Result<()> {
//! let store = Arc::new(SqliteRecordStore::open("data/vault.db").await?);
//! let custody = CustodyContext::new(CustodyConfig::default(), store)?;
//! custody.start_sweeper()?;
//!
//! // Unlock a session, then seal a wallet secret under it.
//! custody.create_session_key("session-1", "correct horse battery").await?;
//! custody
//!     .vault_store("wallet-1", b"<signing key bytes>", "session-1", "correct horse battery")
//!     .await?;
//!
//! let secret = custody
//!     .vault_retrieve("wallet-1", "session-1", "correct horse battery")
//!     .await?;
//! assert!(secret.is_some());
//!
//! custody.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod guard;
pub mod session;
pub mod vault;

// Re-export the most commonly used types at the crate root for convenience.
pub use audit::{AuditEvent, AuditKind, AuditLog};
pub use config::CustodyConfig;
pub use context::{CustodyContext, SessionState};
pub use crypto::{KeyHandle, SealedSecret};
pub use error::{CustodyError, Result};
pub use guard::LeakGuard;
pub use session::{CacheStatsSnapshot, SessionKeyCache};
pub use vault::{DenyReason, EncryptedVault};
