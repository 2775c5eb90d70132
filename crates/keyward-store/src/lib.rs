//! # keyward-store
//!
//! Persistent record store for the keyward custody subsystem.
//!
//! Provides SQLite-backed persistence with WAL mode behind an async
//! [`Database`] handle, and the [`RecordStore`] trait the encrypted vault
//! is written against: record-level `get`/`put`/`delete` keyed by wallet
//! id, plus the two secondary-index queries the vault needs ("all records
//! for session X", "all records expired before T").
//!
//! Records hold only ciphertext and its public companions (salt, nonce,
//! timestamps). Nothing in this crate derives keys or decrypts anything —
//! that is `keyward-custody`'s job; this crate never sees plaintext.
//!
//! ## Quick start
//!
//! ```ignore
//! use keyward_store::{RecordStore, SqliteRecordStore};
//!
//! let store = SqliteRecordStore::open("data/vault.db").await?;
//! let record = store.get("wallet-1").await?;
//! ```

pub mod db;
pub mod error;
pub mod records;

// ── re-exports ───────────────────────────────────────────────────────

pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use records::{RecordStore, SqliteRecordStore, VaultRecord};
