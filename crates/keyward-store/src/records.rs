//! Vault record persistence.
//!
//! A [`VaultRecord`] is one sealed wallet secret: ciphertext plus the public
//! material (salt, nonce) required to decrypt it independently, bound to the
//! session that created it. Records are keyed by wallet id; `put` is an
//! upsert so a later store for the same wallet silently supersedes the
//! earlier one (last-write-wins).
//!
//! The [`RecordStore`] trait is the seam between the vault and its storage
//! engine. [`SqliteRecordStore`] is the durable implementation; tests can
//! run it against an in-memory database.

use async_trait::async_trait;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A sealed wallet secret as stored on disk.
///
/// Everything in here is safe to persist: the ciphertext is authenticated
/// AES-256-GCM output, and the salt and nonce are public parameters. The
/// record carries everything needed for independent decryption — no entry
/// depends on key material beyond the caller's passphrase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultRecord {
    /// Wallet this secret belongs to. Primary key.
    pub wallet_id: String,

    /// Session that created the record. Retrieval is bound to this id.
    pub session_id: String,

    /// AES-256-GCM ciphertext with the authentication tag appended.
    pub ciphertext: Vec<u8>,

    /// PBKDF2 salt used for this record's key derivation.
    pub salt: Vec<u8>,

    /// 96-bit AES-GCM nonce for this record.
    pub nonce: Vec<u8>,

    /// Unix timestamp in milliseconds when the record was created.
    pub created_at: i64,

    /// Unix timestamp in milliseconds of the last successful retrieval.
    pub last_accessed: i64,

    /// Unix timestamp in milliseconds after which the record is dead.
    pub expires_at: i64,
}

// ---------------------------------------------------------------------------
// RecordStore trait
// ---------------------------------------------------------------------------

/// Durable storage for [`VaultRecord`]s.
///
/// Implementations must provide record-level atomicity for each method;
/// the vault never requires multi-record transactions. All timestamps are
/// Unix milliseconds supplied by the caller — the store itself never reads
/// the clock, which keeps expiry decisions in one place.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or overwrite the record for `record.wallet_id`.
    async fn put(&self, record: VaultRecord) -> StoreResult<()>;

    /// Fetch a record by wallet id.
    async fn get(&self, wallet_id: &str) -> StoreResult<Option<VaultRecord>>;

    /// Delete a record. Returns `true` if a record existed.
    async fn delete(&self, wallet_id: &str) -> StoreResult<bool>;

    /// Update `last_accessed` on a record. Returns `true` if it existed.
    async fn touch(&self, wallet_id: &str, accessed_at: i64) -> StoreResult<bool>;

    /// All records, ordered by wallet id.
    async fn list(&self) -> StoreResult<Vec<VaultRecord>>;

    /// All records bound to `session_id` (secondary index).
    async fn session_records(&self, session_id: &str) -> StoreResult<Vec<VaultRecord>>;

    /// All records with `expires_at < cutoff` (secondary index).
    async fn expired_before(&self, cutoff: i64) -> StoreResult<Vec<VaultRecord>>;

    /// Delete every record bound to `session_id`. Returns the count removed.
    async fn delete_session(&self, session_id: &str) -> StoreResult<usize>;

    /// Delete every record with `expires_at < cutoff`. Returns the count
    /// removed. Idempotent — a second call with the same cutoff is a no-op.
    async fn delete_expired_before(&self, cutoff: i64) -> StoreResult<usize>;

    /// Delete everything. Returns the count removed.
    async fn clear(&self) -> StoreResult<usize>;
}

// ---------------------------------------------------------------------------
// SQLite implementation
// ---------------------------------------------------------------------------

/// SQLite-backed [`RecordStore`].
pub struct SqliteRecordStore {
    db: Database,
}

impl SqliteRecordStore {
    /// Open (or create) the record store at `path` and set up the schema.
    pub async fn open(path: impl AsRef<std::path::Path> + Send + 'static) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let db = tokio::task::spawn_blocking(move || Database::open(&path)).await??;
        let store = Self { db };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory record store — useful for tests.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let store = Self {
            db: Database::open_in_memory()?,
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Build a store over an already-opened [`Database`].
    pub async fn with_database(db: Database) -> StoreResult<Self> {
        let store = Self { db };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> StoreResult<()> {
        self.db
            .execute(|conn| {
                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS vault_records (
                        wallet_id     TEXT PRIMARY KEY,
                        session_id    TEXT NOT NULL,
                        ciphertext    BLOB NOT NULL,
                        salt          BLOB NOT NULL,
                        nonce         BLOB NOT NULL,
                        created_at    INTEGER NOT NULL,
                        last_accessed INTEGER NOT NULL,
                        expires_at    INTEGER NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_vault_session ON vault_records(session_id);
                    CREATE INDEX IF NOT EXISTS idx_vault_expires ON vault_records(expires_at);",
                )
                .map_err(|e| StoreError::Migration {
                    reason: e.to_string(),
                })?;
                Ok(())
            })
            .await?;

        debug!("vault record schema ready");
        Ok(())
    }
}

const SELECT_COLS: &str =
    "wallet_id, session_id, ciphertext, salt, nonce, created_at, last_accessed, expires_at";

fn map_record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VaultRecord> {
    Ok(VaultRecord {
        wallet_id: row.get(0)?,
        session_id: row.get(1)?,
        ciphertext: row.get(2)?,
        salt: row.get(3)?,
        nonce: row.get(4)?,
        created_at: row.get(5)?,
        last_accessed: row.get(6)?,
        expires_at: row.get(7)?,
    })
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn put(&self, record: VaultRecord) -> StoreResult<()> {
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO vault_records
                         (wallet_id, session_id, ciphertext, salt, nonce,
                          created_at, last_accessed, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(wallet_id) DO UPDATE SET
                         session_id    = excluded.session_id,
                         ciphertext    = excluded.ciphertext,
                         salt          = excluded.salt,
                         nonce         = excluded.nonce,
                         created_at    = excluded.created_at,
                         last_accessed = excluded.last_accessed,
                         expires_at    = excluded.expires_at",
                    params![
                        record.wallet_id,
                        record.session_id,
                        record.ciphertext,
                        record.salt,
                        record.nonce,
                        record.created_at,
                        record.last_accessed,
                        record.expires_at,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    async fn get(&self, wallet_id: &str) -> StoreResult<Option<VaultRecord>> {
        let wallet_id = wallet_id.to_string();
        self.db
            .execute(move |conn| {
                let record = conn
                    .query_row(
                        &format!("SELECT {SELECT_COLS} FROM vault_records WHERE wallet_id = ?1"),
                        params![wallet_id],
                        map_record_row,
                    )
                    .optional()?;
                Ok(record)
            })
            .await
    }

    async fn delete(&self, wallet_id: &str) -> StoreResult<bool> {
        let wallet_id = wallet_id.to_string();
        self.db
            .execute(move |conn| {
                let rows = conn.execute(
                    "DELETE FROM vault_records WHERE wallet_id = ?1",
                    params![wallet_id],
                )?;
                Ok(rows > 0)
            })
            .await
    }

    async fn touch(&self, wallet_id: &str, accessed_at: i64) -> StoreResult<bool> {
        let wallet_id = wallet_id.to_string();
        self.db
            .execute(move |conn| {
                let rows = conn.execute(
                    "UPDATE vault_records SET last_accessed = ?1 WHERE wallet_id = ?2",
                    params![accessed_at, wallet_id],
                )?;
                Ok(rows > 0)
            })
            .await
    }

    async fn list(&self) -> StoreResult<Vec<VaultRecord>> {
        self.db
            .execute(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SELECT_COLS} FROM vault_records ORDER BY wallet_id"
                ))?;
                let rows = stmt
                    .query_map([], map_record_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    async fn session_records(&self, session_id: &str) -> StoreResult<Vec<VaultRecord>> {
        let session_id = session_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SELECT_COLS} FROM vault_records
                     WHERE session_id = ?1 ORDER BY wallet_id"
                ))?;
                let rows = stmt
                    .query_map(params![session_id], map_record_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    async fn expired_before(&self, cutoff: i64) -> StoreResult<Vec<VaultRecord>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SELECT_COLS} FROM vault_records
                     WHERE expires_at < ?1 ORDER BY wallet_id"
                ))?;
                let rows = stmt
                    .query_map(params![cutoff], map_record_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    async fn delete_session(&self, session_id: &str) -> StoreResult<usize> {
        let session_id = session_id.to_string();
        self.db
            .execute(move |conn| {
                let rows = conn.execute(
                    "DELETE FROM vault_records WHERE session_id = ?1",
                    params![session_id],
                )?;
                Ok(rows)
            })
            .await
    }

    async fn delete_expired_before(&self, cutoff: i64) -> StoreResult<usize> {
        self.db
            .execute(move |conn| {
                let rows = conn.execute(
                    "DELETE FROM vault_records WHERE expires_at < ?1",
                    params![cutoff],
                )?;
                Ok(rows)
            })
            .await
    }

    async fn clear(&self) -> StoreResult<usize> {
        self.db
            .execute(|conn| {
                let rows = conn.execute("DELETE FROM vault_records", [])?;
                Ok(rows)
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
