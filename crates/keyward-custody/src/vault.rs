//! Session-bound encrypted vault.
//!
//! Each vault entry is one wallet secret sealed under the caller's
//! passphrase with a fresh salt and nonce, bound to the session that stored
//! it, and expiring `vault_entry_ttl` after creation. Entries are
//! independently decryptable: everything needed besides the passphrase
//! travels with the record.
//!
//! Retrieval is deliberately oracle-free. "No such wallet", "entry
//! expired", "wrong session", and "wrong passphrase" are four different
//! situations inside this module ([`DenyReason`]) and exactly one situation
//! to the caller: `Ok(None)`. The audit log keeps the real cause.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info};
use zeroize::Zeroizing;

use keyward_store::{RecordStore, VaultRecord};

use crate::audit::{AuditKind, AuditLog};
use crate::config::CustodyConfig;
use crate::crypto;
use crate::error::{CustodyError, Result};
use crate::guard::LeakGuard;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Why a retrieval was denied. Internal detail — the public API collapses
/// all four to "no secret available" so error variance cannot be used as an
/// existence or session oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// No record for that wallet id.
    NotFound,
    /// The record exists but its lifetime has passed.
    Expired,
    /// The record is bound to a different session.
    WrongSession,
    /// The authentication tag did not verify (wrong passphrase or tamper).
    BadDecrypt,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Expired => "expired",
            Self::WrongSession => "wrong_session",
            Self::BadDecrypt => "bad_decrypt",
        }
    }
}

/// Outcome of the internal retrieval path.
pub(crate) type RetrieveOutcome = std::result::Result<Zeroizing<Vec<u8>>, DenyReason>;

// ---------------------------------------------------------------------------
// EncryptedVault
// ---------------------------------------------------------------------------

/// Durable, session-bound, per-wallet encrypted storage.
pub struct EncryptedVault {
    store: Arc<dyn RecordStore>,
    guard: Arc<LeakGuard>,
    audit: Arc<AuditLog>,
    entry_ttl: Duration,
    iterations: u32,
    key_length: usize,
}

impl EncryptedVault {
    /// Build a vault over `store`, sealing with the configured derivation
    /// parameters.
    pub fn new(
        store: Arc<dyn RecordStore>,
        guard: Arc<LeakGuard>,
        audit: Arc<AuditLog>,
        config: &CustodyConfig,
    ) -> Self {
        Self {
            store,
            guard,
            audit,
            entry_ttl: config.vault_entry_ttl,
            iterations: config.iterations,
            key_length: config.key_length,
        }
    }

    /// Seal `secret` and store it for `wallet_id`, bound to `session_id`.
    ///
    /// Overwrites any prior entry for the wallet (last-write-wins). The
    /// record passes the leak guard before it reaches the storage engine.
    pub async fn store(
        &self,
        wallet_id: &str,
        secret: &[u8],
        session_id: &str,
        passphrase: &str,
    ) -> Result<()> {
        validate_id(wallet_id, "wallet id")?;
        validate_id(session_id, "session id")?;

        let sealed = {
            let plaintext = Zeroizing::new(secret.to_vec());
            let pass = Zeroizing::new(passphrase.as_bytes().to_vec());
            let iterations = self.iterations;
            let key_length = self.key_length;
            tokio::task::spawn_blocking(move || {
                crypto::seal(&plaintext, &pass, iterations, key_length)
            })
            .await??
        };

        let now = now_millis();
        let record = VaultRecord {
            wallet_id: wallet_id.to_string(),
            session_id: session_id.to_string(),
            ciphertext: sealed.ciphertext,
            salt: sealed.salt,
            nonce: sealed.nonce.to_vec(),
            created_at: now,
            last_accessed: now,
            expires_at: now + self.entry_ttl.as_millis() as i64,
        };

        // The storage write boundary: nothing secret-shaped may pass.
        self.guard
            .assert_no_secret(&serde_json::to_value(&record)?, "vault.store")?;

        self.store.put(record).await?;

        self.audit.record(
            AuditKind::VaultStored,
            Some(session_id),
            json!({ "wallet_id": wallet_id }),
        );
        info!(wallet_id, session_id, "vault entry stored");
        Ok(())
    }

    /// Open the secret for `wallet_id`, if this session may have it.
    ///
    /// Returns `Ok(None)` when the entry is missing, expired, bound to a
    /// different session, or the passphrase fails to authenticate — the
    /// four causes are indistinguishable to the caller by design. A
    /// successful retrieval refreshes the record's `last_accessed`.
    pub async fn retrieve(
        &self,
        wallet_id: &str,
        session_id: &str,
        passphrase: &str,
    ) -> Result<Option<Zeroizing<Vec<u8>>>> {
        match self.try_retrieve(wallet_id, session_id, passphrase).await? {
            Ok(secret) => {
                self.audit.record(
                    AuditKind::VaultRetrieved,
                    Some(session_id),
                    json!({ "wallet_id": wallet_id }),
                );
                Ok(Some(secret))
            }
            Err(reason) => {
                self.audit.record(
                    AuditKind::VaultDenied,
                    Some(session_id),
                    json!({ "wallet_id": wallet_id, "reason": reason.as_str() }),
                );
                debug!(wallet_id, session_id, reason = reason.as_str(), "vault retrieval denied");
                Ok(None)
            }
        }
    }

    /// The tagged retrieval path. Callers inside the crate (and the audit
    /// trail) see the precise deny cause; the public API must not.
    pub(crate) async fn try_retrieve(
        &self,
        wallet_id: &str,
        session_id: &str,
        passphrase: &str,
    ) -> Result<RetrieveOutcome> {
        let Some(record) = self.store.get(wallet_id).await? else {
            return Ok(Err(DenyReason::NotFound));
        };

        let now = now_millis();
        if now > record.expires_at {
            return Ok(Err(DenyReason::Expired));
        }
        if record.session_id != session_id {
            return Ok(Err(DenyReason::WrongSession));
        }

        let opened = {
            let pass = Zeroizing::new(passphrase.as_bytes().to_vec());
            let iterations = self.iterations;
            let key_length = self.key_length;
            tokio::task::spawn_blocking(move || {
                crypto::open(
                    &record.ciphertext,
                    &record.salt,
                    &record.nonce,
                    &pass,
                    iterations,
                    key_length,
                )
            })
            .await?
        };

        match opened {
            Ok(secret) => {
                // Refresh last_accessed; the entry itself stays put.
                self.store.touch(wallet_id, now).await?;
                Ok(Ok(secret))
            }
            Err(CustodyError::Crypto { .. }) => Ok(Err(DenyReason::BadDecrypt)),
            Err(other) => Err(other),
        }
    }

    /// Delete the entry for `wallet_id`.
    ///
    /// When `session_id` is supplied, deletion only proceeds if it matches
    /// the stored binding; a mismatch is a hard stop, not a silent no-op.
    /// Returns `true` if an entry was deleted.
    pub async fn remove(&self, wallet_id: &str, session_id: Option<&str>) -> Result<bool> {
        if let Some(session_id) = session_id {
            let Some(record) = self.store.get(wallet_id).await? else {
                return Ok(false);
            };
            if record.session_id != session_id {
                self.audit.record(
                    AuditKind::VaultDenied,
                    Some(session_id),
                    json!({ "wallet_id": wallet_id, "reason": "remove_session_mismatch" }),
                );
                return Err(CustodyError::SecurityViolation {
                    context: format!("vault.remove: session mismatch for wallet {wallet_id}"),
                });
            }
        }

        let removed = self.store.delete(wallet_id).await?;
        if removed {
            self.audit.record(
                AuditKind::VaultRemoved,
                session_id,
                json!({ "wallet_id": wallet_id }),
            );
            info!(wallet_id, "vault entry removed");
        }
        Ok(removed)
    }

    /// Delete every entry bound to `session_id`. Returns the count removed.
    pub async fn purge_session(&self, session_id: &str) -> Result<usize> {
        let removed = self.store.delete_session(session_id).await?;
        if removed > 0 {
            self.audit.record(
                AuditKind::VaultPurged,
                Some(session_id),
                json!({ "removed": removed }),
            );
            info!(session_id, removed, "vault session purged");
        }
        Ok(removed)
    }

    /// Delete every expired entry. Idempotent; a second call right after
    /// the first removes nothing.
    pub async fn purge_expired(&self) -> Result<usize> {
        let removed = self.store.delete_expired_before(now_millis()).await?;
        if removed > 0 {
            self.audit
                .record(AuditKind::VaultPurged, None, json!({ "removed": removed }));
            debug!(removed, "expired vault entries purged");
        }
        Ok(removed)
    }

    /// Delete everything. Emergency-only.
    pub async fn clear(&self) -> Result<usize> {
        let removed = self.store.clear().await?;
        self.audit
            .record(AuditKind::VaultCleared, None, json!({ "removed": removed }));
        info!(removed, "vault cleared");
        Ok(removed)
    }

    /// Wallet ids of unexpired entries, optionally restricted to a session.
    pub async fn list_wallets(&self, session_id: Option<&str>) -> Result<Vec<String>> {
        let records = match session_id {
            Some(session_id) => self.store.session_records(session_id).await?,
            None => self.store.list().await?,
        };

        let now = now_millis();
        Ok(records
            .into_iter()
            .filter(|r| r.expires_at >= now)
            .map(|r| r.wallet_id)
            .collect())
    }
}

fn validate_id(id: &str, what: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(CustodyError::Validation(format!("{what} must not be empty")));
    }
    Ok(())
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use keyward_store::SqliteRecordStore;

    async fn vault_with_ttl(ttl: Duration) -> EncryptedVault {
        let config = CustodyConfig {
            iterations: 1_000,
            vault_entry_ttl: ttl,
            ..Default::default()
        };
        let guard = Arc::new(LeakGuard::new().unwrap());
        let audit = Arc::new(AuditLog::new(Arc::clone(&guard), config.audit_log_capacity));
        let store = Arc::new(SqliteRecordStore::open_in_memory().await.unwrap());
        EncryptedVault::new(store, guard, audit, &config)
    }

    async fn vault() -> EncryptedVault {
        vault_with_ttl(Duration::from_secs(60)).await
    }

    #[tokio::test]
    async fn store_and_retrieve_roundtrip() {
        let vault = vault().await;
        vault.store("w1", b"hot wallet key", "s1", "pass123").await.unwrap();

        let secret = vault.retrieve("w1", "s1", "pass123").await.unwrap().unwrap();
        assert_eq!(&**secret, b"hot wallet key");
    }

    #[tokio::test]
    async fn wrong_passphrase_is_silent_none() {
        let vault = vault().await;
        vault.store("w1", b"secret bytes", "s1", "pass123").await.unwrap();

        let result = vault.retrieve("w1", "s1", "wrongpass").await.unwrap();
        assert!(result.is_none());

        let outcome = vault.try_retrieve("w1", "s1", "wrongpass").await.unwrap();
        assert_eq!(outcome.unwrap_err(), DenyReason::BadDecrypt);
    }

    #[tokio::test]
    async fn wrong_session_is_silent_none() {
        let vault = vault().await;
        vault.store("w1", b"secret bytes", "s1", "pass123").await.unwrap();

        // Correct passphrase, wrong session: still nothing.
        let result = vault.retrieve("w1", "s2", "pass123").await.unwrap();
        assert!(result.is_none());

        let outcome = vault.try_retrieve("w1", "s2", "pass123").await.unwrap();
        assert_eq!(outcome.unwrap_err(), DenyReason::WrongSession);
    }

    #[tokio::test]
    async fn missing_wallet_is_silent_none() {
        let vault = vault().await;
        let outcome = vault.try_retrieve("ghost", "s1", "pass123").await.unwrap();
        assert_eq!(outcome.unwrap_err(), DenyReason::NotFound);
    }

    #[tokio::test]
    async fn expired_entry_is_silent_none() {
        let vault = vault_with_ttl(Duration::from_millis(20)).await;
        vault.store("w1", b"secret bytes", "s1", "pass123").await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;

        let outcome = vault.try_retrieve("w1", "s1", "pass123").await.unwrap();
        assert_eq!(outcome.unwrap_err(), DenyReason::Expired);
        assert!(vault.retrieve("w1", "s1", "pass123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn store_overwrites_prior_entry() {
        let vault = vault().await;
        vault.store("w1", b"old secret", "s1", "pass123").await.unwrap();
        vault.store("w1", b"new secret", "s2", "pass456").await.unwrap();

        // The old binding is gone with the old entry.
        assert!(vault.retrieve("w1", "s1", "pass123").await.unwrap().is_none());

        let secret = vault.retrieve("w1", "s2", "pass456").await.unwrap().unwrap();
        assert_eq!(&**secret, b"new secret");
    }

    #[tokio::test]
    async fn remove_with_matching_session() {
        let vault = vault().await;
        vault.store("w1", b"secret", "s1", "pass123").await.unwrap();

        assert!(vault.remove("w1", Some("s1")).await.unwrap());
        assert!(vault.retrieve("w1", "s1", "pass123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_with_wrong_session_is_hard_stop() {
        let vault = vault().await;
        vault.store("w1", b"secret", "s1", "pass123").await.unwrap();

        let result = vault.remove("w1", Some("s2")).await;
        assert!(matches!(
            result,
            Err(CustodyError::SecurityViolation { .. })
        ));

        // The entry survives the failed removal.
        assert!(vault.retrieve("w1", "s1", "pass123").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn remove_missing_wallet_is_false() {
        let vault = vault().await;
        assert!(!vault.remove("ghost", Some("s1")).await.unwrap());
        assert!(!vault.remove("ghost", None).await.unwrap());
    }

    #[tokio::test]
    async fn purge_session_only_hits_that_session() {
        let vault = vault().await;
        vault.store("w1", b"a", "s1", "pass123").await.unwrap();
        vault.store("w2", b"b", "s1", "pass123").await.unwrap();
        vault.store("w3", b"c", "s2", "pass123").await.unwrap();

        assert_eq!(vault.purge_session("s1").await.unwrap(), 2);
        assert!(vault.retrieve("w3", "s2", "pass123").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn purge_expired_is_idempotent() {
        let vault = vault_with_ttl(Duration::from_millis(20)).await;
        vault.store("w1", b"a", "s1", "pass123").await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(vault.purge_expired().await.unwrap(), 1);
        assert_eq!(vault.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn list_wallets_filters_by_session_and_expiry() {
        let vault = vault().await;
        vault.store("w1", b"a", "s1", "pass123").await.unwrap();
        vault.store("w2", b"b", "s2", "pass123").await.unwrap();

        let all = vault.list_wallets(None).await.unwrap();
        assert_eq!(all, vec!["w1".to_string(), "w2".to_string()]);

        let s1 = vault.list_wallets(Some("s1")).await.unwrap();
        assert_eq!(s1, vec!["w1".to_string()]);

        assert!(vault.list_wallets(Some("s3")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let vault = vault().await;
        vault.store("w1", b"a", "s1", "pass123").await.unwrap();
        vault.store("w2", b"b", "s2", "pass123").await.unwrap();

        assert_eq!(vault.clear().await.unwrap(), 2);
        assert!(vault.list_wallets(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_ids_rejected() {
        let vault = vault().await;
        assert!(vault.store("", b"a", "s1", "pass123").await.is_err());
        assert!(vault.store("w1", b"a", "  ", "pass123").await.is_err());
    }
}
