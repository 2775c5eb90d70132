//! The custody context: one object owning every custody component.
//!
//! A [`CustodyContext`] is constructed once at application startup and
//! passed by reference to every consumer — there is no module-level state.
//! It owns the session key cache, the encrypted vault, the leak guard, the
//! audit log, and the background sweeper, and exposes the caller-facing
//! API of the subsystem.
//!
//! # Session lifecycle
//!
//! ```text
//! Locked --> Unlocking --> Unlocked --> {Expired, LoggedOut} --> Locked
//! ```
//!
//! Reaching `Unlocked` caches a freshly derived session key. Any transition
//! into `Locked` clears that session's cached key and purges its vault
//! entries.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use zeroize::Zeroizing;

use keyward_store::RecordStore;

use crate::audit::{AuditKind, AuditLog};
use crate::config::CustodyConfig;
use crate::crypto::KeyHandle;
use crate::error::{CustodyError, Result};
use crate::guard::LeakGuard;
use crate::session::{CacheStatsSnapshot, SessionKeyCache};
use crate::vault::EncryptedVault;

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No usable key material. The resting state.
    Locked,
    /// Passphrase accepted for derivation; key not yet cached.
    Unlocking,
    /// A derived key is cached and usable.
    Unlocked,
    /// The session aged out. Transitional; collapses to `Locked`.
    Expired,
    /// The user ended the session. Transitional; collapses to `Locked`.
    LoggedOut,
}

// ---------------------------------------------------------------------------
// CustodyContext
// ---------------------------------------------------------------------------

/// Root object of the custody subsystem.
///
/// Cheaply cloneable (`Arc`-backed) and safe to share across async tasks.
#[derive(Clone)]
pub struct CustodyContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    config: CustodyConfig,
    guard: Arc<LeakGuard>,
    audit: Arc<AuditLog>,
    sessions: SessionKeyCache,
    vault: EncryptedVault,
    states: DashMap<String, SessionState>,

    /// When `true` the sweeper exits at its next wakeup.
    sweeper_shutdown: AtomicBool,
    /// Wakes the sweeper immediately on shutdown.
    sweeper_notify: Notify,
    sweeper_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl CustodyContext {
    /// Build a context from `config` over the given record store.
    pub fn new(config: CustodyConfig, store: Arc<dyn RecordStore>) -> Result<Self> {
        config.validate()?;

        let guard = Arc::new(LeakGuard::new()?);
        let audit = Arc::new(AuditLog::new(
            Arc::clone(&guard),
            config.audit_log_capacity,
        ));
        let sessions = SessionKeyCache::new(&config);
        let vault = EncryptedVault::new(store, Arc::clone(&guard), Arc::clone(&audit), &config);

        info!(
            iterations = config.iterations,
            key_length = config.key_length,
            "custody context ready"
        );

        Ok(Self {
            inner: Arc::new(ContextInner {
                config,
                guard,
                audit,
                sessions,
                vault,
                states: DashMap::new(),
                sweeper_shutdown: AtomicBool::new(false),
                sweeper_notify: Notify::new(),
                sweeper_handle: std::sync::Mutex::new(None),
            }),
        })
    }

    // -- Session keys -------------------------------------------------------

    /// Unlock a session: derive a key from `passphrase` and cache it.
    ///
    /// Drives `Locked → Unlocking → Unlocked`. Overwrites any existing key
    /// for the session (last-write-wins). On derivation failure the session
    /// returns to `Locked` with nothing cached.
    pub async fn create_session_key(&self, session_id: &str, passphrase: &str) -> Result<()> {
        let inner = &self.inner;
        inner
            .states
            .insert(session_id.to_string(), SessionState::Unlocking);

        match inner.sessions.create(session_id, passphrase).await {
            Ok(()) => {
                inner
                    .states
                    .insert(session_id.to_string(), SessionState::Unlocked);
                inner
                    .audit
                    .record(AuditKind::SessionCreated, Some(session_id), Value::Null);
                Ok(())
            }
            Err(err) => {
                // Nothing was cached; the failed unlock falls back to Locked
                // without touching the session's vault entries.
                inner
                    .states
                    .insert(session_id.to_string(), SessionState::Locked);
                Err(err)
            }
        }
    }

    /// Fetch the cached key for a session, if it is still usable.
    ///
    /// A `None` from an `Unlocked` session means the entry aged out or ran
    /// out of accesses; the state is marked `Expired` until the sweeper (or
    /// an explicit [`CustodyContext::expire_session`]) locks it fully.
    pub fn get_session_key(&self, session_id: &str) -> Option<KeyHandle> {
        let key = self.inner.sessions.get(session_id);

        if key.is_none()
            && self
                .inner
                .states
                .get(session_id)
                .is_some_and(|s| *s == SessionState::Unlocked)
        {
            self.inner
                .states
                .insert(session_id.to_string(), SessionState::Expired);
        }

        key
    }

    /// Zeroize and drop the cached key for a session.
    pub fn clear_session_key(&self, session_id: &str) -> bool {
        let removed = self.inner.sessions.clear(session_id);
        if removed {
            self.inner
                .audit
                .record(AuditKind::SessionCleared, Some(session_id), Value::Null);
        }
        removed
    }

    /// Zeroize and drop every cached session key.
    pub fn clear_all_session_keys(&self) {
        self.inner.sessions.clear_all();
        self.inner
            .audit
            .record(AuditKind::SessionCleared, None, json!({ "scope": "all" }));
    }

    /// End a session at the user's request.
    ///
    /// Drives `Unlocked → LoggedOut → Locked`: the cached key is zeroized
    /// and every vault entry bound to the session is purged.
    pub async fn logout(&self, session_id: &str) -> Result<()> {
        self.transition_to_locked(session_id, SessionState::LoggedOut)
            .await
    }

    /// Expire a session that aged out.
    ///
    /// Drives `Unlocked → Expired → Locked`, with the same cleanup as
    /// [`CustodyContext::logout`].
    pub async fn expire_session(&self, session_id: &str) -> Result<()> {
        self.transition_to_locked(session_id, SessionState::Expired)
            .await
    }

    /// Current lifecycle state of a session, if it has ever been seen.
    pub fn session_state(&self, session_id: &str) -> Option<SessionState> {
        self.inner.states.get(session_id).map(|s| *s)
    }

    /// Hit/miss/eviction counters of the session key cache.
    pub fn session_stats(&self) -> CacheStatsSnapshot {
        self.inner.sessions.stats()
    }

    // -- Vault --------------------------------------------------------------

    /// Seal and store a wallet secret. See [`EncryptedVault::store`].
    pub async fn vault_store(
        &self,
        wallet_id: &str,
        secret: &[u8],
        session_id: &str,
        passphrase: &str,
    ) -> Result<()> {
        self.inner
            .vault
            .store(wallet_id, secret, session_id, passphrase)
            .await
    }

    /// Retrieve a wallet secret. See [`EncryptedVault::retrieve`].
    pub async fn vault_retrieve(
        &self,
        wallet_id: &str,
        session_id: &str,
        passphrase: &str,
    ) -> Result<Option<Zeroizing<Vec<u8>>>> {
        self.inner
            .vault
            .retrieve(wallet_id, session_id, passphrase)
            .await
    }

    /// Remove a vault entry. See [`EncryptedVault::remove`].
    pub async fn vault_remove(&self, wallet_id: &str, session_id: Option<&str>) -> Result<bool> {
        self.inner.vault.remove(wallet_id, session_id).await
    }

    /// Purge all vault entries for a session.
    pub async fn vault_purge_session(&self, session_id: &str) -> Result<usize> {
        self.inner.vault.purge_session(session_id).await
    }

    /// Purge expired vault entries.
    pub async fn vault_purge_expired(&self) -> Result<usize> {
        self.inner.vault.purge_expired().await
    }

    /// Delete every vault entry. Emergency-only.
    pub async fn vault_clear(&self) -> Result<usize> {
        self.inner.vault.clear().await
    }

    /// List unexpired wallet ids, optionally for one session.
    pub async fn vault_list_wallets(&self, session_id: Option<&str>) -> Result<Vec<String>> {
        self.inner.vault.list_wallets(session_id).await
    }

    // -- Leak guard ---------------------------------------------------------

    /// Reject `data` if anything in it is secret-shaped.
    pub fn assert_no_secret(&self, data: &Value, context: &str) -> Result<()> {
        let result = self.inner.guard.assert_no_secret(data, context);
        if let Err(CustodyError::SecurityViolation { context }) = &result {
            self.inner.audit.record(
                AuditKind::LeakBlocked,
                None,
                json!({ "context": context }),
            );
        }
        result
    }

    /// Strip known secret-named fields from `data`.
    pub fn sanitize(&self, data: &Value) -> Value {
        self.inner.guard.sanitize(data)
    }

    // -- Observability ------------------------------------------------------

    /// The audit log.
    pub fn audit_log(&self) -> &AuditLog {
        &self.inner.audit
    }

    /// The configuration this context was built with.
    pub fn config(&self) -> &CustodyConfig {
        &self.inner.config
    }

    // -- Sweeper ------------------------------------------------------------

    /// Spawn the background sweep task.
    ///
    /// Every `sweep_interval` the task evicts expired session keys (locking
    /// the affected sessions) and purges expired vault entries. Call
    /// [`CustodyContext::shutdown`] to stop it. Calling this twice replaces
    /// the handle but not the running task, so don't.
    pub fn start_sweeper(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        inner.sweeper_shutdown.store(false, Ordering::Release);

        let handle = tokio::spawn({
            let inner = Arc::clone(&inner);
            async move {
                let mut interval = tokio::time::interval(inner.config.sweep_interval);
                // The first tick fires immediately; that sweep is a no-op on
                // a fresh context and harmless otherwise.
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            if inner.sweeper_shutdown.load(Ordering::Acquire) {
                                break;
                            }
                            sweep_once(&inner).await;
                        }
                        _ = inner.sweeper_notify.notified() => break,
                    }
                }
                info!("custody sweeper stopped");
            }
        });

        let mut slot = self
            .inner
            .sweeper_handle
            .lock()
            .map_err(|e| CustodyError::Internal(format!("sweeper handle lock poisoned: {e}")))?;
        if slot.is_some() {
            warn!("sweeper already running; keeping the existing task");
            handle.abort();
            return Ok(());
        }
        *slot = Some(handle);

        info!(interval = ?self.inner.config.sweep_interval, "custody sweeper started");
        Ok(())
    }

    /// Run one sweep pass inline. The sweeper task calls this on its
    /// interval; tests and host-scheduler integrations can call it directly.
    pub async fn sweep_now(&self) {
        sweep_once(&self.inner).await;
    }

    /// Stop the background sweeper and wait for it to exit.
    ///
    /// Idempotent — safe to call with no sweeper running.
    pub async fn shutdown(&self) {
        self.inner.sweeper_shutdown.store(true, Ordering::Release);
        self.inner.sweeper_notify.notify_waiters();

        let handle = match self.inner.sweeper_handle.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    // -- Private helpers ----------------------------------------------------

    async fn transition_to_locked(&self, session_id: &str, via: SessionState) -> Result<()> {
        let inner = &self.inner;

        let known = inner
            .states
            .get(session_id)
            .map(|s| *s)
            .or_else(|| inner.sessions.contains(session_id).then_some(SessionState::Unlocked));

        match known {
            Some(SessionState::Unlocked) | Some(SessionState::Expired) => {}
            Some(SessionState::Locked) | Some(SessionState::LoggedOut) => {
                return Err(CustodyError::Session {
                    reason: format!("session {session_id} is already locked"),
                });
            }
            Some(SessionState::Unlocking) => {
                return Err(CustodyError::Session {
                    reason: format!("session {session_id} is still unlocking"),
                });
            }
            None => {
                return Err(CustodyError::Session {
                    reason: format!("no such session: {session_id}"),
                });
            }
        }

        inner.states.insert(session_id.to_string(), via);

        let kind = match via {
            SessionState::LoggedOut => AuditKind::SessionLoggedOut,
            _ => AuditKind::SessionExpired,
        };
        lock_session(inner, session_id, kind).await?;
        Ok(())
    }
}

/// Complete a transition into `Locked`: clear the cached key, purge the
/// session's vault entries, record the cause, mark the state.
async fn lock_session(inner: &ContextInner, session_id: &str, kind: AuditKind) -> Result<()> {
    inner.sessions.clear(session_id);
    let purged = inner.vault.purge_session(session_id).await?;

    inner
        .audit
        .record(kind, Some(session_id), json!({ "vault_entries_purged": purged }));
    inner
        .states
        .insert(session_id.to_string(), SessionState::Locked);

    info!(session_id, cause = %kind, purged, "session locked");
    Ok(())
}

/// One sweep pass: evict expired session keys (locking those sessions) and
/// purge expired vault entries. Idempotent; only touches entries already
/// dead by wall-clock comparison.
async fn sweep_once(inner: &ContextInner) {
    let evicted = inner.sessions.sweep();
    for session_id in &evicted {
        inner
            .states
            .insert(session_id.clone(), SessionState::Expired);
        if let Err(err) = lock_session(inner, session_id, AuditKind::SessionExpired).await {
            warn!(session_id, %err, "sweep failed to lock expired session");
        }
    }

    let purged = match inner.vault.purge_expired().await {
        Ok(purged) => purged,
        Err(err) => {
            warn!(%err, "sweep failed to purge expired vault entries");
            0
        }
    };

    if !evicted.is_empty() || purged > 0 {
        inner.audit.record(
            AuditKind::SweepCompleted,
            None,
            json!({ "sessions_evicted": evicted.len(), "vault_entries_purged": purged }),
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use keyward_store::SqliteRecordStore;
    use serde_json::json;

    async fn context(config: CustodyConfig) -> CustodyContext {
        let store = Arc::new(SqliteRecordStore::open_in_memory().await.unwrap());
        CustodyContext::new(config, store).unwrap()
    }

    fn fast_config() -> CustodyConfig {
        CustodyConfig {
            iterations: 1_000,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unlock_reaches_unlocked_state() {
        let ctx = context(fast_config()).await;
        ctx.create_session_key("s1", "pass123").await.unwrap();

        assert_eq!(ctx.session_state("s1"), Some(SessionState::Unlocked));
        assert!(ctx.get_session_key("s1").is_some());
    }

    #[tokio::test]
    async fn failed_unlock_returns_to_locked() {
        let ctx = context(fast_config()).await;
        let result = ctx.create_session_key("s1", "").await;

        assert!(result.is_err());
        assert_eq!(ctx.session_state("s1"), Some(SessionState::Locked));
        assert!(ctx.get_session_key("s1").is_none());
    }

    #[tokio::test]
    async fn logout_clears_key_and_purges_vault() {
        let ctx = context(fast_config()).await;
        ctx.create_session_key("s1", "pass123").await.unwrap();
        ctx.vault_store("w1", b"secret", "s1", "pass123").await.unwrap();
        ctx.vault_store("w2", b"other", "s2", "pass123").await.unwrap();

        ctx.logout("s1").await.unwrap();

        assert_eq!(ctx.session_state("s1"), Some(SessionState::Locked));
        assert!(ctx.get_session_key("s1").is_none());
        // Only s1's vault entries are gone.
        assert!(ctx.vault_list_wallets(Some("s1")).await.unwrap().is_empty());
        assert_eq!(ctx.vault_list_wallets(Some("s2")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn logout_unknown_session_errors() {
        let ctx = context(fast_config()).await;
        let result = ctx.logout("ghost").await;
        assert!(matches!(result, Err(CustodyError::Session { .. })));
    }

    #[tokio::test]
    async fn double_logout_errors() {
        let ctx = context(fast_config()).await;
        ctx.create_session_key("s1", "pass123").await.unwrap();
        ctx.logout("s1").await.unwrap();

        let result = ctx.logout("s1").await;
        assert!(matches!(result, Err(CustodyError::Session { .. })));
    }

    #[tokio::test]
    async fn sweeper_locks_expired_sessions_and_purges_vault() {
        let config = CustodyConfig {
            iterations: 1_000,
            session_ttl: Duration::from_millis(20),
            vault_entry_ttl: Duration::from_millis(20),
            sweep_interval: Duration::from_millis(500),
            ..Default::default()
        };
        let ctx = context(config).await;
        ctx.create_session_key("s1", "pass123").await.unwrap();
        ctx.vault_store("w1", b"secret", "s1", "pass123").await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.sweep_now().await;

        assert_eq!(ctx.session_state("s1"), Some(SessionState::Locked));
        assert!(ctx.get_session_key("s1").is_none());
        assert!(ctx.vault_list_wallets(None).await.unwrap().is_empty());

        // Idempotent.
        ctx.sweep_now().await;
    }

    #[tokio::test]
    async fn background_sweeper_stops_on_shutdown() {
        let config = CustodyConfig {
            iterations: 1_000,
            sweep_interval: Duration::from_millis(10),
            ..Default::default()
        };
        let ctx = context(config).await;
        ctx.start_sweeper().unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        ctx.shutdown().await;

        // Shutdown is idempotent.
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn caller_facing_guard_api_records_violations() {
        let ctx = context(fast_config()).await;

        let dirty = json!({ "address": "0xabc", "secret": "a".repeat(64) });
        let result = ctx.assert_no_secret(&dirty, "outbound payload");
        assert!(matches!(
            result,
            Err(CustodyError::SecurityViolation { .. })
        ));

        let blocked: Vec<_> = ctx
            .audit_log()
            .events()
            .into_iter()
            .filter(|e| e.kind == AuditKind::LeakBlocked)
            .collect();
        assert_eq!(blocked.len(), 1);

        let clean = ctx.sanitize(&dirty);
        ctx.assert_no_secret(&clean, "outbound payload").unwrap();
    }

    #[tokio::test]
    async fn clear_all_session_keys_audits() {
        let ctx = context(fast_config()).await;
        ctx.create_session_key("s1", "pass123").await.unwrap();
        ctx.create_session_key("s2", "pass456").await.unwrap();

        ctx.clear_all_session_keys();
        assert!(ctx.get_session_key("s1").is_none());
        assert!(ctx.get_session_key("s2").is_none());
    }
}
