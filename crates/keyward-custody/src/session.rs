//! In-memory cache of session-derived keys.
//!
//! One entry per active session. Entries expire when idle past the TTL or
//! after a fixed number of successful accesses, and are evicted *before*
//! being returned — a caller can never observe a stale key. Key and salt
//! bytes are zeroized on every eviction path.
//!
//! Nothing in this module ever touches durable storage; the cache is the
//! only place a derived session key exists, and it dies with the process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use zeroize::{Zeroize, Zeroizing};

use crate::config::CustodyConfig;
use crate::crypto::{self, KeyHandle};
use crate::error::Result;

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// A cached session key with its expiry metadata.
///
/// Key and salt bytes are zeroized when the entry is dropped.
struct SessionKeyEntry {
    key_bytes: Vec<u8>,
    salt: Vec<u8>,
    created_at: Instant,
    last_accessed: Instant,
    access_count: u32,
}

impl SessionKeyEntry {
    fn new(key: KeyHandle, salt: Vec<u8>) -> Self {
        let now = Instant::now();
        Self {
            key_bytes: key.as_bytes().to_vec(),
            salt,
            created_at: now,
            last_accessed: now,
            access_count: 0,
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.last_accessed.elapsed() > ttl
    }

    fn is_exhausted(&self, max_access: u32) -> bool {
        self.access_count >= max_access
    }
}

impl Drop for SessionKeyEntry {
    fn drop(&mut self) {
        self.key_bytes.zeroize();
        self.salt.zeroize();
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Counters tracking cache effectiveness.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of the current counters.
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`CacheStats`].
#[derive(Debug, Clone, Copy)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Memory-only cache of derived session keys.
pub struct SessionKeyCache {
    entries: DashMap<String, SessionKeyEntry>,
    ttl: Duration,
    max_access: u32,
    iterations: u32,
    key_length: usize,
    stats: CacheStats,
}

impl SessionKeyCache {
    /// Build a cache from the custody configuration.
    pub fn new(config: &CustodyConfig) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: config.session_ttl,
            max_access: config.max_session_access_count,
            iterations: config.iterations,
            key_length: config.key_length,
            stats: CacheStats::default(),
        }
    }

    /// Derive and cache a key for `session_id`, overwriting any prior entry.
    ///
    /// The derivation uses a fresh random salt and runs on the blocking
    /// pool so a slow PBKDF2 cannot stall the async runtime.
    pub async fn create(&self, session_id: &str, passphrase: &str) -> Result<()> {
        let salt = crypto::random_bytes(crypto::SALT_LEN)?;
        let key = self.derive_blocking(passphrase, salt.clone()).await?;

        let replaced = self
            .entries
            .insert(session_id.to_string(), SessionKeyEntry::new(key, salt));
        self.stats.record_insert();

        tracing::info!(
            session_id,
            replaced = replaced.is_some(),
            "session key cached"
        );
        Ok(())
    }

    /// Return the key for `session_id`, or `None` if no usable entry exists.
    ///
    /// Entries past their TTL or access budget are evicted here, before
    /// anything is returned. A hit refreshes `last_accessed` and counts
    /// against the access budget.
    pub fn get(&self, session_id: &str) -> Option<KeyHandle> {
        if let Some(mut entry) = self.entries.get_mut(session_id) {
            if entry.is_expired(self.ttl) || entry.is_exhausted(self.max_access) {
                drop(entry);
                self.entries.remove(session_id);
                self.stats.record_miss();
                self.stats.record_eviction();
                tracing::debug!(session_id, "session key evicted on access");
                return None;
            }

            entry.access_count += 1;
            entry.last_accessed = Instant::now();
            self.stats.record_hit();
            return Some(KeyHandle::from_bytes(entry.key_bytes.clone()));
        }

        self.stats.record_miss();
        None
    }

    /// Whether a usable entry exists, without refreshing it.
    pub fn contains(&self, session_id: &str) -> bool {
        self.entries
            .get(session_id)
            .map(|e| !e.is_expired(self.ttl) && !e.is_exhausted(self.max_access))
            .unwrap_or(false)
    }

    /// Zeroize and remove the entry for `session_id`.
    ///
    /// Returns `true` if an entry existed.
    pub fn clear(&self, session_id: &str) -> bool {
        let removed = self.entries.remove(session_id).is_some();
        if removed {
            tracing::info!(session_id, "session key cleared");
        }
        removed
    }

    /// Zeroize and remove every entry.
    pub fn clear_all(&self) {
        let count = self.entries.len();
        self.entries.clear();
        tracing::info!(count, "all session keys cleared");
    }

    /// Evict every TTL-expired entry. Idempotent and safe to run next to
    /// any other operation — it only removes entries already dead by
    /// wall-clock comparison.
    ///
    /// Returns the ids of the evicted sessions so the owner can drive
    /// their lifecycle transitions.
    pub fn sweep(&self) -> Vec<String> {
        let mut evicted = Vec::new();
        self.entries.retain(|session_id, entry| {
            if entry.is_expired(self.ttl) {
                evicted.push(session_id.clone());
                self.stats.record_eviction();
                false
            } else {
                true
            }
        });

        if !evicted.is_empty() {
            tracing::debug!(evicted = evicted.len(), "session sweep evicted expired keys");
        }
        evicted
    }

    /// Number of entries currently held (including not-yet-swept expired ones).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cache hit/miss/eviction counters.
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Age of the entry for `session_id`, if present. Diagnostic only.
    pub fn entry_age(&self, session_id: &str) -> Option<Duration> {
        self.entries
            .get(session_id)
            .map(|e| e.created_at.elapsed())
    }

    async fn derive_blocking(&self, passphrase: &str, salt: Vec<u8>) -> Result<KeyHandle> {
        let pass = Zeroizing::new(passphrase.as_bytes().to_vec());
        let iterations = self.iterations;
        let key_length = self.key_length;
        tokio::task::spawn_blocking(move || crypto::derive_key(&pass, &salt, iterations, key_length))
            .await?
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> CustodyConfig {
        CustodyConfig {
            iterations: 1_000,
            session_ttl: Duration::from_secs(60),
            max_session_access_count: 5,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_and_get() {
        let cache = SessionKeyCache::new(&test_config());
        cache.create("s1", "pass123").await.unwrap();

        let key = cache.get("s1").unwrap();
        assert_eq!(key.len(), 32);
    }

    #[tokio::test]
    async fn get_missing_session_is_none() {
        let cache = SessionKeyCache::new(&test_config());
        assert!(cache.get("nope").is_none());
    }

    #[tokio::test]
    async fn create_overwrites_prior_entry() {
        let cache = SessionKeyCache::new(&test_config());
        cache.create("s1", "first-pass").await.unwrap();
        let first = cache.get("s1").unwrap();

        cache.create("s1", "second-pass").await.unwrap();
        let second = cache.get("s1").unwrap();

        // Fresh salt + different passphrase: the key material must differ.
        assert_ne!(first.as_bytes(), second.as_bytes());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn same_passphrase_recreate_differs_by_salt() {
        let cache = SessionKeyCache::new(&test_config());
        cache.create("s1", "pass123").await.unwrap();
        let first = cache.get("s1").unwrap();

        cache.create("s1", "pass123").await.unwrap();
        let second = cache.get("s1").unwrap();

        assert_ne!(first.as_bytes(), second.as_bytes());
    }

    #[tokio::test]
    async fn access_count_limit_evicts() {
        let cache = SessionKeyCache::new(&test_config());
        cache.create("s1", "pass123").await.unwrap();

        for _ in 0..5 {
            assert!(cache.get("s1").is_some());
        }

        // Budget spent — the next access evicts and misses.
        assert!(cache.get("s1").is_none());
        assert!(!cache.contains("s1"));
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn ttl_expiry_evicts_on_get() {
        let config = CustodyConfig {
            iterations: 1_000,
            session_ttl: Duration::from_millis(20),
            ..Default::default()
        };
        let cache = SessionKeyCache::new(&config);
        cache.create("s1", "pass123").await.unwrap();

        assert!(cache.get("s1").is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(cache.get("s1").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn access_refreshes_ttl() {
        let config = CustodyConfig {
            iterations: 1_000,
            session_ttl: Duration::from_millis(60),
            ..Default::default()
        };
        let cache = SessionKeyCache::new(&config);
        cache.create("s1", "pass123").await.unwrap();

        // Keep touching the entry more often than the TTL.
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert!(cache.get("s1").is_some());
        }
    }

    #[tokio::test]
    async fn sweep_removes_only_expired() {
        let config = CustodyConfig {
            iterations: 1_000,
            session_ttl: Duration::from_millis(20),
            ..Default::default()
        };
        let cache = SessionKeyCache::new(&config);
        cache.create("old", "pass123").await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        cache.create("fresh", "pass123").await.unwrap();

        assert_eq!(cache.sweep(), vec!["old".to_string()]);
        assert!(cache.contains("fresh"));
        assert!(!cache.contains("old"));

        // Idempotent.
        assert!(cache.sweep().is_empty());
    }

    #[tokio::test]
    async fn clear_and_clear_all() {
        let cache = SessionKeyCache::new(&test_config());
        cache.create("s1", "pass123").await.unwrap();
        cache.create("s2", "pass456").await.unwrap();

        assert!(cache.clear("s1"));
        assert!(!cache.clear("s1"));
        assert_eq!(cache.len(), 1);

        cache.clear_all();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn stats_track_hits_misses_evictions() {
        let cache = SessionKeyCache::new(&test_config());
        cache.create("s1", "pass123").await.unwrap();

        cache.get("s1");
        cache.get("s1");
        cache.get("absent");

        let stats = cache.stats();
        assert_eq!(stats.inserts, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn empty_passphrase_fails_create() {
        let cache = SessionKeyCache::new(&test_config());
        assert!(cache.create("s1", "").await.is_err());
        assert!(cache.get("s1").is_none());
    }
}
