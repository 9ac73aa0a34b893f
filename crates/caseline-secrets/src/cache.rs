//! Credential cache with per-call TTL, stale fallback and health tracking.
//!
//! Each distinct secret name has at most one entry. A lookup within the
//! caller's TTL is served from memory; a miss or an expired entry goes to the
//! [`SecretStore`]. Expired entries are kept after a miss so callers can fall
//! back to them with [`CredentialCache::peek_stale`] while the secret service
//! is unreachable. The cache itself never serves a stale value from `get`.
//!
//! Concurrent misses for the same name are coalesced: the first caller
//! leads the fetch and publishes its outcome, success or error, on a watch
//! channel the other callers wait on. One outage costs one store call, not
//! one per waiter.
//!
//! Cache statistics (hits, misses, fetches, invalidations) are emitted as
//! `tracing` fields and exposed through [`CredentialCache::stats`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::time::Instant;

use crate::error::SecretsResult;
use crate::health::{HealthSummary, SecretsHealth};
use crate::secret::SecretValue;
use crate::store::SecretStore;

/// Default window after which a missing successful fetch marks the secret
/// service as degraded.
pub const DEFAULT_DEGRADATION_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Clone, Debug)]
struct CacheEntry {
    value: SecretValue,
    fetched_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() > ttl
    }
}

/// Outcome of an in-flight fetch; `None` until the leader finishes.
type Flight = Option<SecretsResult<SecretValue>>;

enum Role {
    Leader(watch::Sender<Flight>),
    Follower(watch::Receiver<Flight>),
}

/// Cached values plus the counters that fence fetches against
/// invalidation. Both live under one lock.
#[derive(Debug, Default)]
struct Entries {
    values: HashMap<String, CacheEntry>,
    /// Invalidations per name.
    epochs: HashMap<String, u64>,
    /// Bumped by a full clear.
    cleared: u64,
}

impl Entries {
    fn epoch(&self, name: &str) -> (u64, u64) {
        (self.cleared, self.epochs.get(name).copied().unwrap_or(0))
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    invalidations: AtomicU64,
}

/// Age and version of one cached secret. Never carries the value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EntryStats {
    pub name: String,
    pub age_secs: u64,
    pub version: Option<String>,
}

/// Snapshot returned by [`CredentialCache::stats`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: Vec<EntryStats>,
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub invalidations: u64,
    pub health: HealthSummary,
}

/// Caching front for a [`SecretStore`].
///
/// Entries and [`SecretsHealth`] sit behind separate locks, neither of which
/// is held across a call to the store.
pub struct CredentialCache {
    store: Arc<dyn SecretStore>,
    entries: RwLock<Entries>,
    health: RwLock<SecretsHealth>,
    /// Fetches in progress, keyed by secret name.
    inflight: Mutex<HashMap<String, watch::Receiver<Flight>>>,
    counters: Counters,
    degradation_window: Duration,
}

impl CredentialCache {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            store,
            entries: RwLock::new(Entries::default()),
            health: RwLock::new(SecretsHealth::default()),
            inflight: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            degradation_window: DEFAULT_DEGRADATION_WINDOW,
        }
    }

    pub fn with_degradation_window(mut self, window: Duration) -> Self {
        self.degradation_window = window;
        self
    }

    pub fn degradation_window(&self) -> Duration {
        self.degradation_window
    }

    /// Return `name`, fetching it if absent or older than `ttl`.
    ///
    /// On fetch failure the error is returned even if an expired entry
    /// exists; callers that accept degraded operation use
    /// [`peek_stale`](Self::peek_stale).
    pub async fn get(&self, name: &str, ttl: Duration) -> SecretsResult<SecretValue> {
        if let Some(value) = self.fresh(name, ttl).await {
            let hits = self.counters.hits.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(secret = %name, cache_hits = hits, "credential cache hit");
            return Ok(value);
        }

        let misses = self.counters.misses.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(secret = %name, cache_misses = misses, "credential cache miss");

        loop {
            let role = {
                let mut inflight = self.inflight.lock().await;
                // A dropped sender means the leader was cancelled.
                let joined = inflight
                    .get(name)
                    .filter(|flight| flight.has_changed().is_ok())
                    .cloned();
                match joined {
                    Some(flight) => Role::Follower(flight),
                    None => {
                        // A flight may have finished since the miss above.
                        if let Some(value) = self.fresh(name, ttl).await {
                            return Ok(value);
                        }
                        let (tx, rx) = watch::channel(None);
                        inflight.insert(name.to_string(), rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Leader(tx) => {
                    let result = self.fetch(name).await;
                    self.inflight.lock().await.remove(name);
                    tx.send_replace(Some(result.clone()));
                    return result;
                }
                Role::Follower(mut flight) => {
                    let shared = flight
                        .wait_for(Option::is_some)
                        .await
                        .ok()
                        .and_then(|outcome| Option::clone(&outcome));
                    if let Some(result) = shared {
                        return result;
                    }
                    tracing::debug!(secret = %name, "secret fetch abandoned by its leader, retrying");
                }
            }
        }
    }

    async fn fresh(&self, name: &str, ttl: Duration) -> Option<SecretValue> {
        let entries = self.entries.read().await;
        entries
            .values
            .get(name)
            .filter(|entry| !entry.is_expired(ttl))
            .map(|entry| entry.value.clone())
    }

    async fn fetch(&self, name: &str) -> SecretsResult<SecretValue> {
        let epoch = self.entries.read().await.epoch(name);
        let fetches = self.counters.fetches.fetch_add(1, Ordering::Relaxed) + 1;
        let started = Instant::now();

        match self.store.fetch_secret(name).await {
            Ok(value) => {
                self.health.write().await.record_success();

                let mut entries = self.entries.write().await;
                // An invalidation during the fetch means the value may
                // predate a rotation.
                if entries.epoch(name) == epoch {
                    entries.values.insert(
                        name.to_string(),
                        CacheEntry {
                            value: value.clone(),
                            fetched_at: Instant::now(),
                        },
                    );
                }
                tracing::info!(
                    secret = %name,
                    version = ?value.version(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    cache_fetches = fetches,
                    cached_entries = entries.values.len(),
                    "fetched secret"
                );
                Ok(value)
            }
            Err(e) => {
                let consecutive = {
                    let mut health = self.health.write().await;
                    health.record_failure();
                    health.consecutive_failures
                };
                tracing::warn!(
                    secret = %name,
                    error = %e,
                    transient = e.is_transient(),
                    consecutive_failures = consecutive,
                    "secret fetch failed"
                );
                Err(e)
            }
        }
    }

    /// The cached value for `name` regardless of TTL, with its age.
    pub async fn peek_stale(&self, name: &str) -> Option<(SecretValue, Duration)> {
        let entries = self.entries.read().await;
        entries
            .values
            .get(name)
            .map(|entry| (entry.value.clone(), entry.fetched_at.elapsed()))
    }

    /// Drop the entry for `name` so the next [`get`](Self::get) fetches.
    ///
    /// Returns whether an entry was present. Calling it again is a no-op.
    pub async fn invalidate(&self, name: &str) -> bool {
        let mut entries = self.entries.write().await;
        *entries.epochs.entry(name.to_string()).or_default() += 1;
        let removed = entries.values.remove(name).is_some();
        if removed {
            let invalidations = self.counters.invalidations.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::info!(
                secret = %name,
                cache_invalidations = invalidations,
                "invalidated cached secret"
            );
        }
        removed
    }

    /// Drop one entry, or every entry when `name` is `None`.
    ///
    /// Returns the number of entries removed.
    pub async fn clear(&self, name: Option<&str>) -> usize {
        match name {
            Some(name) => usize::from(self.invalidate(name).await),
            None => {
                let mut entries = self.entries.write().await;
                entries.cleared += 1;
                let removed = entries.values.len();
                entries.values.clear();
                self.counters
                    .invalidations
                    .fetch_add(removed as u64, Ordering::Relaxed);
                tracing::info!(removed, "cleared credential cache");
                removed
            }
        }
    }

    pub async fn health(&self) -> SecretsHealth {
        self.health.read().await.clone()
    }

    /// Whether the secret service is degraded under the configured window.
    pub async fn is_degraded(&self) -> bool {
        self.health.read().await.is_degraded(self.degradation_window)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.values.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.values.is_empty()
    }

    pub async fn stats(&self) -> CacheStats {
        let mut entries: Vec<EntryStats> = {
            let entries = self.entries.read().await;
            entries
                .values
                .iter()
                .map(|(name, entry)| EntryStats {
                    name: name.clone(),
                    age_secs: entry.fetched_at.elapsed().as_secs(),
                    version: entry.value.version().map(str::to_string),
                })
                .collect()
        };
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let health = self.health.read().await.snapshot(self.degradation_window);

        CacheStats {
            entries,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            fetches: self.counters.fetches.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            health,
        }
    }
}

impl std::fmt::Debug for CredentialCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialCache")
            .field("degradation_window", &self.degradation_window)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SecretsError;
    use crate::store::MemorySecretStore;
    use async_trait::async_trait;

    const TTL: Duration = Duration::from_secs(60);

    fn seeded_store() -> Arc<MemorySecretStore> {
        let store = Arc::new(MemorySecretStore::new());
        store.insert(
            "db",
            SecretValue::from_pairs([("username", "app"), ("password", "one")]).with_version("1"),
        );
        store
    }

    fn cache_over(store: &Arc<MemorySecretStore>) -> CredentialCache {
        CredentialCache::new(store.clone())
    }

    /// Store that takes a while to answer, for single-flight tests.
    struct SlowStore {
        inner: Arc<MemorySecretStore>,
        delay: Duration,
    }

    #[async_trait]
    impl SecretStore for SlowStore {
        async fn fetch_secret(&self, name: &str) -> SecretsResult<SecretValue> {
            tokio::time::sleep(self.delay).await;
            self.inner.fetch_secret(name).await
        }
    }

    // ── get ─────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn hit_within_ttl_skips_store() {
        let store = seeded_store();
        let cache = cache_over(&store);

        cache.get("db", TTL).await.unwrap();
        cache.get("db", TTL).await.unwrap();
        tokio::time::advance(Duration::from_secs(59)).await;
        cache.get("db", TTL).await.unwrap();

        assert_eq!(store.fetch_count(), 1);
        let stats = cache.stats().await;
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.fetches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_refetched() {
        let store = seeded_store();
        let cache = cache_over(&store);

        cache.get("db", TTL).await.unwrap();
        store.insert("db", SecretValue::from_pairs([("password", "two")]));
        tokio::time::advance(Duration::from_secs(61)).await;

        let value = cache.get("db", TTL).await.unwrap();
        assert_eq!(value.get_str("password"), Some("two"));
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_is_per_call() {
        let store = seeded_store();
        let cache = cache_over(&store);

        cache.get("db", Duration::from_secs(6 * 3600)).await.unwrap();
        tokio::time::advance(Duration::from_secs(120)).await;

        cache.get("db", Duration::from_secs(6 * 3600)).await.unwrap();
        assert_eq!(store.fetch_count(), 1);
        cache.get("db", Duration::from_secs(30)).await.unwrap();
        assert_eq!(store.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_raises_but_keeps_stale_entry() {
        let store = seeded_store();
        let cache = cache_over(&store);

        cache.get("db", TTL).await.unwrap();
        tokio::time::advance(Duration::from_secs(90)).await;
        store.fail_with("throttled");

        let err = cache.get("db", TTL).await.unwrap_err();
        assert!(matches!(err, SecretsError::Unavailable { .. }));

        let (stale, age) = cache.peek_stale("db").await.unwrap();
        assert_eq!(stale.get_str("password"), Some("one"));
        assert_eq!(age, Duration::from_secs(90));

        let health = cache.health().await;
        assert_eq!(health.consecutive_failures, 1);
        assert!(health.last_success.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_count() {
        let store = seeded_store();
        let cache = cache_over(&store);

        store.fail_with("down");
        assert!(cache.get("db", TTL).await.is_err());
        assert!(cache.get("db", TTL).await.is_err());
        assert_eq!(cache.health().await.consecutive_failures, 2);
        assert!(cache.is_degraded().await);

        store.recover();
        cache.get("db", TTL).await.unwrap();
        let health = cache.health().await;
        assert_eq!(health.consecutive_failures, 0);
        assert!(!cache.is_degraded().await);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_fetch_once() {
        let inner = seeded_store();
        let cache = Arc::new(CredentialCache::new(Arc::new(SlowStore {
            inner: inner.clone(),
            delay: Duration::from_millis(500),
        })));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move { cache.get("db", TTL).await }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }

        assert_eq!(inner.fetch_count(), 1);
        assert_eq!(cache.stats().await.fetches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_share_one_failure() {
        let inner = seeded_store();
        inner.fail_with("throttled");
        let cache = Arc::new(CredentialCache::new(Arc::new(SlowStore {
            inner: inner.clone(),
            delay: Duration::from_secs(2),
        })));

        let started = Instant::now();
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            tasks.push(tokio::spawn(async move { cache.get("db", TTL).await }));
        }
        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert!(matches!(err, SecretsError::Unavailable { .. }));
        }

        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(inner.fetch_count(), 1);
        assert_eq!(cache.health().await.consecutive_failures, 1);
        assert!(cache.inflight.lock().await.is_empty());

        // The next miss starts a new flight.
        assert!(cache.get("db", TTL).await.is_err());
        assert_eq!(inner.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_leader_hands_fetch_to_waiter() {
        let inner = seeded_store();
        let cache = Arc::new(CredentialCache::new(Arc::new(SlowStore {
            inner: inner.clone(),
            delay: Duration::from_millis(500),
        })));

        let leader = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get("db", TTL).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let follower = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get("db", TTL).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        leader.abort();

        let value = follower.await.unwrap().unwrap();
        assert_eq!(value.get_str("password"), Some("one"));
        // The aborted leader never reached the store.
        assert_eq!(inner.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_racing_invalidation_is_not_cached() {
        let inner = seeded_store();
        let cache = Arc::new(CredentialCache::new(Arc::new(SlowStore {
            inner: inner.clone(),
            delay: Duration::from_millis(500),
        })));

        let racing = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get("db", TTL).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cache.invalidate("db").await;
        racing.await.unwrap().unwrap();

        assert!(cache.peek_stale("db").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn invalidating_another_secret_does_not_fence_fetch() {
        let inner = seeded_store();
        inner.insert("flags", SecretValue::from_pairs([("beta", "on")]));
        let cache = Arc::new(CredentialCache::new(Arc::new(SlowStore {
            inner: inner.clone(),
            delay: Duration::from_millis(500),
        })));

        let racing = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get("db", TTL).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cache.invalidate("flags").await;
        racing.await.unwrap().unwrap();

        assert!(cache.peek_stale("db").await.is_some());
        cache.get("db", TTL).await.unwrap();
        assert_eq!(inner.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_all_fences_fetch_in_flight() {
        let inner = seeded_store();
        let cache = Arc::new(CredentialCache::new(Arc::new(SlowStore {
            inner: inner.clone(),
            delay: Duration::from_millis(500),
        })));

        let racing = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get("db", TTL).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cache.clear(None).await;
        racing.await.unwrap().unwrap();

        assert!(cache.is_empty().await);
    }

    // ── invalidate / clear ──────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn invalidate_is_idempotent() {
        let store = seeded_store();
        let cache = cache_over(&store);
        cache.get("db", TTL).await.unwrap();

        assert!(cache.invalidate("db").await);
        assert!(!cache.invalidate("db").await);
        assert!(cache.peek_stale("db").await.is_none());

        cache.get("db", TTL).await.unwrap();
        assert_eq!(store.fetch_count(), 2);
        assert_eq!(cache.stats().await.invalidations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_one_or_all() {
        let store = seeded_store();
        store.insert("flags", SecretValue::from_pairs([("beta", "on")]));
        store.insert("smtp", SecretValue::from_pairs([("host", "mail")]));
        let cache = cache_over(&store);
        for name in ["db", "flags", "smtp"] {
            cache.get(name, TTL).await.unwrap();
        }

        assert_eq!(cache.clear(Some("flags")).await, 1);
        assert_eq!(cache.clear(Some("flags")).await, 0);
        assert_eq!(cache.len().await, 2);

        assert_eq!(cache.clear(None).await, 2);
        assert!(cache.is_empty().await);
    }

    // ── stats ───────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn stats_report_ages_and_versions_only() {
        let store = seeded_store();
        store.insert("flags", SecretValue::from_pairs([("beta", "on")]));
        let cache = cache_over(&store);

        cache.get("db", TTL).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        cache.get("flags", TTL).await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;

        let stats = cache.stats().await;
        assert_eq!(
            stats.entries,
            vec![
                EntryStats {
                    name: "db".into(),
                    age_secs: 35,
                    version: Some("1".into()),
                },
                EntryStats {
                    name: "flags".into(),
                    age_secs: 5,
                    version: None,
                },
            ]
        );
        assert!(!stats.health.degraded);

        let json = serde_json::to_string(&stats).unwrap();
        assert!(!json.contains("one"));
    }
}
