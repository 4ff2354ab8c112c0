//! Page and object tiers
//!
//! Both tiers share one wrapper, [`TierStore`], around an injected
//! [`EntryStore`] backend. The wrapper owns the tier's failure semantics:
//!
//! - reads fail open: a backend error or timeout is logged, counted and
//!   reported as a miss
//! - writes and purges are bounded by the operation timeout and return
//!   their error so callers can decide (the population path logs and moves
//!   on, the invalidation bus retries)
//! - purges are scoped to one tenant namespace; a key outside it is refused
//! - a population whose tags, key or namespace were purged after its fetch
//!   began is not stored, so an invalidation racing a fetch is not undone
//!
//! [`PageCacheStore`] and [`ObjectCacheStore`] add the tier's TTL defaults.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::backends::MemoryStore;
use crate::config::{ObjectStoreConfig, PageStoreConfig};
use crate::entry::{CacheEntry, Freshness, Lookup, Ttl, now_ms};
use crate::error::StoreError;
use crate::keys::{CacheKey, Tier};
use crate::tenant::TenantContext;
use crate::traits::{EntryStore, PutOutcome};

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    refused: AtomicU64,
    superseded: AtomicU64,
    purged: AtomicU64,
    errors: AtomicU64,
}

/// Purge marks outlive any population: fetches are bounded by the lease
/// expiry, which is capped below ten seconds
const PURGE_MARK_RETENTION: Duration = Duration::from_secs(15);
const PURGE_MARK_PRUNE_AT: usize = 256;

fn tag_mark(namespace: &str, tag: &str) -> String {
    format!("t\0{namespace}\0{tag}")
}

fn namespace_mark(namespace: &str) -> String {
    format!("n\0{namespace}")
}

fn key_mark(key: &str) -> String {
    format!("k\0{key}")
}

/// Statistics snapshot of one tier
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub tier: String,
    pub backend: String,
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub refused: u64,
    /// Populations dropped because a purge overtook their fetch
    pub superseded: u64,
    pub evictions: u64,
    pub purged: u64,
    pub errors: u64,
    pub hit_ratio: f64,
    pub entries: usize,
    pub bytes: usize,
    pub capacity_bytes: usize,
}

/// Fail-open, tenant-scoped wrapper around one tier's backend
pub struct TierStore {
    tier: Tier,
    backend: Arc<dyn EntryStore>,
    counters: Counters,
    op_timeout: Duration,
    stale_retention: Duration,
    purge_seq: AtomicU64,
    purge_marks: DashMap<String, (u64, Instant)>,
}

impl TierStore {
    #[must_use]
    pub fn new(
        tier: Tier,
        backend: Arc<dyn EntryStore>,
        stale_retention: Duration,
        op_timeout: Duration,
    ) -> Self {
        Self {
            tier,
            backend,
            counters: Counters::default(),
            op_timeout,
            stale_retention,
            purge_seq: AtomicU64::new(0),
            purge_marks: DashMap::new(),
        }
    }

    #[must_use]
    pub fn tier(&self) -> Tier {
        self.tier
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn EntryStore> {
        &self.backend
    }

    #[must_use]
    pub fn stale_retention(&self) -> Duration {
        self.stale_retention
    }

    /// Current purge sequence; pass it to [`TierStore::put_unless_purged`]
    #[must_use]
    pub fn purge_mark(&self) -> u64 {
        self.purge_seq.load(Ordering::Acquire)
    }

    fn mark_purged(&self, mark: String) {
        let seq = self.purge_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let now = Instant::now();
        self.purge_marks.insert(mark, (seq, now));
        if self.purge_marks.len() > PURGE_MARK_PRUNE_AT {
            self.purge_marks
                .retain(|_, (_, at)| now.duration_since(*at) < PURGE_MARK_RETENTION);
        }
    }

    fn purged_since(&self, key: &CacheKey, tags: &BTreeSet<String>, since: u64) -> bool {
        let newer = |mark: &str| {
            self.purge_marks
                .get(mark)
                .is_some_and(|entry| entry.value().0 > since)
        };
        newer(&key_mark(key.as_str()))
            || newer(&namespace_mark(key.namespace()))
            || tags.iter().any(|tag| newer(&tag_mark(key.namespace(), tag)))
    }

    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match timeout(self.op_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.op_timeout)),
        }
    }

    /// Read a key and classify its freshness. Never fails.
    pub async fn lookup(&self, key: &CacheKey) -> Lookup {
        let found = match self.bounded(self.backend.get(key.as_str())).await {
            Ok(found) => found,
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!(tier = self.tier.as_str(), key = %key, error = %e, "Store read failed, treating as miss");
                None
            }
        };

        let lookup = match found {
            Some(entry) => match entry.freshness(now_ms(), self.stale_retention) {
                Freshness::Fresh => Lookup::Hit(entry),
                Freshness::Stale => Lookup::Stale(entry),
                Freshness::Dead => Lookup::Miss,
            },
            None => Lookup::Miss,
        };

        match &lookup {
            Lookup::Hit(_) => self.counters.hits.fetch_add(1, Ordering::Relaxed),
            Lookup::Stale(_) => self.counters.stale_hits.fetch_add(1, Ordering::Relaxed),
            Lookup::Miss => self.counters.misses.fetch_add(1, Ordering::Relaxed),
        };
        debug!(tier = self.tier.as_str(), key = %key, hit = lookup.is_hit(), miss = lookup.is_miss(), "Store lookup");
        lookup
    }

    /// Store a payload under `key`, atomically replacing any previous entry
    ///
    /// # Errors
    ///
    /// Returns the backend error or [`StoreError::Timeout`].
    pub async fn put(
        &self,
        key: &CacheKey,
        payload: Bytes,
        ttl: Ttl,
        tags: BTreeSet<String>,
    ) -> Result<PutOutcome, StoreError> {
        self.put_entry(CacheEntry::new(key.as_str(), payload, ttl, tags))
            .await
    }

    /// Store a population unless a purge touching it ran after `since`
    ///
    /// A purge landing between the check and the write is caught by a
    /// second check, which removes the entry again.
    ///
    /// # Errors
    ///
    /// Returns the backend error or [`StoreError::Timeout`].
    pub async fn put_unless_purged(
        &self,
        key: &CacheKey,
        payload: Bytes,
        ttl: Ttl,
        tags: BTreeSet<String>,
        since: u64,
    ) -> Result<PutOutcome, StoreError> {
        if self.purged_since(key, &tags, since) {
            self.counters.superseded.fetch_add(1, Ordering::Relaxed);
            debug!(tier = self.tier.as_str(), key = %key, "Purge overtook population, not storing");
            return Ok(PutOutcome::Refused);
        }

        let outcome = self.put(key, payload, ttl, tags.clone()).await?;
        if matches!(outcome, PutOutcome::Stored { .. }) && self.purged_since(key, &tags, since) {
            self.counters.superseded.fetch_add(1, Ordering::Relaxed);
            self.bounded(self.backend.remove(key.as_str())).await?;
            debug!(tier = self.tier.as_str(), key = %key, "Purge raced population, entry removed");
            return Ok(PutOutcome::Refused);
        }
        Ok(outcome)
    }

    /// Store a prepared entry (used by snapshot restore)
    ///
    /// # Errors
    ///
    /// Returns the backend error or [`StoreError::Timeout`].
    pub async fn put_entry(&self, entry: CacheEntry) -> Result<PutOutcome, StoreError> {
        let key = entry.key.clone();
        let outcome = self.bounded(self.backend.put(entry)).await.inspect_err(|_| {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
        })?;
        match outcome {
            PutOutcome::Stored { evicted } => {
                self.counters.sets.fetch_add(1, Ordering::Relaxed);
                debug!(tier = self.tier.as_str(), key = %key, evicted, "Stored entry");
            }
            PutOutcome::Refused => {
                self.counters.refused.fetch_add(1, Ordering::Relaxed);
                debug!(tier = self.tier.as_str(), key = %key, "Entry refused by store");
            }
        }
        Ok(outcome)
    }

    /// Purge every entry of `tenant` carrying `tag`
    ///
    /// # Errors
    ///
    /// Returns the backend error so the caller can retry.
    pub async fn purge_by_tag(
        &self,
        tenant: &TenantContext,
        tag: &str,
    ) -> Result<usize, StoreError> {
        self.mark_purged(tag_mark(tenant.namespace(), tag));
        let purged = self
            .bounded(self.backend.purge_tag(tenant.namespace(), tag))
            .await
            .inspect_err(|_| {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
            })?;
        self.counters
            .purged
            .fetch_add(purged as u64, Ordering::Relaxed);
        debug!(tier = self.tier.as_str(), tenant = %tenant.id(), tag = %tag, purged, "Purged tag");
        Ok(purged)
    }

    /// Delete one key owned by `tenant`
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CrossTenant`] if the key lives in another
    /// namespace, or the backend error.
    pub async fn purge_by_key(
        &self,
        tenant: &TenantContext,
        key: &CacheKey,
    ) -> Result<bool, StoreError> {
        if !key.belongs_to(tenant) {
            return Err(StoreError::CrossTenant {
                key: key.to_string(),
                namespace: tenant.namespace().to_string(),
            });
        }
        self.mark_purged(key_mark(key.as_str()));
        let removed = self
            .bounded(self.backend.remove(key.as_str()))
            .await
            .inspect_err(|_| {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
            })?;
        if removed {
            self.counters.purged.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    /// Drop the tenant's whole namespace from this tier
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn flush_tenant(&self, tenant: &TenantContext) -> Result<usize, StoreError> {
        self.mark_purged(namespace_mark(tenant.namespace()));
        let purged = self
            .bounded(self.backend.purge_namespace(tenant.namespace()))
            .await
            .inspect_err(|_| {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
            })?;
        self.counters
            .purged
            .fetch_add(purged as u64, Ordering::Relaxed);
        Ok(purged)
    }

    /// Retained entries of this tier
    ///
    /// # Errors
    ///
    /// Returns the backend error.
    pub async fn entries(&self) -> Result<Vec<CacheEntry>, StoreError> {
        self.backend.entries().await
    }

    #[allow(clippy::cast_precision_loss)]
    pub async fn stats(&self) -> StoreStats {
        let usage = self.backend.usage().await;
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let stale_hits = self.counters.stale_hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + stale_hits + misses;

        StoreStats {
            tier: self.tier.as_str().to_string(),
            backend: self.backend.name().to_string(),
            hits,
            stale_hits,
            misses,
            sets: self.counters.sets.load(Ordering::Relaxed),
            refused: self.counters.refused.load(Ordering::Relaxed),
            superseded: self.counters.superseded.load(Ordering::Relaxed),
            evictions: usage.evictions,
            purged: self.counters.purged.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            hit_ratio: if lookups > 0 {
                (hits + stale_hits) as f64 / lookups as f64
            } else {
                0.0
            },
            entries: usage.entries,
            bytes: usage.bytes,
            capacity_bytes: usage.capacity_bytes,
        }
    }
}

/// Tier of whole rendered responses, consulted before the platform runs
#[derive(Clone)]
pub struct PageCacheStore {
    inner: Arc<TierStore>,
    default_ttl: Duration,
}

impl PageCacheStore {
    #[must_use]
    pub fn new(backend: Arc<dyn EntryStore>, config: &PageStoreConfig, op_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(TierStore::new(
                Tier::Page,
                backend,
                config.stale_retention(),
                op_timeout,
            )),
            default_ttl: config.default_ttl(),
        }
    }

    /// Page tier on the in-process LRU. Single entries above
    /// `ceiling / max_entry_fraction` are refused.
    #[must_use]
    pub fn in_memory(config: &PageStoreConfig, op_timeout: Duration) -> Self {
        let max_entry = config.memory_ceiling_bytes / config.max_entry_fraction.max(1);
        let backend = MemoryStore::new(
            "page",
            config.memory_ceiling_bytes,
            config.stale_retention(),
        )
        .with_max_entry_bytes(max_entry);
        Self::new(Arc::new(backend), config, op_timeout)
    }

    #[must_use]
    pub fn tier_store(&self) -> &Arc<TierStore> {
        &self.inner
    }

    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub async fn get(&self, key: &CacheKey) -> Lookup {
        self.inner.lookup(key).await
    }

    /// # Errors
    ///
    /// Returns the backend error or timeout.
    pub async fn put(
        &self,
        key: &CacheKey,
        payload: Bytes,
        ttl: Ttl,
        tags: BTreeSet<String>,
    ) -> Result<PutOutcome, StoreError> {
        self.inner.put(key, payload, ttl, tags).await
    }

    /// # Errors
    ///
    /// Returns the backend error or timeout.
    pub async fn purge_by_tag(&self, tenant: &TenantContext, tag: &str) -> Result<usize, StoreError> {
        self.inner.purge_by_tag(tenant, tag).await
    }

    /// # Errors
    ///
    /// Returns [`StoreError::CrossTenant`] or the backend error.
    pub async fn purge_by_key(&self, tenant: &TenantContext, key: &CacheKey) -> Result<bool, StoreError> {
        self.inner.purge_by_key(tenant, key).await
    }

    /// # Errors
    ///
    /// Returns the backend error or timeout.
    pub async fn flush_tenant(&self, tenant: &TenantContext) -> Result<usize, StoreError> {
        self.inner.flush_tenant(tenant).await
    }

    pub async fn stats(&self) -> StoreStats {
        self.inner.stats().await
    }
}

/// Tier of derived fragments: finer keys, shorter TTLs
#[derive(Clone)]
pub struct ObjectCacheStore {
    inner: Arc<TierStore>,
    default_ttl: Duration,
}

impl ObjectCacheStore {
    #[must_use]
    pub fn new(
        backend: Arc<dyn EntryStore>,
        config: &ObjectStoreConfig,
        op_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(TierStore::new(
                Tier::Object,
                backend,
                config.stale_retention(),
                op_timeout,
            )),
            default_ttl: config.default_ttl(),
        }
    }

    #[must_use]
    pub fn in_memory(config: &ObjectStoreConfig, op_timeout: Duration) -> Self {
        let backend = MemoryStore::new(
            "object",
            config.memory_ceiling_bytes,
            config.stale_retention(),
        );
        Self::new(Arc::new(backend), config, op_timeout)
    }

    #[must_use]
    pub fn tier_store(&self) -> &Arc<TierStore> {
        &self.inner
    }

    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub async fn get(&self, key: &CacheKey) -> Lookup {
        self.inner.lookup(key).await
    }

    /// Store a fragment; `ttl` of `None` applies the tier default
    ///
    /// # Errors
    ///
    /// Returns the backend error or timeout.
    pub async fn put(
        &self,
        key: &CacheKey,
        payload: Bytes,
        ttl: Option<Duration>,
        tags: BTreeSet<String>,
    ) -> Result<PutOutcome, StoreError> {
        let ttl = Ttl::Expires(ttl.unwrap_or(self.default_ttl));
        self.inner.put(key, payload, ttl, tags).await
    }

    /// # Errors
    ///
    /// Returns the backend error or timeout.
    pub async fn purge_by_tag(&self, tenant: &TenantContext, tag: &str) -> Result<usize, StoreError> {
        self.inner.purge_by_tag(tenant, tag).await
    }

    /// # Errors
    ///
    /// Returns [`StoreError::CrossTenant`] or the backend error.
    pub async fn purge_by_key(&self, tenant: &TenantContext, key: &CacheKey) -> Result<bool, StoreError> {
        self.inner.purge_by_key(tenant, key).await
    }

    /// # Errors
    ///
    /// Returns the backend error or timeout.
    pub async fn flush_tenant(&self, tenant: &TenantContext) -> Result<usize, StoreError> {
        self.inner.flush_tenant(tenant).await
    }

    pub async fn stats(&self) -> StoreStats {
        self.inner.stats().await
    }
}
