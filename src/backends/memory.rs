//! Memory Store - Size-Aware LRU Backend
//!
//! In-process store used by default for both tiers. Capacity is a byte
//! ceiling rather than an entry count, so a handful of huge pages cannot
//! starve many small fragments: every entry is charged its payload, key and
//! tag bytes, and the least-recently-used entries are evicted until the
//! incoming entry fits. Memory pressure wins over declared TTLs.
//!
//! Recency is a logical access clock. Ties on the clock (entries loaded in
//! one batch) fall back to insertion order, oldest first.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::entry::{CacheEntry, Freshness, now_ms};
use crate::error::StoreError;
use crate::traits::{EntryStore, PutOutcome, StoreUsage};

/// `(last_access_tick, insertion_seq)`; lowest is evicted first
type Rank = (u64, u64);

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    size: usize,
    rank: Rank,
}

#[derive(Debug, Default)]
struct Inner {
    slots: HashMap<String, Slot>,
    lru: BTreeMap<Rank, String>,
    tags: HashMap<(String, String), HashSet<String>>,
    namespaces: HashMap<String, HashSet<String>>,
    bytes: usize,
    tick: u64,
    seq: u64,
}

impl Inner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, key: &str) {
        let tick = self.next_tick();
        if let Some(slot) = self.slots.get_mut(key) {
            let old = slot.rank;
            slot.rank = (tick, old.1);
            let new = slot.rank;
            self.lru.remove(&old);
            self.lru.insert(new, key.to_string());
        }
    }

    fn insert(&mut self, entry: CacheEntry, size: usize) {
        let tick = self.next_tick();
        self.seq += 1;
        let rank = (tick, self.seq);
        let key = entry.key.clone();
        let namespace = entry.namespace().to_string();

        for tag in &entry.tags {
            self.tags
                .entry((namespace.clone(), tag.clone()))
                .or_default()
                .insert(key.clone());
        }
        self.namespaces
            .entry(namespace)
            .or_default()
            .insert(key.clone());
        self.lru.insert(rank, key.clone());
        self.bytes += size;
        self.slots.insert(key, Slot { entry, size, rank });
    }

    fn remove(&mut self, key: &str) -> Option<Slot> {
        let slot = self.slots.remove(key)?;
        self.lru.remove(&slot.rank);
        self.bytes = self.bytes.saturating_sub(slot.size);

        let namespace = slot.entry.namespace().to_string();
        for tag in &slot.entry.tags {
            let index_key = (namespace.clone(), tag.clone());
            if let Some(keys) = self.tags.get_mut(&index_key) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tags.remove(&index_key);
                }
            }
        }
        if let Some(keys) = self.namespaces.get_mut(&namespace) {
            keys.remove(key);
            if keys.is_empty() {
                self.namespaces.remove(&namespace);
            }
        }
        Some(slot)
    }

    fn evict_lru(&mut self) -> Option<Slot> {
        let key = self.lru.values().next().cloned()?;
        self.remove(&key)
    }
}

/// In-process size-aware LRU store with a per-namespace tag index
pub struct MemoryStore {
    label: &'static str,
    inner: Mutex<Inner>,
    capacity_bytes: usize,
    max_entry_bytes: usize,
    stale_retention: Duration,
    evictions: AtomicU64,
}

impl MemoryStore {
    /// Create a store bounded by `capacity_bytes`
    ///
    /// `stale_retention` is how long entries are kept past their TTL so
    /// they can be served stale while a refresh runs.
    #[must_use]
    pub fn new(label: &'static str, capacity_bytes: usize, stale_retention: Duration) -> Self {
        info!(
            store = label,
            capacity_bytes, "Initializing size-aware LRU memory store"
        );
        Self {
            label,
            inner: Mutex::new(Inner::default()),
            capacity_bytes,
            max_entry_bytes: capacity_bytes,
            stale_retention,
            evictions: AtomicU64::new(0),
        }
    }

    /// Refuse single entries larger than `max_entry_bytes`
    #[must_use]
    pub fn with_max_entry_bytes(mut self, max_entry_bytes: usize) -> Self {
        self.max_entry_bytes = max_entry_bytes.min(self.capacity_bytes);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().slots.is_empty()
    }
}

#[async_trait]
impl EntryStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let mut inner = self.inner.lock();
        let freshness = match inner.slots.get(key) {
            Some(slot) => slot.entry.freshness(now_ms(), self.stale_retention),
            None => return Ok(None),
        };
        if freshness == Freshness::Dead {
            inner.remove(key);
            return Ok(None);
        }
        inner.touch(key);
        Ok(inner.slots.get(key).map(|slot| slot.entry.clone()))
    }

    async fn put(&self, entry: CacheEntry) -> Result<PutOutcome, StoreError> {
        let size = entry.size_bytes();
        if size > self.max_entry_bytes {
            debug!(
                store = self.label,
                key = %entry.key,
                size,
                limit = self.max_entry_bytes,
                "Refusing oversized entry"
            );
            return Ok(PutOutcome::Refused);
        }

        let mut inner = self.inner.lock();
        inner.remove(&entry.key);

        let mut evicted = 0;
        while inner.bytes + size > self.capacity_bytes {
            match inner.evict_lru() {
                Some(slot) => {
                    evicted += 1;
                    debug!(store = self.label, key = %slot.entry.key, size = slot.size, "Evicted LRU entry");
                }
                None => break,
            }
        }
        inner.insert(entry, size);
        drop(inner);

        if evicted > 0 {
            self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        }
        Ok(PutOutcome::Stored { evicted })
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().remove(key).is_some())
    }

    async fn purge_tag(&self, namespace: &str, tag: &str) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner
            .tags
            .get(&(namespace.to_string(), tag.to_string()))
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        let purged = keys
            .iter()
            .filter(|key| inner.remove(key).is_some())
            .count();
        Ok(purged)
    }

    async fn purge_namespace(&self, namespace: &str) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner
            .namespaces
            .get(namespace)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        let purged = keys
            .iter()
            .filter(|key| inner.remove(key).is_some())
            .count();
        Ok(purged)
    }

    async fn entries(&self) -> Result<Vec<CacheEntry>, StoreError> {
        let now = now_ms();
        let inner = self.inner.lock();
        let mut slots: Vec<&Slot> = inner
            .slots
            .values()
            .filter(|slot| slot.entry.freshness(now, self.stale_retention) != Freshness::Dead)
            .collect();
        slots.sort_by_key(|slot| slot.rank);
        Ok(slots.into_iter().map(|slot| slot.entry.clone()).collect())
    }

    async fn usage(&self) -> StoreUsage {
        let inner = self.inner.lock();
        StoreUsage {
            entries: inner.slots.len(),
            bytes: inner.bytes,
            capacity_bytes: self.capacity_bytes,
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    async fn health_check(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}
