//! In-process fetch leases
//!
//! Each acquisition goes through `DashMap::entry`, which holds the shard
//! lock for the whole test-and-set, so two tasks can never both observe a
//! free slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::error::StoreError;
use crate::traits::LeaseStore;

#[derive(Debug, Clone)]
struct LeaseRecord {
    holder: String,
    expires_at: Instant,
}

/// `DashMap`-backed lease table
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    leases: DashMap<String, LeaseRecord>,
    takeovers: AtomicU64,
}

impl MemoryLeaseStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Leases acquired over an expired, unreleased lease
    #[must_use]
    pub fn takeovers(&self) -> u64 {
        self.takeovers.load(Ordering::Relaxed)
    }

    /// Current live holder of `key`
    #[must_use]
    pub fn holder(&self, key: &str) -> Option<String> {
        self.leases
            .get(key)
            .filter(|record| record.expires_at > Instant::now())
            .map(|record| record.holder.clone())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let record = LeaseRecord {
            holder: holder.to_string(),
            expires_at: now + ttl,
        };

        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    return Ok(false);
                }
                debug!(key = %key, previous = %occupied.get().holder, "Taking over expired fetch lease");
                self.takeovers.fetch_add(1, Ordering::Relaxed);
                occupied.insert(record);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(record);
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, holder: &str) -> Result<bool, StoreError> {
        Ok(self
            .leases
            .remove_if(key, |_, record| record.holder == holder)
            .is_some())
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_single_holder() {
        let leases = MemoryLeaseStore::new();
        let ttl = Duration::from_secs(5);
        assert!(leases.try_acquire("k", "a", ttl).await.unwrap());
        assert!(!leases.try_acquire("k", "b", ttl).await.unwrap());
        assert_eq!(leases.holder("k").as_deref(), Some("a"));

        // Only the holder may release
        assert!(!leases.release("k", "b").await.unwrap());
        assert!(leases.release("k", "a").await.unwrap());
        assert!(leases.try_acquire("k", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_is_taken_over() {
        let leases = MemoryLeaseStore::new();
        assert!(leases.try_acquire("k", "crashed", Duration::from_millis(20)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(leases.try_acquire("k", "next", Duration::from_secs(5)).await.unwrap());
        assert_eq!(leases.takeovers(), 1);
        // The crashed holder's late release must not drop the new lease
        assert!(!leases.release("k", "crashed").await.unwrap());
        assert_eq!(leases.holder("k").as_deref(), Some("next"));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_grants_one() {
        let leases = std::sync::Arc::new(MemoryLeaseStore::new());
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..64 {
            let leases = std::sync::Arc::clone(&leases);
            tasks.spawn(async move {
                leases
                    .try_acquire("hot", &format!("h{i}"), Duration::from_secs(5))
                    .await
                    .unwrap()
            });
        }
        let mut granted = 0;
        while let Some(result) = tasks.join_next().await {
            if result.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }
}
