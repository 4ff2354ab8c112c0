//! Flaky Store - Fault Injection Wrapper
//!
//! Wraps any [`EntryStore`] and fails on demand, for exercising the
//! fail-open read path and the invalidation retry budget.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;

use crate::entry::CacheEntry;
use crate::error::StoreError;
use crate::traits::{EntryStore, PutOutcome, StoreUsage};

/// Store wrapper that can simulate an outage or transient purge failures
pub struct FlakyStore {
    inner: Arc<dyn EntryStore>,
    down: AtomicBool,
    failing_purges: AtomicU32,
}

impl FlakyStore {
    #[must_use]
    pub fn new(inner: Arc<dyn EntryStore>) -> Self {
        Self {
            inner,
            down: AtomicBool::new(false),
            failing_purges: AtomicU32::new(0),
        }
    }

    /// Make every operation fail until [`FlakyStore::recover`]
    pub fn go_down(&self) {
        self.down.store(true, Ordering::SeqCst);
    }

    pub fn recover(&self) {
        self.down.store(false, Ordering::SeqCst);
    }

    /// Fail the next `count` purge calls, then behave normally
    pub fn fail_next_purges(&self, count: u32) {
        self.failing_purges.store(count, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("simulated outage".into()))
        } else {
            Ok(())
        }
    }

    fn check_purge(&self) -> Result<(), StoreError> {
        self.check()?;
        let consumed = self
            .failing_purges
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if consumed.is_ok() {
            Err(StoreError::Unavailable("simulated transient purge failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl EntryStore for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn put(&self, entry: CacheEntry) -> Result<PutOutcome, StoreError> {
        self.check()?;
        self.inner.put(entry).await
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.remove(key).await
    }

    async fn purge_tag(&self, namespace: &str, tag: &str) -> Result<usize, StoreError> {
        self.check_purge()?;
        self.inner.purge_tag(namespace, tag).await
    }

    async fn purge_namespace(&self, namespace: &str) -> Result<usize, StoreError> {
        self.check_purge()?;
        self.inner.purge_namespace(namespace).await
    }

    async fn entries(&self) -> Result<Vec<CacheEntry>, StoreError> {
        self.check()?;
        self.inner.entries().await
    }

    async fn usage(&self) -> StoreUsage {
        self.inner.usage().await
    }

    async fn health_check(&self) -> bool {
        !self.down.load(Ordering::SeqCst) && self.inner.health_check().await
    }

    fn name(&self) -> &'static str {
        "Flaky"
    }
}
