//! Backend and collaborator traits
//!
//! This module defines the seams of the cache layer. Stores and lease
//! coordinators are injected as trait objects into each component
//! constructor; nothing reaches for an ambient global connection.
//!
//! - `EntryStore`: key/value backend holding [`CacheEntry`] values with a
//!   per-namespace tag index
//! - `LeaseStore`: atomic test-and-set fetch leases
//! - `ContentPlatform`: the external renderer invoked on page misses
//! - `DataSource`: the external data store behind fragment fetches
//!
//! # Example: Custom Store
//!
//! ```rust,ignore
//! use multi_tenant_cache::{async_trait, CacheEntry, EntryStore, StoreError};
//!
//! struct MyStore { /* ... */ }
//!
//! #[async_trait]
//! impl EntryStore for MyStore {
//!     async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
//!         // Your implementation
//!     }
//!     // ...
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use crate::entry::CacheEntry;
use crate::error::{OriginError, StoreError};
use crate::keys::Variation;
use crate::replica::ReadTarget;
use crate::service::FragmentLoader;
use crate::tenant::TenantContext;

/// Outcome of a store write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Stored; `evicted` entries were dropped to make room
    Stored { evicted: usize },
    /// Larger than the store accepts for a single entry
    Refused,
}

/// Point-in-time occupancy of a store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreUsage {
    pub entries: usize,
    pub bytes: usize,
    pub capacity_bytes: usize,
    pub evictions: u64,
}

/// Key/value backend for one cache tier
///
/// # Atomicity
///
/// `put`, `remove` and the purge operations must be atomic per key: a
/// concurrent reader sees either the old entry or the new one, never a mix.
///
/// # Retention
///
/// Backends keep entries past their TTL for the stale-retention window and
/// return them from `get`; callers classify freshness. Purged entries are
/// removed outright.
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Fetch an entry by its rendered key
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError>;

    /// Insert or atomically replace an entry
    async fn put(&self, entry: CacheEntry) -> Result<PutOutcome, StoreError>;

    /// Delete one key. Deleting a missing key succeeds with `false`.
    async fn remove(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete every entry of `namespace` carrying `tag`
    async fn purge_tag(&self, namespace: &str, tag: &str) -> Result<usize, StoreError>;

    /// Delete every entry of `namespace`
    async fn purge_namespace(&self, namespace: &str) -> Result<usize, StoreError>;

    /// All retained entries, used for warm-restart snapshots
    async fn entries(&self) -> Result<Vec<CacheEntry>, StoreError>;

    /// Current occupancy
    async fn usage(&self) -> StoreUsage;

    /// Check that the backend answers
    async fn health_check(&self) -> bool;

    /// Name used in logs
    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// Fetch-lease coordination backend
///
/// `try_acquire` must be a single atomic test-and-set with expiry (never a
/// read followed by a write), so two requesters can never both believe
/// they hold the lease.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Acquire the lease on `key` for `holder` unless a live lease exists
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration)
    -> Result<bool, StoreError>;

    /// Release the lease if `holder` still owns it. Returns `false` when
    /// the lease expired and was taken over (or vanished) meanwhile.
    async fn release(&self, key: &str, holder: &str) -> Result<bool, StoreError>;

    fn name(&self) -> &'static str {
        "unknown"
    }
}

/// What the content platform is asked to render
#[derive(Debug, Clone)]
pub struct RenderRequest {
    /// `None` when the tenant could not be resolved (uncached pass-through)
    pub tenant: Option<TenantContext>,
    pub route: String,
    pub variation: Variation,
}

/// Rendered response body plus its invalidation metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub payload: Bytes,
    pub tags: BTreeSet<String>,
    /// Overrides the route-class TTL when set
    pub ttl: Option<Duration>,
    /// The platform may declare a response private (session content, error
    /// pages); such responses are delivered but never stored.
    pub cacheable: bool,
}

impl Rendered {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            tags: BTreeSet::new(),
            ttl: None,
            cacheable: true,
        }
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn private(mut self) -> Self {
        self.cacheable = false;
        self
    }
}

/// The content platform's synchronous render call, invoked on page misses
#[async_trait]
pub trait ContentPlatform: Send + Sync {
    async fn render(
        &self,
        request: &RenderRequest,
        fragments: &FragmentLoader,
    ) -> Result<Rendered, OriginError>;
}

/// A derived fragment (query result, aggregate) requested during rendering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentQuery {
    pub name: String,
    pub params: BTreeMap<String, String>,
    pub tags: BTreeSet<String>,
    pub ttl: Option<Duration>,
}

impl FragmentQuery {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: BTreeMap::new(),
            tags: BTreeSet::new(),
            ttl: None,
        }
    }

    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    #[must_use]
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// The data store queried on object-tier misses
///
/// The `target` is advisory: a replica may answer
/// [`OriginError::ReplicaTooStale`] and the read is retried on the primary.
/// `tenant` is `None` for requests whose tenant could not be resolved; such
/// reads must not be answered from any tenant's data.
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn query(
        &self,
        target: &ReadTarget,
        tenant: Option<&TenantContext>,
        query: &FragmentQuery,
    ) -> Result<Bytes, OriginError>;
}
