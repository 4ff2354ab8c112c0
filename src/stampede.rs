//! Stampede control
//!
//! Concurrent misses on one key collapse into a single origin fetch. The
//! first requester acquires a [`FetchLease`] (atomic test-and-set with
//! expiry) and becomes the leader; everyone else either serves a retained
//! stale copy or waits with exponentially backed-off retries, then for the
//! holder's lease to lapse. Nobody fetches without holding the lease.
//!
//! The leader's fetch and population always run on a spawned task. Dropping
//! the leader's request future abandons only its response; the population
//! still completes and wakes the waiters.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::backends::MemoryLeaseStore;
use crate::config::StampedeConfig;
use crate::entry::{CacheEntry, Lookup, Ttl};
use crate::error::{CacheError, OriginError};
use crate::keys::CacheKey;
use crate::stores::TierStore;
use crate::traits::LeaseStore;

/// Result of an origin fetch, ready to populate a tier
#[derive(Debug, Clone, PartialEq)]
pub struct Populated {
    pub payload: Bytes,
    pub ttl: Ttl,
    pub tags: BTreeSet<String>,
    /// Private responses are delivered but never stored
    pub cacheable: bool,
}

/// How a request was answered
#[derive(Debug, Clone, PartialEq)]
pub enum Served {
    Hit(CacheEntry),
    /// Retained copy past its TTL; a refresh is running or was attempted
    Stale(CacheEntry),
    Fetched(Populated),
}

impl Served {
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        match self {
            Self::Hit(entry) | Self::Stale(entry) => &entry.payload,
            Self::Fetched(populated) => &populated.payload,
        }
    }
}

/// A granted lease on one key
#[derive(Debug, Clone)]
pub struct FetchLease {
    pub key: String,
    pub holder: String,
    pub acquired_at: Instant,
    pub expires_at: Instant,
}

impl FetchLease {
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Outcome of asking for the right to populate a key
#[derive(Debug, Clone)]
pub enum Admission {
    Leader(FetchLease),
    /// Another requester holds the lease
    Follower,
}

#[derive(Debug, Default)]
struct Counters {
    leases_granted: AtomicU64,
    waits: AtomicU64,
    stale_served: AtomicU64,
    origin_fetches: AtomicU64,
    wait_timeouts: AtomicU64,
    lease_expirations: AtomicU64,
    lease_backend_errors: AtomicU64,
    in_flight: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StampedeStats {
    pub leases_granted: u64,
    pub waits: u64,
    pub stale_served: u64,
    pub origin_fetches: u64,
    /// Followers that hit their deadline without a result
    pub wait_timeouts: u64,
    pub lease_expirations: u64,
    pub lease_backend_errors: u64,
    pub in_flight: u64,
}

/// Per-key miss coordinator. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct StampedeGuard {
    leases: Arc<dyn LeaseStore>,
    /// Used while the configured lease backend is failing
    local_leases: Arc<MemoryLeaseStore>,
    waiters: Arc<DashMap<String, Arc<Notify>>>,
    config: StampedeConfig,
    counters: Arc<Counters>,
}

impl StampedeGuard {
    #[must_use]
    pub fn new(leases: Arc<dyn LeaseStore>, config: StampedeConfig) -> Self {
        Self {
            leases,
            local_leases: Arc::new(MemoryLeaseStore::new()),
            waiters: Arc::new(DashMap::new()),
            config,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Guard backed by in-process leases only
    #[must_use]
    pub fn in_memory(config: StampedeConfig) -> Self {
        Self::new(Arc::new(MemoryLeaseStore::new()), config)
    }

    /// Try to become the populator of `key`
    pub async fn admit(&self, key: &str) -> Admission {
        let holder = Uuid::new_v4().to_string();
        let ttl = self.config.lease_expiry();
        let acquired = match self.leases.try_acquire(key, &holder, ttl).await {
            Ok(acquired) => acquired,
            Err(e) => {
                self.counters
                    .lease_backend_errors
                    .fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, backend = self.leases.name(), error = %e, "Lease backend failed, using local leases");
                self.local_leases
                    .try_acquire(key, &holder, ttl)
                    .await
                    .unwrap_or(false)
            }
        };

        if acquired {
            self.counters.leases_granted.fetch_add(1, Ordering::Relaxed);
            let now = Instant::now();
            Admission::Leader(FetchLease {
                key: key.to_string(),
                holder,
                acquired_at: now,
                expires_at: now + ttl,
            })
        } else {
            Admission::Follower
        }
    }

    /// Release a lease and wake everyone waiting on its key.
    ///
    /// A lease that was taken over after expiring is reported as
    /// [`CacheError::LeaseExpiredWhileHeld`]; the next holder owns the key.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::LeaseExpiredWhileHeld`] when the lease was lost.
    pub async fn complete(&self, lease: &FetchLease) -> Result<(), CacheError> {
        let released = match self.leases.release(&lease.key, &lease.holder).await {
            Ok(released) => released,
            Err(e) => {
                warn!(key = %lease.key, error = %e, "Lease release failed");
                self.local_leases
                    .release(&lease.key, &lease.holder)
                    .await
                    .unwrap_or(false)
            }
        };
        // Either backend may have issued the lease
        let released = released
            || self
                .local_leases
                .release(&lease.key, &lease.holder)
                .await
                .unwrap_or(false);

        if let Some((_, notify)) = self.waiters.remove(&lease.key) {
            notify.notify_waiters();
        }

        if released {
            Ok(())
        } else {
            self.counters
                .lease_expirations
                .fetch_add(1, Ordering::Relaxed);
            Err(CacheError::LeaseExpiredWhileHeld {
                key: lease.key.clone(),
            })
        }
    }

    /// Serve `key` from `store`, populating it through `fetch` on a miss.
    ///
    /// At most one `fetch` runs per key at a time across every requester
    /// sharing the lease backend. Followers without a stale copy back off
    /// through their retry budget, then wait out the holder's lease and
    /// take it over.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::OriginFetchFailed`] when the fetch fails (the
    /// failure is never cached) or when a follower passes its deadline.
    pub async fn get_or_populate<F, Fut>(
        &self,
        store: &Arc<TierStore>,
        key: &CacheKey,
        fetch: F,
    ) -> Result<Served, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Populated, OriginError>> + Send + 'static,
    {
        let stale = match store.lookup(key).await {
            Lookup::Hit(entry) => return Ok(Served::Hit(entry)),
            Lookup::Stale(entry) => Some(entry),
            Lookup::Miss => None,
        };

        if let Admission::Leader(lease) = self.admit(key.as_str()).await {
            return self.lead(store, key, lease, stale, fetch).await;
        }

        if let Some(entry) = stale.filter(|_| self.config.serve_stale) {
            self.counters.stale_served.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Serving stale copy while another requester refreshes");
            return Ok(Served::Stale(entry));
        }

        self.counters.waits.fetch_add(1, Ordering::Relaxed);
        let served = self.follow(store, key, fetch).await;
        // A follower may have re-inserted the entry after the leader removed it
        self.waiters
            .remove_if(key.as_str(), |_, notify| Arc::strong_count(notify) == 1);
        served
    }

    /// Wait for the current holder of `key` until the entry appears or the
    /// lease can be taken over. Never fetches without holding the lease.
    async fn follow<F, Fut>(
        &self,
        store: &Arc<TierStore>,
        key: &CacheKey,
        fetch: F,
    ) -> Result<Served, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Populated, OriginError>> + Send + 'static,
    {
        let lease_expiry = self.config.lease_expiry();
        let started = Instant::now();
        let give_up_at = started + self.config.follower_deadline();
        // Any lease held when we arrived is gone by then
        let mut lease_deadline = started + lease_expiry;
        let mut backoff = Duration::from_millis(self.config.initial_backoff_ms);
        let max_backoff = Duration::from_millis(self.config.max_backoff_ms);
        let mut attempt: u32 = 0;

        loop {
            let notify = Arc::clone(
                self.waiters
                    .entry(key.as_str().to_string())
                    .or_insert_with(|| Arc::new(Notify::new()))
                    .value(),
            );
            let notified = notify.notified();
            tokio::pin!(notified);
            // Registered before the checks so a release in between still wakes us
            notified.as_mut().enable();

            if let Lookup::Hit(entry) = store.lookup(key).await {
                debug!(key = %key, attempt, "Waiter observed populated entry");
                return Ok(Served::Hit(entry));
            }
            if let Admission::Leader(lease) = self.admit(key.as_str()).await {
                return self.lead(store, key, lease, None, fetch).await;
            }

            let now = Instant::now();
            if now >= give_up_at {
                break;
            }
            let wait = if attempt < self.config.max_wait_retries {
                // Up to 10% jitter so followers do not re-poll in lockstep
                let wait = backoff.mul_f64(1.0 + rand::random::<f64>() * 0.1);
                backoff = (backoff * 2).min(max_backoff);
                wait
            } else {
                if now >= lease_deadline {
                    lease_deadline = now + lease_expiry;
                }
                lease_deadline - now
            };
            attempt = attempt.saturating_add(1);
            let _ = timeout(wait.min(give_up_at - now), notified).await;
        }

        self.counters.wait_timeouts.fetch_add(1, Ordering::Relaxed);
        let waited = started.elapsed();
        warn!(key = %key, waited_ms = waited.as_millis(), "Gave up waiting for the lease holder");
        Err(OriginError::Timeout(waited).into())
    }

    async fn lead<F, Fut>(
        &self,
        store: &Arc<TierStore>,
        key: &CacheKey,
        lease: FetchLease,
        stale: Option<CacheEntry>,
        fetch: F,
    ) -> Result<Served, CacheError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Populated, OriginError>> + Send + 'static,
    {
        // Another leader may have populated between our miss and the lease
        if let Lookup::Hit(entry) = store.lookup(key).await {
            if let Err(e) = self.complete(&lease).await {
                warn!(key = %key, error = %e, "Fetch lease was taken over before release");
            }
            return Ok(Served::Hit(entry));
        }

        let population = self.spawn_population(Arc::clone(store), key.clone(), lease, fetch);

        if let Some(entry) = stale.filter(|_| self.config.serve_stale) {
            self.counters.stale_served.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Serving stale copy, refreshing in background");
            return Ok(Served::Stale(entry));
        }

        match population.await {
            Ok(result) => Ok(Served::Fetched(result?)),
            Err(join_error) => Err(OriginError::Failed(anyhow::anyhow!(
                "population task failed: {join_error}"
            ))
            .into()),
        }
    }

    fn spawn_population<F, Fut>(
        &self,
        store: Arc<TierStore>,
        key: CacheKey,
        lease: FetchLease,
        fetch: F,
    ) -> JoinHandle<Result<Populated, OriginError>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Populated, OriginError>> + Send + 'static,
    {
        let guard = self.clone();
        tokio::spawn(async move {
            guard.counters.in_flight.fetch_add(1, Ordering::Relaxed);
            let since = store.purge_mark();
            let result = guard.bounded_fetch(fetch).await;

            if let Ok(populated) = &result {
                if populated.cacheable {
                    if let Err(e) = store
                        .put_unless_purged(
                            &key,
                            populated.payload.clone(),
                            populated.ttl,
                            populated.tags.clone(),
                            since,
                        )
                        .await
                    {
                        warn!(key = %key, error = %e, "Population write failed");
                    }
                }
            }

            if let Err(e) = guard.complete(&lease).await {
                warn!(key = %key, error = %e, "Fetch lease was taken over before release");
            }
            guard.counters.in_flight.fetch_sub(1, Ordering::Relaxed);
            result
        })
    }

    async fn bounded_fetch<F, Fut>(&self, fetch: F) -> Result<Populated, OriginError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Populated, OriginError>>,
    {
        self.counters.origin_fetches.fetch_add(1, Ordering::Relaxed);
        let deadline = self.config.lease_expiry();
        match timeout(deadline, fetch()).await {
            Ok(result) => result,
            Err(_) => Err(OriginError::Timeout(deadline)),
        }
    }

    #[must_use]
    pub fn stats(&self) -> StampedeStats {
        StampedeStats {
            leases_granted: self.counters.leases_granted.load(Ordering::Relaxed),
            waits: self.counters.waits.load(Ordering::Relaxed),
            stale_served: self.counters.stale_served.load(Ordering::Relaxed),
            origin_fetches: self.counters.origin_fetches.load(Ordering::Relaxed),
            wait_timeouts: self.counters.wait_timeouts.load(Ordering::Relaxed),
            lease_expirations: self.counters.lease_expirations.load(Ordering::Relaxed),
            lease_backend_errors: self.counters.lease_backend_errors.load(Ordering::Relaxed),
            in_flight: self.counters.in_flight.load(Ordering::Relaxed),
        }
    }
}
