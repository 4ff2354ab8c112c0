//! Cache invalidation
//!
//! Content mutations arrive as [`InvalidationEvent`]s. Each event moves
//! through `Received -> Deduplicated -> Applied -> Acknowledged`:
//!
//! - the event id is checked against a bounded [`ReplayLog`], so redelivery
//!   is a no-op
//! - the tenant's write hint is recorded with the [`ReplicaRouter`]
//! - every tag is purged from both tiers, scoped to the tenant namespace;
//!   a failed purge is retried with exponential backoff and then given up,
//!   leaving TTL expiry as the backstop
//! - the applied event is broadcast to subscribers
//!
//! Tag purges commute, so events may be applied in any order. Delivery to
//! the consumer task goes through a bounded `mpsc` queue; an optional Redis
//! pub/sub transport carries events between instances.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::InvalidationConfig;
use crate::entry::now_ms;
use crate::error::{CacheError, StoreError};
use crate::replica::ReplicaRouter;
use crate::stores::{ObjectCacheStore, PageCacheStore, TierStore};
use crate::tenant::{ALL_TENANTS, TenantContext, TenantRegistry};

/// A content mutation affecting one tenant (or all, with tenant `*`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub event_id: String,
    pub tenant_id: String,
    pub tags: Vec<String>,
    pub timestamp_ms: u64,
}

impl InvalidationEvent {
    /// New event with a fresh id
    pub fn new<I, T>(tenant_id: impl Into<String>, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self::with_id(Uuid::new_v4().to_string(), tenant_id, tags)
    }

    /// Event with a caller-chosen id, for redelivery from an upstream log
    pub fn with_id<I, T>(event_id: impl Into<String>, tenant_id: impl Into<String>, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            event_id: event_id.into(),
            tenant_id: tenant_id.into(),
            tags: tags.into_iter().map(Into::into).collect(),
            timestamp_ms: now_ms(),
        }
    }

    #[must_use]
    pub fn is_global(&self) -> bool {
        self.tenant_id == ALL_TENANTS
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).context("Failed to serialize invalidation event")
    }

    /// # Errors
    ///
    /// Returns an error if the payload is not a valid event.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize invalidation event")
    }
}

/// Result of processing one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// All purges succeeded
    Applied { purged: usize },
    /// Event id already applied within the replay window
    Duplicate,
    /// Some purges were abandoned after retries. The id is not recorded, so
    /// a redelivery applies the event again.
    PartiallyApplied { purged: usize, failures: usize },
    /// Malformed event (bad tenant id, no tags)
    Rejected { reason: String },
}

/// Where an applied event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    Local,
    Remote,
}

/// Broadcast to subscribers after an event is applied
#[derive(Debug, Clone)]
pub struct AppliedEvent {
    pub event: InvalidationEvent,
    pub source: EventSource,
}

/// Recently applied event ids, bounded by age and count
#[derive(Debug)]
pub struct ReplayLog {
    window: Duration,
    capacity: usize,
    order: VecDeque<(String, Instant)>,
    seen: HashSet<String>,
}

impl ReplayLog {
    #[must_use]
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    fn prune(&mut self) {
        let now = Instant::now();
        while let Some((id, at)) = self.order.front() {
            if now.duration_since(*at) < self.window && self.order.len() <= self.capacity {
                break;
            }
            self.seen.remove(id);
            self.order.pop_front();
        }
    }

    /// Record `id`; `false` if it is already present
    pub fn claim(&mut self, id: &str) -> bool {
        self.prune();
        if self.seen.contains(id) {
            return false;
        }
        self.seen.insert(id.to_string());
        self.order.push_back((id.to_string(), Instant::now()));
        self.prune();
        true
    }

    /// Drop `id` so a later delivery is processed again
    pub fn forget(&mut self, id: &str) {
        if self.seen.remove(id) {
            self.order.retain(|(seen, _)| seen != id);
        }
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    duplicates: AtomicU64,
    applied: AtomicU64,
    partially_applied: AtomicU64,
    rejected: AtomicU64,
    purged_entries: AtomicU64,
    purge_retries: AtomicU64,
    purge_failures: AtomicU64,
    remote_received: AtomicU64,
    remote_published: AtomicU64,
    transport_errors: AtomicU64,
}

/// Statistics snapshot of the bus
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationStats {
    pub received: u64,
    pub duplicates: u64,
    pub applied: u64,
    pub partially_applied: u64,
    pub rejected: u64,
    pub purged_entries: u64,
    pub purge_retries: u64,
    pub purge_failures: u64,
    pub remote_received: u64,
    pub remote_published: u64,
    pub transport_errors: u64,
    pub replay_log_len: usize,
}

struct BusInner {
    page: PageCacheStore,
    object: ObjectCacheStore,
    registry: Arc<TenantRegistry>,
    router: Arc<ReplicaRouter>,
    replay: Mutex<ReplayLog>,
    config: InvalidationConfig,
    counters: Counters,
    applied_tx: broadcast::Sender<AppliedEvent>,
}

impl BusInner {
    async fn apply(&self, event: InvalidationEvent, source: EventSource) -> EventOutcome {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        if source == EventSource::Remote {
            self.counters.remote_received.fetch_add(1, Ordering::Relaxed);
        }

        if !self.replay.lock().claim(&event.event_id) {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(event_id = %event.event_id, "Dropping redelivered invalidation event");
            return EventOutcome::Duplicate;
        }

        let tenants = match self.target_tenants(&event) {
            Ok(tenants) => tenants,
            Err(reason) => {
                self.replay.lock().forget(&event.event_id);
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(event_id = %event.event_id, tenant = %event.tenant_id, reason = %reason, "Rejected invalidation event");
                return EventOutcome::Rejected { reason };
            }
        };

        let mut purged = 0;
        let mut failures = 0;
        for tenant in &tenants {
            // Hint first, so a fetch racing the purge reads the primary
            self.router
                .record_write(tenant.id(), event.tags.iter().map(String::as_str));

            for tag in &event.tags {
                for tier in [self.page.tier_store(), self.object.tier_store()] {
                    match self.purge_with_retry(tier, tenant, tag).await {
                        Ok(n) => purged += n,
                        Err(_) => failures += 1,
                    }
                }
            }
        }

        self.counters
            .purged_entries
            .fetch_add(purged as u64, Ordering::Relaxed);

        if failures > 0 {
            self.replay.lock().forget(&event.event_id);
            self.counters
                .partially_applied
                .fetch_add(1, Ordering::Relaxed);
            return EventOutcome::PartiallyApplied { purged, failures };
        }

        self.counters.applied.fetch_add(1, Ordering::Relaxed);
        debug!(
            event_id = %event.event_id,
            tenant = %event.tenant_id,
            tags = ?event.tags,
            purged,
            "Invalidation event applied"
        );
        // No subscribers is fine
        let _ = self.applied_tx.send(AppliedEvent { event, source });
        EventOutcome::Applied { purged }
    }

    fn target_tenants(&self, event: &InvalidationEvent) -> Result<Vec<TenantContext>, String> {
        if event.tags.is_empty() {
            return Err("event carries no tags".to_string());
        }
        if event.is_global() {
            return Ok(self.registry.tenants());
        }
        TenantContext::for_tenant(&event.tenant_id)
            .map(|tenant| vec![tenant])
            .map_err(|e| e.to_string())
    }

    async fn purge_with_retry(
        &self,
        tier: &Arc<TierStore>,
        tenant: &TenantContext,
        tag: &str,
    ) -> Result<usize, StoreError> {
        let mut backoff = Duration::from_millis(self.config.purge_backoff_ms);
        let mut attempt = 0;
        loop {
            match tier.purge_by_tag(tenant, tag).await {
                Ok(purged) => return Ok(purged),
                Err(e) if attempt < self.config.max_purge_retries => {
                    attempt += 1;
                    self.counters.purge_retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        tier = tier.tier().as_str(),
                        tenant = %tenant.id(),
                        tag = %tag,
                        attempt,
                        error = %e,
                        "Purge failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => {
                    self.counters.purge_failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        tier = tier.tier().as_str(),
                        tenant = %tenant.id(),
                        tag = %tag,
                        attempts = attempt + 1,
                        error = %e,
                        "Purge abandoned; entries expire by TTL"
                    );
                    return Err(e);
                }
            }
        }
    }
}

type Queued = (InvalidationEvent, Option<oneshot::Sender<EventOutcome>>);

/// Event intake and consumer for both tiers
pub struct InvalidationBus {
    inner: Arc<BusInner>,
    queue: mpsc::Sender<Queued>,
    shutdown_tx: broadcast::Sender<()>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl InvalidationBus {
    /// Create the bus and spawn its consumer task
    #[must_use]
    pub fn start(
        page: PageCacheStore,
        object: ObjectCacheStore,
        registry: Arc<TenantRegistry>,
        router: Arc<ReplicaRouter>,
        config: InvalidationConfig,
    ) -> Self {
        let (queue, rx) = mpsc::channel(config.queue_depth.max(1));
        let (applied_tx, _) = broadcast::channel(config.queue_depth.max(1));
        let (shutdown_tx, _) = broadcast::channel(1);

        let inner = Arc::new(BusInner {
            page,
            object,
            registry,
            router,
            replay: Mutex::new(ReplayLog::new(
                config.replay_window(),
                config.replay_capacity,
            )),
            config,
            counters: Counters::default(),
            applied_tx,
        });

        let consumer = Self::spawn_consumer(Arc::clone(&inner), rx, shutdown_tx.subscribe());
        info!("Invalidation bus started");

        Self {
            inner,
            queue,
            shutdown_tx,
            consumer: Mutex::new(Some(consumer)),
        }
    }

    fn spawn_consumer(
        inner: Arc<BusInner>,
        mut rx: mpsc::Receiver<Queued>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    item = rx.recv() => {
                        let Some((event, ack)) = item else {
                            break;
                        };
                        let outcome = inner.apply(event, EventSource::Local).await;
                        if let Some(ack) = ack {
                            let _ = ack.send(outcome);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Invalidation consumer shutting down...");
                        break;
                    }
                }
            }
        })
    }

    /// Queue an event for the consumer. Returns once queued.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidationDeliveryFailed`] if the consumer
    /// has stopped.
    pub async fn publish(&self, event: InvalidationEvent) -> Result<(), CacheError> {
        self.queue
            .send((event, None))
            .await
            .map_err(|_| CacheError::InvalidationDeliveryFailed("consumer stopped".into()))
    }

    /// Queue an event and wait until it has been processed
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidationDeliveryFailed`] if the consumer
    /// stopped before acknowledging.
    pub async fn publish_confirmed(
        &self,
        event: InvalidationEvent,
    ) -> Result<EventOutcome, CacheError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.queue
            .send((event, Some(ack_tx)))
            .await
            .map_err(|_| CacheError::InvalidationDeliveryFailed("consumer stopped".into()))?;
        ack_rx.await.map_err(|_| {
            CacheError::InvalidationDeliveryFailed("event dropped before acknowledgement".into())
        })
    }

    /// Apply an event inline, bypassing the queue
    pub async fn apply(&self, event: InvalidationEvent) -> EventOutcome {
        self.inner.apply(event, EventSource::Local).await
    }

    /// Apply an event received from another instance
    pub async fn apply_remote(&self, event: InvalidationEvent) -> EventOutcome {
        self.inner.apply(event, EventSource::Remote).await
    }

    /// Stream of applied events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AppliedEvent> {
        self.inner.applied_tx.subscribe()
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.inner.config.channel
    }

    #[must_use]
    pub fn stats(&self) -> InvalidationStats {
        let c = &self.inner.counters;
        InvalidationStats {
            received: c.received.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            applied: c.applied.load(Ordering::Relaxed),
            partially_applied: c.partially_applied.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            purged_entries: c.purged_entries.load(Ordering::Relaxed),
            purge_retries: c.purge_retries.load(Ordering::Relaxed),
            purge_failures: c.purge_failures.load(Ordering::Relaxed),
            remote_received: c.remote_received.load(Ordering::Relaxed),
            remote_published: c.remote_published.load(Ordering::Relaxed),
            transport_errors: c.transport_errors.load(Ordering::Relaxed),
            replay_log_len: self.inner.replay.lock().len(),
        }
    }

    #[cfg(feature = "redis")]
    fn record_remote_publish(&self, ok: bool) {
        let counter = if ok {
            &self.inner.counters.remote_published
        } else {
            &self.inner.counters.transport_errors
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Stop the consumer task. Queued events not yet taken are dropped.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.consumer.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for InvalidationBus {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(feature = "redis")]
pub use redis_transport::RedisInvalidationTransport;

#[cfg(feature = "redis")]
mod redis_transport {
    use super::{AppliedEvent, EventSource, InvalidationBus, InvalidationEvent};

    use std::sync::Arc;
    use std::time::Duration;

    use anyhow::{Context, Result};
    use futures_util::StreamExt;
    use redis::AsyncCommands;
    use redis::aio::ConnectionManager;
    use tokio::sync::broadcast;
    use tokio::task::JoinHandle;
    use tracing::{error, info, warn};

    /// Carries events between instances over Redis pub/sub.
    ///
    /// Locally applied events are published as JSON on the channel; events
    /// received on the channel are applied as remote, and never published
    /// again. Self-delivery is absorbed by the replay log.
    pub struct RedisInvalidationTransport {
        client: redis::Client,
        publisher: ConnectionManager,
        channel: String,
        shutdown_tx: broadcast::Sender<()>,
    }

    impl RedisInvalidationTransport {
        /// # Errors
        ///
        /// Returns an error if the Redis client cannot connect.
        pub async fn connect(redis_url: &str, channel: impl Into<String>) -> Result<Self> {
            let client = redis::Client::open(redis_url)
                .context("Failed to create Redis client for invalidation transport")?;
            let publisher = ConnectionManager::new(client.clone())
                .await
                .context("Failed to establish Redis publisher connection")?;
            let (shutdown_tx, _) = broadcast::channel(1);
            Ok(Self {
                client,
                publisher,
                channel: channel.into(),
                shutdown_tx,
            })
        }

        /// Publish one event on the channel
        ///
        /// # Errors
        ///
        /// Returns an error if serialization or the publish fails.
        pub async fn publish(&self, event: &InvalidationEvent) -> Result<()> {
            let json = event.to_json()?;
            let mut conn = self.publisher.clone();
            let _: () = conn
                .publish(&self.channel, &json)
                .await
                .context("Failed to publish invalidation event")?;
            Ok(())
        }

        /// Bridge `bus` to the channel in both directions
        pub fn start(&self, bus: Arc<InvalidationBus>) -> Vec<JoinHandle<()>> {
            vec![self.spawn_outbound(Arc::clone(&bus)), self.spawn_inbound(bus)]
        }

        fn spawn_outbound(&self, bus: Arc<InvalidationBus>) -> JoinHandle<()> {
            let mut applied = bus.subscribe();
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            let publisher = self.publisher.clone();
            let channel = self.channel.clone();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        received = applied.recv() => match received {
                            Ok(AppliedEvent { event, source: EventSource::Local }) => {
                                let ok = match event.to_json() {
                                    Ok(json) => {
                                        let mut conn = publisher.clone();
                                        let sent: redis::RedisResult<()> = conn.publish(&channel, &json).await;
                                        sent.inspect_err(|e| warn!(event_id = %event.event_id, error = %e, "Failed to publish invalidation event")).is_ok()
                                    }
                                    Err(e) => {
                                        warn!(error = %e, "Failed to encode invalidation event");
                                        false
                                    }
                                };
                                bus.record_remote_publish(ok);
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "Outbound invalidation bridge lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                        _ = shutdown_rx.recv() => break,
                    }
                }
            })
        }

        fn spawn_inbound(&self, bus: Arc<InvalidationBus>) -> JoinHandle<()> {
            let client = self.client.clone();
            let channel = self.channel.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            tokio::spawn(async move {
                loop {
                    match Self::run_subscriber_loop(&client, &channel, &bus, &mut shutdown_rx).await {
                        Ok(()) => {
                            info!("Invalidation subscriber loop completed normally");
                            break;
                        }
                        Err(e) => {
                            error!(error = %e, "Invalidation subscriber error. Reconnecting in 5s...");
                            bus.record_remote_publish(false);
                            tokio::select! {
                                () = tokio::time::sleep(Duration::from_secs(5)) => {},
                                _ = shutdown_rx.recv() => break,
                            }
                        }
                    }
                }
            })
        }

        async fn run_subscriber_loop(
            client: &redis::Client,
            channel: &str,
            bus: &InvalidationBus,
            shutdown_rx: &mut broadcast::Receiver<()>,
        ) -> Result<()> {
            let mut pubsub = client
                .get_async_pubsub()
                .await
                .context("Failed to get pubsub connection")?;
            pubsub
                .subscribe(channel)
                .await
                .context("Failed to subscribe to channel")?;
            info!(channel = %channel, "Subscribed to invalidation channel");

            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    msg = stream.next() => {
                        let Some(msg) = msg else {
                            return Err(anyhow::anyhow!("Pub/Sub message stream ended"));
                        };
                        let payload: String = match msg.get_payload() {
                            Ok(payload) => payload,
                            Err(e) => {
                                warn!(error = %e, "Failed to get message payload");
                                continue;
                            }
                        };
                        match InvalidationEvent::from_json(&payload) {
                            Ok(event) => {
                                bus.apply_remote(event).await;
                            }
                            Err(e) => warn!(error = %e, "Ignoring malformed invalidation event"),
                        }
                    }
                    _ = shutdown_rx.recv() => return Ok(()),
                }
            }
        }

        pub fn shutdown(&self) {
            let _ = self.shutdown_tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{FlakyStore, MemoryStore};
    use crate::config::{ObjectStoreConfig, PageStoreConfig, ReplicaConfig};
    use crate::entry::Ttl;
    use crate::keys::CacheKey;
    use crate::tenant::TenantRecord;
    use bytes::Bytes;
    use std::collections::BTreeSet;

    struct Fixture {
        bus: InvalidationBus,
        page: PageCacheStore,
        object: ObjectCacheStore,
        flaky: Arc<FlakyStore>,
        router: Arc<ReplicaRouter>,
    }

    fn fixture(max_purge_retries: u32) -> Fixture {
        let timeout = Duration::from_secs(1);
        let page = PageCacheStore::in_memory(&PageStoreConfig::default(), timeout);
        let flaky = Arc::new(FlakyStore::new(Arc::new(MemoryStore::new(
            "object",
            1 << 20,
            Duration::from_secs(30),
        ))));
        let object = ObjectCacheStore::new(flaky.clone(), &ObjectStoreConfig::default(), timeout);
        let registry = Arc::new(
            TenantRegistry::new(
                vec![TenantRecord::new("acme"), TenantRecord::new("globex")],
                1,
                Duration::from_secs(30),
            )
            .unwrap(),
        );
        let router = Arc::new(ReplicaRouter::new(&ReplicaConfig {
            replicas: vec!["r1".into()],
            ..ReplicaConfig::default()
        }));
        let bus = InvalidationBus::start(
            page.clone(),
            object.clone(),
            registry,
            Arc::clone(&router),
            InvalidationConfig {
                max_purge_retries,
                purge_backoff_ms: 1,
                ..InvalidationConfig::default()
            },
        );
        Fixture {
            bus,
            page,
            object,
            flaky,
            router,
        }
    }

    fn tagged(tag: &str) -> BTreeSet<String> {
        BTreeSet::from([tag.to_string()])
    }

    #[test]
    fn test_replay_log_bounds() {
        let mut log = ReplayLog::new(Duration::from_secs(60), 2);
        assert!(log.claim("a"));
        assert!(!log.claim("a"));
        assert!(log.claim("b"));
        assert!(log.claim("c"));
        // Capacity 2: oldest id falls out
        assert!(!log.contains("a"));
        assert_eq!(log.len(), 2);

        log.forget("c");
        assert!(log.claim("c"));
    }

    #[test]
    fn test_event_json_shape() {
        let event = InvalidationEvent::with_id("evt-1", "acme", ["product:42"]);
        let parsed = InvalidationEvent::from_json(&event.to_json().unwrap()).unwrap();
        assert_eq!(parsed, event);
    }

    #[tokio::test]
    async fn test_event_purges_both_tiers_and_is_idempotent() {
        let f = fixture(2);
        let page_key = CacheKey::parse("acme:page:/product/42:desktop-en").unwrap();
        let obj_key = CacheKey::parse("acme:obj:product-42").unwrap();
        f.page
            .put(&page_key, Bytes::from_static(b"p"), Ttl::Never, tagged("product:42"))
            .await
            .unwrap();
        f.object
            .put(&obj_key, Bytes::from_static(b"o"), None, tagged("product:42"))
            .await
            .unwrap();

        let event = InvalidationEvent::new("acme", ["product:42"]);
        let first = f.bus.publish_confirmed(event.clone()).await.unwrap();
        assert_eq!(first, EventOutcome::Applied { purged: 2 });
        assert!(f.page.get(&page_key).await.is_miss());
        assert!(f.object.get(&obj_key).await.is_miss());

        let second = f.bus.publish_confirmed(event).await.unwrap();
        assert_eq!(second, EventOutcome::Duplicate);
        assert_eq!(f.bus.stats().duplicates, 1);

        // The write pinned the tenant's reads to the primary
        assert!(f.router.route("acme", &[]).is_primary());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let f = fixture(3);
        let obj_key = CacheKey::parse("acme:obj:nav").unwrap();
        f.object
            .put(&obj_key, Bytes::from_static(b"n"), None, tagged("nav"))
            .await
            .unwrap();

        f.flaky.fail_next_purges(2);
        let outcome = f.bus.apply(InvalidationEvent::new("acme", ["nav"])).await;
        assert_eq!(outcome, EventOutcome::Applied { purged: 1 });
        assert_eq!(f.bus.stats().purge_retries, 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_leave_event_replayable() {
        let f = fixture(1);
        f.flaky.fail_next_purges(10);
        let event = InvalidationEvent::new("acme", ["nav"]);
        let outcome = f.bus.apply(event.clone()).await;
        assert_eq!(
            outcome,
            EventOutcome::PartiallyApplied {
                purged: 0,
                failures: 1
            }
        );
        assert_eq!(f.bus.stats().purge_failures, 1);

        f.flaky.fail_next_purges(0);
        assert_eq!(f.bus.apply(event).await, EventOutcome::Applied { purged: 0 });
    }

    #[tokio::test]
    async fn test_global_event_fans_out_to_every_tenant() {
        let f = fixture(0);
        for ns in ["acme", "globex"] {
            let key = CacheKey::parse(&format!("{ns}:obj:nav")).unwrap();
            f.object
                .put(&key, Bytes::from_static(b"n"), None, tagged("nav"))
                .await
                .unwrap();
        }
        let outcome = f.bus.apply(InvalidationEvent::new(ALL_TENANTS, ["nav"])).await;
        assert_eq!(outcome, EventOutcome::Applied { purged: 2 });
    }

    #[tokio::test]
    async fn test_subscribers_see_applied_events() {
        let f = fixture(0);
        let mut rx = f.bus.subscribe();
        f.bus.publish(InvalidationEvent::with_id("evt-9", "acme", ["nav"])).await.unwrap();
        let applied = rx.recv().await.unwrap();
        assert_eq!(applied.event.event_id, "evt-9");
        assert_eq!(applied.source, EventSource::Local);
    }

    #[tokio::test]
    async fn test_rejects_malformed_events() {
        let f = fixture(0);
        let no_tags = InvalidationEvent::new("acme", Vec::<String>::new());
        assert!(matches!(f.bus.apply(no_tags).await, EventOutcome::Rejected { .. }));
        let bad_tenant = InvalidationEvent::new("ac me", ["nav"]);
        assert!(matches!(f.bus.apply(bad_tenant).await, EventOutcome::Rejected { .. }));
        assert_eq!(f.bus.stats().rejected, 2);
    }
}
