//! Replica routing
//!
//! Decides whether the origin read behind an object-tier miss goes to the
//! primary or to a read replica. Writes leave [`ReplicaHint`]s keyed by
//! tenant and by tag; while a relevant hint is younger than the staleness
//! window, reads go to the primary. The decision is advisory: the data
//! source may still reject a replica read as too stale.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{HintScope, ReplicaConfig};

pub use crate::config::ReplicaPolicy;

/// Where an origin read should go
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReadTarget {
    Primary,
    Replica(String),
}

impl ReadTarget {
    #[must_use]
    pub fn is_primary(&self) -> bool {
        matches!(self, Self::Primary)
    }
}

/// Last recorded write for a tenant or one of its tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaHint {
    pub written_at: Instant,
}

impl ReplicaHint {
    #[must_use]
    pub fn is_live(&self, window: Duration) -> bool {
        self.written_at.elapsed() < window
    }
}

#[derive(Debug)]
struct ReplicaState {
    id: String,
    healthy: AtomicBool,
    in_flight: AtomicUsize,
}

/// In-flight read on a target; releases its load slot on drop
#[derive(Debug)]
pub struct ReadPermit {
    target: ReadTarget,
    replica: Option<Arc<ReplicaState>>,
}

impl ReadPermit {
    #[must_use]
    pub fn target(&self) -> &ReadTarget {
        &self.target
    }
}

impl Drop for ReadPermit {
    fn drop(&mut self) {
        if let Some(replica) = &self.replica {
            replica.in_flight.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    pub primary_reads: u64,
    pub replica_reads: u64,
    /// Reads sent to the primary because a write hint was live
    pub hinted_reads: u64,
    /// Reads sent to the primary because no replica was healthy
    pub fallbacks: u64,
    /// Replica reads the data source rejected as too stale
    pub stale_rejections: u64,
    pub healthy_replicas: usize,
}

pub struct ReplicaRouter {
    window: Duration,
    policy: ReplicaPolicy,
    scope: HintScope,
    tenant_hints: DashMap<String, ReplicaHint>,
    tag_hints: DashMap<(String, String), ReplicaHint>,
    replicas: Vec<Arc<ReplicaState>>,
    cursor: AtomicUsize,
    primary_reads: AtomicU64,
    replica_reads: AtomicU64,
    hinted_reads: AtomicU64,
    fallbacks: AtomicU64,
    stale_rejections: AtomicU64,
}

impl ReplicaRouter {
    #[must_use]
    pub fn new(config: &ReplicaConfig) -> Self {
        info!(
            replicas = config.replicas.len(),
            policy = ?config.policy,
            window_secs = config.staleness_window_secs,
            "Initializing replica router"
        );
        Self {
            window: config.staleness_window(),
            policy: config.policy,
            scope: config.hint_scope,
            tenant_hints: DashMap::new(),
            tag_hints: DashMap::new(),
            replicas: config
                .replicas
                .iter()
                .map(|id| {
                    Arc::new(ReplicaState {
                        id: id.clone(),
                        healthy: AtomicBool::new(true),
                        in_flight: AtomicUsize::new(0),
                    })
                })
                .collect(),
            cursor: AtomicUsize::new(0),
            primary_reads: AtomicU64::new(0),
            replica_reads: AtomicU64::new(0),
            hinted_reads: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            stale_rejections: AtomicU64::new(0),
        }
    }

    /// Record a write for `tenant` touching `tags`
    pub fn record_write<'a>(&self, tenant: &str, tags: impl IntoIterator<Item = &'a str>) {
        let hint = ReplicaHint {
            written_at: Instant::now(),
        };
        self.tenant_hints.insert(tenant.to_string(), hint);
        for tag in tags {
            self.tag_hints
                .insert((tenant.to_string(), tag.to_string()), hint);
        }
    }

    /// Most recent live hint relevant to a read of `tags` for `tenant`
    #[must_use]
    pub fn hint(&self, tenant: &str, tags: &[&str]) -> Option<ReplicaHint> {
        let tenant_hint = || self.live(&self.tenant_hints, &tenant.to_string());
        match self.scope {
            HintScope::Tenant => tenant_hint(),
            HintScope::Tag if tags.is_empty() => tenant_hint(),
            HintScope::Tag => tags
                .iter()
                .filter_map(|tag| self.live(&self.tag_hints, &(tenant.to_string(), (*tag).to_string())))
                .max_by_key(|hint| hint.written_at),
        }
    }

    fn live<K>(&self, hints: &DashMap<K, ReplicaHint>, key: &K) -> Option<ReplicaHint>
    where
        K: std::hash::Hash + Eq,
    {
        let hint = hints.get(key).map(|hint| *hint)?;
        if hint.is_live(self.window) {
            Some(hint)
        } else {
            hints.remove_if(key, |_, current| !current.is_live(self.window));
            None
        }
    }

    /// Choose the target for a read
    pub fn route(&self, tenant: &str, tags: &[&str]) -> ReadTarget {
        if self.replicas.is_empty() {
            self.primary_reads.fetch_add(1, Ordering::Relaxed);
            return ReadTarget::Primary;
        }
        if self.hint(tenant, tags).is_some() {
            self.hinted_reads.fetch_add(1, Ordering::Relaxed);
            self.primary_reads.fetch_add(1, Ordering::Relaxed);
            debug!(tenant = %tenant, "Recent write, routing read to primary");
            return ReadTarget::Primary;
        }

        let healthy: Vec<&Arc<ReplicaState>> = self
            .replicas
            .iter()
            .filter(|replica| replica.healthy.load(Ordering::Relaxed))
            .collect();

        let chosen = match self.policy {
            ReplicaPolicy::RoundRobin => {
                let n = healthy.len();
                (n > 0)
                    .then(|| healthy.get(self.cursor.fetch_add(1, Ordering::Relaxed) % n))
                    .flatten()
            }
            ReplicaPolicy::LeastLoaded => healthy
                .iter()
                .min_by_key(|replica| replica.in_flight.load(Ordering::Relaxed)),
        };

        if let Some(replica) = chosen {
            self.replica_reads.fetch_add(1, Ordering::Relaxed);
            ReadTarget::Replica(replica.id.clone())
        } else {
            self.fallbacks.fetch_add(1, Ordering::Relaxed);
            self.primary_reads.fetch_add(1, Ordering::Relaxed);
            warn!(tenant = %tenant, "No healthy replica, falling back to primary");
            ReadTarget::Primary
        }
    }

    /// Take a load slot on `target` for the duration of the read
    #[must_use]
    pub fn begin(&self, target: ReadTarget) -> ReadPermit {
        let replica = match &target {
            ReadTarget::Replica(id) => self.replicas.iter().find(|r| &r.id == id).cloned(),
            ReadTarget::Primary => None,
        };
        if let Some(replica) = &replica {
            replica.in_flight.fetch_add(1, Ordering::Relaxed);
        }
        ReadPermit { target, replica }
    }

    /// The data source refused a replica read; the caller retries on primary
    pub fn record_stale_rejection(&self, replica: &str) {
        self.stale_rejections.fetch_add(1, Ordering::Relaxed);
        self.primary_reads.fetch_add(1, Ordering::Relaxed);
        debug!(replica = %replica, "Replica read rejected as stale, retrying on primary");
    }

    pub fn mark_unavailable(&self, id: &str) -> bool {
        self.set_health(id, false)
    }

    pub fn mark_available(&self, id: &str) -> bool {
        self.set_health(id, true)
    }

    fn set_health(&self, id: &str, healthy: bool) -> bool {
        let Some(replica) = self.replicas.iter().find(|r| r.id == id) else {
            return false;
        };
        let previous = replica.healthy.swap(healthy, Ordering::Relaxed);
        if previous != healthy {
            info!(replica = %id, healthy, "Replica health changed");
        }
        true
    }

    /// Drop hints older than the staleness window
    pub fn prune_expired(&self) -> usize {
        let before = self.tenant_hints.len() + self.tag_hints.len();
        self.tenant_hints.retain(|_, hint| hint.is_live(self.window));
        self.tag_hints.retain(|_, hint| hint.is_live(self.window));
        before.saturating_sub(self.tenant_hints.len() + self.tag_hints.len())
    }

    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            primary_reads: self.primary_reads.load(Ordering::Relaxed),
            replica_reads: self.replica_reads.load(Ordering::Relaxed),
            hinted_reads: self.hinted_reads.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            stale_rejections: self.stale_rejections.load(Ordering::Relaxed),
            healthy_replicas: self
                .replicas
                .iter()
                .filter(|r| r.healthy.load(Ordering::Relaxed))
                .count(),
        }
    }
}
