//! Multi-Tenant Cache
//!
//! A page and object cache that sits in front of a multi-tenant content
//! platform and its database:
//! - **Page Tier**: fully rendered responses, keyed by tenant, route and
//!   the configured variation axes
//! - **Object Tier**: finer-grained query fragments with shorter TTLs,
//!   in-process or shared through Redis
//! - **Tenant Isolation**: every key lives in its tenant's namespace; no
//!   operation reads or purges across namespaces
//! - **Tag Invalidation**: content mutations purge by tag across both tiers,
//!   idempotently, with bounded retries
//! - **Stampede Protection**: one origin fetch per key via fetch leases,
//!   with stale-while-revalidate for followers
//! - **Replica Routing**: read-your-writes hints steer fragment queries to
//!   the primary after a mutation
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use multi_tenant_cache::{CacheConfig, CacheSystem, PageRequest, Variation};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = CacheSystem::from_config(CacheConfig::load("cache.toml")?).await?;
//!
//!     let response = cache
//!         .service()
//!         .handle(PageRequest::new("acme.example.com", "/products/42", Variation::new("mobile", "en-US")))
//!         .await?;
//!     tracing::info!(status = ?response.status, "Served");
//!
//!     // A product changed: drop every page and fragment tagged with it
//!     cache.service().notify_mutation("acme", ["product:42"]).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! Request → Tenant Registry → Page Tier → (miss) Stampede Guard → Content Platform
//!                                                                   ↓ fragments
//!                             Object Tier → (miss) Stampede Guard → Replica Router → DB
//!
//! Mutation → Invalidation Bus → purge tag (page + object) → broadcast / Redis pub/sub
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

pub mod admin;
pub mod backends;
pub mod builder;
pub mod config;
pub mod entry;
pub mod error;
pub mod invalidation;
pub mod keys;
pub mod protocol;
pub mod replica;
pub mod server;
pub mod service;
pub mod snapshot;
pub mod stampede;
pub mod stores;
pub mod tenant;
pub mod traits;

pub use admin::{AdminClient, CacheStats};
pub use backends::{FlakyStore, MemoryLeaseStore, MemoryStore};
#[cfg(feature = "redis")]
pub use backends::{RedisLeaseStore, RedisStore};
pub use builder::CacheSystemBuilder;
pub use config::CacheConfig;
pub use entry::{CacheEntry, Lookup, Ttl};
pub use error::{CacheError, OriginError, StoreError};
pub use invalidation::{
    AppliedEvent, EventOutcome, EventSource, InvalidationBus, InvalidationEvent,
    InvalidationStats, ReplayLog,
};
#[cfg(feature = "redis")]
pub use invalidation::RedisInvalidationTransport;
pub use keys::{CacheKey, CacheKeyBuilder, RouteClass, Tier, Variation};
pub use replica::{ReadTarget, ReplicaRouter};
pub use server::CacheServer;
pub use service::{CacheService, CacheStatus, FragmentLoader, PageRequest, PageResponse};
pub use snapshot::{Snapshot, SnapshotLoadReport};
pub use stampede::{StampedeGuard, StampedeStats};
pub use stores::{ObjectCacheStore, PageCacheStore, StoreStats, TierStore};
pub use tenant::{RequestIdentity, TenantContext, TenantRecord, TenantRegistry};
pub use traits::{
    ContentPlatform, DataSource, EntryStore, FragmentQuery, LeaseStore, PutOutcome,
    RenderRequest, Rendered,
};

// Re-export async_trait for implementors of the origin traits
pub use async_trait::async_trait;

/// Main entry point: a built cache plus the configuration it came from
///
/// # Example
///
/// ```rust,no_run
/// use multi_tenant_cache::{CacheConfig, CacheSystem};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let cache = CacheSystem::from_config(CacheConfig::default()).await?;
///     let stats = cache.service().stats().await;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct CacheSystem {
    pub(crate) service: Arc<CacheService>,
    pub(crate) config: Arc<CacheConfig>,
    #[cfg(feature = "redis")]
    pub(crate) transport: Option<Arc<RedisInvalidationTransport>>,
}

impl CacheSystem {
    /// Build with default stores and no origin attached
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or Redis is
    /// configured but unreachable.
    pub async fn from_config(config: CacheConfig) -> Result<Self> {
        info!("Initializing multi-tenant cache system...");
        CacheSystemBuilder::new(config).build().await
    }

    #[must_use]
    pub fn service(&self) -> &Arc<CacheService> {
        &self.service
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Serve the line protocol on the configured address until Ctrl+C.
    /// Restores the configured snapshot first and writes it on exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener cannot be bound.
    pub async fn serve(&self) -> Result<()> {
        if let Err(e) = self.load_snapshot().await {
            warn!(error = %e, "Snapshot restore failed, starting cold");
        }

        let addr = self.config.server.listen_addr.clone();
        CacheServer::new(Arc::clone(&self.service))
            .run(&addr)
            .await
            .with_context(|| format!("Cache server on {addr} failed"))?;

        if let Err(e) = self.save_snapshot().await {
            warn!(error = %e, "Snapshot write failed");
        }
        self.shutdown();
        Ok(())
    }

    /// Restore the configured snapshot, if any
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot exists but cannot be read.
    pub async fn load_snapshot(&self) -> Result<Option<SnapshotLoadReport>> {
        let Some(path) = self.config.snapshot.path.as_deref() else {
            return Ok(None);
        };
        if !std::path::Path::new(path).exists() {
            info!(path = %path, "No snapshot found, starting cold");
            return Ok(None);
        }
        let snapshot = Snapshot::read_from(path)?;
        let report = snapshot
            .restore(&self.service, self.config.longest_ttl())
            .await?;
        Ok(Some(report))
    }

    /// Write the configured snapshot, if any
    ///
    /// # Errors
    ///
    /// Returns an error if the stores cannot be read or the file written.
    pub async fn save_snapshot(&self) -> Result<bool> {
        let Some(path) = self.config.snapshot.path.as_deref() else {
            return Ok(false);
        };
        Snapshot::capture(&self.service).await?.write_to(path)?;
        Ok(true)
    }

    /// Stop background tasks
    pub fn shutdown(&self) {
        #[cfg(feature = "redis")]
        if let Some(transport) = &self.transport {
            transport.shutdown();
        }
        self.service.bus().shutdown();
        info!("Multi-tenant cache system shut down");
    }
}
