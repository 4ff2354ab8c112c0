//! Cache System Builder
//!
//! Wires configuration, stores, the stampede guard, the replica router and
//! the invalidation bus into a [`CacheSystem`].
//!
//! # Example: In-Process Stores
//!
//! ```rust,no_run
//! use multi_tenant_cache::{CacheConfig, CacheSystemBuilder};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = CacheSystemBuilder::new(CacheConfig::default())
//!         .build()
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! # Example: Attaching the Origin
//!
//! ```rust,ignore
//! use multi_tenant_cache::CacheSystemBuilder;
//! use std::sync::Arc;
//!
//! let cache = CacheSystemBuilder::new(config)
//!     .with_platform(Arc::new(MyPlatform::new()))
//!     .with_data_source(Arc::new(MyDatabase::new()))
//!     .build()
//!     .await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::CacheSystem;
use crate::config::CacheConfig;
use crate::invalidation::InvalidationBus;
use crate::keys::CacheKeyBuilder;
use crate::replica::ReplicaRouter;
use crate::service::{CacheService, NoOrigin};
use crate::stampede::StampedeGuard;
use crate::stores::{ObjectCacheStore, PageCacheStore};
use crate::tenant::TenantRegistry;
use crate::traits::{ContentPlatform, DataSource, EntryStore, LeaseStore};

/// Per-operation timeout for store calls
const STORE_OP_TIMEOUT: Duration = Duration::from_millis(500);

/// Builder for [`CacheSystem`]
///
/// # Default Behavior
///
/// Without overrides, the builder uses:
/// - **Page tier**: in-process `MemoryStore`
/// - **Object tier**: `RedisStore` when a Redis URL is configured (and the
///   `redis` feature is on), otherwise `MemoryStore`
/// - **Leases**: `RedisLeaseStore` alongside a Redis object tier, otherwise
///   in-process leases
/// - **Origin**: [`NoOrigin`], which serves cached content only
pub struct CacheSystemBuilder {
    config: CacheConfig,
    platform: Option<Arc<dyn ContentPlatform>>,
    source: Option<Arc<dyn DataSource>>,
    page_backend: Option<Arc<dyn EntryStore>>,
    object_backend: Option<Arc<dyn EntryStore>>,
    lease_store: Option<Arc<dyn LeaseStore>>,
    local_only: bool,
}

impl CacheSystemBuilder {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            platform: None,
            source: None,
            page_backend: None,
            object_backend: None,
            lease_store: None,
            local_only: false,
        }
    }

    /// Attach the content platform that renders pages on a miss
    #[must_use]
    pub fn with_platform(mut self, platform: Arc<dyn ContentPlatform>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Attach the data source that answers fragment queries
    #[must_use]
    pub fn with_data_source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Configure a custom page tier backend
    #[must_use]
    pub fn with_page_backend(mut self, backend: Arc<dyn EntryStore>) -> Self {
        self.page_backend = Some(backend);
        self
    }

    /// Configure a custom object tier backend
    #[must_use]
    pub fn with_object_backend(mut self, backend: Arc<dyn EntryStore>) -> Self {
        self.object_backend = Some(backend);
        self
    }

    /// Configure a custom fetch lease store
    #[must_use]
    pub fn with_lease_store(mut self, leases: Arc<dyn LeaseStore>) -> Self {
        self.lease_store = Some(leases);
        self
    }

    /// Ignore any configured Redis URL: in-process stores, leases and no
    /// cross-instance transport
    #[must_use]
    pub fn local_only(mut self) -> Self {
        self.local_only = true;
        self
    }

    /// Build the cache system
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the tenant table
    /// is malformed, or a configured Redis instance is unreachable.
    pub async fn build(self) -> Result<CacheSystem> {
        let Self {
            config,
            platform,
            source,
            page_backend,
            object_backend,
            mut lease_store,
            local_only,
        } = self;
        config.validate()?;
        info!("Building multi-tenant cache system...");

        let registry = Arc::new(
            TenantRegistry::from_config(&config.tenants).context("Failed to load tenant table")?,
        );
        let keys = Arc::new(CacheKeyBuilder::new(
            config.variation.clone(),
            &config.page,
            config.namespace_salt.clone(),
        ));

        let page = match page_backend {
            Some(backend) => PageCacheStore::new(backend, &config.page, STORE_OP_TIMEOUT),
            None => PageCacheStore::in_memory(&config.page, STORE_OP_TIMEOUT),
        };

        let object_backend = match object_backend {
            Some(backend) => Some(backend),
            None if local_only => None,
            None => Self::redis_object_tier(&config, &mut lease_store).await?,
        };
        let object = match object_backend {
            Some(backend) => ObjectCacheStore::new(backend, &config.object, STORE_OP_TIMEOUT),
            None => ObjectCacheStore::in_memory(&config.object, STORE_OP_TIMEOUT),
        };

        let guard = match lease_store {
            Some(leases) => StampedeGuard::new(leases, config.stampede.clone()),
            None => StampedeGuard::in_memory(config.stampede.clone()),
        };
        let router = Arc::new(ReplicaRouter::new(&config.replica));
        let bus = Arc::new(InvalidationBus::start(
            page.clone(),
            object.clone(),
            Arc::clone(&registry),
            Arc::clone(&router),
            config.invalidation.clone(),
        ));

        let service = Arc::new(CacheService {
            registry,
            keys,
            page,
            object,
            guard,
            router,
            bus,
            platform: platform.unwrap_or_else(|| Arc::new(NoOrigin) as Arc<dyn ContentPlatform>),
            source: source.unwrap_or_else(|| Arc::new(NoOrigin) as Arc<dyn DataSource>),
            request_timeout: config.server.request_timeout(),
        });

        #[cfg(feature = "redis")]
        let transport = if local_only {
            None
        } else {
            Self::start_transport(&config, &service).await?
        };

        info!(
            tenants = service.registry().tenants().len(),
            page_backend = service.page_store().tier_store().backend().name(),
            object_backend = service.object_store().tier_store().backend().name(),
            "Multi-tenant cache system built successfully"
        );

        Ok(CacheSystem {
            service,
            config: Arc::new(config),
            #[cfg(feature = "redis")]
            transport,
        })
    }

    #[cfg(feature = "redis")]
    async fn redis_object_tier(
        config: &CacheConfig,
        lease_store: &mut Option<Arc<dyn LeaseStore>>,
    ) -> Result<Option<Arc<dyn EntryStore>>> {
        use crate::backends::{RedisLeaseStore, RedisStore};

        let Some(url) = config.resolved_redis_url() else {
            return Ok(None);
        };
        let store = RedisStore::with_url(
            &url,
            config.object.memory_ceiling_bytes,
            config.object.stale_retention(),
        )
        .await?;
        if lease_store.is_none() {
            *lease_store = Some(Arc::new(RedisLeaseStore::with_url(&url).await?));
        }
        Ok(Some(Arc::new(store)))
    }

    #[cfg(not(feature = "redis"))]
    #[allow(clippy::unused_async)]
    async fn redis_object_tier(
        config: &CacheConfig,
        _lease_store: &mut Option<Arc<dyn LeaseStore>>,
    ) -> Result<Option<Arc<dyn EntryStore>>> {
        if config.resolved_redis_url().is_some() {
            tracing::warn!("Redis URL configured but the `redis` feature is disabled, using memory stores");
        }
        Ok(None)
    }

    #[cfg(feature = "redis")]
    async fn start_transport(
        config: &CacheConfig,
        service: &Arc<CacheService>,
    ) -> Result<Option<Arc<crate::invalidation::RedisInvalidationTransport>>> {
        use crate::invalidation::RedisInvalidationTransport;

        let Some(url) = config.resolved_redis_url() else {
            return Ok(None);
        };
        let transport =
            RedisInvalidationTransport::connect(&url, config.invalidation.channel.clone()).await?;
        let _handles = transport.start(Arc::clone(service.bus()));
        Ok(Some(Arc::new(transport)))
    }
}
