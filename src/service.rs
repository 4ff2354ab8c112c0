//! Request pipeline
//!
//! `resolve tenant -> build key -> page lookup -> (miss) guarded render`.
//! During a render the platform pulls fragments through a
//! [`FragmentLoader`], which runs the same guarded lookup against the object
//! tier and sends misses to the replica router's chosen target. Tags of
//! every fragment a page used are added to the page entry, so a fragment
//! invalidation also drops the pages built from it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::admin::CacheStats;
use crate::entry::{Lookup, Ttl};
use crate::error::{CacheError, OriginError, StoreError};
use crate::invalidation::{EventOutcome, InvalidationBus, InvalidationEvent};
use crate::keys::{CacheKey, CacheKeyBuilder, Tier, Variation};
use crate::replica::{ReadTarget, ReplicaRouter};
use crate::stampede::{Populated, Served, StampedeGuard};
use crate::stores::{ObjectCacheStore, PageCacheStore};
use crate::tenant::{RequestIdentity, TenantContext, TenantRegistry};
use crate::traits::{
    ContentPlatform, DataSource, FragmentQuery, PutOutcome, RenderRequest, Rendered,
};

/// An inbound page request
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub identity: RequestIdentity,
    pub route: String,
    pub variation: Variation,
}

impl PageRequest {
    /// Request whose route doubles as the identity path
    pub fn new(host: impl Into<String>, route: impl Into<String>, variation: Variation) -> Self {
        let route = route.into();
        Self {
            identity: RequestIdentity::from_host(host, route.clone()),
            route,
            variation,
        }
    }
}

/// How the response was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    /// Served past TTL while a refresh runs
    Stale,
    /// Rendered and stored
    Miss,
    /// Tenant unresolved; caching skipped entirely
    Bypass,
    /// Route class or platform declared the response private
    Uncacheable,
}

impl CacheStatus {
    #[must_use]
    pub fn cache_control(&self) -> &'static str {
        match self {
            Self::Hit | Self::Stale | Self::Miss => "public",
            Self::Bypass => "no-store",
            Self::Uncacheable => "private, no-store",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PageResponse {
    pub payload: Bytes,
    pub status: CacheStatus,
    pub key: Option<CacheKey>,
    pub cache_control: &'static str,
}

impl PageResponse {
    fn new(payload: Bytes, status: CacheStatus, key: Option<CacheKey>) -> Self {
        Self {
            payload,
            status,
            key,
            cache_control: status.cache_control(),
        }
    }
}

/// Fragment access handed to the content platform for one render
#[derive(Clone)]
pub struct FragmentLoader {
    tenant: Option<TenantContext>,
    keys: Arc<CacheKeyBuilder>,
    object: ObjectCacheStore,
    guard: StampedeGuard,
    router: Arc<ReplicaRouter>,
    source: Arc<dyn DataSource>,
    collected_tags: Arc<Mutex<BTreeSet<String>>>,
}

impl FragmentLoader {
    fn for_request(service: &CacheService, tenant: Option<TenantContext>) -> Self {
        Self {
            tenant,
            keys: Arc::clone(&service.keys),
            object: service.object.clone(),
            guard: service.guard.clone(),
            router: Arc::clone(&service.router),
            source: Arc::clone(&service.source),
            collected_tags: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Load a fragment through the object tier
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::OriginFetchFailed`] when the data source fails.
    pub async fn load(&self, query: FragmentQuery) -> Result<Bytes, CacheError> {
        let Some(tenant) = self.tenant.clone() else {
            // Unresolved tenant: straight to the primary, nothing cached
            return Ok(self
                .source
                .query(&ReadTarget::Primary, None, &query)
                .await?);
        };

        let key = self.keys.object_key(&tenant, &query.name, &query.params);
        let fetch = {
            let router = Arc::clone(&self.router);
            let source = Arc::clone(&self.source);
            let default_ttl = self.object.default_ttl();
            let query = query.clone();
            move || async move {
                let payload = routed_query(&router, source.as_ref(), &tenant, &query).await?;
                Ok::<_, OriginError>(Populated {
                    payload,
                    ttl: Ttl::Expires(query.ttl.unwrap_or(default_ttl)),
                    tags: query.tags,
                    cacheable: true,
                })
            }
        };

        let served = self
            .guard
            .get_or_populate(self.object.tier_store(), &key, fetch)
            .await?;
        let tags = match &served {
            Served::Hit(entry) | Served::Stale(entry) => entry.tags.clone(),
            Served::Fetched(populated) => populated.tags.clone(),
        };
        self.collected_tags.lock().extend(tags);
        Ok(served.payload().clone())
    }

    /// Tags of every fragment loaded so far
    #[must_use]
    pub fn collected_tags(&self) -> BTreeSet<String> {
        self.collected_tags.lock().clone()
    }
}

/// Query the routed target, retrying on the primary when a replica refuses
async fn routed_query(
    router: &ReplicaRouter,
    source: &dyn DataSource,
    tenant: &TenantContext,
    query: &FragmentQuery,
) -> Result<Bytes, OriginError> {
    let tags: Vec<&str> = query.tags.iter().map(String::as_str).collect();
    let permit = router.begin(router.route(tenant.id(), &tags));
    match source.query(permit.target(), Some(tenant), query).await {
        Err(OriginError::ReplicaTooStale) => {
            let ReadTarget::Replica(replica) = permit.target() else {
                return Err(OriginError::ReplicaTooStale);
            };
            router.record_stale_rejection(replica);
            drop(permit);
            source.query(&ReadTarget::Primary, Some(tenant), query).await
        }
        other => other,
    }
}

/// Content platform and data source used when none is attached; every
/// miss fails with an origin error, so only cached content is served.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOrigin;

#[async_trait]
impl ContentPlatform for NoOrigin {
    async fn render(
        &self,
        request: &RenderRequest,
        _fragments: &FragmentLoader,
    ) -> Result<Rendered, OriginError> {
        Err(OriginError::Failed(anyhow::anyhow!(
            "no content platform attached to render `{}`",
            request.route
        )))
    }
}

#[async_trait]
impl DataSource for NoOrigin {
    async fn query(
        &self,
        _target: &ReadTarget,
        _tenant: Option<&TenantContext>,
        query: &FragmentQuery,
    ) -> Result<Bytes, OriginError> {
        Err(OriginError::Failed(anyhow::anyhow!(
            "no data source attached to answer `{}`",
            query.name
        )))
    }
}

/// The cache layer in front of one content platform
pub struct CacheService {
    pub(crate) registry: Arc<TenantRegistry>,
    pub(crate) keys: Arc<CacheKeyBuilder>,
    pub(crate) page: PageCacheStore,
    pub(crate) object: ObjectCacheStore,
    pub(crate) guard: StampedeGuard,
    pub(crate) router: Arc<ReplicaRouter>,
    pub(crate) bus: Arc<InvalidationBus>,
    pub(crate) platform: Arc<dyn ContentPlatform>,
    pub(crate) source: Arc<dyn DataSource>,
    pub(crate) request_timeout: Duration,
}

impl CacheService {
    /// Serve a page request
    ///
    /// # Errors
    ///
    /// Only origin failures escape: [`CacheError::OriginFetchFailed`]. Store
    /// outages degrade to misses and unresolved tenants bypass the cache.
    pub async fn handle(&self, request: PageRequest) -> Result<PageResponse, CacheError> {
        let tenant = match self.registry.resolve(&request.identity).await {
            Ok(tenant) => tenant,
            Err(CacheError::TenantUnresolved(identity)) => {
                debug!(identity = %identity, route = %request.route, "Bypassing cache for unresolved tenant");
                let rendered = self.render_uncached(None, &request).await?;
                return Ok(PageResponse::new(rendered.payload, CacheStatus::Bypass, None));
            }
            Err(e) => return Err(e),
        };

        let class = self.keys.classify(&request.route, &request.variation);
        let Some(class_ttl) = class.ttl() else {
            let rendered = self.render_uncached(Some(tenant), &request).await?;
            return Ok(PageResponse::new(rendered.payload, CacheStatus::Uncacheable, None));
        };

        let key = self
            .keys
            .page_key(&tenant, &request.route, &request.variation);
        let loader = FragmentLoader::for_request(self, Some(tenant.clone()));
        let render = RenderRequest {
            tenant: Some(tenant),
            route: request.route,
            variation: request.variation,
        };
        let platform = Arc::clone(&self.platform);
        let fetch = move || async move {
            let rendered = platform.render(&render, &loader).await?;
            let mut tags = rendered.tags;
            tags.extend(loader.collected_tags());
            Ok::<_, OriginError>(Populated {
                payload: rendered.payload,
                ttl: rendered.ttl.map_or(class_ttl, Ttl::Expires),
                tags,
                cacheable: rendered.cacheable,
            })
        };

        let served = self
            .guard
            .get_or_populate(self.page.tier_store(), &key, fetch)
            .await?;
        let status = match &served {
            Served::Hit(_) => CacheStatus::Hit,
            Served::Stale(_) => CacheStatus::Stale,
            Served::Fetched(populated) if populated.cacheable => CacheStatus::Miss,
            Served::Fetched(_) => CacheStatus::Uncacheable,
        };
        debug!(key = %key, status = ?status, "Page served");
        Ok(PageResponse::new(served.payload().clone(), status, Some(key)))
    }

    async fn render_uncached(
        &self,
        tenant: Option<TenantContext>,
        request: &PageRequest,
    ) -> Result<Rendered, CacheError> {
        let loader = FragmentLoader::for_request(self, tenant.clone());
        let render = RenderRequest {
            tenant,
            route: request.route.clone(),
            variation: request.variation.clone(),
        };
        match timeout(self.request_timeout, self.platform.render(&render, &loader)).await {
            Ok(rendered) => Ok(rendered?),
            Err(_) => Err(OriginError::Timeout(self.request_timeout).into()),
        }
    }

    /// Turn a platform mutation into an invalidation event and wait for it
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidationDeliveryFailed`] if the bus is down.
    pub async fn notify_mutation<I, T>(
        &self,
        tenant_id: &str,
        tags: I,
    ) -> Result<EventOutcome, CacheError>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let event = InvalidationEvent::new(tenant_id, tags);
        let outcome = self.bus.publish_confirmed(event).await?;
        if let EventOutcome::PartiallyApplied { failures, .. } = &outcome {
            warn!(tenant = %tenant_id, failures, "Mutation only partially invalidated");
        }
        Ok(outcome)
    }

    /// Administrative purge of one tag within one tenant
    ///
    /// # Errors
    ///
    /// Returns an error if the bus is down.
    pub async fn purge_tag(&self, tenant_id: &str, tag: &str) -> Result<EventOutcome, CacheError> {
        self.notify_mutation(tenant_id, [tag]).await
    }

    /// Drop every entry of a tenant from both tiers (offboarding)
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidTenantId`] or a store error.
    pub async fn flush_tenant(&self, tenant_id: &str) -> Result<usize, CacheError> {
        let tenant = TenantContext::for_tenant(tenant_id)?;
        let page = self.page.flush_tenant(&tenant).await?;
        let object = self.object.flush_tenant(&tenant).await?;
        info!(tenant = %tenant_id, page, object, "Flushed tenant namespace");
        Ok(page + object)
    }

    /// Reclaim the namespaces of deactivated tenants and expired hints
    ///
    /// # Errors
    ///
    /// Returns the first store error; remaining tenants are still swept.
    pub async fn sweep_inactive(&self) -> Result<usize, CacheError> {
        let mut total = 0;
        let mut first_error = None;
        for tenant in self.registry.inactive_tenants() {
            match self.flush_tenant(tenant.id()).await {
                Ok(purged) => total += purged,
                Err(e) => {
                    warn!(tenant = %tenant.id(), error = %e, "Sweep of inactive tenant failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        let pruned = self.router.prune_expired();
        debug!(purged = total, pruned_hints = pruned, "Inactive tenant sweep complete");
        first_error.map_or(Ok(total), Err)
    }

    /// Read a raw key for `tenant`, as the wire protocol does
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::StoreUnavailable`] with a cross-tenant error
    /// when the key lives in another namespace.
    pub async fn get_raw(&self, tenant: &TenantContext, key: &CacheKey) -> Result<Lookup, CacheError> {
        self.check_namespace(tenant, key)?;
        Ok(match key.tier() {
            Tier::Page => self.page.get(key).await,
            Tier::Object => self.object.get(key).await,
        })
    }

    /// Write a raw key for `tenant`
    ///
    /// # Errors
    ///
    /// Returns a cross-tenant or store error.
    pub async fn set_raw(
        &self,
        tenant: &TenantContext,
        key: &CacheKey,
        payload: Bytes,
        ttl: Ttl,
        tags: BTreeSet<String>,
    ) -> Result<PutOutcome, CacheError> {
        self.check_namespace(tenant, key)?;
        let outcome = match key.tier() {
            Tier::Page => self.page.put(key, payload, ttl, tags).await?,
            Tier::Object => self.object.tier_store().put(key, payload, ttl, tags).await?,
        };
        Ok(outcome)
    }

    /// Delete a raw key for `tenant`
    ///
    /// # Errors
    ///
    /// Returns a cross-tenant or store error.
    pub async fn delete_raw(&self, tenant: &TenantContext, key: &CacheKey) -> Result<bool, CacheError> {
        let removed = match key.tier() {
            Tier::Page => self.page.purge_by_key(tenant, key).await?,
            Tier::Object => self.object.purge_by_key(tenant, key).await?,
        };
        Ok(removed)
    }

    fn check_namespace(&self, tenant: &TenantContext, key: &CacheKey) -> Result<(), CacheError> {
        if key.belongs_to(tenant) {
            Ok(())
        } else {
            Err(StoreError::CrossTenant {
                key: key.to_string(),
                namespace: tenant.namespace().to_string(),
            }
            .into())
        }
    }

    pub async fn stats(&self) -> CacheStats {
        CacheStats {
            page: self.page.stats().await,
            object: self.object.stats().await,
            stampede: self.guard.stats(),
            invalidation: self.bus.stats(),
            replicas: self.router.stats(),
            tenants: self.registry.tenants().len(),
            table_version: self.registry.table_version(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<TenantRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn keys(&self) -> &CacheKeyBuilder {
        &self.keys
    }

    #[must_use]
    pub fn page_store(&self) -> &PageCacheStore {
        &self.page
    }

    #[must_use]
    pub fn object_store(&self) -> &ObjectCacheStore {
        &self.object
    }

    #[must_use]
    pub fn router(&self) -> &Arc<ReplicaRouter> {
        &self.router
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<InvalidationBus> {
        &self.bus
    }

    #[must_use]
    pub fn guard(&self) -> &StampedeGuard {
        &self.guard
    }
}
