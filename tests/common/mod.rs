//! Common utilities for integration tests
//!
//! This module provides shared test infrastructure including:
//! - A counting content platform and data source
//! - A two-tenant test configuration
//! - System setup without any Redis dependency

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use multi_tenant_cache::config::RouteRule;
use multi_tenant_cache::{
    CacheConfig, CacheSystem, CacheSystemBuilder, ContentPlatform, DataSource, FragmentLoader,
    FragmentQuery, OriginError, ReadTarget, RenderRequest, Rendered, TenantContext, TenantRecord,
    async_trait,
};
use parking_lot::Mutex;

pub const ACME_HOST: &str = "acme.example.com";
pub const GLOBEX_HOST: &str = "globex.example.com";

/// Two active tenants, fast retries, one replica
pub fn test_config() -> CacheConfig {
    let mut config = CacheConfig::default();
    config.tenants.records = vec![
        TenantRecord::new("acme").with_host(ACME_HOST),
        TenantRecord::new("globex").with_host(GLOBEX_HOST),
    ];
    config.page.route_classes = vec![
        RouteRule {
            prefix: "/account".into(),
            ttl_secs: None,
            immutable: false,
            non_cacheable: true,
        },
        RouteRule {
            prefix: "/assets".into(),
            ttl_secs: None,
            immutable: true,
            non_cacheable: false,
        },
    ];
    config.stampede.lease_expiry_ms = 2_000;
    config.stampede.max_wait_retries = 50;
    config.stampede.initial_backoff_ms = 5;
    config.stampede.max_backoff_ms = 50;
    config.invalidation.purge_backoff_ms = 1;
    config.replica.replicas = vec!["replica-1".into()];
    config.server.listen_addr = "127.0.0.1:0".into();
    config
}

/// Renders `<tenant> <route> v<version>`; product routes pull a
/// `product` fragment tagged `product:<id>` and `/` pulls
/// `homepage-widgets`
#[derive(Default)]
pub struct CountingPlatform {
    pub renders: AtomicU32,
    pub version: AtomicU64,
    pub delay_ms: AtomicU64,
    pub fail: AtomicBool,
    pub private: AtomicBool,
}

impl CountingPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        let platform = Self::default();
        platform
            .delay_ms
            .store(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), Ordering::SeqCst);
        Arc::new(platform)
    }

    pub fn renders(&self) -> u32 {
        self.renders.load(Ordering::SeqCst)
    }

    pub fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContentPlatform for CountingPlatform {
    async fn render(
        &self,
        request: &RenderRequest,
        fragments: &FragmentLoader,
    ) -> Result<Rendered, OriginError> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(OriginError::Failed(anyhow::anyhow!("platform down")));
        }

        let tenant = request
            .tenant
            .as_ref()
            .map_or("unresolved", TenantContext::id);
        let version = self.version.load(Ordering::SeqCst);
        let mut body = format!("{tenant} {} v{version}", request.route);

        if let Some(id) = request.route.strip_prefix("/products/") {
            let fragment = fragments
                .load(
                    FragmentQuery::new("product")
                        .param("id", id)
                        .tag(format!("product:{id}")),
                )
                .await
                .map_err(|e| OriginError::Failed(anyhow::anyhow!("{e}")))?;
            body.push_str(" | ");
            body.push_str(&String::from_utf8_lossy(&fragment));
        }

        if request.route == "/" {
            let widgets = fragments
                .load(FragmentQuery::new("homepage-widgets").tag("widgets"))
                .await
                .map_err(|e| OriginError::Failed(anyhow::anyhow!("{e}")))?;
            body.push_str(" | ");
            body.push_str(&String::from_utf8_lossy(&widgets));
        }

        let rendered = Rendered::new(body).with_tag(format!("route:{}", request.route));
        if self.private.load(Ordering::SeqCst) {
            Ok(rendered.private())
        } else {
            Ok(rendered)
        }
    }
}

/// Answers `<tenant>/<name>:<id>@<target> v<version>` (tenant `-` when
/// unresolved) and records every target and tenant
#[derive(Default)]
pub struct CountingSource {
    pub queries: AtomicU32,
    pub version: AtomicU64,
    pub targets: Mutex<Vec<ReadTarget>>,
    pub tenants: Mutex<Vec<Option<String>>>,
    /// Replicas reject every read as too stale
    pub stale_replicas: AtomicBool,
}

impl CountingSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn queries(&self) -> u32 {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    pub fn targets(&self) -> Vec<ReadTarget> {
        self.targets.lock().clone()
    }

    pub fn tenants(&self) -> Vec<Option<String>> {
        self.tenants.lock().clone()
    }
}

#[async_trait]
impl DataSource for CountingSource {
    async fn query(
        &self,
        target: &ReadTarget,
        tenant: Option<&TenantContext>,
        query: &FragmentQuery,
    ) -> Result<Bytes, OriginError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.targets.lock().push(target.clone());
        self.tenants
            .lock()
            .push(tenant.map(|tenant| tenant.id().to_string()));
        if !target.is_primary() && self.stale_replicas.load(Ordering::SeqCst) {
            return Err(OriginError::ReplicaTooStale);
        }
        let id = query.params.get("id").map_or("-", String::as_str);
        let at = match target {
            ReadTarget::Primary => "primary",
            ReadTarget::Replica(name) => name.as_str(),
        };
        let owner = tenant.map_or("-", TenantContext::id);
        let version = self.version.load(Ordering::SeqCst);
        Ok(Bytes::from(format!("{owner}/{}:{id}@{at} v{version}", query.name)))
    }
}

/// Build a system over in-process stores
pub async fn setup_system(
    config: CacheConfig,
    platform: Arc<CountingPlatform>,
    source: Arc<CountingSource>,
) -> CacheSystem {
    CacheSystemBuilder::new(config)
        .with_platform(platform)
        .with_data_source(source)
        .local_only()
        .build()
        .await
        .unwrap_or_else(|e| panic!("Failed to build cache system: {e}"))
}

/// Default test system plus handles to its origin
pub async fn setup_default() -> (CacheSystem, Arc<CountingPlatform>, Arc<CountingSource>) {
    let platform = CountingPlatform::new();
    let source = CountingSource::new();
    let system = setup_system(test_config(), Arc::clone(&platform), Arc::clone(&source)).await;
    (system, platform, source)
}
