//! Integration tests for stampede protection
//!
//! Tests concurrent misses, stale-while-revalidate and fetch deadlines

mod common;

use common::*;
use multi_tenant_cache::config::RouteRule;
use multi_tenant_cache::{CacheKey, CacheStatus, Lookup, PageRequest, TenantContext, Variation};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

fn request(route: &str, device: &str) -> PageRequest {
    PageRequest::new(ACME_HOST, route, Variation::new(device, "en"))
}

/// Many concurrent misses for one page cause exactly one render
#[tokio::test]
async fn test_concurrent_page_miss_renders_once() {
    let platform = CountingPlatform::with_delay(Duration::from_millis(100));
    let source = CountingSource::new();
    let system = setup_system(test_config(), Arc::clone(&platform), Arc::clone(&source)).await;
    let service = Arc::clone(system.service());

    let mut tasks = JoinSet::new();
    for _ in 0..50 {
        let service = Arc::clone(&service);
        tasks.spawn(async move { service.handle(request("/products/42", "desktop")).await });
    }

    let mut payloads = Vec::new();
    let mut misses = 0;
    while let Some(result) = tasks.join_next().await {
        let response = result
            .unwrap_or_else(|_| panic!("Task panicked"))
            .unwrap_or_else(|e| panic!("Request failed: {e}"));
        if response.status == CacheStatus::Miss {
            misses += 1;
        }
        payloads.push(response.payload);
    }

    assert_eq!(platform.renders(), 1, "Expected exactly 1 render");
    assert_eq!(source.queries(), 1, "Expected exactly 1 fragment query");
    assert_eq!(misses, 1);
    assert!(payloads.windows(2).all(|pair| pair[0] == pair[1]));

    let stats = service.stats().await;
    assert_eq!(stats.stampede.wait_timeouts, 0);
    assert!(stats.stampede.waits > 0);
}

/// Two page variants sharing a fragment query the data source once
#[tokio::test]
async fn test_shared_fragment_fetched_once() {
    let platform = CountingPlatform::with_delay(Duration::from_millis(20));
    let source = CountingSource::new();
    let system = setup_system(test_config(), Arc::clone(&platform), Arc::clone(&source)).await;
    let service = Arc::clone(system.service());

    let desktop = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.handle(request("/products/9", "desktop")).await })
    };
    let mobile = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.handle(request("/products/9", "mobile")).await })
    };

    for handle in [desktop, mobile] {
        let response = handle
            .await
            .unwrap_or_else(|_| panic!("Task panicked"))
            .unwrap_or_else(|e| panic!("Request failed: {e}"));
        assert_eq!(response.status, CacheStatus::Miss);
    }
    assert_eq!(platform.renders(), 2);
    assert_eq!(source.queries(), 1);
}

/// Two simultaneous homepage renders share one `homepage-widgets` query
#[tokio::test]
async fn test_homepage_widgets_fetched_once() {
    let platform = CountingPlatform::with_delay(Duration::from_millis(10));
    let source = CountingSource::new();
    let system = setup_system(test_config(), Arc::clone(&platform), Arc::clone(&source)).await;
    let service = Arc::clone(system.service());

    let mut tasks = JoinSet::new();
    for device in ["desktop", "mobile"] {
        let service = Arc::clone(&service);
        tasks.spawn(async move { service.handle(request("/", device)).await });
    }
    while let Some(result) = tasks.join_next().await {
        result
            .unwrap_or_else(|_| panic!("Task panicked"))
            .unwrap_or_else(|e| panic!("Request failed: {e}"));
    }
    assert_eq!(source.queries(), 1);

    let acme = TenantContext::for_tenant("acme").unwrap_or_else(|e| panic!("{e}"));
    let key = CacheKey::parse("acme:obj:homepage-widgets")
        .unwrap_or_else(|| panic!("Invalid key"));
    assert!(matches!(service.get_raw(&acme, &key).await, Ok(Lookup::Hit(_))));
}

/// An expired page is served stale while one refresh runs behind it
#[tokio::test]
async fn test_stale_while_revalidate() {
    let mut config = test_config();
    config.page.route_classes.push(RouteRule {
        prefix: "/news".into(),
        ttl_secs: Some(1),
        immutable: false,
        non_cacheable: false,
    });
    let platform = CountingPlatform::new();
    let system = setup_system(config, Arc::clone(&platform), CountingSource::new()).await;
    let service = system.service();

    let first = service
        .handle(request("/news", "desktop"))
        .await
        .unwrap_or_else(|e| panic!("First request failed: {e}"));
    assert_eq!(first.status, CacheStatus::Miss);

    platform.bump_version();
    tokio::time::sleep(Duration::from_millis(1_100)).await;

    let stale = service
        .handle(request("/news", "desktop"))
        .await
        .unwrap_or_else(|e| panic!("Stale request failed: {e}"));
    assert_eq!(stale.status, CacheStatus::Stale);
    assert_eq!(stale.payload, first.payload);

    let mut refreshed = None;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let response = service
            .handle(request("/news", "desktop"))
            .await
            .unwrap_or_else(|e| panic!("Refreshed request failed: {e}"));
        if response.status == CacheStatus::Hit {
            refreshed = Some(response);
            break;
        }
    }
    let refreshed = refreshed.unwrap_or_else(|| panic!("Background refresh never landed"));
    assert!(String::from_utf8_lossy(&refreshed.payload).contains(" v1"));
    assert_eq!(platform.renders(), 2);
}

/// A render slower than the lease expiry fails instead of hanging
#[tokio::test]
async fn test_slow_render_hits_fetch_deadline() {
    let mut config = test_config();
    config.stampede.lease_expiry_ms = 100;
    let platform = CountingPlatform::with_delay(Duration::from_millis(400));
    let system = setup_system(config, Arc::clone(&platform), CountingSource::new()).await;

    let err = system
        .service()
        .handle(request("/home", "desktop"))
        .await
        .err()
        .unwrap_or_else(|| panic!("Expected fetch deadline error"));
    assert!(err.is_origin());
    assert_eq!(system.service().stats().await.page.sets, 0);
}
