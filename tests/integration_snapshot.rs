//! Integration tests for warm-restart snapshots

mod common;

use common::*;
use multi_tenant_cache::{CacheStatus, PageRequest, Snapshot, Variation};
use std::time::Duration;

fn request(host: &str, route: &str) -> PageRequest {
    PageRequest::new(host, route, Variation::new("desktop", "en"))
}

/// Restored entries are served stale once while a refresh runs
#[tokio::test]
async fn test_restore_serves_stale_then_refreshes() {
    let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("No temp dir: {e}"));
    let path = dir.path().join("cache.snapshot.json");

    let (warm, _platform, _source) = setup_default().await;
    for route in ["/home", "/products/11"] {
        warm.service()
            .handle(request(ACME_HOST, route))
            .await
            .unwrap_or_else(|e| panic!("Warm-up request failed: {e}"));
    }
    let snapshot = Snapshot::capture(warm.service())
        .await
        .unwrap_or_else(|e| panic!("Capture failed: {e}"));
    assert_eq!(snapshot.page.len(), 2);
    assert_eq!(snapshot.object.len(), 1);
    snapshot
        .write_to(&path)
        .unwrap_or_else(|e| panic!("Write failed: {e}"));

    let (cold, platform, _source) = setup_default().await;
    let report = Snapshot::read_from(&path)
        .unwrap_or_else(|e| panic!("Read failed: {e}"))
        .restore(cold.service(), cold.config().longest_ttl())
        .await
        .unwrap_or_else(|e| panic!("Restore failed: {e}"));
    assert_eq!(report.loaded, 3);
    assert_eq!(report.skipped, 0);
    assert_eq!(report.discarded, 0);

    let first = cold
        .service()
        .handle(request(ACME_HOST, "/home"))
        .await
        .unwrap_or_else(|e| panic!("Restored request failed: {e}"));
    assert_eq!(first.status, CacheStatus::Stale);

    let mut refreshed = false;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let response = cold
            .service()
            .handle(request(ACME_HOST, "/home"))
            .await
            .unwrap_or_else(|e| panic!("Refreshed request failed: {e}"));
        if response.status == CacheStatus::Hit {
            refreshed = true;
            break;
        }
    }
    assert!(refreshed, "Stale restored entry was never revalidated");
    assert_eq!(platform.renders(), 1);
}

/// A snapshot older than the longest TTL is thrown away
#[tokio::test]
async fn test_old_snapshot_is_discarded() {
    let (warm, _platform, _source) = setup_default().await;
    warm.service()
        .handle(request(ACME_HOST, "/home"))
        .await
        .unwrap_or_else(|e| panic!("Warm-up request failed: {e}"));
    let mut snapshot = Snapshot::capture(warm.service())
        .await
        .unwrap_or_else(|e| panic!("Capture failed: {e}"));
    let longest = warm.config().longest_ttl();
    let age_ms = u64::try_from((longest + Duration::from_secs(60)).as_millis()).unwrap_or(u64::MAX);
    snapshot.captured_at_ms = snapshot.captured_at_ms.saturating_sub(age_ms);

    let (cold, platform, _source) = setup_default().await;
    let report = snapshot
        .restore(cold.service(), longest)
        .await
        .unwrap_or_else(|e| panic!("Restore failed: {e}"));
    assert_eq!(report.loaded, 0);
    assert_eq!(report.discarded, 1);
    assert!(report.gap > longest);

    let response = cold
        .service()
        .handle(request(ACME_HOST, "/home"))
        .await
        .unwrap_or_else(|e| panic!("Cold request failed: {e}"));
    assert_eq!(response.status, CacheStatus::Miss);
    assert_eq!(platform.renders(), 1);
}

/// Entries of tenants that are no longer active are not restored
#[tokio::test]
async fn test_inactive_tenant_entries_are_skipped() {
    let (warm, _platform, _source) = setup_default().await;
    for host in [ACME_HOST, GLOBEX_HOST] {
        warm.service()
            .handle(request(host, "/home"))
            .await
            .unwrap_or_else(|e| panic!("Warm-up request failed: {e}"));
    }
    let snapshot = Snapshot::capture(warm.service())
        .await
        .unwrap_or_else(|e| panic!("Capture failed: {e}"));

    let (cold, _platform, _source) = setup_default().await;
    assert!(cold.service().registry().deactivate("globex"));
    let report = snapshot
        .restore(cold.service(), cold.config().longest_ttl())
        .await
        .unwrap_or_else(|e| panic!("Restore failed: {e}"));
    assert_eq!(report.loaded, 1);
    assert_eq!(report.skipped, 1);
}

/// The configured snapshot path round-trips through save and load
#[tokio::test]
async fn test_configured_snapshot_path() {
    let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("No temp dir: {e}"));
    let mut config = test_config();
    config.snapshot.path = Some(dir.path().join("snap.json").to_string_lossy().into_owned());

    let warm = setup_system(config.clone(), CountingPlatform::new(), CountingSource::new()).await;
    assert!(warm.load_snapshot().await.unwrap_or_else(|e| panic!("{e}")).is_none());
    warm.service()
        .handle(request(GLOBEX_HOST, "/home"))
        .await
        .unwrap_or_else(|e| panic!("Warm-up request failed: {e}"));
    assert!(warm.save_snapshot().await.unwrap_or_else(|e| panic!("{e}")));

    let cold = setup_system(config, CountingPlatform::new(), CountingSource::new()).await;
    let report = cold
        .load_snapshot()
        .await
        .unwrap_or_else(|e| panic!("Load failed: {e}"))
        .unwrap_or_else(|| panic!("Snapshot not found"));
    assert_eq!(report.loaded, 1);
}
