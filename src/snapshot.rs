//! Warm-restart snapshots
//!
//! A snapshot is advisory: restored entries come back marked stale, so the
//! first request for each one serves it while a refresh runs. A snapshot
//! older than the longest TTL in use is discarded outright.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::entry::{CacheEntry, Freshness, now_ms};
use crate::keys::CacheKey;
use crate::service::CacheService;
use crate::stores::TierStore;
use crate::tenant::TenantRegistry;
use crate::traits::PutOutcome;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub captured_at_ms: u64,
    pub page: Vec<CacheEntry>,
    pub object: Vec<CacheEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotLoadReport {
    pub loaded: usize,
    /// Dead, refused, or owned by an unknown or inactive tenant
    pub skipped: usize,
    /// Entries dropped because the whole snapshot was too old
    pub discarded: usize,
    pub gap: Duration,
}

impl Snapshot {
    /// Copy both tiers of a running service
    ///
    /// # Errors
    ///
    /// Returns an error if a store cannot enumerate its entries.
    pub async fn capture(service: &CacheService) -> Result<Self> {
        let page = service
            .page_store()
            .tier_store()
            .entries()
            .await
            .context("Failed to read page tier for snapshot")?;
        let object = service
            .object_store()
            .tier_store()
            .entries()
            .await
            .context("Failed to read object tier for snapshot")?;
        Ok(Self {
            version: SNAPSHOT_VERSION,
            captured_at_ms: now_ms(),
            page,
            object,
        })
    }

    /// Write atomically: temp file in the same directory, then rename
    ///
    /// # Errors
    ///
    /// Returns an error on serialization or IO failure.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        let doc = serde_json::to_vec(self).context("Failed to serialize snapshot")?;
        std::fs::write(&tmp, doc)
            .with_context(|| format!("Failed to write snapshot to {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move snapshot into {}", path.display()))?;
        info!(
            path = %path.display(),
            page = self.page.len(),
            object = self.object.len(),
            "Snapshot written"
        );
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the file is missing, unreadable, or from an
    /// unknown snapshot version.
    pub fn read_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let doc = std::fs::read(path)
            .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
        let snapshot: Self = serde_json::from_slice(&doc)
            .with_context(|| format!("Failed to parse snapshot {}", path.display()))?;
        anyhow::ensure!(
            snapshot.version == SNAPSHOT_VERSION,
            "Unsupported snapshot version {}",
            snapshot.version
        );
        Ok(snapshot)
    }

    /// Load into a running service
    ///
    /// # Errors
    ///
    /// Returns an error if a store rejects writes outright.
    pub async fn restore(
        self,
        service: &CacheService,
        longest_ttl: Duration,
    ) -> Result<SnapshotLoadReport> {
        let gap = Duration::from_millis(now_ms().saturating_sub(self.captured_at_ms));
        let total = self.page.len() + self.object.len();
        if gap > longest_ttl {
            warn!(
                gap_secs = gap.as_secs(),
                longest_ttl_secs = longest_ttl.as_secs(),
                entries = total,
                "Snapshot older than longest TTL, discarding"
            );
            return Ok(SnapshotLoadReport {
                discarded: total,
                gap,
                ..SnapshotLoadReport::default()
            });
        }

        let mut report = SnapshotLoadReport {
            gap,
            ..SnapshotLoadReport::default()
        };
        let registry = service.registry();
        restore_tier(service.page_store().tier_store(), registry, self.page, &mut report).await?;
        restore_tier(service.object_store().tier_store(), registry, self.object, &mut report)
            .await?;
        info!(
            loaded = report.loaded,
            skipped = report.skipped,
            gap_secs = gap.as_secs(),
            "Snapshot restored"
        );
        Ok(report)
    }
}

async fn restore_tier(
    store: &TierStore,
    registry: &TenantRegistry,
    entries: Vec<CacheEntry>,
    report: &mut SnapshotLoadReport,
) -> Result<()> {
    let now = now_ms();
    for mut entry in entries {
        let owner_active = CacheKey::parse(&entry.key)
            .filter(|key| key.tier() == store.tier())
            .and_then(|key| registry.get(key.namespace()))
            .is_some_and(|tenant| tenant.is_active());
        if !owner_active || entry.freshness(now, store.stale_retention()) == Freshness::Dead {
            report.skipped += 1;
            continue;
        }
        entry.stale = true;
        match store
            .put_entry(entry)
            .await
            .context("Failed to restore snapshot entry")?
        {
            PutOutcome::Stored { .. } => report.loaded += 1,
            PutOutcome::Refused => report.skipped += 1,
        }
    }
    Ok(())
}
