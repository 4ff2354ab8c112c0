//! Cache entries
//!
//! An entry is the unit both tiers store. It is never partially updated:
//! stores replace the whole entry under its key.

use std::collections::BTreeSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch
#[must_use]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Declared lifetime of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ttl {
    Expires(Duration),
    /// Immutable content; the entry lives until evicted or purged
    Never,
}

impl Ttl {
    /// `0` is the wire encoding for "no expiry"
    #[must_use]
    pub fn from_secs(secs: u64) -> Self {
        if secs == 0 {
            Self::Never
        } else {
            Self::Expires(Duration::from_secs(secs))
        }
    }

    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        match self {
            Self::Expires(ttl) => Some(*ttl),
            Self::Never => None,
        }
    }
}

/// Freshness of an entry at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// Past its TTL (or explicitly marked stale) but still retained
    Stale,
    /// Past TTL plus retention; must not be served
    Dead,
}

/// A stored payload plus the facts needed to expire and invalidate it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Bytes,
    pub created_at_ms: u64,
    pub ttl: Ttl,
    pub tags: BTreeSet<String>,
    pub stale: bool,
}

impl CacheEntry {
    pub fn new(
        key: impl Into<String>,
        payload: impl Into<Bytes>,
        ttl: Ttl,
        tags: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
            created_at_ms: now_ms(),
            ttl,
            tags: tags.into_iter().collect(),
            stale: false,
        }
    }

    /// Namespace segment of the key (everything before the first `:`)
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.key.split(':').next().unwrap_or_default()
    }

    /// Accounted size: payload plus key and tag bytes
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.payload.len() + self.key.len() + self.tags.iter().map(String::len).sum::<usize>()
    }

    #[must_use]
    pub fn expires_at_ms(&self) -> Option<u64> {
        self.ttl.duration().map(|ttl| {
            self.created_at_ms
                .saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
        })
    }

    /// Remaining time to live, `None` for entries that never expire
    #[must_use]
    pub fn remaining_ttl(&self, now_ms: u64) -> Option<Duration> {
        self.expires_at_ms()
            .map(|at| Duration::from_millis(at.saturating_sub(now_ms)))
    }

    #[must_use]
    pub fn freshness(&self, now_ms: u64, stale_retention: Duration) -> Freshness {
        let retention = u64::try_from(stale_retention.as_millis()).unwrap_or(u64::MAX);
        match self.expires_at_ms() {
            Some(at) if now_ms > at.saturating_add(retention) => Freshness::Dead,
            Some(at) if now_ms > at => Freshness::Stale,
            _ if self.stale => Freshness::Stale,
            _ => Freshness::Fresh,
        }
    }

    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

/// Result of a store read after freshness has been applied
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Hit(CacheEntry),
    Stale(CacheEntry),
    Miss,
}

impl Lookup {
    #[must_use]
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }

    #[must_use]
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::Miss)
    }

    #[must_use]
    pub fn entry(&self) -> Option<&CacheEntry> {
        match self {
            Self::Hit(entry) | Self::Stale(entry) => Some(entry),
            Self::Miss => None,
        }
    }
}
