//! Error taxonomy for the cache layer
//!
//! Failures internal to the cache (store outages, lost leases, undeliverable
//! invalidations) are recovered locally wherever that keeps responses
//! correct. Failures that originate in the content platform are carried
//! through untouched as [`CacheError::OriginFetchFailed`].

use std::time::Duration;

/// Errors raised by an [`EntryStore`](crate::traits::EntryStore) or
/// [`LeaseStore`](crate::traits::LeaseStore) backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend connection lost or refused
    #[error("store backend unavailable: {0}")]
    Unavailable(String),

    /// Backend did not answer within the configured operation timeout
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// A key or purge crossed a tenant namespace boundary
    #[error("key `{key}` is outside tenant namespace `{namespace}`")]
    CrossTenant { key: String, namespace: String },

    /// Entry could not be encoded or decoded for a remote backend
    #[error("entry codec failure: {0}")]
    Codec(#[from] serde_json::Error),
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Errors returned by the content platform or the data store behind it.
#[derive(Debug, thiserror::Error)]
pub enum OriginError {
    /// A replica answered but judged its own data too stale for the read.
    /// The fetch path retries the read against the primary.
    #[error("replica read rejected as too stale")]
    ReplicaTooStale,

    /// The origin did not answer within the fetch deadline
    #[error("origin call timed out after {0:?}")]
    Timeout(Duration),

    /// Any other origin failure, passed through as-is
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Top-level error type of the cache layer.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Backend store lost. Reads never surface this; it only escapes from
    /// explicit administrative writes and purges.
    #[error(transparent)]
    StoreUnavailable(#[from] StoreError),

    /// The render or query call failed. Never cached, never masked.
    #[error("origin fetch failed: {0}")]
    OriginFetchFailed(#[from] OriginError),

    /// An invalidation event could not be queued or applied
    #[error("invalidation delivery failed: {0}")]
    InvalidationDeliveryFailed(String),

    /// No active tenant matched the request identity
    #[error("no tenant matches request identity `{0}`")]
    TenantUnresolved(String),

    /// A fetch lease was taken over by another holder before release
    #[error("fetch lease for `{key}` expired while held")]
    LeaseExpiredWhileHeld { key: String },

    /// Tenant identifier contains characters that would break key namespacing
    #[error("invalid tenant id `{0}`")]
    InvalidTenantId(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CacheError {
    /// True when the error came from the content platform rather than the
    /// cache layer itself.
    #[must_use]
    pub fn is_origin(&self) -> bool {
        matches!(self, Self::OriginFetchFailed(_))
    }
}
