//! Structured configuration document
//!
//! Every tunable of the cache layer lives here: declared variation axes,
//! TTL defaults per route class, memory ceilings per store, the replica
//! staleness window, lease expiry and invalidation retry budget. The
//! document is plain serde data and loads from TOML or JSON.
//!
//! ```toml
//! namespace_salt = { version = 1, value = "b7f0c2" }
//!
//! [variation]
//! device_classes = ["desktop", "mobile"]
//! locales = ["en", "fr"]
//! query_param_whitelist = ["page", "sort"]
//!
//! [page]
//! memory_ceiling_bytes = 268435456
//! default_ttl_secs = 300
//! route_classes = [
//!     { prefix = "/assets", immutable = true },
//!     { prefix = "/account", non_cacheable = true },
//! ]
//!
//! [[tenants.records]]
//! id = "acme"
//! hosts = ["acme.example.com"]
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::tenant::TenantRecord;

/// Root configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub namespace_salt: NamespaceSalt,
    pub variation: VariationConfig,
    pub page: PageStoreConfig,
    pub object: ObjectStoreConfig,
    pub stampede: StampedeConfig,
    pub replica: ReplicaConfig,
    pub invalidation: InvalidationConfig,
    pub tenants: TenantTableConfig,
    pub server: ServerConfig,
    pub snapshot: SnapshotConfig,
    /// Redis URL for the distributed object tier, leases and pub/sub.
    /// Falls back to the `REDIS_URL` environment variable when unset.
    pub redis_url: Option<String>,
}

/// Persisted, versioned salt mixed into hashed key fingerprints.
///
/// The salt is read from configuration and never regenerated at runtime,
/// so keys stay identical across restarts. Bumping `version` rotates every
/// hashed fingerprint at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSalt {
    pub version: u32,
    pub value: String,
}

impl Default for NamespaceSalt {
    fn default() -> Self {
        Self {
            version: 1,
            value: String::new(),
        }
    }
}

/// Declared variation axes. Request facets outside these never reach a key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VariationConfig {
    pub device_classes: Vec<String>,
    pub default_device_class: String,
    pub locales: Vec<String>,
    pub default_locale: String,
    pub query_param_whitelist: Vec<String>,
    /// Split page keys by anonymous/authenticated state. Authenticated
    /// routes stay non-cacheable in the page tier unless this is set.
    pub vary_on_auth_state: bool,
}

impl Default for VariationConfig {
    fn default() -> Self {
        Self {
            device_classes: vec!["desktop".into(), "mobile".into(), "tablet".into()],
            default_device_class: "desktop".into(),
            locales: vec!["en".into()],
            default_locale: "en".into(),
            query_param_whitelist: Vec::new(),
            vary_on_auth_state: false,
        }
    }
}

/// Per-prefix route policy for the page tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    pub prefix: String,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default)]
    pub immutable: bool,
    #[serde(default)]
    pub non_cacheable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PageStoreConfig {
    pub memory_ceiling_bytes: usize,
    pub default_ttl_secs: u64,
    /// Expired entries are retained this long for stale-while-revalidate
    pub stale_retention_secs: u64,
    /// Entries larger than `ceiling / max_entry_fraction` are refused
    pub max_entry_fraction: usize,
    pub route_classes: Vec<RouteRule>,
}

impl Default for PageStoreConfig {
    fn default() -> Self {
        Self {
            memory_ceiling_bytes: 256 * 1024 * 1024,
            default_ttl_secs: 300,
            stale_retention_secs: 60,
            max_entry_fraction: 8,
            route_classes: Vec::new(),
        }
    }
}

impl PageStoreConfig {
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    #[must_use]
    pub fn stale_retention(&self) -> Duration {
        Duration::from_secs(self.stale_retention_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObjectStoreConfig {
    pub memory_ceiling_bytes: usize,
    pub default_ttl_secs: u64,
    pub stale_retention_secs: u64,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            memory_ceiling_bytes: 128 * 1024 * 1024,
            default_ttl_secs: 60,
            stale_retention_secs: 30,
        }
    }
}

impl ObjectStoreConfig {
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    #[must_use]
    pub fn stale_retention(&self) -> Duration {
        Duration::from_secs(self.stale_retention_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StampedeConfig {
    /// Lease lifetime; also the deadline for the leader's origin fetch
    pub lease_expiry_ms: u64,
    pub max_wait_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Serve a retained stale copy instead of waiting for the leader
    pub serve_stale: bool,
}

impl Default for StampedeConfig {
    fn default() -> Self {
        Self {
            lease_expiry_ms: 5_000,
            max_wait_retries: 12,
            initial_backoff_ms: 10,
            max_backoff_ms: 1_000,
            serve_stale: true,
        }
    }
}

impl StampedeConfig {
    #[must_use]
    pub fn lease_expiry(&self) -> Duration {
        Duration::from_millis(self.lease_expiry_ms)
    }

    /// Time a follower spends in backed-off retries before it falls back
    /// to waiting out the holder's lease
    #[must_use]
    pub fn retry_window(&self) -> Duration {
        let mut total = 0u64;
        let mut step = self.initial_backoff_ms;
        for _ in 0..self.max_wait_retries {
            total = total.saturating_add(step);
            step = step.saturating_mul(2).min(self.max_backoff_ms);
        }
        Duration::from_millis(total)
    }

    /// Longest a follower waits for a populated entry or a free lease
    #[must_use]
    pub fn follower_deadline(&self) -> Duration {
        self.retry_window().max(self.lease_expiry()) + self.lease_expiry()
    }
}

/// Replica selection among healthy replicas
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaPolicy {
    #[default]
    RoundRobin,
    LeastLoaded,
}

/// Granularity of recorded write-recency hints
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HintScope {
    /// Any write to a tenant pins all of its reads to the primary
    #[default]
    Tenant,
    /// Only reads sharing a recently written tag go to the primary
    Tag,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    pub staleness_window_secs: u64,
    pub policy: ReplicaPolicy,
    pub hint_scope: HintScope,
    pub replicas: Vec<String>,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            staleness_window_secs: 5,
            policy: ReplicaPolicy::RoundRobin,
            hint_scope: HintScope::Tenant,
            replicas: Vec::new(),
        }
    }
}

impl ReplicaConfig {
    #[must_use]
    pub fn staleness_window(&self) -> Duration {
        Duration::from_secs(self.staleness_window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidationConfig {
    /// Event ids are remembered this long to drop redeliveries
    pub replay_window_secs: u64,
    pub replay_capacity: usize,
    pub max_purge_retries: u32,
    pub purge_backoff_ms: u64,
    /// Pub/sub channel for cross-instance delivery
    pub channel: String,
    pub queue_depth: usize,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            replay_window_secs: 300,
            replay_capacity: 65_536,
            max_purge_retries: 4,
            purge_backoff_ms: 50,
            channel: "cache:invalidate".to_string(),
            queue_depth: 1_024,
        }
    }
}

impl InvalidationConfig {
    #[must_use]
    pub fn replay_window(&self) -> Duration {
        Duration::from_secs(self.replay_window_secs)
    }

    /// Worst-case time spent retrying one purge before giving up
    #[must_use]
    pub fn retry_window(&self) -> Duration {
        let mut total = 0u64;
        let mut step = self.purge_backoff_ms;
        for _ in 0..self.max_purge_retries {
            total = total.saturating_add(step);
            step = step.saturating_mul(2);
        }
        Duration::from_millis(total)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantTableConfig {
    pub table_version: u64,
    /// Validity window of memoized resolutions
    pub resolution_cache_ttl_secs: u64,
    pub records: Vec<TenantRecord>,
}

impl Default for TenantTableConfig {
    fn default() -> Self {
        Self {
            table_version: 1,
            resolution_cache_ttl_secs: 30,
            records: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// Deadline for every store call and origin fetch on the request path
    pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7379".to_string(),
            request_timeout_ms: 2_000,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    pub path: Option<String>,
}

impl CacheConfig {
    /// Parse a TOML document and validate it
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or fails validation.
    pub fn from_toml_str(doc: &str) -> Result<Self> {
        let config: Self = toml::from_str(doc).context("Failed to parse TOML cache config")?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document and validate it
    ///
    /// # Errors
    ///
    /// Returns an error if the document is malformed or fails validation.
    pub fn from_json_str(doc: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(doc).context("Failed to parse JSON cache config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, choosing the format from its extension
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let doc = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&doc),
            _ => Self::from_toml_str(&doc),
        }
    }

    /// Resolve the Redis URL from the document or `REDIS_URL`
    #[must_use]
    pub fn resolved_redis_url(&self) -> Option<String> {
        self.redis_url
            .clone()
            .or_else(|| std::env::var("REDIS_URL").ok())
    }

    /// Longest finite TTL any entry can be written with
    #[must_use]
    pub fn longest_ttl(&self) -> Duration {
        let route_max = self
            .page
            .route_classes
            .iter()
            .filter_map(|rule| rule.ttl_secs)
            .max()
            .unwrap_or(0);
        Duration::from_secs(
            self.page
                .default_ttl_secs
                .max(self.object.default_ttl_secs)
                .max(route_max),
        )
    }

    /// Reject inconsistent documents
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Config`] describing the first violation.
    pub fn validate(&self) -> Result<(), CacheError> {
        let fail = |msg: String| Err(CacheError::Config(msg));

        if self.page.memory_ceiling_bytes == 0 || self.object.memory_ceiling_bytes == 0 {
            return fail("memory ceilings must be non-zero".into());
        }
        if self.page.max_entry_fraction == 0 {
            return fail("page.max_entry_fraction must be non-zero".into());
        }
        if self.stampede.lease_expiry_ms == 0 || self.stampede.lease_expiry_ms >= 10_000 {
            return fail("stampede.lease_expiry_ms must be within 1..10000".into());
        }
        if self.stampede.initial_backoff_ms == 0
            || self.stampede.initial_backoff_ms > self.stampede.max_backoff_ms
        {
            return fail("stampede backoff must satisfy 0 < initial <= max".into());
        }
        if self.stampede.retry_window() < self.stampede.lease_expiry() {
            return fail(format!(
                "stampede retries cover {}ms, shorter than lease_expiry_ms {}",
                self.stampede.retry_window().as_millis(),
                self.stampede.lease_expiry_ms
            ));
        }
        if self.invalidation.queue_depth == 0 || self.invalidation.replay_capacity == 0 {
            return fail("invalidation queue_depth and replay_capacity must be non-zero".into());
        }
        if self.variation.default_device_class.is_empty()
            || self.variation.default_locale.is_empty()
        {
            return fail("variation defaults must be non-empty".into());
        }

        let mut seen = HashSet::new();
        for param in &self.variation.query_param_whitelist {
            if !seen.insert(param.as_str()) {
                return fail(format!("duplicate whitelisted query parameter `{param}`"));
            }
        }

        let mut replica_ids = HashSet::new();
        for id in &self.replica.replicas {
            if id.trim().is_empty() || !replica_ids.insert(id.as_str()) {
                return fail(format!("replica ids must be unique and non-empty, got `{id}`"));
            }
        }

        for rule in &self.page.route_classes {
            if !rule.prefix.starts_with('/') {
                return fail(format!("route prefix `{}` must start with '/'", rule.prefix));
            }
            if rule.immutable && rule.non_cacheable {
                return fail(format!(
                    "route prefix `{}` cannot be both immutable and non-cacheable",
                    rule.prefix
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.page.default_ttl_secs, 300);
        assert_eq!(config.invalidation.channel, "cache:invalidate");
    }

    #[test]
    fn test_toml_document() {
        let doc = r#"
            namespace_salt = { version = 3, value = "pepper" }

            [variation]
            locales = ["en", "fr"]
            query_param_whitelist = ["page"]

            [page]
            default_ttl_secs = 120
            route_classes = [
                { prefix = "/assets", immutable = true },
                { prefix = "/news", ttl_secs = 30 },
            ]

            [replica]
            replicas = ["replica-a", "replica-b"]
            policy = "least_loaded"

            [[tenants.records]]
            id = "acme"
            hosts = ["acme.example.com"]
        "#;

        let config = CacheConfig::from_toml_str(doc).unwrap();
        assert_eq!(config.namespace_salt.version, 3);
        assert_eq!(config.page.route_classes.len(), 2);
        assert_eq!(config.replica.policy, ReplicaPolicy::LeastLoaded);
        assert_eq!(config.tenants.records[0].id, "acme");
        // Untouched sections keep their defaults
        assert_eq!(config.object.default_ttl_secs, 60);
        assert_eq!(config.longest_ttl(), Duration::from_secs(120));
    }

    #[test]
    fn test_rejects_conflicting_route_rule() {
        let doc = r#"
            [page]
            route_classes = [{ prefix = "/x", immutable = true, non_cacheable = true }]
        "#;
        assert!(CacheConfig::from_toml_str(doc).is_err());
    }

    #[test]
    fn test_rejects_long_lease() {
        let mut config = CacheConfig::default();
        config.stampede.lease_expiry_ms = 30_000;
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));
    }

    #[test]
    fn test_rejects_retry_budget_shorter_than_lease() {
        let mut config = CacheConfig::default();
        config.stampede.max_wait_retries = 1;
        config.stampede.initial_backoff_ms = 10;
        config.stampede.max_backoff_ms = 10;
        assert_eq!(config.stampede.retry_window(), Duration::from_millis(10));
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));
    }

    #[test]
    fn test_default_retry_budget_outlasts_lease() {
        let config = StampedeConfig::default();
        assert_eq!(config.retry_window(), Duration::from_millis(6_270));
        assert_eq!(config.follower_deadline(), Duration::from_millis(11_270));
    }

    #[test]
    fn test_retry_window_sums_backoff() {
        let config = InvalidationConfig {
            max_purge_retries: 3,
            purge_backoff_ms: 10,
            ..InvalidationConfig::default()
        };
        assert_eq!(config.retry_window(), Duration::from_millis(70));
    }
}
