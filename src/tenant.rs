//! Tenant resolution
//!
//! Maps an inbound request identity (explicit tenant token, host header or
//! path prefix) to a [`TenantContext`]. Resolution is a pure function of the
//! discriminating fields and the versioned tenant table, so results are
//! memoized in a Moka cache for the table's validity window.

use std::collections::HashMap;
use std::time::Duration;

use moka::future::Cache;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::TenantTableConfig;
use crate::error::CacheError;

/// Identifier reserved for events that fan out to every tenant
pub const ALL_TENANTS: &str = "*";

const MAX_TENANT_ID_LEN: usize = 64;

fn default_active() -> bool {
    true
}

/// One row of the tenant table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub id: String,
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Single-segment prefix such as `/acme`
    #[serde(default)]
    pub path_prefix: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

impl TenantRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hosts: Vec::new(),
            path_prefix: None,
            active: true,
        }
    }

    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.hosts.push(host.into());
        self
    }

    #[must_use]
    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }
}

/// Isolation boundary of one tenant
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantContext {
    id: String,
    namespace: String,
    active: bool,
}

impl TenantContext {
    /// Context for a tenant id, validating that it is safe as a namespace
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidTenantId`] for empty, oversized or
    /// non `[A-Za-z0-9._-]` identifiers.
    pub fn for_tenant(id: &str) -> Result<Self, CacheError> {
        validate_tenant_id(id)?;
        Ok(Self {
            id: id.to_string(),
            namespace: id.to_string(),
            active: true,
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Prefix of every key owned by this tenant
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active
    }
}

fn validate_tenant_id(id: &str) -> Result<(), CacheError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_TENANT_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(CacheError::InvalidTenantId(id.to_string()))
    }
}

/// Fields of an inbound request that can discriminate a tenant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestIdentity {
    pub tenant_token: Option<String>,
    pub host: Option<String>,
    pub path: String,
}

impl RequestIdentity {
    pub fn from_host(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            tenant_token: None,
            host: Some(host.into()),
            path: path.into(),
        }
    }

    pub fn from_path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.tenant_token = Some(token.into());
        self
    }

    fn normalized_host(&self) -> Option<String> {
        self.host.as_deref().map(|host| {
            host.rsplit_once(':')
                .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
                .map_or(host, |(name, _)| name)
                .trim_end_matches('.')
                .to_ascii_lowercase()
        })
    }

    fn first_segment(&self) -> Option<String> {
        self.path
            .split(['?', '#'])
            .next()
            .and_then(|path| path.split('/').find(|segment| !segment.is_empty()))
            .map(|segment| format!("/{segment}"))
    }

    fn describe(&self) -> String {
        format!(
            "token={:?} host={:?} path={}",
            self.tenant_token, self.host, self.path
        )
    }
}

#[derive(Debug, Default)]
struct TenantTable {
    version: u64,
    records: HashMap<String, TenantRecord>,
    hosts: HashMap<String, String>,
    prefixes: HashMap<String, String>,
}

impl TenantTable {
    fn insert(&mut self, record: TenantRecord) -> Result<(), CacheError> {
        validate_tenant_id(&record.id)?;
        if let Some(prefix) = &record.path_prefix
            && (!prefix.starts_with('/') || prefix.len() < 2 || prefix.trim_start_matches('/').contains('/'))
        {
            return Err(CacheError::Config(format!(
                "tenant `{}` path prefix `{prefix}` must be a single segment like /name",
                record.id
            )));
        }

        if let Some(previous) = self.records.remove(&record.id) {
            self.unindex(&previous);
        }
        for host in &record.hosts {
            self.hosts.insert(host.to_ascii_lowercase(), record.id.clone());
        }
        if let Some(prefix) = &record.path_prefix {
            self.prefixes.insert(prefix.clone(), record.id.clone());
        }
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    fn unindex(&mut self, record: &TenantRecord) {
        self.hosts.retain(|_, id| id != &record.id);
        self.prefixes.retain(|_, id| id != &record.id);
    }

    fn lookup(&self, identity: &RequestIdentity) -> Option<&TenantRecord> {
        let by_token = identity
            .tenant_token
            .as_deref()
            .and_then(|token| self.records.get(token));
        let by_host = || {
            identity
                .normalized_host()
                .and_then(|host| self.hosts.get(&host))
                .and_then(|id| self.records.get(id))
        };
        let by_prefix = || {
            identity
                .first_segment()
                .and_then(|segment| self.prefixes.get(&segment))
                .and_then(|id| self.records.get(id))
        };
        by_token.or_else(by_host).or_else(by_prefix)
    }
}

/// Versioned tenant table with memoized resolution
pub struct TenantRegistry {
    table: RwLock<TenantTable>,
    resolutions: Cache<String, Option<TenantContext>>,
}

impl TenantRegistry {
    /// Create a registry from initial records
    ///
    /// # Errors
    ///
    /// Returns an error if a record carries an invalid id or path prefix.
    pub fn new(
        records: Vec<TenantRecord>,
        table_version: u64,
        validity: Duration,
    ) -> Result<Self, CacheError> {
        let mut table = TenantTable {
            version: table_version,
            ..TenantTable::default()
        };
        for record in records {
            table.insert(record)?;
        }

        info!(
            tenants = table.records.len(),
            table_version, "Tenant registry initialized"
        );

        Ok(Self {
            table: RwLock::new(table),
            resolutions: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(validity)
                .build(),
        })
    }

    /// # Errors
    ///
    /// Returns an error if the configured table contains invalid records.
    pub fn from_config(config: &TenantTableConfig) -> Result<Self, CacheError> {
        Self::new(
            config.records.clone(),
            config.table_version,
            Duration::from_secs(config.resolution_cache_ttl_secs),
        )
    }

    /// Resolve a request identity to an active tenant
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::TenantUnresolved`] when no active tenant
    /// matches; callers must then bypass caching entirely.
    pub async fn resolve(&self, identity: &RequestIdentity) -> Result<TenantContext, CacheError> {
        let memo_key = format!(
            "{}|{}|{}|{}",
            self.table_version(),
            identity.tenant_token.as_deref().unwrap_or_default(),
            identity.normalized_host().unwrap_or_default(),
            identity.first_segment().unwrap_or_default(),
        );

        let resolved = if let Some(cached) = self.resolutions.get(&memo_key).await {
            cached
        } else {
            let resolved = {
                let table = self.table.read();
                table
                    .lookup(identity)
                    .filter(|record| record.active)
                    .map(|record| TenantContext {
                        id: record.id.clone(),
                        namespace: record.id.clone(),
                        active: record.active,
                    })
            };
            self.resolutions.insert(memo_key, resolved.clone()).await;
            resolved
        };

        resolved.ok_or_else(|| {
            debug!(identity = %identity.describe(), "Tenant resolution failed");
            CacheError::TenantUnresolved(identity.describe())
        })
    }

    /// Add or replace a tenant, bumping the table version
    ///
    /// # Errors
    ///
    /// Returns an error if the record is invalid.
    pub fn provision(&self, record: TenantRecord) -> Result<(), CacheError> {
        let id = record.id.clone();
        {
            let mut table = self.table.write();
            table.insert(record)?;
            table.version += 1;
        }
        self.resolutions.invalidate_all();
        info!(tenant = %id, "Tenant provisioned");
        Ok(())
    }

    /// Mark a tenant inactive. Its requests stop resolving immediately;
    /// its namespace is reclaimed by the next sweep.
    pub fn deactivate(&self, id: &str) -> bool {
        let found = {
            let mut table = self.table.write();
            let found = table.records.get_mut(id).map(|record| record.active = false);
            if found.is_some() {
                table.version += 1;
            }
            found.is_some()
        };
        if found {
            self.resolutions.invalidate_all();
            info!(tenant = %id, "Tenant deactivated");
        }
        found
    }

    /// Drop a tenant from the table entirely
    pub fn remove(&self, id: &str) -> bool {
        let removed = {
            let mut table = self.table.write();
            let removed = table.records.remove(id);
            if let Some(record) = &removed {
                table.unindex(record);
                table.version += 1;
            }
            removed.is_some()
        };
        if removed {
            self.resolutions.invalidate_all();
        }
        removed
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<TenantContext> {
        self.table.read().records.get(id).map(|record| TenantContext {
            id: record.id.clone(),
            namespace: record.id.clone(),
            active: record.active,
        })
    }

    /// All known tenants, active or not
    #[must_use]
    pub fn tenants(&self) -> Vec<TenantContext> {
        let mut tenants: Vec<TenantContext> = self
            .table
            .read()
            .records
            .values()
            .map(|record| TenantContext {
                id: record.id.clone(),
                namespace: record.id.clone(),
                active: record.active,
            })
            .collect();
        tenants.sort_by(|a, b| a.id.cmp(&b.id));
        tenants
    }

    #[must_use]
    pub fn inactive_tenants(&self) -> Vec<TenantContext> {
        self.tenants()
            .into_iter()
            .filter(|tenant| !tenant.active)
            .collect()
    }

    #[must_use]
    pub fn table_version(&self) -> u64 {
        self.table.read().version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TenantRegistry {
        TenantRegistry::new(
            vec![
                TenantRecord::new("acme").with_host("acme.example.com"),
                TenantRecord::new("globex").with_path_prefix("/globex"),
            ],
            1,
            Duration::from_secs(30),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_resolve_by_host_ignores_port_and_case() {
        let registry = registry();
        let tenant = registry
            .resolve(&RequestIdentity::from_host("ACME.example.com:8443", "/"))
            .await
            .unwrap();
        assert_eq!(tenant.id(), "acme");
        assert_eq!(tenant.namespace(), "acme");
    }

    #[tokio::test]
    async fn test_resolve_by_path_prefix_and_token() {
        let registry = registry();
        let by_path = registry
            .resolve(&RequestIdentity::from_path("/globex/products?page=1"))
            .await
            .unwrap();
        assert_eq!(by_path.id(), "globex");

        let by_token = registry
            .resolve(&RequestIdentity::from_host("unknown.example", "/").with_token("acme"))
            .await
            .unwrap();
        assert_eq!(by_token.id(), "acme");
    }

    #[tokio::test]
    async fn test_unknown_tenant_is_unresolved() {
        let registry = registry();
        let result = registry
            .resolve(&RequestIdentity::from_host("nobody.example", "/x"))
            .await;
        assert!(matches!(result, Err(CacheError::TenantUnresolved(_))));
    }

    #[tokio::test]
    async fn test_deactivation_invalidates_memoized_resolution() {
        let registry = registry();
        let identity = RequestIdentity::from_host("acme.example.com", "/");
        assert!(registry.resolve(&identity).await.is_ok());

        let version = registry.table_version();
        assert!(registry.deactivate("acme"));
        assert!(registry.table_version() > version);
        assert!(registry.resolve(&identity).await.is_err());
        assert_eq!(registry.inactive_tenants().len(), 1);
    }

    #[tokio::test]
    async fn test_provision_makes_new_tenant_resolvable() {
        let registry = registry();
        let identity = RequestIdentity::from_host("initech.example.com", "/");
        assert!(registry.resolve(&identity).await.is_err());

        registry
            .provision(TenantRecord::new("initech").with_host("initech.example.com"))
            .unwrap();
        assert_eq!(registry.resolve(&identity).await.unwrap().id(), "initech");
    }

    #[test]
    fn test_rejects_namespace_breaking_ids() {
        assert!(TenantContext::for_tenant("ac:me").is_err());
        assert!(TenantContext::for_tenant("").is_err());
        assert!(TenantContext::for_tenant(ALL_TENANTS).is_err());
        assert!(registry().provision(TenantRecord::new("bad id")).is_err());
    }
}
