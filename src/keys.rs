//! Cache key construction
//!
//! Keys have the shape `{namespace}:{tier}:{route}[:{variation}]`. The
//! namespace is the tenant's, so a key can never address another tenant's
//! data. Only declared variation axes (device class, locale, whitelisted
//! query parameters, auth state) influence the variation segment; any other
//! request facet is ignored. Hashed parts are salted with the persisted
//! [`NamespaceSalt`], never with per-process randomness, so the same request
//! maps to the same key across restarts.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{NamespaceSalt, PageStoreConfig, RouteRule, VariationConfig};
use crate::entry::Ttl;
use crate::tenant::TenantContext;

/// Routes longer than this are replaced by their digest
const MAX_ROUTE_FINGERPRINT: usize = 256;
/// Hex characters kept from a SHA-256 digest (64 bits)
const DIGEST_HEX_LEN: usize = 16;

/// Storage tier a key belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Page,
    Object,
}

impl Tier {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Page => "page",
            Self::Object => "obj",
        }
    }

    fn parse(segment: &str) -> Option<Self> {
        match segment {
            "page" => Some(Self::Page),
            "obj" => Some(Self::Object),
            _ => None,
        }
    }
}

/// Immutable structured cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    namespace: String,
    tier: Tier,
    route: String,
    variation: Option<String>,
    rendered: String,
}

impl CacheKey {
    fn new(namespace: &str, tier: Tier, route: String, variation: Option<String>) -> Self {
        let rendered = match &variation {
            Some(variation) => format!("{namespace}:{}:{route}:{variation}", tier.as_str()),
            None => format!("{namespace}:{}:{route}", tier.as_str()),
        };
        Self {
            namespace: namespace.to_string(),
            tier,
            route,
            variation,
            rendered,
        }
    }

    /// Parse a rendered key, as received over the wire protocol
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.splitn(4, ':');
        let namespace = parts.next().filter(|ns| !ns.is_empty())?;
        let tier = Tier::parse(parts.next()?)?;
        let route = parts.next().filter(|route| !route.is_empty())?;
        let variation = parts.next().map(str::to_string);
        if variation.as_deref().is_some_and(|v| v.is_empty() || v.contains(':')) {
            return None;
        }
        Some(Self::new(namespace, tier, route.to_string(), variation))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.rendered
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn tier(&self) -> Tier {
        self.tier
    }

    #[must_use]
    pub fn route(&self) -> &str {
        &self.route
    }

    #[must_use]
    pub fn variation(&self) -> Option<&str> {
        self.variation.as_deref()
    }

    #[must_use]
    pub fn belongs_to(&self, tenant: &TenantContext) -> bool {
        self.namespace == tenant.namespace()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.rendered
    }
}

/// Request facts that may influence a page key.
///
/// `extra` carries every other request facet (user agent, cookies, tracking
/// parameters...). It exists so callers can hand over the whole request;
/// key construction never reads it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Variation {
    pub device_class: Option<String>,
    pub locale: Option<String>,
    pub query: Vec<(String, String)>,
    pub authenticated: bool,
    pub extra: BTreeMap<String, String>,
}

impl Variation {
    #[must_use]
    pub fn new(device_class: impl Into<String>, locale: impl Into<String>) -> Self {
        Self {
            device_class: Some(device_class.into()),
            locale: Some(locale.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_extra(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn authenticated(mut self, authenticated: bool) -> Self {
        self.authenticated = authenticated;
        self
    }
}

/// Page-tier caching policy of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    Cacheable(Duration),
    Immutable,
    /// Session-specific or authenticated; never enters the page tier
    NonCacheable,
}

impl RouteClass {
    #[must_use]
    pub fn ttl(&self) -> Option<Ttl> {
        match self {
            Self::Cacheable(ttl) => Some(Ttl::Expires(*ttl)),
            Self::Immutable => Some(Ttl::Never),
            Self::NonCacheable => None,
        }
    }

    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        !matches!(self, Self::NonCacheable)
    }
}

/// Deterministic key derivation from tenant, route and declared axes
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    axes: VariationConfig,
    default_page_ttl: Duration,
    route_rules: Vec<RouteRule>,
    salt: NamespaceSalt,
}

impl CacheKeyBuilder {
    #[must_use]
    pub fn new(axes: VariationConfig, page: &PageStoreConfig, salt: NamespaceSalt) -> Self {
        let mut route_rules = page.route_classes.clone();
        // Longest prefix first so the most specific rule wins
        route_rules.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Self {
            axes,
            default_page_ttl: page.default_ttl(),
            route_rules,
            salt,
        }
    }

    /// Decide the page-tier policy for a route
    #[must_use]
    pub fn classify(&self, route: &str, variation: &Variation) -> RouteClass {
        if variation.authenticated && !self.axes.vary_on_auth_state {
            return RouteClass::NonCacheable;
        }

        let path = strip_query(route);
        let rule = self
            .route_rules
            .iter()
            .find(|rule| prefix_matches(&rule.prefix, path));

        match rule {
            Some(rule) if rule.non_cacheable => RouteClass::NonCacheable,
            Some(rule) if rule.immutable => RouteClass::Immutable,
            Some(RouteRule {
                ttl_secs: Some(secs),
                ..
            }) => RouteClass::Cacheable(Duration::from_secs(*secs)),
            _ => RouteClass::Cacheable(self.default_page_ttl),
        }
    }

    /// Build the page-tier key for a request
    #[must_use]
    pub fn page_key(&self, tenant: &TenantContext, route: &str, variation: &Variation) -> CacheKey {
        self.build(tenant, Tier::Page, route, variation)
    }

    /// Build a key for any tier from a route and its variation
    #[must_use]
    pub fn build(
        &self,
        tenant: &TenantContext,
        tier: Tier,
        route: &str,
        variation: &Variation,
    ) -> CacheKey {
        CacheKey::new(
            tenant.namespace(),
            tier,
            self.route_fingerprint(route),
            Some(self.variation_fingerprint(variation)),
        )
    }

    /// Build an object-tier key for a named fragment and its parameters
    #[must_use]
    pub fn object_key(
        &self,
        tenant: &TenantContext,
        fragment: &str,
        params: &BTreeMap<String, String>,
    ) -> CacheKey {
        let variation = if params.is_empty() {
            None
        } else {
            let pairs: Vec<(&str, &str)> = params
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str()))
                .collect();
            Some(format!("p{}", self.digest(&pairs)))
        };
        CacheKey::new(tenant.namespace(), Tier::Object, sanitize(fragment), variation)
    }

    fn route_fingerprint(&self, route: &str) -> String {
        let path = strip_query(route);
        let mut normalized = String::with_capacity(path.len() + 1);
        if !path.starts_with('/') {
            normalized.push('/');
        }
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            if !normalized.ends_with('/') {
                normalized.push('/');
            }
            normalized.push_str(segment);
        }
        if normalized.is_empty() {
            normalized.push('/');
        }

        let sanitized = sanitize(&normalized);
        if sanitized.len() > MAX_ROUTE_FINGERPRINT {
            format!("h{}", self.digest(&[("route", sanitized.as_str())]))
        } else {
            sanitized
        }
    }

    fn variation_fingerprint(&self, variation: &Variation) -> String {
        let device = pick_declared(
            variation.device_class.as_deref(),
            &self.axes.device_classes,
            &self.axes.default_device_class,
        );
        let locale = pick_declared(
            variation.locale.as_deref(),
            &self.axes.locales,
            &self.axes.default_locale,
        );

        let mut parts = vec![variation_part(device), variation_part(locale)];

        let mut whitelisted: Vec<(&str, &str)> = variation
            .query
            .iter()
            .filter(|(name, _)| self.axes.query_param_whitelist.iter().any(|w| w == name))
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();
        if !whitelisted.is_empty() {
            whitelisted.sort_unstable();
            parts.push(format!("q{}", self.digest(&whitelisted)));
        }

        if self.axes.vary_on_auth_state && variation.authenticated {
            parts.push("auth".to_string());
        }

        parts.join("-")
    }

    fn digest(&self, pairs: &[(&str, &str)]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("v{}\0{}\0", self.salt.version, self.salt.value).as_bytes());
        for (name, value) in pairs {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b"\0");
        }
        let mut digest = hex::encode(hasher.finalize());
        digest.truncate(DIGEST_HEX_LEN);
        digest
    }
}

fn strip_query(route: &str) -> &str {
    route.split(['?', '#']).next().unwrap_or_default()
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" || prefix.ends_with('/') {
        return path.starts_with(prefix);
    }
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// Declared value (case-insensitive) or the configured default
fn pick_declared<'a>(value: Option<&str>, declared: &'a [String], default: &'a str) -> &'a str {
    value
        .and_then(|value| declared.iter().find(|d| d.eq_ignore_ascii_case(value)))
        .map_or(default, String::as_str)
}

/// Escape characters that would break key segmentation
fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            ':' => out.push_str("%3A"),
            '%' => out.push_str("%25"),
            c if c.is_whitespace() || c.is_control() => {
                out.push_str(&format!("%{:02X}", u32::from(c) & 0xFF));
            }
            c => out.push(c),
        }
    }
    out
}

/// Like [`sanitize`], and also escapes the `-` that joins variation parts
fn variation_part(raw: &str) -> String {
    sanitize(raw).replace('-', "%2D")
}
