//! Redis Store - Distributed Object Tier
//!
//! Redis-backed [`EntryStore`] shared by every cache instance, plus the
//! matching [`LeaseStore`]. Entries are stored as JSON under their rendered
//! key; each namespace keeps a tag index (`__tag:{ns}:{tag}`) and a member
//! set (`__ns:{ns}`) so purges never scan the keyspace.
//!
//! Index sets carry the expiry of their longest-lived member and lose a
//! member whenever its entry is removed or purged, so they never outlive
//! what they index.
//!
//! The memory ceiling is applied with `maxmemory` and the `allkeys-lru`
//! policy, so memory pressure evicts regardless of declared TTL. If an index
//! set itself is evicted, its entries fall back to TTL expiry.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info, warn};

use crate::entry::{CacheEntry, Freshness, now_ms};
use crate::error::StoreError;
use crate::traits::{EntryStore, LeaseStore, PutOutcome, StoreUsage};

// KEYS: entry, namespace index, tag indexes. ARGV: entry JSON, expiry in
// ms (0 keeps it forever), tag index prefix
const PUT_ENTRY_SCRIPT: &str = r"
local ttl = tonumber(ARGV[2])
local previous = redis.call('GET', KEYS[1])
if previous then
    local ok, entry = pcall(cjson.decode, previous)
    if ok and type(entry.tags) == 'table' then
        for _, tag in ipairs(entry.tags) do
            redis.call('SREM', ARGV[3] .. tag, KEYS[1])
        end
    end
end
if ttl > 0 then
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ttl)
else
    redis.call('SET', KEYS[1], ARGV[1])
end
for i = 2, #KEYS do
    local existed = redis.call('EXISTS', KEYS[i]) == 1
    redis.call('SADD', KEYS[i], KEYS[1])
    if ttl == 0 then
        redis.call('PERSIST', KEYS[i])
    elseif not existed then
        redis.call('PEXPIRE', KEYS[i], ttl)
    else
        local current = redis.call('PTTL', KEYS[i])
        if current >= 0 and current < ttl then
            redis.call('PEXPIRE', KEYS[i], ttl)
        end
    end
end
return 1
";

// KEYS: entry, namespace index. ARGV: tag index prefix
const REMOVE_ENTRY_SCRIPT: &str = r"
local raw = redis.call('GET', KEYS[1])
if raw then
    local ok, entry = pcall(cjson.decode, raw)
    if ok and type(entry.tags) == 'table' then
        for _, tag in ipairs(entry.tags) do
            redis.call('SREM', ARGV[1] .. tag, KEYS[1])
        end
    end
end
redis.call('SREM', KEYS[2], KEYS[1])
return redis.call('DEL', KEYS[1])
";

// KEYS: index being purged, namespace index. ARGV: tag index prefix
const PURGE_SET_SCRIPT: &str = r"
local members = redis.call('SMEMBERS', KEYS[1])
local purged = 0
for _, key in ipairs(members) do
    local raw = redis.call('GET', key)
    if raw then
        local ok, entry = pcall(cjson.decode, raw)
        if ok and type(entry.tags) == 'table' then
            for _, tag in ipairs(entry.tags) do
                local index = ARGV[1] .. tag
                if index ~= KEYS[1] then
                    redis.call('SREM', index, key)
                end
            end
        end
        purged = purged + redis.call('DEL', key)
    end
    if KEYS[2] ~= KEYS[1] then
        redis.call('SREM', KEYS[2], key)
    end
end
redis.call('DEL', KEYS[1])
return purged
";

const RELEASE_LEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

fn tag_index(namespace: &str, tag: &str) -> String {
    format!("__tag:{namespace}:{tag}")
}

fn namespace_index(namespace: &str) -> String {
    format!("__ns:{namespace}")
}

/// Open a Redis connection manager and verify it with `PING`
async fn connect(redis_url: &str) -> Result<ConnectionManager> {
    let client = Client::open(redis_url)
        .with_context(|| format!("Failed to create Redis client with URL: {redis_url}"))?;

    let conn_manager = ConnectionManager::new(client)
        .await
        .context("Failed to establish Redis connection manager")?;

    let mut conn = conn_manager.clone();
    let _: String = redis::cmd("PING")
        .query_async(&mut conn)
        .await
        .context("Redis PING health check failed")?;

    Ok(conn_manager)
}

/// Redis-backed entry store with `ConnectionManager` for automatic reconnection
pub struct RedisStore {
    conn_manager: ConnectionManager,
    capacity_bytes: usize,
    stale_retention: Duration,
}

impl RedisStore {
    /// Connect and apply the memory ceiling
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis client cannot be created or connection fails.
    pub async fn with_url(
        redis_url: &str,
        capacity_bytes: usize,
        stale_retention: Duration,
    ) -> Result<Self> {
        info!(redis_url = %redis_url, "Initializing Redis entry store");
        let conn_manager = connect(redis_url).await?;

        let store = Self {
            conn_manager,
            capacity_bytes,
            stale_retention,
        };
        store.apply_memory_policy().await;

        info!(redis_url = %redis_url, capacity_bytes, "Redis entry store connected");
        Ok(store)
    }

    /// Managed Redis deployments often forbid `CONFIG`; the ceiling is then
    /// whatever the operator configured.
    async fn apply_memory_policy(&self) {
        let mut conn = self.conn_manager.clone();
        let result: redis::RedisResult<()> = redis::pipe()
            .cmd("CONFIG")
            .arg("SET")
            .arg("maxmemory")
            .arg(self.capacity_bytes)
            .ignore()
            .cmd("CONFIG")
            .arg("SET")
            .arg("maxmemory-policy")
            .arg("allkeys-lru")
            .ignore()
            .query_async(&mut conn)
            .await;
        if let Err(e) = result {
            warn!(error = %e, "Could not apply maxmemory/allkeys-lru; relying on server config");
        }
    }

    /// Scan keys matching a glob pattern with cursor-based `SCAN`
    ///
    /// # Errors
    ///
    /// Returns an error if the Redis command fails.
    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn_manager.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;

            cursor = next;
            keys.extend(batch);

            if cursor == 0 {
                break;
            }
        }

        debug!(pattern = %pattern, count = keys.len(), "[Redis] Scanned keys matching pattern");
        Ok(keys)
    }

    async fn purge_set(&self, namespace: &str, index_key: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn_manager.clone();
        let purged: usize = Script::new(PURGE_SET_SCRIPT)
            .key(index_key)
            .key(namespace_index(namespace))
            .arg(tag_index(namespace, ""))
            .invoke_async(&mut conn)
            .await?;
        Ok(purged)
    }

    async fn info_field(&self, section: &str, field: &str) -> Option<u64> {
        let mut conn = self.conn_manager.clone();
        let info: String = redis::cmd("INFO")
            .arg(section)
            .query_async(&mut conn)
            .await
            .ok()?;
        info.lines()
            .find_map(|line| line.strip_prefix(field)?.strip_prefix(':'))
            .and_then(|value| value.trim().parse().ok())
    }
}

#[async_trait]
impl EntryStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let mut conn = self.conn_manager.clone();
        let raw: Option<Vec<u8>> = conn.get(key).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let entry: CacheEntry = serde_json::from_slice(&raw)?;
        if entry.freshness(now_ms(), self.stale_retention) == Freshness::Dead {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn put(&self, entry: CacheEntry) -> Result<PutOutcome, StoreError> {
        if entry.size_bytes() > self.capacity_bytes {
            return Ok(PutOutcome::Refused);
        }

        let encoded = serde_json::to_vec(&entry)?;
        let namespace = entry.namespace().to_string();
        let expiry_ms = entry.ttl.duration().map(|ttl| {
            u64::try_from((ttl + self.stale_retention).as_millis()).unwrap_or(u64::MAX)
        });

        let script = Script::new(PUT_ENTRY_SCRIPT);
        let mut invocation = script.prepare_invoke();
        invocation.key(&entry.key).key(namespace_index(&namespace));
        for tag in &entry.tags {
            invocation.key(tag_index(&namespace, tag));
        }
        invocation
            .arg(encoded)
            .arg(expiry_ms.map_or(0, |ms| ms.max(1)))
            .arg(tag_index(&namespace, ""));

        let mut conn = self.conn_manager.clone();
        let _: i64 = invocation.invoke_async(&mut conn).await?;
        debug!(key = %entry.key, "[Redis] Stored entry");
        Ok(PutOutcome::Stored { evicted: 0 })
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let namespace = key.split(':').next().unwrap_or_default();
        let mut conn = self.conn_manager.clone();
        let removed: usize = Script::new(REMOVE_ENTRY_SCRIPT)
            .key(key)
            .key(namespace_index(namespace))
            .arg(tag_index(namespace, ""))
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn purge_tag(&self, namespace: &str, tag: &str) -> Result<usize, StoreError> {
        self.purge_set(namespace, &tag_index(namespace, tag)).await
    }

    async fn purge_namespace(&self, namespace: &str) -> Result<usize, StoreError> {
        let purged = self.purge_set(namespace, &namespace_index(namespace)).await?;
        let tag_indexes = self.scan_keys(&format!("__tag:{namespace}:*")).await?;
        if !tag_indexes.is_empty() {
            let mut conn = self.conn_manager.clone();
            let _: usize = conn.del(&tag_indexes).await?;
        }
        Ok(purged)
    }

    async fn entries(&self) -> Result<Vec<CacheEntry>, StoreError> {
        let mut entries = Vec::new();
        for key in self.scan_keys("*:*").await? {
            if key.starts_with("__") {
                continue;
            }
            if let Some(entry) = self.get(&key).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    async fn usage(&self) -> StoreUsage {
        let mut conn = self.conn_manager.clone();
        let entries: usize = redis::cmd("DBSIZE")
            .query_async(&mut conn)
            .await
            .unwrap_or(0);
        StoreUsage {
            entries,
            bytes: self
                .info_field("memory", "used_memory")
                .await
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(0),
            capacity_bytes: self.capacity_bytes,
            evictions: self.info_field("stats", "evicted_keys").await.unwrap_or(0),
        }
    }

    async fn health_check(&self) -> bool {
        let mut conn = self.conn_manager.clone();
        let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        pong.is_ok()
    }

    fn name(&self) -> &'static str {
        "Redis"
    }
}

/// Fetch leases held in Redis with `SET NX PX`
pub struct RedisLeaseStore {
    conn_manager: ConnectionManager,
}

impl RedisLeaseStore {
    /// # Errors
    ///
    /// Returns an error if the Redis client cannot be created or connection fails.
    pub async fn with_url(redis_url: &str) -> Result<Self> {
        Ok(Self {
            conn_manager: connect(redis_url).await?,
        })
    }

    fn lease_key(key: &str) -> String {
        format!("__lease:{key}")
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn try_acquire(
        &self,
        key: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn_manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(Self::lease_key(key))
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &str, holder: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn_manager.clone();
        let released: usize = Script::new(RELEASE_LEASE_SCRIPT)
            .key(Self::lease_key(key))
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;
        Ok(released > 0)
    }

    fn name(&self) -> &'static str {
        "Redis"
    }
}
