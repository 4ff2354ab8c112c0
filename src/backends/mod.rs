//! Store Backend Implementations
//!
//! # Available Backends
//!
//! ## In-Process
//! - **`MemoryStore`** - size-aware LRU with a per-namespace tag index (default
//!   for both tiers)
//! - **`MemoryLeaseStore`** - `DashMap`-backed fetch leases
//! - **`FlakyStore`** - wrapper that simulates outages and transient purge
//!   failures
//!
//! ## Distributed (feature `redis`)
//! - **`RedisStore`** - object tier shared across instances, `allkeys-lru`
//! - **`RedisLeaseStore`** - `SET NX PX` fetch leases
//!
//! # Usage
//!
//! ```rust
//! use multi_tenant_cache::backends::{MemoryLeaseStore, MemoryStore};
//! use std::time::Duration;
//!
//! let store = MemoryStore::new("object", 64 * 1024 * 1024, Duration::from_secs(30));
//! let leases = MemoryLeaseStore::new();
//! ```

pub mod flaky;
pub mod memory;
pub mod memory_lease;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use flaky::FlakyStore;
pub use memory::MemoryStore;
pub use memory_lease::MemoryLeaseStore;

#[cfg(feature = "redis")]
pub use redis_store::{RedisLeaseStore, RedisStore};
