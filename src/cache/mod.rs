//! Read-through caching in front of the relational store
//!
//! - `store`: the shared cache store contract
//! - `memory` / `redis_store`: store adapters
//! - `coalesce`: per-key in-flight fetch deduplication
//! - `read_through`: the coalescing cache used by the services

pub mod coalesce;
pub mod memory;
pub mod read_through;
pub mod redis_store;
pub mod store;

pub use coalesce::{Coalesced, Coalescer};
pub use memory::MemoryCacheStore;
pub use read_through::{CoalescingCache, EntityLoader};
pub use redis_store::RedisCacheStore;
pub use store::CacheStore;
