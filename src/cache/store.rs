//! Cache store contract
//!
//! The cache store is shared by every instance: it holds entity snapshots for
//! the read-through cache and the fixed-window counters of the rate limiter.

use crate::common::Result;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// `Ok(None)` is a miss.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Atomically increments the counter at `key` and returns the new value.
    /// The expiry is set only when the increment creates the counter.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64>;
}
