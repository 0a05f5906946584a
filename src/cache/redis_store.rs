//! Redis-backed cache store
//!
//! A `ConnectionManager` reconnects on its own after the server goes away;
//! every command is bounded by the configured operation timeout so a stalled
//! store degrades into errors the callers already tolerate.

use crate::cache::store::CacheStore;
use crate::common::{Error, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::future::Future;
use std::time::Duration;

/// INCR, then set the expiry only if this increment created the counter
const INCR_WITH_EXPIRY: &str = r"
local n = redis.call('INCR', KEYS[1])
if n == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return n
";

pub struct RedisCacheStore {
    conn: ConnectionManager,
    incr_script: redis::Script,
    op_timeout: Duration,
}

impl RedisCacheStore {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379/0`). Fails if the first
    /// connection cannot be established.
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(op_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| Error::Timeout(format!("connecting to cache store {}", url)))??;

        tracing::info!(url = %redact(url), "Connected to Redis cache store");
        Ok(Self {
            conn,
            incr_script: redis::Script::new(INCR_WITH_EXPIRY),
            op_timeout,
        })
    }

    async fn bounded<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(res) => res.map_err(Error::from),
            Err(_) => Err(Error::Timeout(format!("redis {}", op))),
        }
    }
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        self.bounded("GET", conn.get::<_, Option<Vec<u8>>>(key)).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let millis = ttl.as_millis().max(1) as u64;
        self.bounded("PSETEX", conn.pset_ex::<_, _, ()>(key, value, millis))
            .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        self.bounded("DEL", conn.del::<_, ()>(key)).await
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64> {
        let mut conn = self.conn.clone();
        let millis = ttl.as_millis().max(1) as u64;
        let mut invocation = self.incr_script.key(key);
        invocation.arg(millis);
        let count: u64 = self
            .bounded("EVALSHA", invocation.invoke_async(&mut conn))
            .await?;
        Ok(count)
    }
}

/// Hide credentials embedded in a Redis URL before logging it
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}
