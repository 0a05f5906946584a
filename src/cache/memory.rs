//! In-process cache store
//!
//! Used when no cache URL is configured and by the test-suite. Entries expire
//! lazily on access. `set_available(false)` makes every operation fail, which
//! is how tests simulate an unreachable store.

use crate::cache::store::CacheStore;
use crate::common::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

pub struct MemoryCacheStore {
    map: Mutex<HashMap<String, Entry>>,
    available: AtomicBool,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live (unexpired) entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|e| e.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::CacheStore("memory cache store unavailable".into()))
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.map
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        let mut map = self.lock();
        match map.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                map.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.check_available()?;
        self.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.lock().remove(key);
        Ok(())
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<u64> {
        self.check_available()?;
        let now = Instant::now();
        let mut map = self.lock();
        let current = match map.get(key) {
            Some(entry) if entry.expires_at > now => Some((
                parse_counter(key, &entry.value)?,
                entry.expires_at,
            )),
            _ => None,
        };
        let (next, expires_at) = match current {
            Some((n, expires_at)) => (n + 1, expires_at),
            None => (1, now + ttl),
        };
        map.insert(
            key.to_string(),
            Entry {
                value: next.to_string().into_bytes(),
                expires_at,
            },
        );
        Ok(next)
    }
}

fn parse_counter(key: &str, raw: &[u8]) -> Result<u64> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::CacheStore(format!("value at {} is not a counter", key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let store = MemoryCacheStore::new();
        store.set("user:1", b"alice", Duration::from_secs(5)).await.unwrap();
        assert_eq!(store.get("user:1").await.unwrap().unwrap(), b"alice");

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.get("user:1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_counter_keeps_first_expiry() {
        let store = MemoryCacheStore::new();
        let ttl = Duration::from_secs(60);
        assert_eq!(store.incr_with_expiry("c", ttl).await.unwrap(), 1);
        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(store.incr_with_expiry("c", ttl).await.unwrap(), 2);
        tokio::time::advance(Duration::from_secs(21)).await;
        assert_eq!(store.incr_with_expiry("c", ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_operation() {
        let store = MemoryCacheStore::new();
        store.set_available(false);
        assert!(store.get("k").await.is_err());
        assert!(store.delete("k").await.is_err());
        assert!(store
            .incr_with_expiry("k", Duration::from_secs(1))
            .await
            .is_err());
        store.set_available(true);
        assert!(store.get("k").await.unwrap().is_none());
    }
}
