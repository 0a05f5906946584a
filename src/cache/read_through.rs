//! Coalescing read-through cache with cache-aside writes
//!
//! Reads: cache store hit returns immediately; a miss joins (or opens) the
//! coalescing group for the key, whose single backing fetch populates the
//! store with a fixed TTL. Cache store failures are misses.
//!
//! Writes: mutate the backing store first, then delete the entry. The entry is
//! never rewritten in place. A failed delete is logged and leaves the entry to
//! expire with its TTL.
//!
//! Within one process a read that starts after a write has completed never
//! sees the pre-write value: invalidation detaches the in-flight group for the
//! key, and a fetch that overlapped a write does not populate the store.

use crate::cache::coalesce::Coalescer;
use crate::cache::store::CacheStore;
use crate::common::hash::shard_key;
use crate::common::metrics::METRICS;
use crate::common::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const EPOCH_SLOTS: u64 = 64;

/// Backing-store point lookup for one entity type
#[async_trait]
pub trait EntityLoader<V>: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<V>>;
}

/// Per-slot write counters; a fetch only populates the store if no write
/// touched its slot while it ran
struct WriteEpochs {
    slots: Vec<AtomicU64>,
}

impl WriteEpochs {
    fn new() -> Self {
        Self {
            slots: (0..EPOCH_SLOTS).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    fn slot(&self, key: &str) -> &AtomicU64 {
        &self.slots[shard_key(key, EPOCH_SLOTS) as usize]
    }

    fn current(&self, key: &str) -> u64 {
        self.slot(key).load(Ordering::SeqCst)
    }

    fn bump(&self, key: &str) {
        self.slot(key).fetch_add(1, Ordering::SeqCst);
    }
}

pub struct CoalescingCache<V> {
    namespace: String,
    store: Arc<dyn CacheStore>,
    loader: Arc<dyn EntityLoader<V>>,
    coalescer: Coalescer<Option<V>>,
    epochs: Arc<WriteEpochs>,
    ttl: Duration,
}

impl<V> CoalescingCache<V>
where
    V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// `namespace` prefixes cache keys: `{namespace}:{id}`
    pub fn new(
        namespace: impl Into<String>,
        store: Arc<dyn CacheStore>,
        loader: Arc<dyn EntityLoader<V>>,
        ttl: Duration,
        shards: usize,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            store,
            loader,
            coalescer: Coalescer::new(shards),
            epochs: Arc::new(WriteEpochs::new()),
            ttl,
        }
    }

    pub fn cache_key(&self, id: &str) -> String {
        format!("{}:{}", self.namespace, id)
    }

    /// Read an entity. `Ok(None)` means the backing store has no such entity;
    /// not-found results are not cached.
    pub async fn read(&self, id: &str) -> Result<Option<V>> {
        let key = self.cache_key(id);

        match self.store.get(&key).await {
            Ok(Some(bytes)) => match serde_json::from_slice::<V>(&bytes) {
                Ok(entity) => {
                    METRICS.cache_hits.inc();
                    tracing::debug!(key = %key, "Cache hit");
                    return Ok(Some(entity));
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Undecodable cache entry, refetching");
                }
            },
            Ok(None) => {}
            Err(e) => {
                METRICS.cache_store_errors.inc();
                tracing::warn!(key = %key, error = %e, "Cache store read failed, treating as miss");
            }
        }
        METRICS.cache_misses.inc();

        let store = self.store.clone();
        let loader = self.loader.clone();
        let epochs = self.epochs.clone();
        let ttl = self.ttl;
        let id = id.to_string();
        let fetch_key = key.clone();

        let out = self
            .coalescer
            .run(&key, move || {
                let started_at = epochs.current(&fetch_key);
                async move {
                    METRICS.backing_fetches.inc();
                    let entity = loader.load(&id).await?;
                    if let Some(value) = &entity {
                        populate(store.as_ref(), &epochs, &fetch_key, started_at, value, ttl)
                            .await;
                    }
                    Ok(entity)
                }
            })
            .await?;

        if out.shared {
            METRICS.coalesced_waits.inc();
        }
        Ok(out.value)
    }

    /// Apply `mutation` to the backing store, then invalidate the entry for `id`.
    ///
    /// The mutation's error is returned untouched and nothing is invalidated.
    /// An invalidation failure does not fail the write.
    pub async fn write_then_invalidate<T, Fut>(&self, id: &str, mutation: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let out = mutation.await?;
        self.invalidate(id).await;
        Ok(out)
    }

    /// Delete the cached entry for `id`. Returns `false` if the delete failed.
    pub async fn invalidate(&self, id: &str) -> bool {
        let key = self.cache_key(id);
        self.epochs.bump(&key);
        self.coalescer.forget(&key);

        match self.store.delete(&key).await {
            Ok(()) => {
                tracing::debug!(key = %key, "Cache entry invalidated");
                true
            }
            Err(e) => {
                METRICS.invalidation_failures.inc();
                tracing::warn!(
                    key = %key,
                    error = %e,
                    ttl_secs = self.ttl.as_secs(),
                    "Cache invalidation failed, entry may be stale until TTL"
                );
                false
            }
        }
    }

    /// Number of coalescing groups in flight
    pub fn in_flight(&self) -> usize {
        self.coalescer.in_flight()
    }
}

async fn populate<V: Serialize>(
    store: &dyn CacheStore,
    epochs: &WriteEpochs,
    key: &str,
    started_at: u64,
    value: &V,
    ttl: Duration,
) {
    if epochs.current(key) != started_at {
        tracing::debug!(key = %key, "Write raced the fetch, not caching");
        return;
    }
    let bytes = match serde_json::to_vec(value) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(key = %key, error = %e, "Failed to encode entity for cache");
            return;
        }
    };
    if let Err(e) = store.set(key, &bytes, ttl).await {
        METRICS.cache_store_errors.inc();
        tracing::warn!(key = %key, error = %e, "Cache store write failed");
        return;
    }
    // a write may have invalidated between the check and the set
    if epochs.current(key) != started_at {
        let _ = store.delete(key).await;
    }
}
