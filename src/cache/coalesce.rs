//! In-flight request coalescing
//!
//! At most one fetch per key runs at a time inside this process. The first
//! caller for a key opens a group and the fetch is spawned as its own task;
//! every caller (the first included) then waits on the group's watch channel.
//! Dropping a waiting caller therefore never cancels the fetch the others are
//! waiting on.
//!
//! Groups live in a sharded map (one mutex per shard, shard picked by
//! BLAKE3 of the key) and are removed before their result is published, so a
//! caller arriving after completion starts a fresh group.

use crate::common::hash::shard_key;
use crate::common::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

/// Lifecycle of one coalescing group
#[derive(Debug, Clone)]
enum GroupState<V> {
    Pending,
    Resolved(V),
    Failed(Arc<Error>),
}

impl<V> GroupState<V> {
    fn is_pending(&self) -> bool {
        matches!(self, GroupState::Pending)
    }
}

struct Group<V> {
    id: u64,
    rx: watch::Receiver<GroupState<V>>,
}

type Shard<V> = Mutex<HashMap<String, Group<V>>>;

struct Inner<V> {
    shards: Vec<Shard<V>>,
    next_id: AtomicU64,
}

impl<V> Inner<V> {
    fn shard(&self, key: &str) -> MutexGuard<'_, HashMap<String, Group<V>>> {
        let idx = shard_key(key, self.shards.len() as u64) as usize;
        self.shards[idx]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remove the group for `key` if it is still the one identified by `id`
    fn remove(&self, key: &str, id: u64) {
        let mut groups = self.shard(key);
        if groups.get(key).map(|g| g.id) == Some(id) {
            groups.remove(key);
        }
    }
}

/// Removes the group when the fetch task finishes or unwinds
struct Completion<V> {
    inner: Arc<Inner<V>>,
    key: String,
    id: u64,
}

impl<V> Drop for Completion<V> {
    fn drop(&mut self) {
        self.inner.remove(&self.key, self.id);
    }
}

/// Outcome of [`Coalescer::run`] for one caller
#[derive(Debug)]
pub struct Coalesced<V> {
    pub value: V,
    /// `true` if this caller attached to a fetch started by someone else
    pub shared: bool,
}

pub struct Coalescer<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for Coalescer<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V> Coalescer<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(num_shards: usize) -> Self {
        let num_shards = num_shards.max(1);
        Self {
            inner: Arc::new(Inner {
                shards: (0..num_shards).map(|_| Mutex::new(HashMap::new())).collect(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Join the in-flight fetch for `key`, or start one with `fetch`.
    ///
    /// `fetch` is only invoked by the caller that opens the group. Every
    /// caller receives the same value, or the same `Error::Shared` failure.
    pub async fn run<F, Fut>(&self, key: &str, fetch: F) -> Result<Coalesced<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        let (mut rx, leader) = {
            let mut groups = self.inner.shard(key);
            match groups.get(key) {
                Some(group) => (group.rx.clone(), None),
                None => {
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(GroupState::Pending);
                    groups.insert(
                        key.to_string(),
                        Group {
                            id,
                            rx: rx.clone(),
                        },
                    );
                    (rx, Some((tx, id)))
                }
            }
        };

        let shared = leader.is_none();
        if let Some((tx, id)) = leader {
            let completion = Completion {
                inner: self.inner.clone(),
                key: key.to_string(),
                id,
            };
            let fut = fetch();
            tokio::spawn(async move {
                let state = match fut.await {
                    Ok(value) => GroupState::Resolved(value),
                    Err(e) => GroupState::Failed(Arc::new(e)),
                };
                drop(completion);
                tx.send_replace(state);
            });
        } else {
            tracing::debug!(key = %key, "Attached to in-flight fetch");
        }

        let state = match rx.wait_for(|s| !s.is_pending()).await {
            Ok(state) => state.clone(),
            Err(_) => {
                return Err(Error::Internal(format!(
                    "in-flight fetch for {} aborted",
                    key
                )))
            }
        };

        match state {
            GroupState::Resolved(value) => Ok(Coalesced { value, shared }),
            GroupState::Failed(e) => Err(Error::Shared(e)),
            GroupState::Pending => Err(Error::Internal(format!(
                "in-flight fetch for {} published no result",
                key
            ))),
        }
    }

    /// Detach the in-flight group for `key` so the next caller starts a fresh
    /// fetch. Callers already attached still receive the detached result.
    pub fn forget(&self, key: &str) {
        self.inner.shard(key).remove(key);
    }

    /// Number of groups currently in flight
    pub fn in_flight(&self) -> usize {
        self.inner
            .shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(|p| p.into_inner()).len())
            .sum()
    }
}
