//! In-process coordination service
//!
//! A linearizable, single-process stand-in for etcd: monotonically increasing
//! revisions, TTL leases reaped in the background, prefix watches with a
//! bounded replay history. Every `MemoryClient` handle can be partitioned
//! from the server independently, which is how tests cut one instance off.

use crate::common::{Error, Result};
use crate::discovery::coordination::{
    CoordinationClient, KeyValue, LeaseId, Listing, WatchEvent, WatchStream,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

const HISTORY_LIMIT: usize = 4096;
const REAP_INTERVAL: Duration = Duration::from_millis(100);

struct Stored {
    value: String,
    lease: Option<LeaseId>,
}

struct LeaseState {
    ttl: i64,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct State {
    revision: i64,
    next_lease: LeaseId,
    kvs: BTreeMap<String, Stored>,
    leases: HashMap<LeaseId, LeaseState>,
    history: VecDeque<(i64, WatchEvent)>,
}

impl State {
    fn record(&mut self, event: WatchEvent, events: &broadcast::Sender<(i64, WatchEvent)>) {
        self.revision += 1;
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back((self.revision, event.clone()));
        let _ = events.send((self.revision, event));
    }

    fn delete_key(&mut self, key: &str, events: &broadcast::Sender<(i64, WatchEvent)>) {
        if let Some(stored) = self.kvs.remove(key) {
            if let Some(lease) = stored.lease.and_then(|id| self.leases.get_mut(&id)) {
                lease.keys.remove(key);
            }
            self.record(
                WatchEvent::Delete {
                    key: key.to_string(),
                },
                events,
            );
        }
    }

    fn drop_lease(&mut self, id: LeaseId, events: &broadcast::Sender<(i64, WatchEvent)>) -> bool {
        match self.leases.remove(&id) {
            Some(lease) => {
                for key in lease.keys {
                    self.delete_key(&key, events);
                }
                true
            }
            None => false,
        }
    }
}

/// The shared server side
pub struct MemoryCoordinator {
    state: Mutex<State>,
    events: broadcast::Sender<(i64, WatchEvent)>,
}

impl MemoryCoordinator {
    /// Create the server and spawn its lease reaper. Must be called from
    /// within a tokio runtime; the reaper exits once the server is dropped.
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let server = Arc::new(Self {
            state: Mutex::new(State {
                revision: 0,
                next_lease: 7_587_000_000_000_000,
                kvs: BTreeMap::new(),
                leases: HashMap::new(),
                history: VecDeque::new(),
            }),
            events,
        });
        tokio::spawn(reap_leases(Arc::downgrade(&server)));
        server
    }

    /// A new client handle, reachable until partitioned
    pub fn client(self: &Arc<Self>) -> MemoryClient {
        MemoryClient {
            server: self.clone(),
            reachable: Arc::new(AtomicBool::new(true)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn revision(&self) -> i64 {
        self.lock().revision
    }

    pub fn lease_count(&self) -> usize {
        self.lock().leases.len()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn expire(&self, now: Instant) {
        let mut state = self.lock();
        let expired: Vec<LeaseId> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            tracing::debug!(lease = id, "Lease expired");
            state.drop_lease(id, &self.events);
        }
    }

    fn grant(&self, ttl_secs: i64) -> Result<LeaseId> {
        if ttl_secs < 1 {
            return Err(Error::Coordination(format!("invalid lease TTL {}", ttl_secs)));
        }
        let mut state = self.lock();
        state.next_lease += 1;
        let id = state.next_lease;
        state.leases.insert(
            id,
            LeaseState {
                ttl: ttl_secs,
                deadline: Instant::now() + Duration::from_secs(ttl_secs as u64),
                keys: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        self.expire(Instant::now());
        let mut state = self.lock();
        if let Some(id) = lease {
            match state.leases.get_mut(&id) {
                Some(l) => {
                    l.keys.insert(key.to_string());
                }
                None => return Err(Error::LeaseNotFound(id)),
            }
        }
        let previous = state.kvs.insert(
            key.to_string(),
            Stored {
                value: value.to_string(),
                lease,
            },
        );
        if let Some(old) = previous.and_then(|p| p.lease).filter(|old| Some(*old) != lease) {
            if let Some(l) = state.leases.get_mut(&old) {
                l.keys.remove(key);
            }
        }
        state.record(
            WatchEvent::Put {
                key: key.to_string(),
                value: value.to_string(),
            },
            &self.events,
        );
        Ok(())
    }

    fn keep_alive(&self, id: LeaseId) -> Result<i64> {
        let now = Instant::now();
        self.expire(now);
        let mut state = self.lock();
        match state.leases.get_mut(&id) {
            Some(lease) => {
                lease.deadline = now + Duration::from_secs(lease.ttl as u64);
                Ok(lease.ttl)
            }
            None => Err(Error::LeaseNotFound(id)),
        }
    }

    fn revoke(&self, id: LeaseId) -> Result<()> {
        let mut state = self.lock();
        if state.drop_lease(id, &self.events) {
            Ok(())
        } else {
            Err(Error::LeaseNotFound(id))
        }
    }

    fn list(&self, prefix: &str) -> Listing {
        let state = self.lock();
        let kvs = state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| KeyValue {
                key: k.clone(),
                value: v.value.clone(),
            })
            .collect();
        Listing {
            kvs,
            revision: state.revision,
        }
    }

    /// Backlog of events at or after `start_revision`, plus a receiver for
    /// everything after the backlog. Taken under one lock so nothing is lost.
    fn subscribe(
        &self,
        prefix: &str,
        start_revision: i64,
    ) -> Result<(Vec<WatchEvent>, broadcast::Receiver<(i64, WatchEvent)>)> {
        let state = self.lock();
        let rx = self.events.subscribe();
        let oldest = state.history.front().map(|(rev, _)| *rev);
        if let Some(oldest) = oldest {
            if start_revision > 0 && start_revision < oldest {
                return Err(Error::Coordination(format!(
                    "revision {} has been compacted (oldest {})",
                    start_revision, oldest
                )));
            }
        }
        let backlog = state
            .history
            .iter()
            .filter(|(rev, ev)| *rev >= start_revision && ev.key().starts_with(prefix))
            .map(|(_, ev)| ev.clone())
            .collect();
        Ok((backlog, rx))
    }
}

async fn reap_leases(server: Weak<MemoryCoordinator>) {
    let mut ticker = tokio::time::interval(REAP_INTERVAL);
    loop {
        ticker.tick().await;
        match server.upgrade() {
            Some(server) => server.expire(Instant::now()),
            None => return,
        }
    }
}

/// One process's connection to a [`MemoryCoordinator`]
#[derive(Clone)]
pub struct MemoryClient {
    server: Arc<MemoryCoordinator>,
    reachable: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl MemoryClient {
    /// Cut this handle off: every call fails and open watches break
    pub fn partition(&self) {
        self.reachable.store(false, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.reachable.store(true, Ordering::SeqCst);
    }

    pub fn server(&self) -> &Arc<MemoryCoordinator> {
        &self.server
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::CoordinationUnavailable(
                "memory coordinator client closed".into(),
            ));
        }
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::CoordinationUnavailable(
                "memory coordinator unreachable".into(),
            ))
        }
    }
}

#[async_trait]
impl CoordinationClient for MemoryClient {
    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId> {
        self.check()?;
        self.server.grant(ttl_secs)
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        self.check()?;
        self.server.put(key, value, lease)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<i64> {
        self.check()?;
        self.server.keep_alive(lease)
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        self.check()?;
        self.server.revoke(lease)
    }

    async fn list(&self, prefix: &str) -> Result<Listing> {
        self.check()?;
        Ok(self.server.list(prefix))
    }

    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<WatchStream> {
        self.check()?;
        let (backlog, mut rx) = self.server.subscribe(prefix, start_revision)?;
        let prefix = prefix.to_string();
        let reachable = self.reachable.clone();
        let closed = self.closed.clone();

        let stream = async_stream::stream! {
            for event in backlog {
                yield Ok(event);
            }
            loop {
                match rx.recv().await {
                    Ok((_, event)) => {
                        if closed.load(Ordering::SeqCst) {
                            yield Err(Error::WatchClosed("client closed".into()));
                            break;
                        }
                        if !reachable.load(Ordering::SeqCst) {
                            yield Err(Error::WatchClosed("client partitioned".into()));
                            break;
                        }
                        if event.key().starts_with(&prefix) {
                            yield Ok(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        yield Err(Error::WatchClosed(format!("watcher lagged by {} events", n)));
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        yield Err(Error::WatchClosed("coordinator shut down".into()));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    /// Closes every clone of this handle; watches end on their next event
    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_deletes_attached_keys() {
        let server = MemoryCoordinator::new();
        let client = server.client();

        let lease = client.grant(2).await.unwrap();
        client.put("/services/a/1", "10.0.0.1:9090", Some(lease)).await.unwrap();
        client.put("/services/a/static", "10.0.0.9:9090", None).await.unwrap();
        assert_eq!(client.list("/services/a/").await.unwrap().kvs.len(), 2);

        tokio::time::sleep(Duration::from_millis(2500)).await;

        let listing = client.list("/services/a/").await.unwrap();
        assert_eq!(listing.kvs.len(), 1);
        assert_eq!(listing.kvs[0].key, "/services/a/static");
        assert!(matches!(client.keep_alive(lease).await, Err(Error::LeaseNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_extends_deadline() {
        let server = MemoryCoordinator::new();
        let client = server.client();
        let lease = client.grant(2).await.unwrap();
        client.put("/k", "v", Some(lease)).await.unwrap();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert_eq!(client.keep_alive(lease).await.unwrap(), 2);
        }
        assert_eq!(client.list("/k").await.unwrap().kvs.len(), 1);
    }

    #[tokio::test]
    async fn test_watch_replays_from_revision() {
        let server = MemoryCoordinator::new();
        let client = server.client();

        client.put("/services/a/1", "x", None).await.unwrap();
        let rev = client.list("/services/a/").await.unwrap().revision;
        client.put("/services/a/2", "y", None).await.unwrap();
        client.put("/services/b/1", "other", None).await.unwrap();

        let mut watch = client.watch("/services/a/", rev + 1).await.unwrap();
        assert_eq!(
            watch.next().await.unwrap().unwrap(),
            WatchEvent::Put {
                key: "/services/a/2".into(),
                value: "y".into()
            }
        );

        let lease = client.grant(10).await.unwrap();
        client.put("/services/a/3", "z", Some(lease)).await.unwrap();
        client.revoke(lease).await.unwrap();
        assert!(matches!(
            watch.next().await.unwrap().unwrap(),
            WatchEvent::Put { .. }
        ));
        assert_eq!(
            watch.next().await.unwrap().unwrap(),
            WatchEvent::Delete {
                key: "/services/a/3".into()
            }
        );
    }

    #[tokio::test]
    async fn test_partitioned_client_fails() {
        let server = MemoryCoordinator::new();
        let a = server.client();
        let b = server.client();
        a.partition();
        assert!(matches!(a.grant(5).await, Err(Error::CoordinationUnavailable(_))));
        assert!(b.grant(5).await.is_ok());
        a.heal();
        assert!(a.grant(5).await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_client_stays_closed() {
        let server = MemoryCoordinator::new();
        let a = server.client();
        let clone = a.clone();
        a.close().await.unwrap();
        assert!(clone.is_closed());
        assert!(matches!(clone.list("/").await, Err(Error::CoordinationUnavailable(_))));
        a.heal();
        assert!(a.grant(5).await.is_err());
        assert!(server.client().grant(5).await.is_ok());
    }
}
