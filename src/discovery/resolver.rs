//! Service resolution and client-side load balancing
//!
//! `resolve` lists a service's registrations once, then follows changes with a
//! watch that resumes just after the listed revision. If the watch breaks the
//! resolver re-lists (with jittered backoff) and watches again. The current
//! address set is published to subscribers; `pick` rotates over it.

use crate::common::metrics::{Gauge, METRICS};
use crate::common::utils::to_http_uri;
use crate::common::{Error, Result};
use crate::discovery::coordination::{service_prefix, CoordinationClient, KeyValue, WatchEvent};
use futures_util::StreamExt;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info, warn};

const RESYNC_BACKOFF_MIN: Duration = Duration::from_millis(200);
const RESYNC_BACKOFF_MAX: Duration = Duration::from_secs(5);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Endpoints {
    service: String,
    /// registration key -> address
    members: Mutex<BTreeMap<String, String>>,
    cursor: AtomicUsize,
    channels: Mutex<HashMap<String, Channel>>,
    updates: watch::Sender<Vec<String>>,
    dial_timeout: Duration,
    /// Sum of published address counts across live services
    known: &'static Gauge,
}

impl Drop for Endpoints {
    fn drop(&mut self) {
        self.known.sub(self.updates.borrow().len() as u64);
    }
}

/// Live view of one service's instances
#[derive(Clone)]
pub struct ResolvedService {
    inner: Arc<Endpoints>,
}

impl ResolvedService {
    fn new(service: &str, dial_timeout: Duration) -> Self {
        Self::with_gauge(service, dial_timeout, &METRICS.known_instances)
    }

    fn with_gauge(service: &str, dial_timeout: Duration, known: &'static Gauge) -> Self {
        let (updates, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(Endpoints {
                service: service.to_string(),
                members: Mutex::new(BTreeMap::new()),
                cursor: AtomicUsize::new(0),
                channels: Mutex::new(HashMap::new()),
                updates,
                dial_timeout,
                known,
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    /// Distinct addresses, ordered by registration key
    pub fn addresses(&self) -> Vec<String> {
        self.inner.updates.borrow().clone()
    }

    /// Receiver that sees every change to the address set
    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.inner.updates.subscribe()
    }

    /// Next address in round-robin order
    pub fn pick(&self) -> Result<String> {
        let addrs = self.inner.updates.borrow();
        if addrs.is_empty() {
            return Err(Error::NoAvailableInstance(self.inner.service.clone()));
        }
        let idx = self.inner.cursor.fetch_add(1, Ordering::Relaxed) % addrs.len();
        Ok(addrs[idx].clone())
    }

    /// RPC channel to the next instance in round-robin order. Channels are
    /// created lazily, one per address, and dropped when the address leaves.
    pub fn channel(&self) -> Result<Channel> {
        let addr = self.pick()?;
        let mut channels = lock(&self.inner.channels);
        if let Some(channel) = channels.get(&addr) {
            return Ok(channel.clone());
        }
        let channel = Endpoint::from_shared(to_http_uri(&addr))
            .map_err(|e| Error::InvalidAddress {
                addr: addr.clone(),
                reason: e.to_string(),
            })?
            .connect_timeout(self.inner.dial_timeout)
            .connect_lazy();
        channels.insert(addr, channel.clone());
        Ok(channel)
    }

    fn apply(&self, event: &WatchEvent) {
        let mut members = lock(&self.inner.members);
        match event {
            WatchEvent::Put { key, value } => {
                debug!(service = %self.inner.service, key = %key, address = %value, "Instance up");
                members.insert(key.clone(), value.clone());
            }
            WatchEvent::Delete { key } => {
                debug!(service = %self.inner.service, key = %key, "Instance down");
                members.remove(key);
            }
        }
        self.publish(&members);
    }

    fn replace_all(&self, kvs: Vec<KeyValue>) {
        let mut members = lock(&self.inner.members);
        *members = kvs.into_iter().map(|kv| (kv.key, kv.value)).collect();
        self.publish(&members);
    }

    fn publish(&self, members: &BTreeMap<String, String>) {
        let mut addrs: Vec<String> = Vec::with_capacity(members.len());
        for addr in members.values() {
            if !addrs.contains(addr) {
                addrs.push(addr.clone());
            }
        }

        lock(&self.inner.channels).retain(|addr, _| addrs.contains(addr));
        METRICS.resolver_updates.inc();
        let known = self.inner.known;
        self.inner.updates.send_if_modified(|current| {
            if *current == addrs {
                false
            } else {
                known.sub(current.len() as u64);
                known.add(addrs.len() as u64);
                *current = addrs;
                true
            }
        });
    }
}

/// Process-wide resolver; one watch per resolved service
pub struct ServiceResolver {
    client: Arc<dyn CoordinationClient>,
    namespace: String,
    dial_timeout: Duration,
    services: tokio::sync::Mutex<HashMap<String, ResolvedService>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    owns_client: bool,
}

impl ServiceResolver {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        namespace: impl Into<String>,
        dial_timeout: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            client,
            namespace: namespace.into(),
            dial_timeout,
            services: tokio::sync::Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            shutdown,
            owns_client: true,
        }
    }

    /// A resolver on a client other components still use; `close` leaves it open
    pub fn with_shared_client(
        client: Arc<dyn CoordinationClient>,
        namespace: impl Into<String>,
        dial_timeout: Duration,
    ) -> Self {
        let mut resolver = Self::new(client, namespace, dial_timeout);
        resolver.owns_client = false;
        resolver
    }

    /// Resolve `service`, starting to follow its registrations on first use.
    /// An empty instance set is not an error here; `pick` reports it.
    pub async fn resolve(&self, service: &str) -> Result<ResolvedService> {
        if *self.shutdown.borrow() {
            return Err(Error::Internal("resolver is closed".into()));
        }
        let mut services = self.services.lock().await;
        if let Some(resolved) = services.get(service) {
            return Ok(resolved.clone());
        }

        let prefix = service_prefix(&self.namespace, service);
        let listing = self.client.list(&prefix).await?;
        let resolved = ResolvedService::new(service, self.dial_timeout);
        resolved.replace_all(listing.kvs);
        info!(
            service = %service,
            instances = resolved.addresses().len(),
            revision = listing.revision,
            "Resolved service"
        );

        let task = tokio::spawn(follow(
            self.client.clone(),
            prefix,
            resolved.clone(),
            listing.revision,
            self.shutdown.subscribe(),
        ));
        lock(&self.tasks).push(task);
        services.insert(service.to_string(), resolved.clone());
        Ok(resolved)
    }

    /// Stop every watch and close the client
    pub async fn close(&self) {
        self.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(CLOSE_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
        }
        self.services.lock().await.clear();
        if self.owns_client {
            if let Err(e) = self.client.close().await {
                debug!(error = %e, "Coordination client close failed");
            }
        }
        info!("Service resolver closed");
    }
}

impl Drop for ServiceResolver {
    fn drop(&mut self) {
        for task in lock(&self.tasks).iter() {
            task.abort();
        }
    }
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = RESYNC_BACKOFF_MIN
        .saturating_mul(1u32 << attempt.min(5))
        .min(RESYNC_BACKOFF_MAX);
    let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
    base + Duration::from_millis(jitter)
}

/// Watch `prefix` from `revision + 1`; on any break, back off, re-list and
/// watch again from the new listing's revision.
async fn follow(
    client: Arc<dyn CoordinationClient>,
    prefix: String,
    resolved: ResolvedService,
    mut revision: i64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;

    loop {
        let opened = tokio::select! {
            _ = shutdown.changed() => return,
            res = client.watch(&prefix, revision + 1) => res,
        };

        match opened {
            Ok(mut stream) => loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    item = stream.next() => match item {
                        Some(Ok(event)) => {
                            attempt = 0;
                            resolved.apply(&event);
                        }
                        Some(Err(e)) => {
                            warn!(prefix = %prefix, error = %e, "Watch broken, resyncing");
                            break;
                        }
                        None => {
                            warn!(prefix = %prefix, "Watch ended, resyncing");
                            break;
                        }
                    }
                }
            },
            Err(e) => warn!(prefix = %prefix, error = %e, "Failed to open watch"),
        }

        let delay = backoff_with_jitter(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        match client.list(&prefix).await {
            Ok(listing) => {
                resolved.replace_all(listing.kvs);
                revision = listing.revision;
                METRICS.resolver_resyncs.inc();
                info!(
                    prefix = %prefix,
                    instances = resolved.addresses().len(),
                    revision,
                    "Resynced service instances"
                );
            }
            Err(e) => warn!(prefix = %prefix, error = %e, "Resync listing failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_bounds() {
        for attempt in 0..10 {
            let d = backoff_with_jitter(attempt);
            assert!(d >= RESYNC_BACKOFF_MIN);
            assert!(d <= RESYNC_BACKOFF_MAX + RESYNC_BACKOFF_MAX / 2);
        }
    }

    #[test]
    fn test_round_robin_and_dedup() {
        let resolved = ResolvedService::new("svc", Duration::from_secs(1));
        assert!(matches!(resolved.pick(), Err(Error::NoAvailableInstance(_))));

        resolved.replace_all(vec![
            KeyValue { key: "/s/svc/1".into(), value: "a:1".into() },
            KeyValue { key: "/s/svc/2".into(), value: "b:1".into() },
            KeyValue { key: "/s/svc/3".into(), value: "a:1".into() },
        ]);
        assert_eq!(resolved.addresses(), vec!["a:1".to_string(), "b:1".to_string()]);

        let picks: Vec<String> = (0..4).map(|_| resolved.pick().unwrap()).collect();
        assert_eq!(picks.iter().filter(|a| *a == "a:1").count(), 2);
        assert_eq!(picks.iter().filter(|a| *a == "b:1").count(), 2);

        resolved.apply(&WatchEvent::Delete { key: "/s/svc/2".into() });
        assert_eq!(resolved.addresses(), vec!["a:1".to_string()]);
    }

    #[test]
    fn test_known_instances_follows_membership() {
        let gauge: &'static Gauge = Box::leak(Box::new(Gauge::new()));
        let a = ResolvedService::with_gauge("a", Duration::from_secs(1), gauge);
        let b = ResolvedService::with_gauge("b", Duration::from_secs(1), gauge);

        a.replace_all(vec![
            KeyValue { key: "/s/a/1".into(), value: "a:1".into() },
            KeyValue { key: "/s/a/2".into(), value: "a:2".into() },
        ]);
        b.apply(&WatchEvent::Put { key: "/s/b/1".into(), value: "b:1".into() });
        assert_eq!(gauge.get(), 3);

        a.apply(&WatchEvent::Delete { key: "/s/a/2".into() });
        assert_eq!(gauge.get(), 2);

        // duplicate address: the published set is unchanged
        a.apply(&WatchEvent::Put { key: "/s/a/3".into(), value: "a:1".into() });
        assert_eq!(gauge.get(), 2);

        drop(b);
        assert_eq!(gauge.get(), 1);
        let clone = a.clone();
        drop(a);
        assert_eq!(gauge.get(), 1);
        drop(clone);
        assert_eq!(gauge.get(), 0);
    }
}
