//! Lease-based service registration
//!
//! An instance registers `{namespace}/{service}/{lease}` -> `address` bound to
//! a TTL lease and refreshes the lease in the background. If the process dies
//! the lease lapses and the record disappears within one TTL. If the lease is
//! lost while the process is alive (long partition), the keepalive loop
//! registers again under a fresh lease.

use crate::common::metrics::METRICS;
use crate::common::{Error, Result};
use crate::discovery::coordination::{registration_key, CoordinationClient, LeaseId};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const MIN_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(200);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// What `register` wrote
#[derive(Debug, Clone)]
pub struct Registration {
    pub service: String,
    pub address: String,
    pub lease: LeaseId,
    pub key: String,
}

struct Active {
    service: String,
    address: String,
    lease: Arc<AtomicI64>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct ServiceRegistry {
    client: Arc<dyn CoordinationClient>,
    namespace: String,
    active: Mutex<Option<Active>>,
    /// `stop` closes the client only when the registry owns it
    owns_client: bool,
}

/// Keepalive period: a third of the TTL
pub fn keepalive_interval(ttl_secs: i64) -> Duration {
    Duration::from_millis(ttl_secs.max(1) as u64 * 1000 / 3).max(MIN_KEEPALIVE_INTERVAL)
}

impl ServiceRegistry {
    pub fn new(client: Arc<dyn CoordinationClient>, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            active: Mutex::new(None),
            owns_client: true,
        }
    }

    /// A registry on a client other components still use; `stop` leaves it open
    pub fn with_shared_client(
        client: Arc<dyn CoordinationClient>,
        namespace: impl Into<String>,
    ) -> Self {
        let mut registry = Self::new(client, namespace);
        registry.owns_client = false;
        registry
    }

    /// Grant a lease, write the registration record and start the keepalive
    /// loop. Fails if the coordination service is unreachable; the caller
    /// should treat that as fatal at startup.
    pub async fn register(&self, service: &str, address: &str, ttl_secs: i64) -> Result<Registration> {
        if ttl_secs < 1 {
            return Err(Error::InvalidConfig(format!(
                "lease TTL must be at least 1s, got {}",
                ttl_secs
            )));
        }

        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref() {
            return Err(Error::AlreadyRegistered(current.service.clone()));
        }

        let (lease, key) =
            register_once(self.client.as_ref(), &self.namespace, service, address, ttl_secs).await?;
        info!(service = %service, address = %address, lease, key = %key, "Registered service instance");

        let lease_cell = Arc::new(AtomicI64::new(lease));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(keepalive_loop(
            self.client.clone(),
            self.namespace.clone(),
            service.to_string(),
            address.to_string(),
            ttl_secs,
            lease_cell.clone(),
            shutdown_rx,
        ));

        *active = Some(Active {
            service: service.to_string(),
            address: address.to_string(),
            lease: lease_cell,
            shutdown,
            task,
        });

        Ok(Registration {
            service: service.to_string(),
            address: address.to_string(),
            lease,
            key,
        })
    }

    /// Lease currently backing the registration
    pub async fn current_lease(&self) -> Option<LeaseId> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|a| a.lease.load(Ordering::SeqCst))
    }

    /// Stop refreshing, revoke the lease so the record disappears at once and
    /// close the client if owned. Calling it again is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let Some(active) = self.active.lock().await.take() else {
            return Ok(());
        };

        let _ = active.shutdown.send(true);
        let mut task = active.task;
        if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
            warn!(service = %active.service, "Keepalive loop did not stop in time, aborting");
            task.abort();
        }

        let lease = active.lease.load(Ordering::SeqCst);
        let revoked = match self.client.revoke(lease).await {
            Ok(()) | Err(Error::LeaseNotFound(_)) => Ok(()),
            Err(e) => {
                warn!(
                    service = %active.service,
                    lease,
                    error = %e,
                    "Lease revoke failed, record will expire with its TTL"
                );
                Err(e)
            }
        };
        info!(service = %active.service, address = %active.address, "Deregistered service instance");

        if self.owns_client {
            if let Err(e) = self.client.close().await {
                debug!(error = %e, "Coordination client close failed");
            }
        }
        revoked
    }
}

impl Drop for ServiceRegistry {
    fn drop(&mut self) {
        // no revoke here: the lease lapses on its own
        if let Some(active) = self.active.get_mut().as_ref() {
            active.task.abort();
        }
    }
}

async fn register_once(
    client: &dyn CoordinationClient,
    namespace: &str,
    service: &str,
    address: &str,
    ttl_secs: i64,
) -> Result<(LeaseId, String)> {
    let lease = client.grant(ttl_secs).await?;
    let key = registration_key(namespace, service, lease);
    if let Err(e) = client.put(&key, address, Some(lease)).await {
        let _ = client.revoke(lease).await;
        return Err(e);
    }
    Ok((lease, key))
}

async fn keepalive_loop(
    client: Arc<dyn CoordinationClient>,
    namespace: String,
    service: String,
    address: String,
    ttl_secs: i64,
    lease: Arc<AtomicI64>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(keepalive_interval(ttl_secs));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let id = lease.load(Ordering::SeqCst);
        match client.keep_alive(id).await {
            Ok(ttl) => debug!(service = %service, lease = id, ttl, "Lease refreshed"),
            Err(Error::LeaseNotFound(_)) => {
                warn!(service = %service, lease = id, "Lease lost, registering again");
                match register_once(client.as_ref(), &namespace, &service, &address, ttl_secs).await {
                    Ok((new_lease, key)) => {
                        lease.store(new_lease, Ordering::SeqCst);
                        METRICS.reregistrations.inc();
                        info!(service = %service, lease = new_lease, key = %key, "Registered again");
                    }
                    Err(e) => {
                        METRICS.keepalive_failures.inc();
                        warn!(service = %service, error = %e, "Re-registration failed, will retry");
                    }
                }
            }
            Err(e) => {
                METRICS.keepalive_failures.inc();
                warn!(service = %service, lease = id, error = %e, "Lease keepalive failed, will retry");
            }
        }
    }
    debug!(service = %service, "Keepalive loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::memory::MemoryCoordinator;

    #[test]
    fn test_keepalive_interval() {
        assert_eq!(keepalive_interval(9), Duration::from_secs(3));
        assert_eq!(keepalive_interval(10), Duration::from_millis(3333));
        assert_eq!(keepalive_interval(0), Duration::from_millis(333));
    }

    #[tokio::test]
    async fn test_register_twice_rejected() {
        let server = MemoryCoordinator::new();
        let registry = ServiceRegistry::new(Arc::new(server.client()), "/services");

        let reg = registry.register("user-service", "10.0.0.1:9090", 10).await.unwrap();
        assert_eq!(reg.key, format!("/services/user-service/{}", reg.lease));
        assert!(matches!(
            registry.register("user-service", "10.0.0.1:9090", 10).await,
            Err(Error::AlreadyRegistered(_))
        ));

        registry.stop().await.unwrap();
        registry.stop().await.unwrap();
        assert_eq!(server.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_closes_only_owned_client() {
        let server = MemoryCoordinator::new();

        let owned = server.client();
        let registry = ServiceRegistry::new(Arc::new(owned.clone()), "/services");
        registry.register("user-service", "10.0.0.1:9090", 10).await.unwrap();
        registry.stop().await.unwrap();
        assert!(owned.is_closed());

        let shared = server.client();
        let registry = ServiceRegistry::with_shared_client(Arc::new(shared.clone()), "/services");
        registry.register("user-service", "10.0.0.2:9090", 10).await.unwrap();
        registry.stop().await.unwrap();
        assert!(!shared.is_closed());
        assert!(shared.list("/services/").await.unwrap().kvs.is_empty());
    }
}
