//! Node lifecycle
//!
//! Start: build stores, bind both listeners, register (fatal on failure),
//! serve. Shutdown: deregister, stop the internal listener, drain the public
//! listener within the configured bound, close resolver watches.

use crate::cache::{CacheStore, MemoryCacheStore, RedisCacheStore};
use crate::common::{Config, RateLimiter, Result};
use crate::discovery::{self, CoordinationClient, Registration, ServiceRegistry, ServiceResolver};
use crate::service::http::{internal_router, public_router, AppState};
use crate::service::users::{MemoryUserStore, UserService};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

struct Listener {
    name: &'static str,
    addr: SocketAddr,
    stop: watch::Sender<bool>,
    task: JoinHandle<std::io::Result<()>>,
}

impl Listener {
    async fn bind(name: &'static str, addr: SocketAddr, router: Router) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let (stop, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = stop_rx.wait_for(|stopped| *stopped).await;
            })
            .await
        });
        info!(listener = name, addr = %addr, "Listening");
        Ok(Self {
            name,
            addr,
            stop,
            task,
        })
    }

    /// Stop accepting and wait for in-flight requests, at most `timeout`
    async fn drain(self, timeout: Duration) {
        self.stop.send_replace(true);
        let mut task = self.task;
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(Ok(()))) => info!(listener = self.name, "Listener drained"),
            Ok(Ok(Err(e))) => error!(listener = self.name, error = %e, "Listener failed"),
            Ok(Err(e)) => error!(listener = self.name, error = %e, "Listener task panicked"),
            Err(_) => {
                warn!(listener = self.name, "Drain timed out, dropping open connections");
                task.abort();
            }
        }
    }
}

/// Build the configured cache store: Redis if a URL is set, else in-process
pub async fn build_cache_store(config: &Config) -> Result<Arc<dyn CacheStore>> {
    match &config.cache.url {
        Some(url) if !url.is_empty() => {
            let store = RedisCacheStore::connect(url, config.cache.op_timeout()).await?;
            Ok(Arc::new(store))
        }
        _ => {
            warn!("No cache URL configured, using in-process cache store");
            Ok(Arc::new(MemoryCacheStore::new()))
        }
    }
}

/// A started node
pub struct Node {
    config: Config,
    /// Shared by the registry and the resolver; closed last
    coordination: Arc<dyn CoordinationClient>,
    registration: Registration,
    registry: ServiceRegistry,
    resolver: Arc<ServiceResolver>,
    users: Arc<UserService>,
    public: Listener,
    internal: Listener,
}

impl Node {
    /// Start with the configured coordination service and cache store
    pub async fn start(config: Config) -> Result<Self> {
        let coordination = discovery::connect(&config.discovery).await?;
        let cache_store = build_cache_store(&config).await?;
        Self::start_with(config, coordination, cache_store).await
    }

    /// Start against explicit coordination and cache clients
    pub async fn start_with(
        config: Config,
        coordination: Arc<dyn CoordinationClient>,
        cache_store: Arc<dyn CacheStore>,
    ) -> Result<Self> {
        info!(
            node_id = %config.node_id,
            service = %config.service.name,
            "Starting node"
        );

        let users = Arc::new(UserService::new(
            Arc::new(MemoryUserStore::new()),
            cache_store.clone(),
            config.cache.entry_ttl(),
            config.cache.shards,
        ));
        let limiter = Arc::new(RateLimiter::new(cache_store, config.rate_limit.clone()));
        let state = AppState {
            users: users.clone(),
            node_id: config.node_id.clone(),
        };

        let internal = Listener::bind("internal", config.service.rpc_addr, internal_router(state.clone())).await?;
        let public = Listener::bind("public", config.service.http_addr, public_router(state, limiter, &config.http_cache)).await?;

        let registry = ServiceRegistry::with_shared_client(
            coordination.clone(),
            config.discovery.namespace.clone(),
        );
        // port 0 binds an ephemeral port; advertise the one actually bound
        let advertise = if config.service.rpc_addr.port() == 0 {
            format!("{}:{}", config.service.advertise_host, internal.addr.port())
        } else {
            config.advertise_addr()
        };
        let registration = match registry
            .register(&config.service.name, &advertise, config.discovery.lease_ttl_secs)
            .await
        {
            Ok(reg) => reg,
            Err(e) => {
                error!(error = %e, "Service registration failed");
                public.drain(Duration::ZERO).await;
                internal.drain(Duration::ZERO).await;
                let _ = coordination.close().await;
                return Err(e);
            }
        };

        let resolver = Arc::new(ServiceResolver::with_shared_client(
            coordination.clone(),
            config.discovery.namespace.clone(),
            config.discovery.dial_timeout(),
        ));

        info!(
            http = %public.addr,
            rpc = %internal.addr,
            advertised = %registration.address,
            "Node ready"
        );

        Ok(Self {
            config,
            coordination,
            registration,
            registry,
            resolver,
            users,
            public,
            internal,
        })
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.public.addr
    }

    pub fn rpc_addr(&self) -> SocketAddr {
        self.internal.addr
    }

    pub fn registration(&self) -> &Registration {
        &self.registration
    }

    pub fn resolver(&self) -> &Arc<ServiceResolver> {
        &self.resolver
    }

    pub fn users(&self) -> &Arc<UserService> {
        &self.users
    }

    /// Ordered shutdown
    pub async fn shutdown(self) {
        info!(node_id = %self.config.node_id, "Shutting down");
        let timeout = self.config.shutdown_timeout();

        if let Err(e) = self.registry.stop().await {
            warn!(error = %e, "Deregistration incomplete");
        }
        self.internal.drain(timeout).await;
        self.public.drain(timeout).await;
        self.resolver.close().await;
        if let Err(e) = self.coordination.close().await {
            warn!(error = %e, "Coordination client close failed");
        }
        info!("Shutdown complete");
    }

    /// Serve until SIGINT / SIGTERM, then shut down
    pub async fn run(self) -> Result<()> {
        shutdown_signal().await;
        self.shutdown().await;
        Ok(())
    }
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
