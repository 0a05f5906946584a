//! Service discovery
//!
//! - `coordination`: the coordination client contract
//! - `etcd` / `memory`: client adapters
//! - `registry`: lease-based self-registration
//! - `resolver`: watch-driven resolution and round-robin selection

pub mod coordination;
pub mod etcd;
pub mod memory;
pub mod registry;
pub mod resolver;

pub use coordination::{CoordinationClient, KeyValue, LeaseId, Listing, WatchEvent, WatchStream};
pub use etcd::EtcdClient;
pub use memory::{MemoryClient, MemoryCoordinator};
pub use registry::{Registration, ServiceRegistry};
pub use resolver::{ResolvedService, ServiceResolver};

use crate::common::{DiscoveryConfig, Result};
use std::sync::Arc;

/// Client for the configured coordination service: etcd when endpoints are
/// set, otherwise a fresh in-process coordinator (single node only).
pub async fn connect(config: &DiscoveryConfig) -> Result<Arc<dyn CoordinationClient>> {
    if config.endpoints.is_empty() {
        tracing::warn!("No discovery endpoints configured, using in-process coordinator");
        return Ok(Arc::new(MemoryCoordinator::new().client()));
    }
    let client = EtcdClient::connect(config.endpoints.clone(), config.dial_timeout()).await?;
    Ok(Arc::new(client))
}
