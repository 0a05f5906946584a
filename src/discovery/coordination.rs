//! Coordination client contract
//!
//! The subset of an etcd-class service the registry and resolver need:
//! leases, lease-bound puts, prefix listing with a revision, and prefix
//! watches that resume from a revision.

use crate::common::Result;
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;

pub type LeaseId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

/// Result of a prefix listing, with the store revision it reflects
#[derive(Debug, Clone, Default)]
pub struct Listing {
    pub kvs: Vec<KeyValue>,
    pub revision: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put { key: String, value: String },
    Delete { key: String },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key } => key,
        }
    }
}

/// Watch events in revision order. An `Err` item means the watch is broken
/// and the stream yields nothing further.
pub type WatchStream = Pin<Box<dyn Stream<Item = Result<WatchEvent>> + Send>>;

#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Obtain a new lease with the given TTL
    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId>;

    /// Write `key`, attached to `lease` if given
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()>;

    /// Refresh a lease once and return its TTL.
    /// `Error::LeaseNotFound` if the lease has expired or was revoked.
    async fn keep_alive(&self, lease: LeaseId) -> Result<i64>;

    /// Revoke a lease, deleting every key attached to it
    async fn revoke(&self, lease: LeaseId) -> Result<()>;

    async fn list(&self, prefix: &str) -> Result<Listing>;

    /// Watch keys under `prefix`, starting with events at `start_revision`
    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<WatchStream>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// `/services/user-service/` for namespace `/services`
pub fn service_prefix(namespace: &str, service: &str) -> String {
    format!("{}/{}/", namespace.trim_end_matches('/'), service)
}

/// Registration record key: `{namespace}/{service}/{lease}`
pub fn registration_key(namespace: &str, service: &str, lease: LeaseId) -> String {
    format!("{}{}", service_prefix(namespace, service), lease)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(service_prefix("/services", "user-service"), "/services/user-service/");
        assert_eq!(service_prefix("/services/", "user-service"), "/services/user-service/");
        assert_eq!(
            registration_key("/services", "user-service", 7587),
            "/services/user-service/7587"
        );
    }
}
