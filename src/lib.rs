//! # usermesh
//!
//! Resilience layer for a horizontally scaled user service:
//! - Lease-based service registry with background keepalive
//! - Watch-driven service resolver with round-robin selection
//! - Coalescing read-through cache with cache-aside invalidation
//! - Fleet-wide per-route rate limiting that fails open
//!
//! ## Architecture
//!
//! ```text
//!            ┌──────────────┐
//!            │ etcd cluster │  /services/{name}/{lease} -> host:port
//!            └──────┬───────┘
//!     register +    │    list + watch
//!     keepalive     │
//!   ┌───────────────┼────────────────┐
//!   │               │                │
//! ┌─▼──────────┐  ┌─▼──────────┐  ┌──▼─────────┐
//! │ instance 1 │  │ instance 2 │  │ instance 3 │
//! │ HTTP + RPC │  │ HTTP + RPC │  │ HTTP + RPC │
//! └─────┬──────┘  └─────┬──────┘  └──────┬─────┘
//!       │  cache entries, rate counters  │
//!       └───────────► Redis ◄────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! usermesh serve \
//!   --http 0.0.0.0:8080 \
//!   --rpc 0.0.0.0:9090 \
//!   --etcd etcd-0:2379,etcd-1:2379 \
//!   --redis redis://redis:6379/0
//!
//! usermesh resolve user-service --etcd etcd-0:2379
//! ```

#![allow(clippy::result_large_err)]

pub mod cache;
pub mod common;
pub mod discovery;
pub mod service;

pub use cache::{CacheStore, CoalescingCache};
pub use common::{Config, Error, Result};
pub use discovery::{ServiceRegistry, ServiceResolver};
pub use service::Node;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
