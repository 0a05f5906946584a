//! Common utilities and types shared across usermesh

pub mod config;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod ratelimit;
pub mod tracing_middleware;
pub mod utils;

pub use config::{CacheConfig, Config, DiscoveryConfig, HttpCacheConfig, ServiceConfig};
pub use error::{Error, Result};
pub use hash::shard_key;
pub use metrics::{MetricsRegistry, METRICS};
pub use ratelimit::{client_identity, RateLimitConfig, RateLimitResult, RateLimiter};
pub use utils::{host_of, timestamp_now, timestamp_now_millis, to_http_uri};
