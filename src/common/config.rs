//! Configuration for usermesh nodes
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `USERMESH__SECTION__KEY` environment variables. `MY_POD_IP` overrides the
//! advertised host so the registered address follows the pod.

use crate::common::ratelimit::RateLimitConfig;
use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix (`USERMESH__DISCOVERY__LEASE_TTL_SECS=5`)
pub const ENV_PREFIX: &str = "USERMESH";

/// Pod IP injected by the orchestrator
pub const POD_IP_ENV: &str = "MY_POD_IP";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node ID (unique identifier, used in logs)
    #[serde(default = "default_node_id")]
    pub node_id: String,

    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub http_cache: HttpCacheConfig,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Upper bound for draining listeners and joining background tasks
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

fn default_node_id() -> String {
    format!("node-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_shutdown_timeout() -> u64 {
    10_000
}

/// Listener and identity settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Name the instance registers under
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Bind address for the public HTTP API
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Bind address for the internal RPC listener
    #[serde(default = "default_rpc_addr")]
    pub rpc_addr: SocketAddr,

    /// Host other instances should dial (combined with the RPC port)
    #[serde(default = "default_advertise_host")]
    pub advertise_host: String,
}

fn default_service_name() -> String {
    "user-service".to_string()
}
fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}
fn default_rpc_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9090))
}
fn default_advertise_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            http_addr: default_http_addr(),
            rpc_addr: default_rpc_addr(),
            advertise_host: default_advertise_host(),
        }
    }
}

/// Coordination service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// etcd endpoints; empty selects the in-process coordinator
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Lease TTL in seconds
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: i64,

    /// Key prefix for registration records
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_ms: u64,
}

fn default_lease_ttl() -> i64 {
    10
}
fn default_namespace() -> String {
    "/services".to_string()
}
fn default_dial_timeout() -> u64 {
    5_000
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            lease_ttl_secs: default_lease_ttl(),
            namespace: default_namespace(),
            dial_timeout_ms: default_dial_timeout(),
        }
    }
}

impl DiscoveryConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

/// Cache store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Redis URL; unset selects the in-process store
    #[serde(default)]
    pub url: Option<String>,

    /// TTL of cached entity snapshots
    #[serde(default = "default_entry_ttl")]
    pub entry_ttl_secs: u64,

    /// Number of lock shards for in-flight coalescing groups
    #[serde(default = "default_shards")]
    pub shards: usize,

    /// Per-operation timeout against the cache store
    #[serde(default = "default_op_timeout")]
    pub op_timeout_ms: u64,
}

fn default_entry_ttl() -> u64 {
    15 * 60
}
fn default_shards() -> usize {
    16
}
fn default_op_timeout() -> u64 {
    3_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: None,
            entry_ttl_secs: default_entry_ttl(),
            shards: default_shards(),
            op_timeout_ms: default_op_timeout(),
        }
    }
}

impl CacheConfig {
    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_secs)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }
}

/// `Cache-Control` policy for profile reads served to browsers and CDNs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpCacheConfig {
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,

    /// Profiles are per-user, so this should stay true behind a shared CDN
    #[serde(default = "default_private")]
    pub private: bool,

    /// 0 omits the directive
    #[serde(default = "default_stale_while_revalidate")]
    pub stale_while_revalidate_secs: u64,
}

fn default_max_age() -> u64 {
    60
}
fn default_private() -> bool {
    true
}
fn default_stale_while_revalidate() -> u64 {
    30
}

impl Default for HttpCacheConfig {
    fn default() -> Self {
        Self {
            max_age_secs: default_max_age(),
            private: default_private(),
            stale_while_revalidate_secs: default_stale_while_revalidate(),
        }
    }
}

impl HttpCacheConfig {
    /// `private, max-age=60, stale-while-revalidate=30`
    pub fn header_value(&self) -> String {
        let scope = if self.private { "private" } else { "public" };
        let mut value = format!("{}, max-age={}", scope, self.max_age_secs);
        if self.stale_while_revalidate_secs > 0 {
            value.push_str(&format!(
                ", stale-while-revalidate={}",
                self.stale_while_revalidate_secs
            ));
        }
        value
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            service: ServiceConfig::default(),
            discovery: DiscoveryConfig::default(),
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            http_cache: HttpCacheConfig::default(),
            log_level: default_log_level(),
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from `path` (or `./usermesh.toml` if present) and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        builder = match path {
            Some(p) => builder.add_source(config::File::from(p).required(true)),
            None => builder.add_source(config::File::with_name("usermesh").required(false)),
        };
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("discovery.endpoints")
                .try_parsing(true),
        );
        if let Ok(ip) = std::env::var(POD_IP_ENV) {
            if !ip.trim().is_empty() {
                builder = builder.set_override("service.advertise_host", ip.trim())?;
            }
        }

        let cfg: Config = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the core cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.service.name.is_empty() || self.service.name.contains('/') {
            return Err(Error::InvalidConfig(format!(
                "service name must be non-empty and contain no '/': {:?}",
                self.service.name
            )));
        }
        if self.discovery.lease_ttl_secs < 1 {
            return Err(Error::InvalidConfig(
                "discovery.lease_ttl_secs must be at least 1".into(),
            ));
        }
        if !self.discovery.namespace.starts_with('/') {
            return Err(Error::InvalidConfig(
                "discovery.namespace must start with '/'".into(),
            ));
        }
        if self.cache.shards == 0 {
            return Err(Error::InvalidConfig("cache.shards must be positive".into()));
        }
        if self.cache.entry_ttl_secs == 0 {
            return Err(Error::InvalidConfig(
                "cache.entry_ttl_secs must be positive".into(),
            ));
        }
        self.rate_limit.validate()
    }

    /// Address registered in discovery: advertised host plus the RPC port
    pub fn advertise_addr(&self) -> String {
        format!(
            "{}:{}",
            self.service.advertise_host,
            self.service.rpc_addr.port()
        )
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.discovery.lease_ttl_secs, 10);
        assert_eq!(cfg.cache.entry_ttl(), Duration::from_secs(900));
        assert_eq!(cfg.rate_limit.window_secs, 60);
        assert_eq!(cfg.advertise_addr(), "127.0.0.1:9090");
    }

    #[test]
    fn test_cache_control_value() {
        let mut http_cache = HttpCacheConfig::default();
        assert_eq!(
            http_cache.header_value(),
            "private, max-age=60, stale-while-revalidate=30"
        );
        http_cache.private = false;
        http_cache.stale_while_revalidate_secs = 0;
        assert_eq!(http_cache.header_value(), "public, max-age=60");
    }

    #[test]
    fn test_rejects_zero_ttl() {
        let mut cfg = Config::default();
        cfg.discovery.lease_ttl_secs = 0;
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_service_name_with_slash() {
        let mut cfg = Config::default();
        cfg.service.name = "user/service".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let path = std::env::temp_dir().join(format!("usermesh-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"
node_id = "node-a"

[discovery]
endpoints = ["http://10.0.0.1:2379"]
lease_ttl_secs = 5

[rate_limit]
enabled = true
default = 100

[rate_limit.routes]
"/api/v1/login" = 5
"#,
        )
        .unwrap();

        let cfg = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(cfg.node_id, "node-a");
        assert_eq!(cfg.discovery.endpoints, vec!["http://10.0.0.1:2379"]);
        assert_eq!(cfg.discovery.lease_ttl_secs, 5);
        assert_eq!(cfg.rate_limit.limit_for("/api/v1/login"), 5);
        assert_eq!(cfg.rate_limit.limit_for("/graphql"), 100);
        assert_eq!(cfg.cache.shards, 16);
    }
}
