//! Process metrics
//!
//! Counters for the resilience layer (cache, coalescing, rate limiting,
//! leases, resolver) plus per-endpoint request latency, exported in the
//! Prometheus text format.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Histogram bucket boundaries for latency measurements (in milliseconds)
const LATENCY_BUCKETS: [f64; 11] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

/// Process-wide registry
pub static METRICS: Lazy<MetricsRegistry> = Lazy::new(MetricsRegistry::new);

#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    boundaries: Vec<f64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::with_buckets(&LATENCY_BUCKETS)
    }

    pub fn with_buckets(boundaries: &[f64]) -> Self {
        Self {
            buckets: (0..=boundaries.len()).map(|_| AtomicU64::new(0)).collect(),
            boundaries: boundaries.to_vec(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        let idx = self
            .boundaries
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.boundaries.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative `(le, count)` pairs, ending with `+Inf`
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let mut cumulative = 0u64;
        let mut result = Vec::with_capacity(self.boundaries.len() + 1);
        for (i, &boundary) in self.boundaries.iter().enumerate() {
            cumulative += self.buckets[i].load(Ordering::Relaxed);
            result.push((boundary, cumulative));
        }
        cumulative += self.buckets[self.boundaries.len()].load(Ordering::Relaxed);
        result.push((f64::INFINITY, cumulative));
        result
    }

    pub fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, v: u64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn add(&self, v: u64) {
        self.value.fetch_add(v, Ordering::Relaxed);
    }

    /// Saturates at zero
    pub fn sub(&self, v: u64) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| {
                Some(cur.saturating_sub(v))
            });
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct EndpointMetrics {
    pub requests_total: Counter,
    pub requests_error: Counter,
    pub latency: Histogram,
}

#[derive(Debug)]
pub struct MetricsRegistry {
    endpoints: Mutex<HashMap<String, Arc<EndpointMetrics>>>,

    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub cache_store_errors: Counter,
    pub backing_fetches: Counter,
    pub coalesced_waits: Counter,
    pub invalidation_failures: Counter,

    pub ratelimit_allowed: Counter,
    pub ratelimit_rejected: Counter,
    pub ratelimit_fail_open: Counter,

    pub keepalive_failures: Counter,
    pub reregistrations: Counter,
    pub resolver_updates: Counter,
    pub resolver_resyncs: Counter,
    pub known_instances: Gauge,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
            cache_hits: Counter::new(),
            cache_misses: Counter::new(),
            cache_store_errors: Counter::new(),
            backing_fetches: Counter::new(),
            coalesced_waits: Counter::new(),
            invalidation_failures: Counter::new(),
            ratelimit_allowed: Counter::new(),
            ratelimit_rejected: Counter::new(),
            ratelimit_fail_open: Counter::new(),
            keepalive_failures: Counter::new(),
            reregistrations: Counter::new(),
            resolver_updates: Counter::new(),
            resolver_resyncs: Counter::new(),
            known_instances: Gauge::new(),
            start_time: Instant::now(),
        }
    }

    pub fn endpoint(&self, path: &str) -> Arc<EndpointMetrics> {
        let mut endpoints = self
            .endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        endpoints.entry(path.to_string()).or_default().clone()
    }

    pub fn record_request(&self, path: &str, duration: Duration, success: bool) {
        let endpoint = self.endpoint(path);
        endpoint.requests_total.inc();
        endpoint.latency.observe(duration.as_secs_f64() * 1000.0);
        if !success {
            endpoint.requests_error.inc();
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-compatible metrics output
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters: [(&str, &str, &Counter); 13] = [
            ("usermesh_cache_hits_total", "Cache store hits", &self.cache_hits),
            ("usermesh_cache_misses_total", "Cache store misses", &self.cache_misses),
            ("usermesh_cache_store_errors_total", "Cache store failures treated as misses", &self.cache_store_errors),
            ("usermesh_backing_fetches_total", "Backing store fetches issued by coalescing groups", &self.backing_fetches),
            ("usermesh_coalesced_waits_total", "Reads that attached to an in-flight fetch", &self.coalesced_waits),
            ("usermesh_invalidation_failures_total", "Cache deletes that failed after a write", &self.invalidation_failures),
            ("usermesh_ratelimit_allowed_total", "Requests admitted by the rate limiter", &self.ratelimit_allowed),
            ("usermesh_ratelimit_rejected_total", "Requests rejected by the rate limiter", &self.ratelimit_rejected),
            ("usermesh_ratelimit_fail_open_total", "Requests admitted because the counter store failed", &self.ratelimit_fail_open),
            ("usermesh_keepalive_failures_total", "Failed lease keepalive attempts", &self.keepalive_failures),
            ("usermesh_reregistrations_total", "Registrations re-created after lease loss", &self.reregistrations),
            ("usermesh_resolver_updates_total", "Watch events applied by resolvers", &self.resolver_updates),
            ("usermesh_resolver_resyncs_total", "Full re-listings after a broken watch", &self.resolver_resyncs),
        ];
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, counter.get());
        }

        out.push_str("# HELP usermesh_known_instances Instances currently known to resolvers\n");
        out.push_str("# TYPE usermesh_known_instances gauge\n");
        let _ = writeln!(out, "usermesh_known_instances {}", self.known_instances.get());

        out.push_str("# HELP usermesh_uptime_seconds Process uptime in seconds\n");
        out.push_str("# TYPE usermesh_uptime_seconds gauge\n");
        let _ = writeln!(out, "usermesh_uptime_seconds {}", self.uptime_seconds());

        let endpoints = self
            .endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        out.push_str("# HELP usermesh_request_duration_ms Request duration in milliseconds\n");
        out.push_str("# TYPE usermesh_request_duration_ms histogram\n");
        for (path, metrics) in endpoints.iter() {
            for (le, count) in metrics.latency.get_buckets() {
                let le = if le.is_infinite() {
                    "+Inf".to_string()
                } else {
                    le.to_string()
                };
                let _ = writeln!(
                    out,
                    "usermesh_request_duration_ms_bucket{{path=\"{}\",le=\"{}\"}} {}",
                    path, le, count
                );
            }
            let _ = writeln!(
                out,
                "usermesh_request_duration_ms_sum{{path=\"{}\"}} {}",
                path,
                metrics.latency.sum()
            );
            let _ = writeln!(
                out,
                "usermesh_request_duration_ms_count{{path=\"{}\"}} {}",
                path,
                metrics.latency.count()
            );
            let _ = writeln!(
                out,
                "usermesh_request_errors_total{{path=\"{}\"}} {}",
                path,
                metrics.requests_error.get()
            );
        }

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
