//! Utility functions for usermesh

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp (seconds)
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Strip the port from `host:port`, `[v6]:port` or a bare host.
pub fn host_of(addr: &str) -> &str {
    let addr = addr.trim();
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    if addr.parse::<IpAddr>().is_ok() {
        return addr;
    }
    match addr.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => addr,
    }
}

/// Turn an instance address into a URI the transport layers accept.
pub fn to_http_uri(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("10.0.0.7:9090"), "10.0.0.7");
        assert_eq!(host_of("[::1]:9090"), "::1");
        assert_eq!(host_of("::1"), "::1");
        assert_eq!(host_of("203.0.113.9"), "203.0.113.9");
        assert_eq!(host_of("node-a.internal:80"), "node-a.internal");
    }

    #[test]
    fn test_to_http_uri() {
        assert_eq!(to_http_uri("10.0.0.7:9090"), "http://10.0.0.7:9090");
        assert_eq!(to_http_uri("https://a:1"), "https://a:1");
    }
}
