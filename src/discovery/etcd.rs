//! etcd v3 adapter over the JSON gateway
//!
//! Talks to `/v3/...` on any of the configured endpoints. Keys and values
//! travel base64-encoded and int64 fields come back as JSON strings. On a
//! connection failure the client moves on to the next endpoint.

use crate::common::{Error, Result};
use crate::discovery::coordination::{
    CoordinationClient, KeyValue, LeaseId, Listing, WatchEvent, WatchStream,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct EtcdClient {
    http: reqwest::Client,
    watch_http: reqwest::Client,
    endpoints: Vec<String>,
    current: AtomicUsize,
}

impl EtcdClient {
    pub fn new(endpoints: Vec<String>, dial_timeout: Duration) -> Result<Self> {
        let endpoints: Vec<String> = endpoints
            .into_iter()
            .map(|e| normalize_endpoint(&e))
            .filter(|e| !e.is_empty())
            .collect();
        if endpoints.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one etcd endpoint is required".into(),
            ));
        }

        let http = reqwest::Client::builder()
            .connect_timeout(dial_timeout)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;
        // watches are long-lived, so no overall request timeout
        let watch_http = reqwest::Client::builder()
            .connect_timeout(dial_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            watch_http,
            endpoints,
            current: AtomicUsize::new(0),
        })
    }

    /// Build the client and check that some endpoint answers
    pub async fn connect(endpoints: Vec<String>, dial_timeout: Duration) -> Result<Self> {
        let client = Self::new(endpoints, dial_timeout)?;
        let _: Value = client.call("/v3/maintenance/status", json!({})).await?;
        tracing::info!(endpoints = ?client.endpoints, "Connected to etcd");
        Ok(client)
    }

    /// POST `body` to `path`, failing over across endpoints on connect errors
    async fn send(&self, http: &reqwest::Client, path: &str, body: &Value) -> Result<reqwest::Response> {
        let start = self.current.load(Ordering::Relaxed);
        let mut last_err = None;

        for i in 0..self.endpoints.len() {
            let idx = (start + i) % self.endpoints.len();
            let url = format!("{}{}", self.endpoints[idx], path);
            match http.post(&url).json(body).send().await {
                Ok(response) => {
                    self.current.store(idx, Ordering::Relaxed);
                    if response.status().is_success() {
                        return Ok(response);
                    }
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    return Err(gateway_error(status.as_u16(), &text));
                }
                Err(e) if e.is_connect() || e.is_timeout() => {
                    tracing::debug!(endpoint = %self.endpoints[idx], error = %e, "etcd endpoint unreachable");
                    last_err = Some(e);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::CoordinationUnavailable(match last_err {
            Some(e) => e.to_string(),
            None => "no endpoints".into(),
        }))
    }

    async fn call<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T> {
        let response = self.send(&self.http, path, &body).await?;
        let text = response.text().await?;
        Ok(serde_json::from_str(&text)?)
    }
}

fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.is_empty() || endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    }
}

#[derive(Debug, Deserialize, Default)]
struct GatewayError {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: i32,
}

impl GatewayError {
    fn text(&self) -> &str {
        if self.message.is_empty() {
            &self.error
        } else {
            &self.message
        }
    }
}

fn gateway_error(status: u16, body: &str) -> Error {
    let err: GatewayError = serde_json::from_str(body).unwrap_or_default();
    let text = if err.text().is_empty() { body } else { err.text() };
    // gRPC code 14: UNAVAILABLE
    if status == 503 || err.code == 14 {
        Error::CoordinationUnavailable(text.to_string())
    } else {
        Error::Coordination(format!("HTTP {}: {}", status, text))
    }
}

fn is_lease_not_found(err: &Error) -> bool {
    matches!(err, Error::Coordination(msg) if msg.contains("lease not found"))
}

fn de_i64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Int {
        Num(i64),
        Str(String),
    }
    match Int::deserialize(d)? {
        Int::Num(n) => Ok(n),
        Int::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Deserialize, Default)]
struct Header {
    #[serde(default, deserialize_with = "de_i64")]
    revision: i64,
}

#[derive(Debug, Deserialize)]
struct RawKv {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
}

impl RawKv {
    fn decode(&self) -> Result<KeyValue> {
        Ok(KeyValue {
            key: decode_text(&self.key)?,
            value: decode_text(&self.value)?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct GrantResponse {
    #[serde(rename = "ID", default, deserialize_with = "de_i64")]
    id: i64,
    #[serde(default)]
    error: String,
}

#[derive(Debug, Deserialize, Default)]
struct KeepAliveResult {
    #[serde(rename = "TTL", default, deserialize_with = "de_i64")]
    ttl: i64,
}

#[derive(Debug, Deserialize)]
struct KeepAliveEnvelope {
    result: Option<KeepAliveResult>,
    error: Option<GatewayError>,
}

#[derive(Debug, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    header: Header,
    #[serde(default)]
    kvs: Vec<RawKv>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type", default)]
    kind: String,
    kv: RawKv,
}

#[derive(Debug, Deserialize, Default)]
struct WatchResult {
    #[serde(default)]
    canceled: bool,
    #[serde(default)]
    cancel_reason: String,
    #[serde(default, deserialize_with = "de_i64")]
    compact_revision: i64,
    #[serde(default)]
    events: Vec<RawEvent>,
}

#[derive(Debug, Deserialize)]
struct WatchEnvelope {
    result: Option<WatchResult>,
    error: Option<GatewayError>,
}

fn encode(s: &str) -> String {
    STANDARD.encode(s.as_bytes())
}

fn decode_text(s: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(s)
        .map_err(|e| Error::Coordination(format!("invalid base64 from etcd: {}", e)))?;
    String::from_utf8(bytes).map_err(|e| Error::Coordination(format!("non-UTF-8 value: {}", e)))
}

/// Smallest key greater than every key starting with `prefix`
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    vec![0]
}

/// Decode one newline-delimited message from a watch response
fn parse_watch_line(line: &[u8]) -> Result<Vec<WatchEvent>> {
    let envelope: WatchEnvelope = serde_json::from_slice(line)?;
    if let Some(err) = envelope.error {
        return Err(Error::WatchClosed(err.text().to_string()));
    }
    let result = envelope.result.unwrap_or_default();
    if result.compact_revision > 0 {
        return Err(Error::WatchClosed(format!(
            "watch start compacted, oldest revision {}",
            result.compact_revision
        )));
    }
    if result.canceled {
        return Err(Error::WatchClosed(format!(
            "watch canceled: {}",
            result.cancel_reason
        )));
    }

    result
        .events
        .iter()
        .map(|ev| {
            let key = decode_text(&ev.kv.key)?;
            if ev.kind == "DELETE" {
                Ok(WatchEvent::Delete { key })
            } else {
                Ok(WatchEvent::Put {
                    key,
                    value: decode_text(&ev.kv.value)?,
                })
            }
        })
        .collect()
}

#[async_trait]
impl CoordinationClient for EtcdClient {
    async fn grant(&self, ttl_secs: i64) -> Result<LeaseId> {
        let resp: GrantResponse = self
            .call("/v3/lease/grant", json!({ "TTL": ttl_secs.to_string() }))
            .await?;
        if !resp.error.is_empty() || resp.id == 0 {
            return Err(Error::Coordination(format!(
                "lease grant refused: {}",
                resp.error
            )));
        }
        Ok(resp.id)
    }

    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        let mut body = json!({ "key": encode(key), "value": encode(value) });
        if let Some(id) = lease {
            body["lease"] = Value::String(id.to_string());
        }
        match self.call::<Value>("/v3/kv/put", body).await {
            Ok(_) => Ok(()),
            Err(e) if is_lease_not_found(&e) => Err(Error::LeaseNotFound(lease.unwrap_or_default())),
            Err(e) => Err(e),
        }
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<i64> {
        let body = json!({ "ID": lease.to_string() });
        let response = self.send(&self.http, "/v3/lease/keepalive", &body).await?;
        let text = response.text().await?;
        let line = text
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| Error::Coordination("empty keepalive response".into()))?;

        let envelope: KeepAliveEnvelope = serde_json::from_str(line)?;
        if let Some(err) = envelope.error {
            return Err(Error::Coordination(err.text().to_string()));
        }
        // an expired lease answers with TTL absent or zero
        match envelope.result.map(|r| r.ttl).unwrap_or(0) {
            ttl if ttl > 0 => Ok(ttl),
            _ => Err(Error::LeaseNotFound(lease)),
        }
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        match self
            .call::<Value>("/v3/lease/revoke", json!({ "ID": lease.to_string() }))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_lease_not_found(&e) => Err(Error::LeaseNotFound(lease)),
            Err(e) => Err(e),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Listing> {
        let body = json!({
            "key": encode(prefix),
            "range_end": STANDARD.encode(prefix_end(prefix.as_bytes())),
        });
        let resp: RangeResponse = self.call("/v3/kv/range", body).await?;
        let kvs = resp
            .kvs
            .iter()
            .map(RawKv::decode)
            .collect::<Result<Vec<_>>>()?;
        Ok(Listing {
            kvs,
            revision: resp.header.revision,
        })
    }

    async fn watch(&self, prefix: &str, start_revision: i64) -> Result<WatchStream> {
        let body = json!({
            "create_request": {
                "key": encode(prefix),
                "range_end": STANDARD.encode(prefix_end(prefix.as_bytes())),
                "start_revision": start_revision.to_string(),
            }
        });
        let response = self.send(&self.watch_http, "/v3/watch", &body).await?;
        let mut body = response.bytes_stream();

        let stream = async_stream::stream! {
            let mut buf: Vec<u8> = Vec::new();
            'read: loop {
                match body.next().await {
                    Some(Ok(chunk)) => {
                        buf.extend_from_slice(&chunk);
                        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                            let line: Vec<u8> = buf.drain(..=pos).collect();
                            if line.iter().all(u8::is_ascii_whitespace) {
                                continue;
                            }
                            match parse_watch_line(&line) {
                                Ok(events) => {
                                    for event in events {
                                        yield Ok(event);
                                    }
                                }
                                Err(e) => {
                                    yield Err(e);
                                    break 'read;
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        yield Err(Error::WatchClosed(e.to_string()));
                        break 'read;
                    }
                    None => {
                        yield Err(Error::WatchClosed("watch stream ended".into()));
                        break 'read;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}
