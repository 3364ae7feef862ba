//! # Cluster Resources Ingestor
//!
//! The production [`MetricsFetcher`]: one `GET /api2/json/cluster/resources`
//! per fetch, authenticated with an API token, against hosts that usually
//! present self-signed certificates.
//!
//! ## Normalization
//!
//! - `qemu` records become `VM`, `lxc` become `CONTAINER`, anything else
//!   (nodes, storage, pools) is `OTHER`.
//! - CPU is passed through as the fraction the host reports.
//! - Memory and disk are absolute byte counts.
//! - Upstream network counters are cumulative. Rates are derived from the
//!   previous sample of the same resource; the first sample, and any sample
//!   after a counter reset, reports `0`.
//!
//! ## Error Classification
//!
//! Transport failures are sorted into timeout, connection refused, TLS and
//! generic network errors by inspecting the error chain. HTTP 401/403 is an
//! authentication failure. A 2xx body that is not the expected document is
//! a malformed response.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Deserialize;

use crate::core::fetcher::{FetchError, MetricsFetcher};
use crate::core::model::{HostConfig, ResourceKind, ResourceRecord, ResourceSnapshot, ResourceStatus};
use crate::retrieve::ky_http::{pve_token_authorization, ApiClient, ClientOptions, HttpError};

/// Path of the cluster resources endpoint, relative to the host base URL.
pub const RESOURCES_PATH: &str = "api2/json/cluster/resources";

#[derive(Debug, Deserialize)]
struct ResourceList {
    data: Vec<RawResource>,
}

/// One entry of the cluster resources list. Numeric fields arrive as JSON
/// numbers that may be integral or fractional depending on host version.
#[derive(Debug, Deserialize)]
struct RawResource {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    cpu: Option<f64>,
    #[serde(default)]
    mem: Option<f64>,
    #[serde(default)]
    maxmem: Option<f64>,
    #[serde(default)]
    disk: Option<f64>,
    #[serde(default)]
    maxdisk: Option<f64>,
    #[serde(default)]
    netin: Option<f64>,
    #[serde(default)]
    netout: Option<f64>,
    #[serde(default)]
    uptime: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct CounterSample {
    net_in: u64,
    net_out: u64,
    at_millis: u64,
}

#[derive(Debug, Default)]
struct HostHistory {
    fingerprint: String,
    last_fetched_at_millis: u64,
    counters: HashMap<String, CounterSample>,
}

struct CachedClient {
    fingerprint: String,
    client: Arc<ApiClient>,
}

/// # Cluster Resources Fetcher
///
/// Keeps one pooled HTTP client per host and the previous network counters
/// of every resource. Both are tied to the host's connection details, so a
/// host id that is reused for another machine starts from scratch. Holds no
/// engine state.
pub struct PveResourceFetcher {
    timeout: Duration,
    clients: Mutex<HashMap<String, CachedClient>>,
    history: Mutex<HashMap<String, HostHistory>>,
}

impl PveResourceFetcher {
    /// A fetcher whose HTTP requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            clients: Mutex::new(HashMap::new()),
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Drops the client and counter history of `host_id`.
    pub fn forget_host(&self, host_id: &str) {
        self.clients
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(host_id);
        self.history
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(host_id);
    }

    fn client_for(&self, host: &HostConfig) -> Result<Arc<ApiClient>, FetchError> {
        let fingerprint = fingerprint(host);
        let mut clients = self.clients.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(cached) = clients.get(&host.host_id) {
            if cached.fingerprint == fingerprint {
                return Ok(Arc::clone(&cached.client));
            }
        }

        let options = ClientOptions {
            timeout: self.timeout,
            accept_invalid_certs: true,
            authorization: Some(pve_token_authorization(&host.auth_token_id, &host.auth_token_secret)),
        };
        let client = Arc::new(ApiClient::new(&host.base_url, options).map_err(|e| classify(&e))?);
        clients.insert(
            host.host_id.clone(),
            CachedClient {
                fingerprint,
                client: Arc::clone(&client),
            },
        );
        log::debug!("HTTP client created for host '{}' ({})", host.host_id, host.base_url);
        Ok(client)
    }

    async fn fetch_resources(&self, host: &HostConfig) -> Result<ResourceSnapshot, FetchError> {
        let client = self.client_for(host)?;
        let response = client
            .get_json::<ResourceList>(RESOURCES_PATH)
            .await
            .map_err(|e| classify(&e))?;
        if !response.success {
            return Err(classify_status(response.status));
        }
        let list = response
            .data
            .ok_or_else(|| FetchError::MalformedResponse("empty response body".into()))?;
        let now = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
        Ok(self.normalize(host, list.data, now))
    }

    /// Converts raw records and advances the host's counter history.
    /// `fetched_at_millis` is forced to increase strictly per host.
    fn normalize(&self, config: &HostConfig, raw: Vec<RawResource>, now_millis: u64) -> ResourceSnapshot {
        let fingerprint = fingerprint(config);
        let mut history = self.history.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let host = history.entry(config.host_id.clone()).or_default();
        if host.fingerprint != fingerprint {
            host.fingerprint = fingerprint;
            host.counters.clear();
        }
        let fetched_at_millis = now_millis.max(host.last_fetched_at_millis + 1);
        host.last_fetched_at_millis = fetched_at_millis;

        let mut seen = HashMap::with_capacity(raw.len());
        let records = raw
            .into_iter()
            .map(|r| {
                let sample = CounterSample {
                    net_in: bytes(r.netin),
                    net_out: bytes(r.netout),
                    at_millis: fetched_at_millis,
                };
                let (rate_in, rate_out) = match host.counters.get(&r.id) {
                    Some(prev) => (
                        rate(prev.net_in, sample.net_in, prev.at_millis, sample.at_millis),
                        rate(prev.net_out, sample.net_out, prev.at_millis, sample.at_millis),
                    ),
                    None => (0.0, 0.0),
                };
                seen.insert(r.id.clone(), sample);
                ResourceRecord {
                    kind: kind_of(&r.kind),
                    name: r.name.clone().filter(|n| !n.is_empty()).unwrap_or_else(|| r.id.clone()),
                    status: status_of(r.status.as_deref()),
                    cpu_fraction: r.cpu.unwrap_or(0.0).max(0.0),
                    mem_used_bytes: bytes(r.mem),
                    mem_total_bytes: bytes(r.maxmem),
                    disk_used_bytes: bytes(r.disk),
                    disk_total_bytes: bytes(r.maxdisk),
                    network_in_bytes_per_sec: rate_in,
                    network_out_bytes_per_sec: rate_out,
                    uptime_seconds: bytes(r.uptime),
                    resource_id: r.id,
                }
            })
            .collect();
        // Resources that disappeared are forgotten.
        host.counters = seen;

        ResourceSnapshot {
            host_id: config.host_id.clone(),
            fetched_at_millis,
            records,
        }
    }
}

impl MetricsFetcher for PveResourceFetcher {
    fn fetch<'a>(&'a self, host: &'a HostConfig) -> BoxFuture<'a, Result<ResourceSnapshot, FetchError>> {
        self.fetch_resources(host).boxed()
    }

    fn forget(&self, host_id: &str) {
        self.forget_host(host_id);
    }
}

fn fingerprint(host: &HostConfig) -> String {
    format!("{}|{}|{}", host.base_url, host.auth_token_id, host.auth_token_secret)
}

fn kind_of(raw: &str) -> ResourceKind {
    match raw {
        "qemu" => ResourceKind::Vm,
        "lxc" => ResourceKind::Container,
        _ => ResourceKind::Other,
    }
}

fn status_of(raw: Option<&str>) -> ResourceStatus {
    match raw {
        Some("running") | Some("online") => ResourceStatus::Running,
        Some("stopped") | Some("offline") => ResourceStatus::Stopped,
        _ => ResourceStatus::Unknown,
    }
}

fn bytes(value: Option<f64>) -> u64 {
    match value {
        Some(v) if v.is_finite() && v > 0.0 => v.round() as u64,
        _ => 0,
    }
}

fn rate(prev: u64, next: u64, prev_at: u64, next_at: u64) -> f64 {
    if next < prev || next_at <= prev_at {
        return 0.0;
    }
    (next - prev) as f64 / ((next_at - prev_at) as f64 / 1000.0)
}

/// Maps a non-2xx status.
fn classify_status(status: u16) -> FetchError {
    match status {
        401 | 403 => FetchError::AuthFailure { status },
        other => FetchError::Network(format!("unexpected HTTP status {}", other)),
    }
}

/// Maps a client-side failure.
fn classify(error: &HttpError) -> FetchError {
    match error {
        HttpError::Decode(e) => FetchError::MalformedResponse(e.to_string()),
        HttpError::InvalidUrl(msg) => FetchError::Network(msg.clone()),
        HttpError::InvalidToken => FetchError::Network("API token is not a valid header value".into()),
        HttpError::Build(e) => FetchError::Tls(error_chain(e)),
        HttpError::Transport(e) => classify_transport(e),
    }
}

fn classify_transport(error: &reqwest::Error) -> FetchError {
    let detail = error_chain(error);
    if error.is_timeout() {
        return FetchError::Timeout(detail);
    }
    if refused(error) {
        return FetchError::ConnectionRefused(detail);
    }
    let lower = detail.to_lowercase();
    if ["certificate", "tls", "ssl", "handshake"].iter().any(|k| lower.contains(k)) {
        return FetchError::Tls(detail);
    }
    if error.is_decode() {
        return FetchError::MalformedResponse(detail);
    }
    FetchError::Network(detail)
}

fn refused(error: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(err) = source {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        source = err.source();
    }
    false
}

/// Renders an error with all its sources, outermost first.
fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut parts = vec![error.to_string()];
    let mut source = error.source();
    while let Some(err) = source {
        let text = err.to_string();
        if parts.last() != Some(&text) {
            parts.push(text);
        }
        source = err.source();
    }
    parts.join(": ")
}
