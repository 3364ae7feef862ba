//! # Metrics Fetcher
//!
//! The seam between the engine and a host's management API. A fetch performs
//! exactly one upstream round trip and either yields a normalized snapshot or
//! a classified error. Fetchers hold no engine state: they never touch the
//! cache, the registry or any connection. Retrying is the scheduler's job.
//!
//! The production implementation is
//! [`PveResourceFetcher`](crate::ingestors::pve_resources::PveResourceFetcher).
//! With the `testing` feature a scripted in-memory fetcher is also available.

use futures_util::future::BoxFuture;
use thiserror::Error;

use crate::core::model::{ErrorCode, HostConfig, ResourceSnapshot};

/// # Fetch Error
///
/// Why a fetch produced no snapshot. Each variant maps onto one wire
/// [`ErrorCode`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The host refused the TCP connection.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    /// No response arrived within the fetch timeout.
    #[error("request timed out: {0}")]
    Timeout(String),
    /// The TLS handshake failed.
    #[error("TLS failure: {0}")]
    Tls(String),
    /// The host rejected the API token.
    #[error("authentication rejected by host (HTTP {status})")]
    AuthFailure {
        /// HTTP status returned by the host.
        status: u16,
    },
    /// The response body was not the expected JSON document.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    /// Any other transport failure.
    #[error("network error: {0}")]
    Network(String),
}

impl FetchError {
    /// The wire error code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            FetchError::ConnectionRefused(_) => ErrorCode::ConnectionRefused,
            FetchError::Timeout(_) => ErrorCode::Timeout,
            FetchError::Tls(_) => ErrorCode::TlsError,
            FetchError::AuthFailure { .. } => ErrorCode::AuthFailure,
            FetchError::MalformedResponse(_) => ErrorCode::MalformedResponse,
            FetchError::Network(_) => ErrorCode::NetworkError,
        }
    }
}

/// # Metrics Fetcher
///
/// Retrieves the current resource snapshot of one host.
///
/// Implementations must be safe to call concurrently for different hosts and
/// must not retry internally. The scheduler applies its own timeout around
/// every call, so an implementation that hangs is reported as
/// [`FetchError::Timeout`].
pub trait MetricsFetcher: Send + Sync {
    /// Performs one fetch against `host`.
    fn fetch<'a>(&'a self, host: &'a HostConfig) -> BoxFuture<'a, Result<ResourceSnapshot, FetchError>>;

    /// Drops whatever the fetcher keeps for `host_id`. Called when the host
    /// is deregistered.
    fn forget(&self, _host_id: &str) {}
}

#[cfg(any(test, feature = "testing"))]
pub use scripted::{ScriptedFetcher, ScriptedOutcome};

#[cfg(any(test, feature = "testing"))]
mod scripted {
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;

    use super::{FetchError, MetricsFetcher};
    use crate::core::lock;
    use crate::core::model::{HostConfig, ResourceKind, ResourceRecord, ResourceSnapshot, ResourceStatus};

    /// One queued fetch result.
    #[derive(Debug, Clone)]
    pub enum ScriptedOutcome {
        /// Succeed with these records.
        Records(Vec<ResourceRecord>),
        /// Fail with this error.
        Fail(FetchError),
        /// Never answer; the scheduler's timeout fires instead.
        Hang,
    }

    /// # Scripted Fetcher
    ///
    /// An in-memory fetcher for tests. Outcomes queued per host are consumed
    /// in order; once a host's queue is empty it falls back to its persistent
    /// failure (if set) or to a one-record success. Every call is counted.
    /// `fetchedAtMillis` values come from a shared counter, so they strictly
    /// increase across all calls.
    #[derive(Debug)]
    pub struct ScriptedFetcher {
        queued: Mutex<HashMap<String, VecDeque<ScriptedOutcome>>>,
        failing: Mutex<HashMap<String, FetchError>>,
        calls: Mutex<HashMap<String, usize>>,
        latency: Mutex<Option<Duration>>,
        forgotten: Mutex<Vec<String>>,
        clock: AtomicU64,
    }

    impl Default for ScriptedFetcher {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ScriptedFetcher {
        /// A fetcher that succeeds for every host.
        pub fn new() -> Self {
            Self {
                queued: Mutex::new(HashMap::new()),
                failing: Mutex::new(HashMap::new()),
                calls: Mutex::new(HashMap::new()),
                latency: Mutex::new(None),
                forgotten: Mutex::new(Vec::new()),
                clock: AtomicU64::new(1_700_000_000_000),
            }
        }

        /// Queues the next outcome for `host_id`.
        pub fn push(&self, host_id: &str, outcome: ScriptedOutcome) {
            lock(&self.queued)
                .entry(host_id.to_string())
                .or_default()
                .push_back(outcome);
        }

        /// Makes every unscripted fetch for `host_id` fail with `error`.
        pub fn fail_always(&self, host_id: &str, error: FetchError) {
            lock(&self.failing).insert(host_id.to_string(), error);
        }

        /// Clears a persistent failure set with [`fail_always`](Self::fail_always).
        pub fn recover(&self, host_id: &str) {
            lock(&self.failing).remove(host_id);
        }

        /// Delays every answer by `latency`.
        pub fn set_latency(&self, latency: Duration) {
            *lock(&self.latency) = Some(latency);
        }

        /// Number of fetches issued for `host_id`.
        pub fn calls_for(&self, host_id: &str) -> usize {
            lock(&self.calls).get(host_id).copied().unwrap_or(0)
        }

        /// Number of fetches issued for all hosts.
        pub fn total_calls(&self) -> usize {
            lock(&self.calls).values().sum()
        }

        /// Host ids passed to `forget`, in call order.
        pub fn forgotten(&self) -> Vec<String> {
            lock(&self.forgotten).clone()
        }

        /// A single running VM record named after the host.
        pub fn sample_records(host_id: &str) -> Vec<ResourceRecord> {
            vec![ResourceRecord {
                resource_id: "qemu/100".into(),
                kind: ResourceKind::Vm,
                name: format!("{}-vm", host_id),
                status: ResourceStatus::Running,
                cpu_fraction: 0.1,
                mem_used_bytes: 512 * 1024 * 1024,
                mem_total_bytes: 2048 * 1024 * 1024,
                disk_used_bytes: 0,
                disk_total_bytes: 32 * 1024 * 1024 * 1024,
                network_in_bytes_per_sec: 0.0,
                network_out_bytes_per_sec: 0.0,
                uptime_seconds: 3600,
            }]
        }

        fn next_outcome(&self, host_id: &str) -> ScriptedOutcome {
            *lock(&self.calls).entry(host_id.to_string()).or_insert(0) += 1;
            if let Some(outcome) = lock(&self.queued).get_mut(host_id).and_then(VecDeque::pop_front) {
                return outcome;
            }
            match lock(&self.failing).get(host_id) {
                Some(error) => ScriptedOutcome::Fail(error.clone()),
                None => ScriptedOutcome::Records(Self::sample_records(host_id)),
            }
        }
    }

    impl MetricsFetcher for ScriptedFetcher {
        fn fetch<'a>(&'a self, host: &'a HostConfig) -> BoxFuture<'a, Result<ResourceSnapshot, FetchError>> {
            let outcome = self.next_outcome(&host.host_id);
            let latency = *lock(&self.latency);
            async move {
                if let Some(latency) = latency {
                    tokio::time::sleep(latency).await;
                }
                match outcome {
                    ScriptedOutcome::Records(records) => Ok(ResourceSnapshot {
                        host_id: host.host_id.clone(),
                        fetched_at_millis: self.clock.fetch_add(1, Ordering::SeqCst) + 1,
                        records,
                    }),
                    ScriptedOutcome::Fail(error) => Err(error),
                    ScriptedOutcome::Hang => futures_util::future::pending().await,
                }
            }
            .boxed()
        }

        fn forget(&self, host_id: &str) {
            lock(&self.forgotten).push(host_id.to_string());
        }
    }
}
