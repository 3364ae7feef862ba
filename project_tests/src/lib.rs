//! # Project Test Harness
//!
//! Shared fixtures for the workspace-level scenario and property tests: an
//! engine wired to a [`ScriptedFetcher`] with short timings, plus helpers to
//! drain outbound queues and let spawned drivers run under a paused clock.

use std::sync::Arc;
use std::time::Duration;

use lib_common::core::fetcher::ScriptedFetcher;
use lib_common::core::{HostConfig, MetricsFetcher, NodeHub, Outbound, SchedulerConfig, ServerMessage};
use tokio::sync::mpsc;

/// Timings scaled down so tests cover many polls in little virtual time.
/// Polling every second, fetches time out after 400 ms.
pub fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        poll_interval: Duration::from_millis(1_000),
        fetch_timeout: Duration::from_millis(400),
        cache_ttl: Duration::from_millis(300),
        max_consecutive_failures_before_backoff: 5,
        backoff_multiplier: 2,
        max_backoff_interval: Duration::from_millis(3_000),
        outbound_queue_capacity: 64,
    }
}

/// A host entry pointing nowhere; the scripted fetcher never dials it.
pub fn host(id: &str) -> HostConfig {
    HostConfig {
        host_id: id.to_string(),
        display_name: format!("Node {}", id),
        base_url: format!("https://{}.lan:8006", id),
        auth_token_id: "root@pam!dashboard".to_string(),
        auth_token_secret: "not-a-secret".to_string(),
    }
}

pub struct Harness {
    pub hub: NodeHub,
    pub fetcher: Arc<ScriptedFetcher>,
}

impl Harness {
    /// An engine with `hosts` registered and nobody subscribed.
    pub fn new(hosts: &[&str]) -> Self {
        Self::with_config(fast_config(), hosts)
    }

    pub fn with_config(config: SchedulerConfig, hosts: &[&str]) -> Self {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let hub = NodeHub::new(config, Arc::clone(&fetcher) as Arc<dyn MetricsFetcher>)
            .expect("test config is valid");
        hub.register_hosts(hosts.iter().map(|id| host(id)))
            .expect("test hosts are valid");
        Self { hub, fetcher }
    }
}

/// Everything currently queued for a connection.
pub fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
    let mut out = Vec::new();
    while let Ok(message) = rx.try_recv() {
        out.push(message);
    }
    out
}

/// The `type` tag of each message, in order.
pub fn kinds(messages: &[Outbound]) -> Vec<String> {
    messages
        .iter()
        .map(|m| {
            serde_json::to_value(&**m)
                .ok()
                .and_then(|v| v["type"].as_str().map(str::to_string))
                .unwrap_or_default()
        })
        .collect()
}

/// `fetchedAtMillis` of every `data` message for `host_id`, in order.
pub fn data_stamps(messages: &[Outbound], host_id: &str) -> Vec<u64> {
    messages
        .iter()
        .filter_map(|m| match &**m {
            ServerMessage::Data {
                host_id: h,
                fetched_at_millis,
                ..
            } if h == host_id => Some(*fetched_at_millis),
            _ => None,
        })
        .collect()
}

/// Lets spawned drivers run to their next await point.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
