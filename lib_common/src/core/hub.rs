//! # Node Hub
//!
//! Builds the engine once per process and hands out sessions. Every
//! component is constructed here and passed to its collaborators explicitly;
//! nothing in the engine is global.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::core::cache::SnapshotCache;
use crate::core::dispatcher::{Dispatcher, Outbound};
use crate::core::fetcher::MetricsFetcher;
use crate::core::hosts::{ConfigError, HostError};
use crate::core::model::{HostConfig, ResourceSnapshot};
use crate::core::registry::Registry;
use crate::core::scheduler::{Scheduler, SchedulerConfig};
use crate::core::session::Session;
use crate::core::{lock, Shared};

/// # Node Hub
///
/// Cheap to clone; clones share the same engine.
#[derive(Clone)]
pub struct NodeHub {
    scheduler: Arc<Scheduler>,
    dispatcher: Arc<Dispatcher>,
    registry: Shared<Registry>,
    cache: Shared<SnapshotCache>,
    fetcher: Arc<dyn MetricsFetcher>,
    next_connection: Arc<AtomicU64>,
}

impl NodeHub {
    /// Validates `config` and wires an engine with no hosts around `fetcher`.
    pub fn new(config: SchedulerConfig, fetcher: Arc<dyn MetricsFetcher>) -> Result<Self, ConfigError> {
        config.validate()?;
        let registry: Shared<Registry> = Arc::new(Mutex::new(Registry::new()));
        let cache = Arc::new(Mutex::new(SnapshotCache::new(config.cache_ttl)));
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry)));
        let scheduler = Scheduler::new(
            config,
            Arc::clone(&fetcher),
            Arc::clone(&cache),
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
        );
        Ok(Self {
            scheduler,
            dispatcher,
            registry,
            cache,
            fetcher,
            next_connection: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Registers every host, stopping at the first invalid one.
    pub fn register_hosts<I>(&self, hosts: I) -> Result<usize, HostError>
    where
        I: IntoIterator<Item = HostConfig>,
    {
        let mut registered = 0;
        for host in hosts {
            self.scheduler.register_host(host)?;
            registered += 1;
        }
        Ok(registered)
    }

    /// Opens a session for a new connection. The receiver is the
    /// connection's outbound queue.
    pub fn open_session(&self) -> (Session, mpsc::Receiver<Outbound>) {
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        Session::open(id, self.clone())
    }

    /// The polling scheduler.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// The broadcaster.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The subscription registry.
    pub fn registry(&self) -> &Shared<Registry> {
        &self.registry
    }

    /// The metrics fetcher the scheduler polls with.
    pub fn fetcher(&self) -> &Arc<dyn MetricsFetcher> {
        &self.fetcher
    }

    /// Connections subscribed to `host_id`.
    pub fn subscriber_count(&self, host_id: &str) -> usize {
        lock(&self.registry).subscriber_count(host_id)
    }

    /// The cached snapshot of `host_id`, regardless of age.
    pub fn last_known(&self, host_id: &str) -> Option<Arc<ResourceSnapshot>> {
        lock(&self.cache).last_known(host_id)
    }

    /// Stops all polling. Sessions stay usable but nothing is fetched.
    pub fn shutdown(&self) {
        self.scheduler.stop_all();
        log::info!("Polling stopped for all hosts");
    }
}
