//! # Polling Scheduler
//!
//! Decides when each host is fetched. Every registered host owns exactly one
//! [`PollingTask`] whose state machine is driven by subscriber count and fetch
//! outcomes:
//!
//! ```text
//!            first subscriber                5 consecutive failures
//!   IDLE ----------------------> ACTIVE ---------------------------> BACKOFF
//!    ^                             ^  |                                 |
//!    |      last subscriber leaves |  +---------------------------------+
//!    +-----------------------------+          any success
//!
//!   any state --(deregistration)--> REMOVED
//! ```
//!
//! ## Timers
//!
//! An ACTIVE or BACKOFF host is driven by one spawned task that sleeps until
//! the next tick, fetches, publishes the outcome and goes back to sleep. The
//! driver carries a generation number and a cancellation token. Deactivating
//! a host cancels the token; reactivating it starts a new generation. A driver
//! whose generation is no longer current may finish an in-flight fetch (its
//! result is still cached) but never broadcasts or re-arms, so at most one
//! driver ever publishes for a host.
//!
//! ## Guarded Ticks
//!
//! A timer tick or manual trigger arriving less than 80% of the current
//! interval after the previous fetch started is skipped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::cache::{PutOutcome, SnapshotCache};
use crate::core::dispatcher::Dispatcher;
use crate::core::fetcher::{FetchError, MetricsFetcher};
use crate::core::hosts::{ConfigError, HostDirectory, HostError};
use crate::core::model::{ConnectionId, HostConfig, HostSummary, ResourceSnapshot, ServerMessage};
use crate::core::registry::Registry;
use crate::core::{lock, Shared};

/// Fraction of the interval that must elapse between two fetch starts.
const TICK_GUARD_RATIO: f64 = 0.8;

/// # Host State
///
/// Lifecycle of a host's polling task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostState {
    /// No subscribers; no timer armed; never fetched.
    Idle,
    /// Subscribed; fetched every poll interval.
    Active,
    /// Subscribed but failing; fetched every backoff interval.
    Backoff,
    /// Deregistered. Terminal.
    Removed,
}

/// # Scheduler Configuration
///
/// Timing and capacity knobs, fixed for the life of the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Time between fetches of an ACTIVE host.
    pub poll_interval: Duration,
    /// Upper bound on one fetch, including connect and body read.
    pub fetch_timeout: Duration,
    /// How long a cached snapshot spares an activation fetch.
    pub cache_ttl: Duration,
    /// Consecutive failures that move an ACTIVE host to BACKOFF.
    pub max_consecutive_failures_before_backoff: u32,
    /// Poll interval multiplier while in BACKOFF.
    pub backoff_multiplier: u32,
    /// Ceiling on the BACKOFF interval.
    pub max_backoff_interval: Duration,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(20_000),
            fetch_timeout: Duration::from_millis(8_000),
            cache_ttl: Duration::from_millis(5_000),
            max_consecutive_failures_before_backoff: 5,
            backoff_multiplier: 2,
            max_backoff_interval: Duration::from_millis(120_000),
            outbound_queue_capacity: 64,
        }
    }
}

impl SchedulerConfig {
    /// Rejects configurations the scheduler cannot honour.
    ///
    /// The poll interval must be at least twice the fetch timeout so a tick
    /// can never fire while the previous fetch may still be running.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("fetch timeout must be positive".into()));
        }
        let Some(min_interval) = self.fetch_timeout.checked_mul(2) else {
            return Err(ConfigError::InvalidValue("fetch timeout is out of range".into()));
        };
        if self.poll_interval < min_interval {
            return Err(ConfigError::IntervalTooShort {
                interval: self.poll_interval,
                timeout: self.fetch_timeout,
            });
        }
        if self.max_consecutive_failures_before_backoff == 0 {
            return Err(ConfigError::InvalidValue("failure threshold must be at least 1".into()));
        }
        if self.backoff_multiplier == 0 {
            return Err(ConfigError::InvalidValue("backoff multiplier must be at least 1".into()));
        }
        if self.poll_interval.checked_mul(self.backoff_multiplier).is_none() {
            return Err(ConfigError::InvalidValue(
                "poll interval times backoff multiplier is out of range".into(),
            ));
        }
        if self.max_backoff_interval < self.poll_interval {
            return Err(ConfigError::InvalidValue(
                "max backoff interval must not be shorter than the poll interval".into(),
            ));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue("outbound queue capacity must be positive".into()));
        }
        Ok(())
    }

    /// The polling interval while in BACKOFF.
    pub fn backoff_interval(&self) -> Duration {
        self.poll_interval
            .checked_mul(self.backoff_multiplier)
            .map_or(self.max_backoff_interval, |d| d.min(self.max_backoff_interval))
    }
}

/// Point-in-time view of one host's polling task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStatus {
    /// Host identifier.
    pub host_id: String,
    /// Host display name.
    pub display_name: String,
    /// Current state.
    pub state: HostState,
    /// Effective polling interval, milliseconds.
    pub interval_ms: u64,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Connections subscribed to the host.
    pub subscribers: usize,
    /// Timestamp of the cached snapshot, if any.
    pub last_fetched_at_millis: Option<u64>,
}

/// The live timer of an ACTIVE or BACKOFF host.
struct TimerHandle {
    generation: u64,
    cancel: CancellationToken,
    wake: Arc<Notify>,
}

/// # Polling Task
///
/// Scheduling state of one host.
struct PollingTask {
    state: HostState,
    interval: Duration,
    last_fetch_at: Option<Instant>,
    consecutive_failures: u32,
    /// `false` until the first success after activation or after a failure.
    healthy: bool,
    timer: Option<TimerHandle>,
    /// Generation counter value when the host was registered. Drivers with
    /// an older generation belong to a previous registration of the same id.
    registered_at: u64,
}

impl PollingTask {
    fn new(poll_interval: Duration, registered_at: u64) -> Self {
        Self {
            state: HostState::Idle,
            interval: poll_interval,
            last_fetch_at: None,
            consecutive_failures: 0,
            healthy: false,
            timer: None,
            registered_at,
        }
    }

    fn owns(&self, generation: u64) -> bool {
        generation > self.registered_at
    }

    fn is_current(&self, generation: u64) -> bool {
        self.timer.as_ref().is_some_and(|t| t.generation == generation)
    }

    fn transition(&mut self, host_id: &str, to: HostState) {
        if self.state != to {
            log::info!("Host '{}': {:?} -> {:?}", host_id, self.state, to);
            self.state = to;
        }
    }

    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel.cancel();
        }
    }
}

struct SchedulerInner {
    hosts: HostDirectory,
    tasks: HashMap<String, PollingTask>,
}

/// Which event woke a host driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    Activation,
    Timer,
    Manual,
}

enum Plan {
    Fetch(HostConfig),
    Skip,
    Stop,
}

/// What to publish for a completed fetch.
enum Verdict {
    /// The driver is current; publish, announcing recovery if set.
    Publish { announce: bool, display_name: String },
    /// The driver was superseded; cache only.
    Detached,
    /// The host is gone.
    Gone,
}

/// # Scheduler
///
/// Owns the host directory and one polling task per host.
pub struct Scheduler {
    config: SchedulerConfig,
    fetcher: Arc<dyn MetricsFetcher>,
    cache: Shared<SnapshotCache>,
    registry: Shared<Registry>,
    dispatcher: Arc<Dispatcher>,
    inner: Mutex<SchedulerInner>,
    generations: AtomicU64,
}

impl Scheduler {
    /// Creates a scheduler with no hosts.
    pub fn new(
        config: SchedulerConfig,
        fetcher: Arc<dyn MetricsFetcher>,
        cache: Shared<SnapshotCache>,
        registry: Shared<Registry>,
        dispatcher: Arc<Dispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            fetcher,
            cache,
            registry,
            dispatcher,
            inner: Mutex::new(SchedulerInner {
                hosts: HostDirectory::new(),
                tasks: HashMap::new(),
            }),
            generations: AtomicU64::new(0),
        })
    }

    /// The configuration this scheduler runs with.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // --- Host directory ---

    /// Registers a host in the IDLE state. Nothing is fetched until a
    /// connection subscribes.
    pub fn register_host(&self, host: HostConfig) -> Result<(), HostError> {
        let host_id = host.host_id.clone();
        let mut inner = lock(&self.inner);
        inner.hosts.insert(host)?;
        let registered_at = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        inner
            .tasks
            .insert(host_id.clone(), PollingTask::new(self.config.poll_interval, registered_at));
        log::info!("Host '{}' registered (IDLE)", host_id);
        Ok(())
    }

    /// Changes a host's display name.
    pub fn rename_host(&self, host_id: &str, display_name: &str) -> Result<(), HostError> {
        lock(&self.inner).hosts.rename(host_id, display_name)?;
        log::info!("Host '{}' renamed to '{}'", host_id, display_name);
        Ok(())
    }

    /// # Deregister Host
    ///
    /// Moves the host to REMOVED: cancels its timer, drops its cached
    /// snapshot and every subscription to it, and tells each affected
    /// connection with an `unsubscribed` message. A fetch already in flight
    /// completes into the void.
    ///
    /// Returns the connections that were subscribed.
    pub fn deregister_host(&self, host_id: &str) -> Result<Vec<ConnectionId>, HostError> {
        let orphaned = {
            let mut inner = lock(&self.inner);
            inner.hosts.remove(host_id)?;
            if let Some(mut task) = inner.tasks.remove(host_id) {
                task.disarm();
                task.transition(host_id, HostState::Removed);
            }
            let orphaned = lock(&self.registry).remove_host(host_id);
            lock(&self.cache).invalidate(host_id);
            orphaned
        };
        self.fetcher.forget(host_id);

        let notice = Arc::new(ServerMessage::Unsubscribed { host_id: host_id.to_string() });
        for conn in &orphaned {
            if let Err(err) = self.dispatcher.send_to(*conn, Arc::clone(&notice)) {
                log::warn!("Could not notify connection {} of removal of '{}': {}", conn, host_id, err);
            }
        }
        log::info!("Host '{}' deregistered ({} subscriber(s) released)", host_id, orphaned.len());
        Ok(orphaned.into_iter().collect())
    }

    /// A copy of a host's configuration.
    pub fn host(&self, host_id: &str) -> Option<HostConfig> {
        lock(&self.inner).hosts.get(host_id).cloned()
    }

    /// The display name of a host.
    pub fn display_name(&self, host_id: &str) -> Option<String> {
        lock(&self.inner).hosts.get(host_id).map(|h| h.display_name.clone())
    }

    /// Client-safe summaries of every registered host.
    pub fn host_summaries(&self) -> Vec<HostSummary> {
        lock(&self.inner).hosts.summaries()
    }

    // --- Introspection ---

    /// Current state of a host's polling task.
    pub fn state_of(&self, host_id: &str) -> Option<HostState> {
        lock(&self.inner).tasks.get(host_id).map(|t| t.state)
    }

    /// Current effective polling interval of a host.
    pub fn interval_of(&self, host_id: &str) -> Option<Duration> {
        lock(&self.inner).tasks.get(host_id).map(|t| t.interval)
    }

    /// Consecutive failures of a host since its last success.
    pub fn failures_of(&self, host_id: &str) -> Option<u32> {
        lock(&self.inner).tasks.get(host_id).map(|t| t.consecutive_failures)
    }

    /// Status of every host, in host id order.
    pub fn status(&self) -> Vec<HostStatus> {
        let inner = lock(&self.inner);
        let registry = lock(&self.registry);
        let cache = lock(&self.cache);
        inner
            .hosts
            .summaries()
            .into_iter()
            .filter_map(|summary| {
                let task = inner.tasks.get(&summary.id)?;
                Some(HostStatus {
                    subscribers: registry.subscriber_count(&summary.id),
                    last_fetched_at_millis: cache.last_known(&summary.id).map(|s| s.fetched_at_millis),
                    host_id: summary.id,
                    display_name: summary.name,
                    state: task.state,
                    interval_ms: u64::try_from(task.interval.as_millis()).unwrap_or(u64::MAX),
                    consecutive_failures: task.consecutive_failures,
                })
            })
            .collect()
    }

    // --- Subscription-driven transitions ---

    /// # Attach
    ///
    /// Subscribes `conn` to a registered host and activates the host if it
    /// was IDLE. `acknowledge` runs while the subscription edge is being
    /// created, before any broadcast can see the new subscriber, and receives
    /// the host's display name and last known snapshot.
    ///
    /// Returns the host's subscriber count.
    pub fn attach<F>(self: &Arc<Self>, conn: ConnectionId, host_id: &str, acknowledge: F) -> Result<usize, HostError>
    where
        F: FnOnce(&str, Option<Arc<ResourceSnapshot>>),
    {
        let count = {
            let inner = lock(&self.inner);
            let host = inner
                .hosts
                .get(host_id)
                .ok_or_else(|| HostError::UnknownHost(host_id.to_string()))?;
            let mut registry = lock(&self.registry);
            let count = registry.subscribe(conn, host_id);
            let last_known = lock(&self.cache).last_known(host_id);
            acknowledge(&host.display_name, last_known);
            count
        };
        self.reconcile(host_id);
        Ok(count)
    }

    /// Removes one subscription edge and deactivates the host if it was the
    /// last. Returns the host's remaining subscriber count.
    pub fn detach(self: &Arc<Self>, conn: ConnectionId, host_id: &str) -> usize {
        let remaining = lock(&self.registry).unsubscribe(conn, host_id);
        self.reconcile(host_id);
        remaining
    }

    /// Removes every subscription of a closed connection and deactivates
    /// the hosts it was the last subscriber of. Returns those hosts.
    pub fn detach_all(self: &Arc<Self>, conn: ConnectionId) -> Vec<String> {
        let orphaned = lock(&self.registry).remove_connection(conn);
        for host_id in &orphaned {
            self.reconcile(host_id);
        }
        orphaned.into_iter().collect()
    }

    /// Cancels every timer and returns all hosts to IDLE. Used on shutdown.
    pub fn stop_all(&self) {
        let mut inner = lock(&self.inner);
        for (host_id, task) in inner.tasks.iter_mut() {
            task.disarm();
            task.transition(host_id, HostState::Idle);
        }
    }

    /// # Reconcile
    ///
    /// Aligns a host's state with its subscriber count. Sessions call this
    /// after every subscribe, unsubscribe and disconnect; drivers call it
    /// after every fetch.
    ///
    /// - IDLE with subscribers: becomes ACTIVE and fetches immediately.
    /// - ACTIVE or BACKOFF without subscribers: becomes IDLE, timer cancelled.
    ///
    /// The subscriber count is read while the scheduler lock is held, so
    /// concurrent subscribe/unsubscribe calls cannot leave a watched host
    /// IDLE or an unwatched host polling.
    pub fn reconcile(self: &Arc<Self>, host_id: &str) {
        let mut inner = lock(&self.inner);
        let subscribers = lock(&self.registry).subscriber_count(host_id);
        let Some(task) = inner.tasks.get_mut(host_id) else {
            return;
        };

        match (task.state, subscribers) {
            (HostState::Idle, n) if n > 0 => {
                let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
                let cancel = CancellationToken::new();
                let wake = Arc::new(Notify::new());
                task.timer = Some(TimerHandle {
                    generation,
                    cancel: cancel.clone(),
                    wake: Arc::clone(&wake),
                });
                task.interval = self.config.poll_interval;
                task.consecutive_failures = 0;
                task.healthy = false;
                task.transition(host_id, HostState::Active);

                tokio::spawn(Arc::clone(self).drive(host_id.to_string(), generation, cancel, wake));
            }
            (HostState::Active | HostState::Backoff, 0) => {
                task.disarm();
                task.transition(host_id, HostState::Idle);
            }
            _ => {}
        }
    }

    /// # Trigger
    ///
    /// Requests an out-of-band fetch. Honoured only for ACTIVE or BACKOFF
    /// hosts and subject to the tick guard. Returns `false` when the host is
    /// unknown or IDLE.
    pub fn trigger(&self, host_id: &str) -> bool {
        let inner = lock(&self.inner);
        match inner.tasks.get(host_id).and_then(|t| t.timer.as_ref()) {
            Some(timer) => {
                timer.wake.notify_one();
                log::debug!("Manual refresh requested for host '{}'", host_id);
                true
            }
            None => false,
        }
    }

    // --- Driver ---

    async fn drive(self: Arc<Self>, host_id: String, generation: u64, cancel: CancellationToken, wake: Arc<Notify>) {
        log::debug!("Driver {} for host '{}' started", generation, host_id);
        let mut tick = Tick::Activation;
        let mut next_due = Instant::now();

        loop {
            let fetched = match self.plan(&host_id, generation, tick) {
                Plan::Stop => break,
                Plan::Skip => false,
                Plan::Fetch(host) => {
                    // Not cancellable: a fetch outliving its subscribers still
                    // lands in the cache.
                    let result = self.fetch_with_timeout(&host).await;
                    if !self.complete(&host_id, generation, result) {
                        break;
                    }
                    true
                }
            };

            let Some(interval) = self.current_interval(&host_id, generation) else {
                break;
            };
            let now = Instant::now();
            if fetched || next_due <= now {
                next_due = now + interval;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(next_due) => tick = Tick::Timer,
                _ = wake.notified() => tick = Tick::Manual,
            }
        }
        log::debug!("Driver {} for host '{}' stopped", generation, host_id);
    }

    /// Decides whether this tick fetches. Records the fetch start time.
    fn plan(&self, host_id: &str, generation: u64, tick: Tick) -> Plan {
        let mut inner = lock(&self.inner);
        let Some(host) = inner.hosts.get(host_id).cloned() else {
            return Plan::Stop;
        };
        let Some(task) = inner.tasks.get_mut(host_id) else {
            return Plan::Stop;
        };
        if !task.is_current(generation) || !matches!(task.state, HostState::Active | HostState::Backoff) {
            return Plan::Stop;
        }

        let now = Instant::now();
        match tick {
            Tick::Activation => {
                if lock(&self.cache).get(host_id).is_some() {
                    log::debug!("Host '{}' activated with a fresh cached snapshot; first fetch deferred", host_id);
                    task.healthy = true;
                    return Plan::Skip;
                }
            }
            Tick::Timer | Tick::Manual => {
                if let Some(last) = task.last_fetch_at {
                    if now.duration_since(last) < task.interval.mul_f64(TICK_GUARD_RATIO) {
                        log::debug!("Host '{}': {:?} tick skipped, previous fetch too recent", host_id, tick);
                        return Plan::Skip;
                    }
                }
            }
        }
        task.last_fetch_at = Some(now);
        Plan::Fetch(host)
    }

    async fn fetch_with_timeout(&self, host: &HostConfig) -> Result<ResourceSnapshot, FetchError> {
        match tokio::time::timeout(self.config.fetch_timeout, self.fetcher.fetch(host)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(format!(
                "no response within {} ms",
                self.config.fetch_timeout.as_millis()
            ))),
        }
    }

    /// # Complete
    ///
    /// Applies a fetch outcome: updates the failure counter and state,
    /// caches a success, and broadcasts to the host's subscribers. Returns
    /// `false` when the driver must stop.
    fn complete(self: &Arc<Self>, host_id: &str, generation: u64, result: Result<ResourceSnapshot, FetchError>) -> bool {
        let verdict = {
            let mut inner = lock(&self.inner);
            let display_name = inner.hosts.get(host_id).map(|h| h.display_name.clone());
            match (inner.tasks.get_mut(host_id), display_name) {
                (Some(task), Some(display_name)) if task.is_current(generation) => {
                    let announce = self.record(host_id, task, &result);
                    Verdict::Publish { announce, display_name }
                }
                (Some(task), Some(_)) if task.owns(generation) => Verdict::Detached,
                _ => Verdict::Gone,
            }
        };

        match (verdict, result) {
            (Verdict::Gone, _) => {
                log::debug!("Discarding fetch result for removed or re-registered host '{}'", host_id);
                return false;
            }
            (Verdict::Detached, Ok(snapshot)) => {
                self.store(snapshot);
                return false;
            }
            (Verdict::Detached, Err(_)) => return false,
            (Verdict::Publish { announce, display_name }, Ok(snapshot)) => {
                if let Some(snapshot) = self.store(snapshot) {
                    if announce {
                        self.dispatcher.broadcast(
                            host_id,
                            ServerMessage::Connected {
                                host_id: host_id.to_string(),
                                host_name: display_name,
                            },
                        );
                    }
                    self.dispatcher.broadcast_data(&snapshot);
                }
            }
            (Verdict::Publish { .. }, Err(error)) => {
                self.dispatcher.broadcast_error(host_id, &error);
            }
        }

        self.reconcile(host_id);
        self.current_interval(host_id, generation).is_some()
    }

    /// Updates counters and state for a current driver's fetch. Returns
    /// `true` when a success follows activation or a failure.
    fn record(&self, host_id: &str, task: &mut PollingTask, result: &Result<ResourceSnapshot, FetchError>) -> bool {
        match result {
            Ok(snapshot) => {
                if task.consecutive_failures > 0 {
                    log::info!(
                        "Host '{}' recovered after {} failure(s)",
                        host_id,
                        task.consecutive_failures
                    );
                }
                log::debug!("Host '{}' fetched {} record(s)", host_id, snapshot.records.len());
                task.consecutive_failures = 0;
                if task.state == HostState::Backoff {
                    task.interval = self.config.poll_interval;
                    task.transition(host_id, HostState::Active);
                }
                let announce = !task.healthy;
                task.healthy = true;
                announce
            }
            Err(error) => {
                task.consecutive_failures += 1;
                task.healthy = false;
                log::warn!(
                    "Fetch for host '{}' failed ({} consecutive): [{}] {}",
                    host_id,
                    task.consecutive_failures,
                    error.code(),
                    error
                );
                if task.state == HostState::Active
                    && task.consecutive_failures >= self.config.max_consecutive_failures_before_backoff
                {
                    task.interval = self.config.backoff_interval();
                    task.transition(host_id, HostState::Backoff);
                    log::warn!(
                        "Host '{}' backing off: polling every {} ms",
                        host_id,
                        task.interval.as_millis()
                    );
                }
                false
            }
        }
    }

    /// Caches a snapshot. Returns it when it was accepted.
    fn store(&self, snapshot: ResourceSnapshot) -> Option<Arc<ResourceSnapshot>> {
        let snapshot = Arc::new(snapshot);
        match lock(&self.cache).put(Arc::clone(&snapshot)) {
            PutOutcome::Stored => Some(snapshot),
            PutOutcome::Rejected {
                cached_at_millis,
                offered_at_millis,
            } => {
                log::warn!(
                    "Discarding out-of-order snapshot for host '{}' ({} <= cached {})",
                    snapshot.host_id,
                    offered_at_millis,
                    cached_at_millis
                );
                None
            }
        }
    }

    /// The interval to sleep for, if `generation` still drives the host.
    fn current_interval(&self, host_id: &str, generation: u64) -> Option<Duration> {
        lock(&self.inner)
            .tasks
            .get(host_id)
            .filter(|t| t.is_current(generation))
            .map(|t| t.interval)
    }
}
