//! # Core Engine Module
//!
//! This module forms the heart of the node-metrics broadcast engine. It owns
//! every piece of shared state that sits between the hypervisor hosts upstream
//! and the dashboard sockets downstream, and it decides when (and whether) an
//! upstream request is made at all.
//!
//! ## Core Components:
//!
//! - **`model`**: Domain records (hosts, resource snapshots) and the JSON wire
//!   messages exchanged with dashboard clients.
//!
//! - **`hosts`**: The host directory. Validates host configuration and loads
//!   the host list from a configuration file.
//!
//! - **`fetcher`**: The `MetricsFetcher` seam. One fetch is one upstream round
//!   trip; the production implementation lives in the `ingestors` module.
//!
//! - **`cache`**: Last successful snapshot per host, with a freshness window.
//!
//! - **`registry`**: The bidirectional connection <-> host subscription index.
//!
//! - **`dispatcher`**: Zero-copy fan-out of server messages to the bounded
//!   per-connection outbound queues.
//!
//! - **`scheduler`**: The per-host polling state machine
//!   (IDLE / ACTIVE / BACKOFF / REMOVED). Hosts nobody watches are never polled.
//!
//! - **`session`**: The per-connection protocol handler.
//!
//! - **`hub`**: Wires the components above together once per process.
//!
//! ## Lock Ordering
//!
//! Shared state sits behind `std::sync::Mutex`. Whenever more than one lock is
//! held the acquisition order is scheduler state, then registry, then cache.
//! The dispatcher's client table is always acquired last and never held while
//! acquiring another lock.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Host records, resource snapshots and the client/server wire protocol.
pub mod model;
/// Host validation and the host configuration file loader.
pub mod hosts;
/// The upstream metrics fetch abstraction.
pub mod fetcher;
/// Per-host snapshot cache with a freshness window.
pub mod cache;
/// Bidirectional connection/host subscription index.
pub mod registry;
/// The zero-copy broadcaster feeding per-connection outbound queues.
pub mod dispatcher;
/// The per-host polling state machine.
pub mod scheduler;
/// The per-connection protocol state machine.
pub mod session;
/// Process-wide wiring of the engine components.
pub mod hub;

// --- Public API Re-exports ---
pub use cache::{PutOutcome, SnapshotCache};
pub use dispatcher::{BroadcastReport, DeliveryError, Dispatcher, Outbound};
pub use fetcher::{FetchError, MetricsFetcher};
pub use hosts::{ConfigError, HostDirectory, HostError};
pub use hub::NodeHub;
pub use model::{
    ClientMessage, ConnectionId, ErrorCode, HostConfig, HostSummary, ResourceKind, ResourceRecord,
    ResourceSnapshot, ResourceStatus, ServerMessage,
};
pub use registry::Registry;
pub use scheduler::{HostState, HostStatus, Scheduler, SchedulerConfig};
pub use session::{Session, SessionState};

/// Shared, lock-protected component state.
pub type Shared<T> = Arc<Mutex<T>>;

/// Acquires a mutex, recovering the guard if a previous holder panicked.
///
/// Every critical section in this module leaves its data consistent before
/// doing anything that could panic, so a poisoned lock still holds usable state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
