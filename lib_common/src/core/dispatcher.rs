//! # Zero-Copy Message Dispatcher
//!
//! The `Dispatcher` takes one server message and delivers it to every
//! connection subscribed to the message's host.
//!
//! ## Core Design Principles:
//!
//! 1.  **Zero-Copy Fan-out**: A message is wrapped in an `Arc` once per
//!     broadcast. Every recipient queue receives a pointer to the same
//!     allocation, so a snapshot with hundreds of records is serialized and
//!     cloned once no matter how many dashboards watch the host.
//!
//! 2.  **Bounded Queues**: Each connection owns a bounded MPSC queue drained by
//!     its socket task. Delivery uses `try_send`, so a slow or stuck client
//!     can never stall a broadcast or grow memory without limit. A message
//!     that does not fit is dropped for that client only and logged.
//!
//! 3.  **Isolation**: A failed delivery never affects delivery to any other
//!     subscriber, and nothing is retried. The next poll supersedes whatever
//!     was lost.
//!
//! 4.  **Snapshot of Recipients**: The subscriber set is copied out of the
//!     registry before delivery begins. A client that subscribes mid-broadcast
//!     is served by its own session from the cache instead.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::core::fetcher::FetchError;
use crate::core::lock;
use crate::core::model::{ConnectionId, ResourceSnapshot, ServerMessage};
use crate::core::registry::Registry;
use crate::core::Shared;

/// A message as it sits in an outbound queue.
pub type Outbound = Arc<ServerMessage>;

/// Why a message could not be queued for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The connection's outbound queue is full.
    #[error("outbound queue of connection {0} is full")]
    QueueFull(ConnectionId),
    /// The connection's socket task has gone away.
    #[error("connection {0} is closed")]
    Disconnected(ConnectionId),
    /// No queue is registered for the connection.
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
}

/// Delivery counts for one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Recipients whose queue accepted the message.
    pub delivered: usize,
    /// Recipients the message could not be queued for.
    pub failed: usize,
}

/// # Client Handle
///
/// The dispatcher's side of one connection.
struct ClientHandle {
    /// Producer half of the connection's outbound queue.
    sender: mpsc::Sender<Outbound>,
    /// Messages dropped because the queue was full.
    dropped: u64,
}

/// # Core Dispatcher
///
/// Owns the outbound queue of every open connection.
pub struct Dispatcher {
    clients: Mutex<HashMap<ConnectionId, ClientHandle>>,
    registry: Shared<Registry>,
}

impl Dispatcher {
    /// A dispatcher resolving recipients through `registry`.
    pub fn new(registry: Shared<Registry>) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            registry,
        }
    }

    /// # Add Client
    ///
    /// Creates the outbound queue for a new connection and returns its
    /// consumer half, to be drained by the connection's socket task.
    pub fn add_client(&self, id: ConnectionId, capacity: usize) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        lock(&self.clients).insert(id, ClientHandle { sender: tx, dropped: 0 });
        log::info!("Connection {} registered with dispatcher (queue capacity {})", id, capacity);
        rx
    }

    /// Drops the outbound queue of a connection.
    pub fn remove_client(&self, id: ConnectionId) {
        if let Some(handle) = lock(&self.clients).remove(&id) {
            if handle.dropped > 0 {
                log::info!("Connection {} removed ({} message(s) dropped over its lifetime)", id, handle.dropped);
            } else {
                log::info!("Connection {} removed from dispatcher", id);
            }
        }
    }

    /// Number of connections with an outbound queue.
    pub fn client_count(&self) -> usize {
        lock(&self.clients).len()
    }

    /// Queues one message for one connection.
    pub fn send_to(&self, id: ConnectionId, message: Outbound) -> Result<(), DeliveryError> {
        let mut clients = lock(&self.clients);
        let handle = clients.get_mut(&id).ok_or(DeliveryError::UnknownConnection(id))?;
        Self::deliver(id, handle, message)
    }

    /// Broadcasts a `data` message built from `snapshot` to the host's subscribers.
    pub fn broadcast_data(&self, snapshot: &ResourceSnapshot) -> BroadcastReport {
        self.broadcast(&snapshot.host_id, ServerMessage::data(snapshot))
    }

    /// Broadcasts an `error` message for a failed fetch to the host's subscribers.
    pub fn broadcast_error(&self, host_id: &str, error: &FetchError) -> BroadcastReport {
        self.broadcast(host_id, ServerMessage::error(Some(host_id), error.code(), error.to_string()))
    }

    /// # Broadcast
    ///
    /// Delivers `message` to every connection subscribed to `host_id`.
    ///
    /// ## Logic:
    /// 1.  Copies the subscriber set out of the registry and releases its lock.
    /// 2.  Wraps the message in an `Arc` once.
    /// 3.  Offers a pointer to each subscriber's queue with `try_send`.
    ///     Full or closed queues are logged and skipped.
    pub fn broadcast(&self, host_id: &str, message: ServerMessage) -> BroadcastReport {
        let recipients = lock(&self.registry).subscribers_of(host_id);
        let mut report = BroadcastReport::default();
        if recipients.is_empty() {
            return report;
        }

        let frame: Outbound = Arc::new(message);
        let mut clients = lock(&self.clients);
        for id in recipients {
            let outcome = match clients.get_mut(&id) {
                Some(handle) => Self::deliver(id, handle, Arc::clone(&frame)),
                None => Err(DeliveryError::UnknownConnection(id)),
            };
            match outcome {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    report.failed += 1;
                    log::warn!("Dropping message for host '{}': {}", host_id, err);
                }
            }
        }
        log::debug!(
            "Broadcast for host '{}': {} delivered, {} failed",
            host_id,
            report.delivered,
            report.failed
        );
        report
    }

    fn deliver(id: ConnectionId, handle: &mut ClientHandle, message: Outbound) -> Result<(), DeliveryError> {
        match handle.sender.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                handle.dropped += 1;
                Err(DeliveryError::QueueFull(id))
            }
            Err(TrySendError::Closed(_)) => Err(DeliveryError::Disconnected(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Shared<Registry>, Dispatcher) {
        let registry: Shared<Registry> = Arc::new(Mutex::new(Registry::new()));
        let dispatcher = Dispatcher::new(Arc::clone(&registry));
        (registry, dispatcher)
    }

    fn snapshot(host: &str, at: u64) -> ResourceSnapshot {
        ResourceSnapshot { host_id: host.into(), fetched_at_millis: at, records: Vec::new() }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_only_subscribers_of_the_host() {
        let (registry, dispatcher) = setup();
        let mut rx1 = dispatcher.add_client(1, 8);
        let mut rx2 = dispatcher.add_client(2, 8);
        {
            let mut registry = registry.lock().unwrap();
            registry.subscribe(1, "h1");
            registry.subscribe(2, "h2");
        }

        let report = dispatcher.broadcast_data(&snapshot("h1", 5));
        assert_eq!(report, BroadcastReport { delivered: 1, failed: 0 });

        let got = rx1.try_recv().unwrap();
        assert!(matches!(&*got, ServerMessage::Data { host_id, fetched_at_millis: 5, .. } if host_id == "h1"));
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_frames_are_shared_not_cloned() {
        let (registry, dispatcher) = setup();
        let mut rx1 = dispatcher.add_client(1, 8);
        let mut rx2 = dispatcher.add_client(2, 8);
        registry.lock().unwrap().subscribe(1, "h1");
        registry.lock().unwrap().subscribe(2, "h1");

        dispatcher.broadcast_error("h1", &FetchError::Timeout("slow".into()));
        let a = rx1.try_recv().unwrap();
        let b = rx2.try_recv().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_failed_recipient_does_not_affect_others() {
        let (registry, dispatcher) = setup();
        let rx1 = dispatcher.add_client(1, 8);
        let mut rx2 = dispatcher.add_client(2, 1);
        let mut rx3 = dispatcher.add_client(3, 8);
        for id in 1..=3 {
            registry.lock().unwrap().subscribe(id, "h1");
        }
        drop(rx1);

        let first = dispatcher.broadcast_data(&snapshot("h1", 1));
        assert_eq!(first, BroadcastReport { delivered: 2, failed: 1 });

        // Connection 2's single-slot queue is still full.
        let second = dispatcher.broadcast_data(&snapshot("h1", 2));
        assert_eq!(second, BroadcastReport { delivered: 1, failed: 2 });

        assert!(rx2.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
        assert_eq!(rx3.try_recv().map(|m| m.host_id().map(str::to_string)).unwrap(), Some("h1".into()));
        assert!(rx3.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_send_to_unknown_or_removed_connection() {
        let (_registry, dispatcher) = setup();
        let message = Arc::new(ServerMessage::Subscribed { host_id: "h1".into() });
        assert_eq!(dispatcher.send_to(7, Arc::clone(&message)), Err(DeliveryError::UnknownConnection(7)));

        let _rx = dispatcher.add_client(7, 4);
        assert_eq!(dispatcher.send_to(7, Arc::clone(&message)), Ok(()));
        dispatcher.remove_client(7);
        assert_eq!(dispatcher.client_count(), 0);
        assert_eq!(dispatcher.send_to(7, message), Err(DeliveryError::UnknownConnection(7)));
    }

    #[test]
    fn test_broadcast_without_subscribers_is_a_no_op() {
        let (_registry, dispatcher) = setup();
        assert_eq!(dispatcher.broadcast_data(&snapshot("h1", 1)), BroadcastReport::default());
    }
}
