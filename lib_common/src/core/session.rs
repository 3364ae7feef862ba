//! # Connection Session
//!
//! One `Session` per downstream connection. It parses client frames, turns
//! them into registry and scheduler operations, and answers on the
//! connection's own outbound queue.
//!
//! ## Lifecycle
//!
//! `CONNECTED` on open (the host list is queued immediately), `SUBSCRIBED`
//! while it holds at least one subscription, `CLOSED` after [`Session::close`]
//! or drop. Closing removes every subscription edge in one step and lets the
//! scheduler idle any host that lost its last watcher.
//!
//! ## Subscribe Ordering
//!
//! A subscribe is answered with `subscribed` then `connecting`. When a
//! snapshot of the host is already cached, `connected` and `data` follow at
//! once instead of waiting for the next poll. These frames are queued while
//! the subscription edge is created, so they always precede the first
//! broadcast the connection receives for that host.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::core::dispatcher::Outbound;
use crate::core::hub::NodeHub;
use crate::core::lock;
use crate::core::model::{ClientMessage, ConnectionId, ErrorCode, ServerMessage};

/// Protocol state of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Open, no subscriptions.
    Connected,
    /// Open, subscribed to these hosts.
    Subscribed(BTreeSet<String>),
    /// Closed; further frames are ignored.
    Closed,
}

/// # Session
///
/// The protocol handler for one connection.
pub struct Session {
    id: ConnectionId,
    hub: NodeHub,
    closed: bool,
}

impl Session {
    /// Opens a session: creates the outbound queue and queues the host list.
    pub(crate) fn open(id: ConnectionId, hub: NodeHub) -> (Self, mpsc::Receiver<Outbound>) {
        let rx = hub
            .dispatcher()
            .add_client(id, hub.scheduler().config().outbound_queue_capacity);
        let session = Self { id, hub, closed: false };
        session.send(ServerMessage::Hosts {
            hosts: session.hub.scheduler().host_summaries(),
        });
        (session, rx)
    }

    /// The connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The current protocol state.
    pub fn state(&self) -> SessionState {
        if self.closed {
            return SessionState::Closed;
        }
        let hosts = lock(self.hub.registry()).hosts_of(self.id);
        if hosts.is_empty() {
            SessionState::Connected
        } else {
            SessionState::Subscribed(hosts)
        }
    }

    /// Handles one text frame.
    pub fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.handle(message),
            Err(err) => {
                log::debug!("Connection {} sent an invalid frame: {}", self.id, err);
                self.reject(&format!("unrecognized message: {}", err));
            }
        }
    }

    /// Handles one parsed client message.
    pub fn handle(&mut self, message: ClientMessage) {
        if self.closed {
            log::debug!("Connection {} is closed; ignoring {:?}", self.id, message);
            return;
        }
        match message {
            ClientMessage::Subscribe { host_id } => self.subscribe(&host_id),
            ClientMessage::Unsubscribe { host_id } => self.unsubscribe(&host_id),
            ClientMessage::Ping { timestamp } => self.send(ServerMessage::Pong { timestamp }),
        }
    }

    /// Answers a frame that could not be understood with `INVALID_MESSAGE`.
    pub fn reject(&self, detail: &str) {
        self.send(ServerMessage::error(None, ErrorCode::InvalidMessage, detail));
    }

    fn subscribe(&mut self, host_id: &str) {
        let id = self.id;
        let dispatcher = Arc::clone(self.hub.dispatcher());
        let push = |message: ServerMessage| {
            if let Err(err) = dispatcher.send_to(id, Arc::new(message)) {
                log::warn!("Connection {}: {}", id, err);
            }
        };

        let attached = self.hub.scheduler().attach(id, host_id, |display_name, last_known| {
            push(ServerMessage::Subscribed { host_id: host_id.to_string() });
            push(ServerMessage::Connecting {
                host_id: host_id.to_string(),
                host_name: display_name.to_string(),
            });
            if let Some(snapshot) = last_known {
                push(ServerMessage::Connected {
                    host_id: host_id.to_string(),
                    host_name: display_name.to_string(),
                });
                push(ServerMessage::data(&snapshot));
            }
        });

        match attached {
            Ok(count) => log::info!("Connection {} subscribed to '{}' ({} subscriber(s))", id, host_id, count),
            Err(err) => {
                log::info!("Connection {} tried to subscribe to unknown host '{}'", id, host_id);
                push(ServerMessage::error(Some(host_id), ErrorCode::HostNotFound, err.to_string()));
            }
        }
    }

    fn unsubscribe(&mut self, host_id: &str) {
        let remaining = self.hub.scheduler().detach(self.id, host_id);
        log::info!("Connection {} unsubscribed from '{}' ({} remaining)", self.id, host_id, remaining);
        self.send(ServerMessage::Unsubscribed { host_id: host_id.to_string() });
    }

    fn send(&self, message: ServerMessage) {
        if let Err(err) = self.hub.dispatcher().send_to(self.id, Arc::new(message)) {
            log::warn!("Connection {}: {}", self.id, err);
        }
    }

    /// # Close
    ///
    /// Removes every subscription of this connection and its outbound queue.
    /// Idempotent; also runs on drop.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let orphaned = self.hub.scheduler().detach_all(self.id);
        self.hub.dispatcher().remove_client(self.id);
        log::info!("Connection {} closed ({} host(s) left without subscribers)", self.id, orphaned.len());
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
