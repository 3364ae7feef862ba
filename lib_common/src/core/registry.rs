//! # Subscription Registry
//!
//! The authoritative record of which connection watches which host. Both
//! directions are indexed so that fan-out (host -> connections) and
//! connection teardown (connection -> hosts) are lookups rather than scans.
//!
//! The two maps are updated together inside one critical section by the
//! owner of the surrounding lock, so they always mirror each other: `c` is in
//! `by_host[h]` exactly when `h` is in `by_connection[c]`. Empty sets are
//! removed eagerly.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::core::model::ConnectionId;

/// # Registry
///
/// Subscription edges between connections and hosts. Not internally
/// synchronized; share it as [`Shared<Registry>`](crate::core::Shared).
#[derive(Debug, Default)]
pub struct Registry {
    by_connection: HashMap<ConnectionId, HashSet<String>>,
    by_host: HashMap<String, HashSet<ConnectionId>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the edge `conn -> host_id`. Idempotent.
    ///
    /// Returns the host's subscriber count afterwards.
    pub fn subscribe(&mut self, conn: ConnectionId, host_id: &str) -> usize {
        self.by_connection
            .entry(conn)
            .or_default()
            .insert(host_id.to_string());
        let subscribers = self.by_host.entry(host_id.to_string()).or_default();
        subscribers.insert(conn);
        subscribers.len()
    }

    /// Removes the edge `conn -> host_id`. Idempotent.
    ///
    /// Returns the host's subscriber count afterwards.
    pub fn unsubscribe(&mut self, conn: ConnectionId, host_id: &str) -> usize {
        if let Some(hosts) = self.by_connection.get_mut(&conn) {
            hosts.remove(host_id);
            if hosts.is_empty() {
                self.by_connection.remove(&conn);
            }
        }
        self.detach(host_id, conn)
    }

    /// Removes every edge of `conn`.
    ///
    /// Returns the hosts whose subscriber count dropped to zero.
    pub fn remove_connection(&mut self, conn: ConnectionId) -> BTreeSet<String> {
        let hosts = self.by_connection.remove(&conn).unwrap_or_default();
        hosts
            .into_iter()
            .filter(|host_id| self.detach(host_id, conn) == 0)
            .collect()
    }

    /// Removes every edge of `host_id`.
    ///
    /// Returns the connections that were subscribed to it.
    pub fn remove_host(&mut self, host_id: &str) -> BTreeSet<ConnectionId> {
        let conns = self.by_host.remove(host_id).unwrap_or_default();
        for conn in &conns {
            if let Some(hosts) = self.by_connection.get_mut(conn) {
                hosts.remove(host_id);
                if hosts.is_empty() {
                    self.by_connection.remove(conn);
                }
            }
        }
        conns.into_iter().collect()
    }

    /// Connections currently subscribed to `host_id`.
    pub fn subscribers_of(&self, host_id: &str) -> BTreeSet<ConnectionId> {
        self.by_host
            .get(host_id)
            .map(|conns| conns.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of connections subscribed to `host_id`.
    pub fn subscriber_count(&self, host_id: &str) -> usize {
        self.by_host.get(host_id).map_or(0, HashSet::len)
    }

    /// Hosts `conn` is subscribed to.
    pub fn hosts_of(&self, conn: ConnectionId) -> BTreeSet<String> {
        self.by_connection
            .get(&conn)
            .map(|hosts| hosts.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn detach(&mut self, host_id: &str, conn: ConnectionId) -> usize {
        match self.by_host.get_mut(host_id) {
            Some(conns) => {
                conns.remove(&conn);
                let remaining = conns.len();
                if remaining == 0 {
                    self.by_host.remove(host_id);
                }
                remaining
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Both indexes describe the same edge set.
    fn assert_mirrored(registry: &Registry) {
        for (conn, hosts) in &registry.by_connection {
            assert!(!hosts.is_empty());
            for host in hosts {
                assert!(registry.by_host[host].contains(conn));
            }
        }
        for (host, conns) in &registry.by_host {
            assert!(!conns.is_empty());
            for conn in conns {
                assert!(registry.by_connection[conn].contains(host));
            }
        }
    }

    #[test]
    fn test_subscribe_and_unsubscribe_counts() {
        let mut registry = Registry::new();
        assert_eq!(registry.subscribe(1, "h1"), 1);
        assert_eq!(registry.subscribe(1, "h1"), 1);
        assert_eq!(registry.subscribe(2, "h1"), 2);
        assert_eq!(registry.subscribe(2, "h2"), 1);
        assert_mirrored(&registry);

        assert_eq!(registry.unsubscribe(1, "h1"), 1);
        assert_eq!(registry.unsubscribe(1, "h1"), 1);
        assert_eq!(registry.unsubscribe(9, "nope"), 0);
        assert_eq!(registry.subscribers_of("h1"), BTreeSet::from([2]));
        assert!(registry.hosts_of(1).is_empty());
        assert_mirrored(&registry);
    }

    #[test]
    fn test_remove_connection_reports_orphaned_hosts() {
        let mut registry = Registry::new();
        registry.subscribe(1, "h1");
        registry.subscribe(1, "h2");
        registry.subscribe(2, "h2");

        let orphaned = registry.remove_connection(1);
        assert_eq!(orphaned, BTreeSet::from(["h1".to_string()]));
        assert_eq!(registry.subscriber_count("h1"), 0);
        assert_eq!(registry.subscriber_count("h2"), 1);
        assert!(registry.remove_connection(1).is_empty());
        assert_mirrored(&registry);
    }

    #[test]
    fn test_remove_host_reports_affected_connections() {
        let mut registry = Registry::new();
        registry.subscribe(1, "h1");
        registry.subscribe(2, "h1");
        registry.subscribe(2, "h2");

        assert_eq!(registry.remove_host("h1"), BTreeSet::from([1, 2]));
        assert!(registry.hosts_of(1).is_empty());
        assert_eq!(registry.hosts_of(2), BTreeSet::from(["h2".to_string()]));
        assert_mirrored(&registry);
    }
}
