//! Transport boundary: group fan-out with per-connection mailboxes.
//!
//! The engine only needs four primitives from whatever transport hosts it:
//! join a group, leave a group, broadcast to a group with one exclusion, and
//! send to a single connection. [`Transport`] captures that contract;
//! [`ChannelTransport`] is the in-process implementation used by tests and
//! by embedders that bridge to a real wire transport.
//!
//! Lagging connections drop messages rather than stalling the fan-out;
//! drops are counted via atomics so the hot path never takes a lock beyond
//! the short-held membership maps.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tokio::sync::mpsc;

use crate::protocol::ConnectionId;

/// The boundary the engine publishes through.
pub trait Transport: Send + Sync {
    fn join_group(&self, conn: ConnectionId, group: &str);
    fn leave_group(&self, conn: ConnectionId, group: &str);
    /// Deliver `payload` to every member of `group` except `exclude`.
    fn broadcast(&self, group: &str, exclude: Option<ConnectionId>, payload: Vec<u8>);
    fn send_to(&self, conn: ConnectionId, payload: Vec<u8>);
}

/// Fan-out statistics.
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_connections: usize,
    pub active_groups: usize,
}

/// In-process transport over bounded per-connection mailboxes.
pub struct ChannelTransport {
    groups: RwLock<HashMap<String, HashSet<ConnectionId>>>,
    mailboxes: RwLock<HashMap<ConnectionId, mpsc::Sender<Vec<u8>>>>,
    mailbox_capacity: usize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl ChannelTransport {
    /// `mailbox_capacity` bounds how many undelivered payloads a connection
    /// may buffer before further messages to it are dropped.
    pub fn new(mailbox_capacity: usize) -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            mailboxes: RwLock::new(HashMap::new()),
            mailbox_capacity,
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    /// Register a connection, returning its mailbox receiver.
    pub fn register_connection(&self, conn: ConnectionId) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(self.mailbox_capacity);
        self.mailboxes
            .write()
            .expect("mailbox lock poisoned")
            .insert(conn, tx);
        rx
    }

    /// Drop a connection and remove it from every group.
    pub fn unregister_connection(&self, conn: ConnectionId) {
        self.mailboxes
            .write()
            .expect("mailbox lock poisoned")
            .remove(&conn);
        let mut groups = self.groups.write().expect("group lock poisoned");
        groups.retain(|_, members| {
            members.remove(&conn);
            !members.is_empty()
        });
    }

    /// Current members of a group.
    pub fn group_members(&self, group: &str) -> Vec<ConnectionId> {
        self.groups
            .read()
            .expect("group lock poisoned")
            .get(group)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_connections: self.mailboxes.read().expect("mailbox lock poisoned").len(),
            active_groups: self.groups.read().expect("group lock poisoned").len(),
        }
    }

    fn deliver(&self, conn: ConnectionId, payload: Vec<u8>) {
        let mailboxes = self.mailboxes.read().expect("mailbox lock poisoned");
        match mailboxes.get(&conn) {
            Some(tx) => match tx.try_send(payload) {
                Ok(()) => {
                    self.messages_sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    // Mailbox full or receiver gone; the connection is
                    // lagging and must resync from document state.
                    self.messages_dropped.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Dropped payload for lagging connection {conn}");
                }
            },
            None => {
                self.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Dropped payload for unknown connection {conn}");
            }
        }
    }
}

impl Transport for ChannelTransport {
    fn join_group(&self, conn: ConnectionId, group: &str) {
        let mut groups = self.groups.write().expect("group lock poisoned");
        groups.entry(group.to_string()).or_default().insert(conn);
    }

    fn leave_group(&self, conn: ConnectionId, group: &str) {
        let mut groups = self.groups.write().expect("group lock poisoned");
        if let Some(members) = groups.get_mut(group) {
            members.remove(&conn);
            if members.is_empty() {
                groups.remove(group);
            }
        }
    }

    fn broadcast(&self, group: &str, exclude: Option<ConnectionId>, payload: Vec<u8>) {
        let members = self.group_members(group);
        for conn in members {
            if Some(conn) == exclude {
                continue;
            }
            self.deliver(conn, payload.clone());
        }
    }

    fn send_to(&self, conn: ConnectionId, payload: Vec<u8>) {
        self.deliver(conn, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_broadcast_excludes_sender() {
        let transport = ChannelTransport::new(16);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let mut rx_a = transport.register_connection(a);
        let mut rx_b = transport.register_connection(b);

        transport.join_group(a, "doc:test:b:f");
        transport.join_group(b, "doc:test:b:f");

        transport.broadcast("doc:test:b:f", Some(a), vec![1, 2, 3]);

        assert_eq!(rx_b.recv().await.unwrap(), vec![1, 2, 3]);
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_to_single_connection() {
        let transport = ChannelTransport::new(16);
        let a = Uuid::new_v4();
        let mut rx = transport.register_connection(a);

        transport.send_to(a, vec![9]);
        assert_eq!(rx.recv().await.unwrap(), vec![9]);
    }

    #[tokio::test]
    async fn test_leave_group_stops_delivery() {
        let transport = ChannelTransport::new(16);
        let a = Uuid::new_v4();
        let mut rx = transport.register_connection(a);

        transport.join_group(a, "g");
        transport.leave_group(a, "g");
        transport.broadcast("g", None, vec![1]);

        assert!(rx.try_recv().is_err());
        assert_eq!(transport.group_members("g").len(), 0);
    }

    #[tokio::test]
    async fn test_full_mailbox_drops_and_counts() {
        let transport = ChannelTransport::new(1);
        let a = Uuid::new_v4();
        let _rx = transport.register_connection(a);

        transport.send_to(a, vec![1]);
        transport.send_to(a, vec![2]); // mailbox full

        let stats = transport.stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_dropped, 1);
    }

    #[tokio::test]
    async fn test_unregister_removes_from_groups() {
        let transport = ChannelTransport::new(16);
        let a = Uuid::new_v4();
        let _rx = transport.register_connection(a);
        transport.join_group(a, "g1");
        transport.join_group(a, "g2");

        transport.unregister_connection(a);
        assert!(transport.group_members("g1").is_empty());
        assert_eq!(transport.stats().active_connections, 0);
        assert_eq!(transport.stats().active_groups, 0);
    }
}
