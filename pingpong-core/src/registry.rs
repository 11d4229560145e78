//! The shared registry of live connections.
//!
//! Every accepted socket is registered here before its handler starts and removed
//! when the handler exits. The registry is the only state shared between connection
//! handlers; it is used to fan out broadcasts.
//!
//! # Design
//!
//! - One mutex guards an ordered map from [`ConnectionId`] to [`ConnectionHandle`].
//!   It is held only for the duration of `register`, `unregister`, `snapshot` and
//!   lookups, never across I/O.
//! - Ids come from a monotonically increasing counter and are never reused, so an id
//!   held by a stale handle can never address a newer connection.
//! - A handle does not own the socket. It owns the sending half of the
//!   connection's bounded outbound queue; the handler's writer drains the queue onto
//!   the socket. Sending never waits: a connection that has gone away, or whose
//!   queue is full because its peer stopped reading, fails locally and harmlessly.
//!
//! # Examples
//!
//! ```
//! use pingpong_core::registry::ConnectionRegistry;
//! use bytes::Bytes;
//! use tokio::sync::mpsc;
//!
//! let registry = ConnectionRegistry::new();
//! let (tx, mut rx) = mpsc::channel(8);
//! let id = registry.register("127.0.0.1:5000".parse().unwrap(), tx);
//!
//! let report = registry.broadcast(Bytes::from_static(b"\x81\x02hi"));
//! assert_eq!(report.delivered, 1);
//! assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"\x81\x02hi"));
//!
//! registry.unregister(id);
//! registry.unregister(id); // no-op
//! assert!(registry.is_empty());
//! ```

use crate::error::{Error, Result};
use tokio::sync::mpsc::error::TrySendError;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Stable identity of a connection, issued by [`ConnectionRegistry::register`].
pub type ConnectionId = u64;

/// Descriptive information about a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Registry id.
    pub id: ConnectionId,
    /// Remote address of the peer.
    pub addr: SocketAddr,
    /// Unix timestamp (seconds) at which the connection was accepted.
    pub connected_at: u64,
}

/// A cheap, cloneable reference to a registered connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    info: ConnectionInfo,
    sender: mpsc::Sender<Bytes>,
}

impl ConnectionHandle {
    /// The connection's registry id.
    pub fn id(&self) -> ConnectionId {
        self.info.id
    }

    /// Descriptive information about the connection.
    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Queues already-encoded frame bytes for delivery to this connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionNotFound`] if the connection's writer has shut down
    /// and [`Error::QueueFull`] if its outbound queue has no room left.
    pub fn send(&self, frame: Bytes) -> Result<()> {
        self.sender.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => Error::QueueFull(self.info.id),
            TrySendError::Closed(_) => Error::ConnectionNotFound(self.info.id),
        })
    }

    /// Returns `true` once the connection's writer has shut down.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Outcome of a [`ConnectionRegistry::broadcast`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections the frame was queued for.
    pub delivered: usize,
    /// Connections that had gone away between the snapshot and the send, or whose
    /// queue was full.
    pub failed: usize,
}

/// Mutex-guarded, ordered collection of live connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: Mutex<BTreeMap<ConnectionId, ConnectionHandle>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            connections: Mutex::new(BTreeMap::new()),
        }
    }

    /// Allocates a fresh id and inserts a connection under it.
    pub fn register(&self, addr: SocketAddr, sender: mpsc::Sender<Bytes>) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connected_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();

        let handle = ConnectionHandle {
            info: ConnectionInfo {
                id,
                addr,
                connected_at,
            },
            sender,
        };

        let count = {
            let mut connections = self.connections.lock();
            connections.insert(id, handle);
            connections.len()
        };
        info!("Added connection: {} from {} (Total: {})", id, addr, count);
        id
    }

    /// Removes a connection. Removing an id that is not present is a no-op.
    pub fn unregister(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        let (removed, count) = {
            let mut connections = self.connections.lock();
            let removed = connections.remove(&id);
            (removed, connections.len())
        };
        if removed.is_some() {
            info!("Removed connection: {} (Total: {})", id, count);
        }
        removed
    }

    /// A point-in-time copy of every registered connection, in id order.
    ///
    /// The lock is released before this returns; the copy can be iterated while
    /// other connections come and go.
    pub fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.connections.lock().values().cloned().collect()
    }

    /// Looks up a connection by id.
    pub fn get(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.connections.lock().get(&id).cloned()
    }

    /// Returns `true` if `id` is registered.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.lock().contains_key(&id)
    }

    /// Registered ids, in order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.lock().keys().copied().collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    /// Returns `true` if no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Queues a frame for one connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionNotFound`] if `id` is not registered or its
    /// writer has shut down.
    pub fn send_to(&self, id: ConnectionId, frame: Bytes) -> Result<()> {
        self.get(id)
            .ok_or(Error::ConnectionNotFound(id))?
            .send(frame)
    }

    /// Queues the same frame bytes for every connection in a fresh snapshot.
    ///
    /// Sends happen after the lock is released. A failure for one recipient is
    /// counted and logged and does not affect the others.
    pub fn broadcast(&self, frame: Bytes) -> BroadcastReport {
        let recipients = self.snapshot();
        debug!("Broadcasting {} bytes to {} connections", frame.len(), recipients.len());

        let mut report = BroadcastReport::default();
        for handle in &recipients {
            match handle.send(frame.clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!("Failed to broadcast to {}: {}", handle.id(), e);
                }
            }
        }

        debug!(
            "Broadcast complete: {} delivered, {} failed",
            report.delivered, report.failed
        );
        report
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn test_register_issues_increasing_ids() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        let a = registry.register(addr(), tx.clone());
        let b = registry.register(addr(), tx);
        assert!(b > a);
        assert_eq!(registry.ids(), vec![a, b]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_ids_are_not_reused_after_unregister() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        let first = registry.register(addr(), tx.clone());
        registry.unregister(first);
        let second = registry.register(addr(), tx);
        assert_ne!(first, second);
        assert!(!registry.contains(first));
        assert!(registry.contains(second));
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        let id = registry.register(addr(), tx);
        assert!(registry.unregister(id).is_some());
        assert!(registry.unregister(id).is_none());
        assert!(registry.unregister(9999).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_is_detached_from_registry() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        let id = registry.register(addr(), tx);

        let snapshot = registry.snapshot();
        registry.unregister(id);

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), id);
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_broadcast_reaches_every_connection_once() {
        let registry = ConnectionRegistry::new();
        let mut receivers = Vec::new();
        for _ in 0..4 {
            let (tx, rx) = mpsc::channel(8);
            registry.register(addr(), tx);
            receivers.push(rx);
        }

        let report = registry.broadcast(Bytes::from_static(b"frame"));
        assert_eq!(report, BroadcastReport { delivered: 4, failed: 0 });

        for rx in &mut receivers {
            assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"frame"));
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn test_broadcast_failure_is_local_to_one_recipient() {
        let registry = ConnectionRegistry::new();
        let (gone_tx, gone_rx) = mpsc::channel(8);
        let (live_tx, mut live_rx) = mpsc::channel(8);
        let gone = registry.register(addr(), gone_tx);
        registry.register(addr(), live_tx);
        drop(gone_rx);

        assert!(registry.get(gone).unwrap().is_closed());
        let report = registry.broadcast(Bytes::from_static(b"x"));
        assert_eq!(report, BroadcastReport { delivered: 1, failed: 1 });
        assert_eq!(live_rx.try_recv().unwrap(), Bytes::from_static(b"x"));
    }

    #[test]
    fn test_full_queue_fails_only_that_recipient() {
        let registry = ConnectionRegistry::new();
        let (stalled_tx, mut stalled_rx) = mpsc::channel(2);
        let (live_tx, mut live_rx) = mpsc::channel(8);
        let stalled = registry.register(addr(), stalled_tx);
        registry.register(addr(), live_tx);

        for _ in 0..2 {
            let report = registry.broadcast(Bytes::from_static(b"m"));
            assert_eq!(report, BroadcastReport { delivered: 2, failed: 0 });
        }
        let report = registry.broadcast(Bytes::from_static(b"m"));
        assert_eq!(report, BroadcastReport { delivered: 1, failed: 1 });
        assert!(matches!(
            registry.send_to(stalled, Bytes::new()),
            Err(Error::QueueFull(id)) if id == stalled
        ));

        // the stalled queue holds what fit; the live one got everything
        let mut stalled_count = 0;
        while stalled_rx.try_recv().is_ok() {
            stalled_count += 1;
        }
        assert_eq!(stalled_count, 2);
        let mut live_count = 0;
        while live_rx.try_recv().is_ok() {
            live_count += 1;
        }
        assert_eq!(live_count, 3);
        assert!(registry.contains(stalled));
    }

    #[test]
    fn test_send_to() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(8);
        let id = registry.register(addr(), tx);

        registry.send_to(id, Bytes::from_static(b"direct")).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"direct"));

        assert!(matches!(
            registry.send_to(id + 100, Bytes::new()),
            Err(Error::ConnectionNotFound(_))
        ));
    }

    #[test]
    fn test_connection_info_serializes() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(8);
        let id = registry.register(addr(), tx);
        let info = registry.get(id).unwrap().info().clone();
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["id"], id);
        assert_eq!(json["addr"], "127.0.0.1:4000");
    }

    #[test]
    fn test_concurrent_register_unregister() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut workers = Vec::new();

        for _ in 0..8 {
            let registry = registry.clone();
            workers.push(std::thread::spawn(move || {
                let (tx, _rx) = mpsc::channel(8);
                let mut issued = Vec::new();
                for round in 0..200 {
                    let id = registry.register(addr(), tx.clone());
                    issued.push(id);
                    if round % 2 == 0 {
                        registry.unregister(id);
                    }
                    let snapshot = registry.snapshot();
                    let unique: HashSet<_> = snapshot.iter().map(|h| h.id()).collect();
                    assert_eq!(unique.len(), snapshot.len());
                }
                issued
            }));
        }

        let mut all = HashSet::new();
        for worker in workers {
            for id in worker.join().unwrap() {
                assert!(all.insert(id), "id {id} issued twice");
            }
        }
        assert_eq!(all.len(), 8 * 200);
        assert_eq!(registry.len(), 8 * 100);
    }
}
