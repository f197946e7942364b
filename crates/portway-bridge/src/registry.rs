//! Connection registry: the port → socket index.
//!
//! Work completing on a worker task is delivered to the exact socket the
//! acceptor registered for that client port. Reads vastly outnumber writes,
//! so the registry lives in a sharded map: lookups, sends, and touches
//! proceed concurrently while registrations, removals, and sweeps serialise
//! per shard.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::BridgeError;

/// Type-erased write half of a client connection.
///
/// Boxed so tests can register in-memory streams; the acceptor registers the
/// write half of each accepted TCP socket. Dropping the handle shuts the
/// write side down.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Which liveness counter a touch updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchKind {
    /// A frame was written to the client.
    Sent,
    /// A frame was received from the client.
    Received,
}

/// Observable connection state.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// Remote address of the session.
    pub remote_addr: String,
    /// When the session was registered.
    pub connected_at: Instant,
    /// Last inbound or outbound activity.
    pub last_active: Instant,
    /// Frames written to the client.
    pub sent_count: u64,
    /// Frames received from the client.
    pub received_count: u64,
}

struct ConnectionEntry {
    writer: Arc<Mutex<BoxedWriter>>,
    remote_addr: String,
    connected_at: Instant,
    last_active: Instant,
    sent_count: u64,
    received_count: u64,
}

/// Registry of live client connections keyed by ephemeral source port.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<u16, ConnectionEntry>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Registers a connection. Fails on a duplicate port without touching
    /// the existing entry.
    pub fn register(
        &self,
        port: u16,
        writer: BoxedWriter,
        remote_addr: String,
    ) -> Result<(), BridgeError> {
        match self.connections.entry(port) {
            Entry::Occupied(_) => Err(BridgeError::DuplicatePort(port)),
            Entry::Vacant(slot) => {
                let now = Instant::now();
                slot.insert(ConnectionEntry {
                    writer: Arc::new(Mutex::new(writer)),
                    remote_addr: remote_addr.clone(),
                    connected_at: now,
                    last_active: now,
                    sent_count: 0,
                    received_count: 0,
                });
                info!(port, remote_addr = %remote_addr, "connection registered");
                Ok(())
            }
        }
    }

    /// Removes a connection. Idempotent; dropping the write half shuts the
    /// socket down.
    pub fn unregister(&self, port: u16) {
        if self.connections.remove(&port).is_some() {
            info!(port, "connection unregistered");
        }
    }

    /// Non-mutating lookup of a connection's stats.
    #[must_use]
    pub fn lookup(&self, port: u16) -> Option<ConnectionStats> {
        self.connections.get(&port).map(|entry| ConnectionStats {
            remote_addr: entry.remote_addr.clone(),
            connected_at: entry.connected_at,
            last_active: entry.last_active,
            sent_count: entry.sent_count,
            received_count: entry.received_count,
        })
    }

    /// Writes pre-framed bytes to the client on `port`.
    ///
    /// On a write failure the entry is evicted before returning, so a
    /// subsequent [`lookup`](Self::lookup) reports the port as missing and no
    /// later send can obtain the dead handle from the registry.
    pub async fn send(&self, port: u16, bytes: &[u8]) -> Result<(), BridgeError> {
        // Clone the writer handle and update stats without holding the shard
        // lock across the await below. Outbound writes do not refresh
        // last_active: liveness is driven by inbound traffic, otherwise the
        // server's own ping probes would keep a dead-quiet session out of
        // the sweeper's reach forever.
        let writer = {
            let mut entry = self
                .connections
                .get_mut(&port)
                .ok_or(BridgeError::RouteMissing(port))?;
            entry.sent_count += 1;
            Arc::clone(&entry.writer)
        };

        let mut guard = writer.lock().await;
        let result = async {
            guard.write_all(bytes).await?;
            guard.flush().await
        }
        .await;
        drop(guard);

        match result {
            Ok(()) => {
                debug!(port, bytes = bytes.len(), "frame sent to client");
                Ok(())
            }
            Err(e) => {
                warn!(port, error = %e, "write failed, evicting connection");
                self.connections.remove(&port);
                Err(BridgeError::RouteWriteFailed {
                    port,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Updates liveness stats for a connection.
    pub fn touch(&self, port: u16, kind: TouchKind) {
        if let Some(mut entry) = self.connections.get_mut(&port) {
            match kind {
                TouchKind::Sent => entry.sent_count += 1,
                TouchKind::Received => entry.received_count += 1,
            }
            entry.last_active = Instant::now();
        }
    }

    /// Evicts every connection idle longer than `max_idle`. Returns the
    /// evicted ports.
    pub fn sweep(&self, max_idle: Duration) -> Vec<u16> {
        let now = Instant::now();
        let mut evicted = Vec::new();

        self.connections.retain(|port, entry| {
            let idle = now.duration_since(entry.last_active);
            if idle > max_idle {
                info!(port, idle_secs = idle.as_secs(), "stale connection removed");
                evicted.push(*port);
                false
            } else {
                true
            }
        });

        evicted
    }

    /// Number of live connections.
    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Ports of all live connections.
    #[must_use]
    pub fn ports(&self) -> Vec<u16> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// Drops every connection. Used at shutdown after the workers drain.
    pub fn close_all(&self) {
        let count = self.connections.len();
        self.connections.clear();
        if count > 0 {
            info!(count, "closed all connections");
        }
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connections.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portway_proto::{encode_frame, FrameType};
    use tokio::io::AsyncReadExt;

    fn boxed(stream: tokio::io::DuplexStream) -> BoxedWriter {
        Box::new(stream)
    }

    #[tokio::test]
    async fn register_is_unique_per_port() {
        let registry = ConnectionRegistry::new();
        let (a, _keep_a) = tokio::io::duplex(64);
        let (b, _keep_b) = tokio::io::duplex(64);

        registry.register(5000, boxed(a), "10.0.0.1:5000".into()).unwrap();
        let result = registry.register(5000, boxed(b), "10.0.0.2:5000".into());

        assert!(matches!(result, Err(BridgeError::DuplicatePort(5000))));
        // The original entry is untouched.
        let stats = registry.lookup(5000).unwrap();
        assert_eq!(stats.remote_addr, "10.0.0.1:5000");
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (a, _keep) = tokio::io::duplex(64);

        registry.register(5001, boxed(a), "10.0.0.1:5001".into()).unwrap();
        registry.unregister(5001);
        registry.unregister(5001);

        assert!(registry.lookup(5001).is_none());
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn send_reaches_the_right_socket() {
        let registry = ConnectionRegistry::new();
        let (writer, mut reader) = tokio::io::duplex(1024);

        registry.register(5002, boxed(writer), "10.0.0.1:5002".into()).unwrap();

        let bytes = encode_frame(FrameType::Response, b"hello").unwrap();
        registry.send(5002, &bytes).await.unwrap();

        let mut received = vec![0u8; bytes.len()];
        reader.read_exact(&mut received).await.unwrap();
        assert_eq!(received, bytes);

        let stats = registry.lookup(5002).unwrap();
        assert_eq!(stats.sent_count, 1);
    }

    #[tokio::test]
    async fn send_to_unknown_port_is_missing() {
        let registry = ConnectionRegistry::new();
        let result = registry.send(6000, b"data").await;
        assert!(matches!(result, Err(BridgeError::RouteMissing(6000))));
    }

    #[tokio::test]
    async fn write_failure_evicts_the_entry() {
        let registry = ConnectionRegistry::new();
        let (writer, reader) = tokio::io::duplex(64);

        registry.register(5003, boxed(writer), "10.0.0.1:5003".into()).unwrap();
        drop(reader);

        let result = registry.send(5003, b"doomed").await;
        assert!(matches!(
            result,
            Err(BridgeError::RouteWriteFailed { port: 5003, .. })
        ));

        // Immediately after the failed send the port is gone.
        assert!(registry.lookup(5003).is_none());
        let result = registry.send(5003, b"again").await;
        assert!(matches!(result, Err(BridgeError::RouteMissing(5003))));
    }

    #[tokio::test]
    async fn touch_updates_counters() {
        let registry = ConnectionRegistry::new();
        let (writer, _keep) = tokio::io::duplex(64);

        registry.register(5004, boxed(writer), "10.0.0.1:5004".into()).unwrap();
        registry.touch(5004, TouchKind::Received);
        registry.touch(5004, TouchKind::Received);
        registry.touch(5004, TouchKind::Sent);

        let stats = registry.lookup(5004).unwrap();
        assert_eq!(stats.received_count, 2);
        assert_eq!(stats.sent_count, 1);
    }

    #[tokio::test]
    async fn sweep_evicts_only_idle_connections() {
        let registry = ConnectionRegistry::new();
        let (a, _keep_a) = tokio::io::duplex(64);
        let (b, _keep_b) = tokio::io::duplex(64);

        registry.register(5005, boxed(a), "10.0.0.1:5005".into()).unwrap();
        registry.register(5006, boxed(b), "10.0.0.1:5006".into()).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.touch(5006, TouchKind::Received);

        let evicted = registry.sweep(Duration::from_millis(20));
        assert_eq!(evicted, vec![5005]);
        assert!(registry.lookup(5005).is_none());
        assert!(registry.lookup(5006).is_some());
    }

    #[tokio::test]
    async fn close_all_empties_the_registry() {
        let registry = ConnectionRegistry::new();
        for port in 7000..7010u16 {
            let (w, _r) = tokio::io::duplex(64);
            registry.register(port, boxed(w), format!("10.0.0.1:{port}")).unwrap();
        }
        assert_eq!(registry.count(), 10);

        registry.close_all();
        assert_eq!(registry.count(), 0);
        assert!(registry.ports().is_empty());
    }
}
