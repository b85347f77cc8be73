//! Registry of open framed RPC connections.
//!
//! Each connection owns a bounded channel of encoded response frames that
//! its write loop drains, so a slow peer applies backpressure to its own
//! requests only. The registry is a `DashMap`, letting request tasks look
//! up and remove connections without a global lock.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::network::config::ConnectionConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Item consumed by a connection's write loop.
#[derive(Debug)]
pub enum OutboundFrame {
    /// An encoded response frame.
    Frame(Bytes),
    /// Flush and close the connection.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("send timed out")]
    Timeout,
    #[error("connection closed")]
    Disconnected,
}

#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub connected_at: Instant,
    tx: mpsc::Sender<OutboundFrame>,
    /// Cancelled when the peer goes away; request contexts derive from it.
    cancel: CancellationToken,
    requests: AtomicU64,
}

impl ConnectionHandle {
    /// Queues a frame, waiting at most `timeout` for channel capacity.
    ///
    /// # Errors
    ///
    /// [`SendError::Timeout`] if the channel stayed full,
    /// [`SendError::Disconnected`] if the write loop has exited.
    pub async fn send_timeout(&self, frame: OutboundFrame, timeout: Duration) -> Result<(), SendError> {
        match tokio::time::timeout(timeout, self.tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Disconnected),
            Err(_) => Err(SendError::Timeout),
        }
    }

    #[must_use]
    pub fn try_send(&self, frame: OutboundFrame) -> bool {
        self.tx.try_send(frame).is_ok()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed() && !self.cancel.is_cancelled()
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Marks the connection gone; in-flight request contexts are cancelled.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a connection and returns its handle plus the receiver the
    /// write loop drains.
    pub fn register(
        &self,
        peer: SocketAddr,
        config: &ConnectionConfig,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundFrame>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity);
        let handle = Arc::new(ConnectionHandle {
            id,
            peer,
            connected_at: Instant::now(),
            tx,
            cancel: CancellationToken::new(),
            requests: AtomicU64::new(0),
        });
        self.connections.insert(id, Arc::clone(&handle));
        (handle, rx)
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.remove(&id).map(|(_, handle)| handle)
    }

    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&id).map(|r| Arc::clone(r.value()))
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Removes and returns every connection.
    pub fn drain_all(&self) -> Vec<Arc<ConnectionHandle>> {
        let keys: Vec<ConnectionId> = self.connections.iter().map(|e| *e.key()).collect();
        keys.into_iter()
            .filter_map(|k| self.connections.remove(&k).map(|(_, h)| h))
            .collect()
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

    fn peer() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn register_get_remove() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = registry.register(peer(), &ConnectionConfig::default());
        let (b, _rx_b) = registry.register(peer(), &ConnectionConfig::default());
        assert_eq!(a.id, ConnectionId(1));
        assert_eq!(b.id, ConnectionId(2));
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.get(a.id).unwrap().peer, peer());

        assert!(registry.remove(a.id).is_some());
        assert!(registry.remove(a.id).is_none());
        assert_eq!(registry.connections().len(), 1);
    }

    #[test]
    fn drain_all_empties_the_registry() {
        let registry = ConnectionRegistry::new();
        let _a = registry.register(peer(), &ConnectionConfig::default());
        let _b = registry.register(peer(), &ConnectionConfig::default());
        assert_eq!(registry.drain_all().len(), 2);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn full_channel_rejects_try_send() {
        let registry = ConnectionRegistry::new();
        let config = ConnectionConfig {
            outbound_channel_capacity: 1,
            ..ConnectionConfig::default()
        };
        let (handle, _rx) = registry.register(peer(), &config);
        assert!(handle.try_send(OutboundFrame::Frame(Bytes::from_static(b"a"))));
        assert!(!handle.try_send(OutboundFrame::Frame(Bytes::from_static(b"b"))));
    }

    #[tokio::test]
    async fn send_after_close_is_disconnected() {
        let registry = ConnectionRegistry::new();
        let (handle, rx) = registry.register(peer(), &ConnectionConfig::default());
        drop(rx);
        let err = handle
            .send_timeout(OutboundFrame::Close, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err, SendError::Disconnected);
        assert!(!handle.is_connected());
    }

    #[test]
    fn disconnect_cancels_token() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = registry.register(peer(), &ConnectionConfig::default());
        let child = handle.cancellation().child_token();
        handle.disconnect();
        assert!(child.is_cancelled());
        assert!(!handle.is_connected());
    }
}
