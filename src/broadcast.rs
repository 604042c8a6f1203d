//! Fan-out to the members of a room with backpressure.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers; each
//! connection holds an independent receiver buffering up to `capacity`
//! frames. Frames carry their origin so connection tasks can drop a
//! client's own updates before they hit the socket.
//!
//! Membership itself lives in the room; the hub is pure transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::protocol::{ClientId, ProtocolError, SyncMessage};

/// A pre-encoded frame traveling to every member of a room.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Originating client; receivers matching it skip the frame.
    /// `None` for server-originated fan-out.
    pub origin: Option<ClientId>,
    pub bytes: Vec<u8>,
}

/// Shared frame handle; encoded once, delivered N-1 times.
pub type Frame = Arc<OutboundFrame>;

/// Snapshot of fan-out health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub receivers: usize,
}

/// Per-room broadcast hub.
pub struct BroadcastHub {
    sender: broadcast::Sender<Frame>,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl BroadcastHub {
    /// `capacity` bounds how many frames a lagging receiver may buffer
    /// before it starts dropping (backpressure).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity, messages_sent: AtomicU64::new(0) }
    }

    /// Subscribe a connection. Frames sent after this call are delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.sender.subscribe()
    }

    /// Fan a message out to all subscribers. Returns the receiver count.
    pub fn send(
        &self,
        origin: Option<ClientId>,
        msg: &SyncMessage,
    ) -> Result<usize, ProtocolError> {
        let bytes = msg.encode()?;
        Ok(self.send_bytes(origin, bytes))
    }

    /// Fan pre-encoded bytes out (zero re-serialization fast path).
    pub fn send_bytes(&self, origin: Option<ClientId>, bytes: Vec<u8>) -> usize {
        let frame = Arc::new(OutboundFrame { origin, bytes });
        let delivered = self.sender.send(frame).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            receivers: self.sender.receiver_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_reaches_all_receivers() {
        let hub = BroadcastHub::new(16);
        let mut rx1 = hub.subscribe();
        let mut rx2 = hub.subscribe();

        let msg = SyncMessage::update("1-2-3".into(), 42, 1, vec![1, 2, 3]);
        let delivered = hub.send(Some("1-2-3".into()), &msg).unwrap();
        assert_eq!(delivered, 2);

        let f1 = rx1.recv().await.unwrap();
        let f2 = rx2.recv().await.unwrap();
        assert_eq!(f1.origin.as_deref(), Some("1-2-3"));
        assert_eq!(f1.bytes, f2.bytes);

        let decoded = SyncMessage::decode(&f1.bytes).unwrap();
        assert_eq!(decoded.payload, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_send_without_receivers_is_harmless() {
        let hub = BroadcastHub::new(8);
        assert_eq!(hub.send_bytes(None, vec![9]), 0);
        assert_eq!(hub.stats().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_receiver_count_tracks_subscriptions() {
        let hub = BroadcastHub::new(8);
        assert_eq!(hub.receiver_count(), 0);
        let rx = hub.subscribe();
        assert_eq!(hub.receiver_count(), 1);
        drop(rx);
        assert_eq!(hub.receiver_count(), 0);
    }

    #[tokio::test]
    async fn test_server_originated_frames_have_no_origin() {
        let hub = BroadcastHub::new(8);
        let mut rx = hub.subscribe();
        hub.send_bytes(None, vec![7, 7]);
        let frame = rx.recv().await.unwrap();
        assert!(frame.origin.is_none());
    }
}
