//! Fan-out of wire frames to a document's other connections.
//!
//! Each session owns one tokio broadcast channel; every connection holds a
//! receiver. Published frames carry the origin connection id so receivers
//! can skip their own traffic (frames themselves carry no sender). Delivery
//! is best-effort: a lagged or closed receiver affects only that recipient.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// A frame in flight: (origin connection, encoded bytes).
pub type Envelope = (Uuid, Arc<Vec<u8>>);

/// Snapshot of fanout counters.
#[derive(Debug, Clone, Default)]
pub struct FanoutStats {
    pub frames_published: u64,
    pub subscribers: usize,
}

/// Per-session broadcast group.
///
/// Counters are atomics so `publish` never takes a lock on the hot path.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    capacity: usize,
    frames_published: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` bounds how many frames a slow receiver may buffer before
    /// it starts lagging (and dropping).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            frames_published: AtomicU64::new(0),
        }
    }

    /// Subscribe a connection; returns its private receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    /// Publish a frame to every subscriber (including the origin's receiver;
    /// origin filtering is the receiver's job). Returns the receiver count.
    pub fn publish(&self, origin: Uuid, frame: Arc<Vec<u8>>) -> usize {
        let delivered = self.sender.send((origin, frame)).unwrap_or(0);
        self.frames_published.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    /// Number of live receivers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            frames_published: self.frames_published.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let group = BroadcastGroup::new(16);
        let mut rx1 = group.subscribe();
        let mut rx2 = group.subscribe();
        let mut rx3 = group.subscribe();

        let origin = Uuid::new_v4();
        let frame = Arc::new(vec![1, 2, 3]);
        let delivered = group.publish(origin, frame.clone());
        assert_eq!(delivered, 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let (from, bytes) = rx.recv().await.unwrap();
            assert_eq!(from, origin);
            assert_eq!(*bytes, vec![1, 2, 3]);
        }
    }

    #[tokio::test]
    async fn test_origin_tag_lets_receiver_skip_own_frames() {
        let group = BroadcastGroup::new(16);
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut rx = group.subscribe();

        group.publish(me, Arc::new(vec![0]));
        group.publish(other, Arc::new(vec![1]));

        let mut seen = Vec::new();
        while let Ok((from, bytes)) = rx.try_recv() {
            if from != me {
                seen.push(bytes);
            }
        }
        assert_eq!(seen.len(), 1);
        assert_eq!(*seen[0], vec![1]);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_harmless() {
        let group = BroadcastGroup::new(16);
        assert_eq!(group.publish(Uuid::new_v4(), Arc::new(vec![9])), 0);
        assert_eq!(group.stats().frames_published, 1);
    }

    #[tokio::test]
    async fn test_dropped_receiver_does_not_block_others() {
        let group = BroadcastGroup::new(16);
        let rx_dead = group.subscribe();
        let mut rx_live = group.subscribe();
        drop(rx_dead);

        group.publish(Uuid::new_v4(), Arc::new(vec![7]));
        let (_, bytes) = rx_live.recv().await.unwrap();
        assert_eq!(*bytes, vec![7]);
        assert_eq!(group.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_lagged_receiver_is_isolated() {
        let group = BroadcastGroup::new(2);
        let mut rx_slow = group.subscribe();
        let mut rx_fast = group.subscribe();

        let origin = Uuid::new_v4();
        for i in 0..8u8 {
            group.publish(origin, Arc::new(vec![i]));
            // Fast receiver keeps up
            let (_, bytes) = rx_fast.recv().await.unwrap();
            assert_eq!(*bytes, vec![i]);
        }

        // Slow receiver lagged but the channel stays usable for it
        match rx_slow.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n > 0),
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[test]
    fn test_capacity_recorded() {
        let group = BroadcastGroup::new(64);
        assert_eq!(group.capacity(), 64);
    }
}
