//! In-process fallback channel shared by transports on the same room.
//!
//! Every `(server_url, room)` pair gets one [`BroadcastGroup`]. Transports
//! in the same process (several views or tabs of one document) publish
//! sync and awareness frames into it and receive each other's frames even
//! while the relay is unreachable. Frames carry the sender's id so a
//! transport can skip its own.
//!
//! Uses tokio broadcast channels: one send reaches every subscriber, and a
//! lagging subscriber loses frames instead of slowing down the others.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::broadcast;
use uuid::Uuid;

const DEFAULT_CAPACITY: usize = 256;

/// One frame published on a group.
#[derive(Debug, Clone)]
pub struct LocalFrame {
    pub sender: Uuid,
    pub bytes: Arc<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub subscribers: usize,
}

/// Fan-out group for one room.
#[derive(Debug)]
pub struct BroadcastGroup {
    key: String,
    sender: broadcast::Sender<LocalFrame>,
    frames_sent: AtomicU64,
}

impl BroadcastGroup {
    fn new(key: String, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            key,
            sender,
            frames_sent: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LocalFrame> {
        self.sender.subscribe()
    }

    /// Publish `bytes` to every subscriber. Returns how many received it,
    /// the sender's own receiver included.
    pub fn publish(&self, sender: Uuid, bytes: Vec<u8>) -> usize {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.sender
            .send(LocalFrame {
                sender,
                bytes: Arc::new(bytes),
            })
            .unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

/// Maps room keys to broadcast groups. Cloning shares the map.
#[derive(Debug, Clone)]
pub struct LocalHub {
    groups: Arc<RwLock<HashMap<String, Arc<BroadcastGroup>>>>,
    capacity: usize,
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LocalHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            groups: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// The hub shared by every transport in this process that was not
    /// given one explicitly.
    pub fn process() -> LocalHub {
        static PROCESS_HUB: OnceLock<LocalHub> = OnceLock::new();
        PROCESS_HUB.get_or_init(LocalHub::default).clone()
    }

    pub fn key(server_url: &str, room: &str) -> String {
        format!("{}/{}", server_url.trim_end_matches('/'), room)
    }

    /// Get or create the group for `key`.
    pub fn group(&self, key: &str) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        if let Some(group) = self.groups.read().get(key) {
            return group.clone();
        }

        let mut groups = self.groups.write();
        groups
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(key.to_owned(), self.capacity)))
            .clone()
    }

    /// Forget groups nobody listens to any more. Returns how many went.
    pub fn prune(&self) -> usize {
        let mut groups = self.groups.write();
        let before = groups.len();
        groups.retain(|_, g| g.subscriber_count() > 0 || Arc::strong_count(g) > 1);
        before - groups.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_normalises_trailing_slash() {
        assert_eq!(LocalHub::key("ws://relay/", "doc-1"), "ws://relay/doc-1");
        assert_eq!(LocalHub::key("ws://relay", "doc-1"), "ws://relay/doc-1");
    }

    #[test]
    fn test_same_key_same_group() {
        let hub = LocalHub::new(16);
        let a = hub.group("ws://relay/doc");
        let b = hub.clone().group("ws://relay/doc");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(hub.group_count(), 1);

        hub.group("ws://relay/other");
        assert_eq!(hub.group_count(), 2);
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let hub = LocalHub::new(16);
        let group = hub.group("k");
        let me = Uuid::new_v4();
        let mut rx_self = group.subscribe();
        let mut rx_other = group.subscribe();

        assert_eq!(group.publish(me, vec![1, 2, 3]), 2);
        let frame = rx_other.recv().await.unwrap();
        assert_eq!(frame.sender, me);
        assert_eq!(*frame.bytes, vec![1, 2, 3]);
        // The publisher sees its own frame and has to filter it.
        assert_eq!(rx_self.recv().await.unwrap().sender, me);

        let stats = group.stats();
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.subscribers, 2);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_drops_frames() {
        let hub = LocalHub::new(2);
        let group = hub.group("k");
        let mut rx = group.subscribe();
        for i in 0..4u8 {
            group.publish(Uuid::nil(), vec![i]);
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
        assert_eq!(*rx.recv().await.unwrap().bytes, vec![2]);
    }

    #[test]
    fn test_prune_unused_groups() {
        let hub = LocalHub::new(4);
        let kept = hub.group("busy");
        let _rx = kept.subscribe();
        drop(kept);
        hub.group("idle");

        assert_eq!(hub.prune(), 1);
        assert_eq!(hub.group_count(), 1);
    }

    #[test]
    fn test_process_hub_is_shared() {
        let a = LocalHub::process().group("ws://shared/room");
        let b = LocalHub::process().group("ws://shared/room");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
