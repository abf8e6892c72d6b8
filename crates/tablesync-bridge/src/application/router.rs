//! Subscription router: prefix interest per peer and bounded fan-out queues.
//!
//! # How fan-out works
//!
//! The router is registered on the [`TableStore`] as a [`ChangeListener`].
//! For every accepted mutation the store calls [`Router::route`] while
//! holding its mutation gate.  `route` only *enqueues*: it looks up which
//! peers have a matching prefix and pushes one clone of the event into each
//! peer's [`PeerQueue`].  No socket I/O ever happens here, so one slow
//! browser cannot delay the store or other browsers.
//!
//! Each session task drains its own queue with [`PeerQueue::recv`] and does
//! the JSON encoding and WebSocket write.
//!
//! # Lock order
//!
//! store gate → router peers lock → queue lock.  `close` takes only the
//! router lock, so it can run from any task, including while another thread
//! is in the middle of `route`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use tablesync_core::{ChangeEvent, ChangeKind, ChangeListener, TableStore};

use crate::domain::peer::{OverflowPolicy, PeerId};

// ── Peer queue ────────────────────────────────────────────────────────────────

/// Result of pushing one event into a [`PeerQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The queue was full; the oldest event was discarded to make room.
    DroppedOldest,
    /// The queue was full under [`OverflowPolicy::Disconnect`]; the event was
    /// discarded and the peer should be closed.
    Overflowed,
    /// The queue is closed; the event was discarded.
    Closed,
}

struct QueueState {
    events: VecDeque<ChangeEvent>,
    closed: bool,
}

/// Bounded single-consumer event queue for one peer.
///
/// Producers never block: a full queue either drops its oldest event or
/// reports overflow, depending on the [`OverflowPolicy`].
pub struct PeerQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
}

impl PeerQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                events: VecDeque::with_capacity(capacity.min(1024)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            policy,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueues `event` according to the overflow policy.
    pub fn push(&self, event: ChangeEvent) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return PushOutcome::Closed;
            }
            if state.events.len() < self.capacity {
                state.events.push_back(event);
                PushOutcome::Queued
            } else {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        state.events.pop_front();
                        state.events.push_back(event);
                        PushOutcome::DroppedOldest
                    }
                    OverflowPolicy::Disconnect => return PushOutcome::Overflowed,
                }
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// Appends a subscription snapshot without applying the capacity limit.
    ///
    /// A snapshot is a one-off burst; trimming it would leave the browser
    /// with a partial view it can never repair.
    fn push_snapshot(&self, events: impl IntoIterator<Item = ChangeEvent>) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.events.extend(events);
        }
        self.notify.notify_one();
    }

    /// Waits for the next event.
    ///
    /// Returns `None` once the queue is closed and every event queued before
    /// the close has been received.
    pub async fn recv(&self) -> Option<ChangeEvent> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(event) = state.events.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Returns the next event without waiting.
    pub fn try_recv(&self) -> Option<ChangeEvent> {
        self.state.lock().events.pop_front()
    }

    /// Closes the queue.  Pending events can still be received.  Idempotent.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

struct PeerEntry {
    identity: String,
    prefixes: Vec<String>,
    queue: Arc<PeerQueue>,
}

impl PeerEntry {
    fn wants(&self, key: &str) -> bool {
        self.prefixes.iter().any(|p| key.starts_with(p.as_str()))
    }
}

/// Tracks peers, their prefix subscriptions, and their event queues.
#[derive(Default)]
pub struct Router {
    peers: RwLock<HashMap<PeerId, PeerEntry>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new peer with no subscriptions.
    pub fn register(
        &self,
        identity: impl Into<String>,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> (PeerId, Arc<PeerQueue>) {
        let id = PeerId::new();
        let identity = identity.into();
        let queue = Arc::new(PeerQueue::new(capacity, policy));
        debug!("peer {id} registered ({identity})");
        self.peers.write().insert(
            id,
            PeerEntry {
                identity,
                prefixes: Vec::new(),
                queue: Arc::clone(&queue),
            },
        );
        (id, queue)
    }

    /// Adds `prefix` to the peer's interests.
    ///
    /// Returns `false` if the peer is unknown (already closed).  Subscribing
    /// twice to the same prefix is a no-op.
    pub fn subscribe(&self, peer: PeerId, prefix: &str) -> bool {
        let mut peers = self.peers.write();
        let Some(entry) = peers.get_mut(&peer) else {
            return false;
        };
        if !entry.prefixes.iter().any(|p| p == prefix) {
            entry.prefixes.push(prefix.to_string());
        }
        true
    }

    /// Subscribes `peer` to `prefix` and queues the current live entries
    /// under that prefix ahead of any later change.
    ///
    /// The snapshot and the registration happen under the store's mutation
    /// gate, so the peer sees every entry exactly once: either in the
    /// snapshot or as a later event.  Entries already covered by one of the
    /// peer's earlier prefixes were delivered before and are left out.
    pub fn subscribe_with_snapshot(&self, store: &TableStore, peer: PeerId, prefix: &str) -> bool {
        store.snapshot_then(prefix, |snapshot| {
            let (queue, covered) = {
                let mut peers = self.peers.write();
                let Some(entry) = peers.get_mut(&peer) else {
                    return false;
                };
                if entry.prefixes.iter().any(|p| p == prefix) {
                    return true;
                }
                let covered = entry.prefixes.clone();
                entry.prefixes.push(prefix.to_string());
                (Arc::clone(&entry.queue), covered)
            };
            let fresh = snapshot
                .iter()
                .filter(|e| !covered.iter().any(|p| e.key.starts_with(p.as_str())));
            queue.push_snapshot(fresh.map(|e| ChangeEvent {
                key: e.key.clone(),
                kind: ChangeKind::Assigned,
                value: e.value.clone(),
                version: e.version,
                writer: e.writer.clone(),
            }));
            true
        })
    }

    /// Removes `prefix` from the peer's interests.  Returns `true` if it was there.
    pub fn unsubscribe(&self, peer: PeerId, prefix: &str) -> bool {
        let mut peers = self.peers.write();
        let Some(entry) = peers.get_mut(&peer) else {
            return false;
        };
        let before = entry.prefixes.len();
        entry.prefixes.retain(|p| p != prefix);
        entry.prefixes.len() != before
    }

    /// Delivers `event` to every interested peer, at most once per peer.
    pub fn route(&self, event: &ChangeEvent) {
        let mut overflowed = Vec::new();
        {
            let peers = self.peers.read();
            for (id, entry) in peers.iter() {
                if !entry.wants(&event.key) {
                    continue;
                }
                match entry.queue.push(event.clone()) {
                    PushOutcome::Queued | PushOutcome::Closed => {}
                    PushOutcome::DroppedOldest => {
                        debug!("peer {id} queue full; dropped oldest event");
                    }
                    PushOutcome::Overflowed => overflowed.push(*id),
                }
            }
        }
        for id in overflowed {
            warn!("peer {id} queue overflowed; disconnecting");
            self.close(id);
        }
    }

    /// Removes the peer and closes its queue.  Idempotent.
    ///
    /// Returns `true` if the peer was registered.
    pub fn close(&self, peer: PeerId) -> bool {
        let removed = self.peers.write().remove(&peer);
        match removed {
            Some(entry) => {
                entry.queue.close();
                info!(
                    "peer {peer} ({}) closed; {} event(s) dropped over its lifetime",
                    entry.identity,
                    entry.queue.dropped()
                );
                true
            }
            None => false,
        }
    }

    /// Closes every peer (shutdown).
    pub fn close_all(&self) {
        let drained: Vec<PeerEntry> = self.peers.write().drain().map(|(_, e)| e).collect();
        for entry in drained {
            entry.queue.close();
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// The peer's current prefixes, in subscription order.
    pub fn prefixes(&self, peer: PeerId) -> Option<Vec<String>> {
        self.peers.read().get(&peer).map(|e| e.prefixes.clone())
    }
}

impl ChangeListener for Router {
    fn on_change(&self, event: &ChangeEvent) {
        self.route(event);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tablesync_core::{Value, WriterId};

    fn event(key: &str, version: u64) -> ChangeEvent {
        ChangeEvent {
            key: key.to_string(),
            kind: ChangeKind::Updated,
            value: Some(Value::Double(version as f64)),
            version,
            writer: WriterId::new("test"),
        }
    }

    fn drain(queue: &PeerQueue) -> Vec<(String, u64)> {
        std::iter::from_fn(|| queue.try_recv())
            .map(|e| (e.key, e.version))
            .collect()
    }

    #[test]
    fn test_route_delivers_only_to_matching_prefixes() {
        // Arrange
        let router = Router::new();
        let (a, qa) = router.register("a", 16, OverflowPolicy::DropOldest);
        let (b, qb) = router.register("b", 16, OverflowPolicy::DropOldest);
        router.subscribe(a, "/SmartDashboard/");
        router.subscribe(b, "/LiveWindow/");

        // Act
        router.route(&event("/SmartDashboard/x", 1));

        // Assert
        assert_eq!(drain(&qa), vec![("/SmartDashboard/x".to_string(), 1)]);
        assert!(qb.is_empty());
    }

    #[test]
    fn test_overlapping_prefixes_deliver_once() {
        let router = Router::new();
        let (a, qa) = router.register("a", 16, OverflowPolicy::DropOldest);
        router.subscribe(a, "");
        router.subscribe(a, "/a");
        router.subscribe(a, "/a/b");

        router.route(&event("/a/b/c", 1));

        assert_eq!(qa.len(), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let router = Router::new();
        let (a, qa) = router.register("a", 16, OverflowPolicy::DropOldest);
        router.subscribe(a, "/x");

        assert!(router.unsubscribe(a, "/x"));
        assert!(!router.unsubscribe(a, "/x"));
        router.route(&event("/x/1", 1));

        assert!(qa.is_empty());
    }

    #[test]
    fn test_drop_oldest_keeps_newest_events_and_counts_drops() {
        // Arrange
        let router = Router::new();
        let (a, qa) = router.register("a", 2, OverflowPolicy::DropOldest);
        router.subscribe(a, "");

        // Act
        for v in 1..=5 {
            router.route(&event("/k", v));
        }

        // Assert
        assert_eq!(drain(&qa), vec![("/k".to_string(), 4), ("/k".to_string(), 5)]);
        assert_eq!(qa.dropped(), 3);
    }

    #[test]
    fn test_disconnect_policy_closes_peer_on_overflow() {
        let router = Router::new();
        let (a, qa) = router.register("a", 1, OverflowPolicy::Disconnect);
        router.subscribe(a, "");

        router.route(&event("/k", 1));
        router.route(&event("/k", 2));

        assert!(qa.is_closed());
        assert_eq!(router.peer_count(), 0);
        assert_eq!(drain(&qa), vec![("/k".to_string(), 1)]);
    }

    #[test]
    fn test_close_is_idempotent() {
        let router = Router::new();
        let (a, qa) = router.register("a", 4, OverflowPolicy::DropOldest);

        assert!(router.close(a));
        assert!(!router.close(a));
        assert!(qa.is_closed());
        assert!(!router.subscribe(a, "/x"), "closed peer cannot subscribe");
    }

    #[test]
    fn test_slow_peer_does_not_affect_fast_peer() {
        // Arrange: one peer with a tiny queue never drains
        let router = Router::new();
        let (slow, _slow_q) = router.register("slow", 1, OverflowPolicy::DropOldest);
        let (fast, fast_q) = router.register("fast", 1000, OverflowPolicy::DropOldest);
        router.subscribe(slow, "");
        router.subscribe(fast, "");

        // Act
        for v in 1..=100 {
            router.route(&event("/k", v));
        }

        // Assert
        assert_eq!(fast_q.len(), 100);
    }

    #[test]
    fn test_subscribe_with_snapshot_queues_live_entries_first() {
        // Arrange
        let store = TableStore::new();
        let w = WriterId::new("test");
        store.set("/a/1", Value::Double(1.0), &w).unwrap();
        store.set("/a/2", Value::Double(2.0), &w).unwrap();
        store.set("/b/1", Value::Double(3.0), &w).unwrap();
        let router = Arc::new(Router::new());
        store.add_listener(router.clone());
        let (peer, queue) = router.register("p", 16, OverflowPolicy::DropOldest);

        // Act
        assert!(router.subscribe_with_snapshot(&store, peer, "/a/"));
        store.set("/a/1", Value::Double(1.5), &w).unwrap();

        // Assert
        assert_eq!(
            drain(&queue),
            vec![
                ("/a/1".to_string(), 1),
                ("/a/2".to_string(), 1),
                ("/a/1".to_string(), 2),
            ]
        );
    }

    #[test]
    fn test_resubscribing_or_nesting_a_prefix_does_not_repeat_the_snapshot() {
        // Arrange
        let store = TableStore::new();
        let w = WriterId::new("test");
        store.set("/a/x", Value::Double(1.0), &w).unwrap();
        let router = Router::new();
        let (peer, queue) = router.register("p", 16, OverflowPolicy::DropOldest);

        // Act
        router.subscribe_with_snapshot(&store, peer, "");
        router.subscribe_with_snapshot(&store, peer, "/a/");
        router.subscribe_with_snapshot(&store, peer, "/a/");

        // Assert
        assert_eq!(drain(&queue), vec![("/a/x".to_string(), 1)]);
        assert_eq!(
            router.prefixes(peer),
            Some(vec![String::new(), "/a/".to_string()])
        );
    }

    #[test]
    fn test_widening_a_prefix_snapshots_only_uncovered_keys() {
        let store = TableStore::new();
        let w = WriterId::new("test");
        store.set("/a/x", Value::Double(1.0), &w).unwrap();
        store.set("/b/y", Value::Double(2.0), &w).unwrap();
        let router = Router::new();
        let (peer, queue) = router.register("p", 16, OverflowPolicy::DropOldest);

        router.subscribe_with_snapshot(&store, peer, "/a/");
        router.subscribe_with_snapshot(&store, peer, "");

        assert_eq!(
            drain(&queue),
            vec![("/a/x".to_string(), 1), ("/b/y".to_string(), 1)]
        );
    }

    #[test]
    fn test_snapshot_bypasses_capacity() {
        let store = TableStore::new();
        let w = WriterId::new("test");
        for i in 0..10 {
            store.set(&format!("/k{i}"), Value::Double(0.0), &w).unwrap();
        }
        let router = Router::new();
        let (peer, queue) = router.register("p", 2, OverflowPolicy::DropOldest);

        router.subscribe_with_snapshot(&store, peer, "");

        assert_eq!(queue.len(), 10);
        assert_eq!(queue.dropped(), 0);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push_and_ends_after_close() {
        // Arrange
        let queue = Arc::new(PeerQueue::new(8, OverflowPolicy::DropOldest));
        let consumer = {
            let q = Arc::clone(&queue);
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(e) = q.recv().await {
                    seen.push(e.version);
                }
                seen
            })
        };

        // Act
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(event("/k", 1));
        queue.push(event("/k", 2));
        queue.close();

        // Assert
        let seen = tokio::time::timeout(Duration::from_secs(2), consumer)
            .await
            .expect("consumer must finish after close")
            .expect("consumer task panicked");
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn test_push_after_close_is_discarded() {
        let queue = PeerQueue::new(8, OverflowPolicy::DropOldest);
        queue.close();
        assert_eq!(queue.push(event("/k", 1)), PushOutcome::Closed);
        assert!(queue.is_empty());
    }
}
