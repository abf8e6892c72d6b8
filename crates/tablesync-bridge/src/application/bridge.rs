//! [`SyncBridge`]: the host-facing handle that ties the store, the router
//! and the upstream supervisor together.
//!
//! There are no globals.  Everything the bridge owns hangs off one
//! `SyncBridge`, and every collaborator (the WebSocket server, the HTTP
//! server, a host program) receives it explicitly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use tablesync_core::{ChangeEvent, ListenerId, StorageError, TableStore, Value, WriterId};

use crate::application::router::Router;
use crate::application::supervisor::{PendingOp, Supervisor, UpstreamLink};
use crate::domain::config::{BridgeConfig, ConnectTarget};
use crate::domain::peer::{ConnectionState, PeerId};

/// Store + router + upstream link.  Cheap to share behind an `Arc`.
pub struct SyncBridge {
    config: BridgeConfig,
    store: TableStore,
    router: Arc<Router>,
    router_listener: ListenerId,
    link: Arc<UpstreamLink>,
    writer: WriterId,
    running: Arc<AtomicBool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SyncBridge {
    /// Creates a bridge with an empty store.  Nothing is connected yet.
    pub fn new(config: BridgeConfig) -> Self {
        let store = TableStore::new();
        let router = Arc::new(Router::new());
        let router_listener = store.add_listener(router.clone());
        let link = Arc::new(UpstreamLink::new(config.pending_write_limit));
        let writer = WriterId::new(config.identity.clone());
        Self {
            config,
            store,
            router,
            router_listener,
            link,
            writer,
            running: Arc::new(AtomicBool::new(true)),
            supervisor: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Starts (or restarts) the upstream supervisor for `target`.
    ///
    /// Must be called from inside a Tokio runtime.  A previously running
    /// supervisor is stopped first.
    pub fn connect(&self, target: ConnectTarget) {
        let supervisor = Supervisor::new(
            &self.config,
            target,
            self.store.clone(),
            Arc::clone(&self.link),
            Arc::clone(&self.running),
        );
        let handle = tokio::spawn(supervisor.run());
        if let Some(previous) = self.supervisor.lock().replace(handle) {
            debug!("replacing running upstream supervisor");
            previous.abort();
        }
    }

    /// Delivers the current entries under `prefix`, then every later change,
    /// to `callback` on a background task.
    ///
    /// Dropping the returned handle (or calling
    /// [`SubscriptionHandle::cancel`]) stops delivery.  Must be called from
    /// inside a Tokio runtime.
    pub fn subscribe<F>(&self, prefix: &str, callback: F) -> SubscriptionHandle
    where
        F: Fn(ChangeEvent) + Send + 'static,
    {
        let (peer, queue) = self.router.register(
            format!("host:{prefix}"),
            self.config.peer_queue_capacity,
            self.config.overflow_policy,
        );
        self.router.subscribe_with_snapshot(&self.store, peer, prefix);
        tokio::spawn(async move {
            while let Some(event) = queue.recv().await {
                callback(event);
            }
        });
        SubscriptionHandle {
            router: Arc::clone(&self.router),
            peer,
        }
    }

    /// Writes `key` as the bridge itself.
    ///
    /// # Errors
    ///
    /// See [`TableStore::set`].
    pub fn set(&self, key: &str, value: Value) -> Result<ChangeEvent, StorageError> {
        self.set_from(&self.writer, key, value)
    }

    /// Writes `key` on behalf of `writer` and forwards it upstream.
    ///
    /// The upstream write is queued before the store accepts the next
    /// mutation, so concurrent writers to one key leave the queued value
    /// equal to the stored one.
    ///
    /// # Errors
    ///
    /// See [`TableStore::set`].  A rejected write is not forwarded.
    pub fn set_from(
        &self,
        writer: &WriterId,
        key: &str,
        value: Value,
    ) -> Result<ChangeEvent, StorageError> {
        self.store.set_then(key, value.clone(), writer, |_| {
            self.link.enqueue(key, PendingOp::Set(value));
        })
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.store.get(key)
    }

    /// Deletes `key` as the bridge itself.
    ///
    /// # Errors
    ///
    /// See [`TableStore::delete`].
    pub fn delete(&self, key: &str) -> Result<Option<ChangeEvent>, StorageError> {
        self.delete_from(&self.writer, key)
    }

    /// Deletes `key` on behalf of `writer` and forwards it upstream.
    ///
    /// # Errors
    ///
    /// See [`TableStore::delete`].
    pub fn delete_from(
        &self,
        writer: &WriterId,
        key: &str,
    ) -> Result<Option<ChangeEvent>, StorageError> {
        self.store
            .delete_then(key, writer, |_| self.link.enqueue(key, PendingOp::Delete))
    }

    pub fn store(&self) -> &TableStore {
        &self.store
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn upstream_state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn watch_upstream(&self) -> watch::Receiver<ConnectionState> {
        self.link.watch()
    }

    /// Local writes not yet sent upstream.
    pub fn pending_writes(&self) -> usize {
        self.link.pending_len()
    }

    /// Shared shutdown flag; cleared by [`shutdown`](Self::shutdown).
    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops the supervisor (it sends `Disconnect` if connected) and closes
    /// every peer queue.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("bridge shutting down");
        }
        self.router.close_all();
    }
}

impl Drop for SyncBridge {
    fn drop(&mut self) {
        self.store.remove_listener(self.router_listener);
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
    }
}

/// Keeps a host subscription alive.
pub struct SubscriptionHandle {
    router: Arc<Router>,
    peer: PeerId,
}

impl SubscriptionHandle {
    /// Stops delivery.  Events already queued are still delivered.
    pub fn cancel(&self) {
        self.router.close(self.peer);
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tablesync_core::ChangeKind;
    use tokio::sync::mpsc;

    fn bridge() -> SyncBridge {
        SyncBridge::new(BridgeConfig::default())
    }

    async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Option<T> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for callback")
    }

    #[test]
    fn test_set_get_delete_through_host_api() {
        // Arrange
        let bridge = bridge();

        // Act
        bridge.set("/a", Value::Double(1.0)).unwrap();
        let deleted = bridge.delete("/a").unwrap();

        // Assert
        assert!(deleted.is_some());
        assert_eq!(bridge.get("/a"), None);
        assert_eq!(bridge.store().entry("/a").unwrap().version, 2);
    }

    #[test]
    fn test_local_writes_are_buffered_for_upstream_and_coalesced() {
        let bridge = bridge();

        bridge.set("/a", Value::Double(1.0)).unwrap();
        bridge.set("/a", Value::Double(2.0)).unwrap();
        bridge.set("/b", Value::Boolean(true)).unwrap();

        assert_eq!(bridge.pending_writes(), 2);
    }

    #[test]
    fn test_rejected_write_is_not_forwarded() {
        let bridge = bridge();
        bridge.set("/a", Value::Double(1.0)).unwrap();

        let result = bridge.set("/a", Value::Boolean(true));

        assert!(matches!(result, Err(StorageError::TypeMismatch { .. })));
        assert_eq!(bridge.pending_writes(), 1);
    }

    #[test]
    fn test_deleting_absent_key_is_not_forwarded() {
        let bridge = bridge();
        assert_eq!(bridge.delete("/nothing").unwrap(), None);
        assert_eq!(bridge.pending_writes(), 0);
    }

    #[test]
    fn test_concurrent_writers_leave_pending_write_equal_to_store() {
        // Arrange
        let bridge = Arc::new(bridge());

        // Act: several sessions race on one key
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let bridge = Arc::clone(&bridge);
                std::thread::spawn(move || {
                    let writer = WriterId::new(format!("peer-{t}"));
                    for i in 0..500 {
                        bridge
                            .set_from(&writer, "/shared", Value::Double((t * 1000 + i) as f64))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // Assert
        let stored = bridge.get("/shared").unwrap();
        assert_eq!(
            bridge.link.drain_pending(),
            vec![("/shared".to_string(), PendingOp::Set(stored))]
        );
    }

    #[test]
    fn test_delete_after_set_leaves_a_pending_delete() {
        let bridge = bridge();
        bridge.set("/a", Value::Double(1.0)).unwrap();

        bridge.delete("/a").unwrap();

        assert_eq!(
            bridge.link.drain_pending(),
            vec![("/a".to_string(), PendingOp::Delete)]
        );
    }

    #[test]
    fn test_set_from_records_the_writer() {
        let bridge = bridge();
        let browser = WriterId::new("peer-1234");

        bridge.set_from(&browser, "/a", Value::Double(1.0)).unwrap();

        assert_eq!(bridge.store().entry("/a").unwrap().writer, browser);
    }

    #[test]
    fn test_upstream_starts_disconnected() {
        assert_eq!(bridge().upstream_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_subscribe_delivers_snapshot_then_changes_until_cancelled() {
        // Arrange
        let bridge = bridge();
        bridge.set("/s/a", Value::Double(1.0)).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Act
        let handle = bridge.subscribe("/s/", move |e| {
            let _ = tx.send((e.key, e.kind));
        });
        bridge.set("/s/b", Value::Double(2.0)).unwrap();
        bridge.set("/other", Value::Double(3.0)).unwrap();

        // Assert
        assert_eq!(
            recv(&mut rx).await,
            Some(("/s/a".to_string(), ChangeKind::Assigned))
        );
        assert_eq!(
            recv(&mut rx).await,
            Some(("/s/b".to_string(), ChangeKind::Assigned))
        );

        handle.cancel();
        bridge.set("/s/c", Value::Double(4.0)).unwrap();
        assert_eq!(
            recv(&mut rx).await,
            None,
            "callback task ends and drops its sender after cancel"
        );
    }

    #[test]
    fn test_shutdown_closes_peers_and_clears_running_flag() {
        let bridge = bridge();
        let (_, queue) = bridge
            .router()
            .register("p", 4, crate::domain::peer::OverflowPolicy::DropOldest);

        bridge.shutdown();

        assert!(!bridge.is_running());
        assert!(queue.is_closed());
    }
}
