//! Lazy, restartable change streams.
//!
//! A [`ChangeStream`] is a prefix-filtered queue of [`ChangeEvent`]s fed by a
//! store listener.  Opening one is cheap: it only sees changes made after it
//! was opened.  [`ChangeStream::restart`] discards anything queued and
//! re-seeds the stream with the current live entries (as `Assigned` events)
//! followed by every later change, with no gap and no duplicate between the
//! two.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::store::events::{ChangeEvent, ChangeKind};
use crate::store::table::{ChangeListener, ListenerId, TableStore};

/// Forwards matching events into an mpsc channel.
struct ChannelListener {
    prefix: String,
    // `Sender` is `Send` but not `Sync`; the mutex makes the listener `Sync`.
    tx: Mutex<Sender<ChangeEvent>>,
}

impl ChangeListener for ChannelListener {
    fn on_change(&self, event: &ChangeEvent) {
        if event.matches(&self.prefix) {
            // A closed receiver means the stream is being dropped.
            let _ = self.tx.lock().send(event.clone());
        }
    }
}

/// A prefix-filtered sequence of change events.
///
/// Iteration never blocks: [`Iterator::next`] returns `None` as soon as the
/// queue is empty, and a later call may yield more events.  Use
/// [`ChangeStream::next_timeout`] to wait.
pub struct ChangeStream {
    store: TableStore,
    prefix: String,
    listener: ListenerId,
    rx: Receiver<ChangeEvent>,
}

impl ChangeStream {
    pub(crate) fn open(store: TableStore, prefix: &str) -> Self {
        let (tx, rx) = mpsc::channel();
        let listener = store.add_listener(Arc::new(ChannelListener {
            prefix: prefix.to_string(),
            tx: Mutex::new(tx),
        }));
        Self {
            store,
            prefix: prefix.to_string(),
            listener,
            rx,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Drops queued events and starts over from the current state.
    ///
    /// After this call the stream yields one `Assigned` event per live entry
    /// under the prefix (in key order), then live changes.
    pub fn restart(&mut self) {
        let store = self.store.clone();
        let old = self.listener;
        let prefix = self.prefix.clone();
        let (listener, rx) = store.snapshot_then(&prefix, |snapshot| {
            store.remove_listener(old);
            let (tx, rx) = mpsc::channel();
            for entry in &snapshot {
                let _ = tx.send(ChangeEvent::from_entry(entry, ChangeKind::Assigned));
            }
            let id = store.add_listener(Arc::new(ChannelListener {
                prefix: prefix.clone(),
                tx: Mutex::new(tx),
            }));
            (id, rx)
        });
        self.listener = listener;
        self.rx = rx;
    }

    /// Returns the next queued event without waiting.
    pub fn try_next(&mut self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }

    /// Waits up to `timeout` for the next event.
    pub fn next_timeout(&mut self, timeout: Duration) -> Option<ChangeEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }
}

impl Iterator for ChangeStream {
    type Item = ChangeEvent;

    fn next(&mut self) -> Option<Self::Item> {
        self.try_next()
    }
}

impl Drop for ChangeStream {
    fn drop(&mut self) {
        self.store.remove_listener(self.listener);
    }
}
