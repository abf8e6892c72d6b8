//! `TableStore`: the versioned key-value table.
//!
//! # Concurrency model
//!
//! Mutations follow a single-writer discipline.  Every mutation first takes
//! the *gate* (a plain mutex), then write-locks the entry map only for the
//! in-memory change, releases it, and finally notifies listeners while the
//! gate is still held:
//!
//! ```text
//! gate.lock()
//!   entries.write()  -> apply change, clone ChangeEvent
//!   (entries released; readers proceed)
//!   listeners[..].on_change(&event)
//! gate released
//! ```
//!
//! Holding the gate across notification means listeners observe changes in
//! exactly the order they were applied, so a subscriber never sees version
//! N+1 of a key before version N.  Readers (`get`, `snapshot`) only take the
//! read lock and never wait on listeners.
//!
//! Listeners must therefore be cheap and non-blocking: enqueue and return.
//! They must never call back into a mutating store method.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::entry::{now_us, validate_key, Entry, WriterId};
use crate::domain::value::{Value, ValueType};
use crate::store::events::{ChangeEvent, ChangeKind};
use crate::store::stream::ChangeStream;

/// Default upper bound on the number of entries (live + tombstoned).
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

/// Errors that reject a single store operation.
///
/// The store is left unchanged whenever one of these is returned.
#[derive(Debug, Error, PartialEq)]
pub enum StorageError {
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("type mismatch for {key:?}: entry holds {existing}, write was {attempted}")]
    TypeMismatch {
        key: String,
        existing: ValueType,
        attempted: ValueType,
    },

    #[error("store is full ({limit} entries)")]
    CapacityExceeded { limit: usize },
}

/// A synchronous sink for change events.
///
/// Called with the store's mutation gate held, in mutation order.
/// Implementations must not block and must not mutate the store.
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, event: &ChangeEvent);
}

/// Handle returned by [`TableStore::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Inner {
    gate: Mutex<()>,
    entries: RwLock<HashMap<String, Entry>>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn ChangeListener>)>>,
    next_listener_id: AtomicU64,
    /// Highest version ever garbage-collected.  Keys created afterwards start
    /// above it so versions never move backwards for an observer.
    version_floor: AtomicU64,
    max_entries: usize,
}

/// Cheaply cloneable handle to a shared table.
///
/// Cloning gives another handle to the *same* table; pass clones to every
/// component that needs the store instead of reaching for a global.
#[derive(Clone)]
pub struct TableStore {
    inner: Arc<Inner>,
}

impl Default for TableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TableStore {
    /// Creates an empty store with [`DEFAULT_MAX_ENTRIES`] capacity.
    pub fn new() -> Self {
        Self::with_max_entries(DEFAULT_MAX_ENTRIES)
    }

    /// Creates an empty store that rejects new keys beyond `max_entries`.
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                gate: Mutex::new(()),
                entries: RwLock::new(HashMap::new()),
                listeners: RwLock::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                version_floor: AtomicU64::new(0),
                max_entries,
            }),
        }
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    /// Returns the current value of `key`, or `None` if absent or deleted.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner
            .entries
            .read()
            .get(key)
            .and_then(|e| e.value.clone())
    }

    /// Returns the full entry for `key`, including tombstones.
    pub fn entry(&self, key: &str) -> Option<Entry> {
        self.inner.entries.read().get(key).cloned()
    }

    /// Number of live (non-tombstoned) entries.
    pub fn len(&self) -> usize {
        self.inner
            .entries
            .read()
            .values()
            .filter(|e| !e.is_tombstone())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tombstones awaiting garbage collection.
    pub fn tombstone_count(&self) -> usize {
        self.inner
            .entries
            .read()
            .values()
            .filter(|e| e.is_tombstone())
            .count()
    }

    /// Live entries whose key starts with `prefix`, sorted by key.
    pub fn snapshot(&self, prefix: &str) -> Vec<Entry> {
        collect_live(&self.inner.entries.read(), prefix)
    }

    /// Runs `f` with a snapshot of live entries under `prefix` while holding
    /// the mutation gate.
    ///
    /// No mutation can happen between the snapshot and the end of `f`, so a
    /// caller can seed a subscriber from the snapshot and register it for
    /// live events without gaps or duplicates.  `f` must not mutate the store.
    pub fn snapshot_then<R>(&self, prefix: &str, f: impl FnOnce(Vec<Entry>) -> R) -> R {
        let _gate = self.inner.gate.lock();
        let snapshot = self.snapshot(prefix);
        f(snapshot)
    }

    // ── Mutations ────────────────────────────────────────────────────────────

    /// Creates or overwrites `key` and bumps its version.
    ///
    /// Every accepted write bumps the version, even when the value is
    /// identical, so N accepted writes to a fresh key leave it at version N.
    ///
    /// # Errors
    ///
    /// - [`StorageError::InvalidKey`] if the key fails validation.
    /// - [`StorageError::TypeMismatch`] if the key holds a live value of a
    ///   different type.
    /// - [`StorageError::CapacityExceeded`] if the key is new and the store
    ///   is full.
    pub fn set(
        &self,
        key: &str,
        value: Value,
        writer: &WriterId,
    ) -> Result<ChangeEvent, StorageError> {
        self.set_then(key, value, writer, |_| {})
    }

    /// Like [`set`](Self::set), then runs `on_commit` with the event before
    /// the mutation gate is released.
    ///
    /// Whatever `on_commit` records is ordered exactly like the writes
    /// themselves.  It must not block and must not mutate the store.
    ///
    /// # Errors
    ///
    /// See [`set`](Self::set).  `on_commit` is not called on error.
    pub fn set_then(
        &self,
        key: &str,
        value: Value,
        writer: &WriterId,
        on_commit: impl FnOnce(&ChangeEvent),
    ) -> Result<ChangeEvent, StorageError> {
        check_key(key)?;
        let _gate = self.inner.gate.lock();
        let event = {
            let mut entries = self.inner.entries.write();
            self.put_locked(&mut entries, key, value, writer, true)?
        };
        self.notify(&event);
        on_commit(&event);
        Ok(event)
    }

    /// Like [`set`](Self::set), but a live entry may change type.
    ///
    /// Used for writes from an authoritative upstream peer, which owns the
    /// schema of its own keys.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidKey`] or [`StorageError::CapacityExceeded`].
    pub fn set_authoritative(
        &self,
        key: &str,
        value: Value,
        writer: &WriterId,
    ) -> Result<ChangeEvent, StorageError> {
        check_key(key)?;
        let _gate = self.inner.gate.lock();
        let event = {
            let mut entries = self.inner.entries.write();
            self.put_locked(&mut entries, key, value, writer, false)?
        };
        self.notify(&event);
        Ok(event)
    }

    /// Tombstones `key` with a version bump.
    ///
    /// Deleting an absent or already-deleted key is a no-op and returns
    /// `Ok(None)`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidKey`] if the key fails validation.
    pub fn delete(&self, key: &str, writer: &WriterId) -> Result<Option<ChangeEvent>, StorageError> {
        self.delete_then(key, writer, |_| {})
    }

    /// Like [`delete`](Self::delete), with `on_commit` run under the gate
    /// when a tombstone was actually written.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidKey`] if the key fails validation.
    pub fn delete_then(
        &self,
        key: &str,
        writer: &WriterId,
        on_commit: impl FnOnce(&ChangeEvent),
    ) -> Result<Option<ChangeEvent>, StorageError> {
        check_key(key)?;
        let _gate = self.inner.gate.lock();
        let event = {
            let mut entries = self.inner.entries.write();
            remove_locked(&mut entries, key, writer)
        };
        if let Some(ref event) = event {
            self.notify(event);
            on_commit(event);
        }
        Ok(event)
    }

    /// Makes the store match an authoritative snapshot.
    ///
    /// - Keys whose value differs from the snapshot (or that are missing) are
    ///   set.  Type changes are accepted here: the authoritative side wins.
    /// - Keys with identical values are left alone and produce no event.
    ///   Doubles compare bitwise, so a `NaN` that did not change stays quiet.
    /// - Live keys absent from the snapshot are tombstoned.
    /// - Keys for which `keep(key)` returns `true` are not touched at all:
    ///   their snapshot record is ignored and they are never tombstoned
    ///   (the caller still has a local write for that key queued for
    ///   replay).  `keep` is evaluated under the mutation gate.
    ///
    /// Records with invalid keys are skipped with a warning.  Returns the
    /// events produced, in the order listeners saw them.
    pub fn resync(
        &self,
        snapshot: Vec<(String, Value)>,
        writer: &WriterId,
        keep: impl Fn(&str) -> bool,
    ) -> Vec<ChangeEvent> {
        let _gate = self.inner.gate.lock();
        let mut events = Vec::new();
        {
            let mut entries = self.inner.entries.write();
            let mut seen = std::collections::HashSet::with_capacity(snapshot.len());

            for (key, value) in snapshot {
                if let Err(reason) = validate_key(&key) {
                    warn!("resync: skipping invalid key {key:?}: {reason}");
                    continue;
                }
                if keep(&key) {
                    seen.insert(key);
                    continue;
                }
                let unchanged = entries
                    .get(&key)
                    .and_then(|e| e.value.as_ref())
                    .is_some_and(|current| current.same_as(&value));
                if !unchanged {
                    match self.put_locked(&mut entries, &key, value, writer, false) {
                        Ok(event) => events.push(event),
                        Err(e) => warn!("resync: rejected {key:?}: {e}"),
                    }
                }
                seen.insert(key);
            }

            let stale: Vec<String> = entries
                .values()
                .filter(|e| !e.is_tombstone() && !seen.contains(&e.key) && !keep(e.key.as_str()))
                .map(|e| e.key.clone())
                .collect();
            for key in stale {
                events.extend(remove_locked(&mut entries, &key, writer));
            }
        }

        debug!("resync applied {} change(s)", events.len());
        for event in &events {
            self.notify(event);
        }
        events
    }

    /// Physically removes tombstones last modified at least `min_age` ago.
    ///
    /// Returns the number of tombstones removed.
    pub fn collect_garbage(&self, min_age: Duration) -> usize {
        let _gate = self.inner.gate.lock();
        let cutoff = now_us().saturating_sub(min_age.as_micros() as u64);
        let mut entries = self.inner.entries.write();
        let before = entries.len();
        let mut floor = self.inner.version_floor.load(Ordering::Relaxed);
        entries.retain(|_, e| {
            let collect = e.is_tombstone() && e.modified_us <= cutoff;
            if collect {
                floor = floor.max(e.version);
            }
            !collect
        });
        self.inner.version_floor.store(floor, Ordering::Relaxed);
        let removed = before - entries.len();
        if removed > 0 {
            debug!("garbage-collected {removed} tombstone(s)");
        }
        removed
    }

    // ── Listeners and subscriptions ──────────────────────────────────────────

    /// Registers a synchronous change listener.
    pub fn add_listener(&self, listener: Arc<dyn ChangeListener>) -> ListenerId {
        let id = ListenerId(self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.inner.listeners.write().push((id, listener));
        id
    }

    /// Unregisters a listener.  Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Returns a lazy stream of future change events for keys under `prefix`.
    ///
    /// Call [`ChangeStream::restart`] to re-seed it with the current state.
    pub fn subscribe(&self, prefix: &str) -> ChangeStream {
        ChangeStream::open(self.clone(), prefix)
    }

    // ── Internals ────────────────────────────────────────────────────────────

    /// Writes `value` into the locked entry map.
    ///
    /// With `enforce_type` unset a live entry may change type (resync only).
    fn put_locked(
        &self,
        entries: &mut HashMap<String, Entry>,
        key: &str,
        value: Value,
        writer: &WriterId,
        enforce_type: bool,
    ) -> Result<ChangeEvent, StorageError> {
        if let Some(entry) = entries.get_mut(key) {
            let kind = match &entry.value {
                None => ChangeKind::Assigned,
                Some(existing) => {
                    if enforce_type && existing.value_type() != value.value_type() {
                        return Err(StorageError::TypeMismatch {
                            key: key.to_string(),
                            existing: existing.value_type(),
                            attempted: value.value_type(),
                        });
                    }
                    ChangeKind::Updated
                }
            };
            entry.value = Some(value);
            entry.version += 1;
            entry.writer = writer.clone();
            entry.modified_us = now_us();
            return Ok(ChangeEvent::from_entry(entry, kind));
        }

        if entries.len() >= self.inner.max_entries {
            return Err(StorageError::CapacityExceeded {
                limit: self.inner.max_entries,
            });
        }
        let entry = Entry {
            key: key.to_string(),
            value: Some(value),
            version: self.inner.version_floor.load(Ordering::Relaxed) + 1,
            writer: writer.clone(),
            modified_us: now_us(),
        };
        let event = ChangeEvent::from_entry(&entry, ChangeKind::Assigned);
        entries.insert(key.to_string(), entry);
        Ok(event)
    }

    /// Delivers `event` to every listener.  Caller holds the gate.
    fn notify(&self, event: &ChangeEvent) {
        // Clone the listener list so a listener may be removed (e.g. a
        // ChangeStream dropped on another thread) without waiting on us.
        let listeners: Vec<Arc<dyn ChangeListener>> = self
            .inner
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener.on_change(event);
        }
    }
}

/// Tombstones `key`.  `None` if it is absent or already a tombstone.
fn remove_locked(
    entries: &mut HashMap<String, Entry>,
    key: &str,
    writer: &WriterId,
) -> Option<ChangeEvent> {
    let entry = entries.get_mut(key)?;
    entry.value.as_ref()?;
    entry.value = None;
    entry.version += 1;
    entry.writer = writer.clone();
    entry.modified_us = now_us();
    Some(ChangeEvent::from_entry(entry, ChangeKind::Deleted))
}

fn check_key(key: &str) -> Result<(), StorageError> {
    validate_key(key).map_err(|reason| StorageError::InvalidKey {
        key: key.to_string(),
        reason,
    })
}

fn collect_live(entries: &HashMap<String, Entry>, prefix: &str) -> Vec<Entry> {
    let mut live: Vec<Entry> = entries
        .values()
        .filter(|e| !e.is_tombstone() && e.key.starts_with(prefix))
        .cloned()
        .collect();
    live.sort_by(|a, b| a.key.cmp(&b.key));
    live
}

// ── Tests ─────────────────────────────────────────────────────────────────────
