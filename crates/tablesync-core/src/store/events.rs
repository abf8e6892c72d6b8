//! Change events emitted by the table store.

use crate::domain::entry::{Entry, WriterId};
use crate::domain::value::Value;

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// The key did not exist (or was a tombstone) and now holds a value.
    Assigned,
    /// The key held a value and now holds a new one.
    Updated,
    /// The key was tombstoned.
    Deleted,
}

/// A snapshot of one accepted mutation.
///
/// Events are cloned out of the store before any fan-out happens, so holding
/// one never keeps a store lock alive.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub key: String,
    pub kind: ChangeKind,
    /// `None` for [`ChangeKind::Deleted`].
    pub value: Option<Value>,
    pub version: u64,
    pub writer: WriterId,
}

impl ChangeEvent {
    pub(crate) fn from_entry(entry: &Entry, kind: ChangeKind) -> Self {
        Self {
            key: entry.key.clone(),
            kind,
            value: entry.value.clone(),
            version: entry.version,
            writer: entry.writer.clone(),
        }
    }

    /// Returns `true` if this event's key falls under `prefix`.
    ///
    /// The empty prefix matches every key.
    pub fn matches(&self, prefix: &str) -> bool {
        self.key.starts_with(prefix)
    }
}
