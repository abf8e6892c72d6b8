//! # tablesync-core
//!
//! Shared library for tablesync containing the versioned key-value table, its
//! change subscriptions, and the binary wire protocol spoken with the upstream
//! table-sync peer.
//!
//! This crate has zero dependencies on sockets, async runtimes, or the file
//! system.  Everything here can be unit-tested in isolation.
//!
//! # Architecture overview
//!
//! A dashboard shows live values published by a remote device (the upstream
//! peer).  The bridge process keeps a local copy of that table, fans changes
//! out to browsers, and forwards browser writes back upstream.  This crate is
//! the shared foundation:
//!
//! - **`domain`** – Typed values, entries, and key validation rules.
//!
//! - **`store`** – The [`TableStore`]: an in-memory map of key paths to
//!   versioned entries with tombstoned deletes, prefix subscriptions, and a
//!   full-state resync operation.
//!
//! - **`protocol`** – How table changes travel over TCP.  Messages are encoded
//!   into a compact binary format (24-byte header + payload) and decoded back
//!   into typed Rust structs on the other end.

pub mod domain;
pub mod protocol;
pub mod store;

// Re-export the most-used types at the crate root so callers can write
// `tablesync_core::TableStore` instead of `tablesync_core::store::table::TableStore`.
pub use domain::entry::{validate_key, Entry, WriterId, MAX_KEY_LEN};
pub use domain::value::{Value, ValueType};
pub use protocol::codec::{decode_message, encode_message, ProtocolError};
pub use protocol::messages::SyncMessage;
pub use store::events::{ChangeEvent, ChangeKind};
pub use store::table::{ChangeListener, ListenerId, StorageError, TableStore};
pub use store::stream::ChangeStream;
