//! The in-memory table store.
//!
//! - **`table`** – [`TableStore`](table::TableStore): versioned entries,
//!   single-writer mutation discipline, tombstones and garbage collection,
//!   authoritative resync, synchronous change listeners.
//! - **`events`** – [`ChangeEvent`](events::ChangeEvent), the unit of change
//!   notification produced by every accepted mutation.
//! - **`stream`** – [`ChangeStream`](stream::ChangeStream), a lazy and
//!   restartable prefix-filtered sequence of change events.

pub mod events;
pub mod stream;
pub mod table;
