//! Domain entities for tablesync.
//!
//! Pure data types with no infrastructure dependencies: the typed [`Value`]
//! stored under each key, and the versioned [`Entry`] that wraps it.
//!
//! Code in outer layers (store, protocol, bridge) depends on these types, but
//! the domain never depends on them.
//!
//! [`Value`]: value::Value
//! [`Entry`]: entry::Entry

pub mod entry;
pub mod value;
