//! Application layer for tablesync-bridge.
//!
//! Knows *what* happens to a change: who receives it, how it is translated,
//! and when it is sent upstream.
//!
//! - **`router`** – per-peer prefix subscriptions and bounded event queues.
//! - **`transport`** – pure translation between store events, browser JSON
//!   and upstream protocol messages.
//! - **`supervisor`** – upstream connection state machine: backoff, resync,
//!   pending-write replay, keepalive.
//! - **`bridge`** – [`SyncBridge`], the handle hosts and servers share.
//!
//! The supervisor is the one piece here that drives I/O; it does so through
//! `infrastructure::upstream_conn` and owns nothing socket-specific itself.

pub mod bridge;
pub mod router;
pub mod supervisor;
pub mod transport;

pub use bridge::{SubscriptionHandle, SyncBridge};
pub use router::{PeerQueue, PushOutcome, Router};
pub use supervisor::{Backoff, PendingOp, PendingWrites, UpstreamLink};
pub use transport::{PeerCommand, TransportError, UpstreamAction};
