//! Reconnection supervisor for the upstream link.
//!
//! ```text
//!   Disconnected ──backoff──▶ Connecting ──HelloAck──▶ Connected
//!        ▲                        │                        │
//!        └──────── failure ───────┴──────── failure ───────┘
//! ```
//!
//! On every transition to `Connected` the supervisor performs a full resync:
//!
//! - **client role**: waits for the upstream `Snapshot` and makes the local
//!   store match it ([`TableStore::resync`]);
//! - **source role**: sends the whole local store as a `Snapshot`.
//!
//! Local writes (host API and browsers) are recorded in [`PendingWrites`]
//! and sent from there.  While the link is down they accumulate, coalesced
//! per key, and are replayed once the resync has completed.  Writes that
//! arrive *from* upstream are applied to the store directly and never enter
//! `PendingWrites`, so they are not echoed back.
//!
//! State changes are published on a `tokio::sync::watch` channel; browser
//! sessions forward them as `UpstreamStatus` messages.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use tablesync_core::protocol::messages::{DisconnectReason, ErrorCode, ErrorMessage};
use tablesync_core::protocol::{SequenceCounter, SyncRole};
use tablesync_core::{StorageError, SyncMessage, TableStore, Value, WriterId};

use crate::application::transport::{
    hello_message, source_snapshot_frames, upstream_to_action, UpstreamAction,
};
use crate::domain::config::{BackoffConfig, BridgeConfig, ConnectTarget};
use crate::domain::peer::ConnectionState;
use crate::infrastructure::upstream_conn::{
    read_upstream_messages, write_upstream_message, ConnectionError, UpstreamConnection,
};

/// How often blocking waits re-check the shutdown flag.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

// ── Backoff ───────────────────────────────────────────────────────────────────

/// Exponential reconnect delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let factor = self.config.factor.max(1.0).powi(self.attempt.min(63) as i32);
        let secs = (self.config.initial.as_secs_f64() * factor).min(self.config.max.as_secs_f64());
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Called after a successful connection.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

// ── Pending writes ────────────────────────────────────────────────────────────

/// A local change waiting to be sent upstream.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOp {
    Set(Value),
    Delete,
}

impl PendingOp {
    fn to_message(&self, key: &str) -> SyncMessage {
        match self {
            PendingOp::Set(value) => SyncMessage::EntryUpdate(
                tablesync_core::protocol::messages::EntryRecord {
                    key: key.to_string(),
                    value: value.clone(),
                    version: 0,
                },
            ),
            PendingOp::Delete => SyncMessage::EntryDelete {
                key: key.to_string(),
                version: 0,
            },
        }
    }
}

/// Bounded, per-key coalescing buffer of local writes.
///
/// A later write to a key replaces the pending one in place, so the buffer
/// holds at most one operation per key and keeps the order in which keys
/// were first written.  When a write for a new key arrives at the limit,
/// the oldest key's operation is discarded.
#[derive(Debug)]
pub struct PendingWrites {
    order: VecDeque<String>,
    ops: HashMap<String, PendingOp>,
    limit: usize,
    discarded: u64,
}

impl PendingWrites {
    pub fn new(limit: usize) -> Self {
        Self {
            order: VecDeque::new(),
            ops: HashMap::new(),
            limit: limit.max(1),
            discarded: 0,
        }
    }

    /// Records `op` for `key`, replacing any pending operation for it.
    pub fn push(&mut self, key: &str, op: PendingOp) {
        if let Some(existing) = self.ops.get_mut(key) {
            *existing = op;
            return;
        }
        if self.ops.len() >= self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.ops.remove(&oldest);
                self.discarded += 1;
                warn!("pending write buffer full; discarded write to {oldest:?}");
            }
        }
        self.order.push_back(key.to_string());
        self.ops.insert(key.to_string(), op);
    }

    /// Takes every pending operation in first-write order.
    pub fn drain(&mut self) -> Vec<(String, PendingOp)> {
        let mut ops = std::mem::take(&mut self.ops);
        self.order
            .drain(..)
            .filter_map(|key| ops.remove(&key).map(|op| (key, op)))
            .collect()
    }

    /// Puts back operations that could not be sent, ahead of newer ones.
    ///
    /// A key written again since the drain keeps its newer operation.
    pub fn restore(&mut self, unsent: Vec<(String, PendingOp)>) {
        for (key, op) in unsent.into_iter().rev() {
            if self.ops.contains_key(&key) {
                continue;
            }
            self.order.push_front(key.clone());
            self.ops.insert(key, op);
        }
        while self.ops.len() > self.limit {
            let Some(newest) = self.order.pop_back() else {
                break;
            };
            self.ops.remove(&newest);
            self.discarded += 1;
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.ops.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Operations discarded because the buffer was full.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}

// ── Shared link state ─────────────────────────────────────────────────────────

/// The part of the supervisor the rest of the bridge talks to: connection
/// state and the outbound write buffer.
pub struct UpstreamLink {
    state: watch::Sender<ConnectionState>,
    pending: Mutex<PendingWrites>,
    wake: Notify,
}

impl UpstreamLink {
    pub fn new(pending_limit: usize) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            pending: Mutex::new(PendingWrites::new(pending_limit)),
            wake: Notify::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// A receiver that observes every state change.
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!("upstream {next}");
        }
    }

    /// Queues a local change for delivery upstream.
    pub fn enqueue(&self, key: &str, op: PendingOp) {
        self.pending.lock().push(key, op);
        self.wake.notify_one();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Takes every queued write in first-write order.
    pub(crate) fn drain_pending(&self) -> Vec<(String, PendingOp)> {
        self.pending.lock().drain()
    }

    fn has_pending(&self, key: &str) -> bool {
        self.pending.lock().contains(key)
    }
}

// ── Supervisor ────────────────────────────────────────────────────────────────

/// Owns the upstream connection for the lifetime of the bridge.
pub struct Supervisor {
    store: TableStore,
    link: Arc<UpstreamLink>,
    target: ConnectTarget,
    role: SyncRole,
    identity: String,
    io_timeout: Duration,
    ping_interval: Duration,
    ping_timeout: Duration,
    tombstone_ttl: Duration,
    backoff: Backoff,
    running: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(
        config: &BridgeConfig,
        target: ConnectTarget,
        store: TableStore,
        link: Arc<UpstreamLink>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            store,
            link,
            target,
            role: config.role,
            identity: config.identity.clone(),
            io_timeout: config.io_timeout,
            ping_interval: config.ping_interval,
            ping_timeout: config.ping_timeout,
            tombstone_ttl: config.tombstone_ttl,
            backoff: Backoff::new(config.backoff.clone()),
            running,
        }
    }

    /// Runs until the shutdown flag is cleared.
    ///
    /// Candidates are tried round-robin; every failure waits one backoff
    /// delay before the next attempt.
    pub async fn run(mut self) {
        let candidates = self.target.candidates();
        info!("upstream supervisor started for {}", self.target);
        let mut next = 0usize;

        while self.running.load(Ordering::SeqCst) {
            let addr = candidates[next % candidates.len()].clone();
            next = next.wrapping_add(1);

            self.link.set_state(ConnectionState::Connecting);
            match self.run_connection(&addr).await {
                Ok(()) => info!("upstream connection to {addr} closed"),
                Err(e) => warn!("upstream {addr}: {e}"),
            }
            self.link.set_state(ConnectionState::Disconnected);

            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            let delay = self.backoff.next_delay();
            debug!("reconnecting in {delay:?} (attempt {})", self.backoff.attempt());
            self.pause(delay).await;
        }
        self.link.set_state(ConnectionState::Disconnected);
        info!("upstream supervisor stopped");
    }

    /// Sleeps for `delay` in short steps so shutdown is not held up.
    async fn pause(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        while self.running.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.collect_garbage();
            sleep((deadline - now).min(POLL_INTERVAL)).await;
        }
    }

    fn collect_garbage(&self) {
        self.store.collect_garbage(self.tombstone_ttl);
    }

    /// One connection from connect to failure (or clean shutdown).
    async fn run_connection(&mut self, addr: &str) -> Result<(), ConnectionError> {
        let conn = UpstreamConnection::connect(addr, self.io_timeout).await?;
        let mut write_half = conn.write_half;
        let seq = SequenceCounter::new();
        let (tx, mut rx) = mpsc::channel::<SyncMessage>(256);
        let reader = tokio::spawn(read_upstream_messages(conn.read_half, tx));

        let result = self.drive(addr, &mut write_half, &seq, &mut rx).await;

        reader.abort();
        result
    }

    async fn drive(
        &mut self,
        addr: &str,
        write_half: &mut tokio::net::tcp::OwnedWriteHalf,
        seq: &SequenceCounter,
        rx: &mut mpsc::Receiver<SyncMessage>,
    ) -> Result<(), ConnectionError> {
        let io_timeout = self.io_timeout;

        // ── Handshake ─────────────────────────────────────────────────────────
        write_upstream_message(write_half, &hello_message(&self.identity, self.role), seq, io_timeout)
            .await?;
        let upstream = match recv_within(rx, io_timeout, "waiting for HelloAck").await? {
            SyncMessage::HelloAck(ack) if ack.accepted => WriterId::new(ack.server_identity),
            SyncMessage::HelloAck(ack) => {
                return Err(ConnectionError::Rejected {
                    server_identity: ack.server_identity,
                })
            }
            SyncMessage::Disconnect { reason } => return Err(ConnectionError::Disconnected(reason)),
            other => {
                return Err(ConnectionError::UnexpectedMessage(other.message_type()));
            }
        };
        self.link.set_state(ConnectionState::Connected);
        self.backoff.reset();
        info!("connected to upstream {upstream} at {addr} as {:?}", self.role);

        // ── Resync ────────────────────────────────────────────────────────────
        match self.role {
            SyncRole::Client => loop {
                let msg = recv_within(rx, io_timeout, "waiting for snapshot").await?;
                match upstream_to_action(msg) {
                    UpstreamAction::Resync(snapshot) => {
                        self.apply_snapshot(snapshot, &upstream);
                        break;
                    }
                    action => {
                        if let Some(reply) = self.apply(action, &upstream)? {
                            write_upstream_message(write_half, &reply, seq, io_timeout).await?;
                        }
                    }
                }
            },
            SyncRole::Source => {
                for frame in source_snapshot_frames(&self.store.snapshot("")) {
                    write_upstream_message(write_half, &frame, seq, io_timeout).await?;
                }
            }
        }

        // ── Replay + steady state ─────────────────────────────────────────────
        self.flush_pending(write_half, seq).await?;

        let mut ping = interval(self.ping_interval.max(Duration::from_millis(10)));
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;
        let mut poll = interval(POLL_INTERVAL);
        let mut token: u64 = 0;
        let mut last_heard = Instant::now();

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        return Err(ConnectionError::Closed);
                    };
                    last_heard = Instant::now();
                    if let Some(reply) = self.apply(upstream_to_action(msg), &upstream)? {
                        write_upstream_message(write_half, &reply, seq, io_timeout).await?;
                    }
                }
                _ = self.link.wake.notified() => {
                    self.flush_pending(write_half, seq).await?;
                }
                _ = ping.tick() => {
                    token = token.wrapping_add(1);
                    write_upstream_message(write_half, &SyncMessage::Ping(token), seq, io_timeout).await?;
                }
                _ = poll.tick() => {
                    if last_heard.elapsed() > self.ping_timeout {
                        return Err(ConnectionError::Timeout("waiting for upstream keepalive"));
                    }
                    if !self.running.load(Ordering::SeqCst) {
                        let bye = SyncMessage::Disconnect { reason: DisconnectReason::UserInitiated };
                        // Best effort: we are leaving either way.
                        let _ = write_upstream_message(write_half, &bye, seq, io_timeout).await;
                        return Ok(());
                    }
                    self.collect_garbage();
                }
            }
        }
    }

    /// Sends every pending write, putting back whatever could not be sent.
    async fn flush_pending(
        &self,
        write_half: &mut tokio::net::tcp::OwnedWriteHalf,
        seq: &SequenceCounter,
    ) -> Result<(), ConnectionError> {
        let batch = self.link.drain_pending();
        if batch.is_empty() {
            return Ok(());
        }
        debug!("sending {} pending write(s) upstream", batch.len());
        let mut sent = 0;
        for (key, op) in &batch {
            if let Err(e) =
                write_upstream_message(write_half, &op.to_message(key), seq, self.io_timeout).await
            {
                let unsent = batch[sent..].to_vec();
                self.link.pending.lock().restore(unsent);
                return Err(e);
            }
            sent += 1;
        }
        Ok(())
    }

    /// Makes the store match an upstream snapshot, leaving keys that still
    /// have a local write queued as they are.
    fn apply_snapshot(&self, snapshot: Vec<(String, Value)>, upstream: &WriterId) {
        let events = self
            .store
            .resync(snapshot, upstream, |key| self.link.has_pending(key));
        info!("resync complete: {} change(s)", events.len());
    }

    /// Applies one upstream action to the store.  Returns a message to send
    /// back, if any.
    fn apply(
        &self,
        action: UpstreamAction,
        upstream: &WriterId,
    ) -> Result<Option<SyncMessage>, ConnectionError> {
        match action {
            UpstreamAction::Apply { key, value } => {
                let result = match self.role {
                    SyncRole::Client => self.store.set_authoritative(&key, value, upstream),
                    SyncRole::Source => self.store.set(&key, value, upstream),
                };
                Ok(result.err().map(|e| {
                    warn!("rejected upstream write to {key:?}: {e}");
                    error_reply(&e)
                }))
            }
            UpstreamAction::Remove { key } => Ok(self
                .store
                .delete(&key, upstream)
                .err()
                .map(|e| {
                    warn!("rejected upstream delete of {key:?}: {e}");
                    error_reply(&e)
                })),
            UpstreamAction::Resync(snapshot) => {
                self.apply_snapshot(snapshot, upstream);
                Ok(None)
            }
            UpstreamAction::Reply(msg) => Ok(Some(msg)),
            UpstreamAction::KeepaliveAck(token) => {
                debug!("keepalive {token} acknowledged");
                Ok(None)
            }
            UpstreamAction::Closed(reason) => Err(ConnectionError::Disconnected(reason)),
            UpstreamAction::PeerError(err) => {
                warn!("upstream reported {:?}: {}", err.code, err.description);
                Ok(None)
            }
            UpstreamAction::Handshake { .. } | UpstreamAction::Ignore => Ok(None),
        }
    }
}

/// Waits for the next upstream message, bounded by `limit`.
async fn recv_within(
    rx: &mut mpsc::Receiver<SyncMessage>,
    limit: Duration,
    what: &'static str,
) -> Result<SyncMessage, ConnectionError> {
    match timeout(limit, rx.recv()).await {
        Ok(Some(msg)) => Ok(msg),
        Ok(None) => Err(ConnectionError::Closed),
        Err(_) => Err(ConnectionError::Timeout(what)),
    }
}

fn error_reply(err: &StorageError) -> SyncMessage {
    let code = match err {
        StorageError::InvalidKey { .. } => ErrorCode::InvalidKey,
        StorageError::TypeMismatch { .. } => ErrorCode::TypeMismatch,
        StorageError::CapacityExceeded { .. } => ErrorCode::InternalError,
    };
    SyncMessage::Error(ErrorMessage {
        code,
        description: err.to_string(),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
