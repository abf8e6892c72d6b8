//! TCP connection to the upstream table-sync peer.
//!
//! The bridge keeps exactly one upstream connection at a time; the
//! reconnection supervisor owns it and replaces it after every failure.
//!
//! # Binary streaming protocol
//!
//! A single `read()` may return part of a frame or several frames at once.
//! Incoming bytes are buffered and handed to [`decode_message`] until it
//! reports an incomplete frame, exactly like any other length-prefixed
//! stream reader.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use tablesync_core::protocol::messages::{DisconnectReason, MessageType};
use tablesync_core::protocol::{encode_message_now, SequenceCounter};
use tablesync_core::{decode_message, ProtocolError, SyncMessage};

/// Size of each socket read.
const READ_CHUNK: usize = 8192;

/// Transport-level failures.  Each one ends the current connection and sends
/// the supervisor back into backoff; none of them is fatal to the process.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out while {0}")]
    Timeout(&'static str),

    #[error("upstream closed the connection")]
    Closed,

    #[error("upstream disconnected: {0:?}")]
    Disconnected(DisconnectReason),

    #[error("upstream rejected the handshake (server {server_identity})")]
    Rejected { server_identity: String },

    #[error("unexpected {0:?} before handshake completed")]
    UnexpectedMessage(MessageType),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An open upstream connection, split into halves so reading and writing
/// can proceed independently.
pub struct UpstreamConnection {
    pub addr: String,
    pub read_half: OwnedReadHalf,
    pub write_half: OwnedWriteHalf,
}

impl UpstreamConnection {
    /// Resolves and connects to `addr` (`host:port`), bounded by `io_timeout`.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::Connect`] if the connection is refused or the name
    /// does not resolve, [`ConnectionError::Timeout`] if it takes too long.
    pub async fn connect(addr: &str, io_timeout: Duration) -> Result<Self, ConnectionError> {
        let stream = timeout(io_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ConnectionError::Timeout("connecting"))?
            .map_err(|source| ConnectionError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay on {addr} failed: {e}");
        }
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            addr: addr.to_string(),
            read_half,
            write_half,
        })
    }
}

// ── Reading ───────────────────────────────────────────────────────────────────

/// Reads frames from the upstream stream and forwards decoded messages on `tx`.
///
/// Returns when the peer closes the stream, a read fails, a frame cannot be
/// decoded, or the receiver is dropped.  The receiver observes all of these
/// as the channel closing.
pub async fn read_upstream_messages(mut read_half: OwnedReadHalf, tx: mpsc::Sender<SyncMessage>) {
    let mut recv_buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
    let mut read_tmp = vec![0u8; READ_CHUNK];

    loop {
        let n = match read_half.read(&mut read_tmp).await {
            Ok(0) => {
                debug!("upstream closed the stream (EOF)");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                warn!("read from upstream failed: {e}");
                return;
            }
        };
        recv_buf.extend_from_slice(&read_tmp[..n]);

        loop {
            match decode_message(&recv_buf) {
                Ok((msg, consumed)) => {
                    recv_buf.drain(..consumed);
                    debug!("upstream → {:?}", msg.message_type());
                    if tx.send(msg).await.is_err() {
                        return;
                    }
                }
                Err(e) if e.is_incomplete() => break,
                Err(e) => {
                    warn!("undecodable frame from upstream: {e}");
                    return;
                }
            }
        }
    }
}

// ── Writing ───────────────────────────────────────────────────────────────────

/// Encodes `msg` and writes the whole frame, bounded by `io_timeout`.
///
/// # Errors
///
/// [`ConnectionError::Protocol`] if the message cannot be encoded,
/// [`ConnectionError::Io`] or [`ConnectionError::Timeout`] if the write fails.
pub async fn write_upstream_message(
    write_half: &mut OwnedWriteHalf,
    msg: &SyncMessage,
    seq: &SequenceCounter,
    io_timeout: Duration,
) -> Result<(), ConnectionError> {
    let bytes = encode_message_now(msg, seq.next())?;
    timeout(io_timeout, write_half.write_all(&bytes))
        .await
        .map_err(|_| ConnectionError::Timeout("writing to upstream"))??;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
