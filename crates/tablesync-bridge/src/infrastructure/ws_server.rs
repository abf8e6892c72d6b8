//! Browser WebSocket server: accept loop and per-session tasks.
//!
//! Each accepted connection becomes one session task that:
//!
//! 1. completes the WebSocket upgrade and registers a router peer;
//! 2. sends `Welcome` with the peer id and the current upstream state;
//! 3. runs three concurrent loops joined by `tokio::select!`:
//!    - **queue → browser**: drains the peer's event queue as JSON;
//!    - **browser → store**: parses commands and applies them;
//!    - **status → browser**: forwards upstream state changes;
//! 4. closes its router peer when any loop ends.
//!
//! Store fan-out only enqueues, so a stalled browser fills (and then trims)
//! its own queue without holding up anyone else.  Writes to the browser are
//! bounded by `io_timeout`; a browser that cannot keep up is disconnected.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Error as WsError, Message as WsMessage},
    WebSocketStream,
};
use tracing::{debug, error, info, warn};

use tablesync_core::WriterId;

use crate::application::bridge::SyncBridge;
use crate::application::router::PeerQueue;
use crate::application::transport::{event_to_browser, parse_browser_frame, PeerCommand};
use crate::domain::messages::BridgeToBrowserMsg;
use crate::domain::peer::PeerId;

type WsSink = Arc<Mutex<SplitSink<WebSocketStream<TcpStream>, WsMessage>>>;

// ── Public API ────────────────────────────────────────────────────────────────

/// Binds `ws_bind_addr` and serves browser sessions until `running` is cleared.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound.
pub async fn run_server(bridge: Arc<SyncBridge>, running: Arc<AtomicBool>) -> anyhow::Result<()> {
    let addr = bridge.config().ws_bind_addr;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind WebSocket listener on {addr}"))?;
    info!("WebSocket server listening on {addr}");
    serve(listener, bridge, running).await;
    Ok(())
}

/// Accept loop on an already-bound listener.
pub async fn serve(listener: TcpListener, bridge: Arc<SyncBridge>, running: Arc<AtomicBool>) {
    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping WebSocket accept loop");
            break;
        }

        match timeout(Duration::from_millis(200), listener.accept()).await {
            Ok(Ok((stream, peer_addr))) => {
                debug!("new browser connection from {peer_addr}");
                let bridge = Arc::clone(&bridge);
                tokio::spawn(async move {
                    handle_browser_session(stream, peer_addr, bridge).await;
                });
            }
            Ok(Err(e)) => error!("accept error: {e}"),
            Err(_) => {}
        }
    }
}

// ── Per-session handler ───────────────────────────────────────────────────────

async fn handle_browser_session(raw_stream: TcpStream, peer_addr: SocketAddr, bridge: Arc<SyncBridge>) {
    match run_session(raw_stream, peer_addr, bridge).await {
        Ok(()) => info!("session {peer_addr} closed"),
        Err(e) => warn!("session {peer_addr} closed with error: {e:#}"),
    }
}

async fn run_session(
    raw_stream: TcpStream,
    peer_addr: SocketAddr,
    bridge: Arc<SyncBridge>,
) -> anyhow::Result<()> {
    let config = bridge.config();
    let io_timeout = config.io_timeout;

    let ws_stream = timeout(io_timeout, accept_async(raw_stream))
        .await
        .with_context(|| format!("WebSocket handshake with {peer_addr} timed out"))?
        .with_context(|| format!("WebSocket handshake failed with {peer_addr}"))?;

    let (peer, queue) = bridge.router().register(
        peer_addr.to_string(),
        config.peer_queue_capacity,
        config.overflow_policy,
    );
    info!("session {peer_addr} established as peer {peer}");

    let (ws_tx, ws_rx) = ws_stream.split();
    let ws_tx: WsSink = Arc::new(Mutex::new(ws_tx));

    let welcome = BridgeToBrowserMsg::Welcome {
        peer_id: peer.to_string(),
        upstream: bridge.upstream_state(),
    };
    if !send_json(&ws_tx, &welcome, io_timeout).await {
        bridge.router().close(peer);
        return Ok(());
    }

    let outbound = tokio::spawn(forward_events(Arc::clone(&queue), Arc::clone(&ws_tx), io_timeout));
    let inbound = tokio::spawn(read_commands(
        ws_rx,
        Arc::clone(&ws_tx),
        Arc::clone(&bridge),
        peer,
        io_timeout,
    ));
    let status = tokio::spawn(forward_status(Arc::clone(&bridge), Arc::clone(&ws_tx), io_timeout));

    let session_id = peer.to_string();
    let (outbound_abort, inbound_abort, status_abort) =
        (outbound.abort_handle(), inbound.abort_handle(), status.abort_handle());
    tokio::select! {
        _ = outbound => debug!("session {session_id}: event forwarder ended"),
        _ = inbound => debug!("session {session_id}: browser reader ended"),
        _ = status => debug!("session {session_id}: status forwarder ended"),
    }
    outbound_abort.abort();
    inbound_abort.abort();
    status_abort.abort();

    bridge.router().close(peer);
    Ok(())
}

/// Queue → browser.  Ends when the queue is closed or a send fails.
async fn forward_events(queue: Arc<PeerQueue>, ws_tx: WsSink, io_timeout: Duration) {
    while let Some(event) = queue.recv().await {
        if !send_json(&ws_tx, &event_to_browser(&event), io_timeout).await {
            break;
        }
    }
}

/// Upstream state → browser.
async fn forward_status(bridge: Arc<SyncBridge>, ws_tx: WsSink, io_timeout: Duration) {
    let mut rx = bridge.watch_upstream();
    while rx.changed().await.is_ok() {
        let state = *rx.borrow_and_update();
        if !send_json(&ws_tx, &BridgeToBrowserMsg::UpstreamStatus { state }, io_timeout).await {
            break;
        }
    }
}

/// Browser → store.  Malformed frames are answered with `Error` and skipped.
async fn read_commands(
    mut ws_rx: futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
    ws_tx: WsSink,
    bridge: Arc<SyncBridge>,
    peer: PeerId,
    io_timeout: Duration,
) {
    let writer = WriterId::new(peer.0.to_string());
    loop {
        let ws_msg = match ws_rx.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(WsError::ConnectionClosed | WsError::Protocol(_))) | None => {
                debug!("peer {peer}: browser stream closed");
                break;
            }
            Some(Err(e)) => {
                warn!("peer {peer}: WebSocket error: {e}");
                break;
            }
        };

        let text = match ws_msg {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            WsMessage::Binary(_) => {
                warn!("peer {peer}: unexpected binary frame (ignored)");
                continue;
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
        };

        let reply = match parse_browser_frame(&text) {
            Ok(command) => handle_command(&bridge, peer, &writer, command),
            Err(e) => {
                warn!("peer {peer}: {e}");
                Some(BridgeToBrowserMsg::Error {
                    message: e.to_string(),
                })
            }
        };
        if let Some(reply) = reply {
            if !send_json(&ws_tx, &reply, io_timeout).await {
                break;
            }
        }
    }
}

/// Applies one browser command.  Returns the direct reply, if any.
fn handle_command(
    bridge: &SyncBridge,
    peer: PeerId,
    writer: &WriterId,
    command: PeerCommand,
) -> Option<BridgeToBrowserMsg> {
    debug!("peer {peer}: {command:?}");
    let failure = match command {
        PeerCommand::Subscribe(prefix) => {
            bridge
                .router()
                .subscribe_with_snapshot(bridge.store(), peer, &prefix);
            None
        }
        PeerCommand::Unsubscribe(prefix) => {
            bridge.router().unsubscribe(peer, &prefix);
            None
        }
        PeerCommand::Set { key, value } => bridge.set_from(writer, &key, value).err(),
        PeerCommand::Delete { key } => bridge.delete_from(writer, &key).err(),
        PeerCommand::Ping(token) => return Some(BridgeToBrowserMsg::Pong { token }),
    };
    failure.map(|e| BridgeToBrowserMsg::Error {
        message: e.to_string(),
    })
}

/// Serializes `msg` and sends it as a text frame.  Returns `false` if the
/// browser is gone or too slow.
async fn send_json(ws_tx: &WsSink, msg: &BridgeToBrowserMsg, io_timeout: Duration) -> bool {
    let json = match serde_json::to_string(msg) {
        Ok(json) => json,
        Err(e) => {
            error!("failed to serialize {}: {e}", msg.type_name());
            return true;
        }
    };
    let mut sink = ws_tx.lock().await;
    match timeout(io_timeout, sink.send(WsMessage::Text(json))).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("WebSocket send failed: {e}");
            false
        }
        Err(_) => {
            warn!("WebSocket send timed out; dropping browser");
            false
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
