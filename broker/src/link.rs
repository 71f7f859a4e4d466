//! # Agent Link Handler
//!
//! One per connected agent: upgrades the WebSocket, registers the link in
//! the agent directory (displacing any previous link for the same id),
//! runs the read pump on the accepting task and a write pump draining the
//! bounded send queue, and sweeps the route table on disconnect.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use lattice_protocol::{marshal, unmarshal, TunnelMessage};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::router;
use crate::state::AppState;

/// Outbound frame queue depth per link.
pub const SEND_QUEUE_DEPTH: usize = 512;

/// Handle to one agent's live connection.
pub struct AgentLink {
    pub agent_id: String,
    /// Short id correlating log lines for this connection.
    pub conn_id: String,
    /// Peer address, handed to the load balancer on resolution.
    pub peer_ip: String,
    tx: tokio::sync::mpsc::Sender<Bytes>,
    closing: CancellationToken,
    dropped_sends: AtomicU64,
    invalid_frames: AtomicU64,
}

impl AgentLink {
    /// Marshals and enqueues a message. A full queue drops the frame and
    /// reports `false`; the frame buffer is released by the drop.
    pub fn send(&self, msg: &TunnelMessage) -> bool {
        match marshal(msg) {
            Ok(frame) => self.send_raw(frame),
            Err(e) => {
                warn!(agent = %self.agent_id, error = %e, "marshal failed");
                false
            }
        }
    }

    /// Enqueues an already-framed message. Forwarded frames share their
    /// backing buffer by refcount, so this never copies.
    pub fn send_raw(&self, frame: Bytes) -> bool {
        if self.tx.try_send(frame).is_err() {
            self.dropped_sends.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Frames dropped on a full send queue.
    pub fn dropped_sends(&self) -> u64 {
        self.dropped_sends.load(Ordering::Relaxed)
    }

    /// Tears the connection down; both pumps observe the token.
    pub fn close(&self) {
        self.closing.cancel();
    }
}

#[derive(Deserialize)]
pub struct LinkParams {
    client_id: Option<String>,
}

/// `GET /ws?client_id=<agent id>` — upgrades to the agent control link.
/// A missing agent id is refused before the upgrade.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<LinkParams>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    let Some(agent_id) = params.client_id.filter(|id| !id.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "missing client_id").into_response();
    };
    ws.on_upgrade(move |socket| handle_link(socket, agent_id, peer, state))
}

/// Full lifecycle of one agent connection: register (displacing any older
/// link for the same agent id), pump frames, clean up on disconnect.
async fn handle_link(socket: WebSocket, agent_id: String, peer: SocketAddr, state: AppState) {
    let conn_id = Uuid::new_v4().to_string()[..8].to_string();
    info!(agent = %agent_id, conn = %conn_id, %peer, "agent connected");

    let (tx, mut rx) = tokio::sync::mpsc::channel::<Bytes>(SEND_QUEUE_DEPTH);
    let closing = CancellationToken::new();
    let link = Arc::new(AgentLink {
        agent_id: agent_id.clone(),
        conn_id: conn_id.clone(),
        peer_ip: peer.ip().to_string(),
        tx,
        closing: closing.clone(),
        dropped_sends: AtomicU64::new(0),
        invalid_frames: AtomicU64::new(0),
    });

    // A reconnecting agent displaces its old link: close the stale
    // connection, then install the new one.
    if let Some(old) = state.agents.insert(agent_id.clone(), link.clone()) {
        info!(agent = %agent_id, old_conn = %old.conn_id, "displacing previous link");
        old.close();
    }

    let (mut sink, mut stream) = socket.split();

    // Write pump: sole owner of the socket's send half.
    let write_token = closing.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = write_token.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        if sink.send(Message::Binary(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = sink.close().await;
    });

    // Read pump on the accepting task.
    loop {
        tokio::select! {
            _ = closing.cancelled() => break,
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Binary(frame))) => match unmarshal(&frame) {
                    Ok(msg) => router::dispatch(&state, &link, msg, frame).await,
                    Err(e) => {
                        link.invalid_frames.fetch_add(1, Ordering::Relaxed);
                        debug!(agent = %agent_id, error = %e, "invalid frame dropped");
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // text/ping/pong: not part of the protocol
                Some(Err(e)) => {
                    debug!(agent = %agent_id, error = %e, "read error");
                    break;
                }
            },
        }
    }

    closing.cancel();
    let _ = writer.await;

    router::cleanup_agent(&state, &link);

    // Only remove the directory entry if it still points at this link; a
    // displaced link must not evict its successor.
    state
        .agents
        .remove_if(&agent_id, |_, current| Arc::ptr_eq(current, &link));

    info!(
        agent = %agent_id,
        conn = %conn_id,
        dropped_sends = link.dropped_sends(),
        invalid_frames = link.invalid_frames.load(Ordering::Relaxed),
        "agent disconnected"
    );
}
