//! The per-connection protocol loop.
//!
//! Runs after auth and upgrade. Subscribes to the session's fanout before
//! sending the handshake so no update published in between can be missed,
//! then multiplexes the socket and the broadcast channel until the peer
//! disconnects. Malformed frames from an authenticated peer are logged and
//! dropped without killing the connection.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use log::{debug, warn};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::awareness::AwarenessUpdate;
use crate::protocol::Frame;
use crate::registry::Registry;
use crate::server::ServerStats;
use crate::session::DocSession;

type Ws = WebSocketStream<TokioIo<Upgraded>>;

/// Connection loop failure (socket-level; protocol errors never end up here).
#[derive(Debug)]
pub enum ConnectionError {
    Socket(String),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Socket(e) => write!(f, "socket error: {e}"),
        }
    }
}

impl std::error::Error for ConnectionError {}

pub async fn run_connection(
    ws: Ws,
    session: Arc<DocSession>,
    registry: Arc<Registry>,
    stats: Arc<ServerStats>,
    conn_id: Uuid,
) -> Result<(), ConnectionError> {
    // The registry attached this connection under its lock before handing
    // out the session. Subscribe before the handshake: anything published
    // after this point is either in the handshake diff or in the receiver's
    // backlog, never lost.
    let mut fanout_rx = session.subscribe();

    let (mut ws_tx, mut ws_rx) = ws.split();

    let mut owned_clients: HashSet<u64> = HashSet::new();

    let mut result = send_frames(&mut ws_tx, session.handshake_frames().await).await;

    if result.is_ok() {
        loop {
            tokio::select! {
                incoming = ws_rx.next() => {
                    match incoming {
                        Some(Ok(Message::Binary(data))) => {
                            stats.frames_received.fetch_add(1, Ordering::Relaxed);
                            if let Err(e) = handle_frame(
                                &data,
                                &session,
                                conn_id,
                                &mut ws_tx,
                                &mut owned_clients,
                            )
                            .await
                            {
                                result = Err(e);
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if ws_tx.send(Message::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {
                            debug!("conn {conn_id}: ignoring non-binary message");
                        }
                        Some(Err(e)) => {
                            debug!("conn {conn_id}: socket closed: {e}");
                            break;
                        }
                    }
                }
                published = fanout_rx.recv() => {
                    match published {
                        Ok((origin, _)) if origin == conn_id => {}
                        Ok((_, frame)) => {
                            if let Err(e) = ws_tx.send(Message::Binary((*frame).clone())).await {
                                result = Err(ConnectionError::Socket(e.to_string()));
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("conn {conn_id}: fanout lagged, {n} frames dropped");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }

    // Presence leaves with the connection, and peers hear about it.
    if !owned_clients.is_empty() {
        let ids: Vec<u64> = owned_clients.into_iter().collect();
        let removal = session.remove_awareness_clients(&ids).await;
        if !removal.is_empty() {
            let frame = Frame::Awareness(removal.encode()).encode();
            session.fanout().publish(conn_id, Arc::new(frame));
        }
    }

    let (remaining, epoch) = session.detach(conn_id);
    if remaining == 0 {
        // Last one out persists the document and arms eviction.
        session.flush().await;
        if let Some(epoch) = epoch {
            registry.schedule_evict(Arc::clone(&session), epoch);
        }
    }

    result
}

/// Send a batch of frames, stopping at the first failed send.
async fn send_frames(
    ws_tx: &mut (impl futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
              + Unpin),
    frames: Vec<Vec<u8>>,
) -> Result<(), ConnectionError> {
    for frame in frames {
        ws_tx
            .send(Message::Binary(frame))
            .await
            .map_err(|e| ConnectionError::Socket(e.to_string()))?;
    }
    Ok(())
}

async fn handle_frame(
    data: &[u8],
    session: &Arc<DocSession>,
    conn_id: Uuid,
    ws_tx: &mut (impl futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
              + Unpin),
    owned_clients: &mut HashSet<u64>,
) -> Result<(), ConnectionError> {
    let frame = match Frame::decode(data) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("conn {conn_id}: dropping malformed frame: {e}");
            return Ok(());
        }
    };

    match frame {
        Frame::SyncStep1(state_vector) => match session.diff_for(&state_vector).await {
            Ok(diff) => {
                let reply = Frame::SyncStep2(diff).encode();
                ws_tx
                    .send(Message::Binary(reply))
                    .await
                    .map_err(|e| ConnectionError::Socket(e.to_string()))?;
            }
            Err(e) => {
                debug!("conn {conn_id}: dropping bad state vector: {e}");
            }
        },
        Frame::SyncStep2(update) | Frame::Update(update) => {
            match session.apply_sync_update(&update).await {
                Ok(true) => {
                    let frame = Frame::Update(update).encode();
                    session.fanout().publish(conn_id, Arc::new(frame));
                }
                // Already known: idempotent merge, nothing to fan out
                Ok(false) => {}
                Err(e) => {
                    debug!("conn {conn_id}: dropping bad update: {e}");
                }
            }
        }
        Frame::Awareness(payload) => {
            let update = match AwarenessUpdate::decode(&payload) {
                Ok(update) => update,
                Err(e) => {
                    debug!("conn {conn_id}: dropping bad awareness update: {e}");
                    return Ok(());
                }
            };
            for (client_id, _) in &update.entries {
                owned_clients.insert(*client_id);
            }
            let accepted = session.apply_awareness(&update).await;
            if !accepted.is_empty() {
                let frame = Frame::Awareness(accepted.encode()).encode();
                session.fanout().publish(conn_id, Arc::new(frame));
            }
        }
    }
    Ok(())
}
