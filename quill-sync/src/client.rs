//! A client for connecting to a sync server.
//!
//! Maintains a local replica, runs the handshake, applies remote updates and
//! ships local edits. Used by the integration tests and usable for embedding
//! (headless collaborators, bots, migration tools).

use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use log::debug;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use yrs::{ReadTxn, Transact, TransactionMut};

use crate::awareness::{AwarenessEntry, AwarenessUpdate};
use crate::doc::SharedDoc;
use crate::protocol::Frame;

/// Client-side errors.
#[derive(Debug)]
pub enum ClientError {
    Connect(String),
    Closed,
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect(e) => write!(f, "connect failed: {e}"),
            Self::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ClientError {}

/// Events surfaced to the embedder.
#[derive(Debug)]
pub enum SyncEvent {
    /// Handshake sent, socket open.
    Connected,
    /// First server diff applied; the replica has caught up.
    Synced,
    /// A remote edit was merged into the local replica.
    RemoteUpdate,
    /// Presence changed for some set of clients.
    Awareness(AwarenessUpdate),
    /// The server closed the connection.
    Disconnected,
}

pub struct SyncClient {
    doc: Arc<Mutex<SharedDoc>>,
    outgoing: mpsc::UnboundedSender<Message>,
    events: mpsc::UnboundedReceiver<SyncEvent>,
    client_id: u64,
    awareness_clock: u64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl SyncClient {
    /// Connect to `ws://host:port`, joining `doc_name` with `token`.
    pub async fn connect(
        server_url: &str,
        doc_name: &str,
        token: &str,
    ) -> Result<Self, ClientError> {
        let url = format!("{server_url}/{doc_name}?token={token}");
        let (ws, _) = connect_async(&url)
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let (mut ws_tx, mut ws_rx) = ws.split();

        let doc = Arc::new(Mutex::new(SharedDoc::new()));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<SyncEvent>();

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if ws_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });

        // Open with our own state vector so the server can diff against it.
        let sv = lock_doc(&doc).state_vector();
        out_tx
            .send(Message::Binary(Frame::SyncStep1(sv).encode()))
            .map_err(|_| ClientError::Closed)?;
        let _ = event_tx.send(SyncEvent::Connected);

        let reader_doc = Arc::clone(&doc);
        let reader_out = out_tx.clone();
        let reader = tokio::spawn(async move {
            let mut synced = false;
            while let Some(msg) = ws_rx.next().await {
                let data = match msg {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let frame = match Frame::decode(&data) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!("client: dropping malformed frame: {e}");
                        continue;
                    }
                };
                match frame {
                    Frame::SyncStep1(sv) => {
                        let reply = match lock_doc(&reader_doc).diff_since(&sv) {
                            Ok(diff) => Frame::SyncStep2(diff).encode(),
                            Err(e) => {
                                debug!("client: bad server state vector: {e}");
                                continue;
                            }
                        };
                        if reader_out.send(Message::Binary(reply)).is_err() {
                            break;
                        }
                    }
                    Frame::SyncStep2(update) => {
                        match lock_doc(&reader_doc).apply_update(&update) {
                            Ok(_) => {
                                if !synced {
                                    synced = true;
                                    let _ = event_tx.send(SyncEvent::Synced);
                                }
                            }
                            Err(e) => debug!("client: bad sync diff: {e}"),
                        }
                    }
                    Frame::Update(update) => {
                        match lock_doc(&reader_doc).apply_update(&update) {
                            Ok(true) => {
                                let _ = event_tx.send(SyncEvent::RemoteUpdate);
                            }
                            Ok(false) => {}
                            Err(e) => debug!("client: bad update: {e}"),
                        }
                    }
                    Frame::Awareness(payload) => match AwarenessUpdate::decode(&payload) {
                        Ok(update) => {
                            let _ = event_tx.send(SyncEvent::Awareness(update));
                        }
                        Err(e) => debug!("client: bad awareness update: {e}"),
                    },
                }
            }
            let _ = event_tx.send(SyncEvent::Disconnected);
        });

        Ok(Self {
            doc,
            outgoing: out_tx,
            events: event_rx,
            client_id: rand_client_id(),
            awareness_clock: 0,
            reader,
            writer,
        })
    }

    /// Mutate the local replica and ship the resulting update.
    pub fn edit<F>(&self, f: F) -> Result<(), ClientError>
    where
        F: FnOnce(&mut TransactionMut),
    {
        let doc = lock_doc(&self.doc);
        let before = doc.inner().transact().state_vector();
        {
            let mut txn = doc.inner().transact_mut();
            f(&mut txn);
        }
        let update = doc.inner().transact().encode_diff_v1(&before);
        drop(doc);
        self.outgoing
            .send(Message::Binary(Frame::Update(update).encode()))
            .map_err(|_| ClientError::Closed)
    }

    /// Advertise presence state (a JSON document, opaque to the server).
    pub fn set_awareness(&mut self, state_json: &str) -> Result<(), ClientError> {
        self.send_awareness(state_json.to_string())
    }

    /// Withdraw presence.
    pub fn clear_awareness(&mut self) -> Result<(), ClientError> {
        self.send_awareness("null".to_string())
    }

    fn send_awareness(&mut self, state: String) -> Result<(), ClientError> {
        self.awareness_clock += 1;
        let update = AwarenessUpdate {
            entries: vec![(
                self.client_id,
                AwarenessEntry { clock: self.awareness_clock, state },
            )],
        };
        self.outgoing
            .send(Message::Binary(Frame::Awareness(update.encode()).encode()))
            .map_err(|_| ClientError::Closed)
    }

    /// Next event, or `None` once disconnected and drained.
    pub async fn recv_event(&mut self) -> Option<SyncEvent> {
        self.events.recv().await
    }

    /// Presence client id used by this client.
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// Read access to the local replica.
    pub fn with_doc<R>(&self, f: impl FnOnce(&SharedDoc) -> R) -> R {
        f(&lock_doc(&self.doc))
    }

    /// Close the connection and stop the background tasks.
    pub async fn close(self) {
        let _ = self.outgoing.send(Message::Close(None));
        drop(self.outgoing);
        let _ = self.writer.await;
        self.reader.abort();
    }
}

fn lock_doc(doc: &Arc<Mutex<SharedDoc>>) -> std::sync::MutexGuard<'_, SharedDoc> {
    match doc.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn rand_client_id() -> u64 {
    // Derive from a v4 uuid; collisions across a document are negligible.
    let bytes = uuid::Uuid::new_v4();
    u64::from_le_bytes(bytes.as_bytes()[..8].try_into().unwrap_or([0; 8])) & ((1 << 53) - 1)
}
