//! Per-document session: the single authoritative replica plus everything
//! that hangs off it (awareness table, fanout channel, attached connections,
//! write-back bookkeeping).
//!
//! A session is created by the registry on first attach and reused by every
//! later connection to the same document. Sync updates mutate the replica
//! under a mutex and are persisted fire-and-forget; the `change_gen` /
//! `saved_gen` pair tracks whether a write-back is still outstanding.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::awareness::{AwarenessTable, AwarenessUpdate};
use crate::broadcast::{BroadcastGroup, Envelope};
use crate::doc::{DocError, SharedDoc};
use crate::protocol::Frame;
use crate::storage::SnapshotStore;

/// Shared state for one open document.
pub struct DocSession {
    name: String,
    doc: tokio::sync::Mutex<SharedDoc>,
    awareness: tokio::sync::Mutex<AwarenessTable>,
    broadcast: BroadcastGroup,
    conns: Mutex<HashSet<Uuid>>,
    /// Bumped on every state-changing update.
    change_gen: AtomicU64,
    /// Highest generation known to be persisted.
    saved_gen: AtomicU64,
    /// Bumped when the last connection detaches; guards delayed eviction.
    detach_epoch: AtomicU64,
    store: Option<Arc<dyn SnapshotStore>>,
}

impl DocSession {
    pub fn new(
        name: String,
        doc: SharedDoc,
        store: Option<Arc<dyn SnapshotStore>>,
        broadcast_capacity: usize,
    ) -> Self {
        Self {
            name,
            doc: tokio::sync::Mutex::new(doc),
            awareness: tokio::sync::Mutex::new(AwarenessTable::new()),
            broadcast: BroadcastGroup::new(broadcast_capacity),
            conns: Mutex::new(HashSet::new()),
            change_gen: AtomicU64::new(0),
            saved_gen: AtomicU64::new(0),
            detach_epoch: AtomicU64::new(0),
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a connection. Returns the attached count.
    pub fn attach(&self, conn_id: Uuid) -> usize {
        let mut conns = lock_unpoisoned(&self.conns);
        conns.insert(conn_id);
        conns.len()
    }

    /// Deregister a connection. Returns the remaining count and, when it hit
    /// zero, the new detach epoch to arm eviction with.
    pub fn detach(&self, conn_id: Uuid) -> (usize, Option<u64>) {
        let mut conns = lock_unpoisoned(&self.conns);
        conns.remove(&conn_id);
        let remaining = conns.len();
        drop(conns);
        if remaining == 0 {
            let epoch = self.detach_epoch.fetch_add(1, Ordering::SeqCst) + 1;
            (0, Some(epoch))
        } else {
            (remaining, None)
        }
    }

    pub fn conn_count(&self) -> usize {
        lock_unpoisoned(&self.conns).len()
    }

    pub fn detach_epoch(&self) -> u64 {
        self.detach_epoch.load(Ordering::SeqCst)
    }

    /// Subscribe to the document's fanout channel. Connections subscribe
    /// before sending their handshake so no concurrent update slips between
    /// the initial diff and the live stream.
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.broadcast.subscribe()
    }

    pub fn fanout(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    /// Frames opening the handshake on a new connection: our state vector,
    /// then the current awareness snapshot when anyone is present.
    pub async fn handshake_frames(&self) -> Vec<Vec<u8>> {
        let sv = self.doc.lock().await.state_vector();
        let mut frames = vec![Frame::SyncStep1(sv).encode()];
        let awareness = self.awareness.lock().await;
        if !awareness.is_empty() {
            frames.push(Frame::Awareness(awareness.snapshot().encode()).encode());
        }
        frames
    }

    /// Diff bringing a peer at `state_vector` up to date.
    pub async fn diff_for(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocError> {
        self.doc.lock().await.diff_since(state_vector)
    }

    /// Merge a peer's update into the replica.
    ///
    /// Returns `true` when the update changed state; the caller then fans the
    /// frame out and this session schedules a write-back.
    pub async fn apply_sync_update(self: &Arc<Self>, update: &[u8]) -> Result<bool, DocError> {
        let changed = self.doc.lock().await.apply_update(update)?;
        if changed {
            self.change_gen.fetch_add(1, Ordering::SeqCst);
            self.schedule_write_back();
        }
        Ok(changed)
    }

    /// Merge an awareness update; returns the accepted entries for rebroadcast.
    pub async fn apply_awareness(&self, update: &AwarenessUpdate) -> AwarenessUpdate {
        self.awareness.lock().await.apply(update)
    }

    /// Drop a departed connection's clients; returns the removal to broadcast.
    pub async fn remove_awareness_clients(&self, client_ids: &[u64]) -> AwarenessUpdate {
        self.awareness.lock().await.remove_clients(client_ids)
    }

    pub async fn awareness_len(&self) -> usize {
        self.awareness.lock().await.len()
    }

    /// Whether a state change has not yet been confirmed persisted.
    pub fn has_unsaved(&self) -> bool {
        self.change_gen.load(Ordering::SeqCst) > self.saved_gen.load(Ordering::SeqCst)
    }

    /// Fire-and-forget write-back of the full current state.
    ///
    /// Failures are logged and the dirty marker stays set; the session is
    /// retried on the next change and on final detach, and is never evicted
    /// while dirty.
    fn schedule_write_back(self: &Arc<Self>) {
        let Some(store) = self.store.clone() else {
            // No storage configured: nothing can be outstanding
            self.saved_gen
                .store(self.change_gen.load(Ordering::SeqCst), Ordering::SeqCst);
            return;
        };
        let session = Arc::clone(self);
        tokio::spawn(async move {
            session.write_back(store).await;
        });
    }

    /// Persist the current full state, synchronously from the caller's view.
    pub async fn flush(self: &Arc<Self>) {
        if let Some(store) = self.store.clone() {
            if self.has_unsaved() {
                self.write_back(store).await;
            }
        }
    }

    async fn write_back(self: &Arc<Self>, store: Arc<dyn SnapshotStore>) {
        let generation = self.change_gen.load(Ordering::SeqCst);
        let snapshot = self.doc.lock().await.encode_full_state();
        let name = self.name.clone();
        let result =
            tokio::task::spawn_blocking(move || store.save(&name, &snapshot)).await;
        match result {
            Ok(Ok(())) => {
                self.saved_gen.fetch_max(generation, Ordering::SeqCst);
                debug!("doc '{}': persisted generation {}", self.name, generation);
            }
            Ok(Err(e)) => {
                warn!("doc '{}': write-back failed, will retry: {}", self.name, e);
            }
            Err(e) => {
                warn!("doc '{}': write-back task failed: {}", self.name, e);
            }
        }
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
