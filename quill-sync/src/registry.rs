//! Registry of open document sessions.
//!
//! `get_or_create` is the only way a session comes into existence, and it
//! holds the registry lock across the storage load, so concurrent connects
//! to the same name observe exactly one session and exactly one load.
//! Sessions are evicted after sitting idle with no connections, unless a
//! write-back is still outstanding or a connection re-attached in the
//! meantime.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::doc::SharedDoc;
use crate::session::DocSession;
use crate::storage::SnapshotStore;

pub struct Registry {
    sessions: Mutex<HashMap<String, Arc<DocSession>>>,
    store: Option<Arc<dyn SnapshotStore>>,
    broadcast_capacity: usize,
    idle_evict: Duration,
}

impl Registry {
    pub fn new(
        store: Option<Arc<dyn SnapshotStore>>,
        broadcast_capacity: usize,
        idle_evict: Duration,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            store,
            broadcast_capacity,
            idle_evict,
        }
    }

    /// Fetch the session for `name` and attach `conn_id` to it, loading the
    /// document from storage on first use.
    ///
    /// Attaching happens inside the registry critical section: a pending
    /// idle eviction also takes this lock and re-checks the connection
    /// count, so it can never remove a session between lookup and attach.
    ///
    /// Load failures fall back to a fresh document: a storage outage must
    /// not block collaboration, and the write-back path will repair the
    /// stored copy once it recovers. Corrupt snapshots are treated the same
    /// way, loudly.
    pub async fn get_or_create(&self, name: &str, conn_id: Uuid) -> Arc<DocSession> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(name) {
            session.attach(conn_id);
            return Arc::clone(session);
        }

        let doc = match &self.store {
            Some(store) => match store.load(name) {
                Ok(Some(snapshot)) => match SharedDoc::from_snapshot(&snapshot) {
                    Ok(doc) => {
                        info!("doc '{}': loaded {} byte snapshot", name, snapshot.len());
                        doc
                    }
                    Err(e) => {
                        warn!("doc '{}': stored snapshot unusable, starting fresh: {}", name, e);
                        SharedDoc::new()
                    }
                },
                Ok(None) => SharedDoc::new(),
                Err(e) => {
                    warn!("doc '{}': storage load failed, starting fresh: {}", name, e);
                    SharedDoc::new()
                }
            },
            None => SharedDoc::new(),
        };

        let session = Arc::new(DocSession::new(
            name.to_string(),
            doc,
            self.store.clone(),
            self.broadcast_capacity,
        ));
        session.attach(conn_id);
        sessions.insert(name.to_string(), Arc::clone(&session));
        session
    }

    /// Arm delayed eviction for a session whose last connection just left.
    ///
    /// `epoch` is the detach epoch handed out by [`DocSession::detach`]. The
    /// eviction fires only if, after the idle window, the session is still
    /// empty, still clean, and nobody detached-to-empty again since (which
    /// would have armed its own timer).
    pub fn schedule_evict(self: &Arc<Self>, session: Arc<DocSession>, epoch: u64) {
        let registry = Arc::clone(self);
        let idle = self.idle_evict;
        tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            registry.try_evict(&session, epoch).await;
        });
    }

    async fn try_evict(&self, session: &Arc<DocSession>, epoch: u64) {
        let mut sessions = self.sessions.lock().await;
        if session.detach_epoch() != epoch || session.conn_count() > 0 {
            return;
        }
        if session.has_unsaved() {
            // A write-back is still pending or failing; keep the session
            // resident so no acknowledged update can be lost.
            warn!("doc '{}': eviction deferred, unsaved changes", session.name());
            return;
        }
        if sessions.remove(session.name()).is_some() {
            info!("doc '{}': evicted after idle", session.name());
        }
    }

    /// Number of resident sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Flush every dirty session. Used at shutdown.
    pub async fn flush_all(&self) {
        let sessions: Vec<Arc<DocSession>> =
            self.sessions.lock().await.values().cloned().collect();
        for session in sessions {
            session.flush().await;
        }
    }
}
