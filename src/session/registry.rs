//! In-memory session registry.
//!
//! The engine task is the registry's only writer; everything else sees
//! sessions through events or owned snapshots. Persistence runs on a
//! per-session worker fed with snapshots. The worker collapses its
//! queue to the newest snapshot before each write, so saves are
//! sequenced per session and the latest state always wins.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::record::{Session, SessionId};
use super::store::SessionStore;

const SAVE_RETRY_DELAY: Duration = Duration::from_millis(500);

struct Persister {
    tx: mpsc::UnboundedSender<Session>,
    task: JoinHandle<()>,
}

pub struct Registry {
    store: Arc<SessionStore>,
    sessions: HashMap<SessionId, Session>,
    persisters: HashMap<SessionId, Persister>,
}

impl Registry {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Registry {
            store,
            sessions: HashMap::new(),
            persisters: HashMap::new(),
        }
    }

    /// Create a fresh session and durably record its birth.
    pub fn create(&mut self, session: Session) -> SessionId {
        let id = session.id.clone();
        self.sessions.insert(id.clone(), session);
        self.persist(&id);
        id
    }

    pub fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    /// Fetch a session, falling back to the store for ones not yet in
    /// memory. Unknown ids stay unknown; nothing is created here.
    pub fn ensure_loaded(&mut self, id: &SessionId) -> Option<&mut Session> {
        if !self.sessions.contains_key(id) {
            let loaded = self.store.load(id)?;
            debug!(session_id = %id, "session loaded from disk");
            self.sessions.insert(id.clone(), loaded);
        }
        self.sessions.get_mut(id)
    }

    /// Queue a durable write of the session's current state.
    ///
    /// Returns immediately; the write happens on the session's persist
    /// worker. Call after every mutation worth keeping.
    pub fn persist(&mut self, id: &SessionId) {
        let Some(session) = self.sessions.get(id) else {
            return;
        };
        let snapshot = session.clone();
        let persister = self
            .persisters
            .entry(id.clone())
            .or_insert_with(|| spawn_persister(Arc::clone(&self.store)));
        if persister.tx.send(snapshot).is_err() {
            warn!(session_id = %id, "persist worker is gone; session state stays in memory");
        }
    }

    /// Flush all persist queues and wait for them to drain.
    pub async fn shutdown(self) {
        let tasks: Vec<_> = self
            .persisters
            .into_values()
            .map(|persister| {
                drop(persister.tx);
                persister.task
            })
            .collect();
        join_all(tasks).await;
    }
}

fn spawn_persister(store: Arc<SessionStore>) -> Persister {
    let (tx, mut rx) = mpsc::unbounded_channel::<Session>();
    let task = tokio::spawn(async move {
        while let Some(mut snapshot) = rx.recv().await {
            // Collapse the queue: only the newest snapshot matters.
            while let Ok(newer) = rx.try_recv() {
                snapshot = newer;
            }
            if let Err(error) = store.save(&snapshot) {
                warn!(session_id = %snapshot.id, %error, "session save failed; retrying");
                tokio::time::sleep(SAVE_RETRY_DELAY).await;
                while let Ok(newer) = rx.try_recv() {
                    snapshot = newer;
                }
                if let Err(error) = store.save(&snapshot) {
                    warn!(
                        session_id = %snapshot.id, %error,
                        "session save failed twice; memory stays authoritative"
                    );
                }
            }
        }
    });
    Persister { tx, task }
}
