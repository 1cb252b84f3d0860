//! Registry of live control sessions, keyed by agent id.
//!
//! At most one session per agent: inserting a handle for an already
//! connected agent returns the superseded handle so the caller can tear it
//! down. Removal is conditional on the session identity, never on the
//! agent id alone, so a late cleanup can't evict a successor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tracing::debug;

use qtun_core::forward::AgentId;
use qtun_core::protocol::Message;
use qtun_core::{Error, Result};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Commands delivered to a session task from outside its socket.
#[derive(Debug)]
pub(crate) enum SessionCommand {
    /// Re-read the catalog, reconcile listeners, push `config_update`.
    Reload,
}

/// Handle to a live control session, shared with listeners and engines.
pub(crate) struct SessionHandle {
    pub session_id: u64,
    pub agent_id: AgentId,
    pub agent_name: String,
    outbox: mpsc::Sender<Message>,
    commands: mpsc::Sender<SessionCommand>,
    shutdown: watch::Sender<bool>,
}

impl SessionHandle {
    pub fn new(
        agent_id: AgentId,
        agent_name: String,
        outbox: mpsc::Sender<Message>,
        commands: mpsc::Sender<SessionCommand>,
        shutdown: watch::Sender<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            agent_id,
            agent_name,
            outbox,
            commands,
            shutdown,
        })
    }

    /// Queue a message for the session's writer task.
    pub async fn send(&self, msg: Message) -> Result<()> {
        self.outbox
            .send(msg)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Ask the session task to reconcile against the catalog.
    pub async fn request_reload(&self) -> Result<()> {
        self.commands
            .send(SessionCommand::Reload)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Signal the session task to tear down.
    pub fn signal_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Map of connected agents to their session handles.
#[derive(Default)]
pub(crate) struct AgentRegistry {
    inner: Mutex<HashMap<AgentId, Arc<SessionHandle>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, returning the superseded one if the agent was
    /// already connected.
    pub fn insert(&self, handle: Arc<SessionHandle>) -> Option<Arc<SessionHandle>> {
        let mut map = self.inner.lock().expect("registry mutex poisoned");
        map.insert(handle.agent_id, handle)
    }

    pub fn get(&self, agent_id: AgentId) -> Option<Arc<SessionHandle>> {
        let map = self.inner.lock().expect("registry mutex poisoned");
        map.get(&agent_id).cloned()
    }

    /// Remove the agent's entry only if it still refers to `session_id`.
    pub fn remove_if(&self, agent_id: AgentId, session_id: u64) -> bool {
        let mut map = self.inner.lock().expect("registry mutex poisoned");
        match map.get(&agent_id) {
            Some(current) if current.session_id == session_id => {
                map.remove(&agent_id);
                true
            }
            _ => {
                debug!(agent = %agent_id, session_id, "Stale registry removal skipped");
                false
            }
        }
    }

    pub fn connected_count(&self) -> usize {
        self.inner.lock().expect("registry mutex poisoned").len()
    }
}
