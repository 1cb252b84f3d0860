//! Table of connections awaiting their twin data connection.
//!
//! An entry is created when the server has one side of a future pair (a
//! user socket on a forward listener, or a freshly dialed target for the
//! reverse modes) and is removed by exactly one of: the data-connection
//! join, the waiter's deadline, or session teardown. Whichever runs first
//! wins; the losers are no-ops.
//!
//! The waiting task keeps owning its socket; the entry only stores a
//! `oneshot::Sender` through which the joined twin (stream plus any bytes
//! that followed its `data_connection` frame) is handed over. Entries carry
//! an epoch, and the guard's removal is compare-and-delete on (id, epoch),
//! so a timeout firing after an id has been claimed and reused can never
//! delete the wrong entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::debug;

use qtun_core::forward::{AgentId, ForwardId};
use qtun_core::protocol::ConnectionId;
use qtun_core::{Error, Result};

/// A joined data connection: the socket and any residual payload bytes
/// buffered behind its first frame.
#[derive(Debug)]
pub struct DataConn {
    pub stream: TcpStream,
    pub residual: BytesMut,
}

/// Outcome of a SOCKS5 dial reported by the agent.
pub(crate) type ReadyOutcome = std::result::Result<(), String>;

struct Entry {
    epoch: u64,
    session_id: u64,
    forward_id: ForwardId,
    agent_id: AgentId,
    data_tx: oneshot::Sender<DataConn>,
    ready_tx: Option<oneshot::Sender<ReadyOutcome>>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<ConnectionId, Entry>,
}

/// Shared pending-connection table.
#[derive(Clone, Default)]
pub struct PendingTable {
    inner: Arc<Mutex<Inner>>,
    next_epoch: Arc<AtomicU64>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert-if-absent. Returns a guard that removes the entry on drop
    /// (epoch-checked) and the receiver for the twin connection.
    pub(crate) fn register(
        &self,
        id: ConnectionId,
        agent_id: AgentId,
        session_id: u64,
        forward_id: ForwardId,
    ) -> Result<(PendingGuard, oneshot::Receiver<DataConn>)> {
        let (guard, data_rx, _) = self.register_inner(id, agent_id, session_id, forward_id, false)?;
        Ok((guard, data_rx))
    }

    /// Like [`register`], additionally wiring a ready-signal channel for
    /// the SOCKS5 engines (`dynamic_ready` / `dynamic_failed`).
    pub(crate) fn register_with_ready(
        &self,
        id: ConnectionId,
        agent_id: AgentId,
        session_id: u64,
        forward_id: ForwardId,
    ) -> Result<(
        PendingGuard,
        oneshot::Receiver<DataConn>,
        oneshot::Receiver<ReadyOutcome>,
    )> {
        let (guard, data_rx, ready_rx) =
            self.register_inner(id, agent_id, session_id, forward_id, true)?;
        Ok((guard, data_rx, ready_rx.expect("ready channel requested")))
    }

    fn register_inner(
        &self,
        id: ConnectionId,
        agent_id: AgentId,
        session_id: u64,
        forward_id: ForwardId,
        with_ready: bool,
    ) -> Result<(
        PendingGuard,
        oneshot::Receiver<DataConn>,
        Option<oneshot::Receiver<ReadyOutcome>>,
    )> {
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let (data_tx, data_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = if with_ready {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let mut inner = self.inner.lock().expect("pending mutex poisoned");
        if inner.entries.contains_key(&id) {
            return Err(Error::protocol(format!("duplicate connection id {id}")));
        }
        inner.entries.insert(
            id.clone(),
            Entry {
                epoch,
                session_id,
                forward_id,
                agent_id,
                data_tx,
                ready_tx,
            },
        );

        let guard = PendingGuard {
            table: self.clone(),
            id,
            epoch,
        };
        Ok((guard, data_rx, ready_rx))
    }

    /// Take the entry for a just-arrived data connection. The entry is
    /// removed; the returned sender transfers socket ownership to the
    /// waiting task.
    pub(crate) fn claim(
        &self,
        id: &ConnectionId,
    ) -> Option<(AgentId, ForwardId, oneshot::Sender<DataConn>)> {
        let mut inner = self.inner.lock().expect("pending mutex poisoned");
        inner
            .entries
            .remove(id)
            .map(|e| (e.agent_id, e.forward_id, e.data_tx))
    }

    /// Deliver the agent's SOCKS5 dial outcome to the waiting engine. The
    /// entry stays in the table (the data connection is still to come on
    /// success). Returns false when no waiter is registered.
    pub(crate) fn resolve_ready(&self, id: &ConnectionId, outcome: ReadyOutcome) -> bool {
        let ready_tx = {
            let mut inner = self.inner.lock().expect("pending mutex poisoned");
            inner.entries.get_mut(id).and_then(|e| e.ready_tx.take())
        };
        match ready_tx {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Fail every entry owned by a session. Dropping the senders wakes the
    /// waiting tasks, which destroy their sockets.
    pub(crate) fn fail_session(&self, session_id: u64) {
        let mut inner = self.inner.lock().expect("pending mutex poisoned");
        let before = inner.entries.len();
        inner.entries.retain(|_, e| e.session_id != session_id);
        let dropped = before - inner.entries.len();
        if dropped > 0 {
            debug!(session_id, dropped, "Failed pending entries for session");
        }
    }

    fn remove_if(&self, id: &ConnectionId, epoch: u64) {
        let mut inner = self.inner.lock().expect("pending mutex poisoned");
        if inner.entries.get(id).is_some_and(|e| e.epoch == epoch) {
            inner.entries.remove(id);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending mutex poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes the owned entry on drop unless someone else already won the
/// race (claim, teardown, or a rebind under the same id).
pub(crate) struct PendingGuard {
    table: PendingTable,
    id: ConnectionId,
    epoch: u64,
}

impl PendingGuard {
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.remove_if(&self.id, self.epoch);
    }
}
