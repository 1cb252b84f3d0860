//! Server-side listener lifecycle, keyed by remote port.
//!
//! For each authenticated agent the manager reconciles the desired
//! listener set (enabled forwards whose direction binds the server)
//! against what is actually bound. Undesired listeners are closed before
//! new ones are bound, so a reload that moves a forward between ports
//! never trips over its own previous bind. A port already held by another
//! agent refuses the new bind; the forward stays configured but dormant
//! until the next reconciliation finds the port free.
//!
//! Reconciliation for an agent only ever runs on its session task, so it
//! is single-threaded per agent by construction.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use qtun_core::forward::{Direction, Forward, Transport};

use crate::context::ServerContext;
use crate::registry::SessionHandle;
use crate::{forward, udp};

struct BoundListener {
    session_id: u64,
    forward: Forward,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl BoundListener {
    fn close(self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
    }
}

/// Map of bound server ports to their owning listener tasks.
#[derive(Default)]
pub(crate) struct ListenerManager {
    inner: Mutex<HashMap<u16, BoundListener>>,
}

impl ListenerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring the agent's server-side listeners in line with `forwards`.
    pub async fn reconcile(
        &self,
        ctx: &Arc<ServerContext>,
        session: &Arc<SessionHandle>,
        forwards: &[Forward],
    ) {
        let mut desired: HashMap<u16, &Forward> = HashMap::new();
        for f in forwards {
            if let Err(e) = f.validate() {
                warn!(agent = %session.agent_id, forward = %f.id, error = %e, "Skipping invalid forward");
                continue;
            }
            if f.binds_server() {
                desired.insert(f.remote_port, f);
            }
        }

        // Close first: anything this agent owns that is no longer desired,
        // changed shape, or belongs to a superseded session.
        let to_close: Vec<BoundListener> = {
            let mut map = self.inner.lock().expect("listener mutex poisoned");
            let ports: Vec<u16> = map
                .iter()
                .filter(|(port, bound)| {
                    bound.forward.agent_id == session.agent_id
                        && (bound.session_id != session.session_id
                            || desired.get(*port).map(|f| *f != &bound.forward).unwrap_or(true))
                })
                .map(|(port, _)| *port)
                .collect();
            ports.into_iter().filter_map(|p| map.remove(&p)).collect()
        };
        for bound in to_close {
            info!(
                agent = %session.agent_id,
                port = bound.forward.remote_port,
                name = %bound.forward.name,
                "Closing listener"
            );
            bound.close();
        }

        // Bind what is missing.
        for (port, fwd) in desired {
            if self.is_bound_for_session(port, session.session_id) {
                continue;
            }

            // Surface catalog-level duplicates, but let the live listener
            // map decide who actually holds the port: the first agent to
            // authenticate wins, the rest stay dormant.
            match ctx.catalog.remote_port_available(port, Some(fwd.id)).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(
                        agent = %session.agent_id,
                        port,
                        name = %fwd.name,
                        "Remote port also configured on another enabled forward"
                    );
                }
                Err(e) => {
                    warn!(port, error = %e, "Catalog availability check failed");
                }
            }

            if let Some(owner) = self.owner_of(port) {
                if owner != session.agent_id.0 {
                    warn!(
                        agent = %session.agent_id,
                        port,
                        name = %fwd.name,
                        owner,
                        "Port already serving another agent; leaving dormant"
                    );
                    continue;
                }
            }

            if let Err(e) = self.bind_one(ctx, session, fwd).await {
                warn!(
                    agent = %session.agent_id,
                    port,
                    name = %fwd.name,
                    error = %e,
                    "Bind failed; leaving forward dormant"
                );
            }
        }
    }

    async fn bind_one(
        &self,
        ctx: &Arc<ServerContext>,
        session: &Arc<SessionHandle>,
        fwd: &Forward,
    ) -> qtun_core::Result<()> {
        let addr = SocketAddr::new(ctx.config.bind_addr.ip(), fwd.remote_port);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = match (fwd.direction, fwd.transport) {
            (Direction::Forward, Transport::Udp) => {
                let socket = Arc::new(UdpSocket::bind(addr).await?);
                tokio::spawn(udp::run_acceptor(
                    ctx.clone(),
                    session.clone(),
                    fwd.clone(),
                    socket,
                    shutdown_rx,
                ))
            }
            (Direction::Dynamic, _) => {
                let listener = TcpListener::bind(addr).await?;
                tokio::spawn(forward::socks::run_acceptor(
                    ctx.clone(),
                    session.clone(),
                    fwd.clone(),
                    listener,
                    shutdown_rx,
                ))
            }
            _ => {
                let listener = TcpListener::bind(addr).await?;
                tokio::spawn(forward::tcp::run_acceptor(
                    ctx.clone(),
                    session.clone(),
                    fwd.clone(),
                    listener,
                    shutdown_rx,
                ))
            }
        };

        let bound = BoundListener {
            session_id: session.session_id,
            forward: fwd.clone(),
            shutdown: shutdown_tx,
            task,
        };

        let mut map = self.inner.lock().expect("listener mutex poisoned");
        if map.contains_key(&fwd.remote_port) {
            // Lost a bind race; the port went to someone else meanwhile.
            drop(map);
            warn!(port = fwd.remote_port, "Concurrent bind won the port; dropping ours");
            bound.close();
            return Err(qtun_core::Error::PortInUse {
                port: fwd.remote_port,
            });
        }
        info!(
            agent = %session.agent_id,
            port = fwd.remote_port,
            name = %fwd.name,
            direction = ?fwd.direction,
            transport = ?fwd.transport,
            "Listener bound"
        );
        map.insert(fwd.remote_port, bound);
        Ok(())
    }

    fn is_bound_for_session(&self, port: u16, session_id: u64) -> bool {
        let map = self.inner.lock().expect("listener mutex poisoned");
        map.get(&port).is_some_and(|b| b.session_id == session_id)
    }

    fn owner_of(&self, port: u16) -> Option<i64> {
        let map = self.inner.lock().expect("listener mutex poisoned");
        map.get(&port).map(|b| b.forward.agent_id.0)
    }

    /// Close every listener owned by a session.
    pub fn close_for_session(&self, session_id: u64) {
        let closing: Vec<BoundListener> = {
            let mut map = self.inner.lock().expect("listener mutex poisoned");
            let ports: Vec<u16> = map
                .iter()
                .filter(|(_, b)| b.session_id == session_id)
                .map(|(p, _)| *p)
                .collect();
            ports.into_iter().filter_map(|p| map.remove(&p)).collect()
        };
        for bound in closing {
            debug!(port = bound.forward.remote_port, "Closing listener with session");
            bound.close();
        }
    }

    /// Ports currently bound (tests and introspection).
    pub fn bound_ports(&self) -> Vec<u16> {
        let map = self.inner.lock().expect("listener mutex poisoned");
        let mut ports: Vec<u16> = map.keys().copied().collect();
        ports.sort_unstable();
        ports
    }
}
