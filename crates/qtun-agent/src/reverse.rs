//! Agent side of the reverse directions.
//!
//! A local user connects to the agent's listener; the agent asks the
//! server to dial the destination (`reverse_connection` targets the
//! forward's configured server-side address, `reverse_dynamic` whatever
//! the SOCKS5 user requested), waits for the `*_ready` confirmation, then
//! opens the data connection and splices.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

use qtun_core::forward::{Direction, PortForward};
use qtun_core::pipe::splice;
use qtun_core::protocol::{
    ConnectionId, Message, ReverseConnectionPayload, ReverseDynamicPayload,
};
use qtun_core::socks;

use crate::context::AgentContext;
use crate::data;

/// Outcome the server reports for a reverse negotiation.
type NegotiationOutcome = Result<(), String>;

/// Reverse negotiations awaiting their `*_ready` / `*_failed` reply,
/// keyed by the agent-allocated connection id.
#[derive(Default)]
pub(crate) struct WaiterTable {
    inner: Mutex<HashMap<ConnectionId, oneshot::Sender<NegotiationOutcome>>>,
}

impl WaiterTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, id: ConnectionId) -> oneshot::Receiver<NegotiationOutcome> {
        let (tx, rx) = oneshot::channel();
        let mut map = self.inner.lock().expect("waiter mutex poisoned");
        map.insert(id, tx);
        rx
    }

    /// Deliver the server's verdict. Returns false for unknown ids (stale
    /// replies are no-ops).
    pub fn resolve(&self, id: &ConnectionId, outcome: NegotiationOutcome) -> bool {
        let waiter = {
            let mut map = self.inner.lock().expect("waiter mutex poisoned");
            map.remove(id)
        };
        match waiter {
            Some(tx) => tx.send(outcome).is_ok(),
            None => {
                debug!(id = %id, "Reply for unknown reverse negotiation");
                false
            }
        }
    }

    fn forget(&self, id: &ConnectionId) {
        let mut map = self.inner.lock().expect("waiter mutex poisoned");
        map.remove(id);
    }
}

/// Accept loop for one reverse or reverse-dynamic listener.
pub(crate) async fn run_listener(
    ctx: Arc<AgentContext>,
    forward: PortForward,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let ctx = ctx.clone();
                        let forward = forward.clone();
                        tokio::spawn(async move {
                            handle_local_conn(ctx, forward, stream, peer).await;
                        });
                    }
                    Err(e) => warn!(name = %forward.name, error = %e, "Accept failed"),
                }
            }
        }
    }
    debug!(name = %forward.name, "Reverse listener stopped");
}

async fn handle_local_conn(
    ctx: Arc<AgentContext>,
    forward: PortForward,
    mut stream: TcpStream,
    peer: SocketAddr,
) {
    match forward.direction {
        Direction::Reverse => {
            let connection_id = ConnectionId::generate();
            debug!(%peer, name = %forward.name, id = %connection_id, "Reverse connection");

            let request = Message::ReverseConnection(ReverseConnectionPayload {
                proxy_name: forward.name.clone(),
                connection_id: connection_id.clone(),
            });
            if await_ready(&ctx, &connection_id, request).await.is_err() {
                return;
            }

            let Ok(data_conn) = data::open_data_connection(&ctx, &connection_id).await else {
                debug!(id = %connection_id, "Data connection dial failed");
                return;
            };
            let _ = splice(stream, data_conn, Vec::new(), Vec::new(), None).await;
        }
        Direction::ReverseDynamic => {
            let (target_host, target_port) = match socks::negotiate(&mut stream).await {
                Ok(target) => target,
                Err(e) => {
                    debug!(%peer, error = %e, "SOCKS5 negotiation failed");
                    return;
                }
            };

            let connection_id = ConnectionId::generate();
            debug!(
                %peer,
                name = %forward.name,
                id = %connection_id,
                target = %format!("{target_host}:{target_port}"),
                "Reverse dynamic connection"
            );

            let request = Message::ReverseDynamic(ReverseDynamicPayload {
                proxy_name: forward.name.clone(),
                connection_id: connection_id.clone(),
                target_host,
                target_port,
            });
            if await_ready(&ctx, &connection_id, request).await.is_err() {
                let _ = socks::send_reply(&mut stream, socks::REPLY_GENERAL_FAILURE).await;
                return;
            }
            if socks::send_reply(&mut stream, socks::REPLY_SUCCESS).await.is_err() {
                return;
            }

            let Ok(data_conn) = data::open_data_connection(&ctx, &connection_id).await else {
                debug!(id = %connection_id, "Data connection dial failed");
                return;
            };
            let _ = splice(stream, data_conn, Vec::new(), Vec::new(), None).await;
        }
        _ => {
            // Listeners are only ever bound for the reverse directions.
            warn!(name = %forward.name, "Listener bound for non-reverse forward");
        }
    }
}

/// Send the negotiation request and wait for the server's verdict.
async fn await_ready(
    ctx: &Arc<AgentContext>,
    connection_id: &ConnectionId,
    request: Message,
) -> Result<(), ()> {
    let rx = ctx.waiters.register(connection_id.clone());

    if ctx.send(request).await.is_err() {
        ctx.waiters.forget(connection_id);
        return Err(());
    }

    match timeout(ctx.config.pending_timeout, rx).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(error))) => {
            debug!(id = %connection_id, %error, "Server reported dial failure");
            Err(())
        }
        Ok(Err(_)) => {
            // Context torn down; the waiter sender was dropped.
            Err(())
        }
        Err(_) => {
            debug!(id = %connection_id, "No verdict from server before deadline");
            ctx.waiters.forget(connection_id);
            Err(())
        }
    }
}
