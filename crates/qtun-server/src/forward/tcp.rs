//! Forward TCP engine: user enters on a server listener, exits at the
//! agent's local target.
//!
//! Per accepted user connection: allocate a connection id, park the user
//! socket in the pending table, instruct the agent to dial back, and splice
//! once the twin data connection joins. Bytes the user sends before the
//! twin arrives are buffered and flushed first.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, warn};

use qtun_core::forward::Forward;
use qtun_core::pipe::splice;
use qtun_core::protocol::{ConnectionId, Message, NewConnectionPayload};

use crate::context::ServerContext;
use crate::forward::wait_for;
use crate::registry::SessionHandle;

pub(crate) async fn run_acceptor(
    ctx: Arc<ServerContext>,
    session: Arc<SessionHandle>,
    forward: Forward,
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
                        let session = session.clone();
                        let forward = forward.clone();
                        tokio::spawn(async move {
                            handle_conn(ctx, session, forward, stream, peer).await;
                        });
                    }
                    Err(e) => warn!(port = forward.remote_port, error = %e, "Accept failed"),
                }
            }
        }
    }
    debug!(port = forward.remote_port, name = %forward.name, "Forward listener stopped");
}

async fn handle_conn(
    ctx: Arc<ServerContext>,
    session: Arc<SessionHandle>,
    forward: Forward,
    mut stream: TcpStream,
    peer: SocketAddr,
) {
    let connection_id = ConnectionId::generate();
    let registered = ctx.pending.register(
        connection_id.clone(),
        forward.agent_id,
        session.session_id,
        forward.id,
    );
    let (guard, mut data_rx) = match registered {
        Ok(v) => v,
        Err(e) => {
            warn!(%peer, error = %e, "Could not register pending entry");
            return;
        }
    };

    debug!(%peer, id = %connection_id, name = %forward.name, "User connection pending");

    let instruct = Message::NewConnection(NewConnectionPayload {
        proxy_name: forward.name.clone(),
        connection_id: connection_id.clone(),
    });
    if session.send(instruct).await.is_err() {
        debug!(id = %connection_id, "Control session gone; dropping user connection");
        return;
    }

    let mut pre = Vec::new();
    match wait_for(&mut stream, &mut data_rx, ctx.config.pending_timeout, &mut pre).await {
        Ok(data) => {
            drop(guard);
            let meter = ctx.counters.handle(forward.id);
            let _ = splice(stream, data.stream, pre, data.residual.to_vec(), Some(meter)).await;
            debug!(%peer, id = %connection_id, "Forward connection finished");
        }
        Err(end) => {
            debug!(%peer, id = %connection_id, reason = ?end, "Forward connection abandoned");
        }
    }
}
