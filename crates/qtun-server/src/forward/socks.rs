//! Forward SOCKS5 engine: the server speaks SOCKS5 with the user, the
//! agent dials the requested target.
//!
//! Sequencing per connection:
//! 1. SOCKS5 greeting + CONNECT parse (no final reply yet).
//! 2. Park the user socket pending; send `dynamic_connection` to the agent.
//! 3. On `dynamic_ready`, write the SOCKS5 success reply; on
//!    `dynamic_failed`, write the failure reply and destroy.
//! 4. The agent opens the data connection; splice, flushing first whatever
//!    the user pipelined after its CONNECT (TLS ClientHellos commonly
//!    arrive before the reply).

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, warn};

use qtun_core::forward::Forward;
use qtun_core::pipe::splice;
use qtun_core::protocol::{ConnectionId, DynamicConnectionPayload, Message};
use qtun_core::socks;

use crate::context::ServerContext;
use crate::forward::{WaitEnd, wait_for};
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
    debug!(port = forward.remote_port, name = %forward.name, "SOCKS5 listener stopped");
}

async fn handle_conn(
    ctx: Arc<ServerContext>,
    session: Arc<SessionHandle>,
    forward: Forward,
    mut stream: TcpStream,
    peer: SocketAddr,
) {
    let (target_host, target_port) = match socks::negotiate(&mut stream).await {
        Ok(target) => target,
        Err(e) => {
            debug!(%peer, error = %e, "SOCKS5 negotiation failed");
            return;
        }
    };

    debug!(
        %peer,
        target = %format!("{target_host}:{target_port}"),
        "SOCKS5 CONNECT request"
    );

    let connection_id = ConnectionId::generate();
    let registered = ctx.pending.register_with_ready(
        connection_id.clone(),
        forward.agent_id,
        session.session_id,
        forward.id,
    );
    let (guard, mut data_rx, mut ready_rx) = match registered {
        Ok(v) => v,
        Err(e) => {
            warn!(%peer, error = %e, "Could not register pending entry");
            let _ = socks::send_reply(&mut stream, socks::REPLY_GENERAL_FAILURE).await;
            return;
        }
    };

    let instruct = Message::DynamicConnection(DynamicConnectionPayload {
        proxy_name: forward.name.clone(),
        connection_id: connection_id.clone(),
        target_host,
        target_port,
    });
    if session.send(instruct).await.is_err() {
        let _ = socks::send_reply(&mut stream, socks::REPLY_GENERAL_FAILURE).await;
        return;
    }

    // Phase 1: the agent reports its dial outcome. Anything the user sends
    // meanwhile is preData.
    let mut pre = Vec::new();
    match wait_for(&mut stream, &mut ready_rx, ctx.config.pending_timeout, &mut pre).await {
        Ok(Ok(())) => {
            if socks::send_reply(&mut stream, socks::REPLY_SUCCESS).await.is_err() {
                return;
            }
        }
        Ok(Err(dial_error)) => {
            debug!(id = %connection_id, error = %dial_error, "Agent-side dial failed");
            let _ = socks::send_reply(&mut stream, socks::REPLY_GENERAL_FAILURE).await;
            return;
        }
        Err(WaitEnd::PeerClosed) => {
            debug!(id = %connection_id, "User left before the dial completed");
            return;
        }
        Err(end) => {
            debug!(id = %connection_id, reason = ?end, "No dial outcome from agent");
            let _ = socks::send_reply(&mut stream, socks::REPLY_GENERAL_FAILURE).await;
            return;
        }
    }

    // Phase 2: the data connection joins.
    match wait_for(&mut stream, &mut data_rx, ctx.config.pending_timeout, &mut pre).await {
        Ok(data) => {
            drop(guard);
            let meter = ctx.counters.handle(forward.id);
            let _ = splice(stream, data.stream, pre, data.residual.to_vec(), Some(meter)).await;
            debug!(%peer, id = %connection_id, "SOCKS5 connection finished");
        }
        Err(end) => {
            debug!(%peer, id = %connection_id, reason = ?end, "SOCKS5 twin never arrived");
        }
    }
}
