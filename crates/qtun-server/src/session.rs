//! Control-plane state machine, server side.
//!
//! A freshly accepted socket is classified by its first frame:
//! `control_handshake` starts an authenticated session, `data_connection`
//! reclassifies the socket as the twin of a pending entry, anything else
//! destroys it.
//!
//! An authenticated session owns its listeners and pending entries;
//! whichever way it ends (FIN, reset, heartbeat expiry, supersession) the
//! teardown closes all of them. Messages on one session are dispatched in
//! arrival order; handlers that need to dial spawn their own tasks and
//! never stall the dispatch loop.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use qtun_core::catalog::AgentRecord;
use qtun_core::forward::{Forward, PortForward};
use qtun_core::net::apply_keepalive;
use qtun_core::protocol::{
    AuthResponsePayload, ConfigUpdatePayload, ConnectionId, LineReader, Message, write_message,
};
use qtun_core::Error;

use crate::context::ServerContext;
use crate::forward::reverse;
use crate::pending::DataConn;
use crate::registry::{SessionCommand, SessionHandle};
use crate::udp;

/// Entry point for every accepted control-port connection.
pub(crate) async fn run_control_connection(
    ctx: Arc<ServerContext>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    apply_keepalive(&stream, ctx.config.keepalive_time);

    let (rd, wr) = stream.into_split();
    let mut reader = LineReader::new(rd);

    let first = match timeout(ctx.config.pending_timeout, reader.next_message()).await {
        Ok(Ok(Some(msg))) => msg,
        Ok(Ok(None)) => {
            debug!(%peer, "Connection closed before first frame");
            return;
        }
        Ok(Err(e)) => {
            debug!(%peer, error = %e, "Bad first frame, destroying connection");
            return;
        }
        Err(_) => {
            debug!(%peer, "No first frame before deadline, destroying connection");
            return;
        }
    };

    match first {
        Message::ControlHandshake(handshake) => {
            run_authenticated(ctx, reader, wr, peer, handshake.token).await;
        }
        Message::DataConnection(data) => {
            join_data_connection(&ctx, reader, wr, peer, data.connection_id);
        }
        other => {
            debug!(%peer, kind = other.type_name(), "Unexpected first frame, destroying connection");
        }
    }
}

/// Hand a just-arrived data connection to the task waiting on its id.
fn join_data_connection(
    ctx: &Arc<ServerContext>,
    reader: LineReader<OwnedReadHalf>,
    wr: OwnedWriteHalf,
    peer: SocketAddr,
    connection_id: ConnectionId,
) {
    let Some((agent_id, forward_id, data_tx)) = ctx.pending.claim(&connection_id) else {
        debug!(%peer, id = %connection_id, "Data connection without pending entry, destroying");
        return;
    };

    let (rd, residual) = reader.into_parts();
    let stream = match rd.reunite(wr) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%peer, error = %e, "Could not reunite data socket halves");
            return;
        }
    };

    debug!(
        %peer,
        id = %connection_id,
        agent = %agent_id,
        forward = %forward_id,
        residual = residual.len(),
        "Data connection joined"
    );

    if data_tx.send(DataConn { stream, residual }).is_err() {
        // The waiter raced out (deadline or teardown); dropping the socket
        // here is the designed loser path.
        debug!(id = %connection_id, "Pending waiter gone before join");
    }
}

async fn run_authenticated(
    ctx: Arc<ServerContext>,
    mut reader: LineReader<OwnedReadHalf>,
    mut wr: OwnedWriteHalf,
    peer: SocketAddr,
    token: String,
) {
    // Resolve the token; every failure answers with auth_response {success:false}.
    let record: AgentRecord = match ctx.catalog.agent_by_token(&token).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            debug!(%peer, "Handshake with unknown or disabled token");
            let _ = write_auth_failure(&mut wr, "invalid or disabled token").await;
            return;
        }
        Err(e) => {
            warn!(%peer, error = %e, "Catalog failure during authentication");
            let _ = write_auth_failure(&mut wr, "catalog unavailable").await;
            return;
        }
    };

    let forwards: Vec<Forward> = match ctx.catalog.forwards_by_agent(record.id).await {
        Ok(forwards) => forwards,
        Err(e) => {
            warn!(%peer, agent = %record.id, error = %e, "Catalog failure loading forwards");
            let _ = write_auth_failure(&mut wr, "catalog unavailable").await;
            return;
        }
    };

    let (outbox_tx, mut outbox_rx) = mpsc::channel::<Message>(64);
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SessionCommand>(8);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let handle = SessionHandle::new(record.id, record.name.clone(), outbox_tx, cmd_tx, shutdown_tx);

    // One live session per agent: the newcomer wins and tears the old one
    // down before binding anything.
    if let Some(old) = ctx.registry.insert(handle.clone()) {
        info!(agent = %record.id, old_session = old.session_id, "Superseding existing session");
        old.signal_shutdown();
        ctx.listeners.close_for_session(old.session_id);
        ctx.pending.fail_session(old.session_id);
        ctx.udp_routes.remove_session(old.session_id);
    }

    let wire: Vec<PortForward> = forwards.iter().map(PortForward::from).collect();
    let accepted = Message::AuthResponse(AuthResponsePayload {
        success: true,
        error: None,
        port_forwards: Some(wire),
    });
    if write_message(&mut wr, &accepted).await.is_err() {
        ctx.registry.remove_if(record.id, handle.session_id);
        return;
    }

    // All further writes go through the outbox so frames never interleave.
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbox_rx.recv().await {
            if write_message(&mut wr, &msg).await.is_err() {
                break;
            }
        }
    });

    info!(agent = %record.id, name = %handle.agent_name, %peer, "Agent authenticated");
    ctx.listeners.reconcile(&ctx, &handle, &forwards).await;

    let mut deadline = Instant::now() + ctx.config.heartbeat_timeout;
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                debug!(agent = %record.id, "Session shutdown signalled");
                break;
            }
            Some(cmd) = cmd_rx.recv() => {
                match cmd {
                    SessionCommand::Reload => handle_reload(&ctx, &handle).await,
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                info!(agent = %record.id, "Heartbeat deadline expired");
                break;
            }
            incoming = reader.next_message() => {
                match incoming {
                    Ok(Some(Message::Heartbeat {})) => {
                        deadline = Instant::now() + ctx.config.heartbeat_timeout;
                        let _ = handle.send(Message::HeartbeatAck {}).await;
                    }
                    Ok(Some(Message::ReverseConnection(payload))) => {
                        reverse::handle_reverse_connection(&ctx, &handle, payload);
                    }
                    Ok(Some(Message::ReverseDynamic(payload))) => {
                        reverse::handle_reverse_dynamic(&ctx, &handle, payload);
                    }
                    Ok(Some(Message::DynamicReady(payload))) => {
                        if !ctx.pending.resolve_ready(&payload.connection_id, Ok(())) {
                            debug!(id = %payload.connection_id, "dynamic_ready without waiter");
                        }
                    }
                    Ok(Some(Message::DynamicFailed(payload))) => {
                        ctx.pending.resolve_ready(&payload.connection_id, Err(payload.error));
                    }
                    Ok(Some(Message::UdpPacketResponse(payload))) => {
                        udp::handle_response(&ctx, payload).await;
                    }
                    Ok(Some(Message::UdpClose(payload))) => {
                        udp::handle_close(&ctx, &payload.connection_id);
                    }
                    Ok(Some(Message::Register(_))) => {
                        warn!(agent = %record.id, "Legacy register message rejected; forwards are catalog-driven");
                    }
                    Ok(Some(Message::Unknown)) => {
                        debug!(agent = %record.id, "Unknown message type ignored");
                    }
                    Ok(Some(other)) => {
                        debug!(agent = %record.id, kind = other.type_name(), "Unexpected control message ignored");
                    }
                    Ok(None) => {
                        info!(agent = %record.id, "Control connection closed by agent");
                        break;
                    }
                    Err(Error::Codec { message }) => {
                        warn!(agent = %record.id, %message, "Malformed frame skipped");
                    }
                    Err(e) => {
                        debug!(agent = %record.id, error = %e, "Control connection failed");
                        break;
                    }
                }
            }
        }
    }

    // Teardown: everything this session owns goes with it.
    ctx.listeners.close_for_session(handle.session_id);
    ctx.pending.fail_session(handle.session_id);
    ctx.udp_routes.remove_session(handle.session_id);
    ctx.registry.remove_if(record.id, handle.session_id);
    writer.abort();
    info!(agent = %record.id, session = handle.session_id, "Session closed");
}

/// Catalog changed for this agent: reconcile listeners, push the new list.
async fn handle_reload(ctx: &Arc<ServerContext>, handle: &Arc<SessionHandle>) {
    match ctx.catalog.forwards_by_agent(handle.agent_id).await {
        Ok(forwards) => {
            ctx.listeners.reconcile(ctx, handle, &forwards).await;
            let wire: Vec<PortForward> = forwards.iter().map(PortForward::from).collect();
            let update = Message::ConfigUpdate(ConfigUpdatePayload {
                port_forwards: wire,
            });
            if handle.send(update).await.is_err() {
                debug!(agent = %handle.agent_id, "Config update lost; session closing");
            }
        }
        Err(e) => {
            warn!(agent = %handle.agent_id, error = %e, "Catalog read failed during reload");
        }
    }
}

async fn write_auth_failure(wr: &mut OwnedWriteHalf, reason: &str) -> qtun_core::Result<()> {
    let refusal = Message::AuthResponse(AuthResponsePayload {
        success: false,
        error: Some(reason.to_string()),
        port_forwards: None,
    });
    write_message(wr, &refusal).await
}
