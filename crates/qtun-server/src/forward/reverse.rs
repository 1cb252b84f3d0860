//! Reverse engines: the user enters at the agent, the server dials the
//! destination.
//!
//! `reverse_connection` targets the forward's configured server-side
//! address; `reverse_dynamic` targets whatever the agent's SOCKS5 user
//! asked for. In both cases the dialed socket is parked pending under the
//! agent-chosen connection id, a `*_ready` confirmation is sent, and the
//! agent's data connection completes the pair.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use qtun_core::forward::{Direction, Forward};
use qtun_core::pipe::splice;
use qtun_core::protocol::{
    ConnectionFailedPayload, ConnectionId, ConnectionRefPayload, Message,
    ReverseConnectionPayload, ReverseDynamicPayload,
};
use qtun_core::{Error, Result};

use crate::context::ServerContext;
use crate::forward::wait_for;
use crate::registry::SessionHandle;

pub(crate) fn handle_reverse_connection(
    ctx: &Arc<ServerContext>,
    session: &Arc<SessionHandle>,
    payload: ReverseConnectionPayload,
) {
    let ctx = ctx.clone();
    let session = session.clone();
    tokio::spawn(async move {
        let connection_id = payload.connection_id.clone();
        if let Err(e) = serve_reverse(&ctx, &session, payload).await {
            debug!(id = %connection_id, error = %e, "Reverse negotiation failed");
            let failed = Message::ReverseFailed(ConnectionFailedPayload {
                connection_id,
                error: e.to_string(),
            });
            let _ = session.send(failed).await;
        }
    });
}

pub(crate) fn handle_reverse_dynamic(
    ctx: &Arc<ServerContext>,
    session: &Arc<SessionHandle>,
    payload: ReverseDynamicPayload,
) {
    let ctx = ctx.clone();
    let session = session.clone();
    tokio::spawn(async move {
        let connection_id = payload.connection_id.clone();
        if let Err(e) = serve_reverse_dynamic(&ctx, &session, payload).await {
            debug!(id = %connection_id, error = %e, "Reverse dynamic negotiation failed");
            let failed = Message::ReverseDynamicFailed(ConnectionFailedPayload {
                connection_id,
                error: e.to_string(),
            });
            let _ = session.send(failed).await;
        }
    });
}

async fn serve_reverse(
    ctx: &Arc<ServerContext>,
    session: &Arc<SessionHandle>,
    payload: ReverseConnectionPayload,
) -> Result<()> {
    let forward = lookup_forward(ctx, session, &payload.proxy_name, Direction::Reverse).await?;
    let addr = format!("{}:{}", forward.remote_ip, forward.remote_port);

    let target = dial(ctx, &addr).await?;
    info!(
        agent = %session.agent_id,
        name = %forward.name,
        %addr,
        id = %payload.connection_id,
        "Reverse target dialed"
    );

    let ready = Message::ReverseReady(ConnectionRefPayload {
        connection_id: payload.connection_id.clone(),
    });
    complete_pair(ctx, session, &forward, payload.connection_id, target, ready).await
}

async fn serve_reverse_dynamic(
    ctx: &Arc<ServerContext>,
    session: &Arc<SessionHandle>,
    payload: ReverseDynamicPayload,
) -> Result<()> {
    let forward =
        lookup_forward(ctx, session, &payload.proxy_name, Direction::ReverseDynamic).await?;
    let addr = format!("{}:{}", payload.target_host, payload.target_port);

    let target = dial(ctx, &addr).await?;
    debug!(
        agent = %session.agent_id,
        name = %forward.name,
        %addr,
        id = %payload.connection_id,
        "Reverse dynamic target dialed"
    );

    let ready = Message::ReverseDynamicReady(ConnectionRefPayload {
        connection_id: payload.connection_id.clone(),
    });
    complete_pair(ctx, session, &forward, payload.connection_id, target, ready).await
}

/// Park the dialed target under the agent's connection id, confirm, and
/// splice with the incoming data connection. After the confirmation went
/// out, failures are local teardown only (no `*_failed` frame: the agent
/// already committed to opening the data connection).
async fn complete_pair(
    ctx: &Arc<ServerContext>,
    session: &Arc<SessionHandle>,
    forward: &Forward,
    connection_id: ConnectionId,
    mut target: TcpStream,
    ready: Message,
) -> Result<()> {
    let (guard, mut data_rx) = ctx.pending.register(
        connection_id.clone(),
        forward.agent_id,
        session.session_id,
        forward.id,
    )?;

    session.send(ready).await?;

    let mut pre = Vec::new();
    match wait_for(&mut target, &mut data_rx, ctx.config.pending_timeout, &mut pre).await {
        Ok(data) => {
            drop(guard);
            let meter = ctx.counters.handle(forward.id);
            // The data connection carries the entering user's bytes; the
            // dialed target is the destination.
            let _ = splice(data.stream, target, data.residual.to_vec(), pre, Some(meter)).await;
            Ok(())
        }
        Err(end) => {
            debug!(id = %connection_id, reason = ?end, "Reverse pair never completed");
            Ok(())
        }
    }
}

async fn lookup_forward(
    ctx: &Arc<ServerContext>,
    session: &Arc<SessionHandle>,
    proxy_name: &str,
    direction: Direction,
) -> Result<Forward> {
    let forwards = ctx
        .catalog
        .forwards_by_agent(session.agent_id)
        .await
        .map_err(|e| Error::Catalog {
            message: e.to_string(),
        })?;

    forwards
        .into_iter()
        .find(|f| f.name == proxy_name && f.direction == direction && f.enabled)
        .ok_or_else(|| Error::Forward {
            message: format!("no {direction:?} forward named {proxy_name}"),
        })
}

async fn dial(ctx: &Arc<ServerContext>, addr: &str) -> Result<TcpStream> {
    match timeout(ctx.config.dial_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(Error::Timeout),
    }
}
