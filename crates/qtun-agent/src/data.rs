//! Data connections and forward-direction dials on the agent.
//!
//! A data connection is an ordinary TCP connection to the server whose
//! first frame is `data_connection {connectionId}`; everything after that
//! newline is tunneled payload.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use qtun_core::forward::Direction;
use qtun_core::pipe::splice;
use qtun_core::protocol::{
    ConnectionFailedPayload, ConnectionId, ConnectionRefPayload, DynamicConnectionPayload,
    Message, NewConnectionPayload, encode,
};
use qtun_core::{Error, Result};

use crate::context::AgentContext;

/// Dial the server and announce the connection id. The returned stream is
/// ready for payload.
pub(crate) async fn open_data_connection(
    ctx: &Arc<AgentContext>,
    connection_id: &ConnectionId,
) -> Result<TcpStream> {
    let mut stream = match timeout(
        ctx.config.dial_timeout,
        TcpStream::connect(&ctx.config.server_addr),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(Error::Timeout),
    };

    let frame = encode(&Message::DataConnection(ConnectionRefPayload {
        connection_id: connection_id.clone(),
    }))?;
    stream.write_all(&frame).await?;
    Ok(stream)
}

/// Forward TCP: the server has a user waiting; dial back and splice with
/// the configured local target.
pub(crate) async fn handle_new_connection(ctx: Arc<AgentContext>, payload: NewConnectionPayload) {
    let Some(forward) = ctx.forwards.get(&payload.proxy_name) else {
        debug!(name = %payload.proxy_name, "new_connection for unknown forward");
        return;
    };
    if forward.direction != Direction::Forward {
        debug!(name = %payload.proxy_name, "new_connection for non-forward direction");
        return;
    }

    // Open the twin first so the server's pending entry resolves promptly;
    // if the local dial then fails, closing the twin is what tells the
    // server to drop the user socket.
    let data_conn = match open_data_connection(&ctx, &payload.connection_id).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(id = %payload.connection_id, error = %e, "Data connection dial failed");
            return;
        }
    };

    let addr = format!("{}:{}", forward.local_ip, forward.local_port);
    let local = match timeout(ctx.config.dial_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!(id = %payload.connection_id, %addr, error = %e, "Local dial failed");
            return;
        }
        Err(_) => {
            debug!(id = %payload.connection_id, %addr, "Local dial timed out");
            return;
        }
    };

    debug!(id = %payload.connection_id, %addr, name = %forward.name, "Forward pair established");
    let _ = splice(data_conn, local, Vec::new(), Vec::new(), None).await;
}

/// Forward SOCKS5: dial the requested target, report the outcome, then
/// open the data connection for payload.
pub(crate) async fn handle_dynamic_connection(
    ctx: Arc<AgentContext>,
    payload: DynamicConnectionPayload,
) {
    let addr = format!("{}:{}", payload.target_host, payload.target_port);

    let target = match timeout(ctx.config.dial_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("dial timed out".to_string()),
    };

    let target = match target {
        Ok(stream) => stream,
        Err(error) => {
            debug!(id = %payload.connection_id, %addr, %error, "Target dial failed");
            let failed = Message::DynamicFailed(ConnectionFailedPayload {
                connection_id: payload.connection_id,
                error,
            });
            let _ = ctx.send(failed).await;
            return;
        }
    };

    let ready = Message::DynamicReady(ConnectionRefPayload {
        connection_id: payload.connection_id.clone(),
    });
    if ctx.send(ready).await.is_err() {
        return;
    }

    let data_conn = match open_data_connection(&ctx, &payload.connection_id).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(id = %payload.connection_id, error = %e, "Data connection dial failed");
            return;
        }
    };

    debug!(id = %payload.connection_id, %addr, "Dynamic pair established");
    let _ = splice(data_conn, target, Vec::new(), Vec::new(), None).await;
}
