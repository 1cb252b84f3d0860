//! Control-session client: connect, authenticate, heartbeat, dispatch.
//!
//! The agent keeps exactly one control session alive, reconnecting with
//! exponential backoff when it drops. Authentication rejection is fatal
//! (a bad token never fixes itself by retrying); everything else is
//! retried.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{MissedTickBehavior, timeout};
use tracing::{debug, info, warn};

use qtun_core::net::apply_keepalive;
use qtun_core::protocol::{ControlHandshakePayload, LineReader, Message, write_message};
use qtun_core::{Error, Result};

use crate::config::AgentConfig;
use crate::context::AgentContext;
use crate::{data, udp};

/// Why a connected session ended.
enum SessionEnd {
    /// Shutdown was requested; don't reconnect.
    Shutdown,
    /// The connection dropped; reconnect.
    Disconnected,
}

/// The agent process core.
pub struct TunnelAgent {
    config: AgentConfig,
}

impl TunnelAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Run until `shutdown` flips true or authentication is rejected.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut delay = self.config.reconnect_min_delay;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.connect_and_serve(&mut shutdown).await {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                Ok(SessionEnd::Disconnected) => {
                    // The session had authenticated; start backoff over.
                    delay = self.config.reconnect_min_delay;
                    info!(delay = ?delay, "Control session lost; reconnecting");
                }
                Err(e) if e.is_fatal() => {
                    warn!(error = %e, "Giving up on the server");
                    return Err(e);
                }
                Err(e) => {
                    warn!(error = %e, delay = ?delay, "Connection attempt failed");
                }
            }

            tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.config.reconnect_max_delay);
        }
    }

    async fn connect_and_serve(&self, shutdown: &mut watch::Receiver<bool>) -> Result<SessionEnd> {
        let stream = match timeout(
            self.config.dial_timeout,
            TcpStream::connect(&self.config.server_addr),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(Error::Timeout),
        };
        apply_keepalive(&stream, self.config.keepalive_time);

        let (rd, mut wr) = stream.into_split();
        let mut reader = LineReader::new(rd);

        let hello = Message::ControlHandshake(ControlHandshakePayload {
            token: self.config.token.clone(),
        });
        write_message(&mut wr, &hello).await?;

        let auth = match timeout(self.config.pending_timeout, reader.next_message()).await {
            Ok(Ok(Some(msg))) => msg,
            Ok(Ok(None)) => return Err(Error::ConnectionClosed),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::Timeout),
        };

        let forwards = match auth {
            Message::AuthResponse(payload) if payload.success => {
                payload.port_forwards.unwrap_or_default()
            }
            Message::AuthResponse(payload) => {
                return Err(Error::Auth {
                    reason: payload.error.unwrap_or_else(|| "rejected".into()),
                });
            }
            other => {
                return Err(Error::protocol(format!(
                    "expected auth_response, got {}",
                    other.type_name()
                )));
            }
        };

        info!(
            server = %self.config.server_addr,
            forwards = forwards.len(),
            "Authenticated to server"
        );

        let (outbox_tx, mut outbox_rx) = mpsc::channel::<Message>(64);
        let ctx = AgentContext::new(self.config.clone(), outbox_tx);
        ctx.forwards.reconcile(&ctx, &forwards).await;

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbox_rx.recv().await {
                if write_message(&mut wr, &msg).await.is_err() {
                    break;
                }
            }
        });
        let sweeper = tokio::spawn(udp::run_idle_sweep(ctx.clone()));

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let end = loop {
            tokio::select! {
                _ = shutdown.changed() => break SessionEnd::Shutdown,
                _ = heartbeat.tick() => {
                    if ctx.send(Message::Heartbeat {}).await.is_err() {
                        break SessionEnd::Disconnected;
                    }
                }
                incoming = reader.next_message() => {
                    match incoming {
                        Ok(Some(msg)) => dispatch(&ctx, msg).await,
                        Ok(None) => {
                            info!("Server closed the control connection");
                            break SessionEnd::Disconnected;
                        }
                        Err(Error::Codec { message }) => {
                            warn!(%message, "Malformed frame skipped");
                        }
                        Err(e) => {
                            debug!(error = %e, "Control connection failed");
                            break SessionEnd::Disconnected;
                        }
                    }
                }
            }
        };

        ctx.forwards.close_all();
        ctx.udp.close_all();
        sweeper.abort();
        writer.abort();
        Ok(end)
    }
}

async fn dispatch(ctx: &Arc<AgentContext>, msg: Message) {
    match msg {
        Message::ConfigUpdate(payload) => {
            info!(forwards = payload.port_forwards.len(), "Configuration update");
            ctx.forwards.reconcile(ctx, &payload.port_forwards).await;
        }
        Message::NewConnection(payload) => {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                data::handle_new_connection(ctx, payload).await;
            });
        }
        Message::DynamicConnection(payload) => {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                data::handle_dynamic_connection(ctx, payload).await;
            });
        }
        Message::ReverseReady(payload) => {
            ctx.waiters.resolve(&payload.connection_id, Ok(()));
        }
        Message::ReverseFailed(payload) => {
            ctx.waiters.resolve(&payload.connection_id, Err(payload.error));
        }
        Message::ReverseDynamicReady(payload) => {
            ctx.waiters.resolve(&payload.connection_id, Ok(()));
        }
        Message::ReverseDynamicFailed(payload) => {
            ctx.waiters.resolve(&payload.connection_id, Err(payload.error));
        }
        Message::UdpPacket(payload) => {
            udp::handle_packet(ctx, payload).await;
        }
        Message::UdpClose(payload) => {
            ctx.udp.close(&payload.connection_id);
        }
        Message::HeartbeatAck {} => {}
        Message::Unknown => {
            debug!("Unknown message type ignored");
        }
        other => {
            debug!(kind = other.type_name(), "Unexpected message on control session");
        }
    }
}
