//! Server front door: control listener, accept loop and traffic flusher.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use qtun_core::Result;
use qtun_core::catalog::Catalog;
use qtun_core::constants::FINAL_FLUSH_TIMEOUT;
use qtun_core::forward::AgentId;

use crate::config::ServerConfig;
use crate::context::ServerContext;
use crate::session::run_control_connection;

/// The tunnel server: owns the control listener and all shared state.
pub struct TunnelServer {
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
}

impl TunnelServer {
    /// Bind the control listener and prepare shared state.
    pub async fn bind(config: ServerConfig, catalog: Arc<dyn Catalog>) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Control listener bound");

        let ctx = ServerContext::new(config, catalog);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            ctx,
            listener,
            local_addr,
            shutdown_tx,
        })
    }

    /// Address the control listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A handle for the external admin surface (reload) and for shutdown.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            ctx: self.ctx.clone(),
            shutdown: self.shutdown_tx.clone(),
        }
    }

    /// Run the accept loop until shutdown. A final traffic flush is
    /// attempted on the way out, bounded so shutdown can't hang.
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let flusher = tokio::spawn(run_flusher(self.ctx.clone(), self.shutdown_tx.subscribe()));

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("Server shutting down");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "Control connection accepted");
                            let ctx = self.ctx.clone();
                            tokio::spawn(run_control_connection(ctx, stream, peer));
                        }
                        Err(e) => warn!(error = %e, "Accept failed"),
                    }
                }
            }
        }

        let _ = flusher.await;
        Ok(())
    }
}

/// Cloneable handle into a running server.
#[derive(Clone)]
pub struct ServerHandle {
    ctx: Arc<ServerContext>,
    shutdown: watch::Sender<bool>,
}

impl ServerHandle {
    /// External reload trigger: the admin surface calls this whenever the
    /// forwards of an agent change. A no-op for offline agents (they get
    /// the fresh list at their next handshake).
    pub async fn reload(&self, agent_id: AgentId) -> Result<()> {
        match self.ctx.registry.get(agent_id) {
            Some(session) => session.request_reload().await,
            None => {
                debug!(agent = %agent_id, "Reload for offline agent is a no-op");
                Ok(())
            }
        }
    }

    /// Number of currently connected agents.
    pub fn connected_agents(&self) -> usize {
        self.ctx.registry.connected_count()
    }

    /// Server ports currently bound for forwards.
    pub fn bound_ports(&self) -> Vec<u16> {
        self.ctx.listeners.bound_ports()
    }

    /// Signal the server to stop accepting and flush out.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn run_flusher(ctx: Arc<ServerContext>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(ctx.config.flush_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = tick.tick() => flush_once(&ctx).await,
        }
    }

    // One last flush, bounded so shutdown never hangs on the catalog.
    if tokio::time::timeout(FINAL_FLUSH_TIMEOUT, flush_once(&ctx))
        .await
        .is_err()
    {
        warn!("Final traffic flush timed out");
    }
}

async fn flush_once(ctx: &Arc<ServerContext>) {
    let records = ctx.counters.drain();
    if records.is_empty() {
        return;
    }
    match ctx.catalog.append_traffic(&records).await {
        Ok(()) => debug!(rows = records.len(), "Traffic flushed"),
        Err(e) => warn!(error = %e, rows = records.len(), "Traffic flush failed"),
    }
}
