//! Agent side of forward-UDP session multiplexing.
//!
//! Each connection id maps to one bound UDP socket aimed at the target the
//! server named on first sight. Replies are wrapped as
//! `udp_packet_response` envelopes; sessions idle past the configured
//! window are closed and announced with `udp_close`.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use qtun_core::constants::{MAX_UDP_PAYLOAD, UDP_SWEEP_INTERVAL};
use qtun_core::protocol::{
    ConnectionId, ConnectionRefPayload, Message, UdpPacketPayload, UdpPacketResponsePayload,
};
use qtun_core::{Error, Result};

use crate::context::AgentContext;

struct UdpSession {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    last_activity: Arc<Mutex<Instant>>,
    recv_task: JoinHandle<()>,
}

impl UdpSession {
    fn touch(&self) {
        *self.last_activity.lock().expect("udp session mutex poisoned") = Instant::now();
    }

    fn idle(&self) -> std::time::Duration {
        self.last_activity
            .lock()
            .expect("udp session mutex poisoned")
            .elapsed()
    }

    fn close(self) {
        self.recv_task.abort();
    }
}

/// Live UDP sessions keyed by connection id.
#[derive(Default)]
pub(crate) struct UdpSessionMap {
    inner: Mutex<HashMap<ConnectionId, UdpSession>>,
}

impl UdpSessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, id: &ConnectionId) -> Option<(Arc<UdpSocket>, SocketAddr)> {
        let map = self.inner.lock().expect("udp map mutex poisoned");
        map.get(id).map(|s| {
            s.touch();
            (s.socket.clone(), s.target)
        })
    }

    fn insert(&self, id: ConnectionId, session: UdpSession) {
        let mut map = self.inner.lock().expect("udp map mutex poisoned");
        map.insert(id, session);
    }

    /// Close a session (server-initiated or idle expiry).
    pub fn close(&self, id: &ConnectionId) {
        let removed = {
            let mut map = self.inner.lock().expect("udp map mutex poisoned");
            map.remove(id)
        };
        if let Some(session) = removed {
            debug!(id = %id, "UDP session closed");
            session.close();
        }
    }

    /// Ids of sessions idle past the window.
    fn expired(&self, window: std::time::Duration) -> Vec<ConnectionId> {
        let map = self.inner.lock().expect("udp map mutex poisoned");
        map.iter()
            .filter(|(_, s)| s.idle() >= window)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn close_all(&self) {
        let drained: Vec<UdpSession> = {
            let mut map = self.inner.lock().expect("udp map mutex poisoned");
            map.drain().map(|(_, s)| s).collect()
        };
        for session in drained {
            session.close();
        }
    }
}

/// Deliver one datagram envelope from the server, lazily creating the
/// session on first sight of its connection id.
pub(crate) async fn handle_packet(ctx: &Arc<AgentContext>, payload: UdpPacketPayload) {
    let data = match BASE64.decode(payload.data.as_bytes()) {
        Ok(data) => data,
        Err(e) => {
            warn!(id = %payload.connection_id, error = %e, "Undecodable UDP payload");
            return;
        }
    };

    let (socket, target) = match ctx.udp.lookup(&payload.connection_id) {
        Some(session) => session,
        None => match open_session(ctx, &payload).await {
            Ok(session) => session,
            Err(e) => {
                warn!(
                    id = %payload.connection_id,
                    target = %format!("{}:{}", payload.target_host, payload.target_port),
                    error = %e,
                    "Could not open UDP session"
                );
                return;
            }
        },
    };

    if let Err(e) = socket.send_to(&data, target).await {
        debug!(id = %payload.connection_id, error = %e, "UDP send failed");
    }
}

async fn open_session(
    ctx: &Arc<AgentContext>,
    payload: &UdpPacketPayload,
) -> Result<(Arc<UdpSocket>, SocketAddr)> {
    let target = resolve_target(&payload.target_host, payload.target_port).await?;

    // Bind in the target's address family.
    let bind_addr = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = Arc::new(UdpSocket::bind(bind_addr).await?);

    let last_activity = Arc::new(Mutex::new(Instant::now()));
    let recv_task = tokio::spawn(run_recv(
        ctx.outbox(),
        socket.clone(),
        payload.connection_id.clone(),
        last_activity.clone(),
    ));

    debug!(
        id = %payload.connection_id,
        %target,
        name = %payload.proxy_name,
        "UDP session opened"
    );

    ctx.udp.insert(
        payload.connection_id.clone(),
        UdpSession {
            socket: socket.clone(),
            target,
            last_activity,
            recv_task,
        },
    );
    Ok((socket, target))
}

async fn resolve_target(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| Error::protocol(format!("unresolvable UDP target: {host}")))
}

/// Reply pump: every datagram the target sends goes back over the control
/// channel.
async fn run_recv(
    outbox: mpsc::Sender<Message>,
    socket: Arc<UdpSocket>,
    connection_id: ConnectionId,
    last_activity: Arc<Mutex<Instant>>,
) {
    let mut buf = vec![0u8; MAX_UDP_PAYLOAD];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, _from)) => {
                *last_activity.lock().expect("udp session mutex poisoned") = Instant::now();
                let reply = Message::UdpPacketResponse(UdpPacketResponsePayload {
                    connection_id: connection_id.clone(),
                    data: BASE64.encode(&buf[..len]),
                });
                if outbox.send(reply).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(id = %connection_id, error = %e, "UDP receive failed");
                break;
            }
        }
    }
}

/// Close sessions idle past the configured window and tell the server.
pub(crate) async fn run_idle_sweep(ctx: Arc<AgentContext>) {
    let mut tick = tokio::time::interval(UDP_SWEEP_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tick.tick().await;
        for id in ctx.udp.expired(ctx.config.udp_idle_timeout) {
            debug!(id = %id, "UDP session idle; closing");
            ctx.udp.close(&id);
            let close = Message::UdpClose(ConnectionRefPayload {
                connection_id: id,
            });
            if ctx.send(close).await.is_err() {
                return;
            }
        }
    }
}
