//! Server half of forward-UDP session multiplexing.
//!
//! Datagrams ride the control channel as base64 envelopes; there is no
//! per-datagram data connection. Each distinct external source observed on
//! a bound UDP port gets a stable connection id; replies from the agent
//! are routed back through the same socket to that source.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, warn};

use qtun_core::constants::MAX_UDP_PAYLOAD;
use qtun_core::forward::{Forward, ForwardId};
use qtun_core::protocol::{ConnectionId, Message, UdpPacketPayload, UdpPacketResponsePayload};

use crate::context::ServerContext;
use crate::registry::SessionHandle;

struct UdpRoute {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    forward_id: ForwardId,
    session_id: u64,
}

/// Reply-routing table: connection id → (socket, original source).
#[derive(Default)]
pub(crate) struct UdpRouteTable {
    inner: Mutex<HashMap<ConnectionId, UdpRoute>>,
}

impl UdpRouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(
        &self,
        id: ConnectionId,
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        forward_id: ForwardId,
        session_id: u64,
    ) {
        let mut map = self.inner.lock().expect("udp route mutex poisoned");
        map.insert(
            id,
            UdpRoute {
                socket,
                peer,
                forward_id,
                session_id,
            },
        );
    }

    fn get(&self, id: &ConnectionId) -> Option<(Arc<UdpSocket>, SocketAddr, ForwardId)> {
        let map = self.inner.lock().expect("udp route mutex poisoned");
        map.get(id).map(|r| (r.socket.clone(), r.peer, r.forward_id))
    }

    fn contains(&self, id: &ConnectionId) -> bool {
        let map = self.inner.lock().expect("udp route mutex poisoned");
        map.contains_key(id)
    }

    pub fn remove(&self, id: &ConnectionId) {
        let mut map = self.inner.lock().expect("udp route mutex poisoned");
        map.remove(id);
    }

    /// Drop every route owned by a session (teardown path).
    pub fn remove_session(&self, session_id: u64) {
        let mut map = self.inner.lock().expect("udp route mutex poisoned");
        map.retain(|_, r| r.session_id != session_id);
    }

    fn remove_socket(&self, socket: &Arc<UdpSocket>) {
        let mut map = self.inner.lock().expect("udp route mutex poisoned");
        map.retain(|_, r| !Arc::ptr_eq(&r.socket, socket));
    }
}

/// Receive loop for one bound UDP forward port.
pub(crate) async fn run_acceptor(
    ctx: Arc<ServerContext>,
    session: Arc<SessionHandle>,
    forward: Forward,
    socket: Arc<UdpSocket>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ids: HashMap<SocketAddr, ConnectionId> = HashMap::new();
    let mut buf = vec![0u8; MAX_UDP_PAYLOAD];

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => {
                let (len, peer) = match received {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(port = forward.remote_port, error = %e, "UDP receive failed");
                        continue;
                    }
                };

                let connection_id = match ids.get(&peer) {
                    // An id can disappear under us (agent sent udp_close);
                    // mint a new session in that case.
                    Some(id) if ctx.udp_routes.contains(id) => id.clone(),
                    _ => {
                        let id = ConnectionId::generate();
                        ctx.udp_routes.insert(
                            id.clone(),
                            socket.clone(),
                            peer,
                            forward.id,
                            session.session_id,
                        );
                        ids.insert(peer, id.clone());
                        debug!(%peer, id = %id, name = %forward.name, "New UDP session");
                        id
                    }
                };

                ctx.counters.add_in(forward.id, len as u64);

                let envelope = Message::UdpPacket(UdpPacketPayload {
                    connection_id,
                    data: BASE64.encode(&buf[..len]),
                    target_host: forward.local_ip.clone(),
                    target_port: forward.local_port,
                    proxy_name: forward.name.clone(),
                });
                if session.send(envelope).await.is_err() {
                    debug!(port = forward.remote_port, "Control session gone; stopping UDP loop");
                    break;
                }
            }
        }
    }

    ctx.udp_routes.remove_socket(&socket);
    debug!(port = forward.remote_port, name = %forward.name, "UDP listener stopped");
}

/// Route an agent reply back to the original external source.
pub(crate) async fn handle_response(ctx: &Arc<ServerContext>, payload: UdpPacketResponsePayload) {
    let Some((socket, peer, forward_id)) = ctx.udp_routes.get(&payload.connection_id) else {
        debug!(id = %payload.connection_id, "UDP reply for unknown session");
        return;
    };

    let data = match BASE64.decode(payload.data.as_bytes()) {
        Ok(d) => d,
        Err(e) => {
            warn!(id = %payload.connection_id, error = %e, "Undecodable UDP reply payload");
            return;
        }
    };

    match socket.send_to(&data, peer).await {
        Ok(sent) => ctx.counters.add_out(forward_id, sent as u64),
        Err(e) => debug!(id = %payload.connection_id, error = %e, "UDP reply send failed"),
    }
}

pub(crate) fn handle_close(ctx: &Arc<ServerContext>, id: &ConnectionId) {
    ctx.udp_routes.remove(id);
}
