//! Small socket helpers shared by server and agent.

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tracing::debug;

/// Enable TCP keepalive on a control socket. Failure is logged, not fatal:
/// the heartbeat still bounds liveness.
pub fn apply_keepalive(stream: &TcpStream, time: Duration) {
    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new().with_time(time);
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        debug!(error = %e, "Failed to enable TCP keepalive");
    }
}
