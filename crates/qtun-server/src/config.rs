//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use qtun_core::constants::{
    DIAL_TIMEOUT, FLUSH_INTERVAL, HEARTBEAT_TIMEOUT, KEEPALIVE_TIME, PENDING_TIMEOUT,
};

/// Tunable knobs for [`crate::TunnelServer`].
///
/// The defaults match the protocol's documented timings; operators mostly
/// only change `bind_addr`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the control listener binds.
    pub bind_addr: SocketAddr,
    /// Deadline for a pending entry's twin data connection.
    pub pending_timeout: Duration,
    /// Timeout on server-side target dials (reverse modes).
    pub dial_timeout: Duration,
    /// Heartbeat deadline; reset on every heartbeat from the agent.
    pub heartbeat_timeout: Duration,
    /// TCP keepalive time applied to control sockets.
    pub keepalive_time: Duration,
    /// Traffic meter flush cadence.
    pub flush_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8024".parse().expect("static addr"),
            pending_timeout: PENDING_TIMEOUT,
            dial_timeout: DIAL_TIMEOUT,
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
            keepalive_time: KEEPALIVE_TIME,
            flush_interval: FLUSH_INTERVAL,
        }
    }
}
