//! Agent configuration.

use std::time::Duration;

use qtun_core::constants::{
    DIAL_TIMEOUT, HEARTBEAT_INTERVAL, KEEPALIVE_TIME, PENDING_TIMEOUT, RECONNECT_MAX_DELAY,
    RECONNECT_MIN_DELAY, UDP_IDLE_TIMEOUT,
};

/// Tunable knobs for [`crate::TunnelAgent`].
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Server control address, `host:port`.
    pub server_addr: String,
    /// Authentication token issued by the catalog.
    pub token: String,
    /// Heartbeat send cadence.
    pub heartbeat_interval: Duration,
    /// How long to wait for negotiation replies (`auth_response`,
    /// `reverse_ready`, ...).
    pub pending_timeout: Duration,
    /// Timeout on local and target dials.
    pub dial_timeout: Duration,
    /// Idle expiry for UDP sessions.
    pub udp_idle_timeout: Duration,
    /// TCP keepalive time on the control socket.
    pub keepalive_time: Duration,
    /// Reconnect backoff bounds.
    pub reconnect_min_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl AgentConfig {
    /// Config with protocol-default timings.
    pub fn new(server_addr: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            token: token.into(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            pending_timeout: PENDING_TIMEOUT,
            dial_timeout: DIAL_TIMEOUT,
            udp_idle_timeout: UDP_IDLE_TIMEOUT,
            keepalive_time: KEEPALIVE_TIME,
            reconnect_min_delay: RECONNECT_MIN_DELAY,
            reconnect_max_delay: RECONNECT_MAX_DELAY,
        }
    }
}
