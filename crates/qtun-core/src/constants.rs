//! Protocol and configuration constants for qtun.

use std::time::Duration;

// =============================================================================
// Framing Constants
// =============================================================================

/// Maximum length of a single control frame (one JSON line).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Copy buffer size for spliced connection pairs.
pub const PIPE_BUFFER_SIZE: usize = 32 * 1024;

/// Receive buffer for UDP datagrams.
pub const MAX_UDP_PAYLOAD: usize = 65536;

/// Cap on bytes buffered from a waiting socket before its twin arrives.
/// Beyond this the socket is simply left unread until the pair forms.
pub const MAX_PRE_DATA: usize = 256 * 1024;

// =============================================================================
// Timing Constants
// =============================================================================

/// Agent heartbeat send cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Server-side heartbeat deadline, reset on each heartbeat.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(40);

/// TCP keepalive time on control sockets.
pub const KEEPALIVE_TIME: Duration = Duration::from_secs(20);

/// Deadline for the twin data connection of a pending entry.
pub const PENDING_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout on outbound target dials (server and agent side).
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Traffic meter flush cadence.
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Bound on the final traffic flush at shutdown.
pub const FINAL_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Agent-side UDP session idle expiry.
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Cadence of the agent-side UDP idle sweep.
pub const UDP_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Minimum delay between agent reconnect attempts.
pub const RECONNECT_MIN_DELAY: Duration = Duration::from_secs(1);

/// Maximum delay between agent reconnect attempts.
pub const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_deadline_exceeds_interval() {
        // A deadline shorter than the send cadence would expire healthy agents.
        assert!(HEARTBEAT_TIMEOUT > HEARTBEAT_INTERVAL);
    }

    #[test]
    fn reconnect_backoff_is_ordered() {
        assert!(RECONNECT_MIN_DELAY < RECONNECT_MAX_DELAY);
    }

    #[test]
    fn udp_sweep_runs_within_idle_window() {
        assert!(UDP_SWEEP_INTERVAL <= UDP_IDLE_TIMEOUT);
    }
}
