//! Server-side forward engines, one module per entry style.
//!
//! `tcp` and `socks` accept users on server listeners (forward direction);
//! `reverse` serves negotiations started by the agent (reverse direction).

pub(crate) mod reverse;
pub(crate) mod socks;
pub(crate) mod tcp;

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::debug;

use qtun_core::constants::MAX_PRE_DATA;

/// Why a wait for the twin side ended without a handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitEnd {
    /// The deadline fired first.
    TimedOut,
    /// The entry was failed (session teardown) or the signal source died.
    Cancelled,
    /// The socket we were holding closed while waiting.
    PeerClosed,
}

/// Wait for a oneshot signal while the held socket stays owned by this
/// task. Bytes the peer sends meanwhile are buffered into `pre` (up to
/// [`MAX_PRE_DATA`]; past that the socket is left unread and TCP flow
/// control takes over).
pub(crate) async fn wait_for<T>(
    stream: &mut TcpStream,
    rx: &mut oneshot::Receiver<T>,
    deadline: Duration,
    pre: &mut Vec<u8>,
) -> Result<T, WaitEnd> {
    let timeout = tokio::time::sleep(deadline);
    tokio::pin!(timeout);

    let mut buf = [0u8; 8192];
    loop {
        tokio::select! {
            signal = &mut *rx => {
                return signal.map_err(|_| WaitEnd::Cancelled);
            }
            _ = &mut timeout => {
                return Err(WaitEnd::TimedOut);
            }
            read = stream.read(&mut buf), if pre.len() < MAX_PRE_DATA => {
                match read {
                    Ok(0) => return Err(WaitEnd::PeerClosed),
                    Ok(n) => pre.extend_from_slice(&buf[..n]),
                    Err(e) => {
                        debug!(error = %e, "Held socket failed while waiting for twin");
                        return Err(WaitEnd::PeerClosed);
                    }
                }
            }
        }
    }
}
