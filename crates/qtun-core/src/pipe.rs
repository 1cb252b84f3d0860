//! Bidirectional splice between a user-side socket and its twin data
//! connection.
//!
//! Convention: the `user` argument is the side the originating user entered
//! on (or the dialed destination for reverse modes is `peer`); bytes
//! flowing `user → peer` count as "in", `peer → user` as "out". Call sites
//! order the arguments so that "in" always means user-to-destination.
//!
//! EOF on one side half-closes the other; a read or write error tears both
//! directions down. Pre-buffered bytes (SOCKS preData, residual bytes that
//! followed the `data_connection` frame) are flushed, in order, before live
//! copying starts.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::Result;
use crate::constants::PIPE_BUFFER_SIZE;
use crate::meter::MeterHandle;

/// Splice `user` and `peer` until both directions finish.
///
/// `user_pre` is flushed to `peer` (counted as "in") and `peer_pre` to
/// `user` (counted as "out") before copying begins.
pub async fn splice<U, P>(
    user: U,
    peer: P,
    user_pre: Vec<u8>,
    peer_pre: Vec<u8>,
    meter: Option<MeterHandle>,
) -> Result<()>
where
    U: AsyncRead + AsyncWrite + Unpin,
    P: AsyncRead + AsyncWrite + Unpin,
{
    let (mut user_rd, mut user_wr) = tokio::io::split(user);
    let (mut peer_rd, mut peer_wr) = tokio::io::split(peer);

    if !user_pre.is_empty() {
        peer_wr.write_all(&user_pre).await?;
        if let Some(m) = &meter {
            m.count_in(user_pre.len());
        }
    }
    if !peer_pre.is_empty() {
        user_wr.write_all(&peer_pre).await?;
        if let Some(m) = &meter {
            m.count_out(peer_pre.len());
        }
    }

    let inbound_meter = meter.clone();
    let inbound = async {
        let mut buf = vec![0u8; PIPE_BUFFER_SIZE];
        loop {
            match user_rd.read(&mut buf).await {
                Ok(0) => {
                    let _ = peer_wr.shutdown().await;
                    break;
                }
                Ok(n) => {
                    if peer_wr.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                    if let Some(m) = &inbound_meter {
                        m.count_in(n);
                    }
                }
                Err(e) => {
                    trace!(error = %e, "user-side read ended");
                    let _ = peer_wr.shutdown().await;
                    break;
                }
            }
        }
    };

    let outbound = async {
        let mut buf = vec![0u8; PIPE_BUFFER_SIZE];
        loop {
            match peer_rd.read(&mut buf).await {
                Ok(0) => {
                    let _ = user_wr.shutdown().await;
                    break;
                }
                Ok(n) => {
                    if user_wr.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                    if let Some(m) = &meter {
                        m.count_out(n);
                    }
                }
                Err(e) => {
                    trace!(error = %e, "peer-side read ended");
                    let _ = user_wr.shutdown().await;
                    break;
                }
            }
        }
    };

    tokio::join!(inbound, outbound);
    Ok(())
}
