//! Control-plane wire protocol.
//!
//! Messages are JSON objects, one per line, tagged by a `type` field. The
//! codec splits the byte stream on `\n` and keeps any bytes that follow a
//! decoded frame available as residual payload (used when a secondary
//! connection's first frame is `data_connection` and tunneled bytes are
//! already buffered behind it).

mod codec;
mod message;
#[cfg(test)]
mod proptest;

pub use codec::{LineReader, decode, encode, write_message};
pub use message::{
    AuthResponsePayload, ConfigUpdatePayload, ConnectionFailedPayload, ConnectionId,
    ConnectionRefPayload, ControlHandshakePayload, DynamicConnectionPayload, Message,
    NewConnectionPayload, ReverseConnectionPayload, ReverseDynamicPayload, UdpPacketPayload,
    UdpPacketResponsePayload,
};
