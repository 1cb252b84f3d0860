//! Property-based tests for the line codec and SOCKS5 address codec.
//!
//! These tests verify:
//! - Codec roundtrip for arbitrary messages
//! - Frame-sync recovery: arbitrary bytes never panic the decoder
//! - Concatenated frames decode in order
//! - SOCKS5 address+port roundtrip for all three ATYPs

#![cfg(test)]

use bytes::BytesMut;
use proptest::prelude::*;

use crate::protocol::{
    ConnectionFailedPayload, ConnectionId, ConnectionRefPayload, ControlHandshakePayload,
    DynamicConnectionPayload, Message, NewConnectionPayload, UdpPacketPayload, decode, encode,
};
use crate::socks::TargetAddr;

// =============================================================================
// Arbitrary Generators
// =============================================================================

fn arb_connection_id() -> impl Strategy<Value = ConnectionId> {
    "[a-f0-9]{8,24}".prop_map(ConnectionId)
}

fn arb_message() -> impl Strategy<Value = Message> {
    prop_oneof![
        Just(Message::Heartbeat {}),
        Just(Message::HeartbeatAck {}),
        "[ -~]{0,64}".prop_map(|token| {
            Message::ControlHandshake(ControlHandshakePayload { token })
        }),
        arb_connection_id().prop_map(|connection_id| {
            Message::DataConnection(ConnectionRefPayload { connection_id })
        }),
        (arb_connection_id(), "[a-z0-9-]{1,32}").prop_map(|(connection_id, proxy_name)| {
            Message::NewConnection(NewConnectionPayload {
                proxy_name,
                connection_id,
            })
        }),
        (arb_connection_id(), "[a-z0-9-]{1,32}", "[a-z0-9.]{1,64}", any::<u16>()).prop_map(
            |(connection_id, proxy_name, target_host, target_port)| {
                Message::DynamicConnection(DynamicConnectionPayload {
                    proxy_name,
                    connection_id,
                    target_host,
                    target_port,
                })
            }
        ),
        (arb_connection_id(), "[ -~]{0,64}").prop_map(|(connection_id, error)| {
            Message::ReverseFailed(ConnectionFailedPayload {
                connection_id,
                error,
            })
        }),
        (arb_connection_id(), "[A-Za-z0-9+/=]{0,88}", "[a-z0-9.]{1,32}", any::<u16>()).prop_map(
            |(connection_id, data, target_host, target_port)| {
                Message::UdpPacket(UdpPacketPayload {
                    connection_id,
                    data,
                    target_host,
                    target_port,
                    proxy_name: "udp".into(),
                })
            }
        ),
    ]
}

fn arb_target_addr() -> impl Strategy<Value = TargetAddr> {
    prop_oneof![
        any::<[u8; 4]>().prop_map(|o| TargetAddr::Ipv4(o.into())),
        any::<[u8; 16]>().prop_map(|o| TargetAddr::Ipv6(o.into())),
        "[a-z0-9.-]{1,100}".prop_map(TargetAddr::Domain),
    ]
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(512))]

    #[test]
    fn message_roundtrip(msg in arb_message()) {
        let frame = encode(&msg).unwrap();
        let mut buf = BytesMut::from(&frame[..]);
        let decoded = decode(&mut buf).unwrap().unwrap();
        prop_assert_eq!(decoded, msg);
        prop_assert!(buf.is_empty());
    }

    #[test]
    fn concatenated_frames_decode_in_order(msgs in prop::collection::vec(arb_message(), 1..8)) {
        let mut buf = BytesMut::new();
        for msg in &msgs {
            buf.extend_from_slice(&encode(msg).unwrap());
        }

        for msg in &msgs {
            let decoded = decode(&mut buf).unwrap().unwrap();
            prop_assert_eq!(&decoded, msg);
        }
        prop_assert!(buf.is_empty());
    }

    #[test]
    fn decoder_never_panics_on_arbitrary_bytes(data in prop::collection::vec(any::<u8>(), 0..2048)) {
        let mut buf = BytesMut::from(&data[..]);
        // Drain until no complete line remains; errors consume the bad
        // line, so this terminates.
        loop {
            match decode(&mut buf) {
                Ok(Some(_)) | Err(_) => {
                    if buf.is_empty() {
                        break;
                    }
                }
                Ok(None) => break,
            }
        }
    }

    #[test]
    fn socks_addr_roundtrip(addr in arb_target_addr(), port in any::<u16>()) {
        let wire = addr.encode(port);
        let (back, back_port, consumed) = TargetAddr::decode(&wire).unwrap();
        prop_assert_eq!(back, addr);
        prop_assert_eq!(back_port, port);
        prop_assert_eq!(consumed, wire.len());
    }
}
