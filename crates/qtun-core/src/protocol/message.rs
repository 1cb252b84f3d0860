//! Top-level protocol message enum.
//!
//! The `type` tag uses snake_case names; payload fields use camelCase, the
//! shape agents of every prior protocol revision expect. Unknown `type`
//! values decode to [`Message::Unknown`] so newer peers never kill a
//! session by sending something we don't understand yet.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::forward::PortForward;

/// Server-assigned identifier that pairs a user connection with its twin
/// data connection. Time-prefixed with a random suffix so ids stay unique
/// across the process without coordination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Generate a fresh collision-resistant id.
    pub fn generate() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let nonce: u64 = rand::random();
        ConnectionId(format!("{millis:x}-{nonce:016x}"))
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Initial authentication frame, agent → server. A missing token decodes
/// to the empty string, which resolves to no agent and gets a proper
/// `auth_response {success: false}` instead of a silent destroy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlHandshakePayload {
    #[serde(default)]
    pub token: String,
}

/// Authentication outcome, server → agent. Carries the authoritative
/// forward list on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponsePayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_forwards: Option<Vec<PortForward>>,
}

/// New authoritative forward list after a catalog change, server → agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigUpdatePayload {
    pub port_forwards: Vec<PortForward>,
}

/// Payload carrying only a connection id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRefPayload {
    pub connection_id: ConnectionId,
}

/// Negative outcome for a negotiation identified by connection id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionFailedPayload {
    pub connection_id: ConnectionId,
    pub error: String,
}

/// Dial instruction for a forward TCP connection, server → agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewConnectionPayload {
    pub proxy_name: String,
    pub connection_id: ConnectionId,
}

/// Dial instruction for a forward SOCKS5 connection, server → agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicConnectionPayload {
    pub proxy_name: String,
    pub connection_id: ConnectionId,
    pub target_host: String,
    pub target_port: u16,
}

/// Reverse-TCP negotiation start, agent → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReverseConnectionPayload {
    pub proxy_name: String,
    pub connection_id: ConnectionId,
}

/// Reverse-SOCKS5 negotiation start, agent → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReverseDynamicPayload {
    pub proxy_name: String,
    pub connection_id: ConnectionId,
    pub target_host: String,
    pub target_port: u16,
}

/// UDP datagram envelope, server → agent. `data` is base64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UdpPacketPayload {
    pub connection_id: ConnectionId,
    pub data: String,
    pub target_host: String,
    pub target_port: u16,
    pub proxy_name: String,
}

/// UDP reply envelope, agent → server. `data` is base64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UdpPacketResponsePayload {
    pub connection_id: ConnectionId,
    pub data: String,
}

// =============================================================================
// Top-level Message Enum
// =============================================================================

/// Top-level protocol message type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    // =========================================================================
    // Agent → server
    // =========================================================================
    /// Initial authentication.
    ControlHandshake(ControlHandshakePayload),
    /// First frame on a secondary TCP connection; joins a pending entry.
    DataConnection(ConnectionRefPayload),
    /// Liveness probe, sent on a fixed cadence.
    Heartbeat {},
    /// Begin reverse-TCP negotiation.
    ReverseConnection(ReverseConnectionPayload),
    /// Begin reverse-SOCKS5 negotiation.
    ReverseDynamic(ReverseDynamicPayload),
    /// Agent-side dial for a forward SOCKS5 connect succeeded.
    DynamicReady(ConnectionRefPayload),
    /// Agent-side dial for a forward SOCKS5 connect failed.
    DynamicFailed(ConnectionFailedPayload),
    /// UDP reply from the agent-side target.
    UdpPacketResponse(UdpPacketResponsePayload),
    /// Legacy self-registration; forwards are catalog-driven and this is
    /// logged and discarded.
    Register(serde_json::Value),

    // =========================================================================
    // Server → agent
    // =========================================================================
    /// Authentication outcome with the authoritative forward list.
    AuthResponse(AuthResponsePayload),
    /// New authoritative forward list.
    ConfigUpdate(ConfigUpdatePayload),
    /// Dial instruction for forward TCP.
    NewConnection(NewConnectionPayload),
    /// Dial instruction for forward SOCKS5.
    DynamicConnection(DynamicConnectionPayload),
    /// Server-side dial for reverse TCP succeeded.
    ReverseReady(ConnectionRefPayload),
    /// Server-side dial for reverse TCP failed.
    ReverseFailed(ConnectionFailedPayload),
    /// Server-side dial for reverse SOCKS5 succeeded.
    ReverseDynamicReady(ConnectionRefPayload),
    /// Server-side dial for reverse SOCKS5 failed.
    ReverseDynamicFailed(ConnectionFailedPayload),
    /// UDP datagram to deliver on the agent side.
    UdpPacket(UdpPacketPayload),
    /// Heartbeat acknowledgment.
    HeartbeatAck {},

    // =========================================================================
    // Either direction
    // =========================================================================
    /// End of a UDP session.
    UdpClose(ConnectionRefPayload),
    /// Any `type` this build doesn't know. Logged and skipped.
    #[serde(other)]
    Unknown,
}

impl Message {
    /// The wire `type` tag, for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::ControlHandshake(_) => "control_handshake",
            Message::DataConnection(_) => "data_connection",
            Message::Heartbeat {} => "heartbeat",
            Message::ReverseConnection(_) => "reverse_connection",
            Message::ReverseDynamic(_) => "reverse_dynamic",
            Message::DynamicReady(_) => "dynamic_ready",
            Message::DynamicFailed(_) => "dynamic_failed",
            Message::UdpPacketResponse(_) => "udp_packet_response",
            Message::Register(_) => "register",
            Message::AuthResponse(_) => "auth_response",
            Message::ConfigUpdate(_) => "config_update",
            Message::NewConnection(_) => "new_connection",
            Message::DynamicConnection(_) => "dynamic_connection",
            Message::ReverseReady(_) => "reverse_ready",
            Message::ReverseFailed(_) => "reverse_failed",
            Message::ReverseDynamicReady(_) => "reverse_dynamic_ready",
            Message::ReverseDynamicFailed(_) => "reverse_dynamic_failed",
            Message::UdpPacket(_) => "udp_packet",
            Message::HeartbeatAck {} => "heartbeat_ack",
            Message::UdpClose(_) => "udp_close",
            Message::Unknown => "unknown",
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_wire_shape() {
        let msg = Message::ControlHandshake(ControlHandshakePayload {
            token: "T".into(),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "control_handshake");
        assert_eq!(json["token"], "T");
    }

    #[test]
    fn connection_id_fields_are_camel_case() {
        let msg = Message::NewConnection(NewConnectionPayload {
            proxy_name: "ssh".into(),
            connection_id: ConnectionId("abc".into()),
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "new_connection");
        assert_eq!(json["proxyName"], "ssh");
        assert_eq!(json["connectionId"], "abc");
    }

    #[test]
    fn heartbeat_round_trip() {
        let json = serde_json::to_string(&Message::Heartbeat {}).unwrap();
        assert_eq!(json, r#"{"type":"heartbeat"}"#);
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Message::Heartbeat {});
    }

    #[test]
    fn auth_response_omits_empty_fields() {
        let ok = Message::AuthResponse(AuthResponsePayload {
            success: true,
            error: None,
            port_forwards: Some(Vec::new()),
        });
        let json = serde_json::to_value(&ok).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["portForwards"], serde_json::json!([]));
    }

    #[test]
    fn unknown_type_decodes_to_unknown() {
        let back: Message =
            serde_json::from_str(r#"{"type":"quantum_entangle","connectionId":"x"}"#).unwrap();
        assert_eq!(back, Message::Unknown);
    }

    #[test]
    fn reverse_dynamic_round_trip() {
        let msg = Message::ReverseDynamic(ReverseDynamicPayload {
            proxy_name: "proxy".into(),
            connection_id: ConnectionId::generate(),
            target_host: "example.com".into(),
            target_port: 443,
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"reverse_dynamic""#));
        assert!(json.contains(r#""targetHost":"example.com""#));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn generated_ids_are_distinct() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert_ne!(a, b);
    }
}
