//! Port forward model.
//!
//! A forward is a named routing rule owned by an agent. Four directions are
//! supported: `forward` and `dynamic` enter at the server, `reverse` and
//! `reverse-dynamic` enter at the agent. The transport is plain TCP, UDP
//! (forward direction only) or SOCKS5 (dynamic directions only).

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Catalog-assigned agent identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub i64);

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Catalog-assigned forward identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ForwardId(pub i64);

impl std::fmt::Display for ForwardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Direction of a forward: which side traffic enters on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    /// User enters at the server, exits at the agent's local target.
    Forward,
    /// User enters at the agent, exits at the server-side target.
    Reverse,
    /// SOCKS5 proxy on the server, connects out through the agent.
    Dynamic,
    /// SOCKS5 proxy on the agent, connects out through the server.
    ReverseDynamic,
}

impl Direction {
    /// Directions that bind a listener on the server.
    pub fn binds_server(self) -> bool {
        matches!(self, Direction::Forward | Direction::Dynamic)
    }

    /// Directions that negotiate SOCKS5 with the entering user.
    pub fn is_dynamic(self) -> bool {
        matches!(self, Direction::Dynamic | Direction::ReverseDynamic)
    }
}

/// Transport of a forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
    Socks5,
}

/// A configured port forward as stored in the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    pub id: ForwardId,
    pub agent_id: AgentId,
    /// Human name, unique per agent.
    pub name: String,
    pub direction: Direction,
    pub transport: Transport,
    /// Server-side port (bind for forward/dynamic, target for reverse).
    pub remote_port: u16,
    /// Server-side target address for reverse forwards.
    pub remote_ip: String,
    /// Agent-side address (reverse listener bind / forward dial target).
    pub local_ip: String,
    /// Agent-side port.
    pub local_port: u16,
    pub enabled: bool,
}

impl Forward {
    /// Validate the direction/transport combination and addressing.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Forward {
                message: "forward name must not be empty".into(),
            });
        }

        match (self.direction, self.transport) {
            (d, Transport::Socks5) if !d.is_dynamic() => Err(Error::Forward {
                message: format!("socks5 transport requires a dynamic direction ({})", self.name),
            }),
            (d, Transport::Udp) if d != Direction::Forward => Err(Error::Forward {
                message: format!("udp transport requires the forward direction ({})", self.name),
            }),
            _ => Ok(()),
        }
    }

    /// Whether an enabled instance of this forward binds a server port.
    pub fn binds_server(&self) -> bool {
        self.enabled && self.direction.binds_server()
    }
}

/// Wire shape of a forward as pushed to the agent in `auth_response` and
/// `config_update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortForward {
    pub name: String,
    pub direction: Direction,
    pub proxy_type: Transport,
    pub remote_port: u16,
    pub remote_ip: String,
    pub local_ip: String,
    pub local_port: u16,
}

impl From<&Forward> for PortForward {
    fn from(f: &Forward) -> Self {
        PortForward {
            name: f.name.clone(),
            direction: f.direction,
            proxy_type: f.transport,
            remote_port: f.remote_port,
            remote_ip: f.remote_ip.clone(),
            local_ip: f.local_ip.clone(),
            local_port: f.local_port,
        }
    }
}
