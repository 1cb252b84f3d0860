//! Minimal SOCKS5 negotiation for dynamic forwards.
//!
//! Implements the RFC 1928 subset the tunnel needs:
//! - No authentication (method 0x00)
//! - CONNECT command only
//! - IPv4, IPv6, and domain name addresses
//!
//! The success reply is NOT sent by [`negotiate`]; the forward engine sends
//! it once the far side has confirmed the dial, so a failed dial can still
//! be reported as a SOCKS failure.

use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result};

pub const SOCKS_VERSION: u8 = 0x05;
pub const AUTH_NO_AUTH: u8 = 0x00;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
pub const CMD_CONNECT: u8 = 0x01;
pub const ADDR_IPV4: u8 = 0x01;
pub const ADDR_DOMAIN: u8 = 0x03;
pub const ADDR_IPV6: u8 = 0x04;
pub const REPLY_SUCCESS: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDR_NOT_SUPPORTED: u8 = 0x08;

/// A SOCKS5 destination address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl TargetAddr {
    /// Render the host portion as the string handed to the dialing side.
    pub fn host_string(&self) -> String {
        match self {
            TargetAddr::Ipv4(ip) => ip.to_string(),
            TargetAddr::Ipv6(ip) => ip.to_string(),
            TargetAddr::Domain(d) => d.clone(),
        }
    }

    /// Encode as `ATYP ADDR PORT` (the request tail after `VER CMD RSV`).
    pub fn encode(&self, port: u16) -> Vec<u8> {
        let mut out = Vec::with_capacity(19);
        match self {
            TargetAddr::Ipv4(ip) => {
                out.push(ADDR_IPV4);
                out.extend_from_slice(&ip.octets());
            }
            TargetAddr::Ipv6(ip) => {
                out.push(ADDR_IPV6);
                out.extend_from_slice(&ip.octets());
            }
            TargetAddr::Domain(d) => {
                out.push(ADDR_DOMAIN);
                out.push(d.len() as u8);
                out.extend_from_slice(d.as_bytes());
            }
        }
        out.extend_from_slice(&port.to_be_bytes());
        out
    }

    /// Decode an `ATYP ADDR PORT` sequence. Returns the address, port and
    /// number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(TargetAddr, u16, usize)> {
        let atyp = *buf.first().ok_or_else(|| Error::protocol("empty socks address"))?;
        let (addr, addr_len) = match atyp {
            ADDR_IPV4 => {
                let octets: [u8; 4] = buf
                    .get(1..5)
                    .and_then(|s| s.try_into().ok())
                    .ok_or_else(|| Error::protocol("truncated IPv4 address"))?;
                (TargetAddr::Ipv4(Ipv4Addr::from(octets)), 4)
            }
            ADDR_IPV6 => {
                let octets: [u8; 16] = buf
                    .get(1..17)
                    .and_then(|s| s.try_into().ok())
                    .ok_or_else(|| Error::protocol("truncated IPv6 address"))?;
                (TargetAddr::Ipv6(Ipv6Addr::from(octets)), 16)
            }
            ADDR_DOMAIN => {
                let len = *buf.get(1).ok_or_else(|| Error::protocol("truncated domain length"))? as usize;
                let raw = buf
                    .get(2..2 + len)
                    .ok_or_else(|| Error::protocol("truncated domain name"))?;
                let domain = std::str::from_utf8(raw)
                    .map_err(|_| Error::protocol("invalid domain name encoding"))?;
                (TargetAddr::Domain(domain.to_string()), 1 + len)
            }
            other => {
                return Err(Error::protocol(format!("unsupported address type: {other}")));
            }
        };

        let port_off = 1 + addr_len;
        let port_buf: [u8; 2] = buf
            .get(port_off..port_off + 2)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| Error::protocol("truncated port"))?;

        Ok((addr, u16::from_be_bytes(port_buf), port_off + 2))
    }
}

/// Send a SOCKS5 reply with the given code and a zero bound address.
pub async fn send_reply<S: AsyncWrite + Unpin>(stream: &mut S, reply: u8) -> Result<()> {
    // VER REP RSV ATYP BND.ADDR BND.PORT, bound address 0.0.0.0:0
    let response = [
        SOCKS_VERSION,
        reply,
        0x00,
        ADDR_IPV4,
        0x00,
        0x00,
        0x00,
        0x00,
        0x00,
        0x00,
    ];
    stream.write_all(&response).await?;
    Ok(())
}

/// Run the greeting + CONNECT request exchange with a user socket.
///
/// On success the method-select reply (`05 00`) has been written and the
/// parsed `(host, port)` target is returned; the final reply is left to the
/// caller. Unsupported commands and address types get the matching error
/// reply before the error is returned.
pub async fn negotiate<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<(String, u16)> {
    // Greeting: VER NMETHODS METHODS...
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;

    if head[0] != SOCKS_VERSION {
        return Err(Error::protocol(format!("unsupported SOCKS version: {}", head[0])));
    }

    let nmethods = head[1] as usize;
    let mut methods = [0u8; 255];
    stream.read_exact(&mut methods[..nmethods]).await?;

    if !methods[..nmethods].contains(&AUTH_NO_AUTH) {
        stream.write_all(&[SOCKS_VERSION, AUTH_NO_ACCEPTABLE]).await?;
        return Err(Error::protocol("no acceptable authentication method"));
    }
    stream.write_all(&[SOCKS_VERSION, AUTH_NO_AUTH]).await?;

    // Request: VER CMD RSV ATYP ...
    let mut req = [0u8; 4];
    stream.read_exact(&mut req).await?;

    if req[0] != SOCKS_VERSION {
        return Err(Error::protocol("invalid SOCKS version in request"));
    }

    if req[1] != CMD_CONNECT {
        send_reply(stream, REPLY_CMD_NOT_SUPPORTED).await?;
        return Err(Error::protocol(format!("unsupported command: {}", req[1])));
    }

    let addr = match req[3] {
        ADDR_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            TargetAddr::Ipv4(Ipv4Addr::from(octets))
        }
        ADDR_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            TargetAddr::Ipv6(Ipv6Addr::from(octets))
        }
        ADDR_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            let domain = String::from_utf8(domain)
                .map_err(|_| Error::protocol("invalid domain name encoding"))?;
            TargetAddr::Domain(domain)
        }
        other => {
            send_reply(stream, REPLY_ADDR_NOT_SUPPORTED).await?;
            return Err(Error::protocol(format!("unsupported address type: {other}")));
        }
    };

    let mut port_buf = [0u8; 2];
    stream.read_exact(&mut port_buf).await?;

    Ok((addr.host_string(), u16::from_be_bytes(port_buf)))
}
