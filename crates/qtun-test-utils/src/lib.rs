//! Test fixtures for the qtun workspace: an in-memory catalog and small
//! network helpers (echo servers, free-port picking).

mod memory_catalog;

pub use memory_catalog::MemoryCatalog;

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

use qtun_core::forward::{AgentId, Direction, Forward, ForwardId, Transport};

/// Build a forward with loopback addressing; tests fill in the ports.
pub fn forward_fixture(
    id: i64,
    agent_id: i64,
    name: &str,
    direction: Direction,
    transport: Transport,
) -> Forward {
    Forward {
        id: ForwardId(id),
        agent_id: AgentId(agent_id),
        name: name.to_string(),
        direction,
        transport,
        remote_port: 0,
        remote_ip: "127.0.0.1".to_string(),
        local_ip: "127.0.0.1".to_string(),
        local_port: 0,
        enabled: true,
    }
}

/// Reserve a free loopback TCP port. Racy by nature, good enough for
/// loopback tests.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind :0");
    listener.local_addr().expect("local addr").port()
}

/// Spawn a TCP echo server; returns its address. The server echoes until
/// EOF, then closes, so FIN propagation is observable end to end.
pub async fn tcp_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind echo");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// Spawn a UDP echo server; returns its address.
pub async fn udp_echo_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind echo");
    let addr = socket.local_addr().expect("local addr");

    tokio::spawn(async move {
        let mut buf = [0u8; 65536];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });

    addr
}
