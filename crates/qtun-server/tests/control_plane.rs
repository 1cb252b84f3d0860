//! Control-plane integration tests driven by a scripted agent speaking
//! raw JSON lines, so every server behavior is observable at the wire.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;

use qtun_core::forward::{AgentId, Direction, ForwardId, Transport};
use qtun_core::protocol::{
    ConnectionId, ConnectionRefPayload, ControlHandshakePayload, LineReader, Message,
    ReverseConnectionPayload, UdpPacketResponsePayload, write_message,
};
use qtun_server::{ServerConfig, ServerHandle, TunnelServer};
use qtun_test_utils::{MemoryCatalog, forward_fixture, free_port, tcp_echo_server};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

const WAIT: Duration = Duration::from_secs(5);

async fn start_server(catalog: Arc<MemoryCatalog>) -> (ServerHandle, SocketAddr) {
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        pending_timeout: Duration::from_millis(800),
        flush_interval: Duration::from_millis(100),
        ..ServerConfig::default()
    };
    let server = TunnelServer::bind(config, catalog).await.unwrap();
    let addr = server.local_addr();
    let handle = server.handle();
    tokio::spawn(server.run());
    (handle, addr)
}

struct FakeAgent {
    reader: LineReader<OwnedReadHalf>,
    wr: OwnedWriteHalf,
}

impl FakeAgent {
    async fn connect(addr: SocketAddr, token: &str) -> (Self, Message) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (rd, mut wr) = stream.into_split();
        let mut reader = LineReader::new(rd);

        let hello = Message::ControlHandshake(ControlHandshakePayload {
            token: token.into(),
        });
        write_message(&mut wr, &hello).await.unwrap();

        let auth = timeout(WAIT, reader.next_message())
            .await
            .expect("auth reply in time")
            .unwrap()
            .expect("auth reply present");
        (Self { reader, wr }, auth)
    }

    async fn connect_ok(addr: SocketAddr, token: &str) -> Self {
        let (agent, auth) = Self::connect(addr, token).await;
        match auth {
            Message::AuthResponse(p) if p.success => agent,
            other => panic!("expected successful auth, got {other:?}"),
        }
    }

    async fn recv(&mut self) -> Message {
        timeout(WAIT, self.reader.next_message())
            .await
            .expect("message in time")
            .unwrap()
            .expect("stream open")
    }

    async fn send(&mut self, msg: Message) {
        write_message(&mut self.wr, &msg).await.unwrap();
    }

    async fn send_raw(&mut self, line: &str) {
        self.wr.write_all(line.as_bytes()).await.unwrap();
        self.wr.flush().await.unwrap();
    }

    /// Open a data connection for the given id; returns the raw stream.
    async fn open_data(server: SocketAddr, id: &ConnectionId) -> TcpStream {
        let mut stream = TcpStream::connect(server).await.unwrap();
        let frame = qtun_core::protocol::encode(&Message::DataConnection(ConnectionRefPayload {
            connection_id: id.clone(),
        }))
        .unwrap();
        stream.write_all(&frame).await.unwrap();
        stream
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn wait_refused(port: u16) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        match TcpStream::connect(("127.0.0.1", port)).await {
            Err(_) => return,
            Ok(_) => {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "port {port} still accepting"
                );
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

// =============================================================================
// Authentication
// =============================================================================

#[tokio::test]
async fn unknown_token_is_rejected() {
    let catalog = Arc::new(MemoryCatalog::new());
    let (_handle, addr) = start_server(catalog).await;

    let (_agent, auth) = FakeAgent::connect(addr, "nope").await;
    match auth {
        Message::AuthResponse(p) => {
            assert!(!p.success);
            assert!(p.error.is_some());
            assert!(p.port_forwards.is_none());
        }
        other => panic!("expected auth_response, got {other:?}"),
    }
}

#[tokio::test]
async fn disabled_agent_is_rejected() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert_agent("T", 1, "alpha", false);
    let (_handle, addr) = start_server(catalog).await;

    let (_agent, auth) = FakeAgent::connect(addr, "T").await;
    match auth {
        Message::AuthResponse(p) => assert!(!p.success),
        other => panic!("expected auth_response, got {other:?}"),
    }
}

#[tokio::test]
async fn auth_pushes_forward_list_and_binds_ports() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert_agent("T", 1, "alpha", true);
    let port = free_port();
    let mut fwd = forward_fixture(1, 1, "ssh", Direction::Forward, Transport::Tcp);
    fwd.remote_port = port;
    fwd.local_port = 22;
    catalog.insert_forward(fwd);

    let (handle, addr) = start_server(catalog).await;
    let (_agent, auth) = FakeAgent::connect(addr, "T").await;

    match auth {
        Message::AuthResponse(p) => {
            assert!(p.success);
            let forwards = p.port_forwards.unwrap();
            assert_eq!(forwards.len(), 1);
            assert_eq!(forwards[0].name, "ssh");
            assert_eq!(forwards[0].remote_port, port);
        }
        other => panic!("expected auth_response, got {other:?}"),
    }

    wait_until(|| handle.bound_ports().contains(&port)).await;
    assert_eq!(handle.connected_agents(), 1);
}

// =============================================================================
// Forward TCP
// =============================================================================

#[tokio::test]
async fn forward_tcp_pairs_and_meters() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert_agent("T", 1, "alpha", true);
    let port = free_port();
    let mut fwd = forward_fixture(1, 1, "ssh", Direction::Forward, Transport::Tcp);
    fwd.remote_port = port;
    catalog.insert_forward(fwd);

    let (handle, addr) = start_server(catalog.clone()).await;
    let mut agent = FakeAgent::connect_ok(addr, "T").await;
    wait_until(|| handle.bound_ports().contains(&port)).await;

    // User connects and writes before the twin exists: preData.
    let mut user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    user.write_all(b"HELLO\n").await.unwrap();

    let connection_id = match agent.recv().await {
        Message::NewConnection(p) => {
            assert_eq!(p.proxy_name, "ssh");
            p.connection_id
        }
        other => panic!("expected new_connection, got {other:?}"),
    };

    let mut data = FakeAgent::open_data(addr, &connection_id).await;

    // The buffered user bytes arrive first.
    let mut buf = [0u8; 6];
    timeout(WAIT, data.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"HELLO\n");

    // And the return path works.
    data.write_all(b"WORLD\n").await.unwrap();
    timeout(WAIT, user.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"WORLD\n");

    // User FIN propagates to the data side.
    drop(user);
    let mut rest = Vec::new();
    timeout(WAIT, data.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert!(rest.is_empty());

    // The meter flushes nonzero rows for this forward.
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let rows = catalog.traffic();
        if let Some(row) = rows.iter().find(|r| r.forward_id == ForwardId(1)) {
            assert!(row.bytes_in >= 6);
            assert!(row.bytes_out >= 6);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "no traffic flushed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn pending_deadline_destroys_the_user_socket() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert_agent("T", 1, "alpha", true);
    let port = free_port();
    let mut fwd = forward_fixture(1, 1, "ssh", Direction::Forward, Transport::Tcp);
    fwd.remote_port = port;
    catalog.insert_forward(fwd);

    let (handle, addr) = start_server(catalog).await;
    let mut agent = FakeAgent::connect_ok(addr, "T").await;
    wait_until(|| handle.bound_ports().contains(&port)).await;

    let mut user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let _ = agent.recv().await; // new_connection, deliberately ignored

    // No data connection: the 800 ms pending deadline must close the user.
    let mut buf = Vec::new();
    let n = timeout(WAIT, user.read_to_end(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn stale_data_connection_is_destroyed() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert_agent("T", 1, "alpha", true);
    let (_handle, addr) = start_server(catalog).await;
    let _agent = FakeAgent::connect_ok(addr, "T").await;

    let mut data = FakeAgent::open_data(addr, &ConnectionId("never-issued".into())).await;
    let mut buf = Vec::new();
    let n = timeout(WAIT, data.read_to_end(&mut buf)).await.unwrap().unwrap();
    assert_eq!(n, 0);
}

// =============================================================================
// Port conflicts (first agent wins)
// =============================================================================

#[tokio::test]
async fn conflicting_port_stays_with_the_first_agent() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert_agent("TA", 1, "alpha", true);
    catalog.insert_agent("TB", 2, "beta", true);

    let contested = free_port();
    let b_other = free_port();

    let mut fa = forward_fixture(1, 1, "a", Direction::Forward, Transport::Tcp);
    fa.remote_port = contested;
    catalog.insert_forward(fa);

    let mut fb = forward_fixture(2, 2, "b", Direction::Forward, Transport::Tcp);
    fb.remote_port = contested;
    catalog.insert_forward(fb);

    let mut fb2 = forward_fixture(3, 2, "b2", Direction::Forward, Transport::Tcp);
    fb2.remote_port = b_other;
    catalog.insert_forward(fb2);

    let (handle, addr) = start_server(catalog).await;
    let mut agent_a = FakeAgent::connect_ok(addr, "TA").await;
    wait_until(|| handle.bound_ports().contains(&contested)).await;

    let mut agent_b = FakeAgent::connect_ok(addr, "TB").await;
    // B's conflicting forward stays dormant; its other forward binds.
    wait_until(|| handle.bound_ports().contains(&b_other)).await;

    let _user = TcpStream::connect(("127.0.0.1", contested)).await.unwrap();
    match agent_a.recv().await {
        Message::NewConnection(p) => assert_eq!(p.proxy_name, "a"),
        other => panic!("expected new_connection for agent A, got {other:?}"),
    }

    // B must see nothing for the contested port.
    let nothing = timeout(Duration::from_millis(300), agent_b.recv()).await;
    assert!(nothing.is_err(), "agent B unexpectedly received {nothing:?}");
}

// =============================================================================
// Heartbeat
// =============================================================================

#[tokio::test]
async fn heartbeat_is_acked_and_expiry_tears_everything_down() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert_agent("T", 1, "alpha", true);
    let port = free_port();
    let mut fwd = forward_fixture(1, 1, "ssh", Direction::Forward, Transport::Tcp);
    fwd.remote_port = port;
    catalog.insert_forward(fwd);

    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        heartbeat_timeout: Duration::from_millis(400),
        ..ServerConfig::default()
    };
    let server = TunnelServer::bind(config, catalog).await.unwrap();
    let addr = server.local_addr();
    let handle = server.handle();
    tokio::spawn(server.run());

    let mut agent = FakeAgent::connect_ok(addr, "T").await;
    wait_until(|| handle.bound_ports().contains(&port)).await;

    agent.send(Message::Heartbeat {}).await;
    match agent.recv().await {
        Message::HeartbeatAck {} => {}
        other => panic!("expected heartbeat_ack, got {other:?}"),
    }

    // Stop heartbeating; the session must expire and the port close.
    wait_until(|| handle.connected_agents() == 0).await;
    wait_refused(port).await;
}

// =============================================================================
// Reload
// =============================================================================

#[tokio::test]
async fn reload_reconciles_listeners_and_pushes_config_update() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert_agent("T", 1, "alpha", true);

    let p1 = free_port();
    let p2 = free_port();
    let p3 = free_port();

    let mut f1 = forward_fixture(1, 1, "f1", Direction::Forward, Transport::Tcp);
    f1.remote_port = p1;
    catalog.insert_forward(f1);
    let mut f2 = forward_fixture(2, 1, "f2", Direction::Forward, Transport::Tcp);
    f2.remote_port = p2;
    catalog.insert_forward(f2);

    let (handle, addr) = start_server(catalog.clone()).await;
    let mut agent = FakeAgent::connect_ok(addr, "T").await;
    wait_until(|| {
        let ports = handle.bound_ports();
        ports.contains(&p1) && ports.contains(&p2)
    })
    .await;

    // Admin disables f2 and adds f3, then triggers the reload hook.
    catalog.set_forward_enabled(ForwardId(2), false);
    let mut f3 = forward_fixture(3, 1, "f3", Direction::Forward, Transport::Tcp);
    f3.remote_port = p3;
    catalog.insert_forward(f3);
    handle.reload(AgentId(1)).await.unwrap();

    match agent.recv().await {
        Message::ConfigUpdate(p) => {
            let mut names: Vec<_> = p.port_forwards.iter().map(|f| f.name.clone()).collect();
            names.sort();
            assert_eq!(names, vec!["f1".to_string(), "f3".to_string()]);
        }
        other => panic!("expected config_update, got {other:?}"),
    }

    wait_until(|| {
        let ports = handle.bound_ports();
        ports.contains(&p1) && ports.contains(&p3) && !ports.contains(&p2)
    })
    .await;
    wait_refused(p2).await;
    assert!(TcpStream::connect(("127.0.0.1", p3)).await.is_ok());
}

#[tokio::test]
async fn reload_with_unchanged_set_keeps_listeners() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert_agent("T", 1, "alpha", true);
    let port = free_port();
    let mut fwd = forward_fixture(1, 1, "ssh", Direction::Forward, Transport::Tcp);
    fwd.remote_port = port;
    catalog.insert_forward(fwd);

    let (handle, addr) = start_server(catalog).await;
    let mut agent = FakeAgent::connect_ok(addr, "T").await;
    wait_until(|| handle.bound_ports().contains(&port)).await;

    handle.reload(AgentId(1)).await.unwrap();
    match agent.recv().await {
        Message::ConfigUpdate(p) => assert_eq!(p.port_forwards.len(), 1),
        other => panic!("expected config_update, got {other:?}"),
    }
    assert_eq!(handle.bound_ports(), vec![port]);
}

// =============================================================================
// Supersession
// =============================================================================

#[tokio::test]
async fn second_handshake_supersedes_the_first_session() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert_agent("T", 1, "alpha", true);
    let port = free_port();
    let mut fwd = forward_fixture(1, 1, "ssh", Direction::Forward, Transport::Tcp);
    fwd.remote_port = port;
    catalog.insert_forward(fwd);

    let (handle, addr) = start_server(catalog).await;
    let mut first = FakeAgent::connect_ok(addr, "T").await;
    wait_until(|| handle.bound_ports().contains(&port)).await;

    let mut second = FakeAgent::connect_ok(addr, "T").await;

    // The first session's socket is torn down.
    let gone = timeout(WAIT, first.reader.next_message()).await.unwrap();
    assert!(matches!(gone, Ok(None) | Err(_)));

    // Same listener set, now owned by the successor.
    wait_until(|| handle.bound_ports().contains(&port)).await;
    assert_eq!(handle.connected_agents(), 1);

    let _user = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    match second.recv().await {
        Message::NewConnection(p) => assert_eq!(p.proxy_name, "ssh"),
        other => panic!("expected new_connection on the new session, got {other:?}"),
    }
}

// =============================================================================
// Robustness
// =============================================================================

#[tokio::test]
async fn unknown_register_and_malformed_frames_keep_the_session() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert_agent("T", 1, "alpha", true);
    let (_handle, addr) = start_server(catalog).await;
    let mut agent = FakeAgent::connect_ok(addr, "T").await;

    agent.send_raw("{\"type\":\"hologram_sync\",\"x\":1}\n").await;
    agent.send_raw("{\"type\":\"register\",\"name\":\"old\"}\n").await;
    agent.send_raw("this is not json\n").await;

    agent.send(Message::Heartbeat {}).await;
    match agent.recv().await {
        Message::HeartbeatAck {} => {}
        other => panic!("expected heartbeat_ack, got {other:?}"),
    }
}

// =============================================================================
// Reverse TCP (server half, scripted agent)
// =============================================================================

#[tokio::test]
async fn reverse_tcp_dials_the_target_and_pairs() {
    let echo = tcp_echo_server().await;

    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert_agent("T", 1, "alpha", true);
    let mut fwd = forward_fixture(1, 1, "web", Direction::Reverse, Transport::Tcp);
    fwd.remote_ip = echo.ip().to_string();
    fwd.remote_port = echo.port();
    fwd.local_port = 8080;
    catalog.insert_forward(fwd);

    let (_handle, addr) = start_server(catalog).await;
    let mut agent = FakeAgent::connect_ok(addr, "T").await;

    let connection_id = ConnectionId("rev-1".into());
    agent
        .send(Message::ReverseConnection(ReverseConnectionPayload {
            proxy_name: "web".into(),
            connection_id: connection_id.clone(),
        }))
        .await;

    match agent.recv().await {
        Message::ReverseReady(p) => assert_eq!(p.connection_id, connection_id),
        other => panic!("expected reverse_ready, got {other:?}"),
    }

    let mut data = FakeAgent::open_data(addr, &connection_id).await;
    data.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(WAIT, data.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn reverse_tcp_unknown_forward_fails() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert_agent("T", 1, "alpha", true);
    let (_handle, addr) = start_server(catalog).await;
    let mut agent = FakeAgent::connect_ok(addr, "T").await;

    agent
        .send(Message::ReverseConnection(ReverseConnectionPayload {
            proxy_name: "ghost".into(),
            connection_id: ConnectionId("rev-2".into()),
        }))
        .await;

    match agent.recv().await {
        Message::ReverseFailed(p) => {
            assert_eq!(p.connection_id, ConnectionId("rev-2".into()));
            assert!(!p.error.is_empty());
        }
        other => panic!("expected reverse_failed, got {other:?}"),
    }
}

// =============================================================================
// UDP envelopes (server half, scripted agent)
// =============================================================================

#[tokio::test]
async fn udp_envelopes_round_trip_to_the_original_source() {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.insert_agent("T", 1, "alpha", true);
    let port = free_port();
    let mut fwd = forward_fixture(1, 1, "dns", Direction::Forward, Transport::Udp);
    fwd.remote_port = port;
    fwd.local_ip = "127.0.0.1".into();
    fwd.local_port = 5353;
    catalog.insert_forward(fwd);

    let (handle, addr) = start_server(catalog).await;
    let mut agent = FakeAgent::connect_ok(addr, "T").await;
    wait_until(|| handle.bound_ports().contains(&port)).await;

    let user = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    user.send_to(b"ping", ("127.0.0.1", port)).await.unwrap();

    let connection_id = match agent.recv().await {
        Message::UdpPacket(p) => {
            assert_eq!(BASE64.decode(p.data.as_bytes()).unwrap(), b"ping");
            assert_eq!(p.target_host, "127.0.0.1");
            assert_eq!(p.target_port, 5353);
            assert_eq!(p.proxy_name, "dns");
            p.connection_id
        }
        other => panic!("expected udp_packet, got {other:?}"),
    };

    agent
        .send(Message::UdpPacketResponse(UdpPacketResponsePayload {
            connection_id,
            data: BASE64.encode(b"pong"),
        }))
        .await;

    let mut buf = [0u8; 64];
    let (n, from) = timeout(WAIT, user.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"pong");
    assert_eq!(from.port(), port);
}
