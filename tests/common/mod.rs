//! Shared harness: loopback nodes, an echo destination and a tiny SOCKS5
//! client.

#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, sync::Once, time::Duration};

use bethrou::{
    exit::{
        policy::{PolicyConfig, RulePolicy},
        ExitService, ExitSettings,
    },
    identity::{Keypair, PeerId},
    ingress::{IngressServer, IngressSettings},
    membrane::PreSharedKey,
    node::{DialTarget, Node, NodeSettings},
    routing::{PeerRecord, RecordSource, RoundRobinStrategy, Roles, Router},
    transport::PeerAddr,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(15);

static INIT: Once = Once::new();

/// Installs a test writer subscriber once. `RUST_LOG` overrides the level.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn settings() -> NodeSettings {
    NodeSettings {
        dial_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        ..NodeSettings::default()
    }
}

pub async fn listening_node(psk: Option<PreSharedKey>) -> (Node, SocketAddr) {
    let node = Node::start(settings(), Keypair::generate(), psk);
    let addr = node
        .listen("127.0.0.1:0".parse().unwrap())
        .await
        .expect("listen");
    (node, addr)
}

pub fn direct(node: &Node, addr: SocketAddr) -> DialTarget {
    DialTarget::new(Some(node.peer_id()), PeerAddr::Direct(addr.to_string()))
}

/// Loopback destinations are private, so test exits allow them.
pub fn open_policy() -> PolicyConfig {
    PolicyConfig {
        block_private: false,
        ..PolicyConfig::default()
    }
}

pub fn start_exit(node: &Node, policy: PolicyConfig, connect_timeout: Duration) -> ExitService {
    let policy = RulePolicy::from_config(&policy).expect("policy");
    ExitService::start(
        node.clone(),
        Arc::new(policy),
        ExitSettings {
            connect_timeout,
            ..ExitSettings::default()
        },
    )
}

/// SOCKS5 ingress on an ephemeral port, sending everything to `exit`.
pub async fn start_ingress(node: &Node, exit: Option<PeerId>) -> SocketAddr {
    let router = Router::new(
        node.registry().clone(),
        Arc::new(RoundRobinStrategy::new()),
        None,
        3,
    )
    .with_pinned_exit(exit);
    let server = IngressServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        node.clone(),
        router,
        IngressSettings {
            handshake_timeout: Duration::from_secs(2),
            idle_timeout: None,
            stream_timeout: Duration::from_secs(5),
        },
    )
    .await
    .expect("bind ingress");
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

/// TCP echo server. The returned receiver yields once per closed
/// destination connection.
pub async fn spawn_echo() -> (SocketAddr, tokio::sync::mpsc::UnboundedReceiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, closed_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let closed_tx = closed_tx.clone();
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
                let _ = closed_tx.send(());
            });
        }
    });
    (addr, closed_rx)
}

/// Negotiates no-auth and returns the stream ready for a request.
pub async fn socks_greet(proxy: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);
    stream
}

/// Reads a reply and its bound address. Returns the reply code.
pub async fn read_reply(stream: &mut TcpStream) -> u8 {
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.unwrap();
    assert_eq!(head[0], 0x05);
    let addr_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => stream.read_u8().await.unwrap() as usize,
        other => panic!("bad address type {other}"),
    };
    let mut rest = vec![0u8; addr_len + 2];
    stream.read_exact(&mut rest).await.unwrap();
    head[1]
}

/// Sends CONNECT to an IPv4 destination and returns the reply code.
pub async fn socks_connect(proxy: SocketAddr, destination: SocketAddr) -> (TcpStream, u8) {
    let mut stream = socks_greet(proxy).await;
    let SocketAddr::V4(v4) = destination else {
        panic!("IPv4 destinations only");
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&v4.ip().octets());
    request.extend_from_slice(&v4.port().to_be_bytes());
    stream.write_all(&request).await.unwrap();
    let reply = read_reply(&mut stream).await;
    (stream, reply)
}

/// Sends CONNECT to `host:port` as a domain name and returns the reply code.
pub async fn socks_connect_domain(proxy: SocketAddr, host: &str, port: u16) -> (TcpStream, u8) {
    let mut stream = socks_greet(proxy).await;
    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await.unwrap();
    let reply = read_reply(&mut stream).await;
    (stream, reply)
}

/// Registers `peer` as an exit reachable at `addr`.
pub fn add_exit(node: &Node, peer: PeerId, addr: SocketAddr) {
    node.registry().upsert(
        PeerRecord {
            addrs: vec![PeerAddr::Direct(addr.to_string())],
            roles: Roles {
                exit: true,
                relay: false,
            },
            ..PeerRecord::new(peer)
        },
        RecordSource::Configured,
    );
}

/// A node that only dials out.
pub fn client_node(psk: Option<PreSharedKey>) -> Node {
    Node::start(settings(), Keypair::generate(), psk)
}
