//! SOCKS5 client → ingress → overlay → exit → destination, all on loopback.
//!
//! Run with verbose output: RUST_LOG=debug cargo test --test end_to_end -- --nocapture

mod common;

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use bethrou::{
    exit::{
        policy::{DestinationPolicy, Verdict},
        ExitService, ExitSettings,
    },
    identity::Keypair,
    protocol::SocksSocketAddr,
};
use common::*;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    time::timeout,
};

/// Exit node, client node dialed to it, and an ingress pinned to the exit.
async fn proxy(policy: bethrou::exit::policy::PolicyConfig) -> std::net::SocketAddr {
    let (exit, exit_addr) = listening_node(None).await;
    start_exit(&exit, policy, Duration::from_secs(2));
    let client = client_node(None);
    client.dial(&direct(&exit, exit_addr)).await.expect("dial exit");
    start_ingress(&client, Some(exit.peer_id())).await
}

#[tokio::test]
async fn bytes_cross_the_overlay_unchanged() {
    init_tracing();
    let (echo, _closed) = spawn_echo().await;
    let socks = proxy(open_policy()).await;

    let (mut stream, reply) = socks_connect(socks, echo).await;
    assert_eq!(reply, 0x00);

    let payload: Vec<u8> = (0..10 * 1024).map(|i| (i % 251) as u8).collect();
    stream.write_all(&payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    timeout(TEST_TIMEOUT, stream.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(echoed, payload);
}

#[tokio::test]
async fn refused_destination_is_reported() {
    init_tracing();
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let destination = closed.local_addr().unwrap();
    drop(closed);
    let socks = proxy(open_policy()).await;

    let started = Instant::now();
    let (_stream, reply) = timeout(TEST_TIMEOUT, socks_connect(socks, destination))
        .await
        .expect("connect hung");
    assert_eq!(reply, 0x05);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn unroutable_destination_fails_within_the_timeout() {
    init_tracing();
    let socks = proxy(open_policy()).await;
    let started = Instant::now();
    let (_stream, reply) = timeout(
        TEST_TIMEOUT,
        socks_connect(socks, "10.255.255.1:81".parse().unwrap()),
    )
    .await
    .expect("connect hung");
    assert_ne!(reply, 0x00);
    // Exit connect timeout plus overlay slack.
    assert!(started.elapsed() < Duration::from_secs(8));
}

#[tokio::test]
async fn closing_the_client_closes_the_destination() {
    init_tracing();
    let (echo, mut closed) = spawn_echo().await;
    let socks = proxy(open_policy()).await;

    let (mut stream, reply) = socks_connect(socks, echo).await;
    assert_eq!(reply, 0x00);
    stream.write_all(b"ping").await.unwrap();
    let mut back = [0u8; 4];
    stream.read_exact(&mut back).await.unwrap();
    drop(stream);

    timeout(TEST_TIMEOUT, closed.recv())
        .await
        .expect("destination stayed open")
        .expect("echo server gone");
}

#[tokio::test]
async fn closing_the_destination_closes_the_client() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let destination = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(b"bye").await.unwrap();
        // Dropping the socket closes the destination side.
    });
    let socks = proxy(open_policy()).await;

    let (mut stream, reply) = socks_connect(socks, destination).await;
    assert_eq!(reply, 0x00);
    let mut received = Vec::new();
    timeout(TEST_TIMEOUT, stream.read_to_end(&mut received))
        .await
        .expect("client stayed open")
        .unwrap();
    assert_eq!(received, b"bye");
}

#[tokio::test]
async fn private_destinations_are_denied_by_default() {
    init_tracing();
    let (echo, _closed) = spawn_echo().await;
    let socks = proxy(bethrou::exit::policy::PolicyConfig::default()).await;

    let (_stream, reply) = socks_connect(socks, echo).await;
    assert_eq!(reply, 0x02);
}

#[tokio::test]
async fn no_exit_means_network_unreachable() {
    init_tracing();
    let client = client_node(None);
    let socks = start_ingress(&client, None).await;
    let (_stream, reply) = socks_connect(socks, "127.0.0.1:9".parse().unwrap()).await;
    assert_eq!(reply, 0x03);
}

#[tokio::test]
async fn bind_gets_command_not_supported() {
    init_tracing();
    let client = client_node(None);
    let socks = start_ingress(&client, None).await;
    let mut stream = socks_greet(socks).await;
    stream
        .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
        .await
        .unwrap();
    assert_eq!(read_reply(&mut stream).await, 0x07);
}

#[tokio::test]
async fn unknown_address_type_is_rejected() {
    init_tracing();
    let client = client_node(None);
    let socks = start_ingress(&client, None).await;
    let mut stream = socks_greet(socks).await;
    stream
        .write_all(&[0x05, 0x01, 0x00, 0x09, 127, 0, 0, 1, 0, 80])
        .await
        .unwrap();
    assert_eq!(read_reply(&mut stream).await, 0x08);
}

#[tokio::test]
async fn domain_destination_is_resolved_by_the_exit() {
    init_tracing();
    let (echo, _closed) = spawn_echo().await;
    let socks = proxy(open_policy()).await;

    let (mut stream, reply) = socks_connect_domain(socks, "localhost", echo.port()).await;
    assert_eq!(reply, 0x00);
    stream.write_all(b"by name").await.unwrap();
    let mut back = [0u8; 7];
    timeout(TEST_TIMEOUT, stream.read_exact(&mut back))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&back, b"by name");
}

async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

#[tokio::test]
async fn dead_exit_falls_over_to_the_next() {
    init_tracing();
    let (echo, _closed) = spawn_echo().await;
    let (exit, exit_addr) = listening_node(None).await;
    start_exit(&exit, open_policy(), Duration::from_secs(2));

    let client = client_node(None);
    let gone = Keypair::generate().peer_id();
    add_exit(&client, gone, closed_port().await);
    add_exit(&client, exit.peer_id(), exit_addr);
    // The dead exit is pinned, so it is always tried first.
    let socks = start_ingress(&client, Some(gone)).await;

    let (mut stream, reply) = socks_connect(socks, echo).await;
    assert_eq!(reply, 0x00);
    stream.write_all(b"second").await.unwrap();
    let mut back = [0u8; 6];
    timeout(TEST_TIMEOUT, stream.read_exact(&mut back))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(&back, b"second");

    let health = client.registry().get(&gone).unwrap().health;
    assert_eq!(health.consecutive_failures, 1);
    assert!(client.is_connected(&exit.peer_id()));
}

/// Allows everything and counts the requests it saw.
struct Counting(Arc<AtomicUsize>);

impl DestinationPolicy for Counting {
    fn check_target(&self, _target: &SocksSocketAddr) -> Verdict {
        self.0.fetch_add(1, Ordering::SeqCst);
        Verdict::Allow
    }
}

async fn counting_exit() -> (bethrou::node::Node, SocketAddr, Arc<AtomicUsize>) {
    let (exit, addr) = listening_node(None).await;
    let seen = Arc::new(AtomicUsize::new(0));
    ExitService::start(
        exit.clone(),
        Arc::new(Counting(seen.clone())),
        ExitSettings {
            connect_timeout: Duration::from_secs(2),
            ..ExitSettings::default()
        },
    );
    (exit, addr, seen)
}

#[tokio::test]
async fn unreachable_destination_is_tried_on_every_exit() {
    init_tracing();
    let (first, first_addr, first_seen) = counting_exit().await;
    let (second, second_addr, second_seen) = counting_exit().await;
    let client = client_node(None);
    add_exit(&client, first.peer_id(), first_addr);
    add_exit(&client, second.peer_id(), second_addr);
    let socks = start_ingress(&client, None).await;

    let destination = closed_port().await;
    let (_stream, reply) = timeout(TEST_TIMEOUT, socks_connect(socks, destination))
        .await
        .expect("connect hung");
    assert_eq!(reply, 0x05);
    assert_eq!(first_seen.load(Ordering::SeqCst), 1);
    assert_eq!(second_seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn policy_denial_is_not_retried() {
    init_tracing();
    let (echo, _closed) = spawn_echo().await;
    let (strict, strict_addr) = listening_node(None).await;
    start_exit(
        &strict,
        bethrou::exit::policy::PolicyConfig::default(),
        Duration::from_secs(2),
    );
    let (open, open_addr, open_seen) = counting_exit().await;
    let client = client_node(None);
    add_exit(&client, strict.peer_id(), strict_addr);
    add_exit(&client, open.peer_id(), open_addr);
    let socks = start_ingress(&client, Some(strict.peer_id())).await;

    let (_stream, reply) = socks_connect(socks, echo).await;
    assert_eq!(reply, 0x02);
    assert_eq!(open_seen.load(Ordering::SeqCst), 0);
}
