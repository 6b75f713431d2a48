//! Overlay membership is gated by the network key.

mod common;

use std::time::Duration;

use bethrou::{membrane::PreSharedKey, node::NodeEvent, Error, ErrorClass};
use common::*;
use tokio::time::timeout;

#[tokio::test]
async fn same_key_connects() {
    init_tracing();
    let key = PreSharedKey::generate();
    let (server, addr) = listening_node(Some(key.clone())).await;
    let client = client_node(Some(key));

    let session = client.dial(&direct(&server, addr)).await.expect("dial");
    assert_eq!(session.remote_peer(), server.peer_id());
}

#[tokio::test]
async fn different_key_never_connects() {
    init_tracing();
    let (server, addr) = listening_node(Some(PreSharedKey::generate())).await;
    let mut server_events = server.subscribe();
    let outsider = client_node(Some(PreSharedKey::generate()));

    let err = outsider
        .dial(&direct(&server, addr))
        .await
        .expect_err("outsider joined the network");
    assert!(matches!(err, Error::Transport(_)), "unexpected {err}");
    assert!(!outsider.is_connected(&server.peer_id()));

    let connected = timeout(Duration::from_millis(500), async {
        loop {
            if let Ok(NodeEvent::Connected { .. }) = server_events.recv().await {
                break;
            }
        }
    })
    .await;
    assert!(connected.is_err(), "server accepted an outsider");
}

#[tokio::test]
async fn keyless_node_cannot_join_a_private_network() {
    init_tracing();
    let (server, addr) = listening_node(Some(PreSharedKey::generate())).await;
    let outsider = client_node(None);

    let err = outsider.dial(&direct(&server, addr)).await.expect_err("joined");
    assert!(matches!(err, Error::Transport(_)), "unexpected {err}");
    assert!(server.sessions().is_empty());
}

#[tokio::test]
async fn wrong_peer_id_is_refused() {
    init_tracing();
    let (server, addr) = listening_node(None).await;
    let (impostor, _) = listening_node(None).await;
    let client = client_node(None);

    let target = bethrou::node::DialTarget::new(
        Some(impostor.peer_id()),
        bethrou::transport::PeerAddr::Direct(addr.to_string()),
    );
    let err = client.dial(&target).await.expect_err("accepted wrong peer");
    assert_eq!(err.class(), ErrorClass::Authentication);
    assert!(!client.is_connected(&server.peer_id()));
}
