//! NAT reachability.
//!
//! A node learns whether others can dial it by asking connected peers to
//! dial back its listen ports over [`DIALBACK_PROTOCOL`]. The dial-back goes
//! to the requester's observed IP only, and succeeds when a full handshake
//! with the requester's identity completes.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpStream, sync::watch};
use tracing::{debug, info};

use crate::{
    identity::PeerId,
    node::Node,
    transport::{PeerStream, Role, Session, TransportError},
    wire, Error,
};

pub const DIALBACK_PROTOCOL: &str = "/bethrou/dialback/1.0.0";

const MAX_DIALBACK_PORTS: usize = 4;
const PROBE_PEERS: usize = 3;
const DIALBACK_TIMEOUT: Duration = Duration::from_secs(30);
const UNKNOWN_RETRY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reachability {
    #[default]
    Unknown,
    Public,
    Private,
}

/// What the node knows about its own reachability.
pub struct NatStatus {
    reachability: watch::Sender<Reachability>,
    observed: Mutex<HashMap<IpAddr, u32>>,
    confirmed: RwLock<Vec<SocketAddr>>,
}

impl Default for NatStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl NatStatus {
    pub fn new() -> Self {
        let (reachability, _) = watch::channel(Reachability::Unknown);
        Self {
            reachability,
            observed: Mutex::new(HashMap::new()),
            confirmed: RwLock::new(Vec::new()),
        }
    }

    pub fn reachability(&self) -> Reachability {
        *self.reachability.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Reachability> {
        self.reachability.subscribe()
    }

    pub fn set(&self, reachability: Reachability) {
        let previous = self.reachability.send_replace(reachability);
        if previous != reachability {
            info!(?previous, current = ?reachability, "reachability changed");
        }
    }

    /// Counts an address a peer reported seeing us from.
    pub fn record_observed(&self, addr: SocketAddr) {
        *self.observed.lock().entry(addr.ip()).or_default() += 1;
    }

    /// The IP most peers report, if any.
    pub fn observed_ip(&self) -> Option<IpAddr> {
        self.observed
            .lock()
            .iter()
            .max_by_key(|(ip, count)| (**count, **ip))
            .map(|(ip, _)| *ip)
    }

    /// Addresses a dial-back reached.
    pub fn confirmed_addrs(&self) -> Vec<SocketAddr> {
        self.confirmed.read().clone()
    }

    fn set_confirmed(&self, addrs: Vec<SocketAddr>) {
        *self.confirmed.write() = addrs;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialBackRequest {
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialBackResponse {
    pub reachable: Vec<SocketAddr>,
}

pub(crate) fn serve(node: Node) {
    let mut incoming = node.accept(DIALBACK_PROTOCOL);
    let shutdown = node.shutdown_token();
    tokio::spawn(async move {
        loop {
            let stream = tokio::select! {
                _ = shutdown.cancelled() => break,
                stream = incoming.recv() => match stream {
                    Some(stream) => stream,
                    None => break,
                },
            };
            let node = node.clone();
            tokio::spawn(async move {
                let peer = stream.remote_peer();
                if let Err(err) = answer(&node, stream).await {
                    debug!(%peer, %err, "dial-back request failed");
                }
            });
        }
    });
}

async fn answer(node: &Node, mut stream: PeerStream) -> Result<(), Error> {
    let request: DialBackRequest = wire::read_message(&mut stream).await?;
    let requester = stream.remote_peer();
    let mut reachable = Vec::new();
    // Over a relayed session there is no observed address to dial.
    if let Some(observed) = stream.remote_addr() {
        for port in request.ports.into_iter().take(MAX_DIALBACK_PORTS) {
            let addr = SocketAddr::new(observed.ip(), port);
            match dial_back(node, addr, requester).await {
                Ok(()) => reachable.push(addr),
                Err(err) => debug!(%requester, %addr, %err, "dial-back failed"),
            }
        }
    }
    wire::write_message(&mut stream, &DialBackResponse { reachable }).await?;
    Ok(())
}

async fn dial_back(node: &Node, addr: SocketAddr, expected: PeerId) -> Result<(), Error> {
    let socket = tokio::time::timeout(node.settings().dial_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout("dial-back"))??;
    node.handshake(socket, Role::Initiator, Some(expected)).await?;
    Ok(())
}

async fn request_dialback(session: &Session, ports: &[u16]) -> Result<DialBackResponse, Error> {
    let mut stream = session.open_stream(DIALBACK_PROTOCOL).await?;
    let request = DialBackRequest {
        ports: ports.to_vec(),
    };
    wire::write_message(&mut stream, &request).await?;
    Ok(wire::read_message(&mut stream).await?)
}

/// Asks up to a few directly connected peers to dial us back and records
/// the outcome on the node.
pub async fn probe(node: &Node) -> Reachability {
    let ports: Vec<u16> = node.listen_addrs().iter().map(SocketAddr::port).collect();
    if ports.is_empty() {
        node.nat().set(Reachability::Private);
        return Reachability::Private;
    }
    let helpers: Vec<Session> = node
        .sessions()
        .into_iter()
        .filter(|session| !session.is_relayed())
        .take(PROBE_PEERS)
        .collect();

    let mut answered = false;
    let mut confirmed = Vec::new();
    for session in helpers {
        let peer = session.remote_peer();
        match tokio::time::timeout(DIALBACK_TIMEOUT, request_dialback(&session, &ports)).await {
            Ok(Ok(response)) => {
                answered = true;
                confirmed.extend(response.reachable);
            }
            Ok(Err(err)) => debug!(%peer, %err, "dial-back probe failed"),
            Err(_) => debug!(%peer, "dial-back probe timed out"),
        }
        if !confirmed.is_empty() {
            break;
        }
    }

    let reachability = if !confirmed.is_empty() {
        Reachability::Public
    } else if answered {
        Reachability::Private
    } else {
        Reachability::Unknown
    };
    if reachability != Reachability::Unknown {
        node.nat().set_confirmed(confirmed);
        node.nat().set(reachability);
    }
    reachability
}

/// Re-probes every `interval`, or sooner while the answer is unknown. A node
/// with configured external addresses is taken to be public.
pub fn spawn_prober(node: Node, interval: Duration, assume_public: bool) {
    if assume_public {
        node.nat().set(Reachability::Public);
        return;
    }
    let shutdown = node.shutdown_token();
    tokio::spawn(async move {
        let mut wait = UNKNOWN_RETRY.min(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            wait = match probe(&node).await {
                Reachability::Unknown => UNKNOWN_RETRY.min(interval),
                _ => interval,
            };
        }
    });
}
