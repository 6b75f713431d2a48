//! Finding peers: bootstrap dials, peer exchange and liveness pings.
//!
//! Identify (run by the node on every new session) fills in each connected
//! peer's own record. Peer exchange asks a few connected peers for the
//! records they know, so exits and relays beyond the bootstrap set become
//! reachable. Every round also pings live sessions to keep round trips and
//! failure counts current, then drops records nobody has vouched for within
//! the configured lifetime.

use std::{collections::HashSet, sync::Arc, time::Duration};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, trace, warn};

use crate::{
    config::DiscoveryConfig,
    identity::PeerId,
    node::{DialTarget, Node},
    routing::{PeerRecord, RecordSource},
    transport::{PeerStream, Session, TransportError},
    wire, Error,
};

pub const PEX_PROTOCOL: &str = "/bethrou/pex/1.0.0";

/// Most records sent in one exchange answer.
const MAX_EXCHANGE: usize = 64;
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);
/// Shortest gap between maintenance rounds.
const MIN_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PexRequest {
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PexResponse {
    pub peers: Vec<PeerRecord>,
}

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub bootstrap: Vec<DialTarget>,
    pub interval: Duration,
    pub peer_ttl: Duration,
    pub fanout: usize,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            bootstrap: Vec::new(),
            interval: Duration::from_secs(30),
            peer_ttl: Duration::from_secs(600),
            fanout: 3,
        }
    }
}

impl DiscoverySettings {
    pub fn from_config(config: &DiscoveryConfig) -> Result<Self, Error> {
        Ok(Self {
            bootstrap: config.bootstrap_targets()?,
            interval: Duration::from_secs(config.interval_secs),
            peer_ttl: Duration::from_secs(config.peer_ttl_secs),
            fanout: config.exchange_fanout,
        })
    }
}

#[derive(Clone)]
pub struct Discovery {
    node: Node,
    settings: Arc<DiscoverySettings>,
}

impl Discovery {
    /// Registers the exchange responder. Nothing is dialed until
    /// [`Discovery::bootstrap`] or [`Discovery::spawn`].
    pub fn new(node: Node, settings: DiscoverySettings) -> Self {
        serve(node.clone());
        for target in &settings.bootstrap {
            if let Some(peer) = target.peer {
                let record = PeerRecord {
                    addrs: vec![target.addr.clone()],
                    ..PeerRecord::new(peer)
                };
                node.registry().upsert(record, RecordSource::Configured);
            }
        }
        Self {
            node,
            settings: Arc::new(settings),
        }
    }

    /// Bootstraps once, then runs a maintenance round every interval until
    /// the node shuts down.
    pub fn spawn(self) {
        let shutdown = self.node.shutdown_token();
        tokio::spawn(async move {
            let connected = self.bootstrap().await;
            info!(
                connected,
                configured = self.settings.bootstrap.len(),
                "bootstrap finished"
            );
            let mut ticker = tokio::time::interval(self.settings.interval.max(MIN_INTERVAL));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => self.round().await,
                }
            }
        });
    }

    /// Dials every bootstrap target at once. Returns how many answered.
    pub async fn bootstrap(&self) -> usize {
        let dials = self.settings.bootstrap.iter().map(|target| async move {
            match self.node.dial(target).await {
                Ok(_) => true,
                Err(err) => {
                    warn!(%target, %err, "bootstrap dial failed");
                    false
                }
            }
        });
        futures::future::join_all(dials)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count()
    }

    /// One maintenance pass: reconnect, ping, exchange, evict.
    #[instrument(skip_all)]
    pub async fn round(&self) {
        self.reconnect().await;
        self.ping_all().await;
        self.exchange_with_some().await;

        let node = &self.node;
        let evicted = node
            .registry()
            .evict_stale(self.settings.peer_ttl, |peer| node.is_connected(peer));
        if evicted > 0 {
            debug!(evicted, "stale peers dropped");
        }
        trace!(known = node.registry().len(), connected = node.sessions().len(), "round done");
    }

    /// Configured peers are kept connected. Bootstrap targets without a
    /// known id are only redialed once the node has lost every session.
    async fn reconnect(&self) {
        for peer in self.node.registry().pinned() {
            if self.node.is_connected(&peer) {
                continue;
            }
            if let Err(err) = self.node.connect(peer).await {
                debug!(peer = %peer.short(), %err, "configured peer unreachable");
            }
        }
        if self.node.sessions().is_empty() {
            for target in self.settings.bootstrap.iter().filter(|t| t.peer.is_none()) {
                if let Err(err) = self.node.dial(target).await {
                    debug!(%target, %err, "bootstrap redial failed");
                }
            }
        }
    }

    async fn ping_all(&self) {
        let pings = self.node.sessions().into_iter().map(|session| async move {
            let peer = session.remote_peer();
            match session.ping().await {
                Ok(rtt) => self.node.registry().record_rtt(&peer, rtt),
                Err(err) => {
                    debug!(peer = %peer.short(), %err, "ping failed");
                    self.node.registry().record_failure(&peer);
                }
            }
        });
        futures::future::join_all(pings).await;
    }

    async fn exchange_with_some(&self) {
        let chosen: Vec<Session> = {
            let sessions = self.node.sessions();
            sessions
                .choose_multiple(&mut rand::thread_rng(), self.settings.fanout)
                .cloned()
                .collect()
        };
        for session in chosen {
            let peer = session.remote_peer();
            match exchange(&session, MAX_EXCHANGE).await {
                Ok(records) => {
                    let learned = self.absorb(records);
                    if learned > 0 {
                        debug!(peer = %peer.short(), learned, "learned peers");
                    }
                }
                Err(err) => debug!(peer = %peer.short(), %err, "peer exchange failed"),
            }
        }
    }

    /// Stores exchanged records. Returns how many peers were new.
    fn absorb(&self, records: Vec<PeerRecord>) -> usize {
        let local = self.node.peer_id();
        let registry = self.node.registry();
        let mut learned = 0;
        for record in records {
            if record.peer_id == local || record.addrs.is_empty() {
                continue;
            }
            let known = registry.contains(&record.peer_id);
            if registry.upsert(record, RecordSource::Exchange) && !known {
                learned += 1;
            }
        }
        learned
    }
}

/// Asks the peer behind `session` for up to `limit` records.
pub async fn exchange(session: &Session, limit: usize) -> Result<Vec<PeerRecord>, Error> {
    let attempt = async {
        let mut stream = session.open_stream(PEX_PROTOCOL).await?;
        let request = PexRequest {
            limit: limit.min(MAX_EXCHANGE) as u32,
        };
        wire::write_message(&mut stream, &request).await?;
        let response: PexResponse = wire::read_message(&mut stream).await?;
        Ok::<_, Error>(response.peers)
    };
    let mut peers = tokio::time::timeout(EXCHANGE_TIMEOUT, attempt)
        .await
        .map_err(|_| TransportError::Timeout("peer exchange"))??;
    peers.truncate(limit);
    Ok(peers)
}

fn serve(node: Node) {
    let mut incoming = node.accept(PEX_PROTOCOL);
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
                    debug!(peer = %peer.short(), %err, "peer exchange answer failed");
                }
            });
        }
    });
}

async fn answer(node: &Node, mut stream: PeerStream) -> Result<(), Error> {
    let request: PexRequest = wire::read_message(&mut stream).await?;
    let requester = stream.remote_peer();
    let limit = (request.limit as usize).min(MAX_EXCHANGE);
    let skip: HashSet<PeerId> = [requester, node.peer_id()].into();
    let peers = node
        .registry()
        .records_for_exchange(limit + skip.len())
        .into_iter()
        .filter(|record| !skip.contains(&record.peer_id))
        .take(limit)
        .collect();
    wire::write_message(&mut stream, &PexResponse { peers }).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        identity::Keypair,
        node::NodeSettings,
        routing::Roles,
        transport::PeerAddr,
    };
    use std::net::SocketAddr;

    fn settings() -> NodeSettings {
        NodeSettings {
            handshake_timeout: Duration::from_secs(2),
            dial_timeout: Duration::from_secs(2),
            ..NodeSettings::default()
        }
    }

    async fn listening_node() -> (Node, SocketAddr) {
        let node = Node::start(settings(), Keypair::generate(), None);
        let addr = node.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        (node, addr)
    }

    fn exit_record(addr: &str) -> PeerRecord {
        PeerRecord {
            addrs: vec![PeerAddr::Direct(addr.into())],
            roles: Roles {
                exit: true,
                relay: false,
            },
            ..PeerRecord::new(Keypair::generate().peer_id())
        }
    }

    #[tokio::test]
    async fn bootstrap_pins_configured_peers() {
        let (seed, addr) = listening_node().await;
        let node = Node::start(settings(), Keypair::generate(), None);
        let target = DialTarget::new(Some(seed.peer_id()), PeerAddr::Direct(addr.to_string()));
        let discovery = Discovery::new(
            node.clone(),
            DiscoverySettings {
                bootstrap: vec![target],
                ..DiscoverySettings::default()
            },
        );
        assert_eq!(discovery.bootstrap().await, 1);
        assert!(node.is_connected(&seed.peer_id()));
        assert_eq!(node.registry().pinned(), vec![seed.peer_id()]);
    }

    #[tokio::test]
    async fn unreachable_bootstrap_is_skipped() {
        let node = Node::start(settings(), Keypair::generate(), None);
        let discovery = Discovery::new(
            node,
            DiscoverySettings {
                bootstrap: vec!["127.0.0.1:1".parse().unwrap()],
                ..DiscoverySettings::default()
            },
        );
        assert_eq!(discovery.bootstrap().await, 0);
    }

    #[tokio::test]
    async fn exchange_teaches_remote_records() {
        let (seed, addr) = listening_node().await;
        let _seed_discovery = Discovery::new(seed.clone(), DiscoverySettings::default());
        let far = exit_record("10.1.2.3:4000");
        seed.registry().upsert(far.clone(), RecordSource::Configured);

        let node = Node::start(settings(), Keypair::generate(), None);
        let discovery = Discovery::new(node.clone(), DiscoverySettings::default());
        node.dial(&DialTarget::new(Some(seed.peer_id()), PeerAddr::Direct(addr.to_string())))
            .await
            .unwrap();

        discovery.round().await;
        let learned = node.registry().get(&far.peer_id).unwrap();
        assert!(learned.record.roles.exit);
        assert!(!node.registry().pinned().contains(&far.peer_id));
    }

    #[tokio::test]
    async fn answer_leaves_out_the_requester() {
        let (seed, addr) = listening_node().await;
        let _seed_discovery = Discovery::new(seed.clone(), DiscoverySettings::default());
        let node = Node::start(settings(), Keypair::generate(), None);
        seed.registry().upsert(
            PeerRecord {
                addrs: vec![PeerAddr::Direct("10.0.0.9:4000".into())],
                ..PeerRecord::new(node.peer_id())
            },
            RecordSource::Configured,
        );
        let session = node
            .dial(&DialTarget::new(Some(seed.peer_id()), PeerAddr::Direct(addr.to_string())))
            .await
            .unwrap();
        let records = exchange(&session, 16).await.unwrap();
        assert!(records.iter().all(|record| record.peer_id != node.peer_id()));
    }

    #[tokio::test]
    async fn ping_records_round_trip() {
        let (seed, addr) = listening_node().await;
        let node = Node::start(settings(), Keypair::generate(), None);
        let discovery = Discovery::new(
            node.clone(),
            DiscoverySettings {
                bootstrap: vec![DialTarget::new(
                    Some(seed.peer_id()),
                    PeerAddr::Direct(addr.to_string()),
                )],
                ..DiscoverySettings::default()
            },
        );
        discovery.bootstrap().await;
        discovery.round().await;
        let entry = node.registry().get(&seed.peer_id()).unwrap();
        assert!(entry.health.rtt.is_some());
    }

    #[tokio::test]
    async fn zero_interval_still_runs_rounds() {
        let (seed, addr) = listening_node().await;
        let node = Node::start(settings(), Keypair::generate(), None);
        Discovery::new(
            node.clone(),
            DiscoverySettings {
                bootstrap: vec![DialTarget::new(
                    Some(seed.peer_id()),
                    PeerAddr::Direct(addr.to_string()),
                )],
                interval: Duration::ZERO,
                ..DiscoverySettings::default()
            },
        )
        .spawn();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let measured = node
                    .registry()
                    .get(&seed.peer_id())
                    .and_then(|entry| entry.health.rtt);
                if measured.is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("no maintenance round ran");
    }
}
