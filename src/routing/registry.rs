//! Known peers and their health.

use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::{identity::PeerId, transport::PeerAddr};

/// Addresses kept per peer. Newer ones push out older ones.
pub const MAX_ADDRS: usize = 16;

/// Services a peer offers to the overlay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roles {
    pub exit: bool,
    pub relay: bool,
}

/// What a peer says about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub addrs: Vec<PeerAddr>,
    pub roles: Roles,
    pub region: Option<String>,
}

impl PeerRecord {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            addrs: Vec::new(),
            roles: Roles::default(),
            region: None,
        }
    }

    pub fn direct_addrs(&self) -> impl Iterator<Item = &str> {
        self.addrs.iter().filter_map(|addr| match addr {
            PeerAddr::Direct(addr) => Some(addr.as_str()),
            PeerAddr::Relayed { .. } => None,
        })
    }
}

/// How a record was learned, weakest first. A peer's own identify answer
/// outranks configuration, which outranks gossip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RecordSource {
    Exchange,
    Configured,
    Identify,
}

#[derive(Debug, Clone)]
pub struct Health {
    /// Smoothed round trip.
    pub rtt: Option<Duration>,
    pub consecutive_failures: u32,
    pub last_seen: Instant,
    pub last_failure: Option<Instant>,
}

impl Health {
    fn new(now: Instant) -> Self {
        Self {
            rtt: None,
            consecutive_failures: 0,
            last_seen: now,
            last_failure: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub record: PeerRecord,
    pub health: Health,
    pub source: RecordSource,
    /// Configured peers are never evicted.
    pub pinned: bool,
    /// Addresses from configuration, kept whatever the peer announces.
    pub configured_addrs: Vec<PeerAddr>,
}

/// What a selection strategy sees of an exit.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub peer_id: PeerId,
    pub region: Option<String>,
    pub rtt: Option<Duration>,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_peers: usize,
    /// Failures in a row after which a peer is skipped.
    pub failure_threshold: u32,
    /// How long a failing peer is skipped before it is tried again.
    pub failure_cooldown: Duration,
    /// Weight of the newest sample in the smoothed round trip.
    pub rtt_alpha: f64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_peers: 512,
            failure_threshold: 3,
            failure_cooldown: Duration::from_secs(30),
            rtt_alpha: 0.3,
        }
    }
}

#[derive(Clone)]
pub struct PeerRegistry {
    peers: Arc<RwLock<HashMap<PeerId, PeerEntry>>>,
    config: RegistryConfig,
}

impl PeerRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            peers: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Inserts or refreshes a record. Returns false when a new peer does not
    /// fit. A weaker source never overwrites what a stronger one said.
    ///
    /// An identify answer is the peer's current view of itself, so its
    /// addresses replace the learned ones; configured addresses survive.
    /// Other sources only add addresses.
    pub fn upsert(&self, mut record: PeerRecord, source: RecordSource) -> bool {
        let now = Instant::now();
        let mut peers = self.peers.write();
        if let Some(entry) = peers.get_mut(&record.peer_id) {
            if source == RecordSource::Configured {
                entry.pinned = true;
                entry.configured_addrs = union(record.addrs.clone(), &entry.configured_addrs);
            }
            let addrs = match source {
                RecordSource::Identify => union(record.addrs, &entry.configured_addrs),
                _ => union(record.addrs, &entry.record.addrs),
            };
            if source >= entry.source {
                record.addrs = addrs;
                if record.region.is_none() {
                    record.region = entry.record.region.take();
                }
                entry.record = record;
                entry.source = source;
            } else {
                entry.record.addrs = addrs;
            }
            return true;
        }
        if peers.len() >= self.config.max_peers {
            debug!(peer = %record.peer_id, "peer registry full");
            return false;
        }
        record.addrs.truncate(MAX_ADDRS);
        let configured_addrs = match source {
            RecordSource::Configured => record.addrs.clone(),
            _ => Vec::new(),
        };
        peers.insert(
            record.peer_id,
            PeerEntry {
                record,
                health: Health::new(now),
                source,
                pinned: source == RecordSource::Configured,
                configured_addrs,
            },
        );
        true
    }

    pub fn get(&self, peer: &PeerId) -> Option<PeerEntry> {
        self.peers.read().get(peer).cloned()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.read().contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn addresses(&self, peer: &PeerId) -> Vec<PeerAddr> {
        self.peers
            .read()
            .get(peer)
            .map(|entry| entry.record.addrs.clone())
            .unwrap_or_default()
    }

    pub fn record_rtt(&self, peer: &PeerId, sample: Duration) {
        let alpha = self.config.rtt_alpha;
        if let Some(entry) = self.peers.write().get_mut(peer) {
            let smoothed = match entry.health.rtt {
                Some(previous) => previous.mul_f64(1.0 - alpha) + sample.mul_f64(alpha),
                None => sample,
            };
            entry.health.rtt = Some(smoothed);
            entry.health.consecutive_failures = 0;
            entry.health.last_seen = Instant::now();
        }
    }

    pub fn record_success(&self, peer: &PeerId) {
        if let Some(entry) = self.peers.write().get_mut(peer) {
            entry.health.consecutive_failures = 0;
            entry.health.last_seen = Instant::now();
        }
    }

    pub fn record_failure(&self, peer: &PeerId) {
        if let Some(entry) = self.peers.write().get_mut(peer) {
            entry.health.consecutive_failures += 1;
            entry.health.last_failure = Some(Instant::now());
        }
    }

    pub fn mark_seen(&self, peer: &PeerId) {
        if let Some(entry) = self.peers.write().get_mut(peer) {
            entry.health.last_seen = Instant::now();
        }
    }

    fn is_healthy(&self, health: &Health, now: Instant) -> bool {
        if health.consecutive_failures < self.config.failure_threshold {
            return true;
        }
        health
            .last_failure
            .map_or(true, |at| now.duration_since(at) >= self.config.failure_cooldown)
    }

    /// Healthy peers offering the exit role.
    pub fn exit_candidates(&self) -> Vec<Candidate> {
        let now = Instant::now();
        let mut candidates: Vec<Candidate> = self
            .peers
            .read()
            .values()
            .filter(|entry| entry.record.roles.exit && self.is_healthy(&entry.health, now))
            .map(|entry| Candidate {
                peer_id: entry.record.peer_id,
                region: entry.record.region.clone(),
                rtt: entry.health.rtt,
                consecutive_failures: entry.health.consecutive_failures,
            })
            .collect();
        candidates.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        candidates
    }

    /// Healthy relays reachable on a direct address.
    pub fn relays(&self) -> Vec<PeerRecord> {
        let now = Instant::now();
        self.peers
            .read()
            .values()
            .filter(|entry| {
                entry.record.roles.relay
                    && entry.record.direct_addrs().next().is_some()
                    && self.is_healthy(&entry.health, now)
            })
            .map(|entry| entry.record.clone())
            .collect()
    }

    /// Records worth sharing with other peers, freshest first.
    pub fn records_for_exchange(&self, limit: usize) -> Vec<PeerRecord> {
        let now = Instant::now();
        let peers = self.peers.read();
        let mut entries: Vec<&PeerEntry> = peers
            .values()
            .filter(|entry| !entry.record.addrs.is_empty() && self.is_healthy(&entry.health, now))
            .collect();
        entries.sort_by(|a, b| b.health.last_seen.cmp(&a.health.last_seen));
        entries
            .into_iter()
            .take(limit)
            .map(|entry| entry.record.clone())
            .collect()
    }

    /// Configured peers, which discovery keeps connected.
    pub fn pinned(&self) -> Vec<PeerId> {
        self.peers
            .read()
            .values()
            .filter(|entry| entry.pinned)
            .map(|entry| entry.record.peer_id)
            .collect()
    }

    /// Drops learned peers not seen for `ttl`, except those in `keep`.
    pub fn evict_stale(&self, ttl: Duration, keep: impl Fn(&PeerId) -> bool) -> usize {
        let now = Instant::now();
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|peer, entry| {
            entry.pinned
                || keep(peer)
                || now.duration_since(entry.health.last_seen) < ttl
        });
        before - peers.len()
    }
}

/// `first` followed by whatever of `rest` it lacks, capped at [`MAX_ADDRS`].
fn union(mut first: Vec<PeerAddr>, rest: &[PeerAddr]) -> Vec<PeerAddr> {
    first.dedup();
    for addr in rest {
        if !first.contains(addr) {
            first.push(addr.clone());
        }
    }
    first.truncate(MAX_ADDRS);
    first
}
