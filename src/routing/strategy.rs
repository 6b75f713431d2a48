//! Exit selection strategies.

use std::{
    collections::HashSet,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use super::registry::Candidate;
use crate::{identity::PeerId, protocol::SocksSocketAddr};

/// Round trip assumed for exits that were never measured.
const UNMEASURED_RTT: Duration = Duration::from_millis(500);

/// One routing decision.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub target: SocksSocketAddr,
    /// Preferred exit region.
    pub region: Option<String>,
    /// Exit to use regardless of strategy.
    pub exit: Option<PeerId>,
    /// Exits already tried for this request.
    pub excluded: HashSet<PeerId>,
}

impl RouteRequest {
    pub fn new(target: SocksSocketAddr) -> Self {
        Self {
            target,
            region: None,
            exit: None,
            excluded: HashSet::new(),
        }
    }
}

/// Picks the exit for a request from the healthy candidates.
///
/// Implementations never return an excluded peer.
pub trait RouteStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn select(&self, candidates: &[Candidate], request: &RouteRequest) -> Option<PeerId>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    Static,
    #[default]
    RoundRobin,
    Latency,
}

/// Always the configured exit, whatever its health.
pub struct StaticStrategy {
    exit: PeerId,
}

impl StaticStrategy {
    pub fn new(exit: PeerId) -> Self {
        Self { exit }
    }
}

impl RouteStrategy for StaticStrategy {
    fn name(&self) -> &'static str {
        "static"
    }

    fn select(&self, _candidates: &[Candidate], request: &RouteRequest) -> Option<PeerId> {
        (!request.excluded.contains(&self.exit)).then_some(self.exit)
    }
}

/// Rotates over exits, preferring the requested region when any exit there
/// is available.
#[derive(Default)]
pub struct RoundRobinStrategy {
    cursor: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RouteStrategy for RoundRobinStrategy {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn select(&self, candidates: &[Candidate], request: &RouteRequest) -> Option<PeerId> {
        let pool = preferred_pool(candidates, request);
        if pool.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % pool.len();
        Some(pool[index].peer_id)
    }
}

/// Lowest smoothed round trip, penalised by recent failures.
#[derive(Default)]
pub struct LatencyStrategy;

impl LatencyStrategy {
    fn score(candidate: &Candidate) -> Duration {
        let rtt = candidate.rtt.unwrap_or(UNMEASURED_RTT);
        rtt * (1 + candidate.consecutive_failures)
    }
}

impl RouteStrategy for LatencyStrategy {
    fn name(&self) -> &'static str {
        "latency"
    }

    fn select(&self, candidates: &[Candidate], request: &RouteRequest) -> Option<PeerId> {
        preferred_pool(candidates, request)
            .into_iter()
            .min_by(|a, b| {
                Self::score(a)
                    .cmp(&Self::score(b))
                    .then_with(|| a.peer_id.cmp(&b.peer_id))
            })
            .map(|candidate| candidate.peer_id)
    }
}

fn preferred_pool<'a>(candidates: &'a [Candidate], request: &RouteRequest) -> Vec<&'a Candidate> {
    let eligible: Vec<&Candidate> = candidates
        .iter()
        .filter(|candidate| !request.excluded.contains(&candidate.peer_id))
        .collect();
    if let Some(region) = &request.region {
        let in_region: Vec<&Candidate> = eligible
            .iter()
            .copied()
            .filter(|candidate| candidate.region.as_ref() == Some(region))
            .collect();
        if !in_region.is_empty() {
            return in_region;
        }
    }
    eligible
}
