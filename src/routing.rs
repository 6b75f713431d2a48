//! Exit routing: the peer registry and the strategy that picks an exit for
//! each outbound connection.

pub mod registry;
pub mod strategy;

use std::sync::Arc;

pub use registry::{Candidate, PeerEntry, PeerRecord, PeerRegistry, RecordSource, Roles};
pub use strategy::{
    LatencyStrategy, RoundRobinStrategy, RouteRequest, RouteStrategy, StaticStrategy, StrategyKind,
};

use crate::{
    config::RoutingConfig,
    identity::PeerId,
    protocol::SocksSocketAddr,
    Error,
};

/// Strategy plus the registry it draws candidates from.
#[derive(Clone)]
pub struct Router {
    registry: PeerRegistry,
    strategy: Arc<dyn RouteStrategy>,
    region: Option<String>,
    pinned_exit: Option<PeerId>,
    max_attempts: usize,
}

impl Router {
    pub fn new(
        registry: PeerRegistry,
        strategy: Arc<dyn RouteStrategy>,
        region: Option<String>,
        max_attempts: usize,
    ) -> Self {
        Self {
            registry,
            strategy,
            region,
            pinned_exit: None,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Sends every request to `exit` first, whatever the strategy.
    pub fn with_pinned_exit(mut self, exit: Option<PeerId>) -> Self {
        self.pinned_exit = exit;
        self
    }

    pub fn from_config(registry: PeerRegistry, config: &RoutingConfig) -> Result<Self, Error> {
        let exit: Option<PeerId> = config
            .exit
            .as_deref()
            .map(str::parse::<PeerId>)
            .transpose()
            .map_err(|err| Error::Config(format!("routing.exit: {err}")))?;
        let strategy: Arc<dyn RouteStrategy> = match (config.strategy, exit) {
            (StrategyKind::Static, Some(exit)) => Arc::new(StaticStrategy::new(exit)),
            (StrategyKind::Static, None) => {
                return Err(Error::Config(
                    "routing.exit is required by the static strategy".into(),
                ))
            }
            (StrategyKind::RoundRobin, _) => Arc::new(RoundRobinStrategy::new()),
            (StrategyKind::Latency, _) => Arc::new(LatencyStrategy),
        };
        let router = Self::new(
            registry,
            strategy,
            config.region.clone(),
            config.max_attempts,
        );
        Ok(router.with_pinned_exit(exit))
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn request_for(&self, target: SocksSocketAddr) -> RouteRequest {
        RouteRequest {
            region: self.region.clone(),
            exit: self.pinned_exit,
            ..RouteRequest::new(target)
        }
    }

    /// Next exit to try, or `None` when every candidate is exhausted. A
    /// pinned exit is tried before the strategy is consulted.
    pub fn next_hop(&self, request: &RouteRequest) -> Option<PeerId> {
        if let Some(exit) = request.exit {
            if !request.excluded.contains(&exit) {
                return Some(exit);
            }
        }
        let candidates = self.registry.exit_candidates();
        self.strategy
            .select(&candidates, request)
            .filter(|peer| !request.excluded.contains(peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        identity::Keypair,
        routing::registry::RegistryConfig,
        transport::PeerAddr,
    };

    fn announce_exit(registry: &PeerRegistry) -> PeerId {
        let peer = Keypair::generate().peer_id();
        registry.upsert(
            PeerRecord {
                peer_id: peer,
                addrs: vec![PeerAddr::Direct("10.1.1.1:4000".into())],
                roles: Roles {
                    exit: true,
                    relay: false,
                },
                region: None,
            },
            RecordSource::Identify,
        );
        peer
    }

    #[test]
    fn exhausts_candidates_once_each() {
        let registry = PeerRegistry::new(RegistryConfig::default());
        let first = announce_exit(&registry);
        let second = announce_exit(&registry);
        let router = Router::new(registry, Arc::new(RoundRobinStrategy::new()), None, 3);

        let mut request = router.request_for(SocksSocketAddr::default());
        let mut tried = Vec::new();
        while let Some(exit) = router.next_hop(&request) {
            request.excluded.insert(exit);
            tried.push(exit);
        }
        tried.sort();
        let mut expected = vec![first, second];
        expected.sort();
        assert_eq!(tried, expected);
    }

    #[test]
    fn pinned_exit_goes_first() {
        let registry = PeerRegistry::new(RegistryConfig::default());
        let announced = announce_exit(&registry);
        let pinned = Keypair::generate().peer_id();
        let router = Router::new(registry, Arc::new(LatencyStrategy), None, 3)
            .with_pinned_exit(Some(pinned));

        let mut request = router.request_for(SocksSocketAddr::default());
        assert_eq!(router.next_hop(&request), Some(pinned));
        request.excluded.insert(pinned);
        assert_eq!(router.next_hop(&request), Some(announced));
    }

    #[test]
    fn static_strategy_requires_an_exit() {
        let config = RoutingConfig {
            strategy: StrategyKind::Static,
            exit: None,
            ..RoutingConfig::default()
        };
        let registry = PeerRegistry::new(RegistryConfig::default());
        assert!(matches!(
            Router::from_config(registry, &config),
            Err(Error::Config(_))
        ));
    }
}
