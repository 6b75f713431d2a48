//! Runtime configuration.
//!
//! Every section defaults to something usable, so an empty YAML document is
//! a valid configuration. Durations are whole seconds in `*_secs` fields.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    exit::policy::PolicyConfig,
    node::DialTarget,
    relay::ReservationLimits,
    routing::{registry::RegistryConfig, StrategyKind},
    transport::SessionConfig,
    Error,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub network: NetworkConfig,
    pub discovery: DiscoveryConfig,
    pub exit: ExitConfig,
    pub relay: RelayConfig,
    pub socks: SocksConfig,
    pub routing: RoutingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// Addresses accepting peer connections. Empty means dial-out only.
    pub listen: Vec<SocketAddr>,
    /// Addresses to advertise in addition to the listen addresses.
    pub external_addrs: Vec<String>,
    pub identity_key: Option<PathBuf>,
    /// Private network key in `swarm.key` format. Without one the node only
    /// talks to other open nodes.
    pub network_key: Option<PathBuf>,
    pub region: Option<String>,
    pub dial_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub max_connections: usize,
    pub max_streams_per_session: usize,
    pub stream_window_bytes: u32,
    pub keepalive_interval_secs: u64,
    pub keepalive_timeout_secs: u64,
    pub nat_probe_interval_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: vec![SocketAddr::from(([0, 0, 0, 0], 4000))],
            external_addrs: Vec::new(),
            identity_key: None,
            network_key: None,
            region: None,
            dial_timeout_secs: 10,
            handshake_timeout_secs: 10,
            max_connections: 256,
            max_streams_per_session: 256,
            stream_window_bytes: 256 * 1024,
            keepalive_interval_secs: 15,
            keepalive_timeout_secs: 45,
            nat_probe_interval_secs: 300,
        }
    }
}

impl NetworkConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn nat_probe_interval(&self) -> Duration {
        Duration::from_secs(self.nat_probe_interval_secs.max(1))
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            max_streams: self.max_streams_per_session,
            initial_window: self.stream_window_bytes,
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs),
            keepalive_timeout: Duration::from_secs(self.keepalive_timeout_secs),
            ..SessionConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// `[peer-id@]host:port` or relayed addresses.
    pub bootstrap: Vec<String>,
    pub interval_secs: u64,
    pub peer_ttl_secs: u64,
    pub max_peers: usize,
    /// Connected peers asked for records each round.
    pub exchange_fanout: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bootstrap: Vec::new(),
            interval_secs: 30,
            peer_ttl_secs: 600,
            max_peers: 512,
            exchange_fanout: 3,
        }
    }
}

impl DiscoveryConfig {
    pub fn bootstrap_targets(&self) -> Result<Vec<DialTarget>, Error> {
        self.bootstrap
            .iter()
            .map(|entry| {
                entry
                    .parse()
                    .map_err(|err| Error::Config(format!("discovery.bootstrap {entry}: {err}")))
            })
            .collect()
    }

    pub fn registry(&self) -> RegistryConfig {
        RegistryConfig {
            max_peers: self.max_peers,
            ..RegistryConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExitConfig {
    pub enabled: bool,
    pub connect_timeout_secs: u64,
    /// Zero disables the idle timeout.
    pub idle_timeout_secs: u64,
    pub max_streams: usize,
    pub policy: PolicyConfig,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            connect_timeout_secs: 10,
            idle_timeout_secs: 300,
            max_streams: 1024,
            policy: PolicyConfig::default(),
        }
    }
}

impl ExitConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        secs_or_none(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    pub server: RelayServerConfig,
    pub client: RelayClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayServerConfig {
    pub enabled: bool,
    pub max_reservations: usize,
    /// Simultaneous circuits across all reservations.
    pub max_circuits: usize,
    pub max_circuits_per_peer: usize,
    pub reservation_ttl_secs: u64,
    pub circuit_idle_timeout_secs: u64,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_reservations: 128,
            max_circuits: 16,
            max_circuits_per_peer: 4,
            reservation_ttl_secs: 3600,
            circuit_idle_timeout_secs: 300,
        }
    }
}

impl RelayServerConfig {
    pub fn limits(&self) -> ReservationLimits {
        ReservationLimits {
            max_reservations: self.max_reservations,
            max_circuits: self.max_circuits,
            max_circuits_per_peer: self.max_circuits_per_peer,
            ttl: Duration::from_secs(self.reservation_ttl_secs),
        }
    }

    pub fn circuit_idle_timeout(&self) -> Option<Duration> {
        secs_or_none(self.circuit_idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayClientMode {
    /// Reserve only while the node is not publicly reachable.
    #[default]
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RelayClientConfig {
    pub mode: RelayClientMode,
    /// Relays to reserve on. Empty means any relay from the registry.
    pub relays: Vec<String>,
    pub max_reservations: usize,
    pub request_timeout_secs: u64,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            mode: RelayClientMode::Auto,
            relays: Vec::new(),
            max_reservations: 2,
            request_timeout_secs: 10,
        }
    }
}

impl RelayClientConfig {
    pub fn relay_targets(&self) -> Result<Vec<DialTarget>, Error> {
        self.relays
            .iter()
            .map(|entry| {
                entry
                    .parse()
                    .map_err(|err| Error::Config(format!("relay.client.relays {entry}: {err}")))
            })
            .collect()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SocksConfig {
    pub enabled: bool,
    pub listen: SocketAddr,
    pub handshake_timeout_secs: u64,
    /// Zero disables the idle timeout.
    pub idle_timeout_secs: u64,
}

impl Default for SocksConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: SocketAddr::from(([127, 0, 0, 1], 1080)),
            handshake_timeout_secs: 10,
            idle_timeout_secs: 300,
        }
    }
}

impl SocksConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        secs_or_none(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoutingConfig {
    pub strategy: StrategyKind,
    /// Exit peer id, required by the static strategy and tried first by the
    /// others.
    pub exit: Option<String>,
    pub region: Option<String>,
    pub max_attempts: usize,
    /// Bound on opening a stream to one exit and reading its reply.
    pub stream_timeout_secs: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::RoundRobin,
            exit: None,
            region: None,
            max_attempts: 3,
            stream_timeout_secs: 15,
        }
    }
}

impl RoutingConfig {
    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }
}

fn secs_or_none(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl Config {
    /// Defaults for a node serving as exit.
    pub fn node() -> Self {
        let mut config = Config::default();
        config.exit.enabled = true;
        config
    }

    /// Defaults for a client: SOCKS ingress, no listener, no exit.
    pub fn client() -> Self {
        let mut config = Config::default();
        config.network.listen.clear();
        config.socks.enabled = true;
        config
    }

    pub fn from_yaml(text: &str) -> Result<Self, Error> {
        let config: Config =
            serde_yaml::from_str(text).map_err(|err| Error::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), Error> {
        let checks: [(bool, &str); 11] = [
            (self.network.dial_timeout_secs > 0, "network.dial_timeout_secs must be positive"),
            (
                self.network.handshake_timeout_secs > 0,
                "network.handshake_timeout_secs must be positive",
            ),
            (
                self.network.keepalive_interval_secs > 0
                    && self.network.keepalive_interval_secs < self.network.keepalive_timeout_secs,
                "network.keepalive_interval_secs must be positive and below keepalive_timeout_secs",
            ),
            (
                self.network.stream_window_bytes >= 1024,
                "network.stream_window_bytes must be at least 1024",
            ),
            (
                self.network.max_streams_per_session > 0,
                "network.max_streams_per_session must be positive",
            ),
            (self.discovery.interval_secs > 0, "discovery.interval_secs must be positive"),
            (self.discovery.peer_ttl_secs > 0, "discovery.peer_ttl_secs must be positive"),
            (self.exit.connect_timeout_secs > 0, "exit.connect_timeout_secs must be positive"),
            (self.exit.max_streams > 0, "exit.max_streams must be positive"),
            (self.routing.max_attempts > 0, "routing.max_attempts must be positive"),
            (
                self.relay.server.reservation_ttl_secs > 0,
                "relay.server.reservation_ttl_secs must be positive",
            ),
        ];
        if let Some((_, message)) = checks.iter().find(|(ok, _)| !ok) {
            return Err(Error::Config((*message).to_string()));
        }
        self.discovery.bootstrap_targets()?;
        self.relay.client.relay_targets()?;
        crate::exit::policy::RulePolicy::from_config(&self.exit.policy)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.network.listen, vec![SocketAddr::from(([0, 0, 0, 0], 4000))]);
        assert_eq!(config.socks.listen, SocketAddr::from(([127, 0, 0, 1], 1080)));
        assert_eq!(config.routing.strategy, StrategyKind::RoundRobin);
        assert_eq!(config.relay.client.mode, RelayClientMode::Auto);
    }

    #[test]
    fn parses_a_client_file() {
        let yaml = r#"
network:
  listen: []
  network_key: /etc/bethrou/swarm.key
socks:
  enabled: true
  listen: 127.0.0.1:1081
routing:
  strategy: latency
  region: eu
  max_attempts: 5
discovery:
  bootstrap:
    - 203.0.113.7:4000
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert!(config.network.listen.is_empty());
        assert!(config.socks.enabled);
        assert_eq!(config.routing.strategy, StrategyKind::Latency);
        assert_eq!(config.routing.max_attempts, 5);
        assert_eq!(config.discovery.bootstrap_targets().unwrap().len(), 1);
    }

    #[test]
    fn rejects_unknown_fields_and_bad_values() {
        assert!(Config::from_yaml("network:\n  lisen: []\n").is_err());
        assert!(Config::from_yaml("routing:\n  max_attempts: 0\n").is_err());
        assert!(Config::from_yaml("discovery:\n  bootstrap: [\"nowhere\"]\n").is_err());
    }

    #[test]
    fn zero_discovery_interval_is_rejected() {
        let mut config = Config::default();
        config.discovery.interval_secs = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        assert!(Config::from_yaml("discovery:\n  interval_secs: 0\n").is_err());
    }

    #[test]
    fn zero_idle_timeout_disables_it() {
        let mut config = Config::client();
        config.socks.idle_timeout_secs = 0;
        assert_eq!(config.socks.idle_timeout(), None);
        assert!(config.network.listen.is_empty());
    }
}
