//! Peer transport.
//!
//! A peer connection is any reliable byte stream (a TCP socket, or a relayed
//! [`PeerStream`]) upgraded in three layers:
//!
//! 1. [`handshake`]: X25519 key agreement keyed by the network membrane, then a
//!    signed identity proof in the first sealed message.
//! 2. [`codec`]: ChaCha20-Poly1305 sealed frames with counter nonces.
//! 3. [`session`]: stream multiplexing with per-stream credit windows, see
//!    [`mux`] for the frame layout.

pub mod codec;
pub mod handshake;
pub mod mux;
pub mod session;

use std::{fmt, io, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::PeerId;

pub use handshake::{upgrade, Role, Upgraded};
pub use session::{PeerStream, Session, SessionConfig};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport io: {0}")]
    Io(#[from] io::Error),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("peer is not a member of this private network")]
    MembershipMismatch,
    #[error("expected peer {expected}, got {actual}")]
    PeerIdMismatch { expected: PeerId, actual: PeerId },
    #[error("sealed frame failed authentication")]
    Decrypt,
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("session closed")]
    SessionClosed,
    #[error("stream limit reached")]
    StreamLimit,
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl TransportError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        TransportError::Protocol(msg.into())
    }

    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            TransportError::MembershipMismatch | TransportError::PeerIdMismatch { .. }
        )
    }
}

/// A dialable address of a peer.
///
/// Direct addresses are `host:port`. Relayed addresses name the relay and the
/// target: `<relay-id>@<relay host:port>/circuit/<target-id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerAddr {
    Direct(String),
    Relayed {
        relay: PeerId,
        relay_addr: String,
        target: PeerId,
    },
}

const CIRCUIT_SEPARATOR: &str = "/circuit/";

impl PeerAddr {
    pub fn is_relayed(&self) -> bool {
        matches!(self, PeerAddr::Relayed { .. })
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Direct(addr) => write!(f, "{addr}"),
            PeerAddr::Relayed {
                relay,
                relay_addr,
                target,
            } => write!(f, "{relay}@{relay_addr}{CIRCUIT_SEPARATOR}{target}"),
        }
    }
}

impl FromStr for PeerAddr {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some((relay_part, target)) = s.split_once(CIRCUIT_SEPARATOR) {
            let (relay, relay_addr) = relay_part.split_once('@').ok_or_else(|| {
                TransportError::protocol(format!("relayed address {s} lacks relay id"))
            })?;
            return Ok(PeerAddr::Relayed {
                relay: relay
                    .parse()
                    .map_err(|_| TransportError::protocol(format!("bad relay id in {s}")))?,
                relay_addr: validate_host_port(relay_addr)?,
                target: target
                    .parse()
                    .map_err(|_| TransportError::protocol(format!("bad target id in {s}")))?,
            });
        }
        Ok(PeerAddr::Direct(validate_host_port(s)?))
    }
}

fn validate_host_port(s: &str) -> Result<String, TransportError> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| TransportError::protocol(format!("{s} is not host:port")))?;
    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(TransportError::protocol(format!("{s} is not host:port")));
    }
    Ok(s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn parses_direct_and_relayed_addresses() {
        let direct: PeerAddr = "10.0.0.1:4000".parse().unwrap();
        assert_eq!(direct, PeerAddr::Direct("10.0.0.1:4000".into()));

        let relay = Keypair::generate().peer_id();
        let target = Keypair::generate().peer_id();
        let text = format!("{relay}@relay.example.net:4000/circuit/{target}");
        let relayed: PeerAddr = text.parse().unwrap();
        assert!(relayed.is_relayed());
        assert_eq!(relayed.to_string(), text);
    }

    #[test]
    fn rejects_addresses_without_port() {
        assert!("10.0.0.1".parse::<PeerAddr>().is_err());
        assert!(":4000".parse::<PeerAddr>().is_err());
        assert!("host:http".parse::<PeerAddr>().is_err());
    }
}
