//! # Bethrou
//!
//! A decentralized peer-to-peer proxy network. Applications talk SOCKS5 to a
//! local ingress; each connection is carried as an encrypted stream over a
//! private overlay to an exit node, which opens the real TCP connection.
//! Nodes that cannot accept inbound connections are reached through relays.
//!
//! ## Layers
//!
//! - **Identity and membrane**: every node has an Ed25519 key; its
//!   [`identity::PeerId`] is the BLAKE3 hash of the public key. Overlay
//!   membership is gated by a pre-shared network key
//!   ([`membrane::PreSharedKey`]) mixed into the handshake key schedule, so
//!   outsiders fail the handshake without ever seeing the key.
//! - **Transport**: a handshake upgrades any byte stream into a sealed,
//!   multiplexed [`transport::Session`]. Streams are tagged with a protocol
//!   id and carry per-stream flow control.
//! - **Node**: [`node::Node`] listens, dials, keeps the session table and
//!   hands inbound streams to the service registered for their protocol.
//! - **Services**: identify, peer exchange ([`discovery`]), dial-back
//!   reachability probing ([`nat`]), the exit ([`exit`]) and the relay
//!   ([`relay`]).
//! - **Ingress**: [`Socks5Socket`] speaks SOCKS5 to one client and hands the
//!   CONNECT request to a [`method_handlers::Connect`] implementation. The
//!   overlay one, [`method_handlers::PeerConnect`], asks the
//!   [`routing::Router`] for an exit and retries the next one on failure.
//!
//! ## Protocol flow
//!
//! 1. The client negotiates "no authentication" and sends CONNECT with the
//!    destination (IPv4, IPv6 or domain name).
//! 2. The ingress opens a `/bethrou/connect/1.0.0` stream to the chosen exit
//!    and writes the destination in SOCKS5 address encoding.
//! 3. The exit checks its destination policy, connects and answers with a
//!    SOCKS5 reply code and its bound address.
//! 4. The ingress relays that reply to the client and splices the two byte
//!    streams until either side closes.
//!
//! ## Example
//!
//! Running a client with the default configuration:
//!
//! ```no_run
//! use bethrou::{config::Config, daemon::Daemon, identity::Keypair};
//!
//! #[tokio::main]
//! async fn main() -> bethrou::Result<()> {
//!     let mut config = Config::client();
//!     config.discovery.bootstrap = vec!["203.0.113.7:4000".into()];
//!
//!     let daemon = Daemon::start(config, Keypair::generate(), None).await?;
//!     println!("SOCKS5 on {:?}", daemon.socks_addr());
//!     tokio::signal::ctrl_c().await?;
//!     daemon.shutdown();
//!     Ok(())
//! }
//! ```

use std::io;

use thiserror::Error;

pub mod auth;
pub mod config;
pub mod daemon;
pub mod discovery;
pub mod exit;
pub mod identity;
pub mod ingress;
pub mod membrane;
pub mod method_handlers;
pub mod nat;
pub mod node;
pub mod protocol;
pub mod relay;
pub mod routing;
mod socks5_socket;
pub mod splice;
pub mod transport;
pub mod wire;

pub use socks5_socket::Socks5Socket;

use exit::{policy::PolicyError, ExitError};
use identity::{IdentityError, PeerId};
use membrane::MembraneError;
use protocol::{Reply, Socks5Error};
use relay::RelayError;
use transport::TransportError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Membrane(#[from] MembraneError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Socks(#[from] Socks5Error),
    #[error(transparent)]
    Exit(#[from] ExitError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("no known address for peer {0}")]
    NoAddress(PeerId),
    #[error("node is shutting down")]
    Shutdown,
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Broad kind of a failure, deciding how callers react to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed or unsupported input. Answered, never retried.
    Protocol,
    /// The peer or destination could not be reached. Worth another try.
    Connectivity,
    /// Membership or identity check failed. Fails closed.
    Authentication,
    /// A cap was hit. Reported at once, never queued.
    ResourceExhausted,
    Internal,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Transport(err) => transport_class(err),
            Error::Relay(err) => match err {
                RelayError::CapacityExceeded => ErrorClass::ResourceExhausted,
                RelayError::InvalidTransition { .. } => ErrorClass::Internal,
                RelayError::Transport(err) => transport_class(err),
                RelayError::NoReservation
                | RelayError::Refused(_)
                | RelayError::Timeout(_)
                | RelayError::Io(_) => ErrorClass::Connectivity,
            },
            Error::Identity(IdentityError::BadSignature) => ErrorClass::Authentication,
            Error::Identity(_) | Error::Membrane(_) | Error::Policy(_) | Error::Config(_) => {
                ErrorClass::Internal
            }
            Error::Socks(Socks5Error::Reply(_)) => ErrorClass::Protocol,
            Error::Socks(Socks5Error::Io(_)) | Error::Io(_) => ErrorClass::Connectivity,
            Error::Exit(err) => match err {
                ExitError::Denied | ExitError::Socks(_) => ErrorClass::Protocol,
                ExitError::CapacityExceeded => ErrorClass::ResourceExhausted,
                ExitError::Refused(reply) => refusal_class(*reply),
                ExitError::Resolve(_)
                | ExitError::Connect { .. }
                | ExitError::Timeout
                | ExitError::Io(_) => ErrorClass::Connectivity,
            },
            Error::NoAddress(_) => ErrorClass::Connectivity,
            Error::Shutdown => ErrorClass::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Connectivity
    }
}

/// A refusal sent back by an exit. Requests another exit would refuse the
/// same way are final; unreachable destinations and a busy exit are not.
fn refusal_class(reply: Reply) -> ErrorClass {
    match reply {
        Reply::ConnectionNotAllowedByRuleset
        | Reply::CommandNotSupported
        | Reply::AddressTypeNotSupported => ErrorClass::Protocol,
        Reply::Success
        | Reply::GeneralFailure
        | Reply::NetworkUnreachable
        | Reply::HostUnreachable
        | Reply::ConnectionRefused
        | Reply::TtlExpired => ErrorClass::Connectivity,
    }
}

fn transport_class(err: &TransportError) -> ErrorClass {
    match err {
        TransportError::MembershipMismatch
        | TransportError::PeerIdMismatch { .. }
        | TransportError::Decrypt => ErrorClass::Authentication,
        TransportError::StreamLimit => ErrorClass::ResourceExhausted,
        TransportError::Handshake(_) | TransportError::Protocol(_) => ErrorClass::Protocol,
        TransportError::Io(_) | TransportError::Timeout(_) | TransportError::SessionClosed => {
            ErrorClass::Connectivity
        }
    }
}
