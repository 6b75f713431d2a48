//! Circuit relay.
//!
//! A peer that cannot accept inbound connections reserves a slot on a relay
//! ([`RESERVE_PROTOCOL`]) and advertises a relayed address. A dialer asks the
//! relay for a circuit to that peer ([`HOP_PROTOCOL`]); the relay opens a
//! [`STOP_PROTOCOL`] stream to the target and splices the two streams. The
//! dialer and the target then run a full handshake inside the circuit, so
//! the relay only ever sees sealed frames.

pub mod client;
pub mod reservation;
pub mod server;

use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use client::RelayClient;
pub use reservation::{Reservation, ReservationLimits, ReservationState, ReservationTable};
pub use server::RelayServer;

use crate::{identity::PeerId, transport::TransportError};

pub const RESERVE_PROTOCOL: &str = "/bethrou/relay/reserve/1.0.0";
pub const HOP_PROTOCOL: &str = "/bethrou/relay/hop/1.0.0";
pub const STOP_PROTOCOL: &str = "/bethrou/relay/stop/1.0.0";

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("relay is at capacity")]
    CapacityExceeded,
    #[error("target holds no reservation on this relay")]
    NoReservation,
    #[error("reservation cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        from: ReservationState,
        to: ReservationState,
    },
    #[error("relay refused: {0:?}")]
    Refused(Status),
    #[error("relay {0} timed out")]
    Timeout(&'static str),
    #[error("relay transport: {0}")]
    Transport(#[from] TransportError),
    #[error("relay io: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    fn from_status(status: Status) -> RelayError {
        match status {
            Status::CapacityExceeded => RelayError::CapacityExceeded,
            Status::NoReservation => RelayError::NoReservation,
            other => RelayError::Refused(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    CapacityExceeded,
    NoReservation,
    PermissionDenied,
    ConnectionFailed,
}

impl From<&RelayError> for Status {
    fn from(err: &RelayError) -> Self {
        match err {
            RelayError::CapacityExceeded => Status::CapacityExceeded,
            RelayError::NoReservation => Status::NoReservation,
            _ => Status::ConnectionFailed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveRequest;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveResponse {
    pub status: Status,
    pub ttl_secs: u64,
    /// Address the relay is reachable on, as it advertises itself.
    pub relay_addrs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopRequest {
    pub target: PeerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopResponse {
    pub status: Status,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopRequest {
    pub source: PeerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResponse {
    pub status: Status,
}
