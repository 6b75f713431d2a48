//! Holder side of circuit relay: keeps reservations on relays while the node
//! is not publicly reachable, and accepts circuits relays open to it.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{
    HopRequest, HopResponse, RelayError, Reservation, ReservationState, ReserveRequest,
    ReserveResponse, Status, StopRequest, StopResponse, HOP_PROTOCOL, RESERVE_PROTOCOL,
    STOP_PROTOCOL,
};
use crate::{
    config::{RelayClientConfig, RelayClientMode},
    identity::PeerId,
    nat::Reachability,
    node::{DialTarget, Node},
    transport::{session::SessionPath, PeerAddr, PeerStream, Role, Session},
    wire, Error,
};

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(300);
const RESCAN_INTERVAL: Duration = Duration::from_secs(30);

/// Asks `relay` for a circuit to `target`. The returned stream reaches the
/// target once the relay answers; the caller runs the handshake over it.
pub async fn open_circuit(
    relay: &Session,
    target: PeerId,
    timeout: Duration,
) -> Result<PeerStream, RelayError> {
    let mut stream = relay.open_stream(HOP_PROTOCOL).await?;
    let response = tokio::time::timeout(timeout, async {
        wire::write_message(&mut stream, &HopRequest { target }).await?;
        wire::read_message::<_, HopResponse>(&mut stream).await
    })
    .await
    .map_err(|_| RelayError::Timeout("circuit"))??;
    match response.status {
        Status::Ok => Ok(stream),
        status => Err(RelayError::from_status(status)),
    }
}

/// Requests or renews a reservation on the remote of `session`.
pub async fn reserve(session: &Session, timeout: Duration) -> Result<ReserveResponse, RelayError> {
    let response = tokio::time::timeout(timeout, async {
        let mut stream = session.open_stream(RESERVE_PROTOCOL).await?;
        wire::write_message(&mut stream, &ReserveRequest).await?;
        Ok::<_, RelayError>(wire::read_message::<_, ReserveResponse>(&mut stream).await?)
    })
    .await
    .map_err(|_| RelayError::Timeout("reservation"))??;
    match response.status {
        Status::Ok => Ok(response),
        status => Err(RelayError::from_status(status)),
    }
}

struct ClientState {
    /// Maintainers by relay address, each cancellable.
    maintainers: HashMap<String, CancellationToken>,
    /// Reservations held, by relay.
    reservations: HashMap<PeerId, Reservation>,
}

#[derive(Clone)]
pub struct RelayClient {
    node: Node,
    mode: RelayClientMode,
    relays: Vec<DialTarget>,
    max_reservations: usize,
    request_timeout: Duration,
    state: Arc<Mutex<ClientState>>,
}

impl RelayClient {
    /// Starts accepting circuits and, unless the mode is `never`, the task
    /// that keeps reservations.
    pub fn start(node: Node, config: &RelayClientConfig) -> Result<RelayClient, Error> {
        let client = RelayClient {
            node,
            mode: config.mode,
            relays: config.relay_targets()?,
            max_reservations: config.max_reservations.max(1),
            request_timeout: config.request_timeout(),
            state: Arc::new(Mutex::new(ClientState {
                maintainers: HashMap::new(),
                reservations: HashMap::new(),
            })),
        };
        tokio::spawn(client.clone().serve_stops());
        if client.mode != RelayClientMode::Never {
            tokio::spawn(client.clone().manage());
        }
        Ok(client)
    }

    /// Relays with a usable reservation.
    pub fn active_relays(&self) -> Vec<PeerId> {
        self.state
            .lock()
            .reservations
            .values()
            .filter(|reservation| reservation.state().is_usable())
            .map(|reservation| reservation.relay)
            .collect()
    }

    fn wants_reservations(&self) -> Option<bool> {
        match self.mode {
            RelayClientMode::Never => Some(false),
            RelayClientMode::Always => Some(true),
            RelayClientMode::Auto => match self.node.nat().reachability() {
                Reachability::Private => Some(true),
                Reachability::Public => Some(false),
                Reachability::Unknown => None,
            },
        }
    }

    async fn manage(self) {
        let shutdown = self.node.shutdown_token();
        let mut reachability = self.node.nat().subscribe();
        loop {
            match self.wants_reservations() {
                Some(true) => self.fill().await,
                Some(false) => self.release_all(),
                None => {}
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = reachability.changed() => {}
                _ = tokio::time::sleep(RESCAN_INTERVAL) => {}
            }
        }
        self.release_all();
    }

    fn candidates(&self) -> Vec<DialTarget> {
        if !self.relays.is_empty() {
            return self.relays.clone();
        }
        let own = self.node.peer_id();
        self.node
            .registry()
            .relays()
            .into_iter()
            .filter(|record| record.peer_id != own)
            .filter_map(|record| {
                let addr = record.direct_addrs().next()?.to_string();
                Some(DialTarget::new(Some(record.peer_id), PeerAddr::Direct(addr)))
            })
            .collect()
    }

    async fn fill(&self) {
        for target in self.candidates() {
            let key = target.to_string();
            let token = {
                let mut state = self.state.lock();
                if state.maintainers.len() >= self.max_reservations {
                    break;
                }
                if state.maintainers.contains_key(&key) {
                    continue;
                }
                let token = self.node.shutdown_token().child_token();
                state.maintainers.insert(key.clone(), token.clone());
                token
            };
            let span = info_span!("reservation", relay = %key);
            tokio::spawn(self.clone().maintain(target, key, token).instrument(span));
        }
    }

    fn release_all(&self) {
        let tokens: Vec<CancellationToken> = self
            .state
            .lock()
            .maintainers
            .drain()
            .map(|(_, token)| token)
            .collect();
        if !tokens.is_empty() {
            info!(count = tokens.len(), "releasing relay reservations");
        }
        for token in tokens {
            token.cancel();
        }
    }

    async fn maintain(self, target: DialTarget, key: String, token: CancellationToken) {
        let mut backoff = INITIAL_BACKOFF;
        while !token.is_cancelled() {
            match self.hold(&target, &token, &mut backoff).await {
                Ok(()) => break,
                Err(err) => warn!(%err, retry_in = ?backoff, "reservation lost"),
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
        self.state.lock().maintainers.remove(&key);
    }

    async fn relay_session(&self, target: &DialTarget) -> Result<Session, Error> {
        if let Some(peer) = target.peer {
            if let Some(session) = self.node.session(&peer).filter(|s| !s.is_relayed()) {
                return Ok(session);
            }
        }
        self.node.dial(target).await
    }

    /// Reserves on one relay and renews until cancelled or until renewal
    /// fails. Returns `Ok` only on cancellation.
    async fn hold(
        &self,
        target: &DialTarget,
        token: &CancellationToken,
        backoff: &mut Duration,
    ) -> Result<(), Error> {
        let session = self.relay_session(target).await?;
        let relay = session.remote_peer();
        let own = self.node.peer_id();

        let response = reserve(&session, self.request_timeout).await?;
        let mut ttl = Duration::from_secs(response.ttl_secs.max(1));
        let mut reservation = Reservation::new(relay, own);
        reservation.grant(ttl, Instant::now())?;
        reservation.activate()?;
        self.state.lock().reservations.insert(relay, reservation);

        let mut advertised: Vec<String> = response.relay_addrs;
        if advertised.is_empty() {
            if let PeerAddr::Direct(addr) = &target.addr {
                advertised.push(addr.clone());
            }
        }
        for relay_addr in advertised {
            self.node.add_relayed_addr(PeerAddr::Relayed {
                relay,
                relay_addr,
                target: own,
            });
        }
        info!(%relay, ?ttl, "reservation active");
        *backoff = INITIAL_BACKOFF;

        let failure: Error = loop {
            tokio::select! {
                _ = token.cancelled() => {
                    self.end(relay, ReservationState::Closed);
                    return Ok(());
                }
                _ = session.closed() => break RelayError::Transport(
                    crate::transport::TransportError::SessionClosed,
                ).into(),
                _ = tokio::time::sleep(ttl.mul_f64(0.75)) => {
                    match reserve(&session, self.request_timeout).await {
                        Ok(renewed) => {
                            ttl = Duration::from_secs(renewed.ttl_secs.max(1));
                            let mut state = self.state.lock();
                            if let Some(reservation) = state.reservations.get_mut(&relay) {
                                reservation.renew(ttl, Instant::now())?;
                            }
                            debug!(%relay, ?ttl, "reservation renewed");
                        }
                        Err(err) => break err.into(),
                    }
                }
            }
        };
        self.end(relay, ReservationState::Expired);
        Err(failure)
    }

    /// Ends the reservation on `relay` and tears down what depended on it.
    fn end(&self, relay: PeerId, state: ReservationState) {
        if let Some(mut reservation) = self.state.lock().reservations.remove(&relay) {
            let _ = match state {
                ReservationState::Expired => reservation.expire(),
                _ => reservation.close(),
            };
        }
        self.node.remove_relayed_addrs_via(&relay);
        self.node.close_sessions_via(&relay);
        debug!(%relay, ?state, "reservation ended");
    }

    async fn serve_stops(self) {
        let mut incoming = self.node.accept(STOP_PROTOCOL);
        let shutdown = self.node.shutdown_token();
        loop {
            let stream = tokio::select! {
                _ = shutdown.cancelled() => break,
                stream = incoming.recv() => match stream {
                    Some(stream) => stream,
                    None => break,
                },
            };
            let client = self.clone();
            tokio::spawn(async move {
                let relay = stream.remote_peer();
                if let Err(err) = client.accept_circuit(stream).await {
                    debug!(%relay, %err, "inbound circuit failed");
                }
            });
        }
    }

    async fn accept_circuit(&self, mut stream: PeerStream) -> Result<(), Error> {
        let relay = stream.remote_peer();
        let StopRequest { source } = wire::read_message(&mut stream).await?;
        let usable = self
            .state
            .lock()
            .reservations
            .get(&relay)
            .map_or(false, |reservation| reservation.state().is_usable());
        if !usable {
            let refusal = StopResponse {
                status: Status::NoReservation,
            };
            wire::write_message(&mut stream, &refusal).await?;
            return Err(RelayError::NoReservation.into());
        }
        wire::write_message(&mut stream, &StopResponse { status: Status::Ok }).await?;
        let upgraded = self.node.handshake(stream, Role::Responder, Some(source)).await?;
        self.node.attach(upgraded, SessionPath::Relayed(relay));
        info!(%source, %relay, "accepted relayed session");
        Ok(())
    }
}
