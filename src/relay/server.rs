//! Relay side of circuit relay: grants reservations and splices circuits.

use std::{sync::Arc, time::Duration};

use tokio::{sync::broadcast::error::RecvError, time::Instant};
use tracing::{debug, info, info_span, warn, Instrument};

use super::{
    reservation::CircuitGuard, HopRequest, HopResponse, RelayError, ReservationLimits,
    ReservationTable, ReserveRequest, ReserveResponse, Status, StopRequest, StopResponse,
    HOP_PROTOCOL, RESERVE_PROTOCOL, STOP_PROTOCOL,
};
use crate::{
    identity::PeerId,
    node::{Node, NodeEvent},
    splice::splice,
    transport::PeerStream,
    wire,
};

const STOP_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct RelayServer {
    node: Node,
    table: Arc<ReservationTable>,
    circuit_idle_timeout: Option<Duration>,
}

impl RelayServer {
    /// Announces the relay role and serves reservation and hop requests
    /// until the node shuts down.
    pub fn start(
        node: Node,
        limits: ReservationLimits,
        circuit_idle_timeout: Option<Duration>,
    ) -> RelayServer {
        let server = RelayServer {
            table: ReservationTable::new(node.peer_id(), limits),
            node,
            circuit_idle_timeout,
        };
        server.node.set_roles(|roles| roles.relay = true);

        tokio::spawn(server.clone().serve_reservations());
        tokio::spawn(server.clone().serve_hops());
        tokio::spawn(server.clone().sweep());
        tokio::spawn(server.clone().release_on_disconnect());
        info!(
            max_reservations = server.table.limits().max_reservations,
            max_circuits = server.table.limits().max_circuits,
            "relay service started"
        );
        server
    }

    pub fn table(&self) -> &Arc<ReservationTable> {
        &self.table
    }

    async fn serve_reservations(self) {
        let mut incoming = self.node.accept(RESERVE_PROTOCOL);
        let shutdown = self.node.shutdown_token();
        loop {
            let stream = tokio::select! {
                _ = shutdown.cancelled() => break,
                stream = incoming.recv() => match stream {
                    Some(stream) => stream,
                    None => break,
                },
            };
            let server = self.clone();
            tokio::spawn(async move {
                let peer = stream.remote_peer();
                if let Err(err) = server.handle_reserve(stream).await {
                    debug!(%peer, %err, "reservation request failed");
                }
            });
        }
    }

    async fn handle_reserve(&self, mut stream: PeerStream) -> Result<(), RelayError> {
        let ReserveRequest = wire::read_message(&mut stream).await?;
        let holder = stream.remote_peer();

        let response = if stream.remote_addr().is_none() {
            // Reservations over a circuit would chain relays.
            warn!(%holder, "refusing reservation over a relayed session");
            refusal(Status::PermissionDenied)
        } else {
            match self.table.reserve(holder, Instant::now()) {
                Ok(grant) => {
                    info!(%holder, ttl = ?grant.ttl, "reservation granted");
                    ReserveResponse {
                        status: Status::Ok,
                        ttl_secs: grant.ttl.as_secs(),
                        relay_addrs: self
                            .node
                            .local_record()
                            .direct_addrs()
                            .map(str::to_string)
                            .collect(),
                    }
                }
                Err(err) => {
                    warn!(%holder, %err, "reservation refused");
                    refusal(Status::from(&err))
                }
            }
        };
        wire::write_message(&mut stream, &response).await?;
        Ok(())
    }

    async fn serve_hops(self) {
        let mut incoming = self.node.accept(HOP_PROTOCOL);
        let shutdown = self.node.shutdown_token();
        loop {
            let stream = tokio::select! {
                _ = shutdown.cancelled() => break,
                stream = incoming.recv() => match stream {
                    Some(stream) => stream,
                    None => break,
                },
            };
            let server = self.clone();
            let span = info_span!("circuit", source = %stream.remote_peer());
            tokio::spawn(
                async move {
                    if let Err(err) = server.handle_hop(stream).await {
                        debug!(%err, "circuit failed");
                    }
                }
                .instrument(span),
            );
        }
    }

    async fn handle_hop(&self, mut stream: PeerStream) -> Result<(), RelayError> {
        let HopRequest { target } = wire::read_message(&mut stream).await?;
        let source = stream.remote_peer();

        let (guard, target_stream) = match self.connect_target(source, target).await {
            Ok(circuit) => circuit,
            Err(err) => {
                let response = HopResponse {
                    status: Status::from(&err),
                };
                let _ = wire::write_message(&mut stream, &response).await;
                return Err(err);
            }
        };
        wire::write_message(&mut stream, &HopResponse { status: Status::Ok }).await?;
        info!(%target, "circuit open");

        tokio::select! {
            result = splice(stream, target_stream, self.circuit_idle_timeout) => match result {
                Ok(summary) => debug!(
                    %target,
                    to_target = summary.a_to_b,
                    to_source = summary.b_to_a,
                    "circuit closed"
                ),
                Err(err) => debug!(%target, %err, "circuit ended"),
            },
            _ = guard.cancelled() => info!(%target, "reservation ended, circuit torn down"),
        }
        Ok(())
    }

    /// Admits the circuit and asks the target to accept it.
    async fn connect_target(
        &self,
        source: PeerId,
        target: PeerId,
    ) -> Result<(CircuitGuard, PeerStream), RelayError> {
        let guard = self.table.open_circuit(target, Instant::now())?;
        let session = self
            .node
            .session(&target)
            .filter(|session| !session.is_relayed())
            .ok_or(RelayError::NoReservation)?;
        let mut stop = session.open_stream(STOP_PROTOCOL).await?;
        let response = tokio::time::timeout(STOP_TIMEOUT, async {
            wire::write_message(&mut stop, &StopRequest { source }).await?;
            wire::read_message::<_, StopResponse>(&mut stop).await
        })
        .await
        .map_err(|_| RelayError::Timeout("stop"))??;
        match response.status {
            Status::Ok => Ok((guard, stop)),
            status => Err(RelayError::from_status(status)),
        }
    }

    async fn sweep(self) {
        let period = (self.table.limits().ttl / 4).min(MAX_SWEEP_INTERVAL);
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(100)));
        let shutdown = self.node.shutdown_token();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let expired = self.table.sweep(Instant::now());
                    if !expired.is_empty() {
                        info!(count = expired.len(), "expired reservations");
                    }
                }
            }
        }
    }

    async fn release_on_disconnect(self) {
        let mut events = self.node.subscribe();
        let shutdown = self.node.shutdown_token();
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(NodeEvent::Disconnected { peer }) => {
                    if self.table.release(&peer) {
                        info!(%peer, "holder left, reservation closed");
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => debug!(missed, "relay missed node events"),
                Err(RecvError::Closed) => break,
            }
        }
    }
}

fn refusal(status: Status) -> ReserveResponse {
    ReserveResponse {
        status,
        ttl_secs: 0,
        relay_addrs: Vec::new(),
    }
}
