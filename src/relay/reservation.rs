//! Relay reservations.
//!
//! A reservation lets a peer behind NAT be reached through a relay for a
//! bounded time. It moves through a fixed lifecycle:
//!
//! ```text
//! Requested -> Granted -> Active -> Expired
//!      \           \         \---> Closed
//!       \           \------------> Expired | Closed
//!        \-----------------------> Closed
//! ```
//!
//! `Active -> Active` is a renewal. Terminal states accept no transition.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::RelayError;
use crate::identity::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    Requested,
    Granted,
    Active,
    Expired,
    Closed,
}

impl ReservationState {
    pub fn can_transition(self, next: ReservationState) -> bool {
        use ReservationState::*;
        matches!(
            (self, next),
            (Requested, Granted)
                | (Requested, Closed)
                | (Granted, Active)
                | (Granted, Expired)
                | (Granted, Closed)
                | (Active, Active)
                | (Active, Expired)
                | (Active, Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ReservationState::Expired | ReservationState::Closed)
    }

    /// Whether circuits may use the reservation.
    pub fn is_usable(self) -> bool {
        matches!(self, ReservationState::Granted | ReservationState::Active)
    }
}

#[derive(Debug, Clone)]
pub struct Reservation {
    pub relay: PeerId,
    pub holder: PeerId,
    state: ReservationState,
    expires_at: Option<Instant>,
    renewals: u32,
}

impl Reservation {
    pub fn new(relay: PeerId, holder: PeerId) -> Self {
        Self {
            relay,
            holder,
            state: ReservationState::Requested,
            expires_at: None,
            renewals: 0,
        }
    }

    pub fn state(&self) -> ReservationState {
        self.state
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    pub fn renewals(&self) -> u32 {
        self.renewals
    }

    fn transition(&mut self, next: ReservationState) -> Result<(), RelayError> {
        if !self.state.can_transition(next) {
            return Err(RelayError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn grant(&mut self, ttl: Duration, now: Instant) -> Result<(), RelayError> {
        self.transition(ReservationState::Granted)?;
        self.expires_at = Some(now + ttl);
        Ok(())
    }

    pub fn activate(&mut self) -> Result<(), RelayError> {
        self.transition(ReservationState::Active)
    }

    /// Extends a live reservation. A granted reservation becomes active.
    pub fn renew(&mut self, ttl: Duration, now: Instant) -> Result<(), RelayError> {
        self.transition(ReservationState::Active)?;
        self.expires_at = Some(now + ttl);
        self.renewals += 1;
        Ok(())
    }

    pub fn expire(&mut self) -> Result<(), RelayError> {
        self.transition(ReservationState::Expired)
    }

    pub fn close(&mut self) -> Result<(), RelayError> {
        self.transition(ReservationState::Closed)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

#[derive(Debug, Clone)]
pub struct ReservationLimits {
    pub max_reservations: usize,
    pub max_circuits: usize,
    pub max_circuits_per_peer: usize,
    pub ttl: Duration,
}

impl Default for ReservationLimits {
    fn default() -> Self {
        Self {
            max_reservations: 128,
            max_circuits: 16,
            max_circuits_per_peer: 4,
            ttl: Duration::from_secs(3600),
        }
    }
}

/// What a relay tells a holder after reserving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub ttl: Duration,
    pub expires_at: Instant,
}

struct Slot {
    reservation: Reservation,
    circuits: usize,
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct TableState {
    slots: HashMap<PeerId, Slot>,
    active_circuits: usize,
    next_generation: u64,
}

/// Relay-side accounting of reservations and circuits. Every check and
/// update happens under one lock, so limits hold under concurrency.
pub struct ReservationTable {
    relay: PeerId,
    limits: ReservationLimits,
    state: Mutex<TableState>,
}

impl ReservationTable {
    pub fn new(relay: PeerId, limits: ReservationLimits) -> Arc<Self> {
        Arc::new(Self {
            relay,
            limits,
            state: Mutex::new(TableState::default()),
        })
    }

    pub fn limits(&self) -> &ReservationLimits {
        &self.limits
    }

    /// Grants a new reservation or renews the holder's live one.
    pub fn reserve(&self, holder: PeerId, now: Instant) -> Result<Grant, RelayError> {
        let ttl = self.limits.ttl;
        let mut state = self.state.lock();

        if let Some(slot) = state.slots.get_mut(&holder) {
            if !slot.reservation.is_expired(now) {
                slot.reservation.renew(ttl, now)?;
                return Ok(Grant {
                    ttl,
                    expires_at: now + ttl,
                });
            }
        }
        if let Some(stale) = state.slots.remove(&holder) {
            stale.cancel.cancel();
        }
        if state.slots.len() >= self.limits.max_reservations {
            return Err(RelayError::CapacityExceeded);
        }

        let mut reservation = Reservation::new(self.relay, holder);
        reservation.grant(ttl, now)?;
        let generation = state.next_generation;
        state.next_generation += 1;
        state.slots.insert(
            holder,
            Slot {
                reservation,
                circuits: 0,
                generation,
                cancel: CancellationToken::new(),
            },
        );
        Ok(Grant {
            ttl,
            expires_at: now + ttl,
        })
    }

    /// Admits a circuit to `target`. The returned guard holds the circuit
    /// slot until dropped and is cancelled when the reservation ends.
    pub fn open_circuit(
        self: &Arc<Self>,
        target: PeerId,
        now: Instant,
    ) -> Result<CircuitGuard, RelayError> {
        let mut state = self.state.lock();
        let active = state.active_circuits;
        let slot = state
            .slots
            .get_mut(&target)
            .filter(|slot| {
                slot.reservation.state().is_usable() && !slot.reservation.is_expired(now)
            })
            .ok_or(RelayError::NoReservation)?;

        if active >= self.limits.max_circuits
            || slot.circuits >= self.limits.max_circuits_per_peer
        {
            return Err(RelayError::CapacityExceeded);
        }
        if slot.reservation.state() == ReservationState::Granted {
            slot.reservation.activate()?;
        }
        slot.circuits += 1;
        let guard = CircuitGuard {
            table: self.clone(),
            target,
            generation: slot.generation,
            cancel: slot.cancel.child_token(),
        };
        state.active_circuits += 1;
        Ok(guard)
    }

    /// Expires every reservation past its deadline and tears down its
    /// circuits.
    pub fn sweep(&self, now: Instant) -> Vec<PeerId> {
        let mut state = self.state.lock();
        let expired: Vec<PeerId> = state
            .slots
            .iter()
            .filter(|(_, slot)| slot.reservation.is_expired(now))
            .map(|(peer, _)| *peer)
            .collect();
        for peer in &expired {
            if let Some(mut slot) = state.slots.remove(peer) {
                let _ = slot.reservation.expire();
                slot.cancel.cancel();
                debug!(%peer, "reservation expired");
            }
        }
        expired
    }

    /// Ends the holder's reservation, e.g. when its session drops.
    pub fn release(&self, holder: &PeerId) -> bool {
        let mut state = self.state.lock();
        match state.slots.remove(holder) {
            Some(mut slot) => {
                let _ = slot.reservation.close();
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn state_of(&self, holder: &PeerId) -> Option<ReservationState> {
        self.state
            .lock()
            .slots
            .get(holder)
            .map(|slot| slot.reservation.state())
    }

    pub fn reservation_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn active_circuits(&self) -> usize {
        self.state.lock().active_circuits
    }
}

/// An admitted circuit. Dropping it frees the slot.
pub struct CircuitGuard {
    table: Arc<ReservationTable>,
    target: PeerId,
    generation: u64,
    cancel: CancellationToken,
}

impl CircuitGuard {
    /// Resolves when the reservation behind this circuit ends.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

impl Drop for CircuitGuard {
    fn drop(&mut self) {
        let mut state = self.table.state.lock();
        state.active_circuits = state.active_circuits.saturating_sub(1);
        if let Some(slot) = state.slots.get_mut(&self.target) {
            if slot.generation == self.generation {
                slot.circuits = slot.circuits.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn peer() -> PeerId {
        Keypair::generate().peer_id()
    }

    fn table(limits: ReservationLimits) -> Arc<ReservationTable> {
        ReservationTable::new(peer(), limits)
    }

    #[test]
    fn lifecycle_rejects_invalid_transitions() {
        let mut reservation = Reservation::new(peer(), peer());
        let now = Instant::now();
        assert!(reservation.activate().is_err());
        reservation.grant(Duration::from_secs(60), now).unwrap();
        reservation.activate().unwrap();
        reservation.renew(Duration::from_secs(60), now).unwrap();
        assert_eq!(reservation.renewals(), 1);
        reservation.expire().unwrap();

        assert!(matches!(
            reservation.renew(Duration::from_secs(60), now),
            Err(RelayError::InvalidTransition {
                from: ReservationState::Expired,
                to: ReservationState::Active
            })
        ));
        assert!(reservation.close().is_err());
    }

    #[test]
    fn reservation_cap_rejects_one_past_the_limit() {
        let table = table(ReservationLimits {
            max_reservations: 3,
            ..ReservationLimits::default()
        });
        let now = Instant::now();
        for _ in 0..3 {
            table.reserve(peer(), now).unwrap();
        }
        assert!(matches!(
            table.reserve(peer(), now),
            Err(RelayError::CapacityExceeded)
        ));
    }

    #[test]
    fn renewal_does_not_take_another_slot() {
        let table = table(ReservationLimits {
            max_reservations: 1,
            ..ReservationLimits::default()
        });
        let holder = peer();
        let now = Instant::now();
        table.reserve(holder, now).unwrap();
        table.reserve(holder, now + Duration::from_secs(10)).unwrap();
        assert_eq!(table.state_of(&holder), Some(ReservationState::Active));
        assert_eq!(table.reservation_count(), 1);
    }

    #[test]
    fn circuits_need_a_reservation_and_respect_limits() {
        let table = table(ReservationLimits {
            max_circuits: 2,
            max_circuits_per_peer: 2,
            ..ReservationLimits::default()
        });
        let holder = peer();
        let now = Instant::now();
        assert!(matches!(
            table.open_circuit(holder, now),
            Err(RelayError::NoReservation)
        ));

        table.reserve(holder, now).unwrap();
        let first = table.open_circuit(holder, now).unwrap();
        let _second = table.open_circuit(holder, now).unwrap();
        assert!(matches!(
            table.open_circuit(holder, now),
            Err(RelayError::CapacityExceeded)
        ));

        drop(first);
        assert_eq!(table.active_circuits(), 1);
        assert!(table.open_circuit(holder, now).is_ok());
    }

    #[tokio::test]
    async fn sweep_expires_and_cancels_circuits() {
        let table = table(ReservationLimits {
            ttl: Duration::from_secs(60),
            ..ReservationLimits::default()
        });
        let holder = peer();
        let now = Instant::now();
        table.reserve(holder, now).unwrap();
        let circuit = table.open_circuit(holder, now).unwrap();

        assert!(table.sweep(now + Duration::from_secs(30)).is_empty());
        assert_eq!(table.sweep(now + Duration::from_secs(61)), vec![holder]);
        circuit.cancelled().await;
        assert_eq!(table.state_of(&holder), None);
        assert!(matches!(
            table.open_circuit(holder, now + Duration::from_secs(61)),
            Err(RelayError::NoReservation)
        ));
    }

    #[test]
    fn released_reservation_frees_its_slot() {
        let table = table(ReservationLimits {
            max_reservations: 1,
            ..ReservationLimits::default()
        });
        let holder = peer();
        let now = Instant::now();
        table.reserve(holder, now).unwrap();
        assert!(table.release(&holder));
        assert!(table.reserve(peer(), now).is_ok());
    }
}
