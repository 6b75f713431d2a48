//! Connection upgrade.
//!
//! ```text
//! -> hello      "BTHR" | version | x25519 ephemeral (32)
//! <- hello      "BTHR" | version | x25519 ephemeral (32)
//!    keys       blake3 keyed by the membrane, over dh | initiator eph | responder eph
//! -> sealed     ed25519 public key (32) | signature (64)
//! <- sealed     ed25519 public key (32) | signature (64)
//! ```
//!
//! The signature covers the transcript hash and the signer's role. A peer on
//! a different membrane derives different keys, so its first sealed message
//! fails authentication and the upgrade ends with
//! [`TransportError::MembershipMismatch`].

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rand::rngs::OsRng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Framed;
use tracing::trace;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

use super::{codec::SealedCodec, TransportError};
use crate::{
    identity::{self, Keypair, PeerId, PUBLIC_KEY_LEN, SIGNATURE_LEN},
    membrane::{self, PreSharedKey},
};

const MAGIC: &[u8; 4] = b"BTHR";
const VERSION: u8 = 1;
const HELLO_LEN: usize = MAGIC.len() + 1 + 32;
const AUTH_LEN: usize = PUBLIC_KEY_LEN + SIGNATURE_LEN;
const SIGNATURE_DOMAIN: &[u8] = b"bethrou handshake signature v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    fn tag(self) -> u8 {
        match self {
            Role::Initiator => 0x01,
            Role::Responder => 0x02,
        }
    }

    fn peer(self) -> Role {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

/// An authenticated, sealed connection.
pub struct Upgraded<T> {
    pub framed: Framed<T, SealedCodec>,
    pub remote: PeerId,
    pub role: Role,
}

struct KeySchedule {
    initiator_to_responder: Zeroizing<[u8; 32]>,
    responder_to_initiator: Zeroizing<[u8; 32]>,
    transcript: [u8; 32],
}

impl KeySchedule {
    fn derive(
        handshake_key: &[u8; 32],
        shared: &[u8; 32],
        initiator_eph: &[u8; 32],
        responder_eph: &[u8; 32],
    ) -> Self {
        let chaining = Zeroizing::new(
            *blake3::Hasher::new_keyed(handshake_key)
                .update(b"chaining")
                .update(shared)
                .update(initiator_eph)
                .update(responder_eph)
                .finalize()
                .as_bytes(),
        );
        let transcript = *blake3::Hasher::new_keyed(handshake_key)
            .update(b"transcript")
            .update(initiator_eph)
            .update(responder_eph)
            .finalize()
            .as_bytes();

        Self {
            initiator_to_responder: Zeroizing::new(
                *blake3::keyed_hash(&chaining, b"initiator->responder").as_bytes(),
            ),
            responder_to_initiator: Zeroizing::new(
                *blake3::keyed_hash(&chaining, b"responder->initiator").as_bytes(),
            ),
            transcript,
        }
    }
}

fn signed_message(role: Role, transcript: &[u8; 32]) -> Vec<u8> {
    let mut message = Vec::with_capacity(SIGNATURE_DOMAIN.len() + 1 + transcript.len());
    message.extend_from_slice(SIGNATURE_DOMAIN);
    message.push(role.tag());
    message.extend_from_slice(transcript);
    message
}

/// Runs the handshake over `io` and returns the sealed connection with the
/// proven remote [`PeerId`]. When `expected` is set, any other remote id is
/// rejected.
pub async fn upgrade<T>(
    mut io: T,
    role: Role,
    identity: &Keypair,
    psk: Option<&PreSharedKey>,
    expected: Option<PeerId>,
) -> Result<Upgraded<T>, TransportError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let local_eph = PublicKey::from(&secret);

    let mut hello = [0u8; HELLO_LEN];
    hello[..MAGIC.len()].copy_from_slice(MAGIC);
    hello[MAGIC.len()] = VERSION;
    hello[MAGIC.len() + 1..].copy_from_slice(local_eph.as_bytes());
    io.write_all(&hello).await?;
    io.flush().await?;

    let mut remote_hello = [0u8; HELLO_LEN];
    io.read_exact(&mut remote_hello).await?;
    if &remote_hello[..MAGIC.len()] != MAGIC {
        return Err(TransportError::Handshake("remote is not a bethrou peer".into()));
    }
    if remote_hello[MAGIC.len()] != VERSION {
        return Err(TransportError::Handshake(format!(
            "unsupported handshake version {}",
            remote_hello[MAGIC.len()]
        )));
    }
    let mut remote_eph_bytes = [0u8; 32];
    remote_eph_bytes.copy_from_slice(&remote_hello[MAGIC.len() + 1..]);
    let remote_eph = PublicKey::from(remote_eph_bytes);

    let shared = secret.diffie_hellman(&remote_eph);
    if !shared.was_contributory() {
        return Err(TransportError::Handshake("low order ephemeral key".into()));
    }

    let (initiator_eph, responder_eph) = match role {
        Role::Initiator => (local_eph, remote_eph),
        Role::Responder => (remote_eph, local_eph),
    };
    let schedule = KeySchedule::derive(
        &membrane::handshake_key(psk),
        shared.as_bytes(),
        initiator_eph.as_bytes(),
        responder_eph.as_bytes(),
    );
    let codec = match role {
        Role::Initiator => SealedCodec::new(
            &schedule.initiator_to_responder,
            &schedule.responder_to_initiator,
        ),
        Role::Responder => SealedCodec::new(
            &schedule.responder_to_initiator,
            &schedule.initiator_to_responder,
        ),
    };
    let mut framed = Framed::new(io, codec);

    let mut proof = Vec::with_capacity(AUTH_LEN);
    proof.extend_from_slice(identity.public().as_bytes());
    proof.extend_from_slice(&identity.sign(&signed_message(role, &schedule.transcript)));
    framed.send(Bytes::from(proof)).await?;

    let remote_proof = match framed.next().await {
        Some(Ok(proof)) => proof,
        Some(Err(TransportError::Decrypt)) => return Err(TransportError::MembershipMismatch),
        Some(Err(err)) => return Err(err),
        None => {
            return Err(TransportError::Handshake(
                "connection closed during handshake".into(),
            ))
        }
    };
    if remote_proof.len() != AUTH_LEN {
        return Err(TransportError::Handshake(format!(
            "identity proof of {} bytes",
            remote_proof.len()
        )));
    }
    let mut public_key = [0u8; PUBLIC_KEY_LEN];
    public_key.copy_from_slice(&remote_proof[..PUBLIC_KEY_LEN]);
    let mut signature = [0u8; SIGNATURE_LEN];
    signature.copy_from_slice(&remote_proof[PUBLIC_KEY_LEN..]);

    let remote = identity::verify(
        &public_key,
        &signed_message(role.peer(), &schedule.transcript),
        &signature,
    )
    .map_err(|err| TransportError::Handshake(format!("identity proof rejected: {err}")))?;

    if remote == identity.peer_id() {
        return Err(TransportError::Handshake("connected to self".into()));
    }
    if let Some(expected) = expected {
        if expected != remote {
            return Err(TransportError::PeerIdMismatch {
                expected,
                actual: remote,
            });
        }
    }

    trace!(peer = %remote, ?role, "handshake complete");
    Ok(Upgraded {
        framed,
        remote,
        role,
    })
}
