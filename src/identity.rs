//! Peer identity.
//!
//! Every node owns an Ed25519 key pair. Its [`PeerId`] is the BLAKE3 hash of
//! the public key, so a peer proves its id by signing the handshake transcript
//! with the matching secret key. The secret is persisted as hex in a key file
//! so the id survives restarts.

use std::{
    fmt, fs, io,
    path::Path,
    str::FromStr,
};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use zeroize::{Zeroize, Zeroizing};

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("key file error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),
    #[error("signature verification failed")]
    BadSignature,
}

/// Stable identifier of a peer: BLAKE3(Ed25519 public key).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        PeerId(*blake3::hash(key.as_bytes()).as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First characters of the base58 form, for log lines.
    pub fn short(&self) -> String {
        let full = self.to_string();
        full.chars().take(10).collect()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.0).into_string())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s.trim())
            .into_vec()
            .map_err(|err| IdentityError::InvalidPeerId(err.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidPeerId(format!("{s} is not 32 bytes")))?;
        Ok(PeerId(bytes))
    }
}

/// Ed25519 key pair of the local node.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        let signing_key = SigningKey::from_bytes(&secret);
        secret.zeroize();
        Self { signing_key }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let secret: &[u8; 32] = bytes.try_into().map_err(|_| {
            IdentityError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(secret),
        })
    }

    pub fn from_hex(encoded: &str) -> Result<Self, IdentityError> {
        let bytes = Zeroizing::new(
            hex::decode(encoded.trim()).map_err(|err| IdentityError::InvalidKey(err.to_string()))?,
        );
        Self::from_secret_bytes(&bytes)
    }

    /// Secret key as hex. Wiped from memory on drop.
    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.signing_key.to_bytes()))
    }

    pub fn public(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Loads the key file, or generates and saves a fresh identity when the
    /// file does not exist yet.
    pub fn load_or_generate(path: &Path) -> Result<Self, IdentityError> {
        match fs::read_to_string(path) {
            Ok(contents) => Self::from_hex(&contents),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let keypair = Self::generate();
                keypair.save(path)?;
                info!(peer = %keypair.peer_id(), path = %path.display(), "generated new identity");
                Ok(keypair)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), IdentityError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, self.to_hex().as_bytes())?;
        restrict_permissions(path)?;
        Ok(())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

/// Checks `signature` over `message` and returns the signer's [`PeerId`].
pub fn verify(
    public_key: &[u8; PUBLIC_KEY_LEN],
    message: &[u8],
    signature: &[u8; SIGNATURE_LEN],
) -> Result<PeerId, IdentityError> {
    let key = VerifyingKey::from_bytes(public_key)
        .map_err(|err| IdentityError::InvalidKey(err.to_string()))?;
    let signature = Signature::from_bytes(signature);
    key.verify(message, &signature)
        .map_err(|_| IdentityError::BadSignature)?;
    Ok(PeerId::from_public_key(&key))
}

#[cfg(unix)]
pub(crate) fn restrict_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
pub(crate) fn restrict_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_round_trips_through_base58() {
        let id = Keypair::generate().peer_id();
        let parsed: PeerId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn rejects_short_peer_id() {
        let short = bs58::encode([1u8; 16]).into_string();
        assert!(short.parse::<PeerId>().is_err());
    }

    #[test]
    fn signature_yields_signer_id() {
        let keypair = Keypair::generate();
        let signature = keypair.sign(b"transcript");
        let id = verify(keypair.public().as_bytes(), b"transcript", &signature).unwrap();
        assert_eq!(id, keypair.peer_id());

        assert!(matches!(
            verify(keypair.public().as_bytes(), b"tampered", &signature),
            Err(IdentityError::BadSignature)
        ));
    }

    #[test]
    fn identity_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("identity.key");

        let first = Keypair::load_or_generate(&path).unwrap();
        let second = Keypair::load_or_generate(&path).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
    }
}
