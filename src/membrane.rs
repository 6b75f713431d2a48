//! Private network membrane.
//!
//! Overlay membership is gated by a 32-byte pre-shared key. The key never
//! travels on the wire: the handshake keys every session secret with
//! [`PreSharedKey::handshake_key`], so a peer holding a different key derives
//! different traffic keys and cannot open the first sealed message.
//!
//! Key files use the libp2p `swarm.key` layout:
//!
//! ```text
//! /key/swarm/psk/1.0.0/
//! /base16/
//! <64 hex characters>
//! ```
//!
//! A file holding only the 64 hex characters is accepted as well.

use std::{fmt, fs, path::Path};

use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::identity::restrict_permissions;

pub const PSK_LEN: usize = 32;

const SWARM_KEY_HEADER: &str = "/key/swarm/psk/1.0.0/";
const BASE16_CODEC: &str = "/base16/";

const HANDSHAKE_CONTEXT: &str = "bethrou 2024 private network handshake v1";
const PUBLIC_NETWORK_CONTEXT: &str = "bethrou 2024 public network handshake v1";
const FINGERPRINT_CONTEXT: &str = "bethrou 2024 network key fingerprint v1";

#[derive(Error, Debug)]
pub enum MembraneError {
    #[error("network key file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed network key: {0}")]
    Malformed(String),
}

/// The network membership token.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct PreSharedKey([u8; PSK_LEN]);

impl PreSharedKey {
    pub fn new(bytes: [u8; PSK_LEN]) -> Self {
        PreSharedKey(bytes)
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; PSK_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        PreSharedKey(bytes)
    }

    /// Parses the `swarm.key` layout or a bare hex key.
    pub fn parse(contents: &str) -> Result<Self, MembraneError> {
        let lines: Vec<&str> = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();

        let encoded = match lines.as_slice() {
            [key] => *key,
            [header, codec, key] if *header == SWARM_KEY_HEADER => {
                if *codec != BASE16_CODEC {
                    return Err(MembraneError::Malformed(format!(
                        "unsupported key encoding {codec}"
                    )));
                }
                *key
            }
            [header, ..] if *header != SWARM_KEY_HEADER => {
                return Err(MembraneError::Malformed(format!(
                    "unexpected header {header}"
                )))
            }
            _ => {
                return Err(MembraneError::Malformed(
                    "expected header, codec and key lines".into(),
                ))
            }
        };

        let decoded = Zeroizing::new(
            hex::decode(encoded).map_err(|err| MembraneError::Malformed(err.to_string()))?,
        );
        let bytes: [u8; PSK_LEN] = decoded.as_slice().try_into().map_err(|_| {
            MembraneError::Malformed(format!("expected {PSK_LEN} bytes, got {}", decoded.len()))
        })?;
        Ok(PreSharedKey(bytes))
    }

    pub fn load(path: &Path) -> Result<Self, MembraneError> {
        let contents = Zeroizing::new(fs::read_to_string(path)?);
        Self::parse(&contents)
    }

    /// Renders the key in the `swarm.key` layout.
    pub fn to_swarm_key(&self) -> Zeroizing<String> {
        Zeroizing::new(format!(
            "{SWARM_KEY_HEADER}\n{BASE16_CODEC}\n{}\n",
            hex::encode(self.0)
        ))
    }

    pub fn save(&self, path: &Path) -> Result<(), MembraneError> {
        fs::write(path, self.to_swarm_key().as_bytes())?;
        restrict_permissions(path)?;
        Ok(())
    }

    /// Key that seeds every session key schedule on this network.
    pub fn handshake_key(&self) -> [u8; 32] {
        blake3::derive_key(HANDSHAKE_CONTEXT, &self.0)
    }

    /// Non-secret identifier that is safe to log.
    pub fn fingerprint(&self) -> String {
        let digest = blake3::derive_key(FINGERPRINT_CONTEXT, &self.0);
        hex::encode(&digest[..8])
    }
}

impl fmt::Debug for PreSharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PreSharedKey({})", self.fingerprint())
    }
}

/// Handshake key for an optional membrane. Nodes without a network key share
/// a well-known key and can only talk to other open nodes.
pub fn handshake_key(psk: Option<&PreSharedKey>) -> [u8; 32] {
    match psk {
        Some(psk) => psk.handshake_key(),
        None => blake3::derive_key(PUBLIC_NETWORK_CONTEXT, &[]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_swarm_key_layout() {
        let psk = PreSharedKey::generate();
        let parsed = PreSharedKey::parse(&psk.to_swarm_key()).unwrap();
        assert_eq!(parsed, psk);
    }

    #[test]
    fn parses_bare_hex() {
        let parsed = PreSharedKey::parse(&format!("{}\n", "ab".repeat(32))).unwrap();
        assert_eq!(parsed, PreSharedKey::new([0xab; 32]));
    }

    #[test]
    fn rejects_other_codecs_and_lengths() {
        let base64 = format!("{SWARM_KEY_HEADER}\n/base64/\n{}", "ab".repeat(32));
        assert!(PreSharedKey::parse(&base64).is_err());
        assert!(PreSharedKey::parse(&"ab".repeat(16)).is_err());
        assert!(PreSharedKey::parse("/key/other/\n/base16/\nabcd").is_err());
    }

    #[test]
    fn different_keys_seed_different_handshakes() {
        let a = PreSharedKey::new([1; 32]);
        let b = PreSharedKey::new([2; 32]);
        assert_ne!(a.handshake_key(), b.handshake_key());
        assert_ne!(handshake_key(Some(&a)), handshake_key(None));
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
