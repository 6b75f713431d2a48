//! Sealed framing: `len: u32 BE | ChaCha20-Poly1305(ciphertext || tag)`.
//!
//! Each direction has its own key and a 64-bit counter nonce, so frames cannot
//! be replayed, reordered or dropped without the next open failing.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use tokio_util::codec::{Decoder, Encoder};

use super::TransportError;

/// Largest plaintext carried by one sealed frame.
pub const MAX_PLAINTEXT: usize = 32 * 1024;
pub const TAG_LEN: usize = 16;
const LEN_PREFIX: usize = 4;

/// One direction of a sealed channel.
pub struct CipherState {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl CipherState {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }

    fn next_nonce(&mut self) -> Result<[u8; 12], TransportError> {
        if self.counter == u64::MAX {
            return Err(TransportError::protocol("nonce space exhausted"));
        }
        let mut nonce = [0u8; 12];
        nonce[4..].copy_from_slice(&self.counter.to_le_bytes());
        self.counter += 1;
        Ok(nonce)
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, TransportError> {
        let nonce = self.next_nonce()?;
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| TransportError::protocol("encryption failed"))
    }

    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, TransportError> {
        let nonce = self.next_nonce()?;
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| TransportError::Decrypt)
    }
}

pub struct SealedCodec {
    send: CipherState,
    recv: CipherState,
}

impl SealedCodec {
    pub fn new(send_key: &[u8; 32], recv_key: &[u8; 32]) -> Self {
        Self {
            send: CipherState::new(send_key),
            recv: CipherState::new(recv_key),
        }
    }
}

impl Decoder for SealedCodec {
    type Item = Bytes;
    type Error = TransportError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, TransportError> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }
        let mut len_bytes = [0u8; LEN_PREFIX];
        len_bytes.copy_from_slice(&src[..LEN_PREFIX]);
        let len = u32::from_be_bytes(len_bytes) as usize;

        if !(TAG_LEN..=MAX_PLAINTEXT + TAG_LEN).contains(&len) {
            return Err(TransportError::protocol(format!(
                "sealed frame of {len} bytes out of bounds"
            )));
        }
        if src.len() < LEN_PREFIX + len {
            src.reserve(LEN_PREFIX + len - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX);
        let sealed = src.split_to(len);
        let plaintext = self.recv.open(&sealed)?;
        Ok(Some(Bytes::from(plaintext)))
    }
}

impl Encoder<Bytes> for SealedCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), TransportError> {
        if item.len() > MAX_PLAINTEXT {
            return Err(TransportError::protocol(format!(
                "plaintext of {} bytes exceeds {MAX_PLAINTEXT}",
                item.len()
            )));
        }
        let sealed = self.send.seal(&item)?;
        dst.reserve(LEN_PREFIX + sealed.len());
        dst.put_u32(sealed.len() as u32);
        dst.extend_from_slice(&sealed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (SealedCodec, SealedCodec) {
        let a_to_b = [7u8; 32];
        let b_to_a = [9u8; 32];
        (
            SealedCodec::new(&a_to_b, &b_to_a),
            SealedCodec::new(&b_to_a, &a_to_b),
        )
    }

    #[test]
    fn frames_arrive_in_order() {
        let (mut a, mut b) = pair();
        let mut wire = BytesMut::new();
        a.encode(Bytes::from_static(b"first"), &mut wire).unwrap();
        a.encode(Bytes::from_static(b"second"), &mut wire).unwrap();

        assert_eq!(b.decode(&mut wire).unwrap().unwrap(), "first");
        assert_eq!(b.decode(&mut wire).unwrap().unwrap(), "second");
        assert!(b.decode(&mut wire).unwrap().is_none());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let (mut a, mut b) = pair();
        let mut full = BytesMut::new();
        a.encode(Bytes::from_static(b"payload"), &mut full).unwrap();

        let mut partial = full.split_to(full.len() - 3);
        assert!(b.decode(&mut partial).unwrap().is_none());
        partial.unsplit(full);
        assert_eq!(b.decode(&mut partial).unwrap().unwrap(), "payload");
    }

    #[test]
    fn tampered_frame_fails_authentication() {
        let (mut a, mut b) = pair();
        let mut wire = BytesMut::new();
        a.encode(Bytes::from_static(b"payload"), &mut wire).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;

        assert!(matches!(b.decode(&mut wire), Err(TransportError::Decrypt)));
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let (mut a, _) = pair();
        let mut stranger = SealedCodec::new(&[1u8; 32], &[2u8; 32]);
        let mut wire = BytesMut::new();
        a.encode(Bytes::from_static(b"hello"), &mut wire).unwrap();

        assert!(matches!(stranger.decode(&mut wire), Err(TransportError::Decrypt)));
    }

    #[test]
    fn oversized_length_is_rejected() {
        let (_, mut b) = pair();
        let mut wire = BytesMut::new();
        wire.put_u32((MAX_PLAINTEXT + TAG_LEN + 1) as u32);
        assert!(matches!(b.decode(&mut wire), Err(TransportError::Protocol(_))));
    }
}
