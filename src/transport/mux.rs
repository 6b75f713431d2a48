//! Multiplexer frames carried inside sealed frames.
//!
//! ```text
//! +------+-----------+---------+
//! | kind | stream id | payload |
//! |  1   |   4 (BE)  |   var   |
//! +------+-----------+---------+
//! ```
//!
//! The dialer of a session allocates odd stream ids, the listener even ones.
//! Stream id 0 is reserved for session-level frames.

use bytes::{BufMut, Bytes, BytesMut};

use super::{codec::MAX_PLAINTEXT, TransportError};

pub type StreamId = u32;

pub const SESSION_STREAM: StreamId = 0;
pub const FRAME_HEADER_LEN: usize = 5;
/// Largest data payload in one frame.
pub const MAX_DATA_LEN: usize = 16 * 1024;
const MAX_PROTOCOL_LEN: usize = 256;

const _: () = assert!(FRAME_HEADER_LEN + MAX_DATA_LEN <= MAX_PLAINTEXT);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Opens a stream; the payload is the protocol id.
    Open = 1,
    Data = 2,
    /// The sender will write no more data on this stream.
    Close = 3,
    /// Abortive close of both directions.
    Reset = 4,
    /// Grants the peer more send credit (u32 BE bytes).
    WindowUpdate = 5,
    Ping = 6,
    Pong = 7,
    /// The sender is closing the session.
    GoAway = 8,
}

impl FrameKind {
    fn from_u8(n: u8) -> Option<FrameKind> {
        match n {
            1 => Some(FrameKind::Open),
            2 => Some(FrameKind::Data),
            3 => Some(FrameKind::Close),
            4 => Some(FrameKind::Reset),
            5 => Some(FrameKind::WindowUpdate),
            6 => Some(FrameKind::Ping),
            7 => Some(FrameKind::Pong),
            8 => Some(FrameKind::GoAway),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub stream_id: StreamId,
    pub payload: Bytes,
}

impl Frame {
    fn new(kind: FrameKind, stream_id: StreamId, payload: Bytes) -> Self {
        Self {
            kind,
            stream_id,
            payload,
        }
    }

    pub fn open(stream_id: StreamId, protocol: &str) -> Self {
        Self::new(
            FrameKind::Open,
            stream_id,
            Bytes::copy_from_slice(protocol.as_bytes()),
        )
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(FrameKind::Data, stream_id, payload)
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self::new(FrameKind::Close, stream_id, Bytes::new())
    }

    pub fn reset(stream_id: StreamId) -> Self {
        Self::new(FrameKind::Reset, stream_id, Bytes::new())
    }

    pub fn window_update(stream_id: StreamId, increment: u32) -> Self {
        Self::new(
            FrameKind::WindowUpdate,
            stream_id,
            Bytes::copy_from_slice(&increment.to_be_bytes()),
        )
    }

    pub fn ping(nonce: u64) -> Self {
        Self::new(
            FrameKind::Ping,
            SESSION_STREAM,
            Bytes::copy_from_slice(&nonce.to_be_bytes()),
        )
    }

    pub fn pong(nonce: u64) -> Self {
        Self::new(
            FrameKind::Pong,
            SESSION_STREAM,
            Bytes::copy_from_slice(&nonce.to_be_bytes()),
        )
    }

    pub fn go_away() -> Self {
        Self::new(FrameKind::GoAway, SESSION_STREAM, Bytes::new())
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        buf.put_u8(self.kind as u8);
        buf.put_u32(self.stream_id);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Result<Frame, TransportError> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(TransportError::protocol("truncated mux frame"));
        }
        let kind = FrameKind::from_u8(bytes[0])
            .ok_or_else(|| TransportError::protocol(format!("unknown frame kind {}", bytes[0])))?;
        let stream_id = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        let payload = bytes.split_off(FRAME_HEADER_LEN);

        let frame = Frame::new(kind, stream_id, payload);
        frame.validate()?;
        Ok(frame)
    }

    fn validate(&self) -> Result<(), TransportError> {
        let session_level = matches!(
            self.kind,
            FrameKind::Ping | FrameKind::Pong | FrameKind::GoAway
        );
        if session_level != (self.stream_id == SESSION_STREAM) {
            return Err(TransportError::protocol(format!(
                "{:?} frame on stream {}",
                self.kind, self.stream_id
            )));
        }
        let payload_ok = match self.kind {
            FrameKind::Open => (1..=MAX_PROTOCOL_LEN).contains(&self.payload.len()),
            FrameKind::Data => self.payload.len() <= MAX_DATA_LEN,
            FrameKind::WindowUpdate => self.payload.len() == 4,
            FrameKind::Ping | FrameKind::Pong => self.payload.len() == 8,
            FrameKind::Close | FrameKind::Reset | FrameKind::GoAway => self.payload.is_empty(),
        };
        if !payload_ok {
            return Err(TransportError::protocol(format!(
                "{:?} frame with {} byte payload",
                self.kind,
                self.payload.len()
            )));
        }
        Ok(())
    }

    pub fn protocol(&self) -> Result<&str, TransportError> {
        std::str::from_utf8(&self.payload)
            .map_err(|_| TransportError::protocol("protocol id is not utf-8"))
    }

    /// Window increment of a validated `WindowUpdate` frame.
    pub fn increment(&self) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.payload[..4]);
        u32::from_be_bytes(bytes)
    }

    /// Nonce of a validated `Ping` or `Pong` frame.
    pub fn nonce(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.payload[..8]);
        u64::from_be_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let encoded = Frame::window_update(7, 65_536).encode();
        assert_eq!(&encoded[..], &[5, 0, 0, 0, 7, 0, 1, 0, 0]);

        let decoded = Frame::decode(encoded).unwrap();
        assert_eq!(decoded.kind, FrameKind::WindowUpdate);
        assert_eq!(decoded.increment(), 65_536);
    }

    #[test]
    fn open_carries_protocol_id() {
        let frame = Frame::decode(Frame::open(3, "/bethrou/connect/1.0.0").encode()).unwrap();
        assert_eq!(frame.stream_id, 3);
        assert_eq!(frame.protocol().unwrap(), "/bethrou/connect/1.0.0");
    }

    #[test]
    fn rejects_unknown_kind_and_short_frames() {
        assert!(Frame::decode(Bytes::from_static(&[9, 0, 0, 0, 1])).is_err());
        assert!(Frame::decode(Bytes::from_static(&[2, 0, 0])).is_err());
    }

    #[test]
    fn rejects_frames_on_the_wrong_stream() {
        let ping_on_stream = Bytes::from_static(&[6, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1]);
        assert!(Frame::decode(ping_on_stream).is_err());
        let data_on_session = Frame::data(SESSION_STREAM, Bytes::from_static(b"x")).encode();
        assert!(Frame::decode(data_on_session).is_err());
    }

    #[test]
    fn rejects_oversized_data() {
        let frame = Frame::data(1, Bytes::from(vec![0u8; MAX_DATA_LEN + 1]));
        assert!(Frame::decode(frame.encode()).is_err());
    }
}
