use std::io;

use thiserror::Error;

/// The `REP` field of a SOCKS5 reply. Exits send the same codes back over
/// connect streams.
#[repr(u8)]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    #[error("succeeded")]
    Success = 0x00,
    #[error("general failure")]
    GeneralFailure = 0x01,
    #[error("connection not allowed by ruleset")]
    ConnectionNotAllowedByRuleset = 0x02,
    #[error("network unreachable")]
    NetworkUnreachable = 0x03,
    #[error("host unreachable")]
    HostUnreachable = 0x04,
    #[error("connection refused")]
    ConnectionRefused = 0x05,
    #[error("TTL expired")]
    TtlExpired = 0x06,
    #[error("command not supported")]
    CommandNotSupported = 0x07,
    #[error("address type not supported")]
    AddressTypeNotSupported = 0x08,
}

const ALL: [Reply; 9] = [
    Reply::Success,
    Reply::GeneralFailure,
    Reply::ConnectionNotAllowedByRuleset,
    Reply::NetworkUnreachable,
    Reply::HostUnreachable,
    Reply::ConnectionRefused,
    Reply::TtlExpired,
    Reply::CommandNotSupported,
    Reply::AddressTypeNotSupported,
];

impl Reply {
    pub fn from_u8(code: u8) -> Option<Self> {
        ALL.get(code as usize).copied()
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn is_success(self) -> bool {
        self == Reply::Success
    }
}

/// Closest reply for a failed connect or read. Timeouts become
/// [`Reply::TtlExpired`]; anything without an obvious code is a general
/// failure.
impl From<io::ErrorKind> for Reply {
    fn from(kind: io::ErrorKind) -> Self {
        use io::ErrorKind::*;
        match kind {
            ConnectionRefused => Reply::ConnectionRefused,
            TimedOut => Reply::TtlExpired,
            PermissionDenied => Reply::ConnectionNotAllowedByRuleset,
            NotConnected => Reply::NetworkUnreachable,
            AddrNotAvailable => Reply::AddressTypeNotSupported,
            Unsupported => Reply::CommandNotSupported,
            NotFound | InvalidInput | InvalidData | UnexpectedEof => Reply::HostUnreachable,
            _ => Reply::GeneralFailure,
        }
    }
}
