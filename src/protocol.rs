//! SOCKS5 wire types (RFC 1928 subset).
//!
//! The same `ATYP | ADDR | PORT` encoding is reused on the peer network: a
//! `/bethrou/connect/1.0.0` stream starts with a [`SocksSocketAddr`] and the
//! exit answers with a [`Reply`] code followed by its bound address.

mod addr;
mod command;
mod methods;
mod reply;

use std::io;

use thiserror::Error;

pub use addr::Addr;
pub use addr::AddressType;
pub use addr::SocksSocketAddr;
pub use command::Command;
pub use methods::AuthMethod;
pub use reply::Reply;

pub const VERSION: u8 = 0x05;
pub const RESERVED: u8 = 0x00;

pub type Result<T> = std::result::Result<T, Socks5Error>;

#[derive(Error, Debug)]
pub enum Socks5Error {
    #[error("socks error: {0}")]
    Reply(#[from] Reply),
    #[error("error in network operation")]
    Io(#[from] io::Error),
}

impl From<Socks5Error> for Reply {
    fn from(value: Socks5Error) -> Self {
        match value {
            Socks5Error::Reply(r) => r,
            Socks5Error::Io(io) => io.kind().into(),
        }
    }
}
