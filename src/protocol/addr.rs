use std::{
    fmt,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
};

use tokio::io::{AsyncRead, AsyncReadExt};

use super::{Reply, Socks5Error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    Ipv4 = 0x01,
    DomainName = 0x03,
    Ipv6 = 0x04,
}

impl AddressType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(AddressType::Ipv4),
            0x03 => Some(AddressType::DomainName),
            0x04 => Some(AddressType::Ipv6),
            _ => None,
        }
    }

    pub fn to_u8(&self) -> u8 {
        *self as u8
    }
}

/// A SOCKS5 destination or bound address: `ATYP | ADDR | PORT`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SocksSocketAddr {
    pub port: u16,
    pub addr: Addr,
}

impl SocksSocketAddr {
    pub fn new(addr: Addr, port: u16) -> Self {
        Self { port, addr }
    }

    /// Turns `Self` into: AddrType+ADDR+PORT
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(18);

        bytes.push(self.addr.addr_type().to_u8());

        match &self.addr {
            Addr::Ipv4(addr) => bytes.extend_from_slice(&addr.octets()[..]),
            Addr::Ipv6(addr) => bytes.extend_from_slice(&addr.octets()[..]),
            Addr::Domain(domain) => {
                let len = domain.len().min(u8::MAX as usize);
                bytes.push(len as u8);
                bytes.extend_from_slice(&domain.as_bytes()[..len]);
            }
        }
        bytes.extend_from_slice(&self.port.to_be_bytes());

        bytes
    }

    /// Reads AddrType+ADDR+PORT.
    ///
    /// An unknown address type yields [`Reply::AddressTypeNotSupported`], an
    /// empty or non UTF-8 domain yields [`Reply::GeneralFailure`].
    pub async fn read<R>(reader: &mut R) -> super::Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = reader.read_u8().await?;
        let addr_type =
            AddressType::from_u8(atyp).ok_or(Socks5Error::Reply(Reply::AddressTypeNotSupported))?;

        let addr = match addr_type {
            AddressType::Ipv4 => {
                let mut octets = [0; 4];
                reader.read_exact(&mut octets).await?;
                Addr::Ipv4(Ipv4Addr::from(octets))
            }
            AddressType::Ipv6 => {
                let mut octets = [0; 16];
                reader.read_exact(&mut octets).await?;
                Addr::Ipv6(Ipv6Addr::from(octets))
            }
            AddressType::DomainName => {
                let len = reader.read_u8().await?;
                if len == 0 {
                    return Err(Reply::GeneralFailure.into());
                }
                let mut domain = vec![0; len as usize];
                reader.read_exact(&mut domain).await?;
                let domain = String::from_utf8(domain)
                    .map_err(|_| Socks5Error::Reply(Reply::GeneralFailure))?;
                Addr::Domain(domain)
            }
        };

        let port = reader.read_u16().await?;
        Ok(SocksSocketAddr { port, addr })
    }

    /// `host:port` form accepted by `tokio::net::lookup_host`.
    pub fn host_port(&self) -> String {
        self.to_string()
    }
}

impl Default for SocksSocketAddr {
    fn default() -> Self {
        SocksSocketAddr {
            port: 0,
            addr: Addr::Ipv4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

impl From<SocketAddr> for SocksSocketAddr {
    fn from(value: SocketAddr) -> Self {
        match value {
            SocketAddr::V4(ipv4) => SocksSocketAddr {
                port: ipv4.port(),
                addr: Addr::Ipv4(*ipv4.ip()),
            },
            SocketAddr::V6(ipv6) => SocksSocketAddr {
                port: ipv6.port(),
                addr: Addr::Ipv6(*ipv6.ip()),
            },
        }
    }
}

impl fmt::Display for SocksSocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.addr {
            Addr::Ipv6(ip) => write!(f, "[{}]:{}", ip, self.port),
            addr => write!(f, "{}:{}", addr, self.port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Addr {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

impl Addr {
    pub fn addr_type(&self) -> AddressType {
        match self {
            Addr::Ipv4(_) => AddressType::Ipv4,
            Addr::Ipv6(_) => AddressType::Ipv6,
            Addr::Domain(_) => AddressType::DomainName,
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Addr::Ipv4(ip) => write!(f, "{}", ip),
            Addr::Ipv6(ip) => write!(f, "{}", ip),
            Addr::Domain(domain) => write!(f, "{}", domain),
        }
    }
}
