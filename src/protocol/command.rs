use super::Reply;

/// The `CMD` byte of a SOCKS5 request. Only [`Command::Connect`] is served;
/// the others are parsed so they can be refused with the right reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

impl TryFrom<u8> for Command {
    type Error = Reply;

    fn try_from(byte: u8) -> Result<Self, Reply> {
        Ok(match byte {
            0x01 => Command::Connect,
            0x02 => Command::Bind,
            0x03 => Command::UdpAssociate,
            _ => return Err(Reply::CommandNotSupported),
        })
    }
}
