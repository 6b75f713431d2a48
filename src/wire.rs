//! Length-prefixed bincode framing for control messages exchanged on peer
//! streams (identify, peer exchange, relay, dial-back).

use std::io;

use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_MESSAGE_LEN: usize = 64 * 1024;

fn options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_MESSAGE_LEN as u64)
}

pub async fn write_message<W, M>(writer: &mut W, message: &M) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let body = options()
        .serialize(message)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

pub async fn read_message<R, M>(reader: &mut R) -> io::Result<M>
where
    R: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("control message of {len} bytes exceeds {MAX_MESSAGE_LEN}"),
        ));
    }
    let mut body = vec![0; len];
    reader.read_exact(&mut body).await?;
    options()
        .deserialize(&body)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        name: String,
        ports: Vec<u16>,
    }

    #[tokio::test]
    async fn oversized_length_is_rejected_before_allocating() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(MAX_MESSAGE_LEN as u32 + 1).to_be_bytes());
        let err = read_message::<_, Probe>(&mut &wire[..]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn messages_share_one_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let first = Probe { name: "exit".into(), ports: vec![443] };
        let second = Probe { name: "relay".into(), ports: vec![] };
        write_message(&mut a, &first).await.unwrap();
        write_message(&mut a, &second).await.unwrap();

        assert_eq!(read_message::<_, Probe>(&mut b).await.unwrap(), first);
        assert_eq!(read_message::<_, Probe>(&mut b).await.unwrap(), second);
    }
}
