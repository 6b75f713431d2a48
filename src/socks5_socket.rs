use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, trace};

use crate::{
    auth::Authenticator,
    method_handlers::Connect,
    protocol::{AuthMethod, Command, Reply, Socks5Error, SocksSocketAddr, RESERVED, VERSION},
};

mod connect;

/// One SOCKS5 client connection: method negotiation, the request, then the
/// CONNECT handler. BIND and UDP ASSOCIATE are answered with
/// [`Reply::CommandNotSupported`].
pub struct Socks5Socket<T, A, C> {
    inner: T,
    authenticator: A,
    connect_handler: C,
    handshake_timeout: Option<Duration>,
}

impl<T, Auth, C> Socks5Socket<T, Auth, C>
where
    Self: Unpin + Send,
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    Auth: Authenticator<T>,
    C: Connect<Auth::Credentials>,
{
    pub fn new(inner: T, authenticator: Auth, connect_handler: C) -> Self {
        Self {
            inner,
            authenticator,
            connect_handler,
            handshake_timeout: None,
        }
    }

    /// Bounds negotiation and request parsing. The tunnel itself is not
    /// affected.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    pub async fn run(mut self) -> crate::protocol::Result<()> {
        let request = match self.handshake_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.socks_request()).await {
                Ok(request) => request,
                Err(_) => return Err(io::Error::from(io::ErrorKind::TimedOut).into()),
            },
            None => self.socks_request().await,
        };

        let (command, addr, credentials) = match request {
            Ok(request) => request,
            Err(Socks5Error::Reply(reply)) => {
                debug!(%reply, "rejecting request");
                self.reply(reply, Default::default()).await?;
                return Err(reply.into());
            }
            Err(err) => return Err(err),
        };

        match command {
            Command::Connect => self.connect(addr, credentials).await,
            Command::Bind | Command::UdpAssociate => {
                debug!(?command, "unsupported command");
                self.reply(Reply::CommandNotSupported, Default::default())
                    .await?;
                Err(Reply::CommandNotSupported.into())
            }
        }
    }

    pub async fn socks_request(
        &mut self,
    ) -> crate::protocol::Result<(Command, SocksSocketAddr, Auth::Credentials)> {
        let credentials = self.authenticate().await?;

        let command = self.parse_request().await?;
        let addr = self.parse_addr().await?;
        trace!(?command, %addr, "parsed request");

        Ok((command, addr, credentials))
    }

    async fn authenticate(&mut self) -> io::Result<Auth::Credentials> {
        let methods = self.parse_methods().await?;

        let method = self.authenticator.select_method(&methods);
        self.write_auth_method(method).await?;
        if method == AuthMethod::NoAcceptableMethods {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "no acceptable authentication method",
            ));
        }

        match self.authenticator.authenticate(&mut self.inner, method).await? {
            Some(credentials) => Ok(credentials),
            None => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "authentication failed",
            )),
        }
    }
}

impl<T, Auth, C> Socks5Socket<T, Auth, C>
where
    Self: Unpin + Send,
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub async fn reply(&mut self, reply: Reply, bnd_address: SocksSocketAddr) -> io::Result<()> {
        let mut message = vec![VERSION, reply.to_u8(), RESERVED];
        message.extend_from_slice(&bnd_address.to_bytes());
        self.write_all(&message).await?;
        self.flush().await
    }

    async fn write_auth_method(&mut self, auth_method: AuthMethod) -> io::Result<()> {
        self.write_all(&[VERSION, auth_method.to_u8()]).await?;
        self.flush().await
    }

    async fn parse_methods(&mut self) -> io::Result<Vec<AuthMethod>> {
        let mut header: [u8; 2] = [0; 2];
        self.read_exact(&mut header).await?;
        check_version(header[0])?;

        let mut methods = vec![0; header[1] as usize];
        self.read_exact(&mut methods).await?;
        let methods = methods
            .into_iter()
            .map(AuthMethod::from_u8)
            .collect::<Vec<_>>();

        Ok(methods)
    }

    async fn parse_request(&mut self) -> crate::protocol::Result<Command> {
        let mut request: [u8; 3] = [0; 3];
        self.read_exact(&mut request).await?;
        check_version(request[0])?;
        let command = Command::try_from(request[1])?;
        if request[2] != RESERVED {
            return Err(Reply::GeneralFailure.into());
        }
        Ok(command)
    }

    async fn parse_addr(&mut self) -> crate::protocol::Result<SocksSocketAddr> {
        SocksSocketAddr::read(self).await
    }
}

/// A client speaking another SOCKS version cannot read our replies, so the
/// connection is just closed.
fn check_version(version: u8) -> io::Result<()> {
    if version == VERSION {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported SOCKS version {version}"),
        ))
    }
}

impl<T, Auth, C> AsyncRead for Socks5Socket<T, Auth, C>
where
    Self: Unpin,
    T: AsyncRead + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T, Auth, C> AsyncWrite for Socks5Socket<T, Auth, C>
where
    Self: Unpin,
    T: AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{auth::NoAuthAuthenticator, method_handlers::Connect};
    use tokio::io::DuplexStream;

    /// Answers every CONNECT with the given reply, without a tunnel.
    struct Refuse(Reply);

    impl Connect<()> for Refuse {
        type ServerConnection = ();

        async fn establish_connection(
            &mut self,
            _: SocksSocketAddr,
            _: (),
        ) -> crate::protocol::Result<()> {
            Err(self.0.into())
        }

        async fn start_listening<T>(self, _: T, _: ()) -> crate::protocol::Result<()>
        where
            T: AsyncWrite + AsyncRead + Send + Unpin,
        {
            Ok(())
        }
    }

    fn serve(reply: Reply) -> DuplexStream {
        let (client, server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let socket = Socks5Socket::new(server, NoAuthAuthenticator, Refuse(reply))
                .with_handshake_timeout(Duration::from_secs(1));
            let _ = socket.run().await;
        });
        client
    }

    async fn negotiate(client: &mut DuplexStream) {
        client.write_all(&[VERSION, 1, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [VERSION, 0x00]);
    }

    async fn reply_code(client: &mut DuplexStream) -> u8 {
        let mut head = [0u8; 3];
        client.read_exact(&mut head).await.unwrap();
        head[1]
    }

    #[tokio::test]
    async fn no_acceptable_method() {
        let mut client = serve(Reply::Success);
        client.write_all(&[VERSION, 1, 0x02]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [VERSION, 0xFF]);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn wrong_version_closes() {
        let mut client = serve(Reply::Success);
        client.write_all(&[0x04, 1, 0x00]).await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn bind_is_not_supported() {
        let mut client = serve(Reply::Success);
        negotiate(&mut client).await;
        client
            .write_all(&[VERSION, 0x02, RESERVED, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        assert_eq!(reply_code(&mut client).await, Reply::CommandNotSupported.to_u8());
    }

    #[tokio::test]
    async fn unknown_address_type() {
        let mut client = serve(Reply::Success);
        negotiate(&mut client).await;
        client
            .write_all(&[VERSION, 0x01, RESERVED, 0x05, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        assert_eq!(
            reply_code(&mut client).await,
            Reply::AddressTypeNotSupported.to_u8()
        );
    }

    #[tokio::test]
    async fn reserved_byte_must_be_zero() {
        let mut client = serve(Reply::Success);
        negotiate(&mut client).await;
        client
            .write_all(&[VERSION, 0x01, 0x01, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        assert_eq!(reply_code(&mut client).await, Reply::GeneralFailure.to_u8());
    }

    #[tokio::test]
    async fn handler_failure_is_replied() {
        let mut client = serve(Reply::HostUnreachable);
        negotiate(&mut client).await;
        let mut request = vec![VERSION, 0x01, RESERVED, 0x03, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&request).await.unwrap();
        assert_eq!(reply_code(&mut client).await, Reply::HostUnreachable.to_u8());
    }

    #[tokio::test]
    async fn silent_client_times_out() {
        let mut client = serve(Reply::Success);
        let mut rest = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest));
        assert!(read.await.is_ok());
    }
}
