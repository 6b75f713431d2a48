//! Exit service.
//!
//! An exit accepts [`CONNECT_PROTOCOL`] streams. Each stream opens with the
//! destination in SOCKS5 form (`ATYP | ADDR | PORT`); the exit checks it
//! against its [`DestinationPolicy`], resolves and connects within the
//! connect timeout, answers `REP | ATYP | BND.ADDR | BND.PORT` and splices the
//! stream with the destination socket.

pub mod policy;

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::Semaphore,
};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    config::ExitConfig,
    node::Node,
    protocol::{Reply, Socks5Error, SocksSocketAddr},
    splice::{splice, SpliceSummary},
};
use policy::{DestinationPolicy, Verdict};

pub const CONNECT_PROTOCOL: &str = "/bethrou/connect/1.0.0";

#[derive(Error, Debug)]
pub enum ExitError {
    #[error("destination denied by policy")]
    Denied,
    #[error("could not resolve {0}")]
    Resolve(String),
    #[error("connect to {target} failed: {source}")]
    Connect { target: String, source: io::Error },
    #[error("destination connect timed out")]
    Timeout,
    #[error("exit is at capacity")]
    CapacityExceeded,
    #[error("exit refused: {0}")]
    Refused(Reply),
    #[error("bad connect request: {0}")]
    Socks(#[from] Socks5Error),
    #[error("exit io: {0}")]
    Io(#[from] io::Error),
}

impl ExitError {
    /// Reply code sent back over the stream for this failure.
    pub fn reply(&self) -> Reply {
        match self {
            ExitError::Denied => Reply::ConnectionNotAllowedByRuleset,
            ExitError::Resolve(_) => Reply::HostUnreachable,
            ExitError::Connect { source, .. } => source.kind().into(),
            ExitError::Timeout => io::ErrorKind::TimedOut.into(),
            ExitError::CapacityExceeded => Reply::GeneralFailure,
            ExitError::Refused(reply) => *reply,
            ExitError::Socks(Socks5Error::Reply(reply)) => *reply,
            ExitError::Socks(Socks5Error::Io(err)) | ExitError::Io(err) => err.kind().into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExitSettings {
    pub connect_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_streams: usize,
}

impl Default for ExitSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(300)),
            max_streams: 1024,
        }
    }
}

impl From<&ExitConfig> for ExitSettings {
    fn from(config: &ExitConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            idle_timeout: config.idle_timeout(),
            max_streams: config.max_streams,
        }
    }
}

#[derive(Clone)]
pub struct ExitService {
    permits: Arc<Semaphore>,
    max_streams: usize,
}

impl ExitService {
    /// Announces the exit role and serves connect streams until the node
    /// shuts down.
    pub fn start(
        node: Node,
        policy: Arc<dyn DestinationPolicy>,
        settings: ExitSettings,
    ) -> ExitService {
        let service = ExitService {
            permits: Arc::new(Semaphore::new(settings.max_streams.max(1))),
            max_streams: settings.max_streams.max(1),
        };
        node.set_roles(|roles| roles.exit = true);
        tokio::spawn(service.clone().serve(node, policy, Arc::new(settings)));
        info!(max_streams = service.max_streams, "exit service started");
        service
    }

    pub fn active_streams(&self) -> usize {
        self.max_streams - self.permits.available_permits()
    }

    async fn serve(
        self,
        node: Node,
        policy: Arc<dyn DestinationPolicy>,
        settings: Arc<ExitSettings>,
    ) {
        let mut incoming = node.accept(CONNECT_PROTOCOL);
        let shutdown = node.shutdown_token();
        loop {
            let mut stream = tokio::select! {
                _ = shutdown.cancelled() => break,
                stream = incoming.recv() => match stream {
                    Some(stream) => stream,
                    None => break,
                },
            };
            let span = info_span!(
                "exit",
                peer = %stream.remote_peer().short(),
                stream = stream.id()
            );
            let permit = match self.permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!(parent: &span, "exit stream limit reached");
                    tokio::spawn(async move {
                        let unbound = SocksSocketAddr::default();
                        let _ = write_reply(&mut stream, Reply::GeneralFailure, &unbound).await;
                        let _ = stream.shutdown().await;
                    });
                    continue;
                }
            };
            let policy = policy.clone();
            let settings = settings.clone();
            tokio::spawn(
                async move {
                    let _permit = permit;
                    match handle_connect(stream, policy.as_ref(), &settings).await {
                        Ok(summary) => debug!(
                            upstream = summary.a_to_b,
                            downstream = summary.b_to_a,
                            "exit stream closed"
                        ),
                        Err(err) => debug!(%err, "exit stream failed"),
                    }
                }
                .instrument(span),
            );
        }
    }
}

async fn write_reply<S>(stream: &mut S, reply: Reply, bound: &SocksSocketAddr) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut message = Vec::with_capacity(20);
    message.push(reply.to_u8());
    message.extend_from_slice(&bound.to_bytes());
    stream.write_all(&message).await?;
    stream.flush().await
}

/// Serves one connect stream: reads the destination, connects and splices.
pub async fn handle_connect<S>(
    mut stream: S,
    policy: &dyn DestinationPolicy,
    settings: &ExitSettings,
) -> Result<SpliceSummary, ExitError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = SocksSocketAddr::read(&mut stream);
    let target = match tokio::time::timeout(settings.connect_timeout, request).await {
        Ok(Ok(target)) => target,
        Ok(Err(Socks5Error::Reply(reply))) => {
            write_reply(&mut stream, reply, &SocksSocketAddr::default()).await?;
            return Err(Socks5Error::Reply(reply).into());
        }
        Ok(Err(err)) => return Err(err.into()),
        Err(_) => return Err(ExitError::Timeout),
    };

    let server = match connect_target(&target, policy, settings.connect_timeout).await {
        Ok(server) => server,
        Err(err) => {
            debug!(%target, %err, "destination connect failed");
            write_reply(&mut stream, err.reply(), &SocksSocketAddr::default()).await?;
            return Err(err);
        }
    };
    let bound = server
        .local_addr()
        .map(SocksSocketAddr::from)
        .unwrap_or_default();
    write_reply(&mut stream, Reply::Success, &bound).await?;
    info!(%target, "exit connected");

    Ok(splice(stream, server, settings.idle_timeout).await?)
}

async fn connect_target(
    target: &SocksSocketAddr,
    policy: &dyn DestinationPolicy,
    connect_timeout: Duration,
) -> Result<TcpStream, ExitError> {
    if policy.check_target(target) == Verdict::Deny {
        return Err(ExitError::Denied);
    }
    let attempt = async {
        let resolved: Vec<SocketAddr> = tokio::net::lookup_host(target.host_port())
            .await
            .map_err(|_| ExitError::Resolve(target.to_string()))?
            .collect();
        if resolved.is_empty() {
            return Err(ExitError::Resolve(target.to_string()));
        }
        let allowed: Vec<SocketAddr> = resolved
            .into_iter()
            .filter(|addr| policy.check_resolved(target, addr) == Verdict::Allow)
            .collect();
        if allowed.is_empty() {
            return Err(ExitError::Denied);
        }

        let mut last_err = None;
        for addr in allowed {
            match TcpStream::connect(addr).await {
                Ok(socket) => {
                    let _ = socket.set_nodelay(true);
                    return Ok(socket);
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err::<TcpStream, _>(ExitError::Connect {
            target: target.to_string(),
            source: last_err.unwrap_or_else(|| io::ErrorKind::AddrNotAvailable.into()),
        })
    };
    tokio::time::timeout(connect_timeout, attempt)
        .await
        .map_err(|_| ExitError::Timeout)?
}

/// Client half of the connect protocol: sends `target` and waits for the
/// exit's answer. A non-success answer is returned as
/// [`ExitError::Refused`]; everything else means the exit itself failed.
pub async fn request_connect<S>(
    mut stream: S,
    target: &SocksSocketAddr,
) -> Result<(S, SocksSocketAddr), ExitError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&target.to_bytes()).await?;
    stream.flush().await?;

    let code = stream.read_u8().await?;
    let reply = Reply::from_u8(code).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, format!("unknown reply code {code}"))
    })?;
    let bound = SocksSocketAddr::read(&mut stream).await?;
    if !reply.is_success() {
        return Err(ExitError::Refused(reply));
    }
    Ok((stream, bound))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        exit::policy::{AllowAll, PolicyConfig, RulePolicy},
        protocol::Addr,
    };
    use tokio::net::TcpListener;

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut read, mut write) = socket.split();
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                });
            }
        });
        addr
    }

    fn settings() -> ExitSettings {
        ExitSettings {
            connect_timeout: Duration::from_secs(2),
            ..ExitSettings::default()
        }
    }

    #[tokio::test]
    async fn connects_and_splices() {
        let destination = echo_server().await;
        let (client, exit_side) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move { handle_connect(exit_side, &AllowAll, &settings()).await });

        let (mut stream, bound) = request_connect(client, &destination.into()).await.unwrap();
        assert_eq!(bound.addr, Addr::Ipv4("127.0.0.1".parse().unwrap()));
        stream.write_all(b"ping through the exit").await.unwrap();
        let mut back = [0u8; 21];
        stream.read_exact(&mut back).await.unwrap();
        assert_eq!(&back, b"ping through the exit");
    }

    #[tokio::test]
    async fn policy_denial_is_reported() {
        let destination = echo_server().await;
        let policy = RulePolicy::from_config(&PolicyConfig::default()).unwrap();
        let (client, exit_side) = tokio::io::duplex(1024);
        let exit =
            tokio::spawn(async move { handle_connect(exit_side, &policy, &settings()).await });

        let err = request_connect(client, &destination.into()).await.unwrap_err();
        assert!(matches!(err, ExitError::Refused(Reply::ConnectionNotAllowedByRuleset)));
        assert!(matches!(exit.await.unwrap(), Err(ExitError::Denied)));
    }

    #[tokio::test]
    async fn refused_destination_is_reported() {
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let (client, exit_side) = tokio::io::duplex(1024);
        tokio::spawn(async move { handle_connect(exit_side, &AllowAll, &settings()).await });

        let err = request_connect(client, &closed.into()).await.unwrap_err();
        assert!(matches!(err, ExitError::Refused(Reply::ConnectionRefused)));
    }

    #[tokio::test]
    async fn bad_address_type_is_answered() {
        let (mut client, exit_side) = tokio::io::duplex(1024);
        tokio::spawn(async move { handle_connect(exit_side, &AllowAll, &settings()).await });

        client.write_all(&[0x09, 1, 2, 3, 4, 0, 80]).await.unwrap();
        assert_eq!(
            client.read_u8().await.unwrap(),
            Reply::AddressTypeNotSupported.to_u8()
        );
    }
}
