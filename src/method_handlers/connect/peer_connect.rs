use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::{
    exit::{self, ExitError, CONNECT_PROTOCOL},
    identity::PeerId,
    node::Node,
    protocol::{Reply, SocksSocketAddr},
    routing::Router,
    splice::splice,
    transport::{PeerStream, TransportError},
    Error,
};

use super::Connect;

/// Carries CONNECT requests over the overlay to an exit chosen by the
/// [`Router`]. When an exit cannot be reached, or cannot reach the
/// destination, it is marked in the registry and the next one is tried, up to
/// the router's attempt bound. Refusals any exit would repeat (policy, an
/// unsupported address) are final.
#[derive(Clone)]
pub struct PeerConnect {
    node: Node,
    router: Router,
    stream_timeout: Duration,
    idle_timeout: Option<Duration>,
}

/// A connect stream the exit has accepted.
pub struct ExitConnection {
    pub stream: PeerStream,
    pub exit: PeerId,
    pub bound: SocksSocketAddr,
}

impl PeerConnect {
    pub fn new(
        node: Node,
        router: Router,
        stream_timeout: Duration,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            node,
            router,
            stream_timeout,
            idle_timeout,
        }
    }

    async fn try_exit(
        &self,
        exit: PeerId,
        destination: &SocksSocketAddr,
    ) -> Result<ExitConnection, Error> {
        let attempt = async {
            let stream = self.node.open_stream(exit, CONNECT_PROTOCOL).await?;
            let (stream, bound) = exit::request_connect(stream, destination).await?;
            Ok::<_, Error>(ExitConnection {
                stream,
                exit,
                bound,
            })
        };
        tokio::time::timeout(self.stream_timeout, attempt)
            .await
            .map_err(|_| TransportError::Timeout("exit stream"))?
    }
}

impl Connect<()> for PeerConnect {
    type ServerConnection = ExitConnection;

    async fn establish_connection(
        &mut self,
        destination: SocksSocketAddr,
        _credentials: (),
    ) -> crate::protocol::Result<ExitConnection> {
        let registry = self.router.registry().clone();
        let mut request = self.router.request_for(destination.clone());
        // Last code an exit answered with, reported once candidates run out.
        let mut last_refusal = None;

        for attempt in 1..=self.router.max_attempts() {
            let Some(exit) = self.router.next_hop(&request) else {
                break;
            };
            request.excluded.insert(exit);

            match self.try_exit(exit, &destination).await {
                Ok(connection) => {
                    registry.record_success(&exit);
                    debug!(exit = %exit.short(), attempt, "exit accepted");
                    return Ok(connection);
                }
                Err(err) if err.is_retryable() => {
                    warn!(exit = %exit.short(), attempt, %err, "exit attempt failed");
                    registry.record_failure(&exit);
                    if let Error::Exit(ExitError::Refused(reply)) = err {
                        last_refusal = Some(reply);
                    }
                }
                Err(Error::Exit(ExitError::Refused(reply))) => {
                    registry.record_success(&exit);
                    debug!(exit = %exit.short(), %reply, "exit refused destination");
                    return Err(reply.into());
                }
                Err(Error::Shutdown) => return Err(Reply::GeneralFailure.into()),
                Err(err) => {
                    warn!(exit = %exit.short(), attempt, %err, "exit unusable");
                    registry.record_failure(&exit);
                }
            }
        }
        if request.excluded.is_empty() {
            warn!(strategy = self.router.strategy_name(), "no exit available");
        }
        Err(last_refusal.unwrap_or(Reply::NetworkUnreachable).into())
    }

    fn bound_addr(connection: &ExitConnection) -> SocksSocketAddr {
        connection.bound.clone()
    }

    async fn start_listening<T>(
        self,
        client: T,
        connection: ExitConnection,
    ) -> crate::protocol::Result<()>
    where
        T: AsyncWrite + AsyncRead + Send + Unpin,
    {
        let exit = connection.exit;
        let summary = splice(client, connection.stream, self.idle_timeout).await?;
        debug!(
            exit = %exit.short(),
            sent = summary.a_to_b,
            received = summary.b_to_a,
            "tunnel closed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        identity::Keypair,
        node::NodeSettings,
        protocol::Socks5Error,
        routing::{PeerRecord, RecordSource, RoundRobinStrategy},
        transport::PeerAddr,
    };
    use std::sync::Arc;

    fn connector(node: &Node, pinned: Option<PeerId>) -> PeerConnect {
        let router = Router::new(
            node.registry().clone(),
            Arc::new(RoundRobinStrategy::new()),
            None,
            3,
        )
        .with_pinned_exit(pinned);
        PeerConnect::new(node.clone(), router, Duration::from_secs(2), None)
    }

    #[tokio::test]
    async fn without_exits_the_network_is_unreachable() {
        let node = Node::start(NodeSettings::default(), Keypair::generate(), None);
        let mut connect = connector(&node, None);
        let result = connect
            .establish_connection(SocksSocketAddr::default(), ())
            .await;
        assert!(matches!(
            result,
            Err(Socks5Error::Reply(Reply::NetworkUnreachable))
        ));
    }

    #[tokio::test]
    async fn unreachable_pinned_exit_counts_as_failure() {
        let node = Node::start(NodeSettings::default(), Keypair::generate(), None);
        let ghost = Keypair::generate().peer_id();
        node.registry().upsert(
            PeerRecord {
                addrs: vec![PeerAddr::Direct("127.0.0.1:1".into())],
                ..PeerRecord::new(ghost)
            },
            RecordSource::Configured,
        );
        let mut connect = connector(&node, Some(ghost));
        let result = connect
            .establish_connection(SocksSocketAddr::default(), ())
            .await;
        assert!(matches!(
            result,
            Err(Socks5Error::Reply(Reply::NetworkUnreachable))
        ));
        let health = node.registry().get(&ghost).unwrap().health;
        assert_eq!(health.consecutive_failures, 1);
    }
}
