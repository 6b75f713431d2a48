use tokio::io::{AsyncRead, AsyncWrite};
pub mod peer_connect;
use crate::protocol::SocksSocketAddr;

/// Handles the SOCKS5 CONNECT command: reach the destination, then carry the
/// client's bytes to it.
///
/// ## Type Parameters
///
/// - `C`: The credentials produced by the authenticator.
pub trait Connect<C> {
    /// An established path to the destination.
    type ServerConnection: Send;

    /// Reaches `destination`. An `Err(Socks5Error::Reply(_))` is sent to the
    /// client as is; I/O errors are mapped to the closest reply code.
    fn establish_connection(
        &mut self,
        destination: SocksSocketAddr,
        credentials: C,
    ) -> impl std::future::Future<Output = crate::protocol::Result<Self::ServerConnection>> + Send;

    /// Address reported in the success reply.
    fn bound_addr(_connection: &Self::ServerConnection) -> SocksSocketAddr {
        SocksSocketAddr::default()
    }

    /// Forwards data between the client and the connection until both sides
    /// are done.
    fn start_listening<T>(
        self,
        client: T,
        connection: Self::ServerConnection,
    ) -> impl std::future::Future<Output = crate::protocol::Result<()>> + Send
    where
        T: AsyncWrite + AsyncRead + Send + Unpin;
}
