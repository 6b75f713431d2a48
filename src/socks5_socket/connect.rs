use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, instrument};

use crate::{
    auth::Authenticator,
    method_handlers::Connect,
    protocol::{Reply, Socks5Error, SocksSocketAddr},
};

use super::Socks5Socket;

impl<T, Auth, C> Socks5Socket<T, Auth, C>
where
    Self: Unpin + Send,
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    Auth: Authenticator<T>,
    C: Connect<Auth::Credentials>,
{
    #[instrument(skip_all, fields(destination = %addr))]
    pub(crate) async fn connect(
        mut self,
        addr: SocksSocketAddr,
        credentials: Auth::Credentials,
    ) -> crate::protocol::Result<()> {
        let conn = match self
            .connect_handler
            .establish_connection(addr.clone(), credentials)
            .await
        {
            Ok(conn) => conn,
            Err(err) => {
                let reply = match &err {
                    Socks5Error::Reply(reply) => *reply,
                    Socks5Error::Io(io) => io.kind().into(),
                };
                debug!(%reply, "connect failed");
                self.reply(reply, Default::default()).await?;
                return Err(err);
            }
        };

        let bound = C::bound_addr(&conn);
        self.reply(Reply::Success, bound).await?;
        debug!("connection established");

        self.connect_handler
            .start_listening(self.inner, conn)
            .await
    }
}
