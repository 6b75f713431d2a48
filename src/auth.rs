use std::{future::Future, io};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::protocol::AuthMethod;

pub mod no_auth_authenticator;

pub use no_auth_authenticator::NoAuthAuthenticator;

/// Method negotiation and sub-negotiation of a SOCKS5 connection.
pub trait Authenticator<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// What a successful authentication yields, handed to the command
    /// handlers.
    type Credentials: Send;

    /// Picks one of the client's offered methods, or
    /// [`AuthMethod::NoAcceptableMethods`].
    fn select_method(&self, methods: &[AuthMethod]) -> AuthMethod;

    /// Runs the sub-negotiation for `method` over `conn`. Returns
    /// `Ok(None)` when the client failed to authenticate.
    fn authenticate(
        &mut self,
        conn: &mut T,
        method: AuthMethod,
    ) -> impl Future<Output = io::Result<Option<Self::Credentials>>> + Send;
}
