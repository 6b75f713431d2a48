use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::protocol::AuthMethod;

use super::Authenticator;

/// Accepts clients offering "no authentication required". The ingress only
/// binds to trusted local addresses, so there is nothing to check.
pub struct NoAuthAuthenticator;

impl<T> Authenticator<T> for NoAuthAuthenticator
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    type Credentials = ();

    async fn authenticate(&mut self, _: &mut T, _: AuthMethod) -> io::Result<Option<()>> {
        Ok(Some(()))
    }

    fn select_method(&self, methods: &[AuthMethod]) -> AuthMethod {
        if methods.contains(&AuthMethod::NoAuthRequired) {
            AuthMethod::NoAuthRequired
        } else {
            AuthMethod::NoAcceptableMethods
        }
    }
}
