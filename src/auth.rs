use crate::protocol::AuthMethod;

/// Chooses the SOCKS5 authentication method for a connection.
pub trait Authenticator {
    /// Picks one of the offered `methods`, or
    /// [`AuthMethod::NoAcceptableMethods`] to refuse the client.
    fn select_method(&self, methods: &[AuthMethod]) -> AuthMethod;
}

/// Accepts clients that offer the "no authentication required" method and
/// refuses everyone else.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuthAuthenticator;

impl Authenticator for NoAuthAuthenticator {
    fn select_method(&self, methods: &[AuthMethod]) -> AuthMethod {
        if methods.contains(&AuthMethod::NoAuthRequired) {
            AuthMethod::NoAuthRequired
        } else {
            AuthMethod::NoAcceptableMethods
        }
    }
}
