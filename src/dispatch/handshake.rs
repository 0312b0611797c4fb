//! Connection-level token check.

use super::ConnectionInfo;
use crate::error::{Result, RpcError};

/// Query parameter carrying the connection token.
pub const TOKEN_PARAM: &str = "token";

/// Close code sent when the token check fails.
pub const AUTH_FAIL_CODE: u16 = 403;

/// Close reason sent when the token check fails.
pub const AUTH_FAIL_REASON: &str = "Auth fail";

/// Checks the `token` query parameter once per connection.
///
/// An empty configured token admits every connection.
#[derive(Debug, Clone, Default)]
pub struct HandshakeGuard {
    token: String,
}

impl HandshakeGuard {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Whether a token is required at all.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        !self.token.is_empty()
    }

    /// Accept or reject a connection.
    pub fn authorize(&self, connection: &ConnectionInfo) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        match connection.query_param(TOKEN_PARAM) {
            Some(presented) if presented == self.token => Ok(()),
            _ => Err(RpcError::AuthFailed),
        }
    }
}
