//! Authentication handler trait and types.

use std::net::SocketAddr;

use async_trait::async_trait;

use super::PublicKey;

/// Context of one authentication attempt.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// The username attempting authentication.
    pub username: String,
    /// The remote address of the client, when known.
    pub remote_addr: Option<SocketAddr>,
    /// Per-server connection counter.
    pub connection_id: u64,
    /// Number of authentication attempts so far on this connection.
    pub attempt_count: u32,
}

impl AuthContext {
    /// Creates a new authentication context.
    pub fn new(
        username: impl Into<String>,
        remote_addr: Option<SocketAddr>,
        connection_id: u64,
    ) -> Self {
        Self {
            username: username.into(),
            remote_addr,
            connection_id,
            attempt_count: 0,
        }
    }

    /// Sets the attempt count.
    pub fn with_attempt(mut self, count: u32) -> Self {
        self.attempt_count = count;
        self
    }

    /// Returns the username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the remote address as text, or `"unknown"`.
    pub fn remote(&self) -> String {
        self.remote_addr
            .map_or_else(|| "unknown".to_string(), |addr| addr.to_string())
    }
}

/// SSH authentication methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    /// No authentication.
    None,
    /// Password authentication.
    Password,
    /// Public key authentication.
    PublicKey,
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::None => write!(f, "none"),
            AuthMethod::Password => write!(f, "password"),
            AuthMethod::PublicKey => write!(f, "publickey"),
        }
    }
}

/// Result of an authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    /// Authentication succeeded.
    Accept,
    /// Authentication failed.
    Reject,
}

impl AuthResult {
    /// Returns true if the attempt was accepted.
    pub fn is_accepted(&self) -> bool {
        matches!(self, AuthResult::Accept)
    }
}

/// Decides whether SSH clients may open a session.
///
/// Every method rejects by default.
#[async_trait]
pub trait AuthHandler: Send + Sync {
    /// Authenticate with a password.
    async fn auth_password(&self, ctx: &AuthContext, password: &str) -> AuthResult {
        let _ = (ctx, password);
        AuthResult::Reject
    }

    /// Authenticate with a public key.
    async fn auth_publickey(&self, ctx: &AuthContext, key: &PublicKey) -> AuthResult {
        let _ = (ctx, key);
        AuthResult::Reject
    }

    /// Authenticate without credentials.
    async fn auth_none(&self, ctx: &AuthContext) -> AuthResult {
        let _ = ctx;
        AuthResult::Reject
    }

    /// Methods advertised to clients.
    fn supported_methods(&self) -> Vec<AuthMethod> {
        vec![AuthMethod::Password, AuthMethod::PublicKey]
    }
}
