//! Password authentication handlers.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::debug;

use super::PublicKey;
use super::handler::{AuthContext, AuthHandler, AuthMethod, AuthResult};

/// Password authentication.
///
/// Accepts a shared password for any username, and per-user passwords added
/// with [`add_user`](Self::add_user). A per-user entry takes precedence over
/// the shared password for that username.
///
/// # Example
///
/// ```rust,ignore
/// use termhost::auth::PasswordAuth;
///
/// let auth = PasswordAuth::shared("s3cret").add_user("admin", "hunter2");
/// ```
#[derive(Default)]
pub struct PasswordAuth {
    shared: Option<String>,
    users: HashMap<String, String>,
}

impl PasswordAuth {
    /// Creates a handler with no passwords; every attempt is rejected.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a handler accepting `password` for any username.
    pub fn shared(password: impl Into<String>) -> Self {
        Self {
            shared: Some(password.into()),
            users: HashMap::new(),
        }
    }

    /// Adds a user with the given password.
    pub fn add_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(username.into(), password.into());
        self
    }

    /// Returns the number of per-user entries.
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    fn expected(&self, username: &str) -> Option<&str> {
        self.users
            .get(username)
            .or(self.shared.as_ref())
            .map(String::as_str)
    }
}

impl std::fmt::Debug for PasswordAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordAuth")
            .field("shared", &self.shared.is_some())
            .field("users", &self.users.len())
            .finish()
    }
}

#[async_trait]
impl AuthHandler for PasswordAuth {
    async fn auth_password(&self, ctx: &AuthContext, password: &str) -> AuthResult {
        match self.expected(ctx.username()) {
            Some(expected) if expected == password => {
                debug!(username = %ctx.username(), remote_addr = %ctx.remote(), "PasswordAuth: accepted");
                AuthResult::Accept
            }
            Some(_) => {
                debug!(username = %ctx.username(), remote_addr = %ctx.remote(), "PasswordAuth: wrong password");
                AuthResult::Reject
            }
            None => {
                debug!(username = %ctx.username(), "PasswordAuth: unknown user");
                AuthResult::Reject
            }
        }
    }

    fn supported_methods(&self) -> Vec<AuthMethod> {
        vec![AuthMethod::Password]
    }
}

/// Accepts every client.
///
/// Used when no credentials are configured. The server logs a single warning
/// at startup; individual attempts are logged at debug level only.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllAuth;

impl AcceptAllAuth {
    /// Creates the handler.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuthHandler for AcceptAllAuth {
    async fn auth_password(&self, ctx: &AuthContext, _password: &str) -> AuthResult {
        debug!(username = %ctx.username(), remote_addr = %ctx.remote(), "AcceptAllAuth: accepting password auth");
        AuthResult::Accept
    }

    async fn auth_publickey(&self, ctx: &AuthContext, _key: &PublicKey) -> AuthResult {
        debug!(username = %ctx.username(), remote_addr = %ctx.remote(), "AcceptAllAuth: accepting public key auth");
        AuthResult::Accept
    }

    async fn auth_none(&self, ctx: &AuthContext) -> AuthResult {
        debug!(username = %ctx.username(), remote_addr = %ctx.remote(), "AcceptAllAuth: accepting none auth");
        AuthResult::Accept
    }

    fn supported_methods(&self) -> Vec<AuthMethod> {
        vec![AuthMethod::None, AuthMethod::Password, AuthMethod::PublicKey]
    }
}
