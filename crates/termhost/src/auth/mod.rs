//! SSH authentication.
//!
//! # Example
//!
//! ```rust,ignore
//! use termhost::auth::{AuthorizedKeysAuth, CompositeAuth, PasswordAuth};
//!
//! let auth = CompositeAuth::new()
//!     .add(PasswordAuth::shared("s3cret"))
//!     .add(AuthorizedKeysAuth::new("~/.ssh/authorized_keys")?);
//! ```

mod authorized_keys;
mod handler;
mod password;

pub use authorized_keys::{AuthorizedKey, AuthorizedKeysAuth, PublicKey, parse_authorized_keys};
pub use handler::{AuthContext, AuthHandler, AuthMethod, AuthResult};
pub use password::{AcceptAllAuth, PasswordAuth};

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::Result;
use crate::config::SshConfig;

/// Tries several handlers in order; the first to accept wins.
#[derive(Default)]
pub struct CompositeAuth {
    handlers: Vec<Arc<dyn AuthHandler>>,
}

impl CompositeAuth {
    /// Creates an empty composite, which rejects everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler.
    #[allow(clippy::should_implement_trait)]
    pub fn add<H: AuthHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    /// Number of handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns true if no handler was added.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[async_trait]
impl AuthHandler for CompositeAuth {
    async fn auth_password(&self, ctx: &AuthContext, password: &str) -> AuthResult {
        for handler in &self.handlers {
            if handler.auth_password(ctx, password).await.is_accepted() {
                return AuthResult::Accept;
            }
        }
        AuthResult::Reject
    }

    async fn auth_publickey(&self, ctx: &AuthContext, key: &PublicKey) -> AuthResult {
        for handler in &self.handlers {
            if handler.auth_publickey(ctx, key).await.is_accepted() {
                return AuthResult::Accept;
            }
        }
        AuthResult::Reject
    }

    async fn auth_none(&self, ctx: &AuthContext) -> AuthResult {
        for handler in &self.handlers {
            if handler.auth_none(ctx).await.is_accepted() {
                return AuthResult::Accept;
            }
        }
        AuthResult::Reject
    }

    fn supported_methods(&self) -> Vec<AuthMethod> {
        let mut methods = Vec::new();
        for method in self.handlers.iter().flat_map(|h| h.supported_methods()) {
            if !methods.contains(&method) {
                methods.push(method);
            }
        }
        methods
    }
}

/// Builds the authentication handler described by an SSH configuration.
///
/// Password and authorized-keys authentication combine. With neither
/// configured every client is accepted and a warning is logged once.
///
/// # Errors
///
/// Returns [`Error::Io`](crate::Error::Io) if the authorized keys file cannot
/// be read.
pub fn auth_from_config(config: &SshConfig) -> Result<Arc<dyn AuthHandler>> {
    if config.is_open() {
        warn!(
            port = config.port,
            "SSH server is running without authentication; any client is accepted. \
             Set `password` or `authorized_keys_file` to secure access"
        );
        return Ok(Arc::new(AcceptAllAuth::new()));
    }

    let mut auth = CompositeAuth::new();
    if let Some(password) = &config.password {
        auth = auth.add(PasswordAuth::shared(password.clone()));
        info!("SSH password authentication enabled");
    }
    if let Some(path) = &config.authorized_keys_file {
        auth = auth.add(AuthorizedKeysAuth::new(path)?);
        info!(path = %path.display(), "SSH public key authentication enabled");
    }
    Ok(Arc::new(auth))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn ctx() -> AuthContext {
        AuthContext::new("user", None, 1)
    }

    #[tokio::test]
    async fn test_composite_empty_rejects() {
        let auth = CompositeAuth::new();
        assert!(auth.is_empty());
        assert!(!auth.auth_password(&ctx(), "x").await.is_accepted());
    }

    #[tokio::test]
    async fn test_composite_first_accept_wins() {
        let auth = CompositeAuth::new()
            .add(PasswordAuth::shared("a"))
            .add(PasswordAuth::shared("b"));
        assert!(auth.auth_password(&ctx(), "b").await.is_accepted());
        assert!(!auth.auth_password(&ctx(), "c").await.is_accepted());
        assert_eq!(auth.supported_methods(), vec![AuthMethod::Password]);
    }

    #[tokio::test]
    async fn test_auth_from_config_open() {
        let auth = auth_from_config(&SshConfig::default()).unwrap();
        assert!(auth.auth_none(&ctx()).await.is_accepted());
    }

    #[tokio::test]
    async fn test_auth_from_config_password_and_keys() {
        let key = "AAAAC3NzaC1lZDI1NTE5AAAAIG1cILnhxkg+kMsGsVJP7hQnfKSPPIP/8GSXTE2n/8SE";
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ssh-ed25519 {key}").unwrap();

        let config = SshConfig {
            password: Some("pw".to_string()),
            authorized_keys_file: Some(file.path().to_path_buf()),
            ..SshConfig::default()
        };
        let auth = auth_from_config(&config).unwrap();

        assert!(!auth.auth_none(&ctx()).await.is_accepted());
        assert!(auth.auth_password(&ctx(), "pw").await.is_accepted());
        assert!(!auth.auth_password(&ctx(), "nope").await.is_accepted());
        let offered = PublicKey::new("ssh-ed25519", key);
        assert!(auth.auth_publickey(&ctx(), &offered).await.is_accepted());
        assert_eq!(
            auth.supported_methods(),
            vec![AuthMethod::Password, AuthMethod::PublicKey]
        );
    }
}
