//! SSH transport.
//!
//! Accepts TCP connections, runs the russh protocol on each, and turns every
//! shell request into a terminal session of the shared [`SessionHost`].

mod connection;
mod handler;

pub use connection::{SshConnection, SshOutput};
pub use handler::SshHandler;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use russh::MethodSet;
use russh::server::{Config as RusshConfig, run_stream};
use russh_keys::key::KeyPair;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthHandler, AuthMethod, auth_from_config};
use crate::config::SshConfig;
use crate::introspection::TransportSessionInfo;
use crate::session::{SessionHost, SessionManager, SessionRunner};
use crate::{Result, TransportKind};

/// Delay before answering a failed authentication attempt.
pub const AUTH_REJECTION_DELAY: Duration = Duration::from_millis(100);

/// Maximum authentication attempts per connection.
pub const MAX_AUTH_ATTEMPTS: usize = 6;

/// SSH terminal server.
///
/// # Example
///
/// ```rust,ignore
/// let server = SshServer::new(config.ssh.clone(), host)?;
/// server.listen().await?;
/// ```
pub struct SshServer {
    config: SshConfig,
    runner: SessionRunner,
    auth: Arc<dyn AuthHandler>,
    russh_config: Arc<RusshConfig>,
    connection_counter: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl SshServer {
    /// Creates a server. Loads the host key and authentication files.
    ///
    /// # Errors
    ///
    /// Returns an error if the host key or the authorized keys file cannot
    /// be loaded.
    pub fn new(config: SshConfig, host: Arc<SessionHost>) -> Result<Self> {
        let auth = auth_from_config(&config)?;
        let russh_config = Arc::new(russh_config(&config, auth.as_ref())?);
        let manager = Arc::new(SessionManager::new(TransportKind::Ssh, config.limits));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            runner: SessionRunner::new(host, manager),
            auth,
            russh_config,
            connection_counter: AtomicU64::new(0),
            shutdown,
        })
    }

    /// Configuration.
    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    /// Session table of this transport.
    pub fn manager(&self) -> &Arc<SessionManager> {
        self.runner.manager()
    }

    /// Binds the configured address and serves until shut down.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or cannot be bound.
    pub async fn listen(&self) -> Result<()> {
        let addr = self.config.bind_addr()?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serves connections from `listener` until [`shutdown`](Self::shutdown).
    ///
    /// # Errors
    ///
    /// Returns an error if the listener has no local address.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        let mut shutdown = self.shutdown.subscribe();
        info!(
            addr = %local_addr,
            limits = %self.config.limits,
            "SSH server listening"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer_addr)) => {
                        let connection_id =
                            self.connection_counter.fetch_add(1, Ordering::Relaxed) + 1;
                        debug!(connection_id, peer_addr = %peer_addr, "Accepted connection");
                        let handler = SshHandler::new(
                            connection_id,
                            Some(peer_addr),
                            self.runner.clone(),
                            self.auth.clone(),
                        );
                        let config = self.russh_config.clone();
                        tokio::spawn(async move {
                            match run_stream(config, socket, handler).await {
                                Ok(session) => match session.await {
                                    Ok(()) => debug!(connection_id, "Connection closed cleanly"),
                                    Err(e) => warn!(connection_id, error = %e, "Connection error"),
                                },
                                Err(e) => error!(peer_addr = %peer_addr, error = %e, "SSH handshake failed"),
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
                _ = shutdown.changed() => {}
            }
        }

        info!(addr = %local_addr, "SSH server stopped accepting connections");
        Ok(())
    }

    /// Stops accepting connections and closes every session.
    ///
    /// Returns the number of sessions that did not close within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        self.shutdown.send_replace(true);
        self.manager().shutdown(timeout).await
    }
}

impl TransportSessionInfo for SshServer {
    fn transport_name(&self) -> &str {
        self.manager().transport_name()
    }

    fn active_sessions(&self) -> usize {
        self.manager().active_sessions()
    }

    fn max_sessions(&self) -> i64 {
        self.manager().max_sessions()
    }

    fn is_running(&self) -> bool {
        TransportSessionInfo::is_running(self.manager().as_ref())
    }
}

impl std::fmt::Debug for SshServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshServer")
            .field("config", &self.config)
            .field("manager", self.manager())
            .finish()
    }
}

/// Builds the russh server configuration.
///
/// Loads the host key from `host_key_file`, or generates an ephemeral
/// Ed25519 key that is not persisted.
///
/// # Errors
///
/// Returns [`Error::KeyLoad`](crate::Error::KeyLoad) if the key file cannot
/// be decoded.
pub fn russh_config(config: &SshConfig, auth: &dyn AuthHandler) -> Result<RusshConfig> {
    let mut russh_config = RusshConfig::default();
    russh_config.server_id = russh::SshId::Standard(config.server_id.clone());
    russh_config.methods = method_set(&auth.supported_methods());
    russh_config.auth_rejection_time = AUTH_REJECTION_DELAY;
    russh_config.max_auth_attempts = MAX_AUTH_ATTEMPTS;

    let key = match &config.host_key_file {
        Some(path) => {
            info!(path = %path.display(), "Loading SSH host key");
            russh_keys::load_secret_key(path, None)?
        }
        None => {
            info!("Generating ephemeral Ed25519 host key");
            KeyPair::generate_ed25519()
        }
    };
    russh_config.keys.push(key);
    Ok(russh_config)
}

fn method_set(methods: &[AuthMethod]) -> MethodSet {
    let mut set = MethodSet::empty();
    for method in methods {
        set |= match method {
            AuthMethod::None => MethodSet::NONE,
            AuthMethod::Password => MethodSet::PASSWORD,
            AuthMethod::PublicKey => MethodSet::PUBLICKEY,
        };
    }
    set
}
