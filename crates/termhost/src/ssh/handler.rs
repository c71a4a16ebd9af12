//! russh handler for one SSH connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use russh::server::{Auth, Handler as RusshHandler, Msg, Session as RusshSession};
use russh::{Channel, ChannelId};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use super::connection::{SshConnection, SshOutput};
use crate::auth::{AuthContext, AuthHandler, AuthResult, PublicKey};
use crate::connection::Connection;
use crate::session::SessionRunner;
use crate::{Error, Window};

struct ChannelSlot {
    channel: Option<Channel<Msg>>,
    window: Window,
    connection: Option<Arc<SshConnection>>,
}

/// Handles one SSH connection.
///
/// Every shell request on a session channel becomes one terminal session.
/// The handler is dropped when the TCP connection ends, which closes any
/// session still running on it.
pub struct SshHandler {
    connection_id: u64,
    remote_addr: Option<SocketAddr>,
    runner: SessionRunner,
    auth: Arc<dyn AuthHandler>,
    auth_attempts: u32,
    user: Option<String>,
    channels: HashMap<ChannelId, ChannelSlot>,
}

impl SshHandler {
    /// Creates a handler for a new connection.
    pub fn new(
        connection_id: u64,
        remote_addr: Option<SocketAddr>,
        runner: SessionRunner,
        auth: Arc<dyn AuthHandler>,
    ) -> Self {
        debug!(connection_id, remote_addr = ?remote_addr, "New SSH connection");
        Self {
            connection_id,
            remote_addr,
            runner,
            auth,
            auth_attempts: 0,
            user: None,
            channels: HashMap::new(),
        }
    }

    /// Number of channels with a running session.
    pub fn active_channels(&self) -> usize {
        self.channels
            .values()
            .filter(|slot| slot.connection.is_some())
            .count()
    }

    fn next_auth_context(&mut self, user: &str) -> AuthContext {
        self.auth_attempts = self.auth_attempts.saturating_add(1);
        AuthContext::new(user, self.remote_addr, self.connection_id)
            .with_attempt(self.auth_attempts)
    }

    fn finish_auth(&mut self, user: &str, method: &str, result: AuthResult) -> Auth {
        match result {
            AuthResult::Accept => {
                info!(connection_id = self.connection_id, user, method, "SSH auth accepted");
                self.user = Some(user.to_string());
                Auth::Accept
            }
            AuthResult::Reject => {
                debug!(connection_id = self.connection_id, user, method, "SSH auth rejected");
                Auth::Reject {
                    proceed_with_methods: None,
                }
            }
        }
    }

    fn start_session(&mut self, channel_id: ChannelId, session: &mut RusshSession) -> bool {
        let Some(slot) = self.channels.get_mut(&channel_id) else {
            return false;
        };
        if slot.connection.is_some() {
            return false;
        }
        let Some(channel) = slot.channel.take() else {
            return false;
        };

        let (output_tx, mut output_rx) = mpsc::unbounded_channel::<SshOutput>();
        let connection = Arc::new(SshConnection::new(slot.window, output_tx));
        slot.connection = Some(connection.clone());

        let handle = session.handle();
        let connection_id = self.connection_id;
        tokio::spawn(async move {
            trace!(connection_id, channel = ?channel_id, "Starting output pump");
            while let Some(output) = output_rx.recv().await {
                match output {
                    SshOutput::Data(data) => {
                        if channel.data(&data[..]).await.is_err() {
                            break;
                        }
                    }
                    SshOutput::Close => {
                        let _ = handle.exit_status_request(channel_id, 0).await;
                        break;
                    }
                }
            }
            let _ = channel.close().await;
            trace!(connection_id, channel = ?channel_id, "Output pump finished");
        });

        debug!(
            connection_id,
            channel = ?channel_id,
            user = self.user.as_deref().unwrap_or(""),
            "Starting terminal session"
        );
        let connection: Arc<dyn Connection> = connection;
        self.runner.spawn(connection);
        true
    }
}

impl Drop for SshHandler {
    fn drop(&mut self) {
        for slot in self.channels.values() {
            if let Some(connection) = &slot.connection {
                connection.close();
            }
        }
        debug!(connection_id = self.connection_id, "SSH connection finished");
    }
}

#[async_trait]
impl RusshHandler for SshHandler {
    type Error = Error;

    async fn auth_none(&mut self, user: &str) -> std::result::Result<Auth, Self::Error> {
        let ctx = self.next_auth_context(user);
        let result = self.auth.auth_none(&ctx).await;
        Ok(self.finish_auth(user, "none", result))
    }

    async fn auth_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> std::result::Result<Auth, Self::Error> {
        let ctx = self.next_auth_context(user);
        let result = self.auth.auth_password(&ctx, password).await;
        Ok(self.finish_auth(user, "password", result))
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<Auth, Self::Error> {
        let ctx = self.next_auth_context(user);
        let key = PublicKey::from_russh(public_key);
        let result = self.auth.auth_publickey(&ctx, &key).await;
        Ok(self.finish_auth(user, "publickey", result))
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut RusshSession,
    ) -> std::result::Result<bool, Self::Error> {
        let channel_id = channel.id();
        debug!(connection_id = self.connection_id, channel = ?channel_id, "Session channel opened");
        self.channels.insert(
            channel_id,
            ChannelSlot {
                channel: Some(channel),
                window: Window::default(),
                connection: None,
            },
        );
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut RusshSession,
    ) -> std::result::Result<(), Self::Error> {
        debug!(
            connection_id = self.connection_id,
            channel = ?channel,
            term,
            width = col_width,
            height = row_height,
            "PTY request"
        );
        let window = Window::new(col_width, row_height);
        match self.channels.get_mut(&channel) {
            Some(slot) => {
                slot.window = window;
                if let Some(connection) = &slot.connection {
                    connection.resize(window);
                }
                session.channel_success(channel);
            }
            None => {
                session.channel_failure(channel);
            }
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut RusshSession,
    ) -> std::result::Result<(), Self::Error> {
        if self.start_session(channel, session) {
            session.channel_success(channel);
        } else {
            debug!(connection_id = self.connection_id, channel = ?channel, "Refusing shell request");
            session.channel_failure(channel);
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut RusshSession,
    ) -> std::result::Result<(), Self::Error> {
        debug!(
            connection_id = self.connection_id,
            channel = ?channel,
            command = %String::from_utf8_lossy(data),
            "Refusing exec request"
        );
        session.channel_failure(channel);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut RusshSession,
    ) -> std::result::Result<(), Self::Error> {
        trace!(
            connection_id = self.connection_id,
            channel = ?channel,
            width = col_width,
            height = row_height,
            "Window change request"
        );
        if let Some(slot) = self.channels.get_mut(&channel) {
            let window = Window::new(col_width, row_height);
            slot.window = window;
            if let Some(connection) = &slot.connection {
                connection.resize(window);
            }
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut RusshSession,
    ) -> std::result::Result<(), Self::Error> {
        trace!(connection_id = self.connection_id, channel = ?channel, len = data.len(), "Data received");
        if let Some(connection) = self
            .channels
            .get(&channel)
            .and_then(|slot| slot.connection.as_ref())
        {
            connection.deliver_input(data);
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut RusshSession,
    ) -> std::result::Result<(), Self::Error> {
        debug!(connection_id = self.connection_id, channel = ?channel, "Channel EOF");
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut RusshSession,
    ) -> std::result::Result<(), Self::Error> {
        debug!(connection_id = self.connection_id, channel = ?channel, "Channel closed");
        if let Some(connection) = self
            .channels
            .remove(&channel)
            .and_then(|slot| slot.connection)
        {
            connection.close();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TransportKind;
    use crate::auth::AcceptAllAuth;
    use crate::config::SessionLimits;
    use crate::session::{SessionHost, SessionManager};

    fn handler() -> SshHandler {
        let manager = Arc::new(SessionManager::new(TransportKind::Ssh, SessionLimits::default()));
        let runner = SessionRunner::new(SessionHost::builder().build(), manager);
        SshHandler::new(
            7,
            Some("127.0.0.1:40000".parse().unwrap()),
            runner,
            Arc::new(AcceptAllAuth::new()),
        )
    }

    #[test]
    fn test_auth_attempts_are_counted() {
        let mut handler = handler();
        let first = handler.next_auth_context("alice");
        let second = handler.next_auth_context("alice");
        assert_eq!(first.attempt_count, 1);
        assert_eq!(second.attempt_count, 2);
        assert_eq!(second.connection_id, 7);
        assert_eq!(second.remote(), "127.0.0.1:40000");
    }

    #[test]
    fn test_finish_auth_records_user() {
        let mut handler = handler();
        let rejected = handler.finish_auth("mallory", "password", AuthResult::Reject);
        assert!(matches!(rejected, Auth::Reject { .. }));
        assert!(handler.user.is_none());

        let accepted = handler.finish_auth("alice", "password", AuthResult::Accept);
        assert!(matches!(accepted, Auth::Accept));
        assert_eq!(handler.user.as_deref(), Some("alice"));
    }

    #[test]
    fn test_no_channels_initially() {
        let handler = handler();
        assert_eq!(handler.active_channels(), 0);
    }
}
