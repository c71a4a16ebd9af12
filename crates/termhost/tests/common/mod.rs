//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use termhost::command::CommandOutcome;
use termhost::config::SessionLimits;
use termhost::injectable;
use termhost::local::{LocalClient, local_pair};
use termhost::prelude::*;
use termhost::session::SessionEventLog;
use termhost::SessionManager;
use tokio::task::JoinHandle;

/// Default wait for prompts and closes.
pub const TIMEOUT: Duration = Duration::from_secs(3);

/// Prompt used by every test host.
pub const PROMPT: &str = "test> ";

/// Limits with the given bound and idle timeout.
pub fn limits(max_sessions: i64, idle_timeout: Duration) -> SessionLimits {
    SessionLimits {
        max_sessions,
        idle_timeout,
    }
}

pub struct Echo;

injectable!(Echo);

#[async_trait]
impl Command for Echo {
    async fn execute(&self, invocation: &mut Invocation) -> CommandResult {
        invocation.println(&invocation.args().join(" "))?;
        Ok(CommandOutcome::Success)
    }
}

/// Registry with a single `echo` command.
pub fn echo_registry() -> Result<CommandRegistry> {
    Ok(CommandRegistry::new().with(CommandNode::new("echo", Echo)))
}

/// A local-transport runner with an event log attached.
pub struct Harness {
    pub runner: SessionRunner,
    pub log: Arc<SessionEventLog>,
}

impl Harness {
    /// Echo host on the local transport.
    pub fn new(limits: SessionLimits) -> Self {
        Self::with_host(limits, SessionHost::builder().registry_factory(echo_registry))
    }

    /// Custom host on the local transport.
    pub fn with_host(
        limits: SessionLimits,
        builder: termhost::session::SessionHostBuilder,
    ) -> Self {
        let log = Arc::new(SessionEventLog::new());
        let host = builder
            .customizer(|settings: &mut ShellSettings| settings.prompt = PROMPT.to_string())
            .observer(log.clone())
            .build();
        let manager = Arc::new(SessionManager::new(TransportKind::Local, limits));
        Self {
            runner: SessionRunner::new(host, manager),
            log,
        }
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        self.runner.manager()
    }

    /// Starts a session and returns the client side.
    pub fn connect(&self) -> (LocalClient, JoinHandle<SessionOutcome>) {
        let (connection, client) = local_pair(TransportKind::Local, Window::default());
        let handle = self.runner.spawn(connection);
        (client, handle)
    }

    /// Starts a session and waits for its first prompt.
    pub async fn open(&self) -> (LocalClient, JoinHandle<SessionOutcome>) {
        let (mut client, handle) = self.connect();
        client
            .read_until(PROMPT, TIMEOUT)
            .await
            .expect("session should print a prompt");
        (client, handle)
    }

    /// Delivers pending lifecycle events to observers.
    pub fn flush(&self) {
        self.runner.host().notifier().flush();
    }

    /// Counts recorded events of one kind.
    pub fn count(&self, kind: SessionEventKind) -> usize {
        self.flush();
        self.log.events().iter().filter(|e| e.kind == kind).count()
    }
}

/// Polls `condition` every 20ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
