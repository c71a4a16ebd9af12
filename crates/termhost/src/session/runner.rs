//! Per-session orchestration.
//!
//! [`SessionRunner::handle`] takes one accepted connection through
//!
//! ```text
//! Accepted -> Admitted -> Opened -> Running -> Closing -> Closed
//!     \-> Rejected
//! ```
//!
//! Every path out of `Running` (client close, idle eviction, transport
//! error, interpreter exit or failure) converges on one guarded finish step
//! that removes the session from its table, releases its capacity slot and
//! fires `closed` exactly once.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::activity::ActivityTracker;
use super::events::{LifecycleNotifier, SessionObserver};
use super::handle::{SessionHandle, SessionId};
use super::manager::{Refusal, SessionManager};
use crate::command::{CommandRegistry, RegistryFactory};
use crate::config::ShellConfig;
use crate::connection::{
    CloseCallback, CloseHandler, Connection, Encoding, SizeHandler, StdinHandler,
};
use crate::inject::{Container, DependencyInjector, ServiceContainer};
use crate::shell::{Interpreter, LineShell, ShellCustomizer, ShellSettings};
use crate::{Result, TransportKind, Window};

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The interpreter returned normally.
    Completed(SessionId),
    /// Building, injecting or interpreting failed; the session was closed.
    Failed(SessionId),
    /// The transport was at capacity.
    Rejected,
    /// The transport was shutting down.
    Refused,
}

impl SessionOutcome {
    /// Session id, unless rejected.
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            SessionOutcome::Completed(id) | SessionOutcome::Failed(id) => Some(*id),
            SessionOutcome::Rejected | SessionOutcome::Refused => None,
        }
    }
}

/// Everything sessions share: commands, services, interpreter and observers.
pub struct SessionHost {
    registry_factory: Arc<dyn RegistryFactory>,
    injector: DependencyInjector,
    interpreter: Arc<dyn Interpreter>,
    notifier: Arc<LifecycleNotifier>,
    settings: ShellSettings,
    customizers: Vec<Arc<dyn ShellCustomizer>>,
}

impl SessionHost {
    /// Starts building a host.
    pub fn builder() -> SessionHostBuilder {
        SessionHostBuilder::default()
    }

    /// Lifecycle notifier.
    pub fn notifier(&self) -> &Arc<LifecycleNotifier> {
        &self.notifier
    }

    /// Registers a lifecycle observer.
    pub fn subscribe(&self, observer: Arc<dyn SessionObserver>) {
        self.notifier.subscribe(observer);
    }

    /// Base shell settings before customizers.
    pub fn settings(&self) -> &ShellSettings {
        &self.settings
    }

    /// Settings for a new session, with every customizer applied.
    pub fn session_settings(&self) -> ShellSettings {
        let mut settings = self.settings.clone();
        for customizer in &self.customizers {
            customizer.customize(&mut settings);
        }
        settings
    }

    /// Builds and injects a fresh command registry.
    ///
    /// # Errors
    ///
    /// Returns the factory's error or an [`Error::Injection`].
    pub fn build_registry(&self) -> Result<CommandRegistry> {
        let mut registry = self.registry_factory.build()?;
        self.injector.inject_registry(&mut registry)?;
        Ok(registry)
    }
}

impl fmt::Debug for SessionHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHost")
            .field("settings", &self.settings)
            .field("customizers", &self.customizers.len())
            .field("notifier", &self.notifier)
            .finish()
    }
}

/// Builder for [`SessionHost`].
#[derive(Default)]
pub struct SessionHostBuilder {
    registry_factory: Option<Arc<dyn RegistryFactory>>,
    container: Option<Arc<dyn Container>>,
    interpreter: Option<Arc<dyn Interpreter>>,
    settings: ShellSettings,
    customizers: Vec<Arc<dyn ShellCustomizer>>,
    observers: Vec<Arc<dyn SessionObserver>>,
}

impl SessionHostBuilder {
    /// Sets the per-session registry factory.
    #[must_use]
    pub fn registry_factory(mut self, factory: impl RegistryFactory + 'static) -> Self {
        self.registry_factory = Some(Arc::new(factory));
        self
    }

    /// Sets the service container. Defaults to an empty [`ServiceContainer`].
    #[must_use]
    pub fn container(mut self, container: Arc<dyn Container>) -> Self {
        self.container = Some(container);
        self
    }

    /// Sets the interpreter. Defaults to [`LineShell`].
    #[must_use]
    pub fn interpreter(mut self, interpreter: Arc<dyn Interpreter>) -> Self {
        self.interpreter = Some(interpreter);
        self
    }

    /// Sets the base shell settings.
    #[must_use]
    pub fn settings(mut self, settings: ShellSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Sets the base shell settings from configuration.
    #[must_use]
    pub fn shell_config(self, config: &ShellConfig) -> Self {
        self.settings(ShellSettings::from(config))
    }

    /// Adds a settings customizer applied to every session.
    #[must_use]
    pub fn customizer(mut self, customizer: impl ShellCustomizer + 'static) -> Self {
        self.customizers.push(Arc::new(customizer));
        self
    }

    /// Adds a lifecycle observer.
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Builds the host.
    pub fn build(self) -> Arc<SessionHost> {
        let notifier = Arc::new(LifecycleNotifier::new());
        for observer in self.observers {
            notifier.subscribe(observer);
        }
        let container: Arc<dyn Container> = match self.container {
            Some(container) => container,
            None => Arc::new(ServiceContainer::new()),
        };
        let registry_factory: Arc<dyn RegistryFactory> = match self.registry_factory {
            Some(factory) => factory,
            None => Arc::new(|| -> Result<CommandRegistry> { Ok(CommandRegistry::new()) }),
        };

        Arc::new(SessionHost {
            registry_factory,
            injector: DependencyInjector::new(container),
            interpreter: match self.interpreter {
                Some(interpreter) => interpreter,
                None => Arc::new(LineShell::new()),
            },
            notifier,
            settings: self.settings,
            customizers: self.customizers,
        })
    }
}

/// Runs sessions of one transport.
#[derive(Clone)]
pub struct SessionRunner {
    host: Arc<SessionHost>,
    manager: Arc<SessionManager>,
}

impl SessionRunner {
    /// Creates a runner.
    pub fn new(host: Arc<SessionHost>, manager: Arc<SessionManager>) -> Self {
        Self { host, manager }
    }

    /// Shared host.
    pub fn host(&self) -> &Arc<SessionHost> {
        &self.host
    }

    /// Session table of this transport.
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Runs `handle` on a new task, for event-driven transports.
    pub fn spawn(&self, connection: Arc<dyn Connection>) -> JoinHandle<SessionOutcome> {
        let runner = self.clone();
        tokio::spawn(async move { runner.handle(connection).await })
    }

    /// Runs one connection to completion.
    ///
    /// Never returns an error: failures are logged and end the session.
    pub async fn handle(&self, connection: Arc<dyn Connection>) -> SessionOutcome {
        let transport = self.manager.transport();

        let permit = match self.manager.admit() {
            Ok(permit) => permit,
            Err(refusal) => return refuse(connection.as_ref(), refusal),
        };

        let session = Arc::new(SessionHandle::new(
            transport,
            permit,
            self.host.notifier.is_observed(),
        ));
        let id = session.id();
        if !self.manager.register(session.clone(), connection.clone()) {
            session.release_permit();
            return refuse(connection.as_ref(), Refusal::ShuttingDown);
        }
        self.host.notifier.opened(&session);
        info!(session_id = %id, transport = %transport, "Session opened");

        let finisher = Arc::new(SessionFinisher {
            session: session.clone(),
            manager: Arc::downgrade(&self.manager),
            notifier: self.host.notifier.clone(),
        });
        let on_close = finisher.clone();
        connection.set_close_handler(Arc::new(move || on_close.finish()));
        self.manager.ensure_evictor();

        let tracked: Arc<dyn Connection> = Arc::new(TrackedConnection::new(
            connection.clone(),
            session.activity().clone(),
        ));

        let run = AssertUnwindSafe(self.run(tracked, id)).catch_unwind().await;
        let outcome = match run {
            Ok(Ok(())) => {
                debug!(session_id = %id, "Interpreter finished");
                SessionOutcome::Completed(id)
            }
            Ok(Err(e)) => {
                error!(session_id = %id, transport = %transport, error = %e, "Session failed");
                SessionOutcome::Failed(id)
            }
            Err(_) => {
                error!(session_id = %id, transport = %transport, "Interpreter panicked");
                SessionOutcome::Failed(id)
            }
        };

        connection.close();
        finisher.finish();
        outcome
    }

    async fn run(&self, connection: Arc<dyn Connection>, id: SessionId) -> Result<()> {
        let registry = self.host.build_registry()?;
        let settings = self.host.session_settings();
        debug!(
            session_id = %id,
            commands = registry.len(),
            prompt = %settings.prompt,
            "Starting interpreter"
        );
        self.host
            .interpreter
            .run(registry, connection, settings, id)
            .await
    }
}

fn refuse(connection: &dyn Connection, refusal: Refusal) -> SessionOutcome {
    if let Err(e) = connection.write(refusal.message().as_bytes()) {
        debug!(
            transport = %connection.transport(),
            error = %e,
            ?refusal,
            "Could not write refusal message"
        );
    }
    connection.close();
    match refusal {
        Refusal::AtCapacity => SessionOutcome::Rejected,
        Refusal::ShuttingDown => SessionOutcome::Refused,
    }
}

impl fmt::Debug for SessionRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRunner")
            .field("manager", &self.manager)
            .finish()
    }
}

struct SessionFinisher {
    session: Arc<SessionHandle>,
    manager: Weak<SessionManager>,
    notifier: Arc<LifecycleNotifier>,
}

impl SessionFinisher {
    fn finish(&self) {
        if !self.session.try_begin_close() {
            return;
        }
        if let Some(manager) = self.manager.upgrade() {
            manager.unregister(self.session.id());
        }
        self.session.release_permit();
        self.notifier.closed(&self.session);
        info!(
            session_id = %self.session.id(),
            transport = %self.session.transport(),
            duration_secs = self.session.duration().as_secs(),
            "Session closed"
        );
    }
}

/// Connection wrapper that records activity on every inbound chunk.
pub struct TrackedConnection {
    inner: Arc<dyn Connection>,
    activity: Arc<ActivityTracker>,
}

impl TrackedConnection {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn Connection>, activity: Arc<ActivityTracker>) -> Self {
        Self { inner, activity }
    }
}

impl Connection for TrackedConnection {
    fn transport(&self) -> TransportKind {
        self.inner.transport()
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        self.inner.write(data)
    }

    fn set_stdin_handler(&self, handler: Option<StdinHandler>) {
        let wrapped = handler.map(|handler| {
            let activity = self.activity.clone();
            Arc::new(move |data: &[u8]| {
                activity.touch();
                handler(data);
            }) as StdinHandler
        });
        self.inner.set_stdin_handler(wrapped);
    }

    fn stdin_handler(&self) -> Option<StdinHandler> {
        self.inner.stdin_handler()
    }

    fn set_size_handler(&self, handler: Option<SizeHandler>) {
        self.inner.set_size_handler(handler);
    }

    fn size(&self) -> Window {
        self.inner.size()
    }

    fn set_close_handler(&self, callback: CloseCallback) {
        self.inner.set_close_handler(callback);
    }

    fn close_handler(&self) -> CloseHandler {
        self.inner.close_handler()
    }

    fn close(&self) {
        self.inner.close();
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn supports_ansi(&self) -> bool {
        self.inner.supports_ansi()
    }

    fn input_encoding(&self) -> Encoding {
        self.inner.input_encoding()
    }

    fn output_encoding(&self) -> Encoding {
        self.inner.output_encoding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionLimits;
    use crate::local::local_pair;
    use crate::session::events::SessionEventLog;
    use crate::{Error, REJECTION_MESSAGE, SHUTDOWN_MESSAGE};
    use std::time::Duration;

    fn runner(max_sessions: i64, host: Arc<SessionHost>) -> SessionRunner {
        let manager = Arc::new(SessionManager::new(
            TransportKind::Local,
            SessionLimits {
                max_sessions,
                idle_timeout: Duration::ZERO,
            },
        ));
        SessionRunner::new(host, manager)
    }

    #[tokio::test]
    async fn test_rejected_session_gets_message_and_no_events() {
        let log = Arc::new(SessionEventLog::new());
        let host = SessionHost::builder().observer(log.clone()).build();
        let runner = runner(1, host.clone());
        let _held = runner.manager().try_admit().unwrap();

        let (conn, mut client) = local_pair(TransportKind::Local, Window::default());
        let outcome = runner.handle(conn).await;

        assert_eq!(outcome, SessionOutcome::Rejected);
        let text = client.read_to_end(Duration::from_secs(1)).await.unwrap();
        assert_eq!(text, REJECTION_MESSAGE);
        host.notifier().flush();
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_stopped_transport_refuses_with_shutdown_message() {
        let log = Arc::new(SessionEventLog::new());
        let host = SessionHost::builder().observer(log.clone()).build();
        let runner = runner(0, host.clone());
        runner.manager().shutdown(Duration::from_millis(10)).await;

        let (conn, mut client) = local_pair(TransportKind::Local, Window::default());
        let outcome = runner.handle(conn).await;

        assert_eq!(outcome, SessionOutcome::Refused);
        assert_eq!(outcome.session_id(), None);
        let text = client.read_to_end(Duration::from_secs(1)).await.unwrap();
        assert_eq!(text, SHUTDOWN_MESSAGE);
        assert_eq!(runner.manager().limiter().active(), 0);
        host.notifier().flush();
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_registry_failure_closes_and_fires_closed_once() {
        let log = Arc::new(SessionEventLog::new());
        let host = SessionHost::builder()
            .registry_factory(|| -> Result<CommandRegistry> {
                Err(Error::Registry("broken factory".to_string()))
            })
            .observer(log.clone())
            .build();
        let runner = runner(0, host.clone());

        let (conn, client) = local_pair(TransportKind::Local, Window::default());
        let outcome = runner.handle(conn).await;

        let id = outcome.session_id().unwrap();
        assert_eq!(outcome, SessionOutcome::Failed(id));
        assert!(client.is_closed());
        assert_eq!(runner.manager().session_count(), 0);
        assert_eq!(runner.manager().limiter().active(), 0);

        host.notifier().flush();
        assert_eq!(log.events_for(id).len(), 2);
    }

    #[tokio::test]
    async fn test_tracked_connection_touches_activity() {
        let (conn, client) = local_pair(TransportKind::Local, Window::default());
        let activity = Arc::new(ActivityTracker::new());
        let tracked = TrackedConnection::new(conn, activity.clone());

        tokio::time::sleep(Duration::from_millis(40)).await;
        let before = activity.last_activity();
        tracked.set_stdin_handler(Some(Arc::new(|_data: &[u8]| {})));
        client.send("x");

        assert!(activity.last_activity() > before);
    }

    #[test]
    fn test_customizers_apply_in_order() {
        let host = SessionHost::builder()
            .customizer(|s: &mut ShellSettings| s.prompt = "a> ".to_string())
            .customizer(|s: &mut ShellSettings| s.prompt.push('>'))
            .build();
        assert_eq!(host.session_settings().prompt, "a> >");
        assert_eq!(host.settings().prompt, ShellSettings::default().prompt);
    }
}
