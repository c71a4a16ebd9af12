//! Per-transport session table.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::capacity::{CapacityLimiter, CapacityPermit};
use super::handle::{SessionHandle, SessionId, SessionInfo};
use super::idle::IdleEvictor;
use crate::config::SessionLimits;
use crate::{REJECTION_MESSAGE, SHUTDOWN_MESSAGE, TransportKind};
use crate::connection::Connection;
use crate::introspection::TransportSessionInfo;

/// Why a connection was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    /// The transport has as many sessions as it allows.
    AtCapacity,
    /// The transport is shutting down.
    ShuttingDown,
}

impl Refusal {
    /// Text written to the refused client.
    pub fn message(self) -> &'static str {
        match self {
            Refusal::AtCapacity => REJECTION_MESSAGE,
            Refusal::ShuttingDown => SHUTDOWN_MESSAGE,
        }
    }
}

struct SessionEntry {
    handle: Arc<SessionHandle>,
    connection: Arc<dyn Connection>,
}

/// Tracks the sessions of one transport: capacity, activity and eviction.
///
/// The table lock is held only for map operations. Connections are closed
/// after the lock is released, because closing runs close handlers that
/// remove the session from this same table.
pub struct SessionManager {
    transport: TransportKind,
    limiter: CapacityLimiter,
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    evictor: Option<IdleEvictor>,
    running: AtomicBool,
}

impl SessionManager {
    /// Creates a manager for `transport` with the given limits.
    pub fn new(transport: TransportKind, limits: SessionLimits) -> Self {
        info!(
            transport = %transport,
            %limits,
            "Session manager initialized"
        );
        Self {
            transport,
            limiter: CapacityLimiter::new(limits.max_sessions),
            sessions: RwLock::new(HashMap::new()),
            evictor: limits.idle().map(|timeout| IdleEvictor::new(transport, timeout)),
            running: AtomicBool::new(true),
        }
    }

    /// Transport kind.
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Capacity limiter.
    pub fn limiter(&self) -> &CapacityLimiter {
        &self.limiter
    }

    /// Idle timeout, if eviction is enabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.evictor.as_ref().map(IdleEvictor::timeout)
    }

    /// Admits a session if the transport is running and below capacity.
    pub fn try_admit(&self) -> Option<CapacityPermit> {
        self.admit().ok()
    }

    /// Like [`try_admit`](Self::try_admit), but says why admission failed.
    pub fn admit(&self) -> std::result::Result<CapacityPermit, Refusal> {
        if !self.is_running() {
            info!(transport = %self.transport, "Transport shutting down, refusing connection");
            return Err(Refusal::ShuttingDown);
        }
        self.limiter.try_admit().ok_or_else(|| {
            warn!(
                transport = %self.transport,
                max = self.limiter.max_or_unbounded(),
                active = self.limiter.active(),
                "Maximum sessions reached, rejecting connection"
            );
            Refusal::AtCapacity
        })
    }

    /// Adds an admitted session to the table.
    ///
    /// Returns false, leaving the table untouched, once
    /// [`shutdown`](Self::shutdown) has started.
    pub fn register(&self, handle: Arc<SessionHandle>, connection: Arc<dyn Connection>) -> bool {
        let mut sessions = self.sessions.write();
        let id = handle.id();
        if !self.is_running() {
            debug!(
                session_id = %id,
                transport = %self.transport,
                "Transport stopped, not registering session"
            );
            return false;
        }
        sessions.insert(id, SessionEntry { handle, connection });
        info!(
            session_id = %id,
            transport = %self.transport,
            total_sessions = sessions.len(),
            "Session registered"
        );
        true
    }

    /// Removes a session from the table. Returns false if it was not present.
    pub fn unregister(&self, id: SessionId) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.remove(&id) {
            Some(entry) => {
                info!(
                    session_id = %id,
                    transport = %self.transport,
                    duration_secs = entry.handle.duration().as_secs(),
                    remaining_sessions = sessions.len(),
                    "Session removed"
                );
                true
            }
            None => false,
        }
    }

    /// Starts the idle evictor if eviction is enabled and it is not running yet.
    ///
    /// Does nothing after [`shutdown`](Self::shutdown).
    pub fn ensure_evictor(self: &Arc<Self>) {
        if !self.is_running() {
            return;
        }
        if let Some(evictor) = &self.evictor {
            evictor.start(Arc::downgrade(self));
        }
    }

    /// Returns true while the idle evictor is scanning.
    pub fn is_evicting(&self) -> bool {
        self.evictor.as_ref().is_some_and(IdleEvictor::is_running)
    }

    /// Records activity for a session.
    pub fn touch(&self, id: SessionId) -> bool {
        let sessions = self.sessions.read();
        match sessions.get(&id) {
            Some(entry) => {
                entry.handle.touch();
                true
            }
            None => false,
        }
    }

    /// Last inbound activity of a session.
    pub fn last_activity(&self, id: SessionId) -> Option<DateTime<Utc>> {
        self.sessions
            .read()
            .get(&id)
            .map(|entry| entry.handle.activity().last_activity())
    }

    /// Closes every session idle for longer than `timeout`. Returns how many.
    pub fn evict_idle(&self, timeout: Duration) -> usize {
        let idle: Vec<(SessionId, Duration, Arc<dyn Connection>)> = {
            let sessions = self.sessions.read();
            sessions
                .iter()
                .filter_map(|(id, entry)| {
                    let idle = entry.handle.idle_time();
                    (idle > timeout).then(|| (*id, idle, entry.connection.clone()))
                })
                .collect()
        };

        for (id, idle, connection) in &idle {
            info!(
                session_id = %id,
                transport = %self.transport,
                idle_ms = idle.as_millis() as u64,
                timeout_ms = timeout.as_millis() as u64,
                "Closing idle session"
            );
            connection.close();
        }
        idle.len()
    }

    /// Closes one session. Returns false if it is not in the table.
    pub fn close_session(&self, id: SessionId) -> bool {
        let connection = self
            .sessions
            .read()
            .get(&id)
            .map(|entry| entry.connection.clone());
        match connection {
            Some(connection) => {
                info!(session_id = %id, transport = %self.transport, "Closing session");
                connection.close();
                true
            }
            None => false,
        }
    }

    /// Snapshots of every session.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .values()
            .map(|entry| entry.handle.info())
            .collect()
    }

    /// Snapshot of one session.
    pub fn session(&self, id: SessionId) -> Option<SessionInfo> {
        self.sessions.read().get(&id).map(|entry| entry.handle.info())
    }

    /// Number of sessions in the table.
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Returns true until [`shutdown`](Self::shutdown) is called.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stops admitting sessions, stops eviction and closes every session.
    ///
    /// Waits up to `timeout` for sessions to leave the table. Sessions still
    /// present after that are dropped from the table and their capacity is
    /// released; the return value is how many.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        info!(
            transport = %self.transport,
            timeout_secs = timeout.as_secs(),
            "Initiating graceful session shutdown"
        );
        self.running.store(false, Ordering::Release);
        if let Some(evictor) = &self.evictor {
            evictor.stop();
        }

        let connections: Vec<Arc<dyn Connection>> = self
            .sessions
            .read()
            .values()
            .map(|entry| entry.connection.clone())
            .collect();
        info!(
            transport = %self.transport,
            session_count = connections.len(),
            "Closing all sessions"
        );
        for connection in connections {
            connection.close();
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let check_interval = Duration::from_millis(100);
        loop {
            let remaining = self.session_count();
            if remaining == 0 {
                info!(transport = %self.transport, "All sessions closed gracefully");
                return 0;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    transport = %self.transport,
                    remaining_sessions = remaining,
                    "Timeout waiting for sessions to close"
                );
                let stragglers: Vec<SessionEntry> = self
                    .sessions
                    .write()
                    .drain()
                    .map(|(_, entry)| entry)
                    .collect();
                for entry in &stragglers {
                    entry.connection.close();
                    entry.handle.release_permit();
                }
                return stragglers.len();
            }
            tokio::time::sleep(check_interval).await;
        }
    }
}

impl TransportSessionInfo for SessionManager {
    fn transport_name(&self) -> &str {
        self.transport.as_str()
    }

    fn active_sessions(&self) -> usize {
        usize::try_from(self.limiter.active()).unwrap_or(0)
    }

    fn max_sessions(&self) -> i64 {
        self.limiter.max_or_unbounded()
    }

    fn is_running(&self) -> bool {
        SessionManager::is_running(self)
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("transport", &self.transport)
            .field("limiter", &self.limiter)
            .field("sessions", &self.session_count())
            .finish()
    }
}
