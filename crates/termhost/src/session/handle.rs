//! Session handle and info types.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::activity::ActivityTracker;
use super::capacity::CapacityPermit;
use crate::TransportKind;

/// Opaque unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Generates a new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// One admitted session.
///
/// Owned by the runner that admitted it; the session table and the idle
/// evictor hold shared references. The closed flag is set exactly once, by
/// whichever close path reaches [`try_begin_close`](Self::try_begin_close)
/// first.
pub struct SessionHandle {
    id: SessionId,
    transport: TransportKind,
    activity: Arc<ActivityTracker>,
    observed: bool,
    closed: AtomicBool,
    permit: Mutex<Option<CapacityPermit>>,
}

impl SessionHandle {
    /// Creates a handle holding the capacity permit of the session.
    pub fn new(transport: TransportKind, permit: CapacityPermit, observed: bool) -> Self {
        Self {
            id: SessionId::new(),
            transport,
            activity: Arc::new(ActivityTracker::new()),
            observed,
            closed: AtomicBool::new(false),
            permit: Mutex::new(Some(permit)),
        }
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Transport kind.
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Activity tracker shared with the connection wrapper.
    pub fn activity(&self) -> &Arc<ActivityTracker> {
        &self.activity
    }

    /// Records inbound activity.
    pub fn touch(&self) {
        self.activity.touch();
    }

    /// Time since the last inbound data.
    pub fn idle_time(&self) -> Duration {
        self.activity.idle_time()
    }

    /// Time since the session opened.
    pub fn duration(&self) -> Duration {
        self.activity.age()
    }

    /// Wall-clock open time.
    pub fn opened_at(&self) -> DateTime<Utc> {
        self.activity.opened_at()
    }

    /// Whether lifecycle observers were registered when the session opened.
    pub fn is_observed(&self) -> bool {
        self.observed
    }

    /// Claims the close. Returns true for the first caller only.
    pub fn try_begin_close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Returns true once the close was claimed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Releases the capacity slot. Returns false if already released.
    pub fn release_permit(&self) -> bool {
        self.permit.lock().take().is_some()
    }

    /// Creates a snapshot for external consumption.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            transport: self.transport,
            opened_at: self.opened_at(),
            last_activity: self.activity.last_activity(),
            duration: self.duration(),
            idle_time: self.idle_time(),
            closed: self.is_closed(),
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("transport", &self.transport)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Information about a session (snapshot for inspection/logging).
#[derive(Clone, Debug)]
pub struct SessionInfo {
    /// Session id.
    pub id: SessionId,
    /// Transport kind.
    pub transport: TransportKind,
    /// When the session opened.
    pub opened_at: DateTime<Utc>,
    /// When inbound data last arrived.
    pub last_activity: DateTime<Utc>,
    /// Total session duration.
    pub duration: Duration,
    /// Time since last activity.
    pub idle_time: Duration,
    /// Whether the close was claimed.
    pub closed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::capacity::CapacityLimiter;

    fn handle(limiter: &CapacityLimiter) -> SessionHandle {
        SessionHandle::new(TransportKind::Ssh, limiter.try_admit().unwrap(), false)
    }

    #[test]
    fn test_session_ids_are_unique() {
        assert_ne!(SessionId::new(), SessionId::new());
    }

    #[test]
    fn test_session_handle_close_claimed_once() {
        let limiter = CapacityLimiter::new(1);
        let session = handle(&limiter);
        assert!(!session.is_closed());
        assert!(session.try_begin_close());
        assert!(!session.try_begin_close());
        assert!(session.is_closed());
    }

    #[test]
    fn test_session_handle_releases_permit_once() {
        let limiter = CapacityLimiter::new(1);
        let session = handle(&limiter);
        assert_eq!(limiter.active(), 1);

        assert!(session.release_permit());
        assert!(!session.release_permit());
        assert_eq!(limiter.active(), 0);
    }

    #[test]
    fn test_session_handle_drop_releases_permit() {
        let limiter = CapacityLimiter::new(1);
        drop(handle(&limiter));
        assert_eq!(limiter.active(), 0);
    }

    #[test]
    fn test_session_info() {
        let limiter = CapacityLimiter::unbounded();
        let session = handle(&limiter);
        session.touch();

        let info = session.info();
        assert_eq!(info.id, session.id());
        assert_eq!(info.transport, TransportKind::Ssh);
        assert!(info.last_activity >= info.opened_at);
        assert!(info.idle_time < Duration::from_secs(1));
        assert!(!info.closed);
    }

    #[test]
    fn test_session_id_serializes_as_string() {
        let id = SessionId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }
}
