//! Read-only view of transport session state for health checks and dashboards.

use serde::Serialize;

/// Session counters of one transport.
pub trait TransportSessionInfo: Send + Sync {
    /// Transport name, e.g. `"ssh"`.
    fn transport_name(&self) -> &str;

    /// Sessions currently admitted.
    fn active_sessions(&self) -> usize;

    /// Configured maximum, or `-1` when unbounded.
    fn max_sessions(&self) -> i64;

    /// Whether the transport accepts new sessions.
    fn is_running(&self) -> bool;

    /// Point-in-time snapshot.
    fn status(&self) -> TransportStatus {
        TransportStatus {
            transport: self.transport_name().to_string(),
            active_sessions: self.active_sessions(),
            max_sessions: self.max_sessions(),
            running: self.is_running(),
        }
    }
}

/// Snapshot returned by [`TransportSessionInfo::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportStatus {
    /// Transport name.
    pub transport: String,
    /// Sessions currently admitted.
    pub active_sessions: usize,
    /// Configured maximum, or `-1` when unbounded.
    pub max_sessions: i64,
    /// Whether new sessions are accepted.
    pub running: bool,
}

impl TransportStatus {
    /// Returns true if no further session would be admitted.
    pub fn is_full(&self) -> bool {
        self.max_sessions > 0 && self.active_sessions as i64 >= self.max_sessions
    }
}

impl std::fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = if self.running { "running" } else { "stopped" };
        if self.max_sessions > 0 {
            write!(
                f,
                "{}: {}/{} sessions ({state})",
                self.transport, self.active_sessions, self.max_sessions
            )
        } else {
            write!(
                f,
                "{}: {} sessions, unbounded ({state})",
                self.transport, self.active_sessions
            )
        }
    }
}

/// Snapshots of several transports.
pub fn summarize<'a, I>(transports: I) -> Vec<TransportStatus>
where
    I: IntoIterator<Item = &'a dyn TransportSessionInfo>,
{
    transports.into_iter().map(|t| t.status()).collect()
}
