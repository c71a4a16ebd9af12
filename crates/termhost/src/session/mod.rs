//! Session lifecycle: admission, activity tracking, idle eviction and
//! lifecycle notification.
//!
//! Each transport owns one [`SessionManager`]. A [`SessionRunner`] pairs that
//! manager with the shared [`SessionHost`] and drives every accepted
//! connection from admission to its single `closed` event.

mod activity;
mod capacity;
mod events;
mod handle;
mod idle;
mod manager;
mod runner;

pub use activity::ActivityTracker;
pub use capacity::{CapacityLimiter, CapacityPermit};
pub use events::{
    DEFAULT_EVENT_LOG_CAPACITY, LifecycleNotifier, SessionEvent, SessionEventKind,
    SessionEventLog, SessionObserver,
};
pub use handle::{SessionHandle, SessionId, SessionInfo};
pub use idle::{IdleEvictor, MIN_SCAN_INTERVAL, scan_interval};
pub use manager::{Refusal, SessionManager};
pub use runner::{SessionHost, SessionHostBuilder, SessionOutcome, SessionRunner, TrackedConnection};
