//! Idle session eviction.

use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::manager::SessionManager;
use crate::TransportKind;

/// Shortest interval between idle scans.
pub const MIN_SCAN_INTERVAL: Duration = Duration::from_millis(500);

/// Interval between scans for a given idle timeout: half the timeout, at least 500ms.
pub fn scan_interval(timeout: Duration) -> Duration {
    (timeout / 2).max(MIN_SCAN_INTERVAL)
}

/// Periodic scanner that closes a transport's idle sessions.
///
/// Started lazily by the first admitted session and stopped for good when
/// the transport shuts down. The scan task holds only a weak reference to its
/// manager and exits once the manager is gone.
#[derive(Debug)]
pub struct IdleEvictor {
    transport: TransportKind,
    timeout: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl IdleEvictor {
    /// Creates a stopped evictor.
    pub fn new(transport: TransportKind, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            task: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Idle timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Starts scanning unless already started or stopped. Requires a tokio runtime.
    pub fn start(&self, manager: Weak<SessionManager>) {
        let mut task = self.task.lock();
        if task.is_some() || self.stopped.load(Ordering::Acquire) {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                transport = %self.transport,
                "No async runtime, idle eviction disabled"
            );
            return;
        };

        let timeout = self.timeout;
        let period = scan_interval(timeout);
        let transport = self.transport;
        *task = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.evict_idle(timeout);
            }
            debug!(transport = %transport, "Idle evictor finished");
        }));

        debug!(
            transport = %self.transport,
            timeout_ms = timeout.as_millis() as u64,
            interval_ms = period.as_millis() as u64,
            "Idle evictor started"
        );
    }

    /// Stops scanning. Later calls to [`start`](Self::start) do nothing.
    pub fn stop(&self) {
        let mut task = self.task.lock();
        self.stopped.store(true, Ordering::Release);
        if let Some(task) = task.take() {
            task.abort();
            debug!(transport = %self.transport, "Idle evictor stopped");
        }
    }

    /// Returns true while the scan task is alive.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for IdleEvictor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_interval() {
        assert_eq!(scan_interval(Duration::from_secs(2)), Duration::from_secs(1));
        assert_eq!(scan_interval(Duration::from_millis(600)), MIN_SCAN_INTERVAL);
        assert_eq!(scan_interval(Duration::from_secs(600)), Duration::from_secs(300));
    }

    #[test]
    fn test_start_without_runtime_is_noop() {
        let evictor = IdleEvictor::new(TransportKind::Ssh, Duration::from_secs(1));
        evictor.start(Weak::new());
        assert!(!evictor.is_running());
    }

    #[tokio::test]
    async fn test_evictor_exits_when_manager_gone() {
        let evictor = IdleEvictor::new(TransportKind::Local, Duration::from_millis(100));
        evictor.start(Weak::new());
        assert!(evictor.is_running());

        tokio::time::sleep(MIN_SCAN_INTERVAL + Duration::from_millis(200)).await;
        assert!(!evictor.is_running());
    }

    #[tokio::test]
    async fn test_evictor_stop() {
        let evictor = IdleEvictor::new(TransportKind::Local, Duration::from_secs(10));
        evictor.start(Weak::new());
        evictor.stop();
        assert!(!evictor.is_running());

        evictor.start(Weak::new());
        assert!(!evictor.is_running());
    }
}
