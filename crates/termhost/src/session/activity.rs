//! Last-activity tracking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Records when a session last received inbound data.
///
/// The timestamp is stored as a millisecond offset from the session start
/// and only ever moves forward, so concurrent touches and the idle scan never
/// observe it going backwards. Reading it never updates it.
#[derive(Debug)]
pub struct ActivityTracker {
    origin: Instant,
    opened_at: DateTime<Utc>,
    last_offset_ms: AtomicU64,
}

impl ActivityTracker {
    /// Creates a tracker whose last activity is now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            opened_at: Utc::now(),
            last_offset_ms: AtomicU64::new(0),
        }
    }

    /// Records activity at the current time.
    pub fn touch(&self) {
        let elapsed = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_offset_ms.fetch_max(elapsed, Ordering::AcqRel);
    }

    /// Time since the last recorded activity.
    pub fn idle_time(&self) -> Duration {
        let last = Duration::from_millis(self.last_offset_ms.load(Ordering::Acquire));
        self.origin.elapsed().saturating_sub(last)
    }

    /// Wall-clock time of the last recorded activity.
    pub fn last_activity(&self) -> DateTime<Utc> {
        let offset = self.last_offset_ms.load(Ordering::Acquire);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        self.opened_at + chrono::Duration::milliseconds(offset)
    }

    /// Wall-clock time the tracker was created.
    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Time since the tracker was created.
    pub fn age(&self) -> Duration {
        self.origin.elapsed()
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_activity_tracker_touch_resets_idle() {
        let tracker = ActivityTracker::new();
        assert!(tracker.idle_time() < Duration::from_millis(100));

        std::thread::sleep(Duration::from_millis(60));
        assert!(tracker.idle_time() >= Duration::from_millis(50));

        tracker.touch();
        assert!(tracker.idle_time() < Duration::from_millis(30));
    }

    #[test]
    fn test_activity_tracker_reads_do_not_touch() {
        let tracker = ActivityTracker::new();
        std::thread::sleep(Duration::from_millis(30));
        let before = tracker.last_activity();
        let _ = tracker.idle_time();
        let _ = tracker.idle_time();
        assert_eq!(tracker.last_activity(), before);
    }

    #[test]
    fn test_activity_tracker_monotonic_under_contention() {
        let tracker = Arc::new(ActivityTracker::new());
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    let mut previous = tracker.last_activity();
                    for _ in 0..500 {
                        tracker.touch();
                        let current = tracker.last_activity();
                        assert!(current >= previous);
                        previous = current;
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert!(tracker.last_activity() >= tracker.opened_at());
    }
}
