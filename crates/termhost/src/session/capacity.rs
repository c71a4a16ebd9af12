//! Session capacity limits.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug)]
struct CapacityState {
    active: AtomicI64,
    max: i64,
}

/// Bounds the number of concurrent sessions of one transport.
///
/// Admission is a compare-and-swap loop on a shared counter, so unrelated
/// admits never serialize on a lock. A successful admit returns a
/// [`CapacityPermit`]; dropping the permit releases the slot, which makes
/// "one release per admit" a property of ownership.
#[derive(Clone)]
pub struct CapacityLimiter {
    state: Arc<CapacityState>,
}

impl CapacityLimiter {
    /// Creates a limiter. `max <= 0` means unbounded.
    pub fn new(max: i64) -> Self {
        Self {
            state: Arc::new(CapacityState {
                active: AtomicI64::new(0),
                max,
            }),
        }
    }

    /// Creates an unbounded limiter. It still counts active sessions.
    pub fn unbounded() -> Self {
        Self::new(0)
    }

    /// Admits a session if below the bound.
    pub fn try_admit(&self) -> Option<CapacityPermit> {
        let max = self.state.max;
        let mut current = self.state.active.load(Ordering::Acquire);
        loop {
            if max > 0 && current >= max {
                return None;
            }
            match self.state.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(CapacityPermit {
                        state: self.state.clone(),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Number of admitted sessions not yet released.
    pub fn active(&self) -> i64 {
        self.state.active.load(Ordering::Acquire)
    }

    /// The bound, or `None` when unbounded.
    pub fn max(&self) -> Option<i64> {
        (self.state.max > 0).then_some(self.state.max)
    }

    /// The bound, or `-1` when unbounded.
    pub fn max_or_unbounded(&self) -> i64 {
        self.max().unwrap_or(-1)
    }

    /// Returns true if the bound is reached.
    pub fn is_full(&self) -> bool {
        self.max().is_some_and(|max| self.active() >= max)
    }
}

impl fmt::Debug for CapacityLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapacityLimiter")
            .field("active", &self.active())
            .field("max", &self.max_or_unbounded())
            .finish()
    }
}

/// One admitted session's slot. Released on drop.
pub struct CapacityPermit {
    state: Arc<CapacityState>,
}

impl Drop for CapacityPermit {
    fn drop(&mut self) {
        self.state.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for CapacityPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapacityPermit").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicI64;

    #[test]
    fn test_capacity_bound() {
        let limiter = CapacityLimiter::new(2);
        let a = limiter.try_admit();
        let b = limiter.try_admit();
        assert!(a.is_some() && b.is_some());
        assert!(limiter.is_full());
        assert!(limiter.try_admit().is_none());

        drop(a);
        assert_eq!(limiter.active(), 1);
        assert!(limiter.try_admit().is_some());
        assert_eq!(limiter.active(), 1);
    }

    #[test]
    fn test_capacity_unbounded_counts() {
        for max in [0, -1] {
            let limiter = CapacityLimiter::new(max);
            let permits: Vec<_> = (0..50).filter_map(|_| limiter.try_admit()).collect();
            assert_eq!(permits.len(), 50);
            assert_eq!(limiter.active(), 50);
            assert_eq!(limiter.max(), None);
            assert_eq!(limiter.max_or_unbounded(), -1);
            assert!(!limiter.is_full());
            drop(permits);
            assert_eq!(limiter.active(), 0);
        }
    }

    #[test]
    fn test_capacity_never_exceeded_under_contention() {
        const THREADS: usize = 16;
        let limiter = CapacityLimiter::new(3);
        let peak = Arc::new(AtomicI64::new(0));
        let barrier = Arc::new(Barrier::new(THREADS));

        let threads: Vec<_> = (0..THREADS)
            .map(|_| {
                let limiter = limiter.clone();
                let peak = peak.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    let mut admitted = 0;
                    for _ in 0..2_000 {
                        if let Some(permit) = limiter.try_admit() {
                            admitted += 1;
                            peak.fetch_max(limiter.active(), Ordering::SeqCst);
                            drop(permit);
                        }
                    }
                    admitted
                })
            })
            .collect();

        let admitted: usize = threads.into_iter().map(|t| t.join().unwrap()).sum();
        assert!(admitted > 0);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(limiter.active(), 0);
    }
}
