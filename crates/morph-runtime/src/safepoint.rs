//! Safepoint infrastructure for stop-the-world pauses
//!
//! Mutator threads hold shared access to the heap through the mutator lock
//! while they run. A stop-the-world request raises a pending flag and then
//! takes the lock exclusively; it is granted once every mutator has reached a
//! safepoint and released its shared access.
//!
//! ## Poll locations
//!
//! Mutators poll with [`SafepointCoordinator::is_pause_pending`] at loop
//! back-edges, calls and allocations, and release their access when a pause
//! is pending (see `ScopedObjectAccess::poll`).

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

/// Reasons for requesting a safepoint pause
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Garbage collection
    GarbageCollection,
    /// Class redefinition commit
    Redefinition,
    /// Debugger or agent inspection
    Debug,
}

/// Statistics tracking for safepoint operations
#[derive(Debug, Default)]
pub struct SafepointStats {
    total_safepoints: AtomicUsize,
    total_pause_time_us: AtomicUsize,
    max_pause_time_us: AtomicUsize,
}

impl SafepointStats {
    /// Total number of completed pauses
    pub fn total_safepoints(&self) -> usize {
        self.total_safepoints.load(Ordering::Relaxed)
    }

    /// Total time spent paused (microseconds)
    pub fn total_pause_time_us(&self) -> usize {
        self.total_pause_time_us.load(Ordering::Relaxed)
    }

    /// Longest pause (microseconds)
    pub fn max_pause_time_us(&self) -> usize {
        self.max_pause_time_us.load(Ordering::Relaxed)
    }

    fn record(&self, elapsed_us: usize) {
        self.total_pause_time_us
            .fetch_add(elapsed_us, Ordering::Relaxed);
        self.total_safepoints.fetch_add(1, Ordering::Relaxed);
        self.max_pause_time_us
            .fetch_max(elapsed_us, Ordering::Relaxed);
    }
}

/// Coordinates stop-the-world pauses across all mutator threads
#[derive(Debug, Default)]
pub struct SafepointCoordinator {
    /// Shared by running mutators, exclusive while the world is stopped
    mutator_lock: RwLock<()>,

    /// A pause has been requested and not yet released
    pause_pending: AtomicBool,

    /// Current pause reason
    current_reason: Mutex<Option<StopReason>>,

    /// Statistics
    stats: SafepointStats,
}

/// Exclusive hold on the mutator lock; the world resumes when dropped
pub struct StoppedWorld<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
    coordinator: &'a SafepointCoordinator,
    reason: StopReason,
    started: Instant,
}

impl SafepointCoordinator {
    /// Create a coordinator with no pause pending
    pub fn new() -> Self {
        Self::default()
    }

    /// Fast check for a pending pause (single atomic load)
    #[inline(always)]
    pub fn is_pause_pending(&self) -> bool {
        self.pause_pending.load(Ordering::Acquire)
    }

    /// Current pause reason, if the world is stopped or stopping
    pub fn current_reason(&self) -> Option<StopReason> {
        *self.current_reason.lock()
    }

    /// Statistics
    pub fn stats(&self) -> &SafepointStats {
        &self.stats
    }

    /// Acquire shared mutator access
    pub fn shared_access(&self) -> RwLockReadGuard<'_, ()> {
        self.mutator_lock.read()
    }

    /// Release shared access until any pending pause completes
    pub fn yield_for_pause(&self, guard: &mut RwLockReadGuard<'_, ()>) {
        if self.is_pause_pending() {
            RwLockReadGuard::unlocked_fair(guard, || {});
        }
    }

    /// Stop every mutator and take exclusive access
    ///
    /// Blocks until every thread holding shared access has released it.
    /// Must not be called while the caller itself holds shared access.
    pub fn stop_the_world(&self, reason: StopReason) -> StoppedWorld<'_> {
        let started = Instant::now();
        self.pause_pending.store(true, Ordering::Release);
        let guard = self.mutator_lock.write();
        *self.current_reason.lock() = Some(reason);
        log::trace!("world stopped ({reason:?})");
        StoppedWorld {
            _guard: guard,
            coordinator: self,
            reason,
            started,
        }
    }

    /// Whether the world is currently stopped
    pub fn is_world_stopped(&self) -> bool {
        self.mutator_lock.is_locked_exclusive()
    }
}

impl StoppedWorld<'_> {
    /// Why the world was stopped
    pub fn reason(&self) -> StopReason {
        self.reason
    }
}

impl Drop for StoppedWorld<'_> {
    fn drop(&mut self) {
        *self.coordinator.current_reason.lock() = None;
        self.coordinator
            .pause_pending
            .store(false, Ordering::Release);
        let elapsed = self.started.elapsed().as_micros() as usize;
        self.coordinator.stats.record(elapsed);
        log::trace!("world resumed ({:?}, {elapsed}us)", self.reason);
    }
}
