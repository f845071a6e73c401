//! Thread gates
//!
//! A gate holds every thread except its owner at an entry point while it is
//! paused. The class-load gate guards class definition and also tracks the
//! definitions in progress, so a pausing thread can wait for them to drain.
//! The allocation gate guards the allocator.

use crate::thread::ThreadId;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

#[derive(Debug, Default)]
struct GateState {
    paused_by: Option<ThreadId>,
    pause_depth: u32,
    in_progress: FxHashMap<ThreadId, u32>,
}

impl GateState {
    fn blocks(&self, thread: ThreadId) -> bool {
        matches!(self.paused_by, Some(owner) if owner != thread)
    }

    fn active_others(&self, thread: ThreadId) -> usize {
        self.in_progress
            .iter()
            .filter(|(t, n)| **t != thread && **n > 0)
            .count()
    }
}

/// Gate held around class definition
#[derive(Debug, Default)]
pub struct ClassLoadGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl ClassLoadGate {
    /// Create an open gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter class definition, waiting while another thread holds the gate
    pub fn enter(&self, thread: ThreadId) {
        let mut state = self.state.lock();
        while state.blocks(thread) {
            self.changed.wait(&mut state);
        }
        *state.in_progress.entry(thread).or_insert(0) += 1;
    }

    /// Leave class definition
    pub fn exit(&self, thread: ThreadId) {
        let mut state = self.state.lock();
        if let Some(count) = state.in_progress.get_mut(&thread) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.in_progress.remove(&thread);
            }
        }
        self.changed.notify_all();
    }

    /// Pause class definition for every other thread
    ///
    /// Waits until definitions already in progress on other threads finish.
    pub fn pause(&self, thread: ThreadId) {
        let mut state = self.state.lock();
        while state.blocks(thread) {
            self.changed.wait(&mut state);
        }
        state.paused_by = Some(thread);
        state.pause_depth += 1;
        while state.active_others(thread) > 0 {
            self.changed.wait(&mut state);
        }
        log::debug!("class loading paused by {thread}");
    }

    /// Undo one [`pause`](Self::pause)
    pub fn resume(&self, thread: ThreadId) {
        let mut state = self.state.lock();
        if state.paused_by == Some(thread) {
            state.pause_depth -= 1;
            if state.pause_depth == 0 {
                state.paused_by = None;
                log::debug!("class loading resumed by {thread}");
            }
        }
        self.changed.notify_all();
    }

    /// Thread holding the gate, if paused
    pub fn paused_by(&self) -> Option<ThreadId> {
        self.state.lock().paused_by
    }

    /// Number of definitions in progress
    pub fn in_progress(&self) -> usize {
        self.state.lock().in_progress.values().map(|n| *n as usize).sum()
    }
}

/// Gate held around object allocation
#[derive(Debug, Default)]
pub struct AllocationGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl AllocationGate {
    /// Create an open gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `thread` may allocate
    pub fn wait_until_allowed(&self, thread: ThreadId) {
        let mut state = self.state.lock();
        while state.blocks(thread) {
            self.changed.wait(&mut state);
        }
    }

    /// Whether `thread` may allocate right now
    pub fn is_allowed(&self, thread: ThreadId) -> bool {
        !self.state.lock().blocks(thread)
    }

    /// Pause allocation for every thread except `thread`
    pub fn pause(&self, thread: ThreadId) {
        let mut state = self.state.lock();
        while state.blocks(thread) {
            self.changed.wait(&mut state);
        }
        state.paused_by = Some(thread);
        state.pause_depth += 1;
        log::debug!("allocation paused by {thread}");
    }

    /// Undo one [`pause`](Self::pause)
    pub fn resume(&self, thread: ThreadId) {
        let mut state = self.state.lock();
        if state.paused_by == Some(thread) {
            state.pause_depth -= 1;
            if state.pause_depth == 0 {
                state.paused_by = None;
                log::debug!("allocation resumed by {thread}");
            }
        }
        self.changed.notify_all();
    }
}
