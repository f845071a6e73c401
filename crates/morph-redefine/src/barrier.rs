//! Scoped runtime pauses held around a redefinition
//!
//! Every guard undoes its pause on drop. Guards that touch the runtime state
//! lock it themselves, so none of them may be dropped while the caller holds
//! the state lock.

use morph_runtime::gate::{AllocationGate, ClassLoadGate};
use morph_runtime::{GlobalRef, ObjectRef, Runtime, RuntimeState, ThreadId};
use rustc_hash::FxHashMap;

/// Holds every other thread out of class definition
pub struct ClassLoadPause<'a> {
    gate: &'a ClassLoadGate,
    thread: ThreadId,
}

impl<'a> ClassLoadPause<'a> {
    /// Pause class definition, waiting for definitions already in progress
    pub fn new(gate: &'a ClassLoadGate, thread: ThreadId) -> Self {
        gate.pause(thread);
        Self { gate, thread }
    }
}

impl Drop for ClassLoadPause<'_> {
    fn drop(&mut self) {
        self.gate.resume(self.thread);
    }
}

/// Holds every other thread out of the allocator
pub struct AllocationPause<'a> {
    gate: &'a AllocationGate,
    thread: ThreadId,
}

impl<'a> AllocationPause<'a> {
    /// Pause allocation for every thread but `thread`
    pub fn new(gate: &'a AllocationGate, thread: ThreadId) -> Self {
        gate.pause(thread);
        Self { gate, thread }
    }
}

impl Drop for AllocationPause<'_> {
    fn drop(&mut self) {
        self.gate.resume(self.thread);
    }
}

/// Keeps the JIT from installing code
pub struct JitSuspension<'a> {
    runtime: &'a Runtime,
}

impl<'a> JitSuspension<'a> {
    /// Suspend compilation
    pub fn new(runtime: &'a Runtime) -> Self {
        runtime.lock_state().code_cache.suspend();
        Self { runtime }
    }
}

impl Drop for JitSuspension<'_> {
    fn drop(&mut self) {
        self.runtime.lock_state().code_cache.resume();
    }
}

/// Keeps the collector from running
pub struct GcDisabled<'a> {
    runtime: &'a Runtime,
}

impl<'a> GcDisabled<'a> {
    /// Disable collection
    pub fn new(runtime: &'a Runtime) -> Self {
        runtime.lock_state().gc.disable();
        Self { runtime }
    }
}

impl Drop for GcDisabled<'_> {
    fn drop(&mut self) {
        self.runtime.lock_state().gc.enable();
    }
}

/// Global references keeping private allocations alive until the commit
pub struct TemporaryRoots<'a> {
    runtime: &'a Runtime,
    handles: Vec<GlobalRef>,
}

impl<'a> TemporaryRoots<'a> {
    /// Create an empty root set
    pub fn new(runtime: &'a Runtime) -> Self {
        Self {
            runtime,
            handles: Vec::new(),
        }
    }

    /// Root `obj` until this set is dropped
    pub fn root(&mut self, state: &mut RuntimeState, obj: ObjectRef) {
        self.handles.push(state.globals.add(obj));
    }

    /// Number of rooted objects
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether nothing is rooted
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Drop for TemporaryRoots<'_> {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        let mut state = self.runtime.lock_state();
        for handle in self.handles.drain(..) {
            state.globals.delete(handle);
        }
    }
}

/// Class monitors held for the duration of a batch
///
/// The monitors are taken before any heap access and released last. A
/// class replaced by a structural commit hands its lock word to the new
/// class object; [`retarget`](Self::retarget) follows it there.
pub struct HeldMonitors<'a> {
    runtime: &'a Runtime,
    thread: ThreadId,
    objects: Vec<ObjectRef>,
}

impl<'a> HeldMonitors<'a> {
    /// Enter the monitor of each object
    ///
    /// Monitors are entered in ascending reference order, whatever the
    /// order of `objects`, so that overlapping batches cannot deadlock.
    pub fn acquire(runtime: &'a Runtime, thread: ThreadId, objects: &[ObjectRef]) -> Self {
        let mut ordered = objects.to_vec();
        ordered.sort_unstable();
        ordered.dedup();
        let held = ordered
            .into_iter()
            .filter(|obj| runtime.monitor_enter(thread, *obj))
            .collect();
        Self {
            runtime,
            thread,
            objects: held,
        }
    }

    /// Follow objects that were replaced
    pub fn retarget(&mut self, map: &FxHashMap<ObjectRef, ObjectRef>) {
        for obj in &mut self.objects {
            if let Some(new) = map.get(obj) {
                *obj = *new;
            }
        }
    }

    /// Objects whose monitors are held
    pub fn objects(&self) -> &[ObjectRef] {
        &self.objects
    }
}

impl Drop for HeldMonitors<'_> {
    fn drop(&mut self) {
        for obj in self.objects.iter().rev() {
            if !self.runtime.monitor_exit(self.thread, *obj) {
                log::warn!("monitor of {obj} was not held by {} at release", self.thread);
            }
        }
    }
}
