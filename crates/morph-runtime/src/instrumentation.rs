//! Instrumentation: frame deoptimization and breakpoints

use crate::method::MethodId;
use crate::thread::{Frame, ThreadId, ThreadList};
use std::ops::ControlFlow;

/// A breakpoint set by an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Breakpoint {
    /// Method holding the breakpoint
    pub method: MethodId,
    /// Instruction offset
    pub dex_pc: u32,
}

/// Every installed breakpoint
#[derive(Debug, Default)]
pub struct BreakpointTable {
    entries: Vec<Breakpoint>,
}

impl BreakpointTable {
    /// Install a breakpoint; returns `false` if it was already set
    pub fn set(&mut self, breakpoint: Breakpoint) -> bool {
        if self.entries.contains(&breakpoint) {
            return false;
        }
        self.entries.push(breakpoint);
        true
    }

    /// Remove a breakpoint; returns `false` if it was not set
    pub fn clear(&mut self, breakpoint: Breakpoint) -> bool {
        let before = self.entries.len();
        self.entries.retain(|b| *b != breakpoint);
        before != self.entries.len()
    }

    /// Remove every breakpoint in `methods`, returning how many were removed
    pub fn remove_for_methods(&mut self, methods: &[MethodId]) -> usize {
        let before = self.entries.len();
        self.entries.retain(|b| !methods.contains(&b.method));
        before - self.entries.len()
    }

    /// Installed breakpoints
    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.entries.iter()
    }

    /// Number of installed breakpoints
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no breakpoint is installed
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Instrumentation state
#[derive(Debug, Default)]
pub struct Instrumentation {
    /// Installed breakpoints
    pub breakpoints: BreakpointTable,
    deoptimizations: u64,
}

impl Instrumentation {
    /// Force every frame on every stack to leave compiled code
    pub fn deoptimize_all_thread_frames(&mut self, threads: &mut ThreadList) {
        let mut marked = 0usize;
        threads.walk_all_stacks(&mut |_: ThreadId, frame: &mut Frame| {
            frame.should_deoptimize = true;
            marked += 1;
            ControlFlow::Continue(())
        });
        self.deoptimizations += 1;
        log::trace!("deoptimized {marked} frames");
    }

    /// Number of full deoptimizations performed
    pub fn deoptimization_count(&self) -> u64 {
        self.deoptimizations
    }
}
