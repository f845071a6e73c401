//! Managed threads and their call stacks
//!
//! Each attached thread owns a stack of [`Frame`]s, innermost last. Stacks
//! are walked through the [`StackVisitor`] callback interface, innermost
//! frame first; a walk is finite and cannot be restarted midway.

use crate::method::MethodId;
use crate::value::Value;
use rustc_hash::FxHashMap;
use std::ops::ControlFlow;

/// Identifier of an attached thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u32);

impl ThreadId {
    /// Create an id from a raw value
    pub const fn from_raw(id: u32) -> Self {
        Self(id)
    }

    /// Raw value
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "thread-{}", self.0)
    }
}

/// One activation record
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Executing method
    pub method: MethodId,
    /// Current instruction offset
    pub dex_pc: u32,
    /// Register file
    pub registers: Vec<Value>,
    /// Frame was inlined into its caller by the compiler
    pub inlined: bool,
    /// Frame must leave compiled code at the next opportunity
    pub should_deoptimize: bool,
}

impl Frame {
    /// Create an interpreted frame
    pub fn new(method: MethodId, registers: Vec<Value>) -> Self {
        Self {
            method,
            dex_pc: 0,
            registers,
            inlined: false,
            should_deoptimize: false,
        }
    }

    /// Create a frame inlined into its caller
    pub fn inlined(method: MethodId) -> Self {
        Self {
            inlined: true,
            ..Self::new(method, Vec::new())
        }
    }
}

/// Per-thread cache the interpreter fills with resolved member ids,
/// keyed by instruction address
#[derive(Debug, Clone, Default)]
pub struct InterpreterCache {
    entries: FxHashMap<usize, usize>,
}

impl InterpreterCache {
    /// Store an entry
    pub fn set(&mut self, key: usize, value: usize) {
        self.entries.insert(key, value);
    }

    /// Look up an entry
    pub fn get(&self, key: usize) -> Option<usize> {
        self.entries.get(&key).copied()
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// An attached thread
#[derive(Debug)]
pub struct ManagedThread {
    id: ThreadId,
    name: String,
    frames: Vec<Frame>,
    /// Interpreter inline cache
    pub interpreter_cache: InterpreterCache,
}

impl ManagedThread {
    /// Thread id
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Frames, outermost first
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Frames, outermost first, mutably
    pub fn frames_mut(&mut self) -> &mut [Frame] {
        &mut self.frames
    }

    /// Push a frame
    pub fn push_frame(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Pop the innermost frame
    pub fn pop_frame(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    /// Innermost frame
    pub fn top_frame(&self) -> Option<&Frame> {
        self.frames.last()
    }
}

/// Callback invoked for each frame during a stack walk
pub trait StackVisitor {
    /// Visit one frame; `Break` ends the walk of this thread early
    fn visit_frame(&mut self, thread: ThreadId, frame: &mut Frame) -> ControlFlow<()>;
}

impl<F: FnMut(ThreadId, &mut Frame) -> ControlFlow<()>> StackVisitor for F {
    fn visit_frame(&mut self, thread: ThreadId, frame: &mut Frame) -> ControlFlow<()> {
        self(thread, frame)
    }
}

/// Every attached thread
#[derive(Debug, Default)]
pub struct ThreadList {
    threads: Vec<ManagedThread>,
    next_id: u32,
}

impl ThreadList {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new thread
    pub fn attach(&mut self, name: &str) -> ThreadId {
        self.next_id += 1;
        let id = ThreadId(self.next_id);
        self.threads.push(ManagedThread {
            id,
            name: name.to_string(),
            frames: Vec::new(),
            interpreter_cache: InterpreterCache::default(),
        });
        id
    }

    /// Detach a thread, returning whether it was attached
    pub fn detach(&mut self, id: ThreadId) -> bool {
        let before = self.threads.len();
        self.threads.retain(|t| t.id != id);
        before != self.threads.len()
    }

    /// Get a thread
    pub fn get(&self, id: ThreadId) -> Option<&ManagedThread> {
        self.threads.iter().find(|t| t.id == id)
    }

    /// Get a thread mutably
    pub fn get_mut(&mut self, id: ThreadId) -> Option<&mut ManagedThread> {
        self.threads.iter_mut().find(|t| t.id == id)
    }

    /// Iterate over threads
    pub fn iter(&self) -> impl Iterator<Item = &ManagedThread> {
        self.threads.iter()
    }

    /// Iterate over threads mutably
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ManagedThread> {
        self.threads.iter_mut()
    }

    /// Number of attached threads
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// Whether no thread is attached
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Walk one thread's stack, innermost frame first
    pub fn walk_stack(&mut self, id: ThreadId, visitor: &mut dyn StackVisitor) {
        if let Some(thread) = self.get_mut(id) {
            walk_frames(thread, visitor);
        }
    }

    /// Walk every thread's stack
    pub fn walk_all_stacks(&mut self, visitor: &mut dyn StackVisitor) {
        for thread in &mut self.threads {
            walk_frames(thread, visitor);
        }
    }
}

fn walk_frames(thread: &mut ManagedThread, visitor: &mut dyn StackVisitor) {
    let id = thread.id;
    for frame in thread.frames.iter_mut().rev() {
        if visitor.visit_frame(id, frame).is_break() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_and_detach() {
        let mut list = ThreadList::new();
        let a = list.attach("main");
        let b = list.attach("worker");
        assert_ne!(a, b);
        assert_eq!(list.len(), 2);
        assert_eq!(list.get(b).unwrap().name(), "worker");
        assert!(list.detach(a));
        assert!(!list.detach(a));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_walk_innermost_first() {
        let mut list = ThreadList::new();
        let t = list.attach("main");
        let thread = list.get_mut(t).unwrap();
        thread.push_frame(Frame::new(MethodId::from_raw(1), vec![]));
        thread.push_frame(Frame::new(MethodId::from_raw(2), vec![]));

        let mut seen = Vec::new();
        list.walk_stack(t, &mut |_: ThreadId, frame: &mut Frame| {
            seen.push(frame.method);
            ControlFlow::Continue(())
        });
        assert_eq!(seen, vec![MethodId::from_raw(2), MethodId::from_raw(1)]);
    }

    #[test]
    fn test_walk_can_stop_early_and_mutate() {
        let mut list = ThreadList::new();
        let t = list.attach("main");
        let thread = list.get_mut(t).unwrap();
        thread.push_frame(Frame::new(MethodId::from_raw(1), vec![]));
        thread.push_frame(Frame::new(MethodId::from_raw(2), vec![]));

        list.walk_all_stacks(&mut |_: ThreadId, frame: &mut Frame| {
            frame.should_deoptimize = true;
            ControlFlow::Break(())
        });
        let frames = list.get(t).unwrap().frames();
        assert!(!frames[0].should_deoptimize);
        assert!(frames[1].should_deoptimize);
    }

    #[test]
    fn test_interpreter_cache() {
        let mut cache = InterpreterCache::default();
        cache.set(0x10, 3);
        assert_eq!(cache.get(0x10), Some(3));
        cache.clear();
        assert!(cache.is_empty());
    }
}
