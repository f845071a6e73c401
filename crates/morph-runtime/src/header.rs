//! Object header
//!
//! Every heap object carries a header with its class pointer, the lock word
//! used for monitors, and GC bookkeeping.

use crate::heap::ObjectRef;
use crate::thread::ThreadId;

/// Monitor state of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockWord {
    /// No owner
    #[default]
    Unlocked,
    /// Held by a thread, possibly recursively
    Locked {
        /// Owning thread
        owner: ThreadId,
        /// Recursion count (at least 1)
        count: u32,
    },
}

impl LockWord {
    /// Owner of the monitor, if held
    pub fn owner(&self) -> Option<ThreadId> {
        match self {
            LockWord::Unlocked => None,
            LockWord::Locked { owner, .. } => Some(*owner),
        }
    }
}

/// Header stored with each heap object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    /// Class of the object
    pub class: ObjectRef,
    /// Monitor state
    pub lock: LockWord,
    /// Identity hash code, assigned at allocation
    pub hash_code: u32,
    /// Mark bit for GC
    marked: bool,
}

impl ObjectHeader {
    /// Create a header for a fresh object
    pub fn new(class: ObjectRef, hash_code: u32) -> Self {
        Self {
            class,
            lock: LockWord::Unlocked,
            hash_code,
            marked: false,
        }
    }

    /// Check if this object is marked
    #[inline]
    pub fn is_marked(&self) -> bool {
        self.marked
    }

    /// Mark this object as reachable
    #[inline]
    pub fn mark(&mut self) {
        self.marked = true;
    }

    /// Unmark this object (for next GC cycle)
    #[inline]
    pub fn unmark(&mut self) {
        self.marked = false;
    }
}
