//! Global references
//!
//! A [`GlobalRef`] is a handle held outside the heap, by agents and native
//! code. The table is a root set: the collector keeps its targets alive and
//! reference replacement rewrites them.

use crate::heap::ObjectRef;

/// Handle to a global reference; `GlobalRef::NULL` refers to nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GlobalRef(u32);

impl GlobalRef {
    /// The null handle
    pub const NULL: GlobalRef = GlobalRef(0);

    /// Whether this is the null handle
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Table of global references
#[derive(Debug, Default)]
pub struct GlobalRefTable {
    slots: Vec<Option<ObjectRef>>,
}

impl GlobalRefTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a global reference to `obj`
    pub fn add(&mut self, obj: ObjectRef) -> GlobalRef {
        self.slots.push(Some(obj));
        GlobalRef(self.slots.len() as u32)
    }

    /// Object a handle refers to
    pub fn decode(&self, handle: GlobalRef) -> Option<ObjectRef> {
        if handle.is_null() {
            return None;
        }
        self.slots.get(handle.0 as usize - 1).copied().flatten()
    }

    /// Delete a global reference
    pub fn delete(&mut self, handle: GlobalRef) {
        if handle.is_null() {
            return;
        }
        if let Some(slot) = self.slots.get_mut(handle.0 as usize - 1) {
            *slot = None;
        }
    }

    /// Live targets
    pub fn iter(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.slots.iter().flatten().copied()
    }

    /// Rewrite targets
    pub fn remap(&mut self, f: &impl Fn(ObjectRef) -> Option<ObjectRef>) {
        for slot in self.slots.iter_mut().flatten() {
            if let Some(new) = f(*slot) {
                *slot = new;
            }
        }
    }
}
