//! Method and field metadata
//!
//! Methods and fields live outside the object heap in append-only arenas,
//! so a [`MethodId`] or [`FieldId`] stays valid for the life of the runtime.
//! That is what lets obsolete methods outlive the class generation that
//! declared them.

use crate::heap::ObjectRef;
use morph_classfile::access;

/// Handle to a method in the method arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(u32);

impl MethodId {
    /// Create an id from a raw arena index
    pub const fn from_raw(index: u32) -> Self {
        Self(index)
    }

    /// Raw arena index
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle to a field in the field arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(u32);

impl FieldId {
    /// Create an id from a raw arena index
    pub const fn from_raw(index: u32) -> Self {
        Self(index)
    }

    /// Raw arena index
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Runtime method flags
pub mod method_flags {
    /// Superseded by a redefinition
    pub const OBSOLETE: u32 = 1 << 0;
    /// Must never be compiled
    pub const DONT_COMPILE: u32 = 1 << 1;
    /// Verified: the interpreter may skip access checks
    pub const SKIP_ACCESS_CHECKS: u32 = 1 << 2;
    /// Interpreter must count monitor operations
    pub const MUST_COUNT_LOCKS: u32 = 1 << 3;
    /// Implemented by a runtime intrinsic
    pub const INTRINSIC: u32 = 1 << 4;
}

/// How a method is entered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryPoint {
    /// Interpreted from its code item
    #[default]
    Interpreter,
    /// Compiled code in the code cache
    Compiled,
    /// Registered native function
    Native,
}

/// Method metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    /// Declaring class
    pub declaring_class: ObjectRef,
    /// Method name
    pub name: String,
    /// Method signature
    pub signature: String,
    /// Class-file access flags
    pub access_flags: u32,
    /// Runtime flags, see [`method_flags`]
    pub runtime_flags: u32,
    /// Index of the method in its class definition
    pub method_index: usize,
    /// Entry point
    pub entry_point: EntryPoint,
    /// Address of the registered native implementation
    pub native_entry: Option<usize>,
}

impl Method {
    /// Whether a runtime flag is set
    #[inline]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.runtime_flags & flag != 0
    }

    /// Set a runtime flag
    #[inline]
    pub fn set_flag(&mut self, flag: u32) {
        self.runtime_flags |= flag;
    }

    /// Clear a runtime flag
    #[inline]
    pub fn clear_flag(&mut self, flag: u32) {
        self.runtime_flags &= !flag;
    }

    /// Whether the method is obsolete
    pub fn is_obsolete(&self) -> bool {
        self.has_flag(method_flags::OBSOLETE)
    }

    /// Whether the method is native
    pub fn is_native(&self) -> bool {
        self.access_flags & access::ACC_NATIVE != 0
    }

    /// Whether the method is static
    pub fn is_static(&self) -> bool {
        self.access_flags & access::ACC_STATIC != 0
    }

    /// Whether the method is directly dispatched
    pub fn is_direct(&self) -> bool {
        access::is_direct(self.access_flags)
    }

    /// Whether the method is a constructor
    pub fn is_constructor(&self) -> bool {
        self.access_flags & access::ACC_CONSTRUCTOR != 0
    }

    /// Whether the method has something to execute (not abstract)
    pub fn is_invokable(&self) -> bool {
        self.access_flags & access::ACC_ABSTRACT == 0
    }

    /// `name + signature`, for diagnostics
    pub fn pretty_name(&self) -> String {
        format!("{}{}", self.name, self.signature)
    }
}

/// Field metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Declaring class
    pub declaring_class: ObjectRef,
    /// Field name
    pub name: String,
    /// Type descriptor
    pub descriptor: String,
    /// Class-file access flags
    pub access_flags: u32,
    /// Slot in the instance field vector or the class statics
    pub offset: usize,
    /// Index of the field in its class definition
    pub field_index: usize,
}

impl Field {
    /// Whether the field is static
    pub fn is_static(&self) -> bool {
        self.access_flags & access::ACC_STATIC != 0
    }

    /// Whether the field is private
    pub fn is_private(&self) -> bool {
        self.access_flags & access::ACC_PRIVATE != 0
    }
}

/// Approximate native footprint of one method record
pub const METHOD_SIZE: usize = 48;

/// Append-only method storage
#[derive(Debug, Default)]
pub struct MethodArena {
    methods: Vec<Method>,
}

impl MethodArena {
    /// Create an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a method
    pub fn push(&mut self, method: Method) -> MethodId {
        self.methods.push(method);
        MethodId((self.methods.len() - 1) as u32)
    }

    /// Get a method
    pub fn get(&self, id: MethodId) -> Option<&Method> {
        self.methods.get(id.index())
    }

    /// Get a method mutably
    pub fn get_mut(&mut self, id: MethodId) -> Option<&mut Method> {
        self.methods.get_mut(id.index())
    }

    /// Number of stored methods
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether the arena is empty
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Append-only field storage
#[derive(Debug, Default)]
pub struct FieldArena {
    fields: Vec<Field>,
}

impl FieldArena {
    /// Create an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a field
    pub fn push(&mut self, field: Field) -> FieldId {
        self.fields.push(field);
        FieldId((self.fields.len() - 1) as u32)
    }

    /// Get a field
    pub fn get(&self, id: FieldId) -> Option<&Field> {
        self.fields.get(id.index())
    }

    /// Get a field mutably
    pub fn get_mut(&mut self, id: FieldId) -> Option<&mut Field> {
        self.fields.get_mut(id.index())
    }

    /// Number of stored fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the arena is empty
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(flags: u32) -> Method {
        Method {
            declaring_class: ObjectRef::from_raw(0),
            name: "run".to_string(),
            signature: "()V".to_string(),
            access_flags: flags,
            runtime_flags: 0,
            method_index: 0,
            entry_point: EntryPoint::Interpreter,
            native_entry: None,
        }
    }

    #[test]
    fn test_method_flags() {
        let mut m = method(access::ACC_PUBLIC);
        assert!(!m.is_obsolete());
        m.set_flag(method_flags::OBSOLETE | method_flags::DONT_COMPILE);
        assert!(m.is_obsolete());
        assert!(m.has_flag(method_flags::DONT_COMPILE));
        m.clear_flag(method_flags::DONT_COMPILE);
        assert!(!m.has_flag(method_flags::DONT_COMPILE));
        assert!(m.is_obsolete());
    }

    #[test]
    fn test_arena_ids_are_stable() {
        let mut arena = MethodArena::new();
        let a = arena.push(method(0));
        let b = arena.push(method(access::ACC_NATIVE));
        assert_ne!(a, b);
        assert!(arena.get(b).unwrap().is_native());
        assert_eq!(arena.len(), 2);
        assert!(arena.get(MethodId::from_raw(7)).is_none());
    }
}
