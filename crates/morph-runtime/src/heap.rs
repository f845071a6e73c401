//! Object heap
//!
//! Objects live in a slot table addressed by [`ObjectRef`]. Slots are never
//! reused, so a stale reference to a freed object reads as absent instead of
//! aliasing a newer object. Allocation is budgeted: with a maximum heap size
//! set, every allocation that would exceed it fails with
//! [`AllocError::OutOfMemory`].

use crate::class::ClassData;
use crate::header::ObjectHeader;
use crate::value::Value;
use rustc_hash::FxHashSet;
use thiserror::Error;

/// Size of an object header in bytes
pub const OBJECT_HEADER_SIZE: usize = 16;

/// Handle to a heap object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(u32);

impl ObjectRef {
    /// Create a reference from a raw slot index
    pub const fn from_raw(index: u32) -> Self {
        Self(index)
    }

    /// Raw slot index
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Allocation failure
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AllocError {
    /// Heap budget exhausted
    #[error("Out of memory: requested {requested} bytes with {allocated} of {limit} in use")]
    OutOfMemory {
        /// Bytes requested
        requested: usize,
        /// Bytes in use
        allocated: usize,
        /// Heap limit
        limit: usize,
    },

    /// The class handle does not name a class object
    #[error("{0} is not a class")]
    NotAClass(ObjectRef),
}

/// Payload of a heap object
#[derive(Debug, Clone)]
pub enum ObjectBody {
    /// Instance fields, indexed by field offset
    Instance(Vec<Value>),
    /// Array elements
    Array(Vec<Value>),
    /// A class object
    Class(Box<ClassData>),
}

/// A heap object: header plus body
#[derive(Debug, Clone)]
pub struct HeapObject {
    /// Object header
    pub header: ObjectHeader,
    /// Object payload
    pub body: ObjectBody,
    size: usize,
}

impl HeapObject {
    /// Bytes charged for this object
    pub fn size(&self) -> usize {
        self.size
    }

    /// Class data, if this is a class object
    pub fn as_class(&self) -> Option<&ClassData> {
        match &self.body {
            ObjectBody::Class(class) => Some(class),
            _ => None,
        }
    }

    /// Every reference held directly by this object, excluding the class pointer
    pub fn for_each_reference(&self, mut f: impl FnMut(ObjectRef)) {
        match &self.body {
            ObjectBody::Instance(values) | ObjectBody::Array(values) => {
                values.iter().filter_map(Value::as_object).for_each(&mut f);
            }
            ObjectBody::Class(class) => class.for_each_reference(f),
        }
    }
}

/// The managed heap
#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Option<HeapObject>>,
    live_objects: usize,
    allocated_bytes: usize,
    native_bytes: usize,
    max_heap_bytes: usize,
    next_hash: u32,
    finalizers: FxHashSet<ObjectRef>,
}

impl Heap {
    /// Create an unbounded heap
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum heap size (0 = unlimited)
    pub fn set_max_heap_size(&mut self, bytes: usize) {
        self.max_heap_bytes = bytes;
    }

    /// Bytes held by live objects and native side tables
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes + self.native_bytes
    }

    /// Number of live objects
    pub fn live_objects(&self) -> usize {
        self.live_objects
    }

    fn check_budget(&self, requested: usize) -> Result<(), AllocError> {
        let in_use = self.allocated_bytes();
        if self.max_heap_bytes > 0 && in_use + requested > self.max_heap_bytes {
            return Err(AllocError::OutOfMemory {
                requested,
                allocated: in_use,
                limit: self.max_heap_bytes,
            });
        }
        Ok(())
    }

    /// Allocate an object of `size` bytes
    pub fn allocate(
        &mut self,
        class: ObjectRef,
        body: ObjectBody,
        size: usize,
    ) -> Result<ObjectRef, AllocError> {
        self.check_budget(size)?;
        let index = u32::try_from(self.slots.len()).map_err(|_| AllocError::OutOfMemory {
            requested: size,
            allocated: self.allocated_bytes(),
            limit: self.max_heap_bytes,
        })?;
        self.next_hash = self.next_hash.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        self.slots.push(Some(HeapObject {
            header: ObjectHeader::new(class, self.next_hash >> 1),
            body,
            size,
        }));
        self.allocated_bytes += size;
        self.live_objects += 1;
        Ok(ObjectRef(index))
    }

    /// Reference the next allocation will return
    pub fn next_ref(&self) -> ObjectRef {
        ObjectRef(self.slots.len() as u32)
    }

    /// Charge native (non-object) memory against the heap budget
    pub fn charge_native(&mut self, bytes: usize) -> Result<(), AllocError> {
        self.check_budget(bytes)?;
        self.native_bytes += bytes;
        Ok(())
    }

    /// Return native memory previously charged
    pub fn release_native(&mut self, bytes: usize) {
        self.native_bytes = self.native_bytes.saturating_sub(bytes);
    }

    /// Free an object, returning its size
    pub fn free(&mut self, r: ObjectRef) -> usize {
        match self.slots.get_mut(r.index()).and_then(Option::take) {
            Some(obj) => {
                self.allocated_bytes -= obj.size;
                self.live_objects -= 1;
                self.finalizers.remove(&r);
                obj.size
            }
            None => 0,
        }
    }

    /// Whether `r` names a live object
    pub fn contains(&self, r: ObjectRef) -> bool {
        self.get(r).is_some()
    }

    /// Get an object
    pub fn get(&self, r: ObjectRef) -> Option<&HeapObject> {
        self.slots.get(r.index()).and_then(Option::as_ref)
    }

    /// Get an object mutably
    pub fn get_mut(&mut self, r: ObjectRef) -> Option<&mut HeapObject> {
        self.slots.get_mut(r.index()).and_then(Option::as_mut)
    }

    /// Class of an object
    pub fn class_of(&self, r: ObjectRef) -> Option<ObjectRef> {
        self.get(r).map(|o| o.header.class)
    }

    /// Class data of a class object
    pub fn class_data(&self, r: ObjectRef) -> Option<&ClassData> {
        self.get(r).and_then(HeapObject::as_class)
    }

    /// Class data of a class object, mutably
    pub fn class_data_mut(&mut self, r: ObjectRef) -> Option<&mut ClassData> {
        match self.get_mut(r).map(|o| &mut o.body) {
            Some(ObjectBody::Class(class)) => Some(class),
            _ => None,
        }
    }

    /// Instance fields of an object
    pub fn fields(&self, r: ObjectRef) -> Option<&[Value]> {
        match self.get(r).map(|o| &o.body) {
            Some(ObjectBody::Instance(values)) => Some(values),
            _ => None,
        }
    }

    /// Instance fields of an object, mutably
    pub fn fields_mut(&mut self, r: ObjectRef) -> Option<&mut Vec<Value>> {
        match self.get_mut(r).map(|o| &mut o.body) {
            Some(ObjectBody::Instance(values)) => Some(values),
            _ => None,
        }
    }

    /// Lazily visit every live object in allocation order
    pub fn objects(&self) -> impl Iterator<Item = (ObjectRef, &HeapObject)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|o| (ObjectRef(i as u32), o)))
    }

    /// Lazily visit every live object mutably
    pub fn objects_mut(&mut self) -> impl Iterator<Item = (ObjectRef, &mut HeapObject)> + '_ {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_mut().map(|o| (ObjectRef(i as u32), o)))
    }

    /// Register an object for finalization
    pub fn register_finalizer(&mut self, r: ObjectRef) {
        self.finalizers.insert(r);
    }

    /// Whether an object is registered for finalization
    pub fn has_finalizer(&self, r: ObjectRef) -> bool {
        self.finalizers.contains(&r)
    }

    /// Drop a finalization registration; returns whether one existed
    pub fn unregister_finalizer(&mut self, r: ObjectRef) -> bool {
        self.finalizers.remove(&r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free() {
        let mut heap = Heap::new();
        let class = heap.next_ref();
        let a = heap
            .allocate(class, ObjectBody::Instance(vec![Value::Int(1)]), 32)
            .unwrap();
        assert_eq!(heap.live_objects(), 1);
        assert_eq!(heap.allocated_bytes(), 32);
        assert_eq!(heap.fields(a), Some(&[Value::Int(1)][..]));

        assert_eq!(heap.free(a), 32);
        assert!(!heap.contains(a));
        assert_eq!(heap.allocated_bytes(), 0);
        assert_eq!(heap.free(a), 0);
    }

    #[test]
    fn test_slots_are_not_reused() {
        let mut heap = Heap::new();
        let class = ObjectRef::from_raw(0);
        let a = heap.allocate(class, ObjectBody::Array(vec![]), 16).unwrap();
        heap.free(a);
        let b = heap.allocate(class, ObjectBody::Array(vec![]), 16).unwrap();
        assert_ne!(a, b);
        assert!(heap.get(a).is_none());
    }

    #[test]
    fn test_heap_limit() {
        let mut heap = Heap::new();
        heap.set_max_heap_size(100);
        let class = ObjectRef::from_raw(0);
        heap.allocate(class, ObjectBody::Instance(vec![]), 60).unwrap();
        let err = heap
            .allocate(class, ObjectBody::Instance(vec![]), 60)
            .unwrap_err();
        assert!(matches!(err, AllocError::OutOfMemory { requested: 60, .. }));
        assert!(heap.charge_native(50).is_err());
        heap.charge_native(40).unwrap();
        assert_eq!(heap.allocated_bytes(), 100);
        heap.release_native(40);
        assert_eq!(heap.allocated_bytes(), 60);
    }

    #[test]
    fn test_objects_iterates_live_only() {
        let mut heap = Heap::new();
        let class = ObjectRef::from_raw(0);
        let a = heap.allocate(class, ObjectBody::Instance(vec![]), 16).unwrap();
        let b = heap.allocate(class, ObjectBody::Instance(vec![]), 16).unwrap();
        heap.free(a);
        let live: Vec<_> = heap.objects().map(|(r, _)| r).collect();
        assert_eq!(live, vec![b]);
    }

    #[test]
    fn test_finalizer_registry() {
        let mut heap = Heap::new();
        let class = ObjectRef::from_raw(0);
        let a = heap.allocate(class, ObjectBody::Instance(vec![]), 16).unwrap();
        heap.register_finalizer(a);
        assert!(heap.has_finalizer(a));
        heap.free(a);
        assert!(!heap.has_finalizer(a));
    }
}
