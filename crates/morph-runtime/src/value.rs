//! Register and field values

use crate::heap::ObjectRef;
use morph_classfile::descriptor::{storage_width_of, StorageWidth};

/// A value stored in a register, an instance field or a static field
///
/// Sub-word primitives (`Z B C S`) are widened to `Int`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Value {
    /// Null reference
    #[default]
    Null,
    /// 32-bit and narrower integers
    Int(i32),
    /// 64-bit integer
    Long(i64),
    /// 32-bit float
    Float(f32),
    /// 64-bit float
    Double(f64),
    /// Object reference
    Ref(ObjectRef),
}

impl Value {
    /// Zero value of a field with this type descriptor
    pub fn zero_for(descriptor: &str) -> Self {
        match descriptor.as_bytes().first() {
            Some(b'J') => Value::Long(0),
            Some(b'F') => Value::Float(0.0),
            Some(b'D') => Value::Double(0.0),
            _ => match storage_width_of(descriptor) {
                StorageWidth::Reference => Value::Null,
                _ => Value::Int(0),
            },
        }
    }

    /// The referenced object, if any
    pub fn as_object(&self) -> Option<ObjectRef> {
        match self {
            Value::Ref(r) => Some(*r),
            _ => None,
        }
    }

    /// The integer payload, if this is an `Int`
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The long payload, if this is a `Long`
    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Rewrite the reference held by this value
    #[inline]
    pub fn remap_ref(&mut self, f: impl FnOnce(ObjectRef) -> Option<ObjectRef>) {
        if let Value::Ref(r) = self {
            if let Some(new) = f(*r) {
                *r = new;
            }
        }
    }
}
