//! Class objects
//!
//! A class is a heap object whose body is a [`ClassData`]. Redefinition
//! bookkeeping hangs off the class in an optional [`ClassExt`] record, and a
//! class superseded by structural redefinition is tagged
//! [`ClassLifecycle::Retired`].

use crate::dex_cache::DexCacheId;
use crate::heap::ObjectRef;
use crate::method::{FieldId, MethodId};
use crate::thread::ThreadId;
use crate::value::Value;
use morph_classfile::access;
use std::sync::Arc;

/// Runtime class flags (not part of the class-file access flags)
pub mod class_flags {
    /// Primitive type such as `I`
    pub const PRIMITIVE: u32 = 1 << 0;
    /// Array type
    pub const ARRAY: u32 = 1 << 1;
    /// Generated proxy type
    pub const PROXY: u32 = 1 << 2;
    /// Type mirrored by runtime-internal structures (class, string, thread...)
    pub const MIRRORED: u32 = 1 << 3;
    /// Instances need finalization
    pub const FINALIZABLE: u32 = 1 << 4;
    /// Exempt from hidden-API checks
    pub const SKIP_HIDDEN_API: u32 = 1 << 5;
    /// Verification has been attempted
    pub const VERIFICATION_ATTEMPTED: u32 = 1 << 6;
    /// Obsolete (retired by structural redefinition)
    pub const OBSOLETE: u32 = 1 << 7;
}

/// Loading and initialization status
///
/// `Erroneous` orders below every other status so that `status >= Resolved`
/// never holds for a failed class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClassStatus {
    /// Loading, linking or initialization failed
    Erroneous,
    /// Allocated, nothing loaded yet
    NotReady,
    /// Members loaded
    Loaded,
    /// Being linked
    Resolving,
    /// Linked
    Resolved,
    /// Being verified
    Verifying,
    /// Verified
    Verified,
    /// Static initializer running
    Initializing,
    /// Fully initialized
    Initialized,
}

/// Whether a class is current or has been replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClassLifecycle {
    /// The live class for its type
    #[default]
    Active,
    /// Replaced by structural redefinition; never traversed into
    Retired {
        /// The class that replaced this one (not traced by the collector)
        superseded_by: ObjectRef,
    },
}

/// Where the original bytecode of a redefined class comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginalDexFile {
    /// Raw bytes supplied by a caller or captured from a previous generation
    Bytes(Arc<[u8]>),
    /// The metadata source the class was loaded from
    MetadataSource(DexCacheId),
}

/// Markers recording that reflective ids were handed out as raw pointers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PointerIdMarkers {
    /// Method ids are pointers
    pub methods: bool,
    /// Static field ids are pointers
    pub static_fields: bool,
    /// Instance field ids are pointers
    pub instance_fields: bool,
}

impl PointerIdMarkers {
    /// Whether any marker is set
    pub fn any(&self) -> bool {
        self.methods || self.static_fields || self.instance_fields
    }
}

/// Extension record holding redefinition state for a class
#[derive(Debug, Clone, Default)]
pub struct ClassExt {
    /// Obsolete methods, by slot
    pub obsolete_methods: Vec<Option<MethodId>>,
    /// Metadata source of each obsolete method, parallel to `obsolete_methods`
    pub obsolete_dex_caches: Vec<Option<DexCacheId>>,
    /// Bytecode of the previous generation
    pub original_dex_file: Option<OriginalDexFile>,
    /// Retired class this class replaced
    pub obsolete_class: Option<ObjectRef>,
    /// Metadata source and class-def index before the first redefinition
    pub pre_redefine: Option<(DexCacheId, usize)>,
    /// Reflective pointer-id markers
    pub pointer_ids: PointerIdMarkers,
}

/// Approximate native footprint of an extension record
pub const CLASS_EXT_SIZE: usize = 64;

impl ClassExt {
    /// Slot holding `method`, if it is a recorded obsolete method
    pub fn obsolete_slot_of(&self, method: MethodId) -> Option<usize> {
        self.obsolete_methods.iter().position(|m| *m == Some(method))
    }

    /// Number of used obsolete-method slots
    pub fn obsolete_method_count(&self) -> usize {
        self.obsolete_methods.iter().filter(|m| m.is_some()).count()
    }
}

/// Body of a class object
#[derive(Debug, Clone)]
pub struct ClassData {
    /// Type descriptor
    pub descriptor: String,
    /// Class-file access flags
    pub access_flags: u32,
    /// Runtime flags, see [`class_flags`]
    pub class_flags: u32,
    /// Status
    pub status: ClassStatus,
    /// Thread linking or initializing this class
    pub clinit_thread: Option<ThreadId>,
    /// Defining loader
    pub loader: crate::class_linker::LoaderId,
    /// Superclass
    pub super_class: Option<ObjectRef>,
    /// Directly implemented interfaces, in declaration order
    pub interfaces: Vec<ObjectRef>,
    /// Component type of an array class
    pub component_type: Option<ObjectRef>,
    /// Metadata source the class reads its definition from
    pub dex_cache: Option<DexCacheId>,
    /// Index of the definition in the metadata source
    pub class_def_index: usize,
    /// Declared methods, direct first
    pub methods: Vec<MethodId>,
    /// Number of direct methods at the front of `methods`
    pub num_direct_methods: usize,
    /// Declared instance fields
    pub instance_fields: Vec<FieldId>,
    /// Declared static fields
    pub static_fields: Vec<FieldId>,
    /// Static field storage, indexed by static field offset
    pub statics: Vec<Value>,
    /// Instance field slots including inherited ones
    pub instance_slots: usize,
    /// Bytes per instance
    pub object_size: usize,
    /// Bytes of the class object
    pub class_size: usize,
    /// Redefinition extension record
    pub ext: Option<Box<ClassExt>>,
    /// Active or retired
    pub lifecycle: ClassLifecycle,
}

impl ClassData {
    /// Create an empty class body
    pub fn new(descriptor: &str, loader: crate::class_linker::LoaderId) -> Self {
        Self {
            descriptor: descriptor.to_string(),
            access_flags: access::ACC_PUBLIC,
            class_flags: 0,
            status: ClassStatus::NotReady,
            clinit_thread: None,
            loader,
            super_class: None,
            interfaces: Vec::new(),
            component_type: None,
            dex_cache: None,
            class_def_index: 0,
            methods: Vec::new(),
            num_direct_methods: 0,
            instance_fields: Vec::new(),
            static_fields: Vec::new(),
            statics: Vec::new(),
            instance_slots: 0,
            object_size: crate::heap::OBJECT_HEADER_SIZE,
            class_size: 0,
            ext: None,
            lifecycle: ClassLifecycle::Active,
        }
    }

    /// Whether a class flag is set
    #[inline]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.class_flags & flag != 0
    }

    /// Whether this is an interface
    pub fn is_interface(&self) -> bool {
        self.access_flags & access::ACC_INTERFACE != 0
    }

    /// Whether this is a primitive type
    pub fn is_primitive(&self) -> bool {
        self.has_flag(class_flags::PRIMITIVE)
    }

    /// Whether this is an array type
    pub fn is_array(&self) -> bool {
        self.has_flag(class_flags::ARRAY)
    }

    /// Whether this is a proxy type
    pub fn is_proxy(&self) -> bool {
        self.has_flag(class_flags::PROXY)
    }

    /// Whether this is the root of the class hierarchy
    pub fn is_root(&self) -> bool {
        self.super_class.is_none() && !self.is_primitive() && !self.is_interface()
    }

    /// Whether linking completed
    pub fn is_resolved(&self) -> bool {
        self.status >= ClassStatus::Resolved
    }

    /// Whether initialization completed
    pub fn is_initialized(&self) -> bool {
        self.status == ClassStatus::Initialized
    }

    /// Whether loading or initialization failed
    pub fn is_erroneous(&self) -> bool {
        self.status == ClassStatus::Erroneous
    }

    /// Whether this class was retired by structural redefinition
    pub fn is_retired(&self) -> bool {
        matches!(self.lifecycle, ClassLifecycle::Retired { .. })
    }

    /// Directly dispatched methods
    pub fn direct_methods(&self) -> &[MethodId] {
        &self.methods[..self.num_direct_methods]
    }

    /// Virtually dispatched methods
    pub fn virtual_methods(&self) -> &[MethodId] {
        &self.methods[self.num_direct_methods..]
    }

    /// References held by the class body, as traced by the collector
    pub fn for_each_reference(&self, mut f: impl FnMut(ObjectRef)) {
        if let Some(s) = self.super_class {
            f(s);
        }
        self.interfaces.iter().copied().for_each(&mut f);
        if let Some(c) = self.component_type {
            f(c);
        }
        self.statics.iter().filter_map(Value::as_object).for_each(&mut f);
        if let Some(old) = self.ext.as_ref().and_then(|e| e.obsolete_class) {
            f(old);
        }
    }

    /// Rewrite references held by the class body
    ///
    /// The extension record's retired-class pointer is left alone.
    pub fn remap_references(&mut self, f: &impl Fn(ObjectRef) -> Option<ObjectRef>) {
        for slot in self
            .super_class
            .iter_mut()
            .chain(self.interfaces.iter_mut())
            .chain(self.component_type.iter_mut())
        {
            if let Some(new) = f(*slot) {
                *slot = new;
            }
        }
        for value in &mut self.statics {
            value.remap_ref(f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class_linker::LoaderId;

    #[test]
    fn test_status_ordering() {
        assert!(ClassStatus::Erroneous < ClassStatus::Resolved);
        assert!(ClassStatus::Initialized > ClassStatus::Verified);
        let mut class = ClassData::new("LFoo;", LoaderId::BOOT);
        class.status = ClassStatus::Erroneous;
        assert!(!class.is_resolved());
        assert!(class.is_erroneous());
    }

    #[test]
    fn test_method_partition() {
        let mut class = ClassData::new("LFoo;", LoaderId::BOOT);
        class.methods = vec![MethodId::from_raw(0), MethodId::from_raw(1), MethodId::from_raw(2)];
        class.num_direct_methods = 1;
        assert_eq!(class.direct_methods(), &[MethodId::from_raw(0)]);
        assert_eq!(class.virtual_methods().len(), 2);
    }

    #[test]
    fn test_remap_references_skips_back_pointer() {
        let old = ObjectRef::from_raw(1);
        let new = ObjectRef::from_raw(2);
        let mut class = ClassData::new("LFoo;", LoaderId::BOOT);
        class.super_class = Some(old);
        class.statics = vec![Value::Ref(old), Value::Int(3)];
        class.ext = Some(Box::new(ClassExt {
            obsolete_class: Some(old),
            ..ClassExt::default()
        }));

        class.remap_references(&|r| (r == old).then_some(new));

        assert_eq!(class.super_class, Some(new));
        assert_eq!(class.statics[0], Value::Ref(new));
        assert_eq!(class.ext.as_ref().unwrap().obsolete_class, Some(old));
    }

    #[test]
    fn test_obsolete_slot_lookup() {
        let ext = ClassExt {
            obsolete_methods: vec![None, Some(MethodId::from_raw(4))],
            obsolete_dex_caches: vec![None, None],
            ..ClassExt::default()
        };
        assert_eq!(ext.obsolete_slot_of(MethodId::from_raw(4)), Some(1));
        assert_eq!(ext.obsolete_slot_of(MethodId::from_raw(5)), None);
        assert_eq!(ext.obsolete_method_count(), 1);
    }
}
