//! Class linker
//!
//! Defines classes from metadata sources, links their members and keeps the
//! table of loaded classes per loader. The boot loader owns the bootstrap
//! classes created by [`RuntimeState::bootstrap`].
//!
//! Linking is split into two steps so callers can build a class object
//! without publishing it: [`RuntimeState::alloc_class_object`] sizes and
//! allocates the class, [`RuntimeState::load_and_link`] fills its members.
//! [`RuntimeState::define_class`] runs both, verifies and registers.

use crate::class::{class_flags, ClassData, ClassStatus};
use crate::dex_cache::{DexCache, DexCacheId, DexFile};
use crate::heap::{AllocError, ObjectBody, ObjectRef, OBJECT_HEADER_SIZE};
use crate::method::{method_flags, EntryPoint, Field, Method, METHOD_SIZE};
use crate::runtime::RuntimeState;
use crate::thread::ThreadId;
use crate::value::Value;
use crate::verifier::LoaderResolver;
use morph_classfile::descriptor::{storage_width_of, StorageWidth};
use morph_classfile::{access, ClassDef, VerifyOutcome};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;

/// Descriptor of the root class
pub const OBJECT_DESCRIPTOR: &str = "Ljava/lang/Object;";
/// Descriptor of the class of classes
pub const CLASS_DESCRIPTOR: &str = "Ljava/lang/Class;";
/// Descriptor of the string class
pub const STRING_DESCRIPTOR: &str = "Ljava/lang/String;";
/// Descriptor of the thread class
pub const THREAD_DESCRIPTOR: &str = "Ljava/lang/Thread;";

/// Bytes of a class object before its static storage
pub const CLASS_BASE_SIZE: usize = 128;

const PRIMITIVE_DESCRIPTORS: &str = "ZBCSIJFDV";

/// Identifier of a class loader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoaderId(u32);

impl LoaderId {
    /// The boot loader
    pub const BOOT: LoaderId = LoaderId(0);

    /// Create an id from a raw value
    pub const fn from_raw(id: u32) -> Self {
        Self(id)
    }

    /// Raw value
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Class loading and linking errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// A referenced class is not loaded
    #[error("NoClassDefFoundError: {0}")]
    NoClassDefFound(String),

    /// The class file could not be used
    #[error("ClassFormatError: {0}")]
    ClassFormat(String),

    /// Allocation failed
    #[error(transparent)]
    OutOfMemory(#[from] AllocError),

    /// The loader already defines this descriptor
    #[error("class {0} is already defined by this loader")]
    AlreadyDefined(String),

    /// Superclass or interface has the wrong kind
    #[error("IncompatibleClassChangeError: {0}")]
    IncompatibleClassChange(String),

    /// Hard verification failure
    #[error("VerifyError: {0}")]
    Verify(String),

    /// Initialization previously failed
    #[error("class {0} is in an erroneous state")]
    Erroneous(String),
}

/// Classes the runtime itself depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WellKnownClasses {
    /// `Ljava/lang/Class;`
    pub class_class: ObjectRef,
    /// `Ljava/lang/Object;`
    pub object: ObjectRef,
    /// `Ljava/lang/String;`
    pub string: ObjectRef,
    /// `Ljava/lang/Thread;`
    pub thread: ObjectRef,
}

impl WellKnownClasses {
    fn remap(&mut self, f: &impl Fn(ObjectRef) -> Option<ObjectRef>) {
        for slot in [
            &mut self.class_class,
            &mut self.object,
            &mut self.string,
            &mut self.thread,
        ] {
            if let Some(new) = f(*slot) {
                *slot = new;
            }
        }
    }
}

/// Table of loaded classes
#[derive(Debug, Default)]
pub struct ClassLinker {
    table: FxHashMap<(LoaderId, String), ObjectRef>,
    well_known: Option<WellKnownClasses>,
    next_loader: u32,
}

impl ClassLinker {
    /// Create an empty linker
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new class loader
    pub fn create_loader(&mut self) -> LoaderId {
        self.next_loader += 1;
        LoaderId(self.next_loader)
    }

    /// Class registered by exactly this loader
    pub fn lookup(&self, loader: LoaderId, descriptor: &str) -> Option<ObjectRef> {
        self.table.get(&(loader, descriptor.to_string())).copied()
    }

    /// Class visible to `loader`: its own, then the boot loader's
    pub fn find(&self, loader: LoaderId, descriptor: &str) -> Option<ObjectRef> {
        self.lookup(loader, descriptor)
            .or_else(|| self.lookup(LoaderId::BOOT, descriptor))
    }

    /// Publish a class
    pub fn register(
        &mut self,
        loader: LoaderId,
        descriptor: &str,
        class: ObjectRef,
    ) -> Result<(), LinkError> {
        let key = (loader, descriptor.to_string());
        if self.table.contains_key(&key) {
            return Err(LinkError::AlreadyDefined(descriptor.to_string()));
        }
        self.table.insert(key, class);
        Ok(())
    }

    /// Every registered class, in no particular order
    pub fn classes(&self) -> impl Iterator<Item = ObjectRef> + '_ {
        self.table.values().copied()
    }

    /// Number of registered classes
    pub fn class_count(&self) -> usize {
        self.table.len()
    }

    /// Bootstrap classes (panics before bootstrap)
    pub fn well_known(&self) -> &WellKnownClasses {
        match &self.well_known {
            Some(classes) => classes,
            None => panic!("class linker used before bootstrap"),
        }
    }

    /// Rewrite table entries and well-known classes
    pub fn remap_roots(&mut self, f: &impl Fn(ObjectRef) -> Option<ObjectRef>) {
        for class in self.table.values_mut() {
            if let Some(new) = f(*class) {
                *class = new;
            }
        }
        if let Some(classes) = &mut self.well_known {
            classes.remap(f);
        }
    }
}

/// Footprint of a class object declaring these static fields
///
/// Each static field falls in one of five buckets by storage width.
pub fn compute_class_size(def: &ClassDef) -> usize {
    let mut buckets = [0usize; 5];
    for field in def.static_fields() {
        let bucket = match storage_width_of(&field.descriptor) {
            StorageWidth::Bits64 => 0,
            StorageWidth::Bits32 => 1,
            StorageWidth::Bits16 => 2,
            StorageWidth::Bits8 => 3,
            StorageWidth::Reference => 4,
        };
        buckets[bucket] += 1;
    }
    CLASS_BASE_SIZE + buckets[0] * 8 + buckets[1] * 4 + buckets[2] * 2 + buckets[3] + buckets[4] * 4
}

fn instance_field_bytes(def: &ClassDef) -> usize {
    def.instance_fields()
        .map(|f| storage_width_of(&f.descriptor).size_in_bytes())
        .sum()
}

impl RuntimeState {
    /// Create the bootstrap classes
    pub fn bootstrap(&mut self) -> Result<(), LinkError> {
        let class_class = self.heap.next_ref();
        let mut data = ClassData::new(CLASS_DESCRIPTOR, LoaderId::BOOT);
        data.class_size = CLASS_BASE_SIZE;
        self.heap.allocate(
            class_class,
            ObjectBody::Class(Box::new(data)),
            CLASS_BASE_SIZE,
        )?;
        debug_assert_eq!(self.heap.class_of(class_class), Some(class_class));

        let object = self.bootstrap_class(class_class, OBJECT_DESCRIPTOR, None, 0)?;
        let string =
            self.bootstrap_class(class_class, STRING_DESCRIPTOR, Some(object), class_flags::MIRRORED)?;
        let thread =
            self.bootstrap_class(class_class, THREAD_DESCRIPTOR, Some(object), class_flags::MIRRORED)?;
        if let Some(data) = self.heap.class_data_mut(class_class) {
            data.super_class = Some(object);
            data.class_flags |= class_flags::MIRRORED;
            data.access_flags |= access::ACC_FINAL;
            data.status = ClassStatus::Initialized;
        }
        self.class_linker
            .register(LoaderId::BOOT, CLASS_DESCRIPTOR, class_class)?;

        for c in PRIMITIVE_DESCRIPTORS.chars() {
            let primitive = self.bootstrap_class(class_class, &c.to_string(), None, class_flags::PRIMITIVE)?;
            if let Some(data) = self.heap.class_data_mut(primitive) {
                data.access_flags = access::ACC_PUBLIC | access::ACC_FINAL | access::ACC_ABSTRACT;
            }
        }

        self.class_linker.well_known = Some(WellKnownClasses {
            class_class,
            object,
            string,
            thread,
        });
        log::debug!(
            "bootstrapped {} classes",
            self.class_linker.class_count()
        );
        Ok(())
    }

    fn bootstrap_class(
        &mut self,
        class_class: ObjectRef,
        descriptor: &str,
        super_class: Option<ObjectRef>,
        flags: u32,
    ) -> Result<ObjectRef, LinkError> {
        let mut data = ClassData::new(descriptor, LoaderId::BOOT);
        data.super_class = super_class;
        data.class_flags = flags;
        data.class_size = CLASS_BASE_SIZE;
        data.status = ClassStatus::Initialized;
        let class = self.heap.allocate(
            class_class,
            ObjectBody::Class(Box::new(data)),
            CLASS_BASE_SIZE,
        )?;
        self.class_linker.register(LoaderId::BOOT, descriptor, class)?;
        Ok(class)
    }

    /// Class visible to `loader` by descriptor
    pub fn find_class(&self, loader: LoaderId, descriptor: &str) -> Option<ObjectRef> {
        self.class_linker.find(loader, descriptor)
    }

    /// Parse a class file and create a metadata source for it
    pub fn open_dex_file(
        &mut self,
        location: &str,
        data: Arc<[u8]>,
        loader: LoaderId,
    ) -> Result<DexCacheId, LinkError> {
        let dex_file = DexFile::open(location, data)
            .map_err(|e| LinkError::ClassFormat(format!("{location}: {e}")))?;
        Ok(self.register_dex_file(Arc::new(dex_file), loader)?)
    }

    /// Create a metadata source for an already parsed file
    pub fn register_dex_file(
        &mut self,
        dex_file: Arc<DexFile>,
        loader: LoaderId,
    ) -> Result<DexCacheId, AllocError> {
        let cache = DexCache::new(dex_file, loader);
        self.heap.charge_native(cache.footprint())?;
        Ok(self.dex_caches.push(cache))
    }

    /// Drop a metadata source nothing refers to and return its charge
    ///
    /// Returns `false` if `id` is not registered.
    pub fn unregister_dex_file(&mut self, id: DexCacheId) -> bool {
        match self.dex_caches.remove(id) {
            Some(cache) => {
                self.heap.release_native(cache.footprint());
                true
            }
            None => false,
        }
    }

    /// Allocate an unlinked class object of `class_size` bytes
    pub fn alloc_class_object(
        &mut self,
        descriptor: &str,
        loader: LoaderId,
        class_size: usize,
    ) -> Result<ObjectRef, AllocError> {
        let class_class = self.class_linker.well_known().class_class;
        let mut data = ClassData::new(descriptor, loader);
        data.class_size = class_size;
        self.heap
            .allocate(class_class, ObjectBody::Class(Box::new(data)), class_size)
    }

    /// Load members from a metadata source into `class` and lay it out
    ///
    /// Hierarchy pointers are taken as given; nothing is verified or
    /// registered. The class ends up `Resolved`.
    pub fn load_and_link(
        &mut self,
        class: ObjectRef,
        dex_cache: DexCacheId,
        class_def_index: usize,
        super_class: Option<ObjectRef>,
        interfaces: Vec<ObjectRef>,
    ) -> Result<(), LinkError> {
        let def = self
            .dex_caches
            .get(dex_cache)
            .and_then(|c| c.class_def(class_def_index))
            .cloned()
            .ok_or_else(|| LinkError::NoClassDefFound(format!("class def {class_def_index}")))?;

        let (super_slots, super_size, super_finalizable) = match super_class {
            Some(s) => {
                let data = self
                    .heap
                    .class_data(s)
                    .ok_or_else(|| LinkError::NoClassDefFound(format!("superclass {s}")))?;
                (
                    data.instance_slots,
                    data.object_size,
                    data.has_flag(class_flags::FINALIZABLE),
                )
            }
            None => (0, OBJECT_HEADER_SIZE, false),
        };

        self.heap
            .charge_native(def.methods.len() * METHOD_SIZE)?;

        let mut methods = Vec::with_capacity(def.methods.len());
        let direct = def.methods.iter().enumerate().filter(|(_, m)| m.is_direct());
        let virtuals = def.methods.iter().enumerate().filter(|(_, m)| !m.is_direct());
        for (index, m) in direct.chain(virtuals) {
            let is_native = m.access_flags & access::ACC_NATIVE != 0;
            methods.push(self.methods.push(Method {
                declaring_class: class,
                name: m.name.clone(),
                signature: m.signature.clone(),
                access_flags: m.access_flags,
                runtime_flags: 0,
                method_index: index,
                entry_point: if is_native {
                    EntryPoint::Native
                } else {
                    EntryPoint::Interpreter
                },
                native_entry: None,
            }));
        }

        let mut static_fields = Vec::new();
        let mut instance_fields = Vec::new();
        let mut statics = Vec::new();
        for (index, f) in def.fields.iter().enumerate() {
            let offset = if f.is_static() {
                statics.push(Value::zero_for(&f.descriptor));
                statics.len() - 1
            } else {
                super_slots + instance_fields.len()
            };
            let id = self.fields.push(Field {
                declaring_class: class,
                name: f.name.clone(),
                descriptor: f.descriptor.clone(),
                access_flags: f.access_flags,
                offset,
                field_index: index,
            });
            if f.is_static() {
                static_fields.push(id);
            } else {
                instance_fields.push(id);
            }
        }

        let finalizable = super_finalizable
            || def
                .find_method("finalize", "()V")
                .is_some_and(|(_, m)| !m.is_static() && m.code.is_some());

        let data = self
            .heap
            .class_data_mut(class)
            .ok_or_else(|| LinkError::NoClassDefFound(def.descriptor.clone()))?;
        data.status = ClassStatus::Loaded;
        data.access_flags = def.access_flags;
        data.super_class = super_class;
        data.interfaces = interfaces;
        data.dex_cache = Some(dex_cache);
        data.class_def_index = class_def_index;
        data.num_direct_methods = def.direct_method_count();
        data.methods = methods;
        data.instance_slots = super_slots + instance_fields.len();
        data.object_size = super_size + instance_field_bytes(&def);
        data.instance_fields = instance_fields;
        data.static_fields = static_fields;
        data.statics = statics;
        if finalizable {
            data.class_flags |= class_flags::FINALIZABLE;
        }
        data.status = ClassStatus::Resolved;
        Ok(())
    }

    fn resolve_hierarchy(
        &self,
        loader: LoaderId,
        def: &ClassDef,
    ) -> Result<(ObjectRef, Vec<ObjectRef>), LinkError> {
        let super_desc = def
            .superclass
            .as_deref()
            .ok_or_else(|| LinkError::ClassFormat(format!("{} has no superclass", def.descriptor)))?;
        let super_class = self
            .find_class(loader, super_desc)
            .ok_or_else(|| LinkError::NoClassDefFound(super_desc.to_string()))?;
        let super_data = self
            .heap
            .class_data(super_class)
            .ok_or_else(|| LinkError::NoClassDefFound(super_desc.to_string()))?;
        if super_data.is_interface()
            || super_data.is_primitive()
            || super_data.is_array()
            || super_data.access_flags & access::ACC_FINAL != 0
        {
            return Err(LinkError::IncompatibleClassChange(format!(
                "{} cannot extend {}",
                def.descriptor, super_desc
            )));
        }

        let mut interfaces = Vec::with_capacity(def.interfaces.len());
        for iface in &def.interfaces {
            let class = self
                .find_class(loader, iface)
                .ok_or_else(|| LinkError::NoClassDefFound(iface.clone()))?;
            if !self.heap.class_data(class).is_some_and(ClassData::is_interface) {
                return Err(LinkError::IncompatibleClassChange(format!(
                    "{} implements non-interface {}",
                    def.descriptor, iface
                )));
            }
            interfaces.push(class);
        }
        Ok((super_class, interfaces))
    }

    /// Define, verify, link and register a class
    pub fn define_class(
        &mut self,
        thread: ThreadId,
        loader: LoaderId,
        dex_cache: DexCacheId,
        class_def_index: usize,
    ) -> Result<ObjectRef, LinkError> {
        let def = self
            .dex_caches
            .get(dex_cache)
            .and_then(|c| c.class_def(class_def_index))
            .cloned()
            .ok_or_else(|| LinkError::NoClassDefFound(format!("class def {class_def_index}")))?;
        if self.class_linker.lookup(loader, &def.descriptor).is_some() {
            return Err(LinkError::AlreadyDefined(def.descriptor));
        }
        let (super_class, interfaces) = self.resolve_hierarchy(loader, &def)?;

        let outcome = self
            .verifier
            .verify_class(&def, &LoaderResolver::new(&self.class_linker, loader));
        if let VerifyOutcome::HardFailure(e) = &outcome {
            return Err(LinkError::Verify(format!("{}: {e}", def.descriptor)));
        }

        let class = self.alloc_class_object(&def.descriptor, loader, compute_class_size(&def))?;
        if let Some(data) = self.heap.class_data_mut(class) {
            data.status = ClassStatus::Resolving;
            data.clinit_thread = Some(thread);
        }
        if let Err(e) = self.load_and_link(class, dex_cache, class_def_index, Some(super_class), interfaces) {
            if let Some(data) = self.heap.class_data_mut(class) {
                data.status = ClassStatus::Erroneous;
            }
            return Err(e);
        }
        self.apply_verification_result(class, &outcome);
        self.class_linker.register(loader, &def.descriptor, class)?;
        log::debug!("defined {} in loader {}", def.descriptor, loader.raw());
        Ok(class)
    }

    /// Record a verification outcome on a linked class
    ///
    /// A clean result lets every invokable method skip access checks; a soft
    /// failure keeps the checks on.
    pub fn apply_verification_result(&mut self, class: ObjectRef, outcome: &VerifyOutcome) {
        let Some(data) = self.heap.class_data_mut(class) else {
            return;
        };
        data.class_flags |= class_flags::VERIFICATION_ATTEMPTED;
        if data.status < ClassStatus::Verified {
            data.status = ClassStatus::Verified;
        }
        let methods = data.methods.clone();
        for id in methods {
            if let Some(m) = self.methods.get_mut(id) {
                match outcome {
                    VerifyOutcome::NoFailure if m.is_invokable() && !m.is_native() => {
                        m.set_flag(method_flags::SKIP_ACCESS_CHECKS)
                    }
                    _ => m.clear_flag(method_flags::SKIP_ACCESS_CHECKS),
                }
            }
        }
    }

    /// Run static initialization of a class and its superclasses
    pub fn initialize_class(&mut self, thread: ThreadId, class: ObjectRef) -> Result<(), LinkError> {
        let data = self
            .heap
            .class_data(class)
            .ok_or_else(|| LinkError::NoClassDefFound(class.to_string()))?;
        if data.is_initialized() {
            return Ok(());
        }
        if data.is_erroneous() {
            return Err(LinkError::Erroneous(data.descriptor.clone()));
        }
        if let Some(s) = data.super_class {
            self.initialize_class(thread, s)?;
        }
        if let Some(data) = self.heap.class_data_mut(class) {
            data.clinit_thread = Some(thread);
            data.status = ClassStatus::Initialized;
        }
        Ok(())
    }

    /// Array class with this component type, created on first use
    pub fn define_array_class(&mut self, component: ObjectRef) -> Result<ObjectRef, LinkError> {
        let (descriptor, loader) = {
            let data = self
                .heap
                .class_data(component)
                .ok_or_else(|| LinkError::NoClassDefFound(component.to_string()))?;
            (format!("[{}", data.descriptor), data.loader)
        };
        if let Some(existing) = self.class_linker.lookup(loader, &descriptor) {
            return Ok(existing);
        }
        let object = self.class_linker.well_known().object;
        let class = self.alloc_class_object(&descriptor, loader, CLASS_BASE_SIZE)?;
        if let Some(data) = self.heap.class_data_mut(class) {
            data.access_flags = access::ACC_PUBLIC | access::ACC_FINAL | access::ACC_ABSTRACT;
            data.class_flags |= class_flags::ARRAY;
            data.component_type = Some(component);
            data.super_class = Some(object);
            data.status = ClassStatus::Initialized;
        }
        self.class_linker.register(loader, &descriptor, class)?;
        Ok(class)
    }

    /// Generate a proxy class implementing `interfaces`
    pub fn define_proxy_class(
        &mut self,
        loader: LoaderId,
        descriptor: &str,
        interfaces: Vec<ObjectRef>,
    ) -> Result<ObjectRef, LinkError> {
        let object = self.class_linker.well_known().object;
        let class = self.alloc_class_object(descriptor, loader, CLASS_BASE_SIZE)?;
        if let Some(data) = self.heap.class_data_mut(class) {
            data.access_flags = access::ACC_PUBLIC | access::ACC_FINAL;
            data.class_flags |= class_flags::PROXY;
            data.super_class = Some(object);
            data.interfaces = interfaces;
            data.status = ClassStatus::Initialized;
        }
        self.class_linker.register(loader, descriptor, class)?;
        Ok(class)
    }

    /// Mark a class as failed
    pub fn mark_erroneous(&mut self, class: ObjectRef) {
        if let Some(data) = self.heap.class_data_mut(class) {
            data.status = ClassStatus::Erroneous;
        }
    }

    /// Whether `ancestor` is `class` or one of its superclasses
    pub fn is_subclass_of(&self, class: ObjectRef, ancestor: ObjectRef) -> bool {
        let mut current = Some(class);
        while let Some(c) = current {
            if c == ancestor {
                return true;
            }
            current = self.heap.class_data(c).and_then(|d| d.super_class);
        }
        false
    }

    /// Number of superclasses above `class`
    pub fn superclass_depth(&self, class: ObjectRef) -> usize {
        let mut depth = 0;
        let mut current = self.heap.class_data(class).and_then(|d| d.super_class);
        while let Some(c) = current {
            depth += 1;
            current = self.heap.class_data(c).and_then(|d| d.super_class);
        }
        depth
    }

    /// Registered proper subclasses of `class`, shallowest first
    pub fn loaded_subclasses(&self, class: ObjectRef) -> Vec<ObjectRef> {
        let mut subclasses: Vec<ObjectRef> = self
            .class_linker
            .classes()
            .filter(|c| *c != class && self.is_subclass_of(*c, class))
            .collect();
        subclasses.sort_by_key(|c| (self.superclass_depth(*c), *c));
        subclasses
    }
}
