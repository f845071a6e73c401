//! The runtime and its shared state
//!
//! [`RuntimeState`] aggregates every runtime structure behind one mutex.
//! Threads hold [`ScopedObjectAccess`] (shared mutator access) while they
//! touch the heap; [`ScopedSuspendAll`] stops every other thread and hands
//! out exclusive access to the state.
//!
//! Monitors live in object lock words and are waited on through a condition
//! variable paired with the state mutex. Entering a contended monitor is a
//! blocking operation: callers must not hold [`ScopedObjectAccess`] while
//! doing so, or a concurrent suspend-all cannot complete.

use crate::class::{class_flags, ClassData};
use crate::class_linker::{ClassLinker, LinkError, LoaderId};
use crate::dex_cache::{DexCacheArena, DexCacheId};
use crate::gate::{AllocationGate, ClassLoadGate};
use crate::gc::GarbageCollector;
use crate::globals::{GlobalRef, GlobalRefTable};
use crate::header::LockWord;
use crate::heap::{AllocError, Heap, ObjectBody, ObjectRef, OBJECT_HEADER_SIZE};
use crate::instrumentation::Instrumentation;
use crate::jit::CodeCache;
use crate::method::{FieldArena, FieldId, MethodArena, MethodId};
use crate::reflective::JniIdTable;
use crate::safepoint::{SafepointCoordinator, StopReason, StoppedWorld};
use crate::thread::{ThreadId, ThreadList};
use crate::value::Value;
use crate::verifier::{ClassVerifier, DefaultVerifier};
use morph_classfile::descriptor::storage_width_of;
use morph_classfile::{ClassDef, CodeItem};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLockReadGuard};
use rustc_hash::FxHashSet;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Maximum heap size in bytes (0 = unlimited)
    pub max_heap_bytes: usize,
    /// Whether the JIT may install compiled code
    pub jit_enabled: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_heap_bytes: 0,
            jit_enabled: true,
        }
    }
}

impl RuntimeOptions {
    /// Set the heap limit
    pub fn with_max_heap_bytes(mut self, bytes: usize) -> Self {
        self.max_heap_bytes = bytes;
        self
    }

    /// Enable or disable the JIT
    pub fn with_jit(mut self, enabled: bool) -> Self {
        self.jit_enabled = enabled;
        self
    }
}

/// Every runtime structure guarded by the state mutex
pub struct RuntimeState {
    /// Object heap
    pub heap: Heap,
    /// Method metadata
    pub methods: MethodArena,
    /// Field metadata
    pub fields: FieldArena,
    /// Metadata sources
    pub dex_caches: DexCacheArena,
    /// Loaded classes
    pub class_linker: ClassLinker,
    /// Attached threads
    pub threads: ThreadList,
    /// JIT code cache
    pub code_cache: CodeCache,
    /// Deoptimization and breakpoints
    pub instrumentation: Instrumentation,
    /// Member ids handed to native code
    pub jni_ids: JniIdTable,
    /// Global references
    pub globals: GlobalRefTable,
    /// Collector state
    pub gc: GarbageCollector,
    /// Verifier oracle
    pub verifier: Box<dyn ClassVerifier>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeState {
    /// Create an empty state with the default verifier
    ///
    /// Call [`bootstrap`](Self::bootstrap) before defining classes.
    pub fn new() -> Self {
        Self::with_options(&RuntimeOptions::default(), Box::new(DefaultVerifier))
    }

    /// Create an empty state
    pub fn with_options(options: &RuntimeOptions, verifier: Box<dyn ClassVerifier>) -> Self {
        let mut heap = Heap::new();
        heap.set_max_heap_size(options.max_heap_bytes);
        Self {
            heap,
            methods: MethodArena::new(),
            fields: FieldArena::new(),
            dex_caches: DexCacheArena::new(),
            class_linker: ClassLinker::new(),
            threads: ThreadList::new(),
            code_cache: CodeCache::new(options.jit_enabled),
            instrumentation: Instrumentation::default(),
            jni_ids: JniIdTable::default(),
            globals: GlobalRefTable::new(),
            gc: GarbageCollector::default(),
            verifier,
        }
    }

    /// Class data of a class object
    pub fn class(&self, class: ObjectRef) -> Option<&ClassData> {
        self.heap.class_data(class)
    }

    /// Descriptor of a class
    pub fn descriptor_of(&self, class: ObjectRef) -> Option<&str> {
        self.class(class).map(|c| c.descriptor.as_str())
    }

    // ===== Allocation =====

    /// Allocate a zeroed instance of `class`
    ///
    /// With `register_finalizer` set, instances of finalizable classes are
    /// registered for finalization.
    pub fn alloc_instance(
        &mut self,
        class: ObjectRef,
        register_finalizer: bool,
    ) -> Result<ObjectRef, AllocError> {
        let (values, size, finalizable) = {
            let Some(data) = self.class(class) else {
                return Err(AllocError::NotAClass(class));
            };
            let mut values = vec![Value::Null; data.instance_slots];
            let mut current = Some(class);
            while let Some(c) = current {
                let Some(cd) = self.class(c) else { break };
                for id in &cd.instance_fields {
                    if let Some(f) = self.fields.get(*id) {
                        if let Some(slot) = values.get_mut(f.offset) {
                            *slot = Value::zero_for(&f.descriptor);
                        }
                    }
                }
                current = cd.super_class;
            }
            (
                values,
                data.object_size,
                data.has_flag(class_flags::FINALIZABLE),
            )
        };
        let obj = self
            .heap
            .allocate(class, ObjectBody::Instance(values), size)?;
        if register_finalizer && finalizable {
            self.heap.register_finalizer(obj);
        }
        Ok(obj)
    }

    /// Allocate an array of `len` zeroed elements
    pub fn alloc_array(&mut self, class: ObjectRef, len: usize) -> Result<ObjectRef, AllocError> {
        let data = self.class(class).ok_or(AllocError::NotAClass(class))?;
        let component = data
            .component_type
            .and_then(|c| self.descriptor_of(c))
            .unwrap_or("Ljava/lang/Object;")
            .to_string();
        let size = OBJECT_HEADER_SIZE + len * storage_width_of(&component).size_in_bytes();
        self.heap.allocate(
            class,
            ObjectBody::Array(vec![Value::zero_for(&component); len]),
            size,
        )
    }

    /// Live instances whose class is in `classes`
    pub fn instances_of(&self, classes: &FxHashSet<ObjectRef>) -> Vec<ObjectRef> {
        self.heap
            .objects()
            .filter(|(_, o)| matches!(o.body, ObjectBody::Instance(_)))
            .filter(|(_, o)| classes.contains(&o.header.class))
            .map(|(r, _)| r)
            .collect()
    }

    // ===== Members =====

    /// Declared method by name and signature
    pub fn find_declared_method(&self, class: ObjectRef, name: &str, signature: &str) -> Option<MethodId> {
        self.class(class)?.methods.iter().copied().find(|id| {
            self.methods
                .get(*id)
                .is_some_and(|m| m.name == name && m.signature == signature)
        })
    }

    /// Declared field by name and type
    pub fn find_declared_field(&self, class: ObjectRef, name: &str, descriptor: &str) -> Option<FieldId> {
        let data = self.class(class)?;
        data.instance_fields
            .iter()
            .chain(&data.static_fields)
            .copied()
            .find(|id| {
                self.fields
                    .get(*id)
                    .is_some_and(|f| f.name == name && f.descriptor == descriptor)
            })
    }

    /// Read an instance field
    pub fn get_field(&self, obj: ObjectRef, field: FieldId) -> Option<Value> {
        let offset = self.fields.get(field)?.offset;
        self.heap.fields(obj)?.get(offset).copied()
    }

    /// Write an instance field; returns `false` if there is no such slot
    pub fn set_field(&mut self, obj: ObjectRef, field: FieldId, value: Value) -> bool {
        let Some(offset) = self.fields.get(field).map(|f| f.offset) else {
            return false;
        };
        match self.heap.fields_mut(obj).and_then(|v| v.get_mut(offset)) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Read a static field
    pub fn get_static(&self, field: FieldId) -> Option<Value> {
        let f = self.fields.get(field)?;
        self.class(f.declaring_class)?.statics.get(f.offset).copied()
    }

    /// Write a static field; returns `false` if there is no such slot
    pub fn set_static(&mut self, field: FieldId, value: Value) -> bool {
        let Some((class, offset)) = self.fields.get(field).map(|f| (f.declaring_class, f.offset)) else {
            return false;
        };
        match self.heap.class_data_mut(class).and_then(|c| c.statics.get_mut(offset)) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Bind a native implementation to a native method
    pub fn register_native(&mut self, method: MethodId, entry: usize) -> bool {
        match self.methods.get_mut(method) {
            Some(m) if m.is_native() => {
                m.native_entry = Some(entry);
                true
            }
            _ => false,
        }
    }

    // ===== Metadata sources =====

    /// Definition a class was linked from
    pub fn class_def_of(&self, class: ObjectRef) -> Option<&ClassDef> {
        let data = self.class(class)?;
        self.dex_caches.get(data.dex_cache?)?.class_def(data.class_def_index)
    }

    /// Metadata source a method reads its code from
    ///
    /// An obsolete method recorded in its class's extension record reads
    /// from the source captured when it became obsolete.
    pub fn dex_cache_of(&self, method: MethodId) -> Option<DexCacheId> {
        let m = self.methods.get(method)?;
        let class = self.class(m.declaring_class)?;
        if m.is_obsolete() {
            if let Some(ext) = &class.ext {
                if let Some(slot) = ext.obsolete_slot_of(method) {
                    return ext.obsolete_dex_caches.get(slot).copied().flatten();
                }
            }
        }
        class.dex_cache
    }

    /// Code a frame executing `method` runs
    pub fn code_item_of(&self, method: MethodId) -> Option<&CodeItem> {
        let m = self.methods.get(method)?;
        let descriptor = self.descriptor_of(m.declaring_class)?;
        let cache = self.dex_caches.get(self.dex_cache_of(method)?)?;
        let index = cache.dex_file().find_class_def(descriptor)?;
        cache.code_item(index, m.method_index)
    }

    // ===== Monitors =====

    fn try_lock(&mut self, thread: ThreadId, obj: ObjectRef) -> Option<bool> {
        let header = &mut self.heap.get_mut(obj)?.header;
        match header.lock {
            LockWord::Unlocked => {
                header.lock = LockWord::Locked { owner: thread, count: 1 };
                Some(true)
            }
            LockWord::Locked { owner, count } if owner == thread => {
                header.lock = LockWord::Locked { owner, count: count + 1 };
                Some(true)
            }
            LockWord::Locked { .. } => Some(false),
        }
    }

    fn unlock(&mut self, thread: ThreadId, obj: ObjectRef) -> bool {
        let Some(header) = self.heap.get_mut(obj).map(|o| &mut o.header) else {
            return false;
        };
        match header.lock {
            LockWord::Locked { owner, count } if owner == thread => {
                header.lock = if count > 1 {
                    LockWord::Locked { owner, count: count - 1 }
                } else {
                    LockWord::Unlocked
                };
                true
            }
            _ => false,
        }
    }
}

/// The runtime
pub struct Runtime {
    safepoint: SafepointCoordinator,
    state: Mutex<RuntimeState>,
    monitor_released: Condvar,
    class_load_gate: ClassLoadGate,
    allocation_gate: AllocationGate,
}

impl Runtime {
    /// Create and bootstrap a runtime with the default verifier
    pub fn new(options: RuntimeOptions) -> Result<Self, LinkError> {
        Self::with_verifier(options, Box::new(DefaultVerifier))
    }

    /// Create and bootstrap a runtime with a custom verifier
    pub fn with_verifier(
        options: RuntimeOptions,
        verifier: Box<dyn ClassVerifier>,
    ) -> Result<Self, LinkError> {
        let mut state = RuntimeState::with_options(&options, verifier);
        state.bootstrap()?;
        log::info!(
            "runtime started (max heap {} bytes, jit {})",
            options.max_heap_bytes,
            if options.jit_enabled { "on" } else { "off" }
        );
        Ok(Self {
            safepoint: SafepointCoordinator::new(),
            state: Mutex::new(state),
            monitor_released: Condvar::new(),
            class_load_gate: ClassLoadGate::new(),
            allocation_gate: AllocationGate::new(),
        })
    }

    /// Lock the runtime state
    ///
    /// Outside a suspend-all, callers should hold [`ScopedObjectAccess`].
    pub fn lock_state(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock()
    }

    /// Acquire shared mutator access
    pub fn object_access(&self) -> ScopedObjectAccess<'_> {
        ScopedObjectAccess {
            runtime: self,
            guard: self.safepoint.shared_access(),
        }
    }

    /// Stop every other thread and take exclusive access to the state
    pub fn suspend_all(&self, reason: StopReason) -> ScopedSuspendAll<'_> {
        let world = self.safepoint.stop_the_world(reason);
        ScopedSuspendAll {
            state: self.state.lock(),
            _world: world,
        }
    }

    /// Safepoint coordinator
    pub fn safepoint(&self) -> &SafepointCoordinator {
        &self.safepoint
    }

    /// Gate held around class definition
    pub fn class_load_gate(&self) -> &ClassLoadGate {
        &self.class_load_gate
    }

    /// Gate held around allocation
    pub fn allocation_gate(&self) -> &AllocationGate {
        &self.allocation_gate
    }

    /// Attach the calling thread
    pub fn attach_thread(&self, name: &str) -> ThreadId {
        self.state.lock().threads.attach(name)
    }

    /// Detach a thread
    pub fn detach_thread(&self, thread: ThreadId) -> bool {
        self.state.lock().threads.detach(thread)
    }

    /// Create a class loader
    pub fn create_loader(&self) -> LoaderId {
        self.state.lock().class_linker.create_loader()
    }

    /// Define every class of a class file, in order
    ///
    /// Waits while class loading is paused by another thread.
    pub fn define_classes(
        &self,
        thread: ThreadId,
        loader: LoaderId,
        location: &str,
        data: &[u8],
    ) -> Result<Vec<ObjectRef>, LinkError> {
        self.class_load_gate.enter(thread);
        let result = {
            let mut state = self.state.lock();
            Self::define_all(&mut state, thread, loader, location, data)
        };
        self.class_load_gate.exit(thread);
        result
    }

    fn define_all(
        state: &mut RuntimeState,
        thread: ThreadId,
        loader: LoaderId,
        location: &str,
        data: &[u8],
    ) -> Result<Vec<ObjectRef>, LinkError> {
        let dex = state.open_dex_file(location, Arc::from(data), loader)?;
        let count = state
            .dex_caches
            .get(dex)
            .map_or(0, |c| c.dex_file().class_count());
        (0..count)
            .map(|index| state.define_class(thread, loader, dex, index))
            .collect()
    }

    /// Allocate an instance, waiting while allocation is paused by another thread
    pub fn alloc_object(&self, thread: ThreadId, class: ObjectRef) -> Result<ObjectRef, AllocError> {
        self.allocation_gate.wait_until_allowed(thread);
        self.state.lock().alloc_instance(class, true)
    }

    /// Run a full collection
    pub fn collect_garbage(&self) -> bool {
        let mut state = self.suspend_all(StopReason::GarbageCollection);
        state.collect_garbage()
    }

    /// Create a global reference
    pub fn new_global_ref(&self, obj: ObjectRef) -> GlobalRef {
        self.state.lock().globals.add(obj)
    }

    /// Object behind a global reference
    pub fn decode_global_ref(&self, handle: GlobalRef) -> Option<ObjectRef> {
        self.state.lock().globals.decode(handle)
    }

    /// Delete a global reference
    pub fn delete_global_ref(&self, handle: GlobalRef) {
        self.state.lock().globals.delete(handle);
    }

    /// Acquire the monitor of `obj`, blocking while another thread owns it
    ///
    /// Returns `false` if `obj` does not exist.
    pub fn monitor_enter(&self, thread: ThreadId, obj: ObjectRef) -> bool {
        let mut state = self.state.lock();
        loop {
            match state.try_lock(thread, obj) {
                Some(true) => return true,
                Some(false) => self.monitor_released.wait(&mut state),
                None => return false,
            }
        }
    }

    /// Release the monitor of `obj`; returns `false` if `thread` does not own it
    pub fn monitor_exit(&self, thread: ThreadId, obj: ObjectRef) -> bool {
        let released = self.state.lock().unlock(thread, obj);
        if released {
            self.monitor_released.notify_all();
        }
        released
    }
}

/// Shared mutator access to the heap
pub struct ScopedObjectAccess<'a> {
    runtime: &'a Runtime,
    guard: RwLockReadGuard<'a, ()>,
}

impl<'a> ScopedObjectAccess<'a> {
    /// Lock the runtime state
    pub fn state(&self) -> MutexGuard<'a, RuntimeState> {
        self.runtime.state.lock()
    }

    /// Runtime this access belongs to
    pub fn runtime(&self) -> &'a Runtime {
        self.runtime
    }

    /// Safepoint poll: let a pending suspend-all run
    pub fn poll(&mut self) {
        self.runtime.safepoint.yield_for_pause(&mut self.guard);
    }
}

/// Exclusive access to the state with every other thread stopped
pub struct ScopedSuspendAll<'a> {
    state: MutexGuard<'a, RuntimeState>,
    _world: StoppedWorld<'a>,
}

impl Deref for ScopedSuspendAll<'_> {
    type Target = RuntimeState;

    fn deref(&self) -> &RuntimeState {
        &self.state
    }
}

impl DerefMut for ScopedSuspendAll<'_> {
    fn deref_mut(&mut self) -> &mut RuntimeState {
        &mut self.state
    }
}
