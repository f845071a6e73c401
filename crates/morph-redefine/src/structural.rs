//! Structural rebuild
//!
//! A structural redefinition replaces the class object instead of mutating
//! it. For every structurally redefined class, and every loaded subclass of
//! one, a new class object is allocated and linked from its definition,
//! base classes first so that each subclass links against its new
//! superclass. Every live instance of an old class then gets a zeroed
//! counterpart of the new class. The pairs are collected in a
//! [`CorrespondenceTable`], which the commit consumes once.
//!
//! Nothing built here is reachable from the rest of the runtime until the
//! commit. A failed batch returns the native charges and leaves the objects
//! as garbage.

use crate::barrier::TemporaryRoots;
use crate::checker::declares_virtual_members;
use crate::error::ErrorCode;
use morph_classfile::VerifyOutcome;
use morph_runtime::class::CLASS_EXT_SIZE;
use morph_runtime::class_linker::compute_class_size;
use morph_runtime::method::METHOD_SIZE;
use morph_runtime::{
    class_flags, method_flags, AllocError, DexCacheId, LinkError, ObjectRef, RuntimeState,
};
use rustc_hash::{FxHashMap, FxHashSet};

/// Old-to-new pairs of classes and instances
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CorrespondenceTable {
    classes: Vec<(ObjectRef, ObjectRef)>,
    instances: Vec<(ObjectRef, ObjectRef)>,
    native_charge: usize,
    migrates_instances: bool,
}

impl CorrespondenceTable {
    /// (old, new) class pairs; a class always precedes its subclasses
    pub fn classes(&self) -> &[(ObjectRef, ObjectRef)] {
        &self.classes
    }

    /// (old, new) instance pairs
    pub fn instances(&self) -> &[(ObjectRef, ObjectRef)] {
        &self.instances
    }

    /// New class replacing `old`
    pub fn new_class_of(&self, old: ObjectRef) -> Option<ObjectRef> {
        self.classes.iter().find(|(o, _)| *o == old).map(|(_, n)| *n)
    }

    /// Every old class
    pub fn old_classes(&self) -> FxHashSet<ObjectRef> {
        self.classes.iter().map(|(old, _)| *old).collect()
    }

    /// Map from every old class and instance to its replacement
    pub fn replacement_map(&self) -> FxHashMap<ObjectRef, ObjectRef> {
        self.classes.iter().chain(&self.instances).copied().collect()
    }

    /// Whether there is nothing to replace
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    /// Whether live instances need new counterparts
    ///
    /// When no rebuilt class declares an instance field or a virtual
    /// method, instance layouts are unchanged and the commit only retargets
    /// their class pointers.
    pub fn migrates_instances(&self) -> bool {
        self.migrates_instances
    }

    /// Native bytes charged for the new classes
    pub fn native_charge(&self) -> usize {
        self.native_charge
    }

    /// Return the native charges of a table that will not be committed
    ///
    /// The new classes and instances are left for the collector.
    pub fn release(&mut self, state: &mut RuntimeState) {
        state.heap.release_native(std::mem::take(&mut self.native_charge));
    }
}

/// Where a rebuilt class takes its definition from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildSource {
    /// Class being replaced
    pub class: ObjectRef,
    /// Metadata source holding the definition
    pub dex_cache: DexCacheId,
    /// Index of the definition in the metadata source
    pub class_def_index: usize,
    /// Verification outcome of a replacement; `None` for a class rebuilt
    /// from its current definition
    pub verification: Option<VerifyOutcome>,
    /// The definition declares instance fields or virtual methods
    pub has_virtual_members: bool,
}

/// A class that could not be rebuilt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildFailure {
    /// Descriptor of the class
    pub descriptor: String,
    /// Status code
    pub code: ErrorCode,
    /// Reason
    pub reason: String,
}

impl RebuildFailure {
    fn new(state: &RuntimeState, class: ObjectRef, code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            descriptor: state.descriptor_of(class).unwrap_or("<unknown>").to_string(),
            code,
            reason: reason.into(),
        }
    }
}

/// Add every loaded, resolved subclass of the redefined classes and order
/// the result base classes first
///
/// A subclass already present in `redefined` keeps its own source.
pub fn plan_rebuild(state: &RuntimeState, redefined: Vec<RebuildSource>) -> Vec<RebuildSource> {
    let mut seen: FxHashSet<ObjectRef> = redefined.iter().map(|s| s.class).collect();
    let roots: Vec<ObjectRef> = redefined.iter().map(|s| s.class).collect();
    let mut plan = redefined;
    for root in roots {
        for sub in state.loaded_subclasses(root) {
            let Some(data) = state.class(sub) else { continue };
            let Some(dex_cache) = data.dex_cache else { continue };
            if !data.is_resolved() || !seen.insert(sub) {
                continue;
            }
            let has_virtual_members = state
                .dex_caches
                .get(dex_cache)
                .and_then(|c| c.class_def(data.class_def_index))
                .map_or(true, declares_virtual_members);
            plan.push(RebuildSource {
                class: sub,
                dex_cache,
                class_def_index: data.class_def_index,
                verification: None,
                has_virtual_members,
            });
        }
    }
    plan.sort_by_key(|s| state.superclass_depth(s.class));
    plan
}

fn oom(state: &RuntimeState, class: ObjectRef, e: &AllocError) -> RebuildFailure {
    RebuildFailure::new(
        state,
        class,
        ErrorCode::OutOfMemory,
        format!("Unable to allocate the structurally redefined class: {e}"),
    )
}

/// Allocate and link a new class object for every planned class
///
/// New class objects are rooted in `roots`.
pub fn build_classes(
    state: &mut RuntimeState,
    plan: &[RebuildSource],
    roots: &mut TemporaryRoots<'_>,
) -> Result<CorrespondenceTable, RebuildFailure> {
    let mut table = CorrespondenceTable::default();
    let mut charged = 0;
    for source in plan {
        match build_class(state, source, &table, roots, &mut charged) {
            Ok(new) => table.classes.push((source.class, new)),
            Err(f) => {
                state.heap.release_native(charged);
                return Err(f);
            }
        }
    }
    table.native_charge = charged;
    table.migrates_instances = plan.iter().any(|s| s.has_virtual_members);
    log::debug!("built {} replacement classes", table.classes.len());
    Ok(table)
}

fn build_class(
    state: &mut RuntimeState,
    source: &RebuildSource,
    table: &CorrespondenceTable,
    roots: &mut TemporaryRoots<'_>,
    charged: &mut usize,
) -> Result<ObjectRef, RebuildFailure> {
    let old = source.class;
    let Some(old_data) = state.class(old).cloned() else {
        return Err(RebuildFailure::new(state, old, ErrorCode::InvalidClass, "class vanished"));
    };
    let Some(def) = state
        .dex_caches
        .get(source.dex_cache)
        .and_then(|c| c.class_def(source.class_def_index))
    else {
        return Err(RebuildFailure::new(
            state,
            old,
            ErrorCode::Internal,
            "definition missing from its metadata source",
        ));
    };
    let class_size = compute_class_size(def);
    let method_charge = def.methods.len() * METHOD_SIZE;

    state
        .heap
        .charge_native(CLASS_EXT_SIZE)
        .map_err(|e| oom(state, old, &e))?;
    *charged += CLASS_EXT_SIZE;
    let new = state
        .alloc_class_object(&old_data.descriptor, old_data.loader, class_size)
        .map_err(|e| oom(state, old, &e))?;
    roots.root(state, new);

    let super_class = old_data
        .super_class
        .map(|s| table.new_class_of(s).unwrap_or(s));
    state
        .load_and_link(
            new,
            source.dex_cache,
            source.class_def_index,
            super_class,
            old_data.interfaces.clone(),
        )
        .map_err(|e| match e {
            LinkError::OutOfMemory(e) => oom(state, old, &e),
            other => RebuildFailure::new(state, old, ErrorCode::Internal, other.to_string()),
        })?;
    *charged += method_charge;

    match &source.verification {
        Some(outcome) => state.apply_verification_result(new, outcome),
        None => copy_access_check_flags(state, old, new),
    }

    if let Some(data) = state.heap.class_data_mut(new) {
        data.class_flags |= old_data.class_flags
            & (class_flags::VERIFICATION_ATTEMPTED | class_flags::SKIP_HIDDEN_API);
        data.clinit_thread = old_data.clinit_thread;
        data.status = old_data.status;
    }
    log::trace!("built {} as {new} (old {old})", old_data.descriptor);
    Ok(new)
}

/// Give each method of `new` the access-check flag of its namesake in `old`
fn copy_access_check_flags(state: &mut RuntimeState, old: ObjectRef, new: ObjectRef) {
    let Some(methods) = state.class(new).map(|d| d.methods.clone()) else {
        return;
    };
    for id in methods {
        let Some((name, signature)) = state.methods.get(id).map(|m| (m.name.clone(), m.signature.clone())) else {
            continue;
        };
        let skip = state
            .find_declared_method(old, &name, &signature)
            .and_then(|m| state.methods.get(m))
            .is_some_and(|m| m.has_flag(method_flags::SKIP_ACCESS_CHECKS));
        if let Some(m) = state.methods.get_mut(id) {
            if skip {
                m.set_flag(method_flags::SKIP_ACCESS_CHECKS);
            } else {
                m.clear_flag(method_flags::SKIP_ACCESS_CHECKS);
            }
        }
    }
}

/// Allocate a zeroed counterpart for every live instance of an old class
///
/// Finalizer registration is left to the commit. Returns the number of
/// instances created.
pub fn create_instances(
    state: &mut RuntimeState,
    table: &mut CorrespondenceTable,
) -> Result<usize, RebuildFailure> {
    let old_classes = table.old_classes();
    let class_map: FxHashMap<ObjectRef, ObjectRef> = table.classes.iter().copied().collect();
    let old_instances = state.instances_of(&old_classes);
    for old in old_instances {
        let Some(class) = state.heap.class_of(old) else { continue };
        let Some(new_class) = class_map.get(&class).copied() else { continue };
        let new = state
            .alloc_instance(new_class, false)
            .map_err(|e| {
                RebuildFailure::new(
                    state,
                    class,
                    ErrorCode::OutOfMemory,
                    format!("Unable to allocate a replacement instance: {e}"),
                )
            })?;
        table.instances.push((old, new));
    }
    log::debug!("created {} replacement instances", table.instances.len());
    Ok(table.instances.len())
}
