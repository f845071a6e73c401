//! Commit of a validated batch
//!
//! Everything here runs with every other thread suspended and cannot fail:
//! the batch was fully validated and every allocation it needs was made
//! beforehand. [`commit_in_place`] rebinds a class to its new metadata
//! source. [`commit_structural`] moves state from old class objects and
//! instances to their replacements and swaps every reference to them.

use crate::obsolete::ObsoleteMap;
use crate::structural::CorrespondenceTable;
use morph_classfile::ClassDef;
use morph_runtime::class::ClassExt;
use morph_runtime::reflective::{ReflectiveAction, ReflectiveSource, ReflectiveVisitor};
use morph_runtime::{
    class_flags, method_flags, ClassLifecycle, DexCacheId, EntryPoint, FieldId, LockWord,
    MethodId, ObjectRef, OriginalDexFile, RuntimeState, Value,
};
use rustc_hash::{FxHashMap, FxHashSet};

/// Replace the definition of `class` without replacing the class object
///
/// Methods and fields keep their identity and are rebound to `new_cache`
/// by name and signature. Stack frames must already have been moved onto
/// obsolete copies; `obsolete` is published into the extension record only
/// if one of its slots was used.
pub fn commit_in_place(
    state: &mut RuntimeState,
    class: ObjectRef,
    new_cache: DexCacheId,
    original: Option<OriginalDexFile>,
    obsolete: ObsoleteMap,
) {
    let Some(def) = state
        .dex_caches
        .get(new_cache)
        .and_then(|c| c.class_def(0))
        .cloned()
    else {
        log::warn!("metadata source of {class} has no class definition");
        return;
    };
    let Some((methods, fields, old_cache, old_index)) = state.class(class).map(|d| {
        let fields: Vec<FieldId> = d.instance_fields.iter().chain(&d.static_fields).copied().collect();
        (d.methods.clone(), fields, d.dex_cache, d.class_def_index)
    }) else {
        return;
    };

    rebind_methods(state, &methods, &def);
    for id in fields {
        if let Some(f) = state.fields.get_mut(id) {
            if let Some((index, _)) = def.find_field(&f.name, &f.descriptor) {
                f.field_index = index;
            }
        }
    }

    let released = {
        let Some(data) = state.heap.class_data_mut(class) else {
            return;
        };
        data.dex_cache = Some(new_cache);
        data.class_def_index = 0;
        let ext = data.ext.get_or_insert_with(Box::default);
        if original.is_some() {
            ext.original_dex_file = original;
        }
        if ext.pre_redefine.is_none() {
            ext.pre_redefine = old_cache.map(|c| (c, old_index));
        }
        obsolete.install(ext)
    };
    state.heap.release_native(released);
    log::debug!("redefined {} in place", def.descriptor);
}

fn rebind_methods(state: &mut RuntimeState, methods: &[MethodId], def: &ClassDef) {
    for &id in methods {
        let invokable = {
            let Some(m) = state.methods.get_mut(id) else { continue };
            let Some((index, _)) = def.find_method(&m.name, &m.signature) else {
                continue;
            };
            m.method_index = index;
            m.entry_point = if m.is_native() {
                EntryPoint::Native
            } else {
                EntryPoint::Interpreter
            };
            m.clear_flag(method_flags::INTRINSIC);
            m.is_invokable()
        };
        if invokable {
            let RuntimeState {
                code_cache, methods, ..
            } = &mut *state;
            code_cache.notify_method_redefined(methods, id);
        }
    }
}

/// Keep a class that soft-failed verification in the interpreter with
/// access checks on until it is verified again
pub fn apply_soft_failure_flags(state: &mut RuntimeState, class: ObjectRef) {
    let Some(methods) = state.class(class).map(|d| d.methods.clone()) else {
        return;
    };
    for id in methods {
        if let Some(m) = state.methods.get_mut(id) {
            if !m.is_native() && m.is_invokable() && !m.is_obsolete() {
                m.clear_flag(method_flags::SKIP_ACCESS_CHECKS);
                m.set_flag(method_flags::DONT_COMPILE | method_flags::MUST_COUNT_LOCKS);
            }
        }
    }
}

// ===== Structural commit =====

/// Summary of a structural commit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StructuralCommitStats {
    /// Classes replaced
    pub classes: usize,
    /// Instances replaced
    pub instances: usize,
    /// Reflective references repointed or cleared
    pub reflective_updates: usize,
}

/// Swap every old class and instance in `table` for its replacement
///
/// `originals` gives the bytecode each redefined class reports as its
/// previous generation; classes rebuilt only because a superclass changed
/// carry theirs forward.
pub fn commit_structural(
    state: &mut RuntimeState,
    table: &CorrespondenceTable,
    originals: &FxHashMap<ObjectRef, OriginalDexFile>,
) -> StructuralCommitStats {
    copy_statics(state, table);
    copy_instance_fields(state, table);
    move_headers(state, table);
    retire_old_classes(state, table);

    let mut visitor = RetargetVisitor::build(state, table);
    let reflective_updates = state.visit_reflective_targets(&mut visitor);
    log::debug!("updated {reflective_updates} reflective references");

    {
        let RuntimeState {
            instrumentation,
            threads,
            ..
        } = &mut *state;
        instrumentation.deoptimize_all_thread_frames(threads);
    }
    state.replace_references(&table.replacement_map());
    install_extensions(state, table, originals);

    {
        let RuntimeState {
            code_cache, methods, ..
        } = &mut *state;
        code_cache.invalidate_all_compiled_code(methods);
    }
    clear_interpreter_caches(state);

    StructuralCommitStats {
        classes: table.classes().len(),
        instances: table.instances().len(),
        reflective_updates,
    }
}

/// Clear the interpreter cache of every thread
pub fn clear_interpreter_caches(state: &mut RuntimeState) {
    for thread in state.threads.iter_mut() {
        thread.interpreter_cache.clear();
    }
}

fn field_key(state: &RuntimeState, id: FieldId) -> Option<(String, String, usize)> {
    state
        .fields
        .get(id)
        .map(|f| (f.name.clone(), f.descriptor.clone(), f.offset))
}

fn copy_statics(state: &mut RuntimeState, table: &CorrespondenceTable) {
    for &(old, new) in table.classes() {
        let Some(old_fields) = state.class(old).map(|d| d.static_fields.clone()) else {
            continue;
        };
        let mut moves = Vec::new();
        for id in old_fields {
            let Some((name, descriptor, old_offset)) = field_key(state, id) else { continue };
            let new_offset = state
                .find_declared_field(new, &name, &descriptor)
                .and_then(|f| state.fields.get(f))
                .map(|f| f.offset);
            moves.push((old_offset, new_offset, descriptor));
        }
        let mut values = Vec::with_capacity(moves.len());
        if let Some(data) = state.heap.class_data_mut(old) {
            for (old_offset, new_offset, descriptor) in &moves {
                if let Some(slot) = data.statics.get_mut(*old_offset) {
                    let value = std::mem::replace(slot, Value::zero_for(descriptor));
                    if let Some(new_offset) = new_offset {
                        values.push((*new_offset, value));
                    }
                }
            }
        }
        if let Some(data) = state.heap.class_data_mut(new) {
            for (offset, value) in values {
                if let Some(slot) = data.statics.get_mut(offset) {
                    *slot = value;
                }
            }
        }
    }
}

/// Superclass chain of `class`, starting with `class` itself
fn class_chain(state: &RuntimeState, class: ObjectRef) -> Vec<ObjectRef> {
    let mut chain = Vec::new();
    let mut current = Some(class);
    while let Some(c) = current {
        chain.push(c);
        current = state.class(c).and_then(|d| d.super_class);
    }
    chain
}

/// (old slot, new slot, descriptor) for every instance field an old class
/// shares with its replacement, inherited fields included
fn instance_slot_moves(
    state: &RuntimeState,
    old: ObjectRef,
    new: ObjectRef,
) -> Vec<(usize, Option<usize>, String)> {
    let mut moves = Vec::new();
    let old_chain = class_chain(state, old);
    let new_chain = class_chain(state, new);
    for (o, n) in old_chain.iter().zip(&new_chain) {
        let Some(fields) = state.class(*o).map(|d| d.instance_fields.clone()) else {
            continue;
        };
        for id in fields {
            let Some((name, descriptor, old_slot)) = field_key(state, id) else { continue };
            let new_slot = if o == n {
                Some(old_slot)
            } else {
                state
                    .find_declared_field(*n, &name, &descriptor)
                    .and_then(|f| state.fields.get(f))
                    .map(|f| f.offset)
            };
            moves.push((old_slot, new_slot, descriptor));
        }
    }
    moves
}

fn copy_instance_fields(state: &mut RuntimeState, table: &CorrespondenceTable) {
    let mut plans: FxHashMap<ObjectRef, Vec<(usize, Option<usize>, String)>> = FxHashMap::default();
    for &(old, new) in table.classes() {
        plans.insert(old, instance_slot_moves(state, old, new));
    }
    for &(old_obj, new_obj) in table.instances() {
        let Some(moves) = state.heap.class_of(old_obj).and_then(|c| plans.get(&c)) else {
            continue;
        };
        let mut values = Vec::with_capacity(moves.len());
        if let Some(fields) = state.heap.fields_mut(old_obj) {
            for (old_slot, new_slot, descriptor) in moves {
                if let Some(slot) = fields.get_mut(*old_slot) {
                    let value = std::mem::replace(slot, Value::zero_for(descriptor));
                    if let Some(new_slot) = new_slot {
                        values.push((*new_slot, value));
                    }
                }
            }
        }
        if let Some(fields) = state.heap.fields_mut(new_obj) {
            for (slot, value) in values {
                if let Some(target) = fields.get_mut(slot) {
                    *target = value;
                }
            }
        }
    }
    log::debug!("migrated fields of {} instances", table.instances().len());
}

/// Hand lock words, identity hashes and finalizer registrations to the
/// replacements
fn move_headers(state: &mut RuntimeState, table: &CorrespondenceTable) {
    for &(old, new) in table.classes().iter().chain(table.instances()) {
        let Some(header) = state.heap.get_mut(old).map(|o| {
            let header = o.header;
            o.header.lock = LockWord::Unlocked;
            header
        }) else {
            continue;
        };
        if let Some(obj) = state.heap.get_mut(new) {
            obj.header.lock = header.lock;
            obj.header.hash_code = header.hash_code;
        }
        if state.heap.unregister_finalizer(old) {
            state.heap.register_finalizer(new);
        }
    }
}

/// Flag old classes and their methods obsolete, moving native entry points
/// to the replacements first
fn retire_old_classes(state: &mut RuntimeState, table: &CorrespondenceTable) {
    for &(old, new) in table.classes() {
        let Some(old_methods) = state.class(old).map(|d| d.methods.clone()) else {
            continue;
        };
        for id in old_methods {
            let native = state
                .methods
                .get(id)
                .filter(|m| m.is_native())
                .and_then(|m| m.native_entry.map(|e| (m.name.clone(), m.signature.clone(), e)));
            if let Some((name, signature, entry)) = native {
                if let Some(target) = state
                    .find_declared_method(new, &name, &signature)
                    .and_then(|n| state.methods.get_mut(n))
                {
                    target.native_entry = Some(entry);
                }
            }
            if let Some(m) = state.methods.get_mut(id) {
                m.set_flag(method_flags::OBSOLETE | method_flags::DONT_COMPILE);
            }
        }
        if let Some(data) = state.heap.class_data_mut(old) {
            data.class_flags |= class_flags::OBSOLETE;
            data.lifecycle = ClassLifecycle::Retired { superseded_by: new };
        }
    }
}

fn install_extensions(
    state: &mut RuntimeState,
    table: &CorrespondenceTable,
    originals: &FxHashMap<ObjectRef, OriginalDexFile>,
) {
    for &(old, new) in table.classes() {
        let Some((old_ext, old_cache, old_index)) = state
            .class(old)
            .map(|d| (d.ext.as_deref().cloned(), d.dex_cache, d.class_def_index))
        else {
            continue;
        };
        let original = originals.get(&old).cloned().or_else(|| {
            old_ext
                .as_ref()
                .and_then(|e| e.original_dex_file.clone())
                .or(old_cache.map(OriginalDexFile::MetadataSource))
        });
        let pre_redefine = old_ext
            .as_ref()
            .and_then(|e| e.pre_redefine)
            .or(old_cache.map(|c| (c, old_index)));
        if let Some(data) = state.heap.class_data_mut(new) {
            data.ext = Some(Box::new(ClassExt {
                original_dex_file: original,
                obsolete_class: Some(old),
                pre_redefine,
                ..ClassExt::default()
            }));
        }
    }
}

/// Repoints reflective references at replacement members and clears the
/// resolution-cache entries a replacement could shadow
pub struct RetargetVisitor {
    methods: FxHashMap<MethodId, MethodId>,
    fields: FxHashMap<FieldId, FieldId>,
    clear_methods: FxHashSet<MethodId>,
    clear_fields: FxHashSet<FieldId>,
}

impl RetargetVisitor {
    /// Compute member correspondences and clear sets for `table`
    pub fn build(state: &RuntimeState, table: &CorrespondenceTable) -> Self {
        let mut methods = FxHashMap::default();
        let mut fields = FxHashMap::default();
        let mut new_direct_methods: FxHashSet<(String, String)> = FxHashSet::default();
        let mut new_fields: FxHashSet<(String, String, bool)> = FxHashSet::default();

        for &(old, new) in table.classes() {
            let (Some(old_data), Some(new_data)) = (state.class(old), state.class(new)) else {
                continue;
            };
            for &id in &old_data.methods {
                if let Some(m) = state.methods.get(id) {
                    if let Some(target) = state.find_declared_method(new, &m.name, &m.signature) {
                        methods.insert(id, target);
                    }
                }
            }
            for &id in old_data.instance_fields.iter().chain(&old_data.static_fields) {
                if let Some(f) = state.fields.get(id) {
                    if let Some(target) = state.find_declared_field(new, &f.name, &f.descriptor) {
                        fields.insert(id, target);
                    }
                }
            }
            for m in new_data.methods.iter().filter_map(|id| state.methods.get(*id)) {
                if m.is_direct() {
                    new_direct_methods.insert((m.name.clone(), m.signature.clone()));
                }
            }
            for id in new_data.instance_fields.iter().chain(&new_data.static_fields) {
                if let Some(f) = state.fields.get(*id) {
                    new_fields.insert((f.name.clone(), f.descriptor.clone(), f.is_static()));
                }
            }
        }

        let mut affected: FxHashSet<ObjectRef> = FxHashSet::default();
        for &(old, _) in table.classes() {
            affected.extend(class_chain(state, old));
        }
        let mut clear_methods = FxHashSet::default();
        let mut clear_fields = FxHashSet::default();
        for class in affected {
            let Some(data) = state.class(class) else { continue };
            for &id in &data.methods {
                let Some(m) = state.methods.get(id) else { continue };
                if m.is_direct()
                    && !m.is_constructor()
                    && new_direct_methods.contains(&(m.name.clone(), m.signature.clone()))
                {
                    clear_methods.insert(id);
                }
            }
            for &id in data.instance_fields.iter().chain(&data.static_fields) {
                let Some(f) = state.fields.get(id) else { continue };
                if !f.is_private()
                    && new_fields.contains(&(f.name.clone(), f.descriptor.clone(), f.is_static()))
                {
                    clear_fields.insert(id);
                }
            }
        }

        Self {
            methods,
            fields,
            clear_methods,
            clear_fields,
        }
    }
}

impl ReflectiveVisitor for RetargetVisitor {
    fn visit_method(&mut self, source: ReflectiveSource, method: MethodId) -> ReflectiveAction<MethodId> {
        if source.is_resolution_cache() && self.clear_methods.contains(&method) {
            log::trace!("clearing {source:?} ({method:?})");
            return ReflectiveAction::Clear;
        }
        match self.methods.get(&method) {
            Some(new) => {
                log::trace!("repointing {source:?} from {method:?} to {new:?}");
                ReflectiveAction::Replace(*new)
            }
            None => ReflectiveAction::Keep,
        }
    }

    fn visit_field(&mut self, source: ReflectiveSource, field: FieldId) -> ReflectiveAction<FieldId> {
        if source.is_resolution_cache() && self.clear_fields.contains(&field) {
            log::trace!("clearing {source:?} ({field:?})");
            return ReflectiveAction::Clear;
        }
        match self.fields.get(&field) {
            Some(new) => {
                log::trace!("repointing {source:?} from {field:?} to {new:?}");
                ReflectiveAction::Replace(*new)
            }
            None => ReflectiveAction::Keep,
        }
    }
}
