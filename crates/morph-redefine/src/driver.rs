//! Batch redefinition driver
//!
//! [`Redefiner::redefine_classes`] takes a batch through its phases:
//!
//! 1. argument validation
//! 2. load and check every replacement under shared heap access
//! 3. allocate everything the commit needs: metadata sources, extension
//!    records, obsolete-method tables and, for structural changes, the new
//!    class objects and instances
//! 4. commit with every other thread suspended
//! 5. re-verify classes that soft-failed verification
//!
//! A failure in phases 1 to 3 leaves every class untouched. Nothing in
//! phase 4 can fail.

use crate::barrier::{AllocationPause, ClassLoadPause, GcDisabled, HeldMonitors, JitSuspension, TemporaryRoots};
use crate::checker::{CheckOutcome, Checker, Kind, RedefinitionMode};
use crate::config::AgentEnv;
use crate::error::{ErrorCode, FailureRecorder, RedefineError};
use crate::loader::ReplacementUnit;
use crate::obsolete::ObsoleteMap;
use crate::reverify::reverify_class;
use crate::rewriter::{apply_soft_failure_flags, clear_interpreter_caches, commit_in_place, commit_structural};
use crate::stack_walker::migrate_obsolete_frames;
use crate::structural::{build_classes, create_instances, plan_rebuild, CorrespondenceTable, RebuildSource};
use morph_runtime::class::CLASS_EXT_SIZE;
use morph_runtime::{
    DexCacheId, GlobalRef, MethodId, ObjectRef, OriginalDexFile, Runtime, RuntimeState, StopReason, ThreadId,
};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

/// New bytecode for one loaded class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDefinition {
    /// Class to redefine
    pub class: GlobalRef,
    /// Single-class definition replacing it
    pub data: Vec<u8>,
    /// Bytes to report as the class's previous generation
    pub original_override: Option<Vec<u8>>,
}

impl ClassDefinition {
    /// Definition without an original-bytecode override
    pub fn new(class: GlobalRef, data: Vec<u8>) -> Self {
        Self {
            class,
            data,
            original_override: None,
        }
    }

    /// Pin the bytes reported as the previous generation
    pub fn with_original(mut self, original: Vec<u8>) -> Self {
        self.original_override = Some(original);
        self
    }
}

/// One class of a batch, from check to commit
pub(crate) struct ClassRedefinition<'d> {
    pub(crate) class: ObjectRef,
    pub(crate) descriptor: String,
    pub(crate) unit: ReplacementUnit,
    pub(crate) original_override: Option<&'d [u8]>,
    pub(crate) outcome: CheckOutcome,
    pub(crate) kind: Kind,
    pub(crate) modified: bool,
    pub(crate) new_cache: Option<DexCacheId>,
    pub(crate) original: Option<OriginalDexFile>,
    pub(crate) obsolete: Option<ObsoleteMap>,
    pub(crate) ext_charge: usize,
}

impl ClassRedefinition<'_> {
    fn needs_reverify(&self) -> bool {
        self.modified && self.outcome.needs_reverify
    }

    /// Return native charges taken for a batch that will not commit and
    /// drop its staged metadata source
    fn release(&mut self, state: &mut RuntimeState) {
        if let Some(map) = self.obsolete.take() {
            state.heap.release_native(map.charged());
        }
        state.heap.release_native(std::mem::take(&mut self.ext_charge));
        if let Some(cache) = self.new_cache.take() {
            state.unregister_dex_file(cache);
        }
    }
}

/// Redefines classes on behalf of one agent environment and thread
pub struct Redefiner<'a> {
    runtime: &'a Runtime,
    env: &'a AgentEnv,
    thread: ThreadId,
}

impl<'a> Redefiner<'a> {
    /// Create a redefiner for requests made by `thread`
    pub fn new(runtime: &'a Runtime, env: &'a AgentEnv, thread: ThreadId) -> Self {
        Self { runtime, env, thread }
    }

    /// Whether `class` could ever be redefined
    pub fn is_modifiable_class(&self, class: GlobalRef) -> Result<bool, RedefineError> {
        self.env.ensure_valid()?;
        let state = self.runtime.lock_state();
        let class = decode_class(&state, class)?;
        let checker = Checker::new(self.env.config(), self.thread);
        eligibility(checker.check_redefinable(&state, class))
    }

    /// Whether `class` could ever be redefined structurally
    pub fn is_structurally_modifiable_class(&self, class: GlobalRef) -> Result<bool, RedefineError> {
        self.env.ensure_valid()?;
        let mut state = self.runtime.lock_state();
        let class = decode_class(&state, class)?;
        let checker = Checker::new(self.env.config(), self.thread);
        let result = checker
            .check_redefinable(&state, class)
            .and_then(|()| checker.check_structurally_redefinable(&mut state, class));
        eligibility(result)
    }

    /// Redefine every class of `definitions` or none of them
    pub fn redefine_classes(
        &self,
        mode: RedefinitionMode,
        definitions: &[ClassDefinition],
    ) -> Result<(), RedefineError> {
        self.env.ensure_valid()?;
        if definitions.is_empty() {
            return Ok(());
        }
        self.check_capability(mode)?;
        let classes = self.decode_definitions(definitions)?;
        log::debug!("redefining {} classes ({mode:?})", classes.len());

        let _jit = JitSuspension::new(self.runtime);
        let mut monitors = HeldMonitors::acquire(self.runtime, self.thread, &classes);
        let mut recorder = FailureRecorder::new();

        let mut redefinitions = {
            let soa = self.runtime.object_access();
            let mut state = soa.state();
            match self.prepare(&mut state, mode, &classes, definitions, &mut recorder) {
                Some(r) => r,
                None => return recorder.into_result(),
            }
        };
        log::debug!("checked {} classes", redefinitions.len());

        let structural = redefinitions
            .iter()
            .any(|r| r.modified && r.kind == Kind::Structural);
        let class_load_pause = structural.then(|| ClassLoadPause::new(self.runtime.class_load_gate(), self.thread));
        let mut roots = TemporaryRoots::new(self.runtime);

        let mut table = {
            let soa = self.runtime.object_access();
            let mut state = soa.state();
            match self.allocate(&mut state, &mut redefinitions, &mut roots, &mut recorder) {
                Some(table) => table,
                None => {
                    for r in &mut redefinitions {
                        r.release(&mut state);
                    }
                    return recorder.into_result();
                }
            }
        };

        let mut allocation_pause = None;
        let mut gc_disabled = None;
        if table.migrates_instances() {
            allocation_pause = Some(AllocationPause::new(self.runtime.allocation_gate(), self.thread));
            if self.env.config().checks.collect_before_instance_scan {
                self.runtime.collect_garbage();
            }
            gc_disabled = Some(GcDisabled::new(self.runtime));
            let soa = self.runtime.object_access();
            let mut state = soa.state();
            match create_instances(&mut state, &mut table) {
                Ok(count) => log::debug!("{count} instances to migrate"),
                Err(f) => {
                    recorder.record(f.code, &f.descriptor, &f.reason);
                    table.release(&mut state);
                    for r in &mut redefinitions {
                        r.release(&mut state);
                    }
                    return recorder.into_result();
                }
            }
        } else if !table.is_empty() {
            log::debug!("no rebuilt class declares instance members; instances keep their layout");
        }

        {
            let mut world = self.runtime.suspend_all(StopReason::Redefinition);
            commit(&mut world, &mut redefinitions, &table);
        }
        monitors.retarget(&table.classes().iter().copied().collect::<FxHashMap<_, _>>());
        log::debug!("committed {} classes", redefinitions.len());

        let reverify: Vec<ObjectRef> = redefinitions
            .iter()
            .filter(|r| r.needs_reverify())
            .map(|r| table.new_class_of(r.class).unwrap_or(r.class))
            .collect();
        drop(gc_disabled);
        drop(allocation_pause);
        drop(class_load_pause);
        drop(roots);
        if !reverify.is_empty() {
            let soa = self.runtime.object_access();
            let mut state = soa.state();
            for class in reverify {
                reverify_class(&mut state, class);
            }
        }
        Ok(())
    }

    fn check_capability(&self, mode: RedefinitionMode) -> Result<(), RedefineError> {
        let capabilities = self.env.capabilities();
        let held = match mode {
            RedefinitionMode::InPlace => capabilities.can_redefine_classes,
            RedefinitionMode::Structural => capabilities.can_structurally_redefine_classes,
        };
        if held {
            Ok(())
        } else {
            Err(RedefineError::new(
                ErrorCode::MustPossessCapability,
                format!("{mode:?} redefinition is not enabled for this environment"),
            ))
        }
    }

    fn decode_definitions(&self, definitions: &[ClassDefinition]) -> Result<Vec<ObjectRef>, RedefineError> {
        let state = self.runtime.lock_state();
        let mut seen = FxHashSet::default();
        let mut classes = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let class = decode_class(&state, definition.class)?;
            if definition.data.is_empty() {
                return Err(RedefineError::new(ErrorCode::NullPointer, "class definition has no bytes"));
            }
            if !seen.insert(class) {
                return Err(RedefineError::new(
                    ErrorCode::IllegalArgument,
                    format!(
                        "{} is redefined twice in one batch",
                        state.descriptor_of(class).unwrap_or("<unknown>")
                    ),
                ));
            }
            classes.push(class);
        }
        Ok(classes)
    }

    /// Load and check every definition; `None` once a failure is recorded
    fn prepare<'d>(
        &self,
        state: &mut RuntimeState,
        mode: RedefinitionMode,
        classes: &[ObjectRef],
        definitions: &'d [ClassDefinition],
        recorder: &mut FailureRecorder,
    ) -> Option<Vec<ClassRedefinition<'d>>> {
        let mut loaded = Vec::with_capacity(classes.len());
        for (&class, definition) in classes.iter().zip(definitions) {
            let descriptor = state.descriptor_of(class).unwrap_or("<unknown>").to_string();
            let hint = state
                .class(class)
                .and_then(|d| d.dex_cache)
                .and_then(|c| state.dex_caches.get(c))
                .map_or_else(|| descriptor.clone(), |c| c.dex_file().location().to_string());
            match ReplacementUnit::load(&hint, &definition.data) {
                Ok(unit) => loaded.push((class, descriptor, unit, definition.original_override.as_deref())),
                Err(e) => {
                    recorder.record(e.code(), &descriptor, &e.to_string());
                    return None;
                }
            }
        }
        loaded.sort_by_key(|(class, ..)| state.superclass_depth(*class));

        let checker = Checker::new(self.env.config(), self.thread);
        let mut redefinitions = Vec::with_capacity(loaded.len());
        for (class, descriptor, unit, original_override) in loaded {
            let outcome = match checker.check(state, class, unit.class_def(), mode) {
                Ok(outcome) => outcome,
                Err((code, reason)) => {
                    recorder.record(code, &descriptor, &reason);
                    return None;
                }
            };
            redefinitions.push(ClassRedefinition {
                class,
                descriptor,
                unit,
                original_override,
                kind: outcome.kind,
                outcome,
                modified: false,
                new_cache: None,
                original: None,
                obsolete: None,
                ext_charge: 0,
            });
        }

        // A subclass of a structurally redefined class is rebuilt too
        for i in 0..redefinitions.len() {
            if redefinitions[i].kind == Kind::Structural {
                continue;
            }
            let class = redefinitions[i].class;
            let under_structural = redefinitions[..i].iter().any(|r| {
                r.kind == Kind::Structural && r.class != class && state.is_subclass_of(class, r.class)
            });
            if under_structural {
                if let Err((code, reason)) = checker.check_structurally_redefinable(state, class) {
                    recorder.record(code, &redefinitions[i].descriptor, &reason);
                    return None;
                }
                redefinitions[i].kind = Kind::Structural;
            }
        }

        for r in &mut redefinitions {
            r.modified = r.original_override.is_some()
                || r.kind == Kind::Structural
                || state.class_def_of(r.class) != Some(r.unit.class_def());
            if !r.modified {
                log::debug!("{} is unchanged; nothing to commit", r.descriptor);
            }
        }
        Some(redefinitions)
    }

    /// Make every allocation the commit needs; `None` once a failure is
    /// recorded
    fn allocate(
        &self,
        state: &mut RuntimeState,
        redefinitions: &mut [ClassRedefinition<'_>],
        roots: &mut TemporaryRoots<'_>,
        recorder: &mut FailureRecorder,
    ) -> Option<CorrespondenceTable> {
        let mut sources = Vec::new();
        for r in redefinitions.iter_mut().filter(|r| r.modified) {
            if let Err((code, reason)) = allocate_class(state, r) {
                recorder.record(code, &r.descriptor, &reason);
                return None;
            }
            if r.kind == Kind::Structural {
                if let Some(dex_cache) = r.new_cache {
                    sources.push(RebuildSource {
                        class: r.class,
                        dex_cache,
                        class_def_index: 0,
                        verification: Some(r.outcome.verification.clone()),
                        has_virtual_members: r.outcome.has_virtual_members,
                    });
                }
            }
        }
        if sources.is_empty() {
            return Some(CorrespondenceTable::default());
        }
        let plan = plan_rebuild(state, sources);
        match build_classes(state, &plan, roots) {
            Ok(table) => Some(table),
            Err(f) => {
                recorder.record(f.code, &f.descriptor, &f.reason);
                None
            }
        }
    }
}

/// Handle of a class named by a client
fn decode_class(state: &RuntimeState, handle: GlobalRef) -> Result<ObjectRef, RedefineError> {
    if handle.is_null() {
        return Err(RedefineError::new(ErrorCode::NullPointer, "class handle is null"));
    }
    let obj = state
        .globals
        .decode(handle)
        .ok_or_else(|| RedefineError::new(ErrorCode::NullPointer, "class handle was deleted"))?;
    if state.class(obj).is_none() {
        return Err(RedefineError::new(ErrorCode::InvalidClass, format!("{obj} is not a class")));
    }
    Ok(obj)
}

/// Query answer for an eligibility result
fn eligibility(result: Result<(), (ErrorCode, String)>) -> Result<bool, RedefineError> {
    match result {
        Ok(()) => Ok(true),
        Err((ErrorCode::UnmodifiableClass, _)) => Ok(false),
        Err((ErrorCode::InvalidClass, message)) => Err(RedefineError::new(ErrorCode::InvalidClass, message)),
        Err(_) => Ok(true),
    }
}

fn oom(e: impl std::fmt::Display) -> (ErrorCode, String) {
    (ErrorCode::OutOfMemory, e.to_string())
}

/// Metadata source, original bytecode and obsolete tables of one class
fn allocate_class(state: &mut RuntimeState, r: &mut ClassRedefinition<'_>) -> Result<(), (ErrorCode, String)> {
    let (loader, current_cache, existing_original, has_ext) = {
        let data = state
            .class(r.class)
            .ok_or_else(|| (ErrorCode::InvalidClass, format!("{} is not a class", r.class)))?;
        (
            data.loader,
            data.dex_cache,
            data.ext.as_ref().and_then(|e| e.original_dex_file.clone()),
            data.ext.is_some(),
        )
    };
    r.new_cache = Some(
        state
            .register_dex_file(Arc::clone(r.unit.dex_file()), loader)
            .map_err(|e| oom(format!("Unable to allocate a metadata source: {e}")))?,
    );

    r.original = match r.original_override {
        Some(bytes) => {
            let mut copy = Vec::new();
            copy.try_reserve_exact(bytes.len())
                .map_err(|e| oom(format!("Unable to allocate array for original dex file: {e}")))?;
            copy.extend_from_slice(bytes);
            Some(OriginalDexFile::Bytes(Arc::from(copy.into_boxed_slice())))
        }
        None => existing_original.or(current_cache.map(OriginalDexFile::MetadataSource)),
    };

    if r.kind == Kind::InPlace {
        if !has_ext {
            state
                .heap
                .charge_native(CLASS_EXT_SIZE)
                .map_err(|e| oom(format!("Unable to allocate the extension record: {e}")))?;
            r.ext_charge = CLASS_EXT_SIZE;
        }
        r.obsolete = Some(
            ObsoleteMap::allocate(state, r.class)
                .map_err(|e| oom(format!("Unable to allocate obsolete method tables: {e}")))?,
        );
    }
    Ok(())
}

/// Apply the batch; runs with every other thread suspended
fn commit(state: &mut RuntimeState, redefinitions: &mut [ClassRedefinition<'_>], table: &CorrespondenceTable) {
    let mut doomed: Vec<MethodId> = Vec::new();
    for r in redefinitions.iter().filter(|r| r.modified) {
        if let Some(data) = state.class(r.class) {
            doomed.extend_from_slice(&data.methods);
        }
    }
    for &(old, _) in table.classes() {
        if let Some(data) = state.class(old) {
            doomed.extend_from_slice(&data.methods);
        }
    }
    let removed = state.instrumentation.breakpoints.remove_for_methods(&doomed);
    if removed > 0 {
        log::debug!("removed {removed} breakpoints");
    }

    let mut staged: Vec<(usize, ObsoleteMap)> = Vec::new();
    for (i, r) in redefinitions.iter_mut().enumerate() {
        if let Some(map) = r.obsolete.take() {
            staged.push((i, map));
        }
    }
    let (indices, mut maps): (Vec<usize>, Vec<ObsoleteMap>) = staged.into_iter().unzip();
    if !maps.is_empty() {
        let RuntimeState {
            threads,
            methods,
            code_cache,
            ..
        } = &mut *state;
        let migrated = migrate_obsolete_frames(threads, methods, code_cache, &mut maps);
        log::debug!("moved {migrated} frames onto obsolete methods");
    }
    for (i, map) in indices.into_iter().zip(maps) {
        let r = &mut redefinitions[i];
        let Some(new_cache) = r.new_cache else {
            state.heap.release_native(map.charged());
            continue;
        };
        commit_in_place(state, r.class, new_cache, r.original.take(), map);
    }

    if !table.is_empty() {
        let originals: FxHashMap<ObjectRef, OriginalDexFile> = redefinitions
            .iter_mut()
            .filter(|r| r.kind == Kind::Structural)
            .filter_map(|r| r.original.take().map(|o| (r.class, o)))
            .collect();
        let stats = commit_structural(state, table, &originals);
        log::debug!(
            "replaced {} classes and {} instances",
            stats.classes,
            stats.instances
        );
    } else {
        clear_interpreter_caches(state);
    }

    for r in redefinitions.iter().filter(|r| r.needs_reverify()) {
        let class = table.new_class_of(r.class).unwrap_or(r.class);
        apply_soft_failure_flags(state, class);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Capabilities, RedefinitionConfig};
    use morph_classfile::{ClassDef, ClassFile};
    use morph_runtime::{LoaderId, RuntimeOptions};

    fn setup() -> (Runtime, AgentEnv, ThreadId, GlobalRef) {
        let rt = Runtime::new(RuntimeOptions::default()).unwrap();
        let t = rt.attach_thread("agent");
        let bytes = ClassFile::single(ClassDef::new("LFoo;", Some("Ljava/lang/Object;"))).encode();
        let class = rt.define_classes(t, LoaderId::BOOT, "foo.mdef", &bytes).unwrap()[0];
        let handle = rt.new_global_ref(class);
        (rt, AgentEnv::default(), t, handle)
    }

    fn foo_bytes() -> Vec<u8> {
        ClassFile::single(ClassDef::new("LFoo;", Some("Ljava/lang/Object;"))).encode()
    }

    fn code_of(result: Result<(), RedefineError>) -> ErrorCode {
        result.unwrap_err().code
    }

    #[test]
    fn test_empty_batch_is_ok() {
        let (rt, env, t, _) = setup();
        let redefiner = Redefiner::new(&rt, &env, t);
        assert_eq!(redefiner.redefine_classes(RedefinitionMode::InPlace, &[]), Ok(()));
    }

    #[test]
    fn test_disposed_environment() {
        let (rt, env, t, _) = setup();
        env.dispose();
        let redefiner = Redefiner::new(&rt, &env, t);
        assert_eq!(
            code_of(redefiner.redefine_classes(RedefinitionMode::InPlace, &[])),
            ErrorCode::InvalidEnvironment
        );
    }

    #[test]
    fn test_argument_validation_order() {
        let (rt, env, t, handle) = setup();
        let redefiner = Redefiner::new(&rt, &env, t);

        let structural = [ClassDefinition::new(GlobalRef::NULL, vec![])];
        assert_eq!(
            code_of(redefiner.redefine_classes(RedefinitionMode::Structural, &structural)),
            ErrorCode::MustPossessCapability
        );
        assert_eq!(
            code_of(redefiner.redefine_classes(RedefinitionMode::InPlace, &structural)),
            ErrorCode::NullPointer
        );

        let object = rt.lock_state().class_linker.well_known().object;
        let instance = rt.alloc_object(t, object).unwrap();
        let not_a_class = [ClassDefinition::new(rt.new_global_ref(instance), foo_bytes())];
        assert_eq!(
            code_of(redefiner.redefine_classes(RedefinitionMode::InPlace, &not_a_class)),
            ErrorCode::InvalidClass
        );

        let empty = [ClassDefinition::new(handle, vec![])];
        assert_eq!(
            code_of(redefiner.redefine_classes(RedefinitionMode::InPlace, &empty)),
            ErrorCode::NullPointer
        );

        let twice = [
            ClassDefinition::new(handle, foo_bytes()),
            ClassDefinition::new(handle, foo_bytes()),
        ];
        assert_eq!(
            code_of(redefiner.redefine_classes(RedefinitionMode::InPlace, &twice)),
            ErrorCode::IllegalArgument
        );
    }

    #[test]
    fn test_in_place_capability() {
        let (rt, _, t, handle) = setup();
        let env = AgentEnv::new(RedefinitionConfig {
            capabilities: Capabilities {
                can_redefine_classes: false,
                can_structurally_redefine_classes: true,
            },
            ..RedefinitionConfig::default()
        });
        let redefiner = Redefiner::new(&rt, &env, t);
        let defs = [ClassDefinition::new(handle, foo_bytes())];
        assert_eq!(
            code_of(redefiner.redefine_classes(RedefinitionMode::InPlace, &defs)),
            ErrorCode::MustPossessCapability
        );
        assert_eq!(redefiner.redefine_classes(RedefinitionMode::Structural, &defs), Ok(()));
    }

    #[test]
    fn test_query_surface() {
        let (rt, env, t, handle) = setup();
        let redefiner = Redefiner::new(&rt, &env, t);
        assert_eq!(redefiner.is_modifiable_class(handle), Ok(true));
        assert_eq!(redefiner.is_structurally_modifiable_class(handle), Ok(true));

        let (object, thread_class) = {
            let state = rt.lock_state();
            let wk = state.class_linker.well_known();
            (wk.object, wk.thread)
        };
        assert_eq!(redefiner.is_modifiable_class(rt.new_global_ref(object)), Ok(false));
        let thread_handle = rt.new_global_ref(thread_class);
        assert_eq!(redefiner.is_modifiable_class(thread_handle), Ok(true));
        assert_eq!(redefiner.is_structurally_modifiable_class(thread_handle), Ok(false));
        assert_eq!(
            redefiner.is_modifiable_class(GlobalRef::NULL).unwrap_err().code,
            ErrorCode::NullPointer
        );
    }
}
