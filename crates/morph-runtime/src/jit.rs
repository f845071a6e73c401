//! JIT code cache
//!
//! Tracks which methods have compiled code, the inline caches baked into that
//! code and per-method profiling data. Code generation itself is not modeled:
//! compiling a method installs a [`CompiledMethod`] record and switches its
//! entry point. Identity changes made by redefinition are reported here and
//! kept in an event log.

use crate::method::{method_flags, EntryPoint, FieldId, MethodArena, MethodId};
use rustc_hash::FxHashMap;

/// Compiled code for one method
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledMethod {
    /// Call targets devirtualized into the code
    pub inline_cache: Vec<MethodId>,
    /// Fields accessed directly by the code
    pub field_cache: Vec<FieldId>,
}

/// Profiling counters of one method
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfilingInfo {
    /// Number of invocations observed
    pub invocations: u32,
}

/// Notification received by the code cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeCacheEvent {
    /// A method's bytecode was replaced in place
    MethodRedefined(MethodId),
    /// A method's identity moved to an obsolete copy
    MethodMoved {
        /// Original method
        from: MethodId,
        /// Obsolete copy
        to: MethodId,
    },
    /// All compiled code was discarded
    InvalidatedAll,
}

/// The code cache
#[derive(Debug, Default)]
pub struct CodeCache {
    enabled: bool,
    suspend_count: u32,
    compiled: FxHashMap<MethodId, CompiledMethod>,
    profiles: FxHashMap<MethodId, ProfilingInfo>,
    events: Vec<CodeCacheEvent>,
}

impl CodeCache {
    /// Create a cache; a disabled cache never compiles
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    /// Whether compilation is currently suspended
    pub fn is_suspended(&self) -> bool {
        self.suspend_count > 0
    }

    /// Suspend compilation (nests)
    pub fn suspend(&mut self) {
        self.suspend_count += 1;
    }

    /// Undo one [`suspend`](Self::suspend)
    pub fn resume(&mut self) {
        self.suspend_count = self.suspend_count.saturating_sub(1);
    }

    /// Install compiled code for `method`
    ///
    /// Returns `false` when the JIT is disabled or suspended, or the method
    /// must not be compiled.
    pub fn compile(
        &mut self,
        methods: &mut MethodArena,
        method: MethodId,
        code: CompiledMethod,
    ) -> bool {
        if !self.enabled || self.is_suspended() {
            return false;
        }
        let Some(m) = methods.get_mut(method) else {
            return false;
        };
        if m.is_obsolete() || m.is_native() || m.has_flag(method_flags::DONT_COMPILE) || !m.is_invokable() {
            return false;
        }
        m.entry_point = EntryPoint::Compiled;
        self.compiled.insert(method, code);
        true
    }

    /// Compiled code of a method
    pub fn compiled(&self, method: MethodId) -> Option<&CompiledMethod> {
        self.compiled.get(&method)
    }

    /// Every compiled method
    pub fn compiled_methods_mut(&mut self) -> impl Iterator<Item = (&MethodId, &mut CompiledMethod)> {
        self.compiled.iter_mut()
    }

    /// Number of compiled methods
    pub fn compiled_count(&self) -> usize {
        self.compiled.len()
    }

    /// Count one invocation of `method`
    pub fn record_invocation(&mut self, method: MethodId) {
        self.profiles.entry(method).or_default().invocations += 1;
    }

    /// Profiling data of a method
    pub fn profile(&self, method: MethodId) -> Option<&ProfilingInfo> {
        self.profiles.get(&method)
    }

    /// A method's bytecode was replaced: drop its code and profile
    pub fn notify_method_redefined(&mut self, methods: &mut MethodArena, method: MethodId) {
        if self.compiled.remove(&method).is_some() {
            if let Some(m) = methods.get_mut(method) {
                m.entry_point = EntryPoint::Interpreter;
            }
        }
        self.profiles.remove(&method);
        self.events.push(CodeCacheEvent::MethodRedefined(method));
    }

    /// Re-key bookkeeping of `from` under its obsolete copy `to`
    pub fn move_obsolete_method(&mut self, from: MethodId, to: MethodId) {
        if let Some(code) = self.compiled.remove(&from) {
            self.compiled.insert(to, code);
        }
        if let Some(profile) = self.profiles.remove(&from) {
            self.profiles.insert(to, profile);
        }
        self.events.push(CodeCacheEvent::MethodMoved { from, to });
    }

    /// Discard every piece of compiled code
    pub fn invalidate_all_compiled_code(&mut self, methods: &mut MethodArena) {
        for method in self.compiled.keys() {
            if let Some(m) = methods.get_mut(*method) {
                if m.entry_point == EntryPoint::Compiled {
                    m.entry_point = EntryPoint::Interpreter;
                }
            }
        }
        self.compiled.clear();
        self.events.push(CodeCacheEvent::InvalidatedAll);
    }

    /// Notifications received so far
    pub fn events(&self) -> &[CodeCacheEvent] {
        &self.events
    }

    /// Methods that currently have compiled code
    pub fn methods_with_code(&self) -> impl Iterator<Item = MethodId> + '_ {
        self.compiled.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::ObjectRef;
    use crate::method::Method;
    use morph_classfile::access;

    fn arena() -> (MethodArena, MethodId) {
        let mut methods = MethodArena::new();
        let id = methods.push(Method {
            declaring_class: ObjectRef::from_raw(0),
            name: "run".to_string(),
            signature: "()V".to_string(),
            access_flags: access::ACC_PUBLIC,
            runtime_flags: 0,
            method_index: 0,
            entry_point: EntryPoint::Interpreter,
            native_entry: None,
        });
        (methods, id)
    }

    #[test]
    fn test_compile_respects_suspension() {
        let (mut methods, id) = arena();
        let mut cache = CodeCache::new(true);
        cache.suspend();
        assert!(!cache.compile(&mut methods, id, CompiledMethod::default()));
        cache.resume();
        assert!(cache.compile(&mut methods, id, CompiledMethod::default()));
        assert_eq!(methods.get(id).unwrap().entry_point, EntryPoint::Compiled);
    }

    #[test]
    fn test_disabled_or_dont_compile() {
        let (mut methods, id) = arena();
        assert!(!CodeCache::new(false).compile(&mut methods, id, CompiledMethod::default()));
        methods.get_mut(id).unwrap().set_flag(method_flags::DONT_COMPILE);
        assert!(!CodeCache::new(true).compile(&mut methods, id, CompiledMethod::default()));
    }

    #[test]
    fn test_redefined_and_moved_notifications() {
        let (mut methods, id) = arena();
        let mut cache = CodeCache::new(true);
        cache.compile(&mut methods, id, CompiledMethod::default());
        cache.record_invocation(id);
        let copy = MethodId::from_raw(9);
        cache.move_obsolete_method(id, copy);
        assert!(cache.compiled(id).is_none());
        assert!(cache.compiled(copy).is_some());
        assert_eq!(cache.profile(copy).unwrap().invocations, 1);

        cache.notify_method_redefined(&mut methods, id);
        cache.invalidate_all_compiled_code(&mut methods);
        assert_eq!(cache.compiled_count(), 0);
        assert_eq!(
            cache.events(),
            &[
                CodeCacheEvent::MethodMoved { from: id, to: copy },
                CodeCacheEvent::MethodRedefined(id),
                CodeCacheEvent::InvalidatedAll,
            ]
        );
    }
}
