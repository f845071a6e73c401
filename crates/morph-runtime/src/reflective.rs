//! Reflective member references held outside the heap
//!
//! Native-side structures point at methods and fields by id: resolution
//! slots in dex caches, JNI-style member ids handed to native code, and the
//! inline caches of compiled code. [`RuntimeState::visit_reflective_targets`]
//! walks all of them and applies the visitor's decision to each entry.

use crate::dex_cache::DexCacheId;
use crate::method::{FieldId, MethodId};
use crate::runtime::RuntimeState;

/// Opaque method id handed to native code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JMethodId(u32);

/// Opaque field id handed to native code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JFieldId(u32);

/// Member ids handed out to native code
#[derive(Debug, Default)]
pub struct JniIdTable {
    methods: Vec<Option<MethodId>>,
    fields: Vec<Option<FieldId>>,
}

impl JniIdTable {
    /// Id for `method`, reusing an existing one
    pub fn encode_method(&mut self, method: MethodId) -> JMethodId {
        match self.methods.iter().position(|m| *m == Some(method)) {
            Some(i) => JMethodId(i as u32),
            None => {
                self.methods.push(Some(method));
                JMethodId((self.methods.len() - 1) as u32)
            }
        }
    }

    /// Method behind an id
    pub fn decode_method(&self, id: JMethodId) -> Option<MethodId> {
        self.methods.get(id.0 as usize).copied().flatten()
    }

    /// Id for `field`, reusing an existing one
    pub fn encode_field(&mut self, field: FieldId) -> JFieldId {
        match self.fields.iter().position(|f| *f == Some(field)) {
            Some(i) => JFieldId(i as u32),
            None => {
                self.fields.push(Some(field));
                JFieldId((self.fields.len() - 1) as u32)
            }
        }
    }

    /// Field behind an id
    pub fn decode_field(&self, id: JFieldId) -> Option<FieldId> {
        self.fields.get(id.0 as usize).copied().flatten()
    }

    /// Every method handed out
    pub fn methods(&self) -> impl Iterator<Item = MethodId> + '_ {
        self.methods.iter().flatten().copied()
    }
}

/// Where a reflective reference lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectiveSource {
    /// Resolved method slot of a dex cache
    ResolvedMethod {
        /// Dex cache
        cache: DexCacheId,
        /// Class definition owning the pool
        class_def: usize,
        /// Pool index
        slot: usize,
    },
    /// Resolved field slot of a dex cache
    ResolvedField {
        /// Dex cache
        cache: DexCacheId,
        /// Class definition owning the pool
        class_def: usize,
        /// Pool index
        slot: usize,
    },
    /// JNI-style method id
    JniMethodId(JMethodId),
    /// JNI-style field id
    JniFieldId(JFieldId),
    /// Inline cache of compiled code
    CompiledCode {
        /// Method owning the compiled code
        method: MethodId,
    },
}

impl ReflectiveSource {
    /// Whether the entry is a lazily refilled resolution slot
    pub fn is_resolution_cache(&self) -> bool {
        matches!(
            self,
            ReflectiveSource::ResolvedMethod { .. } | ReflectiveSource::ResolvedField { .. }
        )
    }
}

/// What to do with a visited reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectiveAction<T> {
    /// Leave it alone
    Keep,
    /// Point it at another member
    Replace(T),
    /// Drop it so it is resolved again on next use
    Clear,
}

/// Visitor over reflective references
pub trait ReflectiveVisitor {
    /// Decide for one method reference
    fn visit_method(&mut self, source: ReflectiveSource, method: MethodId) -> ReflectiveAction<MethodId>;
    /// Decide for one field reference
    fn visit_field(&mut self, source: ReflectiveSource, field: FieldId) -> ReflectiveAction<FieldId>;
}

fn apply<T: Copy>(slot: &mut Option<T>, action: ReflectiveAction<T>) -> bool {
    match action {
        ReflectiveAction::Keep => false,
        ReflectiveAction::Replace(new) => {
            *slot = Some(new);
            true
        }
        ReflectiveAction::Clear => {
            *slot = None;
            true
        }
    }
}

impl RuntimeState {
    /// Visit every reflective reference, returning how many were changed
    pub fn visit_reflective_targets(&mut self, visitor: &mut dyn ReflectiveVisitor) -> usize {
        let mut changed = 0;

        for (cache, dex_cache) in self.dex_caches.iter_mut() {
            for (class_def, slots) in dex_cache.slots.iter_mut().enumerate() {
                for (slot, entry) in slots.methods.iter_mut().enumerate() {
                    if let Some(method) = *entry {
                        let source = ReflectiveSource::ResolvedMethod { cache, class_def, slot };
                        changed += apply(entry, visitor.visit_method(source, method)) as usize;
                    }
                }
                for (slot, entry) in slots.fields.iter_mut().enumerate() {
                    if let Some(field) = *entry {
                        let source = ReflectiveSource::ResolvedField { cache, class_def, slot };
                        changed += apply(entry, visitor.visit_field(source, field)) as usize;
                    }
                }
            }
        }

        for (i, entry) in self.jni_ids.methods.iter_mut().enumerate() {
            if let Some(method) = *entry {
                let source = ReflectiveSource::JniMethodId(JMethodId(i as u32));
                changed += apply(entry, visitor.visit_method(source, method)) as usize;
            }
        }
        for (i, entry) in self.jni_ids.fields.iter_mut().enumerate() {
            if let Some(field) = *entry {
                let source = ReflectiveSource::JniFieldId(JFieldId(i as u32));
                changed += apply(entry, visitor.visit_field(source, field)) as usize;
            }
        }

        for (owner, code) in self.code_cache.compiled_methods_mut() {
            let source = ReflectiveSource::CompiledCode { method: *owner };
            code.inline_cache.retain_mut(|target| {
                let mut slot = Some(*target);
                changed += apply(&mut slot, visitor.visit_method(source, *target)) as usize;
                match slot {
                    Some(new) => {
                        *target = new;
                        true
                    }
                    None => false,
                }
            });
            code.field_cache.retain_mut(|target| {
                let mut slot = Some(*target);
                changed += apply(&mut slot, visitor.visit_field(source, *target)) as usize;
                match slot {
                    Some(new) => {
                        *target = new;
                        true
                    }
                    None => false,
                }
            });
        }

        log::trace!("reflective targets changed: {changed}");
        changed
    }
}
