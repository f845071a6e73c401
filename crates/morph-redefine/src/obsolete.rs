//! Obsolete-method registry
//!
//! An [`ObsoleteMap`] stages the obsolete-method tables of one class for
//! one redefinition. The class's existing tables are copied and extended by
//! one slot per declared method up front, so recording an obsolete method
//! during the commit never allocates. The staged tables replace the class's
//! tables only if a slot was used; otherwise the class keeps its old ones.
//!
//! The slot of an original method is fixed: the first new slot plus the
//! method's index among the class's declared methods.

use morph_runtime::class::ClassExt;
use morph_runtime::method::MethodArena;
use morph_runtime::{method_flags, AllocError, DexCacheId, MethodId, ObjectRef, RuntimeState};
use rustc_hash::FxHashMap;

/// Native footprint of one obsolete slot in both tables
pub const OBSOLETE_SLOT_SIZE: usize = 16;

/// Staged obsolete-method tables of one class
#[derive(Debug)]
pub struct ObsoleteMap {
    class: ObjectRef,
    start_offset: usize,
    slots: FxHashMap<MethodId, usize>,
    methods: Vec<Option<MethodId>>,
    dex_caches: Vec<Option<DexCacheId>>,
    old_dex_cache: Option<DexCacheId>,
    moved: Vec<(MethodId, MethodId)>,
    charged: usize,
}

impl ObsoleteMap {
    /// Stage extended tables for `class`, charging the new slots to the heap
    pub fn allocate(state: &mut RuntimeState, class: ObjectRef) -> Result<Self, AllocError> {
        let data = state.class(class).ok_or(AllocError::NotAClass(class))?;
        let (mut methods, mut dex_caches) = match &data.ext {
            Some(ext) => (ext.obsolete_methods.clone(), ext.obsolete_dex_caches.clone()),
            None => (Vec::new(), Vec::new()),
        };
        let start_offset = methods.len();
        let declared = data.methods.clone();
        let old_dex_cache = data.dex_cache;

        let charged = (declared.len() * OBSOLETE_SLOT_SIZE).max(1);
        state.heap.charge_native(charged)?;

        methods.resize(start_offset + declared.len(), None);
        dex_caches.resize(start_offset + declared.len(), None);
        let slots = declared
            .iter()
            .enumerate()
            .map(|(i, m)| (*m, start_offset + i))
            .collect();
        Ok(Self {
            class,
            start_offset,
            slots,
            methods,
            dex_caches,
            old_dex_cache,
            moved: Vec::new(),
            charged,
        })
    }

    /// Class the tables belong to
    pub fn class(&self) -> ObjectRef {
        self.class
    }

    /// First slot added for this redefinition
    pub fn start_offset(&self) -> usize {
        self.start_offset
    }

    /// Whether `method` is one of the methods this map can obsolete
    pub fn covers(&self, method: MethodId) -> bool {
        self.slots.contains_key(&method)
    }

    /// Obsolete copy already recorded for `original`
    #[inline]
    pub fn find_existing(&self, original: MethodId) -> Option<MethodId> {
        let slot = *self.slots.get(&original)?;
        self.methods[slot]
    }

    /// Copy `original` into its slot as an obsolete method
    ///
    /// The copy keeps every field of the original, is flagged obsolete and
    /// non-compilable, and reads its code from the metadata source the class
    /// had before this redefinition. Returns `None` if `original` is not a
    /// declared method of the class.
    pub fn record_new(&mut self, arena: &mut MethodArena, original: MethodId) -> Option<MethodId> {
        let slot = *self.slots.get(&original)?;
        debug_assert!(self.methods[slot].is_none(), "{original:?} recorded twice");
        let mut copy = arena.get(original)?.clone();
        copy.set_flag(method_flags::OBSOLETE | method_flags::DONT_COMPILE);
        let obsolete = arena.push(copy);
        self.methods[slot] = Some(obsolete);
        self.dex_caches[slot] = self.old_dex_cache;
        self.moved.push((original, obsolete));
        log::debug!("created obsolete method {obsolete:?} for {original:?}");
        Some(obsolete)
    }

    /// Whether any slot added for this redefinition was used
    pub fn is_used(&self) -> bool {
        self.methods[self.start_offset..].iter().any(Option::is_some)
    }

    /// Number of obsolete methods recorded
    pub fn recorded(&self) -> usize {
        self.moved.len()
    }

    /// (original, obsolete) pairs in the order they were recorded
    pub fn moved(&self) -> &[(MethodId, MethodId)] {
        &self.moved
    }

    /// Publish the tables into `ext` if a slot was used
    ///
    /// Returns the bytes to give back to the heap when nothing was recorded.
    pub fn install(self, ext: &mut ClassExt) -> usize {
        if self.is_used() {
            ext.obsolete_methods = self.methods;
            ext.obsolete_dex_caches = self.dex_caches;
            0
        } else {
            self.charged
        }
    }

    /// Bytes charged for the staged slots
    pub fn charged(&self) -> usize {
        self.charged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use morph_classfile::{access, ClassDef, ClassFile, CodeItem, MethodDef};
    use morph_runtime::{LoaderId, ThreadId};
    use std::sync::Arc;

    fn state_with_class() -> (RuntimeState, ObjectRef) {
        let mut state = RuntimeState::new();
        state.bootstrap().unwrap();
        let def = ClassDef::new("LFoo;", Some("Ljava/lang/Object;"))
            .with_method(MethodDef::new("a", "()V", access::ACC_PUBLIC, Some(CodeItem::new(0, vec![0x51]))))
            .with_method(MethodDef::new("b", "()V", access::ACC_PUBLIC, Some(CodeItem::new(0, vec![0x51]))));
        let bytes: Arc<[u8]> = ClassFile::single(def).encode().into();
        let dex = state.open_dex_file("foo.mdef", bytes, LoaderId::BOOT).unwrap();
        let class = state.define_class(ThreadId::from_raw(1), LoaderId::BOOT, dex, 0).unwrap();
        (state, class)
    }

    #[test]
    fn test_record_and_find() {
        let (mut state, class) = state_with_class();
        let a = state.find_declared_method(class, "a", "()V").unwrap();
        let b = state.find_declared_method(class, "b", "()V").unwrap();
        let mut map = ObsoleteMap::allocate(&mut state, class).unwrap();
        assert_eq!(map.start_offset(), 0);
        assert!(map.covers(a));
        assert_eq!(map.find_existing(a), None);

        let obsolete = map.record_new(&mut state.methods, a).unwrap();
        assert_eq!(map.find_existing(a), Some(obsolete));
        assert_eq!(map.find_existing(a), Some(obsolete));
        assert_eq!(map.find_existing(b), None);

        let copy = state.methods.get(obsolete).unwrap();
        assert!(copy.is_obsolete());
        assert!(copy.has_flag(method_flags::DONT_COMPILE));
        assert_eq!(copy.name, "a");
        assert!(!state.methods.get(a).unwrap().is_obsolete());
        assert_eq!(map.moved(), &[(a, obsolete)]);
    }

    #[test]
    fn test_install_extends_existing_tables() {
        let (mut state, class) = state_with_class();
        let a = state.find_declared_method(class, "a", "()V").unwrap();
        let old_cache = state.class(class).unwrap().dex_cache;
        state.heap.class_data_mut(class).unwrap().ext = Some(Box::new(ClassExt {
            obsolete_methods: vec![Some(MethodId::from_raw(900))],
            obsolete_dex_caches: vec![None],
            ..ClassExt::default()
        }));

        let mut map = ObsoleteMap::allocate(&mut state, class).unwrap();
        assert_eq!(map.start_offset(), 1);
        let obsolete = map.record_new(&mut state.methods, a).unwrap();

        let mut ext = state.class(class).unwrap().ext.as_deref().cloned().unwrap();
        assert_eq!(map.install(&mut ext), 0);
        assert_eq!(ext.obsolete_methods.len(), 3);
        assert_eq!(ext.obsolete_methods[1], Some(obsolete));
        assert_eq!(ext.obsolete_dex_caches[1], old_cache);
        assert_eq!(ext.obsolete_methods[0], Some(MethodId::from_raw(900)));
    }

    #[test]
    fn test_unused_tables_are_not_installed() {
        let (mut state, class) = state_with_class();
        let map = ObsoleteMap::allocate(&mut state, class).unwrap();
        assert!(!map.is_used());
        let charged = map.charged();
        let mut ext = ClassExt::default();
        assert_eq!(map.install(&mut ext), charged);
        assert!(ext.obsolete_methods.is_empty());
    }

    #[test]
    fn test_foreign_method_is_ignored() {
        let (mut state, class) = state_with_class();
        let mut map = ObsoleteMap::allocate(&mut state, class).unwrap();
        assert_eq!(map.record_new(&mut state.methods, MethodId::from_raw(12345)), None);
        assert!(!map.is_used());
    }
}
