//! Metadata sources
//!
//! A [`DexFile`] is a parsed class file backed by immutable bytes. A
//! [`DexCache`] pairs a file with the resolution slots of its reference
//! pools; together they are the metadata source a method reads its code and
//! symbolic references against.

use crate::class_linker::LoaderId;
use crate::heap::ObjectRef;
use crate::method::{FieldId, MethodId};
use morph_classfile::{ClassDef, ClassFile, ClassFileError, CodeItem};
use std::sync::Arc;

/// Handle to a dex cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DexCacheId(u32);

impl DexCacheId {
    /// Create an id from a raw index
    pub const fn from_raw(index: u32) -> Self {
        Self(index)
    }

    /// Raw index
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A parsed class file and the bytes it was parsed from
#[derive(Debug)]
pub struct DexFile {
    location: String,
    data: Arc<[u8]>,
    file: ClassFile,
}

impl DexFile {
    /// Parse `data`, keeping the bytes alive alongside the parsed form
    pub fn open(location: &str, data: Arc<[u8]>) -> Result<Self, ClassFileError> {
        let file = ClassFile::decode(&data)?;
        Ok(Self {
            location: location.to_string(),
            data,
            file,
        })
    }

    /// Location string
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Backing bytes
    pub fn data(&self) -> &Arc<[u8]> {
        &self.data
    }

    /// Number of class definitions
    pub fn class_count(&self) -> usize {
        self.file.classes.len()
    }

    /// A class definition by index
    pub fn class_def(&self, index: usize) -> Option<&ClassDef> {
        self.file.classes.get(index)
    }

    /// Index of the class definition with this descriptor
    pub fn find_class_def(&self, descriptor: &str) -> Option<usize> {
        self.file
            .classes
            .iter()
            .position(|c| c.descriptor == descriptor)
    }
}

/// Resolution slots for one class definition
#[derive(Debug, Clone, Default)]
pub struct ResolutionSlots {
    /// Resolved type references
    pub types: Vec<Option<ObjectRef>>,
    /// Resolved field references
    pub fields: Vec<Option<FieldId>>,
    /// Resolved method references
    pub methods: Vec<Option<MethodId>>,
}

/// A dex file plus its resolution slots
#[derive(Debug)]
pub struct DexCache {
    dex_file: Arc<DexFile>,
    /// Loader the references resolve in
    pub loader: LoaderId,
    /// Slots per class definition
    pub slots: Vec<ResolutionSlots>,
}

/// Approximate native footprint of an empty dex cache
pub const DEX_CACHE_SIZE: usize = 96;

impl DexCache {
    /// Create a dex cache with empty slots
    pub fn new(dex_file: Arc<DexFile>, loader: LoaderId) -> Self {
        let slots = dex_file
            .file
            .classes
            .iter()
            .map(|def| ResolutionSlots {
                types: vec![None; def.type_refs.len()],
                fields: vec![None; def.field_refs.len()],
                methods: vec![None; def.method_refs.len()],
            })
            .collect();
        Self {
            dex_file,
            loader,
            slots,
        }
    }

    /// Native footprint of this cache
    pub fn footprint(&self) -> usize {
        DEX_CACHE_SIZE
            + self
                .slots
                .iter()
                .map(|s| (s.types.len() + s.fields.len() + s.methods.len()) * 4)
                .sum::<usize>()
    }

    /// The dex file
    pub fn dex_file(&self) -> &Arc<DexFile> {
        &self.dex_file
    }

    /// A class definition of the dex file
    pub fn class_def(&self, index: usize) -> Option<&ClassDef> {
        self.dex_file.class_def(index)
    }

    /// Code of a method of a class definition
    pub fn code_item(&self, class_def_index: usize, method_index: usize) -> Option<&CodeItem> {
        self.class_def(class_def_index)?
            .methods
            .get(method_index)?
            .code
            .as_ref()
    }
}

/// Storage for every dex cache in the runtime
///
/// Ids stay stable; an unregistered cache leaves an empty slot behind.
#[derive(Debug, Default)]
pub struct DexCacheArena {
    caches: Vec<Option<DexCache>>,
}

impl DexCacheArena {
    /// Create an empty arena
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a dex cache
    pub fn push(&mut self, cache: DexCache) -> DexCacheId {
        self.caches.push(Some(cache));
        DexCacheId((self.caches.len() - 1) as u32)
    }

    /// Take a dex cache out of the arena
    pub fn remove(&mut self, id: DexCacheId) -> Option<DexCache> {
        self.caches.get_mut(id.index()).and_then(Option::take)
    }

    /// Get a dex cache
    pub fn get(&self, id: DexCacheId) -> Option<&DexCache> {
        self.caches.get(id.index()).and_then(Option::as_ref)
    }

    /// Get a dex cache mutably
    pub fn get_mut(&mut self, id: DexCacheId) -> Option<&mut DexCache> {
        self.caches.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Number of registered caches
    pub fn len(&self) -> usize {
        self.caches.iter().flatten().count()
    }

    /// Whether no cache is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over every cache
    pub fn iter(&self) -> impl Iterator<Item = (DexCacheId, &DexCache)> {
        self.caches
            .iter()
            .enumerate()
            .filter_map(|(i, c)| Some((DexCacheId(i as u32), c.as_ref()?)))
    }

    /// Iterate over every cache mutably
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (DexCacheId, &mut DexCache)> {
        self.caches
            .iter_mut()
            .enumerate()
            .filter_map(|(i, c)| Some((DexCacheId(i as u32), c.as_mut()?)))
    }
}
