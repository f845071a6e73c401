//! Replacement unit loading
//!
//! A [`ReplacementUnit`] is the parsed form of one class's new bytecode. The
//! caller's buffer is copied into a fresh allocation sized exactly to the
//! input; the copy is immutable from then on, so a caller mutating its own
//! buffer cannot change bytes that were already parsed and verified.

use crate::error::ErrorCode;
use morph_classfile::{ClassDef, ClassFileError, Header};
use morph_runtime::DexFile;
use std::collections::TryReserveError;
use std::sync::Arc;
use thiserror::Error;

/// Errors loading a replacement unit
#[derive(Debug, Error)]
pub enum LoadError {
    /// The copy of the input could not be allocated
    #[error("Unable to allocate {len} bytes for the replacement: {source}")]
    OutOfMemory {
        /// Input length
        len: usize,
        /// Allocation failure
        source: TryReserveError,
    },

    /// The bytes do not parse
    #[error("Unable to load modified dex file: {0}")]
    Format(#[from] ClassFileError),

    /// The file does not define exactly one class
    #[error("Expected 1 class def in dex file but found {0}")]
    ClassCount(usize),
}

impl LoadError {
    /// Status code this error is reported as
    pub fn code(&self) -> ErrorCode {
        match self {
            LoadError::OutOfMemory { .. } => ErrorCode::OutOfMemory,
            LoadError::Format(_) | LoadError::ClassCount(_) => ErrorCode::InvalidClassFormat,
        }
    }
}

/// Parsed, immutable replacement bytecode for one class
#[derive(Debug, Clone)]
pub struct ReplacementUnit {
    dex_file: Arc<DexFile>,
    def: ClassDef,
}

/// Copy `data` into an allocation of exactly its length
fn copy_exact(data: &[u8]) -> Result<Arc<[u8]>, TryReserveError> {
    let mut copy = Vec::new();
    copy.try_reserve_exact(data.len())?;
    copy.extend_from_slice(data);
    Ok(Arc::from(copy.into_boxed_slice()))
}

impl ReplacementUnit {
    /// Load a replacement from raw bytes
    ///
    /// The unit's location is `<location_hint>-transformed`.
    pub fn load(location_hint: &str, data: &[u8]) -> Result<Self, LoadError> {
        let bytes = copy_exact(data).map_err(|source| LoadError::OutOfMemory {
            len: data.len(),
            source,
        })?;
        let header = Header::parse(&bytes)?;
        if header.class_count != 1 {
            return Err(LoadError::ClassCount(header.class_count as usize));
        }
        let location = format!("{location_hint}-transformed");
        let dex_file = DexFile::open(&location, bytes)?;
        let def = match (dex_file.class_count(), dex_file.class_def(0)) {
            (1, Some(def)) => def.clone(),
            (count, _) => return Err(LoadError::ClassCount(count)),
        };
        Ok(Self {
            dex_file: Arc::new(dex_file),
            def,
        })
    }

    /// Parsed file
    pub fn dex_file(&self) -> &Arc<DexFile> {
        &self.dex_file
    }

    /// Backing bytes
    pub fn bytes(&self) -> &Arc<[u8]> {
        self.dex_file.data()
    }

    /// Location string
    pub fn location(&self) -> &str {
        self.dex_file.location()
    }

    /// The single class definition
    pub fn class_def(&self) -> &ClassDef {
        &self.def
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use morph_classfile::{ClassFile, HEADER_SIZE};

    fn class(descriptor: &str) -> ClassDef {
        ClassDef::new(descriptor, Some("Ljava/lang/Object;"))
    }

    #[test]
    fn test_load_single_class() {
        let bytes = ClassFile::single(class("LFoo;")).encode();
        let unit = ReplacementUnit::load("foo.mdef", &bytes).unwrap();
        assert_eq!(unit.class_def().descriptor, "LFoo;");
        assert_eq!(unit.location(), "foo.mdef-transformed");
        assert_eq!(&unit.bytes()[..], &bytes[..]);
        assert_ne!(unit.bytes().as_ptr(), bytes.as_ptr());
    }

    #[test]
    fn test_rejects_short_input() {
        let err = ReplacementUnit::load("x", &[0u8; HEADER_SIZE - 1]).unwrap_err();
        assert!(matches!(err, LoadError::Format(ClassFileError::TooShort { .. })));
        assert_eq!(err.code(), ErrorCode::InvalidClassFormat);
    }

    #[test]
    fn test_rejects_multiple_classes() {
        let bytes = ClassFile::new(vec![class("LA;"), class("LB;")]).encode();
        let err = ReplacementUnit::load("x", &bytes).unwrap_err();
        assert!(matches!(err, LoadError::ClassCount(2)));
        assert_eq!(err.code(), ErrorCode::InvalidClassFormat);

        let empty = ClassFile::new(Vec::new()).encode();
        assert!(matches!(
            ReplacementUnit::load("x", &empty),
            Err(LoadError::ClassCount(0))
        ));
    }

    #[test]
    fn test_rejects_corrupted_body() {
        let mut bytes = ClassFile::single(class("LFoo;")).encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let err = ReplacementUnit::load("x", &bytes).unwrap_err();
        assert!(matches!(err, LoadError::Format(ClassFileError::ChecksumMismatch { .. })));
    }
}
