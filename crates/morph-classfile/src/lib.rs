//! Morph VM Class-File Format
//!
//! This crate provides the single-class binary definition format consumed by
//! the class linker and by class redefinition: the fixed header with its
//! checksum, class/field/method definitions, type descriptors, the method
//! instruction set and a structural verifier.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod access;
pub mod definition;
pub mod descriptor;
pub mod encoder;
pub mod opcode;
pub mod verify;

pub use definition::{
    ClassDef, ClassFile, ClassFileError, CodeItem, FieldDef, Header, MemberRef, MethodDef,
    HEADER_SIZE,
};
pub use descriptor::{FieldType, MethodSignature, Primitive, StorageWidth};
pub use encoder::{ClassReader, ClassWriter, DecodeError};
pub use opcode::Opcode;
pub use verify::{verify_class, TypeResolver, VerifyError, VerifyOutcome};
