//! Structural verification of class definitions
//!
//! Hard failures make a definition unusable. Soft failures are unresolved
//! references that a later, fully linked verification pass may clear.

use crate::access;
use crate::definition::{ClassDef, CodeItem, MethodDef};
use crate::descriptor::{FieldType, MethodSignature};
use crate::encoder::ClassReader;
use crate::opcode::{Opcode, OperandKind};
use std::collections::HashSet;
use thiserror::Error;

/// Hard verification errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// Invalid opcode
    #[error("{method}: invalid opcode {opcode:#x} at offset {offset}")]
    InvalidOpcode {
        /// Method name and signature
        method: String,
        /// Raw opcode byte
        opcode: u8,
        /// Instruction offset
        offset: usize,
    },

    /// Instruction operand runs past the end of the code
    #[error("{method}: truncated instruction at offset {offset}")]
    Truncated {
        /// Method name and signature
        method: String,
        /// Instruction offset
        offset: usize,
    },

    /// Register number out of range
    #[error("{method}: register v{register} out of range ({registers} registers) at offset {offset}")]
    InvalidRegister {
        /// Method name and signature
        method: String,
        /// Referenced register
        register: u16,
        /// Declared register count
        registers: u16,
        /// Instruction offset
        offset: usize,
    },

    /// Pool index out of range
    #[error("{method}: {pool} index {index} out of range at offset {offset}")]
    InvalidPoolIndex {
        /// Method name and signature
        method: String,
        /// Pool name
        pool: &'static str,
        /// Referenced index
        index: u16,
        /// Instruction offset
        offset: usize,
    },

    /// Branch to something other than an instruction boundary
    #[error("{method}: invalid branch target {target} at offset {offset}")]
    InvalidBranchTarget {
        /// Method name and signature
        method: String,
        /// Computed target
        target: i64,
        /// Instruction offset
        offset: usize,
    },

    /// Execution can run past the last instruction
    #[error("{method}: execution falls off the end of the code")]
    FallOffEnd {
        /// Method name and signature
        method: String,
    },

    /// Abstract/native method with code, or concrete method without code
    #[error("{method}: {reason}")]
    BadCodePresence {
        /// Method name and signature
        method: String,
        /// What is wrong
        reason: &'static str,
    },

    /// Malformed descriptor or signature
    #[error("malformed descriptor '{0}'")]
    MalformedDescriptor(String),

    /// Access flags outside the allowed set
    #[error("{what} has invalid access flags {flags:#x}")]
    InvalidFlags {
        /// Class or member
        what: String,
        /// The flags
        flags: u32,
    },

    /// Same member declared twice
    #[error("duplicate member {0}")]
    DuplicateMember(String),
}

/// Result of verifying a class
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Fully verified
    NoFailure,
    /// Verified, but some references could not be resolved
    SoftFailure(Vec<String>),
    /// Unusable definition
    HardFailure(VerifyError),
}

impl VerifyOutcome {
    /// Whether this is a hard failure
    pub fn is_hard_failure(&self) -> bool {
        matches!(self, VerifyOutcome::HardFailure(_))
    }
}

/// Class-loader context used to decide whether referenced types resolve
pub trait TypeResolver {
    /// Whether the class named by `descriptor` can be resolved
    fn is_resolvable(&self, descriptor: &str) -> bool;
}

impl<F: Fn(&str) -> bool> TypeResolver for F {
    fn is_resolvable(&self, descriptor: &str) -> bool {
        self(descriptor)
    }
}

/// Verify a class definition against a loader context
pub fn verify_class(class: &ClassDef, resolver: &dyn TypeResolver) -> VerifyOutcome {
    let mut unresolved = Vec::new();
    match verify_class_inner(class, resolver, &mut unresolved) {
        Err(e) => VerifyOutcome::HardFailure(e),
        Ok(()) if unresolved.is_empty() => VerifyOutcome::NoFailure,
        Ok(()) => VerifyOutcome::SoftFailure(unresolved),
    }
}

fn verify_class_inner(
    class: &ClassDef,
    resolver: &dyn TypeResolver,
    unresolved: &mut Vec<String>,
) -> Result<(), VerifyError> {
    if class.access_flags & !access::CLASS_FLAGS_MASK != 0 {
        return Err(VerifyError::InvalidFlags {
            what: class.descriptor.clone(),
            flags: class.access_flags,
        });
    }
    check_descriptor(&class.descriptor)?;
    if let Some(superclass) = &class.superclass {
        check_descriptor(superclass)?;
    }
    for iface in &class.interfaces {
        check_descriptor(iface)?;
    }

    let mut seen_fields = HashSet::new();
    for field in &class.fields {
        check_descriptor(&field.descriptor)?;
        if field.access_flags & !access::FIELD_FLAGS_MASK != 0 {
            return Err(VerifyError::InvalidFlags {
                what: field.name.clone(),
                flags: field.access_flags,
            });
        }
        if !seen_fields.insert((&field.name, &field.descriptor)) {
            return Err(VerifyError::DuplicateMember(format!(
                "{}:{}",
                field.name, field.descriptor
            )));
        }
    }

    let mut seen_methods = HashSet::new();
    for method in &class.methods {
        MethodSignature::parse(&method.signature)
            .map_err(|_| VerifyError::MalformedDescriptor(method.signature.clone()))?;
        if method.access_flags & !access::METHOD_FLAGS_MASK != 0 {
            return Err(VerifyError::InvalidFlags {
                what: method.name.clone(),
                flags: method.access_flags,
            });
        }
        if !seen_methods.insert((&method.name, &method.signature)) {
            return Err(VerifyError::DuplicateMember(format!(
                "{}{}",
                method.name, method.signature
            )));
        }
        verify_method(class, method, resolver, unresolved)?;
    }

    Ok(())
}

fn check_descriptor(descriptor: &str) -> Result<(), VerifyError> {
    FieldType::parse(descriptor)
        .map(|_| ())
        .map_err(|_| VerifyError::MalformedDescriptor(descriptor.to_string()))
}

fn verify_method(
    class: &ClassDef,
    method: &MethodDef,
    resolver: &dyn TypeResolver,
    unresolved: &mut Vec<String>,
) -> Result<(), VerifyError> {
    let name = format!("{}{}", method.name, method.signature);
    let code = match (&method.code, access::is_invokable(method.access_flags)) {
        (Some(_), false) => {
            return Err(VerifyError::BadCodePresence {
                method: name,
                reason: "abstract or native method has code",
            })
        }
        (None, true) => {
            return Err(VerifyError::BadCodePresence {
                method: name,
                reason: "concrete method has no code",
            })
        }
        (None, false) => return Ok(()),
        (Some(code), true) => code,
    };

    let instructions = parse_instructions(&name, code)?;
    let boundaries: HashSet<usize> = instructions.iter().map(|i| i.offset).collect();

    for instr in &instructions {
        match instr.opcode.operand_kind() {
            OperandKind::None | OperandKind::Literal => {}
            OperandKind::Register => {
                let register = instr.operand as u16;
                if register >= code.registers {
                    return Err(VerifyError::InvalidRegister {
                        method: name,
                        register,
                        registers: code.registers,
                        offset: instr.offset,
                    });
                }
            }
            OperandKind::FieldRef => {
                let member = pool_entry(&name, "field-ref", &class.field_refs, instr)?;
                note_type(class, &member.class, resolver, unresolved);
            }
            OperandKind::MethodRef => {
                let member = pool_entry(&name, "method-ref", &class.method_refs, instr)?;
                note_type(class, &member.class, resolver, unresolved);
            }
            OperandKind::TypeRef => {
                let ty = pool_entry(&name, "type-ref", &class.type_refs, instr)?;
                check_descriptor(ty)?;
                note_type(class, ty, resolver, unresolved);
            }
            OperandKind::Branch => {
                let target = instr.offset as i64 + instr.operand;
                if target < 0 || !boundaries.contains(&(target as usize)) {
                    return Err(VerifyError::InvalidBranchTarget {
                        method: name,
                        target,
                        offset: instr.offset,
                    });
                }
            }
        }
    }

    match instructions.last() {
        Some(last) if last.opcode.is_terminator() => Ok(()),
        _ => Err(VerifyError::FallOffEnd { method: name }),
    }
}

fn pool_entry<'a, T>(
    method: &str,
    pool: &'static str,
    entries: &'a [T],
    instr: &Instruction,
) -> Result<&'a T, VerifyError> {
    entries
        .get(instr.operand as usize)
        .ok_or_else(|| VerifyError::InvalidPoolIndex {
            method: method.to_string(),
            pool,
            index: instr.operand as u16,
            offset: instr.offset,
        })
}

fn note_type(
    class: &ClassDef,
    descriptor: &str,
    resolver: &dyn TypeResolver,
    unresolved: &mut Vec<String>,
) {
    let Ok(ty) = FieldType::parse(descriptor) else {
        return;
    };
    let Some(name) = ty.referenced_class() else {
        return;
    };
    if name != class.descriptor
        && !resolver.is_resolvable(name)
        && !unresolved.iter().any(|u| u == name)
    {
        unresolved.push(name.to_string());
    }
}

/// Parsed instruction
#[derive(Debug, Clone)]
struct Instruction {
    offset: usize,
    opcode: Opcode,
    operand: i64,
}

fn parse_instructions(method: &str, code: &CodeItem) -> Result<Vec<Instruction>, VerifyError> {
    let mut instructions = Vec::new();
    let mut reader = ClassReader::new(&code.instructions);

    while reader.has_more() {
        let offset = reader.position();
        let byte = reader.read_u8().map_err(|_| VerifyError::Truncated {
            method: method.to_string(),
            offset,
        })?;
        let opcode = Opcode::from_u8(byte).ok_or_else(|| VerifyError::InvalidOpcode {
            method: method.to_string(),
            opcode: byte,
            offset,
        })?;
        let truncated = |_| VerifyError::Truncated {
            method: method.to_string(),
            offset,
        };
        let operand = match opcode.operand_kind() {
            OperandKind::None => 0,
            OperandKind::Literal | OperandKind::Branch => {
                reader.read_i32().map_err(truncated)? as i64
            }
            OperandKind::Register
            | OperandKind::FieldRef
            | OperandKind::MethodRef
            | OperandKind::TypeRef => reader.read_u16().map_err(truncated)? as i64,
        };
        instructions.push(Instruction {
            offset,
            opcode,
            operand,
        });
    }

    Ok(instructions)
}
