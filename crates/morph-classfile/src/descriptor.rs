//! Type descriptors and method signatures
//!
//! Descriptors use the familiar single-letter encoding: `Z B C S I J F D V`
//! for primitives, `Lpkg/Name;` for classes and a `[` prefix for arrays.
//! Method signatures are `(<params>)<return>`.

use thiserror::Error;

/// Malformed descriptor
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Malformed descriptor '{descriptor}' at position {position}")]
pub struct DescriptorError {
    /// The offending descriptor
    pub descriptor: String,
    /// Byte position of the first invalid character
    pub position: usize,
}

/// Primitive value types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    /// `Z`
    Boolean,
    /// `B`
    Byte,
    /// `C`
    Char,
    /// `S`
    Short,
    /// `I`
    Int,
    /// `J`
    Long,
    /// `F`
    Float,
    /// `D`
    Double,
    /// `V` (return types only)
    Void,
}

impl Primitive {
    /// Parse a primitive descriptor character
    pub fn from_char(c: char) -> Option<Self> {
        Some(match c {
            'Z' => Primitive::Boolean,
            'B' => Primitive::Byte,
            'C' => Primitive::Char,
            'S' => Primitive::Short,
            'I' => Primitive::Int,
            'J' => Primitive::Long,
            'F' => Primitive::Float,
            'D' => Primitive::Double,
            'V' => Primitive::Void,
            _ => return None,
        })
    }

    /// Descriptor character of this primitive
    pub fn descriptor_char(self) -> char {
        match self {
            Primitive::Boolean => 'Z',
            Primitive::Byte => 'B',
            Primitive::Char => 'C',
            Primitive::Short => 'S',
            Primitive::Int => 'I',
            Primitive::Long => 'J',
            Primitive::Float => 'F',
            Primitive::Double => 'D',
            Primitive::Void => 'V',
        }
    }
}

/// Storage width of a field, used to size class and instance layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StorageWidth {
    /// 64-bit primitives (`J`, `D`)
    Bits64,
    /// 32-bit primitives (`I`, `F`)
    Bits32,
    /// 16-bit primitives (`C`, `S`)
    Bits16,
    /// 8-bit primitives (`Z`, `B`)
    Bits8,
    /// Object and array references
    Reference,
}

impl StorageWidth {
    /// Bytes occupied by one field of this width
    pub fn size_in_bytes(self) -> usize {
        match self {
            StorageWidth::Bits64 => 8,
            StorageWidth::Bits32 | StorageWidth::Reference => 4,
            StorageWidth::Bits16 => 2,
            StorageWidth::Bits8 => 1,
        }
    }
}

/// A parsed field type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// Primitive value
    Primitive(Primitive),
    /// Class reference, holding the full `L...;` descriptor
    Object(String),
    /// Array of the component type
    Array(Box<FieldType>),
}

impl FieldType {
    /// Parse a complete field descriptor
    pub fn parse(descriptor: &str) -> Result<Self, DescriptorError> {
        let (ty, consumed) = parse_one(descriptor, 0)?;
        if consumed != descriptor.len() {
            return Err(DescriptorError {
                descriptor: descriptor.to_string(),
                position: consumed,
            });
        }
        match ty {
            FieldType::Primitive(Primitive::Void) => Err(DescriptorError {
                descriptor: descriptor.to_string(),
                position: 0,
            }),
            ty => Ok(ty),
        }
    }

    /// Storage width of a value of this type
    pub fn storage_width(&self) -> StorageWidth {
        match self {
            FieldType::Primitive(Primitive::Boolean | Primitive::Byte) => StorageWidth::Bits8,
            FieldType::Primitive(Primitive::Char | Primitive::Short) => StorageWidth::Bits16,
            FieldType::Primitive(Primitive::Int | Primitive::Float) => StorageWidth::Bits32,
            FieldType::Primitive(Primitive::Long | Primitive::Double) => StorageWidth::Bits64,
            FieldType::Primitive(Primitive::Void) => StorageWidth::Bits8,
            FieldType::Object(_) | FieldType::Array(_) => StorageWidth::Reference,
        }
    }

    /// The class descriptor this type ultimately names, if any
    pub fn referenced_class(&self) -> Option<&str> {
        match self {
            FieldType::Primitive(_) => None,
            FieldType::Object(name) => Some(name),
            FieldType::Array(component) => component.referenced_class(),
        }
    }
}

/// Storage width of a field descriptor, judged by its first character
///
/// Descriptors that were never validated fall into the reference bucket.
pub fn storage_width_of(descriptor: &str) -> StorageWidth {
    match descriptor.as_bytes().first() {
        Some(b'Z' | b'B') => StorageWidth::Bits8,
        Some(b'C' | b'S') => StorageWidth::Bits16,
        Some(b'I' | b'F') => StorageWidth::Bits32,
        Some(b'J' | b'D') => StorageWidth::Bits64,
        _ => StorageWidth::Reference,
    }
}

/// A parsed method signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSignature {
    /// Parameter types in declaration order
    pub params: Vec<FieldType>,
    /// Return type (`Primitive(Void)` for no value)
    pub ret: FieldType,
}

impl MethodSignature {
    /// Parse `(<params>)<return>`
    pub fn parse(signature: &str) -> Result<Self, DescriptorError> {
        let err = |position| DescriptorError {
            descriptor: signature.to_string(),
            position,
        };
        if !signature.starts_with('(') {
            return Err(err(0));
        }
        let mut pos = 1;
        let mut params = Vec::new();
        loop {
            match signature.as_bytes().get(pos) {
                Some(b')') => {
                    pos += 1;
                    break;
                }
                Some(_) => {
                    let (ty, next) = parse_one(signature, pos)?;
                    if ty == FieldType::Primitive(Primitive::Void) {
                        return Err(err(pos));
                    }
                    params.push(ty);
                    pos = next;
                }
                None => return Err(err(pos)),
            }
        }
        let (ret, end) = parse_one(signature, pos)?;
        if end != signature.len() {
            return Err(err(end));
        }
        Ok(Self { params, ret })
    }
}

fn parse_one(descriptor: &str, start: usize) -> Result<(FieldType, usize), DescriptorError> {
    let err = |position| DescriptorError {
        descriptor: descriptor.to_string(),
        position,
    };
    let bytes = descriptor.as_bytes();
    match bytes.get(start) {
        Some(b'L') => {
            let end = descriptor[start..]
                .find(';')
                .map(|i| start + i)
                .ok_or_else(|| err(start))?;
            if end == start + 1 {
                return Err(err(end));
            }
            Ok((FieldType::Object(descriptor[start..=end].to_string()), end + 1))
        }
        Some(b'[') => {
            let (component, next) = parse_one(descriptor, start + 1)?;
            if component == FieldType::Primitive(Primitive::Void) {
                return Err(err(start + 1));
            }
            Ok((FieldType::Array(Box::new(component)), next))
        }
        Some(&c) => Primitive::from_char(c as char)
            .map(|p| (FieldType::Primitive(p), start + 1))
            .ok_or_else(|| err(start)),
        None => Err(err(start)),
    }
}

/// Whether the string is a well-formed class descriptor (`Lpkg/Name;`)
pub fn is_class_descriptor(descriptor: &str) -> bool {
    matches!(FieldType::parse(descriptor), Ok(FieldType::Object(_)))
}

/// Human-readable form of a descriptor: `Lpkg/Name;` becomes `pkg.Name`
pub fn pretty_descriptor(descriptor: &str) -> String {
    match FieldType::parse(descriptor) {
        Ok(FieldType::Object(name)) => name[1..name.len() - 1].replace('/', "."),
        Ok(FieldType::Array(component)) => {
            let inner = match *component {
                FieldType::Object(ref name) => pretty_descriptor(name),
                FieldType::Array(_) => pretty_descriptor(&descriptor[1..]),
                FieldType::Primitive(p) => primitive_name(p).to_string(),
            };
            format!("{inner}[]")
        }
        Ok(FieldType::Primitive(p)) => primitive_name(p).to_string(),
        Err(_) => descriptor.to_string(),
    }
}

fn primitive_name(p: Primitive) -> &'static str {
    match p {
        Primitive::Boolean => "boolean",
        Primitive::Byte => "byte",
        Primitive::Char => "char",
        Primitive::Short => "short",
        Primitive::Int => "int",
        Primitive::Long => "long",
        Primitive::Float => "float",
        Primitive::Double => "double",
        Primitive::Void => "void",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_field_types() {
        assert_eq!(FieldType::parse("I").unwrap(), FieldType::Primitive(Primitive::Int));
        assert_eq!(
            FieldType::parse("Ljava/lang/Object;").unwrap(),
            FieldType::Object("Ljava/lang/Object;".to_string())
        );
        assert_eq!(
            FieldType::parse("[[J").unwrap(),
            FieldType::Array(Box::new(FieldType::Array(Box::new(FieldType::Primitive(
                Primitive::Long
            )))))
        );
    }

    #[test]
    fn test_reject_malformed() {
        assert!(FieldType::parse("V").is_err());
        assert!(FieldType::parse("L;").is_err());
        assert!(FieldType::parse("LFoo").is_err());
        assert!(FieldType::parse("II").is_err());
        assert!(FieldType::parse("Q").is_err());
        assert!(FieldType::parse("").is_err());
    }

    #[test]
    fn test_parse_signature() {
        let sig = MethodSignature::parse("(IJLFoo;[B)V").unwrap();
        assert_eq!(sig.params.len(), 4);
        assert_eq!(sig.ret, FieldType::Primitive(Primitive::Void));
        assert!(MethodSignature::parse("(V)V").is_err());
        assert!(MethodSignature::parse("I)V").is_err());
        assert!(MethodSignature::parse("()").is_err());
        assert!(MethodSignature::parse("()VV").is_err());
    }

    #[test]
    fn test_storage_width() {
        assert_eq!(storage_width_of("Z"), StorageWidth::Bits8);
        assert_eq!(storage_width_of("S"), StorageWidth::Bits16);
        assert_eq!(storage_width_of("F"), StorageWidth::Bits32);
        assert_eq!(storage_width_of("D"), StorageWidth::Bits64);
        assert_eq!(storage_width_of("[I"), StorageWidth::Reference);
        assert_eq!(storage_width_of("LFoo;"), StorageWidth::Reference);
    }

    #[test]
    fn test_pretty_descriptor() {
        assert_eq!(pretty_descriptor("Lart/Test;"), "art.Test");
        assert_eq!(pretty_descriptor("[I"), "int[]");
        assert_eq!(pretty_descriptor("[[LFoo;"), "Foo[][]");
        assert_eq!(pretty_descriptor("oops"), "oops");
    }

    #[test]
    fn test_referenced_class() {
        let ty = FieldType::parse("[[LFoo;").unwrap();
        assert_eq!(ty.referenced_class(), Some("LFoo;"));
        assert_eq!(FieldType::parse("I").unwrap().referenced_class(), None);
    }
}
