//! Class-file container and class definitions
//!
//! A class file holds one or more [`ClassDef`]s behind a fixed 24-byte
//! header. The checksum covers every byte after the header.

use crate::access;
use crate::encoder::{ClassReader, ClassWriter, DecodeError};
use thiserror::Error;

/// Magic number for class files: "MDEF"
pub const MAGIC: [u8; 4] = *b"MDEF";

/// Current format version
pub const VERSION: u32 = 1;

/// Size of the fixed header in bytes
pub const HEADER_SIZE: usize = 24;

/// Class-file encoding/decoding errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClassFileError {
    /// Input shorter than the fixed header
    #[error("Could not read header: {len} bytes is shorter than the {HEADER_SIZE}-byte header")]
    TooShort {
        /// Length of the input
        len: usize,
    },

    /// Invalid magic number
    #[error("Invalid magic number: expected MDEF, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported version
    #[error("Unsupported version: {0} (current: {VERSION})")]
    UnsupportedVersion(u32),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Checksum stored in the header
        expected: u32,
        /// Checksum of the payload
        actual: u32,
    },

    /// Header size field disagrees with the input length
    #[error("File size mismatch: header says {declared} bytes, input has {actual}")]
    SizeMismatch {
        /// Size recorded in the header
        declared: u32,
        /// Actual input length
        actual: usize,
    },

    /// Bytes left over after the last class definition
    #[error("{0} trailing bytes after the last class definition")]
    TrailingData(usize),

    /// Body decode error
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
}

/// Fixed header of a class file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Format version
    pub version: u32,
    /// File flags
    pub flags: u32,
    /// CRC-32 of the payload
    pub checksum: u32,
    /// Total file size
    pub file_size: u32,
    /// Number of class definitions
    pub class_count: u32,
}

impl Header {
    /// Parse and validate the header of `data`
    ///
    /// Checks magic, version, recorded size and checksum. The body is not
    /// looked at beyond the checksum.
    pub fn parse(data: &[u8]) -> Result<Self, ClassFileError> {
        if data.len() < HEADER_SIZE {
            return Err(ClassFileError::TooShort { len: data.len() });
        }
        let mut reader = ClassReader::new(data);
        let magic = [
            reader.read_u8()?,
            reader.read_u8()?,
            reader.read_u8()?,
            reader.read_u8()?,
        ];
        if magic != MAGIC {
            return Err(ClassFileError::InvalidMagic(magic));
        }
        let version = reader.read_u32()?;
        if version != VERSION {
            return Err(ClassFileError::UnsupportedVersion(version));
        }
        let flags = reader.read_u32()?;
        let checksum = reader.read_u32()?;
        let file_size = reader.read_u32()?;
        let class_count = reader.read_u32()?;

        if file_size as usize != data.len() {
            return Err(ClassFileError::SizeMismatch {
                declared: file_size,
                actual: data.len(),
            });
        }
        let actual = crc32fast::hash(&data[HEADER_SIZE..]);
        if actual != checksum {
            return Err(ClassFileError::ChecksumMismatch {
                expected: checksum,
                actual,
            });
        }

        Ok(Self {
            version,
            flags,
            checksum,
            file_size,
            class_count,
        })
    }
}

/// File flags
pub mod flags {
    /// Methods carry debug information
    pub const HAS_DEBUG_INFO: u32 = 1 << 0;
}

/// A decoded class file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassFile {
    /// File flags
    pub flags: u32,
    /// Class definitions in file order
    pub classes: Vec<ClassDef>,
}

impl ClassFile {
    /// Create a file holding the given classes
    pub fn new(classes: Vec<ClassDef>) -> Self {
        Self { flags: 0, classes }
    }

    /// Create a file holding one class
    pub fn single(class: ClassDef) -> Self {
        Self::new(vec![class])
    }

    /// Encode to binary format
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = ClassWriter::new();

        writer.emit_bytes(&MAGIC);
        writer.emit_u32(VERSION);
        writer.emit_u32(self.flags);
        let checksum_offset = writer.offset();
        writer.emit_u32(0);
        let size_offset = writer.offset();
        writer.emit_u32(0);
        writer.emit_u32(self.classes.len() as u32);

        for class in &self.classes {
            class.encode(&mut writer);
        }

        let size = writer.offset() as u32;
        writer.patch_u32(size_offset, size);
        let checksum = crc32fast::hash(&writer.buffer[HEADER_SIZE..]);
        writer.patch_u32(checksum_offset, checksum);

        writer.into_bytes()
    }

    /// Decode from binary format
    pub fn decode(data: &[u8]) -> Result<Self, ClassFileError> {
        let header = Header::parse(data)?;
        let mut reader = ClassReader::new(data);
        reader.seek(HEADER_SIZE);

        let mut classes = Vec::new();
        for _ in 0..header.class_count {
            classes.push(ClassDef::decode(&mut reader)?);
        }
        if reader.has_more() {
            return Err(ClassFileError::TrailingData(reader.remaining()));
        }

        Ok(Self {
            flags: header.flags,
            classes,
        })
    }
}

/// A symbolic reference to a field or method of some class
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberRef {
    /// Descriptor of the owning class
    pub class: String,
    /// Member name
    pub name: String,
    /// Field type descriptor or method signature
    pub descriptor: String,
}

impl MemberRef {
    /// Create a member reference
    pub fn new(class: &str, name: &str, descriptor: &str) -> Self {
        Self {
            class: class.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
        }
    }

    fn encode(&self, writer: &mut ClassWriter) {
        writer.emit_string(&self.class);
        writer.emit_string(&self.name);
        writer.emit_string(&self.descriptor);
    }

    fn decode(reader: &mut ClassReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            class: reader.read_string()?,
            name: reader.read_string()?,
            descriptor: reader.read_string()?,
        })
    }
}

/// Field definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type descriptor
    pub descriptor: String,
    /// Access flags
    pub access_flags: u32,
}

impl FieldDef {
    /// Create a field definition
    pub fn new(name: &str, descriptor: &str, access_flags: u32) -> Self {
        Self {
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            access_flags,
        }
    }

    /// Whether this is a static field
    pub fn is_static(&self) -> bool {
        self.access_flags & access::ACC_STATIC != 0
    }
}

/// Executable body of a method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeItem {
    /// Number of registers the body uses
    pub registers: u16,
    /// Instruction stream
    pub instructions: Vec<u8>,
}

impl CodeItem {
    /// Create a code item
    pub fn new(registers: u16, instructions: Vec<u8>) -> Self {
        Self {
            registers,
            instructions,
        }
    }
}

/// Method definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDef {
    /// Method name
    pub name: String,
    /// Method signature
    pub signature: String,
    /// Access flags
    pub access_flags: u32,
    /// Body, absent for abstract and native methods
    pub code: Option<CodeItem>,
}

impl MethodDef {
    /// Create a method definition
    pub fn new(name: &str, signature: &str, access_flags: u32, code: Option<CodeItem>) -> Self {
        Self {
            name: name.to_string(),
            signature: signature.to_string(),
            access_flags,
            code,
        }
    }

    /// Whether the method is dispatched directly
    pub fn is_direct(&self) -> bool {
        access::is_direct(self.access_flags)
    }

    /// Whether this is a static method
    pub fn is_static(&self) -> bool {
        self.access_flags & access::ACC_STATIC != 0
    }

    fn encode(&self, writer: &mut ClassWriter) {
        writer.emit_string(&self.name);
        writer.emit_string(&self.signature);
        writer.emit_u32(self.access_flags);
        match &self.code {
            Some(code) => {
                writer.emit_u8(1);
                writer.emit_u16(code.registers);
                writer.emit_u32(code.instructions.len() as u32);
                writer.emit_bytes(&code.instructions);
            }
            None => writer.emit_u8(0),
        }
    }

    fn decode(reader: &mut ClassReader<'_>) -> Result<Self, DecodeError> {
        let name = reader.read_string()?;
        let signature = reader.read_string()?;
        let access_flags = reader.read_u32()?;
        let code = match reader.read_u8()? {
            0 => None,
            1 => {
                let registers = reader.read_u16()?;
                let len = reader.read_u32()? as usize;
                Some(CodeItem::new(registers, reader.read_bytes(len)?))
            }
            tag => return Err(DecodeError::InvalidTag(tag, reader.position() - 1)),
        };
        Ok(Self {
            name,
            signature,
            access_flags,
            code,
        })
    }
}

/// Class definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDef {
    /// Class descriptor (`Lpkg/Name;`)
    pub descriptor: String,
    /// Access flags
    pub access_flags: u32,
    /// Superclass descriptor, absent only for the root class
    pub superclass: Option<String>,
    /// Directly implemented interfaces, in declaration order
    pub interfaces: Vec<String>,
    /// Source file name
    pub source_file: Option<String>,
    /// Type reference pool
    pub type_refs: Vec<String>,
    /// Field reference pool
    pub field_refs: Vec<MemberRef>,
    /// Method reference pool
    pub method_refs: Vec<MemberRef>,
    /// Declared fields
    pub fields: Vec<FieldDef>,
    /// Declared methods
    pub methods: Vec<MethodDef>,
}

impl ClassDef {
    /// Create an empty public class extending `superclass`
    pub fn new(descriptor: &str, superclass: Option<&str>) -> Self {
        Self {
            descriptor: descriptor.to_string(),
            access_flags: access::ACC_PUBLIC,
            superclass: superclass.map(str::to_string),
            interfaces: Vec::new(),
            source_file: None,
            type_refs: Vec::new(),
            field_refs: Vec::new(),
            method_refs: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Builder: set access flags
    pub fn with_access_flags(mut self, access_flags: u32) -> Self {
        self.access_flags = access_flags;
        self
    }

    /// Builder: add an implemented interface
    pub fn with_interface(mut self, descriptor: &str) -> Self {
        self.interfaces.push(descriptor.to_string());
        self
    }

    /// Builder: add a field
    pub fn with_field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Builder: add a method
    pub fn with_method(mut self, method: MethodDef) -> Self {
        self.methods.push(method);
        self
    }

    /// Builder: add a type reference
    pub fn with_type_ref(mut self, descriptor: &str) -> Self {
        self.type_refs.push(descriptor.to_string());
        self
    }

    /// Builder: add a field reference
    pub fn with_field_ref(mut self, member: MemberRef) -> Self {
        self.field_refs.push(member);
        self
    }

    /// Builder: add a method reference
    pub fn with_method_ref(mut self, member: MemberRef) -> Self {
        self.method_refs.push(member);
        self
    }

    /// Whether this definition declares an interface
    pub fn is_interface(&self) -> bool {
        self.access_flags & access::ACC_INTERFACE != 0
    }

    /// Find a declared field by name and type
    pub fn find_field(&self, name: &str, descriptor: &str) -> Option<(usize, &FieldDef)> {
        self.fields
            .iter()
            .enumerate()
            .find(|(_, f)| f.name == name && f.descriptor == descriptor)
    }

    /// Find a declared method by name and signature
    pub fn find_method(&self, name: &str, signature: &str) -> Option<(usize, &MethodDef)> {
        self.methods
            .iter()
            .enumerate()
            .find(|(_, m)| m.name == name && m.signature == signature)
    }

    /// Declared static fields
    pub fn static_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.is_static())
    }

    /// Declared instance fields
    pub fn instance_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| !f.is_static())
    }

    /// Number of directly dispatched methods
    pub fn direct_method_count(&self) -> usize {
        self.methods.iter().filter(|m| m.is_direct()).count()
    }

    /// Number of virtually dispatched methods
    pub fn virtual_method_count(&self) -> usize {
        self.methods.len() - self.direct_method_count()
    }

    fn encode(&self, writer: &mut ClassWriter) {
        writer.emit_string(&self.descriptor);
        writer.emit_u32(self.access_flags);
        writer.emit_optional_string(self.superclass.as_deref());

        writer.emit_u32(self.interfaces.len() as u32);
        for iface in &self.interfaces {
            writer.emit_string(iface);
        }
        writer.emit_optional_string(self.source_file.as_deref());

        writer.emit_u32(self.type_refs.len() as u32);
        for ty in &self.type_refs {
            writer.emit_string(ty);
        }
        writer.emit_u32(self.field_refs.len() as u32);
        for member in &self.field_refs {
            member.encode(writer);
        }
        writer.emit_u32(self.method_refs.len() as u32);
        for member in &self.method_refs {
            member.encode(writer);
        }

        writer.emit_u32(self.fields.len() as u32);
        for field in &self.fields {
            writer.emit_string(&field.name);
            writer.emit_string(&field.descriptor);
            writer.emit_u32(field.access_flags);
        }
        writer.emit_u32(self.methods.len() as u32);
        for method in &self.methods {
            method.encode(writer);
        }
    }

    fn decode(reader: &mut ClassReader<'_>) -> Result<Self, DecodeError> {
        let descriptor = reader.read_string()?;
        let access_flags = reader.read_u32()?;
        let superclass = reader.read_optional_string()?;

        let interface_count = reader.read_u32()? as usize;
        let mut interfaces = Vec::with_capacity(interface_count.min(reader.remaining()));
        for _ in 0..interface_count {
            interfaces.push(reader.read_string()?);
        }
        let source_file = reader.read_optional_string()?;

        let type_count = reader.read_u32()? as usize;
        let mut type_refs = Vec::with_capacity(type_count.min(reader.remaining()));
        for _ in 0..type_count {
            type_refs.push(reader.read_string()?);
        }
        let field_ref_count = reader.read_u32()? as usize;
        let mut field_refs = Vec::with_capacity(field_ref_count.min(reader.remaining()));
        for _ in 0..field_ref_count {
            field_refs.push(MemberRef::decode(reader)?);
        }
        let method_ref_count = reader.read_u32()? as usize;
        let mut method_refs = Vec::with_capacity(method_ref_count.min(reader.remaining()));
        for _ in 0..method_ref_count {
            method_refs.push(MemberRef::decode(reader)?);
        }

        let field_count = reader.read_u32()? as usize;
        let mut fields = Vec::with_capacity(field_count.min(reader.remaining()));
        for _ in 0..field_count {
            fields.push(FieldDef {
                name: reader.read_string()?,
                descriptor: reader.read_string()?,
                access_flags: reader.read_u32()?,
            });
        }
        let method_count = reader.read_u32()? as usize;
        let mut methods = Vec::with_capacity(method_count.min(reader.remaining()));
        for _ in 0..method_count {
            methods.push(MethodDef::decode(reader)?);
        }

        Ok(Self {
            descriptor,
            access_flags,
            superclass,
            interfaces,
            source_file,
            type_refs,
            field_refs,
            method_refs,
            fields,
            methods,
        })
    }
}
