//! Binary encoding and decoding utilities
//!
//! [`ClassWriter`] emits the primitives of the class-file format and the
//! instructions of method bodies; [`ClassReader`] reads them back.

use crate::opcode::Opcode;
use thiserror::Error;

/// Errors that can occur while decoding
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Unexpected end of input
    #[error("Unexpected end of input at offset {0}")]
    UnexpectedEnd(usize),

    /// Invalid UTF-8 string
    #[error("Invalid UTF-8 string at offset {0}")]
    InvalidUtf8(usize),

    /// Invalid opcode
    #[error("Invalid opcode {0:#x} at offset {1}")]
    InvalidOpcode(u8, usize),

    /// Boolean-like tag byte with an unexpected value
    #[error("Invalid tag {0} at offset {1}")]
    InvalidTag(u8, usize),
}

/// Writer for class-file primitives and instructions
#[derive(Debug, Default)]
pub struct ClassWriter {
    pub(crate) buffer: Vec<u8>,
}

impl ClassWriter {
    /// Create a new writer
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Create a new writer with capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Get the current buffer
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the writer and return the buffer
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Get the current offset
    pub fn offset(&self) -> usize {
        self.buffer.len()
    }

    // ===== Basic Emission =====

    /// Emit a raw byte
    pub fn emit_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Emit a 16-bit unsigned integer (little-endian)
    pub fn emit_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 32-bit unsigned integer (little-endian)
    pub fn emit_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 32-bit signed integer (little-endian)
    pub fn emit_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit raw bytes
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Emit a length-prefixed UTF-8 string
    pub fn emit_string(&mut self, value: &str) {
        self.emit_u32(value.len() as u32);
        self.buffer.extend_from_slice(value.as_bytes());
    }

    /// Emit an optional string as a presence byte followed by the string
    pub fn emit_optional_string(&mut self, value: Option<&str>) {
        match value {
            Some(s) => {
                self.emit_u8(1);
                self.emit_string(s);
            }
            None => self.emit_u8(0),
        }
    }

    /// Overwrite a previously emitted u32
    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        self.buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    // ===== Instruction Emission =====

    /// Emit an opcode without operands
    pub fn emit_opcode(&mut self, opcode: Opcode) {
        self.emit_u8(opcode.to_u8());
    }

    /// Emit NOP
    pub fn emit_nop(&mut self) {
        self.emit_opcode(Opcode::Nop);
    }

    /// Emit CONST with a literal
    pub fn emit_const(&mut self, value: i32) {
        self.emit_opcode(Opcode::Const);
        self.emit_i32(value);
    }

    /// Emit LOAD_LOCAL
    pub fn emit_load_local(&mut self, register: u16) {
        self.emit_opcode(Opcode::LoadLocal);
        self.emit_u16(register);
    }

    /// Emit STORE_LOCAL
    pub fn emit_store_local(&mut self, register: u16) {
        self.emit_opcode(Opcode::StoreLocal);
        self.emit_u16(register);
    }

    /// Emit an instruction taking a pool index (field, method or type reference)
    pub fn emit_indexed(&mut self, opcode: Opcode, index: u16) {
        self.emit_opcode(opcode);
        self.emit_u16(index);
    }

    /// Emit a branch with an offset relative to the branch instruction
    pub fn emit_branch(&mut self, opcode: Opcode, offset: i32) {
        self.emit_opcode(opcode);
        self.emit_i32(offset);
    }

    /// Emit RETURN
    pub fn emit_return(&mut self) {
        self.emit_opcode(Opcode::Return);
    }

    /// Emit RETURN_VOID
    pub fn emit_return_void(&mut self) {
        self.emit_opcode(Opcode::ReturnVoid);
    }

    /// Emit THROW
    pub fn emit_throw(&mut self) {
        self.emit_opcode(Opcode::Throw);
    }
}

/// Reader for class-file primitives
pub struct ClassReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> ClassReader<'a> {
    /// Create a new reader
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Get the current position in the buffer
    pub fn position(&self) -> usize {
        self.position
    }

    /// Get the remaining byte count
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    /// Check if there are more bytes to read
    pub fn has_more(&self) -> bool {
        self.position < self.buffer.len()
    }

    /// Seek to a specific position
    pub fn seek(&mut self, position: usize) {
        self.position = position;
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .position
            .checked_add(count)
            .filter(|end| *end <= self.buffer.len())
            .ok_or(DecodeError::UnexpectedEnd(self.position))?;
        let bytes = &self.buffer[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    // ===== Basic Reading =====

    /// Read a single byte
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    /// Read a 16-bit unsigned integer (little-endian)
    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Read a 32-bit unsigned integer (little-endian)
    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a 32-bit signed integer (little-endian)
    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a fixed number of bytes
    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>, DecodeError> {
        Ok(self.take(count)?.to_vec())
    }

    /// Read a length-prefixed string
    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        let len = self.read_u32()? as usize;
        let start = self.position;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8(start))
    }

    /// Read a string written by [`ClassWriter::emit_optional_string`]
    pub fn read_optional_string(&mut self) -> Result<Option<String>, DecodeError> {
        match self.read_u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.read_string()?)),
            tag => Err(DecodeError::InvalidTag(tag, self.position - 1)),
        }
    }

    /// Read an opcode
    pub fn read_opcode(&mut self) -> Result<Opcode, DecodeError> {
        let byte = self.read_u8()?;
        Opcode::from_u8(byte).ok_or(DecodeError::InvalidOpcode(byte, self.position - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_basic() {
        let mut writer = ClassWriter::new();
        writer.emit_u8(0x42);
        writer.emit_u16(0x1234);
        writer.emit_u32(0x12345678);
        assert_eq!(writer.buffer(), &[0x42, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn test_read_string() {
        let mut writer = ClassWriter::new();
        writer.emit_string("hello");
        writer.emit_optional_string(None);
        writer.emit_optional_string(Some("LFoo;"));

        let bytes = writer.into_bytes();
        let mut reader = ClassReader::new(&bytes);
        assert_eq!(reader.read_string().unwrap(), "hello");
        assert_eq!(reader.read_optional_string().unwrap(), None);
        assert_eq!(reader.read_optional_string().unwrap().as_deref(), Some("LFoo;"));
        assert!(!reader.has_more());
    }

    #[test]
    fn test_unexpected_end() {
        let bytes = [0x01, 0x02];
        let mut reader = ClassReader::new(&bytes);
        assert_eq!(reader.read_u32(), Err(DecodeError::UnexpectedEnd(0)));
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_oversized_string_length() {
        let mut writer = ClassWriter::new();
        writer.emit_u32(u32::MAX);
        let bytes = writer.into_bytes();
        let mut reader = ClassReader::new(&bytes);
        assert!(matches!(reader.read_string(), Err(DecodeError::UnexpectedEnd(_))));
    }

    #[test]
    fn test_instruction_emission() {
        let mut writer = ClassWriter::new();
        writer.emit_const(7);
        writer.emit_return();

        let bytes = writer.into_bytes();
        let mut reader = ClassReader::new(&bytes);
        assert_eq!(reader.read_opcode().unwrap(), Opcode::Const);
        assert_eq!(reader.read_i32().unwrap(), 7);
        assert_eq!(reader.read_opcode().unwrap(), Opcode::Return);
    }

    #[test]
    fn test_patch_u32() {
        let mut writer = ClassWriter::new();
        writer.emit_u32(0);
        writer.emit_u8(9);
        writer.patch_u32(0, 0xDEADBEEF);
        assert_eq!(&writer.buffer()[..4], &0xDEADBEEFu32.to_le_bytes());
    }
}
