//! Instruction set for method bodies
//!
//! Every instruction is a single opcode byte followed by a fixed-size operand
//! whose shape is given by [`OperandKind`]. Pool operands index into the
//! reference pools of the enclosing class definition.

/// Method body opcode enumeration
///
/// Opcodes are grouped by range:
/// - 0x00-0x0F: Constants and registers
/// - 0x10-0x1F: Field access
/// - 0x20-0x2F: Invocation
/// - 0x30-0x3F: Type operations
/// - 0x40-0x4F: Control flow
/// - 0x50-0x5F: Method exit
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // ===== Constants & Registers (0x00-0x0F) =====
    /// No operation
    Nop = 0x00,
    /// Load a 32-bit constant into the accumulator (operand: i32)
    Const = 0x01,
    /// Copy a register into the accumulator (operand: u16 register)
    LoadLocal = 0x02,
    /// Copy the accumulator into a register (operand: u16 register)
    StoreLocal = 0x03,

    // ===== Field Access (0x10-0x1F) =====
    /// Read an instance field (operand: u16 field-ref index)
    GetField = 0x10,
    /// Write an instance field (operand: u16 field-ref index)
    PutField = 0x11,
    /// Read a static field (operand: u16 field-ref index)
    GetStatic = 0x12,
    /// Write a static field (operand: u16 field-ref index)
    PutStatic = 0x13,

    // ===== Invocation (0x20-0x2F) =====
    /// Virtual dispatch (operand: u16 method-ref index)
    InvokeVirtual = 0x20,
    /// Direct call to a private method or constructor (operand: u16 method-ref index)
    InvokeDirect = 0x21,
    /// Static call (operand: u16 method-ref index)
    InvokeStatic = 0x22,

    // ===== Type Operations (0x30-0x3F) =====
    /// Allocate an instance (operand: u16 type-ref index)
    NewInstance = 0x30,
    /// Checked cast (operand: u16 type-ref index)
    CheckCast = 0x31,

    // ===== Control Flow (0x40-0x4F) =====
    /// Unconditional branch (operand: i32 offset from this instruction)
    Goto = 0x40,
    /// Branch if the accumulator is zero (operand: i32 offset from this instruction)
    IfEqz = 0x41,

    // ===== Method Exit (0x50-0x5F) =====
    /// Return the accumulator
    Return = 0x50,
    /// Return without a value
    ReturnVoid = 0x51,
    /// Throw the accumulator
    Throw = 0x52,
}

/// Shape of the operand following an opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// No operand
    None,
    /// Signed 32-bit literal
    Literal,
    /// Register number
    Register,
    /// Index into the field-reference pool
    FieldRef,
    /// Index into the method-reference pool
    MethodRef,
    /// Index into the type-reference pool
    TypeRef,
    /// Signed 32-bit branch offset relative to the instruction start
    Branch,
}

impl OperandKind {
    /// Encoded size of the operand in bytes
    pub fn size(self) -> usize {
        match self {
            OperandKind::None => 0,
            OperandKind::Register
            | OperandKind::FieldRef
            | OperandKind::MethodRef
            | OperandKind::TypeRef => 2,
            OperandKind::Literal | OperandKind::Branch => 4,
        }
    }
}

impl Opcode {
    /// Convert a byte to an opcode
    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => Opcode::Nop,
            0x01 => Opcode::Const,
            0x02 => Opcode::LoadLocal,
            0x03 => Opcode::StoreLocal,
            0x10 => Opcode::GetField,
            0x11 => Opcode::PutField,
            0x12 => Opcode::GetStatic,
            0x13 => Opcode::PutStatic,
            0x20 => Opcode::InvokeVirtual,
            0x21 => Opcode::InvokeDirect,
            0x22 => Opcode::InvokeStatic,
            0x30 => Opcode::NewInstance,
            0x31 => Opcode::CheckCast,
            0x40 => Opcode::Goto,
            0x41 => Opcode::IfEqz,
            0x50 => Opcode::Return,
            0x51 => Opcode::ReturnVoid,
            0x52 => Opcode::Throw,
            _ => return None,
        })
    }

    /// Convert opcode to byte
    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Get the mnemonic of the opcode
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Nop => "nop",
            Opcode::Const => "const",
            Opcode::LoadLocal => "load-local",
            Opcode::StoreLocal => "store-local",
            Opcode::GetField => "get-field",
            Opcode::PutField => "put-field",
            Opcode::GetStatic => "get-static",
            Opcode::PutStatic => "put-static",
            Opcode::InvokeVirtual => "invoke-virtual",
            Opcode::InvokeDirect => "invoke-direct",
            Opcode::InvokeStatic => "invoke-static",
            Opcode::NewInstance => "new-instance",
            Opcode::CheckCast => "check-cast",
            Opcode::Goto => "goto",
            Opcode::IfEqz => "if-eqz",
            Opcode::Return => "return",
            Opcode::ReturnVoid => "return-void",
            Opcode::Throw => "throw",
        }
    }

    /// Operand shape of this opcode
    pub fn operand_kind(self) -> OperandKind {
        match self {
            Opcode::Nop | Opcode::Return | Opcode::ReturnVoid | Opcode::Throw => OperandKind::None,
            Opcode::Const => OperandKind::Literal,
            Opcode::LoadLocal | Opcode::StoreLocal => OperandKind::Register,
            Opcode::GetField | Opcode::PutField | Opcode::GetStatic | Opcode::PutStatic => {
                OperandKind::FieldRef
            }
            Opcode::InvokeVirtual | Opcode::InvokeDirect | Opcode::InvokeStatic => {
                OperandKind::MethodRef
            }
            Opcode::NewInstance | Opcode::CheckCast => OperandKind::TypeRef,
            Opcode::Goto | Opcode::IfEqz => OperandKind::Branch,
        }
    }

    /// Check if this opcode is a branch
    pub fn is_branch(self) -> bool {
        self.operand_kind() == OperandKind::Branch
    }

    /// Check if this opcode leaves the method
    pub fn is_return(self) -> bool {
        matches!(self, Opcode::Return | Opcode::ReturnVoid)
    }

    /// Check if execution can never fall through to the next instruction
    pub fn is_terminator(self) -> bool {
        matches!(
            self,
            Opcode::Return | Opcode::ReturnVoid | Opcode::Throw | Opcode::Goto
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for byte in 0u8..=0xFF {
            if let Some(op) = Opcode::from_u8(byte) {
                assert_eq!(op.to_u8(), byte);
            }
        }
    }

    #[test]
    fn test_invalid_opcode() {
        assert_eq!(Opcode::from_u8(0x04), None);
        assert_eq!(Opcode::from_u8(0xFF), None);
    }

    #[test]
    fn test_operand_sizes() {
        assert_eq!(Opcode::Nop.operand_kind().size(), 0);
        assert_eq!(Opcode::Const.operand_kind().size(), 4);
        assert_eq!(Opcode::GetField.operand_kind().size(), 2);
        assert_eq!(Opcode::Goto.operand_kind().size(), 4);
    }

    #[test]
    fn test_terminator_detection() {
        assert!(Opcode::Return.is_terminator());
        assert!(Opcode::Goto.is_terminator());
        assert!(!Opcode::IfEqz.is_terminator());
        assert!(Opcode::IfEqz.is_branch());
        assert!(!Opcode::Throw.is_return());
    }
}
