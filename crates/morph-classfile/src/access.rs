//! Access flags for classes, fields and methods

/// Public access
pub const ACC_PUBLIC: u32 = 0x0001;
/// Private access
pub const ACC_PRIVATE: u32 = 0x0002;
/// Protected access
pub const ACC_PROTECTED: u32 = 0x0004;
/// Static member
pub const ACC_STATIC: u32 = 0x0008;
/// Final class or member
pub const ACC_FINAL: u32 = 0x0010;
/// Synchronized method
pub const ACC_SYNCHRONIZED: u32 = 0x0020;
/// Volatile field
pub const ACC_VOLATILE: u32 = 0x0040;
/// Transient field
pub const ACC_TRANSIENT: u32 = 0x0080;
/// Native method
pub const ACC_NATIVE: u32 = 0x0100;
/// Interface type
pub const ACC_INTERFACE: u32 = 0x0200;
/// Abstract class or method
pub const ACC_ABSTRACT: u32 = 0x0400;
/// Compiler-generated member
pub const ACC_SYNTHETIC: u32 = 0x1000;
/// Enum type or constant
pub const ACC_ENUM: u32 = 0x4000;
/// Constructor or class initializer
pub const ACC_CONSTRUCTOR: u32 = 0x1_0000;

/// Flags a class definition may carry
pub const CLASS_FLAGS_MASK: u32 = ACC_PUBLIC
    | ACC_FINAL
    | ACC_INTERFACE
    | ACC_ABSTRACT
    | ACC_SYNTHETIC
    | ACC_ENUM;

/// Flags a field definition may carry
pub const FIELD_FLAGS_MASK: u32 = ACC_PUBLIC
    | ACC_PRIVATE
    | ACC_PROTECTED
    | ACC_STATIC
    | ACC_FINAL
    | ACC_VOLATILE
    | ACC_TRANSIENT
    | ACC_SYNTHETIC
    | ACC_ENUM;

/// Flags a method definition may carry
pub const METHOD_FLAGS_MASK: u32 = ACC_PUBLIC
    | ACC_PRIVATE
    | ACC_PROTECTED
    | ACC_STATIC
    | ACC_FINAL
    | ACC_SYNCHRONIZED
    | ACC_NATIVE
    | ACC_ABSTRACT
    | ACC_SYNTHETIC
    | ACC_CONSTRUCTOR;

/// Name of instance constructors
pub const CONSTRUCTOR_NAME: &str = "<init>";
/// Name of the static initializer
pub const CLASS_INITIALIZER_NAME: &str = "<clinit>";

/// Whether a method with these flags is dispatched directly (static, private or constructor)
pub fn is_direct(access_flags: u32) -> bool {
    access_flags & (ACC_STATIC | ACC_PRIVATE | ACC_CONSTRUCTOR) != 0
}

/// Whether a method with these flags has a body to execute
pub fn is_invokable(access_flags: u32) -> bool {
    access_flags & (ACC_ABSTRACT | ACC_NATIVE) == 0
}

/// Render flags as a space-separated modifier list for diagnostics
pub fn describe(access_flags: u32) -> String {
    const NAMES: [(u32, &str); 13] = [
        (ACC_PUBLIC, "public"),
        (ACC_PRIVATE, "private"),
        (ACC_PROTECTED, "protected"),
        (ACC_STATIC, "static"),
        (ACC_FINAL, "final"),
        (ACC_SYNCHRONIZED, "synchronized"),
        (ACC_VOLATILE, "volatile"),
        (ACC_TRANSIENT, "transient"),
        (ACC_NATIVE, "native"),
        (ACC_INTERFACE, "interface"),
        (ACC_ABSTRACT, "abstract"),
        (ACC_SYNTHETIC, "synthetic"),
        (ACC_ENUM, "enum"),
    ];
    NAMES
        .iter()
        .filter(|(bit, _)| access_flags & bit != 0)
        .map(|(_, name)| *name)
        .collect::<Vec<_>>()
        .join(" ")
}
