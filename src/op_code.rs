//! OpCode definitions for the Lyra VM.
//!
//! Opcodes are partitioned by the [`NORET`] threshold: operations above it
//! produce a result that the dispatch loop writes into the slot named by
//! operand 1; operations at or below it are jumps, calls and control flow
//! that steer the program counter themselves.
//!
//! Several discriminant relationships are load-bearing:
//! `POST_INCREMENT`/`POST_DECREMENT` are the odd members of the
//! increment family, and `NOT_EQUAL`, `STRICT_NOT_EQUAL` and
//! `TEST_IF_FALSE` each sit one above their non-negated partner.

use num_enum::TryFromPrimitive;
use strum::EnumIter;

/// Threshold separating non-result opcodes (`op <= NORET`) from
/// result-producing ones (`op > NORET`).
pub const NORET: u16 = 0x1f;

/// Represents the operation of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, EnumIter)]
#[repr(u16)]
pub enum OpCode {
    // Non-result operations.
    Stop = 0x01,
    Jump = 0x02,
    PropertySet = 0x03,
    PropertyInit = 0x04,
    IfTrueJump = 0x05,
    IfFalseJump = 0x06,
    IfEqualJump = 0x07,
    Return = 0x08,
    FunctionFrame = 0x09,
    MethodFrame = 0x0a,
    FunctionCall = 0x0b,
    PropertyNext = 0x0c,
    This = 0x0d,
    Arguments = 0x0e,
    TryStart = 0x0f,
    Throw = 0x10,
    TryBreak = 0x11,
    TryContinue = 0x12,
    TryEnd = 0x13,
    Catch = 0x14,
    Finally = 0x15,
    ReferenceError = 0x16,

    // Result-producing operations.
    Move = 0x20,
    PropertyGet = 0x21,
    Increment = 0x22,
    PostIncrement = 0x23,
    Decrement = 0x24,
    PostDecrement = 0x25,
    TryReturn = 0x26,
    Addition = 0x27,
    Subtraction = 0x28,
    Multiplication = 0x29,
    Exponentiation = 0x2a,
    Division = 0x2b,
    Remainder = 0x2c,
    BitwiseAnd = 0x2d,
    BitwiseOr = 0x2e,
    BitwiseXor = 0x2f,
    LeftShift = 0x30,
    RightShift = 0x31,
    UnsignedRightShift = 0x32,
    Equal = 0x33,
    NotEqual = 0x34,
    StrictEqual = 0x35,
    StrictNotEqual = 0x36,
    Less = 0x37,
    Greater = 0x38,
    LessOrEqual = 0x39,
    GreaterOrEqual = 0x3a,
    TestIfTrue = 0x3b,
    TestIfFalse = 0x3c,
    UnaryPlus = 0x3d,
    UnaryNegation = 0x3e,
    BitwiseNot = 0x3f,
    LogicalNot = 0x40,
    Typeof = 0x41,
    Void = 0x42,
    Delete = 0x43,
    Object = 0x44,
    Array = 0x45,
    Function = 0x46,
    Regexp = 0x47,
    ObjectCopy = 0x48,
    TemplateLiteral = 0x49,
    InstanceOf = 0x4a,
    PropertyIn = 0x4b,
    PropertyDelete = 0x4c,
    PropertyForeach = 0x4d,
}

/// Shape of the instruction-specific trailing fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailKind {
    None,
    /// `offset: i32`
    Offset,
    /// `length: u32, ctor: u32`
    ArrayLiteral,
    /// `lambda: u32`
    FunctionLiteral,
    /// `pattern: u32`
    RegexpLiteral,
    /// `ctor: u32`
    FrameCtor,
    /// `nargs: u32, ctor: u32`
    MethodFrame,
    /// `retval: u32, offset: i32`
    PropertyNext,
    /// `exit_value: u32, offset: i32`
    TryStart,
    /// `exit_value: u32, break_offset: i32, continue_offset: i32`
    Finally,
    /// `name: u32, file: u32, token_line: u32`
    ReferenceError,
}

impl TailKind {
    /// Byte size of the trailing fields.
    pub fn size(self) -> usize {
        match self {
            TailKind::None => 0,
            TailKind::Offset
            | TailKind::FunctionLiteral
            | TailKind::RegexpLiteral
            | TailKind::FrameCtor => 4,
            TailKind::ArrayLiteral
            | TailKind::MethodFrame
            | TailKind::PropertyNext
            | TailKind::TryStart => 8,
            TailKind::Finally | TailKind::ReferenceError => 12,
        }
    }
}

impl OpCode {
    /// True when the dispatch loop stores the operation's result into the
    /// slot named by operand 1.
    pub fn is_result(self) -> bool {
        (self as u16) > NORET
    }

    /// Number of encoded operand words (1 to 3). Operand 1 is always
    /// present; operands 2 and 3 are value-slot descriptors.
    pub fn operand_count(self) -> u8 {
        match self {
            OpCode::Stop
            | OpCode::Jump
            | OpCode::Return
            | OpCode::FunctionCall
            | OpCode::This
            | OpCode::Arguments
            | OpCode::TryStart
            | OpCode::Throw
            | OpCode::TryBreak
            | OpCode::TryContinue
            | OpCode::TryEnd
            | OpCode::Catch
            | OpCode::Finally
            | OpCode::ReferenceError
            | OpCode::Object
            | OpCode::Array
            | OpCode::Function
            | OpCode::Regexp
            | OpCode::TemplateLiteral => 1,

            OpCode::IfTrueJump
            | OpCode::IfFalseJump
            | OpCode::FunctionFrame
            | OpCode::Move
            | OpCode::TryReturn
            | OpCode::TestIfTrue
            | OpCode::TestIfFalse
            | OpCode::UnaryPlus
            | OpCode::UnaryNegation
            | OpCode::BitwiseNot
            | OpCode::LogicalNot
            | OpCode::Typeof
            | OpCode::Void
            | OpCode::Delete
            | OpCode::ObjectCopy
            | OpCode::PropertyForeach => 2,

            OpCode::PropertySet
            | OpCode::PropertyInit
            | OpCode::IfEqualJump
            | OpCode::MethodFrame
            | OpCode::PropertyNext
            | OpCode::PropertyGet
            | OpCode::Increment
            | OpCode::PostIncrement
            | OpCode::Decrement
            | OpCode::PostDecrement
            | OpCode::Addition
            | OpCode::Subtraction
            | OpCode::Multiplication
            | OpCode::Exponentiation
            | OpCode::Division
            | OpCode::Remainder
            | OpCode::BitwiseAnd
            | OpCode::BitwiseOr
            | OpCode::BitwiseXor
            | OpCode::LeftShift
            | OpCode::RightShift
            | OpCode::UnsignedRightShift
            | OpCode::Equal
            | OpCode::NotEqual
            | OpCode::StrictEqual
            | OpCode::StrictNotEqual
            | OpCode::Less
            | OpCode::Greater
            | OpCode::LessOrEqual
            | OpCode::GreaterOrEqual
            | OpCode::InstanceOf
            | OpCode::PropertyIn
            | OpCode::PropertyDelete => 3,
        }
    }

    /// The trailing-field shape of this opcode.
    pub fn tail_kind(self) -> TailKind {
        match self {
            OpCode::Jump
            | OpCode::IfTrueJump
            | OpCode::IfFalseJump
            | OpCode::IfEqualJump
            | OpCode::TryBreak
            | OpCode::TryContinue
            | OpCode::TryEnd
            | OpCode::Catch
            | OpCode::TryReturn
            | OpCode::TestIfTrue
            | OpCode::TestIfFalse
            | OpCode::PropertyForeach => TailKind::Offset,
            OpCode::Array => TailKind::ArrayLiteral,
            OpCode::Function => TailKind::FunctionLiteral,
            OpCode::Regexp => TailKind::RegexpLiteral,
            OpCode::FunctionFrame => TailKind::FrameCtor,
            OpCode::MethodFrame => TailKind::MethodFrame,
            OpCode::PropertyNext => TailKind::PropertyNext,
            OpCode::TryStart => TailKind::TryStart,
            OpCode::Finally => TailKind::Finally,
            OpCode::ReferenceError => TailKind::ReferenceError,
            _ => TailKind::None,
        }
    }

    /// Total encoded size of an instruction with this opcode.
    pub fn instruction_size(self) -> usize {
        4 + 4 * self.operand_count() as usize + self.tail_kind().size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_partition_threshold() {
        assert!(!OpCode::Stop.is_result());
        assert!(!OpCode::Finally.is_result());
        assert!(OpCode::Move.is_result());
        assert!(OpCode::PropertyForeach.is_result());
    }

    #[test]
    fn test_increment_family_parity() {
        // The low bit selects post semantics; the second bit selects the
        // decrement direction.
        assert_eq!(OpCode::Increment as u16 & 1, 0);
        assert_eq!(OpCode::PostIncrement as u16 & 1, 1);
        assert_eq!(OpCode::Decrement as u16 & 1, 0);
        assert_eq!(OpCode::PostDecrement as u16 & 1, 1);
        assert_eq!(
            (OpCode::PostIncrement as u16 - OpCode::Increment as u16) >> 1,
            0
        );
        assert_eq!(
            (OpCode::Decrement as u16 - OpCode::Increment as u16) >> 1,
            1
        );
    }

    #[test]
    fn test_negation_partners_adjacent() {
        assert_eq!(OpCode::NotEqual as u16, OpCode::Equal as u16 + 1);
        assert_eq!(
            OpCode::StrictNotEqual as u16,
            OpCode::StrictEqual as u16 + 1
        );
        assert_eq!(OpCode::TestIfFalse as u16, OpCode::TestIfTrue as u16 + 1);
        assert_eq!(OpCode::IfFalseJump as u16, OpCode::IfTrueJump as u16 + 1);
    }

    #[test]
    fn test_round_trip_from_primitive() {
        for op in OpCode::iter() {
            let raw = op as u16;
            assert_eq!(OpCode::try_from(raw).unwrap(), op);
        }
        assert!(OpCode::try_from(0u16).is_err());
        assert!(OpCode::try_from(0xffffu16).is_err());
    }

    #[test]
    fn test_instruction_sizes() {
        assert_eq!(OpCode::Stop.instruction_size(), 8);
        assert_eq!(OpCode::Move.instruction_size(), 12);
        assert_eq!(OpCode::Addition.instruction_size(), 16);
        assert_eq!(OpCode::Jump.instruction_size(), 12);
        assert_eq!(OpCode::Catch.instruction_size(), 12);
        assert_eq!(OpCode::Finally.instruction_size(), 20);
        assert_eq!(OpCode::PropertyNext.instruction_size(), 24);
        for op in OpCode::iter() {
            assert!(op.instruction_size() >= 8);
            assert_eq!(op.instruction_size() % 4, 0);
        }
    }
}
