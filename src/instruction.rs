//! Instruction representation and wire decoding.
//!
//! Every instruction begins with a four-byte header (a `u16` operation, a
//! `u8` operand count, and a reserved byte) followed by one to three
//! little-endian `u32` operand words and an instruction-specific tail.
//! Operand 1 is always present; for two-operand forms operand 2 is a
//! value-slot descriptor, and three-operand forms add operand 3.

use crate::error::{VmError, VmResult};
use crate::op_code::{OpCode, TailKind};

/// Decoded instruction-specific trailing fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tail {
    None,
    Offset {
        offset: i32,
    },
    ArrayLiteral {
        length: u32,
        ctor: bool,
    },
    FunctionLiteral {
        lambda: u32,
    },
    RegexpLiteral {
        pattern: u32,
    },
    FrameCtor {
        ctor: bool,
    },
    MethodFrame {
        nargs: u32,
        ctor: bool,
    },
    PropertyNext {
        retval: u32,
        offset: i32,
    },
    TryStart {
        exit_value: u32,
        offset: i32,
    },
    Finally {
        exit_value: u32,
        break_offset: i32,
        continue_offset: i32,
    },
    ReferenceError {
        name: u32,
        file: u32,
        token_line: u32,
    },
}

/// A decoded instruction.
#[derive(Debug, Clone)]
pub struct Instruction {
    /// The position of the instruction in the script.
    pub pointer: usize,

    /// The operation.
    pub opcode: OpCode,

    /// Operand words; unused entries are zero.
    pub operands: [u32; 3],

    /// Trailing fields.
    pub tail: Tail,
}

fn read_u32(code: &[u8], at: usize) -> VmResult<u32> {
    let bytes = code
        .get(at..at + 4)
        .ok_or_else(|| VmError::internal(format!("truncated instruction at {at}")))?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_i32(code: &[u8], at: usize) -> VmResult<i32> {
    Ok(read_u32(code, at)? as i32)
}

impl Instruction {
    /// Decodes the instruction at `position`.
    pub fn parse(code: &[u8], position: usize) -> VmResult<Self> {
        let header = code
            .get(position..position + 4)
            .ok_or_else(|| VmError::internal(format!("truncated instruction at {position}")))?;

        let raw_op = u16::from_le_bytes([header[0], header[1]]);
        let opcode = OpCode::try_from(raw_op)
            .map_err(|_| VmError::internal(format!("invalid opcode {raw_op:#06x}")))?;

        let operands_kind = header[2];
        if operands_kind != opcode.operand_count() {
            return Err(VmError::internal(format!(
                "opcode {opcode:?} encoded with {operands_kind} operands, expected {}",
                opcode.operand_count()
            )));
        }

        let mut operands = [0u32; 3];
        let mut at = position + 4;
        for slot in operands.iter_mut().take(operands_kind as usize) {
            *slot = read_u32(code, at)?;
            at += 4;
        }

        let tail = match opcode.tail_kind() {
            TailKind::None => Tail::None,
            TailKind::Offset => Tail::Offset {
                offset: read_i32(code, at)?,
            },
            TailKind::ArrayLiteral => Tail::ArrayLiteral {
                length: read_u32(code, at)?,
                ctor: read_u32(code, at + 4)? != 0,
            },
            TailKind::FunctionLiteral => Tail::FunctionLiteral {
                lambda: read_u32(code, at)?,
            },
            TailKind::RegexpLiteral => Tail::RegexpLiteral {
                pattern: read_u32(code, at)?,
            },
            TailKind::FrameCtor => Tail::FrameCtor {
                ctor: read_u32(code, at)? != 0,
            },
            TailKind::MethodFrame => Tail::MethodFrame {
                nargs: read_u32(code, at)?,
                ctor: read_u32(code, at + 4)? != 0,
            },
            TailKind::PropertyNext => Tail::PropertyNext {
                retval: read_u32(code, at)?,
                offset: read_i32(code, at + 4)?,
            },
            TailKind::TryStart => Tail::TryStart {
                exit_value: read_u32(code, at)?,
                offset: read_i32(code, at + 4)?,
            },
            TailKind::Finally => Tail::Finally {
                exit_value: read_u32(code, at)?,
                break_offset: read_i32(code, at + 4)?,
                continue_offset: read_i32(code, at + 8)?,
            },
            TailKind::ReferenceError => Tail::ReferenceError {
                name: read_u32(code, at)?,
                file: read_u32(code, at + 4)?,
                token_line: read_u32(code, at + 8)?,
            },
        };

        // The tail was validated against the code bounds above.
        if position + opcode.instruction_size() > code.len() {
            return Err(VmError::internal(format!(
                "truncated instruction at {position}"
            )));
        }

        Ok(Self {
            pointer: position,
            opcode,
            operands,
            tail,
        })
    }

    /// The operation.
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// The size of the instruction in bytes.
    pub fn size(&self) -> usize {
        self.opcode.instruction_size()
    }

    pub fn operand1(&self) -> u32 {
        self.operands[0]
    }

    pub fn operand2(&self) -> u32 {
        self.operands[1]
    }

    pub fn operand3(&self) -> u32 {
        self.operands[2]
    }

    /// The jump offset of an `Offset`-tailed instruction.
    pub fn offset(&self) -> VmResult<i32> {
        match self.tail {
            Tail::Offset { offset } => Ok(offset),
            _ => Err(VmError::internal(format!(
                "opcode {:?} has no jump offset",
                self.opcode
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(op: OpCode, operands: &[u32], tail: &[u32]) -> Vec<u8> {
        let mut code = Vec::new();
        code.extend_from_slice(&(op as u16).to_le_bytes());
        code.push(operands.len() as u8);
        code.push(0);
        for word in operands {
            code.extend_from_slice(&word.to_le_bytes());
        }
        for word in tail {
            code.extend_from_slice(&word.to_le_bytes());
        }
        code
    }

    #[test]
    fn test_parse_three_operand() {
        let code = encode(OpCode::Addition, &[1, 2, 3], &[]);
        let instruction = Instruction::parse(&code, 0).unwrap();
        assert_eq!(instruction.opcode(), OpCode::Addition);
        assert_eq!(instruction.operand1(), 1);
        assert_eq!(instruction.operand2(), 2);
        assert_eq!(instruction.operand3(), 3);
        assert_eq!(instruction.size(), 16);
        assert_eq!(instruction.tail, Tail::None);
    }

    #[test]
    fn test_parse_offset_tail() {
        let code = encode(OpCode::Jump, &[0], &[(-8i32) as u32]);
        let instruction = Instruction::parse(&code, 0).unwrap();
        assert_eq!(instruction.offset().unwrap(), -8);
    }

    #[test]
    fn test_parse_finally_tail() {
        let code = encode(OpCode::Finally, &[7], &[9, 16, (-24i32) as u32]);
        let instruction = Instruction::parse(&code, 0).unwrap();
        match instruction.tail {
            Tail::Finally {
                exit_value,
                break_offset,
                continue_offset,
            } => {
                assert_eq!(exit_value, 9);
                assert_eq!(break_offset, 16);
                assert_eq!(continue_offset, -24);
            }
            other => panic!("unexpected tail: {other:?}"),
        }
    }

    #[test]
    fn test_reject_invalid_opcode() {
        let code = encode(OpCode::Stop, &[0], &[]);
        let mut bad = code.clone();
        bad[0] = 0xee;
        bad[1] = 0xee;
        assert!(Instruction::parse(&bad, 0).is_err());
    }

    #[test]
    fn test_reject_operand_count_mismatch() {
        let mut code = encode(OpCode::Addition, &[1, 2, 3], &[]);
        code[2] = 2;
        assert!(Instruction::parse(&code, 0).is_err());
    }

    #[test]
    fn test_reject_truncated() {
        let code = encode(OpCode::Addition, &[1, 2, 3], &[]);
        assert!(Instruction::parse(&code[..10], 0).is_err());
        assert!(Instruction::parse(&code, 20).is_err());
    }
}
