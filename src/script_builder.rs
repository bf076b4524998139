//! Programmatic bytecode assembly.
//!
//! The builder emits instructions in the wire encoding, interns literals
//! into the constant pool, and resolves label references into byte offsets
//! relative to the start of the referring instruction.

use std::rc::Rc;

use crate::frame::Operand;
use crate::object::Lambda;
use crate::op_code::OpCode;
use crate::script::{Const, RegexpSource, Script};

/// Frame shape of a lambda registered with
/// [`ScriptBuilder::add_lambda`]; the entry address is resolved from the
/// label when the script is built.
#[derive(Debug, Clone, Default)]
pub struct LambdaShape {
    pub nargs: u32,
    pub nlocals: u32,
    pub nclosures: u32,
    pub name: Option<String>,
}

/// A forward or backward jump target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug)]
struct Fixup {
    /// Byte position of the offset field to patch.
    at: usize,
    /// Start of the referring instruction.
    base: usize,
    label: Label,
}

/// Helps construct VM scripts programmatically.
#[derive(Debug, Default)]
pub struct ScriptBuilder {
    code: Vec<u8>,
    constants: Vec<Const>,
    lambdas: Vec<(Label, LambdaShape)>,
    regexps: Vec<RegexpSource>,
    globals: u32,
    locals: u32,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
}

impl ScriptBuilder {
    /// Creates a new script builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the number of global scope slots.
    pub fn set_globals(&mut self, count: u32) -> &mut Self {
        self.globals = count;
        self
    }

    /// Declares the number of root-frame local slots.
    pub fn set_locals(&mut self, count: u32) -> &mut Self {
        self.locals = count;
        self
    }

    /// Current emit position.
    pub fn position(&self) -> usize {
        self.code.len()
    }

    /// Interns a literal, returning its constant-scope operand.
    pub fn constant(&mut self, value: Const) -> Operand {
        let index = self.constants.len() as u32;
        self.constants.push(value);
        Operand::constant(index)
    }

    pub fn number(&mut self, n: f64) -> Operand {
        self.constant(Const::Number(n))
    }

    pub fn string(&mut self, s: &str) -> Operand {
        self.constant(Const::String(s.to_string()))
    }

    pub fn byte_string(&mut self, bytes: Vec<u8>) -> Operand {
        self.constant(Const::ByteString(bytes))
    }

    pub fn boolean(&mut self, b: bool) -> Operand {
        self.constant(Const::Boolean(b))
    }

    pub fn undefined(&mut self) -> Operand {
        self.constant(Const::Undefined)
    }

    pub fn null(&mut self) -> Operand {
        self.constant(Const::Null)
    }

    /// Registers a lambda whose body starts at `entry`, returning its pool
    /// index.
    pub fn add_lambda(&mut self, entry: Label, shape: LambdaShape) -> u32 {
        let index = self.lambdas.len() as u32;
        self.lambdas.push((entry, shape));
        index
    }

    /// Registers a regexp source, returning its pool index.
    pub fn add_regexp(&mut self, pattern: &str, flags: &str) -> u32 {
        let index = self.regexps.len() as u32;
        self.regexps.push(RegexpSource {
            pattern: pattern.to_string(),
            flags: flags.to_string(),
        });
        index
    }

    /// Creates an unbound label.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds a label at the current position.
    pub fn bind(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.code.len());
        self
    }

    fn header(&mut self, op: OpCode) -> usize {
        let base = self.code.len();
        self.code.extend_from_slice(&(op as u16).to_le_bytes());
        self.code.push(op.operand_count());
        self.code.push(0);
        base
    }

    fn word(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    fn offset_to(&mut self, base: usize, label: Label) {
        self.fixups.push(Fixup {
            at: self.code.len(),
            base,
            label,
        });
        self.word(0);
    }

    // Result-producing operations.

    pub fn move_(&mut self, dst: Operand, src: Operand) -> &mut Self {
        self.header(OpCode::Move);
        self.word(dst.raw());
        self.word(src.raw());
        self
    }

    pub fn property_get(&mut self, dst: Operand, object: Operand, key: Operand) -> &mut Self {
        self.header(OpCode::PropertyGet);
        self.word(dst.raw());
        self.word(object.raw());
        self.word(key.raw());
        self
    }

    fn emit_3addr(&mut self, op: OpCode, dst: Operand, a: Operand, b: Operand) -> &mut Self {
        self.header(op);
        self.word(dst.raw());
        self.word(a.raw());
        self.word(b.raw());
        self
    }

    pub fn add(&mut self, dst: Operand, a: Operand, b: Operand) -> &mut Self {
        self.emit_3addr(OpCode::Addition, dst, a, b)
    }

    pub fn sub(&mut self, dst: Operand, a: Operand, b: Operand) -> &mut Self {
        self.emit_3addr(OpCode::Subtraction, dst, a, b)
    }

    pub fn mul(&mut self, dst: Operand, a: Operand, b: Operand) -> &mut Self {
        self.emit_3addr(OpCode::Multiplication, dst, a, b)
    }

    pub fn exp(&mut self, dst: Operand, a: Operand, b: Operand) -> &mut Self {
        self.emit_3addr(OpCode::Exponentiation, dst, a, b)
    }

    pub fn div(&mut self, dst: Operand, a: Operand, b: Operand) -> &mut Self {
        self.emit_3addr(OpCode::Division, dst, a, b)
    }

    pub fn rem(&mut self, dst: Operand, a: Operand, b: Operand) -> &mut Self {
        self.emit_3addr(OpCode::Remainder, dst, a, b)
    }

    pub fn bit_and(&mut self, dst: Operand, a: Operand, b: Operand) -> &mut Self {
        self.emit_3addr(OpCode::BitwiseAnd, dst, a, b)
    }

    pub fn bit_or(&mut self, dst: Operand, a: Operand, b: Operand) -> &mut Self {
        self.emit_3addr(OpCode::BitwiseOr, dst, a, b)
    }

    pub fn bit_xor(&mut self, dst: Operand, a: Operand, b: Operand) -> &mut Self {
        self.emit_3addr(OpCode::BitwiseXor, dst, a, b)
    }

    pub fn shl(&mut self, dst: Operand, a: Operand, b: Operand) -> &mut Self {
        self.emit_3addr(OpCode::LeftShift, dst, a, b)
    }

    pub fn shr(&mut self, dst: Operand, a: Operand, b: Operand) -> &mut Self {
        self.emit_3addr(OpCode::RightShift, dst, a, b)
    }

    pub fn ushr(&mut self, dst: Operand, a: Operand, b: Operand) -> &mut Self {
        self.emit_3addr(OpCode::UnsignedRightShift, dst, a, b)
    }

    pub fn equal(&mut self, dst: Operand, a: Operand, b: Operand) -> &mut Self {
        self.emit_3addr(OpCode::Equal, dst, a, b)
    }

    pub fn not_equal(&mut self, dst: Operand, a: Operand, b: Operand) -> &mut Self {
        self.emit_3addr(OpCode::NotEqual, dst, a, b)
    }

    pub fn strict_equal(&mut self, dst: Operand, a: Operand, b: Operand) -> &mut Self {
        self.emit_3addr(OpCode::StrictEqual, dst, a, b)
    }

    pub fn strict_not_equal(&mut self, dst: Operand, a: Operand, b: Operand) -> &mut Self {
        self.emit_3addr(OpCode::StrictNotEqual, dst, a, b)
    }

    pub fn less(&mut self, dst: Operand, a: Operand, b: Operand) -> &mut Self {
        self.emit_3addr(OpCode::Less, dst, a, b)
    }

    pub fn greater(&mut self, dst: Operand, a: Operand, b: Operand) -> &mut Self {
        self.emit_3addr(OpCode::Greater, dst, a, b)
    }

    pub fn less_or_equal(&mut self, dst: Operand, a: Operand, b: Operand) -> &mut Self {
        self.emit_3addr(OpCode::LessOrEqual, dst, a, b)
    }

    pub fn greater_or_equal(&mut self, dst: Operand, a: Operand, b: Operand) -> &mut Self {
        self.emit_3addr(OpCode::GreaterOrEqual, dst, a, b)
    }

    /// Emits an increment-family opcode; `slot` is both read and written.
    pub fn increment(&mut self, dst: Operand, slot: Operand) -> &mut Self {
        self.emit_3addr(OpCode::Increment, dst, slot, slot)
    }

    pub fn post_increment(&mut self, dst: Operand, slot: Operand) -> &mut Self {
        self.emit_3addr(OpCode::PostIncrement, dst, slot, slot)
    }

    pub fn decrement(&mut self, dst: Operand, slot: Operand) -> &mut Self {
        self.emit_3addr(OpCode::Decrement, dst, slot, slot)
    }

    pub fn post_decrement(&mut self, dst: Operand, slot: Operand) -> &mut Self {
        self.emit_3addr(OpCode::PostDecrement, dst, slot, slot)
    }

    fn emit_2addr(&mut self, op: OpCode, dst: Operand, src: Operand) -> &mut Self {
        self.header(op);
        self.word(dst.raw());
        self.word(src.raw());
        self
    }

    pub fn unary_plus(&mut self, dst: Operand, src: Operand) -> &mut Self {
        self.emit_2addr(OpCode::UnaryPlus, dst, src)
    }

    pub fn unary_negation(&mut self, dst: Operand, src: Operand) -> &mut Self {
        self.emit_2addr(OpCode::UnaryNegation, dst, src)
    }

    pub fn bitwise_not(&mut self, dst: Operand, src: Operand) -> &mut Self {
        self.emit_2addr(OpCode::BitwiseNot, dst, src)
    }

    pub fn logical_not(&mut self, dst: Operand, src: Operand) -> &mut Self {
        self.emit_2addr(OpCode::LogicalNot, dst, src)
    }

    pub fn typeof_(&mut self, dst: Operand, src: Operand) -> &mut Self {
        self.emit_2addr(OpCode::Typeof, dst, src)
    }

    pub fn void_(&mut self, dst: Operand, src: Operand) -> &mut Self {
        self.emit_2addr(OpCode::Void, dst, src)
    }

    pub fn delete(&mut self, dst: Operand, src: Operand) -> &mut Self {
        self.emit_2addr(OpCode::Delete, dst, src)
    }

    pub fn object_copy(&mut self, dst: Operand, src: Operand) -> &mut Self {
        self.emit_2addr(OpCode::ObjectCopy, dst, src)
    }

    pub fn object(&mut self, dst: Operand) -> &mut Self {
        self.header(OpCode::Object);
        self.word(dst.raw());
        self
    }

    pub fn array(&mut self, dst: Operand, length: u32, ctor: bool) -> &mut Self {
        self.header(OpCode::Array);
        self.word(dst.raw());
        self.word(length);
        self.word(ctor as u32);
        self
    }

    pub fn function(&mut self, dst: Operand, lambda: u32) -> &mut Self {
        self.header(OpCode::Function);
        self.word(dst.raw());
        self.word(lambda);
        self
    }

    pub fn regexp(&mut self, dst: Operand, pattern: u32) -> &mut Self {
        self.header(OpCode::Regexp);
        self.word(dst.raw());
        self.word(pattern);
        self
    }

    /// The collected-parts array is read from and the result written back to
    /// `slot`.
    pub fn template_literal(&mut self, slot: Operand) -> &mut Self {
        self.header(OpCode::TemplateLiteral);
        self.word(slot.raw());
        self
    }

    pub fn instance_of(&mut self, dst: Operand, object: Operand, ctor: Operand) -> &mut Self {
        self.emit_3addr(OpCode::InstanceOf, dst, object, ctor)
    }

    pub fn property_in(&mut self, dst: Operand, object: Operand, key: Operand) -> &mut Self {
        self.emit_3addr(OpCode::PropertyIn, dst, object, key)
    }

    pub fn property_delete(&mut self, dst: Operand, object: Operand, key: Operand) -> &mut Self {
        self.emit_3addr(OpCode::PropertyDelete, dst, object, key)
    }

    pub fn property_foreach(&mut self, dst: Operand, object: Operand, target: Label) -> &mut Self {
        let base = self.header(OpCode::PropertyForeach);
        self.word(dst.raw());
        self.word(object.raw());
        self.offset_to(base, target);
        self
    }

    pub fn test_if_true(&mut self, dst: Operand, src: Operand, target: Label) -> &mut Self {
        let base = self.header(OpCode::TestIfTrue);
        self.word(dst.raw());
        self.word(src.raw());
        self.offset_to(base, target);
        self
    }

    pub fn test_if_false(&mut self, dst: Operand, src: Operand, target: Label) -> &mut Self {
        let base = self.header(OpCode::TestIfFalse);
        self.word(dst.raw());
        self.word(src.raw());
        self.offset_to(base, target);
        self
    }

    /// Stores `src` into the exit-value slot `dst` and jumps to the try-end
    /// block.
    pub fn try_return(&mut self, dst: Operand, src: Operand, target: Label) -> &mut Self {
        let base = self.header(OpCode::TryReturn);
        self.word(dst.raw());
        self.word(src.raw());
        self.offset_to(base, target);
        self
    }

    // Non-result operations.

    pub fn stop(&mut self, src: Operand) -> &mut Self {
        self.header(OpCode::Stop);
        self.word(src.raw());
        self
    }

    pub fn jump(&mut self, target: Label) -> &mut Self {
        let base = self.header(OpCode::Jump);
        self.word(0);
        self.offset_to(base, target);
        self
    }

    pub fn property_set(&mut self, value: Operand, object: Operand, key: Operand) -> &mut Self {
        self.header(OpCode::PropertySet);
        self.word(value.raw());
        self.word(object.raw());
        self.word(key.raw());
        self
    }

    pub fn property_init(&mut self, value: Operand, object: Operand, key: Operand) -> &mut Self {
        self.header(OpCode::PropertyInit);
        self.word(value.raw());
        self.word(object.raw());
        self.word(key.raw());
        self
    }

    pub fn if_true_jump(&mut self, src: Operand, target: Label) -> &mut Self {
        let base = self.header(OpCode::IfTrueJump);
        self.word(0);
        self.word(src.raw());
        self.offset_to(base, target);
        self
    }

    pub fn if_false_jump(&mut self, src: Operand, target: Label) -> &mut Self {
        let base = self.header(OpCode::IfFalseJump);
        self.word(0);
        self.word(src.raw());
        self.offset_to(base, target);
        self
    }

    pub fn if_equal_jump(&mut self, a: Operand, b: Operand, target: Label) -> &mut Self {
        let base = self.header(OpCode::IfEqualJump);
        self.word(0);
        self.word(a.raw());
        self.word(b.raw());
        self.offset_to(base, target);
        self
    }

    pub fn return_(&mut self, src: Operand) -> &mut Self {
        self.header(OpCode::Return);
        self.word(src.raw());
        self
    }

    pub fn function_frame(&mut self, callee: Operand, nargs: u32, ctor: bool) -> &mut Self {
        self.header(OpCode::FunctionFrame);
        self.word(nargs);
        self.word(callee.raw());
        self.word(ctor as u32);
        self
    }

    pub fn method_frame(
        &mut self,
        receiver: Operand,
        key: Operand,
        nargs: u32,
        ctor: bool,
    ) -> &mut Self {
        self.header(OpCode::MethodFrame);
        self.word(0);
        self.word(receiver.raw());
        self.word(key.raw());
        self.word(nargs);
        self.word(ctor as u32);
        self
    }

    pub fn function_call(&mut self, retval: Operand) -> &mut Self {
        self.header(OpCode::FunctionCall);
        self.word(retval.raw());
        self
    }

    pub fn property_next(
        &mut self,
        object: Operand,
        iterator: Operand,
        retval: Operand,
        target: Label,
    ) -> &mut Self {
        let base = self.header(OpCode::PropertyNext);
        self.word(0);
        self.word(object.raw());
        self.word(iterator.raw());
        self.word(retval.raw());
        self.offset_to(base, target);
        self
    }

    pub fn this_(&mut self, dst: Operand) -> &mut Self {
        self.header(OpCode::This);
        self.word(dst.raw());
        self
    }

    pub fn arguments(&mut self, dst: Operand) -> &mut Self {
        self.header(OpCode::Arguments);
        self.word(dst.raw());
        self
    }

    pub fn try_start(
        &mut self,
        exception_slot: Operand,
        exit_slot: Operand,
        catch_target: Label,
    ) -> &mut Self {
        let base = self.header(OpCode::TryStart);
        self.word(exception_slot.raw());
        self.word(exit_slot.raw());
        self.offset_to(base, catch_target);
        self
    }

    pub fn throw(&mut self, src: Operand) -> &mut Self {
        self.header(OpCode::Throw);
        self.word(src.raw());
        self
    }

    pub fn try_break(&mut self, exit_slot: Operand, target: Label) -> &mut Self {
        let base = self.header(OpCode::TryBreak);
        self.word(exit_slot.raw());
        self.offset_to(base, target);
        self
    }

    pub fn try_continue(&mut self, exit_slot: Operand, target: Label) -> &mut Self {
        let base = self.header(OpCode::TryContinue);
        self.word(exit_slot.raw());
        self.offset_to(base, target);
        self
    }

    pub fn try_end(&mut self, target: Label) -> &mut Self {
        let base = self.header(OpCode::TryEnd);
        self.word(0);
        self.offset_to(base, target);
        self
    }

    /// A catch block with no following finally: stores the in-flight
    /// exception and leaves the try region.
    pub fn catch_no_finally(&mut self, dst: Operand) -> &mut Self {
        self.header(OpCode::Catch);
        self.word(dst.raw());
        self.word(OpCode::Catch.instruction_size() as u32);
        self
    }

    /// A catch block followed by a finally region starting at `finally_target`.
    pub fn catch_with_finally(&mut self, dst: Operand, finally_target: Label) -> &mut Self {
        let base = self.header(OpCode::Catch);
        self.word(dst.raw());
        self.offset_to(base, finally_target);
        self
    }

    pub fn finally(
        &mut self,
        exception_slot: Operand,
        exit_slot: Operand,
        break_target: Option<Label>,
        continue_target: Option<Label>,
    ) -> &mut Self {
        let base = self.header(OpCode::Finally);
        self.word(exception_slot.raw());
        self.word(exit_slot.raw());
        match break_target {
            Some(label) => self.offset_to(base, label),
            None => self.word(0),
        }
        match continue_target {
            Some(label) => self.offset_to(base, label),
            None => self.word(0),
        }
        self
    }

    pub fn reference_error(&mut self, name: &str, file: &str, token_line: u32) -> &mut Self {
        let name_index = self.constants.len() as u32;
        self.constants.push(Const::String(name.to_string()));
        let file_index = self.constants.len() as u32;
        self.constants.push(Const::String(file.to_string()));

        self.header(OpCode::ReferenceError);
        self.word(0);
        self.word(name_index);
        self.word(file_index);
        self.word(token_line);
        self
    }

    /// Resolves labels and produces the script.
    ///
    /// Panics when a referenced label was never bound; that is a bug in the
    /// calling compiler or test.
    pub fn build(self) -> Script {
        let mut code = self.code;
        for fixup in &self.fixups {
            let target = self.labels[fixup.label.0]
                .unwrap_or_else(|| panic!("unbound label {:?}", fixup.label));
            let offset = target as i64 - fixup.base as i64;
            code[fixup.at..fixup.at + 4].copy_from_slice(&(offset as i32).to_le_bytes());
        }
        let lambdas = self
            .lambdas
            .into_iter()
            .map(|(entry, shape)| {
                let address = self.labels[entry.0]
                    .unwrap_or_else(|| panic!("unbound lambda entry {entry:?}"));
                Rc::new(Lambda {
                    address,
                    nargs: shape.nargs,
                    nlocals: shape.nlocals,
                    nclosures: shape.nclosures,
                    name: shape.name,
                })
            })
            .collect();
        Script::new(
            code,
            self.constants,
            lambdas,
            self.regexps,
            self.globals,
            self.locals,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Tail;

    #[test]
    fn test_backward_and_forward_labels() {
        let mut b = ScriptBuilder::new();
        let top = b.label();
        let done = b.label();
        b.bind(top);
        let base = b.position();
        b.jump(done);
        b.jump(top);
        b.bind(done);
        b.stop(Operand::global(0));
        let script = b.build();

        let first = script.instruction_at(base).unwrap();
        let second = script.instruction_at(base + first.size()).unwrap();
        // Forward jump skips both jumps; backward jump returns to the top.
        assert_eq!(first.offset().unwrap(), (first.size() * 2) as i32);
        assert_eq!(second.offset().unwrap(), -(first.size() as i32));
        script.validate().unwrap();
    }

    #[test]
    fn test_catch_no_finally_offset_equals_size() {
        let mut b = ScriptBuilder::new();
        b.catch_no_finally(Operand::local(0));
        let script = b.build();
        let instruction = script.instruction_at(0).unwrap();
        assert_eq!(
            instruction.offset().unwrap() as usize,
            instruction.size()
        );
    }

    #[test]
    fn test_method_frame_tail() {
        let mut b = ScriptBuilder::new();
        let key = b.string("m");
        b.method_frame(Operand::local(0), key, 2, true);
        let script = b.build();
        match script.instruction_at(0).unwrap().tail {
            Tail::MethodFrame { nargs, ctor } => {
                assert_eq!(nargs, 2);
                assert!(ctor);
            }
            other => panic!("unexpected tail: {other:?}"),
        }
    }

    #[test]
    #[should_panic(expected = "unbound label")]
    fn test_unbound_label_panics() {
        let mut b = ScriptBuilder::new();
        let label = b.label();
        b.jump(label);
        b.build();
    }
}
