//! The virtual machine: dispatch loop, call frames, exception machinery.
//!
//! The loop decodes the instruction at the program counter, resolves its
//! operands against the current frame's scopes, executes the operation, and
//! advances by the instruction size or a jump offset relative to the start
//! of the instruction. Result-producing opcodes store into the slot named
//! by operand 1. Errors enter the unwinder, which transfers control to the
//! nearest catch address or reports the exception to the embedder.

use std::rc::Rc;

use log::{debug, trace, warn};

use crate::convert::{self, Hint};
use crate::equality;
use crate::error::{VmError, VmResult};
use crate::frame::{Frame, Operand, ScopeKind};
use crate::heap::{Heap, ObjRef};
use crate::instruction::{Instruction, Tail};
use crate::object::{
    Attribute, ExternalObject, ExternalProto, FunctionData, HostIter, Payload, Property,
    RegexpData, SharedHashes,
};
use crate::op_code::OpCode;
use crate::options::{VmLimits, VmOptions};
use crate::property;
use crate::script::{Const, Script};
use crate::string::{self, VmString};
use crate::value::{strict_equals, DataValue, Value, ValueKind};

/// Execution state of a VM instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Not started yet.
    Ready,
    Running,
    /// Completed normally; the result was returned from `interpret`.
    Halted,
    /// Preempted; `interpret` may be called again to resume at the next
    /// instruction.
    Suspended,
    /// An exception crossed the script-to-host boundary.
    Faulted,
}

/// One frame recorded while unwinding in debug mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacktraceEntry {
    pub name: String,
    pub pc: usize,
}

enum Step {
    Continue,
    Halt,
}

/// A virtual machine executing one compiled script.
pub struct Vm {
    script: Rc<Script>,
    pc: usize,
    pub(crate) heap: Heap,
    globals: Vec<Value>,
    constants: Vec<Value>,
    frames: Vec<Frame>,
    /// Frames prepared by `*_FRAME` opcodes, awaiting `FUNCTION_CALL`.
    pending: Vec<Frame>,
    /// Scratch return slot; holds the in-flight exception during unwind.
    pub(crate) retval: Value,
    pub(crate) pending_exception: Option<Value>,
    pub(crate) shared: SharedHashes,
    pub(crate) externals: Vec<ExternalObject>,
    options: VmOptions,
    limits: VmLimits,
    backtrace: Vec<BacktraceEntry>,
    stack_size: usize,
    state: VmState,
    preempt: bool,
}

impl Vm {
    /// Creates a VM for `script` with default options and limits.
    pub fn new(script: Script) -> Self {
        Self::with_options(script, VmOptions::default(), VmLimits::default())
    }

    /// Creates a VM with explicit options and limits.
    pub fn with_options(script: Script, options: VmOptions, limits: VmLimits) -> Self {
        let mut heap = Heap::new();
        let mut shared = SharedHashes::new();

        shared.register(
            ValueKind::Array,
            "length",
            Property::handler(property::array_length_handler),
        );
        shared.register(
            ValueKind::String,
            "length",
            Property::handler(property::string_length_handler),
        );
        let concat = Value::Function(
            heap.alloc_function(FunctionData::native(string::string_prototype_concat, false)),
        );
        heap.retain(&concat);
        shared.register(ValueKind::String, "concat", Property::data(concat));

        let constants = script
            .constants()
            .iter()
            .map(|c| match c {
                Const::Undefined => Value::Undefined,
                Const::Null => Value::Null,
                Const::Boolean(b) => Value::Boolean(*b),
                Const::Number(n) => Value::Number(*n),
                Const::String(s) => Value::String(VmString::new(s)),
                Const::ByteString(b) => Value::String(VmString::from_bytes(b.clone())),
            })
            .collect();

        let globals = vec![Value::Undefined; script.globals() as usize];

        Self {
            script: Rc::new(script),
            pc: 0,
            heap,
            globals,
            constants,
            frames: Vec::new(),
            pending: Vec::new(),
            retval: Value::invalid(),
            pending_exception: None,
            shared,
            externals: Vec::new(),
            options,
            limits,
            backtrace: Vec::new(),
            stack_size: 0,
            state: VmState::Ready,
            preempt: false,
        }
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn globals(&self) -> &[Value] {
        &self.globals
    }

    /// The backtrace captured during the last unwind, in debug mode.
    pub fn backtrace(&self) -> &[BacktraceEntry] {
        &self.backtrace
    }

    /// Requests a clean exit before the next instruction; the frame stack
    /// stays resumable.
    pub fn request_preempt(&mut self) {
        self.preempt = true;
    }

    /// Registers an external object instance, returning its value.
    pub fn register_external(
        &mut self,
        proto: Rc<ExternalProto>,
        data: Option<DataValue>,
    ) -> Value {
        let index = self.externals.len() as u32;
        self.externals.push(ExternalObject { proto, data });
        Value::External(crate::object::ExternRef(index))
    }

    /// Registers an inherited property in a per-kind shared hash.
    pub fn register_shared_property(&mut self, kind: ValueKind, key: &str, property: Property) {
        self.shared.register(kind, key, property);
    }

    /// The host datum attached to an external value, if any.
    pub fn external_data(&self, value: &Value) -> Option<&DataValue> {
        match value {
            Value::External(r) => self.externals.get(r.index()).and_then(|e| e.data.as_ref()),
            _ => None,
        }
    }

    /// Writes a global scope slot; the embedder's way to seed state before
    /// `interpret`.
    pub fn set_global(&mut self, index: u32, value: Value) -> VmResult<()> {
        self.store(Operand::global(index), value)
    }

    /// Renders a value with ToString, for diagnostics and assertions.
    pub fn to_display_string(&self, value: &Value) -> String {
        convert::to_string_value(&self.heap, value)
            .map(|s| s.to_lossy())
            .unwrap_or_else(|_| "<unrenderable>".to_string())
    }

    /// Runs until `STOP`, a return past the root frame, a preemption, or an
    /// uncaught exception.
    pub fn interpret(&mut self) -> VmResult<Value> {
        if self.state != VmState::Suspended && self.frames.is_empty() {
            let frame = Frame::root(self.script.locals() as usize);
            self.stack_size += frame.size;
            self.frames.push(frame);
            self.pc = 0;
        }
        self.state = VmState::Running;

        loop {
            if self.preempt {
                self.preempt = false;
                self.state = VmState::Suspended;
                debug!("preempted at pc={}", self.pc);
                return Ok(Value::Undefined);
            }

            let instruction = match self.script.instruction_at(self.pc) {
                Ok(instruction) => instruction,
                Err(err) => match self.unwind(err) {
                    Ok(()) => continue,
                    Err(err) => return self.fault(err),
                },
            };

            if self.options.contains(VmOptions::DEBUG) {
                trace!("pc={} op={:?}", self.pc, instruction.opcode());
            }

            match self.step(&instruction) {
                Ok(Step::Continue) => {}
                Ok(Step::Halt) => {
                    self.state = VmState::Halted;
                    return Ok(std::mem::replace(&mut self.retval, Value::invalid()));
                }
                Err(err) => match self.unwind(err) {
                    Ok(()) => {}
                    Err(err) => return self.fault(err),
                },
            }
        }
    }

    fn fault(&mut self, err: VmError) -> VmResult<Value> {
        warn!("vm fault: {err}");
        self.state = VmState::Faulted;
        Err(err)
    }

    // Operand access.

    fn op1(&self, instruction: &Instruction) -> Operand {
        Operand::from_raw(instruction.operand1())
    }

    fn value1(&self, instruction: &Instruction) -> VmResult<Value> {
        self.load(Operand::from_raw(instruction.operand2()))
    }

    fn value2(&self, instruction: &Instruction) -> VmResult<Value> {
        self.load(Operand::from_raw(instruction.operand3()))
    }

    pub(crate) fn load(&self, operand: Operand) -> VmResult<Value> {
        let index = operand.index();
        let slot = match operand.scope()? {
            ScopeKind::Global => self.globals.get(index).cloned(),
            ScopeKind::Constant => self.constants.get(index).cloned(),
            ScopeKind::Arguments => self
                .frames
                .last()
                .and_then(|f| f.arguments.get(index))
                .cloned(),
            ScopeKind::CalleeArguments => self
                .pending
                .last()
                .and_then(|f| f.arguments.get(index))
                .cloned(),
            ScopeKind::Local => self.frames.last().and_then(|f| f.locals.get(index)).cloned(),
            ScopeKind::Closure => self
                .frames
                .last()
                .and_then(|f| f.closures.get(index))
                .map(|cell| cell.borrow().clone()),
        };
        slot.ok_or_else(|| VmError::internal(format!("operand {:#x} out of range", operand.raw())))
    }

    pub(crate) fn store(&mut self, operand: Operand, value: Value) -> VmResult<()> {
        let index = operand.index();
        let out_of_range =
            || VmError::internal(format!("operand {:#x} out of range", operand.raw()));

        let old = match operand.scope()? {
            ScopeKind::Constant => {
                return Err(VmError::internal("store into the constant scope"));
            }
            ScopeKind::Global => {
                let slot = self.globals.get_mut(index).ok_or_else(out_of_range)?;
                std::mem::replace(slot, value.clone())
            }
            ScopeKind::Arguments => {
                let slot = self
                    .frames
                    .last_mut()
                    .and_then(|f| f.arguments.get_mut(index))
                    .ok_or_else(out_of_range)?;
                std::mem::replace(slot, value.clone())
            }
            ScopeKind::CalleeArguments => {
                let slot = self
                    .pending
                    .last_mut()
                    .and_then(|f| f.arguments.get_mut(index))
                    .ok_or_else(out_of_range)?;
                std::mem::replace(slot, value.clone())
            }
            ScopeKind::Local => {
                let slot = self
                    .frames
                    .last_mut()
                    .and_then(|f| f.locals.get_mut(index))
                    .ok_or_else(out_of_range)?;
                std::mem::replace(slot, value.clone())
            }
            ScopeKind::Closure => {
                let cell = self
                    .frames
                    .last()
                    .and_then(|f| f.closures.get(index))
                    .cloned()
                    .ok_or_else(out_of_range)?;
                cell.replace(value.clone())
            }
        };

        self.heap.release(&old);
        self.heap.retain(&value);
        Ok(())
    }

    fn jump(&mut self, base: usize, offset: i32) -> VmResult<()> {
        let target = base as i64 + offset as i64;
        if target < 0 || target as usize >= self.script.len() {
            return Err(VmError::InvalidJump(target));
        }
        self.pc = target as usize;
        Ok(())
    }

    fn advance(&mut self, instruction: &Instruction) {
        self.pc = instruction.pointer + instruction.size();
    }

    // Exception construction.

    pub(crate) fn error_object(&mut self, name: &str, message: &str) -> Value {
        let r = self.heap.alloc_object();
        let entity = self.heap.get_mut(r);
        entity
            .hash
            .insert(Rc::from("name"), Property::data(Value::string(name)));
        entity
            .hash
            .insert(Rc::from("message"), Property::data(Value::string(message)));
        Value::Object(r)
    }

    pub(crate) fn throw_type_error(&mut self, message: impl Into<String>) -> VmError {
        let message = message.into();
        let exception = self.error_object("TypeError", &message);
        self.pending_exception = Some(exception);
        VmError::type_error(message)
    }

    pub(crate) fn throw_reference_error(&mut self, message: impl Into<String>) -> VmError {
        let message = message.into();
        let exception = self.error_object("ReferenceError", &message);
        self.pending_exception = Some(exception);
        VmError::reference_error(message)
    }

    pub(crate) fn throw_range_error(&mut self, message: impl Into<String>) -> VmError {
        let message = message.into();
        let exception = self.error_object("RangeError", &message);
        self.pending_exception = Some(exception);
        VmError::range_error(message)
    }

    pub(crate) fn throw_internal_error(&mut self, message: impl Into<String>) -> VmError {
        let message = message.into();
        let exception = self.error_object("InternalError", &message);
        self.pending_exception = Some(exception);
        VmError::internal(message)
    }

    // Dispatch.

    fn step(&mut self, instruction: &Instruction) -> VmResult<Step> {
        let op = instruction.opcode();
        let base = instruction.pointer;

        match op {
            // Result-producing operations.
            OpCode::Move => {
                let value = self.value1(instruction)?;
                self.store(self.op1(instruction), value)?;
                self.advance(instruction);
            }

            OpCode::PropertyGet => {
                let object = self.value1(instruction)?;
                let key = self.value2(instruction)?;
                let value = self.property_get(&object, &key)?;
                self.store(self.op1(instruction), value)?;
                self.advance(instruction);
            }

            OpCode::Increment
            | OpCode::PostIncrement
            | OpCode::Decrement
            | OpCode::PostDecrement => {
                let source = self.value2(instruction)?;
                let num = match source {
                    Value::Number(n) => n,
                    other => convert::to_number(&self.heap, &other)?,
                };
                let delta = 1.0 - 2.0 * (((op as u16 - OpCode::Increment as u16) >> 1) as f64);
                let written = Value::Number(num + delta);
                self.store(Operand::from_raw(instruction.operand2()), written.clone())?;

                // Post variants are the odd opcodes and yield the old value.
                let result = if (op as u16) & 1 == 1 {
                    Value::Number(num)
                } else {
                    written
                };
                self.store(self.op1(instruction), result)?;
                self.advance(instruction);
            }

            OpCode::TryReturn => {
                let value = self.value1(instruction)?;
                self.store(self.op1(instruction), value)?;
                self.jump(base, instruction.offset()?)?;
            }

            OpCode::Addition
            | OpCode::Less
            | OpCode::Greater
            | OpCode::LessOrEqual
            | OpCode::GreaterOrEqual => {
                let mut v1 = self.value1(instruction)?;
                let mut v2 = self.value2(instruction)?;

                if !v1.is_primitive() {
                    let hint = if op == OpCode::Addition && v1.is_date() {
                        Hint::String
                    } else {
                        Hint::Number
                    };
                    v1 = convert::to_primitive(&self.heap, &v1, hint)?;
                }
                if !v2.is_primitive() {
                    let hint = if op == OpCode::Addition && v2.is_date() {
                        Hint::String
                    } else {
                        Hint::Number
                    };
                    v2 = convert::to_primitive(&self.heap, &v2, hint)?;
                }

                let result = if op == OpCode::Addition {
                    if let (Value::Number(a), Value::Number(b)) = (&v1, &v2) {
                        Value::Number(a + b)
                    } else if v1.is_string() || v2.is_string() {
                        let s1 = convert::to_string_value(&self.heap, &v1)?;
                        let s2 = convert::to_string_value(&self.heap, &v2)?;
                        Value::String(VmString::concat(&s1, &s2))
                    } else {
                        let a = convert::to_number(&self.heap, &v1)?;
                        let b = convert::to_number(&self.heap, &v2)?;
                        Value::Number(a + b)
                    }
                } else {
                    let (a, b) = if matches!(op, OpCode::Greater | OpCode::LessOrEqual) {
                        (&v2, &v1)
                    } else {
                        (&v1, &v2)
                    };
                    let ret = equality::primitive_compare(a, b);
                    let truth = if matches!(op, OpCode::Less | OpCode::Greater) {
                        ret > 0
                    } else {
                        ret == 0
                    };
                    Value::Boolean(truth)
                };

                self.store(self.op1(instruction), result)?;
                self.advance(instruction);
            }

            OpCode::Equal | OpCode::NotEqual => {
                let v1 = self.value1(instruction)?;
                let v2 = self.value2(instruction)?;
                let equal = equality::values_equal(&self.heap, &v1, &v2)?;
                let negate = op == OpCode::NotEqual;
                self.store(self.op1(instruction), Value::Boolean(equal ^ negate))?;
                self.advance(instruction);
            }

            OpCode::StrictEqual | OpCode::StrictNotEqual => {
                let v1 = self.value1(instruction)?;
                let v2 = self.value2(instruction)?;
                let equal = strict_equals(&v1, &v2);
                let negate = op == OpCode::StrictNotEqual;
                self.store(self.op1(instruction), Value::Boolean(equal ^ negate))?;
                self.advance(instruction);
            }

            OpCode::Subtraction
            | OpCode::Multiplication
            | OpCode::Exponentiation
            | OpCode::Division
            | OpCode::Remainder
            | OpCode::BitwiseAnd
            | OpCode::BitwiseOr
            | OpCode::BitwiseXor
            | OpCode::LeftShift
            | OpCode::RightShift
            | OpCode::UnsignedRightShift => {
                let v1 = self.value1(instruction)?;
                let v2 = self.value2(instruction)?;
                let num = convert::to_number(&self.heap, &v1)?;
                let rhs = convert::to_number(&self.heap, &v2)?;

                let result = match op {
                    OpCode::Subtraction => Value::Number(num - rhs),
                    OpCode::Multiplication => Value::Number(num * rhs),
                    OpCode::Division => Value::Number(num / rhs),
                    OpCode::Remainder => Value::Number(num % rhs),
                    OpCode::Exponentiation => {
                        // +/-1 ** +/-Infinity and NaN exponents are NaN.
                        let valid = num.abs() != 1.0 || (!rhs.is_nan() && !rhs.is_infinite());
                        Value::Number(if valid { num.powf(rhs) } else { f64::NAN })
                    }
                    OpCode::BitwiseAnd => {
                        Value::Number((convert::to_int32(num) & convert::to_int32(rhs)) as f64)
                    }
                    OpCode::BitwiseOr => {
                        Value::Number((convert::to_int32(num) | convert::to_int32(rhs)) as f64)
                    }
                    OpCode::BitwiseXor => {
                        Value::Number((convert::to_int32(num) ^ convert::to_int32(rhs)) as f64)
                    }
                    OpCode::LeftShift => {
                        let shift = convert::to_uint32(rhs) & 0x1f;
                        // Computed in uint32 so shifting negatives is defined.
                        Value::Number((((convert::to_int32(num) as u32) << shift) as i32) as f64)
                    }
                    OpCode::RightShift => {
                        let shift = convert::to_uint32(rhs) & 0x1f;
                        Value::Number((convert::to_int32(num) >> shift) as f64)
                    }
                    OpCode::UnsignedRightShift => {
                        let shift = convert::to_uint32(rhs) & 0x1f;
                        Value::Number((convert::to_uint32(num) >> shift) as f64)
                    }
                    _ => unreachable!(),
                };

                self.store(self.op1(instruction), result)?;
                self.advance(instruction);
            }

            OpCode::TestIfTrue | OpCode::TestIfFalse => {
                let value = self.value1(instruction)?;
                let mut truth = convert::is_true(&value);
                if op == OpCode::TestIfFalse {
                    truth = !truth;
                }
                self.store(self.op1(instruction), value)?;
                if truth {
                    self.jump(base, instruction.offset()?)?;
                } else {
                    self.advance(instruction);
                }
            }

            OpCode::UnaryPlus | OpCode::UnaryNegation | OpCode::BitwiseNot => {
                let value = self.value1(instruction)?;
                let num = convert::to_number(&self.heap, &value)?;
                let result = match op {
                    OpCode::UnaryPlus => Value::Number(num),
                    OpCode::UnaryNegation => Value::Number(-num),
                    _ => Value::Number(!convert::to_int32(num) as f64),
                };
                self.store(self.op1(instruction), result)?;
                self.advance(instruction);
            }

            OpCode::LogicalNot => {
                let value = self.value1(instruction)?;
                self.store(self.op1(instruction), Value::Boolean(!convert::is_true(&value)))?;
                self.advance(instruction);
            }

            OpCode::Typeof => {
                let value = self.value1(instruction)?;
                let name = property::typeof_string(&value);
                self.store(self.op1(instruction), Value::string(name))?;
                self.advance(instruction);
            }

            OpCode::Void => {
                self.store(self.op1(instruction), Value::Undefined)?;
                self.advance(instruction);
            }

            OpCode::Delete => {
                let value = self.value1(instruction)?;
                self.heap.release(&value);
                self.store(self.op1(instruction), Value::Boolean(true))?;
                self.advance(instruction);
            }

            OpCode::Object => {
                let r = self.heap.alloc_object();
                self.store(self.op1(instruction), Value::Object(r))?;
                self.advance(instruction);
            }

            OpCode::Array => {
                let Tail::ArrayLiteral { length, ctor } = instruction.tail else {
                    return Err(VmError::internal("array literal without tail"));
                };
                // Elided-element literals pre-fill holes; plain literals
                // start empty with reserved capacity.
                let r = self.heap.alloc_array(length as usize, ctor);
                self.store(self.op1(instruction), Value::Array(r))?;
                self.advance(instruction);
            }

            OpCode::Function => {
                let Tail::FunctionLiteral { lambda } = instruction.tail else {
                    return Err(VmError::internal("function literal without tail"));
                };
                let lambda = self.script.lambda(lambda)?;
                let closures = self
                    .frames
                    .last()
                    .map(|f| f.closures.clone())
                    .unwrap_or_default();
                let r = self
                    .heap
                    .alloc_function(FunctionData::script(lambda, closures));
                self.store(self.op1(instruction), Value::Function(r))?;
                self.advance(instruction);
            }

            OpCode::Regexp => {
                let Tail::RegexpLiteral { pattern } = instruction.tail else {
                    return Err(VmError::internal("regexp literal without tail"));
                };
                let source = self.script.regexp(pattern)?.clone();
                let r = self.heap.alloc(crate::object::HeapEntity::new(Payload::Regexp(
                    RegexpData {
                        pattern: Rc::from(source.pattern.as_str()),
                        flags: Rc::from(source.flags.as_str()),
                    },
                )));
                self.store(self.op1(instruction), Value::Regexp(r))?;
                self.advance(instruction);
            }

            OpCode::ObjectCopy => {
                let value = self.value1(instruction)?;
                let result = self.object_copy(&value)?;
                self.store(self.op1(instruction), result)?;
                self.advance(instruction);
            }

            OpCode::TemplateLiteral => {
                let slot = self.op1(instruction);
                let value = self.load(slot)?;
                if !value.is_primitive() {
                    let r = value
                        .object_ref()
                        .ok_or_else(|| VmError::internal("template parts without heap reference"))?;
                    let elements = self
                        .heap
                        .get(r)
                        .as_array()
                        .map(|store| store.elements.clone())
                        .unwrap_or_default();
                    let mut args = Vec::with_capacity(elements.len() + 1);
                    args.push(Value::String(VmString::empty()));
                    args.extend(elements);

                    let mut result = Value::Undefined;
                    let nargs = args.len();
                    string::string_prototype_concat(self, &args, nargs, &mut result)?;
                    self.store(slot, result)?;
                }
                self.advance(instruction);
            }

            OpCode::InstanceOf => {
                let object = self.value1(instruction)?;
                let ctor = self.value2(instruction)?;
                let found = self.instance_of(&object, &ctor)?;
                self.store(self.op1(instruction), Value::Boolean(found))?;
                self.advance(instruction);
            }

            OpCode::PropertyIn => {
                let object = self.value1(instruction)?;
                let key = self.value2(instruction)?;
                let found = self.property_in(&object, &key)?;
                self.store(self.op1(instruction), Value::Boolean(found))?;
                self.advance(instruction);
            }

            OpCode::PropertyDelete => {
                let object = self.value1(instruction)?;
                let key = self.value2(instruction)?;
                self.property_delete(&object, &key)?;
                self.store(self.op1(instruction), Value::Boolean(true))?;
                self.advance(instruction);
            }

            OpCode::PropertyForeach => {
                let object = self.value1(instruction)?;
                let iterator = if let Value::External(r) = &object {
                    let foreach = self.externals[r.index()].proto.foreach;
                    match foreach {
                        Some(f) => {
                            let mut retval = Value::Undefined;
                            f(self, &object, &mut retval)?;
                            retval
                        }
                        None => self.make_iterator(&object),
                    }
                } else {
                    self.make_iterator(&object)
                };
                self.store(self.op1(instruction), iterator)?;
                self.jump(base, instruction.offset()?)?;
            }

            // Non-result operations.
            OpCode::Stop => {
                let value = self.load(self.op1(instruction))?;
                self.retval = value;
                return Ok(Step::Halt);
            }

            OpCode::Jump => {
                self.jump(base, instruction.offset()?)?;
            }

            OpCode::PropertySet => {
                let value = self.load(self.op1(instruction))?;
                let object = self.value1(instruction)?;
                let key = self.value2(instruction)?;
                self.property_set(&object, &key, value)?;
                self.advance(instruction);
            }

            OpCode::PropertyInit => {
                let value = self.load(self.op1(instruction))?;
                let object = self.value1(instruction)?;
                let key = self.value2(instruction)?;
                self.property_init(&object, &key, value)?;
                self.advance(instruction);
            }

            OpCode::IfTrueJump | OpCode::IfFalseJump => {
                let value = self.value1(instruction)?;
                let mut truth = convert::is_true(&value);
                if op == OpCode::IfFalseJump {
                    truth = !truth;
                }
                if truth {
                    self.jump(base, instruction.offset()?)?;
                } else {
                    self.advance(instruction);
                }
            }

            OpCode::IfEqualJump => {
                let v1 = self.value1(instruction)?;
                let v2 = self.value2(instruction)?;
                if strict_equals(&v1, &v2) {
                    self.jump(base, instruction.offset()?)?;
                } else {
                    self.advance(instruction);
                }
            }

            OpCode::Return => {
                let value = self.load(self.op1(instruction))?;
                return self.do_return(value);
            }

            OpCode::FunctionFrame => {
                let Tail::FrameCtor { ctor } = instruction.tail else {
                    return Err(VmError::internal("function frame without tail"));
                };
                let nargs = instruction.operand1() as usize;
                let callee = self.value1(instruction)?;
                self.frame_create(callee, Value::Undefined, nargs, ctor)?;
                self.advance(instruction);
            }

            OpCode::MethodFrame => {
                let Tail::MethodFrame { nargs, ctor } = instruction.tail else {
                    return Err(VmError::internal("method frame without tail"));
                };
                let object = self.value1(instruction)?;
                let key = self.value2(instruction)?;
                let callee = self.property_get(&object, &key)?;
                if !callee.is_function() {
                    let key_s = self.property_key(&key)?;
                    return Err(self.throw_type_error(format!(
                        "(intermediate value)[\"{key_s}\"] is not a function"
                    )));
                }
                self.frame_create(callee, object, nargs as usize, ctor)?;
                self.advance(instruction);
            }

            OpCode::FunctionCall => {
                let retval = self.op1(instruction);
                let return_pc = instruction.pointer + instruction.size();
                self.function_call(retval, return_pc)?;
            }

            OpCode::PropertyNext => {
                let Tail::PropertyNext { retval, offset } = instruction.tail else {
                    return Err(VmError::internal("property next without tail"));
                };
                let retval = Operand::from_raw(retval);
                let object = self.value1(instruction)?;
                let iterator = self.value2(instruction)?;

                if let Value::External(r) = &object {
                    let next = self.externals[r.index()].proto.next;
                    if let Some(f) = next {
                        let mut key = Value::Undefined;
                        match f(self, &mut key, &object, &iterator)? {
                            HostIter::Ok => {
                                self.store(retval, key)?;
                                self.jump(base, offset)?;
                                return Ok(Step::Continue);
                            }
                            HostIter::Done => {}
                        }
                    }
                    self.advance(instruction);
                    return Ok(Step::Continue);
                }

                let Value::Iterator(state) = &iterator else {
                    return Err(VmError::internal("property next without iterator state"));
                };
                let next = {
                    let mut state = state.borrow_mut();
                    if (state.index as usize) < state.keys.len() {
                        let key = state.keys[state.index as usize].clone();
                        state.index += 1;
                        Some(key)
                    } else {
                        None
                    }
                };
                match next {
                    Some(key) => {
                        self.store(retval, key)?;
                        self.jump(base, offset)?;
                    }
                    None => {
                        // Exhausted: free the iterator state.
                        self.store(Operand::from_raw(instruction.operand3()), Value::invalid())?;
                        self.advance(instruction);
                    }
                }
            }

            OpCode::This => {
                let this = self
                    .frames
                    .last()
                    .map(|f| f.this().clone())
                    .ok_or_else(|| VmError::internal("this outside any frame"))?;
                self.store(self.op1(instruction), this)?;
                self.advance(instruction);
            }

            OpCode::Arguments => {
                let value = self.arguments_object()?;
                self.store(self.op1(instruction), value)?;
                self.advance(instruction);
            }

            OpCode::TryStart => {
                let Tail::TryStart { exit_value, offset } = instruction.tail else {
                    return Err(VmError::internal("try start without tail"));
                };
                let catch_target = base as i64 + offset as i64;
                if catch_target < 0 || catch_target as usize >= self.script.len() {
                    return Err(VmError::InvalidJump(catch_target));
                }

                {
                    let frame = self
                        .frames
                        .last_mut()
                        .ok_or_else(|| VmError::internal("try start outside any frame"))?;
                    if frame.exception.depth() >= self.limits.max_try_depth {
                        return Err(VmError::MaxTryNestingDepthExceeded);
                    }
                    frame.exception.enter(catch_target as usize);
                }

                self.store(self.op1(instruction), Value::invalid())?;
                self.store(Operand::from_raw(exit_value), Value::Invalid(0))?;
                self.advance(instruction);
            }

            OpCode::Throw => {
                let value = self.load(self.op1(instruction))?;
                let rendering = self.to_display_string(&value);
                self.pending_exception = Some(value);
                return Err(VmError::UncaughtException { rendering });
            }

            OpCode::TryBreak => {
                // A valid exit value was stored by TRY_RETURN; the return
                // wins over the break.
                let exit = self.load(self.op1(instruction))?;
                if !exit.is_valid() {
                    self.store(self.op1(instruction), Value::Invalid(1))?;
                }
                self.jump(base, instruction.offset()?)?;
            }

            OpCode::TryContinue => {
                let exit = self.load(self.op1(instruction))?;
                if !exit.is_valid() {
                    self.store(self.op1(instruction), Value::Invalid(-1))?;
                }
                self.jump(base, instruction.offset()?)?;
            }

            OpCode::TryEnd => {
                let frame = self
                    .frames
                    .last_mut()
                    .ok_or_else(|| VmError::internal("try end outside any frame"))?;
                frame.exception.leave();
                self.jump(base, instruction.offset()?)?;
            }

            OpCode::Catch => {
                let exception = self.retval.clone();
                self.store(self.op1(instruction), exception)?;

                let offset = instruction.offset()?;
                let frame = self
                    .frames
                    .last_mut()
                    .ok_or_else(|| VmError::internal("catch outside any frame"))?;
                if offset as usize == instruction.size() {
                    // No finally block follows; the try region ends here.
                    frame.exception.leave();
                } else {
                    // Redirect the rest of the region at the finally block.
                    let target = base as i64 + offset as i64;
                    if target < 0 || target as usize >= self.script.len() {
                        return Err(VmError::InvalidJump(target));
                    }
                    frame.exception.set_catch(target as usize);
                }
                self.advance(instruction);
            }

            OpCode::Finally => {
                let Tail::Finally {
                    exit_value,
                    break_offset,
                    continue_offset,
                } = instruction.tail
                else {
                    return Err(VmError::internal("finally without tail"));
                };

                let exception = self.load(self.op1(instruction))?;
                if exception.is_valid() {
                    let rendering = self.to_display_string(&exception);
                    self.pending_exception = Some(exception);
                    return Err(VmError::UncaughtException { rendering });
                }

                let exit = self.load(Operand::from_raw(exit_value))?;
                match exit {
                    Value::Invalid(n) if n > 0 => self.jump(base, break_offset)?,
                    Value::Invalid(n) if n < 0 => self.jump(base, continue_offset)?,
                    Value::Invalid(_) => self.advance(instruction),
                    value => return self.do_return(value),
                }
            }

            OpCode::ReferenceError => {
                let Tail::ReferenceError {
                    name,
                    file,
                    token_line,
                } = instruction.tail
                else {
                    return Err(VmError::internal("reference error without tail"));
                };
                let name = self.constant_string(name)?;
                let file = self.constant_string(file)?;
                let message = if !file.is_empty() && !self.options.contains(VmOptions::QUIET) {
                    format!("\"{name}\" is not defined in {file}:{token_line}")
                } else {
                    format!("\"{name}\" is not defined in {token_line}")
                };
                return Err(self.throw_reference_error(message));
            }
        }

        Ok(Step::Continue)
    }

    fn constant_string(&self, index: u32) -> VmResult<String> {
        match self.constants.get(index as usize) {
            Some(Value::String(s)) => Ok(s.to_lossy()),
            _ => Err(VmError::internal(format!(
                "constant {index} is not a string"
            ))),
        }
    }

    fn object_copy(&mut self, value: &Value) -> VmResult<Value> {
        match value {
            Value::Function(r) => {
                // A fresh wrapper sharing the lambda and closures, so the
                // copy can grow its own properties.
                let entity = self.heap.get(*r);
                let data = entity
                    .as_function()
                    .cloned()
                    .ok_or_else(|| VmError::internal("function payload missing"))?;
                let hash = entity.hash.clone();
                let proto = entity.proto;

                for prop in hash.values() {
                    let retained = prop.value.clone();
                    self.heap.retain(&retained);
                }
                let copy = self.heap.alloc_function(data);
                let entity = self.heap.get_mut(copy);
                entity.hash = hash;
                entity.proto = proto;
                Ok(Value::Function(copy))
            }
            Value::Object(_) => {
                self.heap.retain(value);
                Ok(value.clone())
            }
            _ => Ok(value.clone()),
        }
    }

    fn arguments_object(&mut self) -> VmResult<Value> {
        let cached = self
            .frames
            .last()
            .ok_or_else(|| VmError::internal("arguments outside any frame"))?
            .arguments_object
            .clone();
        if let Some(value) = cached {
            return Ok(value);
        }

        let args: Vec<Value> = self.frames.last().expect("frame checked").arguments[1..].to_vec();
        let r = self.heap.alloc_object();
        for (index, arg) in args.iter().enumerate() {
            self.heap.retain(arg);
            self.heap
                .get_mut(r)
                .hash
                .insert(Rc::from(index.to_string()), Property::data(arg.clone()));
        }
        let mut length = Property::data(Value::Number(args.len() as f64));
        length.enumerable = Attribute::False;
        self.heap.get_mut(r).hash.insert(Rc::from("length"), length);

        let value = Value::Object(r);
        self.heap.retain(&value);
        self.frames
            .last_mut()
            .expect("frame checked")
            .arguments_object = Some(value.clone());
        Ok(value)
    }

    // Calls and returns.

    fn frame_create(
        &mut self,
        callee: Value,
        this: Value,
        nargs: usize,
        ctor: bool,
    ) -> VmResult<()> {
        if !callee.is_function() {
            let kind = callee.kind().name();
            return Err(self.throw_type_error(format!("{kind} is not a function")));
        }
        let fref = callee.object_ref().expect("function value checked");
        let data = self
            .heap
            .get(fref)
            .as_function()
            .cloned()
            .ok_or_else(|| VmError::internal("function payload missing"))?;

        if ctor && !data.ctor {
            let kind = callee.kind().name();
            return Err(self.throw_type_error(format!("{kind} is not a constructor")));
        }

        let mut this = this;
        if ctor && !data.is_native() {
            let object = self.function_new_object(fref)?;
            this = Value::Object(object);
        }

        let nlocals = data
            .lambda
            .as_ref()
            .map(|l| l.nlocals as usize)
            .unwrap_or(0);
        let mut closures = data.closures;
        if let Some(lambda) = data.lambda.as_ref() {
            // Fresh cells for captures this activation introduces.
            while closures.len() < lambda.nclosures as usize {
                closures.push(Rc::new(std::cell::RefCell::new(Value::Undefined)));
            }
        }
        let frame = Frame::new(callee, this, nargs, nlocals, closures, ctor);

        if self.stack_size + frame.size > self.limits.max_stack_size {
            return Err(self.throw_range_error("Maximum call stack size exceeded"));
        }
        self.stack_size += frame.size;
        self.pending.push(frame);
        Ok(())
    }

    /// Resolves the `prototype` the constructed object inherits from,
    /// creating and caching the default prototype when the function carries
    /// none.
    fn function_new_object(&mut self, fref: ObjRef) -> VmResult<ObjRef> {
        let existing = self
            .heap
            .get(fref)
            .hash
            .get("prototype")
            .map(|prop| prop.value.clone());

        let proto_ref = match existing {
            Some(value) if value.is_object() => value.object_ref().expect("object value"),
            _ => {
                let proto = self.heap.alloc_object();
                let proto_value = Value::Object(proto);
                self.heap.retain(&proto_value);
                self.heap
                    .get_mut(fref)
                    .hash
                    .insert(Rc::from("prototype"), Property::data(proto_value));
                proto
            }
        };

        let object = self.heap.alloc_object();
        self.heap.get_mut(object).proto = Some(proto_ref);
        Ok(object)
    }

    fn function_call(&mut self, retval: Operand, return_pc: usize) -> VmResult<()> {
        let mut frame = self
            .pending
            .pop()
            .ok_or_else(|| VmError::internal("function call without a prepared frame"))?;
        let data = frame
            .function
            .object_ref()
            .and_then(|r| self.heap.get(r).as_function().cloned())
            .ok_or_else(|| VmError::internal("function payload missing"))?;

        if let Some(native) = data.native {
            let args = std::mem::take(&mut frame.arguments);
            let nargs = args.len();
            self.stack_size -= frame.size;

            let mut result = Value::Undefined;
            native(self, &args, nargs, &mut result)?;
            self.store(retval, result)?;
            self.pc = return_pc;
            return Ok(());
        }

        let lambda = data
            .lambda
            .ok_or_else(|| VmError::internal("script function without lambda"))?;
        frame.retval = retval;
        frame.return_pc = return_pc;
        debug!(
            "call depth={} entry={} ctor={}",
            self.frames.len() + 1,
            lambda.address,
            frame.ctor
        );
        self.frames.push(frame);
        self.pc = lambda.address;
        Ok(())
    }

    fn do_return(&mut self, value: Value) -> VmResult<Step> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| VmError::internal("return outside any frame"))?;
        self.stack_size = self.stack_size.saturating_sub(frame.size);

        let mut value = value;
        if frame.ctor {
            if value.is_object() {
                self.heap.release(&frame.arguments[0]);
            } else {
                // A primitive return from a constructor yields the
                // constructed `this`; its slot is reused, never released.
                value = frame.arguments[0].clone();
            }
        }

        if self.frames.is_empty() {
            debug!("return past the root frame");
            self.retval = value;
            return Ok(Step::Halt);
        }

        self.pc = frame.return_pc;
        self.store(frame.retval, value)?;
        Ok(Step::Continue)
    }

    // Unwind.

    fn unwind(&mut self, err: VmError) -> VmResult<()> {
        let exception = match self.pending_exception.take() {
            Some(value) => value,
            None => match err.exception_name() {
                Some(name) => {
                    let message = err.message();
                    self.error_object(name, &message)
                }
                None => {
                    let message = err.to_string();
                    self.error_object("InternalError", &message)
                }
            },
        };

        // Frames prepared but never invoked belong to the failing frame.
        while let Some(frame) = self.pending.pop() {
            self.stack_size = self.stack_size.saturating_sub(frame.size);
        }

        let debug_mode = self.options.contains(VmOptions::DEBUG);
        let mut at = self.pc;

        loop {
            let Some(frame) = self.frames.last() else {
                break;
            };

            if let Some(catch_pc) = frame.exception.catch_pc() {
                self.retval = exception;
                if debug_mode {
                    self.backtrace.clear();
                }
                self.pc = catch_pc;
                return Ok(());
            }

            if debug_mode {
                self.backtrace.push(BacktraceEntry {
                    name: frame.name(),
                    pc: at,
                });
            }

            let frame = self.frames.pop().expect("frame checked");
            self.stack_size = self.stack_size.saturating_sub(frame.size);
            at = frame.return_pc;
            debug!("unwound frame, depth={}", self.frames.len());
        }

        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScriptBuilder;

    #[test]
    fn test_stop_returns_slot() {
        let mut b = ScriptBuilder::new();
        b.set_globals(1);
        let seven = b.number(7.0);
        b.move_(Operand::global(0), seven);
        b.stop(Operand::global(0));
        let mut vm = Vm::new(b.build());
        let result = vm.interpret().unwrap();
        assert_eq!(result.as_number(), Some(7.0));
        assert_eq!(vm.state(), VmState::Halted);
    }

    #[test]
    fn test_store_into_constant_scope_rejected() {
        let mut b = ScriptBuilder::new();
        let one = b.number(1.0);
        let two = b.number(2.0);
        b.move_(one, two);
        b.stop(one);
        let mut vm = Vm::new(b.build());
        assert!(vm.interpret().is_err());
        assert_eq!(vm.state(), VmState::Faulted);
    }

    #[test]
    fn test_preempt_suspends_and_resumes() {
        let mut b = ScriptBuilder::new();
        b.set_globals(1);
        let seven = b.number(7.0);
        b.move_(Operand::global(0), seven);
        b.stop(Operand::global(0));
        let mut vm = Vm::new(b.build());

        vm.request_preempt();
        let paused = vm.interpret().unwrap();
        assert!(paused.is_undefined());
        assert_eq!(vm.state(), VmState::Suspended);

        let result = vm.interpret().unwrap();
        assert_eq!(result.as_number(), Some(7.0));
        assert_eq!(vm.state(), VmState::Halted);
    }

    #[test]
    fn test_fixed_advance_touches_only_destination() {
        let mut b = ScriptBuilder::new();
        b.set_globals(3);
        let one = b.number(1.0);
        let two = b.number(2.0);
        b.move_(Operand::global(1), one);
        b.move_(Operand::global(2), two);
        b.add(Operand::global(0), Operand::global(1), Operand::global(2));
        b.stop(Operand::global(0));
        let mut vm = Vm::new(b.build());
        let result = vm.interpret().unwrap();
        assert_eq!(result.as_number(), Some(3.0));
        assert_eq!(vm.globals()[1].as_number(), Some(1.0));
        assert_eq!(vm.globals()[2].as_number(), Some(2.0));
    }
}
