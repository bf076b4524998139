//! Activation frames, scopes, and operand addressing.
//!
//! An operand descriptor names a value slot as a scope kind in its low three
//! bits and a slot index above them. The ARGUMENTS scope holds the `this`
//! binding at index 0, with the real arguments following it.

use num_enum::TryFromPrimitive;

use crate::error::{VmError, VmResult};
use crate::object::Closure;
use crate::value::Value;

/// The scope a slot descriptor addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum ScopeKind {
    Global = 0,
    /// Read-only literal pool realized from the script.
    Constant = 1,
    /// Current frame's arguments; slot 0 is `this`.
    Arguments = 2,
    /// Arguments of the frame under construction between a `*_FRAME`
    /// opcode and its `FUNCTION_CALL`.
    CalleeArguments = 3,
    Local = 4,
    Closure = 5,
}

const SCOPE_BITS: u32 = 3;
const SCOPE_MASK: u32 = (1 << SCOPE_BITS) - 1;

/// An encoded value-slot descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operand(u32);

impl Operand {
    pub fn new(scope: ScopeKind, index: u32) -> Self {
        Operand((index << SCOPE_BITS) | scope as u32)
    }

    pub fn global(index: u32) -> Self {
        Self::new(ScopeKind::Global, index)
    }

    pub fn constant(index: u32) -> Self {
        Self::new(ScopeKind::Constant, index)
    }

    pub fn argument(index: u32) -> Self {
        Self::new(ScopeKind::Arguments, index)
    }

    pub fn callee_argument(index: u32) -> Self {
        Self::new(ScopeKind::CalleeArguments, index)
    }

    pub fn local(index: u32) -> Self {
        Self::new(ScopeKind::Local, index)
    }

    pub fn closure(index: u32) -> Self {
        Self::new(ScopeKind::Closure, index)
    }

    /// The `this` binding of the current frame.
    pub fn this() -> Self {
        Self::argument(0)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn from_raw(raw: u32) -> Self {
        Operand(raw)
    }

    pub fn scope(self) -> VmResult<ScopeKind> {
        ScopeKind::try_from((self.0 & SCOPE_MASK) as u8)
            .map_err(|_| VmError::internal(format!("invalid operand scope in {:#x}", self.0)))
    }

    pub fn index(self) -> usize {
        (self.0 >> SCOPE_BITS) as usize
    }
}

/// Per-frame exception bookkeeping: the active catch address and the saved
/// records of enclosing `try` regions in this frame.
#[derive(Debug, Default, Clone)]
pub struct ExceptionRecord {
    catch_pc: Option<usize>,
    saved: Vec<Option<usize>>,
}

impl ExceptionRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// The catch address a thrown exception transfers to, if a `try` is
    /// active in this frame.
    pub fn catch_pc(&self) -> Option<usize> {
        self.catch_pc
    }

    /// Replaces the active catch address; used by `CATCH` to redirect the
    /// remainder of the region at a following `finally` block.
    pub fn set_catch(&mut self, catch_pc: usize) {
        self.catch_pc = Some(catch_pc);
    }

    /// Enters a `try` region, saving any enclosing record.
    pub fn enter(&mut self, catch_pc: usize) {
        if let Some(active) = self.catch_pc {
            self.saved.push(Some(active));
        }
        self.catch_pc = Some(catch_pc);
    }

    /// Leaves the innermost `try` region, restoring the saved record of the
    /// enclosing one if present.
    pub fn leave(&mut self) {
        self.catch_pc = self.saved.pop().flatten();
    }

    /// Nesting depth of active `try` regions.
    pub fn depth(&self) -> usize {
        self.saved.len() + usize::from(self.catch_pc.is_some())
    }
}

/// An activation frame.
#[derive(Debug)]
pub struct Frame {
    /// Whether this frame was invoked with `new`.
    pub ctor: bool,

    /// The callee; undefined for the root activation.
    pub function: Value,

    /// The ARGUMENTS scope: `this` at slot 0, arguments after it.
    pub arguments: Vec<Value>,

    /// The LOCAL scope.
    pub locals: Vec<Value>,

    /// The CLOSURE scope installed from the callee.
    pub closures: Vec<Closure>,

    /// Cached `arguments` object, materialized on first use.
    pub arguments_object: Option<Value>,

    /// Exception record for `try` regions in this frame.
    pub exception: ExceptionRecord,

    /// Caller PC to resume at on return.
    pub return_pc: usize,

    /// Caller slot receiving the return value.
    pub retval: Operand,

    /// Slot count charged against the VM stack budget.
    pub size: usize,
}

impl Frame {
    /// Builds a frame for a call with `nargs` arguments (padded with
    /// undefined until the argument moves fill them in).
    pub fn new(
        function: Value,
        this: Value,
        nargs: usize,
        nlocals: usize,
        closures: Vec<Closure>,
        ctor: bool,
    ) -> Self {
        let mut arguments = Vec::with_capacity(nargs + 1);
        arguments.push(this);
        arguments.resize(nargs + 1, Value::Undefined);

        let size = arguments.len() + nlocals;
        Self {
            ctor,
            function,
            arguments,
            locals: vec![Value::Undefined; nlocals],
            closures,
            arguments_object: None,
            exception: ExceptionRecord::new(),
            return_pc: 0,
            retval: Operand::global(0),
            size,
        }
    }

    /// The root activation of a script.
    pub fn root(nlocals: usize) -> Self {
        Self::new(
            Value::Undefined,
            Value::Undefined,
            0,
            nlocals,
            Vec::new(),
            false,
        )
    }

    /// The `this` binding.
    pub fn this(&self) -> &Value {
        &self.arguments[0]
    }

    /// Display name for backtraces.
    pub fn name(&self) -> String {
        self.function
            .object_ref()
            .map(|_| "anonymous".to_string())
            .unwrap_or_else(|| "main".to_string())
    }
}
