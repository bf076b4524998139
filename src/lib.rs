//! # Lyra Virtual Machine
//!
//! A register-based bytecode virtual machine for the Lyra scripting
//! runtime, a dynamically-typed language in the ECMAScript family. The VM
//! executes a compiled instruction stream against typed value slots,
//! manages call and scope frames, performs property access through
//! prototype chains, and propagates or catches exceptions.
//!
//! ## Architecture
//!
//! The VM is organized into several core components:
//!
//! - **Vm**: the dispatch loop, call frames, and exception machinery
//! - **Value**: tagged values with primitive coercions and equality
//! - **Heap**: the object arena with retain/release accounting
//! - **Property subsystem**: prototype-chain lookup, shared hashes,
//!   and the enumeration protocol
//! - **Script / ScriptBuilder**: compiled bytecode and programmatic
//!   assembly
//!
//! ## Example
//!
//! ```rust
//! use lyra_vm::{Operand, ScriptBuilder, Vm};
//!
//! // Compute 1 + 2 and return the result.
//! let mut b = ScriptBuilder::new();
//! b.set_globals(1);
//! let one = b.number(1.0);
//! let two = b.number(2.0);
//! b.add(Operand::global(0), one, two);
//! b.stop(Operand::global(0));
//!
//! let mut vm = Vm::new(b.build());
//! let result = vm.interpret().unwrap();
//! assert_eq!(result.as_number(), Some(3.0));
//! ```

/// Primitive coercions: ToPrimitive, ToNumber, ToString, ToInt32
pub mod convert;
/// Loose equality and primitive comparison
pub mod equality;
/// VM error types and result handling
pub mod error;
/// Activation frames, scopes, and operand addressing
pub mod frame;
/// The object arena and retain/release accounting
pub mod heap;
/// Instruction decoding from the wire encoding
pub mod instruction;
/// The dispatch loop and exception machinery
pub mod interpreter;
/// Heap entity payloads, properties, and shared hashes
pub mod object;
/// VM opcode definitions and instruction layouts
pub mod op_code;
/// Engine options and execution limits
pub mod options;
/// The property subsystem and enumeration protocol
pub mod property;
/// Compiled script representation
pub mod script;
/// Utility for constructing VM bytecode
pub mod script_builder;
/// Immutable VM strings
pub mod string;
/// The tagged value model
pub mod value;

pub use error::{VmError, VmResult};
pub use frame::{Frame, Operand, ScopeKind};
pub use heap::{Heap, ObjRef};
pub use instruction::Instruction;
pub use interpreter::{BacktraceEntry, Vm, VmState};
pub use object::{
    Attribute, ExternalProto, HostIter, Lambda, Property, PropertyKind, SharedHashes,
};
pub use op_code::OpCode;
pub use options::{VmLimits, VmOptions};
pub use property::PropertyIterator;
pub use script::{Const, Script};
pub use script_builder::{Label, LambdaShape, ScriptBuilder};
pub use string::VmString;
pub use value::{Value, ValueKind};
