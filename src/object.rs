//! Heap entity payloads, properties, and shared hashes.
//!
//! A heap entity is the backing record of every object-category value: an
//! own-property hash in insertion order, a nullable prototype reference,
//! and a payload specific to the value kind. Inherited handler properties
//! (built-in `length`, host accessors) live in per-kind shared hashes that
//! the property subsystem consults after the own hash at each
//! prototype-chain node.

use std::cell::RefCell;
use std::rc::Rc;

use hashbrown::HashMap;
use indexmap::IndexMap;

use crate::error::VmResult;
use crate::heap::ObjRef;
use crate::value::{Value, ValueKind};
use crate::Vm;

/// A native function callback: `(vm, args, nargs, retval)`. `args[0]` is the
/// `this` binding.
pub type NativeFn = fn(&mut Vm, &[Value], usize, &mut Value) -> VmResult<()>;

/// A host-supplied accessor: `(vm, object, setter_value_or_none, retval)`.
/// Invoked with a setter value on stores, with a retval slot on loads, and
/// with neither on deletes.
pub type PropertyHandlerFn =
    fn(&mut Vm, &Value, Option<&Value>, Option<&mut Value>) -> VmResult<()>;

/// Host enumeration start: stores an iterator handle into `retval`.
pub type ForeachFn = fn(&mut Vm, &Value, &mut Value) -> VmResult<()>;

/// Host enumeration step: writes the next key into `retval`.
pub type NextFn = fn(&mut Vm, &mut Value, &Value, &Value) -> VmResult<HostIter>;

/// Status of a host enumeration step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostIter {
    /// A key was produced.
    Ok,
    /// The iteration is exhausted.
    Done,
}

/// Reference to a registered external object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExternRef(pub(crate) u32);

impl ExternRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Callback vtable of an external object class.
#[derive(Default)]
pub struct ExternalProto {
    pub foreach: Option<ForeachFn>,
    pub next: Option<NextFn>,
    /// Handler properties reachable through property access on instances.
    pub properties: HashMap<String, PropertyHandlerFn>,
}

/// A host-bridged object instance.
pub struct ExternalObject {
    pub proto: Rc<ExternalProto>,
    pub data: Option<crate::value::DataValue>,
}

/// A tri-state property attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Attribute {
    #[default]
    Unset,
    False,
    True,
}

impl Attribute {
    pub fn is_true(self) -> bool {
        self == Attribute::True
    }
}

/// A mutable lexical capture shared between a function value and the frames
/// that close over it.
pub type Closure = Rc<RefCell<Value>>;

/// The kind tag of a property entry.
#[derive(Debug, Clone)]
pub enum PropertyKind {
    /// Ordinary data property.
    Data,
    /// Host accessor; the value slot stays invalid.
    Handler(PropertyHandlerFn),
    /// Aliases an external value slot.
    Ref(Closure),
    /// Tombstone of a deleted property; preserves hash layout.
    Whiteout,
}

/// A property entry in an own or shared hash.
#[derive(Debug, Clone)]
pub struct Property {
    pub kind: PropertyKind,
    pub value: Value,
    pub writable: Attribute,
    pub enumerable: Attribute,
    pub configurable: Attribute,
}

impl Property {
    /// An ordinary enumerable, writable, configurable data property.
    pub fn data(value: Value) -> Self {
        Self {
            kind: PropertyKind::Data,
            value,
            writable: Attribute::True,
            enumerable: Attribute::True,
            configurable: Attribute::True,
        }
    }

    /// A handler property; attributes stay unset so the data-descriptor
    /// predicate holds for it.
    pub fn handler(f: PropertyHandlerFn) -> Self {
        Self {
            kind: PropertyKind::Handler(f),
            value: Value::invalid(),
            writable: Attribute::Unset,
            enumerable: Attribute::Unset,
            configurable: Attribute::Unset,
        }
    }

    /// A property aliasing an external slot.
    pub fn reference(cell: Closure) -> Self {
        Self {
            kind: PropertyKind::Ref(cell),
            value: Value::invalid(),
            writable: Attribute::True,
            enumerable: Attribute::True,
            configurable: Attribute::True,
        }
    }

    /// The data-descriptor predicate: `writable` unset or a valid value.
    pub fn is_data_descriptor(&self) -> bool {
        self.writable == Attribute::Unset || self.value.is_valid()
    }
}

/// A compiled function body: entry address plus frame shape metadata.
/// Distinct from the callable function value that wraps it.
#[derive(Debug, Clone)]
pub struct Lambda {
    /// Byte offset of the entry instruction in the script.
    pub address: usize,
    pub nargs: u32,
    pub nlocals: u32,
    /// Closure cells the activation provides beyond those captured from the
    /// function value.
    pub nclosures: u32,
    pub name: Option<String>,
}

/// Payload of a function entity.
#[derive(Clone)]
pub struct FunctionData {
    pub native: Option<NativeFn>,
    pub lambda: Option<Rc<Lambda>>,
    /// Whether the function may be invoked with `new`.
    pub ctor: bool,
    /// Index of the first real argument in the arguments scope.
    pub args_offset: u32,
    /// Captured lexical scope.
    pub closures: Vec<Closure>,
}

impl FunctionData {
    pub fn native(f: NativeFn, ctor: bool) -> Self {
        Self {
            native: Some(f),
            lambda: None,
            ctor,
            args_offset: 1,
            closures: Vec::new(),
        }
    }

    pub fn script(lambda: Rc<Lambda>, closures: Vec<Closure>) -> Self {
        Self {
            native: None,
            lambda: Some(lambda),
            ctor: true,
            args_offset: 1,
            closures,
        }
    }

    pub fn is_native(&self) -> bool {
        self.native.is_some()
    }
}

impl std::fmt::Debug for FunctionData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionData")
            .field("native", &self.native.is_some())
            .field("lambda", &self.lambda)
            .field("ctor", &self.ctor)
            .finish()
    }
}

/// Contiguous element store of an array entity. Holes are invalid markers.
#[derive(Debug, Clone, Default)]
pub struct ArrayStore {
    pub elements: Vec<Value>,
}

impl ArrayStore {
    pub fn length(&self) -> usize {
        self.elements.len()
    }
}

/// Compiled regular expression payload.
#[derive(Debug, Clone)]
pub struct RegexpData {
    pub pattern: Rc<str>,
    pub flags: Rc<str>,
}

/// Type-specific payload of a heap entity.
#[derive(Debug, Clone)]
pub enum Payload {
    Plain,
    Array(ArrayStore),
    Function(FunctionData),
    Regexp(RegexpData),
    Date(f64),
    /// Boxed primitive.
    Boxed(Value),
}

/// A heap-allocated object record.
#[derive(Debug)]
pub struct HeapEntity {
    /// Own properties in insertion order.
    pub hash: IndexMap<Rc<str>, Property>,
    /// Prototype reference; `None` after a `__proto__: null` assignment.
    pub proto: Option<ObjRef>,
    pub payload: Payload,
    pub refcount: u32,
}

impl HeapEntity {
    pub fn new(payload: Payload) -> Self {
        Self {
            hash: IndexMap::new(),
            proto: None,
            payload,
            refcount: 0,
        }
    }

    /// The value kind this entity presents as, derived from its payload.
    pub fn kind(&self) -> ValueKind {
        match self.payload {
            Payload::Plain => ValueKind::Object,
            Payload::Array(_) => ValueKind::Array,
            Payload::Function(_) => ValueKind::Function,
            Payload::Regexp(_) => ValueKind::Regexp,
            Payload::Date(_) => ValueKind::Date,
            Payload::Boxed(_) => ValueKind::ObjectValue,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayStore> {
        match &self.payload {
            Payload::Array(store) => Some(store),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut ArrayStore> {
        match &mut self.payload {
            Payload::Array(store) => Some(store),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionData> {
        match &self.payload {
            Payload::Function(data) => Some(data),
            _ => None,
        }
    }
}

/// Per-kind tables of inherited handler properties and built-in methods,
/// consulted during property lookup after the own hash.
#[derive(Default)]
pub struct SharedHashes {
    pub object: HashMap<String, Property>,
    pub array: HashMap<String, Property>,
    pub string: HashMap<String, Property>,
    pub number: HashMap<String, Property>,
    pub boolean: HashMap<String, Property>,
    pub function: HashMap<String, Property>,
}

impl SharedHashes {
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared hash consulted for a value of the given kind.
    pub fn for_kind(&self, kind: ValueKind) -> Option<&HashMap<String, Property>> {
        match kind {
            ValueKind::Array => Some(&self.array),
            ValueKind::Function => Some(&self.function),
            ValueKind::String => Some(&self.string),
            ValueKind::Number => Some(&self.number),
            ValueKind::Boolean => Some(&self.boolean),
            ValueKind::Object
            | ValueKind::Regexp
            | ValueKind::Date
            | ValueKind::ObjectValue => Some(&self.object),
            _ => None,
        }
    }

    /// Registers a shared property for a kind family.
    pub fn register(&mut self, kind: ValueKind, key: &str, property: Property) {
        let table = match kind {
            ValueKind::Array => &mut self.array,
            ValueKind::Function => &mut self.function,
            ValueKind::String => &mut self.string,
            ValueKind::Number => &mut self.number,
            ValueKind::Boolean => &mut self.boolean,
            _ => &mut self.object,
        };
        table.insert(key.to_string(), property);
    }
}
