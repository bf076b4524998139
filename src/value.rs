//! The tagged value model.
//!
//! Every slot the interpreter addresses holds a [`Value`]. Primitive kinds
//! carry their payload inline; object-category kinds carry an [`ObjRef`]
//! into the heap arena. The kind numbering is load-bearing: primitive kinds
//! sort below object kinds, and `Number < String < object-category`, which
//! the loose-equality promotion relies on.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use num_enum::TryFromPrimitive;
use strum::EnumIter;

use crate::heap::ObjRef;
use crate::object::ExternRef;
use crate::property::PropertyIterator;
use crate::string::VmString;

/// Value kind discriminants.
///
/// The gap between `Invalid` and `Object` keeps room for further primitive
/// kinds without disturbing the primitive/object partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromPrimitive, EnumIter)]
#[repr(u8)]
pub enum ValueKind {
    Null = 0,
    Undefined = 1,
    Boolean = 2,
    Number = 3,
    String = 4,
    Data = 5,
    External = 6,
    Invalid = 7,

    Object = 16,
    Array = 17,
    Function = 18,
    Regexp = 19,
    Date = 20,
    ObjectValue = 21,
}

impl ValueKind {
    /// True for the object-category kinds.
    pub fn is_object(self) -> bool {
        self >= ValueKind::Object
    }

    /// The lowercase kind name used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Null => "null",
            ValueKind::Undefined => "undefined",
            ValueKind::Boolean => "boolean",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Data => "data",
            ValueKind::External => "external",
            ValueKind::Invalid => "invalid",
            ValueKind::Object => "object",
            ValueKind::Array => "array",
            ValueKind::Function => "function",
            ValueKind::Regexp => "regexp",
            ValueKind::Date => "date",
            ValueKind::ObjectValue => "object value",
        }
    }
}

/// An opaque host datum carried through the VM untouched.
#[derive(Clone)]
pub struct DataValue(pub Rc<dyn Any>);

impl fmt::Debug for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<data>")
    }
}

/// A value slot.
#[derive(Clone)]
pub enum Value {
    /// Uninitialised slot, array hole, or try-region bookkeeping sentinel.
    /// The payload is the pending completion code of a try region's exit
    /// slot: 0 normal, 1 break, -1 continue.
    Invalid(i8),
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(VmString),
    /// Opaque external datum.
    Data(DataValue),
    /// Host-bridged object with a callback vtable.
    External(ExternRef),
    /// In-flight property enumeration state. Reported as `Data` by
    /// [`Value::kind`]; never observable by scripts.
    Iterator(Rc<RefCell<PropertyIterator>>),

    Object(ObjRef),
    Array(ObjRef),
    Function(ObjRef),
    Regexp(ObjRef),
    Date(ObjRef),
    ObjectValue(ObjRef),
}

impl Value {
    /// The invalid sentinel with a zero completion code.
    pub fn invalid() -> Self {
        Value::Invalid(0)
    }

    /// Creates a string value from host UTF-8 text.
    pub fn string(s: &str) -> Self {
        Value::String(VmString::new(s))
    }

    /// The kind of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Invalid(_) => ValueKind::Invalid,
            Value::Undefined => ValueKind::Undefined,
            Value::Null => ValueKind::Null,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::Data(_) | Value::Iterator(_) => ValueKind::Data,
            Value::External(_) => ValueKind::External,
            Value::Object(_) => ValueKind::Object,
            Value::Array(_) => ValueKind::Array,
            Value::Function(_) => ValueKind::Function,
            Value::Regexp(_) => ValueKind::Regexp,
            Value::Date(_) => ValueKind::Date,
            Value::ObjectValue(_) => ValueKind::ObjectValue,
        }
    }

    /// True unless this is the invalid sentinel.
    pub fn is_valid(&self) -> bool {
        !matches!(self, Value::Invalid(_))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_null_or_undefined(&self) -> bool {
        matches!(self, Value::Null | Value::Undefined)
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Number(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Value::Function(_))
    }

    pub fn is_date(&self) -> bool {
        matches!(self, Value::Date(_))
    }

    pub fn is_external(&self) -> bool {
        matches!(self, Value::External(_))
    }

    /// True for the object-category kinds.
    pub fn is_object(&self) -> bool {
        self.kind().is_object()
    }

    /// True for primitives: every kind below the object category.
    pub fn is_primitive(&self) -> bool {
        !self.kind().is_object()
    }

    /// The heap reference of an object-category value.
    pub fn object_ref(&self) -> Option<ObjRef> {
        match self {
            Value::Object(r)
            | Value::Array(r)
            | Value::Function(r)
            | Value::Regexp(r)
            | Value::Date(r)
            | Value::ObjectValue(r) => Some(*r),
            _ => None,
        }
    }

    /// The numeric payload, if this is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The string payload, if this is a string.
    pub fn as_string(&self) -> Option<&VmString> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Invalid(n) => write!(f, "Invalid({n})"),
            Value::Undefined => f.write_str("Undefined"),
            Value::Null => f.write_str("Null"),
            Value::Boolean(b) => write!(f, "Boolean({b})"),
            Value::Number(n) => write!(f, "Number({n})"),
            Value::String(s) => write!(f, "String({:?})", s.to_lossy()),
            Value::Data(_) => f.write_str("Data"),
            Value::Iterator(_) => f.write_str("Iterator"),
            Value::External(r) => write!(f, "External({})", r.0),
            Value::Object(r) => write!(f, "Object(#{})", r.index()),
            Value::Array(r) => write!(f, "Array(#{})", r.index()),
            Value::Function(r) => write!(f, "Function(#{})", r.index()),
            Value::Regexp(r) => write!(f, "Regexp(#{})", r.index()),
            Value::Date(r) => write!(f, "Date(#{})", r.index()),
            Value::ObjectValue(r) => write!(f, "ObjectValue(#{})", r.index()),
        }
    }
}

/// Strict (type-and-bits) equality.
///
/// Numbers use IEEE comparison, so `NaN !== NaN`; strings compare by
/// content; object-category values compare by reference identity.
pub fn strict_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x == y,
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Boolean(x), Value::Boolean(y)) => x == y,
        (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
        (Value::External(x), Value::External(y)) => x == y,
        _ => match (a.object_ref(), b.object_ref()) {
            (Some(x), Some(y)) => a.kind() == b.kind() && x == y,
            _ => false,
        },
    }
}
