//! Primitive coercions.
//!
//! ToPrimitive, ToNumber, ToString and the integer conversions follow the
//! ECMA-262 rules the opcodes rely on. Object-category values convert
//! through their payloads: boxed primitives unwrap, dates prefer their
//! timestamp or a string rendering depending on the hint, arrays join their
//! elements, and plain objects render as `[object Object]`.

use crate::error::{VmError, VmResult};
use crate::heap::Heap;
use crate::object::Payload;
use crate::string::VmString;
use crate::value::Value;

/// Preferred primitive kind for [`to_primitive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hint {
    Number,
    String,
}

const MAX_CONVERSION_DEPTH: usize = 16;

/// ToPrimitive. Primitives are returned as-is.
pub fn to_primitive(heap: &Heap, value: &Value, hint: Hint) -> VmResult<Value> {
    to_primitive_inner(heap, value, hint, 0)
}

fn to_primitive_inner(heap: &Heap, value: &Value, hint: Hint, depth: usize) -> VmResult<Value> {
    if depth > MAX_CONVERSION_DEPTH {
        return Err(VmError::type_error("cyclic object value"));
    }

    if value.is_primitive() {
        return Ok(value.clone());
    }

    let r = value
        .object_ref()
        .ok_or_else(|| VmError::internal("object value without heap reference"))?;

    match &heap.get(r).payload {
        Payload::Boxed(inner) => Ok(inner.clone()),
        Payload::Date(ms) => match hint {
            Hint::Number => Ok(Value::Number(*ms)),
            Hint::String => Ok(Value::String(VmString::new(&format!(
                "[date {}]",
                number_to_string(*ms)
            )))),
        },
        Payload::Array(_) => Ok(Value::String(array_join(heap, value, depth)?)),
        Payload::Regexp(re) => Ok(Value::String(VmString::new(&format!(
            "/{}/{}",
            re.pattern, re.flags
        )))),
        Payload::Function(_) => Ok(Value::string("[object Function]")),
        Payload::Plain => Ok(Value::string("[object Object]")),
    }
}

fn array_join(heap: &Heap, array: &Value, depth: usize) -> VmResult<VmString> {
    let r = array
        .object_ref()
        .ok_or_else(|| VmError::internal("array value without heap reference"))?;
    let elements = match &heap.get(r).payload {
        Payload::Array(store) => store.elements.clone(),
        _ => return Err(VmError::internal("array join on non-array payload")),
    };

    let mut result = VmString::empty();
    let comma = VmString::new(",");
    for (i, element) in elements.iter().enumerate() {
        if i > 0 {
            result = VmString::concat(&result, &comma);
        }
        if element.is_valid() && !element.is_null_or_undefined() {
            let primitive = to_primitive_inner(heap, element, Hint::String, depth + 1)?;
            result = VmString::concat(&result, &primitive_to_string(&primitive)?);
        }
    }
    Ok(result)
}

/// ToNumber.
pub fn to_number(heap: &Heap, value: &Value) -> VmResult<f64> {
    match value {
        Value::Undefined | Value::Invalid(_) => Ok(f64::NAN),
        Value::Null => Ok(0.0),
        Value::Boolean(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => Ok(*n),
        Value::String(s) => Ok(string_to_number(s)),
        Value::Data(_) | Value::Iterator(_) | Value::External(_) => Ok(f64::NAN),
        _ => {
            let primitive = to_primitive(heap, value, Hint::Number)?;
            to_number(heap, &primitive)
        }
    }
}

/// ToString.
pub fn to_string_value(heap: &Heap, value: &Value) -> VmResult<VmString> {
    if value.is_primitive() {
        return primitive_to_string(value);
    }
    let primitive = to_primitive(heap, value, Hint::String)?;
    primitive_to_string(&primitive)
}

fn primitive_to_string(value: &Value) -> VmResult<VmString> {
    match value {
        Value::Undefined | Value::Invalid(_) => Ok(VmString::new("undefined")),
        Value::Null => Ok(VmString::new("null")),
        Value::Boolean(true) => Ok(VmString::new("true")),
        Value::Boolean(false) => Ok(VmString::new("false")),
        Value::Number(n) => Ok(VmString::new(&number_to_string(*n))),
        Value::String(s) => Ok(s.clone()),
        Value::Data(_) | Value::Iterator(_) => Ok(VmString::new("[data]")),
        Value::External(_) => Ok(VmString::new("[external]")),
        _ => Err(VmError::internal("primitive_to_string on object value")),
    }
}

/// Numeric string parsing: decimal or hex, `Infinity` forms, NaN otherwise.
pub fn string_to_number(s: &VmString) -> f64 {
    let text = match s.as_str() {
        Some(t) => t,
        None => return f64::NAN,
    };
    let t = text.trim_matches(|c: char| c.is_whitespace() || c == '\u{feff}');
    if t.is_empty() {
        return 0.0;
    }

    if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        if hex.is_empty() {
            return f64::NAN;
        }
        let mut acc = 0f64;
        for c in hex.chars() {
            match c.to_digit(16) {
                Some(d) => acc = acc * 16.0 + d as f64,
                None => return f64::NAN,
            }
        }
        return acc;
    }

    match t {
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        _ => {
            let decimal = t
                .chars()
                .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'));
            if decimal {
                t.parse::<f64>().unwrap_or(f64::NAN)
            } else {
                f64::NAN
            }
        }
    }
}

/// Number rendering: integral values without a decimal point.
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    if n.fract() == 0.0 && n.abs() < 9.007199254740992e15 {
        return format!("{}", n as i64);
    }
    format!("{n}")
}

/// ToInt32: truncate toward zero, then fold modulo 2^32 into the signed
/// range.
pub fn to_int32(n: f64) -> i32 {
    if !n.is_finite() || n == 0.0 {
        return 0;
    }
    let m = n.trunc().rem_euclid(4294967296.0);
    if m >= 2147483648.0 {
        (m - 4294967296.0) as i32
    } else {
        m as i32
    }
}

/// ToUint32.
pub fn to_uint32(n: f64) -> u32 {
    if !n.is_finite() || n == 0.0 {
        return 0;
    }
    n.trunc().rem_euclid(4294967296.0) as u32
}

/// Parses a key as a canonical unsigned 32-bit array index. Returns `None`
/// when the key is not a canonical index string or number.
pub fn to_index(key: &Value) -> Option<u32> {
    match key {
        Value::Number(n) => {
            if n.fract() == 0.0 && *n >= 0.0 && *n < 4294967295.0 {
                Some(*n as u32)
            } else {
                None
            }
        }
        Value::String(s) => {
            let text = s.as_str()?;
            if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            if text.len() > 1 && text.starts_with('0') {
                return None;
            }
            match text.parse::<u64>() {
                Ok(v) if v < 4294967295 => Some(v as u32),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Truthiness.
pub fn is_true(value: &Value) -> bool {
    match value {
        Value::Invalid(_) | Value::Undefined | Value::Null => false,
        Value::Boolean(b) => *b,
        Value::Number(n) => *n != 0.0 && !n.is_nan(),
        Value::String(s) => s.size() > 0,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ArrayStore, HeapEntity};

    #[test]
    fn test_to_number_primitives() {
        let heap = Heap::new();
        assert!(to_number(&heap, &Value::Undefined).unwrap().is_nan());
        assert_eq!(to_number(&heap, &Value::Null).unwrap(), 0.0);
        assert_eq!(to_number(&heap, &Value::Boolean(true)).unwrap(), 1.0);
        assert_eq!(to_number(&heap, &Value::string("12.5")).unwrap(), 12.5);
        assert_eq!(to_number(&heap, &Value::string("  42  ")).unwrap(), 42.0);
        assert_eq!(to_number(&heap, &Value::string("0x10")).unwrap(), 16.0);
        assert_eq!(to_number(&heap, &Value::string("")).unwrap(), 0.0);
        assert!(to_number(&heap, &Value::string("12px")).unwrap().is_nan());
        assert!(to_number(&heap, &Value::string("inf")).unwrap().is_nan());
        assert_eq!(
            to_number(&heap, &Value::string("-Infinity")).unwrap(),
            f64::NEG_INFINITY
        );
    }

    #[test]
    fn test_number_to_string() {
        assert_eq!(number_to_string(0.0), "0");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(3.0), "3");
        assert_eq!(number_to_string(-7.0), "-7");
        assert_eq!(number_to_string(0.5), "0.5");
        assert_eq!(number_to_string(f64::NAN), "NaN");
        assert_eq!(number_to_string(f64::INFINITY), "Infinity");
    }

    #[test]
    fn test_to_int32_wrapping() {
        assert_eq!(to_int32(0.0), 0);
        assert_eq!(to_int32(-1.0), -1);
        assert_eq!(to_int32(2147483648.0), -2147483648);
        assert_eq!(to_int32(4294967296.0), 0);
        assert_eq!(to_int32(-4294967295.0), 1);
        assert_eq!(to_int32(f64::NAN), 0);
        assert_eq!(to_int32(f64::INFINITY), 0);
        assert_eq!(to_int32(3.7), 3);
        assert_eq!(to_int32(-3.7), -3);
    }

    #[test]
    fn test_to_int32_idempotent() {
        for x in [-1e10, -7.5, -1.0, 0.0, 1.0, 7.5, 1e10, 2147483647.0] {
            let once = to_int32(x);
            assert_eq!(to_int32(once as f64), once);
        }
    }

    #[test]
    fn test_to_uint32() {
        assert_eq!(to_uint32(-1.0), 4294967295);
        assert_eq!(to_uint32(4294967296.0), 0);
        assert_eq!(to_uint32(1.9), 1);
    }

    #[test]
    fn test_to_index() {
        assert_eq!(to_index(&Value::Number(0.0)), Some(0));
        assert_eq!(to_index(&Value::Number(2.0)), Some(2));
        assert_eq!(to_index(&Value::Number(2.5)), None);
        assert_eq!(to_index(&Value::Number(-1.0)), None);
        assert_eq!(to_index(&Value::string("7")), Some(7));
        assert_eq!(to_index(&Value::string("07")), None);
        assert_eq!(to_index(&Value::string("abc")), None);
        assert_eq!(to_index(&Value::string("4294967295")), None);
    }

    #[test]
    fn test_truthiness() {
        assert!(!is_true(&Value::Undefined));
        assert!(!is_true(&Value::Null));
        assert!(!is_true(&Value::Number(0.0)));
        assert!(!is_true(&Value::Number(f64::NAN)));
        assert!(!is_true(&Value::string("")));
        assert!(!is_true(&Value::invalid()));
        assert!(is_true(&Value::Number(-1.0)));
        assert!(is_true(&Value::string("0")));
    }

    #[test]
    fn test_array_to_string_joins() {
        let mut heap = Heap::new();
        let r = heap.alloc(HeapEntity::new(Payload::Array(ArrayStore {
            elements: vec![
                Value::Number(1.0),
                Value::invalid(),
                Value::string("x"),
                Value::Null,
            ],
        })));
        let rendered = to_string_value(&heap, &Value::Array(r)).unwrap();
        assert_eq!(rendered.to_lossy(), "1,,x,");
    }
}
