//! Loose equality and primitive comparison.

use crate::convert::{self, Hint};
use crate::error::VmResult;
use crate::heap::Heap;
use crate::value::{strict_equals, Value};

/// The numeric reading of a below-string primitive: booleans read as 0/1.
/// Null and undefined are screened out before this is consulted.
fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => Some(*n),
        Value::Boolean(true) => Some(1.0),
        Value::Boolean(false) => Some(0.0),
        _ => None,
    }
}

/// Loose equality (`==`).
///
/// Mixed-kind operands are sorted by kind so the promotion cases collapse:
/// numeric against string coerces the string, primitive against object
/// coerces the object to a primitive and restarts.
pub fn values_equal(heap: &Heap, a: &Value, b: &Value) -> VmResult<bool> {
    let mut val1 = a.clone();
    let mut val2 = b.clone();

    loop {
        let nv1 = val1.is_null_or_undefined();
        let nv2 = val2.is_null_or_undefined();

        // Void and null are equal and not comparable with anything else.
        if nv1 || nv2 {
            return Ok(nv1 && nv2);
        }

        if let (Some(n1), Some(n2)) = (numeric(&val1), numeric(&val2)) {
            // NaNs and Infinities are handled correctly by comparison.
            return Ok(n1 == n2);
        }

        if val1.kind() == val2.kind() {
            if let (Value::String(s1), Value::String(s2)) = (&val1, &val2) {
                return Ok(s1 == s2);
            }
            return Ok(strict_equals(&val1, &val2));
        }

        // Sort values as: numeric < string < objects.
        let (lv, hv) = if val1.kind() > val2.kind() {
            (val2, val1)
        } else {
            (val1, val2)
        };

        // If "lv" is an object then "hv" can only be another object.
        if lv.is_object() {
            return Ok(false);
        }

        // If "hv" is a string then "lv" can only be a numeric.
        if let Value::String(s) = &hv {
            let Some(ln) = numeric(&lv) else {
                return Ok(false);
            };
            return Ok(ln == convert::string_to_number(s));
        }

        if !hv.is_object() {
            return Ok(false);
        }

        // "hv" is an object and "lv" is a primitive.
        val1 = convert::to_primitive(heap, &hv, Hint::Number)?;
        val2 = lv;
    }
}

/// Primitive relational comparison per ECMA-262 §11.8.5.
///
/// Returns `1` if `a` is less than `b`, `0` if `a` is greater than or equal
/// to `b`, and `-1` when the values are not comparable.
pub fn primitive_compare(a: &Value, b: &Value) -> i32 {
    let (num1, num2) = match (a, b) {
        (Value::String(s1), Value::String(s2)) => {
            return if s1 < s2 { 1 } else { 0 };
        }
        (Value::String(s1), _) => (convert::string_to_number(s1), primitive_number(b)),
        (_, Value::String(s2)) => (primitive_number(a), convert::string_to_number(s2)),
        _ => (primitive_number(a), primitive_number(b)),
    };

    // NaN and void values are not comparable with anything.
    if num1.is_nan() || num2.is_nan() {
        return -1;
    }

    // Infinities are handled correctly by comparison.
    if num1 < num2 {
        1
    } else {
        0
    }
}

fn primitive_number(value: &Value) -> f64 {
    match value {
        Value::Number(n) => *n,
        Value::Boolean(true) => 1.0,
        Value::Boolean(false) => 0.0,
        Value::Null => 0.0,
        Value::String(s) => convert::string_to_number(s),
        _ => f64::NAN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{HeapEntity, Payload};

    #[test]
    fn test_null_undefined_family() {
        let heap = Heap::new();
        assert!(values_equal(&heap, &Value::Null, &Value::Undefined).unwrap());
        assert!(values_equal(&heap, &Value::Null, &Value::Null).unwrap());
        assert!(!values_equal(&heap, &Value::Null, &Value::Number(0.0)).unwrap());
        assert!(!values_equal(&heap, &Value::Undefined, &Value::Boolean(false)).unwrap());
    }

    #[test]
    fn test_numeric_string_promotion() {
        let heap = Heap::new();
        assert!(values_equal(&heap, &Value::Number(1.0), &Value::string("1")).unwrap());
        assert!(values_equal(&heap, &Value::string("1"), &Value::Number(1.0)).unwrap());
        assert!(!values_equal(&heap, &Value::Number(2.0), &Value::string("1")).unwrap());
        assert!(values_equal(&heap, &Value::Boolean(true), &Value::Number(1.0)).unwrap());
        assert!(values_equal(&heap, &Value::Boolean(true), &Value::string("1")).unwrap());
        assert!(!values_equal(&heap, &Value::Boolean(false), &Value::Number(1.0)).unwrap());
    }

    #[test]
    fn test_nan_never_equal() {
        let heap = Heap::new();
        let nan = Value::Number(f64::NAN);
        assert!(!values_equal(&heap, &nan, &nan).unwrap());
    }

    #[test]
    fn test_commutativity() {
        let heap = Heap::new();
        let samples = [
            Value::Null,
            Value::Undefined,
            Value::Boolean(true),
            Value::Number(0.0),
            Value::Number(1.0),
            Value::string(""),
            Value::string("1"),
        ];
        for a in &samples {
            for b in &samples {
                assert_eq!(
                    values_equal(&heap, a, b).unwrap(),
                    values_equal(&heap, b, a).unwrap(),
                    "a={a:?} b={b:?}"
                );
            }
        }
    }

    #[test]
    fn test_object_coerces_to_primitive() {
        let mut heap = Heap::new();
        let boxed = heap.alloc(HeapEntity::new(Payload::Boxed(Value::Number(5.0))));
        let v = Value::ObjectValue(boxed);
        assert!(values_equal(&heap, &v, &Value::Number(5.0)).unwrap());
        assert!(values_equal(&heap, &Value::Number(5.0), &v).unwrap());
        assert!(!values_equal(&heap, &v, &Value::Number(6.0)).unwrap());
    }

    #[test]
    fn test_objects_compare_by_identity() {
        let mut heap = Heap::new();
        let a = Value::Object(heap.alloc_object());
        let b = Value::Object(heap.alloc_object());
        assert!(values_equal(&heap, &a, &a.clone()).unwrap());
        assert!(!values_equal(&heap, &a, &b).unwrap());
    }

    #[test]
    fn test_primitive_compare() {
        assert_eq!(
            primitive_compare(&Value::Number(1.0), &Value::Number(2.0)),
            1
        );
        assert_eq!(
            primitive_compare(&Value::Number(2.0), &Value::Number(2.0)),
            0
        );
        assert_eq!(
            primitive_compare(&Value::Number(f64::NAN), &Value::Number(2.0)),
            -1
        );
        assert_eq!(
            primitive_compare(&Value::string("a"), &Value::string("b")),
            1
        );
        assert_eq!(
            primitive_compare(&Value::string("b"), &Value::string("a")),
            0
        );
        assert_eq!(
            primitive_compare(&Value::string("10"), &Value::Number(9.0)),
            0
        );
        assert_eq!(
            primitive_compare(&Value::Number(f64::NEG_INFINITY), &Value::Number(0.0)),
            1
        );
    }
}
