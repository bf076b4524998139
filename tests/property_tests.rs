//! Tests for the property subsystem: prototype chains, shared hashes,
//! whiteout tombstones, the enumeration protocol, and external objects.

use std::cell::RefCell;
use std::rc::Rc;

use lyra_vm::value::DataValue;
use lyra_vm::{
    Attribute, ExternalProto, HostIter, LambdaShape, Operand, Property, ScriptBuilder, Value, Vm,
    VmError, VmResult,
};

fn run(b: ScriptBuilder) -> (Vm, Value) {
    let script = b.build();
    script.validate().expect("script should be well-formed");
    let mut vm = Vm::new(script);
    let result = vm.interpret().expect("execution should succeed");
    (vm, result)
}

#[test]
fn test_missing_property_reads_undefined() {
    let mut b = ScriptBuilder::new();
    b.set_globals(2);
    let key = b.string("missing");
    b.object(Operand::global(0));
    b.property_get(Operand::global(1), Operand::global(0), key);
    b.stop(Operand::global(1));
    let (_, result) = run(b);
    assert!(result.is_undefined());
}

#[test]
fn test_property_get_on_undefined_is_type_error() {
    let mut b = ScriptBuilder::new();
    b.set_globals(2);
    let undef = b.undefined();
    let key = b.string("p");
    b.property_get(Operand::global(1), undef, key);
    b.stop(Operand::global(1));
    let mut vm = Vm::new(b.build());
    let err = vm.interpret().unwrap_err();
    assert_eq!(
        err,
        VmError::type_error("cannot get property \"p\" of undefined")
    );
}

#[test]
fn test_delete_leaves_whiteout() {
    // var a = {}; a.p = 1; delete a.p; "p" in a  ->  false
    let mut b = ScriptBuilder::new();
    b.set_globals(4);
    let one = b.number(1.0);
    let p = b.string("p");
    b.object(Operand::global(0));
    b.property_set(one, Operand::global(0), p);
    b.property_delete(Operand::global(1), Operand::global(0), p);
    b.property_in(Operand::global(2), Operand::global(0), p);
    b.property_get(Operand::global(3), Operand::global(0), p);
    b.stop(Operand::global(2));
    let (vm, result) = run(b);
    assert!(matches!(vm.globals()[1], Value::Boolean(true)));
    assert!(matches!(result, Value::Boolean(false)));
    assert!(vm.globals()[3].is_undefined());
}

#[test]
fn test_delete_missing_key_is_silent() {
    let mut b = ScriptBuilder::new();
    b.set_globals(2);
    let p = b.string("p");
    b.object(Operand::global(0));
    b.property_delete(Operand::global(1), Operand::global(0), p);
    b.stop(Operand::global(1));
    let (_, result) = run(b);
    assert!(matches!(result, Value::Boolean(true)));
}

#[test]
fn test_delete_non_configurable_is_type_error() {
    let mut b = ScriptBuilder::new();
    b.set_globals(2);
    let k = b.string("k");
    b.property_delete(Operand::global(1), Operand::global(0), k);
    b.stop(Operand::global(1));
    let mut vm = Vm::new(b.build());

    let r = vm.heap_mut().alloc_object();
    let mut prop = Property::data(Value::Number(1.0));
    prop.configurable = Attribute::False;
    vm.heap_mut().get_mut(r).hash.insert("k".into(), prop);
    vm.set_global(0, Value::Object(r)).unwrap();

    let err = vm.interpret().unwrap_err();
    assert_eq!(
        err,
        VmError::type_error("Cannot delete property \"k\" of object")
    );
}

#[test]
fn test_set_revives_deleted_property() {
    let mut b = ScriptBuilder::new();
    b.set_globals(3);
    let one = b.number(1.0);
    let two = b.number(2.0);
    let p = b.string("p");
    b.object(Operand::global(0));
    b.property_set(one, Operand::global(0), p);
    b.property_delete(Operand::global(1), Operand::global(0), p);
    b.property_set(two, Operand::global(0), p);
    b.property_get(Operand::global(2), Operand::global(0), p);
    b.stop(Operand::global(2));
    let (_, result) = run(b);
    assert_eq!(result.as_number(), Some(2.0));
}

#[test]
fn test_read_only_property_rejects_store() {
    let mut b = ScriptBuilder::new();
    b.set_globals(2);
    let two = b.number(2.0);
    let k = b.string("k");
    b.property_set(two, Operand::global(0), k);
    b.stop(Operand::global(1));
    let mut vm = Vm::new(b.build());

    let r = vm.heap_mut().alloc_object();
    let mut prop = Property::data(Value::Number(1.0));
    prop.writable = Attribute::False;
    vm.heap_mut().get_mut(r).hash.insert("k".into(), prop);
    vm.set_global(0, Value::Object(r)).unwrap();

    let err = vm.interpret().unwrap_err();
    assert_eq!(
        err,
        VmError::type_error("Cannot assign to read-only property \"k\" of object")
    );
}

#[test]
fn test_prototype_chain_lookup() {
    // o = new F(); F.prototype.inherited = 9; o.inherited == 9
    let mut b = ScriptBuilder::new();
    b.set_globals(5);
    let body = b.label();
    let over = b.label();
    b.jump(over);
    b.bind(body);
    let u = b.undefined();
    b.return_(u);
    b.bind(over);
    let lambda = b.add_lambda(body, LambdaShape::default());
    let prototype = b.string("prototype");
    let inherited = b.string("inherited");
    let nine = b.number(9.0);
    b.function(Operand::global(0), lambda);
    b.function_frame(Operand::global(0), 0, true);
    b.function_call(Operand::global(1));
    b.property_get(Operand::global(2), Operand::global(0), prototype);
    b.property_set(nine, Operand::global(2), inherited);
    b.property_get(Operand::global(3), Operand::global(1), inherited);
    // Own properties shadow inherited ones.
    let one = b.number(1.0);
    b.property_set(one, Operand::global(1), inherited);
    b.property_get(Operand::global(4), Operand::global(1), inherited);
    b.stop(Operand::global(3));
    let (vm, result) = run(b);
    assert_eq!(result.as_number(), Some(9.0));
    assert_eq!(vm.globals()[4].as_number(), Some(1.0));
}

#[test]
fn test_enumeration_in_insertion_order() {
    let mut b = ScriptBuilder::new();
    b.set_globals(4);
    let one = b.number(1.0);
    let two = b.number(2.0);
    let three = b.number(3.0);
    let ka = b.string("a");
    let kb = b.string("b");
    let kc = b.string("c");
    let empty = b.string("");
    let body = b.label();
    let next = b.label();

    b.object(Operand::global(0));
    b.property_init(one, Operand::global(0), ka);
    b.property_init(two, Operand::global(0), kb);
    b.property_init(three, Operand::global(0), kc);
    b.move_(Operand::global(1), empty);
    b.property_foreach(Operand::global(2), Operand::global(0), next);
    b.bind(body);
    b.add(Operand::global(1), Operand::global(1), Operand::global(3));
    b.bind(next);
    b.property_next(
        Operand::global(0),
        Operand::global(2),
        Operand::global(3),
        body,
    );
    b.stop(Operand::global(1));

    let (_, result) = run(b);
    assert_eq!(result.as_string().unwrap().to_lossy(), "abc");
}

#[test]
fn test_enumeration_skips_whiteout() {
    let mut b = ScriptBuilder::new();
    b.set_globals(5);
    let one = b.number(1.0);
    let two = b.number(2.0);
    let three = b.number(3.0);
    let ka = b.string("a");
    let kb = b.string("b");
    let kc = b.string("c");
    let empty = b.string("");
    let body = b.label();
    let next = b.label();

    b.object(Operand::global(0));
    b.property_init(one, Operand::global(0), ka);
    b.property_init(two, Operand::global(0), kb);
    b.property_init(three, Operand::global(0), kc);
    b.property_delete(Operand::global(4), Operand::global(0), kb);
    b.move_(Operand::global(1), empty);
    b.property_foreach(Operand::global(2), Operand::global(0), next);
    b.bind(body);
    b.add(Operand::global(1), Operand::global(1), Operand::global(3));
    b.bind(next);
    b.property_next(
        Operand::global(0),
        Operand::global(2),
        Operand::global(3),
        body,
    );
    b.stop(Operand::global(1));

    let (_, result) = run(b);
    assert_eq!(result.as_string().unwrap().to_lossy(), "ac");
}

#[test]
fn test_enumeration_of_array_skips_holes() {
    // [10, , 30] enumerates the keys "0" and "2".
    let mut b = ScriptBuilder::new();
    b.set_globals(4);
    let ten = b.number(10.0);
    let thirty = b.number(30.0);
    let zero = b.number(0.0);
    let two = b.number(2.0);
    let empty = b.string("");
    let body = b.label();
    let next = b.label();

    b.array(Operand::global(0), 3, true);
    b.property_init(ten, Operand::global(0), zero);
    b.property_init(thirty, Operand::global(0), two);
    b.move_(Operand::global(1), empty);
    b.property_foreach(Operand::global(2), Operand::global(0), next);
    b.bind(body);
    b.add(Operand::global(1), Operand::global(1), Operand::global(3));
    b.bind(next);
    b.property_next(
        Operand::global(0),
        Operand::global(2),
        Operand::global(3),
        body,
    );
    b.stop(Operand::global(1));

    let (vm, result) = run(b);
    assert_eq!(result.as_string().unwrap().to_lossy(), "02");
    // The exhausted iterator slot was invalidated.
    assert!(!vm.globals()[2].is_valid());
}

#[test]
fn test_property_init_replaces_existing_key_in_place() {
    let mut b = ScriptBuilder::new();
    b.set_globals(2);
    let one = b.number(1.0);
    let nine = b.number(9.0);
    let two = b.number(2.0);
    let ka = b.string("a");
    let kb = b.string("b");
    let empty = b.string("");
    let body = b.label();
    let next = b.label();

    b.object(Operand::global(0));
    b.property_init(one, Operand::global(0), ka);
    b.property_init(two, Operand::global(0), kb);
    // Replacement keeps the original position.
    b.property_init(nine, Operand::global(0), ka);
    b.move_(Operand::global(1), empty);
    let iter = Operand::local(0);
    b.set_locals(2);
    b.property_foreach(iter, Operand::global(0), next);
    b.bind(body);
    b.add(Operand::global(1), Operand::global(1), Operand::local(1));
    b.bind(next);
    b.property_next(Operand::global(0), iter, Operand::local(1), body);
    b.stop(Operand::global(1));

    let (mut vm, result) = run(b);
    assert_eq!(result.as_string().unwrap().to_lossy(), "ab");
    let object = vm.globals()[0].clone();
    let a = vm.property_get(&object, &Value::string("a")).unwrap();
    assert_eq!(a.as_number(), Some(9.0));
}

#[test]
fn test_array_length_handler() {
    let mut b = ScriptBuilder::new();
    b.set_globals(4);
    let seven = b.number(7.0);
    let two = b.number(2.0);
    let one = b.number(1.0);
    let length = b.string("length");
    b.array(Operand::global(0), 0, false);
    b.property_set(seven, Operand::global(0), two);
    b.property_get(Operand::global(1), Operand::global(0), length);
    // Truncating store through the handler.
    b.property_set(one, Operand::global(0), length);
    b.property_get(Operand::global(2), Operand::global(0), length);
    b.property_get(Operand::global(3), Operand::global(0), two);
    b.stop(Operand::global(2));
    let (vm, result) = run(b);
    assert_eq!(vm.globals()[1].as_number(), Some(3.0));
    assert_eq!(result.as_number(), Some(1.0));
    assert!(vm.globals()[3].is_undefined());
}

#[test]
fn test_invalid_array_length_is_range_error() {
    let mut b = ScriptBuilder::new();
    b.set_globals(1);
    let bad = b.number(1.5);
    let length = b.string("length");
    b.array(Operand::global(0), 0, false);
    b.property_set(bad, Operand::global(0), length);
    b.stop(Operand::global(0));
    let mut vm = Vm::new(b.build());
    let err = vm.interpret().unwrap_err();
    assert_eq!(err, VmError::range_error("invalid array length"));
}

#[test]
fn test_string_length_and_indexing() {
    let mut b = ScriptBuilder::new();
    b.set_globals(2);
    let s = b.string("héllo");
    let length = b.string("length");
    let one = b.number(1.0);
    b.property_get(Operand::global(0), s, length);
    b.property_get(Operand::global(1), s, one);
    b.stop(Operand::global(0));
    let (vm, result) = run(b);
    assert_eq!(result.as_number(), Some(5.0));
    assert_eq!(vm.globals()[1].as_string().unwrap().to_lossy(), "é");
}

#[test]
fn test_string_concat_through_shared_hash() {
    let mut b = ScriptBuilder::new();
    b.set_globals(1);
    let receiver = b.string("ab");
    let concat = b.string("concat");
    let tail = b.string("cd");
    b.method_frame(receiver, concat, 1, false);
    b.move_(Operand::callee_argument(1), tail);
    b.function_call(Operand::global(0));
    b.stop(Operand::global(0));
    let (_, result) = run(b);
    assert_eq!(result.as_string().unwrap().to_lossy(), "abcd");
}

#[test]
fn test_property_in_on_primitive_is_type_error() {
    let mut b = ScriptBuilder::new();
    b.set_globals(1);
    let five = b.number(5.0);
    let p = b.string("p");
    b.property_in(Operand::global(0), five, p);
    b.stop(Operand::global(0));
    let mut vm = Vm::new(b.build());
    let err = vm.interpret().unwrap_err();
    assert_eq!(err, VmError::type_error("property in on a primitive value"));
}

#[test]
fn test_property_in_sees_inherited_properties() {
    let mut b = ScriptBuilder::new();
    b.set_globals(4);
    let body = b.label();
    let over = b.label();
    b.jump(over);
    b.bind(body);
    let u = b.undefined();
    b.return_(u);
    b.bind(over);
    let lambda = b.add_lambda(body, LambdaShape::default());
    let prototype = b.string("prototype");
    let inherited = b.string("inherited");
    let nine = b.number(9.0);
    b.function(Operand::global(0), lambda);
    b.function_frame(Operand::global(0), 0, true);
    b.function_call(Operand::global(1));
    b.property_get(Operand::global(2), Operand::global(0), prototype);
    b.property_set(nine, Operand::global(2), inherited);
    b.property_in(Operand::global(3), Operand::global(1), inherited);
    b.stop(Operand::global(3));
    let (_, result) = run(b);
    assert!(matches!(result, Value::Boolean(true)));
}

// External objects: a host class with three enumerable keys and a handler
// property backed by a shared cell.

fn ext_foreach(_vm: &mut Vm, _object: &Value, retval: &mut Value) -> VmResult<()> {
    *retval = Value::Data(DataValue(Rc::new(RefCell::new(0u32))));
    Ok(())
}

fn ext_next(
    _vm: &mut Vm,
    retval: &mut Value,
    _object: &Value,
    iterator: &Value,
) -> VmResult<HostIter> {
    let Value::Data(data) = iterator else {
        return Ok(HostIter::Done);
    };
    let cell = data
        .0
        .downcast_ref::<RefCell<u32>>()
        .expect("host iterator state");
    let mut index = cell.borrow_mut();
    if *index < 3 {
        *retval = Value::Number(*index as f64);
        *index += 1;
        Ok(HostIter::Ok)
    } else {
        Ok(HostIter::Done)
    }
}

fn ext_answer(
    vm: &mut Vm,
    object: &Value,
    setter: Option<&Value>,
    retval: Option<&mut Value>,
) -> VmResult<()> {
    let data = vm.external_data(object).expect("external datum").0.clone();
    let cell = data
        .downcast_ref::<RefCell<f64>>()
        .expect("answer cell");
    if let Some(value) = setter {
        *cell.borrow_mut() = value.as_number().unwrap_or(f64::NAN);
    }
    if let Some(out) = retval {
        *out = Value::Number(*cell.borrow());
    }
    Ok(())
}

fn external_proto() -> Rc<ExternalProto> {
    let mut proto = ExternalProto {
        foreach: Some(ext_foreach),
        next: Some(ext_next),
        ..Default::default()
    };
    proto.properties.insert("answer".to_string(), ext_answer);
    Rc::new(proto)
}

#[test]
fn test_external_enumeration_protocol() {
    // Sums the host-provided keys 0, 1, 2.
    let mut b = ScriptBuilder::new();
    b.set_globals(4);
    let zero = b.number(0.0);
    let body = b.label();
    let next = b.label();
    b.move_(Operand::global(1), zero);
    b.property_foreach(Operand::global(2), Operand::global(0), next);
    b.bind(body);
    b.add(Operand::global(1), Operand::global(1), Operand::global(3));
    b.bind(next);
    b.property_next(
        Operand::global(0),
        Operand::global(2),
        Operand::global(3),
        body,
    );
    b.stop(Operand::global(1));

    let mut vm = Vm::new(b.build());
    let external = vm.register_external(external_proto(), None);
    vm.set_global(0, external).unwrap();
    let result = vm.interpret().unwrap();
    assert_eq!(result.as_number(), Some(3.0));
}

#[test]
fn test_external_property_handler() {
    let mut b = ScriptBuilder::new();
    b.set_globals(2);
    let answer = b.string("answer");
    let hundred = b.number(100.0);
    b.property_get(Operand::global(1), Operand::global(0), answer);
    b.property_set(hundred, Operand::global(0), answer);
    b.stop(Operand::global(1));

    let mut vm = Vm::new(b.build());
    let cell = Rc::new(RefCell::new(42.0f64));
    let external = vm.register_external(external_proto(), Some(DataValue(cell.clone())));
    vm.set_global(0, external).unwrap();
    let result = vm.interpret().unwrap();
    assert_eq!(result.as_number(), Some(42.0));
    assert_eq!(*cell.borrow(), 100.0);
}

#[test]
fn test_retain_release_balance_on_overwrite() {
    let mut b = ScriptBuilder::new();
    b.set_globals(2);
    let one = b.number(1.0);
    b.object(Operand::global(0));
    b.move_(Operand::global(1), Operand::global(0));
    // Overwriting one of the two referencing slots drops one count.
    b.move_(Operand::global(0), one);
    b.stop(Operand::global(1));
    let (vm, result) = run(b);
    let r = result.object_ref().expect("object result");
    assert_eq!(vm.heap().refcount(r), 1);
}
