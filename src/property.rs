//! The property subsystem.
//!
//! Lookup, store, literal initialization, deletion, `in`, `instanceof`,
//! `typeof`, and the enumeration protocol. Lookup walks the own hash of
//! each prototype-chain node, then the node's per-kind shared hash; a
//! handler property found anywhere along the chain is invoked in place of
//! the stored value. Whiteout entries read as absent but keep their hash
//! slot so a later store can revive them in place.

use std::cell::RefCell;
use std::rc::Rc;

use crate::convert;
use crate::error::{VmError, VmResult};
use crate::object::{Attribute, Closure, Property, PropertyHandlerFn, PropertyKind};
use crate::value::{Value, ValueKind};
use crate::Vm;

/// Prototype chains longer than this are treated as cyclic.
const PROTOTYPE_CHAIN_LIMIT: usize = 256;

/// In-flight enumeration state: a cursor over a snapshot of the enumerable
/// keys taken when the loop started.
#[derive(Debug)]
pub struct PropertyIterator {
    pub index: u32,
    pub keys: Vec<Value>,
}

/// Result of a chain walk, with borrows already broken so the caller can
/// re-enter the VM.
enum Lookup {
    Value(Value),
    Handler(PropertyHandlerFn),
    Ref(Closure),
    NotFound,
}

/// What a store must do, decided before any mutation.
enum SetAction {
    WriteOwn,
    ReviveWhiteout,
    Handler(PropertyHandlerFn),
    WriteRef(Closure),
    ReadOnly,
    Insert,
}

/// The `typeof` table. Null reads as `"object"`; the null kind stays
/// distinct in [`ValueKind`].
pub fn typeof_string(value: &Value) -> &'static str {
    match value.kind() {
        ValueKind::Null => "object",
        ValueKind::Undefined | ValueKind::Invalid => "undefined",
        ValueKind::Boolean => "boolean",
        ValueKind::Number => "number",
        ValueKind::String => "string",
        ValueKind::Data => "data",
        ValueKind::External => "external",
        ValueKind::Function => "function",
        _ => "object",
    }
}

fn valid_or_undefined(value: Value) -> Value {
    if value.is_valid() {
        value
    } else {
        Value::Undefined
    }
}

impl Vm {
    /// Renders a property key for hashes and messages.
    pub(crate) fn property_key(&self, key: &Value) -> VmResult<Rc<str>> {
        let s = convert::to_string_value(self.heap(), key)?;
        Ok(Rc::from(s.to_lossy()))
    }

    fn lookup_from(&self, lookup: &Property) -> Lookup {
        match &lookup.kind {
            PropertyKind::Whiteout => Lookup::NotFound,
            PropertyKind::Data => Lookup::Value(valid_or_undefined(lookup.value.clone())),
            PropertyKind::Handler(f) => Lookup::Handler(*f),
            PropertyKind::Ref(cell) => Lookup::Ref(Rc::clone(cell)),
        }
    }

    /// Walks `object`'s own hash, shared hash, and prototype chain.
    fn lookup_chain(&mut self, object: &Value, key: &str) -> VmResult<Lookup> {
        // Primitives resolve against their kind's shared hash only.
        if object.is_primitive() {
            if let Some(table) = self.shared.for_kind(object.kind()) {
                if let Some(prop) = table.get(key) {
                    let found = self.lookup_from(prop);
                    if !matches!(found, Lookup::NotFound) {
                        return Ok(found);
                    }
                }
            }
            return Ok(Lookup::NotFound);
        }

        let mut current = object.object_ref();
        let mut depth = 0;
        while let Some(r) = current {
            depth += 1;
            if depth > PROTOTYPE_CHAIN_LIMIT {
                return Err(self.throw_internal_error("prototype chain too deep"));
            }

            let entity = self.heap.get(r);
            if let Some(prop) = entity.hash.get(key) {
                let found = self.lookup_from(prop);
                if !matches!(found, Lookup::NotFound) {
                    return Ok(found);
                }
            }

            if let Some(table) = self.shared.for_kind(entity.kind()) {
                if let Some(prop) = table.get(key) {
                    let found = self.lookup_from(prop);
                    if !matches!(found, Lookup::NotFound) {
                        return Ok(found);
                    }
                }
            }

            current = entity.proto;
        }
        Ok(Lookup::NotFound)
    }

    /// Property lookup. Missing keys read as undefined.
    pub fn property_get(&mut self, object: &Value, key: &Value) -> VmResult<Value> {
        match object {
            Value::Undefined | Value::Null | Value::Invalid(_) => {
                let k = self.property_key(key)?;
                Err(self.throw_type_error(format!(
                    "cannot get property \"{k}\" of {}",
                    object.kind().name()
                )))
            }
            Value::External(r) => {
                let key_s = self.property_key(key)?;
                let handler = self.externals[r.index()]
                    .proto
                    .properties
                    .get(key_s.as_ref())
                    .copied();
                match handler {
                    Some(f) => {
                        let mut retval = Value::Undefined;
                        f(self, object, None, Some(&mut retval))?;
                        Ok(retval)
                    }
                    None => Ok(Value::Undefined),
                }
            }
            Value::String(s) => {
                if let Some(index) = convert::to_index(key) {
                    if let Some(c) = s.char_at(index as usize) {
                        return Ok(Value::String(c));
                    }
                }
                self.finish_get(object, key)
            }
            Value::Array(r) => {
                if let Some(index) = convert::to_index(key) {
                    if let Some(store) = self.heap.get(*r).as_array() {
                        if let Some(element) = store.elements.get(index as usize) {
                            if element.is_valid() {
                                return Ok(element.clone());
                            }
                            return Ok(Value::Undefined);
                        }
                    }
                }
                self.finish_get(object, key)
            }
            _ => self.finish_get(object, key),
        }
    }

    fn finish_get(&mut self, object: &Value, key: &Value) -> VmResult<Value> {
        let key_s = self.property_key(key)?;
        match self.lookup_chain(object, &key_s)? {
            Lookup::Value(v) => Ok(v),
            Lookup::Handler(f) => {
                let mut retval = Value::Undefined;
                f(self, object, None, Some(&mut retval))?;
                Ok(retval)
            }
            Lookup::Ref(cell) => Ok(valid_or_undefined(cell.borrow().clone())),
            Lookup::NotFound => Ok(Value::Undefined),
        }
    }

    /// Property store. Inherited handler properties intercept; non-writable
    /// properties fail with a TypeError.
    pub fn property_set(&mut self, object: &Value, key: &Value, value: Value) -> VmResult<()> {
        match object {
            Value::Undefined | Value::Null | Value::Invalid(_) => {
                let k = self.property_key(key)?;
                Err(self.throw_type_error(format!(
                    "cannot set property \"{k}\" of {}",
                    object.kind().name()
                )))
            }
            Value::External(r) => {
                let key_s = self.property_key(key)?;
                let handler = self.externals[r.index()]
                    .proto
                    .properties
                    .get(key_s.as_ref())
                    .copied();
                match handler {
                    Some(f) => f(self, object, Some(&value), None),
                    None => Err(self.throw_type_error(format!(
                        "cannot set property \"{key_s}\" of external"
                    ))),
                }
            }
            Value::Array(r) => {
                if let Some(index) = convert::to_index(key) {
                    return self.array_set_element(*r, index as usize, value);
                }
                self.finish_set(object, key, value)
            }
            _ if object.is_primitive() => {
                Err(self.throw_type_error("property set on a primitive value"))
            }
            _ => self.finish_set(object, key, value),
        }
    }

    fn finish_set(&mut self, object: &Value, key: &Value, value: Value) -> VmResult<()> {
        let key_s = self.property_key(key)?;
        let own = object
            .object_ref()
            .ok_or_else(|| VmError::internal("property store without heap reference"))?;

        let action = {
            let entity = self.heap.get(own);
            match entity.hash.get(key_s.as_ref()) {
                Some(prop) => match &prop.kind {
                    PropertyKind::Whiteout => SetAction::ReviveWhiteout,
                    PropertyKind::Handler(f) => SetAction::Handler(*f),
                    PropertyKind::Ref(cell) => SetAction::WriteRef(Rc::clone(cell)),
                    PropertyKind::Data => {
                        if prop.writable.is_true() {
                            SetAction::WriteOwn
                        } else {
                            SetAction::ReadOnly
                        }
                    }
                },
                None => self.inherited_set_action(entity.proto, entity.kind(), &key_s),
            }
        };

        match action {
            SetAction::WriteOwn => {
                let old = {
                    let entity = self.heap.get_mut(own);
                    let prop = entity
                        .hash
                        .get_mut(key_s.as_ref())
                        .expect("own property disappeared");
                    std::mem::replace(&mut prop.value, value.clone())
                };
                self.heap.release(&old);
                self.heap.retain(&value);
                Ok(())
            }
            SetAction::ReviveWhiteout | SetAction::Insert => {
                self.heap.retain(&value);
                let entity = self.heap.get_mut(own);
                entity.hash.insert(key_s, Property::data(value));
                Ok(())
            }
            SetAction::Handler(f) => f(self, object, Some(&value), None),
            SetAction::WriteRef(cell) => {
                let old = cell.replace(value.clone());
                self.heap.release(&old);
                self.heap.retain(&value);
                Ok(())
            }
            SetAction::ReadOnly => Err(self.throw_type_error(format!(
                "Cannot assign to read-only property \"{key_s}\" of {}",
                object.kind().name()
            ))),
        }
    }

    /// Scans the inherited part of the chain for a handler or a read-only
    /// data property blocking the store.
    fn inherited_set_action(
        &self,
        proto: Option<crate::heap::ObjRef>,
        base_kind: ValueKind,
        key: &str,
    ) -> SetAction {
        if let Some(table) = self.shared.for_kind(base_kind) {
            if let Some(prop) = table.get(key) {
                if let PropertyKind::Handler(f) = &prop.kind {
                    return SetAction::Handler(*f);
                }
            }
        }

        let mut current = proto;
        let mut depth = 0;
        while let Some(r) = current {
            depth += 1;
            if depth > PROTOTYPE_CHAIN_LIMIT {
                break;
            }
            let entity = self.heap.get(r);
            if let Some(prop) = entity.hash.get(key) {
                match &prop.kind {
                    PropertyKind::Handler(f) => return SetAction::Handler(*f),
                    PropertyKind::Data if prop.writable == Attribute::False => {
                        return SetAction::ReadOnly;
                    }
                    _ => break,
                }
            }
            current = entity.proto;
        }
        SetAction::Insert
    }

    fn array_set_element(
        &mut self,
        r: crate::heap::ObjRef,
        index: usize,
        value: Value,
    ) -> VmResult<()> {
        let old = {
            let store = self
                .heap
                .get_mut(r)
                .as_array_mut()
                .ok_or_else(|| VmError::internal("array store missing"))?;
            if index < store.elements.len() {
                std::mem::replace(&mut store.elements[index], value.clone())
            } else {
                // Extend contiguously, representing the gap as holes.
                store.elements.resize(index, Value::invalid());
                store.elements.push(value.clone());
                Value::invalid()
            }
        };
        self.heap.release(&old);
        self.heap.retain(&value);
        Ok(())
    }

    /// The literal-context store used by array and object initializers.
    pub(crate) fn property_init(
        &mut self,
        object: &Value,
        key: &Value,
        value: Value,
    ) -> VmResult<()> {
        match object {
            Value::Array(r) => {
                let index = convert::to_index(key).ok_or_else(|| {
                    self.throw_internal_error("invalid index while property initialization")
                })?;
                self.array_set_element(*r, index as usize, value)
            }
            Value::Object(_) => {
                let key_s = self.property_key(key)?;

                // The prototype may advertise a handler for this key.
                let handler = self
                    .shared
                    .for_kind(ValueKind::Object)
                    .and_then(|table| table.get(key_s.as_ref()))
                    .and_then(|prop| match &prop.kind {
                        PropertyKind::Handler(f) => Some(*f),
                        _ => None,
                    });
                if let Some(f) = handler {
                    return f(self, object, Some(&value), None);
                }

                let own = object
                    .object_ref()
                    .ok_or_else(|| VmError::internal("object value without heap reference"))?;
                self.heap.retain(&value);
                let old = self
                    .heap
                    .get_mut(own)
                    .hash
                    .insert(key_s, Property::data(value));
                if let Some(old) = old {
                    self.heap.release(&old.value);
                }
                Ok(())
            }
            _ => Err(self.throw_internal_error(format!(
                "unexpected value type \"{}\" while property initialization",
                object.kind().name()
            ))),
        }
    }

    /// Property deletion. Deleting a missing key succeeds silently; deleting
    /// a non-configurable property is a TypeError.
    pub(crate) fn property_delete(&mut self, object: &Value, key: &Value) -> VmResult<()> {
        match object {
            Value::Undefined | Value::Null | Value::Invalid(_) => {
                let k = self.property_key(key)?;
                Err(self.throw_type_error(format!(
                    "cannot delete property \"{k}\" of {}",
                    object.kind().name()
                )))
            }
            Value::External(r) => {
                let key_s = self.property_key(key)?;
                let handler = self.externals[r.index()]
                    .proto
                    .properties
                    .get(key_s.as_ref())
                    .copied();
                if let Some(f) = handler {
                    f(self, object, None, None)?;
                }
                Ok(())
            }
            Value::Array(r) => {
                if let Some(index) = convert::to_index(key) {
                    let old = {
                        let store = self
                            .heap
                            .get_mut(*r)
                            .as_array_mut()
                            .ok_or_else(|| VmError::internal("array store missing"))?;
                        match store.elements.get_mut(index as usize) {
                            Some(slot) => std::mem::replace(slot, Value::invalid()),
                            None => return Ok(()),
                        }
                    };
                    self.heap.release(&old);
                    return Ok(());
                }
                self.finish_delete(object, key)
            }
            _ if object.is_primitive() => Ok(()),
            _ => self.finish_delete(object, key),
        }
    }

    fn finish_delete(&mut self, object: &Value, key: &Value) -> VmResult<()> {
        let key_s = self.property_key(key)?;
        let own = object
            .object_ref()
            .ok_or_else(|| VmError::internal("property delete without heap reference"))?;

        enum DeleteAction {
            Tombstone,
            ClearRef(Closure),
            Nothing,
            NotConfigurable,
        }

        let action = {
            let entity = self.heap.get(own);
            match entity.hash.get(key_s.as_ref()) {
                Some(prop) if prop.configurable == Attribute::False => {
                    DeleteAction::NotConfigurable
                }
                Some(prop) => match &prop.kind {
                    PropertyKind::Ref(cell) => DeleteAction::ClearRef(Rc::clone(cell)),
                    PropertyKind::Whiteout => DeleteAction::Nothing,
                    PropertyKind::Data | PropertyKind::Handler(_) => DeleteAction::Tombstone,
                },
                None => DeleteAction::Nothing,
            }
        };

        if let DeleteAction::NotConfigurable = action {
            let kind = object.kind().name();
            return Err(self.throw_type_error(format!(
                "Cannot delete property \"{key_s}\" of {kind}"
            )));
        }

        match action {
            DeleteAction::Tombstone => {
                let old = {
                    let entity = self.heap.get_mut(own);
                    let prop = entity
                        .hash
                        .get_mut(key_s.as_ref())
                        .expect("own property disappeared");
                    prop.kind = PropertyKind::Whiteout;
                    std::mem::replace(&mut prop.value, Value::invalid())
                };
                self.heap.release(&old);
            }
            DeleteAction::ClearRef(cell) => {
                let old = cell.replace(Value::invalid());
                self.heap.release(&old);
            }
            DeleteAction::Nothing | DeleteAction::NotConfigurable => {}
        }
        Ok(())
    }

    /// The `in` operator: true iff a data-descriptor property exists own or
    /// inherited. Primitive bases are a TypeError.
    pub(crate) fn property_in(&mut self, object: &Value, key: &Value) -> VmResult<bool> {
        if let (Value::Array(r), Some(index)) = (object, convert::to_index(key)) {
            if let Some(store) = self.heap.get(*r).as_array() {
                if store
                    .elements
                    .get(index as usize)
                    .is_some_and(|v| v.is_valid())
                {
                    return Ok(true);
                }
            }
        }
        if let (Value::String(s), Some(index)) = (object, convert::to_index(key)) {
            if (index as usize) < s.length() {
                return Ok(true);
            }
        }

        let key_s = self.property_key(key)?;
        let found = self.query_descriptor(object, &key_s);

        match found {
            Some(is_data) => Ok(is_data),
            None => {
                if !object.is_object() && !object.is_external() {
                    Err(self.throw_type_error("property in on a primitive value"))
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// Finds a non-whiteout property own-or-inherited and reports whether it
    /// satisfies the data-descriptor predicate.
    fn query_descriptor(&self, object: &Value, key: &str) -> Option<bool> {
        let probe = |prop: &Property| match prop.kind {
            PropertyKind::Whiteout => None,
            _ => Some(prop.is_data_descriptor()),
        };

        if object.is_primitive() {
            return self
                .shared
                .for_kind(object.kind())
                .and_then(|table| table.get(key))
                .and_then(probe);
        }

        let mut current = object.object_ref();
        let mut depth = 0;
        while let Some(r) = current {
            depth += 1;
            if depth > PROTOTYPE_CHAIN_LIMIT {
                return None;
            }
            let entity = self.heap.get(r);
            if let Some(found) = entity.hash.get(key).and_then(probe) {
                return Some(found);
            }
            if let Some(found) = self
                .shared
                .for_kind(entity.kind())
                .and_then(|table| table.get(key))
                .and_then(probe)
            {
                return Some(found);
            }
            current = entity.proto;
        }
        None
    }

    /// The `instanceof` operator.
    pub(crate) fn instance_of(&mut self, object: &Value, constructor: &Value) -> VmResult<bool> {
        if !constructor.is_function() {
            return Err(self.throw_type_error("right argument is not a function"));
        }

        if !object.is_object() {
            return Ok(false);
        }

        let prototype = self.property_get(constructor, &Value::string("prototype"))?;
        let prototype_ref = match prototype.object_ref() {
            Some(r) if prototype.is_object() => r,
            _ => return Err(self.throw_internal_error("prototype is not an object")),
        };

        let mut current = object
            .object_ref()
            .and_then(|r| self.heap.get(r).proto);
        let mut depth = 0;
        while let Some(r) = current {
            if r == prototype_ref {
                return Ok(true);
            }
            depth += 1;
            if depth > PROTOTYPE_CHAIN_LIMIT {
                return Err(self.throw_internal_error("prototype chain too deep"));
            }
            current = self.heap.get(r).proto;
        }
        Ok(false)
    }

    /// Snapshots the enumerable own keys of `object` in insertion order.
    pub(crate) fn enumerate_keys(&self, object: &Value) -> Vec<Value> {
        let mut keys = Vec::new();
        match object {
            Value::String(s) => {
                for index in 0..s.length() {
                    keys.push(Value::String(crate::string::VmString::new(
                        &index.to_string(),
                    )));
                }
            }
            _ => {
                let Some(r) = object.object_ref() else {
                    return keys;
                };
                let entity = self.heap.get(r);
                if let Some(store) = entity.as_array() {
                    for (index, element) in store.elements.iter().enumerate() {
                        if element.is_valid() {
                            keys.push(Value::String(crate::string::VmString::new(
                                &index.to_string(),
                            )));
                        }
                    }
                }
                for (key, prop) in &entity.hash {
                    if matches!(prop.kind, PropertyKind::Whiteout) {
                        continue;
                    }
                    if !prop.enumerable.is_true() {
                        continue;
                    }
                    keys.push(Value::String(crate::string::VmString::new(key)));
                }
            }
        }
        keys
    }

    /// Allocates iterator state over the enumeration snapshot.
    pub(crate) fn make_iterator(&self, object: &Value) -> Value {
        Value::Iterator(Rc::new(RefCell::new(PropertyIterator {
            index: 0,
            keys: self.enumerate_keys(object),
        })))
    }
}

/// Read and write accessor for the `length` of arrays, registered in the
/// array shared hash.
pub(crate) fn array_length_handler(
    vm: &mut Vm,
    object: &Value,
    setter: Option<&Value>,
    retval: Option<&mut Value>,
) -> VmResult<()> {
    let r = object
        .object_ref()
        .ok_or_else(|| VmError::internal("length handler on non-object"))?;

    if let Some(value) = setter {
        let n = convert::to_number(vm.heap(), value)?;
        if n.fract() != 0.0 || !(0.0..4294967296.0).contains(&n) {
            return Err(vm.throw_range_error("invalid array length"));
        }
        let new_length = n as usize;
        let dropped = {
            let store = vm
                .heap
                .get_mut(r)
                .as_array_mut()
                .ok_or_else(|| VmError::internal("length handler on non-array"))?;
            if new_length < store.elements.len() {
                store.elements.split_off(new_length)
            } else {
                store.elements.resize(new_length, Value::invalid());
                Vec::new()
            }
        };
        for value in &dropped {
            vm.heap.release(value);
        }
        return Ok(());
    }

    if let Some(out) = retval {
        let length = vm
            .heap
            .get(r)
            .as_array()
            .map(|store| store.length())
            .unwrap_or(0);
        *out = Value::Number(length as f64);
    }
    Ok(())
}

/// Read-only `length` of strings, registered in the string shared hash.
pub(crate) fn string_length_handler(
    _vm: &mut Vm,
    object: &Value,
    _setter: Option<&Value>,
    retval: Option<&mut Value>,
) -> VmResult<()> {
    if let (Some(out), Value::String(s)) = (retval, object) {
        *out = Value::Number(s.length() as f64);
    }
    Ok(())
}

// The subsystem is exercised end-to-end in tests/property_tests.rs; the
// unit tests here pin the pure helpers.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typeof_table() {
        assert_eq!(typeof_string(&Value::Null), "object");
        assert_eq!(typeof_string(&Value::Undefined), "undefined");
        assert_eq!(typeof_string(&Value::Boolean(true)), "boolean");
        assert_eq!(typeof_string(&Value::Number(1.0)), "number");
        assert_eq!(typeof_string(&Value::string("x")), "string");
        assert_eq!(
            typeof_string(&Value::Function(crate::heap::ObjRef::new(0))),
            "function"
        );
        assert_eq!(
            typeof_string(&Value::Array(crate::heap::ObjRef::new(0))),
            "object"
        );
        assert_eq!(
            typeof_string(&Value::Regexp(crate::heap::ObjRef::new(0))),
            "object"
        );
    }
}
