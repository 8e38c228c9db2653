//! Methods on builtin guest types (str, list, tuple, dict, set).
//!
//! Dispatch is by runtime shape: the interpreter routes `obj.method(...)`
//! here first and falls back to instance/class attribute lookup only for
//! user-defined objects. Returns `Ok(None)` when the receiver type has no
//! such method so the caller can raise `AttributeError` with the right
//! type name.

use indexmap::IndexMap;

use crate::{
    builtins::{hashable, sort_values},
    exc::{ExcKind, RunError, RunResult},
    heap::{DictKey, GuestHeap, ObjData},
    ops::{iter_values, key_to_value, py_eq},
    resource::ResourceTracker,
    value::Value,
};

/// Calls a builtin-type method, if the receiver has one.
pub(crate) fn call_type_method<T: ResourceTracker>(
    heap: &mut GuestHeap<T>,
    recv: &Value,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> RunResult<Option<Value>> {
    if !kwargs.is_empty() && name != "sort" {
        return Err(RunError::type_err(format!("{name}() takes no keyword arguments")));
    }
    match recv {
        Value::Str(s) => str_method(heap, s, name, &args),
        Value::Ref(id) => match heap.get(*id) {
            ObjData::List(_) => list_method(heap, *id, name, args, kwargs),
            ObjData::Tuple(_) => tuple_method(heap, *id, name, &args),
            ObjData::Dict(_) => dict_method(heap, *id, name, args),
            ObjData::Set(_) => set_method(heap, *id, name, args),
            _ => Ok(None),
        },
        _ => Ok(None),
    }
}

fn wrong_args(name: &str, expected: &str, got: usize) -> RunError {
    RunError::type_err(format!("{name}() takes {expected} ({got} given)"))
}

fn str_method<T: ResourceTracker>(
    heap: &mut GuestHeap<T>,
    s: &str,
    name: &str,
    args: &[Value],
) -> RunResult<Option<Value>> {
    let no_args = |expected: usize| -> RunResult<()> {
        if args.len() == expected {
            Ok(())
        } else {
            Err(wrong_args(name, &format!("exactly {expected} arguments"), args.len()))
        }
    };
    let str_arg = |index: usize| -> RunResult<&str> {
        match args.get(index) {
            Some(Value::Str(v)) => Ok(v.as_ref()),
            Some(_) | None => Err(RunError::type_err(format!("{name}() argument must be a string"))),
        }
    };
    let result = match name {
        "upper" => {
            no_args(0)?;
            Value::str(s.to_uppercase())
        }
        "lower" => {
            no_args(0)?;
            Value::str(s.to_lowercase())
        }
        "strip" => {
            no_args(0)?;
            Value::str(s.trim())
        }
        "lstrip" => {
            no_args(0)?;
            Value::str(s.trim_start())
        }
        "rstrip" => {
            no_args(0)?;
            Value::str(s.trim_end())
        }
        "capitalize" => {
            no_args(0)?;
            let mut chars = s.chars();
            let capitalized = match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
                None => String::new(),
            };
            Value::str(capitalized)
        }
        "split" => {
            let parts: Vec<Value> = match args {
                [] => s.split_whitespace().map(Value::str).collect(),
                [Value::Str(sep)] => {
                    if sep.is_empty() {
                        return Err(RunError::value_err("empty separator"));
                    }
                    s.split(sep.as_ref()).map(Value::str).collect()
                }
                _ => return Err(wrong_args(name, "at most 1 argument", args.len())),
            };
            Value::Ref(heap.alloc(ObjData::List(parts))?)
        }
        "join" => {
            no_args(1)?;
            let values = iter_values(&args[0], heap)?;
            let mut parts = Vec::with_capacity(values.len());
            for value in &values {
                let Value::Str(part) = value else {
                    return Err(RunError::type_err(format!(
                        "sequence item: expected str instance, {} found",
                        value.type_name(heap)
                    )));
                };
                parts.push(part.to_string());
            }
            Value::str(parts.join(s))
        }
        "replace" => {
            no_args(2)?;
            let from = str_arg(0)?;
            let to = str_arg(1)?;
            Value::str(s.replace(from, to))
        }
        "startswith" => {
            no_args(1)?;
            Value::Bool(s.starts_with(str_arg(0)?))
        }
        "endswith" => {
            no_args(1)?;
            Value::Bool(s.ends_with(str_arg(0)?))
        }
        "find" => {
            no_args(1)?;
            let needle = str_arg(0)?;
            match s.find(needle) {
                Some(byte_index) => Value::Int(s[..byte_index].chars().count() as i64),
                None => Value::Int(-1),
            }
        }
        "index" => {
            no_args(1)?;
            let needle = str_arg(0)?;
            match s.find(needle) {
                Some(byte_index) => Value::Int(s[..byte_index].chars().count() as i64),
                None => return Err(RunError::value_err("substring not found")),
            }
        }
        "count" => {
            no_args(1)?;
            let needle = str_arg(0)?;
            if needle.is_empty() {
                Value::Int(s.chars().count() as i64 + 1)
            } else {
                Value::Int(s.matches(needle).count() as i64)
            }
        }
        "isdigit" => {
            no_args(0)?;
            Value::Bool(!s.is_empty() && s.chars().all(|c| c.is_ascii_digit()))
        }
        "isalpha" => {
            no_args(0)?;
            Value::Bool(!s.is_empty() && s.chars().all(char::is_alphabetic))
        }
        "isalnum" => {
            no_args(0)?;
            Value::Bool(!s.is_empty() && s.chars().all(char::is_alphanumeric))
        }
        _ => return Ok(None),
    };
    Ok(Some(result))
}

fn list_method<T: ResourceTracker>(
    heap: &mut GuestHeap<T>,
    id: crate::heap::ObjId,
    name: &str,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> RunResult<Option<Value>> {
    let result = match name {
        "append" => {
            let [value] = args.as_slice() else {
                return Err(wrong_args(name, "exactly one argument", args.len()));
            };
            heap.tracker.on_container_insert()?;
            let value = value.clone();
            let ObjData::List(items) = heap.get_mut(id) else { unreachable!() };
            items.push(value);
            Value::None
        }
        "extend" => {
            let [value] = args.as_slice() else {
                return Err(wrong_args(name, "exactly one argument", args.len()));
            };
            let new_items = iter_values(value, heap)?;
            for _ in &new_items {
                heap.tracker.on_container_insert()?;
            }
            let ObjData::List(items) = heap.get_mut(id) else { unreachable!() };
            items.extend(new_items);
            Value::None
        }
        "insert" => {
            let [Value::Int(index), value] = args.as_slice() else {
                return Err(RunError::type_err("insert() takes an index and a value"));
            };
            heap.tracker.on_container_insert()?;
            let value = value.clone();
            let index = *index;
            let ObjData::List(items) = heap.get_mut(id) else { unreachable!() };
            let len = items.len() as i64;
            let position = if index < 0 { (index + len).max(0) } else { index.min(len) };
            items.insert(position as usize, value);
            Value::None
        }
        "pop" => {
            let index = match args.as_slice() {
                [] => -1,
                [Value::Int(i)] => *i,
                _ => return Err(RunError::type_err("pop() takes an optional integer index")),
            };
            let ObjData::List(items) = heap.get_mut(id) else { unreachable!() };
            if items.is_empty() {
                return Err(RunError::exc(ExcKind::Index, "pop from empty list"));
            }
            let len = items.len() as i64;
            let position = if index < 0 { index + len } else { index };
            if position < 0 || position >= len {
                return Err(RunError::exc(ExcKind::Index, "pop index out of range"));
            }
            items.remove(position as usize)
        }
        "remove" => {
            let [value] = args.as_slice() else {
                return Err(wrong_args(name, "exactly one argument", args.len()));
            };
            let ObjData::List(items) = heap.get(id) else { unreachable!() };
            let snapshot = items.clone();
            let mut found = None;
            for (index, item) in snapshot.iter().enumerate() {
                if py_eq(value, item, heap, 0)? {
                    found = Some(index);
                    break;
                }
            }
            let Some(index) = found else {
                return Err(RunError::value_err("list.remove(x): x not in list"));
            };
            let ObjData::List(items) = heap.get_mut(id) else { unreachable!() };
            items.remove(index);
            Value::None
        }
        "index" => {
            let [value] = args.as_slice() else {
                return Err(wrong_args(name, "exactly one argument", args.len()));
            };
            let ObjData::List(items) = heap.get(id) else { unreachable!() };
            let snapshot = items.clone();
            for (index, item) in snapshot.iter().enumerate() {
                if py_eq(value, item, heap, 0)? {
                    return Ok(Some(Value::Int(index as i64)));
                }
            }
            return Err(RunError::value_err(format!("{} is not in list", value.py_repr(heap))));
        }
        "count" => {
            let [value] = args.as_slice() else {
                return Err(wrong_args(name, "exactly one argument", args.len()));
            };
            let ObjData::List(items) = heap.get(id) else { unreachable!() };
            let snapshot = items.clone();
            let mut count = 0;
            for item in &snapshot {
                if py_eq(value, item, heap, 0)? {
                    count += 1;
                }
            }
            Value::Int(count)
        }
        "sort" => {
            if !args.is_empty() {
                return Err(wrong_args(name, "no positional arguments", args.len()));
            }
            let mut reverse = false;
            for (kwname, kwvalue) in &kwargs {
                match kwname.as_str() {
                    "reverse" => reverse = kwvalue.truthy(heap),
                    _ => {
                        return Err(RunError::type_err(format!(
                            "sort() got an unexpected keyword argument '{kwname}'"
                        )));
                    }
                }
            }
            let ObjData::List(items) = heap.get(id) else { unreachable!() };
            let mut sorted = items.clone();
            sort_values(&mut sorted, heap)?;
            if reverse {
                sorted.reverse();
            }
            let ObjData::List(items) = heap.get_mut(id) else { unreachable!() };
            *items = sorted;
            Value::None
        }
        "reverse" => {
            let ObjData::List(items) = heap.get_mut(id) else { unreachable!() };
            items.reverse();
            Value::None
        }
        "clear" => {
            let ObjData::List(items) = heap.get_mut(id) else { unreachable!() };
            items.clear();
            Value::None
        }
        "copy" => {
            let ObjData::List(items) = heap.get(id) else { unreachable!() };
            let copied = items.clone();
            Value::Ref(heap.alloc(ObjData::List(copied))?)
        }
        _ => return Ok(None),
    };
    Ok(Some(result))
}

fn tuple_method<T: ResourceTracker>(
    heap: &mut GuestHeap<T>,
    id: crate::heap::ObjId,
    name: &str,
    args: &[Value],
) -> RunResult<Option<Value>> {
    let result = match name {
        "index" => {
            let [value] = args else {
                return Err(wrong_args(name, "exactly one argument", args.len()));
            };
            let ObjData::Tuple(items) = heap.get(id) else { unreachable!() };
            let snapshot = items.clone();
            for (index, item) in snapshot.iter().enumerate() {
                if py_eq(value, item, heap, 0)? {
                    return Ok(Some(Value::Int(index as i64)));
                }
            }
            return Err(RunError::value_err("tuple.index(x): x not in tuple"));
        }
        "count" => {
            let [value] = args else {
                return Err(wrong_args(name, "exactly one argument", args.len()));
            };
            let ObjData::Tuple(items) = heap.get(id) else { unreachable!() };
            let snapshot = items.clone();
            let mut count = 0;
            for item in &snapshot {
                if py_eq(value, item, heap, 0)? {
                    count += 1;
                }
            }
            Value::Int(count)
        }
        _ => return Ok(None),
    };
    Ok(Some(result))
}

fn dict_method<T: ResourceTracker>(
    heap: &mut GuestHeap<T>,
    id: crate::heap::ObjId,
    name: &str,
    args: Vec<Value>,
) -> RunResult<Option<Value>> {
    let result = match name {
        "get" => {
            let (key, default) = match args.as_slice() {
                [key] => (key, Value::None),
                [key, default] => (key, default.clone()),
                _ => return Err(wrong_args(name, "1 or 2 arguments", args.len())),
            };
            let key = hashable(key, heap)?;
            let ObjData::Dict(entries) = heap.get(id) else { unreachable!() };
            entries.get(&key).cloned().unwrap_or(default)
        }
        "keys" => {
            let ObjData::Dict(entries) = heap.get(id) else { unreachable!() };
            let keys: Vec<Value> = entries.keys().map(key_to_value).collect();
            Value::Ref(heap.alloc(ObjData::List(keys))?)
        }
        "values" => {
            let ObjData::Dict(entries) = heap.get(id) else { unreachable!() };
            let values: Vec<Value> = entries.values().cloned().collect();
            Value::Ref(heap.alloc(ObjData::List(values))?)
        }
        "items" => {
            let ObjData::Dict(entries) = heap.get(id) else { unreachable!() };
            let pairs: Vec<(Value, Value)> = entries
                .iter()
                .map(|(k, v)| (key_to_value(k), v.clone()))
                .collect();
            let mut out = Vec::with_capacity(pairs.len());
            for (key, value) in pairs {
                out.push(Value::Ref(heap.alloc(ObjData::Tuple(vec![key, value]))?));
            }
            Value::Ref(heap.alloc(ObjData::List(out))?)
        }
        "pop" => {
            let (key, default) = match args.as_slice() {
                [key] => (key, None),
                [key, default] => (key, Some(default.clone())),
                _ => return Err(wrong_args(name, "1 or 2 arguments", args.len())),
            };
            let display = key.py_repr(heap);
            let key = hashable(key, heap)?;
            let ObjData::Dict(entries) = heap.get_mut(id) else { unreachable!() };
            match entries.shift_remove(&key) {
                Some(value) => value,
                None => default.ok_or_else(|| RunError::exc(ExcKind::Key, display))?,
            }
        }
        "setdefault" => {
            let (key, default) = match args.as_slice() {
                [key] => (key, Value::None),
                [key, default] => (key, default.clone()),
                _ => return Err(wrong_args(name, "1 or 2 arguments", args.len())),
            };
            let key = hashable(key, heap)?;
            heap.tracker.on_container_insert()?;
            let ObjData::Dict(entries) = heap.get_mut(id) else { unreachable!() };
            entries.entry(key).or_insert(default).clone()
        }
        "update" => {
            let [Value::Ref(other)] = args.as_slice() else {
                return Err(RunError::type_err("update() argument must be a dict"));
            };
            let ObjData::Dict(other_entries) = heap.get(*other) else {
                return Err(RunError::type_err("update() argument must be a dict"));
            };
            let incoming = other_entries.clone();
            for _ in &incoming {
                heap.tracker.on_container_insert()?;
            }
            let ObjData::Dict(entries) = heap.get_mut(id) else { unreachable!() };
            entries.extend(incoming);
            Value::None
        }
        "clear" => {
            let ObjData::Dict(entries) = heap.get_mut(id) else { unreachable!() };
            entries.clear();
            Value::None
        }
        "copy" => {
            let ObjData::Dict(entries) = heap.get(id) else { unreachable!() };
            let copied = entries.clone();
            Value::Ref(heap.alloc(ObjData::Dict(copied))?)
        }
        _ => return Ok(None),
    };
    Ok(Some(result))
}

fn set_method<T: ResourceTracker>(
    heap: &mut GuestHeap<T>,
    id: crate::heap::ObjId,
    name: &str,
    args: Vec<Value>,
) -> RunResult<Option<Value>> {
    let one_arg = || -> RunResult<&Value> {
        match args.as_slice() {
            [value] => Ok(value),
            _ => Err(wrong_args(name, "exactly one argument", args.len())),
        }
    };
    let other_entries = |heap: &GuestHeap<T>, value: &Value| -> RunResult<IndexMap<DictKey, Value>> {
        let values = iter_values(value, heap)?;
        let mut entries = IndexMap::new();
        for item in values {
            entries.insert(hashable(&item, heap)?, item);
        }
        Ok(entries)
    };
    let result = match name {
        "add" => {
            let value = one_arg()?.clone();
            let key = hashable(&value, heap)?;
            heap.tracker.on_container_insert()?;
            let ObjData::Set(entries) = heap.get_mut(id) else { unreachable!() };
            entries.insert(key, value);
            Value::None
        }
        "remove" => {
            let value = one_arg()?;
            let display = value.py_repr(heap);
            let key = hashable(value, heap)?;
            let ObjData::Set(entries) = heap.get_mut(id) else { unreachable!() };
            if entries.shift_remove(&key).is_none() {
                return Err(RunError::exc(ExcKind::Key, display));
            }
            Value::None
        }
        "discard" => {
            let key = hashable(one_arg()?, heap)?;
            let ObjData::Set(entries) = heap.get_mut(id) else { unreachable!() };
            entries.shift_remove(&key);
            Value::None
        }
        "union" => {
            let incoming = other_entries(heap, one_arg()?)?;
            let ObjData::Set(entries) = heap.get(id) else { unreachable!() };
            let mut merged = entries.clone();
            merged.extend(incoming);
            Value::Ref(heap.alloc(ObjData::Set(merged))?)
        }
        "intersection" => {
            let incoming = other_entries(heap, one_arg()?)?;
            let ObjData::Set(entries) = heap.get(id) else { unreachable!() };
            let kept: IndexMap<DictKey, Value> = entries
                .iter()
                .filter(|(k, _)| incoming.contains_key(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Value::Ref(heap.alloc(ObjData::Set(kept))?)
        }
        "difference" => {
            let incoming = other_entries(heap, one_arg()?)?;
            let ObjData::Set(entries) = heap.get(id) else { unreachable!() };
            let kept: IndexMap<DictKey, Value> = entries
                .iter()
                .filter(|(k, _)| !incoming.contains_key(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Value::Ref(heap.alloc(ObjData::Set(kept))?)
        }
        "clear" => {
            let ObjData::Set(entries) = heap.get_mut(id) else { unreachable!() };
            entries.clear();
            Value::None
        }
        "copy" => {
            let ObjData::Set(entries) = heap.get(id) else { unreachable!() };
            let copied = entries.clone();
            Value::Ref(heap.alloc(ObjData::Set(copied))?)
        }
        _ => return Ok(None),
    };
    Ok(Some(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    #[test]
    fn append_mutates_in_place() {
        let mut heap = GuestHeap::new(NoLimitTracker);
        let id = heap.alloc(ObjData::List(vec![Value::Int(1)])).unwrap();
        call_type_method(&mut heap, &Value::Ref(id), "append", vec![Value::Int(2)], vec![])
            .unwrap()
            .unwrap();
        let ObjData::List(items) = heap.get(id) else { unreachable!() };
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn unknown_method_returns_none() {
        let mut heap = GuestHeap::new(NoLimitTracker);
        let id = heap.alloc(ObjData::List(vec![])).unwrap();
        assert!(
            call_type_method(&mut heap, &Value::Ref(id), "no_such", vec![], vec![])
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn str_methods() {
        let mut heap = GuestHeap::new(NoLimitTracker);
        let s = Value::str("a,b,c");
        let Some(Value::Ref(id)) = call_type_method(&mut heap, &s, "split", vec![Value::str(",")], vec![]).unwrap()
        else {
            panic!("split returns a list");
        };
        let ObjData::List(items) = heap.get(id) else { unreachable!() };
        assert_eq!(items.len(), 3);

        let joined = call_type_method(&mut heap, &Value::str("-"), "join", vec![Value::Ref(id)], vec![])
            .unwrap()
            .unwrap();
        assert!(matches!(joined, Value::Str(s) if s.as_ref() == "a-b-c"));
    }

    #[test]
    fn dict_pop_raises_key_error() {
        let mut heap = GuestHeap::new(NoLimitTracker);
        let id = heap.alloc(ObjData::Dict(IndexMap::new())).unwrap();
        let err = call_type_method(&mut heap, &Value::Ref(id), "pop", vec![Value::str("k")], vec![]).unwrap_err();
        assert!(matches!(err, RunError::Exc(e) if e.kind == ExcKind::Key));
    }
}
