//! Classification and serialization of guest values for trace snapshots.
//!
//! Two forms are produced for every value: a *display* form (a truncated
//! printable string) and a *structural* form ([`ValueRepr`]) in which
//! heap-kind children are `{ref, kind}` links rather than inlined. The split
//! is what keeps aliasing and cycles representable in a finite snapshot.
//!
//! Caps: inline strings truncate at 100 characters with a `...` marker,
//! containers serialize at most 50 elements plus an ellipsis entry, dict
//! keys are stringified and cut at 50 characters, display strings are cut
//! at 200.

use indexmap::IndexMap;

use crate::{
    heap::{GuestHeap, ObjData, ObjId},
    registry::HeapRegistry,
    resource::ResourceTracker,
    trace::{HeapObject, ValueRepr, Variable, VariableKind},
    value::Value,
};

/// Inline strings longer than this are truncated with a `...` marker.
const MAX_INLINE_STR: usize = 100;
/// Containers serialize at most this many elements.
const MAX_ELEMENTS: usize = 50;
/// Dict keys are stringified and cut at this length.
const MAX_KEY_LEN: usize = 50;
/// Display strings are cut at this length.
const MAX_DISPLAY: usize = 200;

/// Marker appended (or inserted) where serialization was truncated.
const ELLIPSIS: &str = "...";

/// Maps a guest value to its kind tag (C1).
pub(crate) fn classify(value: &Value, heap: &GuestHeap<impl ResourceTracker>) -> VariableKind {
    match value {
        Value::None => VariableKind::None,
        Value::Bool(_) => VariableKind::Bool,
        Value::Int(_) => VariableKind::Int,
        Value::Float(_) => VariableKind::Float,
        Value::Str(_) => VariableKind::Str,
        Value::Range { .. } => VariableKind::Other,
        Value::Builtin(_) | Value::ModuleFn(_) | Value::BoundMethod { .. } => VariableKind::Function,
        Value::Module(_) => VariableKind::Module,
        Value::ExcType(_) => VariableKind::Class,
        Value::Exception(_) => VariableKind::Other,
        Value::Ref(id) => match heap.get(*id) {
            ObjData::List(_) => VariableKind::List,
            ObjData::Tuple(_) => VariableKind::Tuple,
            ObjData::Dict(_) => VariableKind::Dict,
            ObjData::Set(_) => VariableKind::Set,
            ObjData::Function(_) => VariableKind::Function,
            ObjData::Class(_) => VariableKind::Class,
            ObjData::Instance(_) => VariableKind::Instance,
        },
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_owned()
    } else {
        s.chars().take(max).collect()
    }
}

/// JSON numbers must be finite; non-finite floats degrade to strings.
fn float_repr_value(f: f64) -> ValueRepr {
    if f.is_finite() {
        ValueRepr::Float(f)
    } else {
        ValueRepr::Str(crate::value::float_repr(f))
    }
}

/// Serializes one value as it appears inside a container or payload:
/// heap kinds become `{ref, kind}` links (registering the object), scalars
/// and opaque values are inlined (C3).
pub(crate) fn element_repr(
    value: &Value,
    heap: &GuestHeap<impl ResourceTracker>,
    registry: &mut HeapRegistry,
) -> ValueRepr {
    let kind = classify(value, heap);
    if kind.is_heap() {
        let Value::Ref(id) = value else {
            unreachable!("heap kinds are always refs");
        };
        return ValueRepr::Ref {
            target: registry.id_for(*id),
            kind,
        };
    }
    inline_repr(value, heap)
}

/// Inline (non-ref) form of a non-heap value.
fn inline_repr(value: &Value, heap: &GuestHeap<impl ResourceTracker>) -> ValueRepr {
    match value {
        Value::None => ValueRepr::None,
        Value::Bool(b) => ValueRepr::Bool(*b),
        Value::Int(i) => ValueRepr::Int(*i),
        Value::Float(f) => float_repr_value(*f),
        Value::Str(s) => {
            if s.chars().count() > MAX_INLINE_STR {
                let truncated: String = s.chars().take(MAX_INLINE_STR).collect();
                ValueRepr::Str(truncated + ELLIPSIS)
            } else {
                ValueRepr::Str(s.to_string())
            }
        }
        Value::Ref(id) => match heap.get(*id) {
            ObjData::Function(def) => function_shape(&def.name, &def.params),
            ObjData::Class(class) => {
                let mut entries = IndexMap::new();
                entries.insert("name".to_owned(), ValueRepr::Str(class.name.clone()));
                ValueRepr::Entries(entries)
            }
            _ => ValueRepr::Str(truncate_chars(&value.py_repr(heap), MAX_DISPLAY)),
        },
        _ => ValueRepr::Str(truncate_chars(&value.py_repr(heap), MAX_DISPLAY)),
    }
}

/// The `{name, args}` shape reported for functions.
fn function_shape(name: &str, params: &[String]) -> ValueRepr {
    let args = match params.len() {
        0 => "()".to_owned(),
        1 => format!("('{}',)", params[0]),
        _ => {
            let quoted: Vec<String> = params.iter().map(|p| format!("'{p}'")).collect();
            format!("({})", quoted.join(", "))
        }
    };
    let mut entries = IndexMap::new();
    entries.insert("name".to_owned(), ValueRepr::Str(name.to_owned()));
    entries.insert("args".to_owned(), ValueRepr::Str(args));
    ValueRepr::Entries(entries)
}

/// Materializes the serialized form of one registered heap object (C3).
///
/// Registers any heap-kind children it encounters, so a snapshot pass keeps
/// draining the registry until every reachable object is serialized.
fn build_heap_object(
    obj: ObjId,
    id: u32,
    heap: &GuestHeap<impl ResourceTracker>,
    registry: &mut HeapRegistry,
) -> HeapObject {
    let value = Value::Ref(obj);
    let kind = classify(&value, heap);
    let type_name = value.type_name(heap);
    let display = truncate_chars(&value.py_repr(heap), MAX_DISPLAY);
    let mut references: Vec<u32> = Vec::new();
    let mut push_ref = |registry: &mut HeapRegistry, heap: &GuestHeap<_>, child: &Value| {
        if classify(child, heap).is_heap()
            && let Value::Ref(child_id) = child
        {
            references.push(registry.id_for(*child_id));
        }
    };

    let (structure, length) = match heap.get(obj) {
        ObjData::List(items) | ObjData::Tuple(items) => {
            let mut out = Vec::with_capacity(items.len().min(MAX_ELEMENTS + 1));
            for (index, item) in items.iter().enumerate() {
                if index >= MAX_ELEMENTS {
                    out.push(ValueRepr::Str(ELLIPSIS.to_owned()));
                    break;
                }
                out.push(element_repr(item, heap, registry));
            }
            for item in items {
                push_ref(registry, heap, item);
            }
            (Some(ValueRepr::Items(out)), Some(items.len()))
        }
        ObjData::Set(entries) => {
            let mut out = Vec::with_capacity(entries.len().min(MAX_ELEMENTS + 1));
            for (index, item) in entries.values().enumerate() {
                if index >= MAX_ELEMENTS {
                    out.push(ValueRepr::Str(ELLIPSIS.to_owned()));
                    break;
                }
                out.push(element_repr(item, heap, registry));
            }
            for item in entries.values() {
                push_ref(registry, heap, item);
            }
            (Some(ValueRepr::Items(out)), Some(entries.len()))
        }
        ObjData::Dict(entries) => {
            let mut out = IndexMap::new();
            for (index, (key, item)) in entries.iter().enumerate() {
                if index >= MAX_ELEMENTS {
                    out.insert(ELLIPSIS.to_owned(), ValueRepr::Str(ELLIPSIS.to_owned()));
                    break;
                }
                out.insert(truncate_chars(&key.display(), MAX_KEY_LEN), element_repr(item, heap, registry));
            }
            for item in entries.values() {
                push_ref(registry, heap, item);
            }
            (Some(ValueRepr::Entries(out)), Some(entries.len()))
        }
        ObjData::Function(def) => (Some(function_shape(&def.name, &def.params)), None),
        ObjData::Class(class) => {
            let mut entries = IndexMap::new();
            entries.insert("name".to_owned(), ValueRepr::Str(class.name.clone()));
            (Some(ValueRepr::Entries(entries)), None)
        }
        ObjData::Instance(instance) => {
            // Only the class name is reported; nested state is reachable
            // through the one-hop references below.
            let mut shape = IndexMap::new();
            shape.insert("class".to_owned(), ValueRepr::Str(heap.class_name(instance.class)));
            for item in instance.attrs.values() {
                push_ref(registry, heap, item);
            }
            (Some(ValueRepr::Entries(shape)), None)
        }
    };

    references.sort_unstable();
    references.dedup();

    HeapObject {
        id,
        kind,
        type_name,
        display,
        structure,
        length,
        size_bytes: Some(heap.size_of(obj)),
        references,
    }
}

/// Serializes the full current heap registry (C2's snapshot).
///
/// Every registered object is re-serialized so the snapshot reflects
/// mutations since the previous step; children discovered along the way are
/// registered and serialized in the same pass.
pub(crate) fn snapshot_heap(
    registry: &mut HeapRegistry,
    heap: &GuestHeap<impl ResourceTracker>,
) -> Vec<HeapObject> {
    let mut objects = Vec::with_capacity(registry.len());
    let mut index = 0;
    while index < registry.len() {
        let obj = registry.entry_at(index);
        let id = index as u32 + 1;
        objects.push(build_heap_object(obj, id, heap, registry));
        index += 1;
    }
    objects
}

/// Builds the trace form of one name binding (C1 + C3).
pub(crate) fn make_variable(
    name: &str,
    value: &Value,
    heap: &GuestHeap<impl ResourceTracker>,
    registry: &mut HeapRegistry,
) -> Variable {
    let kind = classify(value, heap);
    let type_name = value.type_name(heap);
    let length = crate::ops::py_len(value, heap);
    if kind.is_heap() {
        let Value::Ref(id) = value else {
            unreachable!("heap kinds are always refs");
        };
        let heap_id = registry.id_for(*id);
        Variable {
            name: name.to_owned(),
            kind,
            type_name: type_name.clone(),
            display: ValueRepr::Str(format!("ref:{heap_id}")),
            heap_id: Some(heap_id),
            length,
            is_mutable: kind.is_mutable(),
            is_sequence: kind.is_sequence(),
            repr: format!("<{type_name} ref={heap_id}>"),
        }
    } else {
        Variable {
            name: name.to_owned(),
            kind,
            type_name,
            display: inline_repr(value, heap),
            heap_id: None,
            length,
            is_mutable: kind.is_mutable(),
            is_sequence: kind.is_sequence(),
            repr: truncate_chars(&value.py_repr(heap), MAX_DISPLAY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    fn heap() -> GuestHeap<NoLimitTracker> {
        GuestHeap::new(NoLimitTracker)
    }

    #[test]
    fn scalars_classify_inline() {
        let heap = heap();
        assert_eq!(classify(&Value::Int(1), &heap), VariableKind::Int);
        assert_eq!(classify(&Value::None, &heap), VariableKind::None);
        assert_eq!(
            classify(&Value::Range { start: 0, stop: 3, step: 1 }, &heap),
            VariableKind::Other
        );
    }

    #[test]
    fn long_strings_truncate_with_marker() {
        let heap = heap();
        let long = "x".repeat(101);
        let ValueRepr::Str(s) = inline_repr(&Value::str(long), &heap) else {
            panic!("strings inline as strings");
        };
        assert_eq!(s.chars().count(), 103);
        assert!(s.ends_with("..."));

        // Exactly 100 characters stays untouched.
        let exact = "x".repeat(100);
        let ValueRepr::Str(s) = inline_repr(&Value::str(exact.clone()), &heap) else {
            panic!("strings inline as strings");
        };
        assert_eq!(s, exact);
    }

    #[test]
    fn containers_cap_at_fifty_elements() {
        let mut heap = heap();
        let items: Vec<Value> = (0..60).map(Value::Int).collect();
        let id = heap.alloc(ObjData::List(items)).unwrap();
        let mut registry = HeapRegistry::new();
        registry.id_for(id);
        let objects = snapshot_heap(&mut registry, &heap);
        let Some(ValueRepr::Items(items)) = &objects[0].structure else {
            panic!("list structure is a sequence");
        };
        assert_eq!(items.len(), 51);
        assert_eq!(items[50], ValueRepr::Str("...".to_owned()));
        assert_eq!(objects[0].length, Some(60));
    }

    #[test]
    fn nested_children_become_refs_and_references() {
        let mut heap = heap();
        let inner = heap.alloc(ObjData::List(vec![Value::Int(1)])).unwrap();
        let outer = heap
            .alloc(ObjData::List(vec![Value::Ref(inner), Value::Int(2)]))
            .unwrap();
        let mut registry = HeapRegistry::new();
        registry.id_for(outer);
        let objects = snapshot_heap(&mut registry, &heap);
        // The child was discovered and serialized in the same pass.
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].references, vec![2]);
        let Some(ValueRepr::Items(items)) = &objects[0].structure else {
            panic!("list structure is a sequence");
        };
        assert_eq!(
            items[0],
            ValueRepr::Ref {
                target: 2,
                kind: VariableKind::List
            }
        );
        assert_eq!(items[1], ValueRepr::Int(2));
    }

    #[test]
    fn cycles_are_finite() {
        let mut heap = heap();
        let id = heap.alloc(ObjData::List(vec![])).unwrap();
        let ObjData::List(items) = heap.get_mut(id) else {
            unreachable!()
        };
        items.push(Value::Ref(id));
        let mut registry = HeapRegistry::new();
        registry.id_for(id);
        let objects = snapshot_heap(&mut registry, &heap);
        assert_eq!(objects.len(), 1);
        // The self-reference points back at the object's own id.
        assert_eq!(objects[0].references, vec![1]);
    }

    #[test]
    fn heap_variable_shows_ref() {
        let mut heap = heap();
        let id = heap.alloc(ObjData::List(vec![Value::Int(1)])).unwrap();
        let mut registry = HeapRegistry::new();
        let variable = make_variable("xs", &Value::Ref(id), &heap, &mut registry);
        assert_eq!(variable.heap_id, Some(1));
        assert_eq!(variable.display, ValueRepr::Str("ref:1".to_owned()));
        assert_eq!(variable.repr, "<list ref=1>");
        assert!(variable.is_mutable);
        assert!(variable.is_sequence);
        assert_eq!(variable.length, Some(1));
    }

    #[test]
    fn dict_keys_stringify_and_cap() {
        let mut heap = heap();
        let mut entries = IndexMap::new();
        entries.insert(crate::heap::DictKey::Str("k".repeat(60)), Value::Int(1));
        entries.insert(crate::heap::DictKey::Int(7), Value::Int(2));
        let id = heap.alloc(ObjData::Dict(entries)).unwrap();
        let mut registry = HeapRegistry::new();
        registry.id_for(id);
        let objects = snapshot_heap(&mut registry, &heap);
        let Some(ValueRepr::Entries(map)) = &objects[0].structure else {
            panic!("dict structure is a map");
        };
        let keys: Vec<&String> = map.keys().collect();
        assert_eq!(keys[0].chars().count(), 50);
        assert_eq!(keys[1], "7");
    }
}
