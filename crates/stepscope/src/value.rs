//! Runtime representation of guest values.
//!
//! Small immediate values (ints, floats, bools, strings) are stored inline;
//! everything with identity (lists, tuples, dicts, sets, functions, classes,
//! instances) lives in the guest heap arena and is referenced via
//! [`Ref`](Value::Ref). Strings are immutable in the guest language, so an
//! `Rc<str>` clone preserves observable semantics without heap identity.

use std::rc::Rc;

use crate::{
    builtins::Builtin,
    exc::ExcKind,
    heap::{GuestHeap, ObjData, ObjId},
    modules::{GuestModule, ModuleFn},
    resource::ResourceTracker,
};

/// Depth ceiling for recursive value operations (repr, equality).
///
/// Protects against stack overflow on deeply nested data like
/// `for _ in range(1000): a = [a]`. Cycles are handled separately by an
/// identity guard during repr.
pub(crate) const MAX_DATA_DEPTH: usize = 100;

/// A guest value.
#[derive(Debug, Clone)]
pub(crate) enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    /// Lazy integer range, as produced by `range()`.
    Range { start: i64, stop: i64, step: i64 },
    /// A whitelisted builtin function or type constructor.
    Builtin(Builtin),
    /// An imported guest module.
    Module(GuestModule),
    /// A function belonging to a guest module (e.g. `math.sqrt`).
    ModuleFn(ModuleFn),
    /// An exception type name such as `ValueError`, callable to construct an
    /// exception value.
    ExcType(ExcKind),
    /// A constructed or caught exception value.
    Exception(Rc<ExcValue>),
    /// A method bound to an instance.
    BoundMethod { recv: ObjId, func: ObjId },
    /// Reference into the guest heap arena.
    Ref(ObjId),
}

/// Payload of a constructed exception value.
#[derive(Debug)]
pub(crate) struct ExcValue {
    pub kind: ExcKind,
    pub message: String,
}

impl Value {
    pub fn str(text: impl Into<Rc<str>>) -> Self {
        Self::Str(text.into())
    }

    /// Python truthiness.
    pub fn truthy(&self, heap: &GuestHeap<impl ResourceTracker>) -> bool {
        match self {
            Self::None => false,
            Self::Bool(b) => *b,
            Self::Int(i) => *i != 0,
            Self::Float(f) => *f != 0.0,
            Self::Str(s) => !s.is_empty(),
            Self::Range { .. } => self.range_len().is_some_and(|len| len > 0),
            Self::Ref(id) => match heap.get(*id) {
                ObjData::List(items) | ObjData::Tuple(items) => !items.is_empty(),
                ObjData::Dict(entries) => !entries.is_empty(),
                ObjData::Set(entries) => !entries.is_empty(),
                ObjData::Function(_) | ObjData::Class(_) | ObjData::Instance(_) => true,
            },
            Self::Builtin(_) | Self::Module(_) | Self::ModuleFn(_) | Self::ExcType(_) => true,
            Self::Exception(_) | Self::BoundMethod { .. } => true,
        }
    }

    /// Number of elements a `range` yields, or `None` for other values.
    ///
    /// Computed in 128-bit arithmetic so extreme bounds cannot overflow;
    /// the result saturates at `i64::MAX`.
    pub fn range_len(&self) -> Option<i64> {
        let Self::Range { start, stop, step } = self else {
            return None;
        };
        let (start, stop, step) = (i128::from(*start), i128::from(*stop), i128::from(*step));
        let count = if step > 0 {
            ((stop - start).max(0) + step - 1) / step
        } else {
            ((start - stop).max(0) + (-step) - 1) / (-step)
        };
        Some(i64::try_from(count).unwrap_or(i64::MAX))
    }

    /// The guest type's display name, as `type(x).__name__` would show it.
    pub fn type_name(&self, heap: &GuestHeap<impl ResourceTracker>) -> String {
        match self {
            Self::None => "NoneType".to_owned(),
            Self::Bool(_) => "bool".to_owned(),
            Self::Int(_) => "int".to_owned(),
            Self::Float(_) => "float".to_owned(),
            Self::Str(_) => "str".to_owned(),
            Self::Range { .. } => "range".to_owned(),
            Self::Builtin(b) => {
                if b.is_type() {
                    "type".to_owned()
                } else {
                    "builtin_function_or_method".to_owned()
                }
            }
            Self::Module(_) => "module".to_owned(),
            Self::ModuleFn(_) => "builtin_function_or_method".to_owned(),
            Self::ExcType(_) => "type".to_owned(),
            Self::Exception(exc) => exc.kind.name().to_owned(),
            Self::BoundMethod { .. } => "method".to_owned(),
            Self::Ref(id) => match heap.get(*id) {
                ObjData::List(_) => "list".to_owned(),
                ObjData::Tuple(_) => "tuple".to_owned(),
                ObjData::Dict(_) => "dict".to_owned(),
                ObjData::Set(_) => "set".to_owned(),
                ObjData::Function(_) => "function".to_owned(),
                ObjData::Class(_) => "type".to_owned(),
                ObjData::Instance(instance) => heap.class_name(instance.class),
            },
        }
    }

    /// `str()` form.
    pub fn py_str(&self, heap: &GuestHeap<impl ResourceTracker>) -> String {
        match self {
            Self::Str(s) => s.to_string(),
            Self::Exception(exc) => exc.message.clone(),
            _ => self.py_repr(heap),
        }
    }

    /// `repr()` form, with cycle protection.
    pub fn py_repr(&self, heap: &GuestHeap<impl ResourceTracker>) -> String {
        let mut seen = Vec::new();
        self.repr_inner(heap, &mut seen, 0)
    }

    fn repr_inner(&self, heap: &GuestHeap<impl ResourceTracker>, seen: &mut Vec<ObjId>, depth: usize) -> String {
        if depth > MAX_DATA_DEPTH {
            return "...".to_owned();
        }
        match self {
            Self::None => "None".to_owned(),
            Self::Bool(true) => "True".to_owned(),
            Self::Bool(false) => "False".to_owned(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => float_repr(*f),
            Self::Str(s) => str_repr(s),
            Self::Range { start, stop, step } => {
                if *step == 1 {
                    format!("range({start}, {stop})")
                } else {
                    format!("range({start}, {stop}, {step})")
                }
            }
            Self::Builtin(b) => {
                if b.is_type() {
                    format!("<class '{}'>", b.name())
                } else {
                    format!("<built-in function {}>", b.name())
                }
            }
            Self::Module(m) => format!("<module '{}'>", m.name()),
            Self::ModuleFn(f) => format!("<built-in function {}>", f.name()),
            Self::ExcType(kind) => format!("<class '{}'>", kind.name()),
            Self::Exception(exc) => format!("{}({})", exc.kind.name(), str_repr(&exc.message)),
            Self::BoundMethod { func, .. } => match heap.get(*func) {
                ObjData::Function(def) => format!("<bound method {}>", def.name),
                _ => "<bound method>".to_owned(),
            },
            Self::Ref(id) => {
                if seen.contains(id) {
                    return match heap.get(*id) {
                        ObjData::List(_) => "[...]".to_owned(),
                        ObjData::Tuple(_) => "(...)".to_owned(),
                        _ => "{...}".to_owned(),
                    };
                }
                seen.push(*id);
                let repr = match heap.get(*id) {
                    ObjData::List(items) => {
                        let parts: Vec<String> =
                            items.iter().map(|v| v.repr_inner(heap, seen, depth + 1)).collect();
                        format!("[{}]", parts.join(", "))
                    }
                    ObjData::Tuple(items) => {
                        let parts: Vec<String> =
                            items.iter().map(|v| v.repr_inner(heap, seen, depth + 1)).collect();
                        if parts.len() == 1 {
                            format!("({},)", parts[0])
                        } else {
                            format!("({})", parts.join(", "))
                        }
                    }
                    ObjData::Dict(entries) => {
                        let parts: Vec<String> = entries
                            .iter()
                            .map(|(k, v)| format!("{}: {}", k.py_repr(), v.repr_inner(heap, seen, depth + 1)))
                            .collect();
                        format!("{{{}}}", parts.join(", "))
                    }
                    ObjData::Set(entries) => {
                        if entries.is_empty() {
                            "set()".to_owned()
                        } else {
                            let parts: Vec<String> =
                                entries.values().map(|v| v.repr_inner(heap, seen, depth + 1)).collect();
                            format!("{{{}}}", parts.join(", "))
                        }
                    }
                    ObjData::Function(def) => format!("<function {}>", def.name),
                    ObjData::Class(class) => format!("<class '{}'>", class.name),
                    ObjData::Instance(instance) => format!("<{} object>", heap.class_name(instance.class)),
                };
                seen.pop();
                repr
            }
        }
    }
}

/// Python-style float repr: shortest round-trip form, always with a decimal
/// point or exponent (`1.0`, not `1`).
pub(crate) fn float_repr(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_owned();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf".to_owned() } else { "-inf".to_owned() };
    }
    let mut buffer = ryu::Buffer::new();
    fix_ryu_exponent(buffer.format(f))
}

/// Fixes ryu's exponent format to match CPython.
///
/// ryu produces "1e20" but CPython uses "1e+20" for positive exponents.
/// Also ensures ".0" suffix for numbers like "3" -> "3.0".
fn fix_ryu_exponent(s: &str) -> String {
    if let Some(e_pos) = s.find('e') {
        let (mantissa, exp_part) = s.split_at(e_pos);
        let exp = &exp_part[1..];

        // No sign in ryu output means a positive exponent.
        if !exp.starts_with('-') {
            return format!("{mantissa}e+{exp}");
        }
        return s.to_owned();
    }

    // No exponent - ensure it has a decimal point
    if !s.contains('.') {
        return format!("{s}.0");
    }

    s.to_owned()
}

/// Python-style single-quoted string repr.
pub(crate) fn str_repr(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        match ch {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(ch),
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{heap::DictKey, resource::NoLimitTracker};

    fn heap() -> GuestHeap<NoLimitTracker> {
        GuestHeap::new(NoLimitTracker)
    }

    #[test]
    fn scalar_reprs() {
        let heap = heap();
        assert_eq!(Value::Int(42).py_repr(&heap), "42");
        assert_eq!(Value::Float(1.0).py_repr(&heap), "1.0");
        assert_eq!(Value::Float(0.1).py_repr(&heap), "0.1");
        assert_eq!(Value::Bool(true).py_repr(&heap), "True");
        assert_eq!(Value::None.py_repr(&heap), "None");
        assert_eq!(Value::str("a'b\n").py_repr(&heap), "'a\\'b\\n'");
    }

    #[test]
    fn float_repr_positive_exponents_carry_a_sign() {
        let heap = heap();
        assert_eq!(Value::Float(1e20).py_repr(&heap), "1e+20");
        assert_eq!(Value::Float(-2.5e30).py_repr(&heap), "-2.5e+30");
    }

    #[test]
    fn container_reprs() {
        let mut heap = heap();
        let inner = heap.alloc(ObjData::List(vec![Value::Int(1), Value::Int(2)])).unwrap();
        let outer = heap
            .alloc(ObjData::Tuple(vec![Value::Ref(inner), Value::str("x")]))
            .unwrap();
        assert_eq!(Value::Ref(outer).py_repr(&heap), "([1, 2], 'x')");

        let mut entries = indexmap::IndexMap::new();
        entries.insert(DictKey::Str("k".to_owned()), Value::Int(3));
        let dict = heap.alloc(ObjData::Dict(entries)).unwrap();
        assert_eq!(Value::Ref(dict).py_repr(&heap), "{'k': 3}");
    }

    #[test]
    fn cyclic_repr_terminates() {
        let mut heap = heap();
        let id = heap.alloc(ObjData::List(vec![])).unwrap();
        let ObjData::List(items) = heap.get_mut(id) else {
            unreachable!()
        };
        items.push(Value::Ref(id));
        assert_eq!(Value::Ref(id).py_repr(&heap), "[[...]]");
    }

    #[test]
    fn range_len() {
        let r = Value::Range {
            start: 0,
            stop: 10,
            step: 3,
        };
        assert_eq!(r.range_len(), Some(4));
        let backwards = Value::Range {
            start: 10,
            stop: 0,
            step: -2,
        };
        assert_eq!(backwards.range_len(), Some(5));
        let empty = Value::Range {
            start: 5,
            stop: 5,
            step: 1,
        };
        assert_eq!(empty.range_len(), Some(0));
    }
}
