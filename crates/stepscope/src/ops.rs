//! Operator semantics shared by the interpreter and the builtin functions.
//!
//! Arithmetic follows Python: `/` always produces a float, `//` and `%`
//! floor toward negative infinity, int overflow raises `OverflowError`
//! rather than wrapping.

use std::cmp::Ordering;

use crate::{
    exc::{ExcKind, RunError, RunResult},
    heap::{DictKey, GuestHeap, ObjData},
    lower::{BinOpKind, CmpOpKind},
    resource::ResourceTracker,
    value::{MAX_DATA_DEPTH, Value},
};

/// Applies a binary operator.
pub(crate) fn binary_op(
    op: BinOpKind,
    left: &Value,
    right: &Value,
    heap: &mut GuestHeap<impl ResourceTracker>,
) -> RunResult<Value> {
    match op {
        BinOpKind::Add => add(left, right, heap),
        BinOpKind::Sub => arith(op, left, right, i64::checked_sub, |a, b| a - b, heap),
        BinOpKind::Mul => mul(left, right, heap),
        BinOpKind::Div => divide(left, right, heap),
        BinOpKind::FloorDiv => floor_div(left, right, heap),
        BinOpKind::Mod => modulo(left, right, heap),
        BinOpKind::Pow => power(left, right, heap),
    }
}

fn type_error_for(op: BinOpKind, left: &Value, right: &Value, heap: &GuestHeap<impl ResourceTracker>) -> RunError {
    let symbol = match op {
        BinOpKind::Add => "+",
        BinOpKind::Sub => "-",
        BinOpKind::Mul => "*",
        BinOpKind::Div => "/",
        BinOpKind::FloorDiv => "//",
        BinOpKind::Mod => "%",
        BinOpKind::Pow => "**",
    };
    RunError::type_err(format!(
        "unsupported operand type(s) for {symbol}: '{}' and '{}'",
        left.type_name(heap),
        right.type_name(heap)
    ))
}

fn as_number(value: &Value) -> Option<Value> {
    match value {
        Value::Int(_) | Value::Float(_) => Some(value.clone()),
        Value::Bool(b) => Some(Value::Int(i64::from(*b))),
        _ => None,
    }
}

fn arith(
    op: BinOpKind,
    left: &Value,
    right: &Value,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    float_op: impl Fn(f64, f64) -> f64,
    heap: &mut GuestHeap<impl ResourceTracker>,
) -> RunResult<Value> {
    match (as_number(left), as_number(right)) {
        (Some(Value::Int(a)), Some(Value::Int(b))) => int_op(a, b)
            .map(Value::Int)
            .ok_or_else(|| RunError::exc(ExcKind::Overflow, "integer result too large")),
        (Some(a), Some(b)) => Ok(Value::Float(float_op(to_f64(&a), to_f64(&b)))),
        _ => Err(type_error_for(op, left, right, heap)),
    }
}

fn to_f64(value: &Value) -> f64 {
    match value {
        Value::Int(i) => *i as f64,
        Value::Float(f) => *f,
        _ => 0.0,
    }
}

fn add(left: &Value, right: &Value, heap: &mut GuestHeap<impl ResourceTracker>) -> RunResult<Value> {
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => {
            let mut joined = String::with_capacity(a.len() + b.len());
            joined.push_str(a);
            joined.push_str(b);
            Ok(Value::str(joined))
        }
        (Value::Ref(a), Value::Ref(b)) => match (heap.get(*a), heap.get(*b)) {
            (ObjData::List(xs), ObjData::List(ys)) => {
                let items: Vec<Value> = xs.iter().chain(ys.iter()).cloned().collect();
                Ok(Value::Ref(heap.alloc(ObjData::List(items))?))
            }
            (ObjData::Tuple(xs), ObjData::Tuple(ys)) => {
                let items: Vec<Value> = xs.iter().chain(ys.iter()).cloned().collect();
                Ok(Value::Ref(heap.alloc(ObjData::Tuple(items))?))
            }
            _ => Err(type_error_for(BinOpKind::Add, left, right, heap)),
        },
        _ => arith(BinOpKind::Add, left, right, i64::checked_add, |a, b| a + b, heap),
    }
}

fn mul(left: &Value, right: &Value, heap: &mut GuestHeap<impl ResourceTracker>) -> RunResult<Value> {
    // Sequence repetition, either operand order.
    let (seq, count) = match (left, right) {
        (seq @ (Value::Str(_) | Value::Ref(_)), Value::Int(n)) => (seq, Some(*n)),
        (Value::Int(n), seq @ (Value::Str(_) | Value::Ref(_))) => (seq, Some(*n)),
        _ => (left, None),
    };
    if let Some(n) = count {
        let n = n.max(0) as usize;
        match seq {
            Value::Str(s) => {
                if s.len().saturating_mul(n) > 10_000_000 {
                    return Err(RunError::exc(ExcKind::Overflow, "repeated string is too long"));
                }
                return Ok(Value::str(s.repeat(n)));
            }
            Value::Ref(id) => {
                let data = match heap.get(*id) {
                    ObjData::List(items) => {
                        if items.len().saturating_mul(n) > 10_000_000 {
                            return Err(RunError::exc(ExcKind::Overflow, "repeated sequence is too long"));
                        }
                        let mut out = Vec::with_capacity(items.len() * n);
                        for _ in 0..n {
                            out.extend(items.iter().cloned());
                        }
                        Some(ObjData::List(out))
                    }
                    ObjData::Tuple(items) => {
                        if items.len().saturating_mul(n) > 10_000_000 {
                            return Err(RunError::exc(ExcKind::Overflow, "repeated sequence is too long"));
                        }
                        let mut out = Vec::with_capacity(items.len() * n);
                        for _ in 0..n {
                            out.extend(items.iter().cloned());
                        }
                        Some(ObjData::Tuple(out))
                    }
                    _ => None,
                };
                if let Some(data) = data {
                    return Ok(Value::Ref(heap.alloc(data)?));
                }
            }
            _ => {}
        }
    }
    arith(BinOpKind::Mul, left, right, i64::checked_mul, |a, b| a * b, heap)
}

fn divide(left: &Value, right: &Value, heap: &mut GuestHeap<impl ResourceTracker>) -> RunResult<Value> {
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => {
            let b = to_f64(&b);
            if b == 0.0 {
                return Err(RunError::zero_division("division by zero"));
            }
            Ok(Value::Float(to_f64(&a) / b))
        }
        _ => Err(type_error_for(BinOpKind::Div, left, right, heap)),
    }
}

fn floor_div(left: &Value, right: &Value, heap: &mut GuestHeap<impl ResourceTracker>) -> RunResult<Value> {
    match (as_number(left), as_number(right)) {
        (Some(Value::Int(a)), Some(Value::Int(b))) => {
            if b == 0 {
                return Err(RunError::zero_division("integer division or modulo by zero"));
            }
            // i64::MIN / -1 overflows; route through checked division.
            let Some(mut q) = a.checked_div(b) else {
                return Err(RunError::exc(ExcKind::Overflow, "integer result too large"));
            };
            if a % b != 0 && (a < 0) != (b < 0) {
                q -= 1;
            }
            Ok(Value::Int(q))
        }
        (Some(a), Some(b)) => {
            let b = to_f64(&b);
            if b == 0.0 {
                return Err(RunError::zero_division("float floor division by zero"));
            }
            Ok(Value::Float((to_f64(&a) / b).floor()))
        }
        _ => Err(type_error_for(BinOpKind::FloorDiv, left, right, heap)),
    }
}

fn modulo(left: &Value, right: &Value, heap: &mut GuestHeap<impl ResourceTracker>) -> RunResult<Value> {
    match (as_number(left), as_number(right)) {
        (Some(Value::Int(a)), Some(Value::Int(b))) => {
            if b == 0 {
                return Err(RunError::zero_division("integer division or modulo by zero"));
            }
            // i64::MIN % -1 overflows; its remainder is zero.
            let mut r = a.checked_rem(b).unwrap_or(0);
            if r != 0 && (r < 0) != (b < 0) {
                r += b;
            }
            Ok(Value::Int(r))
        }
        (Some(a), Some(b)) => {
            let b = to_f64(&b);
            if b == 0.0 {
                return Err(RunError::zero_division("float modulo"));
            }
            let a = to_f64(&a);
            let mut r = a % b;
            if r != 0.0 && (r < 0.0) != (b < 0.0) {
                r += b;
            }
            Ok(Value::Float(r))
        }
        _ => Err(type_error_for(BinOpKind::Mod, left, right, heap)),
    }
}

fn power(left: &Value, right: &Value, heap: &mut GuestHeap<impl ResourceTracker>) -> RunResult<Value> {
    match (as_number(left), as_number(right)) {
        (Some(Value::Int(a)), Some(Value::Int(b))) if b >= 0 => {
            let exp = u32::try_from(b).map_err(|_| RunError::exc(ExcKind::Overflow, "exponent too large"))?;
            a.checked_pow(exp)
                .map(Value::Int)
                .ok_or_else(|| RunError::exc(ExcKind::Overflow, "integer result too large"))
        }
        (Some(a), Some(b)) => Ok(Value::Float(to_f64(&a).powf(to_f64(&b)))),
        _ => Err(type_error_for(BinOpKind::Pow, left, right, heap)),
    }
}

/// Python `==`, structural for containers.
pub(crate) fn py_eq(
    left: &Value,
    right: &Value,
    heap: &GuestHeap<impl ResourceTracker>,
    depth: usize,
) -> RunResult<bool> {
    if depth > MAX_DATA_DEPTH {
        return Err(RunError::exc(
            ExcKind::Runtime,
            "maximum recursion depth exceeded in comparison",
        ));
    }
    Ok(match (left, right) {
        (Value::None, Value::None) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => a == b,
        // Numeric cross-type equality: 1 == 1.0 == True.
        (Value::Int(_) | Value::Float(_) | Value::Bool(_), Value::Int(_) | Value::Float(_) | Value::Bool(_)) => {
            match (left, right) {
                (Value::Int(a), Value::Int(b)) => a == b,
                (Value::Bool(a), Value::Int(b)) => i64::from(*a) == *b,
                (Value::Int(a), Value::Bool(b)) => *a == i64::from(*b),
                _ => to_num(left) == to_num(right),
            }
        }
        (Value::Range { start: a, step: c, .. }, Value::Range { start: b, step: d, .. }) => {
            // Ranges compare by the sequence they yield.
            let (la, lb) = (left.range_len(), right.range_len());
            la == lb && (la == Some(0) || (a == b && (la == Some(1) || c == d)))
        }
        (Value::Ref(a), Value::Ref(b)) => {
            if a == b {
                return Ok(true);
            }
            match (heap.get(*a), heap.get(*b)) {
                (ObjData::List(xs), ObjData::List(ys)) | (ObjData::Tuple(xs), ObjData::Tuple(ys)) => {
                    if xs.len() != ys.len() {
                        return Ok(false);
                    }
                    for (x, y) in xs.iter().zip(ys) {
                        if !py_eq(x, y, heap, depth + 1)? {
                            return Ok(false);
                        }
                    }
                    true
                }
                (ObjData::Dict(xs), ObjData::Dict(ys)) => {
                    if xs.len() != ys.len() {
                        return Ok(false);
                    }
                    for (key, value) in xs {
                        let Some(other) = ys.get(key) else {
                            return Ok(false);
                        };
                        if !py_eq(value, other, heap, depth + 1)? {
                            return Ok(false);
                        }
                    }
                    true
                }
                (ObjData::Set(xs), ObjData::Set(ys)) => {
                    xs.len() == ys.len() && xs.keys().all(|k| ys.contains_key(k))
                }
                _ => false,
            }
        }
        _ => false,
    })
}

fn to_num(value: &Value) -> f64 {
    match value {
        Value::Int(i) => *i as f64,
        Value::Float(f) => *f,
        Value::Bool(b) => f64::from(u8::from(*b)),
        _ => f64::NAN,
    }
}

/// Python `<`-style ordering for sortable values.
pub(crate) fn py_cmp(
    left: &Value,
    right: &Value,
    heap: &GuestHeap<impl ResourceTracker>,
) -> RunResult<Ordering> {
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        (Value::Int(_) | Value::Float(_) | Value::Bool(_), Value::Int(_) | Value::Float(_) | Value::Bool(_)) => {
            let (a, b) = (to_num(left), to_num(right));
            a.partial_cmp(&b)
                .ok_or_else(|| RunError::type_err("nan is not orderable"))
        }
        (Value::Ref(a), Value::Ref(b)) => match (heap.get(*a), heap.get(*b)) {
            (ObjData::List(xs), ObjData::List(ys)) | (ObjData::Tuple(xs), ObjData::Tuple(ys)) => {
                for (x, y) in xs.iter().zip(ys) {
                    if !py_eq(x, y, heap, 0)? {
                        return py_cmp(x, y, heap);
                    }
                }
                Ok(xs.len().cmp(&ys.len()))
            }
            _ => Err(cmp_type_error(left, right, heap)),
        },
        _ => Err(cmp_type_error(left, right, heap)),
    }
}

fn cmp_type_error(left: &Value, right: &Value, heap: &GuestHeap<impl ResourceTracker>) -> RunError {
    RunError::type_err(format!(
        "'<' not supported between instances of '{}' and '{}'",
        left.type_name(heap),
        right.type_name(heap)
    ))
}

/// Evaluates a comparison operator to a bool.
pub(crate) fn compare(
    op: CmpOpKind,
    left: &Value,
    right: &Value,
    heap: &GuestHeap<impl ResourceTracker>,
) -> RunResult<bool> {
    Ok(match op {
        CmpOpKind::Eq => py_eq(left, right, heap, 0)?,
        CmpOpKind::NotEq => !py_eq(left, right, heap, 0)?,
        CmpOpKind::Lt => py_cmp(left, right, heap)? == Ordering::Less,
        CmpOpKind::LtE => py_cmp(left, right, heap)? != Ordering::Greater,
        CmpOpKind::Gt => py_cmp(left, right, heap)? == Ordering::Greater,
        CmpOpKind::GtE => py_cmp(left, right, heap)? != Ordering::Less,
        CmpOpKind::In => contains(left, right, heap)?,
        CmpOpKind::NotIn => !contains(left, right, heap)?,
        CmpOpKind::Is => is_identical(left, right),
        CmpOpKind::IsNot => !is_identical(left, right),
    })
}

/// Python `is`: identity for heap values, value identity for immediates.
fn is_identical(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::None, Value::None) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => std::ptr::eq(a.as_ptr(), b.as_ptr()) || a == b,
        (Value::Ref(a), Value::Ref(b)) => a == b,
        _ => false,
    }
}

/// Python `needle in haystack`.
pub(crate) fn contains(
    needle: &Value,
    haystack: &Value,
    heap: &GuestHeap<impl ResourceTracker>,
) -> RunResult<bool> {
    match haystack {
        Value::Str(s) => match needle {
            Value::Str(sub) => Ok(s.contains(sub.as_ref())),
            _ => Err(RunError::type_err(format!(
                "'in <string>' requires string as left operand, not {}",
                needle.type_name(heap)
            ))),
        },
        Value::Range { start, stop, step } => {
            let Value::Int(n) = needle else { return Ok(false) };
            let (n, start, stop, step) = (i128::from(*n), i128::from(*start), i128::from(*stop), i128::from(*step));
            if step > 0 {
                Ok(n >= start && n < stop && (n - start) % step == 0)
            } else {
                Ok(n <= start && n > stop && (start - n) % (-step) == 0)
            }
        }
        Value::Ref(id) => match heap.get(*id) {
            ObjData::List(items) | ObjData::Tuple(items) => {
                for item in items {
                    if py_eq(needle, item, heap, 0)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            ObjData::Dict(entries) => {
                let key = DictKey::from_value(needle, heap)
                    .map_err(|t| RunError::type_err(format!("unhashable type: '{t}'")))?;
                Ok(entries.contains_key(&key))
            }
            ObjData::Set(entries) => {
                let key = DictKey::from_value(needle, heap)
                    .map_err(|t| RunError::type_err(format!("unhashable type: '{t}'")))?;
                Ok(entries.contains_key(&key))
            }
            _ => Err(RunError::type_err(format!(
                "argument of type '{}' is not iterable",
                haystack.type_name(heap)
            ))),
        },
        _ => Err(RunError::type_err(format!(
            "argument of type '{}' is not iterable",
            haystack.type_name(heap)
        ))),
    }
}

/// Largest range the interpreter will materialize for iteration.
const MAX_RANGE_ITEMS: i64 = 1_000_000;

/// Materializes the elements an iterable yields, in order.
pub(crate) fn iter_values(
    value: &Value,
    heap: &GuestHeap<impl ResourceTracker>,
) -> RunResult<Vec<Value>> {
    match value {
        Value::Str(s) => Ok(s.chars().map(|c| Value::str(c.to_string())).collect()),
        Value::Range { start, stop, step } => {
            // Iteration materializes eagerly; bound it so a huge range
            // cannot blow the host heap before the memory ceiling sees it.
            if value.range_len().unwrap_or(0) > MAX_RANGE_ITEMS {
                return Err(RunError::exc(
                    ExcKind::Overflow,
                    "range is too large to iterate in the sandbox",
                ));
            }
            let mut out = Vec::new();
            let mut current = *start;
            loop {
                let in_range = if *step > 0 { current < *stop } else { current > *stop };
                if !in_range {
                    break;
                }
                out.push(Value::Int(current));
                let Some(next) = current.checked_add(*step) else { break };
                current = next;
            }
            Ok(out)
        }
        Value::Ref(id) => match heap.get(*id) {
            ObjData::List(items) | ObjData::Tuple(items) => Ok(items.clone()),
            ObjData::Dict(entries) => Ok(entries.keys().map(key_to_value).collect()),
            ObjData::Set(entries) => Ok(entries.values().cloned().collect()),
            _ => Err(not_iterable(value, heap)),
        },
        _ => Err(not_iterable(value, heap)),
    }
}

/// Rebuilds an iterable value from a dict key.
///
/// Tuple keys degrade to their display string; reconstructing the tuple
/// would need a heap allocation the iteration path cannot perform.
pub(crate) fn key_to_value(key: &DictKey) -> Value {
    match key {
        DictKey::None => Value::None,
        DictKey::Bool(b) => Value::Bool(*b),
        DictKey::Int(i) => Value::Int(*i),
        DictKey::Float(bits) => Value::Float(f64::from_bits(*bits)),
        DictKey::Str(s) => Value::str(s.clone()),
        DictKey::Tuple(_) => Value::str(key.display()),
    }
}

/// Element count for sized values.
pub(crate) fn py_len(value: &Value, heap: &GuestHeap<impl ResourceTracker>) -> Option<usize> {
    match value {
        Value::Str(s) => Some(s.chars().count()),
        Value::Range { .. } => value.range_len().map(|n| n.max(0) as usize),
        Value::Ref(id) => match heap.get(*id) {
            ObjData::List(items) | ObjData::Tuple(items) => Some(items.len()),
            ObjData::Dict(entries) => Some(entries.len()),
            ObjData::Set(entries) => Some(entries.len()),
            _ => None,
        },
        _ => None,
    }
}

fn not_iterable(value: &Value, heap: &GuestHeap<impl ResourceTracker>) -> RunError {
    RunError::type_err(format!("'{}' object is not iterable", value.type_name(heap)))
}

/// Normalizes a possibly-negative index against a length.
pub(crate) fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let adjusted = if index < 0 { index + len } else { index };
    if adjusted < 0 || adjusted >= len {
        None
    } else {
        Some(adjusted as usize)
    }
}

/// Resolves slice bounds the way Python does (clamping, negative indices,
/// optional step).
pub(crate) fn slice_indices(
    lower: Option<i64>,
    upper: Option<i64>,
    step: Option<i64>,
    len: usize,
) -> RunResult<Vec<usize>> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(RunError::value_err("slice step cannot be zero"));
    }
    let len = len as i64;
    let clamp = |i: i64, low: i64, high: i64| i.clamp(low, high);
    let mut indices = Vec::new();
    if step > 0 {
        let start = clamp(lower.map_or(0, |i| if i < 0 { i + len } else { i }), 0, len);
        let stop = clamp(upper.map_or(len, |i| if i < 0 { i + len } else { i }), 0, len);
        let mut i = start;
        while i < stop {
            indices.push(i as usize);
            i += step;
        }
    } else {
        let start = clamp(lower.map_or(len - 1, |i| if i < 0 { i + len } else { i }), -1, len - 1);
        let stop = clamp(upper.map_or(-1, |i| if i < 0 { i + len } else { i }), -1, len - 1);
        let mut i = start;
        while i > stop {
            indices.push(i as usize);
            i += step;
        }
    }
    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    fn heap() -> GuestHeap<NoLimitTracker> {
        GuestHeap::new(NoLimitTracker)
    }

    #[test]
    fn floor_division_floors_toward_negative_infinity() {
        let mut h = heap();
        assert!(matches!(
            binary_op(BinOpKind::FloorDiv, &Value::Int(-7), &Value::Int(2), &mut h),
            Ok(Value::Int(-4))
        ));
        assert!(matches!(
            binary_op(BinOpKind::Mod, &Value::Int(-7), &Value::Int(2), &mut h),
            Ok(Value::Int(1))
        ));
    }

    #[test]
    fn true_division_is_float() {
        let mut h = heap();
        let Ok(Value::Float(q)) = binary_op(BinOpKind::Div, &Value::Int(1), &Value::Int(2), &mut h) else {
            panic!("expected float");
        };
        assert!((q - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn division_by_zero_raises() {
        let mut h = heap();
        let err = binary_op(BinOpKind::Div, &Value::Int(1), &Value::Int(0), &mut h).unwrap_err();
        assert!(matches!(err, RunError::Exc(e) if e.kind == ExcKind::ZeroDivision));
    }

    #[test]
    fn int_overflow_raises_overflow_error() {
        let mut h = heap();
        let err = binary_op(BinOpKind::Mul, &Value::Int(i64::MAX), &Value::Int(2), &mut h).unwrap_err();
        assert!(matches!(err, RunError::Exc(e) if e.kind == ExcKind::Overflow));
    }

    #[test]
    fn structural_equality_and_identity() {
        let mut h = heap();
        let a = h.alloc(ObjData::List(vec![Value::Int(1)])).unwrap();
        let b = h.alloc(ObjData::List(vec![Value::Int(1)])).unwrap();
        assert!(py_eq(&Value::Ref(a), &Value::Ref(b), &h, 0).unwrap());
        assert!(!compare(CmpOpKind::Is, &Value::Ref(a), &Value::Ref(b), &h).unwrap());
        assert!(compare(CmpOpKind::Is, &Value::Ref(a), &Value::Ref(a), &h).unwrap());
    }

    #[test]
    fn slice_bounds() {
        assert_eq!(slice_indices(Some(1), Some(3), None, 5).unwrap(), vec![1, 2]);
        assert_eq!(slice_indices(None, None, Some(-1), 3).unwrap(), vec![2, 1, 0]);
        assert_eq!(slice_indices(Some(-2), None, None, 4).unwrap(), vec![2, 3]);
        assert!(slice_indices(None, None, Some(0), 3).is_err());
    }

    #[test]
    fn range_iteration_and_membership() {
        let h = heap();
        let r = Value::Range {
            start: 0,
            stop: 6,
            step: 2,
        };
        let values = iter_values(&r, &h).unwrap();
        assert_eq!(values.len(), 3);
        assert!(contains(&Value::Int(4), &r, &h).unwrap());
        assert!(!contains(&Value::Int(3), &r, &h).unwrap());
    }
}
