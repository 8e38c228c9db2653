//! Whitelisted builtin functions and the restricted guest environment.
//!
//! The environment exposes only the names on the configured allow-list,
//! always backed by this module's implementations: `print` writes to the
//! collector's stdout buffer, `input` reads scripted input, and `open`
//! unconditionally raises. Nothing else from the host is reachable.

use indexmap::IndexMap;

use crate::{
    exc::{ExcKind, RunError, RunResult},
    heap::{DictKey, GuestHeap, ObjData},
    io::{ScriptedInput, StdoutBuffer},
    ops::{iter_values, py_cmp, py_len},
    resource::ResourceTracker,
    value::Value,
};

/// Host facilities a builtin call may touch.
pub(crate) struct HostCtx<'a, T: ResourceTracker> {
    pub heap: &'a mut GuestHeap<T>,
    pub stdout: &'a mut StdoutBuffer,
    pub input: &'a mut ScriptedInput,
}

/// A whitelisted builtin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Builtin {
    Abs,
    All,
    Any,
    Bin,
    Bool,
    Chr,
    Dict,
    Divmod,
    Enumerate,
    Filter,
    Float,
    Hex,
    Input,
    Int,
    Isinstance,
    Len,
    List,
    Map,
    Max,
    Min,
    Oct,
    Open,
    Ord,
    Pow,
    Print,
    Range,
    Repr,
    Reversed,
    Round,
    Set,
    Sorted,
    Str,
    Sum,
    Tuple,
    Type,
    Zip,
}

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Self::Abs => "abs",
            Self::All => "all",
            Self::Any => "any",
            Self::Bin => "bin",
            Self::Bool => "bool",
            Self::Chr => "chr",
            Self::Dict => "dict",
            Self::Divmod => "divmod",
            Self::Enumerate => "enumerate",
            Self::Filter => "filter",
            Self::Float => "float",
            Self::Hex => "hex",
            Self::Input => "input",
            Self::Int => "int",
            Self::Isinstance => "isinstance",
            Self::Len => "len",
            Self::List => "list",
            Self::Map => "map",
            Self::Max => "max",
            Self::Min => "min",
            Self::Oct => "oct",
            Self::Open => "open",
            Self::Ord => "ord",
            Self::Pow => "pow",
            Self::Print => "print",
            Self::Range => "range",
            Self::Repr => "repr",
            Self::Reversed => "reversed",
            Self::Round => "round",
            Self::Set => "set",
            Self::Sorted => "sorted",
            Self::Str => "str",
            Self::Sum => "sum",
            Self::Tuple => "tuple",
            Self::Type => "type",
            Self::Zip => "zip",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "abs" => Self::Abs,
            "all" => Self::All,
            "any" => Self::Any,
            "bin" => Self::Bin,
            "bool" => Self::Bool,
            "chr" => Self::Chr,
            "dict" => Self::Dict,
            "divmod" => Self::Divmod,
            "enumerate" => Self::Enumerate,
            "filter" => Self::Filter,
            "float" => Self::Float,
            "hex" => Self::Hex,
            "input" => Self::Input,
            "int" => Self::Int,
            "isinstance" => Self::Isinstance,
            "len" => Self::Len,
            "list" => Self::List,
            "map" => Self::Map,
            "max" => Self::Max,
            "min" => Self::Min,
            "oct" => Self::Oct,
            "open" => Self::Open,
            "ord" => Self::Ord,
            "pow" => Self::Pow,
            "print" => Self::Print,
            "range" => Self::Range,
            "repr" => Self::Repr,
            "reversed" => Self::Reversed,
            "round" => Self::Round,
            "set" => Self::Set,
            "sorted" => Self::Sorted,
            "str" => Self::Str,
            "sum" => Self::Sum,
            "tuple" => Self::Tuple,
            "type" => Self::Type,
            "zip" => Self::Zip,
            _ => return None,
        })
    }

    /// True for builtins that are type constructors (`int`, `list`, ...),
    /// which repr as classes rather than functions.
    pub fn is_type(self) -> bool {
        matches!(
            self,
            Self::Bool | Self::Dict | Self::Float | Self::Int | Self::List | Self::Range | Self::Set | Self::Str | Self::Tuple
        )
    }
}

/// Builds the restricted builtin table (the C-layer of the guest's
/// environment): every allow-listed name this module implements, with
/// `input`, `print`, and `open` always present as replacements.
pub(crate) fn environment(allowed: &[String]) -> IndexMap<String, Value> {
    let mut table = IndexMap::new();
    for name in allowed {
        if let Some(builtin) = Builtin::from_name(name) {
            table.insert(name.clone(), Value::Builtin(builtin));
        }
    }
    for forced in [Builtin::Input, Builtin::Print, Builtin::Open] {
        table.insert(forced.name().to_owned(), Value::Builtin(forced));
    }
    table
}

/// Calls a builtin with already-evaluated arguments.
///
/// `map` and `filter` call back into guest code and are dispatched by the
/// interpreter before it reaches here.
pub(crate) fn call_builtin<T: ResourceTracker>(
    ctx: &mut HostCtx<'_, T>,
    builtin: Builtin,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> RunResult<Value> {
    if !kwargs.is_empty() && !matches!(builtin, Builtin::Print | Builtin::Sorted) {
        return Err(RunError::type_err(format!(
            "{}() takes no keyword arguments",
            builtin.name()
        )));
    }
    match builtin {
        Builtin::Print => print(ctx, args, kwargs),
        Builtin::Input => input(ctx, &args),
        Builtin::Open => Err(RunError::exc(ExcKind::Permission, "File operations are not allowed")),
        Builtin::Abs => abs(ctx, &args),
        Builtin::All => {
            let values = one_iterable(ctx, builtin, &args)?;
            Ok(Value::Bool(values.iter().all(|v| v.truthy(ctx.heap))))
        }
        Builtin::Any => {
            let values = one_iterable(ctx, builtin, &args)?;
            Ok(Value::Bool(values.iter().any(|v| v.truthy(ctx.heap))))
        }
        Builtin::Bin => Ok(Value::str(format_radix(int_only(ctx, builtin, &args)?, "0b", 2))),
        Builtin::Oct => Ok(Value::str(format_radix(int_only(ctx, builtin, &args)?, "0o", 8))),
        Builtin::Hex => Ok(Value::str(format_radix(int_only(ctx, builtin, &args)?, "0x", 16))),
        Builtin::Bool => match args.as_slice() {
            [] => Ok(Value::Bool(false)),
            [v] => Ok(Value::Bool(v.truthy(ctx.heap))),
            _ => Err(arity(builtin, "at most 1 argument", args.len())),
        },
        Builtin::Chr => {
            let code = int_only(ctx, builtin, &args)?;
            let code = u32::try_from(code)
                .ok()
                .and_then(char::from_u32)
                .ok_or_else(|| RunError::value_err("chr() arg not in range(0x110000)"))?;
            Ok(Value::str(code.to_string()))
        }
        Builtin::Ord => {
            let [Value::Str(s)] = args.as_slice() else {
                return Err(RunError::type_err("ord() expected a character"));
            };
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(Value::Int(i64::from(u32::from(c)))),
                _ => Err(RunError::type_err(format!(
                    "ord() expected a character, but string of length {} found",
                    s.chars().count()
                ))),
            }
        }
        Builtin::Dict => build_dict(ctx, &args),
        Builtin::List => match args.as_slice() {
            [] => Ok(Value::Ref(ctx.heap.alloc(ObjData::List(Vec::new()))?)),
            [v] => {
                let items = iter_values(v, ctx.heap)?;
                Ok(Value::Ref(ctx.heap.alloc(ObjData::List(items))?))
            }
            _ => Err(arity(builtin, "at most 1 argument", args.len())),
        },
        Builtin::Tuple => match args.as_slice() {
            [] => Ok(Value::Ref(ctx.heap.alloc(ObjData::Tuple(Vec::new()))?)),
            [v] => {
                let items = iter_values(v, ctx.heap)?;
                Ok(Value::Ref(ctx.heap.alloc(ObjData::Tuple(items))?))
            }
            _ => Err(arity(builtin, "at most 1 argument", args.len())),
        },
        Builtin::Set => match args.as_slice() {
            [] => Ok(Value::Ref(ctx.heap.alloc(ObjData::Set(IndexMap::new()))?)),
            [v] => {
                let items = iter_values(v, ctx.heap)?;
                let mut entries = IndexMap::new();
                for item in items {
                    let key = hashable(&item, ctx.heap)?;
                    entries.insert(key, item);
                }
                Ok(Value::Ref(ctx.heap.alloc(ObjData::Set(entries))?))
            }
            _ => Err(arity(builtin, "at most 1 argument", args.len())),
        },
        Builtin::Divmod => {
            let [a, b] = args.as_slice() else {
                return Err(arity(builtin, "exactly 2 arguments", args.len()));
            };
            let q = crate::ops::binary_op(crate::lower::BinOpKind::FloorDiv, a, b, ctx.heap)?;
            let r = crate::ops::binary_op(crate::lower::BinOpKind::Mod, a, b, ctx.heap)?;
            Ok(Value::Ref(ctx.heap.alloc(ObjData::Tuple(vec![q, r]))?))
        }
        Builtin::Enumerate => {
            let (values, start) = match args.as_slice() {
                [v] => (iter_values(v, ctx.heap)?, 0),
                [v, Value::Int(start)] => (iter_values(v, ctx.heap)?, *start),
                _ => return Err(arity(builtin, "1 or 2 arguments", args.len())),
            };
            let mut out = Vec::with_capacity(values.len());
            for (offset, value) in values.into_iter().enumerate() {
                let pair = ctx
                    .heap
                    .alloc(ObjData::Tuple(vec![Value::Int(start + offset as i64), value]))?;
                out.push(Value::Ref(pair));
            }
            Ok(Value::Ref(ctx.heap.alloc(ObjData::List(out))?))
        }
        Builtin::Zip => {
            let mut columns = Vec::with_capacity(args.len());
            for arg in &args {
                columns.push(iter_values(arg, ctx.heap)?);
            }
            let shortest = columns.iter().map(Vec::len).min().unwrap_or(0);
            let mut out = Vec::with_capacity(shortest);
            for row in 0..shortest {
                let tuple: Vec<Value> = columns.iter().map(|col| col[row].clone()).collect();
                out.push(Value::Ref(ctx.heap.alloc(ObjData::Tuple(tuple))?));
            }
            Ok(Value::Ref(ctx.heap.alloc(ObjData::List(out))?))
        }
        Builtin::Float => match args.as_slice() {
            [] => Ok(Value::Float(0.0)),
            [Value::Float(f)] => Ok(Value::Float(*f)),
            [Value::Int(i)] => Ok(Value::Float(*i as f64)),
            [Value::Bool(b)] => Ok(Value::Float(f64::from(u8::from(*b)))),
            [Value::Str(s)] => s
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| RunError::value_err(format!("could not convert string to float: '{s}'"))),
            [other] => Err(RunError::type_err(format!(
                "float() argument must be a string or a real number, not '{}'",
                other.type_name(ctx.heap)
            ))),
            _ => Err(arity(builtin, "at most 1 argument", args.len())),
        },
        Builtin::Int => match args.as_slice() {
            [] => Ok(Value::Int(0)),
            [Value::Int(i)] => Ok(Value::Int(*i)),
            [Value::Bool(b)] => Ok(Value::Int(i64::from(*b))),
            [Value::Float(f)] => Ok(Value::Int(f.trunc() as i64)),
            [Value::Str(s)] => s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| RunError::value_err(format!("invalid literal for int() with base 10: '{s}'"))),
            [other] => Err(RunError::type_err(format!(
                "int() argument must be a string or a number, not '{}'",
                other.type_name(ctx.heap)
            ))),
            _ => Err(arity(builtin, "at most 1 argument", args.len())),
        },
        Builtin::Isinstance => {
            let [value, spec] = args.as_slice() else {
                return Err(arity(builtin, "exactly 2 arguments", args.len()));
            };
            Ok(Value::Bool(matches_type(value, spec, ctx.heap)?))
        }
        Builtin::Len => {
            let [value] = args.as_slice() else {
                return Err(arity(builtin, "exactly one argument", args.len()));
            };
            py_len(value, ctx.heap)
                .map(|n| Value::Int(n as i64))
                .ok_or_else(|| {
                    RunError::type_err(format!("object of type '{}' has no len()", value.type_name(ctx.heap)))
                })
        }
        Builtin::Max => extremum(ctx, builtin, args, true),
        Builtin::Min => extremum(ctx, builtin, args, false),
        Builtin::Pow => match args.as_slice() {
            [a, b] => crate::ops::binary_op(crate::lower::BinOpKind::Pow, a, b, ctx.heap),
            [Value::Int(a), Value::Int(b), Value::Int(m)] => {
                if *b < 0 {
                    return Err(RunError::value_err("pow() 2nd argument cannot be negative when 3rd argument specified"));
                }
                if *m == 0 {
                    return Err(RunError::value_err("pow() 3rd argument cannot be 0"));
                }
                // 128-bit intermediates keep the square-and-multiply free of
                // overflow for any i64 modulus.
                let modulus = i128::from(*m);
                let mut result: i128 = 1;
                let mut base = i128::from(*a).rem_euclid(modulus);
                let mut exp = *b;
                while exp > 0 {
                    if exp & 1 == 1 {
                        result = (result * base).rem_euclid(modulus);
                    }
                    base = (base * base).rem_euclid(modulus);
                    exp >>= 1;
                }
                Ok(Value::Int(result as i64))
            }
            _ => Err(arity(builtin, "2 or 3 integer arguments", args.len())),
        },
        Builtin::Range => {
            let (start, stop, step) = match args.as_slice() {
                [Value::Int(stop)] => (0, *stop, 1),
                [Value::Int(start), Value::Int(stop)] => (*start, *stop, 1),
                [Value::Int(start), Value::Int(stop), Value::Int(step)] => {
                    if *step == 0 {
                        return Err(RunError::value_err("range() arg 3 must not be zero"));
                    }
                    (*start, *stop, *step)
                }
                _ => return Err(RunError::type_err("range() requires 1 to 3 integer arguments")),
            };
            Ok(Value::Range { start, stop, step })
        }
        Builtin::Repr => {
            let [value] = args.as_slice() else {
                return Err(arity(builtin, "exactly one argument", args.len()));
            };
            Ok(Value::str(value.py_repr(ctx.heap)))
        }
        Builtin::Str => match args.as_slice() {
            [] => Ok(Value::str("")),
            [value] => Ok(Value::str(value.py_str(ctx.heap))),
            _ => Err(arity(builtin, "at most 1 argument", args.len())),
        },
        Builtin::Reversed => {
            let [value] = args.as_slice() else {
                return Err(arity(builtin, "exactly one argument", args.len()));
            };
            let mut items = match value {
                Value::Ref(id) if matches!(ctx.heap.get(*id), ObjData::Dict(_) | ObjData::Set(_)) => {
                    return Err(RunError::type_err(format!(
                        "argument to reversed() must be a sequence, not '{}'",
                        value.type_name(ctx.heap)
                    )));
                }
                _ => iter_values(value, ctx.heap)?,
            };
            items.reverse();
            Ok(Value::Ref(ctx.heap.alloc(ObjData::List(items))?))
        }
        Builtin::Round => match args.as_slice() {
            [value] => match value {
                Value::Int(i) => Ok(Value::Int(*i)),
                Value::Float(f) => Ok(Value::Int(f.round_ties_even() as i64)),
                Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                _ => Err(round_type_error(value, ctx.heap)),
            },
            // round(int, ndigits) stays an int, as int.__round__ does.
            [value, Value::Int(digits)] => match value {
                Value::Int(i) => round_int_ndigits(*i, *digits),
                Value::Bool(b) => round_int_ndigits(i64::from(*b), *digits),
                Value::Float(f) => {
                    // Past f64's decimal range the value is already as
                    // rounded as it can get (or rounds to zero).
                    if *digits > 308 {
                        return Ok(Value::Float(*f));
                    }
                    if *digits < -308 {
                        return Ok(Value::Float(0.0));
                    }
                    let factor = 10f64.powi(*digits as i32);
                    Ok(Value::Float((f * factor).round_ties_even() / factor))
                }
                _ => Err(round_type_error(value, ctx.heap)),
            },
            _ => Err(arity(builtin, "1 or 2 arguments", args.len())),
        },
        Builtin::Sorted => {
            let [value] = args.as_slice() else {
                return Err(arity(builtin, "exactly one positional argument", args.len()));
            };
            let mut reverse = false;
            for (name, kwvalue) in &kwargs {
                match name.as_str() {
                    "reverse" => reverse = kwvalue.truthy(ctx.heap),
                    _ => {
                        return Err(RunError::type_err(format!(
                            "sorted() got an unexpected keyword argument '{name}'"
                        )));
                    }
                }
            }
            let mut items = iter_values(value, ctx.heap)?;
            sort_values(&mut items, ctx.heap)?;
            if reverse {
                items.reverse();
            }
            Ok(Value::Ref(ctx.heap.alloc(ObjData::List(items))?))
        }
        Builtin::Sum => {
            let (values, mut total) = match args.as_slice() {
                [v] => (iter_values(v, ctx.heap)?, Value::Int(0)),
                [v, start] => (iter_values(v, ctx.heap)?, start.clone()),
                _ => return Err(arity(builtin, "1 or 2 arguments", args.len())),
            };
            for value in values {
                total = crate::ops::binary_op(crate::lower::BinOpKind::Add, &total, &value, ctx.heap)?;
            }
            Ok(total)
        }
        Builtin::Type => {
            let [value] = args.as_slice() else {
                return Err(arity(builtin, "exactly one argument", args.len()));
            };
            Ok(type_of(value, ctx.heap))
        }
        Builtin::Map | Builtin::Filter => {
            unreachable!("map/filter call guest code and are dispatched by the interpreter")
        }
    }
}

fn arity(builtin: Builtin, expected: &str, got: usize) -> RunError {
    RunError::type_err(format!("{}() takes {expected} ({got} given)", builtin.name()))
}

fn round_type_error(value: &Value, heap: &GuestHeap<impl ResourceTracker>) -> RunError {
    RunError::type_err(format!(
        "type {} doesn't define __round__ method",
        value.type_name(heap)
    ))
}

/// Integer rounding to a multiple of `10^-ndigits`, ties to the even
/// multiple (`round(1250, -2) == 1200`, `round(1350, -2) == 1400`).
fn round_int_ndigits(n: i64, digits: i64) -> RunResult<Value> {
    if digits >= 0 {
        return Ok(Value::Int(n));
    }
    let magnitude = digits.unsigned_abs();
    // 10^20 exceeds twice any i64 magnitude, so everything rounds to zero.
    if magnitude >= 20 {
        return Ok(Value::Int(0));
    }
    let pow = 10i128.pow(magnitude as u32);
    let n = i128::from(n);
    let quotient = n.div_euclid(pow);
    let remainder = n.rem_euclid(pow);
    let half = pow / 2;
    let rounded = if remainder > half {
        quotient + 1
    } else if remainder < half {
        quotient
    } else if quotient % 2 == 0 {
        quotient
    } else {
        quotient + 1
    };
    i64::try_from(rounded * pow)
        .map(Value::Int)
        .map_err(|_| RunError::exc(ExcKind::Overflow, "integer result too large"))
}

fn one_iterable<T: ResourceTracker>(
    ctx: &mut HostCtx<'_, T>,
    builtin: Builtin,
    args: &[Value],
) -> RunResult<Vec<Value>> {
    let [value] = args else {
        return Err(arity(builtin, "exactly one argument", args.len()));
    };
    iter_values(value, ctx.heap)
}

fn int_only<T: ResourceTracker>(ctx: &mut HostCtx<'_, T>, builtin: Builtin, args: &[Value]) -> RunResult<i64> {
    match args {
        [Value::Int(i)] => Ok(*i),
        [Value::Bool(b)] => Ok(i64::from(*b)),
        [other] => Err(RunError::type_err(format!(
            "'{}' object cannot be interpreted as an integer",
            other.type_name(ctx.heap)
        ))),
        _ => Err(arity(builtin, "exactly one argument", args.len())),
    }
}

fn format_radix(value: i64, prefix: &str, radix: u32) -> String {
    let magnitude = value.unsigned_abs();
    let digits = match radix {
        2 => format!("{magnitude:b}"),
        8 => format!("{magnitude:o}"),
        _ => format!("{magnitude:x}"),
    };
    if value < 0 {
        format!("-{prefix}{digits}")
    } else {
        format!("{prefix}{digits}")
    }
}

fn abs<T: ResourceTracker>(ctx: &mut HostCtx<'_, T>, args: &[Value]) -> RunResult<Value> {
    match args {
        [Value::Int(i)] => i
            .checked_abs()
            .map(Value::Int)
            .ok_or_else(|| RunError::exc(ExcKind::Overflow, "integer result too large")),
        [Value::Float(f)] => Ok(Value::Float(f.abs())),
        [Value::Bool(b)] => Ok(Value::Int(i64::from(*b))),
        [other] => Err(RunError::type_err(format!(
            "bad operand type for abs(): '{}'",
            other.type_name(ctx.heap)
        ))),
        _ => Err(arity(Builtin::Abs, "exactly one argument", args.len())),
    }
}

fn print<T: ResourceTracker>(
    ctx: &mut HostCtx<'_, T>,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> RunResult<Value> {
    let mut sep = " ".to_owned();
    let mut end = "\n".to_owned();
    for (name, value) in kwargs {
        match name.as_str() {
            "sep" => match value {
                Value::Str(s) => sep = s.to_string(),
                Value::None => {}
                _ => return Err(RunError::type_err("sep must be None or a string")),
            },
            "end" => match value {
                Value::Str(s) => end = s.to_string(),
                Value::None => {}
                _ => return Err(RunError::type_err("end must be None or a string")),
            },
            "flush" => {}
            _ => {
                return Err(RunError::type_err(format!(
                    "'{name}' is an invalid keyword argument for print()"
                )));
            }
        }
    }
    let mut first = true;
    let mut output = String::new();
    for value in &args {
        if !first {
            output.push_str(&sep);
        }
        first = false;
        output.push_str(&value.py_str(ctx.heap));
    }
    output.push_str(&end);
    ctx.stdout.push_str(&output);
    Ok(Value::None)
}

fn input<T: ResourceTracker>(ctx: &mut HostCtx<'_, T>, args: &[Value]) -> RunResult<Value> {
    let prompt = match args {
        [] => String::new(),
        [value] => value.py_str(ctx.heap),
        _ => return Err(arity(Builtin::Input, "at most 1 argument", args.len())),
    };
    match ctx.input.next_line() {
        Some(line) => {
            ctx.stdout.push_str(&format!("{prompt}{line}\n"));
            Ok(Value::str(line))
        }
        None => {
            ctx.stdout.push_str(&format!("{prompt}\n"));
            Ok(Value::str(""))
        }
    }
}

fn build_dict<T: ResourceTracker>(ctx: &mut HostCtx<'_, T>, args: &[Value]) -> RunResult<Value> {
    match args {
        [] => Ok(Value::Ref(ctx.heap.alloc(ObjData::Dict(IndexMap::new()))?)),
        [Value::Ref(id)] => match ctx.heap.get(*id) {
            ObjData::Dict(entries) => {
                let copied = entries.clone();
                Ok(Value::Ref(ctx.heap.alloc(ObjData::Dict(copied))?))
            }
            ObjData::List(items) | ObjData::Tuple(items) => {
                let pairs = items.clone();
                let mut entries = IndexMap::new();
                for pair in pairs {
                    let elements = iter_values(&pair, ctx.heap)?;
                    let [key, value] = elements.as_slice() else {
                        return Err(RunError::value_err("dictionary update sequence elements must have length 2"));
                    };
                    entries.insert(hashable(key, ctx.heap)?, value.clone());
                }
                Ok(Value::Ref(ctx.heap.alloc(ObjData::Dict(entries))?))
            }
            _ => Err(RunError::type_err("dict() argument must be a mapping or iterable of pairs")),
        },
        _ => Err(RunError::type_err("dict() argument must be a mapping or iterable of pairs")),
    }
}

fn extremum<T: ResourceTracker>(
    ctx: &mut HostCtx<'_, T>,
    builtin: Builtin,
    args: Vec<Value>,
    want_greater: bool,
) -> RunResult<Value> {
    let candidates = match args.len() {
        0 => return Err(arity(builtin, "at least one argument", 0)),
        1 => {
            let values = iter_values(&args[0], ctx.heap)?;
            if values.is_empty() {
                return Err(RunError::value_err(format!("{}() arg is an empty sequence", builtin.name())));
            }
            values
        }
        _ => args,
    };
    let mut best = candidates[0].clone();
    for candidate in &candidates[1..] {
        let ordering = py_cmp(candidate, &best, ctx.heap)?;
        let better = if want_greater {
            ordering == std::cmp::Ordering::Greater
        } else {
            ordering == std::cmp::Ordering::Less
        };
        if better {
            best = candidate.clone();
        }
    }
    Ok(best)
}

/// Stable sort with Python ordering, surfacing the first comparison error.
pub(crate) fn sort_values(items: &mut [Value], heap: &GuestHeap<impl ResourceTracker>) -> RunResult<()> {
    let mut first_error = None;
    items.sort_by(|a, b| {
        if first_error.is_some() {
            return std::cmp::Ordering::Equal;
        }
        match py_cmp(a, b, heap) {
            Ok(ordering) => ordering,
            Err(err) => {
                first_error = Some(err);
                std::cmp::Ordering::Equal
            }
        }
    });
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

pub(crate) fn hashable(value: &Value, heap: &GuestHeap<impl ResourceTracker>) -> RunResult<DictKey> {
    DictKey::from_value(value, heap).map_err(|t| RunError::type_err(format!("unhashable type: '{t}'")))
}

/// `isinstance` check against a builtin constructor, exception type, user
/// class, or tuple of those.
fn matches_type(value: &Value, spec: &Value, heap: &GuestHeap<impl ResourceTracker>) -> RunResult<bool> {
    match spec {
        Value::Ref(id) => match heap.get(*id) {
            ObjData::Tuple(specs) => {
                for inner in specs {
                    if matches_type(value, inner, heap)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            ObjData::Class(_) => match value {
                Value::Ref(vid) => match heap.get(*vid) {
                    ObjData::Instance(instance) => Ok(heap.is_subclass(instance.class, *id)),
                    _ => Ok(false),
                },
                _ => Ok(false),
            },
            _ => Err(isinstance_arg_error()),
        },
        Value::Builtin(b) => Ok(match b {
            Builtin::Bool => matches!(value, Value::Bool(_)),
            // bool is a subclass of int in Python.
            Builtin::Int => matches!(value, Value::Int(_) | Value::Bool(_)),
            Builtin::Float => matches!(value, Value::Float(_)),
            Builtin::Str => matches!(value, Value::Str(_)),
            Builtin::Range => matches!(value, Value::Range { .. }),
            Builtin::List => matches!(value, Value::Ref(id) if matches!(heap.get(*id), ObjData::List(_))),
            Builtin::Tuple => matches!(value, Value::Ref(id) if matches!(heap.get(*id), ObjData::Tuple(_))),
            Builtin::Dict => matches!(value, Value::Ref(id) if matches!(heap.get(*id), ObjData::Dict(_))),
            Builtin::Set => matches!(value, Value::Ref(id) if matches!(heap.get(*id), ObjData::Set(_))),
            _ => return Err(isinstance_arg_error()),
        }),
        Value::ExcType(kind) => Ok(matches!(value, Value::Exception(exc) if exc.kind.caught_by(*kind))),
        _ => Err(isinstance_arg_error()),
    }
}

fn isinstance_arg_error() -> RunError {
    RunError::type_err("isinstance() arg 2 must be a type or tuple of types")
}

/// The value `type(x)` evaluates to.
fn type_of(value: &Value, heap: &GuestHeap<impl ResourceTracker>) -> Value {
    match value {
        Value::Bool(_) => Value::Builtin(Builtin::Bool),
        Value::Int(_) => Value::Builtin(Builtin::Int),
        Value::Float(_) => Value::Builtin(Builtin::Float),
        Value::Str(_) => Value::Builtin(Builtin::Str),
        Value::Range { .. } => Value::Builtin(Builtin::Range),
        Value::Exception(exc) => Value::ExcType(exc.kind),
        Value::Ref(id) => match heap.get(*id) {
            ObjData::List(_) => Value::Builtin(Builtin::List),
            ObjData::Tuple(_) => Value::Builtin(Builtin::Tuple),
            ObjData::Dict(_) => Value::Builtin(Builtin::Dict),
            ObjData::Set(_) => Value::Builtin(Builtin::Set),
            ObjData::Instance(instance) => Value::Ref(instance.class),
            // Types without a reachable class object display as a name.
            ObjData::Function(_) => Value::str("<class 'function'>"),
            ObjData::Class(_) => Value::str("<class 'type'>"),
        },
        _ => Value::str(format!("<class '{}'>", value.type_name(heap))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::NoLimitTracker;

    fn with_ctx<R>(f: impl FnOnce(&mut HostCtx<'_, NoLimitTracker>) -> R) -> R {
        let mut heap = GuestHeap::new(NoLimitTracker);
        let mut stdout = StdoutBuffer::new();
        let mut input = ScriptedInput::new("");
        let mut ctx = HostCtx {
            heap: &mut heap,
            stdout: &mut stdout,
            input: &mut input,
        };
        f(&mut ctx)
    }

    #[test]
    fn environment_respects_allow_list_and_forces_io_stubs() {
        let table = environment(&["len".to_owned(), "abs".to_owned()]);
        assert!(table.contains_key("len"));
        assert!(table.contains_key("abs"));
        assert!(!table.contains_key("sorted"));
        // The replacement stubs are always installed.
        assert!(table.contains_key("print"));
        assert!(table.contains_key("input"));
        assert!(table.contains_key("open"));
    }

    #[test]
    fn print_uses_sep_and_end() {
        with_ctx(|ctx| {
            call_builtin(
                ctx,
                Builtin::Print,
                vec![Value::Int(1), Value::Int(2)],
                vec![
                    ("sep".to_owned(), Value::str("-")),
                    ("end".to_owned(), Value::str("!")),
                ],
            )
            .unwrap();
            assert_eq!(ctx.stdout.take_delta(), "1-2!");
        });
    }

    #[test]
    fn open_is_always_blocked() {
        with_ctx(|ctx| {
            let err = call_builtin(ctx, Builtin::Open, vec![Value::str("x")], vec![]).unwrap_err();
            assert!(matches!(err, RunError::Exc(e) if e.kind == ExcKind::Permission));
        });
    }

    #[test]
    fn int_parsing() {
        with_ctx(|ctx| {
            assert!(matches!(
                call_builtin(ctx, Builtin::Int, vec![Value::str(" 42 ")], vec![]),
                Ok(Value::Int(42))
            ));
            let err = call_builtin(ctx, Builtin::Int, vec![Value::str("4x")], vec![]).unwrap_err();
            assert!(matches!(err, RunError::Exc(e) if e.kind == ExcKind::Value));
        });
    }

    #[test]
    fn sorted_reverse_kwarg() {
        with_ctx(|ctx| {
            let list = ctx
                .heap
                .alloc(ObjData::List(vec![Value::Int(2), Value::Int(1), Value::Int(3)]))
                .unwrap();
            let result = call_builtin(
                ctx,
                Builtin::Sorted,
                vec![Value::Ref(list)],
                vec![("reverse".to_owned(), Value::Bool(true))],
            )
            .unwrap();
            let Value::Ref(id) = result else { panic!("sorted returns a list") };
            let ObjData::List(items) = ctx.heap.get(id) else {
                panic!("sorted returns a list")
            };
            assert!(matches!(items.as_slice(), [Value::Int(3), Value::Int(2), Value::Int(1)]));
        });
    }

    #[test]
    fn round_with_ndigits_preserves_int() {
        with_ctx(|ctx| {
            assert!(matches!(
                call_builtin(ctx, Builtin::Round, vec![Value::Int(1234), Value::Int(-2)], vec![]),
                Ok(Value::Int(1200))
            ));
            // Ties go to the even multiple.
            assert!(matches!(
                call_builtin(ctx, Builtin::Round, vec![Value::Int(1250), Value::Int(-2)], vec![]),
                Ok(Value::Int(1200))
            ));
            assert!(matches!(
                call_builtin(ctx, Builtin::Round, vec![Value::Int(1350), Value::Int(-2)], vec![]),
                Ok(Value::Int(1400))
            ));
            // Non-negative ndigits leaves an int untouched.
            assert!(matches!(
                call_builtin(ctx, Builtin::Round, vec![Value::Int(1234), Value::Int(2)], vec![]),
                Ok(Value::Int(1234))
            ));
            // Floats still round as floats.
            let result = call_builtin(ctx, Builtin::Round, vec![Value::Float(2.5), Value::Int(0)], vec![]).unwrap();
            assert!(matches!(result, Value::Float(f) if f == 2.0));
        });
    }

    #[test]
    fn range_validation() {
        with_ctx(|ctx| {
            assert!(matches!(
                call_builtin(ctx, Builtin::Range, vec![Value::Int(5)], vec![]),
                Ok(Value::Range { start: 0, stop: 5, step: 1 })
            ));
            let err = call_builtin(
                ctx,
                Builtin::Range,
                vec![Value::Int(0), Value::Int(5), Value::Int(0)],
                vec![],
            )
            .unwrap_err();
            assert!(matches!(err, RunError::Exc(e) if e.kind == ExcKind::Value));
        });
    }
}
