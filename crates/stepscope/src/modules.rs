//! Guest-importable modules.
//!
//! The validator decides which imports are *allowed*; this module decides
//! which are *provided*. Anything allowed but not provided raises a guest
//! `ModuleNotFoundError`, never a host error.

use crate::{
    exc::{ExcKind, RunError, RunResult},
    value::Value,
};

/// A module the runtime provides to guest code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GuestModule {
    Math,
}

impl GuestModule {
    pub fn name(self) -> &'static str {
        match self {
            Self::Math => "math",
        }
    }
}

/// Resolves an import to a provided module.
pub(crate) fn import_module(name: &str) -> Option<GuestModule> {
    match name {
        "math" => Some(GuestModule::Math),
        _ => None,
    }
}

/// A function exposed by a guest module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ModuleFn {
    MathSqrt,
    MathFloor,
    MathCeil,
    MathFabs,
    MathPow,
    MathLog,
    MathLog2,
    MathLog10,
    MathExp,
    MathSin,
    MathCos,
    MathTan,
    MathGcd,
    MathFactorial,
}

impl ModuleFn {
    pub fn name(self) -> &'static str {
        match self {
            Self::MathSqrt => "sqrt",
            Self::MathFloor => "floor",
            Self::MathCeil => "ceil",
            Self::MathFabs => "fabs",
            Self::MathPow => "pow",
            Self::MathLog => "log",
            Self::MathLog2 => "log2",
            Self::MathLog10 => "log10",
            Self::MathExp => "exp",
            Self::MathSin => "sin",
            Self::MathCos => "cos",
            Self::MathTan => "tan",
            Self::MathGcd => "gcd",
            Self::MathFactorial => "factorial",
        }
    }
}

/// Looks up an attribute of a provided module.
pub(crate) fn module_attr(module: GuestModule, name: &str) -> Option<Value> {
    match module {
        GuestModule::Math => math_attr(name),
    }
}

fn math_attr(name: &str) -> Option<Value> {
    use std::f64::consts;
    Some(match name {
        "pi" => Value::Float(consts::PI),
        "e" => Value::Float(consts::E),
        "tau" => Value::Float(consts::TAU),
        "inf" => Value::Float(f64::INFINITY),
        "nan" => Value::Float(f64::NAN),
        "sqrt" => Value::ModuleFn(ModuleFn::MathSqrt),
        "floor" => Value::ModuleFn(ModuleFn::MathFloor),
        "ceil" => Value::ModuleFn(ModuleFn::MathCeil),
        "fabs" => Value::ModuleFn(ModuleFn::MathFabs),
        "pow" => Value::ModuleFn(ModuleFn::MathPow),
        "log" => Value::ModuleFn(ModuleFn::MathLog),
        "log2" => Value::ModuleFn(ModuleFn::MathLog2),
        "log10" => Value::ModuleFn(ModuleFn::MathLog10),
        "exp" => Value::ModuleFn(ModuleFn::MathExp),
        "sin" => Value::ModuleFn(ModuleFn::MathSin),
        "cos" => Value::ModuleFn(ModuleFn::MathCos),
        "tan" => Value::ModuleFn(ModuleFn::MathTan),
        "gcd" => Value::ModuleFn(ModuleFn::MathGcd),
        "factorial" => Value::ModuleFn(ModuleFn::MathFactorial),
        _ => return None,
    })
}

/// Calls a module function with already-evaluated arguments.
pub(crate) fn call_module_fn(func: ModuleFn, args: &[Value]) -> RunResult<Value> {
    match func {
        ModuleFn::MathSqrt => {
            let x = float_arg(func, args)?;
            if x < 0.0 {
                return Err(RunError::value_err("math domain error"));
            }
            Ok(Value::Float(x.sqrt()))
        }
        ModuleFn::MathFloor => Ok(Value::Int(float_arg(func, args)?.floor() as i64)),
        ModuleFn::MathCeil => Ok(Value::Int(float_arg(func, args)?.ceil() as i64)),
        ModuleFn::MathFabs => Ok(Value::Float(float_arg(func, args)?.abs())),
        ModuleFn::MathPow => {
            let (x, y) = float_pair(func, args)?;
            Ok(Value::Float(x.powf(y)))
        }
        ModuleFn::MathLog => {
            let x = float_arg(func, args)?;
            if x <= 0.0 {
                return Err(RunError::value_err("math domain error"));
            }
            Ok(Value::Float(x.ln()))
        }
        ModuleFn::MathLog2 => Ok(Value::Float(float_arg(func, args)?.log2())),
        ModuleFn::MathLog10 => Ok(Value::Float(float_arg(func, args)?.log10())),
        ModuleFn::MathExp => Ok(Value::Float(float_arg(func, args)?.exp())),
        ModuleFn::MathSin => Ok(Value::Float(float_arg(func, args)?.sin())),
        ModuleFn::MathCos => Ok(Value::Float(float_arg(func, args)?.cos())),
        ModuleFn::MathTan => Ok(Value::Float(float_arg(func, args)?.tan())),
        ModuleFn::MathGcd => {
            let (a, b) = int_pair(func, args)?;
            Ok(Value::Int(gcd(a.unsigned_abs(), b.unsigned_abs()) as i64))
        }
        ModuleFn::MathFactorial => {
            let n = int_arg(func, args)?;
            if n < 0 {
                return Err(RunError::value_err("factorial() not defined for negative values"));
            }
            let mut result: i64 = 1;
            for k in 2..=n {
                result = result
                    .checked_mul(k)
                    .ok_or_else(|| RunError::exc(ExcKind::Overflow, "factorial() result too large"))?;
            }
            Ok(Value::Int(result))
        }
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn numeric(func: ModuleFn, value: &Value) -> RunResult<f64> {
    match value {
        Value::Int(i) => Ok(*i as f64),
        Value::Float(f) => Ok(*f),
        Value::Bool(b) => Ok(f64::from(u8::from(*b))),
        _ => Err(RunError::type_err(format!(
            "{}() argument must be a real number",
            func.name()
        ))),
    }
}

fn float_arg(func: ModuleFn, args: &[Value]) -> RunResult<f64> {
    let [value] = args else {
        return Err(RunError::type_err(format!(
            "{}() takes exactly one argument ({} given)",
            func.name(),
            args.len()
        )));
    };
    numeric(func, value)
}

fn float_pair(func: ModuleFn, args: &[Value]) -> RunResult<(f64, f64)> {
    let [a, b] = args else {
        return Err(RunError::type_err(format!(
            "{}() takes exactly 2 arguments ({} given)",
            func.name(),
            args.len()
        )));
    };
    Ok((numeric(func, a)?, numeric(func, b)?))
}

fn int_arg(func: ModuleFn, args: &[Value]) -> RunResult<i64> {
    let [value] = args else {
        return Err(RunError::type_err(format!(
            "{}() takes exactly one argument ({} given)",
            func.name(),
            args.len()
        )));
    };
    match value {
        Value::Int(i) => Ok(*i),
        Value::Bool(b) => Ok(i64::from(*b)),
        _ => Err(RunError::type_err(format!("{}() requires an integer", func.name()))),
    }
}

fn int_pair(func: ModuleFn, args: &[Value]) -> RunResult<(i64, i64)> {
    let [a, b] = args else {
        return Err(RunError::type_err(format!(
            "{}() takes exactly 2 arguments ({} given)",
            func.name(),
            args.len()
        )));
    };
    let to_int = |v: &Value| match v {
        Value::Int(i) => Ok(*i),
        Value::Bool(b) => Ok(i64::from(*b)),
        _ => Err(RunError::type_err(format!("{}() requires integers", func.name()))),
    };
    Ok((to_int(a)?, to_int(b)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn math_constants_and_functions() {
        assert!(matches!(math_attr("pi"), Some(Value::Float(_))));
        assert!(math_attr("no_such_name").is_none());
        let Value::Float(root) = call_module_fn(ModuleFn::MathSqrt, &[Value::Int(9)]).unwrap() else {
            panic!("sqrt returns a float");
        };
        assert!((root - 3.0).abs() < 1e-12);
    }

    #[test]
    fn domain_errors_are_guest_exceptions() {
        let err = call_module_fn(ModuleFn::MathSqrt, &[Value::Int(-1)]).unwrap_err();
        assert!(matches!(err, RunError::Exc(e) if e.kind == ExcKind::Value));
    }

    #[test]
    fn factorial_and_gcd() {
        assert!(matches!(
            call_module_fn(ModuleFn::MathFactorial, &[Value::Int(5)]),
            Ok(Value::Int(120))
        ));
        assert!(matches!(
            call_module_fn(ModuleFn::MathGcd, &[Value::Int(12), Value::Int(-18)]),
            Ok(Value::Int(6))
        ));
    }
}
