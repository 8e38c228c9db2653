//! Guest exceptions and the interpreter's error channel.
//!
//! Guest-visible failures ([`GuestExc`]) are ordinary Python exceptions:
//! they can be caught by `except` and, when uncaught, end up as an
//! `Exception` step in the trace. Resource failures are uncatchable; the
//! sandbox, not the guest, decides when execution stops.

use crate::resource::ResourceError;

/// Closed set of guest exception types.
///
/// `except` clauses match by name; `Exception` catches everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExcKind {
    Type,
    Value,
    Name,
    ZeroDivision,
    Index,
    Key,
    Attribute,
    StopIteration,
    Runtime,
    Overflow,
    Permission,
    ModuleNotFound,
    Import,
    Assertion,
    NotImplementedErr,
    Exception,
}

impl ExcKind {
    /// The Python-facing type name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Type => "TypeError",
            Self::Value => "ValueError",
            Self::Name => "NameError",
            Self::ZeroDivision => "ZeroDivisionError",
            Self::Index => "IndexError",
            Self::Key => "KeyError",
            Self::Attribute => "AttributeError",
            Self::StopIteration => "StopIteration",
            Self::Runtime => "RuntimeError",
            Self::Overflow => "OverflowError",
            Self::Permission => "PermissionError",
            Self::ModuleNotFound => "ModuleNotFoundError",
            Self::Import => "ImportError",
            Self::Assertion => "AssertionError",
            Self::NotImplementedErr => "NotImplementedError",
            Self::Exception => "Exception",
        }
    }

    /// Resolves an exception type name used in guest source.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "TypeError" => Self::Type,
            "ValueError" => Self::Value,
            "NameError" => Self::Name,
            "ZeroDivisionError" => Self::ZeroDivision,
            "IndexError" => Self::Index,
            "KeyError" => Self::Key,
            "AttributeError" => Self::Attribute,
            "StopIteration" => Self::StopIteration,
            "RuntimeError" => Self::Runtime,
            "OverflowError" => Self::Overflow,
            "PermissionError" => Self::Permission,
            "ModuleNotFoundError" => Self::ModuleNotFound,
            "ImportError" => Self::Import,
            "AssertionError" => Self::Assertion,
            "NotImplementedError" => Self::NotImplementedErr,
            "Exception" => Self::Exception,
            _ => return None,
        })
    }

    /// Returns true when an `except {handler}` clause catches `self`.
    pub fn caught_by(self, handler: Self) -> bool {
        if handler == Self::Exception {
            return true;
        }
        if self == handler {
            return true;
        }
        // ModuleNotFoundError subclasses ImportError.
        self == Self::ModuleNotFound && handler == Self::Import
    }
}

/// A raised guest exception.
#[derive(Debug, Clone)]
pub(crate) struct GuestExc {
    pub kind: ExcKind,
    pub message: String,
    /// Whether an `Exception` trace step was already recorded for this
    /// raise. Set by the innermost statement that observes the error so the
    /// event fires exactly once, at the raise site.
    pub traced: bool,
}

impl GuestExc {
    pub fn new(kind: ExcKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            traced: false,
        }
    }
}

/// Error channel threaded through the interpreter.
#[derive(Debug)]
pub(crate) enum RunError {
    /// A guest exception, catchable by `except`.
    Exc(Box<GuestExc>),
    /// A resource ceiling was hit; uncatchable, aborts the trace.
    Resource(ResourceError),
}

pub(crate) type RunResult<T> = Result<T, RunError>;

impl RunError {
    pub fn exc(kind: ExcKind, message: impl Into<String>) -> Self {
        Self::Exc(Box::new(GuestExc::new(kind, message)))
    }

    pub fn type_err(message: impl Into<String>) -> Self {
        Self::exc(ExcKind::Type, message)
    }

    pub fn value_err(message: impl Into<String>) -> Self {
        Self::exc(ExcKind::Value, message)
    }

    pub fn name_err(name: &str) -> Self {
        Self::exc(ExcKind::Name, format!("name '{name}' is not defined"))
    }

    pub fn zero_division(message: impl Into<String>) -> Self {
        Self::exc(ExcKind::ZeroDivision, message)
    }
}

impl From<ResourceError> for RunError {
    fn from(err: ResourceError) -> Self {
        Self::Resource(err)
    }
}
