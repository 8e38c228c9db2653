//! stepscope — a sandboxed, step-tracing Python execution backend.
//!
//! The crate accepts a snippet of Python source, validates it against a
//! multi-layer security gate, executes it in an embedded interpreter under
//! strict resource ceilings, and returns a complete step-by-step trace:
//! every executed line, call, return, and exception, with a snapshot of the
//! live frames and of the heap graph reachable from them. A frontend can
//! replay the trace to reconstruct the program's evolving memory diagram.
//!
//! # Entry points
//!
//! [`Supervisor::execute`] is the service surface: worker pool, wall-clock
//! timeout, per-session cancellation, one typed [`ExecutionResult`] per
//! call. [`TraceCollector`] is the library surface underneath it: one
//! validated source string in, one [`TraceData`] out.
//!
//! ```
//! use stepscope::{Config, ExecuteRequest, ExecutionStatus, Supervisor};
//!
//! let supervisor = Supervisor::new(Config::default());
//! let result = supervisor.execute(ExecuteRequest::new("x = 1\nprint(x + 1)"));
//! assert_eq!(result.status, ExecutionStatus::Completed);
//! assert_eq!(result.stdout, "2\n");
//! ```

mod builtins;
mod collector;
mod config;
mod exc;
mod heap;
mod interp;
mod io;
mod lower;
mod methods;
mod modules;
mod ops;
mod parse;
mod registry;
mod resource;
mod snapshot;
mod supervisor;
mod trace;
mod validate;
mod value;

pub use crate::{
    collector::{GuestFailure, TraceCollector, TraceOutcome},
    config::Config,
    lower::LowerError,
    parse::SyntaxFault,
    resource::{
        DEFAULT_MAX_RECURSION_DEPTH, LimitedTracker, NoLimitTracker, ResourceError, ResourceLimits, ResourceTracker,
    },
    supervisor::{ExecuteOptions, ExecuteRequest, Supervisor},
    trace::{
        EventPayload, ExceptionSummary, ExecutionEvent, ExecutionResult, ExecutionStatus, ExecutionStep, Frame,
        HeapObject, TraceData, ValueRepr, Variable, VariableKind,
    },
    validate::{ValidationError, Validator, sanitize},
};
