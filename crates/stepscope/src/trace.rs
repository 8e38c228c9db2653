//! Typed results produced by one traced execution.
//!
//! Everything in this module is purely descriptive: the supervisor and trace
//! collector build these values, the transport layer serializes them. All
//! types round-trip through JSON losslessly (integers stay within i64, floats
//! are finite, there are no binary blobs).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Closed tag set classifying every guest value.
///
/// `Instance` means "user-defined object with identity". The five kinds
/// `{List, Tuple, Dict, Set, Instance}` are the *heap kinds*: values that
/// carry identity and may be aliased, and therefore appear in the heap
/// snapshot rather than inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum VariableKind {
    Int,
    Float,
    Bool,
    Str,
    #[serde(rename = "NoneType")]
    #[strum(serialize = "NoneType")]
    None,
    List,
    Tuple,
    Dict,
    Set,
    Function,
    Class,
    Instance,
    Module,
    Other,
}

impl VariableKind {
    /// Returns true for kinds whose values carry identity (and a heap id).
    #[must_use]
    pub fn is_heap(self) -> bool {
        matches!(self, Self::List | Self::Tuple | Self::Dict | Self::Set | Self::Instance)
    }

    /// Returns true for kinds whose values can be mutated in place.
    #[must_use]
    pub fn is_mutable(self) -> bool {
        matches!(self, Self::List | Self::Dict | Self::Set | Self::Instance)
    }

    /// Returns true for ordered, indexable kinds.
    #[must_use]
    pub fn is_sequence(self) -> bool {
        matches!(self, Self::List | Self::Tuple | Self::Str)
    }
}

/// Structural form of a guest value.
///
/// Scalars are inlined; heap-kind children are replaced by a
/// `{ref, kind}` link so aliasing and cycles stay representable in a finite
/// snapshot. Container overflow past the serializer's element cap appears as
/// a trailing `"..."` string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueRepr {
    /// The guest `None`.
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Link to a heap object by id.
    Ref {
        #[serde(rename = "ref")]
        target: u32,
        kind: VariableKind,
    },
    /// Elements of a list, tuple or set.
    Items(Vec<ValueRepr>),
    /// Entries of a dict (keys stringified) or the shape of a function/class.
    Entries(IndexMap<String, ValueRepr>),
}

/// One serialized object in the heap snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeapObject {
    /// Stable small integer, unique within a single trace, never reused.
    pub id: u32,
    pub kind: VariableKind,
    /// The guest type's display name (`list`, `dict`, a class name, ...).
    pub type_name: String,
    /// Truncated printable form, at most 200 characters.
    pub display: String,
    /// Element structure for containers; `None` for opaque objects.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structure: Option<ValueRepr>,
    /// Element count, if the object has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    /// Best-effort memory footprint in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<usize>,
    /// Unique set of heap ids this object points at directly (one hop).
    pub references: Vec<u32>,
}

/// A single name binding inside a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub kind: VariableKind,
    pub type_name: String,
    /// Inline scalar value, or the string `ref:<heap_id>` for heap kinds.
    pub display: ValueRepr,
    /// Present exactly when `kind.is_heap()`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heap_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    pub is_mutable: bool,
    pub is_sequence: bool,
    /// Python-style repr for display.
    pub repr: String,
}

/// One visible level of the guest call stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Function name, `<module>` for the top level.
    pub function_name: String,
    /// Line currently executing in this frame.
    pub line: u32,
    pub source_filename: String,
    /// Local bindings, dunder and interpreter-internal names excluded.
    pub locals: IndexMap<String, Variable>,
    /// Names (only) bound at module scope, same filtering as locals.
    pub global_names: Vec<String>,
    pub is_module_level: bool,
}

/// The event that produced a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ExecutionEvent {
    Start,
    Line,
    Call,
    Return,
    Exception,
    End,
}

/// Event-specific detail attached to a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    Call {
        function: String,
    },
    Return {
        return_value: ValueRepr,
    },
    Exception {
        #[serde(rename = "type")]
        exception_type: String,
        message: String,
    },
}

/// Summary of an uncaught exception, attached to the final step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionSummary {
    #[serde(rename = "type")]
    pub exception_type: String,
    pub message: String,
}

/// One unit of visible execution.
///
/// Steps are immutable once appended; `step` is the dense index into the
/// trace's event order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub step: u32,
    pub line: u32,
    /// Right-stripped text of `line`, empty for synthetic events without a
    /// source mapping.
    pub source_line_text: String,
    pub event: ExecutionEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_payload: Option<EventPayload>,
    /// Visible stack, bottom (module) first.
    pub frames: Vec<Frame>,
    /// Full current snapshot of the heap registry; grows monotonically
    /// within one trace.
    pub heap: Vec<HeapObject>,
    /// Output produced since the previous step.
    pub stdout_delta: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<ExceptionSummary>,
    /// Seconds since trace start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
}

/// A finished trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceData {
    pub code: String,
    pub steps: Vec<ExecutionStep>,
    pub total_steps: usize,
    /// True iff a visible event past the step ceiling was suppressed.
    pub max_steps_reached: bool,
}

/// Terminal status of one call to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionStatus {
    /// The trace ran to its `End` step (including traces that end in a
    /// guest exception: the trace succeeded in describing the failure).
    Completed,
    /// Syntax error, runtime fault, or resource termination.
    Error,
    /// The wall-clock ceiling was hit.
    Timeout,
    /// The validator rejected the source.
    SecurityViolation,
    /// The client withdrew the request.
    Cancelled,
}

/// The single value every call to the supervisor resolves to.
///
/// The core never raises across its boundary: every exit path, including
/// validator rejections, worker faults and timeouts, is a status tag here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<TraceData>,
    pub stdout: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub execution_time_seconds: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_kind_partition() {
        for kind in [
            VariableKind::List,
            VariableKind::Tuple,
            VariableKind::Dict,
            VariableKind::Set,
            VariableKind::Instance,
        ] {
            assert!(kind.is_heap());
        }
        for kind in [
            VariableKind::Int,
            VariableKind::Float,
            VariableKind::Bool,
            VariableKind::Str,
            VariableKind::None,
            VariableKind::Function,
            VariableKind::Class,
            VariableKind::Module,
            VariableKind::Other,
        ] {
            assert!(!kind.is_heap());
        }
    }

    #[test]
    fn kind_wire_names() {
        assert_eq!(serde_json::to_string(&VariableKind::None).unwrap(), "\"NoneType\"");
        assert_eq!(serde_json::to_string(&VariableKind::List).unwrap(), "\"list\"");
        assert_eq!(
            serde_json::to_string(&ExecutionStatus::SecurityViolation).unwrap(),
            "\"security_violation\""
        );
    }

    #[test]
    fn value_repr_round_trip() {
        let repr = ValueRepr::Items(vec![
            ValueRepr::Int(1),
            ValueRepr::Ref {
                target: 2,
                kind: VariableKind::List,
            },
            ValueRepr::Str("...".to_owned()),
        ]);
        let json = serde_json::to_string(&repr).unwrap();
        assert_eq!(json, r#"[1,{"ref":2,"kind":"list"},"..."]"#);
        let back: ValueRepr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, repr);
    }

    #[test]
    fn event_payload_round_trip() {
        let payload = EventPayload::Exception {
            exception_type: "ZeroDivisionError".to_owned(),
            message: "division by zero".to_owned(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: EventPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }
}
