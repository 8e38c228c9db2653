//! End-to-end trace collection tests.
//!
//! These drive the collector directly (validation is the supervisor's job)
//! and check both concrete scenarios and the structural invariants every
//! trace must satisfy.

use std::collections::HashSet;

use stepscope::{
    Config, ExecutionEvent, EventPayload, GuestFailure, TraceCollector, TraceData, TraceOutcome, ValueRepr,
};

fn run(code: &str) -> TraceOutcome {
    TraceCollector::new(code, "", &Config::default()).trace()
}

fn run_with_input(code: &str, input: &str) -> TraceOutcome {
    TraceCollector::new(code, input, &Config::default()).trace()
}

/// Checks the invariants that must hold for every trace.
fn assert_trace_invariants(trace: &TraceData) {
    assert_eq!(trace.total_steps, trace.steps.len());
    for (index, step) in trace.steps.iter().enumerate() {
        assert_eq!(step.step as usize, index, "step numbering must be dense");

        let heap_ids: HashSet<u32> = step.heap.iter().map(|obj| obj.id).collect();
        assert_eq!(heap_ids.len(), step.heap.len(), "heap ids must be unique");

        for frame in &step.frames {
            for (name, variable) in &frame.locals {
                assert!(!(name.starts_with("__") && name.ends_with("__")));
                if variable.kind.is_heap() {
                    let id = variable.heap_id.expect("heap-kind variables carry a heap id");
                    assert!(heap_ids.contains(&id), "variable {name} points at a missing heap id");
                } else {
                    assert!(variable.heap_id.is_none());
                }
            }
        }

        for obj in &step.heap {
            for reference in &obj.references {
                assert!(heap_ids.contains(reference), "dangling reference in heap object");
            }
            if let Some(structure) = &obj.structure {
                assert_structure_refs(structure, &heap_ids);
            }
        }
    }
}

fn assert_structure_refs(repr: &ValueRepr, heap_ids: &HashSet<u32>) {
    match repr {
        ValueRepr::Ref { target, .. } => assert!(heap_ids.contains(target), "dangling structure ref"),
        ValueRepr::Items(items) => {
            for item in items {
                assert_structure_refs(item, heap_ids);
            }
        }
        ValueRepr::Entries(entries) => {
            for value in entries.values() {
                assert_structure_refs(value, heap_ids);
            }
        }
        _ => {}
    }
}

// === Straight-line execution ===

#[test]
fn straight_line_program() {
    let outcome = run("x = 1\ny = x + 1\nprint(y)");
    assert!(outcome.failure.is_none());
    assert_eq!(outcome.stdout, "2\n");
    assert_trace_invariants(&outcome.trace);

    let events: Vec<ExecutionEvent> = outcome.trace.steps.iter().map(|s| s.event).collect();
    assert_eq!(events.first(), Some(&ExecutionEvent::Start));
    assert_eq!(events.last(), Some(&ExecutionEvent::End));
    let line_steps = events.iter().filter(|e| **e == ExecutionEvent::Line).count();
    assert_eq!(line_steps, 3);

    // No containers anywhere: the heap stays empty.
    assert!(outcome.trace.steps.iter().all(|s| s.heap.is_empty()));

    // Output concatenation equals the reported stdout.
    let concatenated: String = outcome.trace.steps.iter().map(|s| s.stdout_delta.as_str()).collect();
    assert_eq!(concatenated, outcome.stdout);
}

#[test]
fn start_step_shape() {
    let outcome = run("x = 1");
    let start = &outcome.trace.steps[0];
    assert_eq!(start.step, 0);
    assert_eq!(start.line, 1);
    assert_eq!(start.source_line_text, "x = 1");
    assert_eq!(start.frames.len(), 1);
    assert!(start.frames[0].is_module_level);
    assert_eq!(start.frames[0].function_name, "<module>");
    assert!(start.heap.is_empty());
}

#[test]
fn module_call_and_return_events_bracket_the_lines() {
    let outcome = run("x = 1");
    let events: Vec<ExecutionEvent> = outcome.trace.steps.iter().map(|s| s.event).collect();
    assert_eq!(
        events,
        vec![
            ExecutionEvent::Start,
            ExecutionEvent::Call,
            ExecutionEvent::Line,
            ExecutionEvent::Return,
            ExecutionEvent::End,
        ]
    );
    let Some(EventPayload::Call { function }) = &outcome.trace.steps[1].event_payload else {
        panic!("call step carries the function name");
    };
    assert_eq!(function, "<module>");
}

// === Aliasing and the heap graph ===

#[test]
fn aliased_list_shares_one_heap_id() {
    let outcome = run("a = [1, 2]\nb = a\nb.append(3)\nprint(a)");
    assert!(outcome.failure.is_none());
    assert_eq!(outcome.stdout, "[1, 2, 3]\n");
    assert_trace_invariants(&outcome.trace);

    let last = outcome.trace.steps.last().unwrap();
    assert_eq!(last.event, ExecutionEvent::End);

    // One list object in the final heap, fully evolved.
    assert_eq!(last.heap.len(), 1);
    let list = &last.heap[0];
    assert_eq!(list.length, Some(3));
    assert_eq!(list.display, "[1, 2, 3]");

    let module = &last.frames[0];
    let a = &module.locals["a"];
    let b = &module.locals["b"];
    assert_eq!(a.heap_id, Some(list.id));
    assert_eq!(b.heap_id, Some(list.id));
}

#[test]
fn heap_ids_stay_stable_across_steps() {
    let outcome = run("a = [1]\nb = [2]\na.append(9)");
    assert_trace_invariants(&outcome.trace);
    // Collect the id the name `a` maps to in every step that has it.
    let mut ids = HashSet::new();
    for step in &outcome.trace.steps {
        if let Some(variable) = step.frames.first().and_then(|f| f.locals.get("a")) {
            ids.insert(variable.heap_id.unwrap());
        }
    }
    assert_eq!(ids.len(), 1, "one identity, one id, for the whole trace");
}

#[test]
fn cyclic_structures_are_finite() {
    let outcome = run("a = []\na.append(a)");
    assert!(outcome.failure.is_none());
    assert_trace_invariants(&outcome.trace);
    let last = outcome.trace.steps.last().unwrap();
    assert_eq!(last.heap.len(), 1);
    let obj = &last.heap[0];
    assert_eq!(obj.references, vec![obj.id]);
    assert_eq!(obj.display, "[[...]]");
}

#[test]
fn nested_structure_uses_refs() {
    let outcome = run("inner = [1]\nouter = [inner, 2]");
    assert_trace_invariants(&outcome.trace);
    let last = outcome.trace.steps.last().unwrap();
    assert_eq!(last.heap.len(), 2);
    let outer = last
        .heap
        .iter()
        .find(|obj| obj.length == Some(2))
        .expect("outer list is in the heap");
    let Some(ValueRepr::Items(items)) = &outer.structure else {
        panic!("outer list has a structure");
    };
    assert!(matches!(items[0], ValueRepr::Ref { .. }));
    assert_eq!(items[1], ValueRepr::Int(2));
}

// === Calls, returns, and recursion ===

#[test]
fn recursive_calls_produce_matching_events() {
    let outcome = run("def f(n):\n    return f(n-1) if n else 0\nf(5)");
    assert!(outcome.failure.is_none());
    assert_trace_invariants(&outcome.trace);

    let f_calls = outcome
        .trace
        .steps
        .iter()
        .filter(|s| {
            s.event == ExecutionEvent::Call
                && matches!(&s.event_payload, Some(EventPayload::Call { function }) if function == "f")
        })
        .count();
    assert_eq!(f_calls, 6);

    let f_returns = outcome
        .trace
        .steps
        .iter()
        .filter(|s| s.event == ExecutionEvent::Return && s.frames.len() > 1)
        .count();
    assert_eq!(f_returns, 6);

    // At the innermost call the stack is the module frame plus six
    // activations of f.
    let deepest = outcome.trace.steps.iter().map(|s| s.frames.len()).max().unwrap();
    assert_eq!(deepest, 7);
}

#[test]
fn return_value_is_serialized() {
    let outcome = run("def f():\n    return 41\nx = f() + 1");
    let returned: Vec<&EventPayload> = outcome
        .trace
        .steps
        .iter()
        .filter(|s| s.event == ExecutionEvent::Return)
        .filter_map(|s| s.event_payload.as_ref())
        .collect();
    assert!(
        returned
            .iter()
            .any(|p| matches!(p, EventPayload::Return { return_value } if *return_value == ValueRepr::Int(41)))
    );
}

#[test]
fn function_locals_are_visible_in_frames() {
    let outcome = run("def add(a, b):\n    total = a + b\n    return total\nadd(2, 3)");
    assert_trace_invariants(&outcome.trace);
    let return_step = outcome
        .trace
        .steps
        .iter()
        .find(|s| s.event == ExecutionEvent::Return && s.frames.len() == 2)
        .expect("a return step inside add");
    let frame = &return_step.frames[1];
    assert_eq!(frame.function_name, "add");
    assert!(!frame.is_module_level);
    assert_eq!(frame.locals["a"].display, ValueRepr::Int(2));
    assert_eq!(frame.locals["b"].display, ValueRepr::Int(3));
    assert_eq!(frame.locals["total"].display, ValueRepr::Int(5));
    assert!(frame.global_names.contains(&"add".to_owned()));
}

// === Exceptions ===

#[test]
fn division_by_zero_traces_an_exception() {
    let outcome = run("1/0");
    // The trace describes the failure, so it is a completed trace with an
    // exception recorded.
    let Some(GuestFailure::Exception { exception_type, .. }) = &outcome.failure else {
        panic!("uncaught exception is reported");
    };
    assert_eq!(exception_type, "ZeroDivisionError");
    assert!(outcome.stdout.is_empty());

    let last = outcome.trace.steps.last().unwrap();
    assert_eq!(last.event, ExecutionEvent::Exception);
    let Some(EventPayload::Exception { exception_type, .. }) = &last.event_payload else {
        panic!("exception step carries the exception payload");
    };
    assert_eq!(exception_type, "ZeroDivisionError");
}

#[test]
fn caught_exception_continues_and_records_the_raise() {
    let outcome = run("try:\n    1/0\nexcept ZeroDivisionError as e:\n    print('caught')");
    assert!(outcome.failure.is_none());
    assert_eq!(outcome.stdout, "caught\n");
    assert!(
        outcome
            .trace
            .steps
            .iter()
            .any(|s| s.event == ExecutionEvent::Exception)
    );
    assert_eq!(outcome.trace.steps.last().unwrap().event, ExecutionEvent::End);
}

#[test]
fn raised_exception_carries_its_message() {
    let outcome = run("raise ValueError('bad value')");
    let Some(GuestFailure::Exception { exception_type, message }) = &outcome.failure else {
        panic!("uncaught exception is reported");
    };
    assert_eq!(exception_type, "ValueError");
    assert_eq!(message, "bad value");
}

// === Scripted input ===

#[test]
fn scripted_input_feeds_lines_and_echoes_prompt() {
    let outcome = run_with_input("name = input('Name: ')\nprint(name)", "Ada");
    assert!(outcome.failure.is_none());
    assert_eq!(outcome.stdout, "Name: Ada\nAda\n");
}

#[test]
fn exhausted_input_returns_empty_string() {
    let outcome = run_with_input("a = input('> ')\nb = input('> ')\nprint(a + '|' + b)", "one");
    assert!(outcome.failure.is_none());
    assert_eq!(outcome.stdout, "> one\n> \none|\n");
}

// === Step ceiling ===

#[test]
fn step_ceiling_boundary() {
    // `x = 1\ny = 2` fires exactly four visible events: the module call,
    // two lines, and the module return.
    let config = Config::default();
    let exact = TraceCollector::new("x = 1\ny = 2", "", &config).with_max_steps(4).trace();
    assert!(!exact.trace.max_steps_reached);

    let truncated = TraceCollector::new("x = 1\ny = 2", "", &config).with_max_steps(3).trace();
    assert!(truncated.trace.max_steps_reached);
    assert_trace_invariants(&truncated.trace);
}

#[test]
fn truncated_trace_still_ends_cleanly() {
    let outcome = TraceCollector::new("for i in range(100):\n    x = i", "", &Config::default())
        .with_max_steps(10)
        .trace();
    assert!(outcome.trace.max_steps_reached);
    assert!(outcome.failure.is_none());
    assert_eq!(outcome.trace.steps.last().unwrap().event, ExecutionEvent::End);
    // Eleven steps: start, ten recorded events, minus nothing, plus the
    // synthetic end.
    assert_eq!(outcome.trace.total_steps, 12);
    assert_trace_invariants(&outcome.trace);
}

// === Truncation caps ===

#[test]
fn long_strings_truncate_in_snapshots() {
    let outcome = run("s = 'x' * 150\nxs = [s]");
    assert_trace_invariants(&outcome.trace);
    let last = outcome.trace.steps.last().unwrap();
    let module = &last.frames[0];
    let ValueRepr::Str(display) = &module.locals["s"].display else {
        panic!("string inlines as a string");
    };
    assert_eq!(display.chars().count(), 103);
    assert!(display.ends_with("..."));
}

#[test]
fn oversized_containers_show_fifty_elements_and_marker() {
    let outcome = run("xs = list(range(60))");
    let last = outcome.trace.steps.last().unwrap();
    let list = last.heap.iter().find(|obj| obj.length == Some(60)).unwrap();
    let Some(ValueRepr::Items(items)) = &list.structure else {
        panic!("list structure is a sequence");
    };
    assert_eq!(items.len(), 51);
    assert_eq!(items[50], ValueRepr::Str("...".to_owned()));
}

// === Determinism ===

#[test]
fn repeated_runs_are_observationally_equal() {
    let code = "a = [1]\nb = {'k': a}\nfor i in range(3):\n    a.append(i)\nprint(a)";
    let first = run(code);
    let second = run(code);
    assert_eq!(first.stdout, second.stdout);
    assert_eq!(first.trace.total_steps, second.trace.total_steps);
    assert_eq!(first.trace.max_steps_reached, second.trace.max_steps_reached);
    for (a, b) in first.trace.steps.iter().zip(&second.trace.steps) {
        assert_eq!(a.event, b.event);
        assert_eq!(a.line, b.line);
        assert_eq!(a.stdout_delta, b.stdout_delta);
        assert_eq!(a.heap.len(), b.heap.len());
    }
}

// === Classes and instances ===

#[test]
fn instances_carry_identity_and_class_name() {
    let code = "class Point:\n    def __init__(self, x, y):\n        self.x = x\n        self.y = y\np = Point(1, 2)\nq = p";
    let outcome = run(code);
    assert!(outcome.failure.is_none(), "failure: {:?}", outcome.failure);
    assert_trace_invariants(&outcome.trace);
    let last = outcome.trace.steps.last().unwrap();
    let module = &last.frames[0];
    let p = &module.locals["p"];
    let q = &module.locals["q"];
    assert_eq!(p.kind, stepscope::VariableKind::Instance);
    assert_eq!(p.type_name, "Point");
    assert_eq!(p.heap_id, q.heap_id);

    let instance = last.heap.iter().find(|obj| obj.id == p.heap_id.unwrap()).unwrap();
    let Some(ValueRepr::Entries(shape)) = &instance.structure else {
        panic!("instance structure reports the class");
    };
    assert_eq!(shape["class"], ValueRepr::Str("Point".to_owned()));
}

#[test]
fn instance_attribute_containers_appear_in_references() {
    let code = "class Box:\n    def __init__(self):\n        self.items = []\nb = Box()\nb.items.append(1)";
    let outcome = run(code);
    assert!(outcome.failure.is_none(), "failure: {:?}", outcome.failure);
    assert_trace_invariants(&outcome.trace);
    let last = outcome.trace.steps.last().unwrap();
    let instance = last
        .heap
        .iter()
        .find(|obj| obj.kind == stepscope::VariableKind::Instance)
        .unwrap();
    assert_eq!(instance.references.len(), 1);
    let list_id = instance.references[0];
    let list = last.heap.iter().find(|obj| obj.id == list_id).unwrap();
    assert_eq!(list.length, Some(1));
}

// === Unsupported constructs ===

#[test]
fn unsupported_syntax_is_reported_not_executed() {
    let outcome = run("f = lambda x: x");
    let Some(GuestFailure::Unsupported(message)) = &outcome.failure else {
        panic!("lambdas are outside the supported subset");
    };
    assert!(message.contains("lambda"));
}
