//! JSON serialization tests: every field of a real execution result must
//! survive a round trip through serde_json.

use pretty_assertions::assert_eq;
use stepscope::{Config, ExecuteRequest, ExecutionResult, Supervisor};

fn run_to_result(code: &str) -> ExecutionResult {
    let supervisor = Supervisor::new(Config::default());
    supervisor.execute(ExecuteRequest::new(code))
}

#[test]
fn completed_result_round_trips() {
    let result = run_to_result("a = [1, 'two', {'k': [3]}]\nb = a\nprint(len(a))");
    let json = serde_json::to_string(&result).expect("results are serializable");
    let back: ExecutionResult = serde_json::from_str(&json).expect("results deserialize");
    assert_eq!(back, result);
}

#[test]
fn exception_result_round_trips() {
    let result = run_to_result("xs = [1]\nxs[5]");
    let json = serde_json::to_string(&result).expect("results are serializable");
    let back: ExecutionResult = serde_json::from_str(&json).expect("results deserialize");
    assert_eq!(back, result);
}

#[test]
fn security_violation_round_trips() {
    let result = run_to_result("import subprocess");
    let json = serde_json::to_string(&result).expect("results are serializable");
    let back: ExecutionResult = serde_json::from_str(&json).expect("results deserialize");
    assert_eq!(back, result);
}

#[test]
fn wire_shape_of_statuses_and_kinds() {
    let result = run_to_result("x = {1: 'a'}");
    let json = serde_json::to_value(&result).expect("results are serializable");
    assert_eq!(json["status"], "completed");
    let steps = json["trace"]["steps"].as_array().expect("steps serialize as an array");
    assert_eq!(steps[0]["event"], "start");
    // Heap objects carry lowercase kind tags on the wire.
    let last = steps.last().unwrap();
    let heap = last["heap"].as_array().expect("heap serializes as an array");
    assert_eq!(heap[0]["kind"], "dict");
}

#[test]
fn non_finite_floats_degrade_to_strings() {
    let result = run_to_result("import math\nx = math.inf\nxs = [x]");
    let json = serde_json::to_string(&result).expect("non-finite floats must not poison serialization");
    assert!(json.contains("\"inf\""));
    let back: ExecutionResult = serde_json::from_str(&json).expect("results deserialize");
    assert_eq!(back.status, result.status);
}
