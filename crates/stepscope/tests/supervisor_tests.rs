//! Execution supervisor tests: status surface, ceilings, timeout,
//! cancellation, and result marshaling.

use std::time::Duration;

use stepscope::{
    Config, ExecuteOptions, ExecuteRequest, ExecutionStatus, Supervisor,
};

fn quick_config() -> Config {
    Config {
        max_execution_time: 1,
        workers: 2,
        ..Config::default()
    }
}

// === Status: completed ===

#[test]
fn straight_line_completes() {
    let supervisor = Supervisor::new(Config::default());
    let result = supervisor.execute(ExecuteRequest::new("x = 1\ny = x + 1\nprint(y)"));
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.stdout, "2\n");
    assert!(result.error_message.is_none());
    assert!(result.trace.is_some());
    assert!(result.execution_time_seconds >= 0.0);
}

#[test]
fn uncaught_guest_exception_still_completes() {
    let supervisor = Supervisor::new(Config::default());
    let result = supervisor.execute(ExecuteRequest::new("1/0"));
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.stdout, "");
    let stderr = result.stderr.expect("exception summary lands on stderr");
    assert!(stderr.starts_with("ZeroDivisionError"));
}

#[test]
fn pool_is_reusable_across_calls() {
    let supervisor = Supervisor::new(quick_config());
    for expected in ["1\n", "2\n"] {
        let code = format!("print({})", expected.trim());
        let result = supervisor.execute(ExecuteRequest::new(code));
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.stdout, expected);
    }
}

// === Status: security violation ===

#[test]
fn os_import_is_a_security_violation() {
    let supervisor = Supervisor::new(Config::default());
    let result = supervisor.execute(ExecuteRequest::new("import os"));
    assert_eq!(result.status, ExecutionStatus::SecurityViolation);
    assert!(result.trace.is_none());
    let message = result.error_message.expect("rejection carries the reason");
    assert!(message.contains("OS module import blocked"));
}

#[test]
fn eval_is_a_security_violation() {
    let supervisor = Supervisor::new(Config::default());
    let result = supervisor.execute(ExecuteRequest::new("eval('1')"));
    assert_eq!(result.status, ExecutionStatus::SecurityViolation);
}

// === Status: error ===

#[test]
fn syntax_error_is_reported_without_a_worker_round_trip() {
    let supervisor = Supervisor::new(Config::default());
    let result = supervisor.execute(ExecuteRequest::new("def f(:\n  pass"));
    assert_eq!(result.status, ExecutionStatus::Error);
    let message = result.error_message.expect("syntax errors carry a message");
    assert!(message.starts_with("SyntaxError"));
}

#[test]
fn empty_code_is_rejected() {
    let supervisor = Supervisor::new(Config::default());
    let result = supervisor.execute(ExecuteRequest::new("   \n  "));
    assert_eq!(result.status, ExecutionStatus::Error);
}

#[test]
fn oversized_input_is_rejected() {
    let config = Config {
        max_output_length: 8,
        ..Config::default()
    };
    let supervisor = Supervisor::new(config);
    let result = supervisor.execute(ExecuteRequest::new("print(1)").with_input("123456789"));
    assert_eq!(result.status, ExecutionStatus::Error);
}

#[test]
fn runaway_recursion_is_a_resource_error() {
    let supervisor = Supervisor::new(Config::default());
    let request = ExecuteRequest::new("def f():\n    f()\nf()").with_options(ExecuteOptions {
        trace: true,
        max_steps: Some(50),
    });
    let result = supervisor.execute(request);
    assert_eq!(result.status, ExecutionStatus::Error);
    assert_eq!(result.error_message.as_deref(), Some("Maximum recursion depth exceeded"));
    // The partial trace collected before the abort is preserved.
    assert!(result.trace.is_some());
}

#[test]
fn memory_exhaustion_is_a_resource_error() {
    let config = Config {
        max_memory_mb: 1,
        ..Config::default()
    };
    let supervisor = Supervisor::new(config);
    let request = ExecuteRequest::new("xs = []\nwhile True:\n    xs.append([1, 2, 3, 4])").with_options(
        ExecuteOptions {
            trace: true,
            max_steps: Some(20),
        },
    );
    let result = supervisor.execute(request);
    assert_eq!(result.status, ExecutionStatus::Error);
    assert_eq!(result.error_message.as_deref(), Some("Memory limit exceeded"));
}

// === Status: timeout ===

#[test]
fn infinite_loop_times_out() {
    let supervisor = Supervisor::new(quick_config());
    let request = ExecuteRequest::new("while True: pass").with_options(ExecuteOptions {
        trace: true,
        max_steps: Some(10),
    });
    let start = std::time::Instant::now();
    let result = supervisor.execute(request);
    assert_eq!(result.status, ExecutionStatus::Timeout);
    assert!(result.trace.is_none());
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(5), "timeout fired far too late: {elapsed:?}");
}

// === Status: cancelled ===

#[test]
fn cancellation_interrupts_a_waiting_execution() {
    // The wall-clock ceiling stays comfortably above the cancellation
    // point, so the cancel path (not the timeout path) resolves the call.
    let supervisor = Supervisor::new(Config {
        max_execution_time: 2,
        workers: 1,
        ..Config::default()
    });
    std::thread::scope(|scope| {
        let handle = scope.spawn(|| {
            supervisor.execute(
                ExecuteRequest::new("while True: pass")
                    .with_session_id("session-1")
                    .with_options(ExecuteOptions {
                        trace: true,
                        max_steps: Some(10),
                    }),
            )
        });
        // Give the execution time to register and start waiting.
        std::thread::sleep(Duration::from_millis(200));
        assert!(supervisor.cancel("session-1"));
        let result = handle.join().expect("execution thread completes");
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert!(result.trace.is_none());
    });
}

#[test]
fn cancelling_an_unknown_session_is_a_no_op() {
    let supervisor = Supervisor::new(Config::default());
    assert!(!supervisor.cancel("nobody-home"));
}

// === Options ===

#[test]
fn max_steps_option_lowers_the_ceiling() {
    let supervisor = Supervisor::new(Config::default());
    let request = ExecuteRequest::new("for i in range(50):\n    x = i").with_options(ExecuteOptions {
        trace: true,
        max_steps: Some(5),
    });
    let result = supervisor.execute(request);
    assert_eq!(result.status, ExecutionStatus::Completed);
    let trace = result.trace.expect("trace kept");
    assert!(trace.max_steps_reached);
}

#[test]
fn trace_can_be_stripped() {
    let supervisor = Supervisor::new(Config::default());
    let request = ExecuteRequest::new("print('hi')").with_options(ExecuteOptions {
        trace: false,
        max_steps: None,
    });
    let result = supervisor.execute(request);
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert!(result.trace.is_none());
    assert_eq!(result.stdout, "hi\n");
}
