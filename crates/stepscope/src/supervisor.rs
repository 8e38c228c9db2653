//! The execution supervisor (C7): worker pool, resource ceilings, timeout,
//! cancellation, and result marshaling.
//!
//! Every call to [`Supervisor::execute`] resolves to exactly one
//! [`ExecutionResult`]; no guest-attributable failure ever crosses this
//! boundary as an `Err`. Workers are long-lived threads fed from a shared
//! queue; each traced execution owns its interpreter, heap registry, and
//! stdout buffer end-to-end, so nothing is shared between traces but the
//! pool itself.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use crate::{
    collector::{GuestFailure, TraceCollector, TraceOutcome},
    config::Config,
    parse::{LineIndex, parse},
    resource::ResourceError,
    trace::{ExecutionResult, ExecutionStatus},
    validate::{ValidationError, Validator, sanitize},
};

/// Per-call options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteOptions {
    /// When false, the step list is stripped from the result (status and
    /// stdout are still reported).
    #[serde(default = "default_trace")]
    pub trace: bool,
    /// Lowers the configured step ceiling for this call. Values above the
    /// configured ceiling are clamped down to it.
    #[serde(default)]
    pub max_steps: Option<u32>,
}

fn default_trace() -> bool {
    true
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            trace: true,
            max_steps: None,
        }
    }
}

/// One request to execute and trace guest source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub options: Option<ExecuteOptions>,
}

impl ExecuteRequest {
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            input: String::new(),
            session_id: None,
            options: None,
        }
    }

    #[must_use]
    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = input.into();
        self
    }

    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: ExecuteOptions) -> Self {
        self.options = Some(options);
        self
    }
}

struct Job {
    code: String,
    input: String,
    max_steps: u32,
    reply: mpsc::Sender<WorkerReply>,
}

enum WorkerReply {
    Security(String),
    Outcome(Box<TraceOutcome>),
}

/// Wait slice while polling for worker completion, timeout, and
/// cancellation.
const WAIT_SLICE: Duration = Duration::from_millis(25);

/// Worker thread stack size; 64 MiB covers the interpreter's host-stack use
/// at the 1000-frame guest recursion ceiling with a wide margin.
const WORKER_STACK_BYTES: usize = 64 * 1024 * 1024;

/// The execution service. One instance owns the worker pool and the
/// per-session cancellation registry for its lifetime.
pub struct Supervisor {
    config: Config,
    job_tx: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Vec<thread::JoinHandle<()>>,
    cancels: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl Supervisor {
    /// Builds the validator and spawns the worker pool.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let validator = Arc::new(Validator::new(&config));
        let worker_config = Arc::new(config.clone());
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let job_rx = Arc::new(Mutex::new(job_rx));

        let workers = (0..config.workers.max(1))
            .map(|worker_id| {
                let job_rx = Arc::clone(&job_rx);
                let validator = Arc::clone(&validator);
                let config = Arc::clone(&worker_config);
                // The tree-walking interpreter spends host stack per guest
                // frame; size the worker stack for the full recursion
                // ceiling.
                thread::Builder::new()
                    .name(format!("stepscope-worker-{worker_id}"))
                    .stack_size(WORKER_STACK_BYTES)
                    .spawn(move || worker_loop(worker_id, &job_rx, &validator, &config))
                    .expect("worker thread spawn failed")
            })
            .collect();

        Self {
            config,
            job_tx: Mutex::new(Some(job_tx)),
            workers,
            cancels: Mutex::new(HashMap::new()),
        }
    }

    /// Requests cancellation of the execution registered under
    /// `session_id`. Returns true if such an execution was waiting.
    pub fn cancel(&self, session_id: &str) -> bool {
        let cancels = match self.cancels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match cancels.get(session_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Executes one request to a terminal result.
    pub fn execute(&self, request: ExecuteRequest) -> ExecutionResult {
        let start = Instant::now();
        let cancel_flag = request.session_id.as_ref().map(|id| self.register_cancel(id));
        let mut result = self.execute_inner(&request, start, cancel_flag.as_ref());
        if let Some(id) = &request.session_id {
            self.unregister_cancel(id);
        }
        result.execution_time_seconds = start.elapsed().as_secs_f64();
        result
    }

    fn execute_inner(
        &self,
        request: &ExecuteRequest,
        start: Instant,
        cancel_flag: Option<&Arc<AtomicBool>>,
    ) -> ExecutionResult {
        let options = request.options.clone().unwrap_or_default();
        let code = sanitize(&request.code);

        if code.trim().is_empty() {
            return error_result("Empty code provided");
        }
        if request.input.chars().count() > self.config.max_output_length {
            return error_result(&format!(
                "Input exceeds maximum length ({})",
                self.config.max_output_length
            ));
        }

        // Cheap in-process syntax check before taking a worker slot.
        let index = LineIndex::new(&code);
        if let Err(fault) = parse(&code, &index) {
            return error_result(&format!("SyntaxError: {fault}"));
        }

        let max_steps = options
            .max_steps
            .map_or(self.config.max_steps, |requested| requested.min(self.config.max_steps));

        let (reply_tx, reply_rx) = mpsc::channel();
        let job = Job {
            code,
            input: request.input.clone(),
            max_steps,
            reply: reply_tx,
        };
        {
            let tx = match self.job_tx.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let Some(tx) = tx.as_ref() else {
                return error_result("Execution service is shut down");
            };
            if tx.send(job).is_err() {
                return error_result("Execution service is shut down");
            }
        }

        let deadline = start + Duration::from_secs(self.config.max_execution_time);
        let reply = loop {
            // Timeouts take precedence over cancellation.
            if Instant::now() >= deadline {
                tracing::debug!("execution timed out at the wall clock");
                return ExecutionResult {
                    status: ExecutionStatus::Timeout,
                    trace: None,
                    stdout: String::new(),
                    stderr: None,
                    error_message: Some(format!(
                        "Execution timed out after {}s",
                        self.config.max_execution_time
                    )),
                    execution_time_seconds: 0.0,
                };
            }
            if cancel_flag.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
                tracing::debug!("execution cancelled by client");
                return ExecutionResult {
                    status: ExecutionStatus::Cancelled,
                    trace: None,
                    stdout: String::new(),
                    stderr: None,
                    error_message: Some("Execution cancelled".to_owned()),
                    execution_time_seconds: 0.0,
                };
            }
            match reply_rx.recv_timeout(WAIT_SLICE) {
                Ok(reply) => break reply,
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return error_result("Worker terminated unexpectedly");
                }
            }
        };

        match reply {
            WorkerReply::Security(reason) => ExecutionResult {
                status: ExecutionStatus::SecurityViolation,
                trace: None,
                stdout: String::new(),
                stderr: None,
                error_message: Some(reason),
                execution_time_seconds: 0.0,
            },
            WorkerReply::Outcome(outcome) => marshal_outcome(*outcome, options.trace),
        }
    }

    fn register_cancel(&self, session_id: &str) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        let mut cancels = match self.cancels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cancels.insert(session_id.to_owned(), Arc::clone(&flag));
        flag
    }

    fn unregister_cancel(&self, session_id: &str) {
        let mut cancels = match self.cancels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cancels.remove(session_id);
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // Dropping the sender disconnects the queue; workers drain and exit.
        if let Ok(mut tx) = self.job_tx.lock() {
            tx.take();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(
    worker_id: usize,
    job_rx: &Arc<Mutex<mpsc::Receiver<Job>>>,
    validator: &Validator,
    config: &Config,
) {
    tracing::debug!(worker_id, "execution worker started");
    loop {
        let job = {
            let Ok(rx) = job_rx.lock() else { break };
            rx.recv()
        };
        let Ok(job) = job else { break };
        tracing::debug!(worker_id, "worker picked up execution");

        let reply = match validator.validate(&job.code) {
            Err(ValidationError::Security(reason)) => WorkerReply::Security(reason),
            Err(ValidationError::Syntax(fault)) => {
                // The supervisor pre-checks syntax; reaching this means the
                // source changed meaning under sanitization. Surface it the
                // same way.
                WorkerReply::Security(format!("Syntax error: {fault}"))
            }
            Ok(()) => {
                let collector =
                    TraceCollector::new(&job.code, &job.input, config).with_max_steps(job.max_steps);
                WorkerReply::Outcome(Box::new(collector.trace()))
            }
        };
        // The supervisor may have timed out and walked away; a dead reply
        // channel is not a worker error.
        let _ = job.reply.send(reply);
    }
    tracing::debug!(worker_id, "execution worker stopped");
}

fn error_result(message: &str) -> ExecutionResult {
    ExecutionResult {
        status: ExecutionStatus::Error,
        trace: None,
        stdout: String::new(),
        stderr: None,
        error_message: Some(message.to_owned()),
        execution_time_seconds: 0.0,
    }
}

/// Maps a finished trace to the result surface.
fn marshal_outcome(outcome: TraceOutcome, keep_trace: bool) -> ExecutionResult {
    let TraceOutcome { trace, stdout, failure } = outcome;
    let trace = keep_trace.then_some(trace);
    match failure {
        None => ExecutionResult {
            status: ExecutionStatus::Completed,
            trace,
            stdout,
            stderr: None,
            error_message: None,
            execution_time_seconds: 0.0,
        },
        // An uncaught guest exception is a completed trace: the trace
        // succeeded in describing the failure.
        Some(GuestFailure::Exception {
            exception_type,
            message,
        }) => ExecutionResult {
            status: ExecutionStatus::Completed,
            trace,
            stdout,
            stderr: Some(format!("{exception_type}: {message}")),
            error_message: None,
            execution_time_seconds: 0.0,
        },
        Some(GuestFailure::Resource(err)) => {
            let message = match err {
                ResourceError::Memory { .. } | ResourceError::Allocation { .. } => "Memory limit exceeded",
                ResourceError::Recursion { .. } => "Maximum recursion depth exceeded",
                ResourceError::Time { .. } | ResourceError::Operation { .. } => "Execution timed out",
            };
            ExecutionResult {
                status: ExecutionStatus::Error,
                trace,
                stdout,
                stderr: None,
                error_message: Some(message.to_owned()),
                execution_time_seconds: 0.0,
            }
        }
        Some(GuestFailure::Unsupported(message)) => ExecutionResult {
            status: ExecutionStatus::Error,
            trace,
            stdout,
            stderr: None,
            error_message: Some(message),
            execution_time_seconds: 0.0,
        },
        Some(GuestFailure::Syntax(fault)) => ExecutionResult {
            status: ExecutionStatus::Error,
            trace,
            stdout,
            stderr: None,
            error_message: Some(format!("SyntaxError: {fault}")),
            execution_time_seconds: 0.0,
        },
    }
}
