//! Step-by-step trace collection (C6).
//!
//! The collector drives the embedded interpreter with itself installed as
//! the step hook. Every visible event becomes one [`ExecutionStep`] carrying
//! the filtered frame stack, the full heap snapshot, and the stdout delta
//! since the previous step. Synthetic `Start`, `End`, and (when an uncaught
//! exception produced no recorded `Exception` event) `Exception` steps
//! bracket the real events.

use std::time::Instant;

use indexmap::IndexMap;

use crate::{
    config::Config,
    exc::RunError,
    heap::GuestHeap,
    interp::{FrameCtx, HookEvent, HookSignal, StepHook, Vm, VmView},
    lower::lower_module,
    parse::{LineIndex, SyntaxFault, parse},
    registry::HeapRegistry,
    resource::{LimitedTracker, ResourceError, ResourceLimits},
    snapshot::{element_repr, make_variable, snapshot_heap},
    trace::{
        EventPayload, ExceptionSummary, ExecutionEvent, ExecutionStep, Frame, TraceData, Variable,
    },
};

/// Filename reported for guest frames.
const GUEST_FILENAME: &str = "<string>";

/// Local names injected by interpreter plumbing, never shown in a frame.
const INTERNAL_NAMES: [&str; 9] = [
    "spawn_main",
    "_main",
    "freeze_support",
    "set_start_method",
    "Process",
    "Queue",
    "pool",
    "_fork",
    "_forkserver",
];

/// Why a trace stopped before a clean `End`.
#[derive(Debug)]
pub enum GuestFailure {
    /// Uncaught guest exception. The trace still describes the failure, so
    /// the run counts as completed.
    Exception { exception_type: String, message: String },
    /// A resource ceiling aborted execution; the trace is partial.
    Resource(ResourceError),
    /// The source parses but uses constructs outside the supported subset.
    Unsupported(String),
    /// The source does not parse.
    Syntax(SyntaxFault),
}

/// Everything one traced execution produced.
#[derive(Debug)]
pub struct TraceOutcome {
    pub trace: TraceData,
    /// Concatenation of every step's `stdout_delta`.
    pub stdout: String,
    pub failure: Option<GuestFailure>,
}

/// Collects a full execution trace for one piece of guest source.
///
/// One collector handles one execution: the step list, heap registry, and
/// stdout accounting live exactly as long as the trace.
#[derive(Debug)]
pub struct TraceCollector {
    code: String,
    input: String,
    allowed_builtins: Vec<String>,
    limits: ResourceLimits,
    max_steps: u32,
}

impl TraceCollector {
    /// Creates a collector with ceilings derived from the configuration.
    #[must_use]
    pub fn new(code: &str, input: &str, config: &Config) -> Self {
        let limits = ResourceLimits::new()
            .max_memory(config.max_memory_bytes())
            .max_duration(std::time::Duration::from_secs(config.max_execution_time + 1))
            .max_allocations(1_000_000);
        Self {
            code: code.to_owned(),
            input: input.to_owned(),
            allowed_builtins: config.allowed_builtins.clone(),
            limits,
            max_steps: config.max_steps,
        }
    }

    /// Lowers the step ceiling for this run (never raises it).
    #[must_use]
    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = self.max_steps.min(max_steps);
        self
    }

    /// Executes the source and returns the finished trace.
    pub fn trace(self) -> TraceOutcome {
        let mut state = CollectorState::new(&self.code, self.max_steps);
        state.push_start_step();

        let index = LineIndex::new(&self.code);
        let module = match parse(&self.code, &index) {
            Ok(module) => module,
            Err(fault) => return state.finish(&self.code, Some(GuestFailure::Syntax(fault))),
        };
        let block = match lower_module(module, &index) {
            Ok(block) => block,
            Err(err) => {
                return state.finish(&self.code, Some(GuestFailure::Unsupported(err.to_string())));
            }
        };

        let tracker = LimitedTracker::new(self.limits);
        let (run_result, leftover, heap) = {
            let mut vm = Vm::new(&mut state, tracker, &self.allowed_builtins, &self.input);
            let run_result = vm.run_module(&block);
            let leftover = vm.stdout.take_delta();
            (run_result, leftover, vm.heap)
        };

        match run_result {
            Ok(()) => {
                state.push_synthetic_step(ExecutionEvent::End, &heap, &leftover, None);
                state.finish(&self.code, None)
            }
            Err(RunError::Exc(exc)) => {
                let summary = ExceptionSummary {
                    exception_type: exc.kind.name().to_owned(),
                    message: exc.message.clone(),
                };
                if state.exception_recorded {
                    // Output flushed during unwinding (finally blocks) still
                    // counts toward the final stdout.
                    state.absorb_trailing_output(&leftover);
                } else {
                    state.push_synthetic_step(ExecutionEvent::Exception, &heap, &leftover, Some(summary.clone()));
                }
                state.finish(
                    &self.code,
                    Some(GuestFailure::Exception {
                        exception_type: summary.exception_type,
                        message: summary.message,
                    }),
                )
            }
            Err(RunError::Resource(err)) => {
                state.absorb_trailing_output(&leftover);
                state.finish(&self.code, Some(GuestFailure::Resource(err)))
            }
        }
    }
}

/// Mutable state carried through one trace run.
#[derive(Debug)]
struct CollectorState {
    steps: Vec<ExecutionStep>,
    registry: HeapRegistry,
    code_lines: Vec<String>,
    max_steps: u32,
    max_steps_reached: bool,
    exception_recorded: bool,
    /// Output taken from suppressed events after the step ceiling; folded
    /// into the synthetic closing step.
    pending_stdout: String,
    stdout_total: String,
    start_time: Instant,
}

impl CollectorState {
    fn new(code: &str, max_steps: u32) -> Self {
        Self {
            steps: Vec::new(),
            registry: HeapRegistry::new(),
            code_lines: code.split('\n').map(str::to_owned).collect(),
            max_steps,
            max_steps_reached: false,
            exception_recorded: false,
            pending_stdout: String::new(),
            stdout_total: String::new(),
            start_time: Instant::now(),
        }
    }

    fn line_text(&self, line: u32) -> String {
        self.code_lines
            .get(line.saturating_sub(1) as usize)
            .map(|l| l.trim_end().to_owned())
            .unwrap_or_default()
    }

    /// Number of recorded real (non-synthetic-start) events.
    fn visible_steps(&self) -> u32 {
        self.steps.len() as u32 - 1
    }

    fn push_start_step(&mut self) {
        let module_frame = Frame {
            function_name: "<module>".to_owned(),
            line: 1,
            source_filename: GUEST_FILENAME.to_owned(),
            locals: IndexMap::new(),
            global_names: Vec::new(),
            is_module_level: true,
        };
        self.steps.push(ExecutionStep {
            step: 0,
            line: 1,
            source_line_text: self.line_text(1),
            event: ExecutionEvent::Start,
            event_payload: None,
            frames: vec![module_frame],
            heap: Vec::new(),
            stdout_delta: String::new(),
            exception: None,
            timestamp: None,
        });
    }

    /// Appends a synthetic `End` or `Exception` step.
    ///
    /// Frames are cloned from the last recorded step so steps stay immutable
    /// once appended.
    fn push_synthetic_step(
        &mut self,
        event: ExecutionEvent,
        heap: &GuestHeap<LimitedTracker>,
        stdout_delta: &str,
        exception: Option<ExceptionSummary>,
    ) {
        self.stdout_total.push_str(stdout_delta);
        let mut delta = std::mem::take(&mut self.pending_stdout);
        delta.push_str(stdout_delta);
        let frames = self.steps.last().map(|s| s.frames.clone()).unwrap_or_default();
        let line = self.code_lines.len() as u32;
        self.steps.push(ExecutionStep {
            step: self.steps.len() as u32,
            line,
            source_line_text: String::new(),
            event,
            event_payload: None,
            frames,
            heap: snapshot_heap(&mut self.registry, heap),
            stdout_delta: delta,
            exception,
            timestamp: None,
        });
    }

    /// Accounts output that never made it into a step (post-ceiling output
    /// and anything flushed after the last recorded event).
    fn absorb_trailing_output(&mut self, leftover: &str) {
        let pending = std::mem::take(&mut self.pending_stdout);
        self.stdout_total.push_str(&pending);
        self.stdout_total.push_str(leftover);
    }

    fn finish(self, code: &str, failure: Option<GuestFailure>) -> TraceOutcome {
        let total_steps = self.steps.len();
        TraceOutcome {
            trace: TraceData {
                code: code.to_owned(),
                steps: self.steps,
                total_steps,
                max_steps_reached: self.max_steps_reached,
            },
            stdout: self.stdout_total,
            failure,
        }
    }

    /// Excluded from frame listings: dunder names and interpreter-internal
    /// plumbing.
    fn name_visible(name: &str) -> bool {
        if name.starts_with("__") && name.ends_with("__") {
            return false;
        }
        !INTERNAL_NAMES.contains(&name)
    }

    fn build_frames<T: crate::resource::ResourceTracker>(&mut self, view: &VmView<'_, T>) -> Vec<Frame> {
        let global_names: Vec<String> = view
            .globals
            .keys()
            .filter(|name| Self::name_visible(name))
            .cloned()
            .collect();
        view.frames
            .iter()
            .map(|frame| self.build_frame(frame, view, &global_names))
            .collect()
    }

    fn build_frame<T: crate::resource::ResourceTracker>(
        &mut self,
        frame: &FrameCtx,
        view: &VmView<'_, T>,
        global_names: &[String],
    ) -> Frame {
        // The module frame's locals are the globals, as in the guest
        // language's own frame model.
        let bindings = if frame.is_module { view.globals } else { &frame.locals };
        let mut locals: IndexMap<String, Variable> = IndexMap::new();
        for (name, value) in bindings {
            if !Self::name_visible(name) {
                continue;
            }
            locals.insert(
                name.clone(),
                make_variable(name, value, view.heap, &mut self.registry),
            );
        }
        Frame {
            function_name: frame.function.clone(),
            line: frame.line,
            source_filename: GUEST_FILENAME.to_owned(),
            locals,
            global_names: global_names.to_vec(),
            is_module_level: frame.is_module,
        }
    }

    fn payload<T: crate::resource::ResourceTracker>(
        &mut self,
        event: &HookEvent<'_>,
        view: &VmView<'_, T>,
    ) -> (ExecutionEvent, Option<EventPayload>) {
        match event {
            HookEvent::Line { .. } => (ExecutionEvent::Line, None),
            HookEvent::Call { function, .. } => (
                ExecutionEvent::Call,
                Some(EventPayload::Call {
                    function: (*function).to_owned(),
                }),
            ),
            HookEvent::Return { value, .. } => (
                ExecutionEvent::Return,
                Some(EventPayload::Return {
                    return_value: element_repr(value, view.heap, &mut self.registry),
                }),
            ),
            HookEvent::Exception { exc_type, message, .. } => {
                self.exception_recorded = true;
                (
                    ExecutionEvent::Exception,
                    Some(EventPayload::Exception {
                        exception_type: (*exc_type).to_owned(),
                        message: (*message).to_owned(),
                    }),
                )
            }
        }
    }
}

impl StepHook for CollectorState {
    fn on_event<T: crate::resource::ResourceTracker>(
        &mut self,
        event: &HookEvent<'_>,
        view: &mut VmView<'_, T>,
    ) -> HookSignal {
        if self.visible_steps() >= self.max_steps {
            // Ceiling hit: suppress this and all later events, but keep the
            // output it carried for the closing step.
            self.max_steps_reached = true;
            self.pending_stdout.push_str(&view.stdout_delta);
            self.stdout_total.push_str(&view.stdout_delta);
            view.stdout_delta.clear();
            return HookSignal::Detach;
        }

        let stdout_delta = std::mem::take(&mut view.stdout_delta);
        self.stdout_total.push_str(&stdout_delta);

        let line = match event {
            HookEvent::Line { line }
            | HookEvent::Call { line, .. }
            | HookEvent::Return { line, .. }
            | HookEvent::Exception { line, .. } => *line,
        };
        let (event_kind, event_payload) = self.payload(event, view);
        let frames = self.build_frames(view);
        let heap = snapshot_heap(&mut self.registry, view.heap);

        self.steps.push(ExecutionStep {
            step: self.steps.len() as u32,
            line,
            source_line_text: self.line_text(line),
            event: event_kind,
            event_payload,
            frames,
            heap,
            stdout_delta,
            exception: None,
            timestamp: Some(self.start_time.elapsed().as_secs_f64()),
        });
        HookSignal::Continue
    }
}
