//! The embedded guest interpreter.
//!
//! A tree-walking evaluator over the lowered IR, parameterized over a
//! [`ResourceTracker`] and a [`StepHook`]. The hook receives the same event
//! stream a `sys.settrace` callback would see: a `Call` for every frame push
//! (including the module frame and class bodies), a `Line` before every
//! statement (and per loop iteration for header lines), a `Return` when a
//! frame pops normally, and an `Exception` once at each raise site.

use indexmap::IndexMap;

use crate::{
    builtins::{Builtin, HostCtx, call_builtin, environment, hashable},
    exc::{ExcKind, RunError, RunResult},
    heap::{FunctionDef, GuestHeap, InstanceObj, ObjData, ObjId},
    io::{ScriptedInput, StdoutBuffer},
    lower::{Block, BoolOpKind, Callee, Comp, Expr, FsPart, FuncDecl, Handler, LoweredStmt, StmtKind, Target},
    methods::call_type_method,
    modules::{call_module_fn, import_module, module_attr},
    ops::{binary_op, compare, iter_values, normalize_index, slice_indices},
    resource::ResourceTracker,
    value::{ExcValue, Value},
};

/// One guest stack frame.
#[derive(Debug)]
pub(crate) struct FrameCtx {
    /// Function name; `<module>` for the top level, the class name for a
    /// class body.
    pub function: String,
    /// Line currently executing in this frame.
    pub line: u32,
    /// Local bindings. Unused for the module frame, whose locals are the
    /// globals map.
    pub locals: IndexMap<String, Value>,
    /// Names declared `global` in this frame.
    global_decls: ahash::AHashSet<String>,
    pub is_module: bool,
}

impl FrameCtx {
    fn module() -> Self {
        Self {
            function: "<module>".to_owned(),
            line: 1,
            locals: IndexMap::new(),
            global_decls: ahash::AHashSet::new(),
            is_module: true,
        }
    }

    fn function(name: String, line: u32, locals: IndexMap<String, Value>) -> Self {
        Self {
            function: name,
            line,
            locals,
            global_decls: ahash::AHashSet::new(),
            is_module: false,
        }
    }
}

/// An event delivered to the step hook.
#[derive(Debug)]
pub(crate) enum HookEvent<'a> {
    Call { function: &'a str, line: u32 },
    Line { line: u32 },
    Return { line: u32, value: &'a Value },
    Exception { line: u32, exc_type: &'a str, message: &'a str },
}

/// Hook response: keep receiving events, or detach for the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HookSignal {
    Continue,
    Detach,
}

/// Interpreter state exposed to the hook at each event.
pub(crate) struct VmView<'a, T: ResourceTracker> {
    /// Guest frames, bottom (module) first. Only guest frames exist; the
    /// interpreter never materializes host frames.
    pub frames: &'a [FrameCtx],
    /// Module-level bindings (the module frame's locals).
    pub globals: &'a IndexMap<String, Value>,
    pub heap: &'a GuestHeap<T>,
    /// Output produced since the previous event. Take it; it is not
    /// redelivered.
    pub stdout_delta: String,
}

/// Per-step trace hook, monomorphized into the interpreter.
pub(crate) trait StepHook {
    fn on_event<T: ResourceTracker>(&mut self, event: &HookEvent<'_>, view: &mut VmView<'_, T>) -> HookSignal;
}

/// Statement-level control flow.
enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

pub(crate) struct Vm<'h, T: ResourceTracker, H: StepHook> {
    pub heap: GuestHeap<T>,
    pub globals: IndexMap<String, Value>,
    pub frames: Vec<FrameCtx>,
    builtins: IndexMap<String, Value>,
    pub stdout: StdoutBuffer,
    input: ScriptedInput,
    hook: &'h mut H,
    hook_active: bool,
}

impl<'h, T: ResourceTracker, H: StepHook> Vm<'h, T, H> {
    pub fn new(hook: &'h mut H, tracker: T, allowed_builtins: &[String], input: &str) -> Self {
        Self {
            heap: GuestHeap::new(tracker),
            globals: IndexMap::new(),
            frames: vec![FrameCtx::module()],
            builtins: environment(allowed_builtins),
            stdout: StdoutBuffer::new(),
            input: ScriptedInput::new(input),
            hook,
            hook_active: true,
        }
    }

    /// Runs a lowered module to completion.
    pub fn run_module(&mut self, block: &Block) -> RunResult<()> {
        self.emit(&HookEvent::Call {
            function: "<module>",
            line: 1,
        });
        match self.exec_block(block) {
            Ok(_) => {
                let line = self.frames[0].line;
                self.emit(&HookEvent::Return {
                    line,
                    value: &Value::None,
                });
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    // ---- event delivery ----

    fn emit(&mut self, event: &HookEvent<'_>) {
        if !self.hook_active {
            return;
        }
        let stdout_delta = self.stdout.take_delta();
        let mut view = VmView {
            frames: &self.frames,
            globals: &self.globals,
            heap: &self.heap,
            stdout_delta,
        };
        if self.hook.on_event(event, &mut view) == HookSignal::Detach {
            self.hook_active = false;
        }
    }

    fn set_line(&mut self, line: u32) {
        if let Some(frame) = self.frames.last_mut() {
            frame.line = line;
        }
    }

    // ---- statements ----

    fn exec_block(&mut self, block: &Block) -> RunResult<Flow> {
        for stmt in &block.stmts {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &LoweredStmt) -> RunResult<Flow> {
        self.heap.tracker.check_time()?;
        self.set_line(stmt.line);
        self.emit(&HookEvent::Line { line: stmt.line });
        match self.exec_stmt_kind(stmt) {
            Err(RunError::Exc(mut exc)) if !exc.traced => {
                // First frame to observe the raise reports it, with the full
                // visible stack still in place.
                exc.traced = true;
                let message = exc.message.clone();
                self.emit(&HookEvent::Exception {
                    line: self.frames.last().map_or(stmt.line, |f| f.line),
                    exc_type: exc.kind.name(),
                    message: &message,
                });
                Err(RunError::Exc(exc))
            }
            other => other,
        }
    }

    fn exec_stmt_kind(&mut self, stmt: &LoweredStmt) -> RunResult<Flow> {
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
                Ok(Flow::Normal)
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value)?;
                for target in targets {
                    self.assign(target, value.clone())?;
                }
                Ok(Flow::Normal)
            }
            StmtKind::AugAssign { target, op, value } => {
                let rhs = self.eval(value)?;
                match target {
                    Target::Name(name) => {
                        let current = self.load_name(name)?;
                        let updated = binary_op(*op, &current, &rhs, &mut self.heap)?;
                        self.store_name(name, updated);
                    }
                    Target::Attr { obj, name } => {
                        let obj = self.eval(obj)?;
                        let current = self.eval_attr(&obj, name)?;
                        let updated = binary_op(*op, &current, &rhs, &mut self.heap)?;
                        self.store_attr(&obj, name, updated)?;
                    }
                    Target::Index { obj, index } => {
                        let obj = self.eval(obj)?;
                        let index = self.eval(index)?;
                        let current = self.index_get(&obj, &index)?;
                        let updated = binary_op(*op, &current, &rhs, &mut self.heap)?;
                        self.index_set(&obj, &index, updated)?;
                    }
                    Target::Tuple(_) => {
                        return Err(RunError::type_err("augmented assignment target must be a single name"));
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::If { test, body, orelse } => {
                let test = self.eval(test)?;
                if test.truthy(&self.heap) {
                    self.exec_block(body)
                } else {
                    self.exec_block(orelse)
                }
            }
            StmtKind::While { test, body } => {
                let mut first = true;
                loop {
                    if !first {
                        self.heap.tracker.check_time()?;
                        self.set_line(stmt.line);
                        self.emit(&HookEvent::Line { line: stmt.line });
                    }
                    first = false;
                    let test = self.eval(test)?;
                    if !test.truthy(&self.heap) {
                        return Ok(Flow::Normal);
                    }
                    match self.exec_block(body)? {
                        Flow::Break => return Ok(Flow::Normal),
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
            }
            StmtKind::For { target, iter, body } => {
                let iterable = self.eval(iter)?;
                let items = iter_values(&iterable, &self.heap)?;
                let mut first = true;
                for item in items {
                    if !first {
                        self.heap.tracker.check_time()?;
                        self.set_line(stmt.line);
                        self.emit(&HookEvent::Line { line: stmt.line });
                    }
                    first = false;
                    self.assign(target, item)?;
                    match self.exec_block(body)? {
                        Flow::Break => return Ok(Flow::Normal),
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::FuncDef(decl) => {
                let func = self.make_function(decl, stmt.line)?;
                self.store_name(&decl.name, func);
                Ok(Flow::Normal)
            }
            StmtKind::ClassDef { name, base, body } => {
                let class = self.exec_class_def(name, base.as_ref(), body, stmt.line)?;
                self.store_name(name, class);
                Ok(Flow::Normal)
            }
            StmtKind::Return(value) => {
                if self.frames.last().is_none_or(|f| f.is_module) {
                    return Err(RunError::exc(ExcKind::Runtime, "'return' outside function"));
                }
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::None,
                };
                Ok(Flow::Return(value))
            }
            StmtKind::Raise(exc) => {
                let value = match exc {
                    Some(expr) => self.eval(expr)?,
                    None => return Err(RunError::exc(ExcKind::Runtime, "No active exception to reraise")),
                };
                match value {
                    Value::Exception(exc) => Err(RunError::exc(exc.kind, exc.message.clone())),
                    Value::ExcType(kind) => Err(RunError::exc(kind, "")),
                    other => Err(RunError::type_err(format!(
                        "exceptions must derive from BaseException, not '{}'",
                        other.type_name(&self.heap)
                    ))),
                }
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finally,
            } => self.exec_try(body, handlers, orelse, finally),
            StmtKind::Assert { test, msg } => {
                let test = self.eval(test)?;
                if test.truthy(&self.heap) {
                    Ok(Flow::Normal)
                } else {
                    let message = match msg {
                        Some(expr) => {
                            let value = self.eval(expr)?;
                            value.py_str(&self.heap)
                        }
                        None => String::new(),
                    };
                    Err(RunError::exc(ExcKind::Assertion, message))
                }
            }
            StmtKind::Import { module, binding } => {
                match import_module(module) {
                    Some(m) => {
                        tracing::debug!(module, "guest import");
                        self.store_name(binding, Value::Module(m));
                        Ok(Flow::Normal)
                    }
                    None => Err(RunError::exc(
                        ExcKind::ModuleNotFound,
                        format!("No module named '{module}'"),
                    )),
                }
            }
            StmtKind::ImportFrom { module, names } => {
                let Some(m) = import_module(module) else {
                    return Err(RunError::exc(
                        ExcKind::ModuleNotFound,
                        format!("No module named '{module}'"),
                    ));
                };
                for (name, binding) in names {
                    let Some(value) = module_attr(m, name) else {
                        return Err(RunError::exc(
                            ExcKind::Import,
                            format!("cannot import name '{name}' from '{module}'"),
                        ));
                    };
                    self.store_name(binding, value);
                }
                Ok(Flow::Normal)
            }
            StmtKind::Global(names) => {
                if let Some(frame) = self.frames.last_mut() {
                    for name in names {
                        frame.global_decls.insert(name.clone());
                    }
                }
                Ok(Flow::Normal)
            }
            StmtKind::Del(target) => {
                self.delete(target)?;
                Ok(Flow::Normal)
            }
            StmtKind::Pass => Ok(Flow::Normal),
            StmtKind::Break => Ok(Flow::Break),
            StmtKind::Continue => Ok(Flow::Continue),
        }
    }

    fn exec_try(
        &mut self,
        body: &Block,
        handlers: &[Handler],
        orelse: &Block,
        finally: &Block,
    ) -> RunResult<Flow> {
        let body_result = self.exec_block(body);
        let pre_finally: RunResult<Flow> = match body_result {
            Ok(Flow::Normal) => self.exec_block(orelse),
            Ok(flow) => Ok(flow),
            Err(RunError::Exc(exc)) => {
                let mut handled = None;
                for handler in handlers {
                    if self.handler_matches(handler, exc.kind)? {
                        handled = Some(handler);
                        break;
                    }
                }
                match handled {
                    Some(handler) => {
                        if let Some(bind) = &handler.bind {
                            let value = Value::Exception(std::rc::Rc::new(ExcValue {
                                kind: exc.kind,
                                message: exc.message.clone(),
                            }));
                            self.store_name(bind, value);
                        }
                        let flow = self.exec_block(&handler.body);
                        // Python unbinds the `as` name when the handler exits.
                        if let Some(bind) = &handler.bind {
                            self.remove_binding(bind);
                        }
                        flow
                    }
                    None => Err(RunError::Exc(exc)),
                }
            }
            // Resource errors are uncatchable and skip cleanup; the trace is
            // being torn down anyway.
            Err(err) => return Err(err),
        };
        let finally_flow = self.exec_block(finally)?;
        match finally_flow {
            Flow::Normal => pre_finally,
            overriding => Ok(overriding),
        }
    }

    fn handler_matches(&self, handler: &Handler, kind: ExcKind) -> RunResult<bool> {
        if handler.kinds.is_empty() {
            return Ok(true);
        }
        for name in &handler.kinds {
            let Some(wanted) = ExcKind::from_name(name) else {
                return Err(RunError::name_err(name));
            };
            if kind.caught_by(wanted) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ---- bindings ----

    fn load_name(&mut self, name: &str) -> RunResult<Value> {
        if let Some(frame) = self.frames.last()
            && !frame.is_module
            && !frame.global_decls.contains(name)
            && let Some(value) = frame.locals.get(name)
        {
            return Ok(value.clone());
        }
        if let Some(value) = self.globals.get(name) {
            return Ok(value.clone());
        }
        if let Some(value) = self.builtins.get(name) {
            return Ok(value.clone());
        }
        if let Some(kind) = ExcKind::from_name(name) {
            return Ok(Value::ExcType(kind));
        }
        Err(RunError::name_err(name))
    }

    fn store_name(&mut self, name: &str, value: Value) {
        let frame = self.frames.last_mut().expect("frame stack is never empty");
        if frame.is_module || frame.global_decls.contains(name) {
            self.globals.insert(name.to_owned(), value);
        } else {
            frame.locals.insert(name.to_owned(), value);
        }
    }

    fn remove_binding(&mut self, name: &str) {
        let frame = self.frames.last_mut().expect("frame stack is never empty");
        if frame.is_module || frame.global_decls.contains(name) {
            self.globals.shift_remove(name);
        } else {
            frame.locals.shift_remove(name);
        }
    }

    fn assign(&mut self, target: &Target, value: Value) -> RunResult<()> {
        match target {
            Target::Name(name) => {
                self.store_name(name, value);
                Ok(())
            }
            Target::Attr { obj, name } => {
                let obj = self.eval(obj)?;
                self.store_attr(&obj, name, value)
            }
            Target::Index { obj, index } => {
                if matches!(index, Expr::Slice { .. }) {
                    return Err(RunError::type_err("slice assignment is not supported"));
                }
                let obj = self.eval(obj)?;
                let index = self.eval(index)?;
                self.index_set(&obj, &index, value)
            }
            Target::Tuple(targets) => {
                let values = iter_values(&value, &self.heap).map_err(|_| {
                    RunError::type_err(format!(
                        "cannot unpack non-iterable {} object",
                        value.type_name(&self.heap)
                    ))
                })?;
                if values.len() < targets.len() {
                    return Err(RunError::value_err(format!(
                        "not enough values to unpack (expected {}, got {})",
                        targets.len(),
                        values.len()
                    )));
                }
                if values.len() > targets.len() {
                    return Err(RunError::value_err(format!(
                        "too many values to unpack (expected {})",
                        targets.len()
                    )));
                }
                for (target, value) in targets.iter().zip(values) {
                    self.assign(target, value)?;
                }
                Ok(())
            }
        }
    }

    fn delete(&mut self, target: &Target) -> RunResult<()> {
        match target {
            Target::Name(name) => {
                let frame = self.frames.last_mut().expect("frame stack is never empty");
                let removed = if frame.is_module || frame.global_decls.contains(name) {
                    self.globals.shift_remove(name).is_some()
                } else {
                    frame.locals.shift_remove(name).is_some()
                };
                if removed {
                    Ok(())
                } else {
                    Err(RunError::name_err(name))
                }
            }
            Target::Attr { obj, name } => {
                let obj = self.eval(obj)?;
                let Value::Ref(id) = obj else {
                    return Err(self.attribute_error(&obj, name));
                };
                match self.heap.get_mut(id) {
                    ObjData::Instance(instance) => {
                        if instance.attrs.shift_remove(name).is_none() {
                            return Err(self.attribute_error(&Value::Ref(id), name));
                        }
                        Ok(())
                    }
                    _ => Err(self.attribute_error(&Value::Ref(id), name)),
                }
            }
            Target::Index { obj, index } => {
                let obj = self.eval(obj)?;
                let index = self.eval(index)?;
                let Value::Ref(id) = obj else {
                    return Err(RunError::type_err(format!(
                        "'{}' object does not support item deletion",
                        obj.type_name(&self.heap)
                    )));
                };
                match self.heap.get(id) {
                    ObjData::List(items) => {
                        let Value::Int(i) = index else {
                            return Err(RunError::type_err("list indices must be integers"));
                        };
                        let len = items.len();
                        let Some(position) = normalize_index(i, len) else {
                            return Err(RunError::exc(ExcKind::Index, "list assignment index out of range"));
                        };
                        let ObjData::List(items) = self.heap.get_mut(id) else {
                            unreachable!()
                        };
                        items.remove(position);
                        Ok(())
                    }
                    ObjData::Dict(_) => {
                        let key = hashable(&index, &self.heap)?;
                        let display = index.py_repr(&self.heap);
                        let ObjData::Dict(entries) = self.heap.get_mut(id) else {
                            unreachable!()
                        };
                        if entries.shift_remove(&key).is_none() {
                            return Err(RunError::exc(ExcKind::Key, display));
                        }
                        Ok(())
                    }
                    _ => Err(RunError::type_err(format!(
                        "'{}' object does not support item deletion",
                        Value::Ref(id).type_name(&self.heap)
                    ))),
                }
            }
            Target::Tuple(_) => Err(RunError::type_err("cannot delete multiple targets")),
        }
    }

    // ---- expressions ----

    fn eval(&mut self, expr: &Expr) -> RunResult<Value> {
        match expr {
            Expr::None => Ok(Value::None),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Int(i) => Ok(Value::Int(*i)),
            Expr::Float(f) => Ok(Value::Float(*f)),
            Expr::Str(s) => Ok(Value::str(s.clone())),
            Expr::FString(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        FsPart::Literal(text) => out.push_str(text),
                        FsPart::Interpolation { expr, repr } => {
                            let value = self.eval(expr)?;
                            if *repr {
                                out.push_str(&value.py_repr(&self.heap));
                            } else {
                                out.push_str(&value.py_str(&self.heap));
                            }
                        }
                    }
                }
                Ok(Value::str(out))
            }
            Expr::Name(name) => self.load_name(name),
            Expr::Bin { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binary_op(*op, &left, &right, &mut self.heap)
            }
            Expr::Cmp { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                Ok(Value::Bool(compare(*op, &left, &right, &self.heap)?))
            }
            Expr::BoolChain { op, left, right } => {
                let left = self.eval(left)?;
                let truthy = left.truthy(&self.heap);
                match op {
                    BoolOpKind::And if !truthy => Ok(left),
                    BoolOpKind::Or if truthy => Ok(left),
                    _ => self.eval(right),
                }
            }
            Expr::Not(inner) => {
                let value = self.eval(inner)?;
                Ok(Value::Bool(!value.truthy(&self.heap)))
            }
            Expr::Neg(inner) => {
                let value = self.eval(inner)?;
                match value {
                    Value::Int(i) => i
                        .checked_neg()
                        .map(Value::Int)
                        .ok_or_else(|| RunError::exc(ExcKind::Overflow, "integer result too large")),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    Value::Bool(b) => Ok(Value::Int(-i64::from(b))),
                    other => Err(RunError::type_err(format!(
                        "bad operand type for unary -: '{}'",
                        other.type_name(&self.heap)
                    ))),
                }
            }
            Expr::Pos(inner) => {
                let value = self.eval(inner)?;
                match value {
                    Value::Int(_) | Value::Float(_) => Ok(value),
                    Value::Bool(b) => Ok(Value::Int(i64::from(b))),
                    other => Err(RunError::type_err(format!(
                        "bad operand type for unary +: '{}'",
                        other.type_name(&self.heap)
                    ))),
                }
            }
            Expr::Subscript { obj, index } => {
                let obj = self.eval(obj)?;
                if let Expr::Slice { lower, upper, step } = index.as_ref() {
                    let lower = self.eval_slice_bound(lower)?;
                    let upper = self.eval_slice_bound(upper)?;
                    let step = self.eval_slice_bound(step)?;
                    self.slice_get(&obj, lower, upper, step)
                } else {
                    let index = self.eval(index)?;
                    self.index_get(&obj, &index)
                }
            }
            // Slices are consumed by the subscript and assignment paths;
            // evaluating one bare means it reached an unsupported position.
            Expr::Slice { .. } => Err(RunError::type_err("slice expressions are only supported as indices")),
            Expr::Attr { obj, name } => {
                let obj = self.eval(obj)?;
                self.eval_attr(&obj, name)
            }
            Expr::Call { callee, args, kwargs } => {
                let mut arg_values = Vec::with_capacity(args.len());
                for arg in args {
                    arg_values.push(self.eval(arg)?);
                }
                let mut kwarg_values = Vec::with_capacity(kwargs.len());
                for (name, expr) in kwargs {
                    kwarg_values.push((name.clone(), self.eval(expr)?));
                }
                match callee.as_ref() {
                    Callee::Name(name) => {
                        let func = self.load_name(name)?;
                        self.call_value(func, arg_values, kwarg_values)
                    }
                    Callee::Attr { obj, name } => {
                        let recv = self.eval(obj)?;
                        self.call_method(&recv, name, arg_values, kwarg_values)
                    }
                    Callee::Expr(expr) => {
                        let func = self.eval(expr)?;
                        self.call_value(func, arg_values, kwarg_values)
                    }
                }
            }
            Expr::List(items) => {
                let values = self.eval_all(items)?;
                Ok(Value::Ref(self.heap.alloc(ObjData::List(values))?))
            }
            Expr::Tuple(items) => {
                let values = self.eval_all(items)?;
                Ok(Value::Ref(self.heap.alloc(ObjData::Tuple(values))?))
            }
            Expr::Set(items) => {
                let values = self.eval_all(items)?;
                let mut entries = IndexMap::new();
                for value in values {
                    let key = hashable(&value, &self.heap)?;
                    entries.insert(key, value);
                }
                Ok(Value::Ref(self.heap.alloc(ObjData::Set(entries))?))
            }
            Expr::Dict(pairs) => {
                let mut entries = IndexMap::new();
                for (key_expr, value_expr) in pairs {
                    let key_value = self.eval(key_expr)?;
                    let value = self.eval(value_expr)?;
                    let key = hashable(&key_value, &self.heap)?;
                    entries.insert(key, value);
                }
                Ok(Value::Ref(self.heap.alloc(ObjData::Dict(entries))?))
            }
            Expr::IfElse { test, body, orelse } => {
                let test = self.eval(test)?;
                if test.truthy(&self.heap) {
                    self.eval(body)
                } else {
                    self.eval(orelse)
                }
            }
            Expr::ListComp(comp) => {
                let values = self.eval_comp(comp)?;
                Ok(Value::Ref(self.heap.alloc(ObjData::List(values))?))
            }
            Expr::SetComp(comp) => {
                let values = self.eval_comp(comp)?;
                let mut entries = IndexMap::new();
                for value in values {
                    let key = hashable(&value, &self.heap)?;
                    entries.insert(key, value);
                }
                Ok(Value::Ref(self.heap.alloc(ObjData::Set(entries))?))
            }
            Expr::DictComp { key, value, comp } => {
                let mut entries = IndexMap::new();
                let iterable = self.eval(&comp.iter)?;
                let items = iter_values(&iterable, &self.heap)?;
                for item in items {
                    self.heap.tracker.check_time()?;
                    let shadow = self.bind_comp_target(&comp.target, item)?;
                    let keep = self.comp_filters_pass(&comp.ifs)?;
                    if keep {
                        let key_value = self.eval(key)?;
                        let value_value = self.eval(value)?;
                        let hashed = hashable(&key_value, &self.heap)?;
                        entries.insert(hashed, value_value);
                    }
                    self.restore_comp_target(&comp.target, shadow);
                }
                Ok(Value::Ref(self.heap.alloc(ObjData::Dict(entries))?))
            }
        }
    }

    fn eval_all(&mut self, exprs: &[Expr]) -> RunResult<Vec<Value>> {
        let mut values = Vec::with_capacity(exprs.len());
        for expr in exprs {
            values.push(self.eval(expr)?);
        }
        Ok(values)
    }

    fn eval_slice_bound(&mut self, bound: &Option<Box<Expr>>) -> RunResult<Option<i64>> {
        match bound {
            None => Ok(None),
            Some(expr) => match self.eval(expr)? {
                Value::Int(i) => Ok(Some(i)),
                Value::None => Ok(None),
                other => Err(RunError::type_err(format!(
                    "slice indices must be integers or None, not '{}'",
                    other.type_name(&self.heap)
                ))),
            },
        }
    }

    // ---- comprehensions ----

    fn eval_comp(&mut self, comp: &Comp) -> RunResult<Vec<Value>> {
        let iterable = self.eval(&comp.source.iter)?;
        let items = iter_values(&iterable, &self.heap)?;
        let mut out = Vec::new();
        for item in items {
            self.heap.tracker.check_time()?;
            let shadow = self.bind_comp_target(&comp.source.target, item)?;
            let keep = self.comp_filters_pass(&comp.source.ifs)?;
            if keep {
                out.push(self.eval(&comp.elt)?);
            }
            self.restore_comp_target(&comp.source.target, shadow);
        }
        Ok(out)
    }

    fn comp_filters_pass(&mut self, ifs: &[Expr]) -> RunResult<bool> {
        for filter in ifs {
            let value = self.eval(filter)?;
            if !value.truthy(&self.heap) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Binds a comprehension target, saving whatever it shadows so the
    /// binding does not leak (comprehensions have their own scope in the
    /// guest language).
    fn bind_comp_target(&mut self, target: &Target, value: Value) -> RunResult<Vec<(String, Option<Value>)>> {
        let mut names = Vec::new();
        collect_target_names(target, &mut names);
        let shadow = names
            .iter()
            .map(|name| {
                let frame = self.frames.last().expect("frame stack is never empty");
                let existing = if frame.is_module {
                    self.globals.get(name).cloned()
                } else {
                    frame.locals.get(name).cloned()
                };
                (name.clone(), existing)
            })
            .collect();
        self.assign(target, value)?;
        Ok(shadow)
    }

    fn restore_comp_target(&mut self, _target: &Target, shadow: Vec<(String, Option<Value>)>) {
        for (name, previous) in shadow {
            match previous {
                Some(value) => self.store_name(&name, value),
                None => self.remove_binding(&name),
            }
        }
    }

    // ---- attributes ----

    fn attribute_error(&self, obj: &Value, name: &str) -> RunError {
        RunError::exc(
            ExcKind::Attribute,
            format!("'{}' object has no attribute '{}'", obj.type_name(&self.heap), name),
        )
    }

    fn eval_attr(&mut self, obj: &Value, name: &str) -> RunResult<Value> {
        match obj {
            Value::Module(m) => module_attr(*m, name)
                .ok_or_else(|| RunError::exc(ExcKind::Attribute, format!("module '{}' has no attribute '{}'", m.name(), name))),
            Value::Ref(id) => match self.heap.get(*id) {
                ObjData::Instance(instance) => {
                    if let Some(value) = instance.attrs.get(name) {
                        return Ok(value.clone());
                    }
                    let class = instance.class;
                    match self.heap.class_attr(class, name) {
                        Some(Value::Ref(func_id)) if matches!(self.heap.get(func_id), ObjData::Function(_)) => {
                            Ok(Value::BoundMethod {
                                recv: *id,
                                func: func_id,
                            })
                        }
                        Some(value) => Ok(value),
                        None => Err(self.attribute_error(obj, name)),
                    }
                }
                ObjData::Class(_) => self
                    .heap
                    .class_attr(*id, name)
                    .ok_or_else(|| self.attribute_error(obj, name)),
                _ => Err(self.attribute_error(obj, name)),
            },
            _ => Err(self.attribute_error(obj, name)),
        }
    }

    fn store_attr(&mut self, obj: &Value, name: &str, value: Value) -> RunResult<()> {
        let Value::Ref(id) = obj else {
            return Err(RunError::exc(
                ExcKind::Attribute,
                format!("'{}' object has no attribute '{}'", obj.type_name(&self.heap), name),
            ));
        };
        self.heap.tracker.on_container_insert()?;
        match self.heap.get_mut(*id) {
            ObjData::Instance(instance) => {
                instance.attrs.insert(name.to_owned(), value);
                Ok(())
            }
            ObjData::Class(class) => {
                class.attrs.insert(name.to_owned(), value);
                Ok(())
            }
            _ => Err(RunError::exc(
                ExcKind::Attribute,
                format!(
                    "'{}' object has no attribute '{}'",
                    Value::Ref(*id).type_name(&self.heap),
                    name
                ),
            )),
        }
    }

    // ---- subscripting ----

    fn index_get(&mut self, obj: &Value, index: &Value) -> RunResult<Value> {
        match obj {
            Value::Str(s) => {
                let Value::Int(i) = index else {
                    return Err(RunError::type_err(format!(
                        "string indices must be integers, not '{}'",
                        index.type_name(&self.heap)
                    )));
                };
                let chars: Vec<char> = s.chars().collect();
                let Some(position) = normalize_index(*i, chars.len()) else {
                    return Err(RunError::exc(ExcKind::Index, "string index out of range"));
                };
                Ok(Value::str(chars[position].to_string()))
            }
            Value::Range { start, step, .. } => {
                let Value::Int(i) = index else {
                    return Err(RunError::type_err("range indices must be integers"));
                };
                let len = obj.range_len().unwrap_or(0).max(0) as usize;
                let Some(position) = normalize_index(*i, len) else {
                    return Err(RunError::exc(ExcKind::Index, "range object index out of range"));
                };
                let element = i128::from(*start) + i128::from(*step) * position as i128;
                i64::try_from(element)
                    .map(Value::Int)
                    .map_err(|_| RunError::exc(ExcKind::Overflow, "range element out of integer range"))
            }
            Value::Ref(id) => match self.heap.get(*id) {
                ObjData::List(items) | ObjData::Tuple(items) => {
                    let Value::Int(i) = index else {
                        return Err(RunError::type_err(format!(
                            "{} indices must be integers, not '{}'",
                            obj.type_name(&self.heap),
                            index.type_name(&self.heap)
                        )));
                    };
                    let Some(position) = normalize_index(*i, items.len()) else {
                        return Err(RunError::exc(
                            ExcKind::Index,
                            format!("{} index out of range", obj.type_name(&self.heap)),
                        ));
                    };
                    Ok(items[position].clone())
                }
                ObjData::Dict(entries) => {
                    let key = hashable(index, &self.heap)?;
                    entries
                        .get(&key)
                        .cloned()
                        .ok_or_else(|| RunError::exc(ExcKind::Key, index.py_repr(&self.heap)))
                }
                _ => Err(RunError::type_err(format!(
                    "'{}' object is not subscriptable",
                    obj.type_name(&self.heap)
                ))),
            },
            _ => Err(RunError::type_err(format!(
                "'{}' object is not subscriptable",
                obj.type_name(&self.heap)
            ))),
        }
    }

    fn slice_get(
        &mut self,
        obj: &Value,
        lower: Option<i64>,
        upper: Option<i64>,
        step: Option<i64>,
    ) -> RunResult<Value> {
        match obj {
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let indices = slice_indices(lower, upper, step, chars.len())?;
                let out: String = indices.into_iter().map(|i| chars[i]).collect();
                Ok(Value::str(out))
            }
            Value::Ref(id) => match self.heap.get(*id) {
                ObjData::List(items) => {
                    let indices = slice_indices(lower, upper, step, items.len())?;
                    let out: Vec<Value> = indices.into_iter().map(|i| items[i].clone()).collect();
                    Ok(Value::Ref(self.heap.alloc(ObjData::List(out))?))
                }
                ObjData::Tuple(items) => {
                    let indices = slice_indices(lower, upper, step, items.len())?;
                    let out: Vec<Value> = indices.into_iter().map(|i| items[i].clone()).collect();
                    Ok(Value::Ref(self.heap.alloc(ObjData::Tuple(out))?))
                }
                _ => Err(RunError::type_err(format!(
                    "'{}' object is not subscriptable",
                    obj.type_name(&self.heap)
                ))),
            },
            _ => Err(RunError::type_err(format!(
                "'{}' object is not subscriptable",
                obj.type_name(&self.heap)
            ))),
        }
    }

    fn index_set(&mut self, obj: &Value, index: &Value, value: Value) -> RunResult<()> {
        let Value::Ref(id) = obj else {
            return Err(RunError::type_err(format!(
                "'{}' object does not support item assignment",
                obj.type_name(&self.heap)
            )));
        };
        match self.heap.get(*id) {
            ObjData::List(items) => {
                let Value::Int(i) = index else {
                    return Err(RunError::type_err(format!(
                        "list indices must be integers, not '{}'",
                        index.type_name(&self.heap)
                    )));
                };
                let len = items.len();
                let Some(position) = normalize_index(*i, len) else {
                    return Err(RunError::exc(ExcKind::Index, "list assignment index out of range"));
                };
                let ObjData::List(items) = self.heap.get_mut(*id) else {
                    unreachable!()
                };
                items[position] = value;
                Ok(())
            }
            ObjData::Dict(_) => {
                let key = hashable(index, &self.heap)?;
                self.heap.tracker.on_container_insert()?;
                let ObjData::Dict(entries) = self.heap.get_mut(*id) else {
                    unreachable!()
                };
                entries.insert(key, value);
                Ok(())
            }
            _ => Err(RunError::type_err(format!(
                "'{}' object does not support item assignment",
                obj.type_name(&self.heap)
            ))),
        }
    }

    // ---- calls ----

    fn call_method(
        &mut self,
        recv: &Value,
        name: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> RunResult<Value> {
        match recv {
            Value::Str(_) => match call_type_method(&mut self.heap, recv, name, args, kwargs)? {
                Some(value) => Ok(value),
                None => Err(self.attribute_error(recv, name)),
            },
            Value::Ref(id) => match self.heap.get(*id) {
                ObjData::List(_) | ObjData::Tuple(_) | ObjData::Dict(_) | ObjData::Set(_) => {
                    match call_type_method(&mut self.heap, recv, name, args, kwargs)? {
                        Some(value) => Ok(value),
                        None => Err(self.attribute_error(recv, name)),
                    }
                }
                _ => {
                    let func = self.eval_attr(recv, name)?;
                    self.call_value(func, args, kwargs)
                }
            },
            Value::Module(_) => {
                let func = self.eval_attr(recv, name)?;
                self.call_value(func, args, kwargs)
            }
            _ => Err(self.attribute_error(recv, name)),
        }
    }

    fn call_value(&mut self, func: Value, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> RunResult<Value> {
        match func {
            Value::Builtin(Builtin::Map) => self.call_map(args, kwargs),
            Value::Builtin(Builtin::Filter) => self.call_filter(args, kwargs),
            Value::Builtin(builtin) => {
                let mut ctx = HostCtx {
                    heap: &mut self.heap,
                    stdout: &mut self.stdout,
                    input: &mut self.input,
                };
                call_builtin(&mut ctx, builtin, args, kwargs)
            }
            Value::ModuleFn(module_fn) => {
                if !kwargs.is_empty() {
                    return Err(RunError::type_err(format!(
                        "{}() takes no keyword arguments",
                        module_fn.name()
                    )));
                }
                call_module_fn(module_fn, &args)
            }
            Value::ExcType(kind) => {
                let message = match args.as_slice() {
                    [] => String::new(),
                    [value] => value.py_str(&self.heap),
                    _ => {
                        let parts: Vec<String> = args.iter().map(|a| a.py_repr(&self.heap)).collect();
                        format!("({})", parts.join(", "))
                    }
                };
                Ok(Value::Exception(std::rc::Rc::new(ExcValue { kind, message })))
            }
            Value::BoundMethod { recv, func } => {
                let ObjData::Function(def) = self.heap.get(func) else {
                    return Err(RunError::type_err("'method' object is not callable"));
                };
                let def = def.clone();
                self.call_function(Some(Value::Ref(recv)), &def, args, kwargs)
            }
            Value::Ref(id) => match self.heap.get(id) {
                ObjData::Function(def) => {
                    let def = def.clone();
                    self.call_function(None, &def, args, kwargs)
                }
                ObjData::Class(_) => self.instantiate(id, args, kwargs),
                _ => Err(RunError::type_err(format!(
                    "'{}' object is not callable",
                    Value::Ref(id).type_name(&self.heap)
                ))),
            },
            other => Err(RunError::type_err(format!(
                "'{}' object is not callable",
                other.type_name(&self.heap)
            ))),
        }
    }

    fn call_map(&mut self, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> RunResult<Value> {
        if !kwargs.is_empty() {
            return Err(RunError::type_err("map() takes no keyword arguments"));
        }
        let [func, iterable] = <[Value; 2]>::try_from(args)
            .map_err(|args| RunError::type_err(format!("map() takes exactly 2 arguments ({} given)", args.len())))?;
        let items = iter_values(&iterable, &self.heap)?;
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            self.heap.tracker.check_time()?;
            out.push(self.call_value(func.clone(), vec![item], Vec::new())?);
        }
        Ok(Value::Ref(self.heap.alloc(ObjData::List(out))?))
    }

    fn call_filter(&mut self, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> RunResult<Value> {
        if !kwargs.is_empty() {
            return Err(RunError::type_err("filter() takes no keyword arguments"));
        }
        let [func, iterable] = <[Value; 2]>::try_from(args).map_err(|args| {
            RunError::type_err(format!("filter() takes exactly 2 arguments ({} given)", args.len()))
        })?;
        let items = iter_values(&iterable, &self.heap)?;
        let mut out = Vec::new();
        for item in items {
            self.heap.tracker.check_time()?;
            let keep = match &func {
                Value::None => item.truthy(&self.heap),
                _ => {
                    let result = self.call_value(func.clone(), vec![item.clone()], Vec::new())?;
                    result.truthy(&self.heap)
                }
            };
            if keep {
                out.push(item);
            }
        }
        Ok(Value::Ref(self.heap.alloc(ObjData::List(out))?))
    }

    fn make_function(&mut self, decl: &FuncDecl, line: u32) -> RunResult<Value> {
        // Defaults are evaluated once, at definition time.
        let mut defaults = Vec::with_capacity(decl.defaults.len());
        for default in &decl.defaults {
            defaults.push(self.eval(default)?);
        }
        let id = self.heap.alloc(ObjData::Function(std::rc::Rc::new(FunctionDef {
            name: decl.name.clone(),
            params: decl.params.clone(),
            defaults,
            body: decl.body.clone(),
            def_line: line,
        })))?;
        Ok(Value::Ref(id))
    }

    fn call_function(
        &mut self,
        recv: Option<Value>,
        def: &std::rc::Rc<FunctionDef>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> RunResult<Value> {
        self.heap.tracker.check_recursion_depth(self.frames.len())?;
        let locals = bind_params(def, recv, args, kwargs)?;
        self.frames.push(FrameCtx::function(def.name.clone(), def.def_line, locals));
        self.emit(&HookEvent::Call {
            function: &def.name,
            line: def.def_line,
        });
        let flow = match self.exec_block(&def.body) {
            Ok(flow) => flow,
            Err(err) => {
                self.frames.pop();
                return Err(err);
            }
        };
        let ret = match flow {
            Flow::Return(value) => value,
            _ => Value::None,
        };
        let line = self.frames.last().map_or(def.def_line, |f| f.line);
        self.emit(&HookEvent::Return { line, value: &ret });
        self.frames.pop();
        Ok(ret)
    }

    fn instantiate(&mut self, class_id: ObjId, args: Vec<Value>, kwargs: Vec<(String, Value)>) -> RunResult<Value> {
        let instance = self.heap.alloc(ObjData::Instance(InstanceObj {
            class: class_id,
            attrs: IndexMap::new(),
        }))?;
        match self.heap.class_attr(class_id, "__init__") {
            Some(Value::Ref(func_id)) => {
                let ObjData::Function(def) = self.heap.get(func_id) else {
                    return Err(RunError::type_err("__init__ must be a function"));
                };
                let def = def.clone();
                self.call_function(Some(Value::Ref(instance)), &def, args, kwargs)?;
            }
            Some(_) => return Err(RunError::type_err("__init__ must be a function")),
            None => {
                if !args.is_empty() || !kwargs.is_empty() {
                    return Err(RunError::type_err(format!(
                        "{}() takes no arguments",
                        self.heap.class_name(class_id)
                    )));
                }
            }
        }
        Ok(Value::Ref(instance))
    }

    fn exec_class_def(&mut self, name: &str, base: Option<&Expr>, body: &Block, line: u32) -> RunResult<Value> {
        let base_id = match base {
            None => None,
            Some(expr) => {
                let value = self.eval(expr)?;
                match value {
                    Value::Ref(id) if matches!(self.heap.get(id), ObjData::Class(_)) => Some(id),
                    other => {
                        return Err(RunError::type_err(format!(
                            "base must be a class, not '{}'",
                            other.type_name(&self.heap)
                        )));
                    }
                }
            }
        };
        // The class body executes as its own frame, like a function named
        // after the class.
        self.frames
            .push(FrameCtx::function(name.to_owned(), line, IndexMap::new()));
        self.emit(&HookEvent::Call { function: name, line });
        let result = self.exec_block(body);
        match result {
            Ok(_) => {
                let body_line = self.frames.last().map_or(line, |f| f.line);
                self.emit(&HookEvent::Return {
                    line: body_line,
                    value: &Value::None,
                });
                let frame = self.frames.pop().expect("class frame was just pushed");
                let id = self.heap.alloc(ObjData::Class(crate::heap::ClassObj {
                    name: name.to_owned(),
                    base: base_id,
                    attrs: frame.locals,
                }))?;
                Ok(Value::Ref(id))
            }
            Err(err) => {
                self.frames.pop();
                Err(err)
            }
        }
    }
}

/// Binds call arguments to parameter names.
fn bind_params(
    def: &FunctionDef,
    recv: Option<Value>,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> RunResult<IndexMap<String, Value>> {
    let mut positional = Vec::with_capacity(args.len() + 1);
    if let Some(recv) = recv {
        positional.push(recv);
    }
    positional.extend(args);

    if positional.len() > def.params.len() {
        return Err(RunError::type_err(format!(
            "{}() takes {} positional arguments but {} were given",
            def.name,
            def.params.len(),
            positional.len()
        )));
    }

    let mut locals: IndexMap<String, Value> = IndexMap::with_capacity(def.params.len());
    for (param, value) in def.params.iter().zip(positional) {
        locals.insert(param.clone(), value);
    }
    for (name, value) in kwargs {
        if !def.params.contains(&name) {
            return Err(RunError::type_err(format!(
                "{}() got an unexpected keyword argument '{}'",
                def.name, name
            )));
        }
        if locals.contains_key(&name) {
            return Err(RunError::type_err(format!(
                "{}() got multiple values for argument '{}'",
                def.name, name
            )));
        }
        locals.insert(name, value);
    }
    let defaults_start = def.params.len() - def.defaults.len();
    for (index, param) in def.params.iter().enumerate() {
        if !locals.contains_key(param) {
            if index >= defaults_start {
                locals.insert(param.clone(), def.defaults[index - defaults_start].clone());
            } else {
                return Err(RunError::type_err(format!(
                    "{}() missing required argument: '{}'",
                    def.name, param
                )));
            }
        }
    }
    // Present parameters in declaration order regardless of how they were
    // supplied; the trace shows locals in this order.
    locals.sort_by(|a, _, b, _| {
        let pos = |name: &String| def.params.iter().position(|p| p == name).unwrap_or(usize::MAX);
        pos(a).cmp(&pos(b))
    });
    Ok(locals)
}

fn collect_target_names(target: &Target, names: &mut Vec<String>) {
    match target {
        Target::Name(name) => names.push(name.clone()),
        Target::Tuple(targets) => {
            for t in targets {
                collect_target_names(t, names);
            }
        }
        Target::Attr { .. } | Target::Index { .. } => {}
    }
}
