//! Lowering from the ruff syntax tree to the interpreter's IR.
//!
//! The IR is a compact statement/expression tree carrying 1-based line
//! numbers on statements (the granularity the trace reports). Constructs
//! outside the supported guest subset are rejected here with a line-tagged
//! [`LowerError`]; nothing unsupported survives into execution.

use std::rc::Rc;

use ruff_python_ast::{
    self as ast, BoolOp, CmpOp, ConversionFlag, Expr as AstExpr, InterpolatedStringElement, Number,
    Operator as AstOperator, Stmt, UnaryOp,
};
use ruff_text_size::{Ranged, TextRange};
use thin_vec::ThinVec;

use crate::parse::LineIndex;

/// A construct the interpreter does not execute.
#[derive(Debug, Clone, thiserror::Error)]
#[error("line {line}: {what} is not supported")]
pub struct LowerError {
    pub what: String,
    pub line: u32,
}

/// A sequence of statements.
#[derive(Debug)]
pub(crate) struct Block {
    pub stmts: Vec<LoweredStmt>,
}

/// One statement with its source line.
#[derive(Debug)]
pub(crate) struct LoweredStmt {
    pub line: u32,
    pub kind: StmtKind,
}

#[derive(Debug)]
pub(crate) enum StmtKind {
    Expr(Expr),
    Assign { targets: Vec<Target>, value: Expr },
    AugAssign { target: Target, op: BinOpKind, value: Expr },
    If { test: Expr, body: Block, orelse: Block },
    While { test: Expr, body: Block },
    For { target: Target, iter: Expr, body: Block },
    FuncDef(FuncDecl),
    ClassDef { name: String, base: Option<Expr>, body: Block },
    Return(Option<Expr>),
    Raise(Option<Expr>),
    Try { body: Block, handlers: Vec<Handler>, orelse: Block, finally: Block },
    Assert { test: Expr, msg: Option<Expr> },
    Import { module: String, binding: String },
    ImportFrom { module: String, names: Vec<(String, String)> },
    Global(Vec<String>),
    Del(Target),
    Pass,
    Break,
    Continue,
}

/// A `def` statement: parameter defaults stay unevaluated until definition
/// time, matching Python semantics.
#[derive(Debug)]
pub(crate) struct FuncDecl {
    pub name: String,
    pub params: Vec<String>,
    pub defaults: Vec<Expr>,
    pub body: Rc<Block>,
}

/// One `except` clause. Empty `kinds` means catch-all.
#[derive(Debug)]
pub(crate) struct Handler {
    pub kinds: Vec<String>,
    pub bind: Option<String>,
    pub body: Block,
}

/// An assignment target.
#[derive(Debug)]
pub(crate) enum Target {
    Name(String),
    Attr { obj: Expr, name: String },
    Index { obj: Expr, index: Expr },
    Tuple(Vec<Target>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOpKind {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CmpOpKind {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    In,
    NotIn,
    Is,
    IsNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BoolOpKind {
    And,
    Or,
}

/// Part of an f-string.
#[derive(Debug)]
pub(crate) enum FsPart {
    Literal(String),
    Interpolation { expr: Box<Expr>, repr: bool },
}

#[derive(Debug)]
pub(crate) enum Expr {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    FString(Vec<FsPart>),
    Name(String),
    Bin { op: BinOpKind, left: Box<Expr>, right: Box<Expr> },
    Cmp { op: CmpOpKind, left: Box<Expr>, right: Box<Expr> },
    BoolChain { op: BoolOpKind, left: Box<Expr>, right: Box<Expr> },
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Pos(Box<Expr>),
    Subscript { obj: Box<Expr>, index: Box<Expr> },
    Slice { lower: Option<Box<Expr>>, upper: Option<Box<Expr>>, step: Option<Box<Expr>> },
    Attr { obj: Box<Expr>, name: String },
    Call { callee: Box<Callee>, args: Vec<Expr>, kwargs: Vec<(String, Expr)> },
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Set(Vec<Expr>),
    IfElse { test: Box<Expr>, body: Box<Expr>, orelse: Box<Expr> },
    ListComp(Box<Comp>),
    SetComp(Box<Comp>),
    DictComp { key: Box<Expr>, value: Box<Expr>, comp: Box<CompSource> },
}

/// A single-generator comprehension.
#[derive(Debug)]
pub(crate) struct Comp {
    pub elt: Expr,
    pub source: CompSource,
}

#[derive(Debug)]
pub(crate) struct CompSource {
    pub target: Target,
    pub iter: Expr,
    pub ifs: Vec<Expr>,
}

/// What a call invokes. Attribute callees are kept distinct so method calls
/// can bind the receiver without materializing bound-method values.
#[derive(Debug)]
pub(crate) enum Callee {
    Name(String),
    Attr { obj: Expr, name: String },
    Expr(Expr),
}

/// Maximum expression nesting accepted by the lowerer.
///
/// Statement nesting is already bounded by the validator's indentation
/// limit; expressions like `((((x))))` are not, and lowering recurses.
const MAX_NESTING_DEPTH: u16 = 200;

/// Lowers a parsed module.
pub(crate) fn lower_module(module: ast::ModModule, index: &LineIndex) -> Result<Block, LowerError> {
    let lowerer = Lowerer {
        index,
        depth: std::cell::Cell::new(0),
    };
    lowerer.block(module.body)
}

struct Lowerer<'a> {
    index: &'a LineIndex,
    depth: std::cell::Cell<u16>,
}

impl Lowerer<'_> {
    fn line(&self, range: TextRange) -> u32 {
        self.index.line_of_range(range)
    }

    fn unsupported<T>(&self, what: impl Into<String>, range: TextRange) -> Result<T, LowerError> {
        Err(LowerError {
            what: what.into(),
            line: self.line(range),
        })
    }

    fn block(&self, statements: ThinVec<Stmt>) -> Result<Block, LowerError> {
        let stmts = statements
            .into_iter()
            .map(|s| self.statement(s))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Block { stmts })
    }

    fn statement(&self, statement: Stmt) -> Result<LoweredStmt, LowerError> {
        let line = self.line(statement.range());
        let kind = self.statement_kind(statement)?;
        Ok(LoweredStmt { line, kind })
    }

    fn statement_kind(&self, statement: Stmt) -> Result<StmtKind, LowerError> {
        match statement {
            Stmt::FunctionDef(function) => {
                if function.is_async {
                    return self.unsupported("async functions", function.range);
                }
                if !function.decorator_list.is_empty() {
                    return self.unsupported("decorators", function.range);
                }
                let params = &function.parameters;
                if params.vararg.is_some() || params.kwarg.is_some() || !params.kwonlyargs.is_empty() {
                    return self.unsupported("starred and keyword-only parameters", function.range);
                }
                let mut names = Vec::new();
                let mut defaults = Vec::new();
                for p in params.posonlyargs.iter().chain(params.args.iter()) {
                    names.push(p.parameter.name.id.to_string());
                    if let Some(default) = &p.default {
                        defaults.push(self.expression((**default).clone())?);
                    } else if !defaults.is_empty() {
                        return self.unsupported("non-default parameter after default", function.range);
                    }
                }
                let body = self.block(function.body)?;
                Ok(StmtKind::FuncDef(FuncDecl {
                    name: function.name.id.to_string(),
                    params: names,
                    defaults,
                    body: Rc::new(body),
                }))
            }
            Stmt::ClassDef(class) => {
                if !class.decorator_list.is_empty() {
                    return self.unsupported("class decorators", class.range);
                }
                let base = match class.arguments {
                    Some(arguments) => {
                        if !arguments.keywords.is_empty() || arguments.args.len() > 1 {
                            return self.unsupported("multiple inheritance and class keywords", class.range);
                        }
                        match arguments.args.into_vec().into_iter().next() {
                            Some(expr) => Some(self.expression(expr)?),
                            None => None,
                        }
                    }
                    None => None,
                };
                Ok(StmtKind::ClassDef {
                    name: class.name.id.to_string(),
                    base,
                    body: self.block(class.body)?,
                })
            }
            Stmt::Return(ast::StmtReturn { value, .. }) => Ok(StmtKind::Return(match value {
                Some(value) => Some(self.expression(*value)?),
                None => None,
            })),
            Stmt::Assign(ast::StmtAssign { targets, value, .. }) => {
                let targets = targets
                    .into_iter()
                    .map(|t| self.target(t))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(StmtKind::Assign {
                    targets,
                    value: self.expression(*value)?,
                })
            }
            Stmt::AugAssign(ast::StmtAugAssign { target, op, value, range, .. }) => Ok(StmtKind::AugAssign {
                target: self.target(*target)?,
                op: self.bin_op(op, range)?,
                value: self.expression(*value)?,
            }),
            Stmt::AnnAssign(ast::StmtAnnAssign { target, value, .. }) => match value {
                // Annotations have no runtime effect; keep the assignment if
                // one is present.
                Some(value) => Ok(StmtKind::Assign {
                    targets: vec![self.target(*target)?],
                    value: self.expression(*value)?,
                }),
                None => Ok(StmtKind::Pass),
            },
            Stmt::For(ast::StmtFor {
                is_async,
                target,
                iter,
                body,
                orelse,
                range,
                ..
            }) => {
                if is_async {
                    return self.unsupported("async for", range);
                }
                if !orelse.is_empty() {
                    return self.unsupported("for-else", range);
                }
                Ok(StmtKind::For {
                    target: self.target(*target)?,
                    iter: self.expression(*iter)?,
                    body: self.block(body)?,
                })
            }
            Stmt::While(ast::StmtWhile { test, body, orelse, range, .. }) => {
                if !orelse.is_empty() {
                    return self.unsupported("while-else", range);
                }
                Ok(StmtKind::While {
                    test: self.expression(*test)?,
                    body: self.block(body)?,
                })
            }
            Stmt::If(ast::StmtIf {
                test,
                body,
                elif_else_clauses,
                ..
            }) => {
                let test = self.expression(*test)?;
                let body = self.block(body)?;
                let orelse = self.elif_else(elif_else_clauses)?;
                Ok(StmtKind::If { test, body, orelse })
            }
            Stmt::Raise(ast::StmtRaise { exc, cause, range, .. }) => {
                if cause.is_some() {
                    return self.unsupported("raise ... from ...", range);
                }
                Ok(StmtKind::Raise(match exc {
                    Some(exc) => Some(self.expression(*exc)?),
                    None => return self.unsupported("bare raise", range),
                }))
            }
            Stmt::Try(ast::StmtTry {
                body,
                handlers,
                orelse,
                finalbody,
                is_star,
                range,
                ..
            }) => {
                if is_star {
                    return self.unsupported("except* groups", range);
                }
                let handlers = handlers
                    .into_iter()
                    .map(|h| self.handler(h))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(StmtKind::Try {
                    body: self.block(body)?,
                    handlers,
                    orelse: self.block(orelse)?,
                    finally: self.block(finalbody)?,
                })
            }
            Stmt::Assert(ast::StmtAssert { test, msg, .. }) => Ok(StmtKind::Assert {
                test: self.expression(*test)?,
                msg: match msg {
                    Some(msg) => Some(self.expression(*msg)?),
                    None => None,
                },
            }),
            Stmt::Import(ast::StmtImport { names, range, .. }) => {
                if names.len() != 1 {
                    return self.unsupported("multi-module import statements", range);
                }
                let alias = &names[0];
                let module = alias.name.to_string();
                let binding = match alias.asname.as_ref() {
                    Some(asname) => asname.as_str().to_owned(),
                    None => module
                        .split('.')
                        .next()
                        .expect("import target is never empty")
                        .to_owned(),
                };
                Ok(StmtKind::Import { module, binding })
            }
            Stmt::ImportFrom(ast::StmtImportFrom {
                module,
                names,
                level,
                range,
                ..
            }) => {
                if level != 0 {
                    return self.unsupported("relative imports", range);
                }
                let Some(module) = module else {
                    return self.unsupported("relative imports", range);
                };
                let names = names
                    .iter()
                    .map(|alias| {
                        if alias.name.as_str() == "*" {
                            return self.unsupported("wildcard imports", range);
                        }
                        let name = alias.name.to_string();
                        let binding = match alias.asname.as_ref() {
                            Some(asname) => asname.as_str().to_owned(),
                            None => name.clone(),
                        };
                        Ok((name, binding))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(StmtKind::ImportFrom {
                    module: module.to_string(),
                    names,
                })
            }
            Stmt::Global(ast::StmtGlobal { names, .. }) => {
                Ok(StmtKind::Global(names.iter().map(|n| n.as_str().to_owned()).collect()))
            }
            Stmt::Delete(ast::StmtDelete { targets, range, .. }) => {
                if targets.len() != 1 {
                    return self.unsupported("multi-target del statements", range);
                }
                let target = targets.into_iter().next().expect("len checked above");
                Ok(StmtKind::Del(self.target(target)?))
            }
            Stmt::Expr(ast::StmtExpr { value, .. }) => Ok(StmtKind::Expr(self.expression(*value)?)),
            Stmt::Pass(_) => Ok(StmtKind::Pass),
            Stmt::Break(_) => Ok(StmtKind::Break),
            Stmt::Continue(_) => Ok(StmtKind::Continue),
            Stmt::Nonlocal(n) => self.unsupported("nonlocal declarations", n.range),
            Stmt::With(w) => self.unsupported("with statements", w.range),
            Stmt::Match(m) => self.unsupported("match statements", m.range),
            Stmt::TypeAlias(t) => self.unsupported("type alias statements", t.range),
            Stmt::IpyEscapeCommand(i) => self.unsupported("IPython escape commands", i.range),
        }
    }

    fn elif_else(&self, clauses: Vec<ast::ElifElseClause>) -> Result<Block, LowerError> {
        let mut iter = clauses.into_iter();
        let Some(clause) = iter.next() else {
            return Ok(Block { stmts: Vec::new() });
        };
        let line = self.line(clause.range);
        match clause.test {
            // elif: becomes a nested if taking the remaining clauses.
            Some(test) => {
                let test = self.expression(test)?;
                let body = self.block(clause.body)?;
                let orelse = self.elif_else(iter.collect())?;
                Ok(Block {
                    stmts: vec![LoweredStmt {
                        line,
                        kind: StmtKind::If { test, body, orelse },
                    }],
                })
            }
            None => self.block(clause.body),
        }
    }

    fn handler(&self, handler: ast::ExceptHandler) -> Result<Handler, LowerError> {
        let ast::ExceptHandler::ExceptHandler(h) = handler;
        let kinds = match h.type_ {
            None => Vec::new(),
            Some(expr) => match *expr {
                AstExpr::Name(ast::ExprName { id, .. }) => vec![id.to_string()],
                AstExpr::Tuple(ast::ExprTuple { elts, range, .. }) => elts
                    .into_iter()
                    .map(|e| match e {
                        AstExpr::Name(ast::ExprName { id, .. }) => Ok(id.to_string()),
                        _ => self.unsupported("non-name exception filters", range),
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                other => return self.unsupported("non-name exception filters", other.range()),
            },
        };
        Ok(Handler {
            kinds,
            bind: h.name.map(|n| n.id.to_string()),
            body: self.block(h.body)?,
        })
    }

    fn target(&self, expr: AstExpr) -> Result<Target, LowerError> {
        match expr {
            AstExpr::Name(ast::ExprName { id, .. }) => Ok(Target::Name(id.to_string())),
            AstExpr::Attribute(ast::ExprAttribute { value, attr, .. }) => Ok(Target::Attr {
                obj: self.expression(*value)?,
                name: attr.id().to_string(),
            }),
            AstExpr::Subscript(ast::ExprSubscript { value, slice, .. }) => Ok(Target::Index {
                obj: self.expression(*value)?,
                index: self.expression(*slice)?,
            }),
            AstExpr::Tuple(ast::ExprTuple { elts, .. }) | AstExpr::List(ast::ExprList { elts, .. }) => {
                let targets = elts
                    .into_iter()
                    .map(|e| self.target(e))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Target::Tuple(targets))
            }
            other => self.unsupported("this assignment target", other.range()),
        }
    }

    fn bin_op(&self, op: AstOperator, range: TextRange) -> Result<BinOpKind, LowerError> {
        Ok(match op {
            AstOperator::Add => BinOpKind::Add,
            AstOperator::Sub => BinOpKind::Sub,
            AstOperator::Mult => BinOpKind::Mul,
            AstOperator::Div => BinOpKind::Div,
            AstOperator::FloorDiv => BinOpKind::FloorDiv,
            AstOperator::Mod => BinOpKind::Mod,
            AstOperator::Pow => BinOpKind::Pow,
            AstOperator::MatMult
            | AstOperator::LShift
            | AstOperator::RShift
            | AstOperator::BitOr
            | AstOperator::BitXor
            | AstOperator::BitAnd => return self.unsupported("this binary operator", range),
        })
    }

    fn cmp_op(op: CmpOp) -> CmpOpKind {
        match op {
            CmpOp::Eq => CmpOpKind::Eq,
            CmpOp::NotEq => CmpOpKind::NotEq,
            CmpOp::Lt => CmpOpKind::Lt,
            CmpOp::LtE => CmpOpKind::LtE,
            CmpOp::Gt => CmpOpKind::Gt,
            CmpOp::GtE => CmpOpKind::GtE,
            CmpOp::In => CmpOpKind::In,
            CmpOp::NotIn => CmpOpKind::NotIn,
            CmpOp::Is => CmpOpKind::Is,
            CmpOp::IsNot => CmpOpKind::IsNot,
        }
    }

    fn comp_source(&self, generators: Vec<ast::Comprehension>, range: TextRange) -> Result<CompSource, LowerError> {
        if generators.len() != 1 {
            return self.unsupported("nested comprehension generators", range);
        }
        let generator = generators.into_iter().next().expect("len checked above");
        if generator.is_async {
            return self.unsupported("async comprehensions", range);
        }
        let ifs = generator
            .ifs
            .into_iter()
            .map(|e| self.expression(e))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CompSource {
            target: self.target(generator.target)?,
            iter: self.expression(generator.iter)?,
            ifs,
        })
    }

    fn expression(&self, expr: AstExpr) -> Result<Expr, LowerError> {
        if self.depth.get() >= MAX_NESTING_DEPTH {
            return self.unsupported("this deeply nested expression", expr.range());
        }
        self.depth.set(self.depth.get() + 1);
        let result = self.expression_impl(expr);
        self.depth.set(self.depth.get() - 1);
        result
    }

    fn expression_impl(&self, expr: AstExpr) -> Result<Expr, LowerError> {
        match expr {
            AstExpr::NoneLiteral(_) => Ok(Expr::None),
            AstExpr::BooleanLiteral(ast::ExprBooleanLiteral { value, .. }) => Ok(Expr::Bool(value)),
            AstExpr::NumberLiteral(ast::ExprNumberLiteral { value, range, .. }) => match value {
                Number::Int(i) => match i.as_i64() {
                    Some(i) => Ok(Expr::Int(i)),
                    None => self.unsupported("integer literals beyond 64 bits", range),
                },
                Number::Float(f) => Ok(Expr::Float(f)),
                Number::Complex { .. } => self.unsupported("complex literals", range),
            },
            AstExpr::StringLiteral(ast::ExprStringLiteral { value, .. }) => Ok(Expr::Str(value.to_string())),
            AstExpr::BytesLiteral(b) => self.unsupported("bytes literals", b.range),
            AstExpr::EllipsisLiteral(e) => self.unsupported("ellipsis literals", e.range),
            AstExpr::FString(ast::ExprFString { value, range, .. }) => self.fstring(&value, range),
            AstExpr::TString(t) => self.unsupported("template strings", t.range),
            AstExpr::Name(ast::ExprName { id, .. }) => Ok(Expr::Name(id.to_string())),
            AstExpr::BinOp(ast::ExprBinOp { left, op, right, range, .. }) => Ok(Expr::Bin {
                op: self.bin_op(op, range)?,
                left: Box::new(self.expression(*left)?),
                right: Box::new(self.expression(*right)?),
            }),
            AstExpr::BoolOp(ast::ExprBoolOp { op, values, .. }) => {
                // Right-fold `a and b and c` into `a and (b and c)`.
                let kind = match op {
                    BoolOp::And => BoolOpKind::And,
                    BoolOp::Or => BoolOpKind::Or,
                };
                let mut iter = values.into_iter().rev();
                let last = iter.next().expect("boolean op has at least one value");
                let mut result = self.expression(last)?;
                for value in iter {
                    result = Expr::BoolChain {
                        op: kind,
                        left: Box::new(self.expression(value)?),
                        right: Box::new(result),
                    };
                }
                Ok(result)
            }
            AstExpr::UnaryOp(ast::ExprUnaryOp { op, operand, range, .. }) => {
                let operand = Box::new(self.expression(*operand)?);
                match op {
                    UnaryOp::Not => Ok(Expr::Not(operand)),
                    UnaryOp::USub => Ok(Expr::Neg(operand)),
                    UnaryOp::UAdd => Ok(Expr::Pos(operand)),
                    UnaryOp::Invert => self.unsupported("the ~ operator", range),
                }
            }
            AstExpr::Compare(ast::ExprCompare {
                left,
                ops,
                comparators,
                ..
            }) => {
                // Chains lower to `(a < b) and (b < c)`; middle operands are
                // evaluated once per comparison.
                let ops = ops.into_vec();
                let comparators = comparators.into_vec();
                let mut terms = Vec::with_capacity(ops.len());
                let mut prev = self.expression(*left)?;
                for (op, comparator) in ops.into_iter().zip(comparators) {
                    let right = self.expression(comparator)?;
                    let right_copy = self.expression_clone(&right);
                    terms.push(Expr::Cmp {
                        op: Self::cmp_op(op),
                        left: Box::new(prev),
                        right: Box::new(right),
                    });
                    prev = right_copy;
                }
                let mut iter = terms.into_iter().rev();
                let mut result = iter.next().expect("comparison has at least one op");
                for term in iter {
                    result = Expr::BoolChain {
                        op: BoolOpKind::And,
                        left: Box::new(term),
                        right: Box::new(result),
                    };
                }
                Ok(result)
            }
            AstExpr::Call(ast::ExprCall { func, arguments, range, .. }) => {
                let mut args = Vec::new();
                for arg in arguments.args.into_vec() {
                    if matches!(arg, AstExpr::Starred(_)) {
                        return self.unsupported("*args unpacking at call sites", range);
                    }
                    args.push(self.expression(arg)?);
                }
                let mut kwargs = Vec::new();
                for keyword in arguments.keywords {
                    let Some(name) = keyword.arg else {
                        return self.unsupported("**kwargs unpacking at call sites", range);
                    };
                    kwargs.push((name.id.to_string(), self.expression(keyword.value)?));
                }
                let callee = match *func {
                    AstExpr::Name(ast::ExprName { id, .. }) => Callee::Name(id.to_string()),
                    AstExpr::Attribute(ast::ExprAttribute { value, attr, .. }) => Callee::Attr {
                        obj: self.expression(*value)?,
                        name: attr.id().to_string(),
                    },
                    other => Callee::Expr(self.expression(other)?),
                };
                Ok(Expr::Call {
                    callee: Box::new(callee),
                    args,
                    kwargs,
                })
            }
            AstExpr::Attribute(ast::ExprAttribute { value, attr, .. }) => Ok(Expr::Attr {
                obj: Box::new(self.expression(*value)?),
                name: attr.id().to_string(),
            }),
            AstExpr::Subscript(ast::ExprSubscript { value, slice, .. }) => Ok(Expr::Subscript {
                obj: Box::new(self.expression(*value)?),
                index: Box::new(self.expression(*slice)?),
            }),
            AstExpr::Slice(ast::ExprSlice { lower, upper, step, .. }) => Ok(Expr::Slice {
                lower: self.boxed_opt(lower)?,
                upper: self.boxed_opt(upper)?,
                step: self.boxed_opt(step)?,
            }),
            AstExpr::List(ast::ExprList { elts, range, .. }) => Ok(Expr::List(self.expr_list(elts, range)?)),
            AstExpr::Tuple(ast::ExprTuple { elts, range, .. }) => Ok(Expr::Tuple(self.expr_list(elts, range)?)),
            AstExpr::Set(ast::ExprSet { elts, range, .. }) => Ok(Expr::Set(self.expr_list(elts, range)?)),
            AstExpr::Dict(ast::ExprDict { items, range, .. }) => {
                let mut pairs = Vec::with_capacity(items.len());
                for ast::DictItem { key, value } in items {
                    let Some(key) = key else {
                        return self.unsupported("dict unpacking", range);
                    };
                    pairs.push((self.expression(key)?, self.expression(value)?));
                }
                Ok(Expr::Dict(pairs))
            }
            AstExpr::If(ast::ExprIf { test, body, orelse, .. }) => Ok(Expr::IfElse {
                test: Box::new(self.expression(*test)?),
                body: Box::new(self.expression(*body)?),
                orelse: Box::new(self.expression(*orelse)?),
            }),
            AstExpr::ListComp(ast::ExprListComp { elt, generators, range, .. }) => {
                let elt = self.expression(*elt)?;
                let source = self.comp_source(generators, range)?;
                Ok(Expr::ListComp(Box::new(Comp { elt, source })))
            }
            AstExpr::SetComp(ast::ExprSetComp { elt, generators, range, .. }) => {
                let elt = self.expression(*elt)?;
                let source = self.comp_source(generators, range)?;
                Ok(Expr::SetComp(Box::new(Comp { elt, source })))
            }
            AstExpr::DictComp(ast::ExprDictComp {
                key,
                value,
                generators,
                range,
                ..
            }) => {
                let Some(key) = key else {
                    return self.unsupported("dict unpacking in comprehensions", range);
                };
                Ok(Expr::DictComp {
                    key: Box::new(self.expression(*key)?),
                    value: Box::new(self.expression(*value)?),
                    comp: Box::new(self.comp_source(generators, range)?),
                })
            }
            AstExpr::Named(n) => self.unsupported("assignment expressions", n.range),
            AstExpr::Lambda(l) => self.unsupported("lambda expressions", l.range),
            AstExpr::Generator(g) => self.unsupported("generator expressions", g.range),
            AstExpr::Await(a) => self.unsupported("await", a.range),
            AstExpr::Yield(y) => self.unsupported("yield", y.range),
            AstExpr::YieldFrom(y) => self.unsupported("yield from", y.range),
            AstExpr::Starred(s) => self.unsupported("starred expressions", s.range),
            AstExpr::IpyEscapeCommand(i) => self.unsupported("IPython escape commands", i.range),
        }
    }

    fn expr_list(&self, elts: Vec<AstExpr>, range: TextRange) -> Result<Vec<Expr>, LowerError> {
        elts.into_iter()
            .map(|e| {
                if matches!(e, AstExpr::Starred(_)) {
                    self.unsupported("starred expressions", range)
                } else {
                    self.expression(e)
                }
            })
            .collect()
    }

    fn boxed_opt(&self, expr: Option<Box<AstExpr>>) -> Result<Option<Box<Expr>>, LowerError> {
        match expr {
            Some(expr) => Ok(Some(Box::new(self.expression(*expr)?))),
            None => Ok(None),
        }
    }

    /// Structural copy of an already-lowered expression.
    ///
    /// Only needed for the middle operands of comparison chains, which appear
    /// on both sides of the lowered `and`.
    fn expression_clone(&self, expr: &Expr) -> Expr {
        match expr {
            Expr::None => Expr::None,
            Expr::Bool(b) => Expr::Bool(*b),
            Expr::Int(i) => Expr::Int(*i),
            Expr::Float(f) => Expr::Float(*f),
            Expr::Str(s) => Expr::Str(s.clone()),
            Expr::Name(n) => Expr::Name(n.clone()),
            Expr::Attr { obj, name } => Expr::Attr {
                obj: Box::new(self.expression_clone(obj)),
                name: name.clone(),
            },
            Expr::Subscript { obj, index } => Expr::Subscript {
                obj: Box::new(self.expression_clone(obj)),
                index: Box::new(self.expression_clone(index)),
            },
            Expr::Bin { op, left, right } => Expr::Bin {
                op: *op,
                left: Box::new(self.expression_clone(left)),
                right: Box::new(self.expression_clone(right)),
            },
            Expr::Neg(e) => Expr::Neg(Box::new(self.expression_clone(e))),
            Expr::Pos(e) => Expr::Pos(Box::new(self.expression_clone(e))),
            Expr::Not(e) => Expr::Not(Box::new(self.expression_clone(e))),
            // Calls and comprehensions in chain middles would double side
            // effects; CPython evaluates them once. Nobody chains through
            // them in practice, so re-evaluation is the accepted cost.
            other => self.deep_clone_fallback(other),
        }
    }

    fn deep_clone_fallback(&self, expr: &Expr) -> Expr {
        match expr {
            Expr::FString(parts) => Expr::FString(
                parts
                    .iter()
                    .map(|p| match p {
                        FsPart::Literal(s) => FsPart::Literal(s.clone()),
                        FsPart::Interpolation { expr, repr } => FsPart::Interpolation {
                            expr: Box::new(self.expression_clone(expr)),
                            repr: *repr,
                        },
                    })
                    .collect(),
            ),
            Expr::Cmp { op, left, right } => Expr::Cmp {
                op: *op,
                left: Box::new(self.expression_clone(left)),
                right: Box::new(self.expression_clone(right)),
            },
            Expr::BoolChain { op, left, right } => Expr::BoolChain {
                op: *op,
                left: Box::new(self.expression_clone(left)),
                right: Box::new(self.expression_clone(right)),
            },
            Expr::IfElse { test, body, orelse } => Expr::IfElse {
                test: Box::new(self.expression_clone(test)),
                body: Box::new(self.expression_clone(body)),
                orelse: Box::new(self.expression_clone(orelse)),
            },
            Expr::List(items) => Expr::List(items.iter().map(|e| self.expression_clone(e)).collect()),
            Expr::Tuple(items) => Expr::Tuple(items.iter().map(|e| self.expression_clone(e)).collect()),
            Expr::Set(items) => Expr::Set(items.iter().map(|e| self.expression_clone(e)).collect()),
            Expr::Dict(pairs) => Expr::Dict(
                pairs
                    .iter()
                    .map(|(k, v)| (self.expression_clone(k), self.expression_clone(v)))
                    .collect(),
            ),
            Expr::Slice { lower, upper, step } => Expr::Slice {
                lower: lower.as_ref().map(|e| Box::new(self.expression_clone(e))),
                upper: upper.as_ref().map(|e| Box::new(self.expression_clone(e))),
                step: step.as_ref().map(|e| Box::new(self.expression_clone(e))),
            },
            Expr::Call { callee, args, kwargs } => Expr::Call {
                callee: Box::new(match callee.as_ref() {
                    Callee::Name(n) => Callee::Name(n.clone()),
                    Callee::Attr { obj, name } => Callee::Attr {
                        obj: self.expression_clone(obj),
                        name: name.clone(),
                    },
                    Callee::Expr(e) => Callee::Expr(self.expression_clone(e)),
                }),
                args: args.iter().map(|e| self.expression_clone(e)).collect(),
                kwargs: kwargs
                    .iter()
                    .map(|(n, e)| (n.clone(), self.expression_clone(e)))
                    .collect(),
            },
            Expr::ListComp(comp) => Expr::ListComp(Box::new(self.comp_clone(comp))),
            Expr::SetComp(comp) => Expr::SetComp(Box::new(self.comp_clone(comp))),
            Expr::DictComp { key, value, comp } => Expr::DictComp {
                key: Box::new(self.expression_clone(key)),
                value: Box::new(self.expression_clone(value)),
                comp: Box::new(self.comp_source_clone(comp)),
            },
            _ => unreachable!("handled by expression_clone"),
        }
    }

    fn comp_clone(&self, comp: &Comp) -> Comp {
        Comp {
            elt: self.expression_clone(&comp.elt),
            source: self.comp_source_clone(&comp.source),
        }
    }

    fn comp_source_clone(&self, source: &CompSource) -> CompSource {
        CompSource {
            target: self.target_clone(&source.target),
            iter: self.expression_clone(&source.iter),
            ifs: source.ifs.iter().map(|e| self.expression_clone(e)).collect(),
        }
    }

    fn target_clone(&self, target: &Target) -> Target {
        match target {
            Target::Name(n) => Target::Name(n.clone()),
            Target::Attr { obj, name } => Target::Attr {
                obj: self.expression_clone(obj),
                name: name.clone(),
            },
            Target::Index { obj, index } => Target::Index {
                obj: self.expression_clone(obj),
                index: self.expression_clone(index),
            },
            Target::Tuple(targets) => Target::Tuple(targets.iter().map(|t| self.target_clone(t)).collect()),
        }
    }

    fn fstring(&self, value: &ast::FStringValue, range: TextRange) -> Result<Expr, LowerError> {
        let mut parts = Vec::new();
        for part in value {
            match part {
                ast::FStringPart::Literal(lit) => {
                    let text = lit.value.to_string();
                    if !text.is_empty() {
                        parts.push(FsPart::Literal(text));
                    }
                }
                ast::FStringPart::FString(fstring) => {
                    for element in &fstring.elements {
                        match element {
                            InterpolatedStringElement::Literal(lit) => {
                                parts.push(FsPart::Literal(lit.value.to_string()));
                            }
                            InterpolatedStringElement::Interpolation(interp) => {
                                if interp.format_spec.is_some() {
                                    return self.unsupported("f-string format specs", range);
                                }
                                let repr = matches!(interp.conversion, ConversionFlag::Repr);
                                let expr = self.expression((*interp.expression).clone())?;
                                parts.push(FsPart::Interpolation {
                                    expr: Box::new(expr),
                                    repr,
                                });
                            }
                        }
                    }
                }
            }
        }
        Ok(Expr::FString(parts))
    }
}
