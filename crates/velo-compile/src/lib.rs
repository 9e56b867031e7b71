//! AST to bytecode compiler.
//!
//! Compiles expression trees to `Prototype`s. Register discipline is a
//! simple high-water stack: subexpression scratch registers are
//! released once the consuming instruction has been emitted. Operands
//! reference registers (`<= 0`) or interned names (`> 0`) directly, so
//! `(+ s i)` compiles to a single `add` with two name operands.

use thiserror::Error;
use velo_core::bc::{ByteCode, Instruction, INTERNALS};
use velo_core::interner::{Interner, Symbol};
use velo_core::prototype::{Arg, CompiledCall, Param, Prototype};
use velo_core::value::{double_na, Value, INTEGER_NA};
use velo_syntax::{Expr, ExprKind, Span};
use std::sync::Arc;

/// Compilation error.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("malformed {form}: {message}")]
    BadForm {
        form: &'static str,
        message: String,
        span: Span,
    },

    #[error("unknown internal function: {0}")]
    UnknownInternal(String),
}

impl CompileError {
    pub fn span(&self) -> Span {
        match self {
            CompileError::BadForm { span, .. } => *span,
            CompileError::UnknownInternal(_) => Span::default(),
        }
    }
}

pub type CompileResult<T> = Result<T, CompileError>;

/// Compile a program (a top-level expression sequence) to a prototype.
/// The program prototype ends in `done` with the result in register 0.
pub fn compile_program(exprs: &[Expr], interner: &mut Interner) -> CompileResult<Arc<Prototype>> {
    let mut c = Compiler::new(interner);
    c.push_reg(); // slot 0: result
    if exprs.is_empty() {
        c.emit_constant(Value::Null, 0);
    }
    for e in exprs {
        c.compile_into(e, 0)?;
    }
    c.emit(ByteCode::Done, 0, 0, 0);
    Ok(Arc::new(c.proto))
}

/// Evaluate a literal expression to a constant value, if it is one.
/// Handles the printable subset emitted by `Value::deparse`: scalar
/// literals, `(c ...)`, `(list ...)`, `(complex re im)`, and
/// `(attr<- lit "name" lit)`.
pub fn parse_literal(e: &Expr, interner: &mut Interner) -> Option<Value> {
    match &e.kind {
        ExprKind::Integer(i) => Some(Value::integer(*i)),
        ExprKind::Double(d) => Some(Value::double(*d)),
        ExprKind::Logical(Some(b)) => Some(Value::logical(*b)),
        ExprKind::Logical(None) => Some(Value::logical_na()),
        ExprKind::Str(s) => Some(Value::character(interner.intern(s))),
        ExprKind::Null => Some(Value::Null),
        ExprKind::NaInt => Some(Value::integer(INTEGER_NA)),
        ExprKind::NaReal => Some(Value::double(double_na())),
        ExprKind::NaStr => Some(Value::character(Symbol::NA)),
        ExprKind::Call(parts) => {
            let head = e.head()?;
            let args = &parts[1..];
            match head {
                "c" => {
                    let vals: Option<Vec<Value>> =
                        args.iter().map(|a| parse_literal(a, interner)).collect();
                    concat_literals(vals?)
                }
                "list" => {
                    let vals: Option<Vec<Value>> =
                        args.iter().map(|a| parse_literal(a, interner)).collect();
                    Some(Value::list(vals?))
                }
                "complex" => {
                    if args.len() != 2 {
                        return None;
                    }
                    let re = parse_literal(&args[0], interner)?.as_real1()?;
                    let im = parse_literal(&args[1], interner)?.as_real1()?;
                    Some(Value::complex((re, im)))
                }
                "attr<-" => {
                    if args.len() != 3 {
                        return None;
                    }
                    let base = parse_literal(&args[0], interner)?;
                    let name = match &args[1].kind {
                        ExprKind::Str(s) => interner.intern(s),
                        _ => return None,
                    };
                    let value = parse_literal(&args[2], interner)?;
                    Some(base.set_attr(name, value))
                }
                _ => None,
            }
        }
        ExprKind::Symbol(_) => None,
    }
}

/// Concatenate literal values under the coercion lattice.
fn concat_literals(vals: Vec<Value>) -> Option<Value> {
    use velo_core::value::Ty;
    let mut ty = Ty::Null;
    for v in &vals {
        ty = Ty::unify(ty, v.ty())?;
    }
    if ty == Ty::Null {
        return Some(Value::Null);
    }
    let mut out = Value::empty(ty);
    for v in &vals {
        out = append_cast(out, v)?;
    }
    Some(out)
}

fn append_cast(acc: Value, v: &Value) -> Option<Value> {
    use velo_core::value::Ty;
    Some(match acc {
        Value::Logical(mut a) => {
            Arc::make_mut(&mut a).extend(v.cast_logical().ok()?);
            Value::Logical(a)
        }
        Value::Integer(mut a) => {
            Arc::make_mut(&mut a).extend(v.cast_integer().ok()?);
            Value::Integer(a)
        }
        Value::Double(mut a) => {
            Arc::make_mut(&mut a).extend(v.cast_double().ok()?);
            Value::Double(a)
        }
        Value::Complex(mut a) => {
            Arc::make_mut(&mut a).extend(v.cast_complex().ok()?);
            Value::Complex(a)
        }
        Value::Character(mut a) => {
            match v {
                Value::Character(b) => Arc::make_mut(&mut a).extend(b.iter().copied()),
                _ => return None,
            }
            Value::Character(a)
        }
        Value::List(mut a) => {
            match v.cast_to(Ty::List).ok()? {
                Value::List(b) => Arc::make_mut(&mut a).extend(b.iter().cloned()),
                _ => return None,
            }
            Value::List(a)
        }
        _ => return None,
    })
}

struct Compiler<'a> {
    interner: &'a mut Interner,
    proto: Prototype,
    /// Next free register slot (high-water allocator).
    cur: usize,
}

impl<'a> Compiler<'a> {
    fn new(interner: &'a mut Interner) -> Self {
        Compiler {
            interner,
            proto: Prototype::default(),
            cur: 0,
        }
    }

    // === Emission helpers ===

    fn emit(&mut self, op: ByteCode, a: i64, b: i64, c: i64) -> usize {
        let pc = self.proto.code.len();
        self.proto.code.push(Instruction::new(op, a, b, c));
        pc
    }

    fn current_pc(&self) -> usize {
        self.proto.code.len()
    }

    /// Patch a jump operand after the target is known.
    fn patch(&mut self, pc: usize, field: char, value: i64) {
        let inst = &mut self.proto.code[pc];
        match field {
            'a' => inst.a = value,
            'b' => inst.b = value,
            _ => inst.c = value,
        }
    }

    fn emit_constant(&mut self, v: Value, target: i64) {
        let idx = self.proto.add_constant(v);
        self.emit(ByteCode::Constant, idx as i64, 0, target);
    }

    // === Register allocation ===

    fn push_reg(&mut self) -> i64 {
        let slot = self.cur;
        self.cur += 1;
        self.proto.registers = self.proto.registers.max(self.cur);
        -(slot as i64)
    }

    fn mark(&self) -> usize {
        self.cur
    }

    fn release(&mut self, mark: usize) {
        self.cur = mark;
    }

    fn sym(&mut self, name: &str) -> Symbol {
        self.interner.intern(name)
    }

    // === Expression compilation ===

    /// Compile `e`, returning an operand: a register holding the value
    /// or a positive name operand.
    fn compile_operand(&mut self, e: &Expr) -> CompileResult<i64> {
        if let ExprKind::Symbol(s) = &e.kind {
            return Ok(self.sym(s).operand());
        }
        let reg = self.push_reg();
        self.compile_into(e, reg)?;
        Ok(reg)
    }

    /// Compile `e` so its value lands in register operand `target`.
    fn compile_into(&mut self, e: &Expr, target: i64) -> CompileResult<()> {
        if let Some(v) = parse_literal(e, self.interner) {
            self.emit_constant(v, target);
            return Ok(());
        }
        match &e.kind {
            ExprKind::Symbol(s) => {
                let sym = self.sym(s).operand();
                self.emit(ByteCode::Mov, sym, 0, target);
                Ok(())
            }
            ExprKind::Call(parts) => self.compile_call(e, parts, target),
            // non-literal atoms were all handled above
            _ => Ok(()),
        }
    }

    fn compile_call(&mut self, e: &Expr, parts: &[Expr], target: i64) -> CompileResult<()> {
        let Some(head) = e.head() else {
            // computed function position: ((f) args...)
            return self.compile_user_call(e, parts, target);
        };
        let args = &parts[1..];
        match head {
            "begin" => {
                if args.is_empty() {
                    self.emit_constant(Value::Null, target);
                }
                for a in args {
                    self.compile_into(a, target)?;
                }
                Ok(())
            }
            "<-" => self.compile_assign(e, args, ByteCode::Assign, target),
            "<<-" => self.compile_assign(e, args, ByteCode::Assign2, target),
            "if" => self.compile_if(e, args, target),
            "while" => self.compile_while(e, args, target),
            "for" => self.compile_for(e, args, target),
            "function" => self.compile_function(e, args, target),
            "switch" => self.compile_switch(e, args, target),
            "usemethod" => self.compile_usemethod(e, args, target),
            "do-call" => self.compile_do_call(e, args, target),
            "rm" => self.compile_rm(e, args, target),
            "index" => self.compile_subset(e, args, ByteCode::Subset, target),
            "index2" => self.compile_subset(e, args, ByteCode::Subset2, target),
            "index<-" => self.compile_subset_assign(e, args, ByteCode::IAssign, target),
            "index2<-" => self.compile_subset_assign(e, args, ByteCode::EAssign, target),
            "$" => self.compile_dollar(e, args, target),
            "attr" => self.compile_attrget(e, args, target),
            "attr<-" => self.compile_attrset(e, args, target),
            "missing" => {
                let name = self.expect_symbol(e, args, 0, "missing")?;
                self.emit(ByteCode::Missing, name.operand(), 0, target);
                Ok(())
            }
            "ifelse" => self.compile_ifelse(e, args, target),
            ":" => self.compile_binary_op(e, args, ByteCode::Colon, target),
            "seq" => self.compile_seq(e, args, target),
            "rep" => self.compile_rep(e, args, target),
            "length" => self.compile_unary_op(e, args, ByteCode::Length, target),
            "type" => self.compile_unary_op(e, args, ByteCode::Type, target),
            "strip" => self.compile_unary_op(e, args, ByteCode::Strip, target),
            "list" if args.len() == 1 && args[0].as_symbol() == Some("...") => {
                // (list ...) iterates the dots sequence
                let iter = self.push_reg();
                let elem = self.push_reg();
                self.emit_constant(Value::integer(0), iter);
                self.emit(ByteCode::List, iter, elem, target);
                Ok(())
            }
            "-" if args.len() == 1 => self.compile_unary_op(e, args, ByteCode::Neg, target),
            "!" => self.compile_unary_op(e, args, ByteCode::Not, target),
            "is.na" => self.compile_unary_op(e, args, ByteCode::IsNa, target),
            "is.finite" => self.compile_unary_op(e, args, ByteCode::IsFinite, target),
            "sqrt" => self.compile_unary_op(e, args, ByteCode::Sqrt, target),
            "abs" => self.compile_unary_op(e, args, ByteCode::Abs, target),
            "floor" => self.compile_unary_op(e, args, ByteCode::Floor, target),
            "ceiling" => self.compile_unary_op(e, args, ByteCode::Ceiling, target),
            "exp" => self.compile_unary_op(e, args, ByteCode::Exp, target),
            "log" => self.compile_unary_op(e, args, ByteCode::Log, target),
            "sum" => self.compile_unary_op(e, args, ByteCode::Sum, target),
            "prod" => self.compile_unary_op(e, args, ByteCode::Prod, target),
            "min" => self.compile_unary_op(e, args, ByteCode::Min, target),
            "max" => self.compile_unary_op(e, args, ByteCode::Max, target),
            "any" => self.compile_unary_op(e, args, ByteCode::Any, target),
            "all" => self.compile_unary_op(e, args, ByteCode::All, target),
            "cumsum" => self.compile_unary_op(e, args, ByteCode::CumSum, target),
            "+" => self.compile_binary_op(e, args, ByteCode::Add, target),
            "-" => self.compile_binary_op(e, args, ByteCode::Sub, target),
            "*" => self.compile_binary_op(e, args, ByteCode::Mul, target),
            "/" => self.compile_binary_op(e, args, ByteCode::Div, target),
            "%%" => self.compile_binary_op(e, args, ByteCode::Mod, target),
            "^" => self.compile_binary_op(e, args, ByteCode::Pow, target),
            "==" => self.compile_binary_op(e, args, ByteCode::Eq, target),
            "!=" => self.compile_binary_op(e, args, ByteCode::Neq, target),
            "<" => self.compile_binary_op(e, args, ByteCode::Lt, target),
            "<=" => self.compile_binary_op(e, args, ByteCode::Le, target),
            ">" => self.compile_binary_op(e, args, ByteCode::Gt, target),
            ">=" => self.compile_binary_op(e, args, ByteCode::Ge, target),
            "&" => self.compile_binary_op(e, args, ByteCode::And, target),
            "|" => self.compile_binary_op(e, args, ByteCode::Or, target),
            name if INTERNALS.contains(&name) => self.compile_internal(e, name, args, target),
            _ => self.compile_user_call(e, parts, target),
        }
    }

    fn compile_unary_op(
        &mut self,
        e: &Expr,
        args: &[Expr],
        op: ByteCode,
        target: i64,
    ) -> CompileResult<()> {
        if args.len() != 1 {
            return Err(self.bad(e, op.name(), "expected one argument"));
        }
        let mark = self.mark();
        let a = self.compile_operand(&args[0])?;
        self.emit(op, a, 0, target);
        self.release(mark);
        Ok(())
    }

    fn compile_binary_op(
        &mut self,
        e: &Expr,
        args: &[Expr],
        op: ByteCode,
        target: i64,
    ) -> CompileResult<()> {
        if args.len() != 2 {
            return Err(self.bad(e, op.name(), "expected two arguments"));
        }
        let mark = self.mark();
        let a = self.compile_operand(&args[0])?;
        let b = self.compile_operand(&args[1])?;
        self.emit(op, a, b, target);
        self.release(mark);
        Ok(())
    }

    fn compile_assign(
        &mut self,
        e: &Expr,
        args: &[Expr],
        op: ByteCode,
        target: i64,
    ) -> CompileResult<()> {
        if args.len() != 2 {
            return Err(self.bad(e, "assignment", "expected a name and a value"));
        }
        let Some(name) = args[0].as_symbol() else {
            return Err(self.bad(e, "assignment", "assignment target must be a symbol"));
        };
        let sym = self.sym(name);
        self.compile_into(&args[1], target)?;
        self.emit(op, sym.operand(), 0, target);
        Ok(())
    }

    fn compile_if(&mut self, e: &Expr, args: &[Expr], target: i64) -> CompileResult<()> {
        if args.len() != 2 && args.len() != 3 {
            return Err(self.bad(e, "if", "expected condition, then, and optional else"));
        }
        let mark = self.mark();
        let cond = self.compile_operand(&args[0])?;
        let jc = self.emit(ByteCode::Jc, 1, 0, cond);
        self.release(mark);
        self.compile_into(&args[1], target)?;
        let jend = self.emit(ByteCode::Jmp, 0, 0, 0);
        self.patch(jc, 'b', (self.current_pc() - jc) as i64);
        if let Some(else_branch) = args.get(2) {
            self.compile_into(else_branch, target)?;
        } else {
            self.emit_constant(Value::Null, target);
        }
        self.patch(jend, 'a', (self.current_pc() - jend) as i64);
        Ok(())
    }

    fn compile_while(&mut self, e: &Expr, args: &[Expr], target: i64) -> CompileResult<()> {
        if args.len() != 2 {
            return Err(self.bad(e, "while", "expected condition and body"));
        }
        let top = self.current_pc();
        let mark = self.mark();
        let cond = self.compile_operand(&args[0])?;
        let jc = self.emit(ByteCode::Jc, 1, 0, cond);
        self.release(mark);
        let body = self.push_reg();
        self.compile_into(&args[1], body)?;
        self.release(mark);
        let back = self.emit(ByteCode::Jmp, 0, 0, 0);
        self.patch(back, 'a', top as i64 - back as i64);
        self.patch(jc, 'b', (self.current_pc() - jc) as i64);
        self.emit_constant(Value::Null, target);
        Ok(())
    }

    fn compile_for(&mut self, e: &Expr, args: &[Expr], target: i64) -> CompileResult<()> {
        if args.len() != 3 {
            return Err(self.bad(e, "for", "expected variable, sequence, and body"));
        }
        let Some(var) = args[0].as_symbol() else {
            return Err(self.bad(e, "for", "loop variable must be a symbol"));
        };
        let var = self.sym(var);

        // The loop vector and counter stay live for the whole loop.
        let vec = self.push_reg();
        self.compile_into(&args[1], vec)?;
        let counter = self.push_reg();

        // forbegin/forend each read their exit/back-edge offset from
        // the jmp that follows them, relative to themselves.
        let forbegin = self.emit(ByteCode::ForBegin, var.operand(), vec, counter);
        let exit_jmp = self.emit(ByteCode::Jmp, 0, 0, 0);
        let body_pc = self.current_pc();
        let mark = self.mark();
        let body = self.push_reg();
        self.compile_into(&args[2], body)?;
        self.release(mark);
        let forend = self.emit(ByteCode::ForEnd, var.operand(), vec, counter);
        self.emit(ByteCode::Jmp, body_pc as i64 - forend as i64, 0, 0);
        self.patch(exit_jmp, 'a', self.current_pc() as i64 - forbegin as i64);
        self.emit_constant(Value::Null, target);
        Ok(())
    }

    fn compile_function(&mut self, e: &Expr, args: &[Expr], target: i64) -> CompileResult<()> {
        if args.len() != 2 {
            return Err(self.bad(e, "function", "expected parameter list and body"));
        }
        let ExprKind::Call(param_exprs) = &args[0].kind else {
            return Err(self.bad(e, "function", "expected a parameter list"));
        };

        let mut inner = Compiler::new(self.interner);
        inner.push_reg(); // slot 0: return value
        let mut params = Vec::new();
        let mut dots_param = None;
        for p in param_exprs {
            match &p.kind {
                ExprKind::Symbol(s) if s == "..." => {
                    dots_param = Some(params.len());
                    let name = inner.interner.intern("...");
                    params.push(Param {
                        name,
                        default: None,
                    });
                }
                ExprKind::Symbol(s) => {
                    let name = inner.interner.intern(s);
                    params.push(Param {
                        name,
                        default: None,
                    });
                }
                ExprKind::Call(pair) if pair.len() == 2 && pair[0].as_symbol().is_some() => {
                    let name = inner.interner.intern(pair[0].as_symbol().unwrap());
                    let default = inner.compile_thunk(&pair[1])?;
                    params.push(Param {
                        name,
                        default: Some(default),
                    });
                }
                _ => return Err(self.bad(e, "function", "malformed parameter")),
            }
        }
        inner.proto.params = params;
        inner.proto.dots_param = dots_param;
        inner.compile_into(&args[1], 0)?;
        inner.emit(ByteCode::Ret, 0, 0, 0);
        let proto = Arc::new(inner.proto);

        let idx = self.proto.prototypes.len();
        self.proto.prototypes.push(proto);
        self.emit(ByteCode::Function, idx as i64, 0, target);
        Ok(())
    }

    /// Compile an expression as a standalone thunk prototype (promise
    /// bodies, default arguments). Returns its prototype index.
    fn compile_thunk(&mut self, e: &Expr) -> CompileResult<usize> {
        let mut inner = Compiler::new(self.interner);
        inner.push_reg();
        inner.compile_into(e, 0)?;
        inner.emit(ByteCode::Ret, 0, 0, 0);
        let idx = self.proto.prototypes.len();
        self.proto.prototypes.push(Arc::new(inner.proto));
        Ok(idx)
    }

    fn compile_user_call(&mut self, e: &Expr, parts: &[Expr], target: i64) -> CompileResult<()> {
        if parts.is_empty() {
            return Err(self.bad(e, "call", "empty call"));
        }
        let mark = self.mark();
        let func = self.compile_operand(&parts[0])?;
        let call_idx = self.compile_call_site(e, &parts[1..])?;
        self.emit(ByteCode::Call, func, -(call_idx as i64 + 1), target);
        self.release(mark);
        Ok(())
    }

    /// Build a CompiledCall entry. Named arguments are written
    /// `(= name expr)`; `...` forwards the caller's dots.
    fn compile_call_site(&mut self, e: &Expr, args: &[Expr]) -> CompileResult<usize> {
        let mut arguments = Vec::new();
        let mut names = Vec::new();
        let mut dots = usize::MAX;
        for a in args {
            let (name, value_expr) = match &a.kind {
                ExprKind::Call(pair)
                    if pair.len() == 3 && pair[0].as_symbol() == Some("=") =>
                {
                    let Some(n) = pair[1].as_symbol() else {
                        return Err(self.bad(e, "call", "argument name must be a symbol"));
                    };
                    (self.sym(n), &pair[2])
                }
                _ => (Symbol::EMPTY, a),
            };
            if value_expr.as_symbol() == Some("...") {
                dots = arguments.len();
                arguments.push(Arg::Dots);
                names.push(Symbol::EMPTY);
                continue;
            }
            let arg = if let Some(v) = parse_literal(value_expr, self.interner) {
                Arg::Value(v)
            } else {
                Arg::Promise(self.compile_thunk(value_expr)?)
            };
            arguments.push(arg);
            names.push(name);
        }
        if dots == usize::MAX {
            dots = arguments.len();
        }
        let call_text = self.interner.intern(&e.to_string());
        let idx = self.proto.calls.len();
        self.proto.calls.push(CompiledCall {
            arguments,
            names,
            dots,
            call: Value::character(call_text),
        });
        Ok(idx)
    }

    fn compile_usemethod(&mut self, e: &Expr, args: &[Expr], target: i64) -> CompileResult<()> {
        if args.len() != 2 {
            return Err(self.bad(e, "usemethod", "expected generic name and object"));
        }
        let ExprKind::Str(generic) = &args[0].kind else {
            return Err(self.bad(e, "usemethod", "generic name must be a string"));
        };
        let generic = self.sym(generic);
        let mark = self.mark();
        // the object must sit in a register: the method call writes its
        // result there before it is moved to the target
        let obj = self.push_reg();
        self.compile_into(&args[1], obj)?;
        let call_idx = self.compile_call_site(e, &args[1..])?;
        self.emit(ByteCode::UseMethod, generic.operand(), call_idx as i64, obj);
        self.emit(ByteCode::FastMov, obj, 0, target);
        self.release(mark);
        Ok(())
    }

    fn compile_do_call(&mut self, e: &Expr, args: &[Expr], target: i64) -> CompileResult<()> {
        if args.len() != 2 {
            return Err(self.bad(e, "do-call", "expected function and argument list"));
        }
        let mark = self.mark();
        let func = self.compile_operand(&args[0])?;
        let list = self.compile_operand(&args[1])?;
        self.emit(ByteCode::NCall, func, list, target);
        self.release(mark);
        Ok(())
    }

    /// `rm` accepts symbols or character vectors; symbols become their
    /// names at compile time, anything else is checked at run time.
    fn compile_rm(&mut self, _e: &Expr, args: &[Expr], target: i64) -> CompileResult<()> {
        let mark = self.mark();
        let first = self.cur;
        for a in args {
            let reg = self.push_reg();
            if let Some(name) = a.as_symbol() {
                let sym = self.sym(name);
                self.emit_constant(Value::character(sym), reg);
            } else {
                self.compile_into(a, reg)?;
            }
        }
        let idx = INTERNALS.iter().position(|n| *n == "rm").unwrap();
        let a = ((idx as i64) << 8) | args.len() as i64;
        self.emit(ByteCode::Internal, a, -(first as i64), target);
        self.release(mark);
        Ok(())
    }

    fn compile_internal(
        &mut self,
        _e: &Expr,
        name: &str,
        args: &[Expr],
        target: i64,
    ) -> CompileResult<()> {
        let idx = INTERNALS
            .iter()
            .position(|n| *n == name)
            .ok_or_else(|| CompileError::UnknownInternal(name.to_string()))?;
        let mark = self.mark();
        let first = self.cur;
        for a in args {
            let reg = self.push_reg();
            self.compile_into(a, reg)?;
        }
        let a = ((idx as i64) << 8) | args.len() as i64;
        self.emit(ByteCode::Internal, a, -(first as i64), target);
        self.release(mark);
        Ok(())
    }

    fn compile_switch(&mut self, e: &Expr, args: &[Expr], target: i64) -> CompileResult<()> {
        if args.is_empty() {
            return Err(self.bad(e, "switch", "expected a selector"));
        }
        let mark = self.mark();
        let sel = self.compile_operand(&args[0])?;
        let cases = &args[1..];
        let branch = self.emit(ByteCode::Branch, sel, cases.len() as i64, sel);
        // one table slot per case: a = case name, c = offset (patched)
        for case in cases {
            let name = match &case.kind {
                ExprKind::Call(pair) if pair.len() == 2 => match &pair[0].kind {
                    ExprKind::Str(s) => self.sym(s),
                    ExprKind::Symbol(s) if s == "else" => Symbol::EMPTY,
                    _ => return Err(self.bad(e, "switch", "case label must be a string or else")),
                },
                _ => return Err(self.bad(e, "switch", "malformed case")),
            };
            self.emit(ByteCode::Jmp, name.operand(), 0, 0);
        }
        // no match falls through to just past the table
        let mut ends = Vec::new();
        self.emit_constant(Value::Null, target);
        ends.push(self.emit(ByteCode::Jmp, 0, 0, 0));
        for (i, case) in cases.iter().enumerate() {
            let body = match &case.kind {
                ExprKind::Call(pair) => &pair[1],
                _ => unreachable!(),
            };
            let body_pc = self.current_pc();
            self.patch(branch + 1 + i, 'c', body_pc as i64 - branch as i64);
            self.compile_into(body, target)?;
            ends.push(self.emit(ByteCode::Jmp, 0, 0, 0));
        }
        for end in ends {
            self.patch(end, 'a', self.current_pc() as i64 - end as i64);
        }
        self.release(mark);
        Ok(())
    }

    fn compile_subset(
        &mut self,
        e: &Expr,
        args: &[Expr],
        op: ByteCode,
        target: i64,
    ) -> CompileResult<()> {
        if args.len() != 2 {
            return Err(self.bad(e, "subset", "expected a vector and an index"));
        }
        let mark = self.mark();
        let a = self.compile_operand(&args[0])?;
        let i = self.compile_operand(&args[1])?;
        self.emit(op, a, i, target);
        self.release(mark);
        Ok(())
    }

    fn compile_subset_assign(
        &mut self,
        e: &Expr,
        args: &[Expr],
        op: ByteCode,
        target: i64,
    ) -> CompileResult<()> {
        if args.len() != 3 {
            return Err(self.bad(e, "subset assignment", "expected vector, index, and value"));
        }
        let Some(var) = args[0].as_symbol() else {
            return Err(self.bad(e, "subset assignment", "target must be a symbol"));
        };
        let sym = self.sym(var);
        let mark = self.mark();
        self.compile_into(&args[0], target)?;
        let value = self.compile_operand(&args[2])?;
        let index = self.compile_operand(&args[1])?;
        self.emit(op, value, index, target);
        self.emit(ByteCode::Assign, sym.operand(), 0, target);
        self.release(mark);
        Ok(())
    }

    fn compile_dollar(&mut self, e: &Expr, args: &[Expr], target: i64) -> CompileResult<()> {
        if args.len() != 2 {
            return Err(self.bad(e, "$", "expected a list and a name"));
        }
        let Some(name) = args[1].as_symbol() else {
            return Err(self.bad(e, "$", "element name must be a symbol"));
        };
        let sym = self.sym(name);
        let mark = self.mark();
        let a = self.compile_operand(&args[0])?;
        self.emit(ByteCode::Dollar, a, sym.operand(), target);
        self.release(mark);
        Ok(())
    }

    fn compile_attrget(&mut self, e: &Expr, args: &[Expr], target: i64) -> CompileResult<()> {
        if args.len() != 2 {
            return Err(self.bad(e, "attr", "expected an object and an attribute name"));
        }
        let mark = self.mark();
        let a = self.compile_operand(&args[0])?;
        let which = self.compile_operand(&args[1])?;
        self.emit(ByteCode::AttrGet, a, which, target);
        self.release(mark);
        Ok(())
    }

    fn compile_attrset(&mut self, e: &Expr, args: &[Expr], target: i64) -> CompileResult<()> {
        if args.len() != 3 {
            return Err(self.bad(e, "attr<-", "expected object, attribute name, and value"));
        }
        let mark = self.mark();
        self.compile_into(&args[0], target)?;
        let which = self.compile_operand(&args[1])?;
        let value = self.compile_operand(&args[2])?;
        self.emit(ByteCode::AttrSet, value, which, target);
        if let Some(var) = args[0].as_symbol() {
            let sym = self.sym(var);
            self.emit(ByteCode::Assign, sym.operand(), 0, target);
        }
        self.release(mark);
        Ok(())
    }

    fn compile_ifelse(&mut self, e: &Expr, args: &[Expr], target: i64) -> CompileResult<()> {
        if args.len() != 3 {
            return Err(self.bad(e, "ifelse", "expected condition, yes, and no"));
        }
        let mark = self.mark();
        let cond = self.compile_operand(&args[0])?;
        let yes = self.compile_operand(&args[1])?;
        let no = self.compile_operand(&args[2])?;
        // two-slot encoding: the follower's c operand is the target
        self.emit(ByteCode::IfElse, cond, yes, no);
        self.emit(ByteCode::Jmp, 1, 0, target);
        self.release(mark);
        Ok(())
    }

    fn compile_seq(&mut self, e: &Expr, args: &[Expr], target: i64) -> CompileResult<()> {
        if args.is_empty() || args.len() > 2 {
            return Err(self.bad(e, "seq", "expected length and optional step"));
        }
        let mark = self.mark();
        let len = self.compile_operand(&args[0])?;
        let step = if let Some(s) = args.get(1) {
            self.compile_operand(s)?
        } else {
            let reg = self.push_reg();
            self.emit_constant(Value::integer(1), reg);
            reg
        };
        self.emit(ByteCode::Seq, len, step, target);
        self.release(mark);
        Ok(())
    }

    fn compile_rep(&mut self, e: &Expr, args: &[Expr], target: i64) -> CompileResult<()> {
        if args.len() != 2 {
            return Err(self.bad(e, "rep", "expected a value and a length"));
        }
        let mark = self.mark();
        let len = self.compile_operand(&args[1])?;
        let value = self.compile_operand(&args[0])?;
        self.emit(ByteCode::Rep, len, value, target);
        self.release(mark);
        Ok(())
    }

    fn expect_symbol(
        &mut self,
        e: &Expr,
        args: &[Expr],
        idx: usize,
        form: &'static str,
    ) -> CompileResult<Symbol> {
        match args.get(idx).and_then(|a| a.as_symbol()) {
            Some(s) => Ok(self.interner.intern(s)),
            None => Err(self.bad(e, form, "expected a symbol")),
        }
    }

    fn bad(&self, e: &Expr, form: &'static str, message: &str) -> CompileError {
        CompileError::BadForm {
            form,
            message: message.to_string(),
            span: e.span,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use velo_syntax::parse;

    fn compile(src: &str) -> (Arc<Prototype>, Interner) {
        let mut interner = Interner::new();
        let exprs = parse(src).unwrap();
        let proto = compile_program(&exprs, &mut interner).unwrap();
        (proto, interner)
    }

    #[test]
    fn literal_program_ends_in_done() {
        let (proto, _) = compile("42");
        assert_eq!(proto.code.last().unwrap().op, ByteCode::Done);
        assert_eq!(proto.code[0].op, ByteCode::Constant);
        assert_eq!(proto.constants[0], Value::integer(42));
    }

    #[test]
    fn arithmetic_uses_name_operands() {
        let (proto, interner) = compile("(+ s i)");
        let add = proto
            .code
            .iter()
            .find(|inst| inst.op == ByteCode::Add)
            .unwrap();
        assert_eq!(add.a, interner.get("s").unwrap().operand());
        assert_eq!(add.b, interner.get("i").unwrap().operand());
        assert_eq!(add.c, 0);
    }

    #[test]
    fn constant_vector_folding() {
        let (proto, _) = compile("(c 10 20)");
        assert_eq!(proto.constants[0], Value::integers(vec![10, 20]));
    }

    #[test]
    fn for_loop_shape() {
        let (proto, _) = compile("(for i (: 1 10) i)");
        let fb = proto
            .code
            .iter()
            .position(|inst| inst.op == ByteCode::ForBegin)
            .unwrap();
        let fe = proto
            .code
            .iter()
            .position(|inst| inst.op == ByteCode::ForEnd)
            .unwrap();
        // both are followed by their offset-carrying jmp
        assert_eq!(proto.code[fb + 1].op, ByteCode::Jmp);
        assert_eq!(proto.code[fe + 1].op, ByteCode::Jmp);
        // the back edge points at the body start
        assert_eq!(fe as i64 + proto.code[fe + 1].a, fb as i64 + 2);
        // the exit edge lands past the loop
        assert_eq!(fb as i64 + proto.code[fb + 1].a, fe as i64 + 2);
    }

    #[test]
    fn call_sites_promise_nonliteral_args() {
        let (proto, _) = compile("(f (+ 1 2) 3)");
        assert_eq!(proto.calls.len(), 1);
        let call = &proto.calls[0];
        assert!(matches!(call.arguments[0], Arg::Promise(_)));
        assert!(matches!(call.arguments[1], Arg::Value(_)));
        assert!(!call.has_dots());
    }

    #[test]
    fn function_with_default_parameter() {
        let (proto, _) = compile("(function (x (y 10)) (+ x y))");
        let f = &proto.prototypes[0];
        assert_eq!(f.params.len(), 2);
        assert!(f.params[0].default.is_none());
        assert!(f.params[1].default.is_some());
        assert_eq!(f.code.last().unwrap().op, ByteCode::Ret);
    }

    #[test]
    fn dots_position_recorded() {
        let (proto, _) = compile("(function (...) (f ...))");
        let f = &proto.prototypes[0];
        assert_eq!(f.dots_param, Some(0));
        let call = &f.calls[0];
        assert_eq!(call.dots, 0);
        assert!(call.has_dots());
    }

    #[test]
    fn literal_round_trip_through_deparse() {
        let mut interner = Interner::new();
        let values = vec![
            Value::integers(vec![1, 2, INTEGER_NA]),
            Value::doubles(vec![1.5, double_na()]),
            Value::logical(true),
            Value::character(interner.intern("hello")),
            Value::list(vec![Value::integer(1), Value::Null]),
        ];
        for v in values {
            let text = v.deparse(&interner);
            let exprs = parse(&text).unwrap();
            let back = parse_literal(&exprs[0], &mut interner).unwrap();
            assert_eq!(back, v, "round trip failed for {}", text);
        }
    }
}
