//! The trace recorder.
//!
//! While recording, the interpreter loop hands every instruction here
//! *before* executing it; the recorder reads the live interpreter
//! state, emits IR, and keeps a slot cache mapping interpreter
//! register slots to the IR nodes currently representing their values.
//! Hitting a non-recordable opcode aborts the trace; re-reaching the
//! finish PC closes it.

use crate::jit::ir::{Ir, IrOp, IrRef, Reenter, Shape, Variable};
use crate::jit::TraceId;
use crate::thread::Thread;
use std::collections::HashMap;
use std::sync::Arc;
use velo_core::bc::{ByteCode, Instruction};
use velo_core::interner::Symbol;
use velo_core::prototype::Prototype;
use velo_core::value::{Ty, Value, LOGICAL_FALSE, LOGICAL_NA, LOGICAL_TRUE};

/// Lengths at or below this are specialized to constants with an
/// entry-validated length; longer vectors are tracked symbolically.
pub const SPECIALIZE_LENGTH: usize = 16;

/// Hard cap on raw trace size.
pub const MAX_TRACE_NODES: usize = 1024;

/// Reason a recording was abandoned (for logs).
pub type Abort = &'static str;

pub struct Recorder {
    /// PC the trace was entered at.
    pub start_pc: usize,
    /// PC that closes the trace (equals `start_pc` for loop traces;
    /// the root's start for side traces).
    pub finish_pc: usize,
    pub proto: Arc<Prototype>,
    /// Root trace and exit index when recording a side trace.
    pub root: Option<(TraceId, usize)>,
    pub nodes: Vec<Ir>,
    pub constants: Vec<Value>,
    /// Register-slot cache: which IR node currently holds each slot.
    pub slots: HashMap<Variable, IrRef>,
    pub reenters: HashMap<IrRef, Reenter>,
    cur_env: Option<IrRef>,
}

impl Recorder {
    pub fn new(
        start_pc: usize,
        finish_pc: usize,
        proto: Arc<Prototype>,
        root: Option<(TraceId, usize)>,
    ) -> Recorder {
        let mut rec = Recorder {
            start_pc,
            finish_pc,
            proto,
            root,
            nodes: Vec::new(),
            constants: Vec::new(),
            slots: HashMap::new(),
            reenters: HashMap::new(),
            cur_env: None,
        };
        // node 0 is the constant 1: the scalar shape's trace length
        let one = rec.constant(Value::integer(1));
        debug_assert_eq!(one, 0);
        rec
    }

    fn emit(&mut self, ir: Ir) -> IrRef {
        self.nodes.push(ir);
        self.nodes.len() - 1
    }

    /// Emit (or reuse) a constant node.
    pub fn constant(&mut self, v: Value) -> IrRef {
        let idx = match self.constants.iter().position(|c| *c == v) {
            Some(i) => i,
            None => {
                self.constants.push(v.clone());
                self.constants.len() - 1
            }
        };
        if let Some(r) = self
            .nodes
            .iter()
            .position(|n| n.op == IrOp::Constant && n.a == idx)
        {
            return r;
        }
        let out = match (&v, v.len()) {
            (Value::Null, _) => Shape::EMPTY,
            (_, 1) => Shape::SCALAR,
            (_, n) => {
                let len_ref = self.constant(Value::integer(n as i64));
                Shape { len_ref, len: n }
            }
        };
        self.emit(Ir::new(IrOp::Constant, idx, 0, 0, v.ty(), Shape::EMPTY, out))
    }

    fn cur_env(&mut self) -> IrRef {
        if let Some(r) = self.cur_env {
            return r;
        }
        let r = self.emit(Ir::new(
            IrOp::Curenv,
            0,
            0,
            0,
            Ty::Environment,
            Shape::EMPTY,
            Shape::SCALAR,
        ));
        self.cur_env = Some(r);
        r
    }

    fn recordable(v: &Value) -> Result<Ty, Abort> {
        match v.ty() {
            t @ (Ty::Logical | Ty::Integer | Ty::Double) => Ok(t),
            _ => Err("operand type is not recordable"),
        }
    }

    /// Length specialization: short lengths become constants (the
    /// observed length is validated at trace entry), long lengths stay
    /// symbolic through the given length node.
    fn specialize_length(&mut self, len: usize, len_node: IrRef) -> Shape {
        if len == 1 {
            Shape::SCALAR
        } else if len <= SPECIALIZE_LENGTH {
            let len_ref = self.constant(Value::integer(len as i64));
            Shape { len_ref, len }
        } else {
            Shape {
                len_ref: len_node,
                len,
            }
        }
    }

    /// Load an operand: registers go through the slot cache; names
    /// walk the lexical chain, speculating (with a guard per level)
    /// that intermediate environments still lack the binding.
    pub fn load(&mut self, thread: &Thread, operand: i64, pc: usize) -> Result<IrRef, Abort> {
        if operand <= 0 {
            let var = Variable::register(operand);
            if let Some(&r) = self.slots.get(&var) {
                return Ok(r);
            }
            let v = thread.reg(operand).clone();
            let ty = Self::recordable(&v)?;
            let slen = self.emit(Ir::new(
                IrOp::Slength,
                0,
                (-operand) as usize,
                0,
                Ty::Integer,
                Shape::EMPTY,
                Shape::SCALAR,
            ));
            let out = self.specialize_length(v.len(), slen);
            let r = self.emit(Ir::new(
                IrOp::Sload,
                0,
                (-operand) as usize,
                0,
                ty,
                Shape::EMPTY,
                out,
            ));
            self.reenters.insert(r, Reenter { pc, in_scope: true });
            self.slots.insert(var, r);
            Ok(r)
        } else {
            let sym = Symbol::from_operand(operand);
            let mut env_ref = self.cur_env();
            let mut env_id = thread.frame().env;
            loop {
                if thread.envs.get(env_id).has(sym) {
                    break;
                }
                let g = self.emit(Ir::new(
                    IrOp::Load,
                    env_ref,
                    operand as usize,
                    0,
                    Ty::Nil,
                    Shape::SCALAR,
                    Shape::EMPTY,
                ));
                self.reenters.insert(g, Reenter { pc, in_scope: true });
                env_ref = self.emit(Ir::new(
                    IrOp::Lenv,
                    env_ref,
                    0,
                    0,
                    Ty::Environment,
                    Shape::SCALAR,
                    Shape::SCALAR,
                ));
                env_id = match thread.envs.get(env_id).lexical {
                    Some(p) => p,
                    None => return Err("unbound name during recording"),
                };
            }
            let v = thread.envs.get(env_id).get(sym);
            let ty = Self::recordable(&v)?;
            let elen = self.emit(Ir::new(
                IrOp::Elength,
                env_ref,
                operand as usize,
                0,
                Ty::Integer,
                Shape::EMPTY,
                Shape::SCALAR,
            ));
            let out = self.specialize_length(v.len(), elen);
            let r = self.emit(Ir::new(
                IrOp::Load,
                env_ref,
                operand as usize,
                0,
                ty,
                Shape::EMPTY,
                out,
            ));
            self.reenters.insert(r, Reenter { pc, in_scope: true });
            Ok(r)
        }
    }

    /// Store an IR value to a register slot or a name in the current
    /// environment.
    pub fn store(&mut self, value: IrRef, operand: i64) {
        if operand <= 0 {
            let out = self.nodes[value].out;
            self.emit(Ir::new(
                IrOp::Sstore,
                0,
                (-operand) as usize,
                value,
                Ty::Nil,
                out,
                Shape::EMPTY,
            ));
            self.slots.insert(Variable::register(operand), value);
        } else {
            let e = self.cur_env();
            let out = self.nodes[value].out;
            self.emit(Ir::new(
                IrOp::Store,
                e,
                operand as usize,
                value,
                Ty::Nil,
                out,
                Shape::EMPTY,
            ));
        }
    }

    /// Insert a cast if the value's element type differs.
    pub fn cast(&mut self, a: IrRef, ty: Ty) -> IrRef {
        if self.nodes[a].ty == ty {
            return a;
        }
        let op = match ty {
            Ty::Double => IrOp::CastDouble,
            Ty::Integer => IrOp::CastInteger,
            Ty::Logical => IrOp::CastLogical,
            _ => return a,
        };
        let s = self.nodes[a].out;
        self.emit(Ir::new(op, a, 0, 0, ty, s, s))
    }

    /// Recycle a value to a target shape: a repeating index pattern
    /// plus a gather.
    pub fn rep_to(&mut self, a: IrRef, target: Shape) -> IrRef {
        if self.nodes[a].out == target {
            return a;
        }
        let modulus = self.nodes[a].out.len_ref;
        let idx = self.emit(Ir::new(
            IrOp::RepIdx,
            modulus,
            0,
            0,
            Ty::Integer,
            target,
            target,
        ));
        let ty = self.nodes[a].ty;
        self.emit(Ir::new(IrOp::Gather, a, idx, 0, ty, target, target))
    }

    /// Merge operand shapes, emitting a recycling guard when the trace
    /// lengths differ. Commutative up to guard placement.
    pub fn merge_shapes(&mut self, a: Shape, b: Shape, pc: usize) -> Shape {
        if a.is_empty() || b.is_empty() {
            return Shape::EMPTY;
        }
        if a == b {
            // same trace length: adopt the smaller observed length and
            // rewrite the larger one everywhere
            if a.len == b.len {
                return a;
            }
            let small = a.len.min(b.len);
            let large = a.len.max(b.len);
            for node in &mut self.nodes {
                if node.input.len == large {
                    node.input.len = small;
                }
                if node.out.len == large {
                    node.out.len = small;
                }
            }
            return Shape {
                len_ref: a.len_ref,
                len: small,
            };
        }
        // distinct trace lengths: guard that the shorter fits in
        // (0, longer] and take the longer as the result shape
        let (short, long) = if a.len < b.len {
            (a, b)
        } else if b.len < a.len {
            (b, a)
        } else if a.len_ref < b.len_ref {
            (a, b)
        } else {
            (b, a)
        };
        let zero = self.constant(Value::integer(0));
        let x = self.emit(Ir::new(
            IrOp::Le,
            short.len_ref,
            long.len_ref,
            0,
            Ty::Logical,
            Shape::SCALAR,
            Shape::SCALAR,
        ));
        let y = self.emit(Ir::new(
            IrOp::Gt,
            short.len_ref,
            zero,
            0,
            Ty::Logical,
            Shape::SCALAR,
            Shape::SCALAR,
        ));
        let z = self.emit(Ir::new(
            IrOp::And,
            x,
            y,
            0,
            Ty::Logical,
            Shape::SCALAR,
            Shape::SCALAR,
        ));
        let g = self.emit(Ir::new(
            IrOp::Gtrue,
            z,
            0,
            0,
            Ty::Nil,
            Shape::SCALAR,
            Shape::EMPTY,
        ));
        self.reenters.insert(g, Reenter { pc, in_scope: true });
        long
    }

    fn emit_binary(
        &mut self,
        op: ByteCode,
        a: IrRef,
        b: IrRef,
        pc: usize,
    ) -> Result<IrRef, Abort> {
        let (irop, operand_ty, result_ty) =
            binary_types(op, self.nodes[a].ty, self.nodes[b].ty)?;
        let sa = self.nodes[a].out;
        let sb = self.nodes[b].out;
        let shape = self.merge_shapes(sa, sb, pc);
        let ca = self.cast(a, operand_ty);
        let ca = self.rep_to(ca, shape);
        let cb = self.cast(b, operand_ty);
        let cb = self.rep_to(cb, shape);
        Ok(self.emit(Ir::new(irop, ca, cb, 0, result_ty, shape, shape)))
    }

    fn emit_unary(&mut self, op: ByteCode, a: IrRef) -> Result<IrRef, Abort> {
        let (irop, operand_ty, result_ty) = unary_types(op, self.nodes[a].ty)?;
        let ca = self.cast(a, operand_ty);
        let s = self.nodes[ca].out;
        Ok(self.emit(Ir::new(irop, ca, 0, 0, result_ty, s, s)))
    }

    fn emit_fold(&mut self, op: ByteCode, a: IrRef) -> Result<IrRef, Abort> {
        let (irop, operand_ty, result_ty) = fold_types(op, self.nodes[a].ty)?;
        let ca = self.cast(a, operand_ty);
        let input = self.nodes[ca].out;
        let out = if op == ByteCode::CumSum {
            input
        } else {
            Shape::SCALAR
        };
        Ok(self.emit(Ir::new(irop, ca, 0, 0, result_ty, input, out)))
    }

    /// A concrete operand value, without forcing.
    fn peek(&self, thread: &Thread, operand: i64) -> Result<Value, Abort> {
        let v = if operand <= 0 {
            thread.reg(operand).clone()
        } else {
            thread.lookup(Symbol::from_operand(operand)).0
        };
        if v.is_concrete() {
            Ok(v)
        } else {
            Err("promise operand during recording")
        }
    }

    /// Record one instruction. `Err` aborts the trace.
    pub fn record(&mut self, thread: &Thread, pc: usize, inst: &Instruction) -> Result<(), Abort> {
        if self.nodes.len() > MAX_TRACE_NODES {
            return Err("trace too long");
        }
        if !Arc::ptr_eq(&self.proto, &thread.frame().proto) {
            return Err("crossed a frame boundary");
        }
        match inst.op {
            ByteCode::Jmp => Ok(()),

            ByteCode::Constant => {
                let k = self.proto.constants[inst.a as usize].clone();
                match k.ty() {
                    Ty::Logical | Ty::Integer | Ty::Double | Ty::Null => {
                        let r = self.constant(k);
                        self.store(r, inst.c);
                        Ok(())
                    }
                    _ => Err("non-numeric constant"),
                }
            }

            ByteCode::Mov | ByteCode::FastMov => {
                let r = self.load(thread, inst.a, pc)?;
                self.store(r, inst.c);
                Ok(())
            }

            ByteCode::Assign => {
                let r = self.load(thread, inst.c, pc)?;
                self.store(r, inst.a);
                Ok(())
            }

            ByteCode::Jc => {
                let cond = self.peek(thread, inst.c)?;
                let taken = match truthiness(&cond) {
                    Some(t) => t,
                    None => return Err("non-scalar or NA condition"),
                };
                let p = self.load(thread, inst.c, pc)?;
                if inst.c <= 0 {
                    self.emit(Ir::new(
                        IrOp::Kill,
                        0,
                        (-inst.c) as usize,
                        0,
                        Ty::Nil,
                        Shape::EMPTY,
                        Shape::EMPTY,
                    ));
                }
                let input = self.nodes[p].out;
                let g = self.emit(Ir::new(
                    if taken { IrOp::Gtrue } else { IrOp::Gfalse },
                    p,
                    0,
                    0,
                    Ty::Nil,
                    input,
                    Shape::EMPTY,
                ));
                let not_taken = if taken { inst.b } else { inst.a };
                self.reenters.insert(
                    g,
                    Reenter {
                        pc: (pc as i64 + not_taken) as usize,
                        in_scope: true,
                    },
                );
                Ok(())
            }

            ByteCode::Subset => {
                let idx = self.peek(thread, inst.b)?;
                if !matches!(idx.ty(), Ty::Integer | Ty::Double) {
                    return Err("non-numeric subscript");
                }
                let a = self.load(thread, inst.a, pc)?;
                let b = self.load(thread, inst.b, pc)?;
                let b = self.cast(b, Ty::Integer);
                let one = self.constant(Value::integer(1));
                let shape = self.nodes[b].out;
                let one = self.rep_to(one, shape);
                let b0 = self.emit(Ir::new(
                    IrOp::Sub,
                    b,
                    one,
                    0,
                    Ty::Integer,
                    shape,
                    shape,
                ));
                let ty = self.nodes[a].ty;
                let g = self.emit(Ir::new(IrOp::Gather, a, b0, 0, ty, shape, shape));
                self.store(g, inst.c);
                Ok(())
            }

            ByteCode::IAssign => {
                let value = self.load(thread, inst.a, pc)?;
                let idx = self.load(thread, inst.b, pc)?;
                let dest = self.load(thread, inst.c, pc)?;
                if self.nodes[value].ty != self.nodes[dest].ty {
                    return Err("type-changing scatter");
                }
                let idx = self.cast(idx, Ty::Integer);
                let one = self.constant(Value::integer(1));
                let ishape = self.nodes[idx].out;
                let one = self.rep_to(one, ishape);
                let idx0 = self.emit(Ir::new(
                    IrOp::Sub,
                    idx,
                    one,
                    0,
                    Ty::Integer,
                    ishape,
                    ishape,
                ));
                let vshape = self.nodes[value].out;
                let s = self.merge_shapes(vshape, ishape, pc);
                let rv = self.rep_to(value, s);
                let ri = self.rep_to(idx0, s);
                let ty = self.nodes[dest].ty;
                let out = self.nodes[dest].out;
                let sc = self.emit(Ir::new(IrOp::Scatter, rv, ri, dest, ty, s, out));
                self.store(sc, inst.c);
                Ok(())
            }

            op if op.is_unary_arith() => {
                let a = self.load(thread, inst.a, pc)?;
                let r = self.emit_unary(op, a)?;
                self.store(r, inst.c);
                Ok(())
            }

            op if op.is_binary_arith() => {
                let a = self.load(thread, inst.a, pc)?;
                let b = self.load(thread, inst.b, pc)?;
                let r = self.emit_binary(op, a, b, pc)?;
                self.store(r, inst.c);
                Ok(())
            }

            op if op.is_fold() => {
                let a = self.load(thread, inst.a, pc)?;
                let r = self.emit_fold(op, a)?;
                self.store(r, inst.c);
                Ok(())
            }

            ByteCode::IfElse => {
                let cond = self.load(thread, inst.a, pc)?;
                let yes = self.load(thread, inst.b, pc)?;
                let no = self.load(thread, inst.c, pc)?;
                let ty = match (self.nodes[yes].ty, self.nodes[no].ty) {
                    (Ty::Double, _) | (_, Ty::Double) => Ty::Double,
                    (Ty::Integer, _) | (_, Ty::Integer) => Ty::Integer,
                    _ => Ty::Logical,
                };
                let sc = self.nodes[cond].out;
                let sy = self.nodes[yes].out;
                let sn = self.nodes[no].out;
                let s0 = self.merge_shapes(sy, sn, pc);
                let s = self.merge_shapes(sc, s0, pc);
                let c = self.cast(cond, Ty::Logical);
                let c = self.rep_to(c, s);
                let y = self.cast(yes, ty);
                let y = self.rep_to(y, s);
                let n = self.cast(no, ty);
                let n = self.rep_to(n, s);
                let r = self.emit(Ir::new(IrOp::IfElse, c, y, n, ty, s, s));
                let target = self.proto.code[pc + 1].c;
                self.store(r, target);
                Ok(())
            }

            ByteCode::Length => {
                let a = self.load(thread, inst.a, pc)?;
                let r = self.emit(Ir::new(
                    IrOp::Length,
                    a,
                    0,
                    0,
                    Ty::Integer,
                    Shape::SCALAR,
                    Shape::SCALAR,
                ));
                self.store(r, inst.c);
                Ok(())
            }

            ByteCode::ForEnd => {
                let counter = self.load(thread, inst.c, pc)?;
                let vec = self.load(thread, inst.b, pc)?;
                let len = self.emit(Ir::new(
                    IrOp::Length,
                    vec,
                    0,
                    0,
                    Ty::Integer,
                    Shape::SCALAR,
                    Shape::SCALAR,
                ));
                let lt = self.emit(Ir::new(
                    IrOp::Lt,
                    counter,
                    len,
                    0,
                    Ty::Logical,
                    Shape::SCALAR,
                    Shape::SCALAR,
                ));
                let g = self.emit(Ir::new(
                    IrOp::Gtrue,
                    lt,
                    0,
                    0,
                    Ty::Nil,
                    Shape::SCALAR,
                    Shape::EMPTY,
                ));
                self.reenters.insert(
                    g,
                    Reenter {
                        pc: pc + 2,
                        in_scope: false,
                    },
                );
                let ty = self.nodes[vec].ty;
                let elem = self.emit(Ir::new(
                    IrOp::Gather,
                    vec,
                    counter,
                    0,
                    ty,
                    Shape::SCALAR,
                    Shape::SCALAR,
                ));
                self.store(elem, inst.a);
                let one = self.constant(Value::integer(1));
                let inc = self.emit(Ir::new(
                    IrOp::Add,
                    counter,
                    one,
                    0,
                    Ty::Integer,
                    Shape::SCALAR,
                    Shape::SCALAR,
                ));
                self.store(inc, inst.c);
                Ok(())
            }

            ByteCode::Seq => {
                let len_v = self.peek(thread, inst.a)?;
                let len = len_v.cast_integer().map_err(|_| "bad seq length")?;
                let len = *len.first().ok_or("bad seq length")?;
                let l = self.load(thread, inst.a, pc)?;
                let l = self.cast(l, Ty::Integer);
                let shape = self.specialize_length(len.max(0) as usize, l);
                let step = self.load(thread, inst.b, pc)?;
                let step = self.cast(step, Ty::Integer);
                let r = self.emit(Ir::new(
                    IrOp::Seq,
                    l,
                    step,
                    0,
                    Ty::Integer,
                    shape,
                    shape,
                ));
                self.store(r, inst.c);
                Ok(())
            }

            ByteCode::Rep => {
                let len_v = self.peek(thread, inst.a)?;
                let len = len_v.cast_integer().map_err(|_| "bad rep length")?;
                let len = *len.first().ok_or("bad rep length")?;
                let l = self.load(thread, inst.a, pc)?;
                let l = self.cast(l, Ty::Integer);
                let shape = self.specialize_length(len.max(0) as usize, l);
                let v = self.load(thread, inst.b, pc)?;
                let r = self.rep_to(v, shape);
                self.store(r, inst.c);
                Ok(())
            }

            ByteCode::Strip => {
                let v = self.peek(thread, inst.a)?;
                if v.is_object() {
                    return Err("object strip");
                }
                let r = self.load(thread, inst.a, pc)?;
                self.store(r, inst.c);
                Ok(())
            }

            ByteCode::AttrGet => {
                let v = self.peek(thread, inst.a)?;
                if v.is_object() {
                    return Err("object attribute load");
                }
                let r = self.constant(Value::Null);
                self.store(r, inst.c);
                Ok(())
            }

            ByteCode::Missing => {
                let env = thread.frame().env;
                let v = thread.envs.get(env).get(Symbol::from_operand(inst.a));
                let missing = matches!(v, Value::Nil | Value::Default(_));
                let r = self.constant(Value::logical(missing));
                self.store(r, inst.c);
                Ok(())
            }

            _ => Err("opcode is not recordable"),
        }
    }
}

/// Truth value of a length-1 condition; None for NA or non-scalars.
fn truthiness(v: &Value) -> Option<bool> {
    if let Some(x) = v.as_logical1() {
        return match x {
            LOGICAL_TRUE => Some(true),
            LOGICAL_FALSE => Some(false),
            _ => None,
        };
    }
    if let Some(x) = v.as_integer1() {
        return if x == velo_core::value::INTEGER_NA {
            None
        } else {
            Some(x != 0)
        };
    }
    if let Some(x) = v.as_double1() {
        return if x.is_nan() { None } else { Some(x != 0.0) };
    }
    None
}

/// Operand/result element types for a binary bytecode, mirroring the
/// interpreter's dispatch exactly.
fn binary_types(op: ByteCode, a: Ty, b: Ty) -> Result<(IrOp, Ty, Ty), Abort> {
    let wider = if a == Ty::Double || b == Ty::Double {
        Ty::Double
    } else {
        Ty::Integer
    };
    Ok(match op {
        ByteCode::Add => (IrOp::Add, wider, wider),
        ByteCode::Sub => (IrOp::Sub, wider, wider),
        ByteCode::Mul => (IrOp::Mul, wider, wider),
        ByteCode::Div => (IrOp::Div, Ty::Double, Ty::Double),
        ByteCode::Pow => (IrOp::Pow, Ty::Double, Ty::Double),
        ByteCode::Mod => (IrOp::Mod, wider, wider),
        ByteCode::Eq => (IrOp::Eq, wider, Ty::Logical),
        ByteCode::Neq => (IrOp::Neq, wider, Ty::Logical),
        ByteCode::Lt => (IrOp::Lt, wider, Ty::Logical),
        ByteCode::Le => (IrOp::Le, wider, Ty::Logical),
        ByteCode::Gt => (IrOp::Gt, wider, Ty::Logical),
        ByteCode::Ge => (IrOp::Ge, wider, Ty::Logical),
        ByteCode::And => (IrOp::And, Ty::Logical, Ty::Logical),
        ByteCode::Or => (IrOp::Or, Ty::Logical, Ty::Logical),
        _ => return Err("not a binary op"),
    })
}

fn unary_types(op: ByteCode, a: Ty) -> Result<(IrOp, Ty, Ty), Abort> {
    let numeric = if a == Ty::Double { Ty::Double } else { Ty::Integer };
    Ok(match op {
        ByteCode::Neg => (IrOp::Neg, numeric, numeric),
        ByteCode::Not => (IrOp::Not, Ty::Logical, Ty::Logical),
        ByteCode::IsNa => (IrOp::IsNa, a, Ty::Logical),
        ByteCode::IsFinite => (IrOp::IsFinite, Ty::Double, Ty::Logical),
        ByteCode::Abs => (IrOp::Abs, numeric, numeric),
        ByteCode::Sqrt => (IrOp::Sqrt, Ty::Double, Ty::Double),
        ByteCode::Exp => (IrOp::Exp, Ty::Double, Ty::Double),
        ByteCode::Log => (IrOp::Log, Ty::Double, Ty::Double),
        ByteCode::Floor => (IrOp::Floor, Ty::Double, Ty::Double),
        ByteCode::Ceiling => (IrOp::Ceiling, Ty::Double, Ty::Double),
        _ => return Err("not a unary op"),
    })
}

fn fold_types(op: ByteCode, a: Ty) -> Result<(IrOp, Ty, Ty), Abort> {
    let numeric = if a == Ty::Double { Ty::Double } else { Ty::Integer };
    Ok(match op {
        ByteCode::Sum => (IrOp::Sum, numeric, numeric),
        ByteCode::Prod => (IrOp::Prod, Ty::Double, Ty::Double),
        ByteCode::Min => (IrOp::Min, numeric, numeric),
        ByteCode::Max => (IrOp::Max, numeric, numeric),
        ByteCode::Any => (IrOp::Any, Ty::Logical, Ty::Logical),
        ByteCode::All => (IrOp::All, Ty::Logical, Ty::Logical),
        ByteCode::CumSum => (IrOp::CumSum, numeric, numeric),
        _ => return Err("not a fold"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> Recorder {
        Recorder::new(0, 0, Arc::new(Prototype::default()), None)
    }

    /// A symbolic vector shape backed by a fresh length node.
    fn symbolic_shape(rec: &mut Recorder, len: usize) -> Shape {
        let slot = rec.nodes.len();
        let len_ref = rec.emit(Ir::new(
            IrOp::Slength,
            0,
            slot,
            0,
            Ty::Integer,
            Shape::EMPTY,
            Shape::SCALAR,
        ));
        Shape { len_ref, len }
    }

    #[test]
    fn scalar_shape_is_the_seeded_constant_one() {
        let rec = recorder();
        assert_eq!(rec.nodes[0].op, IrOp::Constant);
        assert_eq!(rec.constants[0], Value::integer(1));
        assert!(Shape::SCALAR.is_scalar());
    }

    #[test]
    fn short_lengths_specialize_to_constants() {
        let mut rec = recorder();
        let len_node = rec.emit(Ir::new(
            IrOp::Slength,
            0,
            1,
            0,
            Ty::Integer,
            Shape::EMPTY,
            Shape::SCALAR,
        ));
        let short = rec.specialize_length(4, len_node);
        assert_eq!(rec.nodes[short.len_ref].op, IrOp::Constant);
        assert_eq!(short.len, 4);

        let long = rec.specialize_length(10_000, len_node);
        assert_eq!(long.len_ref, len_node);
        assert_eq!(long.len, 10_000);
    }

    #[test]
    fn merge_shapes_equal_is_identity() {
        let mut rec = recorder();
        let s = symbolic_shape(&mut rec, 100);
        let before = rec.nodes.len();
        let merged = rec.merge_shapes(s, s, 0);
        assert_eq!(merged, s);
        assert_eq!(rec.nodes.len(), before, "no guard for equal shapes");
    }

    #[test]
    fn merge_shapes_emits_recycling_guard() {
        let mut rec = recorder();
        let short = symbolic_shape(&mut rec, 2);
        let long = symbolic_shape(&mut rec, 1000);
        let merged = rec.merge_shapes(short, long, 7);
        assert_eq!(merged, long);
        let guard = rec
            .nodes
            .iter()
            .position(|n| n.op == IrOp::Gtrue)
            .expect("recycling guard emitted");
        assert_eq!(rec.reenters[&guard].pc, 7);
        // the guard checks `short <= long && short > 0`
        assert!(rec.nodes.iter().any(|n| n.op == IrOp::Le));
        assert!(rec.nodes.iter().any(|n| n.op == IrOp::And));
    }

    #[test]
    fn merge_shapes_is_commutative() {
        let mut ab = recorder();
        let s1 = symbolic_shape(&mut ab, 2);
        let s2 = symbolic_shape(&mut ab, 1000);
        let merged_ab = ab.merge_shapes(s1, s2, 0);

        let mut ba = recorder();
        let t1 = symbolic_shape(&mut ba, 2);
        let t2 = symbolic_shape(&mut ba, 1000);
        let merged_ba = ba.merge_shapes(t2, t1, 0);

        assert_eq!(merged_ab.len_ref, merged_ba.len_ref);
        assert_eq!(merged_ab.len, merged_ba.len);
        assert_eq!(ab.nodes.len(), ba.nodes.len());
    }

    #[test]
    fn empty_shape_dominates_merge() {
        let mut rec = recorder();
        let s = symbolic_shape(&mut rec, 10);
        assert!(rec.merge_shapes(s, Shape::EMPTY, 0).is_empty());
        assert!(rec.merge_shapes(Shape::EMPTY, s, 0).is_empty());
    }

    #[test]
    fn cast_is_a_no_op_on_matching_type() {
        let mut rec = recorder();
        let c = rec.constant(Value::integer(5));
        assert_eq!(rec.cast(c, Ty::Integer), c);
        let as_dbl = rec.cast(c, Ty::Double);
        assert_eq!(rec.nodes[as_dbl].op, IrOp::CastDouble);
    }

    #[test]
    fn rep_to_emits_index_pattern_and_gather() {
        let mut rec = recorder();
        let c = rec.constant(Value::integers(vec![10, 20]));
        let target = symbolic_shape(&mut rec, 1000);
        let r = rec.rep_to(c, target);
        assert_eq!(rec.nodes[r].op, IrOp::Gather);
        assert_eq!(rec.nodes[rec.nodes[r].b].op, IrOp::RepIdx);
        assert_eq!(rec.nodes[r].out, target);
    }
}
