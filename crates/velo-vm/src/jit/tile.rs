//! Tile-wise trace executor.
//!
//! Runs optimized trace code over fixed-width vector tiles. Fusable
//! groups execute tile-by-tile through the assigned register pool so
//! intermediate full-width buffers only materialize where a value
//! escapes its group (a consumer outside the group, an exit snapshot,
//! or a phi). Scalar and irregular nodes evaluate whole.
//!
//! The executor never mutates interpreter state: all side effects
//! happen during exit application, so a validation failure anywhere
//! can simply bail back to pure interpretation.

use crate::arith::{self, int_is_na};
use crate::jit::ir::{IrOp, IrRef, Shape, TraceCode};
use crate::thread::Thread;
use velo_core::env::EnvId;
use velo_core::interner::Symbol;
use velo_core::value::{
    double_na, Ty, Value, INTEGER_NA, LOGICAL_FALSE, LOGICAL_NA, LOGICAL_TRUE,
};

/// Lanes per vector tile (and per tile register).
pub const TILE: usize = 16;

/// How a trace run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Guard failure at the node position; apply its exit record.
    Exit(IrRef),
    /// Entry validation or an in-trace anomaly: no state was touched,
    /// fall back to the interpreter at the trace start.
    Bail,
}

enum Control {
    Next,
    Exit(IrRef),
    Bail,
}

/// A computed node value.
#[derive(Debug, Clone)]
pub enum Slot {
    Empty,
    Null,
    Int(i64),
    Dbl(f64),
    Log(u8),
    Env(EnvId),
    IntVec(Vec<i64>),
    DblVec(Vec<f64>),
    LogVec(Vec<u8>),
}

impl Slot {
    fn len(&self) -> usize {
        match self {
            Slot::IntVec(v) => v.len(),
            Slot::DblVec(v) => v.len(),
            Slot::LogVec(v) => v.len(),
            Slot::Empty | Slot::Null => 0,
            _ => 1,
        }
    }
}

pub struct TileExec<'t> {
    code: &'t TraceCode,
    pub values: Vec<Slot>,
    regs: Vec<[u64; TILE]>,
    consumers: Vec<Vec<IrRef>>,
    /// Needed outside any group: exit snapshots and phi ends.
    external: Vec<bool>,
    entry_base: usize,
    entry_env: EnvId,
}

impl<'t> TileExec<'t> {
    pub fn new(code: &'t TraceCode, thread: &Thread) -> TileExec<'t> {
        let n = code.nodes.len();
        let mut consumers: Vec<Vec<IrRef>> = vec![Vec::new(); n];
        for (i, node) in code.nodes.iter().enumerate() {
            if !code.live[i] {
                continue;
            }
            for r in operand_refs(node) {
                consumers[r].push(i);
            }
        }
        let mut external = vec![false; n];
        for exit in code.exits.values() {
            for (var, r) in &exit.stores {
                external[*r] = true;
                if !var.is_register() {
                    external[var.env as usize] = true;
                }
            }
            for e in &exit.environments {
                external[*e] = true;
            }
        }
        for node in &code.nodes {
            if node.op == IrOp::Phi {
                external[node.a] = true;
                external[node.b] = true;
            }
        }
        TileExec {
            code,
            values: vec![Slot::Empty; n],
            regs: vec![[0u64; TILE]; crate::jit::regalloc::N_REGS as usize],
            consumers,
            external,
            entry_base: thread.base,
            entry_env: thread.frame().env,
        }
    }

    /// Run the trace to a guard failure (loop traces only leave
    /// through one) or to the terminal exit of a side trace.
    pub fn run(&mut self, thread: &Thread) -> Outcome {
        let end = self.code.nodes.len();
        match self.code.loop_start {
            None => match self.run_range(thread, 0, end) {
                Control::Exit(pos) => Outcome::Exit(pos),
                Control::Bail => Outcome::Bail,
                // a side trace always ends in an exit node
                Control::Next => Outcome::Bail,
            },
            Some(loop_start) => {
                match self.run_range(thread, 0, loop_start) {
                    Control::Exit(pos) => return Outcome::Exit(pos),
                    Control::Bail => return Outcome::Bail,
                    Control::Next => {}
                }
                loop {
                    match self.run_range(thread, loop_start + 1, end) {
                        Control::Exit(pos) => return Outcome::Exit(pos),
                        Control::Bail => return Outcome::Bail,
                        Control::Next => self.apply_phis(),
                    }
                }
            }
        }
    }

    /// Parallel phi shuffle at the loop back edge.
    fn apply_phis(&mut self) {
        let mut moves: Vec<(IrRef, Slot)> = Vec::new();
        for (i, node) in self.code.nodes.iter().enumerate() {
            if node.op == IrOp::Phi && self.code.live[i] {
                moves.push((node.a, self.values[node.b].clone()));
            }
        }
        for (dst, v) in moves {
            self.values[dst] = v;
        }
    }

    fn run_range(&mut self, thread: &Thread, start: usize, end: usize) -> Control {
        let mut i = start;
        while i < end {
            if !self.code.live[i] {
                i += 1;
                continue;
            }
            let j = self.group_end(i, end);
            if j > i + 1 {
                match self.run_group(i, j) {
                    Control::Next => i = j,
                    other => return other,
                }
            } else {
                match self.run_node(thread, i) {
                    Control::Next => i += 1,
                    other => return other,
                }
            }
        }
        Control::Next
    }

    /// Extent of the tile-executable fusion group starting at `i`.
    fn group_end(&self, i: usize, end: usize) -> usize {
        if !self.tile_executable(i) {
            return i;
        }
        let shape = self.code.nodes[i].input;
        let mut j = i + 1;
        while j < end {
            if !self.code.live[j] {
                break;
            }
            if !self.code.fusable[j]
                || !self.tile_executable(j)
                || self.code.nodes[j].input != shape
            {
                break;
            }
            j += 1;
        }
        j
    }

    /// Can this node run lane-wise inside a fusion group?
    fn tile_executable(&self, i: usize) -> bool {
        let node = self.code.nodes[i];
        if node.out.is_empty() && !node.op.is_guard() {
            return false;
        }
        let needs_reg = !node.out.is_scalar();
        if needs_reg && self.code.reg[i] == crate::jit::ir::NO_REG {
            return false;
        }
        match node.op {
            IrOp::Seq | IrOp::RepIdx | IrOp::IfElse | IrOp::CastDouble | IrOp::CastInteger
            | IrOp::CastLogical | IrOp::Neg | IrOp::Not | IrOp::IsNa | IrOp::IsFinite
            | IrOp::Sqrt | IrOp::Abs | IrOp::Floor | IrOp::Ceiling | IrOp::Exp | IrOp::Log
            | IrOp::Add | IrOp::Sub | IrOp::Mul | IrOp::Div | IrOp::Mod | IrOp::Pow
            | IrOp::Eq | IrOp::Neq | IrOp::Lt | IrOp::Le | IrOp::Gt | IrOp::Ge | IrOp::And
            | IrOp::Or | IrOp::Sum | IrOp::Prod | IrOp::Min | IrOp::Max | IrOp::Any
            | IrOp::All | IrOp::CumSum => !node.input.is_scalar() && !node.input.is_empty(),
            IrOp::Gather => {
                // base is read whole; only fusable when it was
                // materialized before this group
                !node.input.is_scalar() && matches!(self.values[node.a], Slot::IntVec(_) | Slot::DblVec(_) | Slot::LogVec(_) | Slot::Int(_) | Slot::Dbl(_) | Slot::Log(_))
            }
            _ => false,
        }
    }

    /// Run one fusion group tile by tile through the register pool.
    fn run_group(&mut self, i: usize, j: usize) -> Control {
        let len = match self.resolve_len(self.code.nodes[i].input) {
            Some(l) => l,
            None => return Control::Bail,
        };
        // outputs that escape the group materialize as full vectors
        let mut materialize: Vec<bool> = vec![false; j - i];
        for k in i..j {
            let escapes = self.external[k]
                || self.consumers[k].iter().any(|&c| c < i || c >= j)
                || self.code.nodes[k].out.is_scalar();
            materialize[k - i] = escapes;
            if escapes && !self.code.nodes[k].out.is_scalar() {
                self.values[k] = self.alloc_out(k, len);
            }
        }
        // fold accumulators persist across tiles
        for k in i..j {
            if let Some(base) = fold_base(self.code.nodes[k].op, self.code.nodes[k].ty) {
                self.values[k] = base;
            }
        }

        let mut base = 0usize;
        while base < len {
            let w = TILE.min(len - base);
            for k in i..j {
                if !self.code.live[k] {
                    continue;
                }
                if let Control::Bail = self.run_tile(k, base, w, i, j) {
                    return Control::Bail;
                }
                if materialize[k - i] && !self.code.nodes[k].out.is_scalar() {
                    self.spill_tile(k, base, w);
                }
            }
            base += TILE;
        }
        Control::Next
    }

    /// One node over one tile: read lanes, apply the kernel, write the
    /// result register.
    fn run_tile(&mut self, k: usize, base: usize, w: usize, gi: usize, gj: usize) -> Control {
        let node = self.code.nodes[k];
        let out_reg = self.code.reg[k];
        match node.op {
            IrOp::Seq => {
                let step = match self.scalar_int(node.b) {
                    Some(s) => s,
                    None => return Control::Bail,
                };
                for lane in 0..w {
                    let v = 1 + (base + lane) as i64 * step;
                    self.regs[out_reg as usize][lane] = v as u64;
                }
            }
            IrOp::RepIdx => {
                let m = match self.scalar_int(node.a) {
                    Some(m) if m > 0 => m,
                    _ => return Control::Bail,
                };
                for lane in 0..w {
                    let v = ((base + lane) as i64) % m;
                    self.regs[out_reg as usize][lane] = v as u64;
                }
            }
            IrOp::Gather => {
                for lane in 0..w {
                    let idx = self.lane(node.b, base, lane, gi, gj);
                    let i64idx = idx as i64;
                    let v = self.gather_lane(node.a, i64idx, node.ty);
                    self.regs[out_reg as usize][lane] = v;
                }
            }
            IrOp::IfElse => {
                for lane in 0..w {
                    let c = self.lane(node.a, base, lane, gi, gj) as u8;
                    let y = self.lane(node.b, base, lane, gi, gj);
                    let n = self.lane(node.c, base, lane, gi, gj);
                    let v = match c {
                        LOGICAL_TRUE => y,
                        LOGICAL_FALSE => n,
                        _ => na_lanes(node.ty),
                    };
                    self.regs[out_reg as usize][lane] = v;
                }
            }
            op if is_lane_binary(op) => {
                let ty = self.code.nodes[node.a].ty;
                for lane in 0..w {
                    let x = self.lane(node.a, base, lane, gi, gj);
                    let y = self.lane(node.b, base, lane, gi, gj);
                    self.regs[out_reg as usize][lane] = lane_binary(op, ty, x, y);
                }
            }
            op if is_lane_unary(op) => {
                let ty = self.code.nodes[node.a].ty;
                for lane in 0..w {
                    let x = self.lane(node.a, base, lane, gi, gj);
                    self.regs[out_reg as usize][lane] = lane_unary(op, ty, x);
                }
            }
            op if is_fold(op) => {
                // accumulate into the node's scalar slot across tiles
                let ty = node.ty;
                if op == IrOp::CumSum {
                    for lane in 0..w {
                        let x = self.lane(node.a, base, lane, gi, gj);
                        let acc = self.slot_lane(&self.values[k].clone());
                        let next = fold_step(op, ty, acc, x);
                        self.values[k] = lane_to_slot(next, ty);
                        self.regs[out_reg as usize][lane] = next;
                    }
                } else {
                    for lane in 0..w {
                        let x = self.lane(node.a, base, lane, gi, gj);
                        let acc = self.slot_lane(&self.values[k].clone());
                        let next = fold_step(op, ty, acc, x);
                        self.values[k] = lane_to_slot(next, ty);
                    }
                }
            }
            _ => return Control::Bail,
        }
        Control::Next
    }

    /// Operand lane: in-group values come from tile registers,
    /// external values stream from materialized slots or broadcast.
    fn lane(&self, o: IrRef, base: usize, lane: usize, gi: usize, gj: usize) -> u64 {
        if o >= gi && o < gj && self.code.reg[o] != crate::jit::ir::NO_REG
            && !self.code.nodes[o].out.is_scalar()
        {
            return self.regs[self.code.reg[o] as usize][lane];
        }
        match &self.values[o] {
            Slot::Int(x) => *x as u64,
            Slot::Dbl(x) => x.to_bits(),
            Slot::Log(x) => *x as u64,
            Slot::IntVec(v) => v[base + lane] as u64,
            Slot::DblVec(v) => v[base + lane].to_bits(),
            Slot::LogVec(v) => v[base + lane] as u64,
            _ => 0,
        }
    }

    fn slot_lane(&self, s: &Slot) -> u64 {
        match s {
            Slot::Int(x) => *x as u64,
            Slot::Dbl(x) => x.to_bits(),
            Slot::Log(x) => *x as u64,
            _ => 0,
        }
    }

    fn gather_lane(&self, a: IrRef, idx: i64, ty: Ty) -> u64 {
        if int_is_na(idx) || idx < 0 {
            return na_lanes(ty);
        }
        let i = idx as usize;
        match &self.values[a] {
            Slot::IntVec(v) => v.get(i).copied().unwrap_or(INTEGER_NA) as u64,
            Slot::DblVec(v) => v.get(i).copied().unwrap_or(double_na()).to_bits(),
            Slot::LogVec(v) => v.get(i).copied().unwrap_or(LOGICAL_NA) as u64,
            Slot::Int(x) if i == 0 => *x as u64,
            Slot::Dbl(x) if i == 0 => x.to_bits(),
            Slot::Log(x) if i == 0 => *x as u64,
            _ => na_lanes(ty),
        }
    }

    fn alloc_out(&self, k: usize, len: usize) -> Slot {
        match self.code.nodes[k].ty {
            Ty::Double => Slot::DblVec(vec![0.0; len]),
            Ty::Logical => Slot::LogVec(vec![0; len]),
            _ => Slot::IntVec(vec![0; len]),
        }
    }

    fn spill_tile(&mut self, k: usize, base: usize, w: usize) {
        let reg = self.code.reg[k] as usize;
        let lanes = self.regs[reg];
        match &mut self.values[k] {
            Slot::IntVec(v) => {
                for lane in 0..w {
                    v[base + lane] = lanes[lane] as i64;
                }
            }
            Slot::DblVec(v) => {
                for lane in 0..w {
                    v[base + lane] = f64::from_bits(lanes[lane]);
                }
            }
            Slot::LogVec(v) => {
                for lane in 0..w {
                    v[base + lane] = lanes[lane] as u8;
                }
            }
            _ => {}
        }
    }

    /// Concrete length of a shape at run time.
    fn resolve_len(&self, shape: Shape) -> Option<usize> {
        if shape.is_empty() {
            return Some(0);
        }
        self.scalar_int(shape.len_ref).map(|l| l.max(0) as usize)
    }

    fn scalar_int(&self, r: IrRef) -> Option<i64> {
        match &self.values[r] {
            Slot::Int(x) => Some(*x),
            Slot::Dbl(x) if !x.is_nan() => Some(*x as i64),
            Slot::Log(x) if *x != LOGICAL_NA => Some(*x as i64),
            Slot::IntVec(v) => v.first().copied(),
            _ => None,
        }
    }

    /// Whole-node evaluation for scalar and irregular nodes.
    fn run_node(&mut self, thread: &Thread, i: usize) -> Control {
        let node = self.code.nodes[i];
        let v: Slot = match node.op {
            IrOp::Loop | IrOp::Jmp | IrOp::Sstore | IrOp::Store | IrOp::Kill | IrOp::Phi => {
                return Control::Next
            }
            IrOp::Exit => return Control::Exit(i),

            IrOp::Constant => value_to_slot(&self.code.constants[node.a], node.out.is_scalar()),

            IrOp::Curenv => Slot::Env(self.entry_env),

            IrOp::Lenv => {
                let &Slot::Env(e) = &self.values[node.a] else {
                    return Control::Bail;
                };
                match thread.envs.get(e).lexical {
                    Some(p) => Slot::Env(p),
                    None => return Control::Bail,
                }
            }

            IrOp::Sload => {
                let slot = self.entry_base + node.b;
                let Some(v) = thread.regs.get(slot) else {
                    return Control::Bail;
                };
                match self.validate(v.clone(), i) {
                    Some(s) => s,
                    None => return Control::Bail,
                }
            }

            IrOp::Load => {
                let &Slot::Env(e) = &self.values[node.a] else {
                    return Control::Bail;
                };
                let sym = Symbol::from_operand(node.b as i64);
                let v = thread.envs.get(e).get(sym);
                if node.ty == Ty::Nil {
                    // speculation: the name must still be unbound here
                    if v.is_nil() {
                        return Control::Next;
                    }
                    return Control::Bail;
                }
                match self.validate(v, i) {
                    Some(s) => s,
                    None => return Control::Bail,
                }
            }

            IrOp::Slength => {
                let slot = self.entry_base + node.b;
                match thread.regs.get(slot) {
                    Some(v) => Slot::Int(v.len() as i64),
                    None => return Control::Bail,
                }
            }

            IrOp::Elength => {
                let &Slot::Env(e) = &self.values[node.a] else {
                    return Control::Bail;
                };
                let sym = Symbol::from_operand(node.b as i64);
                Slot::Int(thread.envs.get(e).get(sym).len() as i64)
            }

            IrOp::Gtrue | IrOp::Gfalse => {
                let pass = match self.guard_condition(node.a) {
                    Some(c) => {
                        if node.op == IrOp::Gtrue {
                            c
                        } else {
                            !c
                        }
                    }
                    None => false, // NA in a guard: let the interpreter raise
                };
                if pass {
                    return Control::Next;
                }
                return Control::Exit(i);
            }

            IrOp::Length => Slot::Int(self.values[node.a].len() as i64),

            _ => {
                // scalar or unfused vector compute node
                let len = match self.resolve_len(node.out) {
                    Some(l) => l,
                    None => return Control::Bail,
                };
                match self.eval_whole(node, len) {
                    Some(s) => s,
                    None => return Control::Bail,
                }
            }
        };
        self.values[i] = v;
        Control::Next
    }

    fn guard_condition(&self, r: IrRef) -> Option<bool> {
        match &self.values[r] {
            Slot::Log(LOGICAL_TRUE) => Some(true),
            Slot::Log(LOGICAL_FALSE) => Some(false),
            Slot::Log(_) => None,
            Slot::Int(x) if !int_is_na(*x) => Some(*x != 0),
            Slot::Dbl(x) if !x.is_nan() => Some(*x != 0.0),
            Slot::LogVec(v) => Some(v.iter().all(|&x| x == LOGICAL_TRUE)),
            _ => None,
        }
    }

    /// Validate a loaded interpreter value against the node's recorded
    /// type and specialization, and convert it.
    fn validate(&self, v: Value, i: usize) -> Option<Slot> {
        let node = self.code.nodes[i];
        if v.ty() != node.ty {
            return None;
        }
        // specialized lengths (constant trace length) must still hold
        if !node.out.is_empty() && self.code.nodes[node.out.len_ref].op == IrOp::Constant {
            let expect = if node.out.is_scalar() {
                1
            } else {
                node.out.len
            };
            if v.len() != expect {
                return None;
            }
        }
        Some(value_to_slot(&v, node.out.is_scalar()))
    }

    /// Evaluate a node over its whole extent without tiles.
    fn eval_whole(&self, node: crate::jit::ir::Ir, len: usize) -> Option<Slot> {
        let scalar = node.out.is_scalar();
        let read = |r: IrRef, i: usize| -> Option<u64> {
            match &self.values[r] {
                Slot::Int(x) => Some(*x as u64),
                Slot::Dbl(x) => Some(x.to_bits()),
                Slot::Log(x) => Some(*x as u64),
                Slot::IntVec(v) => v.get(i).map(|x| *x as u64),
                Slot::DblVec(v) => v.get(i).map(|x| x.to_bits()),
                Slot::LogVec(v) => v.get(i).map(|x| *x as u64),
                _ => None,
            }
        };
        let n = if scalar { 1 } else { len };
        let mut out: Vec<u64> = Vec::with_capacity(n);
        match node.op {
            IrOp::Seq => {
                let step = self.scalar_int(node.b)?;
                for i in 0..n {
                    out.push((1 + i as i64 * step) as u64);
                }
            }
            IrOp::RepIdx => {
                let m = self.scalar_int(node.a)?;
                if m <= 0 {
                    return None;
                }
                for i in 0..n {
                    out.push((i as i64 % m) as u64);
                }
            }
            IrOp::Gather => {
                for i in 0..n {
                    let idx = read(node.b, i)? as i64;
                    out.push(self.gather_lane(node.a, idx, node.ty));
                }
            }
            IrOp::Scatter => {
                // out = base with out[idx] = value
                let base = &self.values[node.c];
                let out_len = self.resolve_len(node.out)?;
                let mut lanes: Vec<u64> = (0..out_len)
                    .map(|i| {
                        read(node.c, i).unwrap_or_else(|| {
                            if let Slot::Int(x) = base {
                                *x as u64
                            } else {
                                0
                            }
                        })
                    })
                    .collect();
                for i in 0..len {
                    let idx = read(node.b, i)? as i64;
                    if int_is_na(idx) || idx < 0 || idx as usize >= out_len {
                        return None;
                    }
                    lanes[idx as usize] = read(node.a, i)?;
                }
                out = lanes;
            }
            IrOp::IfElse => {
                for i in 0..n {
                    let c = read(node.a, i)? as u8;
                    let v = match c {
                        LOGICAL_TRUE => read(node.b, i)?,
                        LOGICAL_FALSE => read(node.c, i)?,
                        _ => na_lanes(node.ty),
                    };
                    out.push(v);
                }
            }
            op if is_lane_binary(op) => {
                let ty = self.code.nodes[node.a].ty;
                for i in 0..n {
                    out.push(lane_binary(op, ty, read(node.a, i)?, read(node.b, i)?));
                }
            }
            op if is_lane_unary(op) => {
                let ty = self.code.nodes[node.a].ty;
                for i in 0..n {
                    out.push(lane_unary(op, ty, read(node.a, i)?));
                }
            }
            op if is_fold(op) => {
                let in_len = self.resolve_len(node.input)?;
                let ty = node.ty;
                let mut acc = self.slot_lane(&fold_base(op, ty)?);
                if op == IrOp::CumSum {
                    for i in 0..in_len {
                        acc = fold_step(op, ty, acc, read(node.a, i)?);
                        out.push(acc);
                    }
                } else {
                    for i in 0..in_len {
                        acc = fold_step(op, ty, acc, read(node.a, i)?);
                    }
                    return Some(lane_to_slot(acc, ty));
                }
            }
            _ => return None,
        }
        Some(if scalar {
            lane_to_slot(out[0], node.ty)
        } else {
            lanes_to_slot(out, node.ty)
        })
    }

    /// Materialize a node's value back into the interpreter's world.
    pub fn value_of(&self, r: IrRef) -> Value {
        match &self.values[r] {
            Slot::Null | Slot::Empty => Value::Null,
            Slot::Int(x) => Value::integer(*x),
            Slot::Dbl(x) => Value::double(*x),
            Slot::Log(x) => Value::logicals(vec![*x]),
            Slot::Env(e) => Value::Environment(*e),
            Slot::IntVec(v) => Value::integers(v.clone()),
            Slot::DblVec(v) => Value::doubles(v.clone()),
            Slot::LogVec(v) => Value::logicals(v.clone()),
        }
    }

    /// The environment a Variable's env reference resolved to.
    pub fn env_of(&self, r: IrRef) -> Option<EnvId> {
        match &self.values[r] {
            Slot::Env(e) => Some(*e),
            _ => None,
        }
    }
}

fn operand_refs(node: &crate::jit::ir::Ir) -> Vec<IrRef> {
    match node.op {
        IrOp::Constant | IrOp::Sload | IrOp::Slength | IrOp::Curenv | IrOp::Kill | IrOp::Loop
        | IrOp::Jmp | IrOp::Exit => Vec::new(),
        IrOp::Load | IrOp::Elength | IrOp::Lenv => vec![node.a],
        IrOp::Sstore => vec![node.c],
        IrOp::Store => vec![node.a, node.c],
        IrOp::Scatter | IrOp::IfElse => vec![node.a, node.b, node.c],
        IrOp::Gather | IrOp::Seq | IrOp::Phi | IrOp::Add | IrOp::Sub | IrOp::Mul | IrOp::Div
        | IrOp::Mod | IrOp::Pow | IrOp::Eq | IrOp::Neq | IrOp::Lt | IrOp::Le | IrOp::Gt
        | IrOp::Ge | IrOp::And | IrOp::Or => vec![node.a, node.b],
        _ => vec![node.a],
    }
}

fn value_to_slot(v: &Value, scalar: bool) -> Slot {
    match v {
        Value::Null => Slot::Null,
        Value::Integer(x) if scalar && x.len() == 1 => Slot::Int(x[0]),
        Value::Double(x) if scalar && x.len() == 1 => Slot::Dbl(x[0]),
        Value::Logical(x) if scalar && x.len() == 1 => Slot::Log(x[0]),
        Value::Integer(x) => Slot::IntVec(x.as_ref().clone()),
        Value::Double(x) => Slot::DblVec(x.as_ref().clone()),
        Value::Logical(x) => Slot::LogVec(x.as_ref().clone()),
        Value::Environment(e) => Slot::Env(*e),
        _ => Slot::Empty,
    }
}

fn lanes_to_slot(lanes: Vec<u64>, ty: Ty) -> Slot {
    match ty {
        Ty::Double => Slot::DblVec(lanes.into_iter().map(f64::from_bits).collect()),
        Ty::Logical => Slot::LogVec(lanes.into_iter().map(|x| x as u8).collect()),
        _ => Slot::IntVec(lanes.into_iter().map(|x| x as i64).collect()),
    }
}

fn lane_to_slot(lane: u64, ty: Ty) -> Slot {
    match ty {
        Ty::Double => Slot::Dbl(f64::from_bits(lane)),
        Ty::Logical => Slot::Log(lane as u8),
        _ => Slot::Int(lane as i64),
    }
}

fn na_lanes(ty: Ty) -> u64 {
    match ty {
        Ty::Double => double_na().to_bits(),
        Ty::Logical => LOGICAL_NA as u64,
        _ => INTEGER_NA as u64,
    }
}

fn is_lane_binary(op: IrOp) -> bool {
    matches!(
        op,
        IrOp::Add
            | IrOp::Sub
            | IrOp::Mul
            | IrOp::Div
            | IrOp::Mod
            | IrOp::Pow
            | IrOp::Eq
            | IrOp::Neq
            | IrOp::Lt
            | IrOp::Le
            | IrOp::Gt
            | IrOp::Ge
            | IrOp::And
            | IrOp::Or
    )
}

fn is_lane_unary(op: IrOp) -> bool {
    matches!(
        op,
        IrOp::CastDouble
            | IrOp::CastInteger
            | IrOp::CastLogical
            | IrOp::Neg
            | IrOp::Not
            | IrOp::IsNa
            | IrOp::IsFinite
            | IrOp::Sqrt
            | IrOp::Abs
            | IrOp::Floor
            | IrOp::Ceiling
            | IrOp::Exp
            | IrOp::Log
    )
}

fn is_fold(op: IrOp) -> bool {
    matches!(
        op,
        IrOp::Sum | IrOp::Prod | IrOp::Min | IrOp::Max | IrOp::Any | IrOp::All | IrOp::CumSum
    )
}

/// Fold identity elements: sum 0, prod 1, any false, all true.
fn fold_base(op: IrOp, ty: Ty) -> Option<Slot> {
    Some(match (op, ty) {
        (IrOp::Sum, Ty::Integer) | (IrOp::CumSum, Ty::Integer) => Slot::Int(0),
        (IrOp::Sum, Ty::Double) | (IrOp::CumSum, Ty::Double) => Slot::Dbl(0.0),
        (IrOp::Prod, _) => Slot::Dbl(1.0),
        (IrOp::Min, Ty::Integer) => Slot::Int(i64::MAX),
        (IrOp::Max, Ty::Integer) => Slot::Int(i64::MIN + 1),
        (IrOp::Min, Ty::Double) => Slot::Dbl(f64::INFINITY),
        (IrOp::Max, Ty::Double) => Slot::Dbl(f64::NEG_INFINITY),
        (IrOp::Any, _) => Slot::Log(LOGICAL_FALSE),
        (IrOp::All, _) => Slot::Log(LOGICAL_TRUE),
        _ => return None,
    })
}

/// Lane-wise binary kernel; `ty` is the operand element type, the
/// result encoding follows the op. Mirrors the interpreter's scalar
/// kernels exactly so results are bit-identical.
fn lane_binary(op: IrOp, ty: Ty, x: u64, y: u64) -> u64 {
    match ty {
        Ty::Integer => {
            let (a, b) = (x as i64, y as i64);
            match op {
                IrOp::Add => arith::iadd(a, b) as u64,
                IrOp::Sub => arith::isub(a, b) as u64,
                IrOp::Mul => arith::imul(a, b) as u64,
                IrOp::Mod => arith::imod(a, b) as u64,
                IrOp::Div => {
                    let d = if int_is_na(a) || int_is_na(b) {
                        double_na()
                    } else {
                        a as f64 / b as f64
                    };
                    d.to_bits()
                }
                IrOp::Pow => {
                    let d = if int_is_na(a) || int_is_na(b) {
                        double_na()
                    } else {
                        (a as f64).powf(b as f64)
                    };
                    d.to_bits()
                }
                IrOp::Eq | IrOp::Neq | IrOp::Lt | IrOp::Le | IrOp::Gt | IrOp::Ge => {
                    arith::icmp_op(cmp_of(op), a, b) as u64
                }
                IrOp::And => arith::land((a != 0) as u8, (b != 0) as u8) as u64,
                IrOp::Or => arith::lor((a != 0) as u8, (b != 0) as u8) as u64,
                _ => 0,
            }
        }
        Ty::Double => {
            let (a, b) = (f64::from_bits(x), f64::from_bits(y));
            match op {
                IrOp::Add => (a + b).to_bits(),
                IrOp::Sub => (a - b).to_bits(),
                IrOp::Mul => (a * b).to_bits(),
                IrOp::Div => (a / b).to_bits(),
                IrOp::Pow => a.powf(b).to_bits(),
                IrOp::Mod => arith::dmod(a, b).to_bits(),
                IrOp::Eq | IrOp::Neq | IrOp::Lt | IrOp::Le | IrOp::Gt | IrOp::Ge => {
                    arith::dcmp_op(cmp_of(op), a, b) as u64
                }
                _ => 0,
            }
        }
        Ty::Logical => {
            let (a, b) = (x as u8, y as u8);
            match op {
                IrOp::And => arith::land(a, b) as u64,
                IrOp::Or => arith::lor(a, b) as u64,
                _ => 0,
            }
        }
        _ => 0,
    }
}

fn cmp_of(op: IrOp) -> velo_core::bc::ByteCode {
    use velo_core::bc::ByteCode as B;
    match op {
        IrOp::Eq => B::Eq,
        IrOp::Neq => B::Neq,
        IrOp::Lt => B::Lt,
        IrOp::Le => B::Le,
        IrOp::Gt => B::Gt,
        _ => B::Ge,
    }
}

/// Lane-wise unary kernel; `ty` is the operand element type.
fn lane_unary(op: IrOp, ty: Ty, x: u64) -> u64 {
    match op {
        IrOp::CastDouble => match ty {
            Ty::Integer => {
                let v = x as i64;
                if int_is_na(v) { double_na() } else { v as f64 }.to_bits()
            }
            Ty::Logical => {
                let v = x as u8;
                if v == LOGICAL_NA {
                    double_na()
                } else {
                    v as f64
                }
                .to_bits()
            }
            _ => x,
        },
        IrOp::CastInteger => match ty {
            Ty::Double => {
                let v = f64::from_bits(x);
                (if v.is_nan() { INTEGER_NA } else { v as i64 }) as u64
            }
            Ty::Logical => {
                let v = x as u8;
                (if v == LOGICAL_NA { INTEGER_NA } else { v as i64 }) as u64
            }
            _ => x,
        },
        IrOp::CastLogical => match ty {
            Ty::Integer => {
                let v = x as i64;
                (if int_is_na(v) {
                    LOGICAL_NA
                } else if v != 0 {
                    LOGICAL_TRUE
                } else {
                    LOGICAL_FALSE
                }) as u64
            }
            Ty::Double => {
                let v = f64::from_bits(x);
                (if v.is_nan() {
                    LOGICAL_NA
                } else if v != 0.0 {
                    LOGICAL_TRUE
                } else {
                    LOGICAL_FALSE
                }) as u64
            }
            _ => x,
        },
        IrOp::Neg => match ty {
            Ty::Integer => {
                let v = x as i64;
                (if int_is_na(v) { v } else { v.wrapping_neg() }) as u64
            }
            _ => (-f64::from_bits(x)).to_bits(),
        },
        IrOp::Not => {
            let v = x as u8;
            (match v {
                LOGICAL_TRUE => LOGICAL_FALSE,
                LOGICAL_FALSE => LOGICAL_TRUE,
                _ => LOGICAL_NA,
            }) as u64
        }
        IrOp::IsNa => {
            let na = match ty {
                Ty::Integer => int_is_na(x as i64),
                Ty::Double => f64::from_bits(x).is_nan(),
                _ => x as u8 == LOGICAL_NA,
            };
            (if na { LOGICAL_TRUE } else { LOGICAL_FALSE }) as u64
        }
        IrOp::IsFinite => {
            let v = f64::from_bits(x);
            (if v.is_finite() { LOGICAL_TRUE } else { LOGICAL_FALSE }) as u64
        }
        IrOp::Abs => match ty {
            Ty::Integer => {
                let v = x as i64;
                (if int_is_na(v) { v } else { v.wrapping_abs() }) as u64
            }
            _ => f64::from_bits(x).abs().to_bits(),
        },
        IrOp::Sqrt => f64::from_bits(x).sqrt().to_bits(),
        IrOp::Exp => f64::from_bits(x).exp().to_bits(),
        IrOp::Log => f64::from_bits(x).ln().to_bits(),
        IrOp::Floor => f64::from_bits(x).floor().to_bits(),
        IrOp::Ceiling => f64::from_bits(x).ceil().to_bits(),
        _ => x,
    }
}

/// One fold step; `ty` is the accumulator type.
fn fold_step(op: IrOp, ty: Ty, acc: u64, x: u64) -> u64 {
    match (op, ty) {
        (IrOp::Sum, Ty::Integer) | (IrOp::CumSum, Ty::Integer) => {
            arith::iadd(acc as i64, x as i64) as u64
        }
        (IrOp::Sum, Ty::Double) | (IrOp::CumSum, Ty::Double) => {
            (f64::from_bits(acc) + f64::from_bits(x)).to_bits()
        }
        (IrOp::Prod, _) => (f64::from_bits(acc) * f64::from_bits(x)).to_bits(),
        (IrOp::Min, Ty::Integer) | (IrOp::Max, Ty::Integer) => {
            let (a, v) = (acc as i64, x as i64);
            (if int_is_na(v) || int_is_na(a) {
                INTEGER_NA
            } else if (op == IrOp::Min) == (v < a) {
                v
            } else {
                a
            }) as u64
        }
        (IrOp::Min, Ty::Double) | (IrOp::Max, Ty::Double) => {
            let (a, v) = (f64::from_bits(acc), f64::from_bits(x));
            (if v.is_nan() || a.is_nan() {
                double_na()
            } else if (op == IrOp::Min) == (v < a) {
                v
            } else {
                a
            })
            .to_bits()
        }
        (IrOp::Any, _) => arith::lor(acc as u8, x as u8) as u64,
        (IrOp::All, _) => arith::land(acc as u8, x as u8) as u64,
        _ => acc,
    }
}
