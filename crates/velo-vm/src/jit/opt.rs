//! Trace optimizer: replay with CSE, load/store forwarding, dead-store
//! elimination, store sinking, and phi insertion.
//!
//! The raw trace is replayed twice into a fresh buffer: the first pass
//! becomes the loop header (iteration one), the second the peeled loop
//! body. Values that differ between the passes are loop-carried and
//! get a phi. Stores never reach the fast path at all; the latest
//! store per Variable is tracked in a map, every guard snapshots the
//! live subset into its exit record, and the executor materializes
//! them only when an exit is actually taken.

use crate::jit::ir::{Exit, Ir, IrOp, IrRef, Reenter, Shape, TraceCode, Variable, NO_REG};
use crate::jit::record::Recorder;
use std::collections::{BTreeMap, HashMap};

/// Optimize a loop trace (header + body + phis + jmp).
pub fn replay_loop(rec: &Recorder) -> TraceCode {
    let mut r = Replay::new(rec);
    r.emit_constants();
    for i in 0..rec.nodes.len() {
        r.replay_node(i);
    }
    let loop_start = r.push(Ir::new(
        IrOp::Loop,
        0,
        0,
        0,
        velo_core::value::Ty::Nil,
        Shape::EMPTY,
        Shape::EMPTY,
    ));
    let header_state = r.stores.clone();
    r.loads.clear();
    for i in 0..rec.nodes.len() {
        r.replay_node(i);
    }
    // loop-carried values get phis at the loop's bottom
    for (var, &body_ref) in r.stores.clone().iter() {
        if let Some(&header_ref) = header_state.get(var) {
            if header_ref != body_ref {
                let ty = r.out[header_ref].ty;
                let shape = r.out[header_ref].out;
                r.push(Ir::new(IrOp::Phi, header_ref, body_ref, 0, ty, shape, shape));
            }
        }
    }
    r.push(Ir::new(
        IrOp::Jmp,
        0,
        0,
        0,
        velo_core::value::Ty::Nil,
        Shape::EMPTY,
        Shape::EMPTY,
    ));
    r.finish(Some(loop_start))
}

/// Optimize a side trace: one pass, ending in an `exit` that reenters
/// the root trace's header PC.
pub fn replay_side(rec: &Recorder, root_start_pc: usize) -> TraceCode {
    let mut r = Replay::new(rec);
    r.emit_constants();
    for i in 0..rec.nodes.len() {
        r.replay_node(i);
    }
    let pos = r.push(Ir::new(
        IrOp::Exit,
        0,
        0,
        0,
        velo_core::value::Ty::Nil,
        Shape::EMPTY,
        Shape::EMPTY,
    ));
    let exit = r.build_exit(Reenter {
        pc: root_start_pc,
        in_scope: true,
    });
    r.exits.insert(pos, exit);
    r.finish(None)
}

struct Replay<'a> {
    rec: &'a Recorder,
    out: Vec<Ir>,
    forward: Vec<IrRef>,
    loads: HashMap<Variable, IrRef>,
    stores: BTreeMap<Variable, IrRef>,
    cse: HashMap<Ir, IrRef>,
    environments: Vec<IrRef>,
    exits: BTreeMap<IrRef, Exit>,
}

impl<'a> Replay<'a> {
    fn new(rec: &'a Recorder) -> Self {
        Replay {
            rec,
            out: Vec::with_capacity(rec.nodes.len() * 2),
            forward: vec![0; rec.nodes.len()],
            loads: HashMap::new(),
            stores: BTreeMap::new(),
            cse: HashMap::new(),
            environments: Vec::new(),
            exits: BTreeMap::new(),
        }
    }

    fn push(&mut self, ir: Ir) -> IrRef {
        self.out.push(ir);
        self.out.len() - 1
    }

    fn cse_insert(&mut self, ir: Ir) -> IrRef {
        if let Some(&r) = self.cse.get(&ir) {
            return r;
        }
        let r = self.push(ir);
        self.cse.insert(ir, r);
        r
    }

    /// Constants are hoisted to the prefix so they participate in CSE
    /// everywhere.
    fn emit_constants(&mut self) {
        for i in 0..self.rec.nodes.len() {
            if self.rec.nodes[i].op == IrOp::Constant {
                self.replay_node(i);
            }
        }
    }

    fn fwd(&self, r: IrRef) -> IrRef {
        self.forward[r]
    }

    fn fwd_shape(&self, s: Shape) -> Shape {
        if s.is_empty() {
            s
        } else {
            Shape {
                len_ref: self.forward[s.len_ref],
                len: s.len,
            }
        }
    }

    fn reenter_of(&self, raw: IrRef) -> Reenter {
        *self
            .rec
            .reenters
            .get(&raw)
            .expect("guard without a reenter record")
    }

    /// Snapshot the current live-variable state into an exit record.
    fn build_exit(&self, reenter: Reenter) -> Exit {
        let stores: Vec<(Variable, IrRef)> = self
            .stores
            .iter()
            .filter(|(var, _)| {
                var.is_register() || {
                    let e = var.env as usize;
                    matches!(self.out[e].op, IrOp::Curenv | IrOp::Lenv)
                        || self.environments.contains(&e)
                }
            })
            .map(|(v, r)| (*v, *r))
            .collect();
        Exit {
            environments: self.environments.clone(),
            frames: Vec::new(),
            stores,
            reenter,
            index: self.exits.len(),
        }
    }

    fn replay_node(&mut self, i: IrRef) {
        let node = self.rec.nodes[i];
        let input = self.fwd_shape(node.input);
        let out = self.fwd_shape(node.out);
        let r = match node.op {
            IrOp::Constant => self.cse_insert(Ir { input, out, ..node }),

            IrOp::Sload => {
                let var = Variable::register(-(node.b as i64));
                if let Some(&v) = self.stores.get(&var) {
                    v
                } else if let Some(&v) = self.loads.get(&var) {
                    v
                } else {
                    let r = self.cse_insert(Ir { input, out, ..node });
                    self.loads.insert(var, r);
                    r
                }
            }

            IrOp::Load => {
                let env = self.fwd(node.a);
                if node.ty == velo_core::value::Ty::Nil {
                    // unbound-name speculation: entry assertion
                    self.cse_insert(Ir {
                        a: env,
                        input,
                        out,
                        ..node
                    })
                } else {
                    let var = Variable::named(env, node.b as i64);
                    if let Some(&v) = self.stores.get(&var) {
                        v
                    } else if let Some(&v) = self.loads.get(&var) {
                        v
                    } else {
                        let r = self.cse_insert(Ir {
                            a: env,
                            input,
                            out,
                            ..node
                        });
                        self.loads.insert(var, r);
                        r
                    }
                }
            }

            IrOp::Sstore => {
                let var = Variable::register(-(node.b as i64));
                let value = self.fwd(node.c);
                // a later store to the same slot kills this one; sunk
                // stores only materialize on exits
                self.stores.insert(var, value);
                self.forward[i] = value;
                return;
            }

            IrOp::Store => {
                let env = self.fwd(node.a);
                let var = Variable::named(env, node.b as i64);
                let value = self.fwd(node.c);
                self.stores.insert(var, value);
                self.forward[i] = value;
                return;
            }

            IrOp::Kill => {
                let var = Variable::register(-(node.b as i64));
                self.stores.remove(&var);
                self.forward[i] = 0;
                return;
            }

            IrOp::Curenv => {
                let r = self.cse_insert(Ir { input, out, ..node });
                if !self.environments.contains(&r) {
                    self.environments.push(r);
                }
                r
            }

            IrOp::Lenv => {
                let a = self.fwd(node.a);
                let r = self.cse_insert(Ir {
                    a,
                    input,
                    out,
                    ..node
                });
                if !self.environments.contains(&r) {
                    self.environments.push(r);
                }
                r
            }

            IrOp::Slength => self.cse_insert(Ir { input, out, ..node }),

            IrOp::Elength => {
                let a = self.fwd(node.a);
                self.cse_insert(Ir {
                    a,
                    input,
                    out,
                    ..node
                })
            }

            IrOp::Gtrue | IrOp::Gfalse => {
                let a = self.fwd(node.a);
                let key = Ir {
                    a,
                    input,
                    out,
                    ..node
                };
                if let Some(&existing) = self.cse.get(&key) {
                    // the same predicate is already guarded; the first
                    // occurrence's exit record stands
                    existing
                } else {
                    let pos = self.push(key);
                    self.cse.insert(key, pos);
                    let exit = self.build_exit(self.reenter_of(i));
                    self.exits.insert(pos, exit);
                    pos
                }
            }

            IrOp::Scatter | IrOp::IfElse => {
                let (a, b, c) = (self.fwd(node.a), self.fwd(node.b), self.fwd(node.c));
                self.cse_insert(Ir {
                    a,
                    b,
                    c,
                    input,
                    out,
                    ..node
                })
            }

            IrOp::Gather | IrOp::Seq | IrOp::Add | IrOp::Sub | IrOp::Mul | IrOp::Div
            | IrOp::Mod | IrOp::Pow | IrOp::Eq | IrOp::Neq | IrOp::Lt | IrOp::Le | IrOp::Gt
            | IrOp::Ge | IrOp::And | IrOp::Or => {
                let (a, b) = (self.fwd(node.a), self.fwd(node.b));
                self.cse_insert(Ir {
                    a,
                    b,
                    input,
                    out,
                    ..node
                })
            }

            // remaining ops take a single reference operand
            _ => {
                let a = self.fwd(node.a);
                self.cse_insert(Ir {
                    a,
                    input,
                    out,
                    ..node
                })
            }
        };
        self.forward[i] = r;
    }

    /// Liveness sweep and assembly of the final TraceCode.
    fn finish(self, loop_start: Option<IrRef>) -> TraceCode {
        let n = self.out.len();
        let mut live = vec![false; n];
        let mut work: Vec<IrRef> = Vec::new();

        for (i, node) in self.out.iter().enumerate() {
            let root = matches!(
                node.op,
                IrOp::Gtrue | IrOp::Gfalse | IrOp::Loop | IrOp::Jmp | IrOp::Exit | IrOp::Phi
            ) || (node.op == IrOp::Load && node.ty == velo_core::value::Ty::Nil);
            if root {
                work.push(i);
            }
        }
        for exit in self.exits.values() {
            for (var, r) in &exit.stores {
                work.push(*r);
                if !var.is_register() {
                    work.push(var.env as usize);
                }
            }
            for e in &exit.environments {
                work.push(*e);
            }
        }

        while let Some(i) = work.pop() {
            if live[i] {
                continue;
            }
            live[i] = true;
            let node = self.out[i];
            let mut refs: Vec<IrRef> = Vec::new();
            match node.op {
                IrOp::Constant | IrOp::Sload | IrOp::Slength | IrOp::Curenv | IrOp::Kill
                | IrOp::Loop | IrOp::Jmp | IrOp::Exit => {}
                IrOp::Load | IrOp::Elength | IrOp::Lenv => refs.push(node.a),
                IrOp::Sstore => refs.push(node.c),
                IrOp::Store => {
                    refs.push(node.a);
                    refs.push(node.c);
                }
                IrOp::Scatter | IrOp::IfElse => {
                    refs.push(node.a);
                    refs.push(node.b);
                    refs.push(node.c);
                }
                IrOp::Gather | IrOp::Seq | IrOp::Phi | IrOp::Add | IrOp::Sub | IrOp::Mul
                | IrOp::Div | IrOp::Mod | IrOp::Pow | IrOp::Eq | IrOp::Neq | IrOp::Lt
                | IrOp::Le | IrOp::Gt | IrOp::Ge | IrOp::And | IrOp::Or => {
                    refs.push(node.a);
                    refs.push(node.b);
                }
                _ => refs.push(node.a),
            }
            if !node.input.is_empty() {
                refs.push(node.input.len_ref);
            }
            if !node.out.is_empty() {
                refs.push(node.out.len_ref);
            }
            work.extend(refs);
        }

        TraceCode {
            constants: self.rec.constants.clone(),
            exits: self.exits,
            live,
            fusable: vec![true; n],
            reg: vec![NO_REG; n],
            loop_start,
            nodes: self.out,
        }
    }
}

/// Invariant checker: the optimizer is a fixed point — re-running CSE,
/// forwarding, and DSE over already-optimized code changes nothing.
pub fn check(code: &TraceCode) -> Result<(), String> {
    let mut seen: HashMap<Ir, IrRef> = HashMap::new();
    for (i, node) in code.nodes.iter().enumerate() {
        if !code.live[i] {
            continue;
        }
        if matches!(node.op, IrOp::Loop | IrOp::Jmp | IrOp::Exit | IrOp::Phi) {
            continue;
        }
        if let Some(prev) = seen.get(node) {
            return Err(format!("CSE-equal nodes {} and {}", prev, i));
        }
        seen.insert(*node, i);
    }
    for (pos, exit) in &code.exits {
        if !code.live[*pos] {
            return Err(format!("exit attached to dead node {}", pos));
        }
        for (var, r) in &exit.stores {
            if *r >= code.nodes.len() {
                return Err(format!("exit store ref {} out of range", r));
            }
            if !code.live[*r] {
                return Err(format!("exit store ref {} is dead", r));
            }
            if !var.is_register() && !code.live[var.env as usize] {
                return Err(format!("exit store env {} is dead", var.env));
            }
        }
    }
    Ok(())
}
