//! Tracing JIT driver: triggers, the recording state machine, the
//! trace cache, and the guard-failure path back into the interpreter.

pub mod asm;
pub mod ir;
pub mod mcode;
pub mod opt;
pub mod record;
pub mod regalloc;
pub mod schedule;
pub mod tile;

use crate::thread::{Backend, Thread, VmResult};
use ir::TraceCode;
use record::Recorder;
use std::collections::HashMap;
use std::sync::Arc;
use tile::{Outcome, TileExec};
use tracing::{debug, trace};
use velo_core::interner::Symbol;
use velo_core::prototype::Prototype;
use velo_core::value::{Ty, Value};

pub type TraceId = usize;

/// Chained trace executions per interpreter hand-off; bounds side
/// trace / root trace ping-ponging.
const MAX_CHAIN: usize = 64;

/// A compiled trace. Immutable once built; per-exit counters and side
/// trace attachments live in the Jit tables.
pub struct CompiledTrace {
    pub code: TraceCode,
    pub start_pc: usize,
    pub proto: Arc<Prototype>,
    pub root: Option<TraceId>,
    pub mcode: Option<mcode::McodeTrace>,
}

enum State {
    Off,
    Recording(Box<Recorder>),
}

impl Default for State {
    fn default() -> Self {
        State::Off
    }
}

/// JIT state owned by the Thread.
#[derive(Default)]
pub struct Jit {
    state: State,
    pub traces: Vec<Arc<CompiledTrace>>,
    /// (prototype identity, pc) → trace.
    cache: HashMap<(usize, usize), TraceId>,
    /// Back-edge heat per (prototype identity, target pc).
    heat: HashMap<(usize, usize), u32>,
    /// Hit counters per (trace, exit index).
    exit_counters: HashMap<(TraceId, usize), u32>,
    /// Side traces attached to (trace, exit index).
    sides: HashMap<(TraceId, usize), TraceId>,
}

/// What the interpreter should do after a recording step.
pub enum RecordAction {
    Continue,
    /// A trace was entered (freshly compiled or cached); resume here.
    EnterTrace(usize),
    Aborted,
}

impl Jit {
    pub fn is_recording(&self) -> bool {
        matches!(self.state, State::Recording(_))
    }

    pub fn trace_at(&self, proto: &Arc<Prototype>, pc: usize) -> Option<TraceId> {
        self.cache.get(&(proto_key(proto), pc)).copied()
    }

    /// Number of compiled traces (tests and dumps).
    pub fn trace_count(&self) -> usize {
        self.traces.len()
    }

    pub fn exit_counter(&self, tid: TraceId, exit: usize) -> u32 {
        self.exit_counters.get(&(tid, exit)).copied().unwrap_or(0)
    }
}

fn proto_key(proto: &Arc<Prototype>) -> usize {
    Arc::as_ptr(proto) as usize
}

fn recordable(v: &Value) -> bool {
    matches!(v.ty(), Ty::Logical | Ty::Integer | Ty::Double)
}

/// Arithmetic trigger: consult the cache, or start recording when all
/// operands are recordable and at least one is long enough. Idempotent
/// while recording.
pub fn trigger_arith(
    thread: &mut Thread,
    pc: usize,
    operands: &[&Value],
) -> VmResult<Option<usize>> {
    if !thread.config.jit_enabled || thread.jit.is_recording() {
        return Ok(None);
    }
    if !operands.iter().all(|v| recordable(v)) {
        return Ok(None);
    }
    if !operands
        .iter()
        .any(|v| v.len() >= thread.config.trigger_len)
    {
        return Ok(None);
    }
    enter_or_record(thread, pc)
}

/// `seq` trigger: keyed on the produced length.
pub fn trigger_seq(thread: &mut Thread, pc: usize, len: usize) -> VmResult<Option<usize>> {
    if !thread.config.jit_enabled || thread.jit.is_recording() {
        return Ok(None);
    }
    if len < thread.config.trigger_len {
        return Ok(None);
    }
    enter_or_record(thread, pc)
}

/// Back-edge profiling in `forend`: hot loop targets start recording
/// even for scalar loop bodies.
pub fn trigger_backedge(thread: &mut Thread, target: usize) -> VmResult<Option<usize>> {
    if !thread.config.jit_enabled || thread.jit.is_recording() {
        return Ok(None);
    }
    let proto = thread.frame().proto.clone();
    if let Some(tid) = thread.jit.trace_at(&proto, target) {
        let resume = run_trace(thread, tid)?;
        // a bailed trace resumes where it started: interpret normally
        // rather than re-entering it forever
        return Ok(if resume == target { None } else { Some(resume) });
    }
    let key = (proto_key(&proto), target);
    let heat = thread.jit.heat.entry(key).or_insert(0);
    *heat += 1;
    if *heat < thread.config.hot_loop {
        return Ok(None);
    }
    thread.jit.heat.remove(&key);
    debug!(target_pc = target, "hot loop edge, recording");
    thread.jit.state = State::Recording(Box::new(Recorder::new(target, target, proto, None)));
    Ok(None)
}

fn enter_or_record(thread: &mut Thread, pc: usize) -> VmResult<Option<usize>> {
    let proto = thread.frame().proto.clone();
    if let Some(tid) = thread.jit.trace_at(&proto, pc) {
        let resume = run_trace(thread, tid)?;
        // a bailed trace resumes where it started: interpret normally
        // rather than re-entering it forever
        return Ok(if resume == pc { None } else { Some(resume) });
    }
    debug!(pc, "long-vector trigger, recording");
    thread.jit.state = State::Recording(Box::new(Recorder::new(pc, pc, proto, None)));
    // re-enter the dispatch loop so this instruction is recorded
    Ok(Some(pc))
}

/// One recording step, called by the interpreter before executing the
/// instruction at `pc`.
pub fn record_step(thread: &mut Thread, pc: usize) -> VmResult<RecordAction> {
    let State::Recording(mut rec) = std::mem::take(&mut thread.jit.state) else {
        return Ok(RecordAction::Continue);
    };

    // node 0 is the pre-seeded constant 1, so "something was recorded"
    // means more than one node
    let same_proto = Arc::ptr_eq(&rec.proto, &thread.frame().proto);
    if same_proto && pc == rec.finish_pc && rec.nodes.len() > 1 {
        let is_side = rec.root.is_some();
        let proto = rec.proto.clone();
        let tid = end_recording(thread, *rec);
        if is_side {
            // a side trace closes at the root's header: it must only
            // ever be entered through the root's exit, so run the root
            // (cached at this PC) instead
            if let Some(root_tid) = thread.jit.trace_at(&proto, pc) {
                return run_trace(thread, root_tid).map(RecordAction::EnterTrace);
            }
            return Ok(RecordAction::Aborted);
        }
        return run_trace(thread, tid).map(RecordAction::EnterTrace);
    }

    let inst = thread.frame().proto.code.get(pc).copied();
    let Some(inst) = inst else {
        trace!("recording ran off the prototype, aborting");
        return Ok(RecordAction::Aborted);
    };
    match rec.record(thread, pc, &inst) {
        Ok(()) => {
            thread.jit.state = State::Recording(rec);
            Ok(RecordAction::Continue)
        }
        Err(reason) => {
            debug!(op = inst.op.name(), reason, "trace aborted");
            Ok(RecordAction::Aborted)
        }
    }
}

/// Optimize, schedule, register-assign, and cache a finished trace.
fn end_recording(thread: &mut Thread, rec: Recorder) -> TraceId {
    let root = rec.root;
    let mut code = match root {
        Some((side_of, _)) => {
            let root_id = root_of(thread, side_of);
            let root_start = thread.jit.traces[root_id].start_pc;
            opt::replay_side(&rec, root_start)
        }
        None => opt::replay_loop(&rec),
    };
    schedule::mark(&mut code);
    regalloc::assign(&mut code);

    let mcode = if thread.config.backend == Backend::Machine {
        mcode::try_compile(&code)
    } else {
        None
    };

    if thread.config.verbose {
        println!("compiled trace @ {}:\n{}", rec.start_pc, code);
    }
    debug!(
        start_pc = rec.start_pc,
        nodes = code.nodes.len(),
        exits = code.exits.len(),
        machine = mcode.is_some(),
        "trace compiled"
    );

    let tid = thread.jit.traces.len();
    let key = (proto_key(&rec.proto), rec.start_pc);
    thread.jit.traces.push(Arc::new(CompiledTrace {
        code,
        start_pc: rec.start_pc,
        proto: rec.proto.clone(),
        root: root.map(|(r, _)| r),
        mcode,
    }));
    thread.jit.cache.insert(key, tid);
    if let Some((root_trace, exit_idx)) = root {
        thread.jit.sides.insert((root_trace, exit_idx), tid);
    }
    tid
}

/// Execute a trace (and any chained side traces); returns the PC the
/// interpreter resumes at.
pub fn run_trace(thread: &mut Thread, tid: TraceId) -> VmResult<usize> {
    let mut current = tid;
    // where the interpreter resumes if the chain limit is hit: the
    // last applied exit's reenter PC
    let mut resume = thread.jit.traces[tid].start_pc;
    for _ in 0..MAX_CHAIN {
        let trace = thread.jit.traces[current].clone();

        let exit_pos = if let Some(mc) = &trace.mcode {
            match mcode::run(mc, &trace, thread) {
                Outcome::Bail => {
                    trace!(trace = current, "machine trace bailed");
                    return Ok(trace.start_pc);
                }
                Outcome::Exit(pos) => pos,
            }
        } else {
            let mut exec = TileExec::new(&trace.code, thread);
            match exec.run(thread) {
                Outcome::Bail => {
                    trace!(trace = current, "trace bailed to the interpreter");
                    return Ok(trace.start_pc);
                }
                Outcome::Exit(pos) => {
                    apply_exit(thread, &trace, &exec, pos);
                    pos
                }
            }
        };

        let exit = &trace.code.exits[&exit_pos];
        let reenter = exit.reenter;
        resume = reenter.pc;
        let counter = thread
            .jit
            .exit_counters
            .entry((current, exit.index))
            .or_insert(0);
        *counter += 1;
        let hot = *counter == thread.config.hot_exit;

        if let Some(&side) = thread.jit.sides.get(&(current, exit.index)) {
            current = side;
            continue;
        }
        if hot && thread.config.jit_enabled && !thread.jit.is_recording() {
            debug!(
                trace = current,
                exit = exit.index,
                "hot side exit, recording side trace"
            );
            thread.jit.state = State::Recording(Box::new(Recorder::new(
                reenter.pc,
                thread.jit.traces[root_of(thread, current)].start_pc,
                trace.proto.clone(),
                Some((current, exit.index)),
            )));
            return Ok(reenter.pc);
        }
        // a cached trace at the reenter PC continues the chain
        if let Some(next) = thread.jit.trace_at(&trace.proto, reenter.pc) {
            current = next;
            continue;
        }
        return Ok(reenter.pc);
    }
    Ok(resume)
}

fn root_of(thread: &Thread, tid: TraceId) -> TraceId {
    match thread.jit.traces[tid].root {
        Some(r) => r,
        None => tid,
    }
}

/// Write the exit's live stores back into interpreter state and
/// restore any frames pushed during the trace.
fn apply_exit(thread: &mut Thread, trace: &CompiledTrace, exec: &TileExec, pos: usize) {
    let exit = &trace.code.exits[&pos];
    for (var, r) in &exit.stores {
        let value = exec.value_of(*r);
        if var.is_register() {
            let slot = thread.base + (-var.slot) as usize;
            if thread.regs.len() <= slot {
                thread.regs.resize(slot + 1, Value::Nil);
            }
            thread.regs[slot] = value;
        } else {
            let Some(env) = exec.env_of(var.env as usize) else {
                continue;
            };
            let sym = Symbol::from_operand(var.slot);
            thread.envs.get_mut(env).insert(sym, value);
        }
    }
    for frame in &exit.frames {
        let Some(env) = exec.env_of(frame.env) else {
            continue;
        };
        thread.push_frame(
            frame.proto.clone(),
            env,
            frame.own_env,
            frame.dest,
            env,
            frame.return_pc,
        );
    }
}
