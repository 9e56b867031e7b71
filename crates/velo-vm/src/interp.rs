//! The bytecode interpreter.
//!
//! One tight loop, one match arm per opcode; every arm computes the
//! next PC. Operand fetches that hit a promise push a stack frame for
//! the thunk with `return_pc` set to the current instruction, so the
//! instruction re-executes once the forced value has replaced the
//! binding (on-stack re-execution). The JIT trigger sits inside the
//! arithmetic and `seq` handlers and on the `forend` back edge.

use crate::arith;
use crate::jit::{self, RecordAction};
use crate::subset;
use crate::thread::{Thread, VmError, VmResult};
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::trace;
use velo_core::bc::ByteCode;
use velo_core::env::EnvId;
use velo_core::interner::Symbol;
use velo_core::prototype::{Arg, CompiledCall, Prototype};
use velo_core::value::{Function, Promise, Value, LOGICAL_FALSE, LOGICAL_NA, LOGICAL_TRUE};

/// Result of a non-forcing operand fetch.
enum Fetch {
    Val(Value),
    Force {
        promise: Promise,
        /// Environment holding the binding the forced value replaces.
        home: EnvId,
        /// The binding's name.
        name: Symbol,
    },
}

/// Fetch an operand; promises are not entered here, the caller decides.
fn fetch(thread: &Thread, op: i64) -> VmResult<Fetch> {
    if op <= 0 {
        return Ok(Fetch::Val(thread.reg(op).clone()));
    }
    let sym = Symbol::from_operand(op);
    let (v, home) = thread.lookup(sym);
    match v {
        Value::Nil => Err(VmError::NotFound(thread.name_of(sym).to_string())),
        Value::Promise(p) | Value::Default(p) => Ok(Fetch::Force {
            promise: p,
            home: home.expect("promise binding without a home"),
            name: sym,
        }),
        v => Ok(Fetch::Val(v)),
    }
}

/// Fetch without forcing or missing checks (`fastmov`, `jc`).
fn fetch_raw(thread: &Thread, op: i64) -> Value {
    if op <= 0 {
        thread.reg(op).clone()
    } else {
        thread.lookup(Symbol::from_operand(op)).0
    }
}

/// Run the interpreter until the frame at `floor` returns.
pub fn interpret(thread: &mut Thread, floor: usize) -> VmResult<Value> {
    let mut pc: usize = 0;

    macro_rules! op_fetch {
        ($op:expr) => {
            match fetch(thread, $op)? {
                Fetch::Val(v) => v,
                Fetch::Force {
                    promise,
                    home,
                    name,
                } => {
                    let proto = promise.proto.clone();
                    thread.push_frame(proto, promise.env, false, name.operand(), home, pc);
                    pc = 0;
                    continue;
                }
            }
        };
    }

    loop {
        if thread.jit.is_recording() {
            match jit::record_step(thread, pc)? {
                RecordAction::Continue => {}
                RecordAction::EnterTrace(resume) => {
                    pc = resume;
                    continue;
                }
                RecordAction::Aborted => {}
            }
        }

        let inst = thread.frame().proto.code[pc];
        match inst.op {
            // === Control ===
            ByteCode::Done => {
                return Ok(thread.regs[thread.base].clone());
            }

            ByteCode::Ret => {
                let result = op_fetch!(inst.a);
                let frame = thread.frames.pop().expect("ret without a frame");
                if frame.own_env && result.is_closure_safe() {
                    thread.envs.recycle(frame.env);
                }
                thread.base = frame.return_base;
                if thread.frames.len() == floor {
                    return Ok(result);
                }
                if frame.dest <= 0 {
                    *thread.reg_mut(frame.dest) = result;
                } else {
                    let sym = Symbol::from_operand(frame.dest);
                    thread.envs.get_mut(frame.dest_env).insert(sym, result);
                }
                pc = frame.return_pc;
            }

            ByteCode::Call => {
                let f = op_fetch!(inst.a);
                let Value::Function(func) = f.strip().clone() else {
                    return Err(VmError::Type(format!(
                        "non-function ({}) as first parameter to call",
                        f.ty().name()
                    )));
                };
                debug_assert!(inst.b < 0);
                let call_idx = (-(inst.b + 1)) as usize;
                let caller_env = thread.frame().env;
                let caller_proto = thread.frame().proto.clone();
                let call = caller_proto.calls[call_idx].clone();
                let fenv = thread
                    .envs
                    .alloc(Some(func.env), Some(caller_env), call.call.clone());
                match_args(thread, caller_env, &caller_proto, fenv, &func, &call)?;
                thread.push_frame(func.proto.clone(), fenv, true, inst.c, caller_env, pc + 1);
                pc = 0;
            }

            ByteCode::NCall => {
                let f = op_fetch!(inst.a);
                let Value::Function(func) = f.strip().clone() else {
                    return Err(VmError::Type(format!(
                        "non-function ({}) in do-call",
                        f.ty().name()
                    )));
                };
                let argv = op_fetch!(inst.b);
                let names: Vec<Symbol> = match argv.get_attr(Symbol::NAMES) {
                    Some(Value::Character(n)) => n.as_ref().clone(),
                    _ => vec![Symbol::EMPTY; argv.len()],
                };
                let Value::List(items) = argv.strip().clone() else {
                    return Err(VmError::Type("do-call arguments must be a list".to_string()));
                };
                let caller_env = thread.frame().env;
                let fenv = thread
                    .envs
                    .alloc(Some(func.env), Some(caller_env), Value::Null);
                let vals: ArgBuffer = names.into_iter().zip(items.iter().cloned()).collect();
                bind_args(thread, fenv, &func, vals)?;
                thread.push_frame(func.proto.clone(), fenv, true, inst.c, caller_env, pc + 1);
                pc = 0;
            }

            ByteCode::UseMethod => {
                let generic = Symbol::from_operand(inst.a);
                let obj = op_fetch!(inst.c);
                let caller_env = thread.frame().env;
                let caller_proto = thread.frame().proto.clone();
                let call = caller_proto.calls[inst.b as usize].clone();

                let mut classes: Vec<Symbol> = match obj.class_attr() {
                    Some(Value::Character(v)) => v.as_ref().clone(),
                    _ => vec![thread.interner.intern(obj.strip().ty().name())],
                };
                classes.push(Symbol::DEFAULT);

                let mut found: Option<(Function, Symbol, Symbol)> = None;
                for cls in classes {
                    let method_name = if cls == Symbol::DEFAULT {
                        format!("{}.default", thread.name_of(generic))
                    } else {
                        format!("{}.{}", thread.name_of(generic), thread.name_of(cls))
                    };
                    let method = thread.interner.intern(&method_name);
                    if let (Value::Function(f), _) = thread.envs.get_recursive(caller_env, method)
                    {
                        found = Some((f, method, cls));
                        break;
                    }
                }
                let Some((func, method, cls)) = found else {
                    return Err(VmError::Type(format!(
                        "no applicable method for '{}' applied to an object of class \"{}\"",
                        thread.name_of(generic),
                        obj.class_attr()
                            .and_then(|c| c.as_character1())
                            .map(|s| thread.name_of(s).to_string())
                            .unwrap_or_else(|| obj.strip().ty().name().to_string())
                    )));
                };
                let fenv = thread
                    .envs
                    .alloc(Some(func.env), Some(caller_env), call.call.clone());
                match_args(thread, caller_env, &caller_proto, fenv, &func, &call)?;
                let e = thread.envs.get_mut(fenv);
                e.insert(Symbol::DOT_GENERIC, Value::character(generic));
                e.insert(Symbol::DOT_METHOD, Value::character(method));
                e.insert(Symbol::DOT_CLASS, Value::character(cls));
                thread.push_frame(func.proto.clone(), fenv, true, inst.c, caller_env, pc + 1);
                pc = 0;
            }

            ByteCode::Jmp => {
                pc = offset(pc, inst.a);
            }

            ByteCode::Jc => {
                let c = fetch_raw(thread, inst.c);
                if let Some(x) = c.as_logical1() {
                    pc = match x {
                        LOGICAL_TRUE => offset(pc, inst.a),
                        LOGICAL_FALSE => offset(pc, inst.b),
                        _ => return Err(VmError::NaCondition),
                    };
                } else if let Some(x) = c.as_integer1() {
                    if arith::int_is_na(x) {
                        return Err(VmError::NaCondition);
                    }
                    pc = if x != 0 { offset(pc, inst.a) } else { offset(pc, inst.b) };
                } else if let Some(x) = c.as_double1() {
                    if x.is_nan() {
                        return Err(VmError::NaCondition);
                    }
                    pc = if x != 0.0 { offset(pc, inst.a) } else { offset(pc, inst.b) };
                } else if !c.is_concrete() {
                    let _ = op_fetch!(inst.c);
                    unreachable!("concrete after force");
                } else {
                    return Err(VmError::Type(
                        "need a single-element logical in conditional jump".to_string(),
                    ));
                }
            }

            ByteCode::Branch => {
                let c = fetch_raw(thread, inst.c);
                let ncases = inst.b as usize;
                let mut index: Option<usize> = None;
                if let Some(s) = c.as_character1() {
                    let mut default = None;
                    for i in 1..=ncases {
                        let entry = thread.frame().proto.code[pc + i];
                        let name = Symbol::from_operand(entry.a);
                        if name == s {
                            index = Some(i);
                            break;
                        }
                        if name == Symbol::EMPTY && default.is_none() {
                            default = Some(i);
                        }
                    }
                    if index.is_none() {
                        index = default;
                    }
                } else if let Some(x) = c.as_integer1() {
                    if !arith::int_is_na(x) {
                        index = Some(x as usize);
                    }
                } else if let Some(x) = c.as_double1() {
                    if !x.is_nan() {
                        index = Some(x as usize);
                    }
                } else if !c.is_concrete() {
                    let _ = op_fetch!(inst.c);
                    unreachable!("concrete after force");
                }
                pc = match index {
                    Some(i) if i >= 1 && i <= ncases => {
                        offset(pc, thread.frame().proto.code[pc + i].c)
                    }
                    _ => pc + 1 + ncases,
                };
            }

            ByteCode::ForBegin => {
                // a = loop variable, b = loop vector, c = counter
                // register; the following jmp carries the exit offset.
                let vec = op_fetch!(inst.b);
                if vec.is_empty() {
                    let skip = thread.frame().proto.code[pc + 1].a;
                    pc = offset(pc, skip);
                } else {
                    let var = Symbol::from_operand(inst.a);
                    let first = vec.strip().element(0).ok_or_else(|| {
                        VmError::Type("invalid for() loop sequence".to_string())
                    })?;
                    let env = thread.frame().env;
                    thread.envs.get_mut(env).insert(var, first);
                    *thread.reg_mut(inst.c) = Value::integer(1);
                    pc += 2;
                }
            }

            ByteCode::ForEnd => {
                let i = thread
                    .reg(inst.c)
                    .as_integer1()
                    .ok_or_else(|| VmError::Internal("corrupt loop counter".to_string()))?;
                let vec = op_fetch!(inst.b);
                if (i as usize) < vec.len() {
                    let var = Symbol::from_operand(inst.a);
                    let elem = vec.strip().element(i as usize).ok_or_else(|| {
                        VmError::Type("invalid for() loop sequence".to_string())
                    })?;
                    let env = thread.frame().env;
                    thread.envs.get_mut(env).insert(var, elem);
                    *thread.reg_mut(inst.c) = Value::integer(i + 1);
                    let target = offset(pc, thread.frame().proto.code[pc + 1].a);
                    pc = match jit::trigger_backedge(thread, target)? {
                        Some(resume) => resume,
                        None => target,
                    };
                } else {
                    pc += 2;
                }
            }

            ByteCode::List => {
                pc = list_op(thread, pc, inst.a, inst.b, inst.c)?;
            }

            // === Memory ===
            ByteCode::Constant => {
                let v = thread.frame().proto.constants[inst.a as usize].clone();
                *thread.reg_mut(inst.c) = v;
                pc += 1;
            }

            ByteCode::Assign => {
                let v = op_fetch!(inst.c);
                let env = thread.frame().env;
                thread
                    .envs
                    .get_mut(env)
                    .insert(Symbol::from_operand(inst.a), v);
                pc += 1;
            }

            ByteCode::Assign2 => {
                // superassign starts one scope up
                let v = op_fetch!(inst.c);
                let sym = Symbol::from_operand(inst.a);
                let global = thread.global;
                match thread.envs.get(thread.frame().env).lexical {
                    Some(parent) => thread.envs.insert_recursive(parent, sym, v, global),
                    None => thread.envs.get_mut(global).insert(sym, v),
                }
                pc += 1;
            }

            ByteCode::Mov => {
                let v = op_fetch!(inst.a);
                *thread.reg_mut(inst.c) = v;
                pc += 1;
            }

            ByteCode::FastMov => {
                let v = fetch_raw(thread, inst.a);
                *thread.reg_mut(inst.c) = v;
                pc += 1;
            }

            ByteCode::IAssign => {
                // a = value, b = index, c = dest
                let value = op_fetch!(inst.a);
                let index = op_fetch!(inst.b);
                let dest = op_fetch!(inst.c);
                *thread.reg_mut(inst.c) = assign_keeping_attrs(&dest, &index, &value, false)?;
                pc += 1;
            }

            ByteCode::EAssign => {
                let value = op_fetch!(inst.a);
                let index = op_fetch!(inst.b);
                let dest = op_fetch!(inst.c);
                *thread.reg_mut(inst.c) = assign_keeping_attrs(&dest, &index, &value, true)?;
                pc += 1;
            }

            ByteCode::Subset => {
                let a = op_fetch!(inst.a);
                let i = op_fetch!(inst.b);
                if a.is_object() || i.is_object() {
                    if let Some(resume) = dispatch_op_method(
                        thread,
                        ByteCode::Subset,
                        &[a.clone(), i.clone()],
                        inst.c,
                        pc,
                    )? {
                        pc = resume;
                        continue;
                    }
                }
                let base = a.strip();
                let result = if base.is_vector() {
                    if let Some(x) = i.as_double1() {
                        scalar_subset(base, if x.is_nan() { None } else { Some(x as i64) })?
                    } else if let Some(x) = i.as_integer1() {
                        scalar_subset(base, if arith::int_is_na(x) { None } else { Some(x) })?
                    } else if let Some(x) = i.as_logical1() {
                        match x {
                            LOGICAL_TRUE => subset::element_or_na(base, Some(0)),
                            LOGICAL_NA => subset::element_or_na(base, None),
                            _ => Value::empty(base.ty()),
                        }
                    } else if i.as_character1().is_some() {
                        return Err(VmError::OutOfBounds);
                    } else if i.is_vector() {
                        subset::subset_slow(base, &i)?
                    } else {
                        return Err(VmError::Type("invalid subset operation".to_string()));
                    }
                } else {
                    return Err(VmError::Type("invalid subset operation".to_string()));
                };
                *thread.reg_mut(inst.c) = result;
                pc += 1;
            }

            ByteCode::Subset2 => {
                let a = op_fetch!(inst.a);
                let i = op_fetch!(inst.b);
                if a.is_object() || i.is_object() {
                    if let Some(resume) = dispatch_op_method(
                        thread,
                        ByteCode::Subset2,
                        &[a.clone(), i.clone()],
                        inst.c,
                        pc,
                    )? {
                        pc = resume;
                        continue;
                    }
                }
                let base = a.strip();
                if !base.is_vector() {
                    return Err(VmError::Type("invalid subset2 operation".to_string()));
                }
                let idx = subset::scalar_index(&i)?;
                let result = base.element(idx).ok_or(VmError::OutOfBounds)?;
                *thread.reg_mut(inst.c) = result;
                pc += 1;
            }

            ByteCode::Dollar => {
                let a = op_fetch!(inst.a);
                *thread.reg_mut(inst.c) = subset::dollar(&a, Symbol::from_operand(inst.b));
                pc += 1;
            }

            ByteCode::AttrGet => {
                let object = op_fetch!(inst.a);
                let which = op_fetch!(inst.b);
                let name = which
                    .as_character1()
                    .ok_or_else(|| VmError::Type("attribute name must be a string".to_string()))?;
                let result = object.get_attr(name).cloned().unwrap_or(Value::Null);
                *thread.reg_mut(inst.c) = result;
                pc += 1;
            }

            ByteCode::AttrSet => {
                let value = op_fetch!(inst.a);
                let which = op_fetch!(inst.b);
                let object = op_fetch!(inst.c);
                let name = which
                    .as_character1()
                    .ok_or_else(|| VmError::Type("attribute name must be a string".to_string()))?;
                *thread.reg_mut(inst.c) = object.set_attr(name, value);
                pc += 1;
            }

            ByteCode::Strip => {
                let a = op_fetch!(inst.a);
                *thread.reg_mut(inst.c) = a.strip().clone();
                pc += 1;
            }

            // === Arithmetic ===
            op if op.is_unary_arith() => {
                let a = op_fetch!(inst.a);
                if let Some(resume) = dispatch_op_method(thread, op, &[a.clone()], inst.c, pc)? {
                    pc = resume;
                    continue;
                }
                if let Some(resume) = jit::trigger_arith(thread, pc, &[&a])? {
                    pc = resume;
                    continue;
                }
                *thread.reg_mut(inst.c) = arith::unary(op, &a)?;
                pc += 1;
            }

            op if op.is_binary_arith() => {
                let a = op_fetch!(inst.a);
                let b = op_fetch!(inst.b);
                if a.is_object() || b.is_object() {
                    if let Some(resume) =
                        dispatch_op_method(thread, op, &[a.clone(), b.clone()], inst.c, pc)?
                    {
                        pc = resume;
                        continue;
                    }
                }
                if let Some(resume) = jit::trigger_arith(thread, pc, &[&a, &b])? {
                    pc = resume;
                    continue;
                }
                *thread.reg_mut(inst.c) = arith::binary(op, &a, &b, &thread.interner)?;
                pc += 1;
            }

            op if op.is_fold() => {
                let a = op_fetch!(inst.a);
                if let Some(resume) = dispatch_op_method(thread, op, &[a.clone()], inst.c, pc)? {
                    pc = resume;
                    continue;
                }
                if let Some(resume) = jit::trigger_arith(thread, pc, &[&a])? {
                    pc = resume;
                    continue;
                }
                *thread.reg_mut(inst.c) = arith::fold(op, &a)?;
                pc += 1;
            }

            ByteCode::IfElse => {
                // two-slot encoding: the follower's c is the target
                let cond = op_fetch!(inst.a);
                let yes = op_fetch!(inst.b);
                let no = op_fetch!(inst.c);
                if let Some(resume) = jit::trigger_arith(thread, pc, &[&cond, &yes, &no])? {
                    pc = resume;
                    continue;
                }
                let target = thread.frame().proto.code[pc + 1].c;
                *thread.reg_mut(target) = arith::ifelse(&cond, &yes, &no)?;
                pc += 2;
            }

            ByteCode::Split => {
                let c = op_fetch!(inst.c);
                if let Some(resume) = jit::trigger_arith(thread, pc, &[&c])? {
                    pc = resume;
                    continue;
                }
                return Err(VmError::Type(
                    "split is not defined outside vector traces".to_string(),
                ));
            }

            // === Vector construction ===
            ByteCode::Seq => {
                let len_v = op_fetch!(inst.a);
                let step_v = op_fetch!(inst.b);
                let len = as_scalar_integer(&len_v)?;
                let step = as_scalar_integer(&step_v)?;
                if let Some(resume) = jit::trigger_seq(thread, pc, len.max(0) as usize)? {
                    pc = resume;
                    continue;
                }
                let out: Vec<i64> = (0..len.max(0)).map(|k| 1 + k * step).collect();
                *thread.reg_mut(inst.c) = Value::integers(out);
                pc += 1;
            }

            ByteCode::Colon => {
                let from_v = op_fetch!(inst.a);
                let to_v = op_fetch!(inst.b);
                let from = from_v
                    .as_real1()
                    .ok_or_else(|| VmError::Type("':' needs scalar endpoints".to_string()))?;
                let to = to_v
                    .as_real1()
                    .ok_or_else(|| VmError::Type("':' needs scalar endpoints".to_string()))?;
                if from.is_nan() || to.is_nan() {
                    return Err(VmError::Type("NA in ':'".to_string()));
                }
                let result = if from.fract() == 0.0 && to.fract() == 0.0 {
                    let (f, t) = (from as i64, to as i64);
                    let v: Vec<i64> = if t >= f {
                        (f..=t).collect()
                    } else {
                        (t..=f).rev().collect()
                    };
                    Value::integers(v)
                } else {
                    let n = (to - from).abs().floor() as usize + 1;
                    let step = if to >= from { 1.0 } else { -1.0 };
                    Value::doubles((0..n).map(|k| from + step * k as f64).collect())
                };
                *thread.reg_mut(inst.c) = result;
                pc += 1;
            }

            ByteCode::Rep => {
                // a = result length, b = value to recycle
                let len_v = op_fetch!(inst.a);
                let value = op_fetch!(inst.b);
                let len = as_scalar_integer(&len_v)?.max(0) as usize;
                if value.is_empty() {
                    return Err(VmError::Type("cannot rep a zero-length value".to_string()));
                }
                let indices: Vec<i64> = (0..len).map(|i| (i % value.len()) as i64 + 1).collect();
                let out = subset::subset_slow(value.strip(), &Value::integers(indices))?;
                *thread.reg_mut(inst.c) = out;
                pc += 1;
            }

            ByteCode::Type => {
                let a = op_fetch!(inst.a);
                let name = thread.interner.intern(a.ty().name());
                *thread.reg_mut(inst.c) = Value::character(name);
                pc += 1;
            }

            ByteCode::Length => {
                let a = op_fetch!(inst.a);
                let n = if a.strip().is_vector() || matches!(a.strip(), Value::Null) {
                    a.len()
                } else {
                    1
                };
                *thread.reg_mut(inst.c) = Value::integer(n as i64);
                pc += 1;
            }

            // === Introspection ===
            ByteCode::Missing => {
                let env = thread.frame().env;
                let v = thread.envs.get(env).get(Symbol::from_operand(inst.a));
                let missing = matches!(v, Value::Nil | Value::Default(_));
                *thread.reg_mut(inst.c) = Value::logical(missing);
                pc += 1;
            }

            ByteCode::Function => {
                let proto = thread.frame().proto.prototypes[inst.a as usize].clone();
                let env = thread.frame().env;
                *thread.reg_mut(inst.c) = Value::Function(Function { proto, env });
                pc += 1;
            }

            ByteCode::Internal => {
                let idx = (inst.a >> 8) as usize;
                let nargs = (inst.a & 0xff) as usize;
                let first = thread.slot(inst.b);
                let args: Vec<Value> = thread.regs[first..first + nargs].to_vec();
                let func = thread.builtins[idx].func;
                let result = func(thread, &args)?;
                *thread.reg_mut(inst.c) = result;
                pc += 1;
            }

            other => {
                return Err(VmError::Internal(format!(
                    "unhandled opcode '{}'",
                    other.name()
                )))
            }
        }
    }
}

#[inline]
fn offset(pc: usize, delta: i64) -> usize {
    (pc as i64 + delta) as usize
}

/// Scalar subset with the 1-based fast-path rules: index 0 is an empty
/// result, negatives fall to the generic path, out of bounds is NA.
fn scalar_subset(base: &Value, index: Option<i64>) -> VmResult<Value> {
    match index {
        None => Ok(subset::element_or_na(base, None)),
        Some(0) => Ok(Value::empty(base.ty())),
        Some(i) if i < 0 => subset::subset_slow(base, &Value::integer(i)),
        Some(i) => Ok(subset::element_or_na(base, Some((i - 1) as usize))),
    }
}

fn as_scalar_integer(v: &Value) -> VmResult<i64> {
    let ints = v
        .cast_integer()
        .map_err(|e| VmError::Type(e.to_string()))?;
    ints.first()
        .copied()
        .ok_or_else(|| VmError::Type("expected a scalar integer".to_string()))
}

/// `x[i] <- v` / `x[[i]] <- v` preserving any attribute wrapper.
fn assign_keeping_attrs(
    dest: &Value,
    index: &Value,
    value: &Value,
    exact: bool,
) -> VmResult<Value> {
    let new_base = if exact {
        subset::subset2_assign(dest.strip(), index, value)?
    } else {
        subset::subset_assign(dest.strip(), index, value)?
    };
    Ok(match dest {
        Value::Object(o) => {
            let mut out = new_base;
            for (name, attr) in &o.attrs {
                out = out.set_attr(*name, attr.clone());
            }
            out
        }
        _ => new_base,
    })
}

/// The `list` opcode: iterate the dots sequence, forcing each promise
/// through a fresh stack frame. `a` is the iteration counter register,
/// `b` the element register, `c` the output.
fn list_op(thread: &mut Thread, pc: usize, a: i64, b: i64, c: i64) -> VmResult<usize> {
    let env = thread.frame().env;
    let dots_len = thread.envs.get(env).dots.len();
    let i = thread.reg(a).as_integer1().unwrap_or(0);

    if i == 0 {
        *thread.reg_mut(c) = Value::list(vec![Value::Null; dots_len]);
    } else {
        let elem = thread.reg(b).clone();
        // cache the forced value back into the dots slot
        thread.envs.get_mut(env).dots[(i - 1) as usize].1 = elem.clone();
        let Value::List(items) = thread.reg_mut(c) else {
            return Err(VmError::Internal("list output clobbered".to_string()));
        };
        Arc::make_mut(items)[(i - 1) as usize] = elem;
    }

    if i as usize == dots_len {
        let names: Vec<Symbol> = thread.envs.get(env).dots.iter().map(|(n, _)| *n).collect();
        if names.iter().any(|&n| n != Symbol::EMPTY) {
            let out = thread.reg(c).clone();
            *thread.reg_mut(c) = out.set_attr(Symbol::NAMES, Value::characters(names));
        }
        return Ok(pc + 1);
    }

    *thread.reg_mut(a) = Value::integer(i + 1);
    let src = thread.envs.get(env).dots[i as usize].1.clone();
    match src {
        Value::Promise(p) | Value::Default(p) => {
            let proto = p.proto.clone();
            thread.push_frame(proto, p.env, false, b, env, pc);
            Ok(0)
        }
        v => {
            *thread.reg_mut(b) = v;
            Ok(pc)
        }
    }
}

/// Inline buffer for materialized call arguments.
pub type ArgBuffer = SmallVec<[(Symbol, Value); 8]>;

/// Materialize a compiled call's arguments and bind them into the
/// callee environment (positional + named matching with dots).
pub fn match_args(
    thread: &mut Thread,
    caller_env: EnvId,
    caller_proto: &Prototype,
    fenv: EnvId,
    func: &Function,
    call: &CompiledCall,
) -> VmResult<()> {
    let mut vals: ArgBuffer = SmallVec::with_capacity(call.arguments.len());
    for (k, arg) in call.arguments.iter().enumerate() {
        match arg {
            Arg::Value(v) => vals.push((call.names[k], v.clone())),
            Arg::Promise(idx) => vals.push((
                call.names[k],
                Value::Promise(Promise {
                    proto: caller_proto.prototypes[*idx].clone(),
                    env: caller_env,
                    slot: call.names[k],
                }),
            )),
            Arg::Dots => {
                let dots = thread.envs.get(caller_env).dots.clone();
                vals.extend(dots);
            }
        }
    }
    bind_args(thread, fenv, func, vals)
}

/// Bind materialized (name, value) arguments to the callee's formals.
pub fn bind_args(
    thread: &mut Thread,
    fenv: EnvId,
    func: &Function,
    vals: ArgBuffer,
) -> VmResult<()> {
    let params = &func.proto.params;
    let dots_param = func.proto.dots_param;
    let mut bound: Vec<Option<Value>> = vec![None; params.len()];
    let mut extra: Vec<(Symbol, Value)> = Vec::new();

    // named arguments match formals exactly
    let mut positional: Vec<Value> = Vec::new();
    for (name, v) in vals {
        if name == Symbol::EMPTY {
            positional.push(v);
            continue;
        }
        match params
            .iter()
            .enumerate()
            .position(|(i, p)| p.name == name && Some(i) != dots_param)
        {
            Some(i) => {
                if bound[i].is_some() {
                    return Err(VmError::Arity(format!(
                        "formal argument '{}' matched by multiple arguments",
                        thread.name_of(name)
                    )));
                }
                bound[i] = Some(v);
            }
            None => extra.push((name, v)),
        }
    }

    // positional arguments fill formals before the dots, in order
    let positional_limit = dots_param.unwrap_or(params.len());
    let mut next = 0;
    for v in positional {
        while next < positional_limit && bound[next].is_some() {
            next += 1;
        }
        if next < positional_limit {
            bound[next] = Some(v);
            next += 1;
        } else {
            extra.push((Symbol::EMPTY, v));
        }
    }

    if dots_param.is_none() && !extra.is_empty() {
        return Err(VmError::Arity(format!(
            "unused argument{}",
            if extra.len() == 1 { "" } else { "s" }
        )));
    }

    for (i, param) in params.iter().enumerate() {
        if Some(i) == dots_param {
            continue;
        }
        match bound[i].take() {
            Some(mut v) => {
                if let Value::Promise(p) = &mut v {
                    p.slot = param.name;
                }
                thread.envs.get_mut(fenv).insert(param.name, v);
            }
            None => {
                if let Some(didx) = param.default {
                    let p = Value::Default(Promise {
                        proto: func.proto.prototypes[didx].clone(),
                        env: fenv,
                        slot: param.name,
                    });
                    thread.envs.get_mut(fenv).insert(param.name, p);
                }
                // otherwise the binding stays absent: missing
            }
        }
    }

    if dots_param.is_some() {
        thread.envs.get_mut(fenv).dots = extra;
    }
    Ok(())
}

/// S3 dispatch for arithmetic on Objects: look for `<op>.<class>` and
/// call it with the evaluated operands. Returns the resume PC when a
/// method frame was pushed.
fn dispatch_op_method(
    thread: &mut Thread,
    op: ByteCode,
    args: &[Value],
    dest: i64,
    pc: usize,
) -> VmResult<Option<usize>> {
    let obj = args.iter().find(|a| a.is_object());
    let Some(obj) = obj else { return Ok(None) };
    let Some(Value::Character(classes)) = obj.class_attr() else {
        return Ok(None);
    };
    let generic = surface_op_name(op);
    let caller_env = thread.frame().env;
    for cls in classes.iter() {
        let method_name = format!("{}.{}", generic, thread.name_of(*cls));
        let method = thread.interner.intern(&method_name);
        if let (Value::Function(f), _) = thread.envs.get_recursive(caller_env, method) {
            trace!(method = %method_name, "dispatching method");
            let fenv = thread
                .envs
                .alloc(Some(f.env), Some(caller_env), Value::Null);
            let vals: ArgBuffer = args.iter().map(|v| (Symbol::EMPTY, v.clone())).collect();
            bind_args(thread, fenv, &f, vals)?;
            thread.push_frame(f.proto.clone(), fenv, true, dest, caller_env, pc + 1);
            return Ok(Some(0));
        }
    }
    Ok(None)
}

/// The surface symbol an arithmetic opcode dispatches under.
fn surface_op_name(op: ByteCode) -> &'static str {
    match op {
        ByteCode::Add => "+",
        ByteCode::Sub => "-",
        ByteCode::Mul => "*",
        ByteCode::Div => "/",
        ByteCode::Mod => "%%",
        ByteCode::Pow => "^",
        ByteCode::Eq => "==",
        ByteCode::Neq => "!=",
        ByteCode::Lt => "<",
        ByteCode::Le => "<=",
        ByteCode::Gt => ">",
        ByteCode::Ge => ">=",
        ByteCode::And => "&",
        ByteCode::Or => "|",
        ByteCode::Not => "!",
        ByteCode::Neg => "-",
        ByteCode::Subset => "[",
        ByteCode::Subset2 => "[[",
        ByteCode::Dollar => "$",
        other => other.name(),
    }
}
