//! Machine-code trace backend.
//!
//! Lowers scalar-shaped traces (every live compute node of scalar
//! shape, Integer/Double/Logical element types) to x86-64. Values live
//! in a state array indexed by IR position: loads, constants, lengths,
//! and environment chains are resolved on the Rust side before the
//! call; the generated code runs the loop, and each guard jumps to a
//! stub returning its node position. The contract is exact equivalence
//! with the tile interpreter; traces outside the supported shape fall
//! back to it.

use crate::jit::asm::{Assembler, Cc, CodeBuf, Label, RAX, RCX, RDI, RDX, XMM0, XMM1};
use crate::jit::ir::{Ir, IrOp, IrRef, TraceCode};
use crate::jit::tile::Outcome;
use crate::jit::CompiledTrace;
use crate::thread::Thread;
use std::collections::HashMap;
use velo_core::interner::Symbol;
use velo_core::value::{
    Ty, Value, DOUBLE_NA_BITS, INTEGER_NA, LOGICAL_FALSE, LOGICAL_NA, LOGICAL_TRUE,
};

/// Sentinel return value for a pre-call bail (never produced by the
/// generated code itself; kept for the contract).
const BAIL: i64 = -1;

pub struct McodeTrace {
    buf: CodeBuf,
    /// Node count; the state array is `2n + phi_count` slots: value
    /// bits at `i`, vector length at `n + i`, phi scratch after.
    n: usize,
    phi_count: usize,
}

/// Node classes the lowering understands.
enum Class {
    /// Resolved on the Rust side before the call.
    Prefilled,
    /// Code is generated.
    Computed,
    /// No code and no state (stores are sunk, markers are structure).
    Structural,
}

fn classify(code: &TraceCode, i: IrRef) -> Option<Class> {
    let node = code.nodes[i];
    let scalar = node.out.is_scalar();
    Some(match node.op {
        IrOp::Constant
        | IrOp::Sload
        | IrOp::Load
        | IrOp::Slength
        | IrOp::Elength
        | IrOp::Curenv
        | IrOp::Lenv
        | IrOp::Length => Class::Prefilled,
        IrOp::Sstore | IrOp::Store | IrOp::Kill | IrOp::Loop | IrOp::Jmp | IrOp::Exit
        | IrOp::Phi => Class::Structural,
        IrOp::Gtrue | IrOp::Gfalse => {
            // the guard compares against the logical encoding directly
            if !code.nodes[node.a].out.is_scalar() || code.nodes[node.a].ty != Ty::Logical {
                return None;
            }
            Class::Computed
        }
        IrOp::Add | IrOp::Sub | IrOp::Mul => {
            if !scalar || !matches!(node.ty, Ty::Integer | Ty::Double) {
                return None;
            }
            Class::Computed
        }
        IrOp::Div => {
            if !scalar || node.ty != Ty::Double {
                return None;
            }
            Class::Computed
        }
        IrOp::Eq | IrOp::Neq | IrOp::Lt | IrOp::Le | IrOp::Gt | IrOp::Ge => {
            if !scalar || !matches!(code.nodes[node.a].ty, Ty::Integer | Ty::Double) {
                return None;
            }
            Class::Computed
        }
        IrOp::And | IrOp::Or | IrOp::Not => {
            if !scalar {
                return None;
            }
            Class::Computed
        }
        IrOp::Neg => {
            if !scalar {
                return None;
            }
            Class::Computed
        }
        IrOp::CastDouble => {
            if !scalar || !matches!(code.nodes[node.a].ty, Ty::Integer | Ty::Logical) {
                return None;
            }
            Class::Computed
        }
        IrOp::CastInteger => {
            if !scalar || !matches!(code.nodes[node.a].ty, Ty::Double | Ty::Logical) {
                return None;
            }
            Class::Computed
        }
        IrOp::CastLogical => {
            if !scalar || !matches!(code.nodes[node.a].ty, Ty::Integer | Ty::Double) {
                return None;
            }
            Class::Computed
        }
        IrOp::Gather => {
            // scalar element pick from a prefilled numeric vector
            let base_ok = matches!(
                code.nodes[node.a].op,
                IrOp::Sload | IrOp::Load | IrOp::Constant
            ) && matches!(code.nodes[node.a].ty, Ty::Integer | Ty::Double);
            if !scalar || !base_ok || code.nodes[node.b].ty != Ty::Integer {
                return None;
            }
            Class::Computed
        }
        _ => return None,
    })
}

/// Try to lower a trace; None falls back to the tile interpreter.
pub fn try_compile(code: &TraceCode) -> Option<McodeTrace> {
    if !cfg!(target_arch = "x86_64") {
        return None;
    }
    for i in 0..code.nodes.len() {
        if code.live[i] {
            classify(code, i)?;
        }
    }
    let n = code.nodes.len();
    let phi_count = code
        .nodes
        .iter()
        .enumerate()
        .filter(|(i, node)| code.live[*i] && node.op == IrOp::Phi)
        .count();

    let mut asm = Assembler::new();
    let mut loop_label = Label::default();
    // per-guard exit stubs, resolved after the main body
    let mut stubs: Vec<(Label, IrRef)> = Vec::new();

    let mut emit_all = |asm: &mut Assembler| -> crate::thread::VmResult<()> {
        for i in 0..code.nodes.len() {
            if !code.live[i] {
                continue;
            }
            let node = code.nodes[i];
            match node.op {
                IrOp::Loop => asm_bind_loop(asm, &mut loop_label),
                IrOp::Jmp => {
                    emit_phis(asm, code, n)?;
                    asm.jmp(&mut loop_label)?;
                }
                IrOp::Exit => {
                    asm.movq_ri(RAX, i as u64)?;
                    asm.ret()?;
                }
                IrOp::Gtrue | IrOp::Gfalse => {
                    let mut stub = Label::default();
                    asm.movq_rm(RAX, RDI, disp(node.a))?;
                    asm.cmpq_ri(
                        RAX,
                        if node.op == IrOp::Gtrue {
                            LOGICAL_TRUE as i32
                        } else {
                            LOGICAL_FALSE as i32
                        },
                    )?;
                    asm.jcc(Cc::Ne, &mut stub)?;
                    stubs.push((stub, i));
                }
                op if matches!(op, IrOp::Add | IrOp::Sub | IrOp::Mul) && node.ty == Ty::Integer => {
                    emit_int_binary(asm, &node, i)?;
                }
                op if matches!(op, IrOp::Add | IrOp::Sub | IrOp::Mul | IrOp::Div)
                    && node.ty == Ty::Double =>
                {
                    emit_dbl_binary(asm, &node, i)?;
                }
                IrOp::Eq | IrOp::Neq | IrOp::Lt | IrOp::Le | IrOp::Gt | IrOp::Ge => {
                    if code.nodes[node.a].ty == Ty::Double {
                        emit_dbl_compare(asm, &node, i)?;
                    } else {
                        emit_int_compare(asm, &node, i)?;
                    }
                }
                IrOp::And | IrOp::Or => emit_logic(asm, &node, i)?,
                IrOp::Not => emit_not(asm, &node, i)?,
                IrOp::Neg => emit_neg(asm, code, &node, i)?,
                IrOp::CastDouble => emit_cast_double(asm, code, &node, i)?,
                IrOp::CastInteger => emit_cast_integer(asm, code, &node, i)?,
                IrOp::CastLogical => emit_cast_logical(asm, code, &node, i)?,
                IrOp::Gather => emit_gather(asm, code, &node, i, n)?,
                _ => {}
            }
        }
        // a side trace falls off through its exit node; a loop trace
        // never reaches here
        asm.movq_ri(RAX, BAIL as u64)?;
        asm.ret()?;
        for (mut stub, pos) in stubs.drain(..) {
            asm.bind(&mut stub);
            asm.movq_ri(RAX, pos as u64)?;
            asm.ret()?;
        }
        Ok(())
    };
    emit_all(&mut asm).ok()?;

    let buf = CodeBuf::new(&asm.finish())?;
    Some(McodeTrace { buf, n, phi_count })
}

fn asm_bind_loop(asm: &mut Assembler, label: &mut Label) {
    asm.bind(label);
}

#[inline]
fn disp(slot: usize) -> i32 {
    (slot * 8) as i32
}

/// Parallel phi shuffle: copy every body value into scratch, then
/// scratch into the header slots.
fn emit_phis(asm: &mut Assembler, code: &TraceCode, n: usize) -> crate::thread::VmResult<()> {
    let mut k = 0;
    let phis: Vec<Ir> = code
        .nodes
        .iter()
        .enumerate()
        .filter(|(i, node)| code.live[*i] && node.op == IrOp::Phi)
        .map(|(_, node)| *node)
        .collect();
    for node in &phis {
        asm.movq_rm(RAX, RDI, disp(node.b))?;
        asm.movq_mr(RDI, disp(2 * n + k), RAX)?;
        k += 1;
    }
    k = 0;
    for node in &phis {
        asm.movq_rm(RAX, RDI, disp(2 * n + k))?;
        asm.movq_mr(RDI, disp(node.a), RAX)?;
        k += 1;
    }
    Ok(())
}

/// Integer binary with NA propagation (NA is `i64::MIN`).
fn emit_int_binary(asm: &mut Assembler, node: &Ir, i: IrRef) -> crate::thread::VmResult<()> {
    let mut na = Label::default();
    let mut done = Label::default();
    asm.movq_rm(RAX, RDI, disp(node.a))?;
    asm.movq_rm(RCX, RDI, disp(node.b))?;
    asm.movq_ri(RDX, INTEGER_NA as u64)?;
    asm.cmpq_rr(RAX, RDX)?;
    asm.jcc(Cc::E, &mut na)?;
    asm.cmpq_rr(RCX, RDX)?;
    asm.jcc(Cc::E, &mut na)?;
    match node.op {
        IrOp::Add => asm.addq_rr(RAX, RCX)?,
        IrOp::Sub => asm.subq_rr(RAX, RCX)?,
        _ => asm.imulq_rr(RAX, RCX)?,
    }
    asm.jmp(&mut done)?;
    asm.bind(&mut na);
    asm.movq_rr(RAX, RDX)?;
    asm.bind(&mut done);
    asm.movq_mr(RDI, disp(i), RAX)
}

fn emit_dbl_binary(asm: &mut Assembler, node: &Ir, i: IrRef) -> crate::thread::VmResult<()> {
    asm.movsd_rm(XMM0, RDI, disp(node.a))?;
    asm.movsd_rm(XMM1, RDI, disp(node.b))?;
    match node.op {
        IrOp::Add => asm.addsd(XMM0, XMM1)?,
        IrOp::Sub => asm.subsd(XMM0, XMM1)?,
        IrOp::Mul => asm.mulsd(XMM0, XMM1)?,
        _ => asm.divsd(XMM0, XMM1)?,
    }
    asm.movsd_mr(RDI, disp(i), XMM0)
}

fn emit_int_compare(asm: &mut Assembler, node: &Ir, i: IrRef) -> crate::thread::VmResult<()> {
    let mut na = Label::default();
    let mut done = Label::default();
    asm.movq_rm(RAX, RDI, disp(node.a))?;
    asm.movq_rm(RCX, RDI, disp(node.b))?;
    asm.movq_ri(RDX, INTEGER_NA as u64)?;
    asm.cmpq_rr(RAX, RDX)?;
    asm.jcc(Cc::E, &mut na)?;
    asm.cmpq_rr(RCX, RDX)?;
    asm.jcc(Cc::E, &mut na)?;
    asm.cmpq_rr(RAX, RCX)?;
    let cc = match node.op {
        IrOp::Eq => Cc::E,
        IrOp::Neq => Cc::Ne,
        IrOp::Lt => Cc::L,
        IrOp::Le => Cc::Le,
        IrOp::Gt => Cc::G,
        _ => Cc::Ge,
    };
    asm.setcc(cc, RAX)?;
    asm.movzxb(RAX, RAX)?;
    asm.jmp(&mut done)?;
    asm.bind(&mut na);
    asm.movq_ri(RAX, LOGICAL_NA as u64)?;
    asm.bind(&mut done);
    asm.movq_mr(RDI, disp(i), RAX)
}

fn emit_dbl_compare(asm: &mut Assembler, node: &Ir, i: IrRef) -> crate::thread::VmResult<()> {
    let mut na = Label::default();
    let mut done = Label::default();
    asm.movsd_rm(XMM0, RDI, disp(node.a))?;
    asm.movsd_rm(XMM1, RDI, disp(node.b))?;
    asm.ucomisd(XMM0, XMM1)?;
    asm.jcc(Cc::P, &mut na)?;
    let cc = match node.op {
        IrOp::Eq => Cc::E,
        IrOp::Neq => Cc::Ne,
        IrOp::Lt => Cc::B,
        IrOp::Le => Cc::Be,
        IrOp::Gt => Cc::A,
        _ => Cc::Ae,
    };
    asm.setcc(cc, RAX)?;
    asm.movzxb(RAX, RAX)?;
    asm.jmp(&mut done)?;
    asm.bind(&mut na);
    asm.movq_ri(RAX, LOGICAL_NA as u64)?;
    asm.bind(&mut done);
    asm.movq_mr(RDI, disp(i), RAX)
}

/// Three-valued and/or on 0/1/NA byte values.
fn emit_logic(asm: &mut Assembler, node: &Ir, i: IrRef) -> crate::thread::VmResult<()> {
    let mut dominant = Label::default();
    let mut na = Label::default();
    let mut done = Label::default();
    // `and` short-circuits on FALSE, `or` on TRUE
    let dom_value = if node.op == IrOp::And {
        LOGICAL_FALSE
    } else {
        LOGICAL_TRUE
    };
    let other = if node.op == IrOp::And {
        LOGICAL_TRUE
    } else {
        LOGICAL_FALSE
    };
    asm.movq_rm(RAX, RDI, disp(node.a))?;
    asm.movq_rm(RCX, RDI, disp(node.b))?;
    asm.cmpq_ri(RAX, dom_value as i32)?;
    asm.jcc(Cc::E, &mut dominant)?;
    asm.cmpq_ri(RCX, dom_value as i32)?;
    asm.jcc(Cc::E, &mut dominant)?;
    asm.cmpq_ri(RAX, other as i32)?;
    asm.jcc(Cc::Ne, &mut na)?;
    asm.cmpq_ri(RCX, other as i32)?;
    asm.jcc(Cc::Ne, &mut na)?;
    asm.movq_ri(RAX, other as u64)?;
    asm.jmp(&mut done)?;
    asm.bind(&mut dominant);
    asm.movq_ri(RAX, dom_value as u64)?;
    asm.jmp(&mut done)?;
    asm.bind(&mut na);
    asm.movq_ri(RAX, LOGICAL_NA as u64)?;
    asm.bind(&mut done);
    asm.movq_mr(RDI, disp(i), RAX)
}

fn emit_not(asm: &mut Assembler, node: &Ir, i: IrRef) -> crate::thread::VmResult<()> {
    let mut t = Label::default();
    let mut f = Label::default();
    let mut done = Label::default();
    asm.movq_rm(RAX, RDI, disp(node.a))?;
    asm.cmpq_ri(RAX, LOGICAL_FALSE as i32)?;
    asm.jcc(Cc::E, &mut t)?;
    asm.cmpq_ri(RAX, LOGICAL_TRUE as i32)?;
    asm.jcc(Cc::E, &mut f)?;
    asm.movq_ri(RAX, LOGICAL_NA as u64)?;
    asm.jmp(&mut done)?;
    asm.bind(&mut t);
    asm.movq_ri(RAX, LOGICAL_TRUE as u64)?;
    asm.jmp(&mut done)?;
    asm.bind(&mut f);
    asm.movq_ri(RAX, LOGICAL_FALSE as u64)?;
    asm.bind(&mut done);
    asm.movq_mr(RDI, disp(i), RAX)
}

fn emit_neg(
    asm: &mut Assembler,
    code: &TraceCode,
    node: &Ir,
    i: IrRef,
) -> crate::thread::VmResult<()> {
    if code.nodes[node.a].ty == Ty::Double {
        // flip the sign bit
        asm.movq_rm(RAX, RDI, disp(node.a))?;
        asm.movq_ri(RCX, 0x8000_0000_0000_0000)?;
        asm.xorq_rr(RAX, RCX)?;
        return asm.movq_mr(RDI, disp(i), RAX);
    }
    let mut na = Label::default();
    let mut done = Label::default();
    asm.movq_rm(RCX, RDI, disp(node.a))?;
    asm.movq_ri(RDX, INTEGER_NA as u64)?;
    asm.cmpq_rr(RCX, RDX)?;
    asm.jcc(Cc::E, &mut na)?;
    asm.xorq_rr(RAX, RAX)?;
    asm.subq_rr(RAX, RCX)?;
    asm.jmp(&mut done)?;
    asm.bind(&mut na);
    asm.movq_rr(RAX, RDX)?;
    asm.bind(&mut done);
    asm.movq_mr(RDI, disp(i), RAX)
}

fn emit_cast_double(
    asm: &mut Assembler,
    code: &TraceCode,
    node: &Ir,
    i: IrRef,
) -> crate::thread::VmResult<()> {
    let mut na = Label::default();
    let mut done = Label::default();
    asm.movq_rm(RAX, RDI, disp(node.a))?;
    if code.nodes[node.a].ty == Ty::Logical {
        asm.cmpq_ri(RAX, LOGICAL_NA as i32)?;
    } else {
        asm.movq_ri(RDX, INTEGER_NA as u64)?;
        asm.cmpq_rr(RAX, RDX)?;
    }
    asm.jcc(Cc::E, &mut na)?;
    asm.cvtsi2sd(XMM0, RAX)?;
    asm.movq_rx(RAX, XMM0)?;
    asm.jmp(&mut done)?;
    asm.bind(&mut na);
    asm.movq_ri(RAX, DOUBLE_NA_BITS)?;
    asm.bind(&mut done);
    asm.movq_mr(RDI, disp(i), RAX)
}

fn emit_cast_integer(
    asm: &mut Assembler,
    code: &TraceCode,
    node: &Ir,
    i: IrRef,
) -> crate::thread::VmResult<()> {
    let mut na = Label::default();
    let mut done = Label::default();
    if code.nodes[node.a].ty == Ty::Logical {
        asm.movq_rm(RAX, RDI, disp(node.a))?;
        asm.cmpq_ri(RAX, LOGICAL_NA as i32)?;
        asm.jcc(Cc::E, &mut na)?;
        asm.jmp(&mut done)?;
    } else {
        asm.movsd_rm(XMM0, RDI, disp(node.a))?;
        asm.ucomisd(XMM0, XMM0)?;
        asm.jcc(Cc::P, &mut na)?;
        asm.cvttsd2si(RAX, XMM0)?;
        asm.jmp(&mut done)?;
    }
    asm.bind(&mut na);
    asm.movq_ri(RAX, INTEGER_NA as u64)?;
    asm.bind(&mut done);
    asm.movq_mr(RDI, disp(i), RAX)
}

fn emit_cast_logical(
    asm: &mut Assembler,
    code: &TraceCode,
    node: &Ir,
    i: IrRef,
) -> crate::thread::VmResult<()> {
    let mut na = Label::default();
    let mut zero = Label::default();
    let mut done = Label::default();
    if code.nodes[node.a].ty == Ty::Double {
        asm.movsd_rm(XMM0, RDI, disp(node.a))?;
        asm.ucomisd(XMM0, XMM0)?;
        asm.jcc(Cc::P, &mut na)?;
        asm.xorq_rr(RAX, RAX)?;
        asm.movq_xr(XMM1, RAX)?;
        asm.ucomisd(XMM0, XMM1)?;
        asm.jcc(Cc::E, &mut zero)?;
    } else {
        asm.movq_rm(RAX, RDI, disp(node.a))?;
        asm.movq_ri(RDX, INTEGER_NA as u64)?;
        asm.cmpq_rr(RAX, RDX)?;
        asm.jcc(Cc::E, &mut na)?;
        asm.cmpq_ri(RAX, 0)?;
        asm.jcc(Cc::E, &mut zero)?;
    }
    asm.movq_ri(RAX, LOGICAL_TRUE as u64)?;
    asm.jmp(&mut done)?;
    asm.bind(&mut zero);
    asm.movq_ri(RAX, LOGICAL_FALSE as u64)?;
    asm.jmp(&mut done)?;
    asm.bind(&mut na);
    asm.movq_ri(RAX, LOGICAL_NA as u64)?;
    asm.bind(&mut done);
    asm.movq_mr(RDI, disp(i), RAX)
}

/// Scalar element pick: NA index or out-of-range yields the NA of the
/// element type, matching the tile interpreter's gather kernel.
fn emit_gather(
    asm: &mut Assembler,
    code: &TraceCode,
    node: &Ir,
    i: IrRef,
    n: usize,
) -> crate::thread::VmResult<()> {
    let mut na = Label::default();
    let mut done = Label::default();
    asm.movq_rm(RAX, RDI, disp(node.b))?;
    asm.movq_ri(RDX, INTEGER_NA as u64)?;
    asm.cmpq_rr(RAX, RDX)?;
    asm.jcc(Cc::E, &mut na)?;
    asm.cmpq_ri(RAX, 0)?;
    asm.jcc(Cc::L, &mut na)?;
    asm.movq_rm(RCX, RDI, disp(n + node.a))?; // vector length
    asm.cmpq_rr(RAX, RCX)?;
    asm.jcc(Cc::Ge, &mut na)?;
    asm.movq_rm(RCX, RDI, disp(node.a))?; // data pointer
    asm.movq_r_si8(RAX, RCX, RAX)?;
    asm.jmp(&mut done)?;
    asm.bind(&mut na);
    if code.nodes[node.a].ty == Ty::Double {
        asm.movq_ri(RAX, DOUBLE_NA_BITS)?;
    } else {
        asm.movq_ri(RAX, INTEGER_NA as u64)?;
    }
    asm.bind(&mut done);
    asm.movq_mr(RDI, disp(i), RAX)
}

/// Run a lowered trace: prefill the state array from interpreter
/// state, call the code, and apply the failing guard's exit.
pub fn run(mc: &McodeTrace, trace: &CompiledTrace, thread: &mut Thread) -> Outcome {
    let code = &trace.code;
    let n = mc.n;
    let mut state = vec![0i64; 2 * n + mc.phi_count];
    // values whose buffers the generated code reads through pointers
    let mut keepalive: HashMap<IrRef, Value> = HashMap::new();
    let mut envs: HashMap<IrRef, velo_core::env::EnvId> = HashMap::new();
    let entry_base = thread.base;
    let entry_env = thread.frame().env;

    for i in 0..n {
        if !code.live[i] {
            continue;
        }
        let node = code.nodes[i];
        match node.op {
            IrOp::Constant => {
                if !prefill_value(&mut state, &mut keepalive, i, n, &code.constants[node.a]) {
                    return Outcome::Bail;
                }
            }
            IrOp::Curenv => {
                envs.insert(i, entry_env);
            }
            IrOp::Lenv => {
                let Some(&child) = envs.get(&node.a) else {
                    return Outcome::Bail;
                };
                match thread.envs.get(child).lexical {
                    Some(p) => {
                        envs.insert(i, p);
                    }
                    None => return Outcome::Bail,
                }
            }
            IrOp::Sload => {
                let Some(v) = thread.regs.get(entry_base + node.b).cloned() else {
                    return Outcome::Bail;
                };
                if !validate(code, i, &v) {
                    return Outcome::Bail;
                }
                if !prefill_value(&mut state, &mut keepalive, i, n, &v) {
                    return Outcome::Bail;
                }
            }
            IrOp::Load => {
                let Some(&env) = envs.get(&node.a) else {
                    return Outcome::Bail;
                };
                let v = thread.envs.get(env).get(Symbol::from_operand(node.b as i64));
                if node.ty == Ty::Nil {
                    if !v.is_nil() {
                        return Outcome::Bail;
                    }
                    continue;
                }
                if !validate(code, i, &v) {
                    return Outcome::Bail;
                }
                if !prefill_value(&mut state, &mut keepalive, i, n, &v) {
                    return Outcome::Bail;
                }
            }
            IrOp::Slength => {
                let Some(v) = thread.regs.get(entry_base + node.b) else {
                    return Outcome::Bail;
                };
                state[i] = v.len() as i64;
            }
            IrOp::Elength => {
                let Some(&env) = envs.get(&node.a) else {
                    return Outcome::Bail;
                };
                let v = thread.envs.get(env).get(Symbol::from_operand(node.b as i64));
                state[i] = v.len() as i64;
            }
            IrOp::Length => {
                state[i] = if keepalive.contains_key(&node.a) {
                    state[n + node.a]
                } else {
                    1
                };
            }
            _ => {}
        }
    }

    let f = unsafe { mc.buf.entry() };
    let result = f(state.as_mut_ptr());
    if result < 0 {
        return Outcome::Bail;
    }
    let pos = result as usize;
    if !code.exits.contains_key(&pos) {
        return Outcome::Bail;
    }

    // write live stores back from the state array
    let exit = &code.exits[&pos];
    for (var, r) in &exit.stores {
        let value = match keepalive.get(r) {
            Some(v) => v.clone(),
            None => match code.nodes[*r].ty {
                Ty::Double => Value::double(f64::from_bits(state[*r] as u64)),
                Ty::Logical => Value::logicals(vec![state[*r] as u8]),
                _ => Value::integer(state[*r]),
            },
        };
        if var.is_register() {
            let slot = thread.base + (-var.slot) as usize;
            if thread.regs.len() <= slot {
                thread.regs.resize(slot + 1, Value::Nil);
            }
            thread.regs[slot] = value;
        } else if let Some(&env) = envs.get(&(var.env as usize)) {
            thread
                .envs
                .get_mut(env)
                .insert(Symbol::from_operand(var.slot), value);
        }
    }
    Outcome::Exit(pos)
}

fn validate(code: &TraceCode, i: IrRef, v: &Value) -> bool {
    let node = code.nodes[i];
    if v.ty() != node.ty {
        return false;
    }
    if !node.out.is_empty() && code.nodes[node.out.len_ref].op == IrOp::Constant {
        let expect = if node.out.is_scalar() { 1 } else { node.out.len };
        if v.len() != expect {
            return false;
        }
    }
    true
}

/// Scalars become value bits; vectors become (pointer, length) with
/// the Value kept alive for the duration of the call.
fn prefill_value(
    state: &mut [i64],
    keepalive: &mut HashMap<IrRef, Value>,
    i: IrRef,
    n: usize,
    v: &Value,
) -> bool {
    match v {
        Value::Integer(data) if data.len() == 1 => state[i] = data[0],
        Value::Double(data) if data.len() == 1 => state[i] = data[0].to_bits() as i64,
        Value::Logical(data) if data.len() == 1 => state[i] = data[0] as i64,
        Value::Integer(data) => {
            state[i] = data.as_ptr() as i64;
            state[n + i] = data.len() as i64;
            keepalive.insert(i, v.clone());
        }
        Value::Double(data) => {
            state[i] = data.as_ptr() as i64;
            state[n + i] = data.len() as i64;
            keepalive.insert(i, v.clone());
        }
        Value::Null => state[i] = 0,
        _ => return false,
    }
    true
}
