//! Vector-tile register assignment.
//!
//! A reverse walk over the scheduled IR assigns each tile-executed
//! node a register from a small bitmask free list: the result register
//! is released first (its live range ends at the defining node when
//! scanning upward), operand registers are allocated on first use.
//! Widening casts must not alias their operand and result registers:
//! the wider store would overwrite unread narrower lanes.

use crate::jit::ir::{IrOp, TraceCode, NO_REG};

/// Number of vector-tile registers.
pub const N_REGS: u16 = 16;

/// Bitmask free list of register indices.
#[derive(Debug, Clone, Copy)]
pub struct Allocator {
    mask: u32,
}

impl Default for Allocator {
    fn default() -> Self {
        Allocator {
            mask: (1u32 << N_REGS) - 1,
        }
    }
}

impl Allocator {
    /// Take the lowest free register, if any.
    pub fn allocate(&mut self) -> Option<u16> {
        if self.mask == 0 {
            return None;
        }
        let reg = self.mask.trailing_zeros() as u16;
        self.mask &= !(1 << reg);
        Some(reg)
    }

    pub fn free(&mut self, reg: u16) {
        self.mask |= 1 << reg;
    }
}

/// Does this node produce a value that lives in a tile register when
/// its group executes?
fn tile_valued(code: &TraceCode, i: usize) -> bool {
    let node = code.nodes[i];
    if !code.live[i] || node.out.is_empty() || node.out.is_scalar() {
        return false;
    }
    !matches!(
        node.op,
        IrOp::Constant
            | IrOp::Sload
            | IrOp::Load
            | IrOp::Sstore
            | IrOp::Store
            | IrOp::Loop
            | IrOp::Jmp
            | IrOp::Exit
            | IrOp::Phi
            | IrOp::Curenv
            | IrOp::Lenv
            | IrOp::Scatter
    )
}

/// Assign tile registers in place.
pub fn assign(code: &mut TraceCode) {
    let mut alloc = Allocator::default();
    code.reg = vec![NO_REG; code.nodes.len()];

    for i in (0..code.nodes.len()).rev() {
        if !tile_valued(code, i) {
            continue;
        }
        let node = code.nodes[i];

        // result first: unused results still get a register
        if code.reg[i] == NO_REG {
            let Some(r) = alloc.allocate() else { continue };
            code.reg[i] = r;
        }
        alloc.free(code.reg[i]);

        // operands on first use, walking upward
        let buf;
        let operands: &[usize] = match node.op {
            IrOp::Gather => {
                buf = [node.b, 0, 0];
                &buf[..1]
            }
            IrOp::IfElse => {
                buf = [node.a, node.b, node.c];
                &buf[..]
            }
            op if is_binary(op) => {
                buf = [node.a, node.b, 0];
                &buf[..2]
            }
            IrOp::Seq | IrOp::RepIdx => &[],
            _ => {
                buf = [node.a, 0, 0];
                &buf[..1]
            }
        };
        for &o in operands {
            if !tile_valued(code, o) || code.reg[o] != NO_REG {
                continue;
            }
            let Some(mut r) = alloc.allocate() else { continue };
            // widening-cast anti-aliasing: the wider result would
            // overwrite unread narrower lanes of the operand
            if node.op.is_widening_cast(code.nodes[node.a].ty) && o == node.a && r == code.reg[i] {
                if let Some(r2) = alloc.allocate() {
                    alloc.free(r);
                    r = r2;
                }
            }
            code.reg[o] = r;
        }
    }
}

fn is_binary(op: IrOp) -> bool {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::{Ir, Shape};
    use std::collections::BTreeMap;
    use velo_core::value::{Ty, Value};

    fn vec_shape() -> Shape {
        Shape { len_ref: 0, len: 512 }
    }

    fn trace(nodes: Vec<Ir>) -> TraceCode {
        let n = nodes.len();
        TraceCode {
            nodes,
            constants: vec![Value::integer(1)],
            exits: BTreeMap::new(),
            live: vec![true; n],
            fusable: vec![true; n],
            reg: Vec::new(),
            loop_start: None,
        }
    }

    #[test]
    fn allocator_reuses_freed_registers() {
        let mut a = Allocator::default();
        let r0 = a.allocate().unwrap();
        let r1 = a.allocate().unwrap();
        assert_ne!(r0, r1);
        a.free(r0);
        assert_eq!(a.allocate().unwrap(), r0);
    }

    #[test]
    fn widening_cast_operand_never_aliases_result() {
        let v = vec_shape();
        let mut code = trace(vec![
            Ir::new(IrOp::Constant, 0, 0, 0, Ty::Integer, Shape::EMPTY, Shape::SCALAR),
            Ir::new(IrOp::Eq, 0, 0, 0, Ty::Logical, v, v),
            Ir::new(IrOp::CastDouble, 1, 0, 0, Ty::Double, v, v),
            Ir::new(IrOp::Add, 2, 2, 0, Ty::Double, v, v),
        ]);
        assign(&mut code);
        assert_ne!(code.reg[2], NO_REG);
        assert_ne!(code.reg[1], NO_REG);
        assert_ne!(
            code.reg[1], code.reg[2],
            "widening cast source register must differ from its destination"
        );
    }

    #[test]
    fn chain_reuses_registers() {
        let v = vec_shape();
        let mut code = trace(vec![
            Ir::new(IrOp::Constant, 0, 0, 0, Ty::Integer, Shape::EMPTY, Shape::SCALAR),
            Ir::new(IrOp::Add, 0, 0, 0, Ty::Double, v, v),
            Ir::new(IrOp::Mul, 1, 1, 0, Ty::Double, v, v),
            Ir::new(IrOp::Sub, 2, 2, 0, Ty::Double, v, v),
        ]);
        assign(&mut code);
        let used: std::collections::HashSet<u16> =
            [code.reg[1], code.reg[2], code.reg[3]].into_iter().collect();
        // a straight-line chain needs very few registers
        assert!(used.len() <= 2, "chain used {} registers", used.len());
    }
}
