//! Fusion-group scheduling.
//!
//! A single forward pass marks every node as fusable with its
//! predecessor run or as a group boundary. Fusable contiguous runs are
//! executed as one loop over vector tiles, eliminating intermediate
//! full-width buffers.

use crate::jit::ir::{IrOp, Shape, TraceCode};
use std::collections::HashSet;

/// Mark fusion boundaries in place.
pub fn mark(code: &mut TraceCode) {
    let mut group_shape = Shape::EMPTY;
    let mut members: HashSet<usize> = HashSet::new();
    code.fusable = vec![true; code.nodes.len()];

    for i in 0..code.nodes.len() {
        if !code.live[i] {
            continue;
        }
        let node = code.nodes[i];
        let boundary = node.input != group_shape
            || (node.op == IrOp::Scatter && members.contains(&node.c))
            || (node.op == IrOp::Gather && members.contains(&node.a))
            || matches!(
                node.op,
                IrOp::Gtrue
                    | IrOp::Gfalse
                    | IrOp::Load
                    | IrOp::Sload
                    | IrOp::Loop
                    | IrOp::Jmp
                    | IrOp::Exit
                    | IrOp::Phi
                    | IrOp::Curenv
                    | IrOp::Lenv
            );
        if boundary {
            code.fusable[i] = false;
            group_shape = node.input;
            members.clear();
        }
        members.insert(i);
        // a gather's base and a scatter's destination are read/written
        // as whole vectors; remember them for the aliasing check
        if node.op == IrOp::Gather {
            members.insert(node.a);
        }
        if node.op == IrOp::Scatter {
            members.insert(node.c);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::ir::{Ir, IrRef, NO_REG};
    use std::collections::BTreeMap;
    use velo_core::value::Ty;

    fn trace(nodes: Vec<Ir>) -> TraceCode {
        let n = nodes.len();
        TraceCode {
            nodes,
            constants: vec![velo_core::value::Value::integer(1)],
            exits: BTreeMap::new(),
            live: vec![true; n],
            fusable: Vec::new(),
            reg: vec![NO_REG; n],
            loop_start: None,
        }
    }

    fn vec_shape(len_ref: IrRef) -> Shape {
        Shape { len_ref, len: 1000 }
    }

    #[test]
    fn same_shape_run_fuses() {
        let v = vec_shape(0);
        let mut code = trace(vec![
            Ir::new(IrOp::Constant, 0, 0, 0, Ty::Integer, Shape::EMPTY, Shape::SCALAR),
            Ir::new(IrOp::Sload, 0, 1, 0, Ty::Double, Shape::EMPTY, v),
            Ir::new(IrOp::Add, 1, 1, 0, Ty::Double, v, v),
            Ir::new(IrOp::Mul, 2, 2, 0, Ty::Double, v, v),
        ]);
        mark(&mut code);
        // the load is always a boundary; the arithmetic run fuses
        assert!(!code.fusable[1]);
        assert!(!code.fusable[2]); // shape changes from Empty to vector
        assert!(code.fusable[3]);
    }

    #[test]
    fn shape_change_breaks_group() {
        let v = vec_shape(0);
        let w = vec_shape(5);
        let mut code = trace(vec![
            Ir::new(IrOp::Constant, 0, 0, 0, Ty::Integer, Shape::EMPTY, Shape::SCALAR),
            Ir::new(IrOp::Add, 0, 0, 0, Ty::Double, v, v),
            Ir::new(IrOp::Add, 1, 1, 0, Ty::Double, w, w),
        ]);
        mark(&mut code);
        assert!(!code.fusable[2]);
    }

    #[test]
    fn gather_from_vector_written_in_group_is_boundary() {
        let v = vec_shape(0);
        let mut code = trace(vec![
            Ir::new(IrOp::Constant, 0, 0, 0, Ty::Integer, Shape::EMPTY, Shape::SCALAR),
            Ir::new(IrOp::Add, 0, 0, 0, Ty::Double, v, v),
            // gathering from node 1, which is in the current group
            Ir::new(IrOp::Gather, 1, 1, 0, Ty::Double, v, v),
        ]);
        mark(&mut code);
        assert!(!code.fusable[2]);
    }

    #[test]
    fn guards_are_boundaries() {
        let v = vec_shape(0);
        let mut code = trace(vec![
            Ir::new(IrOp::Constant, 0, 0, 0, Ty::Integer, Shape::EMPTY, Shape::SCALAR),
            Ir::new(IrOp::Add, 0, 0, 0, Ty::Logical, v, v),
            Ir::new(IrOp::Gtrue, 1, 0, 0, Ty::Nil, v, Shape::EMPTY),
        ]);
        mark(&mut code);
        assert!(!code.fusable[2]);
    }
}
