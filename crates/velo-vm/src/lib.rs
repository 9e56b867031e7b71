//! Bytecode interpreter and tracing JIT for the Velo runtime.
//!
//! The execution pipeline: the interpreter runs prototypes until a hot
//! loop edge or long-vector arithmetic instruction is reached; the
//! trace recorder shadows the interpreter into a typed IR; the
//! optimizer replays the raw trace twice (header + peeled loop body)
//! with CSE, load/store forwarding, store sinking, and phi insertion;
//! the scheduler marks fusion groups; the register assigner fills the
//! vector-tile register slots; and the executor runs the trace either
//! as a tile-wise IR interpreter or as x86-64 machine code. Guard
//! failures restore the interpreter state from the guard's exit
//! snapshot and resume at its reenter PC.

pub mod arith;
pub mod builtin;
pub mod interp;
pub mod jit;
pub mod subset;
pub mod thread;

pub use thread::{Backend, Config, StackFrame, Thread, VmError, VmResult};
