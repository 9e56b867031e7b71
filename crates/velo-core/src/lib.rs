//! Core data model for the Velo runtime: tagged values, interned
//! strings, the environment arena, and the compiled bytecode types.

pub mod bc;
pub mod env;
pub mod interner;
pub mod prototype;
pub mod value;

pub use bc::{ByteCode, Instruction};
pub use env::{EnvArena, EnvId, Environment};
pub use interner::{Interner, Symbol};
pub use prototype::{Arg, CompiledCall, Param, Prototype};
pub use value::{
    double_na, format_double, is_double_na, Complex, Function, Object, Promise, Ty, Value,
    ValueError, ValueResult, DOUBLE_NA_BITS, INTEGER_NA, LOGICAL_FALSE, LOGICAL_NA, LOGICAL_TRUE,
};
