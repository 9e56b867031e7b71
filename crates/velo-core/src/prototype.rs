//! Compiled units.
//!
//! A `Prototype` is immutable once emitted: a constant pool, nested
//! prototypes (function bodies, promise thunks, default expressions),
//! a compiled-call table, and the instruction stream.

use crate::bc::Instruction;
use crate::interner::Symbol;
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// A formal parameter. Defaults are compiled to nested prototypes and
/// materialize as Default promises evaluated in the callee's
/// environment.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: Symbol,
    /// Index into `Prototype::prototypes` of the default expression.
    pub default: Option<usize>,
}

/// A compiled argument at a call site.
#[derive(Debug, Clone)]
pub enum Arg {
    /// A constant passed eagerly (literals).
    Value(Value),
    /// A lazily evaluated argument: index into `Prototype::prototypes`
    /// of the thunk. The promise's environment is the caller's at
    /// invocation time.
    Promise(usize),
    /// The `...` marker; expanded from the caller's dots at call time.
    Dots,
}

/// A pre-matched call-site record.
#[derive(Debug, Clone)]
pub struct CompiledCall {
    pub arguments: Vec<Arg>,
    /// Parallel to `arguments`; `Symbol::EMPTY` for positional.
    pub names: Vec<Symbol>,
    /// Position of `...` among the arguments; `arguments.len()` when
    /// absent.
    pub dots: usize,
    /// Reified call expression (deparsed source), Null when absent.
    pub call: Value,
}

impl CompiledCall {
    pub fn has_dots(&self) -> bool {
        self.dots < self.arguments.len()
    }
}

/// A compiled unit.
#[derive(Debug, Default)]
pub struct Prototype {
    pub constants: Vec<Value>,
    pub prototypes: Vec<Arc<Prototype>>,
    pub calls: Vec<CompiledCall>,
    pub code: Vec<Instruction>,
    /// Number of register slots this prototype needs.
    pub registers: usize,
    /// Formal parameters (closures only).
    pub params: Vec<Param>,
    /// Index in `params` of `...`, if the closure takes dots.
    pub dots_param: Option<usize>,
    /// Name for dumps and error messages.
    pub name: Option<Symbol>,
}

impl Prototype {
    /// Add a constant, deduplicating structurally equal ones.
    pub fn add_constant(&mut self, v: Value) -> usize {
        if let Some(i) = self.constants.iter().position(|c| *c == v) {
            return i;
        }
        self.constants.push(v);
        self.constants.len() - 1
    }
}

impl fmt::Display for Prototype {
    /// Disassembly listing.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "registers: {}", self.registers)?;
        for (i, inst) in self.code.iter().enumerate() {
            writeln!(f, "{:4}  {}", i, inst)?;
        }
        Ok(())
    }
}
