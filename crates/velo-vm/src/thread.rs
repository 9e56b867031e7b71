//! The Thread: register file, call-frame stack, environment arena,
//! builtin table, and trace cache. Strictly single-threaded; every
//! piece of global mutable state (interner, base environment, trace
//! cache) lives here.

use crate::builtin::{self, Builtin};
use crate::interp;
use crate::jit::Jit;
use std::sync::Arc;
use thiserror::Error;
use velo_core::env::{EnvArena, EnvId};
use velo_core::interner::{Interner, Symbol};
use velo_core::prototype::Prototype;
use velo_core::value::Value;

/// Runtime error. Trace aborts and guard failures are *not* errors;
/// everything here unwinds to the nearest `eval` boundary.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("{0}")]
    Type(String),

    #[error("{0}")]
    Arity(String),

    #[error("subscript out of bounds")]
    OutOfBounds,

    #[error("object '{0}' not found")]
    NotFound(String),

    #[error("NA where TRUE/FALSE needed")]
    NaCondition,

    #[error("{0}")]
    User(String),

    #[error("assembler buffer overflow")]
    Assembler,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type VmResult<T> = Result<T, VmError>;

/// Trace executor backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// Tile-wise IR interpreter.
    #[default]
    Tile,
    /// x86-64 machine code where the trace shape permits, tile
    /// interpreter otherwise.
    Machine,
}

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Gates the JIT trigger path entirely.
    pub jit_enabled: bool,
    /// Minimum vector length for the arithmetic/seq trigger.
    pub trigger_len: usize,
    /// Back-edge executions before a loop is considered hot.
    pub hot_loop: u32,
    /// Side exits taken before a side trace is recorded.
    pub hot_exit: u32,
    /// Print compiled traces and IR dumps.
    pub verbose: bool,
    pub backend: Backend,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            jit_enabled: true,
            trigger_len: 128,
            hot_loop: 50,
            hot_exit: 8,
            verbose: false,
            backend: Backend::Tile,
        }
    }
}

/// One call frame.
#[derive(Clone)]
pub struct StackFrame {
    pub env: EnvId,
    pub proto: Arc<Prototype>,
    /// This frame's register window start.
    pub base: usize,
    /// Caller's register window start, restored on return.
    pub return_base: usize,
    /// Instruction to resume in the caller's prototype.
    pub return_pc: usize,
    /// Where the result goes: `<= 0` register in the caller's window,
    /// `> 0` an interned name inserted into `dest_env`.
    pub dest: i64,
    pub dest_env: EnvId,
    /// This frame owns `env` and may recycle it on return.
    pub own_env: bool,
}

/// A single-threaded interpreter instance.
pub struct Thread {
    pub interner: Interner,
    pub envs: EnvArena,
    pub global: EnvId,
    pub regs: Vec<Value>,
    pub base: usize,
    pub frames: Vec<StackFrame>,
    pub jit: Jit,
    pub config: Config,
    pub(crate) builtins: Vec<Builtin>,
}

impl Thread {
    pub fn new() -> Thread {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Thread {
        let mut envs = EnvArena::new();
        let global = envs.alloc(None, None, Value::Null);
        Thread {
            interner: Interner::new(),
            envs,
            global,
            regs: Vec::new(),
            base: 0,
            frames: Vec::new(),
            jit: Jit::default(),
            config,
            builtins: builtin::table(),
        }
    }

    /// The current frame. Only valid while interpreting.
    #[inline]
    pub fn frame(&self) -> &StackFrame {
        self.frames.last().expect("no active frame")
    }

    #[inline]
    pub fn frame_mut(&mut self) -> &mut StackFrame {
        self.frames.last_mut().expect("no active frame")
    }

    /// Register slot for an instruction operand (`operand <= 0`).
    #[inline]
    pub fn slot(&self, operand: i64) -> usize {
        debug_assert!(operand <= 0);
        self.base + (-operand) as usize
    }

    #[inline]
    pub fn reg(&self, operand: i64) -> &Value {
        &self.regs[self.slot(operand)]
    }

    #[inline]
    pub fn reg_mut(&mut self, operand: i64) -> &mut Value {
        let slot = self.slot(operand);
        &mut self.regs[slot]
    }

    /// Push a frame and switch the register window to it. Returns the
    /// PC the interpreter should continue at (the callee's entry).
    pub fn push_frame(
        &mut self,
        proto: Arc<Prototype>,
        env: EnvId,
        own_env: bool,
        dest: i64,
        dest_env: EnvId,
        return_pc: usize,
    ) -> usize {
        let new_base = match self.frames.last() {
            Some(f) => f.base + f.proto.registers,
            None => 0,
        };
        let need = new_base + proto.registers;
        if self.regs.len() < need {
            self.regs.resize(need, Value::Nil);
        }
        self.frames.push(StackFrame {
            env,
            base: new_base,
            return_base: self.base,
            return_pc,
            dest,
            dest_env,
            own_env,
            proto,
        });
        self.base = new_base;
        0
    }

    /// Resolve a name through the lexical chain of the current frame's
    /// environment without forcing promises.
    pub fn lookup(&self, name: Symbol) -> (Value, Option<EnvId>) {
        self.envs.get_recursive(self.frame().env, name)
    }

    /// Evaluate a prototype in an environment. Reentrant: the register
    /// base and frame-stack height are restored even on error unwind.
    pub fn eval(&mut self, proto: Arc<Prototype>, env: EnvId) -> VmResult<Value> {
        let saved_base = self.base;
        let floor = self.frames.len();
        self.push_frame(proto, env, false, 0, env, usize::MAX);
        let result = interp::interpret(self, floor);
        self.base = saved_base;
        self.frames.truncate(floor);
        result
    }

    /// Force a value if it is a promise or default, otherwise return it
    /// unchanged. Used by the builtin ABI; the interpreter's operand
    /// fetch forces through frame pushes instead.
    pub fn force(&mut self, v: Value) -> VmResult<Value> {
        match v {
            Value::Promise(p) | Value::Default(p) => {
                let env = p.env;
                let result = self.eval(p.proto.clone(), env)?;
                Ok(result)
            }
            other => Ok(other),
        }
    }

    /// Resolve a symbol's text (error messages, dumps).
    pub fn name_of(&self, sym: Symbol) -> &str {
        self.interner.resolve(sym)
    }
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}
