//! Bytecode instruction set.
//!
//! Instructions are fixed three-operand records. Operand encoding:
//! values `> 0` name an interned symbol (environment access through the
//! lexical chain), values `<= 0` name a register slot at
//! `base + (-operand)` in the Thread's register file.

use std::fmt;

/// Names of the internal builtins, in table order. The compiler
/// resolves names against this list; the Thread's builtin table is
/// built in the same order. The `internal` instruction packs
/// `(index << 8) | nargs` into its `a` operand.
pub const INTERNALS: &[&str] = &["c", "cat", "stop", "list", "rm", "nchar"];

/// Opcodes. Behavior is defined by the interpreter; this enum is the
/// shared vocabulary between the compiler, interpreter, and recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ByteCode {
    // === Control ===
    Call,
    NCall,
    Ret,
    Jmp,
    Jc,
    Branch,
    UseMethod,
    ForBegin,
    ForEnd,
    Done,

    // === Memory ===
    Constant,
    Assign,
    Assign2,
    Mov,
    FastMov,
    IAssign,
    EAssign,
    Subset,
    Subset2,
    Dollar,
    AttrGet,
    AttrSet,
    Strip,

    // === Unary arithmetic / predicates ===
    Neg,
    Not,
    IsNa,
    IsFinite,
    Sqrt,
    Abs,
    Floor,
    Ceiling,
    Exp,
    Log,

    // === Binary arithmetic / comparison / logical ===
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,

    // === Folds and scans ===
    Sum,
    Prod,
    Min,
    Max,
    Any,
    All,
    CumSum,

    // === Ternary ===
    IfElse,
    Split,

    // === Vector construction ===
    Seq,
    Colon,
    Rep,
    List,
    Type,
    Length,

    // === Introspection ===
    Missing,
    Function,
    Internal,
}

impl ByteCode {
    pub fn name(self) -> &'static str {
        match self {
            ByteCode::Call => "call",
            ByteCode::NCall => "ncall",
            ByteCode::Ret => "ret",
            ByteCode::Jmp => "jmp",
            ByteCode::Jc => "jc",
            ByteCode::Branch => "branch",
            ByteCode::UseMethod => "usemethod",
            ByteCode::ForBegin => "forbegin",
            ByteCode::ForEnd => "forend",
            ByteCode::Done => "done",
            ByteCode::Constant => "constant",
            ByteCode::Assign => "assign",
            ByteCode::Assign2 => "assign2",
            ByteCode::Mov => "mov",
            ByteCode::FastMov => "fastmov",
            ByteCode::IAssign => "iassign",
            ByteCode::EAssign => "eassign",
            ByteCode::Subset => "subset",
            ByteCode::Subset2 => "subset2",
            ByteCode::Dollar => "dollar",
            ByteCode::AttrGet => "attrget",
            ByteCode::AttrSet => "attrset",
            ByteCode::Strip => "strip",
            ByteCode::Neg => "neg",
            ByteCode::Not => "not",
            ByteCode::IsNa => "is.na",
            ByteCode::IsFinite => "is.finite",
            ByteCode::Sqrt => "sqrt",
            ByteCode::Abs => "abs",
            ByteCode::Floor => "floor",
            ByteCode::Ceiling => "ceiling",
            ByteCode::Exp => "exp",
            ByteCode::Log => "log",
            ByteCode::Add => "add",
            ByteCode::Sub => "sub",
            ByteCode::Mul => "mul",
            ByteCode::Div => "div",
            ByteCode::Mod => "mod",
            ByteCode::Pow => "pow",
            ByteCode::Eq => "eq",
            ByteCode::Neq => "neq",
            ByteCode::Lt => "lt",
            ByteCode::Le => "le",
            ByteCode::Gt => "gt",
            ByteCode::Ge => "ge",
            ByteCode::And => "and",
            ByteCode::Or => "or",
            ByteCode::Sum => "sum",
            ByteCode::Prod => "prod",
            ByteCode::Min => "min",
            ByteCode::Max => "max",
            ByteCode::Any => "any",
            ByteCode::All => "all",
            ByteCode::CumSum => "cumsum",
            ByteCode::IfElse => "ifelse",
            ByteCode::Split => "split",
            ByteCode::Seq => "seq",
            ByteCode::Colon => "colon",
            ByteCode::Rep => "rep",
            ByteCode::List => "list",
            ByteCode::Type => "type",
            ByteCode::Length => "length",
            ByteCode::Missing => "missing",
            ByteCode::Function => "function",
            ByteCode::Internal => "internal",
        }
    }

    /// Unary arithmetic / predicate group.
    pub fn is_unary_arith(self) -> bool {
        matches!(
            self,
            ByteCode::Neg
                | ByteCode::Not
                | ByteCode::IsNa
                | ByteCode::IsFinite
                | ByteCode::Sqrt
                | ByteCode::Abs
                | ByteCode::Floor
                | ByteCode::Ceiling
                | ByteCode::Exp
                | ByteCode::Log
        )
    }

    /// Binary arithmetic / comparison / logical group.
    pub fn is_binary_arith(self) -> bool {
        matches!(
            self,
            ByteCode::Add
                | ByteCode::Sub
                | ByteCode::Mul
                | ByteCode::Div
                | ByteCode::Mod
                | ByteCode::Pow
                | ByteCode::Eq
                | ByteCode::Neq
                | ByteCode::Lt
                | ByteCode::Le
                | ByteCode::Gt
                | ByteCode::Ge
                | ByteCode::And
                | ByteCode::Or
        )
    }

    /// Fold / scan group.
    pub fn is_fold(self) -> bool {
        matches!(
            self,
            ByteCode::Sum
                | ByteCode::Prod
                | ByteCode::Min
                | ByteCode::Max
                | ByteCode::Any
                | ByteCode::All
                | ByteCode::CumSum
        )
    }
}

impl fmt::Display for ByteCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A three-operand instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub op: ByteCode,
    pub a: i64,
    pub b: i64,
    pub c: i64,
}

impl Instruction {
    pub fn new(op: ByteCode, a: i64, b: i64, c: i64) -> Instruction {
        Instruction { op, a, b, c }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:10} {:6} {:6} {:6}", self.op.name(), self.a, self.b, self.c)
    }
}
