//! Expression ASTs.
//!
//! The surface language is S-expression shaped: every program is a
//! sequence of atoms and nested calls. Special forms (`begin`, `<-`,
//! `if`, `for`, `function`, ...) are ordinary calls distinguished by
//! their head symbol in the compiler.

use std::fmt;

/// A source span (byte offsets).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Span {
        Span { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Smallest span covering both.
    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// An expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

/// Expression kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Integer(i64),
    Double(f64),
    /// TRUE / FALSE / NA.
    Logical(Option<bool>),
    Str(String),
    Null,
    /// Typed NA literals for the deparse round trip.
    NaInt,
    NaReal,
    NaStr,
    Symbol(String),
    Call(Vec<Expr>),
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Expr {
        Expr { kind, span }
    }

    /// The head symbol of a call, if any.
    pub fn head(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Call(parts) => match parts.first().map(|e| &e.kind) {
                Some(ExprKind::Symbol(s)) => Some(s),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Symbol(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::Integer(i) => write!(f, "{}", i),
            ExprKind::Double(d) => write!(f, "{}", d),
            ExprKind::Logical(Some(true)) => f.write_str("TRUE"),
            ExprKind::Logical(Some(false)) => f.write_str("FALSE"),
            ExprKind::Logical(None) => f.write_str("NA"),
            ExprKind::Str(s) => write!(f, "{:?}", s),
            ExprKind::Null => f.write_str("NULL"),
            ExprKind::NaInt => f.write_str("NA-int"),
            ExprKind::NaReal => f.write_str("NA-real"),
            ExprKind::NaStr => f.write_str("NA-str"),
            ExprKind::Symbol(s) => f.write_str(s),
            ExprKind::Call(parts) => {
                f.write_str("(")?;
                for (i, p) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", p)?;
                }
                f.write_str(")")
            }
        }
    }
}
