//! Runtime values for Velo.
//!
//! Every value is a vector of its element type; a scalar is a vector of
//! length 1. Vector payloads are `Arc<Vec<T>>` for cheap cloning (CoW
//! semantics via `Arc::make_mut`).

use crate::env::EnvId;
use crate::interner::{Interner, Symbol};
use crate::prototype::Prototype;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Integer NA sentinel.
pub const INTEGER_NA: i64 = i64::MIN;
/// Bit pattern of the Double NA (a distinguished quiet NaN).
pub const DOUBLE_NA_BITS: u64 = 0x7FF0_0000_0000_07A2;
/// Logical element encodings. Anything other than true/false is NA.
pub const LOGICAL_TRUE: u8 = 1;
pub const LOGICAL_FALSE: u8 = 0;
pub const LOGICAL_NA: u8 = 0xff;

/// The Double NA value.
#[inline]
pub fn double_na() -> f64 {
    f64::from_bits(DOUBLE_NA_BITS)
}

/// Is this double the NA pattern specifically (not just any NaN)?
#[inline]
pub fn is_double_na(x: f64) -> bool {
    x.to_bits() == DOUBLE_NA_BITS
}

/// A complex element.
pub type Complex = (f64, f64);

/// Value type tags. The declaration order of the vector types is the
/// coercion precedence: `null < logical < integer < double < complex <
/// character < list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Ty {
    Null,
    Logical,
    Integer,
    Double,
    Complex,
    Character,
    List,
    Function,
    Environment,
    Promise,
    Default,
    Object,
    Nil,
}

impl Ty {
    /// Name used in error messages and by the `type` opcode.
    pub fn name(self) -> &'static str {
        match self {
            Ty::Null => "NULL",
            Ty::Logical => "logical",
            Ty::Integer => "integer",
            Ty::Double => "double",
            Ty::Complex => "complex",
            Ty::Character => "character",
            Ty::List => "list",
            Ty::Function => "function",
            Ty::Environment => "environment",
            Ty::Promise => "promise",
            Ty::Default => "default",
            Ty::Object => "object",
            Ty::Nil => "nil",
        }
    }

    /// Is this one of the vector types that participates in coercion?
    pub fn is_vector(self) -> bool {
        matches!(
            self,
            Ty::Logical | Ty::Integer | Ty::Double | Ty::Complex | Ty::Character | Ty::List
        )
    }

    /// Unify two vector types by coercion precedence.
    pub fn unify(a: Ty, b: Ty) -> Option<Ty> {
        if a == Ty::Null {
            return Some(b);
        }
        if b == Ty::Null {
            return Some(a);
        }
        if a.is_vector() && b.is_vector() {
            Some(a.max(b))
        } else {
            None
        }
    }
}

/// A closure: compiled code plus its defining environment.
#[derive(Debug, Clone)]
pub struct Function {
    pub proto: Arc<Prototype>,
    pub env: EnvId,
}

/// A promise: a thunk captured at call time, forced on first read.
/// `Default` promises share the representation but evaluate in the
/// callee's environment.
#[derive(Debug, Clone)]
pub struct Promise {
    pub proto: Arc<Prototype>,
    pub env: EnvId,
    /// The binding the forced value replaces.
    pub slot: Symbol,
}

/// A value with an attribute bag. Setting any attribute on a plain
/// value promotes it to an Object.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    pub base: Value,
    pub attrs: Vec<(Symbol, Value)>,
}

/// A runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Logical(Arc<Vec<u8>>),
    Integer(Arc<Vec<i64>>),
    Double(Arc<Vec<f64>>),
    Complex(Arc<Vec<Complex>>),
    Character(Arc<Vec<Symbol>>),
    List(Arc<Vec<Value>>),
    Function(Function),
    Environment(EnvId),
    Promise(Promise),
    Default(Promise),
    Object(Box<Object>),
    /// Denotes "absent" in environment lookups.
    Nil,
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

/// Value-level error.
#[derive(Debug, Error)]
pub enum ValueError {
    #[error("cannot coerce {from} to {to}")]
    Coercion { from: &'static str, to: &'static str },

    #[error("expected a length-1 {expected}, got {actual}")]
    NotScalar {
        expected: &'static str,
        actual: &'static str,
    },
}

pub type ValueResult<T> = Result<T, ValueError>;

impl Value {
    // === Constructors ===

    pub fn logical(b: bool) -> Value {
        Value::Logical(Arc::new(vec![if b { LOGICAL_TRUE } else { LOGICAL_FALSE }]))
    }

    pub fn logical_na() -> Value {
        Value::Logical(Arc::new(vec![LOGICAL_NA]))
    }

    pub fn integer(i: i64) -> Value {
        Value::Integer(Arc::new(vec![i]))
    }

    pub fn double(d: f64) -> Value {
        Value::Double(Arc::new(vec![d]))
    }

    pub fn complex(c: Complex) -> Value {
        Value::Complex(Arc::new(vec![c]))
    }

    pub fn character(s: Symbol) -> Value {
        Value::Character(Arc::new(vec![s]))
    }

    pub fn logicals(v: Vec<u8>) -> Value {
        Value::Logical(Arc::new(v))
    }

    pub fn integers(v: Vec<i64>) -> Value {
        Value::Integer(Arc::new(v))
    }

    pub fn doubles(v: Vec<f64>) -> Value {
        Value::Double(Arc::new(v))
    }

    pub fn complexes(v: Vec<Complex>) -> Value {
        Value::Complex(Arc::new(v))
    }

    pub fn characters(v: Vec<Symbol>) -> Value {
        Value::Character(Arc::new(v))
    }

    pub fn list(v: Vec<Value>) -> Value {
        Value::List(Arc::new(v))
    }

    /// An empty vector of the given element type.
    pub fn empty(ty: Ty) -> Value {
        match ty {
            Ty::Null => Value::Null,
            Ty::Logical => Value::logicals(Vec::new()),
            Ty::Integer => Value::integers(Vec::new()),
            Ty::Double => Value::doubles(Vec::new()),
            Ty::Complex => Value::complexes(Vec::new()),
            Ty::Character => Value::characters(Vec::new()),
            Ty::List => Value::list(Vec::new()),
            _ => Value::Null,
        }
    }

    // === Inspection ===

    pub fn ty(&self) -> Ty {
        match self {
            Value::Null => Ty::Null,
            Value::Logical(_) => Ty::Logical,
            Value::Integer(_) => Ty::Integer,
            Value::Double(_) => Ty::Double,
            Value::Complex(_) => Ty::Complex,
            Value::Character(_) => Ty::Character,
            Value::List(_) => Ty::List,
            Value::Function(_) => Ty::Function,
            Value::Environment(_) => Ty::Environment,
            Value::Promise(_) => Ty::Promise,
            Value::Default(_) => Ty::Default,
            Value::Object(_) => Ty::Object,
            Value::Nil => Ty::Nil,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::Logical(v) => v.len(),
            Value::Integer(v) => v.len(),
            Value::Double(v) => v.len(),
            Value::Complex(v) => v.len(),
            Value::Character(v) => v.len(),
            Value::List(v) => v.len(),
            Value::Object(o) => o.base.len(),
            _ => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_vector(&self) -> bool {
        self.ty().is_vector()
    }

    /// Concrete values can be consumed directly; promises and defaults
    /// must be forced first, and Nil means "object not found".
    pub fn is_concrete(&self) -> bool {
        !matches!(self, Value::Promise(_) | Value::Default(_) | Value::Nil)
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    /// May a frame's environment be recycled when returning this value?
    /// Anything that can capture the environment says no.
    pub fn is_closure_safe(&self) -> bool {
        match self {
            Value::Function(_)
            | Value::Environment(_)
            | Value::Promise(_)
            | Value::Default(_) => false,
            Value::List(v) => v.iter().all(Value::is_closure_safe),
            Value::Object(o) => {
                o.base.is_closure_safe() && o.attrs.iter().all(|(_, v)| v.is_closure_safe())
            }
            _ => true,
        }
    }

    // === Scalar accessors (length-1 fast paths) ===

    pub fn as_logical1(&self) -> Option<u8> {
        match self {
            Value::Logical(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }

    pub fn as_integer1(&self) -> Option<i64> {
        match self {
            Value::Integer(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }

    pub fn as_double1(&self) -> Option<f64> {
        match self {
            Value::Double(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }

    pub fn as_character1(&self) -> Option<Symbol> {
        match self {
            Value::Character(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }

    /// A length-1 numeric as f64, NA-aware.
    pub fn as_real1(&self) -> Option<f64> {
        match self {
            Value::Double(v) if v.len() == 1 => Some(v[0]),
            Value::Integer(v) if v.len() == 1 => {
                Some(if v[0] == INTEGER_NA { double_na() } else { v[0] as f64 })
            }
            Value::Logical(v) if v.len() == 1 => Some(match v[0] {
                LOGICAL_NA => double_na(),
                x => x as f64,
            }),
            _ => None,
        }
    }

    // === Elements ===

    /// Extract element `i` as a length-1 value of the same type.
    /// Returns None when out of bounds.
    pub fn element(&self, i: usize) -> Option<Value> {
        if i >= self.len() {
            return None;
        }
        Some(match self {
            Value::Logical(v) => Value::Logical(Arc::new(vec![v[i]])),
            Value::Integer(v) => Value::Integer(Arc::new(vec![v[i]])),
            Value::Double(v) => Value::Double(Arc::new(vec![v[i]])),
            Value::Complex(v) => Value::Complex(Arc::new(vec![v[i]])),
            Value::Character(v) => Value::Character(Arc::new(vec![v[i]])),
            Value::List(v) => v[i].clone(),
            _ => return None,
        })
    }

    // === Attributes ===

    /// Look up an attribute; plain values have none.
    pub fn get_attr(&self, name: Symbol) -> Option<&Value> {
        match self {
            Value::Object(o) => o.attrs.iter().find(|(n, _)| *n == name).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Attach an attribute, promoting to an Object if needed. Setting
    /// an attribute to Null removes it; an Object with no remaining
    /// attributes collapses back to its base.
    pub fn set_attr(self, name: Symbol, value: Value) -> Value {
        let mut obj = match self {
            Value::Object(o) => *o,
            base => Object {
                base,
                attrs: Vec::new(),
            },
        };
        obj.attrs.retain(|(n, _)| *n != name);
        if !matches!(value, Value::Null) {
            obj.attrs.push((name, value));
        }
        if obj.attrs.is_empty() {
            obj.base
        } else {
            Value::Object(Box::new(obj))
        }
    }

    /// The value underneath any Object wrapper.
    pub fn strip(&self) -> &Value {
        match self {
            Value::Object(o) => &o.base,
            v => v,
        }
    }

    /// Class vector for S3 dispatch: the `class` attribute if present,
    /// otherwise the base type name has to be interned by the caller.
    pub fn class_attr(&self) -> Option<&Value> {
        self.get_attr(Symbol::CLASS)
    }

    // === Coercions (NA-propagating) ===

    pub fn cast_logical(&self) -> ValueResult<Vec<u8>> {
        match self.strip() {
            Value::Null => Ok(Vec::new()),
            Value::Logical(v) => Ok(v.as_ref().clone()),
            Value::Integer(v) => Ok(v
                .iter()
                .map(|&x| {
                    if x == INTEGER_NA {
                        LOGICAL_NA
                    } else if x != 0 {
                        LOGICAL_TRUE
                    } else {
                        LOGICAL_FALSE
                    }
                })
                .collect()),
            Value::Double(v) => Ok(v
                .iter()
                .map(|&x| {
                    if x.is_nan() {
                        LOGICAL_NA
                    } else if x != 0.0 {
                        LOGICAL_TRUE
                    } else {
                        LOGICAL_FALSE
                    }
                })
                .collect()),
            other => Err(ValueError::Coercion {
                from: other.ty().name(),
                to: "logical",
            }),
        }
    }

    pub fn cast_integer(&self) -> ValueResult<Vec<i64>> {
        match self.strip() {
            Value::Null => Ok(Vec::new()),
            Value::Logical(v) => Ok(v
                .iter()
                .map(|&x| if x == LOGICAL_NA { INTEGER_NA } else { x as i64 })
                .collect()),
            Value::Integer(v) => Ok(v.as_ref().clone()),
            Value::Double(v) => Ok(v
                .iter()
                .map(|&x| if x.is_nan() { INTEGER_NA } else { x as i64 })
                .collect()),
            other => Err(ValueError::Coercion {
                from: other.ty().name(),
                to: "integer",
            }),
        }
    }

    pub fn cast_double(&self) -> ValueResult<Vec<f64>> {
        match self.strip() {
            Value::Null => Ok(Vec::new()),
            Value::Logical(v) => Ok(v
                .iter()
                .map(|&x| if x == LOGICAL_NA { double_na() } else { x as f64 })
                .collect()),
            Value::Integer(v) => Ok(v
                .iter()
                .map(|&x| if x == INTEGER_NA { double_na() } else { x as f64 })
                .collect()),
            Value::Double(v) => Ok(v.as_ref().clone()),
            other => Err(ValueError::Coercion {
                from: other.ty().name(),
                to: "double",
            }),
        }
    }

    pub fn cast_complex(&self) -> ValueResult<Vec<Complex>> {
        match self.strip() {
            Value::Complex(v) => Ok(v.as_ref().clone()),
            other => Ok(other.cast_double()?.into_iter().map(|x| (x, 0.0)).collect()),
        }
    }

    /// Coerce to character, formatting elements through the interner.
    pub fn cast_character(&self, interner: &mut Interner) -> ValueResult<Vec<Symbol>> {
        match self.strip() {
            Value::Null => Ok(Vec::new()),
            Value::Character(v) => Ok(v.as_ref().clone()),
            Value::Logical(v) => Ok(v
                .iter()
                .map(|&x| match x {
                    LOGICAL_TRUE => interner.intern("TRUE"),
                    LOGICAL_FALSE => interner.intern("FALSE"),
                    _ => Symbol::NA,
                })
                .collect()),
            Value::Integer(v) => Ok(v
                .iter()
                .map(|&x| {
                    if x == INTEGER_NA {
                        Symbol::NA
                    } else {
                        interner.intern(&x.to_string())
                    }
                })
                .collect()),
            Value::Double(v) => Ok(v
                .iter()
                .map(|&x| {
                    if x.is_nan() {
                        Symbol::NA
                    } else {
                        interner.intern(&format_double(x))
                    }
                })
                .collect()),
            other => Err(ValueError::Coercion {
                from: other.ty().name(),
                to: "character",
            }),
        }
    }

    /// Coerce to the given vector type. Character targets need the
    /// interner-taking variant.
    pub fn cast_to(&self, ty: Ty) -> ValueResult<Value> {
        Ok(match ty {
            Ty::Logical => Value::logicals(self.cast_logical()?),
            Ty::Integer => Value::integers(self.cast_integer()?),
            Ty::Double => Value::doubles(self.cast_double()?),
            Ty::Complex => Value::complexes(self.cast_complex()?),
            Ty::List => match self.strip() {
                Value::List(v) => Value::List(v.clone()),
                v => {
                    let mut out = Vec::with_capacity(v.len());
                    for i in 0..v.len() {
                        out.push(v.element(i).unwrap_or(Value::Null));
                    }
                    Value::list(out)
                }
            },
            _ => {
                return Err(ValueError::Coercion {
                    from: self.ty().name(),
                    to: ty.name(),
                })
            }
        })
    }

    // === Deparse (printable subset) ===

    /// Render the value as surface syntax that parses back to a
    /// structurally equal value.
    pub fn deparse(&self, interner: &Interner) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Logical(v) => deparse_vec(v, |&x| match x {
                LOGICAL_TRUE => "TRUE".to_string(),
                LOGICAL_FALSE => "FALSE".to_string(),
                _ => "NA".to_string(),
            }),
            Value::Integer(v) => deparse_vec(v, |&x| {
                if x == INTEGER_NA {
                    "NA-int".to_string()
                } else {
                    x.to_string()
                }
            }),
            Value::Double(v) => deparse_vec(v, |&x| {
                if x.is_nan() {
                    "NA-real".to_string()
                } else {
                    format_double(x)
                }
            }),
            Value::Complex(v) => deparse_vec(v, |&(re, im)| {
                format!("(complex {} {})", format_double(re), format_double(im))
            }),
            Value::Character(v) => deparse_vec(v, |&s| {
                if s == Symbol::NA {
                    "NA-str".to_string()
                } else {
                    format!("{:?}", interner.resolve(s))
                }
            }),
            Value::List(v) => {
                let parts: Vec<String> = v.iter().map(|e| e.deparse(interner)).collect();
                format!("(list {})", parts.join(" "))
            }
            Value::Object(o) => {
                let mut s = o.base.deparse(interner);
                for (name, val) in &o.attrs {
                    s = format!(
                        "(attr<- {} {:?} {})",
                        s,
                        interner.resolve(*name),
                        val.deparse(interner)
                    );
                }
                s
            }
            other => format!("<{}>", other.ty().name()),
        }
    }
}

/// Format a double so it lexes back as a double (always a `.`, `e`, or
/// a non-finite marker).
pub fn format_double(x: f64) -> String {
    if x.is_infinite() {
        return if x > 0.0 { "Inf".to_string() } else { "-Inf".to_string() };
    }
    let s = format!("{}", x);
    if s.contains('.') || s.contains('e') || s.contains("inf") || s.contains("NaN") {
        s
    } else {
        format!("{}.0", s)
    }
}

fn deparse_vec<T>(v: &[T], f: impl Fn(&T) -> String) -> String {
    if v.len() == 1 {
        f(&v[0])
    } else {
        let parts: Vec<String> = v.iter().map(f).collect();
        format!("(c {})", parts.join(" "))
    }
}

/// Structural equality. Doubles and complex parts compare by bit
/// pattern so NA == NA and NaN == NaN; functions and promises compare
/// by identity of their prototype and environment.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) | (Value::Nil, Value::Nil) => true,
            (Value::Logical(a), Value::Logical(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Value::Complex(a), Value::Complex(b)) => {
                a.len() == b.len()
                    && a.iter().zip(b.iter()).all(|((xr, xi), (yr, yi))| {
                        xr.to_bits() == yr.to_bits() && xi.to_bits() == yi.to_bits()
                    })
            }
            (Value::Character(a), Value::Character(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => {
                Arc::ptr_eq(&a.proto, &b.proto) && a.env == b.env
            }
            (Value::Environment(a), Value::Environment(b)) => a == b,
            (Value::Promise(a), Value::Promise(b)) | (Value::Default(a), Value::Default(b)) => {
                Arc::ptr_eq(&a.proto, &b.proto) && a.env == b.env && a.slot == b.slot
            }
            (Value::Object(a), Value::Object(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn na_sentinels_are_distinct() {
        assert!(double_na().is_nan());
        assert!(is_double_na(double_na()));
        assert!(!is_double_na(f64::NAN));
        assert_eq!(INTEGER_NA, i64::MIN);
    }

    #[test]
    fn unify_follows_precedence() {
        assert_eq!(Ty::unify(Ty::Logical, Ty::Integer), Some(Ty::Integer));
        assert_eq!(Ty::unify(Ty::Integer, Ty::Double), Some(Ty::Double));
        assert_eq!(Ty::unify(Ty::Double, Ty::Complex), Some(Ty::Complex));
        assert_eq!(Ty::unify(Ty::Complex, Ty::Character), Some(Ty::Character));
        assert_eq!(Ty::unify(Ty::Character, Ty::List), Some(Ty::List));
        assert_eq!(Ty::unify(Ty::Null, Ty::Double), Some(Ty::Double));
        assert_eq!(Ty::unify(Ty::Double, Ty::Function), None);
    }

    #[test]
    fn cast_propagates_na() {
        let v = Value::integers(vec![1, INTEGER_NA, 3]);
        let d = v.cast_double().unwrap();
        assert_eq!(d[0], 1.0);
        assert!(is_double_na(d[1]));
        assert_eq!(d[2], 3.0);

        let l = Value::doubles(vec![0.0, double_na(), 2.0]);
        assert_eq!(l.cast_logical().unwrap(), vec![LOGICAL_FALSE, LOGICAL_NA, LOGICAL_TRUE]);
    }

    #[test]
    fn attribute_promotion_and_collapse() {
        let mut interner = Interner::new();
        let _ = &mut interner;
        let v = Value::integer(1).set_attr(Symbol::CLASS, Value::character(Symbol::EMPTY));
        assert!(v.is_object());
        assert_eq!(v.strip(), &Value::integer(1));
        let back = v.set_attr(Symbol::CLASS, Value::Null);
        assert!(!back.is_object());
        assert_eq!(back, Value::integer(1));
    }

    #[test]
    fn double_na_equals_itself_structurally() {
        assert_eq!(
            Value::doubles(vec![double_na()]),
            Value::doubles(vec![double_na()])
        );
        assert_ne!(Value::doubles(vec![double_na()]), Value::doubles(vec![f64::NAN]));
    }

    #[test]
    fn closure_safety() {
        assert!(Value::integer(1).is_closure_safe());
        assert!(!Value::Environment(EnvId(0)).is_closure_safe());
        assert!(!Value::list(vec![Value::integer(1), Value::Environment(EnvId(0))])
            .is_closure_safe());
    }

    proptest! {
        #[test]
        fn integer_double_round_trip(xs in proptest::collection::vec(-1_000_000i64..1_000_000, 0..32)) {
            let v = Value::integers(xs.clone());
            let d = Value::doubles(v.cast_double().unwrap());
            let back = d.cast_integer().unwrap();
            prop_assert_eq!(back, xs);
        }

        #[test]
        fn logical_cast_is_stable(xs in proptest::collection::vec(prop_oneof![Just(LOGICAL_TRUE), Just(LOGICAL_FALSE), Just(LOGICAL_NA)], 0..32)) {
            let v = Value::logicals(xs.clone());
            let i = Value::integers(v.cast_integer().unwrap());
            prop_assert_eq!(i.cast_logical().unwrap(), xs);
        }
    }
}
