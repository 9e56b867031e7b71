//! Vectorized arithmetic, comparison, and fold kernels with NA
//! propagation and recycling.
//!
//! The interpreter dispatches every combination of element types
//! through these entry points; inside a trace the same operations
//! collapse to a single typed kernel per op after casts, so the tile
//! executor carries its own lane-wise copies.

use crate::thread::{VmError, VmResult};
use velo_core::bc::ByteCode;
use velo_core::interner::Interner;
use velo_core::value::{
    double_na, Complex, Ty, Value, INTEGER_NA, LOGICAL_FALSE, LOGICAL_NA, LOGICAL_TRUE,
};

#[inline]
pub fn int_is_na(x: i64) -> bool {
    x == INTEGER_NA
}

#[inline]
fn log_to_bool(x: u8) -> Option<bool> {
    match x {
        LOGICAL_TRUE => Some(true),
        LOGICAL_FALSE => Some(false),
        _ => None,
    }
}

#[inline]
fn bool_to_log(b: bool) -> u8 {
    if b {
        LOGICAL_TRUE
    } else {
        LOGICAL_FALSE
    }
}

/// Recycle two slices to the longer length. A zero-length operand
/// yields a zero-length result.
fn map2<T: Copy, U: Copy, R>(a: &[T], b: &[U], f: impl Fn(T, U) -> R) -> Vec<R> {
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }
    let n = a.len().max(b.len());
    (0..n).map(|i| f(a[i % a.len()], b[i % b.len()])).collect()
}

fn type_error(op: ByteCode, a: &Value, b: Option<&Value>) -> VmError {
    match b {
        Some(b) => VmError::Type(format!(
            "invalid operand types for '{}': {} and {}",
            op.name(),
            a.ty().name(),
            b.ty().name()
        )),
        None => VmError::Type(format!(
            "invalid operand type for '{}': {}",
            op.name(),
            a.ty().name()
        )),
    }
}

// === Scalar element kernels ===

#[inline]
pub fn iadd(x: i64, y: i64) -> i64 {
    if int_is_na(x) || int_is_na(y) {
        INTEGER_NA
    } else {
        x.wrapping_add(y)
    }
}

#[inline]
pub fn isub(x: i64, y: i64) -> i64 {
    if int_is_na(x) || int_is_na(y) {
        INTEGER_NA
    } else {
        x.wrapping_sub(y)
    }
}

#[inline]
pub fn imul(x: i64, y: i64) -> i64 {
    if int_is_na(x) || int_is_na(y) {
        INTEGER_NA
    } else {
        x.wrapping_mul(y)
    }
}

/// Integer modulo with the sign of the divisor; `%% 0` is NA.
#[inline]
pub fn imod(x: i64, y: i64) -> i64 {
    if int_is_na(x) || int_is_na(y) || y == 0 {
        return INTEGER_NA;
    }
    let r = x.wrapping_rem(y);
    if r != 0 && (r < 0) != (y < 0) {
        r + y
    } else {
        r
    }
}

/// Double modulo: `x - floor(x/y)*y`.
#[inline]
pub fn dmod(x: f64, y: f64) -> f64 {
    x - (x / y).floor() * y
}

pub fn icmp_op(op: ByteCode, x: i64, y: i64) -> u8 {
    if int_is_na(x) || int_is_na(y) {
        return LOGICAL_NA;
    }
    bool_to_log(match op {
        ByteCode::Eq => x == y,
        ByteCode::Neq => x != y,
        ByteCode::Lt => x < y,
        ByteCode::Le => x <= y,
        ByteCode::Gt => x > y,
        _ => x >= y,
    })
}

pub fn dcmp_op(op: ByteCode, x: f64, y: f64) -> u8 {
    if x.is_nan() || y.is_nan() {
        return LOGICAL_NA;
    }
    bool_to_log(match op {
        ByteCode::Eq => x == y,
        ByteCode::Neq => x != y,
        ByteCode::Lt => x < y,
        ByteCode::Le => x <= y,
        ByteCode::Gt => x > y,
        _ => x >= y,
    })
}

/// Three-valued logical and.
#[inline]
pub fn land(x: u8, y: u8) -> u8 {
    match (log_to_bool(x), log_to_bool(y)) {
        (Some(false), _) | (_, Some(false)) => LOGICAL_FALSE,
        (Some(true), Some(true)) => LOGICAL_TRUE,
        _ => LOGICAL_NA,
    }
}

/// Three-valued logical or.
#[inline]
pub fn lor(x: u8, y: u8) -> u8 {
    match (log_to_bool(x), log_to_bool(y)) {
        (Some(true), _) | (_, Some(true)) => LOGICAL_TRUE,
        (Some(false), Some(false)) => LOGICAL_FALSE,
        _ => LOGICAL_NA,
    }
}

fn cadd(x: Complex, y: Complex) -> Complex {
    (x.0 + y.0, x.1 + y.1)
}

fn csub(x: Complex, y: Complex) -> Complex {
    (x.0 - y.0, x.1 - y.1)
}

fn cmul(x: Complex, y: Complex) -> Complex {
    (x.0 * y.0 - x.1 * y.1, x.0 * y.1 + x.1 * y.0)
}

fn cdiv(x: Complex, y: Complex) -> Complex {
    let d = y.0 * y.0 + y.1 * y.1;
    ((x.0 * y.0 + x.1 * y.1) / d, (x.1 * y.0 - x.0 * y.1) / d)
}

// === Binary dispatch ===

/// Binary arithmetic / comparison / logical op with recycling.
pub fn binary(op: ByteCode, a: &Value, b: &Value, interner: &Interner) -> VmResult<Value> {
    let a = a.strip();
    let b = b.strip();
    let ty = Ty::unify(a.ty(), b.ty()).ok_or_else(|| type_error(op, a, Some(b)))?;

    match op {
        ByteCode::And | ByteCode::Or => {
            let x = a.cast_logical().map_err(|_| type_error(op, a, Some(b)))?;
            let y = b.cast_logical().map_err(|_| type_error(op, a, Some(b)))?;
            let f = if op == ByteCode::And { land } else { lor };
            Ok(Value::logicals(map2(&x, &y, f)))
        }
        ByteCode::Add | ByteCode::Sub | ByteCode::Mul => match ty {
            Ty::Null => Ok(Value::integers(Vec::new())),
            Ty::Logical | Ty::Integer => {
                let x = a.cast_integer().map_err(|_| type_error(op, a, Some(b)))?;
                let y = b.cast_integer().map_err(|_| type_error(op, a, Some(b)))?;
                let f = match op {
                    ByteCode::Add => iadd,
                    ByteCode::Sub => isub,
                    _ => imul,
                };
                Ok(Value::integers(map2(&x, &y, f)))
            }
            Ty::Double => {
                let x = a.cast_double().map_err(|_| type_error(op, a, Some(b)))?;
                let y = b.cast_double().map_err(|_| type_error(op, a, Some(b)))?;
                let f = match op {
                    ByteCode::Add => |x: f64, y: f64| x + y,
                    ByteCode::Sub => |x: f64, y: f64| x - y,
                    _ => |x: f64, y: f64| x * y,
                };
                Ok(Value::doubles(map2(&x, &y, f)))
            }
            Ty::Complex => {
                let x = a.cast_complex().map_err(|_| type_error(op, a, Some(b)))?;
                let y = b.cast_complex().map_err(|_| type_error(op, a, Some(b)))?;
                let f = match op {
                    ByteCode::Add => cadd,
                    ByteCode::Sub => csub,
                    _ => cmul,
                };
                Ok(Value::complexes(map2(&x, &y, f)))
            }
            _ => Err(type_error(op, a, Some(b))),
        },
        ByteCode::Div => match ty {
            Ty::Complex => {
                let x = a.cast_complex().map_err(|_| type_error(op, a, Some(b)))?;
                let y = b.cast_complex().map_err(|_| type_error(op, a, Some(b)))?;
                Ok(Value::complexes(map2(&x, &y, cdiv)))
            }
            Ty::Null | Ty::Logical | Ty::Integer | Ty::Double => {
                let x = a.cast_double().map_err(|_| type_error(op, a, Some(b)))?;
                let y = b.cast_double().map_err(|_| type_error(op, a, Some(b)))?;
                Ok(Value::doubles(map2(&x, &y, |x, y| x / y)))
            }
            _ => Err(type_error(op, a, Some(b))),
        },
        ByteCode::Mod => match ty {
            Ty::Null | Ty::Logical | Ty::Integer => {
                let x = a.cast_integer().map_err(|_| type_error(op, a, Some(b)))?;
                let y = b.cast_integer().map_err(|_| type_error(op, a, Some(b)))?;
                Ok(Value::integers(map2(&x, &y, imod)))
            }
            Ty::Double => {
                let x = a.cast_double().map_err(|_| type_error(op, a, Some(b)))?;
                let y = b.cast_double().map_err(|_| type_error(op, a, Some(b)))?;
                Ok(Value::doubles(map2(&x, &y, dmod)))
            }
            _ => Err(type_error(op, a, Some(b))),
        },
        ByteCode::Pow => {
            let x = a.cast_double().map_err(|_| type_error(op, a, Some(b)))?;
            let y = b.cast_double().map_err(|_| type_error(op, a, Some(b)))?;
            Ok(Value::doubles(map2(&x, &y, f64::powf)))
        }
        ByteCode::Eq | ByteCode::Neq | ByteCode::Lt | ByteCode::Le | ByteCode::Gt | ByteCode::Ge => {
            compare(op, a, b, ty, interner)
        }
        _ => Err(VmError::Internal(format!("'{}' is not a binary op", op.name()))),
    }
}

fn compare(op: ByteCode, a: &Value, b: &Value, ty: Ty, interner: &Interner) -> VmResult<Value> {
    match ty {
        Ty::Null => Ok(Value::logicals(Vec::new())),
        Ty::Logical | Ty::Integer => {
            let x = a.cast_integer().map_err(|_| type_error(op, a, Some(b)))?;
            let y = b.cast_integer().map_err(|_| type_error(op, a, Some(b)))?;
            Ok(Value::logicals(map2(&x, &y, |x, y| icmp_op(op, x, y))))
        }
        Ty::Double => {
            let x = a.cast_double().map_err(|_| type_error(op, a, Some(b)))?;
            let y = b.cast_double().map_err(|_| type_error(op, a, Some(b)))?;
            Ok(Value::logicals(map2(&x, &y, |x, y| dcmp_op(op, x, y))))
        }
        Ty::Complex => {
            if !matches!(op, ByteCode::Eq | ByteCode::Neq) {
                return Err(type_error(op, a, Some(b)));
            }
            let x = a.cast_complex().map_err(|_| type_error(op, a, Some(b)))?;
            let y = b.cast_complex().map_err(|_| type_error(op, a, Some(b)))?;
            Ok(Value::logicals(map2(&x, &y, |x, y| {
                if x.0.is_nan() || x.1.is_nan() || y.0.is_nan() || y.1.is_nan() {
                    LOGICAL_NA
                } else {
                    bool_to_log((x == y) == (op == ByteCode::Eq))
                }
            })))
        }
        Ty::Character => {
            let (Value::Character(x), Value::Character(y)) = (a, b) else {
                return Err(type_error(op, a, Some(b)));
            };
            Ok(Value::logicals(map2(x, y, |x, y| {
                if x == velo_core::interner::Symbol::NA || y == velo_core::interner::Symbol::NA {
                    return LOGICAL_NA;
                }
                let (xs, ys) = (interner.resolve(x), interner.resolve(y));
                bool_to_log(match op {
                    ByteCode::Eq => xs == ys,
                    ByteCode::Neq => xs != ys,
                    ByteCode::Lt => xs < ys,
                    ByteCode::Le => xs <= ys,
                    ByteCode::Gt => xs > ys,
                    _ => xs >= ys,
                })
            })))
        }
        _ => Err(type_error(op, a, Some(b))),
    }
}

// === Unary dispatch ===

pub fn unary(op: ByteCode, a: &Value) -> VmResult<Value> {
    let a = a.strip();
    match op {
        ByteCode::Neg => match a {
            Value::Logical(_) | Value::Integer(_) => {
                let x = a.cast_integer().map_err(|_| type_error(op, a, None))?;
                Ok(Value::integers(
                    x.into_iter()
                        .map(|x| if int_is_na(x) { x } else { x.wrapping_neg() })
                        .collect(),
                ))
            }
            Value::Double(v) => Ok(Value::doubles(v.iter().map(|x| -x).collect())),
            Value::Complex(v) => Ok(Value::complexes(v.iter().map(|(r, i)| (-r, -i)).collect())),
            _ => Err(type_error(op, a, None)),
        },
        ByteCode::Not => {
            let x = a.cast_logical().map_err(|_| type_error(op, a, None))?;
            Ok(Value::logicals(
                x.into_iter()
                    .map(|x| match log_to_bool(x) {
                        Some(b) => bool_to_log(!b),
                        None => LOGICAL_NA,
                    })
                    .collect(),
            ))
        }
        ByteCode::IsNa => match a {
            Value::Logical(v) => Ok(Value::logicals(
                v.iter().map(|&x| bool_to_log(x == LOGICAL_NA)).collect(),
            )),
            Value::Integer(v) => Ok(Value::logicals(
                v.iter().map(|&x| bool_to_log(int_is_na(x))).collect(),
            )),
            // both NA and NaN count as missing
            Value::Double(v) => Ok(Value::logicals(
                v.iter().map(|&x| bool_to_log(x.is_nan())).collect(),
            )),
            Value::Complex(v) => Ok(Value::logicals(
                v.iter()
                    .map(|&(r, i)| bool_to_log(r.is_nan() || i.is_nan()))
                    .collect(),
            )),
            Value::Character(v) => Ok(Value::logicals(
                v.iter()
                    .map(|&s| bool_to_log(s == velo_core::interner::Symbol::NA))
                    .collect(),
            )),
            Value::Null => Ok(Value::logicals(Vec::new())),
            _ => Err(type_error(op, a, None)),
        },
        ByteCode::IsFinite => {
            let x = a.cast_double().map_err(|_| type_error(op, a, None))?;
            Ok(Value::logicals(
                x.into_iter().map(|x| bool_to_log(x.is_finite())).collect(),
            ))
        }
        ByteCode::Abs => match a {
            Value::Logical(_) | Value::Integer(_) => {
                let x = a.cast_integer().map_err(|_| type_error(op, a, None))?;
                Ok(Value::integers(
                    x.into_iter()
                        .map(|x| if int_is_na(x) { x } else { x.wrapping_abs() })
                        .collect(),
                ))
            }
            _ => {
                let x = a.cast_double().map_err(|_| type_error(op, a, None))?;
                Ok(Value::doubles(x.into_iter().map(f64::abs).collect()))
            }
        },
        ByteCode::Sqrt | ByteCode::Exp | ByteCode::Log | ByteCode::Floor | ByteCode::Ceiling => {
            let x = a.cast_double().map_err(|_| type_error(op, a, None))?;
            let f = match op {
                ByteCode::Sqrt => f64::sqrt,
                ByteCode::Exp => f64::exp,
                ByteCode::Log => f64::ln,
                ByteCode::Floor => f64::floor,
                _ => f64::ceil,
            };
            Ok(Value::doubles(x.into_iter().map(f).collect()))
        }
        _ => Err(VmError::Internal(format!("'{}' is not a unary op", op.name()))),
    }
}

// === Folds and scans ===

pub fn fold(op: ByteCode, a: &Value) -> VmResult<Value> {
    let a = a.strip();
    match op {
        ByteCode::Sum => match a {
            Value::Logical(_) | Value::Integer(_) | Value::Null => {
                let x = a.cast_integer().map_err(|_| type_error(op, a, None))?;
                Ok(Value::integer(x.into_iter().fold(0i64, iadd)))
            }
            Value::Double(v) => Ok(Value::double(v.iter().sum())),
            Value::Complex(v) => Ok(Value::complex(
                v.iter().fold((0.0, 0.0), |acc, &x| cadd(acc, x)),
            )),
            _ => Err(type_error(op, a, None)),
        },
        ByteCode::Prod => match a {
            Value::Complex(v) => Ok(Value::complex(
                v.iter().fold((1.0, 0.0), |acc, &x| cmul(acc, x)),
            )),
            _ => {
                let x = a.cast_double().map_err(|_| type_error(op, a, None))?;
                Ok(Value::double(x.into_iter().product()))
            }
        },
        ByteCode::Min | ByteCode::Max => match a {
            Value::Logical(_) | Value::Integer(_) => {
                let x = a.cast_integer().map_err(|_| type_error(op, a, None))?;
                let base = if op == ByteCode::Min { i64::MAX } else { i64::MIN + 1 };
                Ok(Value::integer(x.into_iter().fold(base, |acc, v| {
                    if int_is_na(v) {
                        INTEGER_NA
                    } else if int_is_na(acc) {
                        acc
                    } else if (op == ByteCode::Min) == (v < acc) {
                        v
                    } else {
                        acc
                    }
                })))
            }
            _ => {
                let x = a.cast_double().map_err(|_| type_error(op, a, None))?;
                let base = if op == ByteCode::Min {
                    f64::INFINITY
                } else {
                    f64::NEG_INFINITY
                };
                Ok(Value::double(x.into_iter().fold(base, |acc, v| {
                    if v.is_nan() || acc.is_nan() {
                        double_na()
                    } else if (op == ByteCode::Min) == (v < acc) {
                        v
                    } else {
                        acc
                    }
                })))
            }
        },
        ByteCode::Any | ByteCode::All => {
            let x = a.cast_logical().map_err(|_| type_error(op, a, None))?;
            let mut acc = bool_to_log(op == ByteCode::All);
            for v in x {
                acc = if op == ByteCode::Any { lor(acc, v) } else { land(acc, v) };
            }
            Ok(Value::logicals(vec![acc]))
        }
        ByteCode::CumSum => match a {
            Value::Logical(_) | Value::Integer(_) | Value::Null => {
                let x = a.cast_integer().map_err(|_| type_error(op, a, None))?;
                let mut acc = 0i64;
                Ok(Value::integers(
                    x.into_iter()
                        .map(|v| {
                            acc = iadd(acc, v);
                            acc
                        })
                        .collect(),
                ))
            }
            _ => {
                let x = a.cast_double().map_err(|_| type_error(op, a, None))?;
                let mut acc = 0.0f64;
                Ok(Value::doubles(
                    x.into_iter()
                        .map(|v| {
                            acc += v;
                            acc
                        })
                        .collect(),
                ))
            }
        },
        _ => Err(VmError::Internal(format!("'{}' is not a fold", op.name()))),
    }
}

/// Element-wise conditional with recycling.
pub fn ifelse(cond: &Value, yes: &Value, no: &Value) -> VmResult<Value> {
    let mask = cond
        .cast_logical()
        .map_err(|_| VmError::Type("ifelse condition must be logical".to_string()))?;
    let ty = Ty::unify(yes.strip().ty(), no.strip().ty())
        .ok_or_else(|| VmError::Type("incompatible ifelse branches".to_string()))?;
    if mask.is_empty() || yes.is_empty() || no.is_empty() {
        return Ok(Value::empty(ty));
    }
    let n = mask.len().max(yes.len()).max(no.len());
    match ty {
        Ty::Logical | Ty::Null => {
            let y = yes.cast_logical().map_err(|e| VmError::Type(e.to_string()))?;
            let nn = no.cast_logical().map_err(|e| VmError::Type(e.to_string()))?;
            Ok(Value::logicals(select(n, &mask, &y, &nn, LOGICAL_NA)))
        }
        Ty::Integer => {
            let y = yes.cast_integer().map_err(|e| VmError::Type(e.to_string()))?;
            let nn = no.cast_integer().map_err(|e| VmError::Type(e.to_string()))?;
            Ok(Value::integers(select(n, &mask, &y, &nn, INTEGER_NA)))
        }
        Ty::Double => {
            let y = yes.cast_double().map_err(|e| VmError::Type(e.to_string()))?;
            let nn = no.cast_double().map_err(|e| VmError::Type(e.to_string()))?;
            Ok(Value::doubles(select(n, &mask, &y, &nn, double_na())))
        }
        _ => Err(VmError::Type(format!(
            "ifelse is not defined for {} branches",
            ty.name()
        ))),
    }
}

fn select<T: Copy>(n: usize, mask: &[u8], yes: &[T], no: &[T], na: T) -> Vec<T> {
    (0..n)
        .map(|i| match log_to_bool(mask[i % mask.len()]) {
            Some(true) => yes[i % yes.len()],
            Some(false) => no[i % no.len()],
            None => na,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycling_shorter_operand() {
        let interner = Interner::new();
        let x = Value::integers(vec![1, 2, 3, 4]);
        let y = Value::integers(vec![10, 20]);
        let r = binary(ByteCode::Add, &x, &y, &interner).unwrap();
        assert_eq!(r, Value::integers(vec![11, 22, 13, 24]));
    }

    #[test]
    fn zero_length_operand_yields_zero_length() {
        let interner = Interner::new();
        let x = Value::integers(vec![1, 2, 3]);
        let y = Value::integers(Vec::new());
        let r = binary(ByteCode::Add, &x, &y, &interner).unwrap();
        assert_eq!(r.len(), 0);
        assert_eq!(r.ty(), Ty::Integer);
    }

    #[test]
    fn na_propagates_through_arith() {
        let interner = Interner::new();
        let x = Value::integers(vec![1, INTEGER_NA]);
        let r = binary(ByteCode::Add, &x, &Value::integer(1), &interner).unwrap();
        assert_eq!(r, Value::integers(vec![2, INTEGER_NA]));

        let d = binary(
            ByteCode::Mul,
            &Value::doubles(vec![double_na()]),
            &Value::double(2.0),
            &interner,
        )
        .unwrap();
        assert!(d.cast_double().unwrap()[0].is_nan());
    }

    #[test]
    fn comparison_with_na_is_logical_na() {
        let interner = Interner::new();
        let r = binary(
            ByteCode::Lt,
            &Value::integers(vec![1, INTEGER_NA]),
            &Value::integer(2),
            &interner,
        )
        .unwrap();
        assert_eq!(r, Value::logicals(vec![LOGICAL_TRUE, LOGICAL_NA]));
    }

    #[test]
    fn integer_division_produces_double() {
        let interner = Interner::new();
        let r = binary(ByteCode::Div, &Value::integer(7), &Value::integer(2), &interner).unwrap();
        assert_eq!(r, Value::double(3.5));
    }

    #[test]
    fn three_valued_logic() {
        assert_eq!(land(LOGICAL_NA, LOGICAL_FALSE), LOGICAL_FALSE);
        assert_eq!(land(LOGICAL_NA, LOGICAL_TRUE), LOGICAL_NA);
        assert_eq!(lor(LOGICAL_NA, LOGICAL_TRUE), LOGICAL_TRUE);
        assert_eq!(lor(LOGICAL_NA, LOGICAL_FALSE), LOGICAL_NA);
    }

    #[test]
    fn fold_bases_on_empty_input() {
        assert_eq!(fold(ByteCode::Sum, &Value::integers(vec![])).unwrap(), Value::integer(0));
        assert_eq!(fold(ByteCode::Prod, &Value::doubles(vec![])).unwrap(), Value::double(1.0));
        assert_eq!(
            fold(ByteCode::Any, &Value::logicals(vec![])).unwrap(),
            Value::logical(false)
        );
        assert_eq!(
            fold(ByteCode::All, &Value::logicals(vec![])).unwrap(),
            Value::logical(true)
        );
    }

    #[test]
    fn is_na_identifies_na_and_nan() {
        let v = Value::doubles(vec![1.0, double_na(), f64::NAN]);
        let r = unary(ByteCode::IsNa, &v).unwrap();
        assert_eq!(
            r,
            Value::logicals(vec![LOGICAL_FALSE, LOGICAL_TRUE, LOGICAL_TRUE])
        );
    }

    #[test]
    fn ifelse_recycles_and_handles_na() {
        let cond = Value::logicals(vec![LOGICAL_TRUE, LOGICAL_FALSE, LOGICAL_NA]);
        let r = ifelse(&cond, &Value::integer(1), &Value::integer(0)).unwrap();
        assert_eq!(r, Value::integers(vec![1, 0, INTEGER_NA]));
    }

    #[test]
    fn sum_of_first_n() {
        let v = Value::integers((1..=100).collect());
        assert_eq!(fold(ByteCode::Sum, &v).unwrap(), Value::integer(5050));
    }
}
