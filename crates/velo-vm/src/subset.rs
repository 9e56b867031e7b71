//! Subsetting and subset assignment.
//!
//! Scalar fast paths live in the interpreter's `subset`/`subset2`
//! handlers; these are the generic vector-index paths and the
//! assignment forms.

use crate::arith::int_is_na;
use crate::thread::{VmError, VmResult};
use velo_core::interner::Symbol;
use velo_core::value::{double_na, Ty, Value, INTEGER_NA, LOGICAL_NA, LOGICAL_TRUE};

/// Element extraction for `[`: 0-based index, NA element when out of
/// bounds, the NA element of the vector's type when the index is NA.
pub fn element_or_na(a: &Value, index: Option<usize>) -> Value {
    match index {
        Some(i) if i < a.len() => a.element(i).unwrap_or(Value::Null),
        _ => na_element(a.ty()),
    }
}

fn na_element(ty: Ty) -> Value {
    match ty {
        Ty::Logical => Value::logical_na(),
        Ty::Integer => Value::integer(INTEGER_NA),
        Ty::Double => Value::double(double_na()),
        Ty::Complex => Value::complex((double_na(), double_na())),
        Ty::Character => Value::character(Symbol::NA),
        Ty::List => Value::Null,
        _ => Value::Null,
    }
}

/// Generic vector-index subset: positive selection, negative
/// exclusion, or a recycled logical mask.
pub fn subset_slow(a: &Value, index: &Value) -> VmResult<Value> {
    match index.strip() {
        Value::Logical(mask) => {
            let mut picks = Vec::new();
            if !mask.is_empty() {
                let n = a.len().max(mask.len());
                for i in 0..n {
                    match mask[i % mask.len()] {
                        LOGICAL_TRUE => picks.push(Some(i)),
                        LOGICAL_NA => picks.push(None),
                        _ => {}
                    }
                }
            }
            Ok(gather(a, &picks))
        }
        Value::Integer(_) | Value::Double(_) => {
            let idx = index
                .cast_integer()
                .map_err(|e| VmError::Type(e.to_string()))?;
            let has_pos = idx.iter().any(|&i| !int_is_na(i) && i > 0);
            let has_neg = idx.iter().any(|&i| !int_is_na(i) && i < 0);
            if has_pos && has_neg {
                return Err(VmError::Type(
                    "cannot mix positive and negative subscripts".to_string(),
                ));
            }
            if has_neg {
                let excluded: Vec<usize> = idx
                    .iter()
                    .filter(|&&i| !int_is_na(i) && i < 0)
                    .map(|&i| (-i - 1) as usize)
                    .collect();
                let picks: Vec<Option<usize>> = (0..a.len())
                    .filter(|i| !excluded.contains(i))
                    .map(Some)
                    .collect();
                Ok(gather(a, &picks))
            } else {
                let picks: Vec<Option<usize>> = idx
                    .iter()
                    .filter(|&&i| int_is_na(i) || i != 0)
                    .map(|&i| {
                        if int_is_na(i) {
                            None
                        } else {
                            Some((i - 1) as usize)
                        }
                    })
                    .collect();
                Ok(gather(a, &picks))
            }
        }
        other => Err(VmError::Type(format!(
            "invalid subscript type {}",
            other.ty().name()
        ))),
    }
}

/// Select elements; None or out-of-range picks produce NA elements.
fn gather(a: &Value, picks: &[Option<usize>]) -> Value {
    macro_rules! pick {
        ($v:expr, $na:expr) => {
            picks
                .iter()
                .map(|p| match p {
                    Some(i) if *i < $v.len() => $v[*i].clone(),
                    _ => $na,
                })
                .collect()
        };
    }
    match a {
        Value::Logical(v) => Value::logicals(pick!(v, LOGICAL_NA)),
        Value::Integer(v) => Value::integers(pick!(v, INTEGER_NA)),
        Value::Double(v) => Value::doubles(pick!(v, double_na())),
        Value::Complex(v) => Value::complexes(pick!(v, (double_na(), double_na()))),
        Value::Character(v) => Value::characters(pick!(v, Symbol::NA)),
        Value::List(v) => Value::list(pick!(v, Value::Null)),
        _ => Value::Null,
    }
}

/// `x[i] <- v`. The destination is promoted to the unified element
/// type; assigning past the end extends with NA fill.
pub fn subset_assign(dest: &Value, index: &Value, value: &Value) -> VmResult<Value> {
    let positions = assign_positions(dest, index)?;
    let ty = Ty::unify(dest.strip().ty(), value.strip().ty())
        .ok_or_else(|| VmError::Type("incompatible types in subset assignment".to_string()))?;
    if matches!(ty, Ty::List) {
        return assign_list(dest, &positions, value);
    }
    let needed = positions.iter().copied().max().map(|m| m + 1).unwrap_or(0);

    macro_rules! assign {
        ($cast:ident, $ctor:ident, $na:expr) => {{
            let mut out = dest.$cast().map_err(|e| VmError::Type(e.to_string()))?;
            let vals = value.$cast().map_err(|e| VmError::Type(e.to_string()))?;
            if vals.is_empty() && !positions.is_empty() {
                return Err(VmError::Type("replacement has length zero".to_string()));
            }
            if out.len() < needed {
                out.resize(needed, $na);
            }
            for (k, &p) in positions.iter().enumerate() {
                out[p] = vals[k % vals.len()].clone();
            }
            Ok(Value::$ctor(out))
        }};
    }
    match ty {
        Ty::Logical => assign!(cast_logical, logicals, LOGICAL_NA),
        Ty::Integer => assign!(cast_integer, integers, INTEGER_NA),
        Ty::Double => assign!(cast_double, doubles, double_na()),
        Ty::Complex => assign!(cast_complex, complexes, (double_na(), double_na())),
        Ty::Character => match (dest.strip(), value.strip()) {
            (Value::Character(d), Value::Character(v)) => {
                let mut out = d.as_ref().clone();
                if v.is_empty() && !positions.is_empty() {
                    return Err(VmError::Type("replacement has length zero".to_string()));
                }
                if out.len() < needed {
                    out.resize(needed, Symbol::NA);
                }
                for (k, &p) in positions.iter().enumerate() {
                    out[p] = v[k % v.len()];
                }
                Ok(Value::characters(out))
            }
            _ => Err(VmError::Type(
                "incompatible types in subset assignment".to_string(),
            )),
        },
        _ => Err(VmError::Type(format!(
            "cannot subset-assign into {}",
            ty.name()
        ))),
    }
}

fn assign_list(dest: &Value, positions: &[usize], value: &Value) -> VmResult<Value> {
    let mut out = match dest.strip().cast_to(Ty::List) {
        Ok(Value::List(v)) => v.as_ref().clone(),
        _ => return Err(VmError::Type("cannot coerce destination to list".to_string())),
    };
    let vals = match value.strip() {
        Value::List(v) => v.as_ref().clone(),
        v => vec![v.clone()],
    };
    if vals.is_empty() && !positions.is_empty() {
        return Err(VmError::Type("replacement has length zero".to_string()));
    }
    let needed = positions.iter().copied().max().map(|m| m + 1).unwrap_or(0);
    if out.len() < needed {
        out.resize(needed, Value::Null);
    }
    for (k, &p) in positions.iter().enumerate() {
        out[p] = vals[k % vals.len()].clone();
    }
    Ok(Value::list(out))
}

/// Resolve an assignment index to 0-based positions.
fn assign_positions(dest: &Value, index: &Value) -> VmResult<Vec<usize>> {
    match index.strip() {
        Value::Logical(mask) => {
            let mut out = Vec::new();
            if !mask.is_empty() {
                let n = dest.len().max(mask.len());
                for i in 0..n {
                    match mask[i % mask.len()] {
                        LOGICAL_TRUE => out.push(i),
                        LOGICAL_NA => {
                            return Err(VmError::Type("NAs are not allowed in subscripted assignments".to_string()))
                        }
                        _ => {}
                    }
                }
            }
            Ok(out)
        }
        Value::Integer(_) | Value::Double(_) => {
            let idx = index
                .cast_integer()
                .map_err(|e| VmError::Type(e.to_string()))?;
            let mut out = Vec::new();
            for i in idx {
                if int_is_na(i) {
                    return Err(VmError::Type(
                        "NAs are not allowed in subscripted assignments".to_string(),
                    ));
                }
                if i == 0 {
                    continue;
                }
                if i < 0 {
                    return Err(VmError::Type(
                        "negative subscripts are not allowed in assignments".to_string(),
                    ));
                }
                out.push((i - 1) as usize);
            }
            Ok(out)
        }
        other => Err(VmError::Type(format!(
            "invalid subscript type {}",
            other.ty().name()
        ))),
    }
}

/// `x[[i]] <- v`: single strict position, list elements hold any value.
pub fn subset2_assign(dest: &Value, index: &Value, value: &Value) -> VmResult<Value> {
    let i = scalar_index(index)?;
    match dest.strip() {
        Value::List(v) => {
            let mut out = v.as_ref().clone();
            if i >= out.len() {
                out.resize(i + 1, Value::Null);
            }
            out[i] = value.clone();
            Ok(Value::list(out))
        }
        _ => subset_assign(dest, &Value::integer(i as i64 + 1), value),
    }
}

/// `[[` index: exactly one element, in bounds for reads.
pub fn scalar_index(index: &Value) -> VmResult<usize> {
    if index.len() != 1 {
        return Err(VmError::Type(
            "attempt to select less or more than 1 element".to_string(),
        ));
    }
    let i = match index.strip() {
        Value::Integer(v) => v[0],
        Value::Double(v) => {
            if v[0].is_nan() {
                INTEGER_NA
            } else {
                v[0] as i64
            }
        }
        Value::Logical(v) if v[0] == LOGICAL_TRUE => 1,
        _ => return Err(VmError::OutOfBounds),
    };
    if int_is_na(i) || i < 1 {
        return Err(VmError::OutOfBounds);
    }
    Ok((i - 1) as usize)
}

/// `x$name` on a names-attributed list.
pub fn dollar(a: &Value, name: Symbol) -> Value {
    let names = match a.get_attr(Symbol::NAMES) {
        Some(Value::Character(names)) => names.clone(),
        _ => return Value::Null,
    };
    let base = a.strip();
    match names.iter().position(|&n| n == name) {
        Some(i) => base.element(i).unwrap_or(Value::Null),
        None => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_vector_index_with_na() {
        let x = Value::integers(vec![10, 20, 30]);
        let r = subset_slow(&x, &Value::integers(vec![3, 1, INTEGER_NA, 5])).unwrap();
        assert_eq!(r, Value::integers(vec![30, 10, INTEGER_NA, INTEGER_NA]));
    }

    #[test]
    fn negative_index_excludes() {
        let x = Value::integers(vec![10, 20, 30]);
        let r = subset_slow(&x, &Value::integers(vec![-2])).unwrap();
        assert_eq!(r, Value::integers(vec![10, 30]));
    }

    #[test]
    fn logical_mask_recycles() {
        let x = Value::integers(vec![1, 2, 3, 4]);
        let r = subset_slow(&x, &Value::logicals(vec![LOGICAL_TRUE, 0])).unwrap();
        assert_eq!(r, Value::integers(vec![1, 3]));
    }

    #[test]
    fn mixing_signs_errors() {
        let x = Value::integers(vec![1, 2, 3]);
        assert!(subset_slow(&x, &Value::integers(vec![1, -1])).is_err());
    }

    #[test]
    fn assignment_promotes_type() {
        let x = Value::integers(vec![1, 2, 3]);
        let r = subset_assign(&x, &Value::integer(2), &Value::double(9.5)).unwrap();
        assert_eq!(r, Value::doubles(vec![1.0, 9.5, 3.0]));
    }

    #[test]
    fn assignment_past_end_extends_with_na() {
        let x = Value::integers(vec![1]);
        let r = subset_assign(&x, &Value::integer(3), &Value::integer(7)).unwrap();
        assert_eq!(r, Value::integers(vec![1, INTEGER_NA, 7]));
    }

    #[test]
    fn subset2_assign_into_list_keeps_element() {
        let x = Value::list(vec![Value::integer(1)]);
        let r = subset2_assign(&x, &Value::integer(2), &Value::doubles(vec![1.0, 2.0])).unwrap();
        match r {
            Value::List(v) => assert_eq!(v[1], Value::doubles(vec![1.0, 2.0])),
            _ => panic!("expected list"),
        }
    }

    #[test]
    fn dollar_looks_up_names() {
        let base = Value::list(vec![Value::integer(1), Value::integer(2)]);
        let names = Value::characters(vec![Symbol(100), Symbol(101)]);
        let obj = base.set_attr(Symbol::NAMES, names);
        assert_eq!(dollar(&obj, Symbol(101)), Value::integer(2));
        assert_eq!(dollar(&obj, Symbol(99)), Value::Null);
    }
}
