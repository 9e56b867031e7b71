//! Internal builtin functions.
//!
//! Builtin ABI: `(thread, args) -> result`. Arguments arrive in
//! consecutive registers, already evaluated by the compiler; a builtin
//! that needs lazy semantics can still receive promises through dots
//! and force them with `Thread::force`. The table order must match
//! `velo_core::bc::INTERNALS`.

use crate::thread::{Thread, VmError, VmResult};
use std::io::Write;
use velo_core::bc::INTERNALS;
use velo_core::interner::Symbol;
use velo_core::value::{Ty, Value};

pub type BuiltinFn = fn(&mut Thread, &[Value]) -> VmResult<Value>;

pub struct Builtin {
    pub name: &'static str,
    pub func: BuiltinFn,
}

/// Build the builtin table in `INTERNALS` order.
pub fn table() -> Vec<Builtin> {
    let table = vec![
        Builtin { name: "c", func: concat },
        Builtin { name: "cat", func: cat },
        Builtin { name: "stop", func: stop },
        Builtin { name: "list", func: list },
        Builtin { name: "rm", func: rm },
        Builtin { name: "nchar", func: nchar },
    ];
    debug_assert_eq!(
        table.iter().map(|b| b.name).collect::<Vec<_>>(),
        INTERNALS.to_vec()
    );
    table
}

/// Concatenate vectors under the coercion lattice. Null arguments
/// vanish; an empty call is Null.
fn concat(thread: &mut Thread, args: &[Value]) -> VmResult<Value> {
    let mut ty = Ty::Null;
    for a in args {
        let forced = thread.force(a.clone())?;
        ty = Ty::unify(ty, forced.strip().ty()).ok_or_else(|| {
            VmError::Type(format!("cannot combine {} values", forced.ty().name()))
        })?;
    }
    if ty == Ty::Null {
        return Ok(Value::Null);
    }
    let mut out = Value::empty(ty);
    for a in args {
        let forced = thread.force(a.clone())?;
        out = concat_append(thread, out, &forced)?;
    }
    Ok(out)
}

fn concat_append(thread: &mut Thread, acc: Value, v: &Value) -> VmResult<Value> {
    use std::sync::Arc;
    let err = |t: Ty| VmError::Type(format!("cannot combine {} values", t.name()));
    Ok(match acc {
        Value::Logical(mut a) => {
            Arc::make_mut(&mut a).extend(v.cast_logical().map_err(|_| err(v.ty()))?);
            Value::Logical(a)
        }
        Value::Integer(mut a) => {
            Arc::make_mut(&mut a).extend(v.cast_integer().map_err(|_| err(v.ty()))?);
            Value::Integer(a)
        }
        Value::Double(mut a) => {
            Arc::make_mut(&mut a).extend(v.cast_double().map_err(|_| err(v.ty()))?);
            Value::Double(a)
        }
        Value::Complex(mut a) => {
            Arc::make_mut(&mut a).extend(v.cast_complex().map_err(|_| err(v.ty()))?);
            Value::Complex(a)
        }
        Value::Character(mut a) => {
            let chars = v
                .cast_character(&mut thread.interner)
                .map_err(|_| err(v.ty()))?;
            Arc::make_mut(&mut a).extend(chars);
            Value::Character(a)
        }
        Value::List(mut a) => {
            match v.strip().cast_to(Ty::List).map_err(|_| err(v.ty()))? {
                Value::List(b) => Arc::make_mut(&mut a).extend(b.iter().cloned()),
                _ => return Err(err(v.ty())),
            }
            Value::List(a)
        }
        other => return Err(err(other.ty())),
    })
}

/// Print arguments to stdout separated by spaces. Returns Null.
fn cat(thread: &mut Thread, args: &[Value]) -> VmResult<Value> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut first = true;
    for a in args {
        let forced = thread.force(a.clone())?;
        let pieces = forced
            .cast_character(&mut thread.interner)
            .map_err(|e| VmError::Type(e.to_string()))?;
        for s in pieces {
            if !first {
                let _ = write!(out, " ");
            }
            first = false;
            let _ = write!(out, "{}", thread.interner.resolve(s));
        }
    }
    let _ = out.flush();
    Ok(Value::Null)
}

/// Raise a user error; unwinds to the nearest eval boundary.
fn stop(thread: &mut Thread, args: &[Value]) -> VmResult<Value> {
    let message = match args.first() {
        Some(v) => {
            let forced = thread.force(v.clone())?;
            forced
                .as_character1()
                .map(|s| thread.name_of(s).to_string())
                .unwrap_or_else(|| "error".to_string())
        }
        None => "error".to_string(),
    };
    Err(VmError::User(message))
}

/// Build a list of the evaluated arguments.
fn list(thread: &mut Thread, args: &[Value]) -> VmResult<Value> {
    let mut items = Vec::with_capacity(args.len());
    for a in args {
        items.push(thread.force(a.clone())?);
    }
    Ok(Value::list(items))
}

/// Remove bindings named by character vectors from the calling
/// environment. Symbols were already converted to their names by the
/// compiler; anything else is an error.
fn rm(thread: &mut Thread, args: &[Value]) -> VmResult<Value> {
    let env = thread.frame().env;
    for a in args {
        let forced = thread.force(a.clone())?;
        let Value::Character(names) = forced.strip() else {
            return Err(VmError::Type(
                "rm expects symbols or character vectors".to_string(),
            ));
        };
        for &name in names.iter() {
            thread.envs.get_mut(env).rm(name);
        }
    }
    Ok(Value::Null)
}

/// Character counts of a character vector.
fn nchar(thread: &mut Thread, args: &[Value]) -> VmResult<Value> {
    let Some(first) = args.first() else {
        return Err(VmError::Arity("nchar expects one argument".to_string()));
    };
    let forced = thread.force(first.clone())?;
    let chars = forced
        .cast_character(&mut thread.interner)
        .map_err(|e| VmError::Type(e.to_string()))?;
    Ok(Value::integers(
        chars
            .into_iter()
            .map(|s| {
                if s == Symbol::NA {
                    velo_core::value::INTEGER_NA
                } else {
                    thread.interner.resolve(s).chars().count() as i64
                }
            })
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_order_matches_internals() {
        let t = table();
        assert_eq!(t.len(), INTERNALS.len());
        for (b, name) in t.iter().zip(INTERNALS) {
            assert_eq!(b.name, *name);
        }
    }

    #[test]
    fn concat_unifies_types() {
        let mut thread = Thread::new();
        let r = concat(
            &mut thread,
            &[Value::integer(1), Value::double(2.5), Value::Null],
        )
        .unwrap();
        assert_eq!(r, Value::doubles(vec![1.0, 2.5]));
    }

    #[test]
    fn stop_raises_user_error() {
        let mut thread = Thread::new();
        let msg = thread.interner.intern("boom");
        let err = stop(&mut thread, &[Value::character(msg)]).unwrap_err();
        assert!(matches!(err, VmError::User(m) if m == "boom"));
    }

    #[test]
    fn rm_removes_bindings() {
        let mut thread = Thread::new();
        let x = thread.interner.intern("x");
        let global = thread.global;
        thread.envs.get_mut(global).insert(x, Value::integer(1));
        // rm runs against the current frame's environment
        let proto = std::sync::Arc::new(velo_core::prototype::Prototype::default());
        thread.push_frame(proto, global, false, 0, global, usize::MAX);
        rm(&mut thread, &[Value::character(x)]).unwrap();
        assert!(thread.envs.get(global).get(x).is_nil());
    }
}
