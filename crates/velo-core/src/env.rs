//! Environments: ordered name→value maps with lexical and dynamic
//! parent chains.
//!
//! Environments form a cyclic graph (closures refer to environments
//! that refer to closures), so they live in an arena owned by the
//! Thread and are addressed by `EnvId` indices. A free list recycles
//! environments whose frame returned a closure-safe value.

use crate::interner::Symbol;
use crate::value::Value;

/// Index of an environment in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnvId(pub u32);

/// A single environment.
#[derive(Debug, Default)]
pub struct Environment {
    /// Ordered bindings. Environments are small; insertion order is
    /// observable through `ls`-style introspection.
    bindings: Vec<(Symbol, Value)>,
    /// Static scope captured at function creation.
    pub lexical: Option<EnvId>,
    /// Caller's environment at invocation.
    pub dynamic: Option<EnvId>,
    /// The `...` sequence: (name, promise-or-value) pairs in order.
    /// Unnamed entries carry the empty symbol.
    pub dots: Vec<(Symbol, Value)>,
    /// Reified call expression (Null when absent).
    pub call: Value,
}

impl Environment {
    /// Bind or rebind a name.
    pub fn insert(&mut self, name: Symbol, value: Value) {
        for (n, v) in self.bindings.iter_mut() {
            if *n == name {
                *v = value;
                return;
            }
        }
        self.bindings.push((name, value));
    }

    /// Look up a name; Nil when unbound. Does not force promises.
    pub fn get(&self, name: Symbol) -> Value {
        self.bindings
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.clone())
            .unwrap_or(Value::Nil)
    }

    pub fn has(&self, name: Symbol) -> bool {
        self.bindings.iter().any(|(n, _)| *n == name)
    }

    /// Remove a binding; true if it existed.
    pub fn rm(&mut self, name: Symbol) -> bool {
        let before = self.bindings.len();
        self.bindings.retain(|(n, _)| *n != name);
        self.bindings.len() != before
    }

    /// Bound names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = Symbol> + '_ {
        self.bindings.iter().map(|(n, _)| *n)
    }

    fn reset(&mut self, lexical: Option<EnvId>, dynamic: Option<EnvId>, call: Value) {
        self.bindings.clear();
        self.dots.clear();
        self.lexical = lexical;
        self.dynamic = dynamic;
        self.call = call;
    }
}

/// Arena of environments plus the recycling free list.
#[derive(Debug, Default)]
pub struct EnvArena {
    envs: Vec<Environment>,
    free: Vec<EnvId>,
}

impl EnvArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an environment, reusing a recycled one when available.
    pub fn alloc(&mut self, lexical: Option<EnvId>, dynamic: Option<EnvId>, call: Value) -> EnvId {
        if let Some(id) = self.free.pop() {
            self.envs[id.0 as usize].reset(lexical, dynamic, call);
            id
        } else {
            let id = EnvId(self.envs.len() as u32);
            self.envs.push(Environment {
                lexical,
                dynamic,
                call,
                ..Environment::default()
            });
            id
        }
    }

    /// Return an environment to the free list for reuse.
    pub fn recycle(&mut self, id: EnvId) {
        self.free.push(id);
    }

    #[inline]
    pub fn get(&self, id: EnvId) -> &Environment {
        &self.envs[id.0 as usize]
    }

    #[inline]
    pub fn get_mut(&mut self, id: EnvId) -> &mut Environment {
        &mut self.envs[id.0 as usize]
    }

    /// Walk the lexical chain from `env` looking for `name`. Returns
    /// the binding and the environment it was found in.
    pub fn get_recursive(&self, env: EnvId, name: Symbol) -> (Value, Option<EnvId>) {
        let mut cur = Some(env);
        while let Some(id) = cur {
            let e = self.get(id);
            if e.has(name) {
                return (e.get(name), Some(id));
            }
            cur = e.lexical;
        }
        (Value::Nil, None)
    }

    /// Write to the nearest enclosing binding of `name` starting at
    /// `env`, or into `global` if no enclosing environment binds it.
    pub fn insert_recursive(&mut self, env: EnvId, name: Symbol, value: Value, global: EnvId) {
        let mut cur = Some(env);
        while let Some(id) = cur {
            if self.get(id).has(name) {
                self.get_mut(id).insert(name, value);
                return;
            }
            cur = self.get(id).lexical;
        }
        self.get_mut(global).insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_nil_when_unbound() {
        let mut arena = EnvArena::new();
        let g = arena.alloc(None, None, Value::Null);
        assert!(arena.get(g).get(Symbol(42)).is_nil());
    }

    #[test]
    fn recursive_lookup_walks_lexical_chain() {
        let mut arena = EnvArena::new();
        let g = arena.alloc(None, None, Value::Null);
        let mid = arena.alloc(Some(g), None, Value::Null);
        let leaf = arena.alloc(Some(mid), Some(g), Value::Null);
        arena.get_mut(g).insert(Symbol(100), Value::integer(7));
        let (v, found_in) = arena.get_recursive(leaf, Symbol(100));
        assert_eq!(v, Value::integer(7));
        assert_eq!(found_in, Some(g));
    }

    #[test]
    fn insert_recursive_targets_enclosing_binding() {
        let mut arena = EnvArena::new();
        let g = arena.alloc(None, None, Value::Null);
        let mid = arena.alloc(Some(g), None, Value::Null);
        let leaf = arena.alloc(Some(mid), None, Value::Null);
        arena.get_mut(mid).insert(Symbol(5), Value::integer(1));

        // rebinds in `mid`, not `leaf` or `g`
        arena.insert_recursive(leaf, Symbol(5), Value::integer(2), g);
        assert_eq!(arena.get(mid).get(Symbol(5)), Value::integer(2));
        assert!(arena.get(leaf).get(Symbol(5)).is_nil());

        // unbound name falls through to global
        arena.insert_recursive(leaf, Symbol(6), Value::integer(3), g);
        assert_eq!(arena.get(g).get(Symbol(6)), Value::integer(3));
    }

    #[test]
    fn recycled_environments_are_cleared() {
        let mut arena = EnvArena::new();
        let g = arena.alloc(None, None, Value::Null);
        let e = arena.alloc(Some(g), None, Value::Null);
        arena.get_mut(e).insert(Symbol(9), Value::integer(1));
        arena.recycle(e);
        let e2 = arena.alloc(None, Some(g), Value::Null);
        assert_eq!(e, e2);
        assert!(arena.get(e2).get(Symbol(9)).is_nil());
        assert_eq!(arena.get(e2).lexical, None);
        assert_eq!(arena.get(e2).dynamic, Some(g));
    }
}
