//! Name-to-variable scoping used while lowering.
//!
//! A [`Scope`] is created once per translation unit (an architecture, or a trace file) and holds
//! the long-lived declarations plus the memory variable. Block-local temporaries are pushed as a
//! [`ScopeFrame`] and popped when the frame is dropped, so the enclosing bindings come back on
//! every exit path.

use crate::containers::unordered::UnorderedMap;
use crate::error::{LowerError, Result};
use crate::log::*;
use crate::variable::Variable;

/// The reserved name the memory variable is bound to
pub const MEMORY_NAME: &str = "$mem";

/// A mutable name-to-variable mapping with shadowing.
#[derive(Debug, Clone)]
pub struct Scope {
    /// Each name maps to its stack of bindings; the innermost binding is last.
    bindings: UnorderedMap<String, Vec<Variable>>,
    mem: Variable,
}

impl Scope {
    /// A scope holding `decls` plus `mem` bound at [`MEMORY_NAME`]. Duplicate names in `decls`
    /// resolve to the last one.
    pub fn new(mem: Variable, decls: impl IntoIterator<Item = Variable>) -> Self {
        let mut bindings: UnorderedMap<String, Vec<Variable>> = UnorderedMap::new();
        for v in decls {
            bindings.insert(v.name().to_owned(), vec![v]);
        }
        bindings.insert(MEMORY_NAME.to_owned(), vec![mem.clone()]);
        Self { bindings, mem }
    }

    /// The memory variable every `Load` and `Store` goes through
    pub fn mem(&self) -> &Variable {
        &self.mem
    }

    /// The innermost binding of `name`
    pub fn lookup(&self, name: &str) -> Result<&Variable> {
        self.bindings
            .get(name)
            .and_then(|vs| vs.last())
            .ok_or_else(|| LowerError::UndeclaredVariable(name.to_owned()))
    }

    /// Whether `name` currently resolves
    pub fn is_bound(&self, name: &str) -> bool {
        self.lookup(name).is_ok()
    }

    /// Bind `var` at `name`, shadowing any existing binding.
    pub fn extend(&mut self, name: &str, var: Variable) {
        self.bindings.get_or_default(name.to_owned()).push(var);
    }

    /// Remove the innermost binding of `name`, uncovering whatever it shadowed. Extensions of the
    /// same name must be undone in reverse order.
    pub fn unextend(&mut self, name: &str) -> Option<Variable> {
        let vs = self.bindings.get_mut(name)?;
        let popped = vs.pop();
        if vs.is_empty() {
            self.bindings.remove(name);
        }
        popped
    }

    /// Bind all of `decls` (by their own names) until the returned frame is dropped.
    pub fn push_frame(&mut self, decls: Vec<Variable>) -> ScopeFrame<'_> {
        for v in &decls {
            self.extend(v.name(), v.clone());
        }
        trace!("Pushed scope frame"; "decls" => ?decls);
        ScopeFrame { scope: self, decls }
    }

    /// Names that currently resolve, in the map's order
    pub fn bound_names(&self) -> Vec<&str> {
        self.bindings.keys().map(|k| k.as_str()).collect()
    }
}

/// Block-local bindings on top of a [`Scope`]. Dereferences to the scope; dropping it restores the
/// scope to what it was before [`Scope::push_frame`].
///
/// ```
/// use asmir::registry::Arch;
/// use asmir::scope::Scope;
/// use asmir::types::RegType;
/// use asmir::variable::Variable;
///
/// let mut scope = Scope::for_arch(Arch::X86);
/// let frame = scope.push_frame(vec![Variable::new("T_0", RegType::Bit8)]);
/// assert!(frame.lookup("T_0").is_ok());
/// drop(frame);
/// assert!(!scope.is_bound("T_0"));
/// ```
///
/// The scope is read-only while a frame is held:
///
/// ```compile_fail
/// use asmir::registry::Arch;
/// use asmir::scope::Scope;
/// use asmir::types::RegType;
/// use asmir::variable::Variable;
///
/// let mut scope = Scope::for_arch(Arch::X86);
/// let mut frame = scope.push_frame(vec![Variable::new("T_0", RegType::Bit8)]);
/// frame.unextend("T_0");
/// ```
pub struct ScopeFrame<'a> {
    scope: &'a mut Scope,
    decls: Vec<Variable>,
}

impl<'a> std::ops::Deref for ScopeFrame<'a> {
    type Target = Scope;
    fn deref(&self) -> &Scope {
        self.scope
    }
}

impl<'a> Drop for ScopeFrame<'a> {
    fn drop(&mut self) {
        for v in self.decls.iter().rev() {
            let popped = self.scope.unextend(v.name());
            debug_assert_eq!(popped.as_ref(), Some(v), "scope frames popped out of order");
        }
        trace!("Popped scope frame"; "decls" => self.decls.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RegType, Type};

    fn scope() -> (Scope, Variable) {
        let mem = Variable::new("mem", Type::Memory { addr: RegType::Bit32 });
        let eax = Variable::new("R_EAX", RegType::Bit32);
        (Scope::new(mem, [eax.clone()]), eax)
    }

    #[test]
    fn lookup_and_reserved_memory() {
        let (s, eax) = scope();
        assert_eq!(s.lookup("R_EAX"), Ok(&eax));
        assert_eq!(s.lookup(MEMORY_NAME), Ok(s.mem()));
        assert_eq!(
            s.lookup("T_9"),
            Err(LowerError::UndeclaredVariable("T_9".into()))
        );
    }

    #[test]
    fn duplicate_initial_decls_last_wins() {
        let mem = Variable::new("mem", Type::Memory { addr: RegType::Bit32 });
        let a = Variable::new("x", RegType::Bit8);
        let b = Variable::new("x", RegType::Bit16);
        let s = Scope::new(mem, [a, b.clone()]);
        assert_eq!(s.lookup("x"), Ok(&b));
    }

    #[test]
    fn extends_are_undone_in_reverse() {
        let (mut s, eax) = scope();
        let inner = Variable::new("R_EAX", RegType::Bit32);
        let innermost = Variable::new("R_EAX", RegType::Bit32);
        s.extend("R_EAX", inner.clone());
        s.extend("R_EAX", innermost.clone());
        assert_eq!(s.lookup("R_EAX"), Ok(&innermost));
        assert_eq!(s.unextend("R_EAX"), Some(innermost));
        assert_eq!(s.lookup("R_EAX"), Ok(&inner));
        assert_eq!(s.unextend("R_EAX"), Some(inner));
        assert_eq!(s.lookup("R_EAX"), Ok(&eax));
    }

    #[test]
    fn frame_restores_on_drop() {
        let (mut s, eax) = scope();
        let before = s.bound_names().join(",");
        {
            let t = Variable::new("T_0", RegType::Bit8);
            let shadow = Variable::new("R_EAX", RegType::Bit32);
            let frame = s.push_frame(vec![t.clone(), shadow.clone()]);
            assert_eq!(frame.lookup("T_0"), Ok(&t));
            assert_eq!(frame.lookup("R_EAX"), Ok(&shadow));
        }
        assert!(!s.is_bound("T_0"));
        assert_eq!(s.lookup("R_EAX"), Ok(&eax));
        assert_eq!(s.bound_names().join(","), before);
    }

    #[test]
    fn frame_restores_on_early_error() {
        fn fails(s: &mut Scope) -> Result<()> {
            let frame = s.push_frame(vec![Variable::new("T_1", RegType::Bit32)]);
            frame.lookup("nope")?;
            Ok(())
        }
        let (mut s, _) = scope();
        assert!(fails(&mut s).is_err());
        assert!(!s.is_bound("T_1"));
    }
}
