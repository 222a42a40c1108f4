//! Identity-bearing IR variables.

use crate::types::{RegType, Type};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Source of fresh variable identities; never reused within a process.
static NEXT_VARIABLE_ID: AtomicUsize = AtomicUsize::new(0);

/// A named, typed value slot. Two variables are the same variable iff they share identity; the
/// name is only for display.
#[derive(Clone)]
pub struct Variable {
    id: usize,
    name: Arc<str>,
    typ: Type,
}

impl Variable {
    /// A fresh variable, distinct from every variable created before it.
    pub fn new(name: impl Into<String>, typ: impl Into<Type>) -> Self {
        Self {
            id: NEXT_VARIABLE_ID.fetch_add(1, Ordering::Relaxed),
            name: Arc::from(name.into()),
            typ: typ.into(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn typ(&self) -> &Type {
        &self.typ
    }

    /// The register type of the variable, if it is a register
    pub fn reg_type(&self) -> Option<RegType> {
        self.typ.reg()
    }
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Variable {}

impl std::hash::Hash for Variable {
    fn hash<H: std::hash::Hasher>(&self, h: &mut H) {
        self.id.hash(h)
    }
}

impl PartialOrd for Variable {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Variable {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl std::fmt::Debug for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}_{}:{}", self.name, self.id, self.typ)
    }
}

impl std::fmt::Display for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}_{}:{}", self.name, self.id, self.typ)
    }
}
