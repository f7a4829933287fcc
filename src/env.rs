//! Lexical environments.
//!
//! An environment is a mapping from interned names to values plus an optional
//! parent. Lookup walks the parent chain; definition always hits the
//! innermost scope. Environments live on the GC heap so that closures can pin
//! their capture environment alive past the frame that created it — the chain
//! walking helpers therefore sit on [`Heap`](crate::heap::Heap), which owns
//! the slots.

use std::collections::HashMap;

use crate::value::{HeapRef, StringSymbol, Value};

#[derive(Debug, Clone, Default)]
pub struct Env {
    pub vars: HashMap<StringSymbol, Value>,
    pub parent: Option<HeapRef>,
}

impl Env {
    pub fn new() -> Self {
        Env {
            vars: HashMap::new(),
            parent: None,
        }
    }

    pub fn with_parent(parent: HeapRef) -> Self {
        Env {
            vars: HashMap::new(),
            parent: Some(parent),
        }
    }

    pub fn define(&mut self, name: StringSymbol, value: Value) {
        self.vars.insert(name, value);
    }

    pub fn get_local(&self, name: StringSymbol) -> Option<Value> {
        self.vars.get(&name).copied()
    }
}
