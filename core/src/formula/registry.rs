//! Canonical formula registry.
//!
//! Structurally identical formulas, however they were written, serialize to
//! the same canonical key. The registry hands out one shared node per key so
//! whole-roster computations such as `rank` are shared between them. It also
//! memoizes compiled named formulas and formula grade entries.
//!
//! A registry is bound to one [`Gradebook`] generation. Compiling against a
//! different configuration clears everything it holds.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::Gradebook;
use crate::formula::ast::FormulaRef;

/// A configured formula that other formulas can reference by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FormulaSlot {
    Named(String),
    Entry { pset: String, entry: String },
}

impl fmt::Display for FormulaSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormulaSlot::Named(name) => f.write_str(name),
            FormulaSlot::Entry { pset, entry } => write!(f, "{pset}.{entry}"),
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    generation: Option<u64>,
    canonical: HashMap<String, FormulaRef>,
    /// `None` records a slot whose formula failed to compile.
    compiled: HashMap<FormulaSlot, Option<FormulaRef>>,
}

#[derive(Debug, Default)]
pub struct FormulaRegistry {
    state: Mutex<RegistryState>,
}

impl FormulaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the registry to `book`, dropping state from any other
    /// configuration.
    pub fn bind(&self, book: &Gradebook) {
        let mut state = self.state.lock();
        if state.generation == Some(book.generation()) {
            return;
        }
        if let Some(previous) = state.generation {
            info!(
                previous,
                generation = book.generation(),
                dropped = state.canonical.len(),
                "formula registry rebound to new configuration"
            );
        }
        state.canonical.clear();
        state.compiled.clear();
        state.generation = Some(book.generation());
    }

    /// The shared node structurally equal to `formula`, registering it if
    /// none exists yet.
    pub fn canonicalize(&self, formula: FormulaRef) -> FormulaRef {
        let mut state = self.state.lock();
        if let Some(existing) = state.canonical.get(formula.canonical_key()) {
            debug!(key = formula.canonical_key(), "sharing canonical formula");
            return existing.clone();
        }
        state
            .canonical
            .insert(formula.canonical_key().to_string(), formula.clone());
        formula
    }

    pub(crate) fn compiled(&self, slot: &FormulaSlot) -> Option<Option<FormulaRef>> {
        self.state.lock().compiled.get(slot).cloned()
    }

    pub(crate) fn store(&self, slot: FormulaSlot, formula: Option<FormulaRef>) {
        self.state.lock().compiled.entry(slot).or_insert(formula);
    }

    /// Forget every shared node and compiled formula.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.canonical.clear();
        state.compiled.clear();
    }

    /// Number of distinct canonical formulas held.
    pub fn len(&self) -> usize {
        self.state.lock().canonical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
